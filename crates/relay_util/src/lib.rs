#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::net::{IpAddr, Ipv6Addr, SocketAddr};
	use std::str::FromStr;

	use thiserror::Error;

	#[derive(Debug, Error, Clone, PartialEq, Eq)]
	pub enum EndpointError {
		#[error("expected ws://host:port or wss://host:port, got {0:?}")]
		MissingScheme(String),

		#[error("unsupported scheme {0:?} (expected ws or wss)")]
		UnsupportedScheme(String),

		#[error("endpoint must not carry a path, query, or fragment: {0:?}")]
		TrailingComponents(String),

		#[error("missing host in {0:?}")]
		MissingHost(String),

		#[error("IPv6 hosts must be bracketed, like ws://[::1]:9001")]
		UnbracketedIpv6,

		#[error("invalid IPv6 address {0:?}")]
		InvalidIpv6(String),

		#[error("missing port (expected host:port) in {0:?}")]
		MissingPort(String),

		#[error("invalid port {0:?} (expected 1..=65535)")]
		InvalidPort(String),

		#[error("{0:?} is not an IP literal; a bind address cannot be a DNS name")]
		NotIpLiteral(String),
	}

	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub enum Scheme {
		Ws,
		Wss,
	}

	/// Host part of an endpoint. IP literals are parsed eagerly so bind
	/// addresses never need a second validation pass.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub enum Host {
		Ip(IpAddr),
		Dns(String),
	}

	/// A `ws://` or `wss://` endpoint of the bare `scheme://host:port` form.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		scheme: Scheme,
		host: Host,
		port: u16,
	}

	impl WsEndpoint {
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			s.parse()
		}

		pub fn scheme(&self) -> Scheme {
			self.scheme
		}

		pub fn is_secure(&self) -> bool {
			self.scheme == Scheme::Wss
		}

		pub fn port(&self) -> u16 {
			self.port
		}

		/// `host:port`, with IPv6 literals re-bracketed.
		pub fn hostport(&self) -> String {
			match &self.host {
				Host::Ip(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
				Host::Ip(IpAddr::V4(ip)) => format!("{ip}:{}", self.port),
				Host::Dns(name) => format!("{name}:{}", self.port),
			}
		}

		/// Socket address for binding; DNS-named endpoints are rejected
		/// because binding never resolves names.
		pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
			match &self.host {
				Host::Ip(ip) => Ok(SocketAddr::new(*ip, self.port)),
				Host::Dns(name) => Err(EndpointError::NotIpLiteral(name.clone())),
			}
		}
	}

	impl fmt::Display for WsEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			let scheme = match self.scheme {
				Scheme::Ws => "ws",
				Scheme::Wss => "wss",
			};
			write!(f, "{scheme}://{}", self.hostport())
		}
	}

	impl FromStr for WsEndpoint {
		type Err = EndpointError;

		fn from_str(s: &str) -> Result<Self, Self::Err> {
			let trimmed = s.trim();

			let (scheme_str, rest) = trimmed
				.split_once("://")
				.ok_or_else(|| EndpointError::MissingScheme(trimmed.to_string()))?;

			let scheme = match scheme_str {
				"ws" => Scheme::Ws,
				"wss" => Scheme::Wss,
				other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
			};

			if rest.contains(['/', '?', '#']) {
				return Err(EndpointError::TrailingComponents(trimmed.to_string()));
			}

			let (host, port_str) = split_authority(rest, trimmed)?;

			let port: u16 = port_str
				.parse()
				.ok()
				.filter(|p| *p != 0)
				.ok_or_else(|| EndpointError::InvalidPort(port_str.to_string()))?;

			Ok(Self { scheme, host, port })
		}
	}

	fn split_authority<'a>(rest: &'a str, original: &str) -> Result<(Host, &'a str), EndpointError> {
		if let Some(bracketed) = rest.strip_prefix('[') {
			let (inner, after) = bracketed
				.split_once(']')
				.ok_or_else(|| EndpointError::InvalidIpv6(rest.to_string()))?;

			let ip: Ipv6Addr = inner.parse().map_err(|_| EndpointError::InvalidIpv6(inner.to_string()))?;

			let port_str = after
				.strip_prefix(':')
				.filter(|p| !p.is_empty())
				.ok_or_else(|| EndpointError::MissingPort(original.to_string()))?;

			return Ok((Host::Ip(IpAddr::V6(ip)), port_str));
		}

		let (host_str, port_str) = rest
			.rsplit_once(':')
			.ok_or_else(|| EndpointError::MissingPort(original.to_string()))?;

		// A second colon in the host means someone wrote a raw IPv6 literal.
		if host_str.contains(':') {
			return Err(EndpointError::UnbracketedIpv6);
		}
		if host_str.is_empty() {
			return Err(EndpointError::MissingHost(original.to_string()));
		}

		let host = match host_str.parse::<IpAddr>() {
			Ok(ip) => Host::Ip(ip),
			Err(_) => Host::Dns(host_str.to_string()),
		};

		Ok((host, port_str))
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_ipv4_and_round_trips() {
			let e: WsEndpoint = "ws://127.0.0.1:9001".parse().unwrap();
			assert_eq!(e.scheme(), Scheme::Ws);
			assert!(!e.is_secure());
			assert_eq!(e.port(), 9001);
			assert_eq!(e.socket_addr().unwrap(), "127.0.0.1:9001".parse().unwrap());
			assert_eq!(e.to_string(), "ws://127.0.0.1:9001");
		}

		#[test]
		fn parses_wss_and_dns_names() {
			let e = WsEndpoint::parse("wss://relay.example.com:443").unwrap();
			assert!(e.is_secure());
			assert_eq!(e.hostport(), "relay.example.com:443");

			// DNS names are fine as endpoints but can never be bound.
			assert_eq!(
				e.socket_addr(),
				Err(EndpointError::NotIpLiteral("relay.example.com".to_string()))
			);
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = WsEndpoint::parse("ws://[::1]:9001").unwrap();
			assert_eq!(e.hostport(), "[::1]:9001");
			assert_eq!(e.socket_addr().unwrap(), "[::1]:9001".parse().unwrap());
		}

		#[test]
		fn rejects_raw_ipv6() {
			assert_eq!(WsEndpoint::parse("ws://::1:9001"), Err(EndpointError::UnbracketedIpv6));
			assert!(matches!(
				WsEndpoint::parse("ws://[::1:9001"),
				Err(EndpointError::InvalidIpv6(_))
			));
		}

		#[test]
		fn rejects_wrong_or_missing_scheme() {
			assert!(matches!(
				WsEndpoint::parse("127.0.0.1:9001"),
				Err(EndpointError::MissingScheme(_))
			));
			assert!(matches!(
				WsEndpoint::parse("http://127.0.0.1:9001"),
				Err(EndpointError::UnsupportedScheme(_))
			));
		}

		#[test]
		fn rejects_trailing_components() {
			for bad in ["ws://h:1/", "ws://h:1/path", "ws://h:1?q=1", "ws://h:1#f"] {
				assert!(matches!(
					WsEndpoint::parse(bad),
					Err(EndpointError::TrailingComponents(_))
				));
			}
		}

		#[test]
		fn rejects_bad_ports_and_hosts() {
			assert!(matches!(WsEndpoint::parse("ws://h:0"), Err(EndpointError::InvalidPort(_))));
			assert!(matches!(
				WsEndpoint::parse("ws://h:65536"),
				Err(EndpointError::InvalidPort(_))
			));
			assert!(matches!(WsEndpoint::parse("ws://h"), Err(EndpointError::MissingPort(_))));
			assert!(matches!(
				WsEndpoint::parse("ws://[::1]"),
				Err(EndpointError::MissingPort(_))
			));
			assert!(matches!(WsEndpoint::parse("ws://:9001"), Err(EndpointError::MissingHost(_))));
		}
	}
}
