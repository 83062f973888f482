#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

/// Resolves the backend address for a new upstream link.
///
/// Called once per link creation; the link never re-resolves after that.
#[async_trait]
pub trait AddressResolver: Send + Sync {
	async fn resolve(&self) -> anyhow::Result<String>;
}

/// Resolver that always returns one fixed address.
#[derive(Debug, Clone)]
pub struct FixedAddressResolver {
	address: String,
}

impl FixedAddressResolver {
	pub fn new(address: impl Into<String>) -> Self {
		Self { address: address.into() }
	}
}

#[async_trait]
impl AddressResolver for FixedAddressResolver {
	async fn resolve(&self) -> anyhow::Result<String> {
		Ok(self.address.clone())
	}
}

/// Resolver that asks an HTTP discovery endpoint for a backend address.
///
/// Expected response: `{"state":"OK","msg":{"server":"ws://..."},"code":0}`.
/// Any failure degrades to the configured fallback address so a flaky
/// discovery service cannot take new sessions down with it.
pub struct HttpAddressResolver {
	http: reqwest::Client,
	endpoint: String,
	fallback: String,
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
	state: Option<String>,
	msg: Option<DiscoveryMsg>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryMsg {
	server: Option<String>,
}

impl HttpAddressResolver {
	pub fn new(endpoint: impl Into<String>, fallback: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.context("build discovery http client")?;
		Ok(Self {
			http,
			endpoint: endpoint.into(),
			fallback: fallback.into(),
		})
	}

	async fn fetch(&self) -> anyhow::Result<String> {
		// Cache-busting timestamp parameter, as the discovery service expects.
		let sep = if self.endpoint.contains('?') { '&' } else { '?' };
		let url = format!("{}{}_={}", self.endpoint, sep, unix_ms_now());

		let body = self
			.http
			.get(&url)
			.send()
			.await
			.context("call discovery endpoint")?
			.error_for_status()
			.context("discovery endpoint status")?
			.text()
			.await
			.context("read discovery response")?;

		let parsed: DiscoveryResponse = serde_json::from_str(&body).context("parse discovery response")?;

		if parsed.state.as_deref() != Some("OK") {
			anyhow::bail!("discovery state was not OK: {body}");
		}

		parsed
			.msg
			.and_then(|m| m.server)
			.filter(|s| !s.trim().is_empty())
			.ok_or_else(|| anyhow::anyhow!("discovery response missing msg.server"))
	}
}

#[async_trait]
impl AddressResolver for HttpAddressResolver {
	async fn resolve(&self) -> anyhow::Result<String> {
		match self.fetch().await {
			Ok(address) => {
				info!(%address, "resolved backend address");
				Ok(address)
			}
			Err(e) => {
				warn!(error = %e, fallback = %self.fallback, "discovery failed; using fallback address");
				Ok(self.fallback.clone())
			}
		}
	}
}

fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}
