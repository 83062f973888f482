#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.wsrelay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".wsrelay").join("config.toml"))
}

/// Load the proxy config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_proxy_config() -> anyhow::Result<ProxyConfig> {
	let path = default_config_path()?;
	load_proxy_config_from_path(&path)
}

/// Same as `load_proxy_config` but with an explicit config path.
pub fn load_proxy_config_from_path(path: &Path) -> anyhow::Result<ProxyConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ProxyConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Proxy config (v1).
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
	pub proxy: ProxySettings,
	pub policy: PolicySettings,
	pub discovery: DiscoverySettings,
}

/// Bind addresses and ambient surfaces.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
	/// Admin HTTP bind address (host:port); also serves health/readiness.
	pub admin_bind: Option<String>,
	/// Metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Session admission and teardown policy.
#[derive(Debug, Clone)]
pub struct PolicySettings {
	/// Cap on concurrently active identities.
	pub max_identities: usize,
	/// Delay between the last client disconnect and upstream teardown.
	pub grace_close: Duration,
	/// How long a forced-out identity stays banned.
	pub ban_duration: Duration,
	/// Cadence of the expired-ban sweep.
	pub ban_sweep_interval: Duration,
	/// Upstream heartbeat ping cadence.
	pub heartbeat_interval: Duration,
	/// Frames buffered per link while it is still connecting.
	pub link_buffer_capacity: usize,
	/// Delay between the forceout notice and severing client sockets.
	pub forceout_flush: Duration,
	/// Upstream dial retry policy.
	pub connect_attempts: u32,
	pub connect_min_delay: Duration,
	pub connect_max_delay: Duration,
}

impl Default for PolicySettings {
	fn default() -> Self {
		Self {
			max_identities: 2,
			grace_close: Duration::from_secs(80),
			ban_duration: Duration::from_secs(300),
			ban_sweep_interval: Duration::from_secs(60),
			heartbeat_interval: Duration::from_secs(30),
			link_buffer_capacity: 256,
			forceout_flush: Duration::from_millis(1000),
			connect_attempts: 3,
			connect_min_delay: Duration::from_millis(500),
			connect_max_delay: Duration::from_secs(10),
		}
	}
}

/// Backend address discovery.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySettings {
	/// HTTP endpoint returning the backend WebSocket address.
	pub endpoint: Option<String>,
	/// Backend address used when discovery is unset or failing.
	pub fallback_url: Option<String>,
	/// Discovery HTTP call timeout.
	pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	proxy: FileProxySettings,

	#[serde(default)]
	policy: FilePolicySettings,

	#[serde(default)]
	discovery: FileDiscoverySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileProxySettings {
	admin_bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePolicySettings {
	max_identities: Option<usize>,
	grace_close_secs: Option<u64>,
	ban_secs: Option<u64>,
	ban_sweep_secs: Option<u64>,
	heartbeat_secs: Option<u64>,
	link_buffer_capacity: Option<usize>,
	forceout_flush_ms: Option<u64>,
	connect_attempts: Option<u32>,
	connect_min_delay_ms: Option<u64>,
	connect_max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDiscoverySettings {
	endpoint: Option<String>,
	fallback_url: Option<String>,
	timeout_ms: Option<u64>,
}

impl ProxyConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = PolicySettings::default();

		let policy = PolicySettings {
			max_identities: file.policy.max_identities.filter(|n| *n > 0).unwrap_or(defaults.max_identities),
			grace_close: file
				.policy
				.grace_close_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.grace_close),
			ban_duration: file.policy.ban_secs.map(Duration::from_secs).unwrap_or(defaults.ban_duration),
			ban_sweep_interval: file
				.policy
				.ban_sweep_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.ban_sweep_interval),
			heartbeat_interval: file
				.policy
				.heartbeat_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(defaults.heartbeat_interval),
			link_buffer_capacity: file
				.policy
				.link_buffer_capacity
				.filter(|n| *n > 0)
				.unwrap_or(defaults.link_buffer_capacity),
			forceout_flush: file
				.policy
				.forceout_flush_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.forceout_flush),
			connect_attempts: file
				.policy
				.connect_attempts
				.filter(|n| *n > 0)
				.unwrap_or(defaults.connect_attempts),
			connect_min_delay: file
				.policy
				.connect_min_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.connect_min_delay),
			connect_max_delay: file
				.policy
				.connect_max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(defaults.connect_max_delay),
		};

		Self {
			proxy: ProxySettings {
				admin_bind: file.proxy.admin_bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.proxy.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			policy,
			discovery: DiscoverySettings {
				endpoint: file.discovery.endpoint.filter(|s| !s.trim().is_empty()),
				fallback_url: file.discovery.fallback_url.filter(|s| !s.trim().is_empty()),
				timeout: file.discovery.timeout_ms.filter(|v| *v > 0).map(Duration::from_millis),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ProxyConfig) {
	if let Ok(v) = std::env::var("WSRELAY_ADMIN_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.proxy.admin_bind = Some(v);
			info!("proxy config: admin_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("WSRELAY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.proxy.metrics_bind = Some(v);
			info!("proxy config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("WSRELAY_MAX_IDENTITIES")
		&& let Ok(n) = v.trim().parse::<usize>()
		&& n > 0
	{
		cfg.policy.max_identities = n;
		info!(max_identities = n, "policy: max_identities overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_GRACE_CLOSE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.policy.grace_close = Duration::from_secs(secs);
		info!(secs, "policy: grace_close overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_BAN_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.policy.ban_duration = Duration::from_secs(secs);
		info!(secs, "policy: ban_duration overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_BAN_SWEEP_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.policy.ban_sweep_interval = Duration::from_secs(secs);
		info!(secs, "policy: ban_sweep_interval overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_HEARTBEAT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.policy.heartbeat_interval = Duration::from_secs(secs);
		info!(secs, "policy: heartbeat_interval overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_LINK_BUFFER_CAPACITY")
		&& let Ok(n) = v.trim().parse::<usize>()
		&& n > 0
	{
		cfg.policy.link_buffer_capacity = n;
		info!(capacity = n, "policy: link_buffer_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_FORCEOUT_FLUSH_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.policy.forceout_flush = Duration::from_millis(ms);
		info!(ms, "policy: forceout_flush overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_CONNECT_ATTEMPTS")
		&& let Ok(n) = v.trim().parse::<u32>()
		&& n > 0
	{
		cfg.policy.connect_attempts = n;
		info!(attempts = n, "policy: connect_attempts overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_CONNECT_MIN_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.policy.connect_min_delay = Duration::from_millis(ms);
		info!(ms, "policy: connect_min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_CONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.policy.connect_max_delay = Duration::from_millis(ms);
		info!(ms, "policy: connect_max_delay overridden by env");
	}

	if let Ok(v) = std::env::var("WSRELAY_DISCOVERY_ENDPOINT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.discovery.endpoint = Some(v);
			info!("discovery config: endpoint overridden by env");
		}
	}

	if let Ok(v) = std::env::var("WSRELAY_BACKEND_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.discovery.fallback_url = Some(v);
			info!("discovery config: fallback_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("WSRELAY_DISCOVERY_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
		&& ms > 0
	{
		cfg.discovery.timeout = Some(Duration::from_millis(ms));
		info!(ms, "discovery config: timeout overridden by env");
	}

	if cfg.policy.connect_min_delay > cfg.policy.connect_max_delay {
		warn!(
			min_ms = cfg.policy.connect_min_delay.as_millis(),
			max_ms = cfg.policy.connect_max_delay.as_millis(),
			"policy: connect_min_delay > connect_max_delay; swapping"
		);
		std::mem::swap(&mut cfg.policy.connect_min_delay, &mut cfg.policy.connect_max_delay);
	}

	if cfg.discovery.endpoint.is_none() && cfg.discovery.fallback_url.is_none() {
		warn!("discovery config: no endpoint and no fallback_url; registrations will fail until one is set");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_apply_for_missing_sections() {
		let cfg = ProxyConfig::from_file(toml::from_str("").expect("empty toml"));

		assert_eq!(cfg.policy.max_identities, 2);
		assert_eq!(cfg.policy.grace_close, Duration::from_secs(80));
		assert_eq!(cfg.policy.ban_duration, Duration::from_secs(300));
		assert_eq!(cfg.policy.ban_sweep_interval, Duration::from_secs(60));
		assert_eq!(cfg.policy.heartbeat_interval, Duration::from_secs(30));
		assert_eq!(cfg.policy.link_buffer_capacity, 256);
		assert_eq!(cfg.policy.forceout_flush, Duration::from_millis(1000));
		assert!(cfg.proxy.admin_bind.is_none());
		assert!(cfg.discovery.endpoint.is_none());
	}

	#[test]
	fn file_values_override_defaults() {
		let raw = r#"
			[proxy]
			admin_bind = "127.0.0.1:9901"
			metrics_bind = "127.0.0.1:9902"

			[policy]
			max_identities = 8
			grace_close_secs = 5
			ban_secs = 30
			forceout_flush_ms = 250

			[discovery]
			endpoint = "http://127.0.0.1:9000/address"
			fallback_url = "ws://127.0.0.1:8888"
			timeout_ms = 1500
		"#;

		let cfg = ProxyConfig::from_file(toml::from_str(raw).expect("toml"));

		assert_eq!(cfg.proxy.admin_bind.as_deref(), Some("127.0.0.1:9901"));
		assert_eq!(cfg.proxy.metrics_bind.as_deref(), Some("127.0.0.1:9902"));
		assert_eq!(cfg.policy.max_identities, 8);
		assert_eq!(cfg.policy.grace_close, Duration::from_secs(5));
		assert_eq!(cfg.policy.ban_duration, Duration::from_secs(30));
		assert_eq!(cfg.policy.forceout_flush, Duration::from_millis(250));
		assert_eq!(cfg.discovery.endpoint.as_deref(), Some("http://127.0.0.1:9000/address"));
		assert_eq!(cfg.discovery.fallback_url.as_deref(), Some("ws://127.0.0.1:8888"));
		assert_eq!(cfg.discovery.timeout, Some(Duration::from_millis(1500)));

		// Unset policy knobs keep their defaults.
		assert_eq!(cfg.policy.heartbeat_interval, Duration::from_secs(30));
		assert_eq!(cfg.policy.link_buffer_capacity, 256);
	}

	#[test]
	fn zero_and_blank_values_fall_back() {
		let raw = r#"
			[proxy]
			admin_bind = "  "

			[policy]
			max_identities = 0
			link_buffer_capacity = 0
			ban_sweep_secs = 0
		"#;

		let cfg = ProxyConfig::from_file(toml::from_str(raw).expect("toml"));

		assert!(cfg.proxy.admin_bind.is_none());
		assert_eq!(cfg.policy.max_identities, 2);
		assert_eq!(cfg.policy.link_buffer_capacity, 256);
		assert_eq!(cfg.policy.ban_sweep_interval, Duration::from_secs(60));
	}
}
