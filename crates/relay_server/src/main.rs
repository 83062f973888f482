#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use relay_core::ban::{BanRegistry, spawn_ban_sweeper};
use relay_core::discovery::{AddressResolver, FixedAddressResolver, HttpAddressResolver};
use relay_core::link::LinkConfig;
use relay_core::session::{SessionController, SessionPolicy};
use relay_core::tap::NoopTap;
use relay_util::endpoint::WsEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::admin::{AdminState, HealthState, spawn_admin_server};
use crate::server::front_door::run_front_door;

const DEFAULT_DISCOVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relay_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: ws://127.0.0.1:8800)\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "ws://127.0.0.1:8800".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relay_server=debug,relay_core=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("relay_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_resolver(discovery: &config::DiscoverySettings) -> anyhow::Result<Arc<dyn AddressResolver>> {
	match (discovery.endpoint.as_deref(), discovery.fallback_url.as_deref()) {
		(Some(endpoint), Some(fallback)) => {
			let timeout = discovery.timeout.unwrap_or(DEFAULT_DISCOVERY_TIMEOUT);
			info!(endpoint, fallback, "using http discovery resolver");
			Ok(Arc::new(HttpAddressResolver::new(endpoint, fallback, timeout)?))
		}
		(None, Some(fallback)) => {
			info!(backend = fallback, "using fixed backend address");
			Ok(Arc::new(FixedAddressResolver::new(fallback)))
		}
		(Some(_), None) => Err(anyhow::anyhow!(
			"discovery.endpoint is set but discovery.fallback_url is not; a fallback backend address is required"
		)),
		(None, None) => Err(anyhow::anyhow!(
			"no backend address configured; set discovery.fallback_url (or WSRELAY_BACKEND_URL)"
		)),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let proxy_cfg = crate::config::load_proxy_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded proxy config (toml + env overrides)");

	init_metrics(proxy_cfg.proxy.metrics_bind.as_deref());

	let health_state = HealthState::new();

	let bans = Arc::new(BanRegistry::new(proxy_cfg.policy.ban_duration));
	let _sweeper = spawn_ban_sweeper(Arc::clone(&bans), proxy_cfg.policy.ban_sweep_interval);

	let resolver = build_resolver(&proxy_cfg.discovery)?;

	let link_cfg = LinkConfig {
		heartbeat_interval: proxy_cfg.policy.heartbeat_interval,
		buffer_capacity: proxy_cfg.policy.link_buffer_capacity,
		connect_attempts: proxy_cfg.policy.connect_attempts,
		connect_min_delay: proxy_cfg.policy.connect_min_delay,
		connect_max_delay: proxy_cfg.policy.connect_max_delay,
		ws_connector: None,
	};

	let policy = SessionPolicy {
		max_identities: proxy_cfg.policy.max_identities,
		grace_close: proxy_cfg.policy.grace_close,
		forceout_flush: proxy_cfg.policy.forceout_flush,
	};

	info!(
		max_identities = policy.max_identities,
		grace_secs = policy.grace_close.as_secs(),
		ban_secs = proxy_cfg.policy.ban_duration.as_secs(),
		"session policy loaded"
	);

	let controller = SessionController::spawn(policy, link_cfg, Arc::clone(&bans), resolver, Arc::new(NoopTap));

	if let Some(bind) = proxy_cfg.proxy.admin_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_admin_server(
					addr,
					AdminState {
						controller: controller.clone(),
						bans: Arc::clone(&bans),
						health: health_state.clone(),
					},
				);
				info!(%addr, "admin server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid admin bind address (expected host:port)"),
		}
	}

	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "relay_server: websocket listener ready");
	health_state.mark_ready();

	run_front_door(listener, controller).await
}
