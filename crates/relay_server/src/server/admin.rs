#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relay_core::ban::BanRegistry;
use relay_core::session::SessionController;
use relay_domain::Identity;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Readiness flag surfaced on `/readyz`; flipped once the proxy listener is
/// accepting. Liveness is implicit in the server answering at all.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Shared handles behind the operator and health endpoints.
#[derive(Clone)]
pub struct AdminState {
	pub controller: SessionController,
	pub bans: Arc<BanRegistry>,
	pub health: HealthState,
}

pub fn spawn_admin_server(bind: SocketAddr, state: AdminState) {
	tokio::spawn(async move {
		let listener = match TcpListener::bind(bind).await {
			Ok(l) => l,
			Err(e) => {
				warn!(error = %e, %bind, "admin server failed to bind");
				return;
			}
		};

		if let Err(err) = serve_admin(listener, state).await {
			warn!(error = %err, "admin server stopped");
		}
	});
}

pub(crate) async fn serve_admin(listener: TcpListener, state: AdminState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_admin(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "admin connection error");
			}
		});
	}
}

async fn handle_admin(req: Request<Incoming>, state: AdminState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let response = match (&method, path.as_str()) {
		(&Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),

		(&Method::GET, "/readyz") => {
			if state.health.is_ready() {
				text_response(StatusCode::OK, "ready")
			} else {
				text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}

		(&Method::GET, "/api/stats") => {
			let stats = state.controller.stats();
			json_response(StatusCode::OK, &serde_json::json!(stats))
		}

		(&Method::POST, "/api/disconnect-all") => {
			let (upstream, downstream) = state.controller.close_all();
			info!(upstream, downstream, "admin: disconnect-all");
			json_response(
				StatusCode::OK,
				&serde_json::json!({ "upstream_closed": upstream, "downstream_closed": downstream }),
			)
		}

		(&Method::GET, "/api/forceouts") => {
			json_response(StatusCode::OK, &serde_json::json!({ "banned": state.bans.banned_count() }))
		}

		(&Method::POST, "/api/forceouts/clear") => {
			let cleared = state.bans.clear_all();
			info!(cleared, "admin: forceouts cleared");
			json_response(StatusCode::OK, &serde_json::json!({ "cleared": cleared }))
		}

		(&Method::DELETE, _) if path.starts_with("/api/forceouts/") => {
			let raw_id = &path["/api/forceouts/".len()..];
			match Identity::new(raw_id) {
				Ok(id) => {
					let removed = state.bans.unban(&id);
					if removed {
						info!(identity = %id, "admin: forceout removed");
					}
					let status = if removed { StatusCode::OK } else { StatusCode::NOT_FOUND };
					json_response(status, &serde_json::json!({ "removed": removed }))
				}
				Err(_) => json_response(StatusCode::BAD_REQUEST, &serde_json::json!({ "error": "empty identity" })),
			}
		}

		_ => json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": "not found" })),
	};

	Ok(response)
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header("content-type", "application/json")
		.body(Full::new(Bytes::from(body.to_string())))
		.unwrap()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body.as_bytes())))
		.unwrap()
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use relay_core::discovery::FixedAddressResolver;
	use relay_core::link::LinkConfig;
	use relay_core::session::SessionPolicy;
	use relay_core::tap::NoopTap;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpStream;

	use super::*;

	async fn spawn_test_admin() -> (SocketAddr, AdminState) {
		let bans = Arc::new(BanRegistry::new(Duration::from_secs(300)));
		let controller = SessionController::spawn(
			SessionPolicy::default(),
			LinkConfig::default(),
			Arc::clone(&bans),
			Arc::new(FixedAddressResolver::new("ws://127.0.0.1:1")),
			Arc::new(NoopTap),
		);

		let state = AdminState {
			controller,
			bans,
			health: HealthState::new(),
		};

		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind admin");
		let addr = listener.local_addr().expect("admin addr");
		let serve_state = state.clone();
		tokio::spawn(async move {
			let _ = serve_admin(listener, serve_state).await;
		});

		(addr, state)
	}

	async fn request(addr: SocketAddr, method: &str, path: &str) -> String {
		let mut stream = TcpStream::connect(addr).await.expect("connect admin");
		let req = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
		stream.write_all(req.as_bytes()).await.expect("write request");

		let mut body = String::new();
		stream.read_to_string(&mut body).await.expect("read response");
		body
	}

	#[tokio::test]
	async fn health_routes_reflect_readiness() {
		let (addr, state) = spawn_test_admin().await;

		assert!(request(addr, "GET", "/healthz").await.contains("200 OK"));
		assert!(request(addr, "GET", "/readyz").await.contains("503"));

		state.health.mark_ready();
		let ready = request(addr, "GET", "/readyz").await;
		assert!(ready.contains("200 OK"));
		assert!(ready.contains("ready"));
	}

	#[tokio::test]
	async fn stats_and_forceout_routes() {
		let (addr, state) = spawn_test_admin().await;

		let stats = request(addr, "GET", "/api/stats").await;
		assert!(stats.contains(r#""active_upstream":0"#));
		assert!(stats.contains(r#""max_identities":2"#));

		state.bans.ban(&Identity::new("u1").expect("identity"));
		assert!(request(addr, "GET", "/api/forceouts").await.contains(r#""banned":1"#));

		let removed = request(addr, "DELETE", "/api/forceouts/u1").await;
		assert!(removed.contains("200 OK"));
		assert!(removed.contains(r#""removed":true"#));
		assert!(request(addr, "DELETE", "/api/forceouts/u1").await.contains("404"));

		assert!(request(addr, "POST", "/api/forceouts/clear").await.contains(r#""cleared":0"#));
		assert!(request(addr, "GET", "/api/nope").await.contains("404"));
	}
}
