#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use relay_domain::Identity;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::discovery::AddressResolver;
use crate::protocol::{self, BackendControl};
use crate::tap::MessageTap;
use crate::{ControllerEvent, ControllerEventTx, new_link_id};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type UpstreamWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<UpstreamWs>> + Send + Sync>;

/// Upstream link tuning.
#[derive(Clone)]
pub struct LinkConfig {
	/// Ping cadence once the link is open. Must undercut the backend's idle
	/// timeout so quiet links are never reaped by the backend.
	pub heartbeat_interval: Duration,

	/// Maximum frames buffered while the link is still connecting; exceeding
	/// this fails the link instead of growing without bound.
	pub buffer_capacity: usize,

	pub connect_attempts: u32,
	pub connect_min_delay: Duration,
	pub connect_max_delay: Duration,

	/// Override the dial function (used by tests).
	pub ws_connector: Option<WsConnector>,
}

impl Default for LinkConfig {
	fn default() -> Self {
		Self {
			heartbeat_interval: Duration::from_secs(30),
			buffer_capacity: 256,
			connect_attempts: 3,
			connect_min_delay: Duration::from_millis(500),
			connect_max_delay: Duration::from_secs(10),
			ws_connector: None,
		}
	}
}

impl LinkConfig {
	fn connector(&self) -> WsConnector {
		if let Some(c) = &self.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| {
			Box::pin(async move { connect_upstream_ws(url).await }) as BoxFuture<'static, anyhow::Result<UpstreamWs>>
		})
	}
}

async fn connect_upstream_ws(url: Url) -> anyhow::Result<UpstreamWs> {
	use anyhow::Context as _;

	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to backend ws")?;
	Ok(ws)
}

fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
	d.min(max).max(min)
}

enum LinkCommand {
	Send(String),
	Close,
}

/// Handle to one identity's upstream link task.
///
/// The link itself never resurrects: once its task exits, every command is a
/// no-op and the owning controller is responsible for building a replacement.
#[derive(Clone)]
pub struct LinkHandle {
	identity: Identity,
	link_id: String,
	created_at: Instant,
	tx: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
	/// Queue a frame. Buffered FIFO while connecting, transmitted directly
	/// once open, silently dropped once closed.
	pub fn send(&self, text: impl Into<String>) {
		if self.tx.send(LinkCommand::Send(text.into())).is_err() {
			debug!(identity = %self.identity, link_id = %self.link_id, "link already closed; dropping frame");
		}
	}

	/// Planned close; does not trigger the unsolicited-drop escalation.
	pub fn close(&self) {
		let _ = self.tx.send(LinkCommand::Close);
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}

	/// Identifier of this link instance, matched against close events.
	pub fn link_id(&self) -> &str {
		&self.link_id
	}

	/// Creation timestamp, used only for FIFO eviction ordering.
	pub fn created_at(&self) -> Instant {
		self.created_at
	}
}

/// Spawn the task owning one identity's backend connection.
///
/// Address resolution and dialing happen inside the task; frames queued in
/// the meantime are the `Connecting` buffer.
pub fn spawn_link(
	identity: Identity,
	resolver: Arc<dyn AddressResolver>,
	cfg: LinkConfig,
	tap: Arc<dyn MessageTap>,
	events_tx: ControllerEventTx,
) -> LinkHandle {
	let (tx, rx) = mpsc::unbounded_channel();
	let link_id = new_link_id();
	let handle = LinkHandle {
		identity: identity.clone(),
		link_id: link_id.clone(),
		created_at: Instant::now(),
		tx,
	};

	tokio::spawn(run_link(identity, link_id, resolver, cfg, tap, events_tx, rx));

	handle
}

async fn run_link(
	identity: Identity,
	link_id: String,
	resolver: Arc<dyn AddressResolver>,
	cfg: LinkConfig,
	tap: Arc<dyn MessageTap>,
	events_tx: ControllerEventTx,
	mut cmd_rx: mpsc::UnboundedReceiver<LinkCommand>,
) {
	let emit_closed = |reason: &str| {
		debug!(identity = %identity, link_id = %link_id, reason, "upstream link closed");
		let _ = events_tx.send(ControllerEvent::UpstreamClosed {
			identity: identity.clone(),
			link_id: link_id.clone(),
		});
	};

	// Resolved once; the link never re-resolves.
	let target = match resolver.resolve().await {
		Ok(t) => t,
		Err(e) => {
			warn!(identity = %identity, link_id = %link_id, error = %e, "address resolution failed");
			emit_closed("resolve failed");
			return;
		}
	};

	let url = match Url::parse(&target) {
		Ok(u) => u,
		Err(e) => {
			warn!(identity = %identity, link_id = %link_id, target = %target, error = %e, "invalid backend address");
			emit_closed("bad address");
			return;
		}
	};

	info!(identity = %identity, link_id = %link_id, url = %url, "connecting upstream link");

	let connector = cfg.connector();
	let connect = connect_with_backoff(connector, url, &cfg);
	tokio::pin!(connect);

	// Connecting: buffer outbound frames while the dial is in flight.
	let mut buffered: VecDeque<String> = VecDeque::new();
	let mut ws: UpstreamWs = loop {
		tokio::select! {
			res = &mut connect => match res {
				Ok(ws) => break ws,
				Err(e) => {
					warn!(identity = %identity, link_id = %link_id, error = %e, "failed to connect upstream link");
					emit_closed("connect failed");
					return;
				}
			},

			cmd = cmd_rx.recv() => match cmd {
				Some(LinkCommand::Send(text)) => {
					if buffered.len() >= cfg.buffer_capacity {
						warn!(
							identity = %identity,
							link_id = %link_id,
							capacity = cfg.buffer_capacity,
							"outbound buffer overflow while connecting; failing link"
						);
						emit_closed("buffer overflow");
						return;
					}
					buffered.push_back(text);
				}
				Some(LinkCommand::Close) | None => {
					debug!(identity = %identity, link_id = %link_id, "link closed before open");
					return;
				}
			},
		}
	};

	info!(identity = %identity, link_id = %link_id, buffered = buffered.len(), "upstream link open");

	// Flush the Connecting buffer in enqueue order before anything else.
	while let Some(text) = buffered.pop_front() {
		if let Err(e) = ws.send(Message::Text(text.into())).await {
			warn!(identity = %identity, link_id = %link_id, error = %e, "failed to flush buffered frame");
			emit_closed("flush failed");
			return;
		}
	}

	// Heartbeat starts exactly once per open and dies with this task.
	let mut heartbeat = tokio::time::interval(cfg.heartbeat_interval);
	heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
	heartbeat.tick().await;

	loop {
		tokio::select! {
			cmd = cmd_rx.recv() => match cmd {
				Some(LinkCommand::Send(text)) => {
					if let Err(e) = ws.send(Message::Text(text.into())).await {
						warn!(identity = %identity, link_id = %link_id, error = %e, "upstream send failed");
						emit_closed("send failed");
						return;
					}
				}
				Some(LinkCommand::Close) | None => {
					let _ = ws.close(None).await;
					debug!(identity = %identity, link_id = %link_id, "upstream link closed by controller");
					return;
				}
			},

			msg = ws.next() => {
				let Some(msg) = msg else {
					emit_closed("backend stream ended");
					return;
				};

				let msg = match msg {
					Ok(m) => m,
					Err(e) => {
						warn!(identity = %identity, link_id = %link_id, error = %e, "upstream read error");
						emit_closed("read error");
						return;
					}
				};

				match msg {
					Message::Text(t) => handle_backend_text(&identity, &t, &tap, &events_tx),
					Message::Ping(p) => {
						let _ = ws.send(Message::Pong(p)).await;
					}
					Message::Close(frame) => {
						info!(identity = %identity, link_id = %link_id, frame = ?frame, "backend closed upstream link");
						emit_closed("backend close");
						return;
					}
					_ => {}
				}
			},

			_ = heartbeat.tick() => {
				if let Err(e) = ws.send(Message::Ping(Bytes::new())).await {
					warn!(identity = %identity, link_id = %link_id, error = %e, "heartbeat ping failed");
					emit_closed("heartbeat failed");
					return;
				}
			}
		}
	}
}

/// Tap inspection then unconditional hand-off for fan-out.
///
/// The forceout shape is escalated instead of broadcast here; the controller
/// rebroadcasts the raw frame itself during teardown so clients still see it
/// exactly once.
fn handle_backend_text(identity: &Identity, raw: &str, tap: &Arc<dyn MessageTap>, events_tx: &ControllerEventTx) {
	match protocol::inspect_backend_frame(raw) {
		Some(BackendControl::Forceout) => {
			warn!(identity = %identity, "backend forceout received");
			let _ = events_tx.send(ControllerEvent::Forceout {
				identity: identity.clone(),
				frame: raw.to_string(),
			});
			return;
		}
		Some(BackendControl::ProfileSeen { sel_userid }) => {
			tap.profile_seen(identity, &sel_userid, raw);
		}
		Some(BackendControl::LastMessage(notice)) => {
			tap.last_message(identity, &notice, raw);
		}
		None => {}
	}

	let _ = events_tx.send(ControllerEvent::Broadcast {
		identity: identity.clone(),
		frame: raw.to_string(),
	});
}

async fn connect_with_backoff(connector: WsConnector, url: Url, cfg: &LinkConfig) -> anyhow::Result<UpstreamWs> {
	let attempts = cfg.connect_attempts.max(1);
	let mut last_err = None;

	for attempt in 0..attempts {
		if attempt > 0 {
			sleep(backoff_delay(attempt - 1, cfg.connect_min_delay, cfg.connect_max_delay)).await;
		}

		match connector(url.clone()).await {
			Ok(ws) => return Ok(ws),
			Err(e) => {
				debug!(url = %url, attempt, error = %e, "upstream dial attempt failed");
				last_err = Some(e);
			}
		}
	}

	Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no dial attempts made")))
}
