#![forbid(unsafe_code)]

use anyhow::Context as _;
use futures_util::{SinkExt, StreamExt};
use relay_core::session::SessionController;
use relay_core::{DownstreamFrame, DownstreamHandle, protocol};
use relay_domain::{ConnId, Identity};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

/// Accept loop for the client-facing WebSocket listener.
pub async fn run_front_door(listener: TcpListener, controller: SessionController) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = listener.accept().await.context("accept client connection")?;

		let conn_id = ConnId(next_conn_id);
		next_conn_id += 1;
		metrics::counter!("relay_client_connections_total").increment(1);

		let controller = controller.clone();
		tokio::spawn(async move {
			info!(conn_id = %conn_id, remote = %remote, "accepted client connection");
			if let Err(e) = handle_connection(conn_id, stream, controller).await {
				warn!(conn_id = %conn_id, error = %e, "client connection handler exited with error");
			}
		});
	}
}

/// One client connection: a writer task draining the downstream channel and
/// a reader loop feeding the controller.
async fn handle_connection(conn_id: ConnId, stream: TcpStream, controller: SessionController) -> anyhow::Result<()> {
	let ws = tokio_tungstenite::accept_async(stream)
		.await
		.context("websocket handshake")?;
	let (mut sink, mut source) = ws.split();

	let (tx, mut rx) = mpsc::unbounded_channel::<DownstreamFrame>();

	// The controller holds a sender clone inside the registered handle; the
	// writer exits once every sender is gone or a Close is drained.
	tokio::spawn(async move {
		while let Some(frame) = rx.recv().await {
			match frame {
				DownstreamFrame::Text(text) => {
					if sink.send(Message::Text(text.into())).await.is_err() {
						break;
					}
				}
				DownstreamFrame::Pong(payload) => {
					if sink.send(Message::Pong(payload)).await.is_err() {
						break;
					}
				}
				DownstreamFrame::Close => {
					let _ = sink.send(Message::Close(None)).await;
					break;
				}
			}
		}
	});

	let mut registered: Option<Identity> = None;

	while let Some(msg) = source.next().await {
		let msg = match msg {
			Ok(m) => m,
			Err(e) => {
				debug!(conn_id = %conn_id, error = %e, "client read error");
				break;
			}
		};

		match msg {
			Message::Text(raw) => {
				if let Some(identity) = &registered {
					controller.route_to_upstream(identity, raw.to_string());
					continue;
				}

				match parse_sign_on(&raw) {
					Some(identity) => {
						let handle = DownstreamHandle::new(conn_id, tx.clone());
						controller.register_downstream(identity.clone(), handle, raw.to_string());
						registered = Some(identity);
					}
					None => {
						// Frames before sign-on have no routing key.
						warn!(conn_id = %conn_id, "frame before sign-on discarded");
					}
				}
			}
			Message::Ping(payload) => {
				if tx.send(DownstreamFrame::Pong(payload)).is_err() {
					break;
				}
			}
			Message::Close(_) => break,
			_ => {}
		}
	}

	if let Some(identity) = registered {
		controller.unregister_downstream(&identity, conn_id);
	}

	debug!(conn_id = %conn_id, "client connection finished");
	Ok(())
}

fn parse_sign_on(raw: &str) -> Option<Identity> {
	let hello = protocol::peek_client_hello(raw)?;
	if !hello.is_sign_on() {
		return None;
	}

	match Identity::new(hello.identity) {
		Ok(identity) => Some(identity),
		Err(e) => {
			warn!(error = %e, "sign-on with unusable identity");
			None
		}
	}
}
