#![forbid(unsafe_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_core::ban::BanRegistry;
use relay_core::discovery::FixedAddressResolver;
use relay_core::link::LinkConfig;
use relay_core::protocol::LastMessageNotice;
use relay_core::session::{SessionController, SessionPolicy};
use relay_core::tap::MessageTap;
use relay_core::{DownstreamFrame, DownstreamHandle, protocol};
use relay_domain::{ConnId, Identity};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;

const WAIT: Duration = Duration::from_secs(5);

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("WSRELAY_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

/// Stub backend: records text frames, pushes frames on demand.
struct StubBackend {
	addr: std::net::SocketAddr,
	texts: mpsc::UnboundedReceiver<String>,
	push: tokio::sync::broadcast::Sender<String>,
}

async fn spawn_stub_backend() -> StubBackend {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
	let addr = listener.local_addr().expect("backend addr");

	let (texts_tx, texts) = mpsc::unbounded_channel();
	let (push, _) = tokio::sync::broadcast::channel::<String>(64);
	let push_accept = push.clone();

	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let texts_tx = texts_tx.clone();
			let mut push_rx = push_accept.subscribe();

			tokio::spawn(async move {
				let mut ws = tokio_tungstenite::accept_async(stream).await.expect("backend accept");
				loop {
					tokio::select! {
						msg = ws.next() => match msg {
							Some(Ok(Message::Text(t))) => {
								let _ = texts_tx.send(t.to_string());
							}
							Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
							Some(Ok(_)) => {}
						},

						frame = push_rx.recv() => {
							let Ok(frame) = frame else { return };
							if ws.send(Message::Text(frame.into())).await.is_err() {
								return;
							}
						}
					}
				}
			});
		}
	});

	StubBackend { addr, texts, push }
}

/// Minimal front door over the controller, mirroring the production wiring.
async fn spawn_proxy(controller: SessionController) -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
	let addr = listener.local_addr().expect("proxy addr");

	tokio::spawn(async move {
		let mut next_conn_id: u64 = 1;

		loop {
			let Ok((stream, _)) = listener.accept().await else {
				return;
			};
			let conn_id = ConnId(next_conn_id);
			next_conn_id += 1;
			let controller = controller.clone();

			tokio::spawn(async move {
				let ws = tokio_tungstenite::accept_async(stream).await.expect("proxy accept");
				let (mut sink, mut source) = ws.split();
				let (tx, mut rx) = mpsc::unbounded_channel::<DownstreamFrame>();

				tokio::spawn(async move {
					while let Some(frame) = rx.recv().await {
						match frame {
							DownstreamFrame::Text(t) => {
								if sink.send(Message::Text(t.into())).await.is_err() {
									break;
								}
							}
							DownstreamFrame::Pong(p) => {
								if sink.send(Message::Pong(p)).await.is_err() {
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
				while let Some(Ok(msg)) = source.next().await {
					match msg {
						Message::Text(raw) => {
							if let Some(identity) = &registered {
								controller.route_to_upstream(identity, raw.to_string());
							} else if let Some(hello) = protocol::peek_client_hello(&raw)
								&& hello.is_sign_on()
								&& let Ok(identity) = Identity::new(hello.identity)
							{
								let handle = DownstreamHandle::new(conn_id, tx.clone());
								controller.register_downstream(identity.clone(), handle, raw.to_string());
								registered = Some(identity);
							}
						}
						Message::Close(_) => break,
						_ => {}
					}
				}

				if let Some(identity) = registered {
					controller.unregister_downstream(&identity, conn_id);
				}
			});
		}
	});

	addr
}

#[derive(Default)]
struct CountingTap {
	last_messages: std::sync::atomic::AtomicUsize,
}

impl CountingTap {
	fn seen(&self) -> usize {
		self.last_messages.load(std::sync::atomic::Ordering::SeqCst)
	}
}

impl MessageTap for CountingTap {
	fn last_message(&self, _identity: &Identity, _notice: &LastMessageNotice, _raw: &str) {
		self.last_messages.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
	}
}

type WsClient = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_client(addr: std::net::SocketAddr) -> WsClient {
	let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
		.await
		.expect("client connect");
	ws
}

async fn next_client_text(ws: &mut WsClient) -> String {
	loop {
		let msg = timeout(WAIT, ws.next())
			.await
			.expect("client frame in time")
			.expect("client stream open")
			.expect("client frame ok");
		if let Message::Text(t) = msg {
			return t.to_string();
		}
	}
}

async fn next_backend_text(backend: &mut StubBackend) -> String {
	timeout(WAIT, backend.texts.recv())
		.await
		.expect("backend frame in time")
		.expect("backend channel open")
}

#[tokio::test]
async fn sign_on_share_link_and_tap_end_to_end() {
	init_test_logging();

	let mut backend = spawn_stub_backend().await;
	let bans = Arc::new(BanRegistry::new(Duration::from_secs(300)));
	let tap = Arc::new(CountingTap::default());

	let controller = SessionController::spawn(
		SessionPolicy {
			max_identities: 2,
			grace_close: Duration::from_millis(200),
			forceout_flush: Duration::from_millis(50),
		},
		LinkConfig::default(),
		Arc::clone(&bans),
		Arc::new(FixedAddressResolver::new(format!("ws://{}", backend.addr))),
		Arc::clone(&tap) as Arc<dyn MessageTap>,
	);

	let proxy_addr = spawn_proxy(controller.clone()).await;

	// First client signs on; the raw frame is replayed to the backend.
	let sign_on = r#"{"action":"sign-on","identity":"alice"}"#;
	let mut client1 = connect_client(proxy_addr).await;
	client1.send(Message::Text(sign_on.into())).await.expect("send sign-on");
	assert_eq!(next_backend_text(&mut backend).await, sign_on);

	// Backend chat-delivery notice: tap fires, raw frame reaches the client.
	let chat = r#"{"code":7,"fromuser":{"id":"bob","content":"hi","time":"t","type":"text"},"touser":{"id":"alice"}}"#;
	backend.push.send(chat.to_string()).expect("backend push");
	assert_eq!(next_client_text(&mut client1).await, chat);
	assert_eq!(tap.seen(), 1);

	// Second connection for the same identity shares the existing link:
	// no second sign-on replay reaches the backend.
	let mut client2 = connect_client(proxy_addr).await;
	client2.send(Message::Text(sign_on.into())).await.expect("send sign-on");

	client2
		.send(Message::Text(r#"{"say":"from-second"}"#.into()))
		.await
		.expect("send chat");
	assert_eq!(next_backend_text(&mut backend).await, r#"{"say":"from-second"}"#);
	assert!(backend.texts.try_recv().is_err(), "sign-on must not be replayed");

	// Fan-out hits both clients.
	let note = r#"{"note":"both"}"#;
	backend.push.send(note.to_string()).expect("backend push");
	assert_eq!(next_client_text(&mut client1).await, note);
	assert_eq!(next_client_text(&mut client2).await, note);

	let stats = controller.stats();
	assert_eq!(stats.active_upstream, 1);
	assert_eq!(stats.active_downstream, 2);
}

#[tokio::test]
async fn forceout_reaches_client_and_blocks_reconnect() {
	init_test_logging();

	let mut backend = spawn_stub_backend().await;
	let bans = Arc::new(BanRegistry::new(Duration::from_secs(300)));

	let controller = SessionController::spawn(
		SessionPolicy {
			max_identities: 2,
			grace_close: Duration::from_millis(200),
			forceout_flush: Duration::from_millis(50),
		},
		LinkConfig::default(),
		Arc::clone(&bans),
		Arc::new(FixedAddressResolver::new(format!("ws://{}", backend.addr))),
		Arc::new(relay_core::tap::NoopTap),
	);

	let proxy_addr = spawn_proxy(controller).await;

	let sign_on = r#"{"action":"sign-on","identity":"mallory"}"#;
	let mut client = connect_client(proxy_addr).await;
	client.send(Message::Text(sign_on.into())).await.expect("send sign-on");
	assert_eq!(next_backend_text(&mut backend).await, sign_on);

	let ban_frame = r#"{"code":-3,"forceout":true,"content":"kicked"}"#;
	backend.push.send(ban_frame.to_string()).expect("backend push");

	// Verbatim ban frame, then the proxy closes the socket.
	assert_eq!(next_client_text(&mut client).await, ban_frame);
	timeout(WAIT, async {
		loop {
			match client.next().await {
				Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
				Some(Ok(_)) => {}
			}
		}
	})
	.await
	.expect("socket closed after forceout");

	assert!(bans.is_banned(&Identity::new("mallory").expect("identity")));

	// Reconnecting while banned gets the rejection notice and a close.
	let mut retry = connect_client(proxy_addr).await;
	retry.send(Message::Text(sign_on.into())).await.expect("send sign-on");
	let notice = next_client_text(&mut retry).await;
	let v: serde_json::Value = serde_json::from_str(&notice).expect("notice json");
	assert_eq!(v["code"], -4);
}
