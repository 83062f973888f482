#![forbid(unsafe_code)]

pub mod ban;
pub mod discovery;
pub mod link;
pub mod protocol;
pub mod session;
pub mod tap;



use bytes::Bytes;
use relay_domain::{ConnId, Identity};
use tokio::sync::mpsc;

/// Link/timer → controller event.
///
/// Every upstream link task and every scheduled timer reports back through
/// this one channel; the controller's event loop is the single consumer.
#[derive(Debug)]
pub enum ControllerEvent {
	/// A backend frame to fan out to all downstream connections of `identity`.
	Broadcast {
		identity: Identity,
		frame: String,
	},

	/// The upstream link dropped without the controller asking for it.
	/// `link_id` names the instance that died so the handler can ignore the
	/// event when a replacement link has already been installed.
	UpstreamClosed {
		identity: Identity,
		link_id: String,
	},

	/// The backend forced this identity out; `frame` is the raw ban notice.
	Forceout {
		identity: Identity,
		frame: String,
	},

	/// A grace-period close timer fired; live state must be re-checked.
	GraceExpired {
		identity: Identity,
	},

	/// The post-forceout flush delay elapsed; sever remaining downstreams.
	ForceoutFinalize {
		identity: Identity,
	},
}

pub type ControllerEventTx = mpsc::UnboundedSender<ControllerEvent>;
pub type ControllerEventRx = mpsc::UnboundedReceiver<ControllerEvent>;

/// Frame pushed to one downstream connection's writer task.
#[derive(Debug, Clone)]
pub enum DownstreamFrame {
	Text(String),
	Pong(Bytes),
	Close,
}

/// Routing handle for one client-facing connection.
///
/// The underlying socket is owned by the connection's tasks in the server;
/// the controller only ever pushes frames through this channel, so a send
/// here can never block on a slow client.
#[derive(Debug, Clone)]
pub struct DownstreamHandle {
	conn_id: ConnId,
	tx: mpsc::UnboundedSender<DownstreamFrame>,
}

impl DownstreamHandle {
	pub fn new(conn_id: ConnId, tx: mpsc::UnboundedSender<DownstreamFrame>) -> Self {
		Self { conn_id, tx }
	}

	pub fn conn_id(&self) -> ConnId {
		self.conn_id
	}

	/// Queue a text frame; returns false if the connection is gone.
	pub fn send_text(&self, text: impl Into<String>) -> bool {
		self.tx.send(DownstreamFrame::Text(text.into())).is_ok()
	}

	/// Ask the writer task to close the socket after draining queued frames.
	pub fn close(&self) {
		let _ = self.tx.send(DownstreamFrame::Close);
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Short random id used to correlate one upstream link's log lines.
pub(crate) fn new_link_id() -> String {
	uuid::Uuid::new_v4().simple().to_string()
}
