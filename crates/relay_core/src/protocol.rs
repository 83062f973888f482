#![forbid(unsafe_code)]

use serde::Deserialize;

/// `action` value that registers a downstream connection.
pub const SIGN_ON_ACTION: &str = "sign-on";

/// Backend frame `code` values the proxy recognizes.
const CODE_FORCEOUT: i64 = -3;
const CODE_LAST_MESSAGE: i64 = 7;
const CODE_PROFILE: i64 = 15;

/// Control-notice `code` values the proxy itself emits.
const CODE_BAN_REJECTED: i64 = -4;
const CODE_EVICTED: i64 = -6;

/// First-frame control fields sent by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientHello {
	pub action: String,
	pub identity: String,
}

impl ClientHello {
	pub fn is_sign_on(&self) -> bool {
		self.action == SIGN_ON_ACTION
	}
}

/// Peek at a client frame for the sign-on control shape.
///
/// Returns `None` for anything that is not a JSON object carrying both
/// fields; such frames are opaque to the proxy.
pub fn peek_client_hello(raw: &str) -> Option<ClientHello> {
	serde_json::from_str::<ClientHello>(raw).ok()
}

/// One of the three backend control shapes the link tap recognizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendControl {
	/// `{"code":-3,"forceout":true,...}`
	Forceout,

	/// `{"code":15,"sel_userid":"...",...}`
	ProfileSeen {
		sel_userid: String,
	},

	/// `{"code":7,"fromuser":{...},"touser":{...}}`
	LastMessage(LastMessageNotice),
}

/// Fields of the chat-delivery notice consumed by the last-message hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessageNotice {
	pub from_id: String,
	pub to_id: String,
	pub content: String,
	pub time: String,
	pub kind: String,
}

#[derive(Debug, Deserialize)]
struct BackendPeek {
	code: i64,

	#[serde(default)]
	forceout: bool,

	sel_userid: Option<String>,

	fromuser: Option<PeerRef>,
	touser: Option<PeerTarget>,
}

#[derive(Debug, Deserialize)]
struct PeerRef {
	id: String,
	content: Option<String>,
	time: Option<String>,

	#[serde(rename = "type")]
	kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PeerTarget {
	id: String,
}

/// Inspect a backend frame for the recognized control shapes.
///
/// Any parse failure yields `None`; the caller forwards the frame verbatim
/// either way, so this can never block or fail the forwarding path.
pub fn inspect_backend_frame(raw: &str) -> Option<BackendControl> {
	let peek: BackendPeek = serde_json::from_str(raw).ok()?;

	match peek.code {
		CODE_FORCEOUT if peek.forceout => Some(BackendControl::Forceout),
		CODE_PROFILE => peek.sel_userid.map(|sel_userid| BackendControl::ProfileSeen { sel_userid }),
		CODE_LAST_MESSAGE => {
			let from = peek.fromuser?;
			let to = peek.touser?;
			Some(BackendControl::LastMessage(LastMessageNotice {
				from_id: from.id,
				to_id: to.id,
				content: from.content.unwrap_or_default(),
				time: from.time.unwrap_or_default(),
				kind: from.kind.unwrap_or_default(),
			}))
		}
		_ => None,
	}
}

/// Rejection notice sent to a banned client before its socket is closed.
pub fn ban_rejected_notice(remaining_secs: u64) -> String {
	serde_json::json!({
		"code": CODE_BAN_REJECTED,
		"content": format!("connection refused: forced out for another {remaining_secs}s"),
		"forceout": true,
	})
	.to_string()
}

/// Notice sent to each downstream connection of an evicted identity.
pub fn evicted_notice() -> String {
	serde_json::json!({
		"code": CODE_EVICTED,
		"content": "session closed: concurrent identity limit reached",
		"evicted": true,
	})
	.to_string()
}
