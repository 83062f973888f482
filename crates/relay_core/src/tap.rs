#![forbid(unsafe_code)]

use relay_domain::Identity;

use crate::protocol::LastMessageNotice;

/// Observer for the backend control shapes the link recognizes.
///
/// Implemented by the enrichment caches living outside this crate. Hooks are
/// invoked inline on the link's read path, so implementations must be quick
/// and must not panic; the link ignores their outcome entirely and forwards
/// the raw frame regardless.
pub trait MessageTap: Send + Sync {
	/// A `{"code":15,...}` profile notice was observed for `identity`.
	fn profile_seen(&self, identity: &Identity, sel_userid: &str, raw: &str) {
		let _ = (identity, sel_userid, raw);
	}

	/// A `{"code":7,...}` chat-delivery notice was observed for `identity`.
	fn last_message(&self, identity: &Identity, notice: &LastMessageNotice, raw: &str) {
		let _ = (identity, notice, raw);
	}
}

/// Tap that ignores everything; the default when no caches are wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTap;

impl MessageTap for NoopTap {}
