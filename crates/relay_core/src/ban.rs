#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use relay_domain::Identity;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time-bounded deny-list of forced-out identities.
///
/// Readers self-heal: an expired record is treated as absent (and removed)
/// on every lookup, so the periodic sweep only reclaims memory and never
/// changes answers.
#[derive(Debug)]
pub struct BanRegistry {
	records: Mutex<HashMap<Identity, Instant>>,
	ban_duration: Duration,
}

impl BanRegistry {
	pub fn new(ban_duration: Duration) -> Self {
		Self {
			records: Mutex::new(HashMap::new()),
			ban_duration,
		}
	}

	/// True iff a ban record exists with an expiry in the future.
	///
	/// Lazily removes the record when it is found expired.
	pub fn is_banned(&self, id: &Identity) -> bool {
		let mut records = self.records.lock();
		let Some(expiry) = records.get(id) else {
			return false;
		};

		if Instant::now() >= *expiry {
			records.remove(id);
			debug!(identity = %id, remaining = records.len(), "expired ban removed on read");
			return false;
		}

		true
	}

	/// Insert or overwrite a ban record expiring after the configured duration.
	pub fn ban(&self, id: &Identity) {
		let expiry = Instant::now() + self.ban_duration;
		let mut records = self.records.lock();
		records.insert(id.clone(), expiry);
		warn!(identity = %id, total = records.len(), ban_secs = self.ban_duration.as_secs(), "identity banned");
	}

	/// Seconds until the ban expires; 0 when not banned. Never negative.
	pub fn remaining_seconds(&self, id: &Identity) -> u64 {
		let records = self.records.lock();
		match records.get(id) {
			Some(expiry) => expiry.saturating_duration_since(Instant::now()).as_secs(),
			None => 0,
		}
	}

	/// Remove all expired records; returns how many were removed.
	pub fn sweep(&self) -> usize {
		let now = Instant::now();
		let mut records = self.records.lock();
		let before = records.len();
		records.retain(|_, expiry| *expiry > now);
		before - records.len()
	}

	/// Manually lift one ban. Returns whether a record existed.
	pub fn unban(&self, id: &Identity) -> bool {
		let removed = self.records.lock().remove(id).is_some();
		if removed {
			info!(identity = %id, "ban manually removed");
		}
		removed
	}

	/// Remove every record; returns the count removed.
	pub fn clear_all(&self) -> usize {
		let mut records = self.records.lock();
		let count = records.len();
		records.clear();
		if count > 0 {
			warn!(count, "all bans cleared by operator");
		}
		count
	}

	pub fn banned_count(&self) -> usize {
		self.records.lock().len()
	}
}

/// Spawn the periodic maintenance sweep.
pub fn spawn_ban_sweeper(bans: Arc<BanRegistry>, interval: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		ticker.tick().await;

		loop {
			ticker.tick().await;
			let removed = bans.sweep();
			if removed > 0 {
				info!(removed, "swept expired ban records");
			}
		}
	})
}
