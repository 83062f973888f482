#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_domain::{ConnId, Identity};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::ban::BanRegistry;
use crate::discovery::AddressResolver;
use crate::link::{LinkConfig, LinkHandle, spawn_link};
use crate::protocol;
use crate::tap::MessageTap;
use crate::{ControllerEvent, ControllerEventRx, ControllerEventTx, DownstreamHandle};

/// Admission/teardown policy knobs.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
	/// Cluster-wide cap on concurrently active identities (FIFO eviction).
	pub max_identities: usize,

	/// Delay between the last downstream disconnect and upstream teardown.
	pub grace_close: Duration,

	/// Delay between broadcasting a forceout notice and severing downstreams,
	/// so the notice can flush first.
	pub forceout_flush: Duration,
}

impl Default for SessionPolicy {
	fn default() -> Self {
		Self {
			max_identities: 2,
			grace_close: Duration::from_secs(80),
			forceout_flush: Duration::from_secs(1),
		}
	}
}

/// Counts exposed on the admin surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProxyStats {
	pub active_upstream: usize,
	pub active_downstream: usize,
	pub max_identities: usize,
	pub available_slots: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingCloseState {
	Pending,
	Fired,
	Cancelled,
}

/// Cancellable grace-period close timer for one identity.
///
/// Tri-state so redundant cancels (or a cancel racing the firing) stay
/// no-ops; the fire handler re-reads live state anyway.
struct PendingClose {
	state: Arc<Mutex<PendingCloseState>>,
	task: JoinHandle<()>,
}

impl PendingClose {
	fn spawn(identity: Identity, delay: Duration, events_tx: ControllerEventTx) -> Self {
		let state = Arc::new(Mutex::new(PendingCloseState::Pending));
		let task_state = Arc::clone(&state);

		let task = tokio::spawn(async move {
			sleep(delay).await;

			let mut st = task_state.lock();
			if *st == PendingCloseState::Pending {
				*st = PendingCloseState::Fired;
				drop(st);
				let _ = events_tx.send(ControllerEvent::GraceExpired { identity });
			}
		});

		Self { state, task }
	}

	fn cancel(&self) {
		let mut st = self.state.lock();
		if *st == PendingCloseState::Pending {
			*st = PendingCloseState::Cancelled;
			self.task.abort();
		}
	}
}

/// Per-identity state: the three conceptual tables collapsed into one entry
/// so link creation, registry membership, and the pending close are always
/// mutated under the same lock.
#[derive(Default)]
struct IdentityEntry {
	downstream: Vec<DownstreamHandle>,
	link: Option<LinkHandle>,
	pending_close: Option<PendingClose>,
}

struct Inner {
	policy: SessionPolicy,
	link_cfg: LinkConfig,
	entries: Mutex<HashMap<Identity, IdentityEntry>>,
	bans: Arc<BanRegistry>,
	resolver: Arc<dyn AddressResolver>,
	tap: Arc<dyn MessageTap>,
	events_tx: ControllerEventTx,
}

/// The session lifecycle controller.
///
/// Owns the identity store and the admission/eviction policy. All methods
/// are non-blocking: sends from under the store lock go through unbounded
/// channels and the lock is never held across an await.
#[derive(Clone)]
pub struct SessionController {
	inner: Arc<Inner>,
}

impl SessionController {
	/// Build the controller and start its event loop.
	pub fn spawn(
		policy: SessionPolicy,
		link_cfg: LinkConfig,
		bans: Arc<BanRegistry>,
		resolver: Arc<dyn AddressResolver>,
		tap: Arc<dyn MessageTap>,
	) -> Self {
		let (events_tx, events_rx) = mpsc::unbounded_channel();

		let inner = Arc::new(Inner {
			policy,
			link_cfg,
			entries: Mutex::new(HashMap::new()),
			bans,
			resolver,
			tap,
			events_tx,
		});

		tokio::spawn(run_event_loop(Arc::clone(&inner), events_rx));

		Self { inner }
	}

	/// Register a client connection under `identity`.
	///
	/// `first_message` is the raw sign-on frame, replayed to the backend once
	/// the identity's link opens. Banned identities get a rejection notice
	/// and an immediate close with no state created.
	pub fn register_downstream(&self, identity: Identity, conn: DownstreamHandle, first_message: String) {
		let inner = &self.inner;

		if inner.bans.is_banned(&identity) {
			let remaining = inner.bans.remaining_seconds(&identity);
			info!(identity = %identity, conn_id = %conn.conn_id(), remaining, "rejecting banned identity");
			conn.send_text(protocol::ban_rejected_notice(remaining));
			conn.close();
			metrics::counter!("relay_ban_rejections_total").increment(1);
			return;
		}

		info!(identity = %identity, conn_id = %conn.conn_id(), "registering downstream connection");
		metrics::counter!("relay_downstream_registered_total").increment(1);

		let mut entries = inner.entries.lock();

		{
			let entry = entries.entry(identity.clone()).or_default();

			if let Some(pending) = entry.pending_close.take() {
				pending.cancel();
				info!(identity = %identity, "reconnect within grace window; close cancelled");
			}

			entry.downstream.push(conn);
		}

		let has_live_link = entries
			.get(&identity)
			.and_then(|e| e.link.as_ref())
			.is_some_and(|l| !l.is_closed());

		if !has_live_link {
			let never_admitted = entries.get(&identity).is_none_or(|e| e.link.is_none());

			// Admission runs only for a not-yet-admitted identity; a stale
			// (closed) link means the identity already holds a slot.
			if never_admitted {
				inner.enforce_admission(&mut entries, &identity);
			}

			let link = inner.spawn_link_for(&identity);
			link.send(first_message);

			if let Some(entry) = entries.get_mut(&identity) {
				entry.link = Some(link);
			}
		} else {
			debug!(identity = %identity, "reusing existing upstream link");
		}

		publish_gauges(&entries);
	}

	/// Drop one client connection; schedules the grace-period close when it
	/// was the identity's last.
	pub fn unregister_downstream(&self, identity: &Identity, conn_id: ConnId) {
		let inner = &self.inner;
		let mut entries = inner.entries.lock();

		let Some(entry) = entries.get_mut(identity) else {
			return;
		};

		entry.downstream.retain(|h| h.conn_id() != conn_id);
		info!(identity = %identity, conn_id = %conn_id, remaining = entry.downstream.len(), "downstream connection unregistered");

		if entry.downstream.is_empty() {
			if let Some(old) = entry.pending_close.take() {
				old.cancel();
			}

			info!(
				identity = %identity,
				grace_secs = inner.policy.grace_close.as_secs(),
				"last downstream gone; scheduling upstream close"
			);
			entry.pending_close = Some(PendingClose::spawn(
				identity.clone(),
				inner.policy.grace_close,
				inner.events_tx.clone(),
			));
		}

		publish_gauges(&entries);
	}

	/// Forward a client frame to the identity's upstream link, transparently
	/// rebuilding a dropped link while downstream connections remain.
	pub fn route_to_upstream(&self, identity: &Identity, frame: String) {
		let inner = &self.inner;
		let mut entries = inner.entries.lock();

		let Some(entry) = entries.get_mut(identity) else {
			warn!(identity = %identity, "no downstream state; dropping client frame");
			return;
		};

		if entry.downstream.is_empty() {
			warn!(identity = %identity, "no live downstream connections; dropping client frame");
			return;
		}

		let needs_rebuild = entry.link.as_ref().is_none_or(|l| l.is_closed());
		if needs_rebuild {
			// A banned identity is mid-teardown (forceout flush window); a
			// rebuild here would resurrect the link it was just kicked off.
			if inner.bans.is_banned(identity) {
				warn!(identity = %identity, "identity is banned; dropping client frame");
				return;
			}

			// Identity was already admitted; no admission re-check.
			info!(identity = %identity, "upstream link missing or closed; rebuilding");
			entry.link = Some(inner.spawn_link_for(identity));
		}

		if let Some(link) = &entry.link {
			link.send(frame);
		}
	}

	/// Fan a backend frame out to every connection of `identity`. A failed
	/// send on one connection never affects the others.
	pub fn broadcast_to_downstream(&self, identity: &Identity, frame: &str) {
		fan_out(&self.inner, identity, frame);
	}

	/// Feed one event through the same dispatch the event loop uses.
	#[cfg(test)]
	pub(crate) fn inject_event(&self, event: ControllerEvent) {
		dispatch_event(&self.inner, event);
	}

	/// Operator full reset: close every link and connection, cancel every
	/// timer, clear the store. Returns `(upstream, downstream)` counts.
	pub fn close_all(&self) -> (usize, usize) {
		let mut entries = self.inner.entries.lock();

		let mut upstream = 0;
		let mut downstream = 0;

		for (identity, entry) in entries.drain() {
			if let Some(pending) = entry.pending_close {
				pending.cancel();
			}
			if let Some(link) = entry.link {
				link.close();
				upstream += 1;
			}
			for conn in entry.downstream {
				conn.close();
				downstream += 1;
			}
			debug!(identity = %identity, "state cleared by close_all");
		}

		warn!(upstream, downstream, "operator closed all connections");
		publish_gauges(&entries);
		(upstream, downstream)
	}

	pub fn stats(&self) -> ProxyStats {
		let entries = self.inner.entries.lock();
		let active_upstream = entries.values().filter(|e| e.link.is_some()).count();
		let active_downstream = entries.values().map(|e| e.downstream.len()).sum();
		let max_identities = self.inner.policy.max_identities;

		ProxyStats {
			active_upstream,
			active_downstream,
			max_identities,
			available_slots: max_identities.saturating_sub(active_upstream),
		}
	}
}

impl Inner {
	fn spawn_link_for(&self, identity: &Identity) -> LinkHandle {
		metrics::counter!("relay_upstream_links_created_total").increment(1);
		spawn_link(
			identity.clone(),
			Arc::clone(&self.resolver),
			self.link_cfg.clone(),
			Arc::clone(&self.tap),
			self.events_tx.clone(),
		)
	}

	/// FIFO cap on concurrently active identities: at capacity, the identity
	/// whose link was created first is evicted to make room.
	fn enforce_admission(&self, entries: &mut HashMap<Identity, IdentityEntry>, incoming: &Identity) {
		loop {
			let active = entries.values().filter(|e| e.link.is_some()).count();
			if active < self.policy.max_identities {
				return;
			}

			let oldest = entries
				.iter()
				.filter(|(id, e)| e.link.is_some() && *id != incoming)
				.min_by_key(|(_, e)| e.link.as_ref().map(|l| l.created_at()))
				.map(|(id, _)| id.clone());

			let Some(victim) = oldest else {
				return;
			};

			warn!(victim = %victim, incoming = %incoming, cap = self.policy.max_identities, "capacity reached; evicting oldest identity");
			metrics::counter!("relay_evictions_total").increment(1);

			let Some(entry) = entries.remove(&victim) else {
				return;
			};

			if let Some(pending) = entry.pending_close {
				pending.cancel();
			}

			// Notice first, then close; the writer drains in order.
			let notice = protocol::evicted_notice();
			for conn in entry.downstream {
				conn.send_text(notice.clone());
				conn.close();
			}

			if let Some(link) = entry.link {
				link.close();
			}
		}
	}
}

async fn run_event_loop(inner: Arc<Inner>, mut events_rx: ControllerEventRx) {
	while let Some(event) = events_rx.recv().await {
		dispatch_event(&inner, event);
	}

	debug!("controller event loop exiting");
}

fn dispatch_event(inner: &Inner, event: ControllerEvent) {
	match event {
		ControllerEvent::Broadcast { identity, frame } => {
			fan_out(inner, &identity, &frame);
		}

		ControllerEvent::UpstreamClosed { identity, link_id } => {
			on_upstream_closed(inner, &identity, &link_id);
		}

		ControllerEvent::Forceout { identity, frame } => {
			on_forceout(inner, &identity, &frame);
		}

		ControllerEvent::GraceExpired { identity } => {
			on_grace_expired(inner, &identity);
		}

		ControllerEvent::ForceoutFinalize { identity } => {
			on_forceout_finalize(inner, &identity);
		}
	}
}

fn fan_out(inner: &Inner, identity: &Identity, frame: &str) {
	let entries = inner.entries.lock();

	let Some(entry) = entries.get(identity) else {
		warn!(identity = %identity, "no downstream connections; dropping backend frame");
		return;
	};

	for conn in &entry.downstream {
		if !conn.send_text(frame) {
			warn!(identity = %identity, conn_id = %conn.conn_id(), "failed to forward frame to downstream connection");
		}
	}
}

/// Unsolicited backend drop: sever everything for the identity so clients
/// reconnect and re-run admission from scratch.
///
/// The event names the link instance that died. A mismatch means a
/// replacement link was installed between the death and this handler
/// running; the event is stale and must not touch the replacement.
fn on_upstream_closed(inner: &Inner, identity: &Identity, link_id: &str) {
	let mut entries = inner.entries.lock();

	let current = entries.get(identity).and_then(|e| e.link.as_ref());
	if current.is_none_or(|l| l.link_id() != link_id) {
		debug!(identity = %identity, link_id, "ignoring close event for a link that is no longer current");
		return;
	}

	let Some(entry) = entries.remove(identity) else {
		return;
	};

	info!(
		identity = %identity,
		downstream = entry.downstream.len(),
		"upstream link dropped; closing all downstream connections"
	);

	if let Some(pending) = entry.pending_close {
		pending.cancel();
	}
	if let Some(link) = entry.link {
		link.close();
	}
	for conn in entry.downstream {
		conn.close();
	}

	publish_gauges(&entries);
}

fn on_forceout(inner: &Inner, identity: &Identity, frame: &str) {
	inner.bans.ban(identity);
	metrics::counter!("relay_forceouts_total").increment(1);

	let mut entries = inner.entries.lock();

	let Some(entry) = entries.get_mut(identity) else {
		return;
	};

	info!(identity = %identity, downstream = entry.downstream.len(), "forceout: broadcasting ban notice");

	// The raw ban frame goes out verbatim so clients can render the reason
	// before the socket drops.
	for conn in &entry.downstream {
		if !conn.send_text(frame) {
			warn!(identity = %identity, conn_id = %conn.conn_id(), "failed to deliver ban notice");
		}
	}

	if let Some(pending) = entry.pending_close.take() {
		pending.cancel();
	}
	if let Some(link) = entry.link.take() {
		link.close();
	}

	let identity = identity.clone();
	let delay = inner.policy.forceout_flush;
	let events_tx = inner.events_tx.clone();
	tokio::spawn(async move {
		sleep(delay).await;
		let _ = events_tx.send(ControllerEvent::ForceoutFinalize { identity });
	});
}

fn on_forceout_finalize(inner: &Inner, identity: &Identity) {
	let mut entries = inner.entries.lock();

	let Some(entry) = entries.remove(identity) else {
		return;
	};

	info!(identity = %identity, downstream = entry.downstream.len(), "forceout: severing downstream connections");

	if let Some(pending) = entry.pending_close {
		pending.cancel();
	}
	if let Some(link) = entry.link {
		link.close();
	}
	for conn in entry.downstream {
		conn.close();
	}

	publish_gauges(&entries);
}

/// Grace timer fired: the decision re-reads live state, never the state as
/// of scheduling time.
fn on_grace_expired(inner: &Inner, identity: &Identity) {
	let mut entries = inner.entries.lock();

	let Some(entry) = entries.get_mut(identity) else {
		return;
	};

	if !entry.downstream.is_empty() {
		debug!(identity = %identity, "grace timer fired but identity reconnected; keeping link");
		entry.pending_close = None;
		return;
	}

	info!(identity = %identity, "grace period elapsed; closing upstream link");
	if let Some(link) = entry.link.take() {
		link.close();
	}
	entries.remove(identity);

	publish_gauges(&entries);
}

fn publish_gauges(entries: &HashMap<Identity, IdentityEntry>) {
	let upstream = entries.values().filter(|e| e.link.is_some()).count();
	let downstream: usize = entries.values().map(|e| e.downstream.len()).sum();
	metrics::gauge!("relay_active_upstream_links").set(upstream as f64);
	metrics::gauge!("relay_active_downstream_connections").set(downstream as f64);
}
