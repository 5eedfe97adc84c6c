#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use huddle_domain::UserId;
use huddle_protocol::pb;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Non-owning handle to one live connection's outbox.
///
/// The connection's writer task owns the transport stream and drains the
/// channel behind `tx`, so every send through a handle is serialized there.
/// Once the writer exits the channel closes and sends report the handle dead.
#[derive(Debug, Clone)]
pub struct ConnHandle {
	conn_id: u64,
	tx: mpsc::Sender<pb::Envelope>,
}

/// Outcome of a single fire-and-forget send through a [`ConnHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
	Delivered,
	/// Receiver's outbox is saturated; the event is dropped, not queued.
	QueueFull,
	/// The underlying connection already closed.
	ChannelClosed,
}

impl ConnHandle {
	pub fn new(conn_id: u64, tx: mpsc::Sender<pb::Envelope>) -> Self {
		Self { conn_id, tx }
	}

	pub fn conn_id(&self) -> u64 {
		self.conn_id
	}

	/// Whether two handles refer to the same physical connection.
	pub fn same_connection(&self, other: &ConnHandle) -> bool {
		self.conn_id == other.conn_id
	}

	/// Single send attempt; never blocks, never retries.
	pub fn send(&self, env: pb::Envelope) -> SendOutcome {
		match self.tx.try_send(env) {
			Ok(()) => SendOutcome::Delivered,
			Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::QueueFull,
			Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::ChannelClosed,
		}
	}
}

/// Identity-to-connection mapping; the presence source of truth.
///
/// Holds two views under one lock: the roster of every live connection
/// (joined or not, for full-snapshot broadcasts) and the `user -> handle`
/// mapping for joined identities. The session lifecycle is the only writer;
/// the event relay only reads.
#[derive(Debug, Clone, Default)]
pub struct Registry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	/// All live connections, keyed by connection id.
	sessions: HashMap<u64, ConnHandle>,

	/// Joined identities. At most one entry per user at any instant.
	online: HashMap<UserId, ConnHandle>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a connection to the roster. Called once per accepted connection,
	/// before any event is processed.
	pub async fn attach(&self, handle: ConnHandle) {
		let mut inner = self.inner.lock().await;
		inner.sessions.insert(handle.conn_id(), handle);
	}

	/// Drop a connection from the roster.
	pub async fn detach(&self, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		inner.sessions.remove(&conn_id);
	}

	/// Register or overwrite the mapping for `user`.
	///
	/// Returns the superseded handle when a *different* connection previously
	/// held this identity (last join wins). Re-upserting the same connection
	/// is idempotent and returns `None`.
	pub async fn upsert(&self, user: UserId, handle: ConnHandle) -> Option<ConnHandle> {
		let mut inner = self.inner.lock().await;
		let prev = inner.online.insert(user, handle.clone());
		prev.filter(|p| !p.same_connection(&handle))
	}

	/// Remove the mapping for `user` only if it still points at `handle`.
	///
	/// A disconnect for a superseded connection must not clobber a newer
	/// login, so a mismatched handle is a no-op. Returns whether anything
	/// was removed.
	pub async fn remove(&self, user: &UserId, handle: &ConnHandle) -> bool {
		let mut inner = self.inner.lock().await;
		match inner.online.get(user) {
			Some(current) if current.same_connection(handle) => {
				inner.online.remove(user);
				true
			}
			_ => false,
		}
	}

	/// Current handle for `user`, if online.
	pub async fn lookup(&self, user: &UserId) -> Option<ConnHandle> {
		let inner = self.inner.lock().await;
		inner.online.get(user).cloned()
	}

	/// The full set of online identities, consistent at a single point in
	/// time. Sorted so snapshots compare stably.
	pub async fn snapshot(&self) -> Vec<UserId> {
		let inner = self.inner.lock().await;
		let mut users = inner.online.keys().cloned().collect::<Vec<_>>();
		users.sort();
		users
	}

	/// Fire-and-forget an envelope to every live connection (joined or not).
	/// Returns the number of connections it was handed to.
	pub async fn broadcast(&self, env: pb::Envelope) -> usize {
		let handles = {
			let inner = self.inner.lock().await;
			inner.sessions.values().cloned().collect::<Vec<_>>()
		};

		let mut delivered = 0usize;
		for handle in &handles {
			match handle.send(env.clone()) {
				SendOutcome::Delivered => delivered += 1,
				SendOutcome::QueueFull => {
					metrics::counter!("huddle_server_broadcast_dropped_total").increment(1);
					debug!(conn_id = handle.conn_id(), "broadcast dropped: outbox full");
				}
				SendOutcome::ChannelClosed => {
					debug!(conn_id = handle.conn_id(), "broadcast skipped: connection closed");
				}
			}
		}

		delivered
	}

	/// Number of live connections on the roster.
	#[allow(dead_code)]
	pub async fn session_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.sessions.len()
	}
}
