#![forbid(unsafe_code)]

use anyhow::Context as _;
use huddle_domain::UserId;
use huddle_protocol::pb;
use huddle_protocol::version::PROTOCOL_VERSION;
use tracing::debug;

use crate::server::registry::{Registry, SendOutcome};
use crate::server::store::{MessageStore, StoredMessage};

/// Observable result of a single relay attempt. None of these surface to the
/// remote peer; failures are fail-silent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
	Delivered,
	/// Receiver has no registry entry; the event is dropped.
	ReceiverOffline,
	/// Receiver is registered but its outbox is saturated.
	QueueFull,
	/// Receiver's connection closed between lookup and send; treated as a
	/// late disconnect by its own session.
	ChannelClosed,
}

impl RelayOutcome {
	pub fn is_delivered(self) -> bool {
		matches!(self, RelayOutcome::Delivered)
	}
}

/// Both legs of a chat delivery, plus the canonical record that was persisted
/// before either leg was attempted.
#[derive(Debug, Clone)]
pub struct ChatDelivery {
	pub stored: StoredMessage,
	pub to_receiver: RelayOutcome,
	pub echo_to_sender: RelayOutcome,
}

/// Stateless dispatcher that forwards events between peers by identity
/// lookup. Reads the registry, never writes it.
#[derive(Debug, Clone)]
pub struct EventRelay {
	registry: Registry,
}

impl EventRelay {
	pub fn new(registry: Registry) -> Self {
		Self { registry }
	}

	/// Forward one event to `to`, best-effort and fire-and-forget: one send
	/// call, no buffering, no retry, no acknowledgment.
	pub async fn relay(&self, to: &UserId, msg: pb::envelope::Msg) -> RelayOutcome {
		let Some(handle) = self.registry.lookup(to).await else {
			metrics::counter!("huddle_server_relay_routing_miss_total").increment(1);
			debug!(%to, "relay dropped: receiver offline");
			return RelayOutcome::ReceiverOffline;
		};

		let env = pb::Envelope {
			version: PROTOCOL_VERSION,
			msg: Some(msg),
		};

		match handle.send(env) {
			SendOutcome::Delivered => {
				metrics::counter!("huddle_server_relay_delivered_total").increment(1);
				RelayOutcome::Delivered
			}
			SendOutcome::QueueFull => {
				metrics::counter!("huddle_server_relay_dropped_total").increment(1);
				debug!(%to, conn_id = handle.conn_id(), "relay dropped: outbox full");
				RelayOutcome::QueueFull
			}
			SendOutcome::ChannelClosed => {
				metrics::counter!("huddle_server_relay_dropped_total").increment(1);
				debug!(%to, conn_id = handle.conn_id(), "relay dropped: connection closed");
				RelayOutcome::ChannelClosed
			}
		}
	}

	/// Persist a chat message, then deliver the canonical record to the
	/// receiver and echo it to the sender.
	///
	/// The persist await is a hard ordering barrier: the relay must never
	/// race ahead of durability, because offline receivers recover the
	/// message through history fetch rather than relay retry. A persistence
	/// error means neither leg is attempted.
	pub async fn send_chat(
		&self,
		store: &dyn MessageStore,
		sender: &UserId,
		receiver: &UserId,
		content: &str,
	) -> anyhow::Result<ChatDelivery> {
		let stored = store
			.persist_message(sender, receiver, content)
			.await
			.context("persist chat message")?;

		let to_receiver = self
			.relay(receiver, pb::envelope::Msg::ReceiveMessage(stored.to_wire()))
			.await;
		let echo_to_sender = self
			.relay(sender, pb::envelope::Msg::ReceiveMessage(stored.to_wire()))
			.await;

		Ok(ChatDelivery {
			stored,
			to_receiver,
			echo_to_sender,
		})
	}
}
