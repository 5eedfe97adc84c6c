#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use huddle_domain::UserId;
use huddle_protocol::version::PROTOCOL_VERSION;
use huddle_protocol::{DEFAULT_MAX_FRAME_SIZE, encode_frame, pb, try_decode_frame_from_buffer};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth::IdentityVerifier;
use crate::server::registry::{ConnHandle, Registry};
use crate::server::relay::EventRelay;
use crate::server::store::MessageStore;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	/// Capacity of the per-connection outbox drained by the writer task.
	pub outbox_capacity: usize,

	/// Capacity of the ordered inbound event channel.
	pub inbox_capacity: usize,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			outbox_capacity: 256,
			inbox_capacity: 256,
		}
	}
}

/// Lifecycle of one connection. `Disconnected` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	/// Transport established, no identity bound yet. Only `Join` is valid.
	Connecting,
	Joined(UserId),
	Disconnected,
}

/// State machine for a single connection: drives registry updates on
/// join/leave, broadcasts presence snapshots, and hands relay-class events
/// to the event relay. Events arrive strictly in the order the client sent
/// them; each is fully handled (including the persist await for chat) before
/// the next is taken.
pub struct Session {
	conn_id: u64,
	handle: ConnHandle,
	state: SessionState,
	registry: Registry,
	relay: EventRelay,
	store: Arc<dyn MessageStore>,
	verifier: Arc<IdentityVerifier>,
}

impl Session {
	pub fn new(
		conn_id: u64,
		handle: ConnHandle,
		registry: Registry,
		relay: EventRelay,
		store: Arc<dyn MessageStore>,
		verifier: Arc<IdentityVerifier>,
	) -> Self {
		Self {
			conn_id,
			handle,
			state: SessionState::Connecting,
			registry,
			relay,
			store,
			verifier,
		}
	}

	#[allow(dead_code)]
	pub fn state(&self) -> &SessionState {
		&self.state
	}

	/// Handle one inbound event. Invalid events are dropped, never answered;
	/// no error crosses the wire.
	pub async fn handle_event(&mut self, msg: pb::envelope::Msg) {
		match &self.state {
			SessionState::Connecting => match msg {
				pb::envelope::Msg::Join(join) => self.handle_join(join).await,
				other => self.protocol_violation("event before join", &other),
			},
			SessionState::Joined(user) => {
				let user = user.clone();
				match msg {
					pb::envelope::Msg::Join(join) => self.handle_rejoin(&user, join).await,
					pb::envelope::Msg::SendMessage(m) => self.handle_send_message(&user, m).await,
					pb::envelope::Msg::Typing(t) => {
						self.relay_to(&t.to, pb::envelope::Msg::PeerTyping(pb::PeerTyping {
							from: user.as_str().to_string(),
						}))
						.await;
					}
					pb::envelope::Msg::StopTyping(t) => {
						self.relay_to(&t.to, pb::envelope::Msg::PeerStopTyping(pb::PeerStopTyping {
							from: user.as_str().to_string(),
						}))
						.await;
					}
					pb::envelope::Msg::CallUser(c) => {
						self.relay_to(&c.to, pb::envelope::Msg::IncomingCall(pb::IncomingCall {
							from: user.as_str().to_string(),
							signal: c.signal,
							call_type: c.call_type,
						}))
						.await;
					}
					pb::envelope::Msg::AnswerCall(a) => {
						self.relay_to(&a.to, pb::envelope::Msg::CallAnswered(pb::CallAnswered { signal: a.signal }))
							.await;
					}
					pb::envelope::Msg::IceCandidate(i) => {
						self.relay_to(&i.to, pb::envelope::Msg::PeerIceCandidate(pb::PeerIceCandidate {
							candidate: i.candidate,
						}))
						.await;
					}
					pb::envelope::Msg::EndCall(e) => {
						self.relay_to(&e.to, pb::envelope::Msg::CallEnded(pb::CallEnded {})).await;
					}
					other => self.protocol_violation("server-to-client event from client", &other),
				}
			}
			SessionState::Disconnected => {
				debug!(conn_id = self.conn_id, "event after disconnect ignored");
			}
		}
	}

	/// Terminal transition. Conditionally unbinds the identity (a stale
	/// disconnect must not clobber a newer login for the same user) and
	/// broadcasts the updated presence set. Idempotent.
	pub async fn finish(&mut self) {
		let prev = std::mem::replace(&mut self.state, SessionState::Disconnected);

		let SessionState::Joined(user) = prev else {
			self.registry.detach(self.conn_id).await;
			return;
		};

		let removed = self.registry.remove(&user, &self.handle).await;
		self.registry.detach(self.conn_id).await;

		if removed {
			info!(conn_id = self.conn_id, %user, "session disconnected");
			self.broadcast_presence().await;
		} else {
			// This login was superseded; the newer session owns the entry.
			debug!(conn_id = self.conn_id, %user, "stale disconnect; registry already points elsewhere");
		}
	}

	async fn handle_join(&mut self, join: pb::Join) {
		let claimed = match UserId::new(join.user_id) {
			Ok(user) => user,
			Err(e) => {
				warn!(conn_id = self.conn_id, error = %e, "join rejected: invalid user id");
				metrics::counter!("huddle_server_protocol_violations_total").increment(1);
				return;
			}
		};

		let user = match self.verifier.verify_join(&claimed, &join.auth_token) {
			Ok(user) => user,
			Err(e) => {
				warn!(conn_id = self.conn_id, claimed = %claimed, error = %e, "join rejected: identity not verified");
				metrics::counter!("huddle_server_join_rejected_total").increment(1);
				return;
			}
		};

		if let Some(superseded) = self.registry.upsert(user.clone(), self.handle.clone()).await {
			// Last join wins. The superseded connection is left open on
			// purpose; its own disconnect becomes a registry no-op.
			info!(
				conn_id = self.conn_id,
				superseded_conn = superseded.conn_id(),
				%user,
				"duplicate login; registry now points at this connection"
			);
			metrics::counter!("huddle_server_duplicate_logins_total").increment(1);
		}

		info!(conn_id = self.conn_id, %user, "session joined");
		metrics::counter!("huddle_server_joins_total").increment(1);
		self.state = SessionState::Joined(user);
		self.broadcast_presence().await;
	}

	async fn handle_rejoin(&mut self, bound: &UserId, join: pb::Join) {
		if join.user_id == bound.as_str() {
			// Idempotent re-upsert; no presence change, so no broadcast.
			self.registry.upsert(bound.clone(), self.handle.clone()).await;
			debug!(conn_id = self.conn_id, user = %bound, "repeated join; re-upserted");
		} else {
			self.protocol_violation("join with a different identity on a bound session", &pb::envelope::Msg::Join(join));
		}
	}

	async fn handle_send_message(&mut self, sender: &UserId, m: pb::SendMessage) {
		let receiver = match UserId::new(m.receiver) {
			Ok(user) => user,
			Err(e) => {
				warn!(conn_id = self.conn_id, error = %e, "chat dropped: invalid receiver id");
				metrics::counter!("huddle_server_protocol_violations_total").increment(1);
				return;
			}
		};

		// Persist-then-relay; a store failure means no delivery and no echo,
		// and the sender learns only by the absence of the echo.
		match self.relay.send_chat(self.store.as_ref(), sender, &receiver, &m.content).await {
			Ok(delivery) => {
				debug!(
					conn_id = self.conn_id,
					message_id = %delivery.stored.id,
					%receiver,
					delivered = delivery.to_receiver.is_delivered(),
					echoed = delivery.echo_to_sender.is_delivered(),
					"chat relayed"
				);
			}
			Err(e) => {
				warn!(conn_id = self.conn_id, %sender, %receiver, error = %e, "chat persistence failed; message not relayed");
				metrics::counter!("huddle_server_persistence_failures_total").increment(1);
			}
		}
	}

	async fn relay_to(&self, to: &str, msg: pb::envelope::Msg) {
		let receiver = match UserId::new(to.to_string()) {
			Ok(user) => user,
			Err(e) => {
				warn!(conn_id = self.conn_id, error = %e, "relay dropped: invalid target id");
				metrics::counter!("huddle_server_protocol_violations_total").increment(1);
				return;
			}
		};

		let _ = self.relay.relay(&receiver, msg).await;
	}

	async fn broadcast_presence(&self) {
		let users = self.registry.snapshot().await;
		let env = pb::Envelope {
			version: PROTOCOL_VERSION,
			msg: Some(pb::envelope::Msg::OnlineUsers(pb::OnlineUsers {
				users: users.into_iter().map(UserId::into_string).collect(),
			})),
		};

		let reached = self.registry.broadcast(env).await;
		metrics::counter!("huddle_server_presence_broadcasts_total").increment(1);
		debug!(conn_id = self.conn_id, reached, "presence snapshot broadcast");
	}

	fn protocol_violation(&self, what: &str, msg: &pb::envelope::Msg) {
		warn!(conn_id = self.conn_id, kind = kind_name(msg), "protocol violation: {what}");
		metrics::counter!("huddle_server_protocol_violations_total").increment(1);
	}
}

fn kind_name(msg: &pb::envelope::Msg) -> &'static str {
	match msg {
		pb::envelope::Msg::Join(_) => "join",
		pb::envelope::Msg::SendMessage(_) => "send_message",
		pb::envelope::Msg::Typing(_) => "typing",
		pb::envelope::Msg::StopTyping(_) => "stop_typing",
		pb::envelope::Msg::CallUser(_) => "call_user",
		pb::envelope::Msg::AnswerCall(_) => "answer_call",
		pb::envelope::Msg::IceCandidate(_) => "ice_candidate",
		pb::envelope::Msg::EndCall(_) => "end_call",
		pb::envelope::Msg::OnlineUsers(_) => "online_users",
		pb::envelope::Msg::ReceiveMessage(_) => "receive_message",
		pb::envelope::Msg::PeerTyping(_) => "peer_typing",
		pb::envelope::Msg::PeerStopTyping(_) => "peer_stop_typing",
		pb::envelope::Msg::IncomingCall(_) => "incoming_call",
		pb::envelope::Msg::CallAnswered(_) => "call_answered",
		pb::envelope::Msg::PeerIceCandidate(_) => "peer_ice_candidate",
		pb::envelope::Msg::CallEnded(_) => "call_ended",
	}
}

/// Run one accepted QUIC connection to completion.
///
/// A reader task frames inbound bytes into an ordered channel; a writer task
/// owns the send stream and drains the session's outbox, so all sends to this
/// connection are serialized in one place. The session loop consumes inbound
/// events in arrival order. When the transport closes, the reader ends, the
/// loop drains whatever was already queued (in-flight persistence included),
/// and cleanup runs exactly once.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	registry: Registry,
	relay: EventRelay,
	store: Arc<dyn MessageStore>,
	verifier: Arc<IdentityVerifier>,
	settings: SessionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("huddle_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("huddle_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (send_stream, recv_stream) = connection.accept_bi().await.context("accept bidirectional stream")?;

	let (out_tx, out_rx) = mpsc::channel::<pb::Envelope>(settings.outbox_capacity);
	let writer_task = tokio::spawn(async move {
		if let Err(e) = write_outbox(send_stream, out_rx).await {
			// A failed write is a late disconnect signal; the reader will
			// observe the closed transport and end the session.
			debug!(error = %e, "writer task ended");
		}
	});

	let (in_tx, mut in_rx) = mpsc::channel::<pb::envelope::Msg>(settings.inbox_capacity);
	let reader_task = tokio::spawn(async move {
		if let Err(e) = read_frames(recv_stream, in_tx).await {
			debug!(error = %e, "reader task ended");
		}
	});

	let handle = ConnHandle::new(conn_id, out_tx);
	registry.attach(handle.clone()).await;

	let mut session = Session::new(conn_id, handle, registry, relay, store, verifier);

	while let Some(msg) = in_rx.recv().await {
		session.handle_event(msg).await;
	}

	session.finish().await;

	reader_task.abort();
	writer_task.abort();
	Ok(())
}

async fn read_frames(mut recv: quinn::RecvStream, tx: mpsc::Sender<pb::envelope::Msg>) -> anyhow::Result<()> {
	let mut buf = BytesMut::with_capacity(16 * 1024);
	let mut tmp = [0u8; 8192];

	loop {
		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => return Ok(()),
			Err(e) => return Err(anyhow!(e).context("stream read failed")),
		};

		metrics::counter!("huddle_server_bytes_in_total").increment(n as u64);
		buf.extend_from_slice(&tmp[..n]);

		loop {
			match try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE) {
				Ok(Some(env)) => {
					metrics::counter!("huddle_server_envelopes_in_total").increment(1);

					if env.version != PROTOCOL_VERSION {
						debug!(version = env.version, "envelope with unexpected protocol version");
					}

					let Some(msg) = env.msg else {
						metrics::counter!("huddle_server_protocol_violations_total").increment(1);
						continue;
					};

					if tx.send(msg).await.is_err() {
						return Ok(());
					}
				}
				Ok(None) => break,
				Err(e) => {
					metrics::counter!("huddle_server_decode_errors_total").increment(1);
					return Err(anyhow!(e).context("failed to decode inbound frame"));
				}
			}
		}
	}
}

async fn write_outbox(mut send: quinn::SendStream, mut rx: mpsc::Receiver<pb::Envelope>) -> anyhow::Result<()> {
	while let Some(env) = rx.recv().await {
		let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).context("encode outbound frame")?;
		send.write_all(&frame).await.context("stream write failed")?;
		metrics::counter!("huddle_server_envelopes_out_total").increment(1);
	}

	Ok(())
}
