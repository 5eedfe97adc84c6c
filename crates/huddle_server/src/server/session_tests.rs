#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use huddle_domain::UserId;
use huddle_protocol::pb;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::auth::IdentityVerifier;
use crate::server::registry::{ConnHandle, Registry};
use crate::server::relay::EventRelay;
use crate::server::session::{Session, SessionState};
use crate::server::store::{InMemoryMessageStore, MessageStore};

struct Harness {
	registry: Registry,
	relay: EventRelay,
	store: Arc<InMemoryMessageStore>,
	verifier: Arc<IdentityVerifier>,
	next_conn_id: u64,
}

impl Harness {
	fn new() -> Self {
		let registry = Registry::new();
		Self {
			relay: EventRelay::new(registry.clone()),
			registry,
			store: Arc::new(InMemoryMessageStore::default()),
			verifier: Arc::new(IdentityVerifier::permissive()),
			next_conn_id: 0,
		}
	}

	/// Open a connection exactly the way the accept loop does: attach first,
	/// then hand the session its own handle.
	async fn open(&mut self) -> (Session, mpsc::Receiver<pb::Envelope>) {
		self.next_conn_id += 1;
		let (tx, rx) = mpsc::channel(16);
		let handle = ConnHandle::new(self.next_conn_id, tx);
		self.registry.attach(handle.clone()).await;

		let session = Session::new(
			self.next_conn_id,
			handle,
			self.registry.clone(),
			self.relay.clone(),
			self.store.clone(),
			self.verifier.clone(),
		);
		(session, rx)
	}
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn join(id: &str) -> pb::envelope::Msg {
	pb::envelope::Msg::Join(pb::Join {
		user_id: id.to_string(),
		auth_token: String::new(),
	})
}

async fn recv_one(rx: &mut mpsc::Receiver<pb::Envelope>) -> pb::envelope::Msg {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected delivery within timeout")
		.expect("channel open")
		.msg
		.expect("envelope carries a message")
}

async fn expect_presence(rx: &mut mpsc::Receiver<pb::Envelope>) -> Vec<String> {
	match recv_one(rx).await {
		pb::envelope::Msg::OnlineUsers(o) => o.users,
		_ => panic!("expected OnlineUsers"),
	}
}

async fn assert_silent(rx: &mut mpsc::Receiver<pb::Envelope>) {
	assert!(
		timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
		"expected no delivery"
	);
}

#[tokio::test]
async fn join_broadcasts_presence_to_every_connection_including_unjoined() {
	let mut h = Harness::new();
	let (mut alice, mut alice_rx) = h.open().await;
	let (_lurker, mut lurker_rx) = h.open().await;

	alice.handle_event(join("alice")).await;
	assert_eq!(*alice.state(), SessionState::Joined(user("alice")));

	assert_eq!(expect_presence(&mut alice_rx).await, vec!["alice".to_string()]);
	assert_eq!(expect_presence(&mut lurker_rx).await, vec!["alice".to_string()]);
}

#[tokio::test]
async fn events_before_join_are_dropped() {
	let mut h = Harness::new();
	let (mut bob_session, mut bob_rx) = h.open().await;
	bob_session.handle_event(join("bob")).await;
	let _ = expect_presence(&mut bob_rx).await;

	let (mut stranger, _rx) = h.open().await;
	stranger
		.handle_event(pb::envelope::Msg::Typing(pb::Typing {
			to: "bob".to_string(),
			from: "stranger".to_string(),
		}))
		.await;

	assert_eq!(*stranger.state(), SessionState::Connecting);
	assert_silent(&mut bob_rx).await;
}

#[tokio::test]
async fn disconnect_unregisters_and_broadcasts_updated_presence() {
	let mut h = Harness::new();
	let (mut alice, mut alice_rx) = h.open().await;
	let (mut bob, mut bob_rx) = h.open().await;

	alice.handle_event(join("alice")).await;
	bob.handle_event(join("bob")).await;
	for _ in 0..2 {
		let _ = expect_presence(&mut alice_rx).await;
		let _ = expect_presence(&mut bob_rx).await;
	}

	alice.finish().await;
	assert_eq!(*alice.state(), SessionState::Disconnected);

	assert_eq!(expect_presence(&mut bob_rx).await, vec!["bob".to_string()]);
	assert!(h.registry.lookup(&user("alice")).await.is_none());
	assert_eq!(h.registry.session_count().await, 1);
}

#[tokio::test]
async fn duplicate_login_keeps_latest_and_survives_stale_disconnect() {
	let mut h = Harness::new();
	let (mut first, mut first_rx) = h.open().await;
	let (mut second, _second_rx) = h.open().await;

	first.handle_event(join("alice")).await;
	let _ = expect_presence(&mut first_rx).await;

	second.handle_event(join("alice")).await;
	// The first connection stays open and still gets broadcasts.
	assert_eq!(expect_presence(&mut first_rx).await, vec!["alice".to_string()]);

	// Relay now routes to the second connection.
	let second_handle = h.registry.lookup(&user("alice")).await.expect("alice online");
	assert_eq!(second_handle.conn_id(), 2);

	// The superseded connection's own disconnect is a registry no-op.
	first.finish().await;
	assert!(h.registry.lookup(&user("alice")).await.is_some());
	assert_eq!(h.registry.snapshot().await, vec![user("alice")]);
}

#[tokio::test]
async fn repeated_join_for_the_same_user_does_not_rebroadcast() {
	let mut h = Harness::new();
	let (mut alice, mut alice_rx) = h.open().await;

	alice.handle_event(join("alice")).await;
	let _ = expect_presence(&mut alice_rx).await;

	alice.handle_event(join("alice")).await;
	assert_eq!(*alice.state(), SessionState::Joined(user("alice")));
	assert_silent(&mut alice_rx).await;
}

#[tokio::test]
async fn join_with_a_different_identity_on_a_bound_session_is_dropped() {
	let mut h = Harness::new();
	let (mut alice, mut alice_rx) = h.open().await;

	alice.handle_event(join("alice")).await;
	let _ = expect_presence(&mut alice_rx).await;

	alice.handle_event(join("mallory")).await;
	assert_eq!(*alice.state(), SessionState::Joined(user("alice")));
	assert!(h.registry.lookup(&user("mallory")).await.is_none());
	assert_silent(&mut alice_rx).await;
}

#[tokio::test]
async fn chat_routes_on_bound_identity_not_the_wire_sender_field() {
	let mut h = Harness::new();
	let (mut alice, mut alice_rx) = h.open().await;
	let (mut bob, mut bob_rx) = h.open().await;

	alice.handle_event(join("alice")).await;
	bob.handle_event(join("bob")).await;
	for _ in 0..2 {
		let _ = expect_presence(&mut alice_rx).await;
		let _ = expect_presence(&mut bob_rx).await;
	}

	alice
		.handle_event(pb::envelope::Msg::SendMessage(pb::SendMessage {
			sender: "mallory".to_string(),
			receiver: "bob".to_string(),
			content: "hello".to_string(),
		}))
		.await;

	let to_bob = match recv_one(&mut bob_rx).await {
		pb::envelope::Msg::ReceiveMessage(m) => m,
		_ => panic!("expected ReceiveMessage"),
	};
	let echo = match recv_one(&mut alice_rx).await {
		pb::envelope::Msg::ReceiveMessage(m) => m,
		_ => panic!("expected ReceiveMessage echo"),
	};

	assert_eq!(to_bob.sender, "alice");
	assert_eq!(to_bob, echo);
	assert!(!to_bob.id.is_empty());
}

#[tokio::test]
async fn persisted_history_survives_sender_disconnect() {
	let mut h = Harness::new();
	let (mut alice, mut alice_rx) = h.open().await;

	alice.handle_event(join("alice")).await;
	let _ = expect_presence(&mut alice_rx).await;

	alice
		.handle_event(pb::envelope::Msg::SendMessage(pb::SendMessage {
			sender: String::new(),
			receiver: "bob".to_string(),
			content: "see you".to_string(),
		}))
		.await;
	alice.finish().await;

	let history = h.store.fetch_history(&user("alice"), &user("bob")).await.unwrap();
	assert_eq!(history.len(), 1);
	assert_eq!(history[0].content, "see you");
	assert_eq!(history[0].sender, user("alice"));
}

#[tokio::test]
async fn typing_goes_only_to_the_target() {
	let mut h = Harness::new();
	let (mut alice, mut alice_rx) = h.open().await;
	let (mut bob, mut bob_rx) = h.open().await;
	let (mut carol, mut carol_rx) = h.open().await;

	alice.handle_event(join("alice")).await;
	bob.handle_event(join("bob")).await;
	carol.handle_event(join("carol")).await;
	for _ in 0..3 {
		let _ = expect_presence(&mut alice_rx).await;
		let _ = expect_presence(&mut bob_rx).await;
		let _ = expect_presence(&mut carol_rx).await;
	}

	alice
		.handle_event(pb::envelope::Msg::Typing(pb::Typing {
			to: "bob".to_string(),
			from: String::new(),
		}))
		.await;

	match recv_one(&mut bob_rx).await {
		pb::envelope::Msg::PeerTyping(t) => assert_eq!(t.from, "alice"),
		_ => panic!("expected PeerTyping"),
	}
	assert_silent(&mut carol_rx).await;
	assert_silent(&mut alice_rx).await;
}

#[tokio::test]
async fn call_signaling_relays_between_the_pair() {
	let mut h = Harness::new();
	let (mut alice, mut alice_rx) = h.open().await;
	let (mut bob, mut bob_rx) = h.open().await;

	alice.handle_event(join("alice")).await;
	bob.handle_event(join("bob")).await;
	for _ in 0..2 {
		let _ = expect_presence(&mut alice_rx).await;
		let _ = expect_presence(&mut bob_rx).await;
	}

	alice
		.handle_event(pb::envelope::Msg::CallUser(pb::CallUser {
			to: "bob".to_string(),
			from: String::new(),
			signal: "offer-sdp".to_string(),
			call_type: "video".to_string(),
		}))
		.await;
	match recv_one(&mut bob_rx).await {
		pb::envelope::Msg::IncomingCall(c) => {
			assert_eq!(c.from, "alice");
			assert_eq!(c.signal, "offer-sdp");
			assert_eq!(c.call_type, "video");
		}
		_ => panic!("expected IncomingCall"),
	}

	bob.handle_event(pb::envelope::Msg::AnswerCall(pb::AnswerCall {
		to: "alice".to_string(),
		signal: "answer-sdp".to_string(),
	}))
	.await;
	match recv_one(&mut alice_rx).await {
		pb::envelope::Msg::CallAnswered(a) => assert_eq!(a.signal, "answer-sdp"),
		_ => panic!("expected CallAnswered"),
	}

	bob.handle_event(pb::envelope::Msg::IceCandidate(pb::IceCandidate {
		to: "alice".to_string(),
		candidate: "candidate:1".to_string(),
	}))
	.await;
	match recv_one(&mut alice_rx).await {
		pb::envelope::Msg::PeerIceCandidate(i) => assert_eq!(i.candidate, "candidate:1"),
		_ => panic!("expected PeerIceCandidate"),
	}

	alice
		.handle_event(pb::envelope::Msg::EndCall(pb::EndCall { to: "bob".to_string() }))
		.await;
	assert!(matches!(recv_one(&mut bob_rx).await, pb::envelope::Msg::CallEnded(_)));
}

#[tokio::test]
async fn finish_is_idempotent() {
	let mut h = Harness::new();
	let (mut alice, mut alice_rx) = h.open().await;

	alice.handle_event(join("alice")).await;
	let _ = expect_presence(&mut alice_rx).await;

	// The disconnecting connection is already off the roster, so its own
	// outbox sees no farewell broadcast.
	alice.finish().await;
	alice.finish().await;

	assert_eq!(*alice.state(), SessionState::Disconnected);
	assert_eq!(h.registry.session_count().await, 0);
	assert_silent(&mut alice_rx).await;
}

#[tokio::test]
async fn join_rejected_without_required_token() {
	let registry = Registry::new();
	let relay = EventRelay::new(registry.clone());
	let verifier = Arc::new(IdentityVerifier::new(Some(huddle_domain::SecretString::new("s3cret"))));
	let store: Arc<InMemoryMessageStore> = Arc::new(InMemoryMessageStore::default());

	let (tx, mut rx) = mpsc::channel(16);
	let handle = ConnHandle::new(1, tx);
	registry.attach(handle.clone()).await;
	let mut session = Session::new(1, handle, registry.clone(), relay, store, verifier);

	session.handle_event(join("alice")).await;
	assert_eq!(*session.state(), SessionState::Connecting);
	assert!(registry.lookup(&user("alice")).await.is_none());
	assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
}
