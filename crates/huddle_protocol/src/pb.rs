#![forbid(unsafe_code)]

//! Wire messages for the `huddle.v1` relay protocol.
//!
//! Tags 10..=17 are client-to-server events, 30..=37 server-to-client.
//! The `sender`/`from` fields on inbound events exist for wire compatibility;
//! the server routes on the identity bound at join, not on these fields.

/// Top-level frame payload carrying exactly one protocol message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	#[prost(uint32, tag = "1")]
	pub version: u32,

	#[prost(oneof = "envelope::Msg", tags = "10, 11, 12, 13, 14, 15, 16, 17, 30, 31, 32, 33, 34, 35, 36, 37")]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	/// The protocol message carried by an [`Envelope`](super::Envelope).
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Join(super::Join),
		#[prost(message, tag = "11")]
		SendMessage(super::SendMessage),
		#[prost(message, tag = "12")]
		Typing(super::Typing),
		#[prost(message, tag = "13")]
		StopTyping(super::StopTyping),
		#[prost(message, tag = "14")]
		CallUser(super::CallUser),
		#[prost(message, tag = "15")]
		AnswerCall(super::AnswerCall),
		#[prost(message, tag = "16")]
		IceCandidate(super::IceCandidate),
		#[prost(message, tag = "17")]
		EndCall(super::EndCall),

		#[prost(message, tag = "30")]
		OnlineUsers(super::OnlineUsers),
		#[prost(message, tag = "31")]
		ReceiveMessage(super::ReceiveMessage),
		#[prost(message, tag = "32")]
		PeerTyping(super::PeerTyping),
		#[prost(message, tag = "33")]
		PeerStopTyping(super::PeerStopTyping),
		#[prost(message, tag = "34")]
		IncomingCall(super::IncomingCall),
		#[prost(message, tag = "35")]
		CallAnswered(super::CallAnswered),
		#[prost(message, tag = "36")]
		PeerIceCandidate(super::PeerIceCandidate),
		#[prost(message, tag = "37")]
		CallEnded(super::CallEnded),
	}
}

/// Bind an identity to this connection. First (and only) valid event on a
/// fresh connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
	#[prost(string, tag = "1")]
	pub user_id: ::prost::alloc::string::String,
	/// Optional stateless auth token proving ownership of `user_id`.
	#[prost(string, tag = "2")]
	pub auth_token: ::prost::alloc::string::String,
}

/// Send a chat message to `receiver`; persisted before relay.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(string, tag = "1")]
	pub sender: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub receiver: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub content: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Typing {
	#[prost(string, tag = "1")]
	pub to: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub from: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopTyping {
	#[prost(string, tag = "1")]
	pub to: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub from: ::prost::alloc::string::String,
}

/// WebRTC call offer toward `to`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallUser {
	#[prost(string, tag = "1")]
	pub to: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub from: ::prost::alloc::string::String,
	/// Opaque SDP offer blob; the server never inspects it.
	#[prost(string, tag = "3")]
	pub signal: ::prost::alloc::string::String,
	/// Call media kind (e.g. "video", "audio").
	#[prost(string, tag = "4")]
	pub call_type: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnswerCall {
	#[prost(string, tag = "1")]
	pub to: ::prost::alloc::string::String,
	/// Opaque SDP answer blob.
	#[prost(string, tag = "2")]
	pub signal: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IceCandidate {
	#[prost(string, tag = "1")]
	pub to: ::prost::alloc::string::String,
	/// Opaque ICE candidate blob.
	#[prost(string, tag = "2")]
	pub candidate: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EndCall {
	#[prost(string, tag = "1")]
	pub to: ::prost::alloc::string::String,
}

/// Full presence snapshot, broadcast to every connection on join/disconnect.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OnlineUsers {
	#[prost(string, repeated, tag = "1")]
	pub users: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Canonical persisted chat message, delivered to receiver and echoed to the
/// sender so both observe the server-assigned id and timestamp.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReceiveMessage {
	#[prost(string, tag = "1")]
	pub id: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub sender: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub receiver: ::prost::alloc::string::String,
	#[prost(string, tag = "4")]
	pub content: ::prost::alloc::string::String,
	#[prost(int64, tag = "5")]
	pub timestamp_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerTyping {
	#[prost(string, tag = "1")]
	pub from: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerStopTyping {
	#[prost(string, tag = "1")]
	pub from: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IncomingCall {
	#[prost(string, tag = "1")]
	pub from: ::prost::alloc::string::String,
	#[prost(string, tag = "2")]
	pub signal: ::prost::alloc::string::String,
	#[prost(string, tag = "3")]
	pub call_type: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallAnswered {
	#[prost(string, tag = "1")]
	pub signal: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerIceCandidate {
	#[prost(string, tag = "1")]
	pub candidate: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallEnded {}
