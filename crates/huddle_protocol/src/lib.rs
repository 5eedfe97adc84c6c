#![forbid(unsafe_code)]

pub mod framing;
pub mod pb;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, try_decode_frame_from_buffer};

/// Protocol version constants.
pub mod version {
	/// Current protocol version, written into `pb::Envelope.version`.
	pub const PROTOCOL_VERSION: u32 = 1;
}
