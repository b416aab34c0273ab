//! # beacon-protocol
//!
//! Wire definitions for the Beacon realtime delivery layer.
//!
//! Everything that crosses a process boundary is an [`Envelope`]: a typed,
//! timestamped JSON object. Envelopes travel between server instances through
//! the broker and reach clients as server-sent-events frames.
//!
//! ## Envelope kinds
//!
//! - `connected` - First frame of every stream
//! - `ping` - Keep-alive
//! - `presence` - A user went online or offline
//! - `new_message` / `match` - Business events, opaque to this layer
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{channel, codec, Envelope};
//!
//! let envelope = Envelope::new("new_message").with_field("matchId", "m1");
//! let channel = channel::chat_room("m1");
//!
//! let frame = codec::encode(&envelope).unwrap();
//! assert!(frame.starts_with(b"data: "));
//! assert_eq!(channel, "chat-room:m1");
//! ```

pub mod channel;
pub mod codec;
pub mod envelope;

pub use channel::validate_channel_name;
pub use codec::{decode_from, encode, encode_into, ProtocolError};
pub use envelope::{kinds, now_millis, Envelope};
