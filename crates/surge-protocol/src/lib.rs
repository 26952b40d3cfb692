//! # surge-protocol
//!
//! Wire encodings for messages broadcast by the Surge hub.
//!
//! Every broadcast message travels as an [`Envelope`]. Clients pick one of
//! two encodings when they connect:
//!
//! - `json` - one JSON object per WebSocket text frame
//! - `msgpack` - length-prefixed MessagePack in WebSocket binary frames
//!
//! ## Example
//!
//! ```rust
//! use surge_protocol::{codec, Encoded, Envelope, WireFormat};
//!
//! let envelope = Envelope::new(b"cpu=93".to_vec()).with_kind("metric");
//!
//! let encoded = codec::encode_as(WireFormat::MsgPack, &envelope).unwrap();
//! if let Encoded::Binary(bytes) = encoded {
//!     let decoded = codec::decode(&bytes).unwrap();
//!     assert_eq!(decoded, envelope);
//! }
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, encode_as, Encoded, ProtocolError, WireFormat};
pub use envelope::{Envelope, Payload};
