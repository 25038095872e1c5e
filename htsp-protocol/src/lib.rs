//! HTSP protocol definitions.
//!
//! This crate defines the self-describing binary message format spoken by
//! the live-TV backend over its HTSP port, and the types the client derives
//! from it.
//!
//! # Frame Format
//!
//! ```text
//! +----------+------------------------------------+
//! | Length   |  Body (field entries)              |
//! | u32 BE   |  (variable)                        |
//! +----------+------------------------------------+
//! | 4 bytes  |  Length bytes                      |
//! ```
//!
//! # Example
//!
//! ```rust
//! use htsp_protocol::{decode_message, encode_message, Message};
//!
//! let msg = Message::request("hello")
//!     .field("clientname", "htsp-probe")
//!     .field("htspversion", htsp_protocol::HTSP_VERSION)
//!     .build();
//! let encoded = encode_message(&msg).unwrap();
//!
//! let decoded = decode_message(&encoded).unwrap();
//! assert_eq!(decoded.method(), Some("hello"));
//! ```

pub mod codec;
pub mod error;
pub mod message;
pub mod types;

pub use codec::{decode_body, decode_frame_length, decode_message, encode_message};
pub use error::{ClientError, ProtocolError};
pub use message::{Field, Message, MessageBuilder};
pub use types::{
    channel_field, method, ChannelInfo, ChannelType, PushEvent, DEFAULT_HTSP_PORT, HTSP_VERSION,
    LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
};
