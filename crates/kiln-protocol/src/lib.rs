//! kiln-protocol: RESP2 wire protocol implementation.
//!
//! Provides buffered parsing and direct-to-buffer serialization of the
//! RESP2 protocol used for client-server communication, the AOF log,
//! and leader forwarding.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use kiln_protocol::{Frame, parse_frame};
//!
//! let input = b"+OK\r\n";
//! let (frame, consumed) = parse_frame(input).unwrap().unwrap();
//! assert_eq!(frame, Frame::Simple("OK".into()));
//!
//! let mut buf = BytesMut::new();
//! frame.serialize(&mut buf);
//! assert_eq!(&buf[..], b"+OK\r\n");
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::parse_frame;
pub use serialize::encode_command;
pub use types::Frame;
