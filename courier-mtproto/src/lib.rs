//! MTProto session and message-codec layer.
//!
//! This crate covers:
//! * Message-id generation and the plaintext envelope ([`message`])
//! * The pre-auth session used while no key exists ([`session`])
//! * The encrypted MTProto 2.0 session ([`encrypted`])
//! * Sans-IO auth key generation ([`authentication`])
//!
//! Transport framing and the request multiplexer live one layer up; this
//! crate never touches a socket.

#![deny(unsafe_code)]

pub mod authentication;
pub mod encrypted;
pub mod message;
pub mod session;

pub use encrypted::{DecryptedMessage, EncryptedSession, MsgHeader, UnpackError};
pub use message::{MsgIdGen, PlainMessage};
pub use session::PlainSession;
