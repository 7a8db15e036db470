//! TL binary serialization runtime plus the hand-written MTProto service
//! schema used by the transport core.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`serialize`] / [`deserialize`] | The `Serializable` / `Deserializable` traits and primitive impls |
//! | [`mtproto`] | Key-exchange constructors and transport service messages |
//! | [`api`] | `initConnection`, `help.getConfig`, `auth.exportAuthorization` and friends |
//!
//! Schema code generation is deliberately absent here: the transport core
//! only speaks the small, stable service vocabulary, and the full API layer
//! is someone else's schema.

#![deny(unsafe_code)]

pub mod api;
pub mod deserialize;
pub mod mtproto;
pub mod serialize;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// The API layer announced in `invokeWithLayer`.
pub const LAYER: i32 = 181;

/// A bare `vector` — count plus items, without the boxed `Vector`
/// constructor prefix.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);

/// An opaque TL object kept as raw bytes; used where the response type
/// belongs to a schema this crate does not model.
#[derive(Clone, Debug, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

/// Every schema type has a 32-bit constructor ID.
pub trait Identifiable {
    /// The constructor ID from the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// A function type that can be sent as an RPC call; `Return` is what the
/// server answers with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}
