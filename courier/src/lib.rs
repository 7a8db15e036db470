//! # courier — MTProto transport and session core
//!
//! `courier` carries typed remote-procedure calls and server-pushed objects
//! between a client process and a cluster of data centers, over long-lived
//! framed streams under MTProto 2.0 encryption. The work is split across
//! four focused sub-crates wired together here:
//!
//! | Sub-crate | Role |
//! |-----------|------|
//! | `courier-crypto` | AES-IGE, SHA, RSA, factorization, `AuthKey`, MTProto 2.0 sealing |
//! | `courier-tl` | TL runtime plus the hand-written service schema |
//! | `courier-mtproto` | Message codec, session counters, key exchange |
//! | `courier-client` | Transport framing, RPC multiplexer, supervision, sender pool |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use courier::{Client, Config};
//!
//! # async fn run() -> Result<(), courier::InvocationError> {
//! let client = Client::connect(Config {
//!     app_id: 12345,
//!     ..Default::default()
//! })
//! .await?;
//!
//! println!("connected to DC{} ({:?} rtt)", client.dc_id(), client.ping().await?);
//!
//! // Parallel transfers borrow extra senders on the media DC.
//! let workers = client.borrow_senders(client.dc_id(), 4).await?;
//! for (worker, range) in workers.iter().zip(courier::partition(512, workers.len())) {
//!     // issue upload/download RPCs for `range` over `worker` ...
//!     let _ = (worker, range);
//! }
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

/// Re-export of [`courier_tl`] — the TL runtime and service schema.
pub use courier_tl as tl;

/// Re-export of [`courier_mtproto`] — codec, sessions, and key exchange.
pub use courier_mtproto as mtproto;

/// Re-export of [`courier_crypto`] — the cryptographic primitives.
pub use courier_crypto as crypto;

/// Re-export of [`courier_client`] — connections, multiplexing, pooling.
pub use courier_client as client;

// ─── Convenience re-exports ──────────────────────────────────────────────────

pub use courier_client::{
    partition, Client, ClockSource, Config, FileStore, InvocationError, MemoryStore, Mode,
    RpcError, Sender, Session, SessionStore, Socks5Config, StringSession, UpdateStream,
};
pub use courier_crypto::AuthKey;
pub use courier_mtproto::authentication::{self, finish, step1, step2, step3, Finished};
pub use courier_mtproto::{EncryptedSession, PlainSession};
pub use courier_tl::{Deserializable, Identifiable, RemoteCall, Serializable, LAYER};
