//! Plaintext session state, used only while a connection has no auth key.

use courier_tl::Serializable;

use crate::message::{MsgIdGen, PlainMessage};

/// Allocates message ids for the unencrypted phase of a connection and packs
/// requests into the plaintext envelope. Cheap to create, discarded once the
/// handshake finishes.
pub struct PlainSession {
    msg_ids: MsgIdGen,
    time_offset: i32,
}

impl PlainSession {
    pub fn new() -> Self {
        Self {
            msg_ids: MsgIdGen::new(),
            time_offset: 0,
        }
    }

    /// Serialize `call` into a plaintext envelope with a fresh message id.
    pub fn pack<S: Serializable>(&mut self, call: &S) -> PlainMessage {
        PlainMessage {
            msg_id: self.msg_ids.next(self.time_offset),
            body: call.to_bytes(),
        }
    }
}

impl Default for PlainSession {
    fn default() -> Self {
        Self::new()
    }
}
