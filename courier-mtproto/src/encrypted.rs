//! The encrypted MTProto 2.0 session: inner headers, sequence numbers, and
//! the seal/open pair around [`courier_crypto::encrypt_data_v2`].

use courier_crypto::{AuthKey, DecryptError, DequeBuffer};

use crate::message::MsgIdGen;

/// Inner-header length: salt + session_id + msg_id + seq_no + len.
const INNER_HEADER: usize = 8 + 8 + 8 + 4 + 4;

/// Why an inbound frame could not be opened.
#[derive(Debug)]
pub enum UnpackError {
    /// The crypto layer rejected the envelope.
    Crypto(DecryptError),
    /// The plaintext was shorter than the inner header.
    FrameTooShort,
    /// The inner `session_id` does not belong to this session.
    SessionMismatch,
}

impl std::fmt::Display for UnpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::FrameTooShort => write!(f, "inner plaintext too short"),
            Self::SessionMismatch => write!(f, "session_id mismatch"),
        }
    }
}

impl std::error::Error for UnpackError {}

impl From<DecryptError> for UnpackError {
    fn from(e: DecryptError) -> Self {
        Self::Crypto(e)
    }
}

/// The fields stamped into one outbound message's inner header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MsgHeader {
    pub salt: i64,
    pub session_id: i64,
    pub msg_id: i64,
    pub seq_no: i32,
}

/// A fully decrypted inbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedMessage {
    pub salt: i64,
    pub session_id: i64,
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// Per-connection encrypted session state: the auth key, the random session
/// id announced inside every inner header, the server salt, the clock
/// offset, and the msg-id / seq-no counters.
///
/// Header allocation ([`EncryptedSession::next_header`]) is separated from
/// sealing ([`EncryptedSession::seal`]) so a caller can hold its lock only
/// across the counter update and encrypt outside of it.
pub struct EncryptedSession {
    auth_key: AuthKey,
    session_id: i64,
    salt: i64,
    time_offset: i32,
    msg_ids: MsgIdGen,
    sequence: i32,
}

impl EncryptedSession {
    /// Start a session over `auth_key` with a freshly random session id.
    pub fn new(auth_key: [u8; 256], salt: i64, time_offset: i32) -> Self {
        let mut rnd = [0u8; 8];
        courier_crypto::random_bytes(&mut rnd);
        Self::with_session_id(auth_key, salt, time_offset, i64::from_le_bytes(rnd))
    }

    /// Start a session with an explicit session id.
    pub fn with_session_id(
        auth_key: [u8; 256],
        salt: i64,
        time_offset: i32,
        session_id: i64,
    ) -> Self {
        Self {
            auth_key: AuthKey::from_bytes(auth_key),
            session_id,
            salt,
            time_offset,
            msg_ids: MsgIdGen::new(),
            sequence: 0,
        }
    }

    pub fn auth_key(&self) -> &AuthKey {
        &self.auth_key
    }

    pub fn auth_key_bytes(&self) -> [u8; 256] {
        self.auth_key.to_bytes()
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn salt(&self) -> i64 {
        self.salt
    }

    /// Adopt a server-issued salt (BadServerSalt / NewSessionCreated).
    pub fn set_salt(&mut self, salt: i64) {
        self.salt = salt;
    }

    pub fn time_offset(&self) -> i32 {
        self.time_offset
    }

    pub fn set_time_offset(&mut self, offset: i32) {
        self.time_offset = offset;
    }

    /// The last message id this session issued.
    pub fn last_msg_id(&self) -> i64 {
        self.msg_ids.last()
    }

    /// Allocate the inner header for the next outbound message.
    ///
    /// Content-bearing messages take an odd sequence number and advance the
    /// counter; service messages (acks, pings) take the current even value
    /// and leave it alone.
    pub fn next_header(&mut self, content_related: bool) -> MsgHeader {
        let seq_no = if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence += 1;
            n
        } else {
            self.sequence * 2
        };
        MsgHeader {
            salt: self.salt,
            session_id: self.session_id,
            msg_id: self.msg_ids.next(self.time_offset),
            seq_no,
        }
    }

    /// Build the inner plaintext for `header` + `body` and encrypt it into a
    /// wire-ready envelope. Pure with respect to session state.
    pub fn seal(auth_key: &AuthKey, header: &MsgHeader, body: &[u8]) -> Vec<u8> {
        let mut buf = DequeBuffer::with_capacity(INNER_HEADER + body.len(), 32);
        buf.extend(header.salt.to_le_bytes());
        buf.extend(header.session_id.to_le_bytes());
        buf.extend(header.msg_id.to_le_bytes());
        buf.extend(header.seq_no.to_le_bytes());
        buf.extend((body.len() as u32).to_le_bytes());
        buf.extend(body.iter().copied());
        courier_crypto::encrypt_data_v2(&mut buf, auth_key);
        buf.into_vec()
    }

    /// Convenience: allocate a header and seal in one call. Returns the
    /// envelope and the message id it carries.
    pub fn pack(&mut self, content_related: bool, body: &[u8]) -> (Vec<u8>, i64) {
        let header = self.next_header(content_related);
        (Self::seal(&self.auth_key, &header, body), header.msg_id)
    }

    /// Decrypt a server frame without touching session counters, so a reader
    /// task can run against a clone of the key while writers keep the
    /// session locked only for header allocation.
    pub fn open(
        auth_key: &AuthKey,
        session_id: i64,
        frame: &mut [u8],
    ) -> Result<DecryptedMessage, UnpackError> {
        let plaintext = courier_crypto::decrypt_data_v2(frame, auth_key)?;
        parse_inner(plaintext, Some(session_id))
    }

    /// Decrypt a server frame against this session.
    pub fn unpack(&self, frame: &mut [u8]) -> Result<DecryptedMessage, UnpackError> {
        Self::open(&self.auth_key, self.session_id, frame)
    }
}

fn parse_inner(
    plaintext: &[u8],
    expect_session: Option<i64>,
) -> Result<DecryptedMessage, UnpackError> {
    if plaintext.len() < INNER_HEADER {
        return Err(UnpackError::FrameTooShort);
    }
    let salt = i64::from_le_bytes(plaintext[..8].try_into().unwrap());
    let session_id = i64::from_le_bytes(plaintext[8..16].try_into().unwrap());
    let msg_id = i64::from_le_bytes(plaintext[16..24].try_into().unwrap());
    let seq_no = i32::from_le_bytes(plaintext[24..28].try_into().unwrap());
    let body_len = u32::from_le_bytes(plaintext[28..32].try_into().unwrap()) as usize;

    if let Some(expected) = expect_session {
        if session_id != expected {
            return Err(UnpackError::SessionMismatch);
        }
    }

    let available = plaintext.len() - INNER_HEADER;
    let body = plaintext[INNER_HEADER..INNER_HEADER + body_len.min(available)].to_vec();

    Ok(DecryptedMessage {
        salt,
        session_id,
        msg_id,
        seq_no,
        body,
    })
}
