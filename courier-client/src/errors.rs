//! Error types shared by the sender, the pool, and the client surface.

use std::{fmt, io};

// ─── RpcError ────────────────────────────────────────────────────────────────

/// A structured error from the server's RPC layer.
///
/// Numeric suffixes are split off the name: `FLOOD_WAIT_30` becomes
/// `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name with any numeric suffix removed.
    pub name: String,
    /// The numeric suffix, if the name carried one.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(value) = self.value {
            write!(f, " (value: {value})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server error message like `"FLOOD_WAIT_30"`.
    pub fn from_wire(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(value) = suffix.parse::<u32>() {
                    return Self {
                        code,
                        name: message[..idx].to_string(),
                        value: Some(value),
                    };
                }
            }
        }
        Self {
            code,
            name: message.to_string(),
            value: None,
        }
    }

    /// Match the error name, with an optional `'*'` wildcard prefix/suffix.
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// True for the two flood-wait families the flood handler covers.
    pub fn is_flood_wait(&self) -> bool {
        self.name == "FLOOD_WAIT" || self.name == "FLOOD_PREMIUM_WAIT"
    }

    /// Seconds to wait, when this is a flood-wait error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.is_flood_wait() {
            self.value.map(u64::from)
        } else {
            None
        }
    }

    /// The target DC when this is a `*_MIGRATE_X` error.
    pub fn migrate_dc(&self) -> Option<i32> {
        if self.name.ends_with("_MIGRATE") {
            self.value.map(|v| v as i32)
        } else {
            None
        }
    }
}

// ─── InvocationError ─────────────────────────────────────────────────────────

/// The error type of every method that talks to a server.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// Network or I/O failure.
    Io(io::Error),
    /// Framing-level failure.
    Transport(crate::transport::TransportError),
    /// A reply or stored blob could not be decoded.
    Deserialize(String),
    /// `bad_msg_notification` with a code the sender does not absorb.
    BadMessage {
        /// The notification's error code.
        code: i32,
    },
    /// The request was abandoned because the sender shut down.
    Dropped,
    /// The auth key was declared invalid by the `-404` watchdog.
    AuthKeyInvalid,
    /// Key exchange failed.
    Handshake(courier_mtproto::authentication::Error),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Deserialize(s) => write!(f, "deserialize error: {s}"),
            Self::BadMessage { code } => write!(f, "bad_msg_notification (code {code})"),
            Self::Dropped => write!(f, "request dropped"),
            Self::AuthKeyInvalid => write!(f, "auth key invalid (code -404)"),
            Self::Handshake(e) => write!(f, "handshake failed: {e}"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<crate::transport::TransportError> for InvocationError {
    fn from(e: crate::transport::TransportError) -> Self {
        match e {
            crate::transport::TransportError::Io(io) => Self::Io(io),
            other => Self::Transport(other),
        }
    }
}

impl From<courier_tl::deserialize::Error> for InvocationError {
    fn from(e: courier_tl::deserialize::Error) -> Self {
        Self::Deserialize(e.to_string())
    }
}

impl From<courier_mtproto::authentication::Error> for InvocationError {
    fn from(e: courier_mtproto::authentication::Error) -> Self {
        Self::Handshake(e)
    }
}

impl InvocationError {
    /// True if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _ => false,
        }
    }

    /// Flood-wait duration in seconds, if applicable.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_numeric_suffix() {
        let err = RpcError::from_wire(420, "FLOOD_WAIT_30");
        assert_eq!(err.name, "FLOOD_WAIT");
        assert_eq!(err.value, Some(30));
        assert_eq!(err.flood_wait_seconds(), Some(30));
    }

    #[test]
    fn flood_wait_zero_still_counts() {
        let err = RpcError::from_wire(420, "FLOOD_WAIT_0");
        assert!(err.is_flood_wait());
        assert_eq!(err.flood_wait_seconds(), Some(0));
    }

    #[test]
    fn premium_flood_wait_recognized() {
        let err = RpcError::from_wire(420, "FLOOD_PREMIUM_WAIT_17");
        assert!(err.is_flood_wait());
        assert_eq!(err.flood_wait_seconds(), Some(17));
    }

    #[test]
    fn keeps_names_without_suffix() {
        let err = RpcError::from_wire(401, "AUTH_KEY_UNREGISTERED");
        assert_eq!(err.name, "AUTH_KEY_UNREGISTERED");
        assert_eq!(err.value, None);
        assert!(!err.is_flood_wait());
    }

    #[test]
    fn wildcard_matching() {
        let err = RpcError::from_wire(400, "PHONE_CODE_INVALID");
        assert!(err.is("PHONE_CODE_*"));
        assert!(err.is("*_INVALID"));
        assert!(!err.is("PHONE_CODE"));
    }

    #[test]
    fn migrate_errors_carry_target_dc() {
        let err = RpcError::from_wire(303, "USER_MIGRATE_5");
        assert_eq!(err.migrate_dc(), Some(5));
        let err = RpcError::from_wire(303, "FILE_MIGRATE_2");
        assert_eq!(err.migrate_dc(), Some(2));
        let err = RpcError::from_wire(420, "FLOOD_WAIT_5");
        assert_eq!(err.migrate_dc(), None);
    }
}
