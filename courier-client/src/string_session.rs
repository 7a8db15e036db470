//! Portable one-line session form: the persisted fields plus the DC id,
//! packed into a URL-safe base64 string.

use std::io;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::session::Session;

const VERSION: u8 = 1;

/// A session expressed as a copy-pasteable string.
#[derive(Clone, Debug, PartialEq)]
pub struct StringSession {
    pub dc_id: i32,
    pub host: String,
    pub port: u16,
    pub auth_key: [u8; 256],
    pub auth_key_hash: [u8; 8],
    pub app_id: i32,
}

impl StringSession {
    /// Build from a persisted [`Session`] plus its DC id. The session host
    /// is `host:port`; a missing port falls back to 443.
    pub fn from_session(session: &Session, dc_id: i32) -> Self {
        let (host, port) = match session.host.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(443)),
            None => (session.host.clone(), 443),
        };
        Self {
            dc_id,
            host,
            port,
            auth_key: session.auth_key,
            auth_key_hash: session.auth_key_hash,
            app_id: session.app_id,
        }
    }

    /// The persisted-session view of this string session.
    pub fn into_session(self) -> Session {
        Session {
            auth_key: self.auth_key,
            auth_key_hash: self.auth_key_hash,
            salt: 0,
            host: format!("{}:{}", self.host, self.port),
            app_id: self.app_id,
        }
    }

    /// Pack into the string form.
    pub fn encode(&self) -> String {
        let host = self.host.as_bytes();
        let mut buf = Vec::with_capacity(1 + 4 + 4 + 2 + 1 + host.len() + 256 + 8);
        buf.push(VERSION);
        buf.extend_from_slice(&self.dc_id.to_le_bytes());
        buf.extend_from_slice(&self.app_id.to_le_bytes());
        buf.extend_from_slice(&self.port.to_le_bytes());
        buf.push(host.len() as u8);
        buf.extend_from_slice(host);
        buf.extend_from_slice(&self.auth_key);
        buf.extend_from_slice(&self.auth_key_hash);
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Unpack from the string form.
    pub fn decode(encoded: &str) -> io::Result<Self> {
        let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_string());
        let buf = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| invalid("string session is not valid base64"))?;

        let mut pos = 0usize;
        macro_rules! take {
            ($n:expr) => {{
                if pos + $n > buf.len() {
                    return Err(invalid("string session truncated"));
                }
                let slice = &buf[pos..pos + $n];
                pos += $n;
                slice
            }};
        }

        if take!(1)[0] != VERSION {
            return Err(invalid("unknown string session version"));
        }
        let dc_id = i32::from_le_bytes(take!(4).try_into().unwrap());
        let app_id = i32::from_le_bytes(take!(4).try_into().unwrap());
        let port = u16::from_le_bytes(take!(2).try_into().unwrap());
        let host_len = take!(1)[0] as usize;
        let host = String::from_utf8(take!(host_len).to_vec())
            .map_err(|_| invalid("string session host not utf-8"))?;
        let mut auth_key = [0u8; 256];
        auth_key.copy_from_slice(take!(256));
        let mut auth_key_hash = [0u8; 8];
        auth_key_hash.copy_from_slice(take!(8));

        Ok(Self {
            dc_id,
            host,
            port,
            auth_key,
            auth_key_hash,
            app_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StringSession {
        let mut auth_key = [0u8; 256];
        auth_key.iter_mut().enumerate().for_each(|(i, x)| *x = (i * 3) as u8);
        StringSession {
            dc_id: 4,
            host: "149.154.167.91".into(),
            port: 443,
            auth_key,
            auth_key_hash: [1, 2, 3, 4, 5, 6, 7, 8],
            app_id: 987654,
        }
    }

    #[test]
    fn roundtrip_is_fieldwise_identical() {
        let original = sample();
        let decoded = StringSession::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn encoded_form_is_url_safe() {
        let encoded = sample().encode();
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(StringSession::decode("!!!not-base64!!!").is_err());
        assert!(StringSession::decode("aGVsbG8").is_err()); // too short
    }

    #[test]
    fn session_conversion_keeps_fields() {
        let string_session = sample();
        let session = string_session.clone().into_session();
        assert_eq!(session.host, "149.154.167.91:443");
        assert_eq!(session.app_id, 987654);
        let back = StringSession::from_session(&session, 4);
        assert_eq!(back, string_session);
    }
}
