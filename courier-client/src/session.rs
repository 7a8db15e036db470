//! Session persistence: the five fields a client must keep across restarts,
//! and the stores that hold them.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use courier_crypto::sha1;

/// Everything a client needs to resume without a new key exchange.
#[derive(Clone, PartialEq)]
pub struct Session {
    /// The 256-byte authorization key.
    pub auth_key: [u8; 256],
    /// SHA-1 bytes 12..20 of the key; the wire-visible key id.
    pub auth_key_hash: [u8; 8],
    /// Current server salt. Rotated by the server over the session's life.
    pub salt: i64,
    /// `host:port` of the data center the key belongs to.
    pub host: String,
    /// The application id bound to this credential.
    pub app_id: i32,
}

impl Session {
    /// Assemble a session, deriving the key hash.
    pub fn new(auth_key: [u8; 256], salt: i64, host: String, app_id: i32) -> Self {
        let digest = sha1!(&auth_key);
        let mut auth_key_hash = [0u8; 8];
        auth_key_hash.copy_from_slice(&digest[12..20]);
        Self {
            auth_key,
            auth_key_hash,
            salt,
            host,
            app_id,
        }
    }

    const VERSION: u8 = 1;

    pub(crate) fn encode(&self) -> Vec<u8> {
        let host = self.host.as_bytes();
        let mut out = Vec::with_capacity(1 + 256 + 8 + 8 + 4 + 1 + host.len());
        out.push(Self::VERSION);
        out.extend_from_slice(&self.auth_key);
        out.extend_from_slice(&self.auth_key_hash);
        out.extend_from_slice(&self.salt.to_le_bytes());
        out.extend_from_slice(&self.app_id.to_le_bytes());
        out.push(host.len() as u8);
        out.extend_from_slice(host);
        out
    }

    pub(crate) fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut pos = 0usize;
        macro_rules! take {
            ($n:expr) => {{
                if pos + $n > buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "truncated session data",
                    ));
                }
                let slice = &buf[pos..pos + $n];
                pos += $n;
                slice
            }};
        }
        if take!(1)[0] != Self::VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown session format version",
            ));
        }
        let mut auth_key = [0u8; 256];
        auth_key.copy_from_slice(take!(256));
        let mut auth_key_hash = [0u8; 8];
        auth_key_hash.copy_from_slice(take!(8));
        let salt = i64::from_le_bytes(take!(8).try_into().unwrap());
        let app_id = i32::from_le_bytes(take!(4).try_into().unwrap());
        let host_len = take!(1)[0] as usize;
        let host = String::from_utf8(take!(host_len).to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "session host not utf-8"))?;
        Ok(Self {
            auth_key,
            auth_key_hash,
            salt,
            host,
            app_id,
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The key itself stays out of logs.
        f.debug_struct("Session")
            .field("auth_key_hash", &self.auth_key_hash)
            .field("salt", &self.salt)
            .field("host", &self.host)
            .field("app_id", &self.app_id)
            .finish()
    }
}

// ─── Store trait ─────────────────────────────────────────────────────────────

/// Where sessions are kept between runs.
pub trait SessionStore: Send + Sync {
    /// Load the stored session. `Ok(None)` means "no session yet";
    /// an `Err` means the data exists but cannot be read.
    fn load(&self) -> io::Result<Option<Session>>;

    /// Persist `session`.
    fn save(&self, session: &Session) -> io::Result<()>;

    /// Forget the stored session.
    fn delete(&self) -> io::Result<()>;

    /// The backing file, when there is one.
    fn path(&self) -> Option<&Path>;
}

// ─── File store ──────────────────────────────────────────────────────────────

/// Compact binary file storage; the default.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionStore for FileStore {
    fn load(&self) -> io::Result<Option<Session>> {
        let buf = match std::fs::read(&self.path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Session::decode(&buf).map(Some)
    }

    fn save(&self, session: &Session) -> io::Result<()> {
        std::fs::write(&self.path, session.encode()).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                let dir = self.path.parent().unwrap_or(Path::new("."));
                io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("no write permission in {}", dir.display()),
                )
            } else {
                e
            }
        })
    }

    fn delete(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

// ─── Memory store ────────────────────────────────────────────────────────────

/// Keeps the session only for the life of the process.
#[derive(Default)]
pub struct MemoryStore {
    slot: Mutex<Option<Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self) -> io::Result<Option<Session>> {
        Ok(self.slot.lock().unwrap().clone())
    }

    fn save(&self, session: &Session) -> io::Result<()> {
        *self.slot.lock().unwrap() = Some(session.clone());
        Ok(())
    }

    fn delete(&self) -> io::Result<()> {
        *self.slot.lock().unwrap() = None;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}
