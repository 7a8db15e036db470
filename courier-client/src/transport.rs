//! Stream framing: the three supported length-prefix modes, the mode
//! announcement, and the transport that drives them over a byte stream.
//!
//! | Mode | Announcement | Frame |
//! |------|--------------|-------|
//! | [`Mode::Abridged`] | `0xEF` | `len/4` in 1 byte, or `0x7F` + 3 LE bytes |
//! | [`Mode::Intermediate`] | `0xEE 0xEE 0xEE 0xEE` | 4-byte LE length + payload |
//! | [`Mode::Full`] | none | `[total_len][seq][payload][crc32]` |
//!
//! Frames of exactly four bytes are transport-level error codes (for
//! example `-404` when the server no longer knows the auth key) and are
//! surfaced as [`TransportError::Code`].

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Largest frame the reader will accept, as an abridged word count.
/// A wildly larger value means the stream has desynchronized.
const MAX_WORDS: usize = 0x20_0000; // 8 MiB

/// The framing scheme of one connection. Chosen once, immutable afterwards.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Mode {
    /// Smallest overhead; one announcement byte.
    #[default]
    Abridged,
    /// Plain 4-byte length prefix; four announcement bytes.
    Intermediate,
    /// Length + per-direction sequence number + CRC-32. No announcement.
    Full,
}

impl Mode {
    /// The bytes written exactly once, right after the stream opens.
    pub fn announcement(&self) -> &'static [u8] {
        match self {
            Mode::Abridged => &[0xef],
            Mode::Intermediate => &[0xee, 0xee, 0xee, 0xee],
            Mode::Full => &[],
        }
    }
}

/// Framing-level failures.
#[derive(Debug)]
pub enum TransportError {
    /// Underlying stream failure.
    Io(io::Error),
    /// The announcement did not match any supported mode.
    ModeNotSupported,
    /// The announcement started like Intermediate but did not complete it.
    AmbiguousModeAnnounce,
    /// Outbound payloads must be a multiple of four bytes.
    MisalignedPayload {
        /// The rejected payload length.
        len: usize,
    },
    /// CRC-32 verification failed on a Full-mode frame.
    CrcMismatch {
        /// CRC computed over the received bytes.
        got: u32,
        /// CRC carried by the frame.
        expected: u32,
    },
    /// A Full-mode frame arrived out of sequence.
    SequenceMismatch {
        /// Sequence number carried by the frame.
        got: u32,
        /// Sequence number the receiver expected.
        expected: u32,
    },
    /// A length field no real frame would carry.
    ImplausibleLength {
        /// The decoded byte length.
        len: usize,
    },
    /// The peer sent a 4-byte transport error code instead of a frame.
    Code(i32),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::ModeNotSupported => write!(f, "transport mode not supported"),
            Self::AmbiguousModeAnnounce => write!(f, "ambiguous mode announcement"),
            Self::MisalignedPayload { len } => {
                write!(f, "payload length {len} is not a multiple of 4")
            }
            Self::CrcMismatch { got, expected } => {
                write!(f, "crc mismatch: got {got:#010x}, expected {expected:#010x}")
            }
            Self::SequenceMismatch { got, expected } => {
                write!(f, "frame seq {got}, expected {expected}")
            }
            Self::ImplausibleLength { len } => write!(f, "implausible frame length {len}"),
            Self::Code(code) => write!(f, "transport error code {code}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl TransportError {
    /// True when the connection should be re-established.
    pub fn is_reconnect_trigger(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
            ),
            Self::CrcMismatch { .. } | Self::SequenceMismatch { .. } | Self::ImplausibleLength { .. } => true,
            _ => false,
        }
    }
}

// ─── Writer half ─────────────────────────────────────────────────────────────

/// Writes framed messages. Each frame is assembled in one buffer and written
/// with a single call, so concurrent writers never interleave partial frames.
pub struct FrameWriter<W> {
    stream: W,
    mode: Mode,
    seq: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    fn new(mode: Mode, stream: W) -> Self {
        Self { stream, mode, seq: 0 }
    }

    async fn announce(&mut self) -> io::Result<()> {
        let announcement = self.mode.announcement();
        if !announcement.is_empty() {
            self.stream.write_all(announcement).await?;
        }
        Ok(())
    }

    /// Frame and send one payload.
    pub async fn write_msg(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() % 4 != 0 {
            return Err(TransportError::MisalignedPayload { len: payload.len() });
        }
        let frame = match self.mode {
            Mode::Abridged => {
                let mut frame = abridged_length(payload.len() / 4);
                frame.reserve(payload.len());
                frame.extend_from_slice(payload);
                frame
            }
            Mode::Intermediate => {
                let mut frame = Vec::with_capacity(4 + payload.len());
                frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                frame.extend_from_slice(payload);
                frame
            }
            Mode::Full => {
                let total_len = (payload.len() + 12) as u32;
                let mut frame = Vec::with_capacity(total_len as usize);
                frame.extend_from_slice(&total_len.to_le_bytes());
                frame.extend_from_slice(&self.seq.to_le_bytes());
                frame.extend_from_slice(payload);
                let crc = crc32(&frame);
                frame.extend_from_slice(&crc.to_le_bytes());
                self.seq = self.seq.wrapping_add(1);
                frame
            }
        };
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Shut the write side down.
    pub async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

// ─── Reader half ─────────────────────────────────────────────────────────────

/// Reads framed messages; blocks until one complete frame is available.
pub struct FrameReader<R> {
    stream: R,
    mode: Mode,
    seq: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(mode: Mode, stream: R) -> Self {
        Self { stream, mode, seq: 0 }
    }

    /// Receive the next frame's payload.
    pub async fn read_msg(&mut self) -> Result<Vec<u8>, TransportError> {
        let payload = match self.mode {
            Mode::Abridged => {
                let mut first = [0u8; 1];
                self.stream.read_exact(&mut first).await?;
                let words = if first[0] < 0x7f {
                    first[0] as usize
                } else {
                    let mut ext = [0u8; 3];
                    self.stream.read_exact(&mut ext).await?;
                    ext[0] as usize | (ext[1] as usize) << 8 | (ext[2] as usize) << 16
                };
                if words > MAX_WORDS {
                    return Err(TransportError::ImplausibleLength { len: words * 4 });
                }
                let mut payload = vec![0u8; words * 4];
                self.stream.read_exact(&mut payload).await?;
                payload
            }
            Mode::Intermediate => {
                let mut len_bytes = [0u8; 4];
                self.stream.read_exact(&mut len_bytes).await?;
                let len = u32::from_le_bytes(len_bytes) as usize;
                if len > MAX_WORDS * 4 {
                    return Err(TransportError::ImplausibleLength { len });
                }
                let mut payload = vec![0u8; len];
                self.stream.read_exact(&mut payload).await?;
                payload
            }
            Mode::Full => {
                let mut len_bytes = [0u8; 4];
                self.stream.read_exact(&mut len_bytes).await?;
                let total_len = u32::from_le_bytes(len_bytes) as usize;
                if total_len < 12 || total_len > MAX_WORDS * 4 {
                    return Err(TransportError::ImplausibleLength { len: total_len });
                }
                let mut rest = vec![0u8; total_len - 4];
                self.stream.read_exact(&mut rest).await?;

                let (body, crc_bytes) = rest.split_at(rest.len() - 4);
                let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap());
                let mut covered = len_bytes.to_vec();
                covered.extend_from_slice(body);
                let got = crc32(&covered);
                if got != expected {
                    return Err(TransportError::CrcMismatch { got, expected });
                }

                let got_seq = u32::from_le_bytes(body[..4].try_into().unwrap());
                if got_seq != self.seq {
                    return Err(TransportError::SequenceMismatch {
                        got: got_seq,
                        expected: self.seq,
                    });
                }
                self.seq = self.seq.wrapping_add(1);
                body[4..].to_vec()
            }
        };

        // A bare 4-byte frame carries a transport error code, not a message.
        if payload.len() == 4 {
            return Err(TransportError::Code(i32::from_le_bytes(
                payload.try_into().unwrap(),
            )));
        }
        Ok(payload)
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// A framed full-duplex connection. Owns both halves until
/// [`Transport::into_split`] hands them to separate tasks.
///
/// The transport does not know about encryption; it moves opaque frames.
pub struct Transport<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Take ownership of `stream`, announce `mode`, and start framing.
    pub async fn start(mode: Mode, stream: S) -> Result<Self, TransportError> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = FrameWriter::new(mode, write_half);
        writer.announce().await?;
        Ok(Self {
            reader: FrameReader::new(mode, read_half),
            writer,
        })
    }

    /// Accept the peer side of a pre-established stream, inferring the mode
    /// from its announcement. Only Abridged and Intermediate announce
    /// themselves, so only those can be detected.
    pub async fn detect(stream: S) -> Result<Self, TransportError> {
        let (mut read_half, write_half) = tokio::io::split(stream);

        let mut first = [0u8; 1];
        read_half.read_exact(&mut first).await?;
        let mode = match first[0] {
            0xef => Mode::Abridged,
            0xee => {
                let mut rest = [0u8; 3];
                read_half.read_exact(&mut rest).await?;
                if rest != [0xee, 0xee, 0xee] {
                    return Err(TransportError::AmbiguousModeAnnounce);
                }
                Mode::Intermediate
            }
            _ => return Err(TransportError::ModeNotSupported),
        };

        Ok(Self {
            reader: FrameReader::new(mode, read_half),
            writer: FrameWriter::new(mode, write_half),
        })
    }

    /// The active framing mode.
    pub fn mode(&self) -> Mode {
        self.reader.mode
    }

    /// Frame and send one payload.
    pub async fn write_msg(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.writer.write_msg(payload).await
    }

    /// Receive the next frame's payload.
    pub async fn read_msg(&mut self) -> Result<Vec<u8>, TransportError> {
        self.reader.read_msg().await
    }

    /// Split into independently owned halves for the reader task and the
    /// writers. Each half keeps its own Full-mode sequence counter.
    pub fn into_split(self) -> (FrameReader<ReadHalf<S>>, FrameWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }

    /// Shut the connection down.
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.close().await
    }
}

// Abridged length prefix: `len/4` in one byte below 127, otherwise the
// `0x7F` marker plus three little-endian bytes of the word count.
fn abridged_length(words: usize) -> Vec<u8> {
    if words < 0x7f {
        vec![words as u8]
    } else {
        vec![
            0x7f,
            (words & 0xff) as u8,
            ((words >> 8) & 0xff) as u8,
            ((words >> 16) & 0xff) as u8,
        ]
    }
}

// ─── CRC-32 (IEEE 802.3) ─────────────────────────────────────────────────────

fn crc32(data: &[u8]) -> u32 {
    const POLY: u32 = 0xedb88320;
    let mut crc: u32 = 0xffffffff;
    for &byte in data {
        let mut b = byte as u32;
        for _ in 0..8 {
            let mix = (crc ^ b) & 1;
            crc >>= 1;
            if mix != 0 {
                crc ^= POLY;
            }
            b >>= 1;
        }
    }
    crc ^ 0xffffffff
}
