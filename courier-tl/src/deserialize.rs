//! Reading values back out of TL binary form.
//!
//! [`Cursor`] walks a borrowed byte slice by splitting consumed prefixes
//! off its head. Only two things can go wrong while decoding: the input
//! runs dry, or a constructor id belongs to some other type.

use std::fmt;

use crate::serialize::{BOOL_FALSE, BOOL_TRUE, VECTOR};

/// Decoding failures.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The input ended mid-value.
    UnexpectedEof,
    /// A constructor id that does not belong to the expected type.
    UnexpectedConstructor {
        /// The offending id.
        id: u32,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::UnexpectedConstructor { id } => {
                write!(f, "unexpected constructor id: {id:#010x}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result with the decoding [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A reader over a borrowed byte slice.
///
/// Internally the cursor keeps the unread tail and a count of consumed
/// bytes; every read splits some prefix off the tail.
pub struct Cursor<'a> {
    head: &'a [u8],
    consumed: usize,
}

impl<'a> Cursor<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self {
            head: buf,
            consumed: 0,
        }
    }

    /// How many bytes have been read so far.
    pub fn pos(&self) -> usize {
        self.consumed
    }

    /// How many bytes are left.
    pub fn remaining(&self) -> usize {
        self.head.len()
    }

    /// Split `n` bytes off the unread tail.
    fn advance(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.head.len() {
            return Err(Error::UnexpectedEof);
        }
        let (taken, tail) = self.head.split_at(n);
        self.head = tail;
        self.consumed += n;
        Ok(taken)
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        self.advance(1).map(|taken| taken[0])
    }

    /// Fill `out` exactly.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.advance(out.len())?);
        Ok(())
    }

    /// Take `n` bytes as an owned vector.
    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        self.advance(n).map(<[u8]>::to_vec)
    }

    /// Consume everything that is left.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let tail = std::mem::take(&mut self.head);
        self.consumed += tail.len();
        tail.to_vec()
    }
}

/// Shorthand used by the schema impls.
pub type Buffer<'a, 'b> = &'a mut Cursor<'b>;

/// Deserialize a value from TL binary form.
pub trait Deserializable: Sized {
    /// Read `Self` from `buf`, advancing its position.
    fn deserialize(buf: Buffer) -> Result<Self>;

    /// Deserialize from a byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::from_slice(bytes);
        Self::deserialize(&mut cursor)
    }
}

// Plain little-endian scalars.
macro_rules! deserialize_le {
    ($($ty:ty => $n:literal),+) => {$(
        impl Deserializable for $ty {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let mut raw = [0u8; $n];
                buf.read_exact(&mut raw)?;
                Ok(<$ty>::from_le_bytes(raw))
            }
        }
    )+};
}

deserialize_le!(i32 => 4, u32 => 4, i64 => 8, f64 => 8);

// int128 / int256 nonces, raw.
macro_rules! deserialize_raw_array {
    ($($n:literal),+) => {$(
        impl Deserializable for [u8; $n] {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let mut raw = [0u8; $n];
                buf.read_exact(&mut raw)?;
                Ok(raw)
            }
        }
    )+};
}

deserialize_raw_array!(16, 32);

impl Deserializable for bool {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            BOOL_TRUE => Ok(true),
            BOOL_FALSE => Ok(false),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

impl Deserializable for Vec<u8> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let (len, header) = match buf.read_byte()? {
            0xfe => {
                let mut ext = [0u8; 3];
                buf.read_exact(&mut ext)?;
                let len = ext[0] as usize | (ext[1] as usize) << 8 | (ext[2] as usize) << 16;
                (len, 4usize)
            }
            short => (short as usize, 1usize),
        };
        let data = buf.read_vec(len)?;
        // Discard the zero bytes up to the next 4-byte boundary.
        buf.advance(3 - (header + len + 3) % 4)?;
        Ok(data)
    }
}

impl Deserializable for String {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let raw = Vec::<u8>::deserialize(buf)?;
        String::from_utf8(raw).map_err(|_| Error::UnexpectedEof)
    }
}

impl<T: Deserializable> Deserializable for Vec<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            VECTOR => {}
            id => return Err(Error::UnexpectedConstructor { id }),
        }
        let count = i32::deserialize(buf)? as usize;
        (0..count).map(|_| T::deserialize(buf)).collect()
    }
}

impl<T: Deserializable> Deserializable for crate::RawVec<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let count = i32::deserialize(buf)? as usize;
        let items = (0..count).map(|_| T::deserialize(buf)).collect::<Result<_>>()?;
        Ok(crate::RawVec(items))
    }
}

impl Deserializable for crate::Blob {
    fn deserialize(buf: Buffer) -> Result<Self> {
        Ok(crate::Blob(buf.read_to_end()))
    }
}
