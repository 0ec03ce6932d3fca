//! Scanning state behaviors: each collects a byte run whose length is
//! discovered incrementally, then decodes it into the data dictionary.

use byteorder::{ByteOrder, LittleEndian};
use dict::{Dict, Value};
use std::fmt;

use crate::Error;

/// How many more symbols a scan requires, given those collected so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Need {
    /// Exactly `0` means the collection is complete.
    More(usize),
    /// The scan would accept `n` more symbols, but is also complete as-is
    /// should the source close. Used by open-ended element iteration.
    MoreOrDone(usize),
}

/// A resumable byte-run collector. The kernel accumulates bytes per
/// [`Scan::need`] and calls [`Scan::decode`] once the run is complete;
/// partial runs survive suspension untouched.
pub trait Scan: fmt::Debug + Send + Sync {
    fn need(&self, got: &[u8], data: &Dict, path: &str) -> Result<Need, Error>;
    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), Error>;
}

/// A repetition count: fixed, or named by a path resolved against the
/// data dictionary at run time (relative to the state's context, so
/// `..length` names a sibling field).
#[derive(Debug, Clone)]
pub enum Repeat {
    Count(usize),
    Path(String),
}

impl Repeat {
    pub fn resolve(&self, data: &Dict, path: &str) -> Result<usize, Error> {
        match self {
            Repeat::Count(n) => Ok(*n),
            Repeat::Path(rel) => {
                let full = crate::join(path, rel);
                let n = data.get_int(&full)?;
                usize::try_from(n).map_err(|_| Error::Parse {
                    state: full,
                    reason: format!("negative repeat count {n}"),
                })
            }
        }
    }
}

/// Accumulates a run of raw octets into `{path}.input`.
#[derive(Debug)]
pub struct Octets {
    pub repeat: Repeat,
}

impl Scan for Octets {
    fn need(&self, got: &[u8], data: &Dict, path: &str) -> Result<Need, Error> {
        let n = self.repeat.resolve(data, path)?;
        Ok(Need::More(n.saturating_sub(got.len())))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), Error> {
        data.set(&crate::join(path, "input"), got.to_vec())?;
        Ok(())
    }
}

/// Like [`Octets`], but word-denominated: collects `2 * repeat` octets.
#[derive(Debug)]
pub struct Words {
    pub repeat: Repeat,
}

impl Scan for Words {
    fn need(&self, got: &[u8], data: &Dict, path: &str) -> Result<Need, Error> {
        let n = self.repeat.resolve(data, path)? * 2;
        Ok(Need::More(n.saturating_sub(got.len())))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), Error> {
        data.set(&crate::join(path, "input"), got.to_vec())?;
        Ok(())
    }
}

/// Fixed-layout numeric field formats, little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Format {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl Format {
    pub fn size(&self) -> usize {
        match self {
            Format::U8 | Format::I8 => 1,
            Format::U16 | Format::I16 => 2,
            Format::U32 | Format::I32 | Format::F32 => 4,
            Format::U64 | Format::I64 | Format::F64 => 8,
        }
    }

    pub fn decode(&self, raw: &[u8]) -> Value {
        match self {
            Format::U8 => Value::Int(raw[0] as i64),
            Format::I8 => Value::Int(raw[0] as i8 as i64),
            Format::U16 => Value::Int(LittleEndian::read_u16(raw) as i64),
            Format::I16 => Value::Int(LittleEndian::read_i16(raw) as i64),
            Format::U32 => Value::Int(LittleEndian::read_u32(raw) as i64),
            Format::I32 => Value::Int(LittleEndian::read_i32(raw) as i64),
            Format::U64 => Value::Int(LittleEndian::read_u64(raw) as i64),
            Format::I64 => Value::Int(LittleEndian::read_i64(raw)),
            Format::F32 => Value::Real(LittleEndian::read_f32(raw) as f64),
            Format::F64 => Value::Real(LittleEndian::read_f64(raw)),
        }
    }
}

/// Reads one fixed-layout numeric field, storing it at the state's
/// context path directly.
#[derive(Debug)]
pub struct Number {
    pub format: Format,
}

impl Scan for Number {
    fn need(&self, got: &[u8], _data: &Dict, _path: &str) -> Result<Need, Error> {
        Ok(Need::More(self.format.size().saturating_sub(got.len())))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), Error> {
        data.set(path, self.format.decode(got))?;
        Ok(())
    }
}

/// A CIP Short String: 1-byte length, then that many UTF-8 octets.
/// Decodes into `{path}.length` and `{path}.string`.
#[derive(Debug)]
pub struct Sstring;

impl Scan for Sstring {
    fn need(&self, got: &[u8], _data: &Dict, _path: &str) -> Result<Need, Error> {
        let total = match got.first() {
            None => 1,
            Some(&len) => 1 + len as usize,
        };
        Ok(Need::More(total.saturating_sub(got.len())))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), Error> {
        let length = got[0] as usize;
        let string = String::from_utf8_lossy(&got[1..1 + length]).into_owned();
        data.set(&crate::join(path, "length"), length)?;
        data.set(&crate::join(path, "string"), string)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_number_formats() {
        assert_eq!(Format::U16.decode(b"ab"), Value::Int(25185));
        assert_eq!(Format::I16.decode(&[0xc8, 0x80]), Value::Int(0x80c8u16 as i16 as i64));
        assert_eq!(Format::F32.decode(&[0x00, 0x00, 0xa0, 0x3f]), Value::Real(1.25));
    }

    #[test]
    fn test_sstring_need() {
        let d = Dict::new();
        assert_eq!(Sstring.need(&[], &d, "s").unwrap(), Need::More(1));
        assert_eq!(Sstring.need(&[5], &d, "s").unwrap(), Need::More(5));
        assert_eq!(Sstring.need(&[5, b'a', b'b'], &d, "s").unwrap(), Need::More(3));
        assert_eq!(Sstring.need(&[0], &d, "s").unwrap(), Need::More(0));
    }
}
