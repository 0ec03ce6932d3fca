//! CIP primitive data types: tag codes, sizes, and little-endian codecs.

use automata::{Need, Scan};
use byteorder::{ByteOrder, LittleEndian};
use dict::{Dict, Value};

use crate::Error;

/// The CIP elementary types carried by tag reads/writes and attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipType {
    Bool,
    Sint,
    Int,
    Dint,
    Lint,
    Usint,
    Uint,
    Udint,
    Real,
    Lreal,
    /// Short string: 1-byte length + octets.
    Sstring,
    /// String: 2-byte length + octets.
    String,
    Epath,
    /// An IPv4 address, stored textually but carried as a UDINT.
    Ipaddr,
}

impl CipType {
    pub fn tag(&self) -> u16 {
        match self {
            CipType::Bool => 0x00C1,
            CipType::Sint => 0x00C2,
            CipType::Int => 0x00C3,
            CipType::Dint => 0x00C4,
            CipType::Lint => 0x00C5,
            CipType::Usint => 0x00C6,
            CipType::Uint => 0x00C7,
            CipType::Udint => 0x00C8,
            CipType::Real => 0x00CA,
            CipType::Lreal => 0x00CB,
            CipType::Sstring => 0x00DA,
            CipType::String => 0x00D0,
            CipType::Epath => 0x00DC,
            CipType::Ipaddr => 0x00C8,
        }
    }

    pub fn from_tag(tag: u16) -> Option<CipType> {
        Some(match tag {
            0x00C1 => CipType::Bool,
            0x00C2 => CipType::Sint,
            0x00C3 => CipType::Int,
            0x00C4 => CipType::Dint,
            0x00C5 => CipType::Lint,
            0x00C6 => CipType::Usint,
            0x00C7 => CipType::Uint,
            0x00C8 => CipType::Udint,
            0x00CA => CipType::Real,
            0x00CB => CipType::Lreal,
            0x00DA => CipType::Sstring,
            0x00D0 => CipType::String,
            0x00DC => CipType::Epath,
            _ => return None,
        })
    }

    pub fn parse(name: &str) -> Option<CipType> {
        Some(match name.to_ascii_uppercase().as_str() {
            "BOOL" => CipType::Bool,
            "SINT" => CipType::Sint,
            "INT" => CipType::Int,
            "DINT" => CipType::Dint,
            "LINT" => CipType::Lint,
            "USINT" => CipType::Usint,
            "UINT" => CipType::Uint,
            "UDINT" => CipType::Udint,
            "REAL" => CipType::Real,
            "LREAL" => CipType::Lreal,
            "SSTRING" => CipType::Sstring,
            "STRING" => CipType::String,
            "EPATH" => CipType::Epath,
            "IPADDR" => CipType::Ipaddr,
            _ => return None,
        })
    }

    /// Encoded element size; variable-length types return None.
    pub fn size(&self) -> Option<usize> {
        Some(match self {
            CipType::Bool | CipType::Sint | CipType::Usint => 1,
            CipType::Int | CipType::Uint => 2,
            CipType::Dint | CipType::Udint | CipType::Real | CipType::Ipaddr => 4,
            CipType::Lint | CipType::Lreal => 8,
            CipType::Sstring | CipType::String | CipType::Epath => return None,
        })
    }

    /// How many encoded bytes the element beginning at `raw` occupies, or
    /// None when `raw` is too short to tell / to hold it.
    pub fn element_size(&self, raw: &[u8]) -> Option<usize> {
        match self {
            CipType::Sstring => raw.first().map(|&len| 1 + len as usize),
            CipType::String => {
                if raw.len() < 2 {
                    None
                } else {
                    Some(2 + LittleEndian::read_u16(raw) as usize)
                }
            }
            CipType::Epath => None,
            sized => sized.size(),
        }
    }

    /// Decode one element; `raw` must hold at least `element_size` bytes.
    pub fn decode(&self, raw: &[u8]) -> Value {
        match self {
            CipType::Bool => Value::Bool(raw[0] != 0),
            CipType::Sint => Value::Int(raw[0] as i8 as i64),
            CipType::Usint => Value::Int(raw[0] as i64),
            CipType::Int => Value::Int(LittleEndian::read_i16(raw) as i64),
            CipType::Uint => Value::Int(LittleEndian::read_u16(raw) as i64),
            CipType::Dint => Value::Int(LittleEndian::read_i32(raw) as i64),
            CipType::Udint => Value::Int(LittleEndian::read_u32(raw) as i64),
            CipType::Lint => Value::Int(LittleEndian::read_i64(raw)),
            CipType::Real => Value::Real(LittleEndian::read_f32(raw) as f64),
            CipType::Lreal => Value::Real(LittleEndian::read_f64(raw)),
            CipType::Sstring => {
                let len = raw[0] as usize;
                Value::String(String::from_utf8_lossy(&raw[1..1 + len]).into_owned())
            }
            CipType::String => {
                let len = LittleEndian::read_u16(raw) as usize;
                Value::String(String::from_utf8_lossy(&raw[2..2 + len]).into_owned())
            }
            CipType::Epath => Value::Bytes(raw.to_vec()),
            CipType::Ipaddr => {
                // Big-endian on the wire, rendered dotted-quad.
                Value::String(format!("{}.{}.{}.{}", raw[0], raw[1], raw[2], raw[3]))
            }
        }
    }

    /// Append one element's encoding to `out`.
    pub fn produce(&self, value: &Value, out: &mut Vec<u8>) -> Result<(), Error> {
        let type_err = || Error::BadValue {
            ty: *self,
            value: format!("{value:?}"),
        };
        match self {
            CipType::Bool => out.push(if value.as_int().ok_or_else(type_err)? != 0 {
                1
            } else {
                0
            }),
            CipType::Sint | CipType::Usint => {
                out.push(value.as_int().ok_or_else(type_err)? as u8)
            }
            CipType::Int | CipType::Uint => {
                let v = value.as_int().ok_or_else(type_err)? as u16;
                out.extend_from_slice(&v.to_le_bytes());
            }
            CipType::Dint | CipType::Udint => {
                let v = value.as_int().ok_or_else(type_err)? as u32;
                out.extend_from_slice(&v.to_le_bytes());
            }
            CipType::Lint => {
                let v = value.as_int().ok_or_else(type_err)? as u64;
                out.extend_from_slice(&v.to_le_bytes());
            }
            CipType::Real => {
                let v = value.as_real().ok_or_else(type_err)? as f32;
                out.extend_from_slice(&v.to_le_bytes());
            }
            CipType::Lreal => {
                let v = value.as_real().ok_or_else(type_err)?;
                out.extend_from_slice(&v.to_le_bytes());
            }
            CipType::Sstring => {
                let s = value.as_str().ok_or_else(type_err)?;
                produce_sstring(s, None, out);
            }
            CipType::String => {
                let s = value.as_str().ok_or_else(type_err)?;
                out.extend_from_slice(&(s.len() as u16).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            CipType::Epath => {
                out.extend_from_slice(value.as_bytes().ok_or_else(type_err)?)
            }
            CipType::Ipaddr => {
                let s = value.as_str().ok_or_else(type_err)?;
                for part in s.split('.') {
                    out.push(part.parse::<u8>().map_err(|_| type_err())?);
                }
            }
        }
        Ok(())
    }
}

/// Encode a Short String. An explicit `length` longer than the string
/// pads with a zero byte; a shorter one truncates.
pub fn produce_sstring(s: &str, length: Option<usize>, out: &mut Vec<u8>) {
    let bytes = s.as_bytes();
    let length = length.unwrap_or(bytes.len());
    out.push(length as u8);
    if length <= bytes.len() {
        out.extend_from_slice(&bytes[..length]);
    } else {
        out.extend_from_slice(bytes);
        out.resize(out.len() + length - bytes.len(), 0);
    }
}

/// Where a [`TypedData`] scan learns its element type: fixed at machine
/// construction, or from an already-parsed tag code field.
#[derive(Debug, Clone)]
pub enum TypeOf {
    Fixed(CipType),
    /// A dict path relative to the scan's context (eg. `..type`).
    Path(String),
}

impl TypeOf {
    fn resolve(&self, data: &Dict, path: &str) -> Result<CipType, Error> {
        match self {
            TypeOf::Fixed(t) => Ok(*t),
            TypeOf::Path(rel) => {
                let tag = data.get_int(&automata::join(path, rel))? as u16;
                CipType::from_tag(tag).ok_or(Error::UnknownType { tag })
            }
        }
    }
}

/// Repeatedly decodes one CIP primitive until its byte budget (the whole
/// remaining source, when unbounded) is exhausted, collecting elements
/// into `{path}.data`.
#[derive(Debug)]
pub struct TypedData {
    pub type_of: TypeOf,
}

impl Scan for TypedData {
    fn need(&self, got: &[u8], data: &Dict, path: &str) -> Result<Need, automata::Error> {
        let ty = self.type_of.resolve(data, path).map_err(|err| automata::Error::Parse {
            state: path.to_string(),
            reason: err.to_string(),
        })?;
        // Count whole elements already collected; ask for the remainder
        // of a trailing partial element, or offer to take one more.
        let mut rest: &[u8] = got;
        loop {
            if rest.is_empty() {
                return Ok(Need::MoreOrDone(ty.size().unwrap_or(1)));
            }
            match ty.element_size(rest) {
                Some(n) if rest.len() >= n => rest = &rest[n..],
                Some(n) => return Ok(Need::More(n - rest.len())),
                None => return Ok(Need::More(1)), // variable header incomplete
            }
        }
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), automata::Error> {
        let ty = self.type_of.resolve(data, path).map_err(|err| automata::Error::Parse {
            state: path.to_string(),
            reason: err.to_string(),
        })?;
        let mut elements = Vec::new();
        let mut rest: &[u8] = got;
        while !rest.is_empty() {
            let n = ty.element_size(rest).ok_or_else(|| automata::Error::Parse {
                state: path.to_string(),
                reason: "trailing partial element".to_string(),
            })?;
            if rest.len() < n {
                return Err(automata::Error::Parse {
                    state: path.to_string(),
                    reason: "trailing partial element".to_string(),
                });
            }
            elements.push(ty.decode(rest));
            rest = &rest[n..];
        }
        data.set(&automata::join(path, "data"), elements)?;
        Ok(())
    }
}

/// Encode a run of typed elements.
pub fn produce_typed_data(
    ty: CipType,
    elements: &[Value],
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    for v in elements {
        ty.produce(v, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use automata::{Builder, Kind, Progress, Runner, Source, State};
    use std::sync::Arc;

    fn typed_machine(ty: CipType) -> Arc<automata::Machine> {
        let mut b = Builder::new("typed_data");
        b.add(
            State::new(
                "data",
                Kind::Scan(Arc::new(TypedData {
                    type_of: TypeOf::Fixed(ty),
                })),
            )
            .context("typed_data")
            .terminal(),
        );
        b.build()
    }

    #[test]
    fn test_int_run() {
        let mut source = Source::complete(&[0x01, 0x00, 0x02, 0x00, 0x03, 0x00][..]);
        let mut data = Dict::new();
        let mut run = Runner::new(typed_machine(CipType::Int));
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(
            data.get_list("typed_data.data").unwrap(),
            &vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }

    #[test]
    fn test_real_run() {
        let mut source = Source::complete(vec![0u8; 16]);
        let mut data = Dict::new();
        let mut run = Runner::new(typed_machine(CipType::Real));
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        assert_eq!(data.get_list("typed_data.data").unwrap().len(), 4);
    }

    #[test]
    fn test_sstring_run() {
        // 3 x 0-length SSTRING followed by 'a'.
        let mut source = Source::complete(&b"\x00\x00\x00\x01a"[..]);
        let mut data = Dict::new();
        let mut run = Runner::new(typed_machine(CipType::Sstring));
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        let data = data.get_list("typed_data.data").unwrap();
        assert_eq!(
            data,
            &vec![
                Value::String("".into()),
                Value::String("".into()),
                Value::String("".into()),
                Value::String("a".into()),
            ]
        );
    }

    #[test]
    fn test_sstring_padding() {
        let mut out = Vec::new();
        produce_sstring("abc12", None, &mut out);
        assert_eq!(out, b"\x05abc12");

        // An explicit longer length pads with a zero byte.
        let mut out = Vec::new();
        produce_sstring("abc12", Some(6), &mut out);
        assert_eq!(out, b"\x06abc12\x00");

        let mut out = Vec::new();
        produce_sstring("", Some(0), &mut out);
        assert_eq!(out, b"\x00");
    }
}
