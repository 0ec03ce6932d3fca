//! The tag symbol table, and the client-facing textual tag grammar.
//!
//! Tags address CIP attributes symbolically (`SCADA`, `Tag.Subtag[3-5]`)
//! or numerically (`@0x93/3/10`). Definitions extend the form with a type
//! and optional initial values: `Name=INT[1000]`, `number=REAL=1.25`.

use dict::Value;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::types::CipType;
use crate::Error;

/// A resolved CIP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipAddr {
    pub class: u16,
    pub instance: u16,
    pub attribute: Option<u16>,
}

impl CipAddr {
    pub fn new(class: u16, instance: u16, attribute: Option<u16>) -> CipAddr {
        CipAddr {
            class,
            instance,
            attribute,
        }
    }
}

/// Process-wide mapping from tag name to CIP address: populated at
/// startup from configuration, read-mostly thereafter.
#[derive(Debug, Default)]
pub struct SymbolTable {
    map: RwLock<BTreeMap<String, CipAddr>>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    pub fn define(&self, name: impl Into<String>, addr: CipAddr) {
        self.map
            .write()
            .expect("symbol table lock poisoned")
            .insert(name.into(), addr);
    }

    pub fn lookup(&self, name: &str) -> Option<CipAddr> {
        self.map
            .read()
            .expect("symbol table lock poisoned")
            .get(name)
            .copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.map
            .read()
            .expect("symbol table lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// A parsed textual tag reference.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TagSpec {
    /// Dotted symbolic name, unless numerically addressed.
    pub name: Option<String>,
    /// `@class/instance[/attribute[/element]]` numeric address.
    pub address: Option<(u16, u16, Option<u16>, Option<u32>)>,
    /// `[beg]` or `[beg-end]` element range.
    pub begin: Option<usize>,
    pub end: Option<usize>,
    /// `*count` element count.
    pub count: Option<usize>,
}

/// A parsed tag definition: reference plus type, length and initial
/// values.
#[derive(Debug, Clone, PartialEq)]
pub struct TagDef {
    pub spec: TagSpec,
    pub ty: CipType,
    pub length: usize,
    pub values: Vec<Value>,
}

fn parse_num(text: &str) -> Result<u32, Error> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|_| Error::BadTag {
        text: text.to_string(),
        reason: "expected a number".to_string(),
    })
}

/// Parse a tag reference: `seg(.seg)*([range])?(*count)?` or
/// `@class/instance(/attribute(/element)?)?(*count)?`.
pub fn parse_tag(text: &str) -> Result<TagSpec, Error> {
    let text = text.trim();
    let mut spec = TagSpec::default();

    let (body, count) = match text.rsplit_once('*') {
        Some((body, count)) => (body.trim(), Some(parse_num(count)? as usize)),
        None => (text, None),
    };
    spec.count = count;

    if let Some(addr) = body.strip_prefix('@') {
        let parts: Vec<&str> = addr.split('/').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(Error::BadTag {
                text: text.to_string(),
                reason: "expected @class/instance[/attribute[/element]]".to_string(),
            });
        }
        let class = parse_num(parts[0])? as u16;
        let instance = parse_num(parts[1])? as u16;
        let attribute = parts.get(2).map(|p| parse_num(p)).transpose()?.map(|v| v as u16);
        let element = parts.get(3).map(|p| parse_num(p)).transpose()?;
        spec.address = Some((class, instance, attribute, element));
        return Ok(spec);
    }

    let (name, range) = match body.split_once('[') {
        Some((name, rest)) => {
            let range = rest.strip_suffix(']').ok_or_else(|| Error::BadTag {
                text: text.to_string(),
                reason: "unbalanced '['".to_string(),
            })?;
            (name, Some(range))
        }
        None => (body, None),
    };
    if name.is_empty() {
        return Err(Error::BadTag {
            text: text.to_string(),
            reason: "empty tag name".to_string(),
        });
    }
    spec.name = Some(name.to_string());
    if let Some(range) = range {
        match range.split_once('-') {
            Some((beg, end)) => {
                spec.begin = Some(parse_num(beg)? as usize);
                spec.end = Some(parse_num(end)? as usize);
            }
            None => spec.begin = Some(parse_num(range)? as usize),
        }
    }
    Ok(spec)
}

/// Parse a tag definition: `Name[@c/i/a]=TYPE[len]` or
/// `Name[@c/i/a]=TYPE=v1,v2,…`. Omitted length defaults to the value
/// count, or 1.
pub fn parse_definition(text: &str) -> Result<TagDef, Error> {
    let text = text.trim();
    let (reference, rest) = text.split_once('=').ok_or_else(|| Error::BadTag {
        text: text.to_string(),
        reason: "expected Name=TYPE".to_string(),
    })?;

    // The reference may carry an embedded numeric address: Name@c/i/a.
    let mut spec = match reference.split_once('@') {
        Some((name, addr)) => {
            let mut spec = parse_tag(name)?;
            let at = parse_tag(&format!("@{addr}"))?;
            spec.address = at.address;
            spec
        }
        None => parse_tag(reference)?,
    };

    let (type_text, values_text) = match rest.split_once('=') {
        Some((t, v)) => (t.trim(), Some(v)),
        None => (rest.trim(), None),
    };

    let (type_name, length) = match type_text.split_once('[') {
        Some((name, len)) => {
            let len = len.strip_suffix(']').ok_or_else(|| Error::BadTag {
                text: text.to_string(),
                reason: "unbalanced '[' in type".to_string(),
            })?;
            (name.trim(), Some(parse_num(len)? as usize))
        }
        None => (type_text, None),
    };
    let ty = CipType::parse(type_name).ok_or_else(|| Error::BadTag {
        text: text.to_string(),
        reason: format!("unknown type {type_name:?}"),
    })?;

    let values: Vec<Value> = match values_text {
        None => Vec::new(),
        Some(list) => list
            .split(',')
            .map(|v| parse_value(ty, v.trim()))
            .collect::<Result<_, _>>()?,
    };

    let length = length.unwrap_or_else(|| values.len().max(1));
    // Ranges make no sense in a definition; the length rules.
    spec.begin = None;
    spec.end = None;
    Ok(TagDef {
        spec,
        ty,
        length,
        values,
    })
}

fn parse_value(ty: CipType, text: &str) -> Result<Value, Error> {
    let bad = || Error::BadTag {
        text: text.to_string(),
        reason: format!("not a {ty:?} value"),
    };
    Ok(match ty {
        CipType::Real | CipType::Lreal => Value::Real(text.parse().map_err(|_| bad())?),
        CipType::Sstring | CipType::String | CipType::Ipaddr => {
            Value::String(text.trim_matches('\'').trim_matches('"').to_string())
        }
        CipType::Bool => Value::Bool(text == "1" || text.eq_ignore_ascii_case("true")),
        _ => Value::Int(
            text.parse()
                .or_else(|_| parse_num(text).map(|v| v as i64))
                .map_err(|_| bad())?,
        ),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_tag() {
        let spec = parse_tag("SCADA").unwrap();
        assert_eq!(spec.name.as_deref(), Some("SCADA"));
        assert_eq!(spec.begin, None);

        let spec = parse_tag("Tag.Subtag[3-5]*10").unwrap();
        assert_eq!(spec.name.as_deref(), Some("Tag.Subtag"));
        assert_eq!((spec.begin, spec.end, spec.count), (Some(3), Some(5), Some(10)));

        let spec = parse_tag("@0x93/3/10").unwrap();
        assert_eq!(spec.address, Some((0x93, 3, Some(10), None)));

        let spec = parse_tag("@2/1").unwrap();
        assert_eq!(spec.address, Some((2, 1, None, None)));

        assert!(parse_tag("@2").is_err());
        assert!(parse_tag("[3]").is_err());
    }

    #[test]
    fn test_parse_definition() {
        let def = parse_definition("SCADA=INT[1000]").unwrap();
        assert_eq!(def.spec.name.as_deref(), Some("SCADA"));
        assert_eq!(def.ty, CipType::Int);
        assert_eq!(def.length, 1000);
        assert!(def.values.is_empty());

        let def = parse_definition("number=REAL=1.25").unwrap();
        assert_eq!(def.ty, CipType::Real);
        assert_eq!(def.length, 1);
        assert_eq!(def.values, vec![Value::Real(1.25)]);

        let def = parse_definition("Motor@0x93/3/10=DINT=1,2,3").unwrap();
        assert_eq!(def.spec.address, Some((0x93, 3, Some(10), None)));
        assert_eq!(def.length, 3);
        assert_eq!(
            def.values,
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );

        assert!(parse_definition("Name=NOPE[3]").is_err());
    }

    #[test]
    fn test_symbol_table() {
        let symbols = SymbolTable::new();
        symbols.define("SCADA", CipAddr::new(0x401, 1, Some(2)));
        assert_eq!(symbols.lookup("SCADA"), Some(CipAddr::new(0x401, 1, Some(2))));
        assert_eq!(symbols.lookup("BOO"), None);
    }
}
