//! CIP Encoded Paths and route paths.
//!
//! An EPATH is a word-sized list of typed segments addressing a class /
//! instance / attribute / element, a symbolic tag name, or a routing
//! port+link hop. Both 8-bit and 16-bit (and, for elements, 32-bit)
//! segment encodings are accepted on parse; production prefers the
//! shortest form. A route path differs only in carrying a reserved pad
//! byte after its size.

use automata::{Need, Scan};
use byteorder::{ByteOrder, LittleEndian};
use dict::{Dict, Value};

use crate::symbol::SymbolTable;
use crate::Error;

// Segment type codes.
const SEG_CLASS_8: u8 = 0x20;
const SEG_CLASS_16: u8 = 0x21;
const SEG_INSTANCE_8: u8 = 0x24;
const SEG_INSTANCE_16: u8 = 0x25;
const SEG_ELEMENT_8: u8 = 0x28;
const SEG_ELEMENT_16: u8 = 0x29;
const SEG_ELEMENT_32: u8 = 0x2A;
const SEG_CONNECTION_8: u8 = 0x2C;
const SEG_CONNECTION_16: u8 = 0x2D;
const SEG_ATTRIBUTE_8: u8 = 0x30;
const SEG_ATTRIBUTE_16: u8 = 0x31;
const SEG_SYMBOLIC: u8 = 0x91;
// Port segments have the top three bits clear; 0x10 flags an extended
// (string) link address, low nibble 0x0F a 16-bit port number.
const PORT_EXTENDED_LINK: u8 = 0x10;
const PORT_NUMBER_EXTENDED: u8 = 0x0F;

/// Parses an EPATH (or route path) into `{path}.size` and
/// `{path}.segment[..]`.
#[derive(Debug)]
pub struct Epath {
    /// Route paths carry a reserved pad byte after the size.
    pub route: bool,
}

impl Epath {
    fn header(&self) -> usize {
        if self.route {
            2
        } else {
            1
        }
    }
}

impl Scan for Epath {
    fn need(&self, got: &[u8], _data: &Dict, _path: &str) -> Result<Need, automata::Error> {
        let total = match got.first() {
            None => self.header(),
            Some(&size) => self.header() + 2 * size as usize,
        };
        Ok(Need::More(total.saturating_sub(got.len())))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), automata::Error> {
        let size = got[0] as usize;
        let segments =
            parse_segments(&got[self.header()..]).map_err(|err| automata::Error::Parse {
                state: path.to_string(),
                reason: err.to_string(),
            })?;
        data.set(&automata::join(path, "size"), size)?;
        if !segments.is_empty() {
            let list: Vec<Value> = segments.into_iter().map(Value::Dict).collect();
            data.set(&automata::join(path, "segment"), list)?;
        }
        Ok(())
    }
}

/// Parse the word-aligned segment list of an EPATH body.
pub fn parse_segments(mut raw: &[u8]) -> Result<Vec<Dict>, Error> {
    let mut segments = Vec::new();
    while !raw.is_empty() {
        let mut seg = Dict::new();
        let code = raw[0];
        let used = match code {
            SEG_CLASS_8 | SEG_INSTANCE_8 | SEG_ELEMENT_8 | SEG_CONNECTION_8
            | SEG_ATTRIBUTE_8 => {
                require(raw, 2)?;
                seg.set(key_of(code), raw[1])?;
                2
            }
            SEG_CLASS_16 | SEG_INSTANCE_16 | SEG_ELEMENT_16 | SEG_CONNECTION_16
            | SEG_ATTRIBUTE_16 => {
                require(raw, 4)?;
                seg.set(key_of(code & !0x01), LittleEndian::read_u16(&raw[2..]))?;
                4
            }
            SEG_ELEMENT_32 => {
                require(raw, 6)?;
                seg.set("element", LittleEndian::read_u32(&raw[2..]))?;
                6
            }
            SEG_SYMBOLIC => {
                require(raw, 2)?;
                let len = raw[1] as usize;
                let total = pad_even(2 + len);
                require(raw, total)?;
                let name = std::str::from_utf8(&raw[2..2 + len])
                    .map_err(|_| Error::BadPath {
                        reason: "symbolic segment is not UTF-8".to_string(),
                    })?
                    .to_string();
                seg.set("symbolic", name)?;
                total
            }
            code if code & 0xE0 == 0 => parse_port(raw, &mut seg)?,
            code => {
                return Err(Error::BadPath {
                    reason: format!("unrecognized segment type {code:#04x}"),
                })
            }
        };
        raw = &raw[used..];
        segments.push(seg);
    }
    Ok(segments)
}

/// Port/link hop: `[seg] [link_size]? [port:u16]? [link...]`, padded even.
fn parse_port(raw: &[u8], seg: &mut Dict) -> Result<usize, Error> {
    let code = raw[0];
    let extended_link = code & PORT_EXTENDED_LINK != 0;
    let small_port = code & 0x0F;
    let mut at = 1;

    let link_size = if extended_link {
        require(raw, at + 1)?;
        let n = raw[at] as usize;
        at += 1;
        Some(n)
    } else {
        None
    };
    let port = if small_port == PORT_NUMBER_EXTENDED {
        require(raw, at + 2)?;
        let p = LittleEndian::read_u16(&raw[at..]);
        at += 2;
        p
    } else {
        small_port as u16
    };
    seg.set("port", port)?;

    match link_size {
        Some(n) => {
            require(raw, at + n)?;
            let link = std::str::from_utf8(&raw[at..at + n])
                .map_err(|_| Error::BadPath {
                    reason: "extended link address is not UTF-8".to_string(),
                })?
                .to_string();
            seg.set("link", link)?;
            at += n;
        }
        None => {
            require(raw, at + 1)?;
            seg.set("link", raw[at])?;
            at += 1;
        }
    }
    Ok(pad_even(at))
}

fn key_of(code: u8) -> &'static str {
    match code {
        SEG_CLASS_8 => "class",
        SEG_INSTANCE_8 => "instance",
        SEG_ELEMENT_8 => "element",
        SEG_CONNECTION_8 => "connection",
        SEG_ATTRIBUTE_8 => "attribute",
        _ => unreachable!("not an 8-bit segment code"),
    }
}

fn require(raw: &[u8], n: usize) -> Result<(), Error> {
    if raw.len() < n {
        return Err(Error::BadPath {
            reason: format!("truncated segment: {} of {} bytes", raw.len(), n),
        });
    }
    Ok(())
}

fn pad_even(n: usize) -> usize {
    n + (n & 1)
}

/// Encode the segment list of the path dict at `path` (eg.
/// `request.path`), preferring the shortest segment encodings, and
/// append `[size] [pad]? [segments]` to `out`.
pub fn produce(data: &Dict, path: &str, route: bool, out: &mut Vec<u8>) -> Result<(), Error> {
    let mut body = Vec::new();
    if let Ok(segments) = data.get_list(&automata::join(path, "segment")) {
        for seg in segments {
            let seg = seg.as_dict().ok_or_else(|| Error::BadPath {
                reason: "segment is not a dictionary".to_string(),
            })?;
            produce_segment(seg, &mut body)?;
        }
    }
    assert!(body.len() % 2 == 0, "segment encodings are word-aligned");
    out.push((body.len() / 2) as u8);
    if route {
        out.push(0x00);
    }
    out.extend_from_slice(&body);
    Ok(())
}

fn produce_segment(seg: &Dict, out: &mut Vec<u8>) -> Result<(), Error> {
    if let Ok(port) = seg.get_int("port") {
        return produce_port(seg, port as u16, out);
    }
    if let Ok(name) = seg.get_str("symbolic") {
        out.push(SEG_SYMBOLIC);
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        if out.len() % 2 != 0 {
            out.push(0x00);
        }
        return Ok(());
    }
    for (key, code8, code16) in [
        ("class", SEG_CLASS_8, SEG_CLASS_16),
        ("instance", SEG_INSTANCE_8, SEG_INSTANCE_16),
        ("attribute", SEG_ATTRIBUTE_8, SEG_ATTRIBUTE_16),
        ("connection", SEG_CONNECTION_8, SEG_CONNECTION_16),
    ] {
        if let Ok(v) = seg.get_int(key) {
            if v <= 0xFF {
                out.push(code8);
                out.push(v as u8);
            } else {
                out.push(code16);
                out.push(0x00);
                out.extend_from_slice(&(v as u16).to_le_bytes());
            }
            return Ok(());
        }
    }
    if let Ok(v) = seg.get_int("element") {
        if v <= 0xFF {
            out.push(SEG_ELEMENT_8);
            out.push(v as u8);
        } else if v <= 0xFFFF {
            out.push(SEG_ELEMENT_16);
            out.push(0x00);
            out.extend_from_slice(&(v as u16).to_le_bytes());
        } else {
            out.push(SEG_ELEMENT_32);
            out.push(0x00);
            out.extend_from_slice(&(v as u32).to_le_bytes());
        }
        return Ok(());
    }
    Err(Error::BadPath {
        reason: format!("cannot encode segment {seg}"),
    })
}

fn produce_port(seg: &Dict, port: u16, out: &mut Vec<u8>) -> Result<(), Error> {
    let start = out.len();
    let link_str = seg.get_str("link").ok().map(str::to_string);
    let mut code = if port < PORT_NUMBER_EXTENDED as u16 {
        port as u8
    } else {
        PORT_NUMBER_EXTENDED
    };
    if link_str.is_some() {
        code |= PORT_EXTENDED_LINK;
    }
    out.push(code);
    if let Some(link) = &link_str {
        out.push(link.len() as u8);
    }
    if port >= PORT_NUMBER_EXTENDED as u16 {
        out.extend_from_slice(&port.to_le_bytes());
    }
    match link_str {
        Some(link) => out.extend_from_slice(link.as_bytes()),
        None => out.push(seg.get_int("link")? as u8),
    }
    if (out.len() - start) % 2 != 0 {
        out.push(0x00);
    }
    Ok(())
}

/// Resolve a parsed path dict (at `path`, eg. `request.path`) to a
/// `(class, instance, attribute)` address. Symbolic runs are joined with
/// `.` and looked up in the symbol table; later explicit segments may not
/// contradict an address already established.
pub fn resolve(
    data: &Dict,
    path: &str,
    symbols: &SymbolTable,
    want_attribute: bool,
) -> Result<(u16, u16, Option<u16>), Error> {
    let segments = data
        .get_list(&automata::join(path, "segment"))
        .map(|l| l.as_slice())
        .unwrap_or(&[]);
    resolve_values(segments, symbols, want_attribute)
}

/// As [`resolve`], over a bare segment list.
pub fn resolve_values(
    segments: &[Value],
    symbols: &SymbolTable,
    want_attribute: bool,
) -> Result<(u16, u16, Option<u16>), Error> {
    let mut class: Option<u16> = None;
    let mut instance: Option<u16> = None;
    let mut attribute: Option<u16> = None;
    let mut symbolic: Vec<String> = Vec::new();

    let mut resolve_symbolic = |symbolic: &mut Vec<String>,
                                class: &mut Option<u16>,
                                instance: &mut Option<u16>,
                                attribute: &mut Option<u16>|
     -> Result<(), Error> {
        if symbolic.is_empty() {
            return Ok(());
        }
        let name = symbolic.join(".");
        symbolic.clear();
        let addr = symbols.lookup(&name).ok_or(Error::UnknownSymbol { name })?;
        set_part(class, addr.class, "class")?;
        set_part(instance, addr.instance, "instance")?;
        if let Some(a) = addr.attribute {
            set_part(attribute, a, "attribute")?;
        }
        Ok(())
    };

    for seg in segments {
        let seg = seg.as_dict().ok_or_else(|| Error::BadPath {
            reason: "segment is not a dictionary".to_string(),
        })?;
        if let Ok(name) = seg.get_str("symbolic") {
            symbolic.push(name.to_string());
            continue;
        }
        resolve_symbolic(&mut symbolic, &mut class, &mut instance, &mut attribute)?;
        if let Ok(v) = seg.get_int("class") {
            set_part(&mut class, v as u16, "class")?;
        } else if let Ok(v) = seg.get_int("instance") {
            set_part(&mut instance, v as u16, "instance")?;
        } else if let Ok(v) = seg.get_int("attribute") {
            set_part(&mut attribute, v as u16, "attribute")?;
        } else if seg.contains("element") || seg.contains("connection") || seg.contains("port") {
            // Element, connection-point and routing-hop segments don't
            // address an object.
        } else {
            return Err(Error::BadPath {
                reason: format!("invalid term {seg} in address"),
            });
        }
    }
    resolve_symbolic(&mut symbolic, &mut class, &mut instance, &mut attribute)?;

    let class = class.ok_or_else(|| Error::BadPath {
        reason: "failed to resolve a class from the path".to_string(),
    })?;
    let instance = instance.ok_or_else(|| Error::BadPath {
        reason: "failed to resolve an instance from the path".to_string(),
    })?;
    Ok((class, instance, if want_attribute { attribute } else { None }))
}

fn set_part(part: &mut Option<u16>, value: u16, what: &'static str) -> Result<(), Error> {
    match part {
        Some(prior) if *prior != value => Err(Error::BadPath {
            reason: format!("failed to override {what} {prior:#x} with {value:#x}"),
        }),
        _ => {
            *part = Some(value);
            Ok(())
        }
    }
}

/// The first element segment of the path dict, if any.
pub fn element_of(data: &Dict, path: &str) -> Option<usize> {
    let segments = data.get_list(&automata::join(path, "segment")).ok()?;
    segments.iter().find_map(|seg| {
        seg.as_dict()
            .and_then(|seg| seg.get_int("element").ok())
            .map(|v| v as usize)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::symbol::CipAddr;
    use automata::{Builder, Kind, Progress, Runner, Source, State};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn run_epath(raw: &[u8], route: bool) -> Dict {
        let mut b = Builder::new(if route { "route_path" } else { "EPATH" });
        b.add(
            State::new("path", Kind::Scan(Arc::new(Epath { route })))
                .context(if route { "route_path" } else { "EPATH" })
                .terminal(),
        );
        let machine = b.build();
        let mut source = Source::complete(raw.to_vec());
        let mut data = Dict::new();
        let mut run = Runner::with_path(machine, "request");
        assert_eq!(run.run(&mut source, &mut data).unwrap(), Progress::Terminal);
        data
    }

    fn reproduce(data: &Dict, route: bool) -> Vec<u8> {
        let path = if route {
            "request.route_path"
        } else {
            "request.EPATH"
        };
        let mut out = Vec::new();
        produce(data, path, route, &mut out).unwrap();
        out
    }

    #[test]
    fn test_empty() {
        let data = run_epath(&[0x00], false);
        assert_eq!(data.get_int("request.EPATH.size").unwrap(), 0);
        assert_eq!(reproduce(&data, false), [0x00]);
    }

    #[test]
    fn test_element_widths() {
        // 8-, 16-, and 32-bit element segments, and all address kinds.
        let raw = [
            0x0f, // 15 words
            0x28, 0x01, //
            0x29, 0x00, 0x01, 0x02, //
            0x2a, 0x00, 0x01, 0x02, 0x03, 0x04, //
            0x20, 0x11, //
            0x21, 0x00, 0x11, 0x02, //
            0x24, 0x21, //
            0x25, 0x00, 0x21, 0x02, //
            0x30, 0x31, //
            0x31, 0x00, 0x31, 0x02, //
        ];
        let data = run_epath(&raw, false);
        assert_eq!(data.get_int("request.EPATH.size").unwrap(), 15);
        let expect: Vec<(&str, i64)> = vec![
            ("element", 0x01),
            ("element", 0x0201),
            ("element", 0x04030201),
            ("class", 0x11),
            ("class", 0x0211),
            ("instance", 0x21),
            ("instance", 0x0221),
            ("attribute", 0x31),
            ("attribute", 0x0231),
        ];
        for (i, (key, v)) in expect.iter().enumerate() {
            assert_eq!(
                data.get_int(&format!("request.EPATH.segment[{i}].{key}")).unwrap(),
                *v
            );
        }

        // These segments already use their shortest encodings, so the
        // production round-trips exactly.
        assert_eq!(reproduce(&data, false), raw);
    }

    #[test]
    fn test_symbolic() {
        let raw = [
            0x08, //
            0x91, 0x06, b'a', b'b', b'c', b'1', b'2', b'3', //
            0x91, 0x05, b'x', b'y', b'z', b'1', b'2', 0x00, // odd length, padded
        ];
        let data = run_epath(&raw, false);
        assert_eq!(
            data.get_str("request.EPATH.segment[0].symbolic").unwrap(),
            "abc123"
        );
        assert_eq!(
            data.get_str("request.EPATH.segment[1].symbolic").unwrap(),
            "xyz12"
        );
        assert_eq!(reproduce(&data, false), raw);
    }

    #[test]
    fn test_route_port() {
        // Simple port/link.
        let data = run_epath(&[0x01, 0x00, 0x01, 0x00], true);
        assert_eq!(data.get_int("request.route_path.size").unwrap(), 1);
        assert_eq!(data.get_int("request.route_path.segment[0].port").unwrap(), 1);
        assert_eq!(data.get_int("request.route_path.segment[0].link").unwrap(), 0);
        assert_eq!(reproduce(&data, true), [0x01, 0x00, 0x01, 0x00]);

        // Extended 16-bit port number.
        let data = run_epath(&[0x02, 0x00, 0x0F, 0x01, 0x02, 0x99], true);
        assert_eq!(
            data.get_int("request.route_path.segment[0].port").unwrap(),
            513
        );
        assert_eq!(
            data.get_int("request.route_path.segment[0].link").unwrap(),
            0x99
        );
        assert_eq!(reproduce(&data, true), [0x02, 0x00, 0x0F, 0x01, 0x02, 0x99]);
    }

    #[test]
    fn test_route_extended_link() {
        // CIP Vol 1-3.13 Table 10-6.15: port 3, link "130.151.137.105",
        // with 16-bit address forms; reproduction uses the 8-bit forms.
        let raw = [
            0x0E, 0x00, //
            0x13, 0x0F, b'1', b'3', b'0', b'.', b'1', b'5', b'1', b'.', b'1', b'3', b'7',
            b'.', b'1', b'0', b'5', 0x00, //
            0x21, 0x00, 0x04, 0x00, //
            0x25, 0x00, 0x02, 0x00, //
            0x30, 0x03,
        ];
        let data = run_epath(&raw, true);
        assert_eq!(data.get_int("request.route_path.segment[0].port").unwrap(), 3);
        assert_eq!(
            data.get_str("request.route_path.segment[0].link").unwrap(),
            "130.151.137.105"
        );
        assert_eq!(data.get_int("request.route_path.segment[1].class").unwrap(), 4);
        assert_eq!(
            data.get_int("request.route_path.segment[2].instance").unwrap(),
            2
        );
        assert_eq!(
            data.get_int("request.route_path.segment[3].attribute").unwrap(),
            3
        );

        let shorter = [
            0x0C, 0x00, //
            0x13, 0x0F, b'1', b'3', b'0', b'.', b'1', b'5', b'1', b'.', b'1', b'3', b'7',
            b'.', b'1', b'0', b'5', 0x00, //
            0x20, 0x04, //
            0x24, 0x02, //
            0x30, 0x03,
        ];
        assert_eq!(reproduce(&data, true), shorter);

        // Extended port number and extended link together.
        let raw = [
            0x0F, 0x00, //
            0x1F, 0x0F, 0x03, 0x01, b'1', b'3', b'0', b'.', b'1', b'5', b'1', b'.', b'1',
            b'3', b'7', b'.', b'1', b'0', b'5', 0x00, //
            0x21, 0x00, 0x04, 0x00, //
            0x25, 0x00, 0x02, 0x00, //
            0x30, 0x03,
        ];
        let data = run_epath(&raw, true);
        assert_eq!(
            data.get_int("request.route_path.segment[0].port").unwrap(),
            0x103
        );
        assert_eq!(reproduce(&data, true)[0], 0x0D);
    }

    #[test]
    fn test_connection_points() {
        let raw = [0x04, 0x20, 0x04, 0x24, 0x05, 0x2C, 0x03, 0x2C, 0x64];
        let data = run_epath(&raw, false);
        assert_eq!(data.get_int("request.EPATH.segment[2].connection").unwrap(), 3);
        assert_eq!(
            data.get_int("request.EPATH.segment[3].connection").unwrap(),
            100
        );
        assert_eq!(reproduce(&data, false), raw);
    }

    #[test]
    fn test_resolve() {
        let mut symbols = SymbolTable::new();
        symbols.define("SCADA", CipAddr::new(0x401, 1, Some(2)));
        symbols.define("Tag.Subtag", CipAddr::new(0x401, 1, Some(3)));

        let mut data = Dict::new();
        data.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
        data.set("path.segment[0].symbolic", "SCADA").unwrap();

        assert_eq!(
            resolve(&data, "path", &symbols, true).unwrap(),
            (0x401, 1, Some(2))
        );
        assert_eq!(
            resolve(&data, "path", &symbols, false).unwrap(),
            (0x401, 1, None)
        );

        // Dotted names resolve left-to-right.
        let mut data = Dict::new();
        data.set(
            "path.segment",
            vec![
                Value::Dict(Dict::new()),
                Value::Dict(Dict::new()),
                Value::Dict(Dict::new()),
            ],
        )
        .unwrap();
        data.set("path.segment[0].symbolic", "Tag").unwrap();
        data.set("path.segment[1].symbolic", "Subtag").unwrap();
        data.set("path.segment[2].element", 4u32).unwrap();
        assert_eq!(
            resolve(&data, "path", &symbols, true).unwrap(),
            (0x401, 1, Some(3))
        );
        assert_eq!(element_of(&data, "path"), Some(4));

        // A class established earlier may not be overridden.
        let mut data = Dict::new();
        data.set(
            "path.segment",
            vec![Value::Dict(Dict::new()), Value::Dict(Dict::new())],
        )
        .unwrap();
        data.set("path.segment[0].class", 5u32).unwrap();
        data.set("path.segment[1].symbolic", "SCADA").unwrap();
        assert!(matches!(
            resolve(&data, "path", &symbols, false),
            Err(Error::BadPath { .. })
        ));

        // Unknown symbols are reported by their joined name.
        let mut data = Dict::new();
        data.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
        data.set("path.segment[0].symbolic", "BOO").unwrap();
        assert!(matches!(
            resolve(&data, "path", &symbols, false),
            Err(Error::UnknownSymbol { name }) if name == "BOO"
        ));

        // An instance alone resolves no class.
        let mut data = Dict::new();
        data.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
        data.set("path.segment[0].instance", 1u32).unwrap();
        assert!(resolve(&data, "path", &symbols, false).is_err());
    }
}
