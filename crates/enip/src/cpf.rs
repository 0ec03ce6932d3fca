//! Common Packet Format: the typed item list inside SendRRData,
//! SendUnitData and the List* replies.
//!
//! Parsing is deliberately tolerant of the length-field bugs seen in
//! real firmware (PowerFlex List Identity replies overstate or
//! understate item lengths): self-describing items are parsed by field
//! and the declared length only bounds raw captures, so a well-formed
//! next item header re-synchronizes the scan. Production always emits
//! accurate lengths.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use dict::{Dict, Value};

use crate::Error;

pub mod item_type {
    pub const NULL_ADDRESS: u16 = 0x0000;
    pub const LEGACY_0X0001: u16 = 0x0001;
    pub const IDENTITY: u16 = 0x000C;
    pub const CONNECTED_ADDRESS: u16 = 0x00A1;
    pub const CONNECTED_DATA: u16 = 0x00B1;
    pub const UNCONNECTED_DATA: u16 = 0x00B2;
    pub const COMMUNICATIONS: u16 = 0x0100;
}

/// Parse a CPF item list into `{path}.count` and `{path}.item[..]`.
/// An empty buffer leaves an empty `{path}` dict (no item list at all).
pub fn parse(raw: &[u8], data: &mut Dict, path: &str) -> Result<(), Error> {
    data.set_default(path, Dict::new())?;
    if raw.len() < 2 {
        return Ok(());
    }
    let count = LittleEndian::read_u16(raw) as usize;
    data.set(&automata::join(path, "count"), count)?;
    if count == 0 {
        return Ok(());
    }
    let items: Vec<Value> = (0..count).map(|_| Value::Dict(Dict::new())).collect();
    data.set(&automata::join(path, "item"), items)?;

    let mut at = 2;
    for i in 0..count {
        let item = automata::join(path, &format!("item[{i}]"));
        if raw.len() < at + 4 {
            return Err(Error::Frame {
                reason: format!("truncated CPF item {i} header"),
            });
        }
        let type_id = LittleEndian::read_u16(&raw[at..]);
        let length = LittleEndian::read_u16(&raw[at + 2..]) as usize;
        at += 4;
        data.set(&automata::join(&item, "type_id"), type_id)?;
        data.set(&automata::join(&item, "length"), length)?;

        let body = &raw[at..];
        let used = match type_id {
            item_type::NULL_ADDRESS => 0,
            item_type::CONNECTED_ADDRESS => {
                if body.len() < 4 {
                    return Err(Error::Frame {
                        reason: "short connected address item".to_string(),
                    });
                }
                data.set(
                    &automata::join(&item, "connection_ID.connection"),
                    LittleEndian::read_u32(body),
                )?;
                4
            }
            item_type::CONNECTED_DATA => {
                let take = length.min(body.len());
                if take < 2 {
                    return Err(Error::Frame {
                        reason: "short connected data item".to_string(),
                    });
                }
                data.set(
                    &automata::join(&item, "connection_data.sequence"),
                    LittleEndian::read_u16(body),
                )?;
                data.set(
                    &automata::join(&item, "connection_data.request.input"),
                    body[2..take].to_vec(),
                )?;
                take
            }
            item_type::UNCONNECTED_DATA => {
                let take = length.min(body.len());
                data.set(
                    &automata::join(&item, "unconnected_send.request.input"),
                    body[..take].to_vec(),
                )?;
                take
            }
            item_type::IDENTITY => parse_identity(body, data, &item)?,
            item_type::COMMUNICATIONS => parse_communications(body, data, &item)?,
            item_type::LEGACY_0X0001 => parse_legacy(body, data, &item)?,
            _ => {
                let take = length.min(body.len());
                data.set(&automata::join(&item, "input"), body[..take].to_vec())?;
                take
            }
        };
        at += used;
    }
    Ok(())
}

/// The ListIdentity reply item: encapsulation version, a big-endian
/// sockaddr, the identity attributes, and the state byte. Parsed by
/// field; the declared length is not trusted.
fn parse_identity(body: &[u8], data: &mut Dict, item: &str) -> Result<usize, Error> {
    if body.len() < 18 {
        return Err(Error::Frame {
            reason: "short identity item".to_string(),
        });
    }
    let id = |field: &str| automata::join(item, &format!("identity_object.{field}"));
    data.set(&id("version"), LittleEndian::read_u16(body))?;
    data.set(&id("sin_family"), BigEndian::read_u16(&body[2..]))?;
    data.set(&id("sin_port"), BigEndian::read_u16(&body[4..]))?;
    data.set(
        &id("sin_addr"),
        format!("{}.{}.{}.{}", body[6], body[7], body[8], body[9]),
    )?;
    // 8 bytes of sin_zero follow the address.
    let mut at = 18;
    let need = |n: usize| -> Result<(), Error> {
        if body.len() < n {
            Err(Error::Frame {
                reason: "truncated identity item".to_string(),
            })
        } else {
            Ok(())
        }
    };
    need(at + 8)?;
    data.set(&id("vendor_id"), LittleEndian::read_u16(&body[at..]))?;
    data.set(&id("device_type"), LittleEndian::read_u16(&body[at + 2..]))?;
    data.set(&id("product_code"), LittleEndian::read_u16(&body[at + 4..]))?;
    data.set(&id("product_revision"), LittleEndian::read_u16(&body[at + 6..]))?;
    at += 8;
    need(at + 8)?;
    data.set(&id("status_word"), LittleEndian::read_u16(&body[at..]))?;
    data.set(&id("serial_number"), LittleEndian::read_u32(&body[at + 2..]))?;
    let name_len = body[at + 6] as usize;
    at += 7;
    need(at + name_len + 1)?;
    data.set(
        &id("product_name"),
        String::from_utf8_lossy(&body[at..at + name_len]).into_owned(),
    )?;
    at += name_len;
    data.set(&id("state"), body[at])?;
    Ok(at + 1)
}

fn parse_communications(body: &[u8], data: &mut Dict, item: &str) -> Result<usize, Error> {
    if body.len() < 5 {
        return Err(Error::Frame {
            reason: "short communications service item".to_string(),
        });
    }
    let cs = |field: &str| automata::join(item, &format!("communications_service.{field}"));
    data.set(&cs("version"), LittleEndian::read_u16(body))?;
    data.set(&cs("capability"), LittleEndian::read_u16(&body[2..]))?;
    let name_end = body[4..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Frame {
            reason: "unterminated service name".to_string(),
        })?;
    data.set(
        &cs("service_name"),
        String::from_utf8_lossy(&body[4..4 + name_end]).into_owned(),
    )?;
    Ok(4 + name_end + 1)
}

/// The undocumented legacy 0x0001 item: version, a big-endian sockaddr,
/// and a NUL-padded textual IP address.
fn parse_legacy(body: &[u8], data: &mut Dict, item: &str) -> Result<usize, Error> {
    if body.len() < 36 {
        return Err(Error::Frame {
            reason: "short legacy 0x0001 item".to_string(),
        });
    }
    let lg = |field: &str| automata::join(item, &format!("legacy_CPF_0x0001.{field}"));
    data.set(&lg("version"), LittleEndian::read_u16(body))?;
    data.set(&lg("unknown_1"), LittleEndian::read_u16(&body[2..]))?;
    data.set(&lg("sin_family"), BigEndian::read_u16(&body[4..]))?;
    data.set(&lg("sin_port"), BigEndian::read_u16(&body[6..]))?;
    data.set(
        &lg("sin_addr"),
        format!("{}.{}.{}.{}", body[8], body[9], body[10], body[11]),
    )?;
    let text = &body[20..36];
    let end = text.iter().position(|&b| b == 0).unwrap_or(16);
    data.set(
        &lg("ip_address"),
        String::from_utf8_lossy(&text[..end]).into_owned(),
    )?;
    Ok(36)
}

/// Encode the CPF item list at `path`. Lengths are recomputed from the
/// bodies actually produced.
pub fn produce(data: &Dict, path: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let Ok(count) = data.get_int(&automata::join(path, "count")) else {
        return Ok(out); // no item list at all
    };
    put_u16(&mut out, count as u16);
    for i in 0..count {
        let item = automata::join(path, &format!("item[{i}]"));
        let type_id = data.get_int(&automata::join(&item, "type_id"))? as u16;
        let body = produce_item_body(data, &item, type_id)?;
        put_u16(&mut out, type_id);
        put_u16(&mut out, body.len() as u16);
        out.extend_from_slice(&body);
    }
    Ok(out)
}

fn produce_item_body(data: &Dict, item: &str, type_id: u16) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    match type_id {
        item_type::NULL_ADDRESS => {}
        item_type::CONNECTED_ADDRESS => {
            let id = data.get_int(&automata::join(item, "connection_ID.connection"))?;
            put_u32(&mut out, id as u32);
        }
        item_type::CONNECTED_DATA => {
            let sequence = data.get_int(&automata::join(item, "connection_data.sequence"))?;
            put_u16(&mut out, sequence as u16);
            out.extend_from_slice(&embedded_request(data, &automata::join(
                item,
                "connection_data.request",
            ))?);
        }
        item_type::UNCONNECTED_DATA => {
            out.extend_from_slice(&embedded_request(data, &automata::join(
                item,
                "unconnected_send.request",
            ))?);
        }
        item_type::IDENTITY => produce_identity(data, item, &mut out)?,
        item_type::COMMUNICATIONS => {
            let cs =
                |field: &str| automata::join(item, &format!("communications_service.{field}"));
            put_u16(&mut out, data.get_int(&cs("version"))? as u16);
            put_u16(&mut out, data.get_int(&cs("capability"))? as u16);
            out.extend_from_slice(data.get_str(&cs("service_name"))?.as_bytes());
            out.push(0x00);
        }
        item_type::LEGACY_0X0001 => {
            let lg = |field: &str| automata::join(item, &format!("legacy_CPF_0x0001.{field}"));
            put_u16(&mut out, data.get_int(&lg("version"))? as u16);
            put_u16(&mut out, data.get_int(&lg("unknown_1")).unwrap_or(0) as u16);
            put_u16_be(&mut out, data.get_int(&lg("sin_family"))? as u16);
            put_u16_be(&mut out, data.get_int(&lg("sin_port"))? as u16);
            write_quad(data.get_str(&lg("sin_addr"))?, &mut out)?;
            out.extend_from_slice(&[0u8; 8]);
            let mut text = data.get_str(&lg("ip_address"))?.as_bytes().to_vec();
            text.resize(16, 0);
            out.extend_from_slice(&text);
        }
        _ => {
            if let Ok(raw) = data.get_bytes(&automata::join(item, "input")) {
                out.extend_from_slice(raw);
            }
        }
    }
    Ok(out)
}

/// An embedded request's bytes: the raw capture if untouched, or its
/// re-production after dispatch mutated it into a reply.
fn embedded_request(data: &Dict, path: &str) -> Result<Vec<u8>, Error> {
    if data.contains(&automata::join(path, "service")) {
        return Ok(cip::request::produce(data, path)?);
    }
    Ok(data.get_bytes(&automata::join(path, "input"))?.to_vec())
}

fn produce_identity(data: &Dict, item: &str, out: &mut Vec<u8>) -> Result<(), Error> {
    let id = |field: &str| automata::join(item, &format!("identity_object.{field}"));
    put_u16(out, data.get_int(&id("version"))? as u16);
    put_u16_be(out, data.get_int(&id("sin_family"))? as u16);
    put_u16_be(out, data.get_int(&id("sin_port"))? as u16);
    write_quad(data.get_str(&id("sin_addr"))?, out)?;
    out.extend_from_slice(&[0u8; 8]);
    put_u16(out, data.get_int(&id("vendor_id"))? as u16);
    put_u16(out, data.get_int(&id("device_type"))? as u16);
    put_u16(out, data.get_int(&id("product_code"))? as u16);
    put_u16(out, data.get_int(&id("product_revision"))? as u16);
    put_u16(out, data.get_int(&id("status_word"))? as u16);
    put_u32(out, data.get_int(&id("serial_number"))? as u32);
    let name = data.get_str(&id("product_name"))?;
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(data.get_int(&id("state"))? as u8);
    Ok(())
}

fn write_quad(addr: &str, out: &mut Vec<u8>) -> Result<(), Error> {
    for part in addr.split('.') {
        out.push(part.parse::<u8>().map_err(|_| Error::Frame {
            reason: format!("bad dotted-quad address {addr:?}"),
        })?);
    }
    Ok(())
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u16_be(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_and_zero() {
        let mut data = Dict::new();
        parse(b"", &mut data, "CPF").unwrap();
        assert!(data.contains("CPF"));
        assert!(!data.contains("CPF.count"));

        let mut data = Dict::new();
        parse(&[0x00, 0x00], &mut data, "CPF").unwrap();
        assert_eq!(data.get_int("CPF.count").unwrap(), 0);
        assert_eq!(produce(&data, "CPF").unwrap(), [0x00, 0x00]);
    }

    #[test]
    fn test_communications_item() {
        let raw = [
            0x01, 0x00, 0x00, 0x01, 0x08, 0x00, 0x03, 0x00, 0x04, 0x00, b'a', b'b', b'c',
            0x00,
        ];
        let mut data = Dict::new();
        parse(&raw, &mut data, "CPF").unwrap();
        assert_eq!(data.get_int("CPF.count").unwrap(), 1);
        assert_eq!(data.get_int("CPF.item[0].type_id").unwrap(), 0x0100);
        assert_eq!(data.get_int("CPF.item[0].length").unwrap(), 8);
        assert_eq!(
            data.get_int("CPF.item[0].communications_service.version").unwrap(),
            3
        );
        assert_eq!(
            data.get_int("CPF.item[0].communications_service.capability").unwrap(),
            4
        );
        assert_eq!(
            data.get_str("CPF.item[0].communications_service.service_name").unwrap(),
            "abc"
        );
        assert_eq!(produce(&data, "CPF").unwrap(), raw);
    }

    #[test]
    fn test_unconnected_item_pair() {
        // Null address + unconnected data carrying an embedded request.
        let raw = [
            0x02, 0x00, //
            0x00, 0x00, 0x00, 0x00, //
            0xb2, 0x00, 0x06, 0x00, 0x01, 0x02, 0x20, 0x01, 0x24, 0x01,
        ];
        let mut data = Dict::new();
        parse(&raw, &mut data, "CPF").unwrap();
        assert_eq!(data.get_int("CPF.count").unwrap(), 2);
        assert_eq!(data.get_int("CPF.item[0].type_id").unwrap(), 0);
        assert_eq!(data.get_int("CPF.item[0].length").unwrap(), 0);
        assert_eq!(data.get_int("CPF.item[1].type_id").unwrap(), 0xb2);
        assert_eq!(
            data.get_bytes("CPF.item[1].unconnected_send.request.input").unwrap(),
            [0x01, 0x02, 0x20, 0x01, 0x24, 0x01]
        );
        assert_eq!(produce(&data, "CPF").unwrap(), raw);
    }

    #[test]
    fn test_connected_item_pair() {
        let raw = [
            0x02, 0x00, //
            0xa1, 0x00, 0x04, 0x00, 0x16, 0x00, 0xee, 0x8d, //
            0xb1, 0x00, 0x06, 0x00, 0x02, 0x00, 0x4d, 0x01, 0x00, 0x01,
        ];
        let mut data = Dict::new();
        parse(&raw, &mut data, "CPF").unwrap();
        assert_eq!(
            data.get_int("CPF.item[0].connection_ID.connection").unwrap(),
            0x8dee0016u32 as i64
        );
        assert_eq!(
            data.get_int("CPF.item[1].connection_data.sequence").unwrap(),
            2
        );
        assert_eq!(
            data.get_bytes("CPF.item[1].connection_data.request.input").unwrap(),
            [0x4d, 0x01, 0x00, 0x01]
        );
        assert_eq!(produce(&data, "CPF").unwrap(), raw);
    }

    #[test]
    fn test_identity_item_with_bad_length() {
        // A PowerFlex-style List Identity item whose declared length
        // understates the body: field-driven parsing recovers it whole.
        fn identity_item(length: u16) -> Vec<u8> {
            let mut raw = vec![0x01, 0x00, 0x0c, 0x00];
            raw.extend_from_slice(&length.to_le_bytes());
            raw.extend_from_slice(&[0x01, 0x00]); // version
            raw.extend_from_slice(&[0x00, 0x02]); // family (BE)
            raw.extend_from_slice(&[0xaf, 0x12]); // port 44818 (BE)
            raw.extend_from_slice(&[10, 161, 1, 5]);
            raw.extend_from_slice(&[0u8; 8]);
            raw.extend_from_slice(&[0x01, 0x00]); // vendor
            raw.extend_from_slice(&[0x7b, 0x00]); // device type
            raw.extend_from_slice(&[0x90, 0x04]); // product code
            raw.extend_from_slice(&[0x0b, 0x01]); // revision
            raw.extend_from_slice(&[0x61, 0x05]); // status word
            raw.extend_from_slice(&[0x15, 0x1d, 0x49, 0x80]); // serial
            raw.push(32);
            raw.extend_from_slice(b"PowerFlex 753                   ");
            raw.push(0xff); // state
            raw
        }

        for length in [66u16, 39] {
            let raw = identity_item(length);
            let mut data = Dict::new();
            parse(&raw, &mut data, "CPF").unwrap();
            let id = "CPF.item[0].identity_object";
            assert_eq!(data.get_int(&format!("{id}.vendor_id")).unwrap(), 1);
            assert_eq!(data.get_int(&format!("{id}.device_type")).unwrap(), 0x7b);
            assert_eq!(data.get_int(&format!("{id}.product_code")).unwrap(), 0x0490);
            assert_eq!(data.get_int(&format!("{id}.sin_port")).unwrap(), 44818);
            assert_eq!(data.get_str(&format!("{id}.sin_addr")).unwrap(), "10.161.1.5");
            assert_eq!(
                data.get_str(&format!("{id}.product_name")).unwrap(),
                "PowerFlex 753                   "
            );
            assert_eq!(data.get_int(&format!("{id}.state")).unwrap(), 0xff);
            assert_eq!(
                data.get_int(&format!("{id}.serial_number")).unwrap(),
                0x80491d15u32 as i64
            );
            // Production emits the corrected length either way.
            assert_eq!(produce(&data, "CPF").unwrap(), identity_item(66));
        }
    }
}
