//! Per-command payload parsing and production for the encapsulation
//! layer: the `enip.CIP` level of the request dictionary.

use byteorder::{ByteOrder, LittleEndian};
use dict::Dict;

use crate::{cpf, Error};

pub mod code {
    pub const NOP: u16 = 0x0000;
    pub const LEGACY: u16 = 0x0001;
    pub const LIST_SERVICES: u16 = 0x0004;
    pub const LIST_IDENTITY: u16 = 0x0063;
    pub const LIST_INTERFACES: u16 = 0x0064;
    pub const REGISTER_SESSION: u16 = 0x0065;
    pub const UNREGISTER_SESSION: u16 = 0x0066;
    pub const SEND_RR_DATA: u16 = 0x006F;
    pub const SEND_UNIT_DATA: u16 = 0x0070;
}

/// Encapsulation status codes.
pub mod status {
    pub const SUCCESS: u32 = 0x0000;
    pub const INVALID_COMMAND: u32 = 0x0001;
    pub const INVALID_SESSION: u32 = 0x0064;
    pub const INVALID_LENGTH: u32 = 0x0065;
}

/// Parse the payload of the frame at `path` (eg. `enip`) into its
/// command-specific `{path}.CIP` structure.
pub fn parse(data: &mut Dict, path: &str) -> Result<(), Error> {
    let at = |field: &str| automata::join(path, field);
    let command = data.get_int(&at("command"))? as u16;
    let payload = data.get_bytes(&at("payload.input"))?.to_vec();

    match command {
        code::NOP | code::UNREGISTER_SESSION => {}
        code::REGISTER_SESSION => {
            if payload.len() < 4 {
                return Err(Error::Frame {
                    reason: "short Register Session payload".to_string(),
                });
            }
            data.set(&at("CIP.register.version"), LittleEndian::read_u16(&payload))?;
            data.set(
                &at("CIP.register.options"),
                LittleEndian::read_u16(&payload[2..]),
            )?;
        }
        code::LIST_SERVICES => {
            cpf::parse(&payload, data, &at("CIP.list_services.CPF"))?;
        }
        code::LIST_IDENTITY => {
            cpf::parse(&payload, data, &at("CIP.list_identity.CPF"))?;
        }
        code::LIST_INTERFACES => {
            cpf::parse(&payload, data, &at("CIP.list_interfaces.CPF"))?;
        }
        code::LEGACY => {
            cpf::parse(&payload, data, &at("CIP.legacy.CPF"))?;
        }
        code::SEND_RR_DATA | code::SEND_UNIT_DATA => {
            if payload.len() < 6 {
                return Err(Error::Frame {
                    reason: "short send data payload".to_string(),
                });
            }
            data.set(
                &at("CIP.send_data.interface"),
                LittleEndian::read_u32(&payload),
            )?;
            data.set(
                &at("CIP.send_data.timeout"),
                LittleEndian::read_u16(&payload[4..]),
            )?;
            cpf::parse(&payload[6..], data, &at("CIP.send_data.CPF"))?;
        }
        other => {
            tracing::debug!(command = other, "unrecognized encapsulation command");
        }
    }
    Ok(())
}

/// Produce the payload bytes of the (reply) frame at `path` from its
/// `{path}.CIP` structure.
pub fn produce(data: &Dict, path: &str) -> Result<Vec<u8>, Error> {
    let at = |field: &str| automata::join(path, field);
    let command = data.get_int(&at("command"))? as u16;
    let mut out = Vec::new();
    match command {
        code::NOP | code::UNREGISTER_SESSION => {}
        code::REGISTER_SESSION => {
            put_u16(&mut out, data.get_int(&at("CIP.register.version"))? as u16);
            let options = data.get_int(&at("CIP.register.options")).unwrap_or(0);
            put_u16(&mut out, options as u16);
        }
        code::LIST_SERVICES => out = cpf::produce(data, &at("CIP.list_services.CPF"))?,
        code::LIST_IDENTITY => out = cpf::produce(data, &at("CIP.list_identity.CPF"))?,
        code::LIST_INTERFACES => out = cpf::produce(data, &at("CIP.list_interfaces.CPF"))?,
        code::LEGACY => out = cpf::produce(data, &at("CIP.legacy.CPF"))?,
        code::SEND_RR_DATA | code::SEND_UNIT_DATA => {
            let interface = data.get_int(&at("CIP.send_data.interface")).unwrap_or(0);
            let timeout = data.get_int(&at("CIP.send_data.timeout")).unwrap_or(0);
            put_u32(&mut out, interface as u32);
            put_u16(&mut out, timeout as u16);
            out.extend_from_slice(&cpf::produce(data, &at("CIP.send_data.CPF"))?);
        }
        _ => {
            if let Ok(raw) = data.get_bytes(&at("payload.input")) {
                out.extend_from_slice(raw);
            }
        }
    }
    Ok(out)
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
