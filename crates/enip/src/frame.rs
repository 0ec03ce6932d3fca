//! The EtherNet/IP encapsulation framing automaton.
//!
//! A frame is a 24-byte header followed by `length` payload bytes. The
//! framing machine runs over the session's byte source, suspending at
//! whatever point the socket has delivered only part of a frame, and
//! deposits `enip.command`, `enip.length`, `enip.session_handle`,
//! `enip.status`, `enip.sender_context.input`, `enip.options` and the
//! raw `enip.payload.input` bytes.

use automata::{Builder, Format, Kind, Machine, Number, Octets, Repeat, State};
use dict::Dict;
use std::sync::{Arc, OnceLock};

use crate::Error;

pub const HEADER_BYTES: usize = 24;

/// The frame-header + payload machine.
pub fn enip_machine() -> Arc<Machine> {
    static MACHINE: OnceLock<Arc<Machine>> = OnceLock::new();
    MACHINE
        .get_or_init(|| {
            let mut b = Builder::new("enip");
            b.seq(vec![
                num(Format::U16, "command"),
                num(Format::U16, "length"),
                num(Format::U32, "session_handle"),
                num(Format::U32, "status"),
                State::new(
                    "sender_context",
                    Kind::Scan(Arc::new(Octets {
                        repeat: Repeat::Count(8),
                    })),
                )
                .context("sender_context"),
                num(Format::U32, "options"),
                State::new(
                    "input",
                    Kind::Scan(Arc::new(Octets {
                        repeat: Repeat::Path("..length".to_string()),
                    })),
                )
                .context("payload")
                .terminal(),
            ]);
            b.build()
        })
        .clone()
}

fn num(format: Format, ctx: &str) -> State {
    State::new(ctx, Kind::Scan(Arc::new(Number { format }))).context(ctx)
}

/// Encode the frame at `path` (header from its fields, payload given
/// separately since replies re-produce it from parsed structure).
pub fn encode(data: &Dict, path: &str, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let at = |field: &str| automata::join(path, field);
    let mut out = Vec::with_capacity(HEADER_BYTES + payload.len());
    put_u16(&mut out, data.get_int(&at("command"))? as u16);
    put_u16(&mut out, payload.len() as u16);
    put_u32(&mut out, data.get_int(&at("session_handle")).unwrap_or(0) as u32);
    put_u32(&mut out, data.get_int(&at("status")).unwrap_or(0) as u32);
    let mut context = data
        .get_bytes(&at("sender_context.input"))
        .map(|b| b.to_vec())
        .unwrap_or_default();
    context.resize(8, 0);
    out.extend_from_slice(&context);
    put_u32(&mut out, data.get_int(&at("options")).unwrap_or(0) as u32);
    out.extend_from_slice(payload);
    Ok(out)
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
