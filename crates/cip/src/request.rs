//! CIP request/reply parsing and production.
//!
//! Each CIP Object family owns a parser machine: the service byte is read
//! first, the machine branches on it (and, for replies, on the status),
//! and the operands land in the request dictionary under the names the
//! rest of the stack, and [`produce`], agree on. Production is the
//! inverse: a mutated request dictionary is serialised back to the wire,
//! so `produce(parse(b)) == b` for well-formed requests whose paths
//! already use their shortest encodings.

use automata::{
    Builder, Format, Kind, Machine, Need, Number, Octets, Progress, Repeat, Runner, Scan,
    Select, Source, State, Words,
};
use byteorder::{ByteOrder, LittleEndian};
use dict::{Dict, Value};
use std::sync::{Arc, OnceLock};

use crate::epath::{self, Epath};
use crate::types::{produce_typed_data, CipType, TypeOf, TypedData};
use crate::{service, Error};

/// Which service repertoire a parser understands. Service 0x52 is Read
/// Tag Fragmented to a Message Router, but Unconnected Send to the
/// Connection Manager; the object being addressed decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Get/Set Attribute services only.
    Base,
    /// Base plus Multiple Service Packet and the Logix tag services.
    Logix,
    /// Base plus Unconnected Send and Forward Open/Close.
    ConnectionManager,
}

/// The full-repertoire parser used for embedded and batched requests.
pub fn logix_parser() -> Arc<Machine> {
    static PARSER: OnceLock<Arc<Machine>> = OnceLock::new();
    PARSER.get_or_init(|| build_parser(Dialect::Logix)).clone()
}

pub fn connection_manager_parser() -> Arc<Machine> {
    static PARSER: OnceLock<Arc<Machine>> = OnceLock::new();
    PARSER
        .get_or_init(|| build_parser(Dialect::ConnectionManager))
        .clone()
}

pub fn base_parser() -> Arc<Machine> {
    static PARSER: OnceLock<Arc<Machine>> = OnceLock::new();
    PARSER.get_or_init(|| build_parser(Dialect::Base)).clone()
}

/// Parse a complete request/reply buffer into `data` under `path`. On
/// failure, fields parsed before the failure point remain (notably the
/// service code, which error replies echo).
pub fn parse(machine: &Arc<Machine>, raw: &[u8], data: &mut Dict, path: &str) -> Result<(), Error> {
    let mut source = Source::complete(raw.to_vec());
    let mut run = Runner::with_path(machine.clone(), path);
    match run.run(&mut source, data) {
        Ok(Progress::Terminal) => Ok(()),
        Ok(_) => Err(Error::ParseFailed {
            reason: run
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "incomplete request".to_string()),
        }),
        Err(err) => Err(Error::ParseFailed {
            reason: err.to_string(),
        }),
    }
}

fn num(format: Format, ctx: &str) -> State {
    State::new(ctx, Kind::Scan(Arc::new(Number { format }))).context(ctx)
}

/// Marks a service with no operands by creating an empty dict, so its
/// presence is testable.
#[derive(Debug)]
struct Mark;

impl Scan for Mark {
    fn need(&self, _got: &[u8], _data: &Dict, _path: &str) -> Result<Need, automata::Error> {
        Ok(Need::More(0))
    }

    fn decode(&self, _got: &[u8], data: &mut Dict, path: &str) -> Result<(), automata::Error> {
        data.set_default(path, Dict::new())?;
        Ok(())
    }
}

/// Captures every remaining byte into `{path}.input`.
#[derive(Debug)]
struct Rest;

impl Scan for Rest {
    fn need(&self, _got: &[u8], _data: &Dict, _path: &str) -> Result<Need, automata::Error> {
        Ok(Need::MoreOrDone(1))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), automata::Error> {
        data.set(&automata::join(path, "input"), got.to_vec())?;
        Ok(())
    }
}

/// Consumes `count` bytes silently (reserved fields).
#[derive(Debug)]
struct Pad {
    count: usize,
}

impl Scan for Pad {
    fn need(&self, got: &[u8], _data: &Dict, _path: &str) -> Result<Need, automata::Error> {
        Ok(Need::More(self.count.saturating_sub(got.len())))
    }

    fn decode(&self, _got: &[u8], _data: &mut Dict, _path: &str) -> Result<(), automata::Error> {
        Ok(())
    }
}

/// Consumes one pad byte when the length named by `path` is odd.
#[derive(Debug)]
struct PadIfOdd {
    length: Repeat,
}

impl Scan for PadIfOdd {
    fn need(&self, got: &[u8], data: &Dict, path: &str) -> Result<Need, automata::Error> {
        let length = self.length.resolve(data, path)?;
        Ok(Need::More((length % 2).saturating_sub(got.len())))
    }

    fn decode(&self, _got: &[u8], _data: &mut Dict, _path: &str) -> Result<(), automata::Error> {
        Ok(())
    }
}

/// Reply extended status: a word count then that many 16-bit words, into
/// `{path}.size` and `{path}.data`.
#[derive(Debug)]
struct StatusExt;

impl Scan for StatusExt {
    fn need(&self, got: &[u8], _data: &Dict, _path: &str) -> Result<Need, automata::Error> {
        let total = match got.first() {
            None => 1,
            Some(&size) => 1 + 2 * size as usize,
        };
        Ok(Need::More(total.saturating_sub(got.len())))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), automata::Error> {
        let size = got[0] as usize;
        data.set(&automata::join(path, "size"), size)?;
        if size > 0 {
            let words: Vec<Value> = got[1..]
                .chunks(2)
                .map(|w| Value::Int(LittleEndian::read_u16(w) as i64))
                .collect();
            data.set(&automata::join(path, "data"), words)?;
        }
        Ok(())
    }
}

/// Get Attribute List request operands: a count then that many attribute
/// ids.
#[derive(Debug)]
struct AttributeList;

impl Scan for AttributeList {
    fn need(&self, got: &[u8], _data: &Dict, _path: &str) -> Result<Need, automata::Error> {
        let total = match got.len() {
            0 | 1 => 2,
            _ => 2 + 2 * LittleEndian::read_u16(got) as usize,
        };
        Ok(Need::More(total.saturating_sub(got.len())))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), automata::Error> {
        let count = LittleEndian::read_u16(got) as usize;
        data.set(&automata::join(path, "count"), count)?;
        let ids: Vec<Value> = got[2..]
            .chunks(2)
            .map(|w| Value::Int(LittleEndian::read_u16(w) as i64))
            .collect();
        data.set(&automata::join(path, "attributes"), ids)?;
        Ok(())
    }
}

/// The trailing `remaining_path_size` + reserved pair of a failed
/// Forward Open reply, which some targets omit entirely.
#[derive(Debug)]
struct FwdFailTail;

impl Scan for FwdFailTail {
    fn need(&self, got: &[u8], _data: &Dict, _path: &str) -> Result<Need, automata::Error> {
        Ok(Need::MoreOrDone(2usize.saturating_sub(got.len())))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), automata::Error> {
        if let Some(&remaining) = got.first() {
            data.set(&automata::join(path, "remaining_path_size"), remaining)?;
        }
        Ok(())
    }
}

/// Multiple Service Packet envelope: count, offsets, then concatenated
/// sub-requests (or sub-replies), each re-parsed with the full parser
/// into `{path}.request[i]`. A malformed envelope sets
/// `{path}.malformed` for the router to report instead of dropping the
/// batch.
#[derive(Debug)]
struct Multiple;

impl Scan for Multiple {
    fn need(&self, _got: &[u8], _data: &Dict, _path: &str) -> Result<Need, automata::Error> {
        Ok(Need::MoreOrDone(1))
    }

    fn decode(&self, got: &[u8], data: &mut Dict, path: &str) -> Result<(), automata::Error> {
        match split_multiple(got) {
            Ok(slices) => {
                data.set(&automata::join(path, "number"), slices.len())?;
                let list: Vec<Value> =
                    slices.iter().map(|_| Value::Dict(Dict::new())).collect();
                data.set(&automata::join(path, "request"), list)?;
                for (i, slice) in slices.into_iter().enumerate() {
                    let sub = automata::join(path, &format!("request[{i}]"));
                    if let Err(err) = parse(&logix_parser(), slice, data, &sub) {
                        // The sub-request gets its own error reply later;
                        // remember the service so it can be echoed.
                        tracing::debug!(%err, index = i, "sub-request parse failed");
                        if let Some(&svc) = slice.first() {
                            data.set(&automata::join(&sub, "service"), svc)?;
                        }
                        data.set(&automata::join(&sub, "unparsed"), slice.to_vec())?;
                    }
                }
            }
            Err(reason) => {
                tracing::debug!(reason, "malformed Multiple Service Packet envelope");
                data.set(&automata::join(path, "malformed"), true)?;
            }
        }
        Ok(())
    }
}

/// Split a Multiple Service Packet payload into its sub-request slices.
fn split_multiple(got: &[u8]) -> Result<Vec<&[u8]>, &'static str> {
    if got.len() < 2 {
        return Err("missing count");
    }
    let count = LittleEndian::read_u16(got) as usize;
    if got.len() < 2 + 2 * count {
        return Err("missing offsets");
    }
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        offsets.push(LittleEndian::read_u16(&got[2 + 2 * i..]) as usize);
    }
    let mut slices = Vec::with_capacity(count);
    for (i, &beg) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(got.len());
        if beg > end || end > got.len() {
            return Err("offsets out of order or out of range");
        }
        slices.push(&got[beg..end]);
    }
    Ok(slices)
}

/// Build a parser machine for one service repertoire.
fn build_parser(dialect: Dialect) -> Arc<Machine> {
    let mut b = Builder::new(match dialect {
        Dialect::Base => "object",
        Dialect::Logix => "logix",
        Dialect::ConnectionManager => "connection_manager",
    });

    let svc = b.add(num(Format::U8, "service"));
    let path = b.add(
        State::new("path", Kind::Scan(Arc::new(Epath { route: false }))).context("path"),
    );
    let reserved = b.add(State::new("reserved", Kind::Drop));
    let status = b.add(num(Format::U8, "status"));
    let status_ext =
        b.add(State::new("status_ext", Kind::Scan(Arc::new(StatusExt))).context("status_ext"));
    b.eps(reserved, status);
    b.eps(status, status_ext);

    let unrecognized = b.add(
        State::new("unrecognized", Kind::Scan(Arc::new(Rest)))
            .context("unrecognized")
            .terminal(),
    );

    // --- request operands, entered from `path` ---

    let gaa = b.add(
        State::new("get_attributes_all", Kind::Scan(Arc::new(Mark)))
            .context("get_attributes_all")
            .terminal(),
    );
    let gas = b.add(
        State::new("get_attribute_single", Kind::Scan(Arc::new(Mark)))
            .context("get_attribute_single")
            .terminal(),
    );
    let gal = b.add(
        State::new("get_attribute_list", Kind::Scan(Arc::new(AttributeList)))
            .context("get_attribute_list")
            .terminal(),
    );
    let sas = b.add(
        State::new(
            "set_attribute_single",
            Kind::Scan(Arc::new(TypedData {
                type_of: TypeOf::Fixed(CipType::Usint),
            })),
        )
        .context("set_attribute_single")
        .terminal(),
    );

    let mut request_cases: Vec<(i64, usize)> = vec![
        (service::GA_ALL_REQ as i64, path),
        (service::GA_SNG_REQ as i64, path),
        (service::GA_LST_REQ as i64, path),
        (service::SA_SNG_REQ as i64, path),
    ];
    let mut reply_cases: Vec<(i64, usize)> = vec![
        (service::GA_ALL_RPY as i64, reserved),
        (service::GA_SNG_RPY as i64, reserved),
        (service::GA_LST_RPY as i64, reserved),
        (service::SA_SNG_RPY as i64, reserved),
    ];
    let mut operand_cases: Vec<(i64, usize)> = vec![
        (service::GA_ALL_REQ as i64, gaa),
        (service::GA_SNG_REQ as i64, gas),
        (service::GA_LST_REQ as i64, gal),
        (service::SA_SNG_REQ as i64, sas),
    ];

    let done = b.add(State::new("done", Kind::Noop).terminal());
    let gaa_rpy = b.add(
        State::new(
            "get_attributes_all",
            Kind::Scan(Arc::new(TypedData {
                type_of: TypeOf::Fixed(CipType::Usint),
            })),
        )
        .context("get_attributes_all")
        .terminal(),
    );
    let gas_rpy = b.add(
        State::new(
            "get_attribute_single",
            Kind::Scan(Arc::new(TypedData {
                type_of: TypeOf::Fixed(CipType::Usint),
            })),
        )
        .context("get_attribute_single")
        .terminal(),
    );
    let gal_rpy = b.add(
        State::new(
            "get_attribute_list",
            Kind::Scan(Arc::new(TypedData {
                type_of: TypeOf::Fixed(CipType::Usint),
            })),
        )
        .context("get_attribute_list")
        .terminal(),
    );
    let mut reply_operand_cases: Vec<(i64, usize)> = vec![
        (service::GA_ALL_RPY as i64, gaa_rpy),
        (service::GA_SNG_RPY as i64, gas_rpy),
        (service::GA_LST_RPY as i64, gal_rpy),
        (service::SA_SNG_RPY as i64, done),
    ];

    match dialect {
        Dialect::Base => {}
        Dialect::Logix => {
            let multiple = b.add(
                State::new("multiple", Kind::Scan(Arc::new(Multiple)))
                    .context("multiple")
                    .terminal(),
            );
            let read_tag = b.add(
                num(Format::U16, "read_tag.elements").terminal(),
            );
            let (read_frag, _) = b.seq(vec![
                num(Format::U16, "read_frag.elements"),
                num(Format::U32, "read_frag.offset").terminal(),
            ]);
            let (write_tag, _) = b.seq(vec![
                num(Format::U16, "write_tag.type"),
                num(Format::U16, "write_tag.elements"),
                State::new(
                    "write_tag.data",
                    Kind::Scan(Arc::new(TypedData {
                        type_of: TypeOf::Path("type".to_string()),
                    })),
                )
                .context("write_tag")
                .terminal(),
            ]);
            let (write_frag, _) = b.seq(vec![
                num(Format::U16, "write_frag.type"),
                num(Format::U16, "write_frag.elements"),
                num(Format::U32, "write_frag.offset"),
                State::new(
                    "write_frag.data",
                    Kind::Scan(Arc::new(TypedData {
                        type_of: TypeOf::Path("type".to_string()),
                    })),
                )
                .context("write_frag")
                .terminal(),
            ]);

            request_cases.extend([
                (service::MULTIPLE_REQ as i64, path),
                (service::RD_TAG_REQ as i64, path),
                (service::RD_FRG_REQ as i64, path),
                (service::WR_TAG_REQ as i64, path),
                (service::WR_FRG_REQ as i64, path),
            ]);
            operand_cases.extend([
                (service::MULTIPLE_REQ as i64, multiple),
                (service::RD_TAG_REQ as i64, read_tag),
                (service::RD_FRG_REQ as i64, read_frag),
                (service::WR_TAG_REQ as i64, write_tag),
                (service::WR_FRG_REQ as i64, write_frag),
            ]);

            let multiple_rpy = b.add(
                State::new("multiple", Kind::Scan(Arc::new(Multiple)))
                    .context("multiple")
                    .terminal(),
            );
            // Read replies carry type + data only on success or partial
            // transfer; error replies end at the extended status.
            let (read_tag_data, _) = b.seq(vec![
                num(Format::U16, "read_tag.type"),
                State::new(
                    "read_tag.data",
                    Kind::Scan(Arc::new(TypedData {
                        type_of: TypeOf::Path("type".to_string()),
                    })),
                )
                .context("read_tag")
                .terminal(),
            ]);
            let read_tag_rpy = b.add(State::new("read_tag_reply", Kind::Noop));
            b.select(
                read_tag_rpy,
                Select {
                    path: "status".to_string(),
                    cases: vec![
                        (0x00, read_tag_data),
                        (crate::status::PARTIAL_TRANSFER as i64, read_tag_data),
                    ],
                    default: Some(done),
                },
            );
            let (read_frag_data, _) = b.seq(vec![
                num(Format::U16, "read_frag.type"),
                State::new(
                    "read_frag.data",
                    Kind::Scan(Arc::new(TypedData {
                        type_of: TypeOf::Path("type".to_string()),
                    })),
                )
                .context("read_frag")
                .terminal(),
            ]);
            let read_frag_rpy = b.add(State::new("read_frag_reply", Kind::Noop));
            b.select(
                read_frag_rpy,
                Select {
                    path: "status".to_string(),
                    cases: vec![
                        (0x00, read_frag_data),
                        (crate::status::PARTIAL_TRANSFER as i64, read_frag_data),
                    ],
                    default: Some(done),
                },
            );

            reply_cases.extend([
                (service::MULTIPLE_RPY as i64, reserved),
                (service::RD_TAG_RPY as i64, reserved),
                (service::RD_FRG_RPY as i64, reserved),
                (service::WR_TAG_RPY as i64, reserved),
                (service::WR_FRG_RPY as i64, reserved),
            ]);
            reply_operand_cases.extend([
                (service::MULTIPLE_RPY as i64, multiple_rpy),
                (service::RD_TAG_RPY as i64, read_tag_rpy),
                (service::RD_FRG_RPY as i64, read_frag_rpy),
                (service::WR_TAG_RPY as i64, done),
                (service::WR_FRG_RPY as i64, done),
            ]);
        }
        Dialect::ConnectionManager => {
            let (unc_send, _) = b.seq(vec![
                num(Format::U8, "priority"),
                num(Format::U8, "timeout_ticks"),
                num(Format::U16, "length"),
                State::new(
                    "request",
                    Kind::Scan(Arc::new(Octets {
                        repeat: Repeat::Path("..length".to_string()),
                    })),
                )
                .context("request"),
                State::new(
                    "pad",
                    Kind::Scan(Arc::new(PadIfOdd {
                        length: Repeat::Path("length".to_string()),
                    })),
                ),
                State::new("route_path", Kind::Scan(Arc::new(Epath { route: true })))
                    .context("route_path")
                    .terminal(),
            ]);

            let (fwd_open_head, fwd_open_tail) = b.seq(vec![
                num(Format::U8, "forward_open.priority_time_tick"),
                num(Format::U8, "forward_open.timeout_ticks"),
                num(Format::U32, "forward_open.O_T.connection_ID"),
                num(Format::U32, "forward_open.T_O.connection_ID"),
                num(Format::U16, "forward_open.connection_serial"),
                num(Format::U16, "forward_open.originator_vendor"),
                num(Format::U32, "forward_open.originator_serial"),
                num(Format::U8, "forward_open.connection_timeout_multiplier"),
                State::new("reserved", Kind::Scan(Arc::new(Pad { count: 3 }))),
                num(Format::U32, "forward_open.O_T.RPI"),
            ]);
            // Small Forward Open carries 16-bit network connection
            // parameters; Large Forward Open carries 32-bit ones.
            let (small_ncp, _) = b.seq(vec![
                num(Format::U16, "forward_open.O_T.NCP"),
                num(Format::U32, "forward_open.T_O.RPI"),
                num(Format::U16, "forward_open.T_O.NCP"),
                num(Format::U8, "forward_open.transport_class_triggers"),
                State::new(
                    "connection_path",
                    Kind::Scan(Arc::new(Epath { route: false })),
                )
                .context("forward_open.connection_path")
                .terminal(),
            ]);
            let (large_ncp, _) = b.seq(vec![
                num(Format::U32, "forward_open.O_T.NCP"),
                num(Format::U32, "forward_open.T_O.RPI"),
                num(Format::U32, "forward_open.T_O.NCP"),
                num(Format::U8, "forward_open.transport_class_triggers"),
                State::new(
                    "connection_path",
                    Kind::Scan(Arc::new(Epath { route: false })),
                )
                .context("forward_open.connection_path")
                .terminal(),
            ]);
            b.select(
                fwd_open_tail,
                Select {
                    path: "service".to_string(),
                    cases: vec![
                        (service::FWD_OPEN_REQ as i64, small_ncp),
                        (service::FWD_OPEN_LARGE_REQ as i64, large_ncp),
                    ],
                    default: None,
                },
            );

            let (fwd_close, _) = b.seq(vec![
                num(Format::U8, "forward_close.priority_time_tick"),
                num(Format::U8, "forward_close.timeout_ticks"),
                num(Format::U16, "forward_close.connection_serial"),
                num(Format::U16, "forward_close.originator_vendor"),
                num(Format::U32, "forward_close.originator_serial"),
                State::new(
                    "connection_path",
                    Kind::Scan(Arc::new(Epath { route: true })),
                )
                .context("forward_close.connection_path")
                .terminal(),
            ]);

            request_cases.extend([
                (service::UNC_SEND_REQ as i64, path),
                (service::FWD_OPEN_REQ as i64, path),
                (service::FWD_OPEN_LARGE_REQ as i64, path),
                (service::FWD_CLOSE_REQ as i64, path),
            ]);
            operand_cases.extend([
                (service::UNC_SEND_REQ as i64, unc_send),
                (service::FWD_OPEN_REQ as i64, fwd_open_head),
                (service::FWD_OPEN_LARGE_REQ as i64, fwd_open_head),
                (service::FWD_CLOSE_REQ as i64, fwd_close),
            ]);

            // Forward Open replies branch on status: success carries the
            // connection identifiers and APIs, failure the originator echo
            // and an optional remaining path size.
            let fwd_open_rpy = b.add(State::new("forward_open_reply", Kind::Noop));
            let (fwd_open_ok, _) = b.seq(vec![
                num(Format::U32, "forward_open.O_T.connection_ID"),
                num(Format::U32, "forward_open.T_O.connection_ID"),
                num(Format::U16, "forward_open.connection_serial"),
                num(Format::U16, "forward_open.originator_vendor"),
                num(Format::U32, "forward_open.originator_serial"),
                num(Format::U32, "forward_open.O_T.API"),
                num(Format::U32, "forward_open.T_O.API"),
                num(Format::U8, "forward_open.application.size"),
                State::new("reserved", Kind::Drop),
                State::new(
                    "application",
                    Kind::Scan(Arc::new(Words {
                        repeat: Repeat::Path("size".to_string()),
                    })),
                )
                .context("forward_open.application")
                .terminal(),
            ]);
            let (fwd_open_fail, _) = b.seq(vec![
                num(Format::U16, "forward_open.connection_serial"),
                num(Format::U16, "forward_open.originator_vendor"),
                num(Format::U32, "forward_open.originator_serial"),
                State::new("tail", Kind::Scan(Arc::new(FwdFailTail)))
                    .context("forward_open")
                    .terminal(),
            ]);
            b.select(
                fwd_open_rpy,
                Select {
                    path: "status".to_string(),
                    cases: vec![(0, fwd_open_ok)],
                    default: Some(fwd_open_fail),
                },
            );

            let fwd_close_rpy = b.add(State::new("forward_close_reply", Kind::Noop));
            let (fwd_close_ok, _) = b.seq(vec![
                num(Format::U16, "forward_close.connection_serial"),
                num(Format::U16, "forward_close.originator_vendor"),
                num(Format::U32, "forward_close.originator_serial"),
                num(Format::U8, "forward_close.application.size"),
                State::new("reserved", Kind::Drop),
                State::new(
                    "application",
                    Kind::Scan(Arc::new(Words {
                        repeat: Repeat::Path("size".to_string()),
                    })),
                )
                .context("forward_close.application")
                .terminal(),
            ]);
            b.select(
                fwd_close_rpy,
                Select {
                    path: "status".to_string(),
                    cases: vec![(0, fwd_close_ok)],
                    default: Some(done),
                },
            );

            reply_cases.extend([
                (service::FWD_OPEN_RPY as i64, reserved),
                (service::FWD_OPEN_LARGE_RPY as i64, reserved),
                (service::FWD_CLOSE_RPY as i64, reserved),
            ]);
            reply_operand_cases.extend([
                (service::FWD_OPEN_RPY as i64, fwd_open_rpy),
                (service::FWD_OPEN_LARGE_RPY as i64, fwd_open_rpy),
                (service::FWD_CLOSE_RPY as i64, fwd_close_rpy),
            ]);
        }
    }

    let mut service_cases = request_cases;
    service_cases.extend(reply_cases);
    b.select(
        svc,
        Select {
            path: "service".to_string(),
            cases: service_cases,
            default: Some(unrecognized),
        },
    );
    b.select(
        path,
        Select {
            path: "service".to_string(),
            cases: operand_cases,
            default: Some(unrecognized),
        },
    );
    b.select(
        status_ext,
        Select {
            path: "service".to_string(),
            cases: reply_operand_cases,
            default: Some(unrecognized),
        },
    );

    b.build()
}

/// Serialise the request/reply dict at `path` back to wire bytes.
pub fn produce(data: &Dict, path: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let at = |field: &str| automata::join(path, field);
    let service = data.get_int(&at("service"))? as u8;
    out.push(service);

    if service & 0x80 == 0 {
        // An unrecognized service was captured whole, path bytes and all.
        if data.contains(&at("path")) {
            epath::produce(data, &at("path"), false, &mut out)?;
        }
        produce_request_operands(data, path, service, &mut out)?;
    } else {
        out.push(0x00);
        let status = data.get_int(&at("status")).unwrap_or(0) as u8;
        out.push(status);
        let ext_size = data.get_int(&at("status_ext.size")).unwrap_or(0) as u8;
        out.push(ext_size);
        if ext_size > 0 {
            for word in data.get_list(&at("status_ext.data"))? {
                let w = word.as_int().unwrap_or(0) as u16;
                put_u16(&mut out, w);
            }
        }
        produce_reply_operands(data, path, service, status, &mut out)?;
    }
    Ok(out)
}

fn produce_request_operands(
    data: &Dict,
    path: &str,
    service: u8,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let at = |field: &str| automata::join(path, field);
    match service {
        service::GA_ALL_REQ | service::GA_SNG_REQ => {}
        service::GA_LST_REQ => {
            let ids = data.get_list(&at("get_attribute_list.attributes"))?;
            put_u16(out, ids.len() as u16);
            for id in ids {
                put_u16(out, id.as_int().unwrap_or(0) as u16);
            }
        }
        service::SA_SNG_REQ => {
            let bytes = data.get_list(&at("set_attribute_single.data"))?;
            produce_typed_data(CipType::Usint, bytes, out)?;
        }
        service::MULTIPLE_REQ => produce_multiple(data, &at("multiple"), out)?,
        service::RD_TAG_REQ => {
            let elements = data.get_int(&at("read_tag.elements"))? as u16;
            put_u16(out, elements);
        }
        service::RD_FRG_REQ => {
            if data.contains(&at("read_frag")) {
                let elements = data.get_int(&at("read_frag.elements"))? as u16;
                let offset = data.get_int(&at("read_frag.offset"))? as u32;
                put_u16(out, elements);
                put_u32(out, offset);
            } else {
                // Service 0x52 addressed to the Connection Manager.
                produce_unconnected_send(data, path, out)?;
            }
        }
        service::WR_TAG_REQ | service::WR_FRG_REQ => {
            let (op, fragmented) = if service == service::WR_TAG_REQ {
                ("write_tag", false)
            } else {
                ("write_frag", true)
            };
            let tag = data.get_int(&at(&format!("{op}.type")))? as u16;
            let ty = CipType::from_tag(tag).ok_or(Error::UnknownType { tag })?;
            put_u16(out, tag);
            put_u16(out, data.get_int(&at(&format!("{op}.elements")))? as u16);
            if fragmented {
                put_u32(out, data.get_int(&at(&format!("{op}.offset")))? as u32);
            }
            produce_typed_data(ty, data.get_list(&at(&format!("{op}.data")))?, out)?;
        }
        service::FWD_OPEN_REQ | service::FWD_OPEN_LARGE_REQ => {
            produce_forward_open(data, path, service == service::FWD_OPEN_LARGE_REQ, out)?;
        }
        service::FWD_CLOSE_REQ => {
            let fc = |field: &str| at(&format!("forward_close.{field}"));
            out.push(data.get_int(&fc("priority_time_tick"))? as u8);
            out.push(data.get_int(&fc("timeout_ticks"))? as u8);
            put_u16(out, data.get_int(&fc("connection_serial"))? as u16);
            put_u16(out, data.get_int(&fc("originator_vendor"))? as u16);
            put_u32(out, data.get_int(&fc("originator_serial"))? as u32);
            epath::produce(data, &fc("connection_path"), true, out)?;
        }
        _ => {
            if let Ok(raw) = data.get_bytes(&at("unrecognized.input")) {
                out.extend_from_slice(raw);
            }
        }
    }
    Ok(())
}

fn produce_unconnected_send(data: &Dict, path: &str, out: &mut Vec<u8>) -> Result<(), Error> {
    let at = |field: &str| automata::join(path, field);
    out.push(data.get_int(&at("priority"))? as u8);
    out.push(data.get_int(&at("timeout_ticks"))? as u8);
    let embedded = match data.get_bytes(&at("request.input")) {
        Ok(raw) => raw.to_vec(),
        // Re-produce the embedded request from its parsed form.
        Err(_) => produce(data, &at("request"))?,
    };
    put_u16(out, embedded.len() as u16);
    out.extend_from_slice(&embedded);
    if embedded.len() % 2 != 0 {
        out.push(0x00);
    }
    epath::produce(data, &at("route_path"), true, out)?;
    Ok(())
}

fn produce_forward_open(
    data: &Dict,
    path: &str,
    large: bool,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let fo = |field: &str| automata::join(path, &format!("forward_open.{field}"));
    out.push(data.get_int(&fo("priority_time_tick"))? as u8);
    out.push(data.get_int(&fo("timeout_ticks"))? as u8);
    put_u32(out, data.get_int(&fo("O_T.connection_ID"))? as u32);
    put_u32(out, data.get_int(&fo("T_O.connection_ID"))? as u32);
    put_u16(out, data.get_int(&fo("connection_serial"))? as u16);
    put_u16(out, data.get_int(&fo("originator_vendor"))? as u16);
    put_u32(out, data.get_int(&fo("originator_serial"))? as u32);
    out.push(data.get_int(&fo("connection_timeout_multiplier"))? as u8);
    out.extend_from_slice(&[0x00, 0x00, 0x00]);
    put_u32(out, data.get_int(&fo("O_T.RPI"))? as u32);
    let ncp_o_t = data.get_int(&fo("O_T.NCP"))? as u32;
    let ncp_t_o = data.get_int(&fo("T_O.NCP"))? as u32;
    if large {
        put_u32(out, ncp_o_t);
    } else {
        put_u16(out, ncp_o_t as u16);
    }
    put_u32(out, data.get_int(&fo("T_O.RPI"))? as u32);
    if large {
        put_u32(out, ncp_t_o);
    } else {
        put_u16(out, ncp_t_o as u16);
    }
    out.push(data.get_int(&fo("transport_class_triggers"))? as u8);
    epath::produce(data, &fo("connection_path"), false, out)?;
    Ok(())
}

fn produce_reply_operands(
    data: &Dict,
    path: &str,
    service: u8,
    status: u8,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let at = |field: &str| automata::join(path, field);
    match service {
        service::GA_ALL_RPY => {
            if let Ok(bytes) = data.get_list(&at("get_attributes_all.data")) {
                produce_typed_data(CipType::Usint, bytes, out)?;
            }
        }
        service::GA_SNG_RPY => {
            if let Ok(bytes) = data.get_list(&at("get_attribute_single.data")) {
                produce_typed_data(CipType::Usint, bytes, out)?;
            }
        }
        service::GA_LST_RPY => {
            if let Ok(bytes) = data.get_list(&at("get_attribute_list.data")) {
                produce_typed_data(CipType::Usint, bytes, out)?;
            }
        }
        service::SA_SNG_RPY | service::WR_TAG_RPY | service::WR_FRG_RPY => {}
        service::MULTIPLE_RPY => {
            // An envelope-failure reply carries no sub-replies at all.
            if data.contains(&at("multiple.request")) {
                produce_multiple(data, &at("multiple"), out)?;
            }
        }
        service::RD_TAG_RPY | service::RD_FRG_RPY => {
            let op = if service == service::RD_TAG_RPY {
                "read_tag"
            } else {
                "read_frag"
            };
            if status == 0x00 || status == 0x06 {
                let tag = data.get_int(&at(&format!("{op}.type")))? as u16;
                let ty = CipType::from_tag(tag).ok_or(Error::UnknownType { tag })?;
                put_u16(out, tag);
                produce_typed_data(ty, data.get_list(&at(&format!("{op}.data")))?, out)?;
            }
        }
        service::FWD_OPEN_RPY | service::FWD_OPEN_LARGE_RPY => {
            let fo = |field: &str| at(&format!("forward_open.{field}"));
            if status == 0x00 {
                put_u32(out, data.get_int(&fo("O_T.connection_ID"))? as u32);
                put_u32(out, data.get_int(&fo("T_O.connection_ID"))? as u32);
                put_u16(out, data.get_int(&fo("connection_serial"))? as u16);
                put_u16(out, data.get_int(&fo("originator_vendor"))? as u16);
                put_u32(out, data.get_int(&fo("originator_serial"))? as u32);
                put_u32(out, data.get_int(&fo("O_T.API"))? as u32);
                put_u32(out, data.get_int(&fo("T_O.API"))? as u32);
                let app = data
                    .get_bytes(&fo("application.input"))
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                out.push((app.len() / 2) as u8);
                out.push(0x00);
                out.extend_from_slice(&app);
            } else {
                put_u16(out, data.get_int(&fo("connection_serial"))? as u16);
                put_u16(out, data.get_int(&fo("originator_vendor"))? as u16);
                put_u32(out, data.get_int(&fo("originator_serial"))? as u32);
                if let Ok(remaining) = data.get_int(&fo("remaining_path_size")) {
                    out.push(remaining as u8);
                    out.push(0x00);
                }
            }
        }
        service::FWD_CLOSE_RPY => {
            if status == 0x00 {
                let fc = |field: &str| at(&format!("forward_close.{field}"));
                put_u16(out, data.get_int(&fc("connection_serial"))? as u16);
                put_u16(out, data.get_int(&fc("originator_vendor"))? as u16);
                put_u32(out, data.get_int(&fc("originator_serial"))? as u32);
                let app = data
                    .get_bytes(&fc("application.input"))
                    .map(|b| b.to_vec())
                    .unwrap_or_default();
                out.push((app.len() / 2) as u8);
                out.push(0x00);
                out.extend_from_slice(&app);
            }
        }
        _ => {
            if let Ok(raw) = data.get_bytes(&at("unrecognized.input")) {
                out.extend_from_slice(raw);
            }
        }
    }
    Ok(())
}

/// Encode a Multiple Service Packet envelope: count, per-request offsets
/// from the envelope start, then the concatenated sub-encodings.
fn produce_multiple(data: &Dict, path: &str, out: &mut Vec<u8>) -> Result<(), Error> {
    let requests = data.get_list(&automata::join(path, "request"))?;
    let count = requests.len();
    let mut encodings = Vec::with_capacity(count);
    for i in 0..count {
        let sub_path = automata::join(path, &format!("request[{i}]"));
        let sub = match data.get_bytes(&automata::join(&sub_path, "unparsed")) {
            Ok(raw) => raw.to_vec(),
            Err(_) => produce(data, &sub_path)?,
        };
        encodings.push(sub);
    }
    put_u16(out, count as u16);
    let mut offset = 2 + 2 * count;
    for enc in &encodings {
        put_u16(out, offset as u16);
        offset += enc.len();
    }
    for enc in &encodings {
        out.extend_from_slice(enc);
    }
    Ok(())
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
