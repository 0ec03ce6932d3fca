//! The Common Industrial Protocol layer: primitive codecs, Encoded
//! Paths, the Object/Attribute model, and the standard objects a
//! Logix-style communication front-end presents (Identity, TCP/IP,
//! Message Router with tag services, Connection Manager).
//!
//! Requests arrive as parsed data dictionaries (see [`request`]), are
//! dispatched to the addressed object via [`Device::dispatch`], mutated
//! in place into replies, and serialised back with [`request::produce`].

use dict::Dict;
use std::sync::Arc;

pub mod connection;
pub mod epath;
pub mod logix;
pub mod object;
pub mod request;
pub mod symbol;
pub mod types;

pub use connection::{Connection, ConnectionManager, Connections};
pub use logix::Logix;
pub use object::{Attribute, Identity, Object, ObjectCore, Registry, StandardObject, Tcpip};
pub use symbol::{CipAddr, SymbolTable, TagDef, TagSpec};
pub use types::CipType;

/// CIP service codes; a reply echoes its request code with the high bit
/// set.
pub mod service {
    pub const GA_ALL_REQ: u8 = 0x01;
    pub const GA_ALL_RPY: u8 = 0x81;
    pub const GA_LST_REQ: u8 = 0x03;
    pub const GA_LST_RPY: u8 = 0x83;
    pub const MULTIPLE_REQ: u8 = 0x0A;
    pub const MULTIPLE_RPY: u8 = 0x8A;
    pub const GA_SNG_REQ: u8 = 0x0E;
    pub const GA_SNG_RPY: u8 = 0x8E;
    pub const SA_SNG_REQ: u8 = 0x10;
    pub const SA_SNG_RPY: u8 = 0x90;
    pub const RD_TAG_REQ: u8 = 0x4C;
    pub const RD_TAG_RPY: u8 = 0xCC;
    pub const WR_TAG_REQ: u8 = 0x4D;
    pub const WR_TAG_RPY: u8 = 0xCD;
    pub const FWD_CLOSE_REQ: u8 = 0x4E;
    pub const FWD_CLOSE_RPY: u8 = 0xCE;
    pub const RD_FRG_REQ: u8 = 0x52;
    pub const RD_FRG_RPY: u8 = 0xD2;
    /// To the Connection Manager, 0x52 is Unconnected Send instead.
    pub const UNC_SEND_REQ: u8 = 0x52;
    pub const WR_FRG_REQ: u8 = 0x53;
    pub const WR_FRG_RPY: u8 = 0xD3;
    pub const FWD_OPEN_REQ: u8 = 0x54;
    pub const FWD_OPEN_RPY: u8 = 0xD4;
    pub const FWD_OPEN_LARGE_REQ: u8 = 0x5B;
    pub const FWD_OPEN_LARGE_RPY: u8 = 0xDB;
}

/// CIP general status codes, plus the extended words this stack emits.
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const CONNECTION_FAILURE: u8 = 0x01;
    pub const CAPACITY_EXCEEDED: u8 = 0x02;
    pub const PATH_SEGMENT_ERROR: u8 = 0x04;
    pub const PATH_UNKNOWN: u8 = 0x05;
    pub const PARTIAL_TRANSFER: u8 = 0x06;
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x08;
    pub const NOT_ENOUGH_DATA: u8 = 0x13;
    pub const PATH_SIZE_INVALID: u8 = 0x26;

    pub const EXT_INVALID_CONNECTION_PATH: u16 = 0x0311;
    pub const EXT_CONNECTION_NOT_FOUND: u16 = 0x0100;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A service outcome to be reported to the peer as a CIP status.
    #[error("CIP status {code:#04x}")]
    Status { code: u8, extended: Vec<u16> },

    #[error("parse failed: {reason}")]
    ParseFailed { reason: String },

    #[error("bad path: {reason}")]
    BadPath { reason: String },

    #[error("unrecognized symbolic name {name:?}")]
    UnknownSymbol { name: String },

    #[error("unknown CIP type tag {tag:#06x}")]
    UnknownType { tag: u16 },

    #[error("cannot encode {value} as {ty:?}")]
    BadValue { ty: CipType, value: String },

    #[error("bad tag {text:?}: {reason}")]
    BadTag { text: String, reason: String },

    #[error(transparent)]
    Dict(#[from] dict::Error),

    #[error(transparent)]
    Automata(#[from] automata::Error),
}

/// The process-wide CIP state: object registry, tag symbol table, and
/// live connections. Built once at startup and shared (read-mostly) by
/// every session.
pub struct Device {
    pub registry: Registry,
    pub symbols: SymbolTable,
    pub connections: Connections,
}

impl Default for Device {
    fn default() -> Self {
        Device::new()
    }
}

impl Device {
    pub fn new() -> Device {
        Device {
            registry: Registry::new(),
            symbols: SymbolTable::new(),
            connections: Connections::new(),
        }
    }

    /// A device presenting the standard object complement: Identity,
    /// TCP/IP, the Logix Message Router, and the Connection Manager.
    pub fn with_standard_objects() -> Device {
        let device = Device::new();
        device.registry.register(Arc::new(Identity::new("Identity")));
        device.registry.register(Arc::new(Tcpip::new("TCPIP")));
        device.registry.register(Arc::new(Logix::new("Message Router")));
        device
            .registry
            .register(Arc::new(ConnectionManager::new("Connection Manager")));
        device
    }

    /// Define a tag: create (or find) its attribute storage and bind the
    /// symbol. Tags without an explicit address land on the Message
    /// Router instance under the next free attribute id.
    pub fn define_tag(&self, def: &TagDef) -> Result<CipAddr, Error> {
        let name = def.spec.name.clone();
        let (class, instance, attribute) = match def.spec.address {
            Some((class, instance, attribute, _)) => {
                (class, instance, attribute.unwrap_or(1))
            }
            None => {
                let router = self
                    .registry
                    .lookup(logix::Logix::CLASS, 1)
                    .ok_or_else(|| Error::BadPath {
                        reason: "no Message Router to hold tags".to_string(),
                    })?;
                let next = router
                    .core()
                    .attributes()
                    .last()
                    .map(|(id, _)| id + 1)
                    .unwrap_or(1);
                (logix::Logix::CLASS, 1, next)
            }
        };

        let object = match self.registry.lookup(class, instance) {
            Some(object) => object,
            None => {
                let object: Arc<dyn Object> = Arc::new(StandardObject::new(
                    class,
                    instance,
                    name.clone().unwrap_or_else(|| format!("Class {class:#x}")),
                ));
                self.registry.register(object.clone());
                object
            }
        };
        let label = name.clone().unwrap_or_else(|| format!("@{class:#x}/{instance}/{attribute}"));
        object.core().insert_attribute(
            attribute,
            Attribute::array(label, def.ty, def.length, def.values.clone()),
        );

        let addr = CipAddr::new(class, instance, Some(attribute));
        if let Some(name) = name {
            self.symbols.define(name, addr);
        }
        Ok(addr)
    }

    /// Parse a raw CIP request and execute it against the addressed
    /// object, leaving the reply in `data` under `path`. Returns false
    /// when the connection should be dropped instead of answered.
    pub fn dispatch(&self, raw: &[u8], data: &mut Dict, path: &str) -> Result<bool, Error> {
        if raw.is_empty() {
            return Ok(false);
        }
        let service = raw[0];
        if service & 0x80 != 0 {
            // Inbound replies have no place here.
            tracing::debug!(service, "dropping unexpected reply frame");
            return Ok(false);
        }

        // Peek the path to pick the target object (and so its parser).
        let object = match self.peek_target(raw) {
            Ok(object) => object,
            Err(err) => {
                tracing::debug!(%err, service, "request addresses no object");
                data.set(&automata::join(path, "service"), service)?;
                let status = match err {
                    Error::UnknownSymbol { .. } => Error::Status {
                        code: status::PATH_SEGMENT_ERROR,
                        extended: vec![0x0000],
                    },
                    Error::Status { code, extended } => Error::Status { code, extended },
                    _ => Error::Status {
                        code: status::PATH_SEGMENT_ERROR,
                        extended: vec![],
                    },
                };
                return object::finish_reply(data, path, service, Err(status));
            }
        };

        request::parse(&object.parser(), raw, data, path)?;
        object.request(data, path, self)
    }

    /// Execute an already-parsed request at `path` (used for Multiple
    /// Service Packet sub-requests).
    pub fn execute(&self, data: &mut Dict, path: &str) -> Result<bool, Error> {
        let at = |field: &str| automata::join(path, field);
        let service = data.get_int(&at("service"))? as u8;
        if data.contains(&at("unparsed")) {
            return object::finish_reply(
                data,
                path,
                service,
                Err(Error::Status {
                    code: status::SERVICE_NOT_SUPPORTED,
                    extended: vec![],
                }),
            );
        }
        let resolved = epath::resolve(data, &at("path"), &self.symbols, false);
        let object = match resolved {
            Ok((class, instance, _)) => match self.registry.lookup(class, instance) {
                Some(object) => object,
                None => {
                    return object::finish_reply(
                        data,
                        path,
                        service,
                        Err(Error::Status {
                            code: status::PATH_UNKNOWN,
                            extended: vec![],
                        }),
                    )
                }
            },
            Err(err) => {
                let status = match err {
                    Error::UnknownSymbol { .. } => Error::Status {
                        code: status::PATH_SEGMENT_ERROR,
                        extended: vec![0x0000],
                    },
                    _ => Error::Status {
                        code: status::PATH_SEGMENT_ERROR,
                        extended: vec![],
                    },
                };
                return object::finish_reply(data, path, service, Err(status));
            }
        };
        object.request(data, path, self)
    }

    /// Resolve the request's path straight off the wire prefix.
    fn peek_target(&self, raw: &[u8]) -> Result<Arc<dyn Object>, Error> {
        if raw.len() < 2 {
            return Err(Error::Status {
                code: status::NOT_ENOUGH_DATA,
                extended: vec![],
            });
        }
        let words = raw[1] as usize;
        if raw.len() < 2 + 2 * words {
            return Err(Error::Status {
                code: status::PATH_SIZE_INVALID,
                extended: vec![],
            });
        }
        let segments = epath::parse_segments(&raw[2..2 + 2 * words])?;
        let values: Vec<dict::Value> = segments.into_iter().map(dict::Value::Dict).collect();
        let (class, instance, _) = epath::resolve_values(&values, &self.symbols, false)?;
        self.registry.lookup(class, instance).ok_or(Error::Status {
            code: status::PATH_UNKNOWN,
            extended: vec![],
        })
    }
}
