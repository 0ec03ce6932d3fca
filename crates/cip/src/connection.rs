//! The Connection Manager (class 0x06): Unconnected Send, Forward Open /
//! Forward Close, and the table of live connections used by Class-1/3
//! connected messaging.

use automata::Machine;
use dict::{Dict, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::object::{finish_reply, Object, ObjectCore};
use crate::{epath, request, service, status, Device, Error};

/// Per-connection state established by Forward Open, addressable by both
/// the target-assigned O→T and the originator-assigned T→O IDs.
#[derive(Debug)]
pub struct Connection {
    pub o_t_id: u32,
    pub t_o_id: u32,
    pub connection_serial: u16,
    pub originator_vendor: u16,
    pub originator_serial: u32,
    pub o_t_rpi: u32,
    pub t_o_rpi: u32,
    pub transport_class_triggers: u8,
    pub timeout_multiplier: u8,
    /// Last accepted connected-data sequence number.
    sequence: Mutex<Option<u16>>,
    /// When traffic last arrived on this connection.
    last_seen: Mutex<Instant>,
}

impl Connection {
    /// Accept a connected-data sequence number if it is not a regression
    /// (wrap-around permitted); duplicates and stale numbers are refused.
    pub fn accept_sequence(&self, seq: u16) -> bool {
        let mut last = self.sequence.lock().expect("sequence lock poisoned");
        match *last {
            Some(prior) if seq.wrapping_sub(prior) == 0 || seq.wrapping_sub(prior) >= 0x8000 => {
                false
            }
            _ => {
                *last = Some(seq);
                true
            }
        }
    }

    /// Inactivity budget: RPI × (CIP timeout multiplier, 4×2^k).
    pub fn inactivity_budget(&self) -> Duration {
        let rpi = Duration::from_micros(self.o_t_rpi as u64);
        rpi * 4 * 2u32.saturating_pow(self.timeout_multiplier as u32)
    }

    /// Note traffic arriving on this connection.
    pub fn touch(&self) {
        *self.last_seen.lock().expect("last_seen lock poisoned") = Instant::now();
    }

    fn expired(&self, now: Instant) -> bool {
        let budget = self.inactivity_budget();
        if budget.is_zero() {
            return false; // an RPI of zero carries no timeout
        }
        now.duration_since(*self.last_seen.lock().expect("last_seen lock poisoned")) > budget
    }
}

/// The live-connection table, keyed by connection ID in both directions.
#[derive(Debug, Default)]
pub struct Connections {
    next_id: AtomicU32,
    map: Mutex<BTreeMap<u32, Arc<Connection>>>,
}

impl Connections {
    pub fn new() -> Connections {
        Connections {
            // An arbitrary non-zero seed keeps allocated IDs apart from
            // the small originator-chosen ones seen in captures.
            next_id: AtomicU32::new(0x6000_0001),
            map: Mutex::new(BTreeMap::new()),
        }
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn by_id(&self, id: u32) -> Option<Arc<Connection>> {
        self.map
            .lock()
            .expect("connection table lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        let mut map = self.map.lock().expect("connection table lock poisoned");
        map.insert(connection.o_t_id, connection.clone());
        map.insert(connection.t_o_id, connection);
    }

    /// Release the connection matching a Forward Close triple. Returns
    /// the released connection, if any.
    pub fn close(
        &self,
        connection_serial: u16,
        originator_vendor: u16,
        originator_serial: u32,
    ) -> Option<Arc<Connection>> {
        let mut map = self.map.lock().expect("connection table lock poisoned");
        let found = map
            .values()
            .find(|c| {
                c.connection_serial == connection_serial
                    && c.originator_vendor == originator_vendor
                    && c.originator_serial == originator_serial
            })
            .cloned()?;
        map.remove(&found.o_t_id);
        map.remove(&found.t_o_id);
        Some(found)
    }

    /// Drop a connection by either of its IDs (session teardown).
    pub fn release(&self, id: u32) -> Option<Arc<Connection>> {
        let mut map = self.map.lock().expect("connection table lock poisoned");
        let found = map.remove(&id)?;
        map.remove(&found.o_t_id);
        map.remove(&found.t_o_id);
        Some(found)
    }

    /// Release connections whose RPI × timeout-multiplier budget has
    /// passed without traffic; returns the released connections.
    pub fn sweep_expired(&self) -> Vec<Arc<Connection>> {
        let now = Instant::now();
        let mut map = self.map.lock().expect("connection table lock poisoned");
        let expired: Vec<Arc<Connection>> = map
            .iter()
            .filter(|(id, c)| **id == c.o_t_id && c.expired(now))
            .map(|(_, c)| c.clone())
            .collect();
        for c in &expired {
            map.remove(&c.o_t_id);
            map.remove(&c.t_o_id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        // Each connection appears under both IDs.
        self.map.lock().expect("connection table lock poisoned").len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().expect("connection table lock poisoned").is_empty()
    }
}

pub struct ConnectionManager {
    core: ObjectCore,
}

impl ConnectionManager {
    pub const CLASS: u16 = 0x06;

    pub fn new(name: impl Into<String>) -> ConnectionManager {
        ConnectionManager {
            core: ObjectCore::new(Self::CLASS, 1, name),
        }
    }

    /// Unconnected Send: dispatch the embedded request and collapse the
    /// wrapper, so the reply emitted for this item is the bare embedded
    /// reply.
    fn unconnected_send(
        &self,
        req: &mut Dict,
        path: &str,
        device: &Device,
    ) -> Result<bool, Error> {
        let embedded_path = automata::join(path, "request");
        let embedded = req
            .get_bytes(&automata::join(&embedded_path, "input"))?
            .to_vec();
        let proceed = device.dispatch(&embedded, req, &embedded_path)?;
        let reply = req.get(&embedded_path)?.clone();
        if path.is_empty() {
            if let Value::Dict(reply) = reply {
                *req = reply;
            }
        } else {
            req.set(path, reply)?;
        }
        Ok(proceed)
    }

    fn forward_open(
        &self,
        req: &mut Dict,
        path: &str,
        device: &Device,
        svc: u8,
    ) -> Result<bool, Error> {
        let fo = |field: &str| automata::join(path, &format!("forward_open.{field}"));

        // The connection path must land on a reachable object (usually
        // the Message Router). On failure, report how much of the path
        // was accepted before the faulting segment.
        let conn_path = fo("connection_path");
        let reachable = epath::resolve(req, &conn_path, &device.symbols, false)
            .ok()
            .and_then(|(class, instance, _)| device.registry.lookup(class, instance));
        if reachable.is_none() {
            let accepted = req
                .get_list(&automata::join(&conn_path, "segment"))
                .map(|segments| {
                    segments
                        .iter()
                        .take_while(|seg| {
                            seg.as_dict().map(|d| d.contains("port")).unwrap_or(false)
                        })
                        .count()
                })
                .unwrap_or(0);
            req.set(&fo("remaining_path_size"), accepted)?;
            return finish_reply(
                req,
                path,
                svc,
                Err(Error::Status {
                    code: status::CONNECTION_FAILURE,
                    extended: vec![status::EXT_INVALID_CONNECTION_PATH],
                }),
            );
        }

        let connection = Arc::new(Connection {
            o_t_id: device.connections.allocate_id(),
            t_o_id: req.get_int(&fo("T_O.connection_ID"))? as u32,
            connection_serial: req.get_int(&fo("connection_serial"))? as u16,
            originator_vendor: req.get_int(&fo("originator_vendor"))? as u16,
            originator_serial: req.get_int(&fo("originator_serial"))? as u32,
            o_t_rpi: req.get_int(&fo("O_T.RPI"))? as u32,
            t_o_rpi: req.get_int(&fo("T_O.RPI"))? as u32,
            transport_class_triggers: req.get_int(&fo("transport_class_triggers"))? as u8,
            timeout_multiplier: req.get_int(&fo("connection_timeout_multiplier"))? as u8,
            sequence: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
        });
        tracing::info!(
            o_t = connection.o_t_id,
            t_o = connection.t_o_id,
            serial = connection.connection_serial,
            "forward open"
        );
        device.connections.insert(connection.clone());

        // Mutate the request into the success reply: chosen IDs, actual
        // packet intervals equal to the requested ones, and no
        // application reply.
        req.set(&fo("O_T.connection_ID"), connection.o_t_id)?;
        req.set(&fo("O_T.API"), connection.o_t_rpi)?;
        req.set(&fo("T_O.API"), connection.t_o_rpi)?;
        req.set(&fo("application.size"), 0u32)?;
        req.set(&fo("application.input"), Vec::<u8>::new())?;
        finish_reply(req, path, svc, Ok(()))
    }

    fn forward_close(&self, req: &mut Dict, path: &str, device: &Device) -> Result<bool, Error> {
        let fc = |field: &str| automata::join(path, &format!("forward_close.{field}"));
        let released = device.connections.close(
            req.get_int(&fc("connection_serial"))? as u16,
            req.get_int(&fc("originator_vendor"))? as u16,
            req.get_int(&fc("originator_serial"))? as u32,
        );
        match released {
            Some(connection) => {
                tracing::info!(o_t = connection.o_t_id, "forward close");
                req.set(&fc("application.size"), 0u32)?;
                req.set(&fc("application.input"), Vec::<u8>::new())?;
                finish_reply(req, path, service::FWD_CLOSE_REQ, Ok(()))
            }
            None => finish_reply(
                req,
                path,
                service::FWD_CLOSE_REQ,
                Err(Error::Status {
                    code: status::CONNECTION_FAILURE,
                    extended: vec![status::EXT_CONNECTION_NOT_FOUND],
                }),
            ),
        }
    }
}

impl Object for ConnectionManager {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn parser(&self) -> Arc<Machine> {
        request::connection_manager_parser()
    }

    fn request(&self, req: &mut Dict, path: &str, device: &Device) -> Result<bool, Error> {
        let svc = req.get_int(&automata::join(path, "service"))? as u8;
        match svc {
            service::UNC_SEND_REQ => self.unconnected_send(req, path, device),
            service::FWD_OPEN_REQ | service::FWD_OPEN_LARGE_REQ => {
                self.forward_open(req, path, device, svc)
            }
            service::FWD_CLOSE_REQ => self.forward_close(req, path, device),
            _ => self.core.standard_request(req, path, device),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::logix::Logix;
    use pretty_assertions::assert_eq;

    fn device() -> Device {
        let device = Device::new();
        device.registry.register(Arc::new(Logix::new("Message Router")));
        device
            .registry
            .register(Arc::new(ConnectionManager::new("Connection Manager")));
        device
    }

    fn forward_open_request() -> Vec<u8> {
        vec![
            0x54, 0x02, 0x20, 0x06, 0x24, 0x01, 0x07, 0xf9, 0x11, 0x00, 0x00, 0x80, 0x10,
            0x00, 0xfe, 0x80, 0x11, 0x00, 0x4d, 0x00, 0x0f, 0x7f, 0x3d, 0x1e, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x12, 0x7a, 0x00, 0xf4, 0x43, 0x00, 0x12, 0x7a, 0x00, 0xf4,
            0x43, 0xa3, 0x03, 0x01, 0x00, 0x20, 0x02, 0x24, 0x01,
        ]
    }

    #[test]
    fn test_forward_open_success() {
        let device = device();
        let mut req = Dict::new();
        assert!(device.dispatch(&forward_open_request(), &mut req, "").unwrap());

        assert_eq!(req.get_int("service").unwrap(), 0xd4);
        assert_eq!(req.get_int("status").unwrap(), 0);
        let o_t = req.get_int("forward_open.O_T.connection_ID").unwrap() as u32;
        assert_eq!(
            req.get_int("forward_open.T_O.connection_ID").unwrap() as u32,
            0x80fe0010
        );
        assert_eq!(req.get_int("forward_open.O_T.API").unwrap(), 0x007a1200);
        assert_eq!(req.get_int("forward_open.application.size").unwrap(), 0);

        let connection = device.connections.by_id(o_t).unwrap();
        assert_eq!(connection.connection_serial, 0x0011);
        assert!(device.connections.by_id(0x80fe0010).is_some());
        assert_eq!(device.connections.len(), 1);

        // Sequence numbers must not regress, but may wrap.
        assert!(connection.accept_sequence(1));
        assert!(connection.accept_sequence(2));
        assert!(!connection.accept_sequence(2));
        assert!(!connection.accept_sequence(1));
        assert!(connection.accept_sequence(0x7000));
        assert!(connection.accept_sequence(0xeffe));
        assert!(connection.accept_sequence(0x0003)); // wrapped
        assert!(!connection.accept_sequence(0xeffe));
    }

    #[test]
    fn test_forward_open_invalid_path() {
        // A connection path resolving to no object: status 0x01, extended
        // 0x0311, remaining path size = accepted segment count.
        let device = device();
        let mut raw = forward_open_request();
        // Point the connection path at a missing class 0x99.
        let n = raw.len();
        raw[n - 3] = 0x99;
        let mut req = Dict::new();
        assert!(device.dispatch(&raw, &mut req, "").unwrap());

        assert_eq!(req.get_int("service").unwrap(), 0xd4);
        assert_eq!(req.get_int("status").unwrap(), status::CONNECTION_FAILURE as i64);
        assert_eq!(
            req.get_list("status_ext.data").unwrap(),
            &vec![Value::Int(status::EXT_INVALID_CONNECTION_PATH as i64)]
        );
        assert_eq!(req.get_int("forward_open.remaining_path_size").unwrap(), 1);
        assert!(device.connections.is_empty());
    }

    #[test]
    fn test_forward_close() {
        let device = device();
        let mut req = Dict::new();
        device.dispatch(&forward_open_request(), &mut req, "").unwrap();
        assert_eq!(device.connections.len(), 1);

        let close = vec![
            0x4e, 0x02, 0x20, 0x06, 0x24, 0x01, 0x07, 0xf9, 0x11, 0x00, 0x4d, 0x00, 0x0f,
            0x7f, 0x3d, 0x1e, 0x03, 0x00, 0x01, 0x00, 0x20, 0x02, 0x24, 0x01,
        ];
        let mut rep = Dict::new();
        assert!(device.dispatch(&close, &mut rep, "").unwrap());
        assert_eq!(rep.get_int("service").unwrap(), 0xce);
        assert_eq!(rep.get_int("status").unwrap(), 0);
        assert!(device.connections.is_empty());

        // Closing it again: unknown connection, status 0x01/0x0100.
        let mut rep = Dict::new();
        assert!(device.dispatch(&close, &mut rep, "").unwrap());
        assert_eq!(rep.get_int("status").unwrap(), status::CONNECTION_FAILURE as i64);
        assert_eq!(
            rep.get_list("status_ext.data").unwrap(),
            &vec![Value::Int(status::EXT_CONNECTION_NOT_FOUND as i64)]
        );
    }

    #[test]
    fn test_sweep_expired() {
        let device = device();
        let stale = Arc::new(Connection {
            o_t_id: 0x1000,
            t_o_id: 0x2000,
            connection_serial: 1,
            originator_vendor: 0x4d,
            originator_serial: 7,
            o_t_rpi: 1000, // 1ms RPI: a 4ms inactivity budget
            t_o_rpi: 1000,
            transport_class_triggers: 0xa3,
            timeout_multiplier: 0,
            sequence: Mutex::new(None),
            last_seen: Mutex::new(Instant::now() - Duration::from_secs(1)),
        });
        device.connections.insert(stale);
        let mut req = Dict::new();
        device.dispatch(&forward_open_request(), &mut req, "").unwrap();
        assert_eq!(device.connections.len(), 2);

        // Only the stale connection is released; recent traffic renews.
        let released = device.connections.sweep_expired();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].o_t_id, 0x1000);
        assert_eq!(device.connections.len(), 1);
        assert!(device.connections.by_id(0x2000).is_none());
    }

    #[test]
    fn test_unconnected_send_collapses() {
        // Unconnected Send wrapping a Get Attributes All of Identity:
        // the produced reply is the bare embedded reply.
        let device = device();
        device
            .registry
            .register(Arc::new(crate::object::Identity::new("Identity")));

        let raw = [
            0x52, 0x02, 0x20, 0x06, 0x24, 0x01, 0x01, 0xfa, 0x06, 0x00, 0x01, 0x02, 0x20,
            0x01, 0x24, 0x01, 0x01, 0x00, 0x01, 0x00,
        ];
        let mut req = Dict::new();
        assert!(device.dispatch(&raw, &mut req, "").unwrap());
        assert_eq!(req.get_int("service").unwrap(), 0x81);
        assert_eq!(req.get_int("status").unwrap(), 0);

        let reply = request::produce(&req, "").unwrap();
        assert_eq!(&reply[..4], &[0x81, 0x00, 0x00, 0x00]);
        // Attributes 1..7: 35 payload bytes, ending at the product name.
        assert_eq!(reply.len(), 4 + 35);
        assert_eq!(&reply[4..6], &[0x01, 0x00]); // vendor
        assert_eq!(reply[18], 0x14); // product name SSTRING length
    }
}
