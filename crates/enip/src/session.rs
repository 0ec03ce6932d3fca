//! One EtherNet/IP session: a resumable frame parser over the bytes a
//! peer has sent so far, plus the command handling that turns each
//! parsed frame into a reply frame.
//!
//! The session owns its [`Source`]: the server task feeds socket reads
//! in with [`Session::feed`] and calls [`Session::drive`], which runs
//! the framing machine to completion or suspension. Completed frames are
//! handled immediately (CIP payloads dispatched through the device)
//! and the reply bytes accumulate in the caller's buffer. On EOF the
//! already-buffered bytes are driven through the parser one final time,
//! so a complete trailing frame still gets its reply and a partial one
//! fails cleanly.

use automata::{Progress, Runner, Source};
use cip::Device;
use dict::Dict;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::command::{self, code, status};
use crate::cpf::item_type;
use crate::{frame, Error};

/// Server-wide session registry: a handle per registered peer.
#[derive(Debug)]
pub struct Sessions {
    next: AtomicU32,
    map: Mutex<BTreeMap<u32, SocketAddr>>,
}

impl Sessions {
    pub fn new() -> Sessions {
        Sessions {
            // Handle 0 means "not yet registered" on the wire.
            next: AtomicU32::new(1),
            map: Mutex::new(BTreeMap::new()),
        }
    }

    fn register(&self, peer: SocketAddr) -> u32 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        self.map
            .lock()
            .expect("session table lock poisoned")
            .insert(handle, peer);
        handle
    }

    fn unregister(&self, handle: u32) {
        self.map
            .lock()
            .expect("session table lock poisoned")
            .remove(&handle);
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("session table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().expect("session table lock poisoned").is_empty()
    }
}

/// What the driver should do next.
#[derive(Debug, PartialEq)]
pub enum Activity {
    /// Wait for more input from the peer, then feed and drive again.
    NeedInput,
    /// The session is over; close the socket.
    Close,
}

pub struct Session {
    device: Arc<Device>,
    sessions: Arc<Sessions>,
    peer: SocketAddr,
    /// The address this server answers List Identity with.
    advertise: SocketAddr,
    source: Source,
    /// The in-progress frame: parser state plus the partially-filled
    /// dictionary, both surviving suspension.
    pending: Option<(Runner, Dict)>,
    /// Consumption count when the current frame began, to tell a clean
    /// EOF (no bytes of a next frame) from a truncated frame.
    frame_began: usize,
    handle: Option<u32>,
    /// Connection IDs Forward-Opened within this session, released at
    /// teardown.
    opened: Vec<u32>,
}

impl Session {
    pub fn new(
        device: Arc<Device>,
        sessions: Arc<Sessions>,
        peer: SocketAddr,
        advertise: SocketAddr,
    ) -> Session {
        Session {
            device,
            sessions,
            peer,
            advertise,
            source: Source::new(),
            pending: None,
            frame_began: 0,
            handle: None,
            opened: Vec::new(),
        }
    }

    /// Append bytes received from the peer.
    pub fn feed(&mut self, bytes: impl Into<bytes::Bytes>) {
        self.source.chain(bytes);
    }

    /// Signal that the peer will send nothing further.
    pub fn eof(&mut self) {
        self.source.close();
    }

    /// Release everything this session owns: its registration and any
    /// connections it forward-opened.
    pub fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.sessions.unregister(handle);
        }
        for id in self.opened.drain(..) {
            if self.device.connections.release(id).is_some() {
                tracing::debug!(connection = id, "released at session teardown");
            }
        }
    }

    /// Run the frame parser over everything fed so far, handling each
    /// completed frame and appending replies to `out`.
    pub fn drive(&mut self, out: &mut Vec<u8>) -> Result<Activity, Error> {
        loop {
            if self.pending.is_none() {
                if self.source.is_empty() && self.source.is_closed() {
                    return Ok(Activity::Close);
                }
                self.frame_began = self.source.consumed();
                self.pending =
                    Some((Runner::with_path(frame::enip_machine(), "enip"), Dict::new()));
            }
            let (runner, data) = self.pending.as_mut().expect("pending frame just ensured");

            match runner.run(&mut self.source, data) {
                Ok(Progress::Terminal) => {
                    let (_, mut data) = self.pending.take().expect("pending frame present");
                    match self.handle_frame(&mut data)? {
                        Disposition::Reply(reply) => {
                            out.extend_from_slice(&reply);
                        }
                        Disposition::Quiet => {}
                        Disposition::Close => return Ok(Activity::Close),
                    }
                }
                Ok(Progress::Suspended) => return Ok(Activity::NeedInput),
                Ok(Progress::Failed) => {
                    if self.source.consumed() == self.frame_began {
                        // EOF on a frame boundary: a clean end of session.
                        return Ok(Activity::Close);
                    }
                    let reason = self
                        .pending
                        .as_ref()
                        .and_then(|(r, _)| r.error().map(|e| e.to_string()))
                        .unwrap_or_else(|| "frame parse failed".to_string());
                    return Err(Error::Frame { reason });
                }
                Ok(Progress::Transitioned) => unreachable!("run() never yields Transitioned"),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn handle_frame(&mut self, data: &mut Dict) -> Result<Disposition, Error> {
        let command = data.get_int("enip.command")? as u16;
        tracing::debug!(command, peer = %self.peer, "frame received");
        if tracing::enabled!(tracing::Level::TRACE) {
            if let Ok(payload) = data.get_bytes("enip.payload.input") {
                for line in hexdump::hexdump_iter(payload) {
                    tracing::trace!("  {line}");
                }
            }
        }

        if let Err(err) = command::parse(data, "enip") {
            tracing::warn!(%err, command, "bad command payload");
            return self.error_reply(data, status::INVALID_LENGTH);
        }

        match command {
            code::NOP => Ok(Disposition::Quiet),
            code::REGISTER_SESSION => self.register_session(data),
            code::UNREGISTER_SESSION => {
                tracing::info!(peer = %self.peer, "session unregistered");
                self.teardown();
                Ok(Disposition::Close)
            }
            code::LIST_SERVICES => self.list_services(data),
            code::LIST_IDENTITY => self.list_identity(data),
            code::LIST_INTERFACES => self.reply(data),
            code::LEGACY => self.legacy(data),
            code::SEND_RR_DATA => self.send_data(data, false),
            code::SEND_UNIT_DATA => self.send_data(data, true),
            other => {
                tracing::warn!(command = other, "unsupported command");
                self.error_reply(data, status::INVALID_COMMAND)
            }
        }
    }

    fn register_session(&mut self, data: &mut Dict) -> Result<Disposition, Error> {
        let version = data.get_int("enip.CIP.register.version").unwrap_or(1);
        if version != 1 {
            tracing::warn!(version, "unsupported encapsulation protocol version");
            return self.error_reply(data, status::INVALID_COMMAND);
        }
        let handle = self.sessions.register(self.peer);
        self.handle = Some(handle);
        tracing::info!(peer = %self.peer, handle, "session registered");
        data.set("enip.session_handle", handle)?;
        self.reply(data)
    }

    /// SendRRData / SendUnitData: dispatch the CIP payload of each data
    /// item, then re-frame the mutated dictionary as the reply.
    fn send_data(&mut self, data: &mut Dict, connected: bool) -> Result<Disposition, Error> {
        let expected = self.handle.unwrap_or(0);
        let presented = data.get_int("enip.session_handle").unwrap_or(0) as u32;
        if expected == 0 || presented != expected {
            tracing::warn!(presented, expected, "bad session handle");
            return self.error_reply(data, status::INVALID_SESSION);
        }

        let count = data.get_int("enip.CIP.send_data.CPF.count").unwrap_or(0) as usize;
        if connected {
            return self.send_unit(data, count);
        }
        for i in 0..count {
            let item = format!("enip.CIP.send_data.CPF.item[{i}]");
            let type_id = data.get_int(&format!("{item}.type_id"))? as u16;
            if type_id != item_type::UNCONNECTED_DATA {
                continue;
            }
            let request = format!("{item}.unconnected_send.request");
            let raw = data.get_bytes(&format!("{request}.input"))?.to_vec();
            if !self.device.dispatch(&raw, data, &request)? {
                return Ok(Disposition::Close);
            }
            self.note_connection_changes(data, &request)?;
        }
        self.reply(data)
    }

    /// Connected (Class-3) messaging: a connected-address item names the
    /// connection, a connected-data item carries sequence + request.
    fn send_unit(&mut self, data: &mut Dict, count: usize) -> Result<Disposition, Error> {
        let mut address_item: Option<String> = None;
        let mut data_item: Option<String> = None;
        for i in 0..count {
            let item = format!("enip.CIP.send_data.CPF.item[{i}]");
            match data.get_int(&format!("{item}.type_id"))? as u16 {
                item_type::CONNECTED_ADDRESS => address_item = Some(item),
                item_type::CONNECTED_DATA => data_item = Some(item),
                _ => {}
            }
        }
        let (Some(address_item), Some(data_item)) = (address_item, data_item) else {
            tracing::warn!("SendUnitData without connected address + data items");
            return self.error_reply(data, status::INVALID_LENGTH);
        };

        let id = data.get_int(&format!("{address_item}.connection_ID.connection"))? as u32;
        let Some(connection) = self.device.connections.by_id(id) else {
            tracing::warn!(connection = id, "unknown connection; dropping");
            return Ok(Disposition::Quiet);
        };
        connection.touch();
        let sequence =
            data.get_int(&format!("{data_item}.connection_data.sequence"))? as u16;
        if !connection.accept_sequence(sequence) {
            tracing::warn!(connection = id, sequence, "regressive sequence; dropping");
            return Ok(Disposition::Quiet);
        }

        let request = format!("{data_item}.connection_data.request");
        let raw = data.get_bytes(&format!("{request}.input"))?.to_vec();
        if !self.device.dispatch(&raw, data, &request)? {
            return Ok(Disposition::Close);
        }
        self.note_connection_changes(data, &request)?;

        // Reply under the paired T→O connection ID, sequence echoed.
        data.set(
            &format!("{address_item}.connection_ID.connection"),
            connection.t_o_id,
        )?;
        self.reply(data)
    }

    /// Remember Forward Opens (for teardown) and forget Forward Closes.
    fn note_connection_changes(&mut self, data: &Dict, request: &str) -> Result<(), Error> {
        let service = data.get_int(&automata::join(request, "service")).unwrap_or(0) as u8;
        let status = data.get_int(&automata::join(request, "status")).unwrap_or(-1);
        if status != 0 {
            return Ok(());
        }
        match service {
            cip::service::FWD_OPEN_RPY | cip::service::FWD_OPEN_LARGE_RPY => {
                let id = data.get_int(&automata::join(
                    request,
                    "forward_open.O_T.connection_ID",
                ))? as u32;
                self.opened.push(id);
            }
            _ => {}
        }
        Ok(())
    }

    fn list_services(&mut self, data: &mut Dict) -> Result<Disposition, Error> {
        let cs = "enip.CIP.list_services.CPF.item[0].communications_service";
        data.set("enip.CIP.list_services.CPF.count", 1u32)?;
        data.set(
            "enip.CIP.list_services.CPF.item",
            vec![dict::Value::Dict(Dict::new())],
        )?;
        data.set(
            "enip.CIP.list_services.CPF.item[0].type_id",
            item_type::COMMUNICATIONS,
        )?;
        data.set("enip.CIP.list_services.CPF.item[0].length", 0u32)?;
        data.set(&automata::join(cs, "version"), 1u32)?;
        // CIP encapsulation supported.
        data.set(&automata::join(cs, "capability"), 1u32 << 5)?;
        data.set(&automata::join(cs, "service_name"), "Communications")?;
        self.reply(data)
    }

    fn list_identity(&mut self, data: &mut Dict) -> Result<Disposition, Error> {
        let id = "enip.CIP.list_identity.CPF.item[0].identity_object";
        let at = |field: &str| automata::join(id, field);
        data.set("enip.CIP.list_identity.CPF.count", 1u32)?;
        data.set(
            "enip.CIP.list_identity.CPF.item",
            vec![dict::Value::Dict(Dict::new())],
        )?;
        data.set("enip.CIP.list_identity.CPF.item[0].type_id", item_type::IDENTITY)?;
        data.set("enip.CIP.list_identity.CPF.item[0].length", 0u32)?;

        data.set(&at("version"), 1u32)?;
        data.set(&at("sin_family"), 2u32)?;
        data.set(&at("sin_port"), self.advertise.port())?;
        data.set(&at("sin_addr"), self.advertise.ip().to_string())?;

        // Identity attributes 1..7 plus state, straight from the object.
        let identity = self
            .device
            .registry
            .lookup(cip::Identity::CLASS, 1)
            .ok_or_else(|| Error::Frame {
                reason: "no Identity object registered".to_string(),
            })?;
        let fetch = |attr: u16| -> i64 {
            identity
                .core()
                .attribute(attr)
                .and_then(|a| a.read(0, 1).first().and_then(|v| v.as_int()))
                .unwrap_or(0)
        };
        data.set(&at("vendor_id"), fetch(1))?;
        data.set(&at("device_type"), fetch(2))?;
        data.set(&at("product_code"), fetch(3))?;
        data.set(&at("product_revision"), fetch(4))?;
        data.set(&at("status_word"), fetch(5))?;
        data.set(&at("serial_number"), fetch(6))?;
        let name = identity
            .core()
            .attribute(7)
            .and_then(|a| {
                a.read(0, 1).first().and_then(|v| v.as_str().map(str::to_string))
            })
            .unwrap_or_default();
        data.set(&at("product_name"), name)?;
        data.set(&at("state"), fetch(8))?;
        self.reply(data)
    }

    /// The undocumented legacy command: echo the peer's address back as
    /// a CPF item.
    fn legacy(&mut self, data: &mut Dict) -> Result<Disposition, Error> {
        let lg = "enip.CIP.legacy.CPF.item[0].legacy_CPF_0x0001";
        let at = |field: &str| automata::join(lg, field);
        data.set("enip.CIP.legacy.CPF.count", 1u32)?;
        data.set(
            "enip.CIP.legacy.CPF.item",
            vec![dict::Value::Dict(Dict::new())],
        )?;
        data.set("enip.CIP.legacy.CPF.item[0].type_id", item_type::LEGACY_0X0001)?;
        data.set("enip.CIP.legacy.CPF.item[0].length", 0u32)?;
        data.set(&at("version"), 1u32)?;
        data.set(&at("unknown_1"), 0u32)?;
        data.set(&at("sin_family"), 2u32)?;
        data.set(&at("sin_port"), self.peer.port())?;
        data.set(&at("sin_addr"), self.peer.ip().to_string())?;
        data.set(&at("ip_address"), self.peer.ip().to_string())?;
        self.reply(data)
    }

    /// Frame the mutated dictionary as a success reply.
    fn reply(&mut self, data: &mut Dict) -> Result<Disposition, Error> {
        data.set("enip.status", 0u32)?;
        let payload = command::produce(data, "enip")?;
        Ok(Disposition::Reply(frame::encode(data, "enip", &payload)?))
    }

    /// An empty-payload reply carrying an encapsulation error status.
    fn error_reply(&mut self, data: &mut Dict, status: u32) -> Result<Disposition, Error> {
        data.set("enip.status", status)?;
        Ok(Disposition::Reply(frame::encode(data, "enip", &[])?))
    }
}

#[derive(Debug)]
enum Disposition {
    Reply(Vec<u8>),
    Quiet,
    Close,
}
