//! End-to-end session scenarios: each test drives complete frames
//! through a Session against a standard device, asserting on the exact
//! reply bytes.

use cip::Device;
use enip::{Activity, Session, Sessions};
use std::sync::Arc;

fn device() -> Arc<Device> {
    let device = Arc::new(Device::with_standard_objects());
    for def in [
        "parts=DINT[1000]",
        "ControlWord=DINT[2]",
        "number=REAL=0.0",
        "SCADA=INT[1000]",
    ] {
        let def = cip::symbol::parse_definition(def).unwrap();
        device.define_tag(&def).unwrap();
    }
    // SCADA[i] = i.
    let addr = device.symbols.lookup("SCADA").unwrap();
    let attribute = device
        .registry
        .lookup(addr.class, addr.instance)
        .unwrap()
        .core()
        .attribute(addr.attribute.unwrap())
        .unwrap();
    let values: Vec<dict::Value> = (0..1000).map(dict::Value::Int).collect();
    attribute.write(0, &values).unwrap();
    device
}

fn session(device: &Arc<Device>) -> Session {
    Session::new(
        device.clone(),
        Arc::new(Sessions::new()),
        "192.168.5.1:49152".parse().unwrap(),
        "192.168.5.253:44818".parse().unwrap(),
    )
}

fn exchange(session: &mut Session, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    session.feed(frame.to_vec());
    assert_eq!(session.drive(&mut out).unwrap(), Activity::NeedInput);
    out
}

fn register(session: &mut Session) -> u32 {
    let mut frame = vec![0x65, 0x00, 0x04, 0x00];
    frame.extend_from_slice(&[0; 20]);
    frame.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
    let reply = exchange(session, &frame);
    assert_eq!(reply[0], 0x65);
    assert_eq!(u32::from_le_bytes(reply[8..12].try_into().unwrap()), 0);
    u32::from_le_bytes(reply[4..8].try_into().unwrap())
}

fn send_rr(handle: u32, cip_request: &[u8]) -> Vec<u8> {
    framed(0x6f, handle, None, cip_request)
}

fn send_unit(handle: u32, connection: u32, sequence: u16, cip_request: &[u8]) -> Vec<u8> {
    framed(0x70, handle, Some((connection, sequence)), cip_request)
}

/// Build a SendRRData/SendUnitData frame around an embedded CIP request.
fn framed(
    command: u16,
    handle: u32,
    connected: Option<(u32, u16)>,
    cip_request: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0, 0, 0, 0]); // interface
    payload.extend_from_slice(&[0x05, 0x00]); // timeout
    payload.extend_from_slice(&[0x02, 0x00]); // item count
    match connected {
        None => {
            payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // null address
            payload.extend_from_slice(&[0xb2, 0x00]);
            payload.extend_from_slice(&(cip_request.len() as u16).to_le_bytes());
            payload.extend_from_slice(cip_request);
        }
        Some((connection, sequence)) => {
            payload.extend_from_slice(&[0xa1, 0x00, 0x04, 0x00]);
            payload.extend_from_slice(&connection.to_le_bytes());
            payload.extend_from_slice(&[0xb1, 0x00]);
            payload.extend_from_slice(&(cip_request.len() as u16 + 2).to_le_bytes());
            payload.extend_from_slice(&sequence.to_le_bytes());
            payload.extend_from_slice(cip_request);
        }
    }

    let mut frame = Vec::new();
    frame.extend_from_slice(&command.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&handle.to_le_bytes());
    frame.extend_from_slice(&[0; 4]);
    frame.extend_from_slice(b"scenario");
    frame.extend_from_slice(&[0; 4]);
    frame.extend_from_slice(&payload);
    frame
}

/// The embedded CIP bytes of an unconnected reply frame.
fn unconnected_reply(reply: &[u8]) -> &[u8] {
    assert_eq!(u32::from_le_bytes(reply[8..12].try_into().unwrap()), 0);
    assert_eq!(&reply[12..20], b"scenario");
    &reply[40..]
}

#[test]
fn scenario_register_session() {
    let device = device();
    let mut s = session(&device);
    let handle = register(&mut s);
    assert_ne!(handle, 0);
}

#[test]
fn scenario_get_attributes_all_identity() {
    let device = device();
    let mut s = session(&device);
    let handle = register(&mut s);

    let request = [0x01, 0x02, 0x20, 0x01, 0x24, 0x01];
    let reply = exchange(&mut s, &send_rr(handle, &request));
    let body = unconnected_reply(&reply);
    // Attributes 1..7 in order: 35 bytes of data after the reply header.
    let expect: &[u8] =
        b"\x81\x00\x00\x00\x01\x00\x0e\x006\x00\x14\x0b`1\x1a\x06l\x00\x141756-L61/B LOGIX5561";
    assert_eq!(body, expect);
}

#[test]
fn scenario_read_tag_fragmented() {
    // SCADA[12], 20 elements, byte offset 2: an INT run starting at 13.
    let device = device();
    let mut s = session(&device);
    let handle = register(&mut s);

    let request = [
        0x52, 0x05, 0x91, 0x05, b'S', b'C', b'A', b'D', b'A', 0x00, 0x28, 0x0c, 0x14,
        0x00, 0x02, 0x00, 0x00, 0x00,
    ];
    let reply = exchange(&mut s, &send_rr(handle, &request));
    let body = unconnected_reply(&reply);
    assert_eq!(&body[..6], &[0xd2, 0x00, 0x00, 0x00, 0xc3, 0x00]);
    let elements: Vec<i16> = body[6..]
        .chunks(2)
        .map(|w| i16::from_le_bytes([w[0], w[1]]))
        .collect();
    assert_eq!(elements.len(), 20);
    assert_eq!(elements[0], 13);
    assert_eq!(elements[19], 32);
}

#[test]
fn scenario_multiple_service_packet() {
    // Batch of 5: read parts[0], read ControlWord[0], read number, write
    // number = 1.25 (REAL), read number again.
    let device = device();
    let mut s = session(&device);
    let handle = register(&mut s);

    let mut subs: Vec<Vec<u8>> = Vec::new();
    for tag in ["parts", "ControlWord"] {
        let mut sub = vec![0x4c];
        sub.push(((2 + tag.len() + tag.len() % 2) / 2 + 1) as u8);
        sub.push(0x91);
        sub.push(tag.len() as u8);
        sub.extend_from_slice(tag.as_bytes());
        if tag.len() % 2 != 0 {
            sub.push(0);
        }
        sub.extend_from_slice(&[0x28, 0x00]); // element 0
        sub.extend_from_slice(&[0x01, 0x00]);
        subs.push(sub);
    }
    subs.push(vec![
        0x4c, 0x04, 0x91, 0x06, b'n', b'u', b'm', b'b', b'e', b'r', 0x01, 0x00,
    ]);
    subs.push(vec![
        0x4d, 0x04, 0x91, 0x06, b'n', b'u', b'm', b'b', b'e', b'r', 0xca, 0x00, 0x01,
        0x00, 0x00, 0x00, 0xa0, 0x3f,
    ]);
    subs.push(vec![
        0x4c, 0x04, 0x91, 0x06, b'n', b'u', b'm', b'b', b'e', b'r', 0x01, 0x00,
    ]);

    let mut request = vec![0x0a, 0x02, 0x20, 0x02, 0x24, 0x01];
    request.extend_from_slice(&(subs.len() as u16).to_le_bytes());
    let mut offset = 2 + 2 * subs.len();
    for sub in &subs {
        request.extend_from_slice(&(offset as u16).to_le_bytes());
        offset += sub.len();
    }
    for sub in &subs {
        request.extend_from_slice(sub);
    }

    let reply = exchange(&mut s, &send_rr(handle, &request));
    let body = unconnected_reply(&reply);
    assert_eq!(&body[..4], &[0x8a, 0x00, 0x00, 0x00]);

    // Exactly five ascending offsets, each locating a sub-reply.
    let count = u16::from_le_bytes([body[4], body[5]]) as usize;
    assert_eq!(count, 5);
    let offsets: Vec<usize> = (0..count)
        .map(|i| u16::from_le_bytes([body[6 + 2 * i], body[7 + 2 * i]]) as usize)
        .collect();
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    for &off in &offsets {
        assert!(body[4 + off] & 0x80 != 0);
    }
    // Sub-reply 4: write succeeded; sub-reply 5: number reads back 1.25.
    let write_reply = &body[4 + offsets[3]..4 + offsets[4]];
    assert_eq!(write_reply, &[0xcd, 0x00, 0x00, 0x00]);
    let read_reply = &body[4 + offsets[4]..];
    assert_eq!(&read_reply[..6], &[0xcc, 0x00, 0x00, 0x00, 0xca, 0x00]);
    assert_eq!(f32::from_le_bytes(read_reply[6..10].try_into().unwrap()), 1.25);
}

#[test]
fn scenario_forward_open_and_connected_read() {
    let device = device();
    let mut s = session(&device);
    let handle = register(&mut s);

    // Forward Open targeting the Message Router.
    let open = [
        0x54, 0x02, 0x20, 0x06, 0x24, 0x01, 0x07, 0xf9, 0x11, 0x00, 0x00, 0x80, 0x10,
        0x00, 0xfe, 0x80, 0x11, 0x00, 0x4d, 0x00, 0x0f, 0x7f, 0x3d, 0x1e, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x12, 0x7a, 0x00, 0xf4, 0x43, 0x00, 0x12, 0x7a, 0x00, 0xf4,
        0x43, 0xa3, 0x03, 0x01, 0x00, 0x20, 0x02, 0x24, 0x01,
    ];
    let reply = exchange(&mut s, &send_rr(handle, &open));
    let body = unconnected_reply(&reply);
    assert_eq!(&body[..4], &[0xd4, 0x00, 0x00, 0x00]);
    let o_t = u32::from_le_bytes(body[4..8].try_into().unwrap());
    assert_eq!(u32::from_le_bytes(body[8..12].try_into().unwrap()), 0x80fe0010);

    // A connected read of SCADA through the opened connection.
    let read = [
        0x4c, 0x04, 0x91, 0x05, b'S', b'C', b'A', b'D', b'A', 0x00, 0x02, 0x00,
    ];
    let reply = exchange(&mut s, &send_unit(handle, o_t, 1, &read));
    // Reply carries the paired T→O connection ID and echoes the sequence.
    assert_eq!(&reply[24..30], &[0, 0, 0, 0, 0x05, 0x00]);
    let payload = &reply[30..];
    assert_eq!(&payload[..4], &[0x02, 0x00, 0xa1, 0x00]);
    assert_eq!(
        u32::from_le_bytes(payload[6..10].try_into().unwrap()),
        0x80fe0010
    );
    assert_eq!(&payload[10..12], &[0xb1, 0x00]);
    let sequence = u16::from_le_bytes(payload[14..16].try_into().unwrap());
    assert_eq!(sequence, 1);
    assert_eq!(&payload[16..20], &[0xcc, 0x00, 0x00, 0x00]);

    // A regressive sequence number is dropped without a reply.
    let mut out = Vec::new();
    s.feed(send_unit(handle, o_t, 1, &read));
    assert_eq!(s.drive(&mut out).unwrap(), Activity::NeedInput);
    assert!(out.is_empty());
}

#[test]
fn scenario_forward_open_invalid_path() {
    let device = device();
    let mut s = session(&device);
    let handle = register(&mut s);

    // Connection path names class 0x99, which no object implements.
    let open = [
        0x54, 0x02, 0x20, 0x06, 0x24, 0x01, 0x07, 0xf9, 0x11, 0x00, 0x00, 0x80, 0x10,
        0x00, 0xfe, 0x80, 0x11, 0x00, 0x4d, 0x00, 0x0f, 0x7f, 0x3d, 0x1e, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x12, 0x7a, 0x00, 0xf4, 0x43, 0x00, 0x12, 0x7a, 0x00, 0xf4,
        0x43, 0xa3, 0x03, 0x01, 0x00, 0x20, 0x99, 0x24, 0x01,
    ];
    let reply = exchange(&mut s, &send_rr(handle, &open));
    let body = unconnected_reply(&reply);
    assert_eq!(body[0], 0xd4);
    assert_eq!(body[2], 0x01); // status: connection failure
    assert_eq!(body[3], 0x01); // one extended status word
    assert_eq!(u16::from_le_bytes(body[4..6].try_into().unwrap()), 0x0311);
    // Echo of serial/vendor/originator serial, then remaining path size 1.
    assert_eq!(&body[6..8], &[0x11, 0x00]);
    assert_eq!(&body[8..10], &[0x4d, 0x00]);
    assert_eq!(body[14], 1);
}

#[test]
fn scenario_unknown_command() {
    let device = device();
    let mut s = session(&device);
    let mut frame = vec![0x99, 0x00, 0x00, 0x00];
    frame.extend_from_slice(&[0; 20]);
    let reply = exchange(&mut s, &frame);
    assert_eq!(&reply[0..2], &[0x99, 0x00]);
    assert_eq!(&reply[2..4], &[0x00, 0x00]);
    assert_eq!(u32::from_le_bytes(reply[8..12].try_into().unwrap()), 0x0001);
}

#[test]
fn scenario_nop_and_unregister() {
    let device = device();
    let mut s = session(&device);
    register(&mut s);

    // NOP: consumed silently.
    let mut nop = vec![0x00, 0x00, 0x00, 0x00];
    nop.extend_from_slice(&[0; 20]);
    let mut out = Vec::new();
    s.feed(nop);
    assert_eq!(s.drive(&mut out).unwrap(), Activity::NeedInput);
    assert!(out.is_empty());

    // UnRegister: no reply, session closes.
    let mut unreg = vec![0x66, 0x00, 0x00, 0x00];
    unreg.extend_from_slice(&[0; 20]);
    s.feed(unreg);
    assert_eq!(s.drive(&mut out).unwrap(), Activity::Close);
    assert!(out.is_empty());
}

#[test]
fn scenario_legacy_peer_echo() {
    let device = device();
    let mut s = session(&device);
    let mut frame = vec![0x01, 0x00, 0x00, 0x00];
    frame.extend_from_slice(&[0; 20]);
    let reply = exchange(&mut s, &frame);
    assert_eq!(&reply[0..2], &[0x01, 0x00]);
    let payload = &reply[24..];
    assert_eq!(&payload[..6], &[0x01, 0x00, 0x01, 0x00, 0x24, 0x00]);
    // Big-endian peer sockaddr, then the textual form, NUL-padded.
    assert_eq!(&payload[10..12], &[0x00, 0x02]);
    assert_eq!(&payload[12..14], &[0xc0, 0x00]); // 49152
    assert_eq!(&payload[14..18], &[192, 168, 5, 1]);
    assert_eq!(&payload[26..37], b"192.168.5.1");
}
