//! The Message Router and its Logix tag-service extension.
//!
//! The router (class 0x02, instance 1) dispatches embedded requests and
//! batches them via Multiple Service Packet; the Logix extension adds
//! Read/Write Tag [Fragmented] against symbolically-addressed attributes.

use automata::Machine;
use dict::{Dict, Value};
use std::sync::Arc;

use crate::object::{finish_reply, Attribute, Object, ObjectCore};
use crate::{epath, request, service, status, Device, Error};

/// Payload budget for a single read reply, bounding the largest
/// fragmented transfer piece.
pub const MAX_BYTES: usize = 500;

pub struct Logix {
    core: ObjectCore,
}

impl Logix {
    pub const CLASS: u16 = 0x02;

    pub fn new(name: impl Into<String>) -> Logix {
        Logix {
            core: ObjectCore::new(Self::CLASS, 1, name),
        }
    }

    fn read(&self, req: &mut Dict, path: &str, device: &Device, svc: u8) -> Result<bool, Error> {
        let op = if svc == service::RD_TAG_REQ {
            "read_tag"
        } else {
            "read_frag"
        };
        let mut partial = false;
        let result = (|| -> Result<(), Error> {
            let attribute = addressed(req, path, device)?;
            let size = attribute.element_size().ok_or(Error::Status {
                code: status::SERVICE_NOT_SUPPORTED,
                extended: vec![],
            })?;
            let total = attribute.len();
            let elm = epath::element_of(req, &automata::join(path, "path")).unwrap_or(0);
            let elements = req
                .get_int(&automata::join(path, &format!("{op}.elements")))
                .ok()
                .map(|c| c as usize);
            let offset = req
                .get_int(&automata::join(path, &format!("{op}.offset")))
                .unwrap_or(0) as usize;

            let (beg, end, requested) =
                reply_elements_read(size, total, elm, elements, offset)?;
            let data = attribute.read(beg, end);
            req.set(
                &automata::join(path, &format!("{op}.type")),
                attribute.ty.tag(),
            )?;
            req.set(&automata::join(path, &format!("{op}.data")), data)?;
            // A fragmented read that could not satisfy the request in one
            // frame reports Partial Transfer; a classic read just returns
            // what fit.
            partial = svc == service::RD_FRG_REQ && end < requested.min(total);
            Ok(())
        })();
        let proceed = finish_reply(req, path, svc, result)?;
        if partial {
            req.set(&automata::join(path, "status"), status::PARTIAL_TRANSFER)?;
        }
        Ok(proceed)
    }

    fn write(&self, req: &mut Dict, path: &str, device: &Device, svc: u8) -> Result<bool, Error> {
        let op = if svc == service::WR_TAG_REQ {
            "write_tag"
        } else {
            "write_frag"
        };
        let result = (|| -> Result<(), Error> {
            let attribute = addressed(req, path, device)?;
            let size = attribute.element_size().ok_or(Error::Status {
                code: status::SERVICE_NOT_SUPPORTED,
                extended: vec![],
            })?;
            let total = attribute.len();
            let elm = epath::element_of(req, &automata::join(path, "path")).unwrap_or(0);
            let elements = req
                .get_int(&automata::join(path, &format!("{op}.elements")))
                .ok()
                .map(|c| c as usize);
            let offset = req
                .get_int(&automata::join(path, &format!("{op}.offset")))
                .unwrap_or(0) as usize;
            let values = req
                .get_list(&automata::join(path, &format!("{op}.data")))?
                .clone();

            let beg = begin_element(size, total, elm, offset)?;
            let requested = elements.map(|c| elm + c).unwrap_or(total);
            if requested > total || beg + values.len() > total {
                return Err(Error::Status {
                    code: status::CAPACITY_EXCEEDED,
                    extended: vec![],
                });
            }
            attribute.write(beg, &values)
        })();
        finish_reply(req, path, svc, result)
    }

    /// Execute each sub-request of a Multiple Service Packet in order;
    /// a failed sub-request yields its own error sub-reply without
    /// aborting the batch.
    fn multiple(&self, req: &mut Dict, path: &str, device: &Device) -> Result<bool, Error> {
        let at = |field: &str| automata::join(path, field);
        if req.contains(&at("multiple.malformed")) {
            return finish_reply(
                req,
                path,
                service::MULTIPLE_REQ,
                Err(Error::Status {
                    code: status::NOT_ENOUGH_DATA,
                    extended: vec![],
                }),
            );
        }
        let count = req.get_list(&at("multiple.request"))?.len();
        for i in 0..count {
            let sub = at(&format!("multiple.request[{i}]"));
            device.execute(req, &sub)?;
        }
        finish_reply(req, path, service::MULTIPLE_REQ, Ok(()))
    }
}

impl Object for Logix {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn parser(&self) -> Arc<Machine> {
        request::logix_parser()
    }

    fn request(&self, req: &mut Dict, path: &str, device: &Device) -> Result<bool, Error> {
        let svc = req.get_int(&automata::join(path, "service"))? as u8;
        match svc {
            service::RD_TAG_REQ | service::RD_FRG_REQ => self.read(req, path, device, svc),
            service::WR_TAG_REQ | service::WR_FRG_REQ => self.write(req, path, device, svc),
            service::MULTIPLE_REQ => self.multiple(req, path, device),
            _ => self.core.standard_request(req, path, device),
        }
    }
}

/// The attribute a tag request's path resolves to, via the symbol table.
fn addressed(req: &Dict, path: &str, device: &Device) -> Result<Arc<Attribute>, Error> {
    let (class, instance, attribute) = epath::resolve(
        req,
        &automata::join(path, "path"),
        &device.symbols,
        true,
    )
    .map_err(|err| match err {
        Error::UnknownSymbol { .. } => Error::Status {
            code: status::PATH_SEGMENT_ERROR,
            extended: vec![0x0000],
        },
        _ => Error::Status {
            code: status::PATH_SEGMENT_ERROR,
            extended: vec![],
        },
    })?;
    let object = device.registry.lookup(class, instance).ok_or(Error::Status {
        code: status::PATH_UNKNOWN,
        extended: vec![],
    })?;
    let id = attribute.ok_or(Error::Status {
        code: status::PATH_SEGMENT_ERROR,
        extended: vec![],
    })?;
    object.core().attribute(id).ok_or(Error::Status {
        code: status::PATH_UNKNOWN,
        extended: vec![],
    })
}

/// The first element a byte offset addresses, bounds-checked.
fn begin_element(size: usize, total: usize, elm: usize, offset: usize) -> Result<usize, Error> {
    if offset % size != 0 {
        // Offsets must land on an element boundary.
        return Err(Error::Status {
            code: status::PATH_SEGMENT_ERROR,
            extended: vec![],
        });
    }
    let beg = elm + offset / size;
    if beg >= total {
        return Err(Error::Status {
            code: status::PATH_SEGMENT_ERROR,
            extended: vec![],
        });
    }
    Ok(beg)
}

/// Compute the `[beg, end)` element window of a read, and the requested
/// ending element. The window is capped by the attribute length and by
/// [`MAX_BYTES`].
fn reply_elements_read(
    size: usize,
    total: usize,
    elm: usize,
    elements: Option<usize>,
    offset: usize,
) -> Result<(usize, usize, usize), Error> {
    let beg = begin_element(size, total, elm, offset)?;
    let requested = elements.map(|c| elm + c).unwrap_or(total);
    let end = requested.min(total).min(beg + MAX_BYTES / size);
    if end <= beg {
        return Err(Error::Status {
            code: status::PATH_SEGMENT_ERROR,
            extended: vec![],
        });
    }
    Ok((beg, end, requested))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::symbol::CipAddr;
    use crate::types::CipType;
    use pretty_assertions::assert_eq;

    fn device_with_scada(length: usize) -> Device {
        let device = Device::new();
        let logix = Arc::new(Logix::new("Message Router"));
        let values: Vec<Value> = (0..length as i64).map(Value::Int).collect();
        logix
            .core()
            .insert_attribute(1, Attribute::array("SCADA", CipType::Int, length, values));
        device.registry.register(logix);
        device
            .symbols
            .define("SCADA", CipAddr::new(Logix::CLASS, 1, Some(1)));
        device
    }

    fn parse_request(raw: &[u8]) -> Dict {
        let mut data = Dict::new();
        request::parse(&request::logix_parser(), raw, &mut data, "").unwrap();
        data
    }

    #[test]
    fn test_read_frag_with_offset() {
        // Read SCADA[12], 20 elements, byte offset 2: elements 13..33.
        let device = device_with_scada(1000);
        let raw = [
            0x52, 0x05, 0x91, 0x05, b'S', b'C', b'A', b'D', b'A', 0x00, 0x28, 0x0c, 0x14,
            0x00, 0x02, 0x00, 0x00, 0x00,
        ];
        let mut req = parse_request(&raw);
        assert!(device.execute(&mut req, "").unwrap());
        assert_eq!(req.get_int("service").unwrap(), 0xd2);
        assert_eq!(req.get_int("status").unwrap(), 0);
        assert_eq!(req.get_int("read_frag.type").unwrap(), 0x00c3);
        let data = req.get_list("read_frag.data").unwrap();
        assert_eq!(data.len(), 20);
        assert_eq!(data[0], Value::Int(13));
        assert_eq!(data[19], Value::Int(32));
    }

    #[test]
    fn test_read_frag_partial_and_reassembly() {
        // An INT[1000] read paginates at MAX_BYTES: 250 elements a frame.
        let device = device_with_scada(1000);
        let mut gathered: Vec<Value> = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut req = Dict::new();
            req.set("service", service::RD_FRG_REQ).unwrap();
            req.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
            req.set("path.segment[0].symbolic", "SCADA").unwrap();
            req.set("read_frag.elements", 1000u32).unwrap();
            req.set("read_frag.offset", offset).unwrap();
            assert!(device.execute(&mut req, "").unwrap());
            let piece = req.get_list("read_frag.data").unwrap();
            assert_eq!(piece[0], Value::Int((offset / 2) as i64));
            gathered.extend(piece.iter().cloned());
            match req.get_int("status").unwrap() as u8 {
                status::PARTIAL_TRANSFER => offset += piece.len() * 2,
                0x00 => break,
                other => panic!("unexpected status {other:#x}"),
            }
        }
        assert_eq!(gathered.len(), 1000);
        assert_eq!(gathered[999], Value::Int(999));
    }

    #[test]
    fn test_read_errors() {
        let device = device_with_scada(1000);

        // Odd byte offset over INT elements.
        let mut req = Dict::new();
        req.set("service", service::RD_FRG_REQ).unwrap();
        req.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
        req.set("path.segment[0].symbolic", "SCADA").unwrap();
        req.set("read_frag.elements", 2u32).unwrap();
        req.set("read_frag.offset", 7u32).unwrap();
        device.execute(&mut req, "").unwrap();
        assert_eq!(req.get_int("status").unwrap(), status::PATH_SEGMENT_ERROR as i64);

        // Beginning element out of bounds.
        let mut req = Dict::new();
        req.set("service", service::RD_FRG_REQ).unwrap();
        req.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
        req.set("path.segment[0].symbolic", "SCADA").unwrap();
        req.set("read_frag.elements", 1u32).unwrap();
        req.set("read_frag.offset", 2000u32).unwrap();
        device.execute(&mut req, "").unwrap();
        assert_eq!(req.get_int("status").unwrap(), status::PATH_SEGMENT_ERROR as i64);

        // Unknown tag name.
        let mut req = Dict::new();
        req.set("service", service::RD_TAG_REQ).unwrap();
        req.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
        req.set("path.segment[0].symbolic", "BOO").unwrap();
        req.set("read_tag.elements", 1u32).unwrap();
        device.execute(&mut req, "").unwrap();
        assert_eq!(req.get_int("status").unwrap(), status::PATH_SEGMENT_ERROR as i64);
        assert_eq!(
            req.get_list("status_ext.data").unwrap(),
            &vec![Value::Int(0)]
        );
    }

    #[test]
    fn test_write_capacity() {
        let device = device_with_scada(1000);

        // A write fitting capacity commits atomically.
        let mut req = Dict::new();
        req.set("service", service::WR_FRG_REQ).unwrap();
        req.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
        req.set("path.segment[0].symbolic", "SCADA").unwrap();
        req.set("write_frag.type", 0x00c3u32).unwrap();
        req.set("write_frag.elements", 4u32).unwrap();
        req.set("write_frag.offset", 6u32).unwrap();
        req.set(
            "write_frag.data",
            vec![Value::Int(30), Value::Int(40), Value::Int(50), Value::Int(60)],
        )
        .unwrap();
        device.execute(&mut req, "").unwrap();
        assert_eq!(req.get_int("status").unwrap(), 0);

        let mut read = Dict::new();
        read.set("service", service::RD_TAG_REQ).unwrap();
        read.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
        read.set("path.segment[0].symbolic", "SCADA").unwrap();
        read.set("read_tag.elements", 8u32).unwrap();
        device.execute(&mut read, "").unwrap();
        let data = read.get_list("read_tag.data").unwrap();
        assert_eq!(data[3], Value::Int(30));
        assert_eq!(data[6], Value::Int(60));

        // A write spilling past the end fails whole, changing nothing.
        let mut req = Dict::new();
        req.set("service", service::WR_FRG_REQ).unwrap();
        req.set("path.segment", vec![Value::Dict(Dict::new())]).unwrap();
        req.set("path.segment[0].symbolic", "SCADA").unwrap();
        req.set("write_frag.type", 0x00c3u32).unwrap();
        req.set("write_frag.elements", 4u32).unwrap();
        req.set("write_frag.offset", ((1000 - 3) * 2) as u32).unwrap();
        req.set(
            "write_frag.data",
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)],
        )
        .unwrap();
        device.execute(&mut req, "").unwrap();
        assert_eq!(req.get_int("status").unwrap(), status::CAPACITY_EXCEEDED as i64);
    }

    #[test]
    fn test_multiple_service_packet() {
        // The five-request batch of spec'd scenario: reads around a write
        // of number=1.25, executed in order.
        let device = device_with_scada(1000);
        let logix = device.registry.lookup(Logix::CLASS, 1).unwrap();
        logix.core().insert_attribute(
            4,
            Attribute::new("number", CipType::Real, vec![Value::Real(0.0)]),
        );
        device
            .symbols
            .define("number", CipAddr::new(Logix::CLASS, 1, Some(4)));

        let raw: Vec<u8> = [
            0x0A_u8, 0x02, 0x20, 0x02, 0x24, 0x01, //
            0x05, 0x00, //
            0x0c, 0x00, 0x18, 0x00, 0x24, 0x00, 0x36, 0x00, 0x48, 0x00, //
            0x4C, 0x04, 0x91, 0x05, b'S', b'C', b'A', b'D', b'A', 0x00, 0x01, 0x00, //
            0x4C, 0x04, 0x91, 0x05, b'S', b'C', b'A', b'D', b'A', 0x00, 0x01, 0x00, //
            0x4C, 0x04, 0x91, 0x06, b'n', b'u', b'm', b'b', b'e', b'r', 0x01, 0x00, //
            0x4D, 0x04, 0x91, 0x06, b'n', b'u', b'm', b'b', b'e', b'r', 0xca, 0x00, 0x01,
            0x00, 0x00, 0x00, 0xa0, 0x3f, //
            0x4C, 0x04, 0x91, 0x06, b'n', b'u', b'm', b'b', b'e', b'r', 0x01, 0x00,
        ]
        .to_vec();
        let mut req = Dict::new();
        request::parse(&request::logix_parser(), &raw, &mut req, "").unwrap();
        assert!(device.execute(&mut req, "").unwrap());

        assert_eq!(req.get_int("service").unwrap(), 0x8A);
        assert_eq!(req.get_int("status").unwrap(), 0);
        assert_eq!(req.get_int("multiple.number").unwrap(), 5);
        // Sub-reply 4: the write succeeded; sub-reply 5 reads 1.25 back.
        assert_eq!(req.get_int("multiple.request[3].service").unwrap(), 0xCD);
        assert_eq!(req.get_int("multiple.request[3].status").unwrap(), 0);
        assert_eq!(req.get_int("multiple.request[4].service").unwrap(), 0xCC);
        assert_eq!(
            req.get_list("multiple.request[4].read_tag.data").unwrap(),
            &vec![Value::Real(1.25)]
        );
        // The first read still failed nothing: full reply round-trips.
        let encoded = request::produce(&req, "").unwrap();
        assert_eq!(encoded[0], 0x8A);

        // Offsets in the produced reply locate each sub-reply start.
        let count = u16::from_le_bytes([encoded[4], encoded[5]]) as usize;
        assert_eq!(count, 5);
        for i in 0..count {
            let off =
                u16::from_le_bytes([encoded[6 + 2 * i], encoded[7 + 2 * i]]) as usize;
            let sub_service = encoded[4 + off];
            assert!(sub_service & 0x80 != 0, "sub-reply {i} at {off}");
        }
    }
}
