//! The CIP Object model: typed attribute arrays, per-instance objects,
//! the process-wide registry, and the standard Get/Set services every
//! object answers.

use automata::Machine;
use dict::{Dict, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::request;
use crate::{service, status, Device, Error};

/// Excluded from Get Attributes All.
pub const MASK_GA_ALL: u8 = 0x01;

/// A typed, optionally-indexable array of CIP primitive values. Element
/// storage is guarded by a lock: connection tasks read and write
/// attributes concurrently, and each read or write of one attribute is
/// atomic.
#[derive(Debug)]
pub struct Attribute {
    pub name: String,
    pub ty: crate::types::CipType,
    pub mask: u8,
    values: Mutex<Vec<Value>>,
}

impl Attribute {
    pub fn new(
        name: impl Into<String>,
        ty: crate::types::CipType,
        default: Vec<Value>,
    ) -> Attribute {
        let values = if default.is_empty() {
            vec![zero_of(ty)]
        } else {
            default
        };
        Attribute {
            name: name.into(),
            ty,
            mask: 0,
            values: Mutex::new(values),
        }
    }

    /// An array attribute of `length` elements, seeded from `initial`
    /// (remaining elements take the type's zero value).
    pub fn array(
        name: impl Into<String>,
        ty: crate::types::CipType,
        length: usize,
        initial: Vec<Value>,
    ) -> Attribute {
        let mut values = initial;
        values.truncate(length);
        while values.len() < length {
            values.push(zero_of(ty));
        }
        Attribute {
            name: name.into(),
            ty,
            mask: 0,
            values: Mutex::new(values),
        }
    }

    pub fn masked(mut self, mask: u8) -> Attribute {
        self.mask = mask;
        self
    }

    pub fn len(&self) -> usize {
        self.values.lock().expect("attribute lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed per-element byte size; variable-size types have none.
    pub fn element_size(&self) -> Option<usize> {
        self.ty.size()
    }

    /// Snapshot of elements `[beg, end)`.
    pub fn read(&self, beg: usize, end: usize) -> Vec<Value> {
        let values = self.values.lock().expect("attribute lock poisoned");
        values[beg.min(values.len())..end.min(values.len())].to_vec()
    }

    /// Overwrite elements starting at `beg`. The whole write commits
    /// under one lock acquisition or fails without touching anything.
    pub fn write(&self, beg: usize, new: &[Value]) -> Result<(), Error> {
        let mut values = self.values.lock().expect("attribute lock poisoned");
        if beg + new.len() > values.len() {
            return Err(Error::Status {
                code: status::CAPACITY_EXCEEDED,
                extended: vec![],
            });
        }
        values[beg..beg + new.len()].clone_from_slice(new);
        Ok(())
    }

    /// Encode every element in order.
    pub fn produce(&self, out: &mut Vec<u8>) -> Result<(), Error> {
        let values = self.values.lock().expect("attribute lock poisoned");
        for v in values.iter() {
            self.ty.produce(v, out)?;
        }
        Ok(())
    }
}

fn zero_of(ty: crate::types::CipType) -> Value {
    use crate::types::CipType;
    match ty {
        CipType::Real | CipType::Lreal => Value::Real(0.0),
        CipType::Bool => Value::Bool(false),
        CipType::Sstring | CipType::String | CipType::Ipaddr => Value::String(String::new()),
        CipType::Epath => Value::Bytes(Vec::new()),
        _ => Value::Int(0),
    }
}

/// Common state of every CIP object instance: identity and its attribute
/// table. The table is populated during startup and read-mostly after.
#[derive(Debug)]
pub struct ObjectCore {
    pub class_id: u16,
    pub instance_id: u16,
    pub name: String,
    attributes: RwLock<BTreeMap<u16, Arc<Attribute>>>,
}

impl ObjectCore {
    pub fn new(class_id: u16, instance_id: u16, name: impl Into<String>) -> ObjectCore {
        ObjectCore {
            class_id,
            instance_id,
            name: name.into(),
            attributes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert_attribute(&self, id: u16, attribute: Attribute) -> Arc<Attribute> {
        let attribute = Arc::new(attribute);
        self.attributes
            .write()
            .expect("attribute table lock poisoned")
            .insert(id, attribute.clone());
        attribute
    }

    pub fn attribute(&self, id: u16) -> Option<Arc<Attribute>> {
        self.attributes
            .read()
            .expect("attribute table lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn attributes(&self) -> Vec<(u16, Arc<Attribute>)> {
        self.attributes
            .read()
            .expect("attribute table lock poisoned")
            .iter()
            .map(|(id, a)| (*id, a.clone()))
            .collect()
    }

    /// Handle one of the four standard services, mutating `req` into the
    /// reply. Unknown services get status 0x08.
    pub fn standard_request(
        &self,
        req: &mut Dict,
        path: &str,
        device: &Device,
    ) -> Result<bool, Error> {
        let at = |field: &str| automata::join(path, field);
        let svc = req.get_int(&at("service"))? as u8;
        let result = match svc {
            service::GA_ALL_REQ => self.get_attributes_all(req, path),
            service::GA_SNG_REQ => self.get_attribute_single(req, path, device),
            service::GA_LST_REQ => self.get_attribute_list(req, path),
            service::SA_SNG_REQ => self.set_attribute_single(req, path, device),
            _ => Err(Error::Status {
                code: status::SERVICE_NOT_SUPPORTED,
                extended: vec![],
            }),
        };
        finish_reply(req, path, svc, result)
    }

    fn get_attributes_all(&self, req: &mut Dict, path: &str) -> Result<(), Error> {
        let mut out = Vec::new();
        for (_, attribute) in self.attributes() {
            if attribute.mask & MASK_GA_ALL != 0 {
                continue;
            }
            attribute.produce(&mut out)?;
        }
        req.set(
            &automata::join(path, "get_attributes_all.data"),
            bytes_list(&out),
        )?;
        Ok(())
    }

    fn get_attribute_single(
        &self,
        req: &mut Dict,
        path: &str,
        device: &Device,
    ) -> Result<(), Error> {
        let attribute = self.addressed_attribute(req, path, device)?;
        let mut out = Vec::new();
        attribute.produce(&mut out)?;
        req.set(
            &automata::join(path, "get_attribute_single.data"),
            bytes_list(&out),
        )?;
        Ok(())
    }

    fn get_attribute_list(&self, req: &mut Dict, path: &str) -> Result<(), Error> {
        let ids: Vec<u16> = req
            .get_list(&automata::join(path, "get_attribute_list.attributes"))?
            .iter()
            .map(|v| v.as_int().unwrap_or(0) as u16)
            .collect();
        let mut out = Vec::new();
        put_u16(&mut out, ids.len() as u16);
        for id in ids {
            put_u16(&mut out, id as u16);
            match self.attribute(id) {
                Some(attribute) => {
                    put_u16(&mut out, 0x0000);
                    attribute.produce(&mut out)?;
                }
                None => {
                    put_u16(&mut out, status::PATH_UNKNOWN as u16);
                }
            }
        }
        req.set(
            &automata::join(path, "get_attribute_list.data"),
            bytes_list(&out),
        )?;
        Ok(())
    }

    fn set_attribute_single(
        &self,
        req: &mut Dict,
        path: &str,
        device: &Device,
    ) -> Result<(), Error> {
        let attribute = self.addressed_attribute(req, path, device)?;
        let raw: Vec<u8> = req
            .get_list(&automata::join(path, "set_attribute_single.data"))?
            .iter()
            .map(|v| v.as_int().unwrap_or(0) as u8)
            .collect();
        let size = attribute.element_size().ok_or(Error::Status {
            code: status::SERVICE_NOT_SUPPORTED,
            extended: vec![],
        })?;
        if raw.is_empty() || raw.len() % size != 0 {
            return Err(Error::Status {
                code: status::NOT_ENOUGH_DATA,
                extended: vec![],
            });
        }
        let values: Vec<Value> = raw.chunks(size).map(|el| attribute.ty.decode(el)).collect();
        attribute.write(0, &values)?;
        Ok(())
    }

    /// The attribute the request path addresses.
    fn addressed_attribute(
        &self,
        req: &Dict,
        path: &str,
        device: &Device,
    ) -> Result<Arc<Attribute>, Error> {
        let (_, _, attribute) = crate::epath::resolve(
            req,
            &automata::join(path, "path"),
            &device.symbols,
            true,
        )
        .map_err(|_| Error::Status {
            code: status::PATH_SEGMENT_ERROR,
            extended: vec![],
        })?;
        let id = attribute.ok_or(Error::Status {
            code: status::PATH_SEGMENT_ERROR,
            extended: vec![],
        })?;
        self.attribute(id).ok_or(Error::Status {
            code: status::PATH_UNKNOWN,
            extended: vec![],
        })
    }
}

/// Convert handler results into the in-place reply form: reply service
/// code, status, and extended status words.
pub fn finish_reply(
    req: &mut Dict,
    path: &str,
    svc: u8,
    result: Result<(), Error>,
) -> Result<bool, Error> {
    let at = |field: &str| automata::join(path, field);
    req.set(&at("service"), svc | 0x80)?;
    match result {
        Ok(()) => {
            req.set(&at("status"), 0u32)?;
            req.set(&at("status_ext.size"), 0u32)?;
        }
        Err(Error::Status { code, extended }) => {
            req.set(&at("status"), code)?;
            req.set(&at("status_ext.size"), extended.len())?;
            if !extended.is_empty() {
                let words: Vec<Value> =
                    extended.iter().map(|w| Value::Int(*w as i64)).collect();
                req.set(&at("status_ext.data"), words)?;
            }
        }
        Err(err) => return Err(err),
    }
    Ok(true)
}

/// Raw bytes rendered as the USINT list the reply parser produces, so
/// handler output and re-parsed output compare equal.
pub fn bytes_list(raw: &[u8]) -> Vec<Value> {
    raw.iter().map(|b| Value::Int(*b as i64)).collect()
}

/// A CIP object: shared core plus service behavior. Objects live for the
/// process; the registry never forgets one.
pub trait Object: Send + Sync {
    fn core(&self) -> &ObjectCore;

    /// The request parser for services this object understands.
    fn parser(&self) -> Arc<Machine> {
        request::base_parser()
    }

    /// Process a parsed request in place. Returns true when a reply
    /// should be sent, false to drop the connection.
    fn request(&self, req: &mut Dict, path: &str, device: &Device) -> Result<bool, Error> {
        self.core().standard_request(req, path, device)
    }
}

/// A plain object with only the standard services: used for class-level
/// (instance 0) metadata and simple custom classes.
#[derive(Debug)]
pub struct StandardObject {
    core: ObjectCore,
}

impl StandardObject {
    pub fn new(class_id: u16, instance_id: u16, name: impl Into<String>) -> StandardObject {
        StandardObject {
            core: ObjectCore::new(class_id, instance_id, name),
        }
    }
}

impl Object for StandardObject {
    fn core(&self) -> &ObjectCore {
        &self.core
    }
}

/// The process-wide object registry, keyed by `(class_id, instance_id)`.
/// Registering an instance creates its class-level object on demand and
/// maintains the class attributes: 1 revision, 2 max instance, 3
/// instance count, 4 optional attribute list.
#[derive(Default)]
pub struct Registry {
    map: RwLock<BTreeMap<(u16, u16), Arc<dyn Object>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&self, object: Arc<dyn Object>) {
        use crate::types::CipType;

        let class_id = object.core().class_id;
        let instance_id = object.core().instance_id;
        let class_name = object.core().name.clone();
        let mut map = self.map.write().expect("registry lock poisoned");
        map.insert((class_id, instance_id), object);

        if instance_id == 0 {
            return;
        }
        map.entry((class_id, 0)).or_insert_with(|| {
            let meta = StandardObject::new(class_id, 0, class_name);
            meta.core()
                .insert_attribute(1, Attribute::new("Revision", CipType::Uint, vec![Value::Int(1)]));
            meta.core().insert_attribute(
                2,
                Attribute::new("Max Instance", CipType::Uint, vec![Value::Int(0)]),
            );
            meta.core().insert_attribute(
                3,
                Attribute::new("Number of Instances", CipType::Uint, vec![Value::Int(0)]),
            );
            meta.core().insert_attribute(
                4,
                Attribute::new("Optional Attributes", CipType::Uint, vec![Value::Int(0)]),
            );
            Arc::new(meta) as Arc<dyn Object>
        });

        let instances: Vec<u16> = map
            .keys()
            .filter(|(c, i)| *c == class_id && *i != 0)
            .map(|(_, i)| *i)
            .collect();
        let meta = map.get(&(class_id, 0)).expect("class meta just ensured");
        if let Some(max) = meta.core().attribute(2) {
            let highest = instances.iter().copied().max().unwrap_or(0);
            let _ = max.write(0, &[Value::Int(highest as i64)]);
        }
        if let Some(count) = meta.core().attribute(3) {
            let _ = count.write(0, &[Value::Int(instances.len() as i64)]);
        }
    }

    pub fn lookup(&self, class_id: u16, instance_id: u16) -> Option<Arc<dyn Object>> {
        self.map
            .read()
            .expect("registry lock poisoned")
            .get(&(class_id, instance_id))
            .cloned()
    }

    pub fn classes(&self) -> Vec<u16> {
        let map = self.map.read().expect("registry lock poisoned");
        let mut classes: Vec<u16> = map.keys().map(|(c, _)| *c).collect();
        classes.dedup();
        classes
    }
}

/// The Identity object (class 0x01): a LOGIX5561-style identity.
pub struct Identity {
    core: ObjectCore,
}

impl Identity {
    pub const CLASS: u16 = 0x01;

    pub fn new(name: impl Into<String>) -> Identity {
        use crate::types::CipType;
        let core = ObjectCore::new(Self::CLASS, 1, name);
        core.insert_attribute(
            1,
            Attribute::new("Vendor Number", CipType::Int, vec![Value::Int(0x0001)]),
        );
        core.insert_attribute(
            2,
            Attribute::new("Device Type", CipType::Int, vec![Value::Int(0x000e)]),
        );
        core.insert_attribute(
            3,
            Attribute::new("Product Code Number", CipType::Int, vec![Value::Int(0x0036)]),
        );
        core.insert_attribute(
            4,
            Attribute::new("Product Revision", CipType::Int, vec![Value::Int(0x0b14)]),
        );
        core.insert_attribute(
            5,
            Attribute::new("Status Word", CipType::Int, vec![Value::Int(0x3160)]),
        );
        core.insert_attribute(
            6,
            Attribute::new("Serial Number", CipType::Dint, vec![Value::Int(0x006c061a)]),
        );
        core.insert_attribute(
            7,
            Attribute::new(
                "Product Name",
                CipType::Sstring,
                vec![Value::String("1756-L61/B LOGIX5561".to_string())],
            ),
        );
        // Get Attributes All answers with attributes 1..7 only; state and
        // the configuration attributes are reachable singly.
        core.insert_attribute(
            8,
            Attribute::new("State", CipType::Usint, vec![Value::Int(0xff)])
                .masked(MASK_GA_ALL),
        );
        core.insert_attribute(
            9,
            Attribute::new("Configuration Consistency", CipType::Uint, vec![Value::Int(0)])
                .masked(MASK_GA_ALL),
        );
        core.insert_attribute(
            10,
            Attribute::new("Heartbeat Interval", CipType::Usint, vec![Value::Int(0)])
                .masked(MASK_GA_ALL),
        );
        Identity { core }
    }
}

impl Object for Identity {
    fn core(&self) -> &ObjectCore {
        &self.core
    }
}

/// The TCP/IP Interface object (class 0xF5). Composite attributes are
/// stored structurally flattened (a zeroed interface configuration is a
/// zeroed octet run), which keeps the Get Attributes All encoding of CIP
/// Vol 2 Table 5-4.13 exact for the defaults a simulator presents.
pub struct Tcpip {
    core: ObjectCore,
}

impl Tcpip {
    pub const CLASS: u16 = 0xF5;

    pub fn new(name: impl Into<String>) -> Tcpip {
        use crate::types::CipType;
        let core = ObjectCore::new(Self::CLASS, 1, name);
        core.insert_attribute(
            1,
            Attribute::new("Interface Status", CipType::Dint, vec![Value::Int(2)]),
        );
        core.insert_attribute(
            2,
            Attribute::new("Configuration Capability", CipType::Dint, vec![Value::Int(0x30)]),
        );
        core.insert_attribute(
            3,
            Attribute::new("Configuration Control", CipType::Dint, vec![Value::Int(0)]),
        );
        core.insert_attribute(
            4,
            Attribute::new("Path to Physical Link", CipType::Uint, vec![Value::Int(0)]),
        );
        core.insert_attribute(
            5,
            Attribute::array(
                "Interface Configuration",
                CipType::Usint,
                22,
                vec![],
            ),
        );
        core.insert_attribute(
            6,
            Attribute::new("Host Name", CipType::String, vec![Value::String(String::new())]),
        );
        Tcpip { core }
    }
}

impl Object for Tcpip {
    fn core(&self) -> &ObjectCore {
        &self.core
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}
