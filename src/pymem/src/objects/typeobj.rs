//! Type objects.
//!
//! The self-typed `type` object is the bootstrap anchor for the catalog:
//! it is the unique object whose `ob_type` points at itself and whose name
//! decodes to `"type"`.

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{PyType, VarHeader};
use crate::traverse::Traversal;

#[derive(Debug, Clone, Copy)]
pub struct PyTypeObject {
    pub header: VarHeader,
    pub tp_name: MappedAddr,
    pub tp_basicsize: i64,
    pub tp_itemsize: i64,
}

impl PyTypeObject {
    /// Window covering the fields this decoder reads.
    pub const SIZE: u64 = 48;

    pub fn parse(bytes: &[u8]) -> PyTypeObject {
        PyTypeObject {
            header: VarHeader::parse(bytes),
            tp_name: MappedAddr::new(LE::read_u64(&bytes[24..32])),
            tp_basicsize: LE::read_i64(&bytes[32..40]),
            tp_itemsize: LE::read_i64(&bytes[40..48]),
        }
    }

    pub fn read(env: &Environment, addr: MappedAddr<PyType>) -> Result<PyTypeObject> {
        Ok(Self::parse(env.store.read(addr, Self::SIZE)?))
    }

    /// The type's name, decoded from its NUL-terminated name field.
    pub fn name(&self, env: &Environment) -> Result<String> {
        env.store.read_cstr(self.tp_name)
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if !env.store.obj_valid(self.tp_name, 1) {
            return Some("invalid_tp_name");
        }
        let name = match self.name(env) {
            Ok(name) => name,
            Err(_) => return Some("invalid_tp_name"),
        };
        if name.is_empty()
            || name.len() > 0x200
            || !name.bytes().all(|b| b.is_ascii_graphic())
        {
            return Some("invalid_tp_name");
        }
        if self.tp_basicsize < 0 || self.tp_itemsize < 0 {
            return Some("invalid_tp_size");
        }
        None
    }

    pub fn direct_referents(&self) -> Result<HashSet<MappedAddr>> {
        Ok(HashSet::from([self.tp_name]))
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyType>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<type !{reason}>");
        }
        let name = self.name(t.env).unwrap_or_else(|_| "?".to_string());
        format!("<type {name}>@{addr}")
    }
}
