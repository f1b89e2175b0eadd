//! Module objects.
//!
//! The instance dict sits at a fixed offset right after the header; reading
//! its `__name__` entry identifies the module.

use std::collections::HashSet;

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{ObjHeader, PyDictObject, PyObj};
use crate::traverse::Traversal;

const DICT_OFFSET: i64 = 16;

#[derive(Debug, Clone, Copy)]
pub struct PyModuleObject {
    pub header: ObjHeader,
    pub md_dict: MappedAddr<PyObj>,
}

impl PyModuleObject {
    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyModuleObject> {
        Ok(PyModuleObject {
            header: ObjHeader::read(env, addr)?,
            md_dict: env.store.read_ptr(addr.offset_bytes(DICT_OFFSET))?,
        })
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if !env.store.obj_valid(self.md_dict, 8) {
            return Some("invalid_md_dict");
        }
        if let Some(dict_type) = env.get_type_if_exists("dict") {
            if env.invalid_reason_expected(self.md_dict, dict_type).is_some() {
                return Some("invalid_md_dict");
            }
        }
        None
    }

    /// The module's `__name__`, when its dict has a string one.
    pub fn name(&self, env: &Environment) -> Result<Option<String>> {
        let dict = PyDictObject::read(env, self.md_dict)?;
        match dict.value_for_key(env, "__name__")? {
            Some(value) => Ok(env.decode_string_types(value).ok()),
            None => Ok(None),
        }
    }

    pub fn direct_referents(&self) -> Result<HashSet<MappedAddr>> {
        Ok(HashSet::from([self.md_dict.cast()]))
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<module !{reason}>");
        }
        match self.name(t.env) {
            Ok(Some(name)) => format!("<module '{name}'>@{addr}"),
            _ => format!("<module ?>@{addr}"),
        }
    }
}
