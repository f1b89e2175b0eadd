//! Set and frozenset objects.
//!
//! An open-addressing table of `(key, hash)` slots; `mask + 1` slots, null
//! keys mark empty slots. Reprs are sorted by rendered item for determinism.

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{header_invalid_reason, ObjHeader, PyObj};
use crate::traverse::Traversal;

const MAX_TABLE_SLOTS: i64 = 1 << 24;
const ENTRY_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy)]
pub struct PySetObject {
    pub header: ObjHeader,
    pub fill: i64,
    pub used: i64,
    pub mask: i64,
    pub table: MappedAddr,
}

impl PySetObject {
    pub const SIZE: u64 = 48;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PySetObject> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PySetObject {
            header: ObjHeader::parse(bytes),
            fill: LE::read_i64(&bytes[16..24]),
            used: LE::read_i64(&bytes[24..32]),
            mask: LE::read_i64(&bytes[32..40]),
            table: MappedAddr::new(LE::read_u64(&bytes[40..48])),
        })
    }

    /// Non-null keys from the table, in slot order.
    pub fn items(&self, env: &Environment) -> Result<Vec<MappedAddr<PyObj>>> {
        let slots = (self.mask + 1).clamp(0, MAX_TABLE_SLOTS) as u64;
        let bytes = env.store.read(self.table, slots * ENTRY_SIZE)?;
        Ok(bytes
            .chunks_exact(ENTRY_SIZE as usize)
            .map(|e| MappedAddr::new(LE::read_u64(&e[0..8])))
            .filter(|key| !key.is_null())
            .collect())
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if self.mask < 0 || self.mask + 1 > MAX_TABLE_SLOTS {
            return Some("invalid_mask");
        }
        if self.fill > self.mask + 1 {
            return Some("invalid_fill");
        }
        if self.used > self.fill {
            return Some("invalid_used");
        }
        if !env.store.obj_valid(self.table, 8) {
            return Some("invalid_table");
        }
        if !env
            .store
            .exists_range(self.table, (self.mask + 1) as u64 * ENTRY_SIZE)
        {
            return Some("invalid_table_range");
        }
        let items = match self.items(env) {
            Ok(items) => items,
            Err(_) => return Some("invalid_table_range"),
        };
        for key in items {
            if !env.store.obj_valid_or_null(key, 8) || header_invalid_reason(env, key).is_some() {
                return Some("invalid_entry");
            }
        }
        None
    }

    pub fn direct_referents(&self, env: &Environment) -> Result<HashSet<MappedAddr>> {
        let mut ret: HashSet<MappedAddr> = HashSet::from([self.table]);
        for key in self.items(env)? {
            ret.insert(key.cast());
        }
        Ok(ret)
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>, frozen: bool) -> String {
        let name = if frozen { "frozenset" } else { "set" };
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<{name} !{reason}>");
        }
        let items = match self.items(t.env) {
            Ok(items) => items,
            Err(_) => return format!("<{name} !invalid_table_range>"),
        };
        t.guarded(addr, name, |t| {
            if !t.recursion_allowed() {
                return format!("<{name} !recursion_depth>");
            }
            t.indented(|t| {
                let (mut entries, has_extra) = t.capped_reprs(&items);
                let body = match (entries.len(), has_extra) {
                    (0, false) => return if frozen { "frozenset()".to_string() } else { "set()".to_string() },
                    (1, false) => format!("{{{}}}", entries[0]),
                    _ => {
                        entries.sort_unstable();
                        t.multiline("{", "}", &entries, has_extra)
                    }
                };
                if frozen {
                    format!("frozenset({body})")
                } else {
                    body
                }
            })
        })
    }
}
