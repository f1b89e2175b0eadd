//! Tuple and list objects.
//!
//! Tuples carry their item pointers inline after the header; lists point at
//! a separately allocated array. Both preserve element order in reprs.

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{header_invalid_reason, PyObj, VarHeader};
use crate::traverse::Traversal;

/// Upper bound on plausible container lengths; anything larger is treated
/// as scan noise.
const MAX_ELEMS: i64 = 1 << 24;

#[derive(Debug, Clone, Copy)]
pub struct PyTupleObject {
    pub header: VarHeader,
}

impl PyTupleObject {
    pub const ITEMS_OFFSET: u64 = 24;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyTupleObject> {
        Ok(PyTupleObject {
            header: VarHeader::read(env, addr)?,
        })
    }

    pub fn items(&self, env: &Environment, addr: MappedAddr<PyObj>) -> Result<Vec<MappedAddr<PyObj>>> {
        let count = self.header.ob_size.clamp(0, MAX_ELEMS) as u64;
        let bytes = env.store.read(addr.offset_bytes(Self::ITEMS_OFFSET as i64), count * 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| MappedAddr::new(LE::read_u64(c)))
            .collect())
    }

    pub fn invalid_reason(
        &self,
        env: &Environment,
        addr: MappedAddr<PyObj>,
    ) -> Option<&'static str> {
        if self.header.ob_size < 0 || self.header.ob_size > MAX_ELEMS {
            return Some("invalid_ob_size");
        }
        let items_addr = addr.offset_bytes(Self::ITEMS_OFFSET as i64);
        if !env
            .store
            .exists_range(items_addr, self.header.ob_size as u64 * 8)
        {
            return Some("invalid_items_range");
        }
        let items = match self.items(env, addr) {
            Ok(items) => items,
            Err(_) => return Some("invalid_items_range"),
        };
        for item in items {
            if !env.store.obj_valid_or_null(item, 8) {
                return Some("invalid_item");
            }
            if !item.is_null() && header_invalid_reason(env, item).is_some() {
                return Some("invalid_item");
            }
        }
        None
    }

    pub fn direct_referents(
        &self,
        env: &Environment,
        addr: MappedAddr<PyObj>,
    ) -> Result<HashSet<MappedAddr>> {
        Ok(self.items(env, addr)?.into_iter().map(|a| a.cast()).collect())
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env, addr)) {
            return format!("<tuple !{reason}>");
        }
        let items = match self.items(t.env, addr) {
            Ok(items) => items,
            Err(_) => return "<tuple !invalid_items_range>".to_string(),
        };
        t.guarded(addr, "tuple", |t| {
            if !t.recursion_allowed() {
                return "<tuple !recursion_depth>".to_string();
            }
            t.indented(|t| {
                let (entries, has_extra) = t.capped_reprs(&items);
                match (entries.len(), has_extra) {
                    (0, false) => "()".to_string(),
                    (1, false) => format!("({},)", entries[0]),
                    _ => t.multiline("(", ")", &entries, has_extra),
                }
            })
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PyListObject {
    pub header: VarHeader,
    pub ob_item: MappedAddr,
    pub allocated: i64,
}

impl PyListObject {
    pub const SIZE: u64 = 40;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyListObject> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PyListObject {
            header: VarHeader::parse(bytes),
            ob_item: MappedAddr::new(LE::read_u64(&bytes[24..32])),
            allocated: LE::read_i64(&bytes[32..40]),
        })
    }

    pub fn items(&self, env: &Environment) -> Result<Vec<MappedAddr<PyObj>>> {
        if self.header.ob_size == 0 {
            return Ok(Vec::new());
        }
        let count = self.header.ob_size.clamp(0, MAX_ELEMS) as u64;
        let bytes = env.store.read(self.ob_item, count * 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| MappedAddr::new(LE::read_u64(c)))
            .collect())
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if self.header.ob_size < 0 || self.header.ob_size > MAX_ELEMS {
            return Some("invalid_ob_size");
        }
        if self.allocated < self.header.ob_size {
            return Some("invalid_allocated");
        }
        if self.header.ob_size == 0 {
            return None;
        }
        if !env.store.obj_valid(self.ob_item, 8) {
            return Some("invalid_ob_item");
        }
        if !env
            .store
            .exists_range(self.ob_item, self.header.ob_size as u64 * 8)
        {
            return Some("invalid_items_range");
        }
        let items = match self.items(env) {
            Ok(items) => items,
            Err(_) => return Some("invalid_items_range"),
        };
        for item in items {
            if !env.store.obj_valid_or_null(item, 8) {
                return Some("invalid_item");
            }
            if !item.is_null() && header_invalid_reason(env, item).is_some() {
                return Some("invalid_item");
            }
        }
        None
    }

    pub fn direct_referents(&self, env: &Environment) -> Result<HashSet<MappedAddr>> {
        let mut ret: HashSet<MappedAddr> = HashSet::from([self.ob_item]);
        for item in self.items(env)? {
            ret.insert(item.cast());
        }
        Ok(ret)
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<list !{reason}>");
        }
        let items = match self.items(t.env) {
            Ok(items) => items,
            Err(_) => return "<list !invalid_items_range>".to_string(),
        };
        t.guarded(addr, "list", |t| {
            if !t.recursion_allowed() {
                return "<list !recursion_depth>".to_string();
            }
            t.indented(|t| {
                let (entries, has_extra) = t.capped_reprs(&items);
                match (entries.len(), has_extra) {
                    (0, false) => "[]".to_string(),
                    (1, false) => format!("[{}]", entries[0]),
                    _ => t.multiline("[", "]", &entries, has_extra),
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SnapshotBuilder;

    #[test]
    fn test_tuple_items_preserve_order() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        let one = b.int_obj(0x2000, ty.int, 1);
        let two = b.int_obj(0x2040, ty.int, 2);
        let tup = b.tuple_obj(0x2100, ty.tuple, &[two, one, two]);
        let (_dir, env) = b.build_env();

        let t = PyTupleObject::read(&env, tup.cast()).unwrap();
        assert_eq!(t.invalid_reason(&env, tup.cast()), None);
        let items = t.items(&env, tup.cast()).unwrap();
        assert_eq!(
            items.iter().map(|a| a.raw()).collect::<Vec<_>>(),
            vec![0x2040, 0x2000, 0x2040]
        );
    }

    #[test]
    fn test_tuple_negative_size_invalid() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        b.var_header(0x2000, ty.tuple, -3);
        let (_dir, env) = b.build_env();

        let t = PyTupleObject::read(&env, MappedAddr::new(0x2000)).unwrap();
        assert_eq!(
            t.invalid_reason(&env, MappedAddr::new(0x2000)),
            Some("invalid_ob_size")
        );
    }

    #[test]
    fn test_tuple_unaligned_item_invalid() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        let odd = MappedAddr::new(0x2001);
        b.tuple_obj(0x2100, ty.tuple, &[odd]);
        let (_dir, env) = b.build_env();

        let t = PyTupleObject::read(&env, MappedAddr::new(0x2100)).unwrap();
        assert_eq!(
            t.invalid_reason(&env, MappedAddr::new(0x2100)),
            Some("invalid_item")
        );
    }

    #[test]
    fn test_list_items_and_referents() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        let a = b.int_obj(0x2000, ty.int, 10);
        let lst = b.list_obj(0x2100, ty.list, 0x2200, &[a]);
        let (_dir, env) = b.build_env();

        let l = PyListObject::read(&env, lst.cast()).unwrap();
        assert_eq!(l.invalid_reason(&env), None);
        assert_eq!(l.items(&env).unwrap(), vec![a.cast()]);

        let refs = l.direct_referents(&env).unwrap();
        assert!(refs.contains(&a));
        assert!(refs.contains(&MappedAddr::new(0x2200))); // the item store
    }

    #[test]
    fn test_list_allocated_below_size_invalid() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        let a = b.int_obj(0x2000, ty.int, 10);
        b.list_obj(0x2100, ty.list, 0x2200, &[a]);
        b.wi64(0x2100 + 32, 0); // allocated < ob_size
        let (_dir, env) = b.build_env();

        let l = PyListObject::read(&env, MappedAddr::new(0x2100)).unwrap();
        assert_eq!(l.invalid_reason(&env), Some("invalid_allocated"));
    }

    #[test]
    fn test_empty_list_with_null_items_is_valid() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        b.var_header(0x2100, ty.list, 0);
        let (_dir, env) = b.build_env();

        let l = PyListObject::read(&env, MappedAddr::new(0x2100)).unwrap();
        assert_eq!(l.invalid_reason(&env), None);
        assert!(l.items(&env).unwrap().is_empty());
    }
}
