//! Dict objects.
//!
//! A dict points at a keys object holding the hash table: a variable-width
//! index table (`dk_size` slots of 1/2/4/8 bytes) followed by packed
//! `(hash, key, value)` entry records. Split dicts keep per-instance values
//! in the `ma_values` vector and the keys object is shared.

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{header_invalid_reason, ObjHeader, PyObj};
use crate::traverse::Traversal;

const ENTRY_SIZE: u64 = 24;
const MAX_DK_SIZE: i64 = 1 << 28;

/// Header of a keys object; the index table and entry records trail it.
#[derive(Debug, Clone, Copy)]
pub struct PyDictKeys {
    pub dk_refcnt: u64,
    pub dk_size: i64,
    pub dk_usable: i64,
    pub dk_nentries: i64,
}

impl PyDictKeys {
    pub const SIZE: u64 = 40;

    pub fn read(env: &Environment, addr: MappedAddr) -> Result<PyDictKeys> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PyDictKeys {
            dk_refcnt: LE::read_u64(&bytes[0..8]),
            dk_size: LE::read_i64(&bytes[8..16]),
            dk_usable: LE::read_i64(&bytes[24..32]),
            dk_nentries: LE::read_i64(&bytes[32..40]),
        })
    }

    /// Width in bytes of one index-table slot, determined by the table size.
    pub fn index_width(&self) -> u64 {
        if self.dk_size <= 0xFF {
            1
        } else if self.dk_size <= 0xFFFF {
            2
        } else if self.dk_size <= 0xFFFF_FFFF {
            4
        } else {
            8
        }
    }

    pub fn num_entries(&self) -> i64 {
        self.dk_usable + self.dk_nentries
    }

    pub fn invalid_reason(&self) -> Option<&'static str> {
        if self.dk_size <= 0 || self.dk_size > MAX_DK_SIZE {
            return Some("invalid_dk_size");
        }
        if self.dk_usable < 0 || self.dk_nentries < 0 || self.num_entries() > self.dk_size {
            return Some("invalid_dk_counts");
        }
        None
    }

    pub fn repr(&self) -> String {
        format!(
            "<dict.keys size={} usable={} nentries={}>",
            self.dk_size, self.dk_usable, self.dk_nentries
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PyDictObject {
    pub header: ObjHeader,
    pub ma_used: i64,
    pub ma_keys: MappedAddr,
    pub ma_values: MappedAddr,
}

impl PyDictObject {
    pub const SIZE: u64 = 48;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyDictObject> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PyDictObject {
            header: ObjHeader::parse(bytes),
            ma_used: LE::read_i64(&bytes[16..24]),
            ma_keys: MappedAddr::new(LE::read_u64(&bytes[32..40])),
            ma_values: MappedAddr::new(LE::read_u64(&bytes[40..48])),
        })
    }

    pub fn keys(&self, env: &Environment) -> Result<PyDictKeys> {
        PyDictKeys::read(env, self.ma_keys)
    }

    fn table_addr(&self) -> MappedAddr {
        self.ma_keys.offset_bytes(PyDictKeys::SIZE as i64)
    }

    fn entries_addr(&self, keys: &PyDictKeys) -> MappedAddr {
        self.table_addr()
            .offset_bytes((keys.index_width() * keys.dk_size as u64) as i64)
    }

    /// The index table as signed slot values; negative slots are empty.
    pub fn table(&self, env: &Environment) -> Result<Vec<i64>> {
        let keys = self.keys(env)?;
        let width = keys.index_width();
        let bytes = env
            .store
            .read(self.table_addr(), width * keys.dk_size as u64)?;
        Ok(bytes
            .chunks_exact(width as usize)
            .map(|chunk| match width {
                1 => chunk[0] as i8 as i64,
                2 => LE::read_i16(chunk) as i64,
                4 => LE::read_i32(chunk) as i64,
                _ => LE::read_i64(chunk),
            })
            .collect())
    }

    /// (key, value) address pairs in table order. For split dicts the value
    /// comes from `ma_values[slot]`, otherwise from the entry record.
    pub fn items(
        &self,
        env: &Environment,
    ) -> Result<Vec<(MappedAddr<PyObj>, MappedAddr<PyObj>)>> {
        let keys = self.keys(env)?;
        let num_entries = keys.num_entries().max(0) as u64;
        let entries = env
            .store
            .read(self.entries_addr(&keys), num_entries * ENTRY_SIZE)?;
        let values = if self.ma_values.is_null() {
            None
        } else {
            Some(env.store.read(self.ma_values, num_entries * 8)?)
        };

        let mut ret = Vec::new();
        for slot in self.table(env)? {
            if slot < 0 || slot as u64 >= num_entries {
                continue;
            }
            let entry = &entries[(slot as u64 * ENTRY_SIZE) as usize..];
            let key = MappedAddr::new(LE::read_u64(&entry[8..16]));
            let value = match values {
                Some(values) => MappedAddr::new(LE::read_u64(&values[slot as usize * 8..])),
                None => MappedAddr::new(LE::read_u64(&entry[16..24])),
            };
            ret.push((key, value));
        }
        Ok(ret)
    }

    /// Look up a value whose key is a str equal to `wanted`.
    pub fn value_for_key(
        &self,
        env: &Environment,
        wanted: &str,
    ) -> Result<Option<MappedAddr<PyObj>>> {
        for (key, value) in self.items(env)? {
            if let Ok(text) = env.decode_string_types(key) {
                if text == wanted {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if !env.store.obj_valid(self.ma_keys, 8) {
            return Some("invalid_ma_keys");
        }
        let keys = match self.keys(env) {
            Ok(keys) => keys,
            Err(_) => return Some("invalid_ma_keys"),
        };
        if let Some(reason) = keys.invalid_reason() {
            return Some(reason);
        }

        let table_bytes = keys.index_width() * keys.dk_size as u64;
        if !env.store.exists_range(self.table_addr(), table_bytes) {
            return Some("invalid_ma_keys_table");
        }
        let num_entries = keys.num_entries() as u64;
        if !env
            .store
            .exists_range(self.entries_addr(&keys), num_entries * ENTRY_SIZE)
        {
            return Some("invalid_ma_keys_entries");
        }
        if !self.ma_values.is_null() {
            if !env.store.obj_valid(self.ma_values, 8) {
                return Some("invalid_ma_values");
            }
            if !env.store.exists_range(self.ma_values, num_entries * 8) {
                return Some("invalid_ma_values_range");
            }
        }

        let items = match self.items(env) {
            Ok(items) => items,
            Err(_) => return Some("invalid_ma_keys_entries"),
        };
        for (key, value) in items {
            if !env.store.obj_valid(key, 8) || !env.store.obj_valid(value, 8) {
                return Some("invalid_entry");
            }
            if let Some(reason) = header_invalid_reason(env, key) {
                return Some(reason);
            }
            if let Some(reason) = header_invalid_reason(env, value) {
                return Some(reason);
            }
        }
        None
    }

    pub fn direct_referents(&self, env: &Environment) -> Result<HashSet<MappedAddr>> {
        let mut ret = HashSet::from([self.ma_keys, self.ma_values]);
        for (key, value) in self.items(env)? {
            ret.insert(key.cast());
            ret.insert(value.cast());
        }
        Ok(ret)
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<dict !{reason}>");
        }
        let items = match self.items(t.env) {
            Ok(items) => items,
            Err(_) => return "<dict !invalid_ma_keys_entries>".to_string(),
        };
        t.guarded(addr, "dict", |t| {
            if !t.recursion_allowed() {
                return format!("<dict !recursion_depth len={}>", self.ma_used);
            }
            t.indented(|t| {
                let mut entries = Vec::new();
                let mut has_extra = false;
                for (key, value) in &items {
                    if t.entries_capped(entries.len()) {
                        has_extra = true;
                        break;
                    }
                    let key_repr = t.repr(*key);
                    let value_repr = t.repr(*value);
                    entries.push((key_repr, value_repr));
                }
                match (entries.len(), has_extra) {
                    (0, false) => "{}".to_string(),
                    (1, false) => format!("{{{}: {}}}", entries[0].0, entries[0].1),
                    _ => {
                        entries.sort_unstable();
                        let joined: Vec<String> = entries
                            .into_iter()
                            .map(|(k, v)| format!("{k}: {v}"))
                            .collect();
                        t.multiline("{", "}", &joined, has_extra)
                    }
                }
            })
        })
    }
}
