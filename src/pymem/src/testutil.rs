//! Test support: build synthetic snapshots with hand-assembled objects.
//!
//! The builder accumulates regions in memory, writes them out as a
//! directory-form snapshot in a `TempDir`, and opens an `Environment` over
//! it with the requested type catalog pre-registered.

use std::collections::BTreeMap;

use tempfile::TempDir;

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::objects::{PyFrame, PyThread, PyType};

/// Addresses of the pre-built standard type objects.
#[derive(Clone, Copy)]
pub struct StdTypes {
    pub type_: MappedAddr<PyType>,
    pub dict: MappedAddr<PyType>,
    pub set: MappedAddr<PyType>,
    pub frozenset: MappedAddr<PyType>,
    pub tuple: MappedAddr<PyType>,
    pub list: MappedAddr<PyType>,
    pub str_: MappedAddr<PyType>,
    pub bytes: MappedAddr<PyType>,
    pub int: MappedAddr<PyType>,
    pub bool_: MappedAddr<PyType>,
    pub none: MappedAddr<PyType>,
    pub code: MappedAddr<PyType>,
    pub frame: MappedAddr<PyType>,
    pub module: MappedAddr<PyType>,
    pub task: MappedAddr<PyType>,
    pub future: MappedAddr<PyType>,
    pub gathering: MappedAddr<PyType>,
    pub generator: MappedAddr<PyType>,
}

pub struct SnapshotBuilder {
    regions: BTreeMap<u64, Vec<u8>>,
    types: Vec<(String, u64)>,
    base_type: Option<u64>,
}

const HEAP_START: u64 = 0x1000;
const HEAP_SIZE: usize = 0x20000;
const TYPE_REGION_START: u64 = 0x10_0000;

impl SnapshotBuilder {
    /// A builder with one default heap region at `0x1000`.
    pub fn new() -> SnapshotBuilder {
        let mut b = SnapshotBuilder {
            regions: BTreeMap::new(),
            types: Vec::new(),
            base_type: None,
        };
        b.add_region(HEAP_START, HEAP_SIZE);
        b
    }

    pub fn add_region(&mut self, start: u64, size: usize) {
        self.regions.insert(start, vec![0u8; size]);
    }

    /// Register a type name for the catalog built by `build_env`.
    pub fn register_type(&mut self, name: &str, addr: MappedAddr<PyType>) {
        self.types.push((name.to_string(), addr.raw()));
    }

    pub fn set_base_type(&mut self, addr: MappedAddr<PyType>) {
        self.base_type = Some(addr.raw());
    }

    // ---- raw writes ----

    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        let (&start, region) = self
            .regions
            .range_mut(..=addr)
            .next_back()
            .expect("write outside any region");
        let offset = (addr - start) as usize;
        assert!(
            offset + bytes.len() <= region.len(),
            "write past end of region at {addr:#x}"
        );
        region[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn w64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn wi64(&mut self, addr: u64, value: i64) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn w32(&mut self, addr: u64, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn wi32(&mut self, addr: u64, value: i32) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn w8(&mut self, addr: u64, value: u8) {
        self.write(addr, &[value]);
    }

    pub fn wi8(&mut self, addr: u64, value: i8) {
        self.write(addr, &[value as u8]);
    }

    pub fn put_bytes_at(&mut self, addr: u64, bytes: &[u8]) -> MappedAddr {
        self.write(addr, bytes);
        MappedAddr::new(addr)
    }

    pub fn put_cstr(&mut self, addr: u64, s: &str) -> MappedAddr {
        self.write(addr, s.as_bytes());
        self.w8(addr + s.len() as u64, 0);
        MappedAddr::new(addr)
    }

    // ---- object headers ----

    pub fn header(&mut self, addr: u64, ob_type: MappedAddr<PyType>) {
        self.w64(addr, 1); // ob_refcnt
        self.w64(addr + 8, ob_type.raw());
    }

    pub fn var_header(&mut self, addr: u64, ob_type: MappedAddr<PyType>, ob_size: i64) {
        self.header(addr, ob_type);
        self.wi64(addr + 16, ob_size);
    }

    // ---- object emitters ----

    /// A type object at `addr` whose `ob_type` is `ob_type_raw` and whose
    /// name field points at `tp_name`.
    pub fn type_object(
        &mut self,
        addr: u64,
        ob_type_raw: u64,
        tp_name: MappedAddr,
    ) -> MappedAddr<PyType> {
        self.var_header(addr, MappedAddr::new(ob_type_raw), 0);
        self.w64(addr + 24, tp_name.raw());
        self.wi64(addr + 32, 0x10); // tp_basicsize
        self.wi64(addr + 40, 0); // tp_itemsize
        MappedAddr::new(addr)
    }

    /// Build the standard type objects in their own region and register
    /// them all; `type` is self-typed and becomes the base type.
    pub fn std_types(&mut self) -> StdTypes {
        self.add_region(TYPE_REGION_START, 0x4000);
        let names = [
            "type",
            "dict",
            "set",
            "frozenset",
            "tuple",
            "list",
            "str",
            "bytes",
            "int",
            "bool",
            "NoneType",
            "code",
            "frame",
            "module",
            "_asyncio.Task",
            "_asyncio.Future",
            "_GatheringFuture",
            "generator",
        ];
        let base = TYPE_REGION_START;
        let mut addrs = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let slot = base + i as u64 * 0x100;
            let name_addr = self.put_cstr(slot + 0x40, name);
            self.type_object(slot, base, name_addr);
            self.register_type(name, MappedAddr::new(slot));
            addrs.push(MappedAddr::new(slot));
        }
        self.set_base_type(addrs[0]);
        StdTypes {
            type_: addrs[0],
            dict: addrs[1],
            set: addrs[2],
            frozenset: addrs[3],
            tuple: addrs[4],
            list: addrs[5],
            str_: addrs[6],
            bytes: addrs[7],
            int: addrs[8],
            bool_: addrs[9],
            none: addrs[10],
            code: addrs[11],
            frame: addrs[12],
            module: addrs[13],
            task: addrs[14],
            future: addrs[15],
            gathering: addrs[16],
            generator: addrs[17],
        }
    }

    /// Compact-ASCII str object.
    pub fn str_ascii(&mut self, addr: u64, ty: MappedAddr<PyType>, text: &str) -> MappedAddr {
        assert!(text.is_ascii());
        self.header(addr, ty);
        self.wi64(addr + 16, text.len() as i64); // length
        self.w64(addr + 24, 0); // hash
        self.w32(addr + 32, 0xE4); // ready | ascii | compact | kind=1
        self.write(addr + 48, text.as_bytes());
        MappedAddr::new(addr)
    }

    /// Compact UCS-2 str object.
    pub fn str_ucs2(&mut self, addr: u64, ty: MappedAddr<PyType>, chars: &[u16]) -> MappedAddr {
        self.header(addr, ty);
        self.wi64(addr + 16, chars.len() as i64);
        self.w64(addr + 24, 0);
        self.w32(addr + 32, 0xA8); // ready | compact | kind=2
        for (i, &c) in chars.iter().enumerate() {
            self.write(addr + 72 + i as u64 * 2, &c.to_le_bytes());
        }
        MappedAddr::new(addr)
    }

    pub fn bytes_obj(&mut self, addr: u64, ty: MappedAddr<PyType>, data: &[u8]) -> MappedAddr {
        self.var_header(addr, ty, data.len() as i64);
        self.w64(addr + 24, 0); // ob_shash
        self.write(addr + 32, data);
        MappedAddr::new(addr)
    }

    pub fn int_obj(&mut self, addr: u64, ty: MappedAddr<PyType>, value: i64) -> MappedAddr {
        let magnitude = value.unsigned_abs();
        let mut digits = Vec::new();
        let mut rest = magnitude;
        while rest > 0 {
            digits.push((rest & 0x3FFF_FFFF) as u32);
            rest >>= 30;
        }
        let ndigits = digits.len() as i64;
        self.var_header(addr, ty, if value < 0 { -ndigits } else { ndigits });
        for (i, digit) in digits.iter().enumerate() {
            self.w32(addr + 24 + i as u64 * 4, *digit);
        }
        MappedAddr::new(addr)
    }

    pub fn tuple_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        items: &[MappedAddr],
    ) -> MappedAddr {
        self.var_header(addr, ty, items.len() as i64);
        for (i, item) in items.iter().enumerate() {
            self.w64(addr + 24 + i as u64 * 8, item.raw());
        }
        MappedAddr::new(addr)
    }

    pub fn list_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        item_store: u64,
        items: &[MappedAddr],
    ) -> MappedAddr {
        self.var_header(addr, ty, items.len() as i64);
        self.w64(addr + 24, item_store); // ob_item
        self.wi64(addr + 32, items.len() as i64); // allocated
        for (i, item) in items.iter().enumerate() {
            self.w64(item_store + i as u64 * 8, item.raw());
        }
        MappedAddr::new(addr)
    }

    /// Set object; `entries` is the full open-addressing table of
    /// (key, hash) slots, so its length must be a power of two.
    pub fn set_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        table: u64,
        entries: &[(u64, u64)],
    ) -> MappedAddr {
        let fill = entries.iter().filter(|(key, _)| *key != 0).count() as i64;
        self.header(addr, ty);
        self.wi64(addr + 16, fill); // fill
        self.wi64(addr + 24, fill); // used
        self.wi64(addr + 32, entries.len() as i64 - 1); // mask
        self.w64(addr + 40, table);
        for (i, (key, hash)) in entries.iter().enumerate() {
            self.w64(table + i as u64 * 16, *key);
            self.w64(table + i as u64 * 16 + 8, *hash);
        }
        MappedAddr::new(addr)
    }

    /// Dict object with a keys object at `keys_addr`. Entry `i` occupies
    /// index-table slot `i`; remaining slots read empty. When `values` is
    /// set the dict is split and entry values live in that vector instead.
    pub fn dict_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        keys_addr: u64,
        dk_size: i64,
        entries: &[(u64, MappedAddr, MappedAddr)],
        values: Option<u64>,
    ) -> MappedAddr {
        assert!(entries.len() as i64 <= dk_size);
        self.header(addr, ty);
        self.wi64(addr + 16, entries.len() as i64); // ma_used
        self.w64(addr + 24, 0); // ma_version_tag
        self.w64(addr + 32, keys_addr);
        self.w64(addr + 40, values.unwrap_or(0));

        let nentries = entries.len() as i64;
        self.w64(keys_addr, 1); // dk_refcnt
        self.wi64(keys_addr + 8, dk_size);
        self.w64(keys_addr + 16, 0); // dk_lookup
        self.wi64(keys_addr + 24, dk_size - nentries); // dk_usable
        self.wi64(keys_addr + 32, nentries);

        let width = if dk_size <= 0xFF {
            1
        } else if dk_size <= 0xFFFF {
            2
        } else if dk_size <= 0xFFFF_FFFF {
            4
        } else {
            8
        };
        let table = keys_addr + 40;
        for slot in 0..dk_size {
            let value: i64 = if slot < nentries { slot } else { -1 };
            match width {
                1 => self.wi8(table + slot as u64, value as i8),
                2 => self.write(table + slot as u64 * 2, &(value as i16).to_le_bytes()),
                4 => self.wi32(table + slot as u64 * 4, value as i32),
                _ => self.wi64(table + slot as u64 * 8, value),
            }
        }
        let entries_addr = table + dk_size as u64 * width as u64;
        for (i, (hash, key, value)) in entries.iter().enumerate() {
            let e = entries_addr + i as u64 * 24;
            self.w64(e, *hash);
            self.w64(e + 8, key.raw());
            self.w64(e + 16, value.raw());
        }
        if let Some(values_addr) = values {
            for (i, (_, _, value)) in entries.iter().enumerate() {
                self.w64(values_addr + i as u64 * 8, value.raw());
            }
        }
        MappedAddr::new(addr)
    }

    pub fn code_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        firstlineno: i32,
        varnames: MappedAddr,
        filename: MappedAddr,
        name: MappedAddr,
        linetable: MappedAddr,
    ) -> MappedAddr {
        self.header(addr, ty);
        self.wi32(addr + 40, firstlineno);
        self.w64(addr + 48, 0); // co_code
        self.w64(addr + 72, varnames.raw());
        self.w64(addr + 96, filename.raw());
        self.w64(addr + 104, name.raw());
        self.w64(addr + 112, linetable.raw());
        MappedAddr::new(addr)
    }

    pub fn frame_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        back: MappedAddr<PyFrame>,
        code: MappedAddr,
        state: i8,
        lasti: i32,
        localsplus: &[MappedAddr],
    ) -> MappedAddr<PyFrame> {
        self.var_header(addr, ty, 0);
        self.w64(addr + 24, back.raw());
        self.w64(addr + 32, code.raw());
        // f_builtins / f_globals / f_locals / f_valuestack / f_trace / f_gen
        // stay null.
        self.wi32(addr + 96, lasti);
        self.wi32(addr + 100, 0); // f_lineno
        self.wi8(addr + 108, state);
        for (i, v) in localsplus.iter().enumerate() {
            self.w64(addr + 352 + i as u64 * 8, v.raw());
        }
        MappedAddr::new(addr)
    }

    pub fn module_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        md_dict: MappedAddr,
    ) -> MappedAddr {
        self.header(addr, ty);
        self.w64(addr + 16, md_dict.raw());
        MappedAddr::new(addr)
    }

    pub fn future_obj(&mut self, addr: u64, ty: MappedAddr<PyType>, state: u8) -> MappedAddr {
        self.header(addr, ty);
        self.w8(addr + 80, state);
        MappedAddr::new(addr)
    }

    pub fn task_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        state: u8,
        fut_waiter: MappedAddr,
    ) -> MappedAddr {
        self.future_obj(addr, ty, state);
        self.w64(addr + 88, fut_waiter.raw());
        MappedAddr::new(addr)
    }

    pub fn gathering_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        state: u8,
        children: MappedAddr,
    ) -> MappedAddr {
        self.future_obj(addr, ty, state);
        self.w64(addr + 88, children.raw());
        MappedAddr::new(addr)
    }

    pub fn gen_obj(
        &mut self,
        addr: u64,
        ty: MappedAddr<PyType>,
        frame: MappedAddr<PyFrame>,
        code: MappedAddr,
        name: MappedAddr,
    ) -> MappedAddr {
        self.header(addr, ty);
        self.w64(addr + 16, frame.raw());
        self.w64(addr + 32, code.raw());
        self.w64(addr + 40, name.raw());
        self.w64(addr + 48, name.raw()); // qualname
        MappedAddr::new(addr)
    }

    pub fn thread_state(
        &mut self,
        addr: u64,
        prev: u64,
        next: u64,
        interp: u64,
        frame: MappedAddr<PyFrame>,
    ) -> MappedAddr<PyThread> {
        self.w64(addr, prev);
        self.w64(addr + 8, next);
        self.w64(addr + 16, interp);
        self.w64(addr + 24, frame.raw());
        MappedAddr::new(addr)
    }

    // ---- building ----

    /// Write the regions as a directory-form snapshot and open an
    /// environment over it with the registered catalog.
    pub fn build_env(self) -> (TempDir, Environment) {
        let dir = TempDir::new().unwrap();
        for (start, bytes) in &self.regions {
            let name = format!("mem.{:016x}.{:016x}.bin", start, start + bytes.len() as u64);
            std::fs::write(dir.path().join(name), bytes).unwrap();
        }
        let mut env = Environment::open(dir.path()).unwrap();
        if let Some(base) = self.base_type {
            env.base_type = MappedAddr::new(base);
        }
        for (name, addr) in &self.types {
            env.insert_type(name, MappedAddr::new(*addr));
        }
        (dir, env)
    }
}
