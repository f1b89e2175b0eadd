//! Option-driven repr walker with cycle detection and depth limits.
//!
//! A `Traversal` is a per-query context: it carries the formatting options,
//! the current recursion depth, and the set of container addresses whose
//! reprs are currently open (the cycle guard). Every composite repr enters
//! the guard for its own address and short-circuits to `!recursive_repr`
//! when it is already present.

use std::collections::HashSet;

use crate::addr::MappedAddr;
use crate::args::Args;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{
    Kind, ObjHeader, PyBytesObject, PyCodeObject, PyDictObject, PyFrame, PyFrameObject,
    PyFutureObject, PyGatheringFutureObject, PyGenObject, PyIntObject, PyListObject,
    PyModuleObject, PyObj, PySetObject, PyStrObject, PyTaskObject, PyTupleObject, PyTypeObject,
};

/// The repr formatting options shared by every repr-producing command.
#[derive(Debug, Clone)]
pub struct ReprOptions {
    pub max_recursion_depth: i64,
    pub max_entries: i64,
    pub max_string_bytes: i64,
    pub bytes_as_hex: bool,
    pub is_short: bool,
    pub frame_omit_back: bool,
    pub show_all_addresses: bool,
}

impl Default for ReprOptions {
    fn default() -> ReprOptions {
        ReprOptions {
            max_recursion_depth: 16,
            max_entries: -1,
            max_string_bytes: 1024,
            bytes_as_hex: false,
            is_short: false,
            frame_omit_back: false,
            show_all_addresses: false,
        }
    }
}

impl ReprOptions {
    pub fn from_args(args: &Args) -> Result<ReprOptions> {
        let defaults = ReprOptions::default();
        Ok(ReprOptions {
            max_recursion_depth: args
                .get_i64("max-recursion-depth", defaults.max_recursion_depth)?,
            max_entries: args.get_i64("max-entries", defaults.max_entries)?,
            max_string_bytes: args.get_i64("max-string-length", defaults.max_string_bytes)?,
            bytes_as_hex: args.get_flag("bytes-as-hex"),
            is_short: args.get_flag("short"),
            frame_omit_back: args.get_flag("frame-omit-back"),
            show_all_addresses: args.get_flag("show-all-addresses"),
        })
    }
}

pub struct Traversal<'e> {
    pub env: &'e Environment,
    pub recursion_depth: i64,
    pub max_recursion_depth: i64,
    pub max_entries: i64,
    pub max_string_bytes: i64,
    pub bytes_as_hex: bool,
    pub is_short: bool,
    pub frame_omit_back: bool,
    pub show_all_addresses: bool,
    /// Cleared when any repr in this traversal hit an invalid object.
    pub is_valid: bool,
    open: HashSet<u64>,
}

impl<'e> Traversal<'e> {
    pub fn new(env: &'e Environment) -> Traversal<'e> {
        Traversal::with_options(env, &ReprOptions::default())
    }

    pub fn with_options(env: &'e Environment, opts: &ReprOptions) -> Traversal<'e> {
        Traversal {
            env,
            recursion_depth: 0,
            max_recursion_depth: opts.max_recursion_depth,
            max_entries: opts.max_entries,
            max_string_bytes: opts.max_string_bytes,
            bytes_as_hex: opts.bytes_as_hex,
            is_short: opts.is_short,
            frame_omit_back: opts.frame_omit_back,
            show_all_addresses: opts.show_all_addresses,
            is_valid: true,
            open: HashSet::new(),
        }
    }

    /// A traversal configured straight from command arguments.
    pub fn from_args(env: &'e Environment, args: &Args) -> Result<Traversal<'e>> {
        Ok(Traversal::with_options(env, &ReprOptions::from_args(args)?))
    }

    /// Render the object at `addr`, dispatching on its type pointer.
    pub fn repr<T: ?Sized>(&mut self, addr: MappedAddr<T>) -> String {
        if addr.is_null() {
            return "<null>".to_string();
        }
        let header = match ObjHeader::read(self.env, addr) {
            Ok(header) => header,
            Err(_) => {
                self.is_valid = false;
                return format!("<? !invalid_address>@{}", addr.cast::<()>());
            }
        };
        match self.env.kind_for_type(header.ob_type) {
            None => format!("<? @{}>", addr.cast::<()>()),
            Some(kind) => self.kind_repr(kind, addr.cast()),
        }
    }

    fn kind_repr(&mut self, kind: Kind, addr: MappedAddr<PyObj>) -> String {
        macro_rules! decode {
            ($ty:ty) => {
                match <$ty>::read(self.env, addr.cast()) {
                    Ok(obj) => obj,
                    Err(_) => {
                        self.is_valid = false;
                        return format!("<{} !invalid_header>", kind.display_name());
                    }
                }
            };
        }
        match kind {
            Kind::Type => decode!(PyTypeObject).repr(self, addr.cast()),
            Kind::Dict => decode!(PyDictObject).repr(self, addr),
            Kind::Set => decode!(PySetObject).repr(self, addr, false),
            Kind::FrozenSet => decode!(PySetObject).repr(self, addr, true),
            Kind::Tuple => decode!(PyTupleObject).repr(self, addr),
            Kind::List => decode!(PyListObject).repr(self, addr),
            Kind::Str => decode!(PyStrObject).repr(self, addr),
            Kind::Bytes => decode!(PyBytesObject).repr(self, addr),
            Kind::Int => decode!(PyIntObject).repr(self, addr, false),
            Kind::Bool => decode!(PyIntObject).repr(self, addr, true),
            Kind::NoneType => self.scalar_repr("None".to_string(), addr),
            Kind::Code => decode!(PyCodeObject).repr(self, addr),
            Kind::Frame => {
                let frame_addr: MappedAddr<PyFrame> = addr.cast();
                match PyFrameObject::read(self.env, frame_addr) {
                    Ok(frame) => frame.repr(self, frame_addr),
                    Err(_) => {
                        self.is_valid = false;
                        "<frame !invalid_header>".to_string()
                    }
                }
            }
            Kind::Module => decode!(PyModuleObject).repr(self, addr),
            Kind::Task => decode!(PyTaskObject).repr(self, addr),
            Kind::Future => decode!(PyFutureObject).repr(self, addr),
            Kind::GatheringFuture => decode!(PyGatheringFutureObject).repr(self, addr),
            Kind::Generator | Kind::Coroutine | Kind::AsyncGen => {
                decode!(PyGenObject).repr(self, addr, kind)
            }
        }
    }

    /// Record a validity-check result; any failure poisons the traversal.
    pub fn check_valid(&mut self, reason: Option<&'static str>) -> Option<&'static str> {
        if reason.is_some() {
            self.is_valid = false;
        }
        reason
    }

    pub fn recursion_allowed(&self) -> bool {
        self.recursion_depth <= self.max_recursion_depth
    }

    /// Run `f` one level deeper.
    pub fn indented<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.recursion_depth += 1;
        let ret = f(self);
        self.recursion_depth -= 1;
        ret
    }

    /// Scoped cycle guard: renders `<name !recursive_repr>` when the
    /// address is already open, and always releases on exit.
    pub fn guarded<T: ?Sized>(
        &mut self,
        addr: MappedAddr<T>,
        name: &str,
        f: impl FnOnce(&mut Self) -> String,
    ) -> String {
        if !self.open.insert(addr.raw()) {
            return format!("<{name} !recursive_repr>");
        }
        let ret = f(self);
        self.open.remove(&addr.raw());
        ret
    }

    /// True once `len` entries have been rendered and the cap is active.
    pub fn entries_capped(&self, len: usize) -> bool {
        self.max_entries >= 0 && len >= self.max_entries as usize
    }

    /// Repr each item up to the entry cap; the flag reports truncation.
    pub fn capped_reprs(&mut self, items: &[MappedAddr<PyObj>]) -> (Vec<String>, bool) {
        let mut entries = Vec::new();
        for item in items {
            if self.entries_capped(entries.len()) {
                return (entries, true);
            }
            entries.push(self.repr(*item));
        }
        (entries, false)
    }

    /// One-entry-per-line rendering with depth-scaled indentation and an
    /// optional `...` truncation row.
    pub fn multiline(&self, open: &str, close: &str, entries: &[String], has_extra: bool) -> String {
        let pad = " ".repeat(self.recursion_depth.max(0) as usize * 2);
        let close_pad = " ".repeat((self.recursion_depth - 1).max(0) as usize * 2);
        let mut ret = String::from(open);
        ret.push('\n');
        for entry in entries {
            ret.push_str(&pad);
            ret.push_str(entry);
            ret.push_str(",\n");
        }
        if has_extra {
            ret.push_str(&pad);
            ret.push_str("...\n");
        }
        ret.push_str(&close_pad);
        ret.push_str(close);
        ret
    }

    /// Scalar reprs normally render bare; `--show-all-addresses` appends
    /// the object address.
    pub fn scalar_repr<T: ?Sized>(&self, body: String, addr: MappedAddr<T>) -> String {
        if self.show_all_addresses {
            format!("{body}@{}", addr.cast::<()>())
        } else {
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SnapshotBuilder;

    #[test]
    fn test_scalar_reprs() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        let n = b.int_obj(0x2000, ty.int, -42);
        let s = b.str_ascii(0x2040, ty.str_, "hi");
        let (_dir, env) = b.build_env();

        let mut t = Traversal::new(&env);
        assert_eq!(t.repr(n), "-42");
        assert_eq!(t.repr(s), "'hi'");
        assert!(t.is_valid);

        let mut t = Traversal::new(&env);
        t.show_all_addresses = true;
        assert_eq!(t.repr(n), "-42@0000000000002000");
    }

    #[test]
    fn test_null_and_unknown() {
        let mut b = SnapshotBuilder::new();
        b.std_types();
        // An object whose type pointer is valid memory but not a catalog type.
        b.header(0x2100, MappedAddr::new(0x2000));
        let (_dir, env) = b.build_env();

        let mut t = Traversal::new(&env);
        assert_eq!(t.repr(MappedAddr::<PyObj>::NULL), "<null>");
        assert_eq!(t.repr(MappedAddr::<PyObj>::new(0x2100)), "<? @0000000000002100>");
    }

    #[test]
    fn test_cycle_guard_terminates() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        // A list whose single element is the list itself.
        let lst = b.list_obj(0x2000, ty.list, 0x2100, &[MappedAddr::new(0x2000)]);
        let (_dir, env) = b.build_env();

        let mut t = Traversal::new(&env);
        let repr = t.repr(lst);
        assert_eq!(repr, "[<list !recursive_repr>]");
    }

    #[test]
    fn test_mutual_cycle_terminates() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        let a = b.list_obj(0x2000, ty.list, 0x2100, &[MappedAddr::new(0x2200)]);
        b.list_obj(0x2200, ty.list, 0x2300, &[MappedAddr::new(0x2000)]);
        let (_dir, env) = b.build_env();

        let mut t = Traversal::new(&env);
        let repr = t.repr(a);
        assert!(repr.contains("!recursive_repr"));
    }

    #[test]
    fn test_depth_limit() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        // inner is a list of one int; outer wraps it.
        let n = b.int_obj(0x2000, ty.int, 1);
        let inner = b.list_obj(0x2100, ty.list, 0x2180, &[n]);
        let outer = b.list_obj(0x2200, ty.list, 0x2280, &[inner]);
        let (_dir, env) = b.build_env();

        let mut t = Traversal::new(&env);
        t.max_recursion_depth = 0;
        assert_eq!(t.repr(outer), "[<list !recursion_depth>]");

        // Scalars still render past the limit.
        let mut t = Traversal::new(&env);
        t.max_recursion_depth = 1;
        assert_eq!(t.repr(outer), "[[1]]");
    }

    #[test]
    fn test_max_entries_marker() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        let n1 = b.int_obj(0x2000, ty.int, 1);
        let n2 = b.int_obj(0x2040, ty.int, 2);
        let n3 = b.int_obj(0x2080, ty.int, 3);
        let lst = b.list_obj(0x2100, ty.list, 0x2180, &[n1, n2, n3]);
        let (_dir, env) = b.build_env();

        let mut t = Traversal::new(&env);
        t.max_entries = 2;
        let repr = t.repr(lst);
        assert_eq!(repr, "[\n  1,\n  2,\n  ...\n]");
    }

    #[test]
    fn test_dict_repr_sorted_by_key() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        let kb = b.str_ascii(0x2000, ty.str_, "b");
        let ka = b.str_ascii(0x2080, ty.str_, "a");
        let v1 = b.int_obj(0x2100, ty.int, 1);
        let v2 = b.int_obj(0x2140, ty.int, 2);
        let dict = b.dict_obj(0x2200, ty.dict, 0x2300, 8, &[(9, kb, v1), (3, ka, v2)], None);
        let (_dir, env) = b.build_env();

        let mut t = Traversal::new(&env);
        assert_eq!(t.repr(dict), "{\n  'a': 2,\n  'b': 1,\n}");
    }

    #[test]
    fn test_invalid_object_poisons_traversal() {
        let mut b = SnapshotBuilder::new();
        let ty = b.std_types();
        b.header(0x2000, ty.dict);
        b.w64(0x2000 + 32, 0xDEAD_0000); // ma_keys unmapped
        let (_dir, env) = b.build_env();

        let mut t = Traversal::new(&env);
        let repr = t.repr(MappedAddr::<PyObj>::new(0x2000));
        assert_eq!(repr, "<dict !invalid_ma_keys>");
        assert!(!t.is_valid);
    }
}
