//! Decoders for the runtime's object representations.
//!
//! Every decoder interprets raw snapshot bytes at a mapped address as one
//! object kind and offers the same contract:
//! - `invalid_reason` - first stable reason the bytes fail to be a plausible
//!   object of that kind, or ok; never panics on arbitrary bytes
//! - `direct_referents` - every mapped address the object points at
//! - `repr` - renders the object through a [`Traversal`](crate::Traversal)
//!
//! Object kinds are distinguished by the `ob_type` pointer in the 16-byte
//! object header, resolved against the catalog. Unknown type pointers fall
//! back to an opaque decoder that renders `<? @addr>`.
//!
//! The layouts target the CPython 3.10 64-bit ABI.

pub mod asyncio;
pub mod code;
pub mod containers;
pub mod dict;
pub mod frame;
pub mod gen;
pub mod module;
pub mod num;
pub mod set;
pub mod strings;
pub mod thread;
pub mod typeobj;

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::{Layout, MappedAddr};
use crate::catalog::Environment;
use crate::error::{Error, Result};

pub use asyncio::{PyFutureObject, PyGatheringFutureObject, PyTaskObject};
pub use code::PyCodeObject;
pub use containers::{PyListObject, PyTupleObject};
pub use dict::{PyDictKeys, PyDictObject};
pub use frame::{FrameState, PyFrameObject};
pub use gen::PyGenObject;
pub use module::PyModuleObject;
pub use num::PyIntObject;
pub use set::PySetObject;
pub use strings::{PyBytesObject, PyStrObject};
pub use thread::PyThreadState;
pub use typeobj::PyTypeObject;

/// Address tag: any object with the common 16-byte header.
pub enum PyObj {}
impl Layout for PyObj {
    const SIZE: u64 = ObjHeader::SIZE;
}

/// Address tag: a type object. The scanner window covers the fields the
/// type decoder reads.
pub enum PyType {}
impl Layout for PyType {
    const SIZE: u64 = PyTypeObject::SIZE;
}

/// Address tag: a frame object (fixed part; locals trail it).
pub enum PyFrame {}
impl Layout for PyFrame {
    const SIZE: u64 = PyFrameObject::SIZE;
}

/// Address tag: an interpreter thread state (not a PyObject).
pub enum PyThread {}
impl Layout for PyThread {
    const SIZE: u64 = PyThreadState::SIZE;
}

/// The object kinds this analyzer decodes, keyed by catalog type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Type,
    Dict,
    Set,
    FrozenSet,
    Tuple,
    List,
    Str,
    Bytes,
    Int,
    Bool,
    NoneType,
    Code,
    Frame,
    Module,
    Task,
    Future,
    GatheringFuture,
    Generator,
    Coroutine,
    AsyncGen,
}

impl Kind {
    pub fn from_name(name: &str) -> Option<Kind> {
        Some(match name {
            "type" => Kind::Type,
            "dict" => Kind::Dict,
            "set" => Kind::Set,
            "frozenset" => Kind::FrozenSet,
            "tuple" => Kind::Tuple,
            "list" => Kind::List,
            "str" => Kind::Str,
            "bytes" => Kind::Bytes,
            "int" => Kind::Int,
            "bool" => Kind::Bool,
            "NoneType" => Kind::NoneType,
            "code" => Kind::Code,
            "frame" => Kind::Frame,
            "module" => Kind::Module,
            "_asyncio.Task" => Kind::Task,
            "_asyncio.Future" => Kind::Future,
            "_GatheringFuture" => Kind::GatheringFuture,
            "generator" => Kind::Generator,
            "coroutine" => Kind::Coroutine,
            "async_generator" => Kind::AsyncGen,
            _ => return None,
        })
    }

    /// Name used in `<NAME ...>` repr lines.
    pub fn display_name(self) -> &'static str {
        match self {
            Kind::Type => "type",
            Kind::Dict => "dict",
            Kind::Set => "set",
            Kind::FrozenSet => "frozenset",
            Kind::Tuple => "tuple",
            Kind::List => "list",
            Kind::Str => "str",
            Kind::Bytes => "bytes",
            Kind::Int => "int",
            Kind::Bool => "bool",
            Kind::NoneType => "NoneType",
            Kind::Code => "code",
            Kind::Frame => "frame",
            Kind::Module => "module",
            Kind::Task => "_asyncio.Task",
            Kind::Future => "_asyncio.Future",
            Kind::GatheringFuture => "_GatheringFuture",
            Kind::Generator => "generator",
            Kind::Coroutine => "coroutine",
            Kind::AsyncGen => "async_generator",
        }
    }
}

/// The common object header: reference count and type pointer.
#[derive(Debug, Clone, Copy)]
pub struct ObjHeader {
    pub ob_refcnt: u64,
    pub ob_type: MappedAddr<PyType>,
}

impl ObjHeader {
    pub const SIZE: u64 = 16;

    pub fn parse(bytes: &[u8]) -> ObjHeader {
        ObjHeader {
            ob_refcnt: LE::read_u64(&bytes[0..8]),
            ob_type: MappedAddr::new(LE::read_u64(&bytes[8..16])),
        }
    }

    pub fn read<T: ?Sized>(env: &Environment, addr: MappedAddr<T>) -> Result<ObjHeader> {
        Ok(Self::parse(env.store.read(addr, Self::SIZE)?))
    }
}

/// Header of variable-size objects: adds the element count.
#[derive(Debug, Clone, Copy)]
pub struct VarHeader {
    pub ob_refcnt: u64,
    pub ob_type: MappedAddr<PyType>,
    pub ob_size: i64,
}

impl VarHeader {
    pub const SIZE: u64 = 24;

    pub fn parse(bytes: &[u8]) -> VarHeader {
        VarHeader {
            ob_refcnt: LE::read_u64(&bytes[0..8]),
            ob_type: MappedAddr::new(LE::read_u64(&bytes[8..16])),
            ob_size: LE::read_i64(&bytes[16..24]),
        }
    }

    pub fn read<T: ?Sized>(env: &Environment, addr: MappedAddr<T>) -> Result<VarHeader> {
        Ok(Self::parse(env.store.read(addr, Self::SIZE)?))
    }
}

/// Shallow plausibility check of the header alone: the address and its
/// `ob_type` pointer must both land in mapped, aligned memory. Container
/// decoders apply this to their elements instead of recursing, which keeps
/// validity checking linear even on cyclic graphs.
pub fn header_invalid_reason<T: ?Sized>(
    env: &Environment,
    addr: MappedAddr<T>,
) -> Option<&'static str> {
    if !env.store.obj_valid(addr, 8) {
        return Some("invalid_address");
    }
    let header = match ObjHeader::read(env, addr) {
        Ok(h) => h,
        Err(_) => return Some("invalid_header"),
    };
    if !env.store.obj_valid(header.ob_type, 8) {
        return Some("invalid_ob_type");
    }
    None
}

impl Environment {
    /// Full validity check, dispatched on the candidate's `ob_type`.
    /// Unknown types get the shallow header check only.
    pub fn invalid_reason<T: ?Sized>(&self, addr: MappedAddr<T>) -> Option<&'static str> {
        if let Some(reason) = header_invalid_reason(self, addr) {
            return Some(reason);
        }
        let header = match ObjHeader::read(self, addr) {
            Ok(h) => h,
            Err(_) => return Some("invalid_header"),
        };
        match self.kind_for_type(header.ob_type) {
            None => None,
            Some(kind) => self.kind_invalid_reason(kind, addr.cast()),
        }
    }

    /// Like `invalid_reason`, but first requires `ob_type` to equal
    /// `expected`.
    pub fn invalid_reason_expected<T: ?Sized>(
        &self,
        addr: MappedAddr<T>,
        expected: MappedAddr<PyType>,
    ) -> Option<&'static str> {
        if let Some(reason) = header_invalid_reason(self, addr) {
            return Some(reason);
        }
        match ObjHeader::read(self, addr) {
            Ok(h) if h.ob_type == expected => self.invalid_reason(addr),
            Ok(_) => Some("unexpected_ob_type"),
            Err(_) => Some("invalid_header"),
        }
    }

    fn kind_invalid_reason(&self, kind: Kind, addr: MappedAddr<PyObj>) -> Option<&'static str> {
        match kind {
            Kind::Type => check(PyTypeObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self)
            }),
            Kind::Dict => check(PyDictObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self)
            }),
            Kind::Set | Kind::FrozenSet => check(PySetObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self)
            }),
            Kind::Tuple => check(PyTupleObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self, addr.cast())
            }),
            Kind::List => check(PyListObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self)
            }),
            Kind::Str => check(PyStrObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self, addr.cast())
            }),
            Kind::Bytes => check(PyBytesObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self, addr.cast())
            }),
            Kind::Int | Kind::Bool => check(PyIntObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self, addr.cast())
            }),
            Kind::NoneType => None,
            Kind::Code => check(PyCodeObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self)
            }),
            Kind::Frame => check(PyFrameObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self, addr.cast())
            }),
            Kind::Module => check(PyModuleObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self)
            }),
            Kind::Future => check(PyFutureObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self)
            }),
            Kind::Task => check(PyTaskObject::read(self, addr.cast()), |o| {
                o.invalid_reason(self)
            }),
            Kind::GatheringFuture => {
                check(PyGatheringFutureObject::read(self, addr.cast()), |o| {
                    o.invalid_reason(self)
                })
            }
            Kind::Generator | Kind::Coroutine | Kind::AsyncGen => {
                check(PyGenObject::read(self, addr.cast()), |o| {
                    o.invalid_reason(self)
                })
            }
        }
    }

    /// Every mapped address the object at `addr` directly references.
    /// Fails with `Error::InvalidObject` when a decode the referent walk
    /// depends on is implausible.
    pub fn direct_referents<T: ?Sized>(
        &self,
        addr: MappedAddr<T>,
    ) -> Result<HashSet<MappedAddr>> {
        if let Some(reason) = header_invalid_reason(self, addr) {
            return Err(Error::InvalidObject(reason));
        }
        let header = ObjHeader::read(self, addr)?;
        let addr: MappedAddr<PyObj> = addr.cast();
        let kind = match self.kind_for_type(header.ob_type) {
            None => return Ok(HashSet::new()),
            Some(kind) => kind,
        };
        match kind {
            Kind::Type => PyTypeObject::read(self, addr.cast())?.direct_referents(),
            Kind::Dict => PyDictObject::read(self, addr.cast())?.direct_referents(self),
            Kind::Set | Kind::FrozenSet => {
                PySetObject::read(self, addr.cast())?.direct_referents(self)
            }
            Kind::Tuple => {
                PyTupleObject::read(self, addr.cast())?.direct_referents(self, addr.cast())
            }
            Kind::List => PyListObject::read(self, addr.cast())?.direct_referents(self),
            Kind::Str | Kind::Bytes | Kind::Int | Kind::Bool | Kind::NoneType => {
                Ok(HashSet::new())
            }
            Kind::Code => PyCodeObject::read(self, addr.cast())?.direct_referents(),
            Kind::Frame => {
                PyFrameObject::read(self, addr.cast())?.direct_referents(self, addr.cast())
            }
            Kind::Module => PyModuleObject::read(self, addr.cast())?.direct_referents(),
            Kind::Future => PyFutureObject::read(self, addr.cast())?.direct_referents(),
            Kind::Task => PyTaskObject::read(self, addr.cast())?.direct_referents(),
            Kind::GatheringFuture => {
                PyGatheringFutureObject::read(self, addr.cast())?.direct_referents(self)
            }
            Kind::Generator | Kind::Coroutine | Kind::AsyncGen => {
                PyGenObject::read(self, addr.cast())?.direct_referents()
            }
        }
    }

    /// Decode a str or bytes object to text. Used for name comparisons
    /// (`__name__`, dict key lookup).
    pub fn decode_string_types<T: ?Sized>(&self, addr: MappedAddr<T>) -> Result<String> {
        let header = ObjHeader::read(self, addr)?;
        match self.kind_for_type(header.ob_type) {
            Some(Kind::Str) => {
                let s = PyStrObject::read(self, addr.cast())?;
                if let Some(reason) = s.invalid_reason(self, addr.cast()) {
                    return Err(Error::InvalidObject(reason));
                }
                s.decode(self, addr.cast())
            }
            Some(Kind::Bytes) => {
                let b = PyBytesObject::read(self, addr.cast())?;
                if let Some(reason) = b.invalid_reason(self, addr.cast()) {
                    return Err(Error::InvalidObject(reason));
                }
                Ok(String::from_utf8_lossy(b.data(self, addr.cast())?).into_owned())
            }
            _ => Err(Error::InvalidObject("not_a_string_type")),
        }
    }
}

fn check<O>(
    decoded: Result<O>,
    validate: impl FnOnce(&O) -> Option<&'static str>,
) -> Option<&'static str> {
    match decoded {
        Ok(o) => validate(&o),
        Err(_) => Some("invalid_header"),
    }
}
