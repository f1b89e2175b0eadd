//! Generator, coroutine, and async-generator objects.
//!
//! All three share the same head layout: the owned frame (through which the
//! suspended locals and state are reachable), the code object, and names.

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{Kind, ObjHeader, PyFrame, PyObj};
use crate::traverse::Traversal;

#[derive(Debug, Clone, Copy)]
pub struct PyGenObject {
    pub header: ObjHeader,
    pub gi_frame: MappedAddr<PyFrame>,
    pub gi_running: u8,
    pub gi_code: MappedAddr<PyObj>,
    pub gi_name: MappedAddr<PyObj>,
    pub gi_qualname: MappedAddr<PyObj>,
}

impl PyGenObject {
    pub const SIZE: u64 = 56;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyGenObject> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PyGenObject {
            header: ObjHeader::parse(bytes),
            gi_frame: MappedAddr::new(LE::read_u64(&bytes[16..24])),
            gi_running: bytes[24],
            gi_code: MappedAddr::new(LE::read_u64(&bytes[32..40])),
            gi_name: MappedAddr::new(LE::read_u64(&bytes[40..48])),
            gi_qualname: MappedAddr::new(LE::read_u64(&bytes[48..56])),
        })
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if !env.store.obj_valid_or_null(self.gi_frame, 8) {
            return Some("invalid_gi_frame");
        }
        if !env.store.obj_valid_or_null(self.gi_code, 8) {
            return Some("invalid_gi_code");
        }
        if !env.store.obj_valid_or_null(self.gi_name, 8) {
            return Some("invalid_gi_name");
        }
        if !env.store.obj_valid_or_null(self.gi_qualname, 8) {
            return Some("invalid_gi_qualname");
        }
        if !self.gi_frame.is_null() {
            if let Some(frame_type) = env.get_type_if_exists("frame") {
                if env
                    .invalid_reason_expected(self.gi_frame, frame_type)
                    .is_some()
                {
                    return Some("invalid_gi_frame");
                }
            }
        }
        None
    }

    pub fn direct_referents(&self) -> Result<HashSet<MappedAddr>> {
        Ok([
            self.gi_frame.cast(),
            self.gi_code.cast(),
            self.gi_name.cast(),
            self.gi_qualname.cast(),
        ]
        .into_iter()
        .collect())
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>, kind: Kind) -> String {
        let name = kind.display_name();
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<{name} !{reason}>");
        }
        let (qualname, frame) = t.indented(|t| (t.repr(self.gi_qualname), t.repr(self.gi_frame)));
        format!(
            "<{name} {qualname} running={} frame={frame}>@{addr}",
            self.gi_running != 0,
        )
    }
}
