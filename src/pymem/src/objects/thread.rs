//! Interpreter thread states.
//!
//! Not a PyObject: thread states live in a doubly-linked per-interpreter
//! list and point at the thread's current frame. Since there is no type
//! pointer to anchor on, validity is necessarily heuristic; requiring a
//! non-null interpreter pointer keeps zeroed pages from matching.

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{PyFrame, PyThread};
use crate::traverse::Traversal;

#[derive(Debug, Clone, Copy)]
pub struct PyThreadState {
    pub prev: MappedAddr<PyThread>,
    pub next: MappedAddr<PyThread>,
    pub interp: MappedAddr,
    pub frame: MappedAddr<PyFrame>,
}

impl PyThreadState {
    pub const SIZE: u64 = 32;

    pub fn parse(bytes: &[u8]) -> PyThreadState {
        PyThreadState {
            prev: MappedAddr::new(LE::read_u64(&bytes[0..8])),
            next: MappedAddr::new(LE::read_u64(&bytes[8..16])),
            interp: MappedAddr::new(LE::read_u64(&bytes[16..24])),
            frame: MappedAddr::new(LE::read_u64(&bytes[24..32])),
        }
    }

    pub fn read(env: &Environment, addr: MappedAddr<PyThread>) -> Result<PyThreadState> {
        Ok(Self::parse(env.store.read(addr, Self::SIZE)?))
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if !env.store.obj_valid(self.interp, 8) {
            return Some("invalid_interp");
        }
        if !env.store.obj_valid_or_null(self.prev, 8) {
            return Some("invalid_prev");
        }
        if !env.store.obj_valid_or_null(self.next, 8) {
            return Some("invalid_next");
        }
        if !env.store.obj_valid_or_null(self.frame, 8) {
            return Some("invalid_frame");
        }
        if !self.frame.is_null() {
            let Some(frame_type) = env.get_type_if_exists("frame") else {
                return Some("missing_frame_type");
            };
            if env.invalid_reason_expected(self.frame, frame_type).is_some() {
                return Some("invalid_frame");
            }
        }
        None
    }

    pub fn direct_referents(&self) -> Result<HashSet<MappedAddr>> {
        Ok([
            self.prev.cast(),
            self.next.cast(),
            self.interp,
            self.frame.cast(),
        ]
        .into_iter()
        .collect())
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyThread>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<thread_state !{reason}>");
        }
        let frame = t.indented(|t| t.repr(self.frame));
        format!(
            "<thread_state frame={frame} prev=@{prev} next=@{next} interp=@{interp}>@{addr}",
            prev = self.prev,
            next = self.next,
            interp = self.interp,
        )
    }
}
