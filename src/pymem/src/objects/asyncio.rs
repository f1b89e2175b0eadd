//! Async future, task, and gathering-future objects.
//!
//! A task awaits the future in `task_fut_waiter`; a gathering future awaits
//! every entry of its children list; a plain future awaits nothing. These
//! three edges are what the await-graph query walks.

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::{Error, Result};
use crate::objects::{ObjHeader, PyListObject, PyObj};
use crate::traverse::Traversal;

const FUT_STATE_PENDING: u8 = 0;
const FUT_STATE_CANCELLED: u8 = 1;
const FUT_STATE_FINISHED: u8 = 2;

fn fut_state_name(state: u8) -> String {
    match state {
        FUT_STATE_PENDING => "pending".to_string(),
        FUT_STATE_CANCELLED => "cancelled".to_string(),
        FUT_STATE_FINISHED => "finished".to_string(),
        other => format!("state:{other:02X}"),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PyFutureObject {
    pub header: ObjHeader,
    pub fut_loop: MappedAddr<PyObj>,
    pub fut_callbacks: MappedAddr<PyObj>,
    pub fut_exception: MappedAddr<PyObj>,
    pub fut_result: MappedAddr<PyObj>,
    pub fut_state: u8,
}

impl PyFutureObject {
    pub const SIZE: u64 = 88;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyFutureObject> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PyFutureObject {
            header: ObjHeader::parse(bytes),
            fut_loop: MappedAddr::new(LE::read_u64(&bytes[16..24])),
            fut_callbacks: MappedAddr::new(LE::read_u64(&bytes[40..48])),
            fut_exception: MappedAddr::new(LE::read_u64(&bytes[48..56])),
            fut_result: MappedAddr::new(LE::read_u64(&bytes[56..64])),
            fut_state: bytes[80],
        })
    }

    pub fn state_name(&self) -> String {
        fut_state_name(self.fut_state)
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if self.fut_state > FUT_STATE_FINISHED {
            return Some("invalid_fut_state");
        }
        if !env.store.obj_valid_or_null(self.fut_loop, 8) {
            return Some("invalid_fut_loop");
        }
        if !env.store.obj_valid_or_null(self.fut_callbacks, 8) {
            return Some("invalid_fut_callbacks");
        }
        if !env.store.obj_valid_or_null(self.fut_exception, 8) {
            return Some("invalid_fut_exception");
        }
        if !env.store.obj_valid_or_null(self.fut_result, 8) {
            return Some("invalid_fut_result");
        }
        None
    }

    pub fn direct_referents(&self) -> Result<HashSet<MappedAddr>> {
        Ok([
            self.fut_loop.cast(),
            self.fut_callbacks.cast(),
            self.fut_exception.cast(),
            self.fut_result.cast(),
        ]
        .into_iter()
        .collect())
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<_asyncio.Future !{reason}>");
        }
        if t.is_short {
            return format!("<_asyncio.Future {}>@{addr}", self.state_name());
        }
        format!(
            "<_asyncio.Future {} result=@{} exception=@{} callbacks=@{}>@{addr}",
            self.state_name(),
            self.fut_result,
            self.fut_exception,
            self.fut_callbacks,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PyTaskObject {
    pub future: PyFutureObject,
    pub task_fut_waiter: MappedAddr<PyObj>,
    pub task_coro: MappedAddr<PyObj>,
    pub task_name: MappedAddr<PyObj>,
}

impl PyTaskObject {
    pub const SIZE: u64 = 112;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyTaskObject> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PyTaskObject {
            future: PyFutureObject::read(env, addr)?,
            task_fut_waiter: MappedAddr::new(LE::read_u64(&bytes[88..96])),
            task_coro: MappedAddr::new(LE::read_u64(&bytes[96..104])),
            task_name: MappedAddr::new(LE::read_u64(&bytes[104..112])),
        })
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if let Some(reason) = self.future.invalid_reason(env) {
            return Some(reason);
        }
        if !env.store.obj_valid_or_null(self.task_fut_waiter, 8) {
            return Some("invalid_task_fut_waiter");
        }
        if !env.store.obj_valid_or_null(self.task_coro, 8) {
            return Some("invalid_task_coro");
        }
        if !env.store.obj_valid_or_null(self.task_name, 8) {
            return Some("invalid_task_name");
        }
        None
    }

    pub fn direct_referents(&self) -> Result<HashSet<MappedAddr>> {
        let mut ret = self.future.direct_referents()?;
        ret.insert(self.task_fut_waiter.cast());
        ret.insert(self.task_coro.cast());
        ret.insert(self.task_name.cast());
        Ok(ret)
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<_asyncio.Task !{reason}>");
        }
        let name = t.indented(|t| t.repr(self.task_name));
        if t.is_short {
            return format!(
                "<_asyncio.Task {} name={name} fut_waiter=@{}>@{addr}",
                self.future.state_name(),
                self.task_fut_waiter,
            );
        }
        format!(
            "<_asyncio.Task {} name={name} fut_waiter=@{} coro=@{} result=@{} exception=@{}>@{addr}",
            self.future.state_name(),
            self.task_fut_waiter,
            self.task_coro,
            self.future.fut_result,
            self.future.fut_exception,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PyGatheringFutureObject {
    pub future: PyFutureObject,
    pub children: MappedAddr<PyObj>,
}

impl PyGatheringFutureObject {
    pub const SIZE: u64 = 96;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyGatheringFutureObject> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PyGatheringFutureObject {
            future: PyFutureObject::read(env, addr)?,
            children: MappedAddr::new(LE::read_u64(&bytes[88..96])),
        })
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if let Some(reason) = self.future.invalid_reason(env) {
            return Some(reason);
        }
        if !env.store.obj_valid_or_null(self.children, 8) {
            return Some("invalid_children");
        }
        None
    }

    /// Addresses of the children list entries.
    pub fn children_addrs(&self, env: &Environment) -> Result<Vec<MappedAddr<PyObj>>> {
        if self.children.is_null() {
            return Ok(Vec::new());
        }
        let Some(list_type) = env.get_type_if_exists("list") else {
            return Err(Error::MissingType("list".to_string()));
        };
        if let Some(reason) = env.invalid_reason_expected(self.children, list_type) {
            return Err(Error::InvalidObject(reason));
        }
        PyListObject::read(env, self.children)?.items(env)
    }

    pub fn direct_referents(&self, env: &Environment) -> Result<HashSet<MappedAddr>> {
        let mut ret = self.future.direct_referents()?;
        ret.insert(self.children.cast());
        if let Ok(children) = self.children_addrs(env) {
            ret.extend(children.into_iter().map(|a| a.cast::<()>()));
        }
        Ok(ret)
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<_GatheringFuture !{reason}>");
        }
        let children = match self.children_addrs(t.env) {
            Ok(children) => children
                .iter()
                .map(|c| format!("@{c}"))
                .collect::<Vec<_>>()
                .join(", "),
            Err(e) => format!("!({e})"),
        };
        format!(
            "<_GatheringFuture {} children=[{children}]>@{addr}",
            self.future.state_name(),
        )
    }
}
