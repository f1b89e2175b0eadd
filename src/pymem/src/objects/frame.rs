//! Frame objects.
//!
//! A frame records the executing code object, the caller link (`f_back`),
//! the execution state, and a trailing `f_localsplus` array whose length is
//! the code object's varnames count. The trailing range must be validated
//! before it is read.

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::{Error, Result};
use crate::objects::code::CODE_UNIT_SIZE;
use crate::objects::{
    header_invalid_reason, PyCodeObject, PyFrame, PyObj, PyTupleObject, VarHeader,
};
use crate::traverse::Traversal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum FrameState {
    Created = -2,
    Suspended = -1,
    Executing = 0,
    Returned = 1,
    Unwinding = 2,
    Raised = 3,
    Cleared = 4,
}

impl FrameState {
    pub fn from_raw(raw: i8) -> Option<FrameState> {
        Some(match raw {
            -2 => FrameState::Created,
            -1 => FrameState::Suspended,
            0 => FrameState::Executing,
            1 => FrameState::Returned,
            2 => FrameState::Unwinding,
            3 => FrameState::Raised,
            4 => FrameState::Cleared,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameState::Created => "created",
            FrameState::Suspended => "suspended",
            FrameState::Executing => "executing",
            FrameState::Returned => "returned",
            FrameState::Unwinding => "unwinding",
            FrameState::Raised => "raised",
            FrameState::Cleared => "cleared",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PyFrameObject {
    pub header: VarHeader,
    pub f_back: MappedAddr<PyFrame>,
    pub f_code: MappedAddr<PyObj>,
    pub f_builtins: MappedAddr<PyObj>,
    pub f_globals: MappedAddr<PyObj>,
    pub f_locals: MappedAddr<PyObj>,
    pub f_valuestack: MappedAddr,
    pub f_trace: MappedAddr<PyObj>,
    pub f_stackdepth: i32,
    pub f_trace_lines: u8,
    pub f_trace_opcodes: u8,
    pub f_gen: MappedAddr<PyObj>,
    pub f_lasti: i32,
    pub f_lineno: i32,
    pub f_iblock: i32,
    pub f_state_raw: i8,
}

impl PyFrameObject {
    /// Fixed part; `f_localsplus` trails it.
    pub const SIZE: u64 = 352;

    pub fn parse(bytes: &[u8]) -> PyFrameObject {
        PyFrameObject {
            header: VarHeader::parse(bytes),
            f_back: MappedAddr::new(LE::read_u64(&bytes[24..32])),
            f_code: MappedAddr::new(LE::read_u64(&bytes[32..40])),
            f_builtins: MappedAddr::new(LE::read_u64(&bytes[40..48])),
            f_globals: MappedAddr::new(LE::read_u64(&bytes[48..56])),
            f_locals: MappedAddr::new(LE::read_u64(&bytes[56..64])),
            f_valuestack: MappedAddr::new(LE::read_u64(&bytes[64..72])),
            f_trace: MappedAddr::new(LE::read_u64(&bytes[72..80])),
            f_stackdepth: LE::read_i32(&bytes[80..84]),
            f_trace_lines: bytes[84],
            f_trace_opcodes: bytes[85],
            f_gen: MappedAddr::new(LE::read_u64(&bytes[88..96])),
            f_lasti: LE::read_i32(&bytes[96..100]),
            f_lineno: LE::read_i32(&bytes[100..104]),
            f_iblock: LE::read_i32(&bytes[104..108]),
            f_state_raw: bytes[108] as i8,
        }
    }

    pub fn read(env: &Environment, addr: MappedAddr<PyFrame>) -> Result<PyFrameObject> {
        Ok(Self::parse(env.store.read(addr, Self::SIZE)?))
    }

    pub fn state(&self) -> Option<FrameState> {
        FrameState::from_raw(self.f_state_raw)
    }

    pub fn state_name(&self) -> String {
        match self.state() {
            Some(state) => state.name().to_string(),
            None => format!("state:{:02X}", self.f_state_raw as u8),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == Some(FrameState::Executing)
    }

    pub fn is_runnable_or_running(&self) -> bool {
        matches!(
            self.state(),
            Some(FrameState::Executing) | Some(FrameState::Suspended)
        )
    }

    fn read_code(&self, env: &Environment) -> Result<PyCodeObject> {
        PyCodeObject::read(env, self.f_code)
    }

    pub fn invalid_reason(
        &self,
        env: &Environment,
        addr: MappedAddr<PyFrame>,
    ) -> Option<&'static str> {
        if self.state().is_none() {
            return Some("invalid_f_state");
        }
        if !env.store.obj_valid_or_null(self.f_back, 8) {
            return Some("invalid_f_back");
        }
        if !env.store.obj_valid_or_null(self.f_code, 8) {
            return Some("invalid_f_code");
        }
        if !env.store.obj_valid_or_null(self.f_builtins, 8) {
            return Some("invalid_f_builtins");
        }
        if !env.store.obj_valid_or_null(self.f_globals, 8) {
            return Some("invalid_f_globals");
        }
        if !env.store.obj_valid_or_null(self.f_locals, 8) {
            return Some("invalid_f_locals");
        }
        if !env.store.obj_valid_or_null(self.f_valuestack, 1) {
            return Some("invalid_f_valuestack");
        }
        if !env.store.obj_valid_or_null(self.f_trace, 1) {
            return Some("invalid_f_trace");
        }
        if !env.store.obj_valid_or_null(self.f_gen, 1) {
            return Some("invalid_f_gen");
        }

        if !self.f_code.is_null() {
            let Some(code_type) = env.get_type_if_exists("code") else {
                return Some("missing_code_type");
            };
            if let Some(reason) = env.invalid_reason_expected(self.f_code, code_type) {
                return Some(reason);
            }
            let code = match self.read_code(env) {
                Ok(code) => code,
                Err(_) => return Some("invalid_f_code"),
            };
            let Some(tuple_type) = env.get_type_if_exists("tuple") else {
                return Some("missing_tuple_type");
            };
            if let Some(reason) = env.invalid_reason_expected(code.co_varnames, tuple_type) {
                return Some(reason);
            }
            let varnames = match PyTupleObject::read(env, code.co_varnames) {
                Ok(varnames) => varnames,
                Err(_) => return Some("invalid_co_varnames"),
            };
            let nlocals = varnames.header.ob_size.max(0) as u64;

            if !env
                .store
                .exists_range(addr.offset_bytes(Self::SIZE as i64), nlocals * 8)
            {
                return Some("invalid_f_localsplus_range");
            }

            let Some(str_type) = env.get_type_if_exists("str") else {
                return Some("missing_str_type");
            };
            let names = match varnames.items(env, code.co_varnames) {
                Ok(names) => names,
                Err(_) => return Some("invalid_co_varnames"),
            };
            for name in names {
                if let Some(reason) = env.invalid_reason_expected(name, str_type) {
                    return Some(reason);
                }
            }
            let locals = match self.localsplus(env, addr, nlocals) {
                Ok(locals) => locals,
                Err(_) => return Some("invalid_f_localsplus_range"),
            };
            for value in locals {
                if !value.is_null() {
                    if let Some(reason) = header_invalid_reason(env, value) {
                        return Some(reason);
                    }
                }
            }
        }
        None
    }

    fn localsplus(
        &self,
        env: &Environment,
        addr: MappedAddr<PyFrame>,
        count: u64,
    ) -> Result<Vec<MappedAddr<PyObj>>> {
        let bytes = env
            .store
            .read(addr.offset_bytes(Self::SIZE as i64), count * 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| MappedAddr::new(LE::read_u64(c)))
            .collect())
    }

    /// (varname, value) address pairs zipping names with `f_localsplus`.
    pub fn locals(
        &self,
        env: &Environment,
        addr: MappedAddr<PyFrame>,
    ) -> Result<Vec<(MappedAddr<PyObj>, MappedAddr<PyObj>)>> {
        if self.f_code.is_null() {
            return Err(Error::InvalidObject("invalid_f_code"));
        }
        let code = self.read_code(env)?;
        let varnames = PyTupleObject::read(env, code.co_varnames)?;
        let names = varnames.items(env, code.co_varnames)?;
        let values = self.localsplus(env, addr, names.len() as u64)?;
        Ok(names.into_iter().zip(values).collect())
    }

    /// `{filename}:{line}` for the instruction the frame is stopped at.
    pub fn where_str(&self, t: &mut Traversal) -> String {
        let code = match self.read_code(t.env) {
            Ok(code) => code,
            Err(_) => return "!(invalid_f_code)".to_string(),
        };
        if let Some(reason) = code.invalid_reason(t.env) {
            return format!("!({reason})");
        }
        let filename = t.repr(code.co_filename);
        match code.line_number_for_code_offset(t.env, self.f_lasti as i64 * CODE_UNIT_SIZE) {
            Ok(line) => format!("{filename}:{line}"),
            Err(_) => format!("{filename}:!(code_offset_past_line_table)"),
        }
    }

    pub fn direct_referents(
        &self,
        env: &Environment,
        addr: MappedAddr<PyFrame>,
    ) -> Result<HashSet<MappedAddr>> {
        let mut ret: HashSet<MappedAddr> = [
            self.f_back.cast(),
            self.f_code.cast(),
            self.f_builtins.cast(),
            self.f_globals.cast(),
            self.f_locals.cast(),
            self.f_trace.cast(),
            self.f_gen.cast(),
        ]
        .into_iter()
        .collect();
        for (name, value) in self.locals(env, addr)? {
            ret.insert(name.cast());
            ret.insert(value.cast());
        }
        Ok(ret)
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyFrame>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env, addr)) {
            return format!("<frame !{reason}>");
        }
        t.guarded(addr, "frame", |t| {
            let mut tokens = vec![self.state_name(), format!("where={}", self.where_str(t))];
            if !t.is_short {
                t.indented(|t| {
                    if t.frame_omit_back {
                        tokens.push(format!("f_back=@{}", self.f_back));
                    } else {
                        tokens.push(format!("f_back={}", t.repr(self.f_back)));
                    }
                    tokens.push(format!("f_code={}", t.repr(self.f_code)));
                    tokens.push(format!("f_builtins=@{}", self.f_builtins));
                    tokens.push(format!("f_globals=@{}", self.f_globals));
                    tokens.push(format!("f_locals={}", t.repr(self.f_locals)));
                    tokens.push(format!("f_valuestack=@{}", self.f_valuestack));
                    tokens.push(format!("f_trace={}", t.repr(self.f_trace)));
                    tokens.push(format!("f_stackdepth={}", self.f_stackdepth));
                    tokens.push(format!("f_trace_lines=0x{:02X}", self.f_trace_lines));
                    tokens.push(format!("f_trace_opcodes=0x{:02X}", self.f_trace_opcodes));
                    tokens.push(format!("f_gen={}", t.repr(self.f_gen)));
                    tokens.push(format!(
                        "f_lasti={} (offset={})",
                        self.f_lasti,
                        self.f_lasti as i64 * CODE_UNIT_SIZE
                    ));
                    tokens.push(format!("f_lineno={}", self.f_lineno));
                    tokens.push(format!("f_iblock={}", self.f_iblock));

                    match self.locals(t.env, addr) {
                        Ok(locals) => {
                            let mut entries: Vec<String> = locals
                                .into_iter()
                                .map(|(name, value)| {
                                    format!("  {} = {}", t.repr(name), t.repr(value))
                                })
                                .collect();
                            entries.sort_unstable();
                            tokens.push("locals:".to_string());
                            tokens.extend(entries);
                        }
                        Err(e) => tokens.push(format!("locals=!({e})")),
                    }
                });
            }
            format!("<frame {}>@{}", tokens.join(" "), addr)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SnapshotBuilder;

    fn code_fixture(b: &mut SnapshotBuilder) -> (crate::testutil::StdTypes, MappedAddr) {
        let ty = b.std_types();
        let var_a = b.str_ascii(0x2000, ty.str_, "a");
        let var_b = b.str_ascii(0x2080, ty.str_, "b");
        let varnames = b.tuple_obj(0x2100, ty.tuple, &[var_a, var_b]);
        let filename = b.str_ascii(0x2140, ty.str_, "worker.py");
        let name = b.str_ascii(0x21C0, ty.str_, "run");
        let linetable = b.bytes_obj(0x2240, ty.bytes, &[100, 5]);
        let code = b.code_obj(0x2280, ty.code, 30, varnames, filename, name, linetable);
        (ty, code)
    }

    #[test]
    fn test_state_decoding() {
        assert_eq!(FrameState::from_raw(0), Some(FrameState::Executing));
        assert_eq!(FrameState::from_raw(-2), Some(FrameState::Created));
        assert_eq!(FrameState::from_raw(4), Some(FrameState::Cleared));
        assert_eq!(FrameState::from_raw(5), None);
        assert_eq!(FrameState::from_raw(-3), None);
    }

    #[test]
    fn test_valid_frame_with_locals() {
        let mut b = SnapshotBuilder::new();
        let (ty, code) = code_fixture(&mut b);
        let value = b.int_obj(0x3000, ty.int, 9);
        let frame = b.frame_obj(0x4000, ty.frame, MappedAddr::NULL, code, 0, 4, &[value, MappedAddr::NULL]);
        let (_dir, env) = b.build_env();

        let f = PyFrameObject::read(&env, frame).unwrap();
        assert_eq!(f.invalid_reason(&env, frame), None);
        assert!(f.is_running());
        assert!(f.is_runnable_or_running());

        let locals = f.locals(&env, frame).unwrap();
        assert_eq!(locals.len(), 2);
        assert_eq!(locals[0].1, value.cast());
        assert!(locals[1].1.is_null());
    }

    #[test]
    fn test_suspended_is_runnable_not_running() {
        let mut b = SnapshotBuilder::new();
        let (ty, code) = code_fixture(&mut b);
        let frame = b.frame_obj(0x4000, ty.frame, MappedAddr::NULL, code, -1, 0, &[MappedAddr::NULL, MappedAddr::NULL]);
        let (_dir, env) = b.build_env();

        let f = PyFrameObject::read(&env, frame).unwrap();
        assert!(!f.is_running());
        assert!(f.is_runnable_or_running());
        assert_eq!(f.state_name(), "suspended");
    }

    #[test]
    fn test_out_of_range_state_invalid() {
        let mut b = SnapshotBuilder::new();
        let (ty, code) = code_fixture(&mut b);
        let frame = b.frame_obj(0x4000, ty.frame, MappedAddr::NULL, code, 17, 0, &[MappedAddr::NULL, MappedAddr::NULL]);
        let (_dir, env) = b.build_env();

        let f = PyFrameObject::read(&env, frame).unwrap();
        assert_eq!(f.invalid_reason(&env, frame), Some("invalid_f_state"));
    }

    #[test]
    fn test_localsplus_past_region_invalid() {
        let mut b = SnapshotBuilder::new();
        let (ty, code) = code_fixture(&mut b);
        // Frame placed so the trailing array would cross the region end.
        let frame_addr = 0x1000 + 0x20000 - PyFrameObject::SIZE - 8;
        let frame = b.frame_obj(frame_addr, ty.frame, MappedAddr::NULL, code, 0, 0, &[MappedAddr::NULL]);
        let (_dir, env) = b.build_env();

        let f = PyFrameObject::read(&env, frame).unwrap();
        assert_eq!(
            f.invalid_reason(&env, frame),
            Some("invalid_f_localsplus_range")
        );
    }
}
