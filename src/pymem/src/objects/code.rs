//! Code objects.
//!
//! Besides identifying a function (name, filename, first line), a code
//! object carries the line-number table that maps bytecode offsets to
//! source lines; frame reprs use it to answer "where was this executing".

use std::collections::HashSet;

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::{Error, Result};
use crate::objects::{ObjHeader, PyBytesObject, PyObj};
use crate::traverse::Traversal;

/// One bytecode unit is two bytes; `f_lasti` counts units, the line table
/// counts bytes.
pub const CODE_UNIT_SIZE: i64 = 2;

#[derive(Debug, Clone, Copy)]
pub struct PyCodeObject {
    pub header: ObjHeader,
    pub co_firstlineno: i32,
    pub co_code: MappedAddr<PyObj>,
    pub co_varnames: MappedAddr<PyObj>,
    pub co_filename: MappedAddr<PyObj>,
    pub co_name: MappedAddr<PyObj>,
    pub co_linetable: MappedAddr<PyObj>,
}

impl PyCodeObject {
    pub const SIZE: u64 = 120;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyCodeObject> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PyCodeObject {
            header: ObjHeader::parse(bytes),
            co_firstlineno: LE::read_i32(&bytes[40..44]),
            co_code: MappedAddr::new(LE::read_u64(&bytes[48..56])),
            co_varnames: MappedAddr::new(LE::read_u64(&bytes[72..80])),
            co_filename: MappedAddr::new(LE::read_u64(&bytes[96..104])),
            co_name: MappedAddr::new(LE::read_u64(&bytes[104..112])),
            co_linetable: MappedAddr::new(LE::read_u64(&bytes[112..120])),
        })
    }

    pub fn invalid_reason(&self, env: &Environment) -> Option<&'static str> {
        if self.co_firstlineno < 0 {
            return Some("invalid_co_firstlineno");
        }
        if !env.store.obj_valid_or_null(self.co_code, 8) {
            return Some("invalid_co_code");
        }
        if !env.store.obj_valid_or_null(self.co_varnames, 8) {
            return Some("invalid_co_varnames");
        }
        if !env.store.obj_valid_or_null(self.co_filename, 8) {
            return Some("invalid_co_filename");
        }
        if !env.store.obj_valid_or_null(self.co_name, 8) {
            return Some("invalid_co_name");
        }
        if !env.store.obj_valid_or_null(self.co_linetable, 8) {
            return Some("invalid_co_linetable");
        }
        None
    }

    /// Source line for a byte offset into the bytecode, from the line table.
    ///
    /// The table is pairs of (byte_delta: u8, line_delta: i8); a line delta
    /// of -128 marks bytecode with no line number.
    pub fn line_number_for_code_offset(&self, env: &Environment, offset: i64) -> Result<i32> {
        let table_obj = PyBytesObject::read(env, self.co_linetable)?;
        let table = table_obj.data(env, self.co_linetable)?;

        let mut line = self.co_firstlineno;
        let mut end: i64 = 0;
        for pair in table.chunks_exact(2) {
            let byte_delta = pair[0] as i64;
            let line_delta = pair[1] as i8;
            if line_delta != -128 {
                line += line_delta as i32;
            }
            end += byte_delta;
            if offset < end {
                return Ok(line);
            }
        }
        Err(Error::InvalidObject("code_offset_past_line_table"))
    }

    pub fn direct_referents(&self) -> Result<HashSet<MappedAddr>> {
        Ok([
            self.co_code,
            self.co_varnames,
            self.co_filename,
            self.co_name,
            self.co_linetable,
        ]
        .into_iter()
        .map(|a| a.cast())
        .collect())
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env)) {
            return format!("<code !{reason}>");
        }
        let name = t.repr(self.co_name);
        let filename = t.repr(self.co_filename);
        format!(
            "<code {name} {filename}:{lineno}>@{addr}",
            lineno = self.co_firstlineno
        )
    }
}
