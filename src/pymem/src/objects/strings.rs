//! Str and bytes objects.
//!
//! Strings use the compact representation: the payload immediately follows
//! a fixed header whose size depends on the ASCII flag, and the character
//! width (1, 2, or 4 bytes) is the `kind` field. Legacy non-compact strings
//! are rejected rather than mis-decoded.

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{ObjHeader, PyObj, VarHeader};
use crate::traverse::Traversal;

const MAX_STRING_LEN: i64 = 1 << 40;

const STATE_KIND_SHIFT: u32 = 2;
const STATE_KIND_MASK: u32 = 0x7;
const STATE_COMPACT: u32 = 1 << 5;
const STATE_ASCII: u32 = 1 << 6;

/// Payload offset for compact ASCII strings.
const ASCII_DATA_OFFSET: i64 = 48;
/// Payload offset for compact non-ASCII strings.
const COMPACT_DATA_OFFSET: i64 = 72;

#[derive(Debug, Clone, Copy)]
pub struct PyStrObject {
    pub header: ObjHeader,
    pub length: i64,
    pub state: u32,
}

impl PyStrObject {
    pub const SIZE: u64 = 48;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyStrObject> {
        let bytes = env.store.read(addr, Self::SIZE)?;
        Ok(PyStrObject {
            header: ObjHeader::parse(bytes),
            length: LE::read_i64(&bytes[16..24]),
            state: LE::read_u32(&bytes[32..36]),
        })
    }

    /// Character width in bytes: 1 (ASCII/Latin-1), 2 (UCS-2), or 4 (UCS-4).
    pub fn kind(&self) -> u32 {
        (self.state >> STATE_KIND_SHIFT) & STATE_KIND_MASK
    }

    pub fn is_compact(&self) -> bool {
        self.state & STATE_COMPACT != 0
    }

    pub fn is_ascii(&self) -> bool {
        self.state & STATE_ASCII != 0
    }

    fn data_addr(&self, addr: MappedAddr<PyObj>) -> MappedAddr {
        if self.is_ascii() {
            addr.offset_bytes(ASCII_DATA_OFFSET).cast()
        } else {
            addr.offset_bytes(COMPACT_DATA_OFFSET).cast()
        }
    }

    fn data_len(&self) -> u64 {
        self.length.max(0) as u64 * self.kind() as u64
    }

    /// Number of characters; the size-only fast path for histograms.
    pub fn char_len(&self) -> i64 {
        self.length
    }

    pub fn invalid_reason(
        &self,
        env: &Environment,
        addr: MappedAddr<PyObj>,
    ) -> Option<&'static str> {
        if self.length < 0 || self.length > MAX_STRING_LEN {
            return Some("invalid_length");
        }
        if !self.is_compact() {
            return Some("str_not_compact");
        }
        if !matches!(self.kind(), 1 | 2 | 4) || (self.is_ascii() && self.kind() != 1) {
            return Some("invalid_str_kind");
        }
        if !env.store.exists_range(self.data_addr(addr), self.data_len()) {
            return Some("invalid_str_data");
        }
        None
    }

    pub fn decode(&self, env: &Environment, addr: MappedAddr<PyObj>) -> Result<String> {
        let bytes = env.store.read(self.data_addr(addr), self.data_len())?;
        Ok(match self.kind() {
            1 => bytes.iter().map(|&b| b as char).collect(),
            2 => bytes
                .chunks_exact(2)
                .map(|c| {
                    char::from_u32(LE::read_u16(c) as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
                })
                .collect(),
            _ => bytes
                .chunks_exact(4)
                .map(|c| char::from_u32(LE::read_u32(c)).unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect(),
        })
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env, addr)) {
            return format!("<str !{reason}>");
        }
        let text = match self.decode(t.env, addr) {
            Ok(text) => text,
            Err(_) => return "<str !invalid_str_data>".to_string(),
        };
        let body = quote_str(&text, t.max_string_bytes);
        t.scalar_repr(body, addr)
    }
}

/// Python-style single-quoted repr, truncated to `max_bytes` of text.
pub fn quote_str(text: &str, max_bytes: i64) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    let mut truncated = false;
    for c in text.chars() {
        if max_bytes >= 0 && out.len() >= max_bytes as usize + 1 {
            truncated = true;
            break;
        }
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('\'');
    if truncated {
        out.push_str("...");
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct PyBytesObject {
    pub header: VarHeader,
    pub ob_shash: u64,
}

impl PyBytesObject {
    pub const DATA_OFFSET: i64 = 32;

    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyBytesObject> {
        let bytes = env.store.read(addr, 32)?;
        Ok(PyBytesObject {
            header: VarHeader::parse(bytes),
            ob_shash: LE::read_u64(&bytes[24..32]),
        })
    }

    pub fn data<'e>(&self, env: &'e Environment, addr: MappedAddr<PyObj>) -> Result<&'e [u8]> {
        env.store.read(
            addr.offset_bytes(Self::DATA_OFFSET),
            self.header.ob_size.max(0) as u64,
        )
    }

    pub fn invalid_reason(
        &self,
        env: &Environment,
        addr: MappedAddr<PyObj>,
    ) -> Option<&'static str> {
        if self.header.ob_size < 0 || self.header.ob_size > MAX_STRING_LEN {
            return Some("invalid_ob_size");
        }
        if !env.store.exists_range(
            addr.offset_bytes(Self::DATA_OFFSET),
            self.header.ob_size as u64,
        ) {
            return Some("invalid_data_range");
        }
        None
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env, addr)) {
            return format!("<bytes !{reason}>");
        }
        let data = match self.data(t.env, addr) {
            Ok(data) => data,
            Err(_) => return "<bytes !invalid_data_range>".to_string(),
        };
        let body = quote_bytes(data, t.max_string_bytes, t.bytes_as_hex);
        t.scalar_repr(body, addr)
    }
}

/// `b'...'` repr; hex escapes everywhere when `as_hex` is set or the data
/// has non-printable bytes mixed in.
pub fn quote_bytes(data: &[u8], max_bytes: i64, as_hex: bool) -> String {
    let printable = data.iter().all(|&b| b == b' ' || b.is_ascii_graphic());
    let mut out = String::from("b'");
    let mut truncated = false;
    for &b in data {
        if max_bytes >= 0 && out.len() >= max_bytes as usize + 2 {
            truncated = true;
            break;
        }
        if as_hex || !printable {
            out.push_str(&format!("\\x{b:02x}"));
        } else {
            match b {
                b'\'' => out.push_str("\\'"),
                b'\\' => out.push_str("\\\\"),
                _ => out.push(b as char),
            }
        }
    }
    out.push('\'');
    if truncated {
        out.push_str("...");
    }
    out
}
