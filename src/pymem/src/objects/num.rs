//! Int (and bool) objects.
//!
//! The signed `ob_size` is the digit count; each digit is a 30-bit word and
//! the value is `sign * sum(digit[i] * 2^(30*i))`. Bools share the layout.

use byteorder::{ByteOrder, LE};

use crate::addr::MappedAddr;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{PyObj, VarHeader};
use crate::traverse::Traversal;

const DIGIT_BITS: u32 = 30;
const DIGIT_BASE: u32 = 1 << DIGIT_BITS;
const DIGITS_OFFSET: i64 = 24;
const MAX_DIGITS: i64 = 128;
/// Largest digit count whose value still fits an i128.
const EXACT_DIGITS: i64 = 4;

#[derive(Debug, Clone, Copy)]
pub struct PyIntObject {
    pub header: VarHeader,
}

impl PyIntObject {
    pub fn read(env: &Environment, addr: MappedAddr<PyObj>) -> Result<PyIntObject> {
        Ok(PyIntObject {
            header: VarHeader::read(env, addr)?,
        })
    }

    pub fn ndigits(&self) -> i64 {
        self.header.ob_size.unsigned_abs() as i64
    }

    pub fn digits(&self, env: &Environment, addr: MappedAddr<PyObj>) -> Result<Vec<u32>> {
        let count = self.ndigits().clamp(0, MAX_DIGITS) as u64;
        let bytes = env.store.read(addr.offset_bytes(DIGITS_OFFSET), count * 4)?;
        Ok(bytes.chunks_exact(4).map(LE::read_u32).collect())
    }

    /// Exact value when it fits; `None` for wider ints.
    pub fn value(&self, env: &Environment, addr: MappedAddr<PyObj>) -> Result<Option<i128>> {
        if self.ndigits() > EXACT_DIGITS {
            return Ok(None);
        }
        let mut magnitude: i128 = 0;
        for (i, digit) in self.digits(env, addr)?.iter().enumerate() {
            magnitude += (*digit as i128) << (DIGIT_BITS as usize * i);
        }
        Ok(Some(if self.header.ob_size < 0 {
            -magnitude
        } else {
            magnitude
        }))
    }

    pub fn invalid_reason(
        &self,
        env: &Environment,
        addr: MappedAddr<PyObj>,
    ) -> Option<&'static str> {
        if self.ndigits() > MAX_DIGITS {
            return Some("invalid_ob_size");
        }
        if !env
            .store
            .exists_range(addr.offset_bytes(DIGITS_OFFSET), self.ndigits() as u64 * 4)
        {
            return Some("invalid_digits_range");
        }
        let digits = match self.digits(env, addr) {
            Ok(digits) => digits,
            Err(_) => return Some("invalid_digits_range"),
        };
        if digits.iter().any(|&d| d >= DIGIT_BASE) {
            return Some("invalid_digit");
        }
        None
    }

    pub fn repr(&self, t: &mut Traversal, addr: MappedAddr<PyObj>, as_bool: bool) -> String {
        if let Some(reason) = t.check_valid(self.invalid_reason(t.env, addr)) {
            let name = if as_bool { "bool" } else { "int" };
            return format!("<{name} !{reason}>");
        }
        let value = match self.value(t.env, addr) {
            Ok(Some(value)) => value,
            Ok(None) => return format!("<int !too_large ndigits={}>", self.ndigits()),
            Err(_) => return "<int !invalid_digits_range>".to_string(),
        };
        let body = if as_bool {
            if value == 0 { "False" } else { "True" }.to_string()
        } else {
            value.to_string()
        };
        t.scalar_repr(body, addr)
    }
}
