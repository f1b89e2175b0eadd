//! Argument parsing for shell command strings.
//!
//! Commands look like `name POSITIONAL --flag --option=value`; tokens are
//! whitespace-separated. Positional index 0 is the command name itself.

use crate::error::{Error, Result};

pub struct Args {
    positional: Vec<String>,
    flags: Vec<(String, Option<String>)>,
}

impl Args {
    pub fn parse(command: &str) -> Args {
        let mut positional = Vec::new();
        let mut flags = Vec::new();
        for token in command.split_whitespace() {
            if let Some(flag) = token.strip_prefix("--") {
                match flag.split_once('=') {
                    Some((name, value)) => {
                        flags.push((name.to_string(), Some(value.to_string())))
                    }
                    None => flags.push((flag.to_string(), None)),
                }
            } else {
                positional.push(token.to_string());
            }
        }
        Args { positional, flags }
    }

    /// Positional argument by index (0 is the command name).
    pub fn get_pos(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(|s| s.as_str())
    }

    /// Positional argument that must be present.
    pub fn require_pos(&self, index: usize, what: &str) -> Result<&str> {
        self.get_pos(index)
            .ok_or_else(|| Error::InvalidArgument(format!("missing {what}")))
    }

    /// True when `--name` was given (with or without a value).
    pub fn get_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|(n, _)| n == name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Decimal integer option with a default.
    pub fn get_u64(&self, name: &str, default: u64) -> Result<u64> {
        match self.get_str(name) {
            None => Ok(default),
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| Error::InvalidArgument(format!("--{name}={value}"))),
        }
    }

    pub fn get_i64(&self, name: &str, default: i64) -> Result<i64> {
        match self.get_str(name) {
            None => Ok(default),
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| Error::InvalidArgument(format!("--{name}={value}"))),
        }
    }

    /// Hex integer option (with or without `0x`) with a default.
    pub fn get_hex(&self, name: &str, default: u64) -> Result<u64> {
        match self.get_str(name) {
            None => Ok(default),
            Some(value) => parse_hex(value)
                .ok_or_else(|| Error::InvalidArgument(format!("--{name}={value}"))),
        }
    }
}

/// Parse a hex string, tolerating a `0x` prefix.
pub fn parse_hex(value: &str) -> Option<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_and_flags() {
        let args = Args::parse("find-all-objects --type-name=dict --count extra");
        assert_eq!(args.get_pos(0), Some("find-all-objects"));
        assert_eq!(args.get_pos(1), Some("extra"));
        assert_eq!(args.get_pos(2), None);
        assert!(args.get_flag("count"));
        assert!(!args.get_flag("bswap"));
        assert_eq!(args.get_str("type-name"), Some("dict"));
    }

    #[test]
    fn test_numeric_options() {
        let args = Args::parse("repr 1000 --max-entries=5 --type-addr=0x5CA3");
        assert_eq!(args.get_i64("max-entries", -1).unwrap(), 5);
        assert_eq!(args.get_u64("missing", 7).unwrap(), 7);
        assert_eq!(args.get_hex("type-addr", 0).unwrap(), 0x5CA3);
        assert!(Args::parse("x --n=zz").get_u64("n", 0).is_err());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x1000"), Some(0x1000));
        assert_eq!(parse_hex("5CA3F8F849A0"), Some(0x5CA3_F8F8_49A0));
        assert_eq!(parse_hex("zz"), None);
    }

    #[test]
    fn test_require_pos() {
        let args = Args::parse("repr");
        assert!(args.require_pos(1, "ADDRESS").is_err());
        assert_eq!(args.require_pos(0, "command").unwrap(), "repr");
    }
}
