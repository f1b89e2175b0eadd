//! Raw-memory commands: byte search, hex dump context, repr, regions.

use std::sync::Mutex;

use byteorder::{ByteOrder, LE};
use memchr::memmem;

use crate::addr::MappedAddr;
use crate::args::{parse_hex, Args};
use crate::catalog::Environment;
use crate::error::{Error, Result};
use crate::objects::PyObj;
use crate::scan::{format_size, scan};
use crate::traverse::Traversal;
use crate::CLEAR_LINE;

use super::Session;

/// Search all readable memory for `data` at `align`-byte boundaries. No
/// validity checks; results are sorted by address.
pub fn find_data(
    env: &Environment,
    max_threads: usize,
    data: &[u8],
    align: u64,
) -> Result<Vec<MappedAddr>> {
    if data.is_empty() {
        return Err(Error::InvalidArgument("empty search data".into()));
    }
    if align == 0 || align & (align - 1) != 0 {
        return Err(Error::InvalidArgument(format!("bad alignment {align}")));
    }

    let mut results: Vec<MappedAddr> = if data.len() == 8 && align == 8 {
        // Optimized common case: aligned 8-byte comparison.
        let target = LE::read_u64(data);
        let hits = Mutex::new(Vec::new());
        scan(&env.store, 8, 8, max_threads, |window, addr, _| {
            if LE::read_u64(window) == target {
                hits.lock().unwrap().push(addr);
            }
        })?;
        hits.into_inner().unwrap()
    } else if align == 1 {
        // Unaligned search: substring scan per region.
        let finder = memmem::Finder::new(data);
        let mut hits = Vec::new();
        for (start, size) in env.store.all_regions() {
            let bytes = env.store.read(start, size)?;
            hits.extend(
                finder
                    .find_iter(bytes)
                    .map(|offset| start.offset_bytes(offset as i64)),
            );
        }
        hits
    } else {
        let hits = Mutex::new(Vec::new());
        scan(
            &env.store,
            data.len() as u64,
            align,
            max_threads,
            |window, addr, _| {
                if window == data {
                    hits.lock().unwrap().push(addr);
                }
            },
        )?;
        hits.into_inner().unwrap()
    };

    results.sort_unstable();
    Ok(results)
}

pub fn cmd_find(session: &mut Session, args: &Args) -> Result<()> {
    let (data, default_align) = if args.get_flag("ptr") {
        let text = args.require_pos(1, "DATA")?;
        let mut value = parse_hex(text)
            .ok_or_else(|| Error::InvalidArgument(format!("bad pointer {text:?}")))?;
        if args.get_flag("bswap") {
            value = value.swap_bytes();
        }
        (value.to_le_bytes().to_vec(), 8)
    } else {
        let text = args.require_pos(1, "DATA")?;
        (parse_data_string(text)?, 1)
    };
    let align = args.get_u64("align", default_align)?;
    let count_only = args.get_flag("count");

    let results = find_data(&session.env, session.max_threads, &data, align)?;
    if !count_only {
        for addr in &results {
            eprintln!("{CLEAR_LINE}Data found at {addr}");
        }
    }
    eprintln!("{CLEAR_LINE}{} results found", results.len());
    Ok(())
}

/// Parse contiguous hex digits into bytes.
pub fn parse_data_string(text: &str) -> Result<Vec<u8>> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(Error::InvalidArgument(format!("bad data string {text:?}")));
    }
    digits
        .as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16)
                .map_err(|_| Error::InvalidArgument(format!("bad data string {text:?}")))
        })
        .collect()
}

/// Hex dump of the bytes around `addr`, clipped to its region.
pub fn context_dump(env: &Environment, addr: MappedAddr, size: u64) -> Result<String> {
    let (region_start, region_size) = env.store.region_for_address(addr)?;
    let bytes_before = size.min(addr.raw() - region_start.raw());
    let bytes_after = size.min(region_start.raw() + region_size - addr.raw());
    let start = addr.offset_bytes(-(bytes_before as i64));
    let data = env.store.read(start, bytes_before + bytes_after)?;

    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        out.push_str(&format!("{}  ", start.offset_bytes(row as i64 * 16)));
        for (column, byte) in chunk.iter().enumerate() {
            out.push_str(&format!("{byte:02X} "));
            if column == 7 {
                out.push(' ');
            }
        }
        for column in chunk.len()..16 {
            out.push_str("   ");
            if column == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for byte in chunk {
            let c = *byte as char;
            out.push(if c.is_ascii_graphic() || c == ' ' { c } else { '.' });
        }
        out.push_str("|\n");
    }
    Ok(out)
}

pub fn cmd_context(session: &mut Session, args: &Args) -> Result<()> {
    let addr = session.parse_addr(args.require_pos(1, "ADDRESS")?, args.get_flag("bswap"))?;
    let size = args.get_hex("size", 0x100)?;
    print!("{}", context_dump(&session.env, addr, size)?);
    Ok(())
}

/// Repr the object named by `text`: any leading asterisks dereference that
/// many pointer levels first.
pub fn repr_query(env: &Environment, text: &str, bswap: bool, repr_args: &Args) -> Result<String> {
    let derefs = text.bytes().take_while(|&b| b == b'*').count();
    let raw = parse_hex(&text[derefs..])
        .ok_or_else(|| Error::InvalidArgument(format!("bad address {text:?}")))?;
    let mut addr: MappedAddr<PyObj> =
        MappedAddr::new(if bswap { raw.swap_bytes() } else { raw });
    for _ in 0..derefs {
        addr = env.store.read_ptr(addr)?;
    }
    let mut t = Traversal::from_args(env, repr_args)?;
    Ok(t.repr(addr))
}

pub fn cmd_repr(session: &mut Session, args: &Args) -> Result<()> {
    let text = args.require_pos(1, "ADDRESS")?;
    let repr = repr_query(&session.env, text, args.get_flag("bswap"), args)?;
    println!("{repr}");
    Ok(())
}

pub fn cmd_regions(session: &mut Session, _args: &Args) -> Result<()> {
    let mut total = 0u64;
    for (start, size) in session.env.store.all_regions() {
        println!(
            "{start}-{} ({})",
            start.offset_bytes(size as i64),
            format_size(size)
        );
        total += size;
    }
    println!("All regions: {}", format_size(total));
    Ok(())
}
