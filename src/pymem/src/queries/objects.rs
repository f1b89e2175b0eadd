//! Object census and search queries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::addr::MappedAddr;
use crate::args::Args;
use crate::catalog::Environment;
use crate::error::{Error, Result};
use crate::objects::{ObjHeader, PyModuleObject, PyObj, PyType};
use crate::scan::scan;
use crate::traverse::{ReprOptions, Traversal};
use crate::CLEAR_LINE;

use super::Session;

/// Count live objects per known type. Returns (count, name, type address)
/// sorted ascending by count (then name), the emission order.
pub fn count_by_type(
    env: &Environment,
    max_threads: usize,
) -> Result<Vec<(u64, String, MappedAddr<PyType>)>> {
    if env.base_type.is_null() {
        return Err(Error::BaseTypeMissing);
    }

    // Invert the catalog for address lookup during the scan.
    let mut name_for_type: HashMap<u64, &str> = HashMap::new();
    for (name, addr) in &env.types_by_name {
        name_for_type.entry(addr.raw()).or_insert(name.as_str());
    }

    let num_threads = if max_threads == 0 {
        crate::scan::default_threads()
    } else {
        max_threads
    };
    let shards: Vec<Mutex<HashMap<u64, u64>>> =
        (0..num_threads).map(|_| Mutex::new(HashMap::new())).collect();

    scan(&env.store, ObjHeader::SIZE, 8, num_threads, |window, addr, ti| {
        let header = ObjHeader::parse(window);
        if !name_for_type.contains_key(&header.ob_type.raw()) {
            return;
        }
        if env.invalid_reason(addr).is_some() {
            return;
        }
        *shards[ti]
            .lock()
            .unwrap()
            .entry(header.ob_type.raw())
            .or_insert(0) += 1;
    })?;
    eprintln!();

    let mut overall: HashMap<u64, u64> = HashMap::new();
    for (index, shard) in shards.iter().enumerate() {
        let shard = shard.lock().unwrap();
        eprintln!("Collecting {} results from thread {index}", shard.len());
        for (type_addr, count) in shard.iter() {
            *overall.entry(*type_addr).or_insert(0) += count;
        }
    }

    let mut entries: Vec<(u64, String, MappedAddr<PyType>)> = overall
        .into_iter()
        .filter_map(|(type_addr, count)| {
            name_for_type
                .get(&type_addr)
                .map(|name| (count, name.to_string(), MappedAddr::new(type_addr)))
        })
        .collect();
    entries.sort();
    Ok(entries)
}

pub fn cmd_count_by_type(session: &mut Session, _args: &Args) -> Result<()> {
    let entries = count_by_type(&session.env, session.max_threads)?;
    eprintln!("Found {} types", entries.len());
    for (count, name, type_addr) in entries {
        println!("({count} objects) {name} @ {type_addr}");
    }
    Ok(())
}

/// All valid objects whose type object is at `type_addr`, with reprs unless
/// counting only. Results are sorted by address.
pub fn find_all_objects(
    env: &Environment,
    max_threads: usize,
    type_addr: MappedAddr<PyType>,
    count_only: bool,
    repr_args: &Args,
) -> Result<(u64, Vec<(MappedAddr<PyObj>, String)>)> {
    let opts = ReprOptions::from_args(repr_args)?;
    let result_count = AtomicU64::new(0);
    let results: Mutex<Vec<(MappedAddr<PyObj>, String)>> = Mutex::new(Vec::new());

    scan(&env.store, ObjHeader::SIZE, 8, max_threads, |window, addr, _| {
        let header = ObjHeader::parse(window);
        if header.ob_type != type_addr || env.invalid_reason(addr).is_some() {
            return;
        }
        if count_only {
            result_count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut t = Traversal::with_options(env, &opts);
        let repr = t.repr(addr);
        if !t.is_valid {
            return;
        }
        result_count.fetch_add(1, Ordering::Relaxed);
        results.lock().unwrap().push((addr.cast(), repr));
    })?;

    let mut results = results.into_inner().unwrap();
    results.sort_by_key(|(addr, _)| *addr);
    Ok((result_count.load(Ordering::Relaxed), results))
}

pub fn cmd_find_all_objects(session: &mut Session, args: &Args) -> Result<()> {
    let type_addr: MappedAddr<PyType> = match args.get_hex("type-addr", 0)? {
        0 => {
            let name = args
                .get_str("type-name")
                .ok_or_else(|| Error::InvalidArgument("need --type-addr or --type-name".into()))?;
            session.env.get_type(name)?
        }
        raw => MappedAddr::new(raw),
    };
    let count_only = args.get_flag("count");

    let (count, results) =
        find_all_objects(&session.env, session.max_threads, type_addr, count_only, args)?;
    for (_, repr) in &results {
        println!("{repr}");
    }
    eprintln!("{CLEAR_LINE}{count} objects found");
    Ok(())
}

/// Every valid object whose direct referents include `target`.
pub fn find_references(
    env: &Environment,
    max_threads: usize,
    target: MappedAddr,
    repr_args: &Args,
) -> Result<Vec<(MappedAddr<PyObj>, String)>> {
    let opts = ReprOptions::from_args(repr_args)?;
    let results: Mutex<Vec<(MappedAddr<PyObj>, String)>> = Mutex::new(Vec::new());

    scan(&env.store, ObjHeader::SIZE, 8, max_threads, |_, addr, _| {
        if env.invalid_reason(addr).is_some() {
            return;
        }
        // Referent extraction can still fail when a downstream object the
        // walk depends on is implausible.
        let referents = match env.direct_referents(addr) {
            Ok(referents) => referents,
            Err(_) => return,
        };
        if !referents.contains(&target) {
            return;
        }
        let mut t = Traversal::with_options(env, &opts);
        let repr = t.repr(addr);
        if !t.is_valid {
            return;
        }
        results.lock().unwrap().push((addr.cast(), repr));
    })?;

    let mut results = results.into_inner().unwrap();
    results.sort_by_key(|(addr, _)| *addr);
    Ok(results)
}

pub fn cmd_find_references(session: &mut Session, args: &Args) -> Result<()> {
    let target = session.parse_addr(
        args.require_pos(1, "ADDRESS")?,
        args.get_flag("bswap"),
    )?;
    let results = find_references(&session.env, session.max_threads, target, args)?;
    for (_, repr) in &results {
        println!("{repr}");
    }
    eprintln!("{CLEAR_LINE}{} objects found", results.len());
    Ok(())
}

/// All module objects whose dict `__name__` equals `module_name`.
pub fn find_module(
    env: &Environment,
    max_threads: usize,
    module_name: &str,
    repr_args: &Args,
) -> Result<Vec<(MappedAddr<PyObj>, String)>> {
    let module_type = env.get_type("module")?;
    let opts = ReprOptions::from_args(repr_args)?;
    let results: Mutex<Vec<(MappedAddr<PyObj>, String)>> = Mutex::new(Vec::new());

    scan(&env.store, ObjHeader::SIZE, 8, max_threads, |window, addr, _| {
        let header = ObjHeader::parse(window);
        if header.ob_type != module_type || env.invalid_reason(addr).is_some() {
            return;
        }
        let Ok(module) = PyModuleObject::read(env, addr.cast()) else {
            return;
        };
        match module.name(env) {
            Ok(Some(name)) if name == module_name => {}
            _ => return,
        }
        let mut t = Traversal::with_options(env, &opts);
        let repr = t.repr(addr);
        if !t.is_valid {
            return;
        }
        results.lock().unwrap().push((addr.cast(), repr));
    })?;

    let mut results = results.into_inner().unwrap();
    results.sort_by_key(|(addr, _)| *addr);
    Ok(results)
}

pub fn cmd_find_module(session: &mut Session, args: &Args) -> Result<()> {
    let name = args.require_pos(1, "NAME")?;
    let results = find_module(&session.env, session.max_threads, name, args)?;
    for (_, repr) in &results {
        println!("{repr}");
    }
    eprintln!("{CLEAR_LINE}{} modules found", results.len());
    Ok(())
}
