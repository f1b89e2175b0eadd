//! Catalog bootstrap scans: find-base-type and find-all-types.

use std::sync::Mutex;

use crate::addr::MappedAddr;
use crate::catalog::{Environment, InsertOutcome};
use crate::error::Result;
use crate::objects::{PyType, PyTypeObject};
use crate::scan::scan;
use crate::CLEAR_LINE;

/// Scan for the unique self-typed type object named `"type"` and persist it
/// as the catalog's base type. Zero or multiple candidates leave the
/// catalog untouched.
pub fn find_base_type(env: &mut Environment, max_threads: usize) -> Result<()> {
    let candidates = {
        let env: &Environment = env;
        let candidates: Mutex<Vec<MappedAddr<PyType>>> = Mutex::new(Vec::new());
        scan(
            &env.store,
            PyTypeObject::SIZE,
            8,
            max_threads,
            |window, addr, _| {
                let ty = PyTypeObject::parse(window);
                if ty.header.ob_type != addr.cast() || ty.invalid_reason(env).is_some() {
                    return;
                }
                if !matches!(ty.name(env).as_deref(), Ok("type")) {
                    return;
                }
                let mut candidates = candidates.lock().unwrap();
                eprintln!("{CLEAR_LINE}Base type candidate found at {addr}");
                candidates.push(addr.cast());
            },
        )?;
        candidates.into_inner().unwrap()
    };
    eprintln!();

    if candidates.len() == 1 {
        env.base_type = candidates[0];
        env.save_analysis()?;
    } else {
        eprintln!(
            "Found {} base type candidates; expected exactly one",
            candidates.len()
        );
    }
    Ok(())
}

/// Scan for every object whose `ob_type` is the base type and rebuild the
/// name catalog, disambiguating duplicate names.
pub fn find_all_types(env: &mut Environment, max_threads: usize) -> Result<()> {
    if env.base_type.is_null() {
        return Err(crate::error::Error::BaseTypeMissing);
    }

    let found = {
        let env: &Environment = env;
        let found: Mutex<Vec<(String, MappedAddr<PyType>)>> = Mutex::new(Vec::new());
        scan(
            &env.store,
            PyTypeObject::SIZE,
            8,
            max_threads,
            |window, addr, _| {
                let ty = PyTypeObject::parse(window);
                if ty.header.ob_type != env.base_type || ty.invalid_reason(env).is_some() {
                    return;
                }
                let Ok(name) = ty.name(env) else {
                    return;
                };
                let mut found = found.lock().unwrap();
                eprintln!("{CLEAR_LINE}Found <type {name}> at {addr}\x1b[K");
                found.push((name, addr.cast()));
            },
        )?;
        found.into_inner().unwrap()
    };
    eprintln!();

    // Scan order is nondeterministic; sort so collision keys are stable.
    let mut found = found;
    found.sort();

    env.clear_types();
    let mut any_changes = false;
    for (name, addr) in found {
        match env.insert_type(&name, addr) {
            InsertOutcome::New => any_changes = true,
            InsertOutcome::AlreadyKnown => {}
            InsertOutcome::Collision(existing) => {
                any_changes = true;
                eprintln!(
                    "Warning: found <type {name}> at {addr}, but it already exists at {existing}"
                );
            }
        }
    }
    if any_changes {
        env.save_analysis()?;
    }
    Ok(())
}

pub fn cmd_show_analysis_data(env: &Environment) {
    eprintln!("Base type object at {}", env.base_type);
    for (name, addr) in &env.types_by_name {
        eprintln!("Type object {name} at {addr}");
    }
    eprintln!("{} non-base type objects overall", env.types_by_name.len());
}
