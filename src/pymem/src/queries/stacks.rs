//! Thread-state discovery and stack reconstruction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::addr::MappedAddr;
use crate::args::Args;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{PyFrame, PyFrameObject, PyThread, PyThreadState};
use crate::scan::scan;
use crate::traverse::{ReprOptions, Traversal};
use crate::CLEAR_LINE;

use super::Session;

/// Scan for plausible thread states; returns (address, repr) sorted by
/// address.
pub fn find_all_threads(
    env: &Environment,
    max_threads: usize,
    repr_args: &Args,
) -> Result<Vec<(MappedAddr<PyThread>, String)>> {
    let opts = ReprOptions::from_args(repr_args)?;
    let results: Mutex<Vec<(MappedAddr<PyThread>, String)>> = Mutex::new(Vec::new());

    scan(
        &env.store,
        PyThreadState::SIZE,
        8,
        max_threads,
        |window, addr, _| {
            let ts = PyThreadState::parse(window);
            if ts.invalid_reason(env).is_some() {
                return;
            }
            let mut t = Traversal::with_options(env, &opts);
            let repr = ts.repr(&mut t, addr.cast());
            if !t.is_valid {
                return;
            }
            results.lock().unwrap().push((addr.cast(), repr));
        },
    )?;

    let mut results = results.into_inner().unwrap();
    results.sort_by_key(|(addr, _)| *addr);
    Ok(results)
}

pub fn cmd_find_all_threads(session: &mut Session, args: &Args) -> Result<()> {
    let results = find_all_threads(&session.env, session.max_threads, args)?;
    for (_, repr) in &results {
        eprintln!("{CLEAR_LINE}{repr}");
    }
    Ok(())
}

/// One reconstructed call stack, most recent frame first.
#[derive(Debug)]
pub struct Stack {
    pub frames: Vec<(MappedAddr<PyFrame>, String)>,
    /// Set when a frame's back link leaves the collected frame set; the
    /// walk stops there.
    pub broken_back: Option<MappedAddr<PyFrame>>,
}

/// Collect the frame graph and organize it into stacks.
///
/// Only running (EXECUTING) frames participate by default; with
/// `include_runnable`, suspended frames join as additional roots and links
/// (running frames are never dropped). Roots are frames that no collected
/// frame names as its `f_back`.
pub fn find_all_stacks(
    env: &Environment,
    max_threads: usize,
    include_runnable: bool,
    repr_args: &Args,
) -> Result<Vec<Stack>> {
    let frame_type = env.get_type("frame")?;

    let back_for_frame = {
        let collected: Mutex<BTreeMap<MappedAddr<PyFrame>, MappedAddr<PyFrame>>> =
            Mutex::new(BTreeMap::new());
        scan(
            &env.store,
            PyFrameObject::SIZE,
            8,
            max_threads,
            |window, addr, _| {
                let frame = PyFrameObject::parse(window);
                if frame.header.ob_type != frame_type {
                    return;
                }
                let addr: MappedAddr<PyFrame> = addr.cast();
                if frame.invalid_reason(env, addr).is_some() {
                    return;
                }
                let include = if include_runnable {
                    frame.is_runnable_or_running()
                } else {
                    frame.is_running()
                };
                if !include {
                    return;
                }
                let mut collected = collected.lock().unwrap();
                eprintln!(
                    "{CLEAR_LINE}... {addr} {} from {} ({} frames collected)",
                    frame.state_name(),
                    frame.f_back,
                    collected.len() + 1
                );
                collected.insert(addr, frame.f_back);
            },
        )?;
        collected.into_inner().unwrap()
    };

    // Roots are frames that are not the f_back of any collected frame.
    let mut roots: BTreeSet<MappedAddr<PyFrame>> = back_for_frame.keys().copied().collect();
    for back in back_for_frame.values() {
        roots.remove(back);
    }

    let opts = ReprOptions::from_args(repr_args)?;
    let mut stacks = Vec::new();
    for root in roots {
        let mut t = Traversal::with_options(env, &opts);
        t.frame_omit_back = true;
        t.is_short = true;
        t.recursion_depth = 1;

        let mut stack = Stack {
            frames: Vec::new(),
            broken_back: None,
        };
        let mut addr = root;
        while !addr.is_null() {
            stack.frames.push((addr, t.repr(addr)));
            match back_for_frame.get(&addr) {
                Some(back) => addr = *back,
                None => {
                    stack.broken_back = Some(addr);
                    break;
                }
            }
        }
        stacks.push(stack);
    }
    Ok(stacks)
}

pub fn cmd_find_all_stacks(session: &mut Session, args: &Args) -> Result<()> {
    let include_runnable = args.get_flag("include-runnable");
    let stacks = find_all_stacks(&session.env, session.max_threads, include_runnable, args)?;

    eprintln!("{CLEAR_LINE}");
    for stack in stacks {
        println!("Traceback (most recent call FIRST):");
        for (_, repr) in &stack.frames {
            println!("  {repr}");
        }
        if let Some(addr) = stack.broken_back {
            println!(
                "  <warning: frame points to f_back=@{addr} which is missing from the found frame list>"
            );
        }
    }
    Ok(())
}
