//! The await graph: which task/future is waiting on which.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;

use crate::addr::MappedAddr;
use crate::args::Args;
use crate::catalog::Environment;
use crate::error::Result;
use crate::objects::{
    ObjHeader, PyGatheringFutureObject, PyObj, PyTaskObject,
};
use crate::scan::scan;
use crate::traverse::{ReprOptions, Traversal};
use crate::CLEAR_LINE;

use super::Session;

/// One rendered graph line: indentation depth and text.
pub type GraphLine = (usize, String);

/// Collect await edges and render one tree per root.
///
/// Edges: a task awaits its `task_fut_waiter`; a gathering future awaits
/// each child; a plain future awaits nothing. Roots are nodes that nothing
/// awaits. Revisited nodes render as `<!seen>@ADDR` and are not expanded,
/// which is how await cycles surface.
pub fn async_task_graph(
    env: &Environment,
    max_threads: usize,
    repr_args: &Args,
) -> Result<Vec<Vec<GraphLine>>> {
    let task_type = env.get_type("_asyncio.Task")?;
    let future_type = env.get_type("_asyncio.Future")?;
    let gathering_type = env.get_type("_GatheringFuture")?;
    eprintln!(
        "Looking for objects of types {task_type} (Task), {future_type} (Future), and {gathering_type} (GatheringFuture)"
    );

    let await_targets = {
        let targets: Mutex<BTreeMap<MappedAddr<PyObj>, BTreeSet<MappedAddr<PyObj>>>> =
            Mutex::new(BTreeMap::new());
        scan(&env.store, ObjHeader::SIZE, 8, max_threads, |window, addr, _| {
            let header = ObjHeader::parse(window);
            let is_task = header.ob_type == task_type;
            let is_future = header.ob_type == future_type;
            let is_gathering = header.ob_type == gathering_type;
            if !is_task && !is_future && !is_gathering {
                return;
            }
            if env.invalid_reason(addr).is_some() {
                return;
            }
            let addr: MappedAddr<PyObj> = addr.cast();

            if is_task {
                let Ok(task) = PyTaskObject::read(env, addr) else {
                    return;
                };
                let mut targets = targets.lock().unwrap();
                eprintln!("{CLEAR_LINE}... {addr} task awaits {}", task.task_fut_waiter);
                targets.entry(addr).or_default().insert(task.task_fut_waiter);
            } else if is_future {
                let mut targets = targets.lock().unwrap();
                eprintln!("{CLEAR_LINE}... {addr} future");
                targets.entry(addr).or_default();
            } else {
                let Ok(gathering) = PyGatheringFutureObject::read(env, addr) else {
                    return;
                };
                let mut targets = targets.lock().unwrap();
                let entry = targets.entry(addr).or_default();
                match gathering.children_addrs(env) {
                    Ok(children) => {
                        for child in children {
                            eprintln!("{CLEAR_LINE}... {addr} gather awaits {child}");
                            entry.insert(child);
                        }
                    }
                    Err(e) => {
                        eprintln!("{CLEAR_LINE}... {addr} gather missing children ({e})");
                    }
                }
            }
        })?;
        targets.into_inner().unwrap()
    };

    // Roots: never the await target of any other node.
    let mut roots: BTreeSet<MappedAddr<PyObj>> = await_targets.keys().copied().collect();
    for targets in await_targets.values() {
        for target in targets {
            roots.remove(target);
        }
    }

    let opts = ReprOptions::from_args(repr_args)?;
    let mut trees = Vec::new();
    let mut emitted: HashSet<MappedAddr<PyObj>> = HashSet::new();
    let emit_tree = |root: MappedAddr<PyObj>,
                     emitted: &mut HashSet<MappedAddr<PyObj>>|
     -> Vec<GraphLine> {
        let mut t = Traversal::with_options(env, &opts);
        t.is_short = true;
        let mut seen = HashSet::new();
        let mut lines = Vec::new();
        print_entry(&mut t, &await_targets, root, 0, &mut seen, &mut lines);
        emitted.extend(seen);
        lines
    };
    for root in roots {
        trees.push(emit_tree(root, &mut emitted));
    }
    // Await cycles have no natural root; print each leftover cycle from its
    // lowest-addressed member so it still surfaces.
    while let Some(root) = await_targets
        .keys()
        .find(|addr| !emitted.contains(*addr))
        .copied()
    {
        trees.push(emit_tree(root, &mut emitted));
    }
    Ok(trees)
}

fn print_entry(
    t: &mut Traversal,
    await_targets: &BTreeMap<MappedAddr<PyObj>, BTreeSet<MappedAddr<PyObj>>>,
    addr: MappedAddr<PyObj>,
    depth: usize,
    seen: &mut HashSet<MappedAddr<PyObj>>,
    lines: &mut Vec<GraphLine>,
) {
    if addr.is_null() {
        return;
    }
    let already_seen = !seen.insert(addr);
    let text = if already_seen {
        format!("<!seen>@{addr}")
    } else {
        t.repr(addr)
    };
    lines.push((depth, text));
    if already_seen {
        return;
    }

    let Some(targets) = await_targets.get(&addr) else {
        lines.push((depth, format!("Warning: await target {addr} missing from graph")));
        return;
    };
    for target in targets {
        print_entry(t, await_targets, *target, depth + 1, seen, lines);
    }
}

pub fn cmd_async_task_graph(session: &mut Session, args: &Args) -> Result<()> {
    let trees = async_task_graph(&session.env, session.max_threads, args)?;
    for tree in trees {
        for (depth, text) in tree {
            println!("{}{text}", "  ".repeat(depth));
        }
    }
    Ok(())
}
