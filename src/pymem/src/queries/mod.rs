//! Shell-facing query operations and command dispatch.
//!
//! Each command is a pure function over (catalog, snapshot, options): the
//! heavy lifting lives in core functions that return collected results so
//! they can be tested directly; the command wrappers print. The registry is
//! built once at session start and handed to the shell.

pub mod asyncio_graph;
pub mod catalog_build;
pub mod objects;
pub mod raw;
pub mod stacks;
pub mod strings_agg;

use crate::addr::MappedAddr;
use crate::args::{parse_hex, Args};
use crate::catalog::Environment;
use crate::error::{Error, Result};
use crate::scan;

/// One shell command: name, help text, and handler.
pub struct Command {
    pub name: &'static str,
    pub help: &'static str,
    pub run: fn(&mut Session, &Args) -> Result<()>,
}

/// Interactive session state shared by every command.
pub struct Session {
    pub env: Environment,
    pub max_threads: usize,
    pub should_exit: bool,
}

impl Session {
    pub fn new(env: Environment, max_threads: usize) -> Session {
        Session {
            env,
            max_threads: if max_threads == 0 {
                scan::default_threads()
            } else {
                max_threads
            },
            should_exit: false,
        }
    }

    /// Bootstrap the catalog when it is empty: discover the base type, then
    /// every other type object.
    pub fn prepare(&mut self) -> Result<()> {
        if self.env.base_type.is_null() {
            eprintln!("Base type object not present in analysis data; looking for it");
            catalog_build::find_base_type(&mut self.env, self.max_threads)?;
        }
        if self.env.base_type.is_null() {
            eprintln!("Failed to find exactly one base type object; cannot proceed with analysis");
        } else if self.env.types_by_name.is_empty() {
            eprintln!("No type objects are present in analysis data; looking for them");
            catalog_build::find_all_types(&mut self.env, self.max_threads)?;
        }
        Ok(())
    }

    /// Parse a hex address argument, optionally byte-swapped.
    pub fn parse_addr<T: ?Sized>(&self, text: &str, bswap: bool) -> Result<MappedAddr<T>> {
        let raw = parse_hex(text)
            .ok_or_else(|| Error::InvalidArgument(format!("bad address {text:?}")))?;
        Ok(MappedAddr::new(if bswap { raw.swap_bytes() } else { raw }))
    }
}

/// The command registry, in help-listing order.
pub fn registry() -> &'static [Command] {
    &COMMANDS
}

static COMMANDS: [Command; 17] = [
    Command {
        name: "help",
        help: "  help\n    You're reading it now.\n",
        run: |_, _| {
            println!("Commands:");
            for command in registry() {
                print!("{}", command.help);
            }
            Ok(())
        },
    },
    Command {
        name: "exit",
        help: "  exit\n    Ends this session.\n",
        run: |session, _| {
            session.should_exit = true;
            Ok(())
        },
    },
    Command {
        name: "regions",
        help: "  regions\n    Lists all memory regions in the current memory snapshot.\n",
        run: raw::cmd_regions,
    },
    Command {
        name: "show-analysis-data",
        help: "  show-analysis-data\n    Shows the saved analysis data for this snapshot.\n",
        run: |session, _| {
            catalog_build::cmd_show_analysis_data(&session.env);
            Ok(())
        },
    },
    Command {
        name: "find-base-type",
        help: "  find-base-type\n    Scans for the self-typed base type object and saves it.\n",
        run: |session, _| catalog_build::find_base_type(&mut session.env, session.max_threads),
    },
    Command {
        name: "find-all-types",
        help: "  find-all-types\n    Scans for all type objects and saves the catalog.\n",
        run: |session, _| catalog_build::find_all_types(&mut session.env, session.max_threads),
    },
    Command {
        name: "find",
        help: "\
  find DATA [OPTIONS]\n\
    Searches for DATA (contiguous hex bytes) in all readable memory. Options:\n\
      --ptr: Parse DATA as a 64-bit hexadecimal integer.\n\
      --bswap: Byteswap DATA before searching (only if --ptr is also given).\n\
      --align=ALIGN: Only find DATA at addresses aligned to ALIGN bytes\n\
          (default 8 if --ptr is given, or 1 otherwise).\n\
      --count: Don't print each occurrence, just count them.\n",
        run: raw::cmd_find,
    },
    Command {
        name: "count-by-type",
        help: "  count-by-type\n    Counts the number of existing objects for each known type.\n",
        run: objects::cmd_count_by_type,
    },
    Command {
        name: "find-all-objects",
        help: "\
  find-all-objects [OPTIONS]\n\
    Finds all objects of a given type. Options:\n\
      --type-addr=ADDRESS: Find objects whose type object is at this address.\n\
      --type-name=NAME: Find objects whose type has this name.\n\
      --count: Only count the number of objects; don't print them.\n\
    The formatting options to the repr command are also valid here.\n",
        run: objects::cmd_find_all_objects,
    },
    Command {
        name: "find-references",
        help: "\
  find-references ADDRESS [OPTIONS]\n\
    Find references to the given object, from the object kinds this analyzer\n\
    decodes (types defined in native extension modules are not covered).\n",
        run: objects::cmd_find_references,
    },
    Command {
        name: "find-module",
        help: "\
  find-module NAME\n\
    Find all modules with the given name (as in the __name__ attribute). Note\n\
    that the `sys` module typically contains a dict of all other modules; to\n\
    find this, use `find-module sys`.\n",
        run: objects::cmd_find_module,
    },
    Command {
        name: "find-all-threads",
        help: "  find-all-threads\n    Finds all active thread states.\n",
        run: stacks::cmd_find_all_threads,
    },
    Command {
        name: "find-all-stacks",
        help: "\
  find-all-stacks [OPTIONS]\n\
    Generates the graph of all running frames, then organizes them into\n\
    stacks. This shows what all threads were doing at snapshot time. Options:\n\
      --include-runnable: Also use suspended frames as stack roots and links.\n\
    The formatting options to the repr command are also valid here.\n",
        run: stacks::cmd_find_all_stacks,
    },
    Command {
        name: "async-task-graph",
        help: "\
  async-task-graph\n\
    Find all async tasks and futures, and show the graph of awaiters.\n\
    The formatting options to the repr command are also valid here.\n",
        run: asyncio_graph::cmd_async_task_graph,
    },
    Command {
        name: "aggregate-strings",
        help: "\
  aggregate-strings [OPTIONS]\n\
    Find all strings and generate a log-scaled histogram of their lengths.\n\
    Options:\n\
      --bytes: Aggregate over bytes objects instead of strings.\n\
      --print-smaller-than=N: Print all strings of fewer than N bytes.\n\
      --print-larger-than=N: Print all strings of N bytes or more.\n\
    The formatting options to the repr command are also valid here.\n",
        run: strings_agg::cmd_aggregate_strings,
    },
    Command {
        name: "context",
        help: "\
  context ADDRESS [OPTIONS]\n\
    Show the contents of memory near ADDRESS. Options:\n\
      --bswap: Byteswap ADDRESS before reading data.\n\
      --size=N: Show this many bytes before and after ADDRESS (default 0x100).\n",
        run: raw::cmd_context,
    },
    Command {
        name: "repr",
        help: "\
  repr ADDRESS\n\
    Print the object at ADDRESS. If ADDRESS is preceded by one or more\n\
    asterisks, dereferences that many levels of pointers, and prints the\n\
    pointed-to object at the end of the pointer chain. Options:\n\
      --max-recursion-depth=N: Limit how deeply to print the found objects.\n\
      --max-entries=N: Limit how many items to print from each list/dict/etc.\n\
      --max-string-length=N: Limit, in bytes, how much data to print from each\n\
          str/bytes object (default 1KB).\n\
      --show-all-addresses: Show addresses for all objects, even ints/strs.\n\
      --frame-omit-back: Don't recur into f_back for frame objects.\n\
      --bytes-as-hex: Always format bytes objects as hex, even if they contain\n\
          only printable characters.\n\
      --short: Omit less-frequently-relevant fields on some objects.\n\
    All of these options are also valid for other commands that print object\n\
    representations.\n",
        run: raw::cmd_repr,
    },
];

/// Parse and run one command line. Unknown commands are reported to stderr
/// and leave the session usable.
pub fn dispatch(session: &mut Session, command: &str) -> Result<()> {
    let args = Args::parse(command);
    let Some(name) = args.get_pos(0) else {
        return Ok(());
    };
    match registry().iter().find(|c| c.name == name) {
        Some(command) => (command.run)(session, &args),
        None => {
            eprintln!("Invalid command: {name}");
            Ok(())
        }
    }
}
