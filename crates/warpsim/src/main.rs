//! warpsim - run a debugger scenario against the simulated accelerator
//!
//! Usage:
//!   warpsim <scenario.scn>
//!
//! Set `RUST_LOG` to see session output as it happens and `DEBUG` to enable
//! component traces.

use std::env;
use std::fs;
use std::process;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(path) = args.get(1) else {
        eprintln!("Usage: warpsim <scenario.scn>");
        process::exit(1);
    };

    let script = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path, e);
            process::exit(1);
        }
    };

    match warpsim::run_commands(&script) {
        Ok(output) => {
            for line in output {
                println!("{}", line);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", path, e);
            process::exit(1);
        }
    }
}
