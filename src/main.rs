mod agent;
mod cli;
mod config;
mod dedup;
mod journal;
mod logging;
mod model;
mod sampler;
mod source;
mod status;
mod storage;
#[cfg(test)]
mod testing;
mod timer;
mod watchdog;

use std::process;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
