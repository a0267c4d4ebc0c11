// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! `fdb_log_client`: a one-shot CLI that sends a single log line to
//! `org.fdbus.log-server` and exits, mostly useful from shell scripts
//! (spec.md §6 CLI surface).

use std::thread;
use std::time::Duration;

use clap::Parser;

use fdbus::config::{BusConfig, LogClientArgs};
use fdbus::logger::LogClient;
use fdbus::Runtime;

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = LogClientArgs::parse();
    let _config = BusConfig::load(&args.config)?;

    let runtime = Runtime::start()?;
    let client = LogClient::connect(&runtime, "ipc:///tmp/fdb-ipc-log-server", args.tag)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    if client.wait_ready(2000).is_err() {
        eprintln!("fdb_log_client: log server not reachable");
        std::process::exit(1);
    }
    client
        .log(log::Level::Info, args.message.clone())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    thread::sleep(Duration::from_millis(50));
    Ok(())
}
