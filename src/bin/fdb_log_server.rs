// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! `fdb_log_server`: binds `org.fdbus.log-server` and writes every incoming
//! [`fdbus::logger::LogEntry`] to stdout or a file (spec.md §4.7 "Logging",
//! §6 CLI surface). The distilled spec's `-q -p -b -s -f -c -e -n -m -l -d
//! -t -M -j -x -a` filtering flags govern the message/trace log multiplexer
//! this core treats as an external collaborator (spec.md §1 "Out of
//! scope": "the log viewer/server CLIs beyond the message codes they
//! define"); this binary implements the one thing the core does own, the
//! log-line transport itself.

use clap::Parser;

use fdbus::config::{BusConfig, LogServerArgs};
use fdbus::global::{DEFAULT_NS_IPC_PATH, FDB_LOG_SERVER_NAME};
use fdbus::logger::LogServer;
use fdbus::object::ObjectFlags;
use fdbus::{EndpointRole, Runtime};

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = LogServerArgs::parse();
    let _config = BusConfig::load(&args.config)?;

    let runtime = Runtime::start()?;
    let endpoint = runtime
        .create_endpoint(FDB_LOG_SERVER_NAME, EndpointRole::Server)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let server = LogServer::new(args.output.as_deref())?;
    endpoint
        .set_main_object(Box::new(server), ObjectFlags::empty())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    endpoint
        .bind("ipc:///tmp/fdb-ipc-log-server")
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    log::info!("fdb_log_server listening at ipc:///tmp/fdb-ipc-log-server (name server at {DEFAULT_NS_IPC_PATH})");

    loop {
        std::thread::park();
    }
}
