// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! `fdb_host_server`: binds the well-known host-server address (spec.md §6)
//! and serves `HostServer` (host_server.rs), federating every name server
//! that registers with it.

use std::time::Duration;

use clap::Parser;

use fdbus::config::{BusConfig, HostServerArgs};
use fdbus::host_server::HostServer;
use fdbus::object::ObjectFlags;
use fdbus::{EndpointRole, Runtime};

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = HostServerArgs::parse();
    let _config = BusConfig::load(&args.config)?;

    let runtime = Runtime::start()?;
    let endpoint = runtime
        .create_endpoint("fdb_host_server", EndpointRole::HostServer)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let heartbeat_interval = Duration::from_millis(args.heartbeat_interval_ms);
    let host_server = HostServer::new(endpoint.clone(), heartbeat_interval, args.heartbeat_retries);
    endpoint
        .set_main_object(Box::new(host_server), ObjectFlags::empty())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    endpoint
        .bind(format!("ipc://{}", args.ipc_path))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    endpoint
        .bind(format!("tcp://0.0.0.0:{}", args.tcp_port))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    log::info!(
        "fdb_host_server listening at ipc://{} and tcp://0.0.0.0:{}",
        args.ipc_path,
        args.tcp_port
    );

    loop {
        std::thread::park();
    }
}
