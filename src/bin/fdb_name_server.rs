// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.

//! `fdb_name_server`: binds the well-known name-server address (spec.md §6
//! "Default IPC directory"/"Default TCP ports") and serves `NameServer`
//! (name_server.rs). Optionally registers with a host server so remote
//! clients can reach it (spec.md §4.6 "Federation").

use std::time::Duration;

use clap::Parser;

use fdbus::config::{BusConfig, NameServerArgs};
use fdbus::global::OBJECT_MAIN;
use fdbus::host_proxy::HostProxy;
use fdbus::host_server::HostAddress;
use fdbus::name_server::NameServer;
use fdbus::object::ObjectFlags;
use fdbus::{EndpointRole, Runtime};

fn main() -> std::io::Result<()> {
    env_logger::init();
    let args = NameServerArgs::parse();
    let _config = BusConfig::load(&args.config)?;

    let runtime = Runtime::start()?;
    let endpoint = runtime
        .create_endpoint("fdb_name_server", EndpointRole::NameServer)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    let host_name = args.host_name.clone().unwrap_or_else(default_hostname);
    let ns = NameServer::new(endpoint.clone(), host_name.clone());
    endpoint
        .set_main_object(Box::new(ns), ObjectFlags::EVENT_CACHE_ENABLED)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    endpoint
        .bind(format!("ipc://{}", args.ipc_path))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    if args.tcp || args.host_server.is_some() {
        endpoint
            .bind(format!("tcp://0.0.0.0:{}", args.tcp_port))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    }
    log::info!("fdb_name_server listening at ipc://{} (host {host_name})", args.ipc_path);

    if let Some((interval, retries)) = args.watchdog.as_deref().and_then(parse_watchdog) {
        if let Err(e) = endpoint.enable_watchdog(OBJECT_MAIN, interval, retries) {
            log::warn!("failed to enable watchdog: {e}");
        }
    }

    // Kept alive for the process lifetime: dropping it would tear down the
    // connection to the host server.
    let mut _host_proxy = None;
    if let Some(host_server_url) = args.host_server {
        let ip_address = args.ip_list.first().cloned().unwrap_or_else(|| "0.0.0.0".to_string());
        let self_host = HostAddress {
            ip_address,
            ns_url: format!("tcp://0.0.0.0:{}", args.tcp_port),
            host_name: host_name.clone(),
        };
        match HostProxy::connect(&runtime, Some(host_server_url), self_host) {
            Ok(proxy) => {
                if proxy.wait_ready(2000).is_err() {
                    log::warn!("host server not reachable yet, will keep retrying in background");
                }
                _host_proxy = Some(proxy);
            }
            Err(e) => log::error!("failed to start host proxy: {e}"),
        }
    }

    loop {
        std::thread::park();
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Parses `-d <interval:retries>` (milliseconds, count), e.g. `1000:5`.
fn parse_watchdog(spec: &str) -> Option<(Duration, u32)> {
    let (interval, retries) = spec.split_once(':')?;
    let interval: u64 = interval.parse().ok()?;
    let retries: u32 = retries.parse().ok()?;
    Some((Duration::from_millis(interval), retries))
}
