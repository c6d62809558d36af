// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane daemon: wires the lifecycle engine to its collaborators
//! and serves line-delimited JSON requests on a unix socket.

mod logger;

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Arg, Command};
use log::{info, warn, LevelFilter};

use domctl::builder_helper::HelperProcess;
use domctl::config::DaemonConfig;
use domctl::devices::dm::ProcessSupervisor;
use domctl::events::EventThread;
use domctl::lifecycle::Engine;
use domctl::memory_broker::{CachedBroker, SocketBroker};
use domctl::rpc_interface::{Dispatcher, Request, Response};
use domctl::storage::SocketStorage;
use domctl::store::{MemStore, Store};
use domctl::updates::UpdateBus;
use domctl::utilities::SimHypervisor;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
enum DaemonError {
    /// I/O failure: {0}
    Io(#[from] std::io::Error),
    /// Bad configuration: {0}
    Config(String),
    /// Engine failure: {0}
    Engine(#[from] domctl::Error),
}

#[allow(clippy::exit)]
fn main() {
    if let Err(e) = run() {
        eprintln!("domaind: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), DaemonError> {
    let matches = Command::new("domaind")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Creates, builds, suspends, resumes and destroys guest domains.")
        .arg(
            Arg::new("config-file")
                .long("config-file")
                .value_name("PATH")
                .required(true)
                .help("JSON daemon configuration"),
        )
        .arg(
            Arg::new("api-sock")
                .long("api-sock")
                .value_name("PATH")
                .default_value("/run/domctl/api.sock")
                .help("Unix socket to serve requests on"),
        )
        .arg(
            Arg::new("id")
                .long("id")
                .default_value(logger::DEFAULT_INSTANCE_ID)
                .help("Instance id used as the log prefix"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .help("error|warn|info|debug|trace"),
        )
        .arg(
            Arg::new("log-path")
                .long("log-path")
                .value_name("PATH")
                .help("Log file; stderr when absent"),
        )
        .get_matches();

    let level = matches
        .get_one::<String>("log-level")
        .and_then(|l| LevelFilter::from_str(l).ok())
        .ok_or_else(|| DaemonError::Config("unknown log level".into()))?;
    let instance_id = matches.get_one::<String>("id").expect("defaulted");
    logger::init(
        instance_id,
        level,
        matches.get_one::<String>("log-path").map(Path::new),
    )?;

    let config_path = matches.get_one::<String>("config-file").expect("required");
    let cfg: DaemonConfig = serde_json::from_slice(&fs::read(config_path)?)
        .map_err(|e| DaemonError::Config(format!("{}: {}", config_path, e)))?;
    info!("starting with state root {}", cfg.state_root.display());

    // The tree and the hypervisor binding are embedded; broker, storage,
    // builder and device model are reached at their configured endpoints.
    let mem_store = Arc::new(MemStore::new());
    let store: Arc<dyn Store> = mem_store.clone();
    let hv = Arc::new(SimHypervisor::new());
    hv.attach_store(mem_store);
    warn!("no privileged hypervisor binding configured, using the embedded development host");

    let broker = Arc::new(CachedBroker::new(Arc::new(SocketBroker::new(
        cfg.broker_socket.clone(),
    ))));
    let storage = Arc::new(SocketStorage::new(cfg.storage_socket.clone()));
    let builder = Arc::new(HelperProcess::new(
        cfg.helper_binary.clone(),
        cfg.ctrl_path.clone(),
    ));
    let dm = Arc::new(ProcessSupervisor::new(
        store.clone(),
        cfg.model_binary.clone(),
        cfg.state_root.join("device-model"),
        cfg.dm_ack_timeout(),
    ));
    let updates = Arc::new(UpdateBus::new());

    let queue_capacity = cfg.queue_capacity;
    let engine = Arc::new(Engine::new(
        cfg,
        store.clone(),
        hv.clone(),
        broker,
        storage,
        builder,
        dm,
        updates,
    )?);
    let _events = EventThread::spawn(store, hv, engine.updates().clone())?;
    let dispatcher = Arc::new(Dispatcher::new(engine, queue_capacity));

    let api_sock = matches.get_one::<String>("api-sock").expect("defaulted");
    serve(Path::new(api_sock), dispatcher)
}

fn serve(path: &Path, dispatcher: Arc<Dispatcher>) -> Result<(), DaemonError> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    info!("serving requests on {}", path.display());

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("failed to accept a connection: {}", e);
                continue;
            }
        };
        let dispatcher = dispatcher.clone();
        std::thread::Builder::new()
            .name("api-conn".into())
            .spawn(move || {
                if let Err(e) = handle_connection(stream, &dispatcher) {
                    warn!("connection ended with error: {}", e);
                }
            })?;
    }
    Ok(())
}

fn handle_connection(stream: UnixStream, dispatcher: &Dispatcher) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    for line in BufReader::new(stream).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatcher.handle(request),
            Err(e) => Response::Failure(domctl::Error::InternalError(format!(
                "unparseable request: {}",
                e
            ))),
        };
        let encoded = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"failure":"IoError"}"#.to_string());
        writeln!(writer, "{}", encoded)?;
    }
    Ok(())
}
