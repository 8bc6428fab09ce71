/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # taskstored
//!
//! The RESP2 key/value server binary. `--config <path>` picks the config
//! file (default `conf/mcs.conf`); `SIGINT`/`SIGTERM` trigger graceful
//! shutdown: stop accepting, drain in-flight connections, write one final
//! snapshot, exit 0.

use {
    std::{
        path::PathBuf,
        process,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
    taskstored::{aof, command, config, net, snapshot, store},
};

#[cfg(all(not(target_env = "msvc"), not(miri)))]
use jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), not(miri)))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() {
    env_logger::Builder::new()
        .parse_filters(&std::env::var("TASKSTORE_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();

    println!("taskstored v{} | {}", libcommon::VERSION, libcommon::URL);

    let config_path = parse_config_path();
    let cfg = match config::Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            log::warn!("could not read config file '{}' ({e}); using defaults", config_path.display());
            config::Config::default()
        }
    };

    let data_store = store::DataStore::new(store::DEFAULT_DB_COUNT);

    if cfg.snapshot_path.exists() {
        match snapshot::load_mcdb(&data_store, &cfg.snapshot_path) {
            Ok(()) => log::info!("loaded snapshot from {}", cfg.snapshot_path.display()),
            Err(e) => log::error!("failed to load snapshot '{}': {e}", cfg.snapshot_path.display()),
        }
    }

    let handler = Arc::new(command::CommandHandler::new(Arc::clone(&data_store), cfg.requirepass.clone()));
    handler.set_snapshot_path(cfg.snapshot_path.clone());

    let _aof_writer = cfg.appendonly.then(|| setup_aof(&cfg, &data_store, &handler)).flatten();

    let mut save_conditions = cfg.save_conditions.clone();
    if cfg.save_immediate {
        save_conditions.push(snapshot::SaveCondition { seconds: 0, changes: 1 });
    }
    let scheduler = (!save_conditions.is_empty())
        .then(|| snapshot::SnapshotScheduler::start(Arc::clone(&data_store), cfg.snapshot_path.clone(), save_conditions));

    let addr = match cfg.socket_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!("invalid bind configuration: {e}");
            process::exit(1);
        }
    };
    let server = match net::TcpServer::bind(addr, Arc::clone(&handler)) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to bind {addr}: {e}");
            process::exit(1);
        }
    };
    log::info!("taskstored listening on {addr}");

    let stop = server.stop_flag();
    spawn_shutdown_watcher(stop);

    server.run();

    match snapshot::save_mcdb(&data_store, &cfg.snapshot_path) {
        Ok(()) => log::info!("final snapshot written to {}", cfg.snapshot_path.display()),
        Err(e) => log::error!("final snapshot failed: {e}"),
    }
    if let Some(scheduler) = scheduler {
        scheduler.stop();
    }
    data_store.shutdown();
    log::info!("taskstored stopped");
}

fn setup_aof(cfg: &config::Config, data_store: &Arc<store::DataStore>, handler: &command::CommandHandler) -> Option<Arc<aof::AofWriter>> {
    handler.set_aof_path(cfg.appendfilename.clone());
    if cfg.appendfilename.exists() {
        let replayed_cleanly = aof::replay(&cfg.appendfilename, data_store, handler);
        log::info!(
            "AOF replay {}",
            if replayed_cleanly { "completed" } else { "ended early (partial tail or malformed entry)" }
        );
    }
    match aof::AofWriter::open(&cfg.appendfilename) {
        Ok(writer) => {
            let writer = Arc::new(writer);
            let sink = Arc::clone(&writer);
            data_store.set_apply_callback(move |raw| {
                if let Err(e) = sink.append(raw) {
                    log::error!("AOF append failed: {e}");
                }
            });
            Some(writer)
        }
        Err(e) => {
            log::error!("failed to open AOF file '{}': {e}", cfg.appendfilename.display());
            None
        }
    }
}

/// Registers `SIGINT`/`SIGTERM` via `signal-hook` and, once either fires,
/// flips the server's stop flag so the accept loop drains and returns.
fn spawn_shutdown_watcher(stop: Arc<AtomicBool>) {
    let term_received = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&term_received)) {
            log::warn!("failed to register handler for signal {signal}: {e}");
        }
    }
    thread::spawn(move || {
        while !term_received.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(200));
        }
        log::info!("shutdown signal received, draining connections");
        stop.store(true, Ordering::Release);
    });
}

fn parse_config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
            log::error!("--config requires a path argument");
            process::exit(1);
        }
    }
    PathBuf::from("conf/mcs.conf")
}
