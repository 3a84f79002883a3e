use log::info;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use plensord::artifact::ArtifactWriter;
use plensord::logger;
use plensord::plan::PlanStore;
use plensord::queue::CommandQueue;
use plensord::scheduler::{self, Scheduler, WakeEvent};
use plensord::transport::SerialBus;
use plensord::watcher;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let metadata_dir = env_or("PLENSORD_METADATA_DIR", "/home/plense/metadata");
    let data_dir = env_or("PLENSORD_DATA_DIR", "/home/plense/plensor_data");
    let log_dir = env_or("PLENSORD_LOG_DIR", "/home/plense/error_logs");
    let serial_device = env_or("PLENSORD_SERIAL", "/dev/ttyAMA0");

    let store = PlanStore::new(&metadata_dir);
    // a missing configuration document is fatal, before the port is touched
    let document = match store.load() {
        Ok(document) => document,
        Err(e) => {
            eprintln!("plensord: cannot start: {e}");
            std::process::exit(1);
        }
    };

    let log_handle = logger::init(Path::new(&log_dir), document.log_level())?;
    info!(
        target: "plensord",
        "service starting, {} sensors configured", document.sensors.len()
    );

    let artifacts = ArtifactWriter::new(&data_dir)?;
    let bus = SerialBus::open(&serial_device)?;

    let queue = Arc::new(CommandQueue::default());
    let shutdown = Arc::new(AtomicBool::new(false));
    let (event_tx, event_rx) = mpsc::channel(8);
    let (deadline_tx, deadline_rx) =
        watch::channel(tokio::time::Instant::now() + document.interval());

    tokio::spawn(watcher::watch_interrupts(
        PathBuf::from(&metadata_dir),
        queue.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(scheduler::cadence_task(deadline_rx, event_tx.clone()));
    {
        let shutdown = shutdown.clone();
        let events = event_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!(target: "plensord", "termination signal received");
            shutdown.store(true, Ordering::Relaxed);
            let _ = events.send(WakeEvent::Shutdown).await;
        });
    }

    let scheduler = Scheduler::new(
        Box::new(bus),
        queue,
        store,
        artifacts,
        document,
        Some(log_handle),
        event_rx,
        deadline_tx,
        shutdown,
    );
    scheduler.run().await;

    info!(target: "plensord", "clean shutdown");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
