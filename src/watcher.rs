use log::{error, info, warn};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::plan::InterruptMessage;
use crate::queue::{CommandQueue, QueueMessage};

pub const INTERRUPT_FILE: &str = "message_interrupt.json";
pub const SETTINGS_FLAG: &str = "new_measure_settings_flag";
pub const METADATA_FLAG: &str = "new_metadata_flag";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Claim and decode `message_interrupt.json` if present. Both the watcher
/// task and the scheduler's between-pop scan call this; the rename is the
/// arbitration, so whoever renames first owns the file and the other sees
/// nothing. Undecodable elements are dropped with a log line rather than
/// blocking the rest of the batch.
pub fn claim_interrupts(metadata_dir: &Path) -> Option<Vec<QueueMessage>> {
    let path = metadata_dir.join(INTERRUPT_FILE);
    let claim = metadata_dir.join(format!("{INTERRUPT_FILE}.consuming"));
    fs::rename(&path, &claim).ok()?;
    let parsed: Result<Vec<InterruptMessage>, _> = fs::read_to_string(&claim)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()));
    if let Err(e) = fs::remove_file(&claim) {
        warn!(target: "watcher", "could not remove consumed interrupt file: {e}");
    }
    match parsed {
        Ok(messages) => Some(
            messages
                .into_iter()
                .filter_map(|m| {
                    let sensor = m.sensor_id;
                    m.into_queue_message()
                        .map_err(|e| {
                            error!(target: "watcher", "bad interrupt for {sensor}: {e}")
                        })
                        .ok()
                })
                .collect(),
        ),
        Err(e) => {
            error!(target: "watcher", "unreadable interrupt file: {e}");
            Some(Vec::new())
        }
    }
}

/// Poll the metadata directory and push interrupt messages to the queue
/// front. Front-pushing each element in order means the last file element
/// runs first; operator tooling writes them accordingly.
pub async fn watch_interrupts(
    metadata_dir: impl AsRef<Path>,
    queue: Arc<CommandQueue>,
    shutdown: Arc<AtomicBool>,
) {
    let metadata_dir = metadata_dir.as_ref();
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if let Some(messages) = claim_interrupts(metadata_dir) {
            for message in messages {
                info!(
                    target: "watcher",
                    "interrupt {:?} for {} queued ahead", message.command, message.target
                );
                queue.push_front(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SensorId;
    use crate::queue::Command;

    #[test]
    fn claim_consumes_the_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INTERRUPT_FILE);
        fs::write(
            &path,
            r#"[{"sensor_id": 9, "measurement_settings": {"type": "probe"}}]"#,
        )
        .unwrap();

        let messages = claim_interrupts(dir.path()).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].target, SensorId(9));
        assert_eq!(
            messages[0].command,
            Command::Probe {
                calibrate_after: false
            }
        );
        assert!(!path.exists());
        // a second scan finds nothing
        assert!(claim_interrupts(dir.path()).is_none());
    }

    #[test]
    fn malformed_file_is_consumed_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(INTERRUPT_FILE), "not json").unwrap();
        let messages = claim_interrupts(dir.path()).unwrap();
        assert!(messages.is_empty());
        assert!(!dir.path().join(INTERRUPT_FILE).exists());
    }
}
