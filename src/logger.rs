use log::warn;
use std::error::Error;
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// How many daily log files stay on disk.
const RETAINED_FILES: usize = 7;

/// Handle to the installed log stream. The severity filter can be swapped at
/// runtime when the configuration's `log_level` changes.
#[derive(Clone)]
pub struct LogHandle {
    reload: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    pub fn set_level(&self, level: &str) {
        match EnvFilter::try_new(level.to_lowercase()) {
            Ok(filter) => {
                if let Err(e) = self.reload.reload(filter) {
                    warn!(target: "logger", "could not apply log level {level:?}: {e}");
                }
            }
            Err(e) => warn!(target: "logger", "invalid log level {level:?}: {e}"),
        }
    }
}

/// Install the process-wide log stream: a daily-rotating file under
/// `directory` with seven retained files. `log` macro records are bridged
/// into the same stream.
pub fn init(directory: &Path, level: &str) -> Result<LogHandle, Box<dyn Error>> {
    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("plensord")
        .filename_suffix("log")
        .max_log_files(RETAINED_FILES)
        .build(directory)?;
    let filter =
        EnvFilter::try_new(level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(appender).with_ansi(false))
        .try_init()?;
    tracing::info!(target: "logger", "log stream installed under {}", directory.display());
    Ok(LogHandle { reload: handle })
}
