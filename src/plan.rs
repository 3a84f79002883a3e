use derive_more::Display;
use log::{error, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::codec::SensorId;
use crate::queue::{Command, QueueMessage};
use crate::sensor::{FirmwareVariant, SweepParams, TofParams};

pub const DEFAULT_INTERVAL_S: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration document under {0}")]
    Missing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Command names as they appear in measurement sequences and interrupt
/// messages.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandName {
    #[display("BLOCK")]
    Block,
    #[display("SINE")]
    Sine,
    #[display("ENV")]
    Env,
    #[display("TOF")]
    Tof,
    #[display("TOF_BLOCK")]
    TofBlock,
}

/// Per-command parameter defaults. Overrides replace a command's settings
/// wholesale, not field by field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MeasurementSettings {
    #[serde(rename = "BLOCK", skip_serializing_if = "Option::is_none")]
    pub block: Option<SweepParams>,
    #[serde(rename = "SINE", skip_serializing_if = "Option::is_none")]
    pub sine: Option<SweepParams>,
    #[serde(rename = "TOF", skip_serializing_if = "Option::is_none")]
    pub tof: Option<TofParams>,
    #[serde(rename = "TOF_BLOCK", skip_serializing_if = "Option::is_none")]
    pub tof_block: Option<TofParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VersionSensor {
    pub sensor_id: SensorId,
    #[serde(default)]
    pub damping_level: Option<u16>,
}

/// One firmware generation's roster entry in the `sensor_versions` stanza.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct VersionGroup {
    #[serde(default)]
    pub default_damping_level: u16,
    #[serde(default)]
    pub sensors: Vec<VersionSensor>,
}

/// A named sub-plan scheduled independently of the default plan.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubPlan {
    pub plan_name: String,
    #[serde(default)]
    pub sensors: Vec<SensorId>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub measurement_sequence: Vec<CommandName>,
    #[serde(default)]
    pub measurement_settings: MeasurementSettings,
    #[serde(default)]
    #[schemars(description = "Reroutes this plan's audio output")]
    pub output_path: Option<PathBuf>,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_S
}

/// The on-disk configuration document. Keys the service does not interpret
/// (`pi_id`, `customer_id`, ...) are kept in `metadata` and passed through
/// to the artifact writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PlanDocument {
    #[serde(default)]
    pub sensors: Vec<SensorId>,
    #[serde(default = "default_interval")]
    pub measurement_interval: u64,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub default_measurement_sequence: Vec<CommandName>,
    #[serde(default)]
    pub measurement_settings: MeasurementSettings,
    #[serde(default)]
    pub sensor_specific_settings: HashMap<String, MeasurementSettings>,
    #[serde(default)]
    pub measurement_plans: Vec<SubPlan>,
    #[serde(default)]
    pub sensor_versions: HashMap<String, VersionGroup>,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl PlanDocument {
    /// The compiled-in plan used when the document cannot be parsed at
    /// runtime: a short block sweep plus an environment reading.
    pub fn fallback(sensors: Vec<SensorId>) -> Self {
        PlanDocument {
            sensors,
            default_measurement_sequence: vec![CommandName::Block, CommandName::Env],
            measurement_settings: MeasurementSettings {
                block: Some(SweepParams {
                    start_freq_hz: 20_000,
                    stop_freq_hz: 100_000,
                    duration_us: 50_000,
                    repetitions: 10,
                    damping_level: None,
                }),
                ..Default::default()
            },
            measurement_interval: DEFAULT_INTERVAL_S,
            ..Default::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.measurement_interval)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    fn version_entry(&self, id: SensorId) -> Option<(FirmwareVariant, u16)> {
        for (label, group) in &self.sensor_versions {
            if let Some(entry) = group.sensors.iter().find(|s| s.sensor_id == id) {
                let variant = match serde_json::from_value::<FirmwareVariant>(
                    serde_json::Value::String(label.clone()),
                ) {
                    Ok(v) => v,
                    Err(_) => {
                        warn!(target: "plan", "unknown sensor version label {label:?}, assuming V5");
                        FirmwareVariant::V5
                    }
                };
                let damping = entry.damping_level.unwrap_or(group.default_damping_level);
                return Some((variant, damping));
            }
        }
        None
    }

    pub fn variant_of(&self, id: SensorId) -> FirmwareVariant {
        self.version_entry(id).map(|(v, _)| v).unwrap_or_default()
    }

    pub fn default_damping_of(&self, id: SensorId) -> u16 {
        self.version_entry(id).map(|(_, d)| d).unwrap_or(0)
    }

    fn settings_for(&self, id: SensorId, name: CommandName) -> Option<Command> {
        let overrides = self.sensor_specific_settings.get(&id.0.to_string());
        command_from_settings(name, overrides, &self.measurement_settings)
    }

    /// Seed one periodic cycle: for every responsive sensor in configured
    /// order, one message per item of the default sequence.
    pub fn seed_messages(&self, responsive: &[SensorId]) -> Vec<QueueMessage> {
        let mut messages = Vec::new();
        for &id in self.sensors.iter().filter(|id| responsive.contains(id)) {
            for &name in &self.default_measurement_sequence {
                match self.settings_for(id, name) {
                    Some(command) => messages.push(QueueMessage::periodic(id, command)),
                    None => {
                        warn!(target: "plan", "no settings for {name} on sensor {id}, skipping")
                    }
                }
            }
        }
        messages
    }
}

impl SubPlan {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Seed one cycle of this sub-plan. Sub-plans carry their own settings
    /// and sensor list; there are no per-sensor overrides.
    pub fn seed_messages(&self, responsive: &[SensorId]) -> Vec<QueueMessage> {
        let mut messages = Vec::new();
        for &id in self.sensors.iter().filter(|id| responsive.contains(id)) {
            for &name in &self.measurement_sequence {
                match command_from_settings(name, None, &self.measurement_settings) {
                    Some(command) => {
                        let mut message = QueueMessage::periodic(id, command);
                        message.output_dir = self.output_path.clone();
                        messages.push(message);
                    }
                    None => warn!(
                        target: "plan",
                        "plan {:?} has no settings for {name}, skipping", self.plan_name
                    ),
                }
            }
        }
        messages
    }
}

fn command_from_settings(
    name: CommandName,
    overrides: Option<&MeasurementSettings>,
    defaults: &MeasurementSettings,
) -> Option<Command> {
    let pick_sweep = |field: fn(&MeasurementSettings) -> Option<SweepParams>| {
        overrides.and_then(field).or_else(|| field(defaults))
    };
    let pick_tof = |field: fn(&MeasurementSettings) -> Option<TofParams>| {
        overrides.and_then(field).or_else(|| field(defaults))
    };
    match name {
        CommandName::Block => pick_sweep(|s| s.block).map(Command::MeasureBlock),
        CommandName::Sine => pick_sweep(|s| s.sine).map(Command::MeasureSine),
        CommandName::Env => Some(Command::MeasureEnv),
        CommandName::Tof => pick_tof(|s| s.tof).map(Command::MeasureTofImpulse),
        CommandName::TofBlock => pick_tof(|s| s.tof_block).map(Command::MeasureTofBlock),
    }
}

/// Reads the configuration document from the metadata directory. The
/// document is the file named `metadata_*.json`; operator tooling owns its
/// exact name.
pub struct PlanStore {
    metadata_dir: PathBuf,
    log_key: String,
}

impl PlanStore {
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
            log_key: "plan".to_string(),
        }
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    pub fn document_path(&self) -> Result<PathBuf, ConfigError> {
        let entries = fs::read_dir(&self.metadata_dir).map_err(|source| ConfigError::Read {
            path: self.metadata_dir.clone(),
            source,
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("metadata_") && name.ends_with(".json") {
                return Ok(entry.path());
            }
        }
        Err(ConfigError::Missing(self.metadata_dir.clone()))
    }

    pub fn load(&self) -> Result<PlanDocument, ConfigError> {
        let path = self.document_path()?;
        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Runtime reload: on any failure fall back to the compiled-in plan for
    /// the given roster and log the substitution.
    pub fn load_or_fallback(&self, roster: Vec<SensorId>) -> PlanDocument {
        match self.load() {
            Ok(document) => document,
            Err(e) => {
                error!(
                    target: &self.log_key,
                    "configuration unusable ({e}), substituting built-in default plan"
                );
                PlanDocument::fallback(roster)
            }
        }
    }
}

/// One element of `message_interrupt.json`.
#[derive(Debug, Deserialize)]
pub struct InterruptMessage {
    pub sensor_id: SensorId,
    pub measurement_settings: InterruptSettings,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterruptSettings {
    Probe {
        #[serde(default)]
        calibrate_after: bool,
    },
    Calibrate {
        #[serde(default)]
        measure_after: bool,
    },
    Reset {
        #[serde(default)]
        probe_after: bool,
    },
    Measure(MeasureRequest),
}

#[derive(Debug, Deserialize)]
pub struct MeasureRequest {
    pub command: CommandName,
    #[serde(default)]
    pub test_measure: bool,
    #[serde(flatten)]
    pub params: serde_json::Value,
}

impl InterruptMessage {
    pub fn into_queue_message(self) -> Result<QueueMessage, serde_json::Error> {
        let mut test_measure = false;
        let command = match self.measurement_settings {
            InterruptSettings::Probe { calibrate_after } => Command::Probe { calibrate_after },
            InterruptSettings::Calibrate { measure_after } => Command::Calibrate { measure_after },
            InterruptSettings::Reset { probe_after } => Command::Reset { probe_after },
            InterruptSettings::Measure(request) => {
                test_measure = request.test_measure;
                match request.command {
                    CommandName::Block => {
                        Command::MeasureBlock(serde_json::from_value(request.params)?)
                    }
                    CommandName::Sine => {
                        Command::MeasureSine(serde_json::from_value(request.params)?)
                    }
                    CommandName::Env => Command::MeasureEnv,
                    CommandName::Tof => {
                        Command::MeasureTofImpulse(serde_json::from_value(request.params)?)
                    }
                    CommandName::TofBlock => {
                        Command::MeasureTofBlock(serde_json::from_value(request.params)?)
                    }
                }
            }
        };
        let mut message = QueueMessage::interrupt(self.sensor_id, command);
        message.test_measure = test_measure;
        Ok(message)
    }
}
