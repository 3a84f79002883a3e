use derive_more::Display;
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::codec::{self, AckNak, EnvReading, FrameError, SensorId, WireCommand};
use crate::transport::BusLink;

/// A measurement gets this many failed repetitions in total before it gives
/// up; the budget is per batch, not per repetition.
pub const RETRY_BUDGET: u32 = 3;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const CALIBRATE_TIMEOUT: Duration = Duration::from_secs(15);
const DAMPING_TIMEOUT: Duration = Duration::from_millis(100);
const ENV_TIMEOUT: Duration = Duration::from_secs(1);
const RESET_TIMEOUT: Duration = Duration::from_secs(1);
const SET_ID_TIMEOUT: Duration = Duration::from_secs(1);

/// Sensor ids at or below this use the one-byte V4 damping encoding; later
/// V4 units shipped with a two-byte register.
const NARROW_DAMPING_MAX_ID: u32 = 68;

/// Firmware generation of one plensor. Decides how (and whether) the damping
/// setting travels on the wire.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
pub enum FirmwareVariant {
    #[serde(rename = "V3.0", alias = "V3")]
    #[display("V3")]
    V3,
    #[serde(rename = "V4.0", alias = "V4")]
    #[display("V4")]
    V4,
    #[serde(rename = "V5.0", alias = "V5")]
    #[display("V5")]
    #[default]
    V5,
}

impl FirmwareVariant {
    /// Clamp `level` to the variant's accepted range and pick the wire width.
    /// `None` means the variant has no damping register at all.
    pub fn damping_wire(self, level: u16, id: SensorId) -> Option<(u16, bool)> {
        match self {
            FirmwareVariant::V3 => None,
            FirmwareVariant::V4 => {
                let level = if level > 3 { 0 } else { level };
                Some((level, id.0 > NARROW_DAMPING_MAX_ID))
            }
            FirmwareVariant::V5 => {
                let level = if level > 257 { 0 } else { level };
                Some((level, true))
            }
        }
    }
}

/// Parameters of a block or sine sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SweepParams {
    #[serde(rename = "start_frequency")]
    pub start_freq_hz: u32,
    #[serde(rename = "stop_frequency")]
    pub stop_freq_hz: u32,
    #[serde(rename = "duration")]
    pub duration_us: u16,
    pub repetitions: u32,
    #[serde(default)]
    #[schemars(description = "Overrides the sensor's configured damping level")]
    pub damping_level: Option<u16>,
}

/// Parameters of a time-of-flight measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TofParams {
    #[serde(rename = "timeout_duration")]
    pub timeout_us: u16,
    pub repetitions: u32,
    #[serde(rename = "tof_half_periods", default)]
    pub half_periods: u8,
    #[serde(default)]
    pub damping_level: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepShape {
    Block,
    Sine,
}

impl SweepShape {
    pub fn letter(self) -> char {
        match self {
            SweepShape::Block => 'B',
            SweepShape::Sine => 'S',
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no response within deadline")]
    NoResponse,
    #[error("device rejected command")]
    Nak,
    #[error("bad reply: {0}")]
    Frame(#[from] FrameError),
    #[error("bus io: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a repeated measurement. `Partial` carries whatever was
/// collected before the retry budget ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Measurement<T> {
    Complete(T),
    Partial(T),
    Failed,
}

/// State of one plensor on the bus. Verbs compose a frame, run one exchange
/// on the link and decode the reply; the link itself is owned by the caller
/// so only one frame is ever in flight.
pub struct Sensor {
    pub id: SensorId,
    pub variant: FirmwareVariant,
    /// Damping most recently accepted by the device, or the configured
    /// default before any set-damping has succeeded.
    pub damping_level: u16,
    pub default_damping: u16,
    pub responsive: bool,
    log_key: String,
}

impl Sensor {
    pub fn new(id: SensorId, variant: FirmwareVariant, default_damping: u16) -> Self {
        Self {
            id,
            variant,
            damping_level: default_damping,
            default_damping,
            responsive: true,
            log_key: format!("plensor_{}", id.0),
        }
    }

    pub fn log_key(&self) -> &str {
        &self.log_key
    }

    /// One framed exchange: send, require a reply, require ACK, hand back the
    /// payload after the status byte.
    async fn transact(
        &self,
        bus: &mut dyn BusLink,
        command: &WireCommand,
        timeout: Duration,
    ) -> Result<Vec<u8>, CommandError> {
        let frame = codec::encode_frame(self.id, command);
        let reply = bus.exchange(&frame, timeout).await?;
        if reply.is_empty() {
            return Err(CommandError::NoResponse);
        }
        let response = codec::decode_response(&reply, self.id)?;
        match response.status {
            AckNak::Ack => Ok(response.payload),
            AckNak::Nak => Err(CommandError::Nak),
        }
    }

    pub async fn probe(&self, bus: &mut dyn BusLink) -> Result<(), CommandError> {
        let payload = self.transact(bus, &WireCommand::Probe, PROBE_TIMEOUT).await?;
        info!(target: &self.log_key, "probe acknowledged ({} payload bytes)", payload.len());
        Ok(())
    }

    pub async fn calibrate(&self, bus: &mut dyn BusLink) -> Result<(), CommandError> {
        info!(target: &self.log_key, "calibrating");
        self.transact(bus, &WireCommand::Calibrate, CALIBRATE_TIMEOUT)
            .await?;
        info!(target: &self.log_key, "calibration acknowledged");
        Ok(())
    }

    /// Transmit the damping setting that precedes a block, sine or TOF
    /// measurement. `level` overrides the configured default for this
    /// measurement only; out-of-range values clamp to zero. V3 units have no
    /// damping register, so for them this is a successful no-op.
    pub async fn set_damping(
        &mut self,
        bus: &mut dyn BusLink,
        level: Option<u16>,
    ) -> Result<(), CommandError> {
        let requested = level.unwrap_or(self.default_damping);
        let Some((level, wide)) = self.variant.damping_wire(requested, self.id) else {
            debug!(target: &self.log_key, "{} has no damping register, skipping", self.variant);
            return Ok(());
        };
        self.transact(bus, &WireCommand::SetDamping { level, wide }, DAMPING_TIMEOUT)
            .await?;
        self.damping_level = level;
        debug!(target: &self.log_key, "damping set to {}", level);
        Ok(())
    }

    pub async fn measure_env(&self, bus: &mut dyn BusLink) -> Result<EnvReading, CommandError> {
        let payload = self.transact(bus, &WireCommand::Env, ENV_TIMEOUT).await?;
        let reading = codec::decode_env(&payload)?;
        info!(
            target: &self.log_key,
            "env: inside {:.2}C {:.2}%, outside {:.2}C {:.2}%",
            reading.inside_temp_c, reading.inside_hum_pct,
            reading.outside_temp_c, reading.outside_hum_pct
        );
        Ok(reading)
    }

    /// Run a block or sine sweep `params.repetitions` times and aggregate the
    /// audio. Failed repetitions (no reply, NAK, framing) are retried out of
    /// the shared budget; whatever was collected when the budget runs out is
    /// returned as `Partial`.
    pub async fn measure_sweep(
        &self,
        bus: &mut dyn BusLink,
        shape: SweepShape,
        params: &SweepParams,
    ) -> Measurement<Vec<i16>> {
        let command = match shape {
            SweepShape::Block => WireCommand::Block {
                start_freq_hz: params.start_freq_hz,
                stop_freq_hz: params.stop_freq_hz,
                duration_us: params.duration_us,
            },
            SweepShape::Sine => WireCommand::Sine {
                start_freq_hz: params.start_freq_hz,
                stop_freq_hz: params.stop_freq_hz,
                duration_us: params.duration_us,
            },
        };
        // The device answers within 1.2x the sweep duration or not at all.
        let timeout = Duration::from_micros(params.duration_us as u64 * 12 / 10);
        let mut samples: Vec<i16> = Vec::new();
        let mut completed = 0;
        let mut retries = 0;
        while completed < params.repetitions && retries < RETRY_BUDGET {
            debug!(
                target: &self.log_key,
                "repetition {}/{}, retry {}",
                completed + 1,
                params.repetitions,
                retries
            );
            match self.transact(bus, &command, timeout).await {
                Ok(payload) => {
                    let audio = codec::decode_audio(&payload);
                    debug!(target: &self.log_key, "collected {} samples", audio.len());
                    samples.extend(audio);
                    completed += 1;
                }
                Err(e) => {
                    warn!(target: &self.log_key, "repetition failed: {}", e);
                    retries += 1;
                }
            }
        }
        finish_measurement(samples, completed, params.repetitions)
    }

    /// Time-of-flight, impulse or block excitation. Same retry policy as the
    /// sweeps; returns the nanosecond counts in chronological order.
    pub async fn measure_tof(
        &self,
        bus: &mut dyn BusLink,
        params: &TofParams,
        block: bool,
    ) -> Measurement<Vec<u32>> {
        let command = if block {
            WireCommand::TofBlock {
                duration_us: params.timeout_us,
                half_periods: params.half_periods,
            }
        } else {
            WireCommand::TofImpulse {
                duration_us: params.timeout_us,
            }
        };
        let timeout = Duration::from_micros(params.timeout_us as u64 * 2);
        let mut counts: Vec<u32> = Vec::new();
        let mut completed = 0;
        let mut retries = 0;
        while completed < params.repetitions && retries < RETRY_BUDGET {
            match self.transact(bus, &command, timeout).await {
                Ok(payload) => match codec::decode_tof(&payload) {
                    Ok(ns) => {
                        debug!(target: &self.log_key, "tof {} ns", ns);
                        counts.push(ns);
                        completed += 1;
                    }
                    Err(e) => {
                        warn!(target: &self.log_key, "bad tof payload: {}", e);
                        retries += 1;
                    }
                },
                Err(e) => {
                    warn!(target: &self.log_key, "tof repetition failed: {}", e);
                    retries += 1;
                }
            }
        }
        finish_measurement(counts, completed, params.repetitions)
    }

    pub async fn reset(&self, bus: &mut dyn BusLink) -> Result<(), CommandError> {
        self.transact(bus, &WireCommand::Reset, RESET_TIMEOUT).await?;
        info!(target: &self.log_key, "reset acknowledged");
        Ok(())
    }
}

/// Assign an id to an unconfigured device. Provisioning only: the frame is
/// addressed to the broadcast id, so exactly one unconfigured sensor may be
/// on the bus.
pub async fn assign_id(bus: &mut dyn BusLink, new_id: SensorId) -> Result<(), CommandError> {
    let frame = codec::encode_frame(SensorId::BROADCAST, &WireCommand::SetId { new_id });
    let reply = bus.exchange(&frame, SET_ID_TIMEOUT).await?;
    if reply.is_empty() {
        return Err(CommandError::NoResponse);
    }
    let response = codec::decode_response(&reply, SensorId::BROADCAST)?;
    match response.status {
        AckNak::Ack => Ok(()),
        AckNak::Nak => Err(CommandError::Nak),
    }
}

fn finish_measurement<T>(collected: Vec<T>, completed: u32, wanted: u32) -> Measurement<Vec<T>> {
    if completed == wanted {
        Measurement::Complete(collected)
    } else if collected.is_empty() {
        Measurement::Failed
    } else {
        Measurement::Partial(collected)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::{frame_payload, ACK, NAK};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// A bus that replays scripted replies and records outgoing frames.
    pub(crate) struct ScriptedBus {
        pub replies: VecDeque<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
    }

    impl ScriptedBus {
        pub fn new(replies: impl IntoIterator<Item = Vec<u8>>) -> Self {
            Self {
                replies: replies.into_iter().collect(),
                sent: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl BusLink for ScriptedBus {
        async fn exchange(&mut self, frame: &[u8], _timeout: Duration) -> io::Result<Vec<u8>> {
            self.sent.push(frame.to_vec());
            Ok(self.replies.pop_front().unwrap_or_default())
        }
    }

    pub(crate) fn ack_frame(id: SensorId, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![ACK];
        payload.extend_from_slice(data);
        frame_payload(id, &payload)
    }

    pub(crate) fn nak_frame(id: SensorId) -> Vec<u8> {
        frame_payload(id, &[NAK])
    }

    fn sweep() -> SweepParams {
        SweepParams {
            start_freq_hz: 20_000,
            stop_freq_hz: 100_000,
            duration_us: 50_000,
            repetitions: 2,
            damping_level: None,
        }
    }

    #[tokio::test]
    async fn probe_outcomes() {
        let id = SensorId(5);
        let sensor = Sensor::new(id, FirmwareVariant::V5, 0);

        let mut bus = ScriptedBus::new([ack_frame(id, &[0x00, 0x00, 0x05])]);
        assert!(sensor.probe(&mut bus).await.is_ok());

        let mut bus = ScriptedBus::new([nak_frame(id)]);
        assert!(matches!(
            sensor.probe(&mut bus).await,
            Err(CommandError::Nak)
        ));

        let mut bus = ScriptedBus::new([]);
        assert!(matches!(
            sensor.probe(&mut bus).await,
            Err(CommandError::NoResponse)
        ));
    }

    #[tokio::test]
    async fn damping_precedes_with_variant_encoding() {
        let id = SensorId(7);
        let mut sensor = Sensor::new(id, FirmwareVariant::V5, 0);
        let mut bus = ScriptedBus::new([ack_frame(id, &[])]);
        sensor.set_damping(&mut bus, Some(200)).await.unwrap();
        assert_eq!(sensor.damping_level, 200);
        assert_eq!(&bus.sent[0][6..9], &[0x63, 0x00, 0xC8]);
    }

    #[tokio::test]
    async fn v4_narrow_and_wide_ids() {
        let narrow = SensorId(68);
        let mut sensor = Sensor::new(narrow, FirmwareVariant::V4, 0);
        let mut bus = ScriptedBus::new([ack_frame(narrow, &[])]);
        sensor.set_damping(&mut bus, Some(3)).await.unwrap();
        assert_eq!(&bus.sent[0][6..8], &[0x63, 0x03]);

        let wide = SensorId(69);
        let mut sensor = Sensor::new(wide, FirmwareVariant::V4, 0);
        let mut bus = ScriptedBus::new([ack_frame(wide, &[])]);
        sensor.set_damping(&mut bus, Some(3)).await.unwrap();
        assert_eq!(&bus.sent[0][6..9], &[0x63, 0x00, 0x03]);
    }

    #[tokio::test]
    async fn out_of_range_damping_clamps_to_zero() {
        let id = SensorId(7);
        let mut sensor = Sensor::new(id, FirmwareVariant::V5, 0);
        let mut bus = ScriptedBus::new([ack_frame(id, &[])]);
        sensor.set_damping(&mut bus, Some(300)).await.unwrap();
        assert_eq!(sensor.damping_level, 0);
        assert_eq!(&bus.sent[0][6..9], &[0x63, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn v3_has_no_damping_frame() {
        let id = SensorId(3);
        let mut sensor = Sensor::new(id, FirmwareVariant::V3, 0);
        let mut bus = ScriptedBus::new([]);
        sensor.set_damping(&mut bus, Some(2)).await.unwrap();
        assert!(bus.sent.is_empty());
    }

    #[tokio::test]
    async fn sweep_aggregates_repetitions() {
        let id = SensorId(7);
        let sensor = Sensor::new(id, FirmwareVariant::V5, 0);
        let mut bus = ScriptedBus::new([
            ack_frame(id, &[0x00, 0x01, 0x00, 0x02]),
            ack_frame(id, &[0x00, 0x03]),
        ]);
        let result = sensor.measure_sweep(&mut bus, SweepShape::Block, &sweep()).await;
        assert_eq!(result, Measurement::Complete(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn sweep_fails_after_three_naks() {
        let id = SensorId(5);
        let sensor = Sensor::new(id, FirmwareVariant::V5, 0);
        let mut bus = ScriptedBus::new([nak_frame(id), nak_frame(id), nak_frame(id)]);
        let result = sensor.measure_sweep(&mut bus, SweepShape::Block, &sweep()).await;
        assert_eq!(result, Measurement::Failed);
        assert_eq!(bus.sent.len(), 3);
    }

    #[tokio::test]
    async fn sweep_returns_partial_when_budget_runs_out() {
        let id = SensorId(5);
        let sensor = Sensor::new(id, FirmwareVariant::V5, 0);
        let mut bus = ScriptedBus::new([
            ack_frame(id, &[0x00, 0x01]),
            nak_frame(id),
            nak_frame(id),
            nak_frame(id),
        ]);
        let result = sensor.measure_sweep(&mut bus, SweepShape::Block, &sweep()).await;
        assert_eq!(result, Measurement::Partial(vec![1]));
    }

    #[tokio::test]
    async fn sweep_retries_past_a_single_failure() {
        let id = SensorId(5);
        let sensor = Sensor::new(id, FirmwareVariant::V5, 0);
        let mut bus = ScriptedBus::new([
            nak_frame(id),
            ack_frame(id, &[0x00, 0x01]),
            ack_frame(id, &[0x00, 0x02]),
        ]);
        let result = sensor.measure_sweep(&mut bus, SweepShape::Block, &sweep()).await;
        assert_eq!(result, Measurement::Complete(vec![1, 2]));
    }

    #[tokio::test]
    async fn tof_block_collects_counts() {
        let id = SensorId(9);
        let sensor = Sensor::new(id, FirmwareVariant::V5, 0);
        let params = TofParams {
            timeout_us: 400,
            repetitions: 2,
            half_periods: 3,
            damping_level: None,
        };
        let mut bus = ScriptedBus::new([
            ack_frame(id, &[0x00, 0x00, 0x03, 0xE8]),
            ack_frame(id, &[0x00, 0x00, 0x07, 0xD0]),
        ]);
        let result = sensor.measure_tof(&mut bus, &params, true).await;
        assert_eq!(result, Measurement::Complete(vec![1000, 2000]));
        assert_eq!(&bus.sent[0][6..10], &[0x64, 0x01, 0x90, 0x03]);
    }

    #[tokio::test]
    async fn env_bad_length_is_reported() {
        let id = SensorId(7);
        let sensor = Sensor::new(id, FirmwareVariant::V5, 0);
        let mut bus = ScriptedBus::new([ack_frame(id, &[0x00; 7])]);
        let err = sensor.measure_env(&mut bus).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Frame(FrameError::BadEnvLength(7))
        ));
    }

    #[tokio::test]
    async fn assign_id_addresses_broadcast() {
        let mut bus = ScriptedBus::new([ack_frame(SensorId::BROADCAST, &[])]);
        assign_id(&mut bus, SensorId(21)).await.unwrap();
        assert_eq!(&bus.sent[0][1..4], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&bus.sent[0][6..10], &[0x61, 0x00, 0x00, 0x15]);
    }
}
