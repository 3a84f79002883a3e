use chrono::NaiveDateTime;
use flacenc::component::BitRepr;
use flacenc::error::Verify;
use log::{debug, info};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::codec::{EnvReading, SensorId};
use crate::sensor::{SweepParams, SweepShape, TofParams};

/// Plensor audio is captured at 500 kHz.
pub const SAMPLE_RATE: u32 = 500_000;
pub const BITS_PER_SAMPLE: u32 = 16;

/// Persists measurement artifacts under the data root:
/// `audio/raw` and `audio/processed` for FLAC, `environment` and `tof` for
/// JSON records. Filenames derive purely from measurement metadata, so a
/// re-derivation is idempotent; writes go to a temporary sibling first and
/// are renamed into place.
pub struct ArtifactWriter {
    audio_raw: PathBuf,
    env_dir: PathBuf,
    tof_dir: PathBuf,
    log_key: String,
}

impl ArtifactWriter {
    pub fn new(data_root: impl AsRef<Path>) -> io::Result<Self> {
        let root = data_root.as_ref();
        let audio_raw = root.join("audio").join("raw");
        let audio_processed = root.join("audio").join("processed");
        let env_dir = root.join("environment");
        let tof_dir = root.join("tof");
        for dir in [&audio_raw, &audio_processed, &env_dir, &tof_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            audio_raw,
            env_dir,
            tof_dir,
            log_key: "artifact".to_string(),
        })
    }

    /// Write one sweep's aggregated audio as 16-bit FLAC. `directory`
    /// reroutes sub-plan output; the default is `audio/raw`.
    pub fn write_audio(
        &self,
        sensor: SensorId,
        shape: SweepShape,
        params: &SweepParams,
        damping: u16,
        samples: &[i16],
        timestamp: NaiveDateTime,
        directory: Option<&Path>,
    ) -> io::Result<PathBuf> {
        let name = audio_filename(shape, params, damping, sensor, timestamp);
        let dir = directory.unwrap_or(&self.audio_raw);
        fs::create_dir_all(dir)?;
        let path = dir.join(name);
        let encoded = encode_flac(samples)?;
        write_atomic(&path, &encoded)?;
        info!(
            target: &self.log_key,
            "wrote {} ({} samples)", path.display(), samples.len()
        );
        Ok(path)
    }

    pub fn write_env(
        &self,
        sensor: SensorId,
        reading: &EnvReading,
        timestamp: NaiveDateTime,
    ) -> io::Result<PathBuf> {
        let path = self.env_dir.join(env_filename(sensor, timestamp));
        let payload = serde_json::to_vec_pretty(reading)?;
        write_atomic(&path, &payload)?;
        debug!(target: &self.log_key, "wrote {}", path.display());
        Ok(path)
    }

    pub fn write_tof_impulse(
        &self,
        sensor: SensorId,
        counts: &[u32],
        timestamp: NaiveDateTime,
    ) -> io::Result<PathBuf> {
        let path = self.tof_dir.join(tof_impulse_filename(sensor, timestamp));
        let payload = serde_json::to_vec_pretty(counts)?;
        write_atomic(&path, &payload)?;
        debug!(target: &self.log_key, "wrote {}", path.display());
        Ok(path)
    }

    pub fn write_tof_block(
        &self,
        sensor: SensorId,
        params: &TofParams,
        damping: u16,
        counts: &[u32],
        timestamp: NaiveDateTime,
    ) -> io::Result<PathBuf> {
        let path = self
            .tof_dir
            .join(tof_block_filename(params, damping, sensor, timestamp));
        let payload = serde_json::to_vec_pretty(counts)?;
        write_atomic(&path, &payload)?;
        debug!(target: &self.log_key, "wrote {}", path.display());
        Ok(path)
    }
}

fn timestamp_token(timestamp: NaiveDateTime) -> String {
    timestamp.format("%Y-%m-%dT%H%M%S").to_string()
}

/// `<start5><B|S><stop5>l<dmp3>d<dur2>r<rep3>#<sid5>_<ts>.flac`, frequencies
/// in tens of Hz, duration in ms.
pub fn audio_filename(
    shape: SweepShape,
    params: &SweepParams,
    damping: u16,
    sensor: SensorId,
    timestamp: NaiveDateTime,
) -> String {
    format!(
        "{:05}{}{:05}l{:03}d{:02}r{:03}#{:05}_{}.flac",
        params.start_freq_hz / 10,
        shape.letter(),
        params.stop_freq_hz / 10,
        damping,
        params.duration_us / 1000,
        params.repetitions,
        sensor.0,
        timestamp_token(timestamp),
    )
}

pub fn env_filename(sensor: SensorId, timestamp: NaiveDateTime) -> String {
    format!("ENV#{:05}_{}.json", sensor.0, timestamp_token(timestamp))
}

pub fn tof_impulse_filename(sensor: SensorId, timestamp: NaiveDateTime) -> String {
    format!("TOF#{:05}_{}.json", sensor.0, timestamp_token(timestamp))
}

pub fn tof_block_filename(
    params: &TofParams,
    damping: u16,
    sensor: SensorId,
    timestamp: NaiveDateTime,
) -> String {
    format!(
        "TOF_BLOCKh{:03}r{:03}l{:03}#{:05}_{}.json",
        params.half_periods,
        params.repetitions,
        damping,
        sensor.0,
        timestamp_token(timestamp),
    )
}

/// Write to a temporary sibling, then rename into place so a crash never
/// leaves a half-written artifact under its final name.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

fn encode_flac(samples: &[i16]) -> io::Result<Vec<u8>> {
    let signal: Vec<i32> = samples.iter().map(|&s| i32::from(s)).collect();
    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("flac config: {e:?}")))?;
    let source = flacenc::source::MemSource::from_samples(
        &signal,
        1,
        BITS_PER_SAMPLE as usize,
        SAMPLE_RATE as usize,
    );
    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("flac encode: {e:?}")))?;
    let mut sink = flacenc::bitsink::ByteSink::new();
    stream
        .write(&mut sink)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("flac write: {e:?}")))?;
    Ok(sink.as_slice().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_opt(12, 30, 45)
            .unwrap()
    }

    fn sweep() -> SweepParams {
        SweepParams {
            start_freq_hz: 20_000,
            stop_freq_hz: 100_000,
            duration_us: 50_000,
            repetitions: 2,
            damping_level: Some(200),
        }
    }

    #[test]
    fn audio_filename_matches_template() {
        let name = audio_filename(SweepShape::Block, &sweep(), 200, SensorId(7), ts());
        assert_eq!(name, "02000B10000l200d50r002#00007_2024-01-15T123045.flac");
    }

    #[test]
    fn sine_uses_its_own_letter() {
        let name = audio_filename(SweepShape::Sine, &sweep(), 0, SensorId(12345), ts());
        assert_eq!(name, "02000S10000l000d50r002#12345_2024-01-15T123045.flac");
    }

    #[test]
    fn filenames_are_deterministic() {
        let a = audio_filename(SweepShape::Block, &sweep(), 200, SensorId(7), ts());
        let b = audio_filename(SweepShape::Block, &sweep(), 200, SensorId(7), ts());
        assert_eq!(a, b);
    }

    #[test]
    fn env_and_tof_filenames() {
        assert_eq!(
            env_filename(SensorId(7), ts()),
            "ENV#00007_2024-01-15T123045.json"
        );
        assert_eq!(
            tof_impulse_filename(SensorId(7), ts()),
            "TOF#00007_2024-01-15T123045.json"
        );
        let params = TofParams {
            timeout_us: 400,
            repetitions: 10,
            half_periods: 3,
            damping_level: None,
        };
        assert_eq!(
            tof_block_filename(&params, 0, SensorId(5), ts()),
            "TOF_BLOCKh003r010l000#00005_2024-01-15T123045.json"
        );
    }

    #[test]
    fn env_artifact_round_trips_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let reading = EnvReading {
            inside_temp_c: 23.0,
            inside_hum_pct: 50.0,
            outside_temp_c: 24.0,
            outside_hum_pct: 60.0,
        };
        let path = writer.write_env(SensorId(7), &reading, ts()).unwrap();
        assert!(path.starts_with(dir.path().join("environment")));
        let parsed: EnvReading =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed, reading);
        // no stray temporary left behind
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn tof_artifact_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let counts = vec![3000, 1000, 2000];
        let path = writer
            .write_tof_impulse(SensorId(9), &counts, ts())
            .unwrap();
        let parsed: Vec<u32> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed, counts);
    }

    #[test]
    fn audio_artifact_is_flac() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let samples: Vec<i16> = (0..4096).map(|i| (i % 128) as i16).collect();
        let path = writer
            .write_audio(
                SensorId(7),
                SweepShape::Block,
                &sweep(),
                200,
                &samples,
                ts(),
                None,
            )
            .unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"fLaC");
    }

    #[test]
    fn output_directory_override_reroutes_audio() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let custom = dir.path().join("nightly");
        let samples = vec![0i16; 1024];
        let path = writer
            .write_audio(
                SensorId(5),
                SweepShape::Sine,
                &sweep(),
                0,
                &samples,
                ts(),
                Some(&custom),
            )
            .unwrap();
        assert!(path.starts_with(&custom));
    }
}
