use derive_more::Display;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Plensor wire frame, big-endian throughout:
///
/// | Offset | Size | Field                          |
/// |--------|------|--------------------------------|
/// | 0      | 1    | start byte (0x5A)              |
/// | 1      | 3    | sensor id                      |
/// | 4      | 2    | payload length                 |
/// | 6      | n    | payload (responses: status first) |
/// | 6+n    | 1    | XOR of every preceding byte    |
pub const START_BYTE: u8 = 0x5A;
/// First payload byte of an accepted response.
pub const ACK: u8 = 0x06;
/// First payload byte of a rejected response.
pub const NAK: u8 = 0x0F;

const HEADER_LEN: usize = 6;

/// 24-bit bus address of one plensor.
#[derive(
    Debug,
    Display,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
#[display("{_0}")]
pub struct SensorId(pub u32);

impl SensorId {
    /// Provisioning address accepted by every unconfigured device. Only the
    /// set-id command may be sent to it.
    pub const BROADCAST: SensorId = SensorId(0xFF_FF_FF);

    pub fn to_wire(self) -> [u8; 3] {
        [
            ((self.0 >> 16) & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            (self.0 & 0xFF) as u8,
        ]
    }

    pub fn from_wire(bytes: [u8; 3]) -> Self {
        SensorId(((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated at {0} bytes")]
    Truncated(usize),
    #[error("bad start byte 0x{0:02X}")]
    BadStartByte(u8),
    #[error("length field says {expected} payload bytes, frame carries {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("checksum mismatch: computed 0x{computed:02X}, received 0x{received:02X}")]
    Checksum { computed: u8, received: u8 },
    #[error("response from {got}, expected {want}")]
    WrongResponder { want: SensorId, got: SensorId },
    #[error("unknown status byte 0x{0:02X}")]
    UnknownStatus(u8),
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("opcode 0x{opcode:02X} with {len} payload bytes")]
    BadCommandLength { opcode: u8, len: usize },
    #[error("environment payload must be 8 bytes, got {0}")]
    BadEnvLength(usize),
    #[error("tof payload must be 4 bytes, got {0}")]
    BadTofLength(usize),
}

impl FrameError {
    /// Whether the error is a framing defect (start byte, length, checksum,
    /// truncation) as opposed to a decoded-but-wrong-shape payload.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(
            self,
            FrameError::Truncated(_)
                | FrameError::BadStartByte(_)
                | FrameError::LengthMismatch { .. }
                | FrameError::Checksum { .. }
                | FrameError::WrongResponder { .. }
        )
    }
}

/// One command as it appears on the wire. The queue-level command carries
/// scheduling flags on top of these; this enum is exactly the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireCommand {
    Probe,
    Sine {
        start_freq_hz: u32,
        stop_freq_hz: u32,
        duration_us: u16,
    },
    TofImpulse {
        duration_us: u16,
    },
    Block {
        start_freq_hz: u32,
        stop_freq_hz: u32,
        duration_us: u16,
    },
    Env,
    Calibrate,
    SetId {
        new_id: SensorId,
    },
    Reset,
    /// `wide` selects the two-byte damping encoding; which sensors need it is
    /// a firmware-variant question decided by the caller.
    SetDamping {
        level: u16,
        wide: bool,
    },
    TofBlock {
        duration_us: u16,
        half_periods: u8,
    },
}

impl WireCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            WireCommand::Probe => 0x5B,
            WireCommand::Sine { .. } => 0x5C,
            WireCommand::TofImpulse { .. } => 0x5D,
            WireCommand::Block { .. } => 0x5E,
            WireCommand::Env => 0x5F,
            WireCommand::Calibrate => 0x60,
            WireCommand::SetId { .. } => 0x61,
            WireCommand::Reset => 0x62,
            WireCommand::SetDamping { .. } => 0x63,
            WireCommand::TofBlock { .. } => 0x64,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut payload = vec![self.opcode()];
        match *self {
            WireCommand::Probe | WireCommand::Env | WireCommand::Calibrate | WireCommand::Reset => {
            }
            WireCommand::Sine {
                start_freq_hz,
                stop_freq_hz,
                duration_us,
            }
            | WireCommand::Block {
                start_freq_hz,
                stop_freq_hz,
                duration_us,
            } => {
                payload.extend_from_slice(&freq_to_wire(start_freq_hz));
                payload.extend_from_slice(&freq_to_wire(stop_freq_hz));
                payload.extend_from_slice(&duration_us.to_be_bytes());
            }
            WireCommand::TofImpulse { duration_us } => {
                payload.extend_from_slice(&duration_us.to_be_bytes());
                payload.push(0x00);
            }
            WireCommand::SetId { new_id } => {
                payload.extend_from_slice(&new_id.to_wire());
            }
            WireCommand::SetDamping { level, wide } => {
                if wide {
                    payload.extend_from_slice(&level.to_be_bytes());
                } else {
                    payload.push((level & 0xFF) as u8);
                }
            }
            WireCommand::TofBlock {
                duration_us,
                half_periods,
            } => {
                payload.extend_from_slice(&duration_us.to_be_bytes());
                payload.push(half_periods);
            }
        }
        payload
    }
}

/// Frequencies travel as 24-bit big-endian Hz.
fn freq_to_wire(freq_hz: u32) -> [u8; 3] {
    [
        ((freq_hz >> 16) & 0xFF) as u8,
        ((freq_hz >> 8) & 0xFF) as u8,
        (freq_hz & 0xFF) as u8,
    ]
}

pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Assemble a complete frame around an already-encoded payload.
pub fn frame_payload(id: SensorId, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    frame.push(START_BYTE);
    frame.extend_from_slice(&id.to_wire());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.push(xor_checksum(&frame));
    frame
}

pub fn encode_frame(id: SensorId, command: &WireCommand) -> Vec<u8> {
    frame_payload(id, &command.encode_payload())
}

/// Validate framing and return the payload slice.
fn check_frame(frame: &[u8]) -> Result<(SensorId, &[u8]), FrameError> {
    if frame.len() < HEADER_LEN + 1 {
        return Err(FrameError::Truncated(frame.len()));
    }
    if frame[0] != START_BYTE {
        return Err(FrameError::BadStartByte(frame[0]));
    }
    let id = SensorId::from_wire([frame[1], frame[2], frame[3]]);
    let expected = u16::from_be_bytes([frame[4], frame[5]]) as usize;
    let actual = frame.len() - HEADER_LEN - 1;
    if expected != actual {
        return Err(FrameError::LengthMismatch { expected, actual });
    }
    let computed = xor_checksum(&frame[..frame.len() - 1]);
    let received = frame[frame.len() - 1];
    if computed != received {
        return Err(FrameError::Checksum { computed, received });
    }
    Ok((id, &frame[HEADER_LEN..frame.len() - 1]))
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AckNak {
    #[display("ACK")]
    Ack,
    #[display("NAK")]
    Nak,
}

/// A validated response: status plus the payload bytes after the status byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: AckNak,
    pub payload: Vec<u8>,
}

/// Decode a response frame, checking framing, checksum and that the echoed
/// sensor id matches the addressed device.
pub fn decode_response(frame: &[u8], expected: SensorId) -> Result<Response, FrameError> {
    let (id, payload) = check_frame(frame)?;
    if id != expected {
        return Err(FrameError::WrongResponder {
            want: expected,
            got: id,
        });
    }
    let (&status, rest) = payload
        .split_first()
        .ok_or(FrameError::Truncated(frame.len()))?;
    let status = match status {
        ACK => AckNak::Ack,
        NAK => AckNak::Nak,
        other => return Err(FrameError::UnknownStatus(other)),
    };
    Ok(Response {
        status,
        payload: rest.to_vec(),
    })
}

/// Decode an outgoing frame back into its typed command. Used by the tests
/// and by bus diagnostics; the devices never send these.
pub fn decode_command(frame: &[u8]) -> Result<(SensorId, WireCommand), FrameError> {
    let (id, payload) = check_frame(frame)?;
    let (&opcode, body) = payload
        .split_first()
        .ok_or(FrameError::Truncated(frame.len()))?;
    let bad = |len| FrameError::BadCommandLength { opcode, len };
    let command = match opcode {
        0x5B => WireCommand::Probe,
        0x5F => WireCommand::Env,
        0x60 => WireCommand::Calibrate,
        0x62 => WireCommand::Reset,
        0x5C | 0x5E => {
            let body: &[u8; 8] = body.try_into().map_err(|_| bad(body.len()))?;
            let start_freq_hz = u32::from(body[0]) << 16 | u32::from(body[1]) << 8 | u32::from(body[2]);
            let stop_freq_hz = u32::from(body[3]) << 16 | u32::from(body[4]) << 8 | u32::from(body[5]);
            let duration_us = u16::from_be_bytes([body[6], body[7]]);
            if opcode == 0x5C {
                WireCommand::Sine {
                    start_freq_hz,
                    stop_freq_hz,
                    duration_us,
                }
            } else {
                WireCommand::Block {
                    start_freq_hz,
                    stop_freq_hz,
                    duration_us,
                }
            }
        }
        0x5D => {
            let body: &[u8; 3] = body.try_into().map_err(|_| bad(body.len()))?;
            WireCommand::TofImpulse {
                duration_us: u16::from_be_bytes([body[0], body[1]]),
            }
        }
        0x61 => {
            let body: &[u8; 3] = body.try_into().map_err(|_| bad(body.len()))?;
            WireCommand::SetId {
                new_id: SensorId::from_wire(*body),
            }
        }
        0x63 => match body.len() {
            1 => WireCommand::SetDamping {
                level: body[0] as u16,
                wide: false,
            },
            2 => WireCommand::SetDamping {
                level: u16::from_be_bytes([body[0], body[1]]),
                wide: true,
            },
            len => return Err(bad(len)),
        },
        0x64 => {
            let body: &[u8; 3] = body.try_into().map_err(|_| bad(body.len()))?;
            WireCommand::TofBlock {
                duration_us: u16::from_be_bytes([body[0], body[1]]),
                half_periods: body[2],
            }
        }
        other => return Err(FrameError::UnknownOpcode(other)),
    };
    Ok((id, command))
}

/// Audio payloads are big-endian signed 16-bit samples; a trailing odd byte
/// is dropped.
pub fn decode_audio(payload: &[u8]) -> Vec<i16> {
    payload
        .chunks_exact(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// One environment reading. Wire fields are hundredths of a °C and of a %RH.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvReading {
    pub inside_temp_c: f32,
    pub inside_hum_pct: f32,
    pub outside_temp_c: f32,
    pub outside_hum_pct: f32,
}

pub fn decode_env(payload: &[u8]) -> Result<EnvReading, FrameError> {
    let payload: &[u8; 8] = payload
        .try_into()
        .map_err(|_| FrameError::BadEnvLength(payload.len()))?;
    let field = |i: usize| u16::from_be_bytes([payload[i], payload[i + 1]]) as f32 / 100.0;
    Ok(EnvReading {
        inside_temp_c: field(0),
        inside_hum_pct: field(2),
        outside_temp_c: field(4),
        outside_hum_pct: field(6),
    })
}

/// A time-of-flight payload is one big-endian u32 nanosecond count.
pub fn decode_tof(payload: &[u8]) -> Result<u32, FrameError> {
    let payload: &[u8; 4] = payload
        .try_into()
        .map_err(|_| FrameError::BadTofLength(payload.len()))?;
    Ok(u32::from_be_bytes(*payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_frame(id: SensorId, status: u8, data: &[u8]) -> Vec<u8> {
        let mut payload = vec![status];
        payload.extend_from_slice(data);
        frame_payload(id, &payload)
    }

    fn all_commands() -> Vec<WireCommand> {
        vec![
            WireCommand::Probe,
            WireCommand::Sine {
                start_freq_hz: 20_000,
                stop_freq_hz: 100_000,
                duration_us: 50_000,
            },
            WireCommand::TofImpulse { duration_us: 400 },
            WireCommand::Block {
                start_freq_hz: 20_000,
                stop_freq_hz: 100_000,
                duration_us: 50_000,
            },
            WireCommand::Env,
            WireCommand::Calibrate,
            WireCommand::SetId {
                new_id: SensorId(21),
            },
            WireCommand::Reset,
            WireCommand::SetDamping {
                level: 200,
                wide: true,
            },
            WireCommand::SetDamping {
                level: 3,
                wide: false,
            },
            WireCommand::TofBlock {
                duration_us: 400,
                half_periods: 3,
            },
        ]
    }

    #[test]
    fn command_round_trip() {
        let id = SensorId(7);
        for command in all_commands() {
            let frame = encode_frame(id, &command);
            let (decoded_id, decoded) = decode_command(&frame).unwrap();
            assert_eq!(decoded_id, id);
            assert_eq!(decoded, command, "round trip of {command:?}");
        }
    }

    #[test]
    fn checksum_covers_every_earlier_byte() {
        for command in all_commands() {
            let frame = encode_frame(SensorId(5), &command);
            let expected = xor_checksum(&frame[..frame.len() - 1]);
            assert_eq!(frame[frame.len() - 1], expected);
        }
    }

    #[test]
    fn single_bit_flip_is_rejected() {
        let frame = encode_frame(
            SensorId(7),
            &WireCommand::Block {
                start_freq_hz: 20_000,
                stop_freq_hz: 100_000,
                duration_us: 50_000,
            },
        );
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    decode_command(&corrupted).is_err(),
                    "flip of byte {byte} bit {bit} was accepted"
                );
            }
        }
    }

    #[test]
    fn frequency_and_duration_endianness() {
        // 100000 Hz = 0x0186A0, 50000 us = 0xC350
        let frame = encode_frame(
            SensorId(7),
            &WireCommand::Block {
                start_freq_hz: 20_000,
                stop_freq_hz: 100_000,
                duration_us: 50_000,
            },
        );
        // payload: opcode, start(3), stop(3), duration(2)
        assert_eq!(
            &frame[6..15],
            &[0x5E, 0x00, 0x4E, 0x20, 0x01, 0x86, 0xA0, 0xC3, 0x50]
        );
    }

    #[test]
    fn damping_two_byte_encoding() {
        let frame = encode_frame(
            SensorId(7),
            &WireCommand::SetDamping {
                level: 200,
                wide: true,
            },
        );
        assert_eq!(&frame[6..9], &[0x63, 0x00, 0xC8]);
    }

    #[test]
    fn broadcast_id_bytes() {
        assert_eq!(SensorId::BROADCAST.to_wire(), [0xFF, 0xFF, 0xFF]);
        let frame = encode_frame(SensorId::BROADCAST, &WireCommand::SetId {
            new_id: SensorId(42),
        });
        assert_eq!(&frame[1..4], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&frame[6..10], &[0x61, 0x00, 0x00, 0x2A]);
    }

    #[test]
    fn response_ack_and_nak() {
        let id = SensorId(5);
        let ack = decode_response(&response_frame(id, ACK, &[0x01, 0x02]), id).unwrap();
        assert_eq!(ack.status, AckNak::Ack);
        assert_eq!(ack.payload, vec![0x01, 0x02]);

        let nak = decode_response(&response_frame(id, NAK, &[]), id).unwrap();
        assert_eq!(nak.status, AckNak::Nak);
        assert!(nak.payload.is_empty());
    }

    #[test]
    fn response_from_wrong_sensor_is_rejected() {
        let frame = response_frame(SensorId(9), ACK, &[]);
        let err = decode_response(&frame, SensorId(5)).unwrap_err();
        assert_eq!(
            err,
            FrameError::WrongResponder {
                want: SensorId(5),
                got: SensorId(9),
            }
        );
        assert!(err.is_malformed_frame());
    }

    #[test]
    fn unknown_status_byte_is_a_protocol_error() {
        let id = SensorId(5);
        let err = decode_response(&response_frame(id, 0x42, &[]), id).unwrap_err();
        assert_eq!(err, FrameError::UnknownStatus(0x42));
        assert!(!err.is_malformed_frame());
    }

    #[test]
    fn truncated_input() {
        assert_eq!(decode_response(&[], SensorId(1)), Err(FrameError::Truncated(0)));
        let frame = response_frame(SensorId(1), ACK, &[0xAA]);
        assert!(matches!(
            decode_response(&frame[..5], SensorId(1)),
            Err(FrameError::Truncated(5))
        ));
    }

    #[test]
    fn audio_decoding_is_signed_big_endian() {
        let samples = decode_audio(&[0x00, 0x01, 0xFF, 0xFF, 0x80, 0x00]);
        assert_eq!(samples, vec![1, -1, i16::MIN]);
    }

    #[test]
    fn env_decoding_scales_by_hundredths() {
        let payload = [0x08, 0xFC, 0x13, 0x88, 0x09, 0x60, 0x17, 0x70];
        let reading = decode_env(&payload).unwrap();
        assert_eq!(reading.inside_temp_c, 23.0);
        assert_eq!(reading.inside_hum_pct, 50.0);
        assert_eq!(reading.outside_temp_c, 24.0);
        assert_eq!(reading.outside_hum_pct, 60.0);
    }

    #[test]
    fn env_length_is_checked() {
        assert_eq!(
            decode_env(&[0x00; 7]),
            Err(FrameError::BadEnvLength(7))
        );
    }

    #[test]
    fn tof_decoding() {
        assert_eq!(decode_tof(&[0x00, 0x01, 0x86, 0xA0]), Ok(100_000));
        assert_eq!(decode_tof(&[0x00; 3]), Err(FrameError::BadTofLength(3)));
    }
}
