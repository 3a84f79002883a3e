use async_trait::async_trait;
use log::{debug, trace, warn};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const BAUD_RATE: u32 = 921_600;
/// BCM pin driving DE/RE on the RS-485 transceiver.
pub const DIRECTION_PIN: u32 = 18;
/// BCM pin powering the transceiver.
pub const ENABLE_PIN: u32 = 4;

/// Drain time for the UART shift register before the transceiver turns
/// around to receive.
const TX_SETTLE: Duration = Duration::from_millis(50);
/// A reply is considered finished once the line has been quiet this long.
const QUIET_INTERVAL: Duration = Duration::from_millis(10);
const POLL_INTERVAL: Duration = Duration::from_millis(1);
/// The transceiver needs a moment after power-up before the bus is usable.
const ENABLE_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("direction line: {0}")]
    Gpio(#[from] io::Error),
}

/// The single serialization point with the bus. Exactly one task may hold
/// the link; `exchange` writes one frame and collects whatever comes back
/// before the deadline.
#[async_trait]
pub trait BusLink: Send {
    /// Write `frame`, then read until the line has been quiet for 10 ms and
    /// the timeout has passed. An empty return means no reply.
    async fn exchange(&mut self, frame: &[u8], timeout: Duration) -> io::Result<Vec<u8>>;
}

/// One sysfs GPIO output. The pin is exported on open and driven low both on
/// open and on drop.
pub struct OutputLine {
    pin: u32,
    value_path: PathBuf,
}

impl OutputLine {
    pub fn open(pin: u32) -> io::Result<Self> {
        let base = PathBuf::from("/sys/class/gpio");
        let dir = base.join(format!("gpio{pin}"));
        if !dir.exists() {
            fs::write(base.join("export"), pin.to_string())?;
        }
        fs::write(dir.join("direction"), "out")?;
        let line = Self {
            pin,
            value_path: dir.join("value"),
        };
        line.set(false)?;
        Ok(line)
    }

    pub fn set(&self, high: bool) -> io::Result<()> {
        fs::write(&self.value_path, if high { "1" } else { "0" })
    }
}

impl Drop for OutputLine {
    fn drop(&mut self) {
        if let Err(e) = self.set(false) {
            warn!(target: "bus", "failed to release gpio{}: {}", self.pin, e);
        }
    }
}

/// The RS-485 link: serial port plus direction control. Owned by the
/// scheduler task for the process lifetime.
pub struct SerialBus {
    port: Box<dyn serialport::SerialPort>,
    direction: OutputLine,
    _enable: OutputLine,
    log_key: String,
}

impl SerialBus {
    pub fn open(device: &str) -> Result<Self, TransportError> {
        let port = serialport::new(device, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_secs(2))
            .open()?;
        let direction = OutputLine::open(DIRECTION_PIN)?;
        let enable = OutputLine::open(ENABLE_PIN)?;
        enable.set(true)?;
        std::thread::sleep(ENABLE_SETTLE);
        debug!(target: "bus", "opened {} at {} baud", device, BAUD_RATE);
        Ok(Self {
            port,
            direction,
            _enable: enable,
            log_key: "bus".to_string(),
        })
    }
}

#[async_trait]
impl BusLink for SerialBus {
    async fn exchange(&mut self, frame: &[u8], timeout: Duration) -> io::Result<Vec<u8>> {
        self.direction.set(true)?;
        self.port.write_all(frame)?;
        self.port.flush()?;
        tokio::time::sleep(TX_SETTLE).await;
        self.direction.set(false)?;

        let mut response = Vec::new();
        let start = Instant::now();
        let mut last_byte = start;
        let mut chunk = [0u8; 512];
        loop {
            let waiting = self.port.bytes_to_read()? as usize;
            if waiting > 0 {
                let to_read = waiting.min(chunk.len());
                let n = self.port.read(&mut chunk[..to_read])?;
                response.extend_from_slice(&chunk[..n]);
                last_byte = Instant::now();
            }
            let now = Instant::now();
            if now.duration_since(last_byte) > QUIET_INTERVAL && now.duration_since(start) > timeout
            {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        if !response.is_empty() {
            trace!(target: &self.log_key, "received {} bytes", response.len());
        }
        Ok(response)
    }
}
