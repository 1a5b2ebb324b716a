//! Yubico OTP HID slot protocol
//!
//! The OTP application is driven over 8-byte HID feature reports. A command
//! is a 70-byte frame (64-byte payload, slot byte, CRC over the payload,
//! three filler bytes) written in 7-byte chunks, with the write flag and
//! chunk sequence number in the final report byte. Responses are polled the
//! same way: the device sets the response-pending flag and streams 7-byte
//! chunks until the sequence number wraps to zero.
//!
//! Configuration writes produce no response data. They are acknowledged by
//! the programming sequence counter in the status report incrementing, which
//! [`OtpProtocol::send_and_receive`] verifies before returning the updated
//! status bytes.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use ykey_core::crc;
use ykey_core::error::{Error, Result};
use ykey_core::state::{CommandState, KeepAliveStatus};
use ykey_core::version::Version;

use crate::connection::{OtpConnection, OTP_REPORT_SIZE};

/// Maximum command payload carried by one frame
pub const SLOT_DATA_SIZE: usize = 64;

const FEATURE_RPT_SIZE: usize = OTP_REPORT_SIZE;
const FEATURE_RPT_DATA_SIZE: usize = FEATURE_RPT_SIZE - 1;
const FRAME_SIZE: usize = SLOT_DATA_SIZE + 6;
const FRAME_CHUNKS: usize = FRAME_SIZE / FEATURE_RPT_DATA_SIZE;

const RESP_PENDING_FLAG: u8 = 0x40;
const SLOT_WRITE_FLAG: u8 = 0x80;
const RESP_TIMEOUT_WAIT_FLAG: u8 = 0x20;
const DUMMY_REPORT_WRITE: u8 = 0x8F;
const SEQUENCE_MASK: u8 = 0x1F;

const STATUS_OFFSET_PROG_SEQ: usize = 4;
const STATUS_OFFSET_TOUCH_LOW: usize = 5;
const CONFIG_1_VALID: u8 = 0x01;
const CONFIG_2_VALID: u8 = 0x02;

const WRITE_READY_ATTEMPTS: u32 = 20;
const WRITE_READY_POLL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const TOUCH_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL_INITIAL: Duration = Duration::from_millis(10);
const POLL_INTERVAL_MAX: Duration = Duration::from_millis(500);

/// Protocol driver for the OTP HID interface
pub struct OtpProtocol<C: OtpConnection> {
    connection: C,
    version: Version,
    pgm_seq: u8,
}

impl<C: OtpConnection> OtpProtocol<C> {
    /// Read the initial status report to learn the firmware version and
    /// current programming sequence number
    pub fn new(connection: C) -> Result<Self> {
        let mut protocol = Self {
            connection,
            version: Version::default(),
            pgm_seq: 0,
        };
        let report = protocol.receive_report()?;
        protocol.version = Version::from_bytes(&report[1..4])?;
        protocol.pgm_seq = report[STATUS_OFFSET_PROG_SEQ];
        Ok(protocol)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Current status bytes: version(3), programming sequence, touch level(2)
    pub fn read_status(&mut self) -> Result<[u8; 6]> {
        let report = self.receive_report()?;
        let mut status = [0u8; 6];
        status.copy_from_slice(&report[1..FEATURE_RPT_SIZE - 1]);
        Ok(status)
    }

    /// Send a slot command and read the result
    ///
    /// Returns the raw response data when the command produces any, still
    /// carrying the CRC trailer and padding for the caller to verify and
    /// strip. A configuration write instead returns the updated six status
    /// bytes, once the programming sequence confirms the write took effect.
    pub fn send_and_receive(
        &mut self,
        slot: u8,
        data: &[u8],
        state: Option<&CommandState>,
    ) -> Result<Vec<u8>> {
        if data.len() > SLOT_DATA_SIZE {
            return Err(Error::NotSupported(
                "payload too large for HID frame".into(),
            ));
        }
        let mut payload = [0u8; SLOT_DATA_SIZE];
        payload[..data.len()].copy_from_slice(data);
        debug!(slot = format_args!("0x{:02x}", slot), "sending OTP frame");
        self.send_frame(&pack_frame(slot, &payload))?;
        self.read_frame(state)
    }

    fn receive_report(&mut self) -> Result<[u8; FEATURE_RPT_SIZE]> {
        let mut report = [0u8; FEATURE_RPT_SIZE];
        self.connection.receive(&mut report)?;
        Ok(report)
    }

    fn send_frame(&mut self, frame: &[u8; FRAME_SIZE]) -> Result<()> {
        for (seq, chunk) in frame.chunks_exact(FEATURE_RPT_DATA_SIZE).enumerate() {
            // All-zero chunks are skipped, except the first and last
            if seq == 0 || seq == FRAME_CHUNKS - 1 || chunk.iter().any(|&b| b != 0) {
                let mut report = [0u8; FEATURE_RPT_SIZE];
                report[..FEATURE_RPT_DATA_SIZE].copy_from_slice(chunk);
                report[FEATURE_RPT_DATA_SIZE] = SLOT_WRITE_FLAG | seq as u8;
                self.await_ready_to_write()?;
                self.connection.send(&report)?;
            }
        }
        Ok(())
    }

    /// Wait for the device to clear the write flag
    fn await_ready_to_write(&mut self) -> Result<()> {
        for attempt in 0..WRITE_READY_ATTEMPTS {
            let report = self.receive_report()?;
            if report[FEATURE_RPT_SIZE - 1] & SLOT_WRITE_FLAG == 0 {
                return Ok(());
            }
            if attempt + 1 < WRITE_READY_ATTEMPTS {
                thread::sleep(WRITE_READY_POLL);
            }
        }
        Err(Error::Timeout)
    }

    fn read_frame(&mut self, state: Option<&CommandState>) -> Result<Vec<u8>> {
        let mut response: Vec<u8> = Vec::new();
        let mut seq: u8 = 0;
        let mut needs_touch = false;
        let mut touch_extended = false;
        let mut poll_interval = POLL_INTERVAL_INITIAL;
        let mut deadline = Instant::now() + READ_TIMEOUT;

        loop {
            let report = self.receive_report()?;
            let status_byte = report[FEATURE_RPT_SIZE - 1];

            if status_byte & RESP_PENDING_FLAG != 0 {
                // Response chunk
                if seq == status_byte & SEQUENCE_MASK {
                    response.extend_from_slice(&report[..FEATURE_RPT_DATA_SIZE]);
                    seq = seq.wrapping_add(1);
                } else if status_byte & SEQUENCE_MASK == 0 {
                    // Sequence wrapped to zero: transmission complete
                    self.reset_state()?;
                    return Ok(response);
                }
            } else if status_byte == 0 {
                // Status report: the device is idle again
                let next_pgm_seq = report[STATUS_OFFSET_PROG_SEQ];
                if !response.is_empty() {
                    return Err(Error::bad_response("incomplete transfer"));
                } else if next_pgm_seq == self.pgm_seq.wrapping_add(1)
                    || (next_pgm_seq == 0
                        && report[STATUS_OFFSET_TOUCH_LOW] & (CONFIG_1_VALID | CONFIG_2_VALID)
                            == 0)
                {
                    // Programming sequence updated: the write took effect.
                    // A sequence of zero with no valid configurations means
                    // the last configuration was just deleted.
                    self.pgm_seq = next_pgm_seq;
                    let mut status = [0u8; 6];
                    status.copy_from_slice(&report[1..FEATURE_RPT_SIZE - 1]);
                    return Ok(status.to_vec());
                } else if needs_touch {
                    return Err(Error::Timeout);
                } else {
                    return Err(Error::bad_response("no data"));
                }
            } else {
                // The device is busy, possibly waiting for touch
                if status_byte & RESP_TIMEOUT_WAIT_FLAG != 0 {
                    if let Some(state) = state {
                        state.on_keepalive(KeepAliveStatus::UpNeeded);
                    }
                    needs_touch = true;
                    if !touch_extended {
                        debug!("OTP slot is waiting for touch");
                        deadline = Instant::now() + TOUCH_TIMEOUT;
                        touch_extended = true;
                    }
                } else if let Some(state) = state {
                    state.on_keepalive(KeepAliveStatus::Processing);
                }
                if let Some(state) = state {
                    if state.is_cancelled() {
                        self.reset_state()?;
                        return Err(Error::Cancelled);
                    }
                }
                if Instant::now() >= deadline {
                    self.reset_state()?;
                    return Err(Error::Timeout);
                }
                thread::sleep(poll_interval);
                poll_interval = (poll_interval * 2).min(POLL_INTERVAL_MAX);
            }
        }
    }

    /// Force the device out of any pending read or write state
    fn reset_state(&mut self) -> Result<()> {
        let mut report = [0u8; FEATURE_RPT_SIZE];
        report[FEATURE_RPT_SIZE - 1] = DUMMY_REPORT_WRITE;
        self.connection.send(&report)
    }
}

fn pack_frame(slot: u8, payload: &[u8; SLOT_DATA_SIZE]) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[..SLOT_DATA_SIZE].copy_from_slice(payload);
    frame[SLOT_DATA_SIZE] = slot;
    // The frame carries the CRC itself, not its complement
    frame[SLOT_DATA_SIZE + 1..SLOT_DATA_SIZE + 3]
        .copy_from_slice(&crc::calculate(payload).to_le_bytes());
    frame
}
