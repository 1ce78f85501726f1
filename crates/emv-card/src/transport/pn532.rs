//! PN532 NFC controller over a byte stream (Bluetooth RFCOMM, USB serial)
//!
//! Host frames are `00 00 FF LEN LCS D4 CMD DATA.. DCS 00`; the controller
//! acknowledges every frame with `00 00 FF 00 FF 00` before sending its
//! answer with TFI `D5` and `CMD + 1`.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::Transport;
use crate::error::TransportError;

const PREAMBLE: [u8; 3] = [0x00, 0x00, 0xFF];
const ACK: [u8; 6] = [0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00];
const TFI_HOST: u8 = 0xD4;
const TFI_PN532: u8 = 0xD5;
/// Pause between reads while the controller has nothing for us
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// PN532 command codes
pub mod cmd {
    pub const GET_FIRMWARE_VERSION: u8 = 0x02;
    pub const SAM_CONFIGURATION: u8 = 0x14;
    pub const IN_DATA_EXCHANGE: u8 = 0x40;
    pub const IN_LIST_PASSIVE_TARGET: u8 = 0x4A;
    pub const IN_RELEASE: u8 = 0x52;
}

/// A card found by `InListPassiveTarget`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub target_number: u8,
    pub atqa: [u8; 2],
    pub sak: u8,
    pub uid: Vec<u8>,
}

impl TargetInfo {
    /// Card family from the SAK byte
    pub fn card_type(&self) -> String {
        if self.sak & 0x20 != 0 {
            return "ISO14443-4 (EMV/Smart Card)".to_string();
        }
        match self.sak {
            0x08 => "MIFARE Classic 1K".to_string(),
            0x18 => "MIFARE Classic 4K".to_string(),
            0x00 => "MIFARE Ultralight".to_string(),
            0x10 => "MIFARE Plus".to_string(),
            other => format!("Unknown (SAK: 0x{other:02X})"),
        }
    }

    pub fn supports_iso14443_4(&self) -> bool {
        self.sak & 0x20 != 0
    }
}

/// TFI, command code and parameters of a normal frame share one length byte
const MAX_PARAMS: usize = 0xFF - 2;

/// Build a normal information frame from host to PN532
pub fn build_frame(command: u8, params: &[u8]) -> Result<Vec<u8>, TransportError> {
    if params.len() > MAX_PARAMS {
        return Err(TransportError::CommandTooLong {
            length: params.len(),
            limit: MAX_PARAMS,
        });
    }
    let length = (params.len() + 2) as u8;
    let lcs = (!length).wrapping_add(1);

    let sum = params
        .iter()
        .fold(TFI_HOST.wrapping_add(command), |acc, b| acc.wrapping_add(*b));
    let dcs = (!sum).wrapping_add(1);

    let mut frame = Vec::with_capacity(params.len() + 9);
    frame.extend_from_slice(&PREAMBLE);
    frame.push(length);
    frame.push(lcs);
    frame.push(TFI_HOST);
    frame.push(command);
    frame.extend_from_slice(params);
    frame.push(dcs);
    frame.push(0x00);
    Ok(frame)
}

/// PN532 driven over any bidirectional byte stream
pub struct Pn532Transport<S> {
    stream: S,
    timeout: Duration,
    target: Option<TargetInfo>,
}

impl<S: Read + Write + Send> Pn532Transport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            timeout: Duration::from_secs(5),
            target: None,
        }
    }

    /// Wake the controller from low-power mode and put the SAM in normal mode
    pub fn wake(&mut self) -> Result<(), TransportError> {
        self.stream.write_all(&[0x55; 10])?;
        self.stream.write_all(&[0x00; 6])?;
        self.stream.flush()?;
        // Mode: normal, timeout 50 ms * 0x14, IRQ on
        self.command(cmd::SAM_CONFIGURATION, &[0x01, 0x14, 0x01])?;
        Ok(())
    }

    /// Firmware as `(ic, version, revision, support)`
    pub fn firmware_version(&mut self) -> Result<(u8, u8, u8, u8), TransportError> {
        match self.command(cmd::GET_FIRMWARE_VERSION, &[])?.as_slice() {
            [ic, ver, rev, support, ..] => Ok((*ic, *ver, *rev, *support)),
            other => Err(TransportError::Frame(format!(
                "short firmware answer: {}",
                hex::encode_upper(other)
            ))),
        }
    }

    /// Look for one ISO14443A card in the field
    pub fn detect_card(&mut self) -> Result<Option<TargetInfo>, TransportError> {
        let answer = self.command(cmd::IN_LIST_PASSIVE_TARGET, &[0x01, 0x00])?;
        if answer.first().copied().unwrap_or(0) == 0 {
            self.target = None;
            return Ok(None);
        }
        if answer.len() < 6 {
            return Err(TransportError::Frame(format!(
                "short target list: {}",
                hex::encode_upper(&answer)
            )));
        }

        let uid_len = answer[5] as usize;
        let uid = answer
            .get(6..6 + uid_len)
            .ok_or_else(|| TransportError::Frame("UID runs past frame".to_string()))?
            .to_vec();
        let target = TargetInfo {
            target_number: answer[1],
            atqa: [answer[2], answer[3]],
            sak: answer[4],
            uid,
        };
        debug!(
            uid = %hex::encode_upper(&target.uid),
            card_type = %target.card_type(),
            "PN532 detected card"
        );
        self.target = Some(target.clone());
        Ok(Some(target))
    }

    /// Deselect the current card
    pub fn release(&mut self) -> Result<(), TransportError> {
        if let Some(target) = self.target.take() {
            self.command(cmd::IN_RELEASE, &[target.target_number])?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Send one command frame, wait for the ACK and return the answer payload
    pub fn command(&mut self, command: u8, params: &[u8]) -> Result<Vec<u8>, TransportError> {
        let frame = build_frame(command, params)?;
        trace!(tx = %hex::encode_upper(&frame), "PN532 frame");
        self.stream.write_all(&frame)?;
        self.stream.flush()?;

        let deadline = Instant::now() + self.timeout;
        let ack = self.read_exact_by(6, deadline)?;
        if ack != ACK {
            return Err(TransportError::Frame(format!(
                "expected ACK, got {}",
                hex::encode_upper(&ack)
            )));
        }

        let payload = self.read_frame(deadline)?;
        match payload.as_slice() {
            [TFI_PN532, code, rest @ ..] if *code == command.wrapping_add(1) => Ok(rest.to_vec()),
            _ => Err(TransportError::Frame(format!(
                "unexpected answer to 0x{command:02X}: {}",
                hex::encode_upper(&payload)
            ))),
        }
    }

    /// Read one information frame and return TFI + data
    fn read_frame(&mut self, deadline: Instant) -> Result<Vec<u8>, TransportError> {
        let header = self.read_exact_by(5, deadline)?;
        if header[..3] != PREAMBLE {
            return Err(TransportError::Frame(format!(
                "invalid header {}",
                hex::encode_upper(&header)
            )));
        }
        let (length, lcs) = (header[3], header[4]);
        if length.wrapping_add(lcs) != 0 {
            return Err(TransportError::Frame("invalid length checksum".to_string()));
        }

        let body = self.read_exact_by(length as usize + 2, deadline)?;
        let (payload, trailer) = body.split_at(length as usize);
        let sum = payload
            .iter()
            .fold(trailer[0], |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(TransportError::Frame("invalid data checksum".to_string()));
        }
        Ok(payload.to_vec())
    }

    fn read_exact_by(
        &mut self,
        count: usize,
        deadline: Instant,
    ) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Timeout(self.timeout));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Ok(n) => filled += n,
                Err(e) if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
                {
                    if Instant::now() >= deadline {
                        return Err(TransportError::Timeout(self.timeout));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(buf)
    }
}

impl<S: Read + Write + Send> Transport for Pn532Transport<S> {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let target = match &self.target {
            Some(target) => target.target_number,
            None => match self.detect_card()? {
                Some(target) => target.target_number,
                None => return Err(TransportError::Disconnected),
            },
        };

        let mut params = Vec::with_capacity(command.len() + 1);
        params.push(target);
        params.extend_from_slice(command);

        let answer = self.command(cmd::IN_DATA_EXCHANGE, &params)?;
        match answer.split_first() {
            Some((0x00, response)) => Ok(response.to_vec()),
            // 0x01: target did not answer in time
            Some((0x01, _)) => Err(TransportError::Timeout(self.timeout)),
            // 0x27 / 0x29: target released or removed from the field
            Some((0x27, _)) | Some((0x29, _)) => {
                self.target = None;
                Err(TransportError::Disconnected)
            }
            Some((status, _)) => Err(TransportError::Frame(format!(
                "InDataExchange status 0x{status:02X}"
            ))),
            None => Err(TransportError::NoResponse),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn name(&self) -> String {
        "pn532".to_string()
    }
}
