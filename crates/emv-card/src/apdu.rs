//! APDU (Application Protocol Data Unit) command handling

use emv_common::{encode_tlv, StatusWord};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::transport::Transport;

/// APDU response containing data and status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    /// Response data (without status word)
    pub data: Vec<u8>,
    /// Status word SW1
    pub sw1: u8,
    /// Status word SW2
    pub sw2: u8,
}

impl ApduResponse {
    /// Split a raw response into data and status word
    pub fn from_raw(raw: &[u8]) -> Result<Self, TransportError> {
        if raw.len() < 2 {
            return Err(TransportError::ShortResponse(raw.len()));
        }

        let sw1 = raw[raw.len() - 2];
        let sw2 = raw[raw.len() - 1];
        let data = raw[..raw.len() - 2].to_vec();

        Ok(Self { data, sw1, sw2 })
    }

    /// Check if the response indicates success (9000 or 61xx)
    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    pub fn status(&self) -> StatusWord {
        StatusWord::new(self.sw1, self.sw2)
    }

    /// Get status word as hex string (e.g., "9000")
    pub fn status_string(&self) -> String {
        self.status().to_string()
    }
}

/// Largest command body a short (one byte) Lc can describe
pub const MAX_SHORT_DATA: usize = 0xFF;

/// Send raw APDU bytes and split the response
pub fn send_apdu(
    transport: &mut dyn Transport,
    apdu: &[u8],
) -> Result<ApduResponse, TransportError> {
    let raw = transport.transmit(apdu)?;
    ApduResponse::from_raw(&raw)
}

/// APDU command builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    le: Option<u8>,
}

impl ApduCommand {
    /// Create a new APDU command
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// Set command data
    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Set expected response length
    pub fn le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    pub fn ins(&self) -> u8 {
        self.ins
    }

    /// Build the APDU command bytes (short Lc/Le form)
    pub fn build(&self) -> Result<Vec<u8>, TransportError> {
        if self.data.len() > MAX_SHORT_DATA {
            return Err(TransportError::CommandTooLong {
                length: self.data.len(),
                limit: MAX_SHORT_DATA,
            });
        }
        let mut apdu = vec![self.cla, self.ins, self.p1, self.p2];

        if !self.data.is_empty() {
            apdu.push(self.data.len() as u8);
            apdu.extend_from_slice(&self.data);
        }

        if let Some(le) = self.le {
            apdu.push(le);
        }

        Ok(apdu)
    }

    /// Send this command through a transport
    pub fn send(&self, transport: &mut dyn Transport) -> Result<ApduResponse, TransportError> {
        send_apdu(transport, &self.build()?)
    }
}

/// Instruction bytes used by the EMV workflow
pub mod ins {
    pub const SELECT: u8 = 0xA4;
    pub const GET_PROCESSING_OPTIONS: u8 = 0xA8;
    pub const READ_RECORD: u8 = 0xB2;
    pub const GENERATE_AC: u8 = 0xAE;
    pub const INTERNAL_AUTHENTICATE: u8 = 0x88;
    pub const GET_DATA: u8 = 0xCA;
    pub const GET_RESPONSE: u8 = 0xC0;
    pub const GET_CHALLENGE: u8 = 0x84;
}

/// Cryptogram requested in GENERATE AC (reference control parameter, P1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptogramType {
    /// Application Authentication Cryptogram (decline)
    Aac,
    /// Transaction Certificate (approve offline)
    Tc,
    /// Authorisation Request Cryptogram (go online)
    Arqc,
}

impl CryptogramType {
    pub fn p1(&self) -> u8 {
        match self {
            CryptogramType::Aac => 0x00,
            CryptogramType::Tc => 0x40,
            CryptogramType::Arqc => 0x80,
        }
    }

    /// Decode the cryptogram type bits (b8-b7) of a Cryptogram Information Data byte
    pub fn from_cid(cid: u8) -> Option<Self> {
        match cid & 0xC0 {
            0x00 => Some(CryptogramType::Aac),
            0x40 => Some(CryptogramType::Tc),
            0x80 => Some(CryptogramType::Arqc),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CryptogramType::Aac => "AAC",
            CryptogramType::Tc => "TC",
            CryptogramType::Arqc => "ARQC",
        }
    }
}

/// Common EMV APDU commands
pub mod commands {
    use super::*;

    /// SELECT command (by name/AID)
    pub fn select(aid: &[u8]) -> ApduCommand {
        ApduCommand::new(0x00, ins::SELECT, 0x04, 0x00)
            .data(aid.to_vec())
            .le(0x00)
    }

    /// GET PROCESSING OPTIONS command; wraps the PDOL data in a command template (83)
    pub fn get_processing_options(pdol_data: &[u8]) -> ApduCommand {
        ApduCommand::new(0x80, ins::GET_PROCESSING_OPTIONS, 0x00, 0x00)
            .data(encode_tlv(&[0x83], pdol_data))
            .le(0x00)
    }

    /// READ RECORD command
    pub fn read_record(record_number: u8, sfi: u8) -> ApduCommand {
        let p2 = (sfi << 3) | 0x04;
        ApduCommand::new(0x00, ins::READ_RECORD, record_number, p2).le(0x00)
    }

    /// INTERNAL AUTHENTICATE command (for DDA)
    pub fn internal_authenticate(ddol_data: Vec<u8>) -> ApduCommand {
        ApduCommand::new(0x00, ins::INTERNAL_AUTHENTICATE, 0x00, 0x00)
            .data(ddol_data)
            .le(0x00)
    }

    /// GENERATE APPLICATION CRYPTOGRAM command
    pub fn generate_ac(cryptogram_type: CryptogramType, cdol_data: Vec<u8>) -> ApduCommand {
        ApduCommand::new(0x80, ins::GENERATE_AC, cryptogram_type.p1(), 0x00)
            .data(cdol_data)
            .le(0x00)
    }

    /// GET RESPONSE command, used after a 61xx status
    pub fn get_response(length: u8) -> ApduCommand {
        ApduCommand::new(0x00, ins::GET_RESPONSE, 0x00, 0x00).le(length)
    }

    /// GET DATA command; the tag travels in P1-P2, so it must be one or two bytes
    pub fn get_data(tag: &[u8]) -> Option<ApduCommand> {
        match tag {
            [single] => Some(ApduCommand::new(0x80, ins::GET_DATA, 0x00, *single).le(0x00)),
            [p1, p2] => Some(ApduCommand::new(0x80, ins::GET_DATA, *p1, *p2).le(0x00)),
            _ => None,
        }
    }
}
