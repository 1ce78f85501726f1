//! ISO 7816-4 / EMV status word interpretation

use std::fmt;
use std::str::FromStr;

use crate::TlvError;

/// The two trailing bytes of every card response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    pub const FILE_NOT_FOUND: StatusWord = StatusWord(0x6A82);
    pub const RECORD_NOT_FOUND: StatusWord = StatusWord(0x6A83);

    pub fn new(sw1: u8, sw2: u8) -> Self {
        Self(((sw1 as u16) << 8) | sw2 as u16)
    }

    /// Take the status word from the end of a raw response
    pub fn from_response(response: &[u8]) -> Option<Self> {
        match response {
            [.., sw1, sw2] => Some(Self::new(*sw1, *sw2)),
            _ => None,
        }
    }

    pub fn sw1(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn sw2(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// `9000`, or `61xx` (more data available)
    pub fn is_success(&self) -> bool {
        self.0 == 0x9000 || self.sw1() == 0x61
    }

    /// `62xx` / `63xx`: processed, with a warning
    pub fn is_warning(&self) -> bool {
        matches!(self.sw1(), 0x62 | 0x63)
    }

    /// Listed in the ISO 7816-4 / EMV table, or in a known SW1 family
    pub fn is_known(&self) -> bool {
        table_meaning(self.0).is_some() || matches!(self.sw1(), 0x61 | 0x62 | 0x63 | 0x6C)
    }

    /// Human-readable meaning. Advisory text only, never parse it.
    pub fn describe(&self) -> String {
        let (sw1, sw2) = (self.sw1(), self.sw2());
        if let Some(text) = table_meaning(self.0) {
            return text.to_string();
        }

        match sw1 {
            0x61 => format!("Success, {sw2} bytes still available"),
            0x63 if sw2 & 0xF0 == 0xC0 => {
                format!("Verification failed, {} tries remaining", sw2 & 0x0F)
            }
            0x6C => format!("Wrong Le, exact length is {sw2}"),
            0x62 | 0x63 => "Warning, state of non-volatile memory unchanged".to_string(),
            _ => "Unknown status".to_string(),
        }
    }
}

fn table_meaning(code: u16) -> Option<&'static str> {
    let text = match code {
        0x9000 => "Success",
        0x6200 => "No information given (warning)",
        0x6281 => "Part of returned data may be corrupted",
        0x6282 => "End of file reached before reading Le bytes",
        0x6283 => "Selected file deactivated",
        0x6284 => "File control information not formatted correctly",
        0x6300 => "Authentication failed",
        0x6400 => "Execution error, state of non-volatile memory unchanged",
        0x6500 => "Execution error, state of non-volatile memory changed",
        0x6581 => "Memory failure",
        0x6700 => "Wrong length",
        0x6800 => "Function in CLA not supported",
        0x6881 => "Logical channel not supported",
        0x6882 => "Secure messaging not supported",
        0x6900 => "Command not allowed",
        0x6981 => "Command incompatible with file structure",
        0x6982 => "Security status not satisfied",
        0x6983 => "Authentication method blocked",
        0x6984 => "Referenced data invalidated",
        0x6985 => "Conditions of use not satisfied",
        0x6986 => "Command not allowed (no current EF)",
        0x6987 => "Expected secure messaging data objects missing",
        0x6988 => "Secure messaging data objects incorrect",
        0x6A80 => "Incorrect parameters in the data field",
        0x6A81 => "Function not supported",
        0x6A82 => "File or application not found",
        0x6A83 => "Record not found",
        0x6A84 => "Not enough memory space in the file",
        0x6A86 => "Incorrect parameters P1-P2",
        0x6A88 => "Referenced data not found",
        0x6B00 => "Wrong parameters P1-P2",
        0x6D00 => "Instruction code not supported or invalid",
        0x6E00 => "Class not supported",
        0x6F00 => "No precise diagnosis",
        0x9240 => "Error: memory problem",
        0x9400 => "No EF selected",
        0x9402 => "Address range exceeded",
        0x9404 => "FID not found, record not found or comparison pattern not found",
        0x9408 => "Selected file type does not match command",
        0x9802 => "No PIN defined",
        0x9804 => "Access conditions not satisfied, authentication failed",
        0x9835 => "ASK RANDOM or GIVE RANDOM not executed",
        0x9840 => "PIN verification not successful",
        0x9850 => "INCREASE or DECREASE could not be executed, limit reached",
        _ => return None,
    };
    Some(text)
}

impl From<u16> for StatusWord {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for StatusWord {
    type Err = TlvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches("0x");
        if trimmed.len() != 4 {
            return Err(TlvError::InvalidHex(s.to_string()));
        }
        u16::from_str_radix(trimmed, 16)
            .map(StatusWord)
            .map_err(|_| TlvError::InvalidHex(s.to_string()))
    }
}
