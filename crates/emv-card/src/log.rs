//! Append-only record of every command/response exchange
//!
//! The log is the ground truth for extraction: fields are pulled out of it
//! after the fact instead of being captured by the phase that saw them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use emv_common::StatusWord;

/// One command/response exchange. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduLogEntry {
    command: Vec<u8>,
    /// Command this exchange completes (GET RESPONSE after 61xx)
    origin: Option<Vec<u8>>,
    response: Vec<u8>,
    status: StatusWord,
    description: String,
    duration: Duration,
    timestamp: DateTime<Utc>,
}

impl ApduLogEntry {
    /// `response` is the raw answer with its trailing status word
    ///
    /// Returns `None` when the response is too short to carry a status word.
    pub fn new(
        command: Vec<u8>,
        response: Vec<u8>,
        description: impl Into<String>,
        duration: Duration,
    ) -> Option<Self> {
        let status = StatusWord::from_response(&response)?;
        Some(Self {
            command,
            origin: None,
            response,
            status,
            description: description.into(),
            duration,
            timestamp: Utc::now(),
        })
    }

    /// Mark this exchange as fetching the answer to `original`
    pub fn answering(mut self, original: &[u8]) -> Self {
        self.origin = Some(original.to_vec());
        self
    }

    /// Bytes actually sent
    pub fn command(&self) -> &[u8] {
        &self.command
    }

    /// The command whose answer this entry carries
    pub fn request(&self) -> &[u8] {
        self.origin.as_deref().unwrap_or(&self.command)
    }

    /// Full response including the status word
    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// Response body without the status word
    pub fn data(&self) -> &[u8] {
        &self.response[..self.response.len() - 2]
    }

    pub fn status(&self) -> StatusWord {
        self.status
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Instruction byte of the request
    pub fn ins(&self) -> Option<u8> {
        self.request().get(1).copied()
    }

    /// Parameter bytes of the request
    pub fn p1_p2(&self) -> Option<(u8, u8)> {
        match self.request() {
            [_, _, p1, p2, ..] => Some((*p1, *p2)),
            _ => None,
        }
    }

    /// Request data field (short Lc form)
    pub fn command_data(&self) -> &[u8] {
        match self.request() {
            [_, _, _, _, lc, rest @ ..] if *lc as usize <= rest.len() => &rest[..*lc as usize],
            _ => &[],
        }
    }
}

/// Ordered, append-only exchange log
#[derive(Debug, Clone, Default)]
pub struct ApduLog {
    entries: Vec<ApduLogEntry>,
}

impl ApduLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: ApduLogEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ApduLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest entry first
    pub fn newest_first(&self) -> impl Iterator<Item = &ApduLogEntry> {
        self.entries.iter().rev()
    }

    /// Total time spent waiting on the card
    pub fn total_duration(&self) -> Duration {
        self.entries.iter().map(|e| e.duration).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(command: &[u8], response: &[u8]) -> ApduLogEntry {
        ApduLogEntry::new(
            command.to_vec(),
            response.to_vec(),
            "test",
            Duration::from_millis(3),
        )
        .unwrap()
    }

    #[test]
    fn test_status_is_trailing_bytes() {
        let e = entry(&[0x00, 0xB2, 0x01, 0x0C, 0x00], &[0x70, 0x00, 0x6A, 0x83]);
        assert_eq!(e.status(), StatusWord::RECORD_NOT_FOUND);
        assert_eq!(e.data(), &[0x70, 0x00]);
        assert_eq!(e.ins(), Some(0xB2));
        assert_eq!(e.p1_p2(), Some((0x01, 0x0C)));
    }

    #[test]
    fn test_short_response_rejected() {
        assert!(ApduLogEntry::new(vec![0x00], vec![0x90], "x", Duration::ZERO).is_none());
    }

    #[test]
    fn test_command_data() {
        let e = entry(&[0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00], &[0x90, 0x00]);
        assert_eq!(e.command_data(), &[0x83, 0x00]);
        let e = entry(&[0x80, 0xCA, 0x9F, 0x17, 0x00], &[0x90, 0x00]);
        assert_eq!(e.command_data(), &[] as &[u8]);
    }

    #[test]
    fn test_get_response_reports_original_request() {
        let select = [0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00, 0x00];
        let e = entry(&[0x00, 0xC0, 0x00, 0x00, 0x04], &[0x6F, 0x00, 0x90, 0x00])
            .answering(&select);
        assert_eq!(e.command(), &[0x00, 0xC0, 0x00, 0x00, 0x04]);
        assert_eq!(e.ins(), Some(0xA4));
        assert_eq!(e.command_data(), &[0x3F, 0x00]);
    }

    #[test]
    fn test_order_preserved() {
        let mut log = ApduLog::new();
        log.append(entry(&[0x01], &[0x90, 0x00]));
        log.append(entry(&[0x02], &[0x90, 0x00]));
        assert_eq!(log.entries()[0].command(), &[0x01]);
        assert_eq!(log.newest_first().next().unwrap().command(), &[0x02]);
        assert_eq!(log.total_duration(), Duration::from_millis(6));
    }
}
