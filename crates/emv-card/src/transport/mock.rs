//! Scripted in-memory card for tests and dry runs

use std::time::Duration;

use super::Transport;
use crate::error::TransportError;

/// Transport-level failure a script can inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Disconnected,
    Timeout,
    NoResponse,
}

impl MockFailure {
    fn to_error(self) -> TransportError {
        match self {
            MockFailure::Disconnected => TransportError::Disconnected,
            MockFailure::Timeout => TransportError::Timeout(Duration::from_secs(5)),
            MockFailure::NoResponse => TransportError::NoResponse,
        }
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Bytes(Vec<u8>),
    Fail(MockFailure),
}

#[derive(Debug, Clone)]
struct Rule {
    prefix: Vec<u8>,
    exact: bool,
    replies: Vec<Reply>,
    served: usize,
}

impl Rule {
    fn matches(&self, command: &[u8]) -> bool {
        if self.exact {
            command == self.prefix.as_slice()
        } else {
            command.starts_with(&self.prefix)
        }
    }

    /// Replies cycle, so a two-entry script alternates forever
    fn next_reply(&mut self) -> Reply {
        let reply = self.replies[self.served % self.replies.len()].clone();
        self.served += 1;
        reply
    }
}

/// Card that answers from a script
///
/// Rules match on an exact command or a command prefix; among matching rules
/// the longest pattern wins, ties going to the rule added last. Commands that
/// match nothing get the fallback response, or `ScriptExhausted` if none is set.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    rules: Vec<Rule>,
    fallback: Option<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, prefix: Vec<u8>, exact: bool, replies: Vec<Reply>) -> Self {
        if !replies.is_empty() {
            self.rules.push(Rule {
                prefix,
                exact,
                replies,
                served: 0,
            });
        }
        self
    }

    /// Answer every command starting with `prefix`
    pub fn respond(self, prefix: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) -> Self {
        self.push(prefix.into(), false, vec![Reply::Bytes(response.into())])
    }

    /// Answer exactly `command`
    pub fn respond_exact(self, command: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) -> Self {
        self.push(command.into(), true, vec![Reply::Bytes(response.into())])
    }

    /// Answer commands starting with `prefix` with each response in turn, cycling
    pub fn respond_sequence(self, prefix: impl Into<Vec<u8>>, responses: Vec<Vec<u8>>) -> Self {
        let replies = responses.into_iter().map(Reply::Bytes).collect();
        self.push(prefix.into(), false, replies)
    }

    /// Fail every command starting with `prefix`
    pub fn fail(self, prefix: impl Into<Vec<u8>>, failure: MockFailure) -> Self {
        self.push(prefix.into(), false, vec![Reply::Fail(failure)])
    }

    /// Response for commands no rule matches
    pub fn fallback(mut self, response: impl Into<Vec<u8>>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    /// Sleep this long before every answer
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every command received, in order
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Commands received with the given instruction byte
    pub fn sent_with_ins(&self, ins: u8) -> Vec<&[u8]> {
        self.sent
            .iter()
            .filter(|c| c.get(1) == Some(&ins))
            .map(Vec::as_slice)
            .collect()
    }
}

impl Transport for MockTransport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.sent.push(command.to_vec());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let rule = self
            .rules
            .iter_mut()
            .filter(|rule| rule.matches(command))
            .max_by_key(|rule| (rule.exact, rule.prefix.len()));

        match rule.map(Rule::next_reply) {
            Some(Reply::Bytes(response)) => Ok(response),
            Some(Reply::Fail(failure)) => Err(failure.to_error()),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| TransportError::ScriptExhausted(hex::encode_upper(command))),
        }
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let mut mock = MockTransport::new()
            .respond(vec![0x00, 0xA4], vec![0x6A, 0x82])
            .respond(vec![0x00, 0xA4, 0x04, 0x00, 0x07], vec![0x90, 0x00]);

        assert_eq!(mock.transmit(&[0x00, 0xA4, 0x04, 0x00, 0x07, 0xA0]).unwrap(), vec![0x90, 0x00]);
        assert_eq!(mock.transmit(&[0x00, 0xA4, 0x04, 0x00, 0x0E]).unwrap(), vec![0x6A, 0x82]);
        assert_eq!(mock.sent().len(), 2);
    }

    #[test]
    fn test_sequence_cycles() {
        let mut mock = MockTransport::new()
            .respond_sequence(vec![0x80], vec![vec![0x90, 0x00], vec![0x6F, 0x00]]);
        let answers: Vec<Vec<u8>> = (0..4).map(|_| mock.transmit(&[0x80, 0xCA]).unwrap()).collect();
        assert_eq!(answers[0], answers[2]);
        assert_eq!(answers[1], answers[3]);
        assert_ne!(answers[0], answers[1]);
    }

    #[test]
    fn test_failure_and_fallback() {
        let mut mock = MockTransport::new()
            .fail(vec![0x00, 0xB2], MockFailure::Disconnected)
            .fallback(vec![0x6D, 0x00]);
        assert!(matches!(
            mock.transmit(&[0x00, 0xB2, 0x01, 0x0C, 0x00]),
            Err(TransportError::Disconnected)
        ));
        assert_eq!(mock.transmit(&[0x00, 0x84]).unwrap(), vec![0x6D, 0x00]);

        let mut bare = MockTransport::new();
        assert!(matches!(
            bare.transmit(&[0x00]),
            Err(TransportError::ScriptExhausted(_))
        ));
    }
}
