//! PC/SC card reader management

use pcsc::{Card, Context, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};
use tracing::debug;

use crate::error::TransportError;
use crate::transport::Transport;

/// Card reader wrapper for managing PC/SC connections
pub struct CardReader {
    context: Context,
}

impl CardReader {
    /// Create a new CardReader by establishing a PC/SC context
    pub fn new() -> Result<Self, pcsc::Error> {
        let context = Context::establish(Scope::User)?;
        Ok(Self { context })
    }

    /// List all available card readers
    pub fn list_readers(&self) -> Result<Vec<String>, pcsc::Error> {
        let mut readers_buf = [0; 2048];
        let readers = self.context.list_readers(&mut readers_buf)?;

        Ok(readers
            .map(|r| r.to_str().unwrap_or("Unknown").to_string())
            .collect())
    }

    /// Connect to the first available reader
    pub fn connect_first(&self) -> Result<PcscTransport, pcsc::Error> {
        let mut readers_buf = [0; 2048];
        let mut readers = self.context.list_readers(&mut readers_buf)?;

        if let Some(reader) = readers.next() {
            let reader_name = reader.to_str().unwrap_or("Unknown").to_string();
            let card = self.context.connect(reader, ShareMode::Shared, Protocols::ANY)?;
            debug!(reader = %reader_name, "Connected to card");
            Ok(PcscTransport::new(card, reader_name))
        } else {
            Err(pcsc::Error::NoReadersAvailable)
        }
    }

    /// Connect to a specific reader by name
    pub fn connect(&self, reader_name: &str) -> Result<PcscTransport, pcsc::Error> {
        let mut readers_buf = [0; 2048];
        let readers = self.context.list_readers(&mut readers_buf)?;

        for reader in readers {
            if reader.to_str().map(|name| name == reader_name).unwrap_or(false) {
                let card = self.context.connect(reader, ShareMode::Shared, Protocols::ANY)?;
                return Ok(PcscTransport::new(card, reader_name.to_string()));
            }
        }

        Err(pcsc::Error::UnknownReader)
    }
}

/// Card connected through a PC/SC reader
///
/// PC/SC has no per-transmit timeout; the workflow measures each exchange
/// and treats an overrun as a timeout.
pub struct PcscTransport {
    card: Card,
    reader_name: String,
}

impl PcscTransport {
    pub fn new(card: Card, reader_name: String) -> Self {
        Self { card, reader_name }
    }

    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }
}

impl Transport for PcscTransport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut rapdu_buf = [0; MAX_BUFFER_SIZE];
        match self.card.transmit(command, &mut rapdu_buf) {
            Ok(rapdu) if rapdu.is_empty() => Err(TransportError::NoResponse),
            Ok(rapdu) => Ok(rapdu.to_vec()),
            Err(pcsc::Error::RemovedCard) | Err(pcsc::Error::NoSmartcard) => {
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(TransportError::Pcsc(e)),
        }
    }

    fn name(&self) -> String {
        format!("pcsc:{}", self.reader_name)
    }
}
