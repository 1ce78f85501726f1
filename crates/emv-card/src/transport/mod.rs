//! Card transports
//!
//! A transport moves raw command bytes to a card and raw response bytes back.
//! It never interprets either. One exchange is in flight at a time; taking
//! `&mut self` makes that a compile-time guarantee for a single transport.

pub mod mock;
pub mod pn532;

use std::time::Duration;

use crate::error::TransportError;

pub use mock::{MockFailure, MockTransport};
pub use pn532::{Pn532Transport, TargetInfo};
pub use crate::reader::PcscTransport;

/// Capability shared by every reader backend
pub trait Transport: Send {
    /// Send one command APDU and return the full response, status word included
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Upper bound for a single exchange; backends that can enforce it should
    fn set_timeout(&mut self, _timeout: Duration) {}

    /// Short label for logs
    fn name(&self) -> String {
        "transport".to_string()
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).transmit(command)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).transmit(command)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }

    fn name(&self) -> String {
        (**self).name()
    }
}
