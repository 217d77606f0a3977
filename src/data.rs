//! Length and payload reception for the data phase of an update.
//!
//! After a `write` command the host sends a big-endian 32-bit payload length,
//! then the payload itself, each only once the device has acknowledged.

use crate::serial::{RxCounter, Serial, Subscription};
use crate::Result;

pub const LENGTH_SIZE: usize = 4;

#[derive(Debug)]
pub struct DataReceiver<'a> {
    rx: Subscription<'a>,
}

impl<'a> DataReceiver<'a> {
    pub fn new(counter: &'a RxCounter) -> Self {
        DataReceiver { rx: Subscription::new(counter) }
    }

    pub fn is_armed(&self) -> bool {
        self.rx.is_armed()
    }

    pub fn arm<S: Serial<'a>>(&mut self, port: &mut S) -> Result<()> {
        self.rx.arm(port)
    }

    pub fn disarm<S: Serial<'a>>(&mut self, port: &mut S) -> Result<()> {
        self.rx.disarm(port)
    }

    /// Collect the payload length once all of its bytes have arrived.
    pub fn try_length<S: Serial<'a>>(&mut self, port: &mut S) -> Result<usize> {
        let mut bytes = [0u8; LENGTH_SIZE];
        self.rx.collect(port, &mut bytes)?;
        let length = u32::from_be_bytes(bytes) as usize;
        log::debug!("Payload length {}", length);
        Ok(length)
    }

    /// Fill `buf` with the payload once `buf.len()` bytes have arrived.
    pub fn try_payload<S: Serial<'a>>(&mut self, port: &mut S, buf: &mut [u8]) -> Result<()> {
        self.rx.collect(port, buf)?;
        log::debug!("Received {} byte payload", buf.len());
        Ok(())
    }
}
