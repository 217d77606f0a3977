//! Receive-side plumbing shared with the serial transport.
//!
//! The transport's receive interrupt reports byte counts to a registered
//! `RxListener`; the bytes themselves stay in the transport until a task
//! collects them with `Serial::receive()`.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{AnyhowResult, Error, Result};

/// Receiver of byte-count notifications from the transport's receive interrupt.
pub trait RxListener: Sync {
    fn on_receive(&self, count: usize);
}

/// Trait for the serial transport carrying the update protocol.
///
/// Implementations lock onto the first peripheral which registers a listener
/// and refuse registrations from any other with `Error::Locked` until
/// `unlock()` is called.
pub trait Serial<'a> {
    /// Transmit all of `data`.
    fn transmit(&mut self, data: &[u8]) -> AnyhowResult<()>;

    /// Move `buf.len()` pending received bytes into `buf`.
    fn receive(&mut self, buf: &mut [u8]) -> AnyhowResult<()>;

    /// Drop any received bytes not yet moved out with `receive()`.
    fn discard_rx(&mut self);

    /// Route byte-count notifications to `listener`.
    fn register_rx(&mut self, listener: &'a dyn RxListener) -> Result<()>;

    /// Stop byte-count notifications.
    fn deregister_rx(&mut self) -> Result<()>;

    /// Release exclusive ownership of the port.
    fn unlock(&mut self);
}

/// Identifies a physical peripheral (UART, SPI, I2C...) behind a `Serial` port.
pub type PeripheralId = u8;

/// Tracks which peripheral holds the serial port.
#[derive(Copy, Clone, Debug, Default)]
pub struct PortLock {
    owner: Option<PeripheralId>,
}

impl PortLock {
    pub const fn new() -> Self {
        PortLock { owner: None }
    }

    /// Take the port for `id`, or confirm `id` already holds it.
    pub fn claim(&mut self, id: PeripheralId) -> Result<()> {
        match self.owner {
            Some(owner) if owner != id => {
                log::warn!("Peripheral {} refused, port held by {}", id, owner);
                Err(Error::Locked)
            }
            Some(_) => Ok(()),
            None => {
                log::debug!("Serial port locked to peripheral {}", id);
                self.owner = Some(id);
                Ok(())
            }
        }
    }

    pub fn release(&mut self) {
        if let Some(owner) = self.owner.take() {
            log::debug!("Serial port released by peripheral {}", owner);
        }
    }

    pub fn owner(&self) -> Option<PeripheralId> {
        self.owner
    }
}

/// Byte-count accumulator written by the receive interrupt.
///
/// Counts keep accumulating across frame boundaries, so frames which arrive
/// before the previous one is consumed stay queued.
#[derive(Debug, Default)]
pub struct RxCounter {
    bytes: AtomicUsize,
}

impl RxCounter {
    pub const fn new() -> Self {
        RxCounter { bytes: AtomicUsize::new(0) }
    }

    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Release);
    }

    /// Number of counted bytes not yet taken.
    pub fn available(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    /// Consume `n` counted bytes if at least that many have arrived.
    pub fn take(&self, n: usize) -> bool {
        self.bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(n))
            .is_ok()
    }
}

impl RxListener for RxCounter {
    fn on_receive(&self, count: usize) {
        self.bytes.fetch_add(count, Ordering::AcqRel);
    }
}

/// A registration of an `RxCounter` with the serial port.
///
/// Arming and disarming are idempotent.
#[derive(Debug)]
pub struct Subscription<'a> {
    counter: &'a RxCounter,
    armed: bool,
}

impl<'a> Subscription<'a> {
    pub fn new(counter: &'a RxCounter) -> Self {
        Subscription { counter, armed: false }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Register the counter with `port`, starting a fresh count.
    ///
    /// Bytes which arrived while nothing was counting are discarded, so the
    /// count and the transport's pending bytes start out in step.
    pub fn arm<S: Serial<'a>>(&mut self, port: &mut S) -> Result<()> {
        if !self.armed {
            port.discard_rx();
            self.counter.reset();
            port.register_rx(self.counter)?;
            self.armed = true;
        }
        Ok(())
    }

    pub fn disarm<S: Serial<'a>>(&mut self, port: &mut S) -> Result<()> {
        if self.armed {
            self.armed = false;
            port.deregister_rx()?;
        }
        Ok(())
    }

    /// Collect `buf.len()` bytes from `port` once that many have been counted.
    ///
    /// Returns `Error::NoData` if they have not all arrived yet.
    pub fn collect<S: Serial<'a>>(&mut self, port: &mut S, buf: &mut [u8]) -> Result<()> {
        if !self.counter.take(buf.len()) {
            return Err(Error::NoData);
        }
        port.receive(buf)?;
        Ok(())
    }
}
