//! Command codec for the update protocol.
//!
//! Every command travels as a frame of exactly `FRAME_SIZE` bytes holding
//! the big-endian encoding of a 32-bit dictionary value. The device replies
//! from the `Transmit` dictionary and accepts requests from the `Receive`
//! dictionary; the two are indexed independently.

use core::convert::TryFrom;

use crate::serial::{RxCounter, Serial, Subscription};
use crate::{Error, Result};

pub const FRAME_SIZE: usize = 4;

/// Commands sent by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive)]
#[repr(u32)]
pub enum Transmit {
    Ready = 0x5245_4459,
    Error = 0x4552_524F,
}

/// Commands accepted from the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u32)]
pub enum Receive {
    Ready = 0x5245_4459,
    Error = 0x4552_524F,
    Write = 0x5752_4954,
    Data = 0x4441_5441,
    Validate = 0x5641_4C44,
    Erase = 0x4552_5345,
    Lock = 0x4C4F_434B,
    Unlock = 0x554E_4C4B,
    Release = 0x5245_4C53,
}

/// Encode `cmd` into its wire frame.
pub fn encode(cmd: Transmit) -> [u8; FRAME_SIZE] {
    u32::from(cmd).to_be_bytes()
}

/// Decode a wire frame against the receive dictionary.
pub fn decode(frame: [u8; FRAME_SIZE]) -> Result<Receive> {
    let value = u32::from_be_bytes(frame);
    Receive::try_from(value).map_err(|_| Error::Unrecognized(value))
}

/// Sends and receives command frames over a `Serial` port.
#[derive(Debug)]
pub struct CommandCodec<'a> {
    rx: Subscription<'a>,
}

impl<'a> CommandCodec<'a> {
    pub fn new(counter: &'a RxCounter) -> Self {
        CommandCodec { rx: Subscription::new(counter) }
    }

    pub fn is_armed(&self) -> bool {
        self.rx.is_armed()
    }

    /// Start counting received bytes towards frames. No-op if already armed.
    pub fn arm<S: Serial<'a>>(&mut self, port: &mut S) -> Result<()> {
        self.rx.arm(port)
    }

    /// Stop counting received bytes. No-op if not armed.
    pub fn disarm<S: Serial<'a>>(&mut self, port: &mut S) -> Result<()> {
        self.rx.disarm(port)
    }

    /// Transmit `cmd` as a single frame.
    pub fn send<S: Serial<'a>>(&self, port: &mut S, cmd: Transmit) -> Result<()> {
        log::trace!("Sending {:?}", cmd);
        port.transmit(&encode(cmd))?;
        Ok(())
    }

    /// Decode the next frame, if one has been fully received.
    ///
    /// Returns `Error::NoData` until a whole frame has been counted and
    /// `Error::Unrecognized` for values outside the receive dictionary; the
    /// frame is consumed either way.
    pub fn try_receive<S: Serial<'a>>(&mut self, port: &mut S) -> Result<Receive> {
        let mut frame = [0u8; FRAME_SIZE];
        self.rx.collect(port, &mut frame)?;
        let cmd = decode(frame)?;
        log::trace!("Received {:?}", cmd);
        Ok(cmd)
    }
}
