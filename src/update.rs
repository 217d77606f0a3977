//! Update session task.
//!
//! The task is run periodically by the scheduler and performs at most one
//! state's worth of work per call. A session waits for a command frame, and
//! on `write` runs the data phase: acknowledge, receive a length, acknowledge,
//! receive that many payload bytes, commit them to the image staging region
//! of the external flash, acknowledge, and return to waiting for commands.
//!
//! Session progress lives only in memory; a reset part way through restarts
//! the handshake from `Session::Command`.

use crate::codec::{CommandCodec, Receive, Transmit};
use crate::data::DataReceiver;
use crate::serial::{RxCounter, Serial};
use crate::{Error, Result};

/// Capacity of the payload staging buffer.
pub const BUFFER_SIZE: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Session {
    Command,
    Data,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataPhase {
    Init,
    Length,
    Receiving,
}

/// Storage the staged image is written to.
pub trait ImageStore {
    fn sector_size(&self) -> usize;

    /// False while a previously started write or erase is still in flight.
    fn is_idle(&self) -> bool;

    fn erase_sector(&mut self, sector: u16) -> Result<()>;

    fn write(&mut self, sector: u16, offset: u16, data: &[u8]) -> Result<()>;
}

/// A task invoked by the cooperative scheduler every `PERIOD_MS`.
///
/// `run()` must return promptly: it shares the execution context with the
/// watchdog kick.
pub trait Periodic {
    const PERIOD_MS: u32;

    fn run(&mut self);
}

/// Byte counters fed by the serial receive interrupt.
///
/// Place in a `static` so the interrupt can reach the registered listener.
#[derive(Debug, Default)]
pub struct Signals {
    command: RxCounter,
    data: RxCounter,
}

impl Signals {
    pub const fn new() -> Self {
        Signals { command: RxCounter::new(), data: RxCounter::new() }
    }
}

/// Location of the image staging region in the external flash.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub base_sector: u16,
    pub sectors: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config { base_sector: 0, sectors: (crate::CAPACITY / crate::SECTOR_SIZE) as u16 }
    }
}

pub struct UpdateTask<'a, S: Serial<'a>, F: ImageStore> {
    port: S,
    store: F,
    config: Config,
    codec: CommandCodec<'a>,
    data: DataReceiver<'a>,
    session: Session,
    phase: DataPhase,
    length: usize,
    buf: [u8; BUFFER_SIZE],

    /// Bytes of image committed since the last `erase` command.
    staged: usize,
}

impl<'a, S: Serial<'a>, F: ImageStore> UpdateTask<'a, S, F> {
    pub fn new(port: S, store: F, signals: &'a Signals, config: Config) -> Self {
        UpdateTask {
            port,
            store,
            config,
            codec: CommandCodec::new(&signals.command),
            data: DataReceiver::new(&signals.data),
            session: Session::Command,
            phase: DataPhase::Init,
            length: 0,
            buf: [0u8; BUFFER_SIZE],
            staged: 0,
        }
    }

    pub fn session(&self) -> Session {
        self.session
    }

    pub fn phase(&self) -> DataPhase {
        self.phase
    }

    /// Payload length recorded for the current data phase.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn staging(&self) -> &[u8] {
        &self.buf
    }

    /// Number of image bytes written to the staging region so far.
    pub fn staged(&self) -> usize {
        self.staged
    }

    pub fn port(&self) -> &S {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut S {
        &mut self.port
    }

    pub fn store(&self) -> &F {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut F {
        &mut self.store
    }

    fn command_step(&mut self) {
        if !self.arm_codec() {
            return;
        }
        match self.codec.try_receive(&mut self.port) {
            Ok(cmd) => self.session = self.handle_command(cmd),
            Err(Error::NoData) => (),
            Err(Error::Unrecognized(value)) => {
                log::debug!("Dropping unrecognised command 0x{:08X}", value);
            }
            Err(e) => log::warn!("Failed to receive command: {:?}", e),
        }
    }

    fn handle_command(&mut self, cmd: Receive) -> Session {
        log::debug!("Handling {:?} command", cmd);
        match cmd {
            Receive::Write => {
                if let Err(e) = self.codec.disarm(&mut self.port) {
                    log::warn!("Failed to stop listening for commands: {:?}", e);
                }
                return Session::Data;
            }
            Receive::Validate => self.ack(Transmit::Ready),
            Receive::Erase => {
                // Sectors are erased as the next image is written into them.
                self.staged = 0;
                self.ack(Transmit::Ready);
            }
            // Reserved for access control.
            Receive::Lock | Receive::Unlock => (),
            Receive::Release => self.port.unlock(),
            Receive::Ready | Receive::Error | Receive::Data => (),
        }
        Session::Command
    }

    fn data_step(&mut self) {
        match self.phase {
            DataPhase::Init => {
                match self.data.arm(&mut self.port) {
                    Ok(()) => (),
                    Err(Error::Locked) => {
                        log::trace!("Serial port held elsewhere, waiting to receive length");
                        return;
                    }
                    Err(e) => {
                        log::warn!("Unable to listen for length: {:?}", e);
                        return;
                    }
                }
                self.ack(Transmit::Ready);
                self.phase = DataPhase::Length;
            }
            DataPhase::Length => match self.data.try_length(&mut self.port) {
                Ok(length) => self.start_payload(length),
                Err(Error::NoData) => (),
                Err(e) => {
                    log::warn!("Failed to receive length: {:?}", e);
                    self.abort();
                }
            },
            DataPhase::Receiving => {
                if !self.store.is_idle() {
                    return;
                }
                let length = self.length;
                match self.data.try_payload(&mut self.port, &mut self.buf[..length]) {
                    Ok(()) => {
                        self.disarm_data();
                        let reply = match self.commit() {
                            Ok(()) => Transmit::Ready,
                            Err(e) => {
                                log::error!("Failed to stage payload: {:?}", e);
                                Transmit::Error
                            }
                        };
                        self.finish();
                        self.ack(reply);
                    }
                    Err(Error::NoData) => (),
                    Err(e) => {
                        log::warn!("Failed to receive payload: {:?}", e);
                        self.abort();
                    }
                }
            }
        }
    }

    fn start_payload(&mut self, length: usize) {
        self.disarm_data();
        if length == 0 || length > BUFFER_SIZE {
            log::warn!("Rejecting payload length {}, limit is {}", length, BUFFER_SIZE);
            self.finish();
            self.ack(Transmit::Error);
            return;
        }
        self.length = length;
        if let Err(e) = self.data.arm(&mut self.port) {
            log::warn!("Unable to listen for payload: {:?}", e);
            self.abort();
            return;
        }
        self.ack(Transmit::Ready);
        self.phase = DataPhase::Receiving;
    }

    /// Write the received payload to the staging region after what is already there.
    fn commit(&mut self) -> Result<()> {
        let sector_size = self.store.sector_size();
        let start = self.staged;
        let end = start + self.length;
        if end > self.config.sectors as usize * sector_size {
            log::error!("Image of {} bytes overflows the staging region", end);
            return Err(Error::ExceedsBoundary { address: start as u32, length: self.length });
        }

        // Erase every sector the image enters for the first time.
        let first = (start + sector_size - 1) / sector_size;
        let last = (end - 1) / sector_size;
        for sector in first..=last {
            self.store.erase_sector(self.config.base_sector + sector as u16)?;
        }

        let sector = self.config.base_sector + (start / sector_size) as u16;
        let offset = (start % sector_size) as u16;
        self.store.write(sector, offset, &self.buf[..self.length])?;
        self.staged = end;
        log::debug!("Staged {} bytes of image", self.staged);
        Ok(())
    }

    fn abort(&mut self) {
        self.disarm_data();
        self.finish();
        self.ack(Transmit::Error);
    }

    /// Return to `Session::Command`, listening for commands again before the
    /// final reply goes out so an immediate answer from the host is counted.
    fn finish(&mut self) {
        self.phase = DataPhase::Init;
        self.length = 0;
        self.buf.iter_mut().for_each(|b| *b = 0);
        self.session = Session::Command;
        self.arm_codec();
    }

    fn arm_codec(&mut self) -> bool {
        match self.codec.arm(&mut self.port) {
            Ok(()) => true,
            Err(Error::Locked) => {
                log::trace!("Serial port held elsewhere, not listening for commands");
                false
            }
            Err(e) => {
                log::warn!("Unable to listen for commands: {:?}", e);
                false
            }
        }
    }

    fn disarm_data(&mut self) {
        if let Err(e) = self.data.disarm(&mut self.port) {
            log::warn!("Failed to stop listening for data: {:?}", e);
        }
    }

    fn ack(&mut self, reply: Transmit) {
        if let Err(e) = self.codec.send(&mut self.port, reply) {
            log::warn!("Failed to send {:?}: {:?}", reply, e);
        }
    }
}

impl<'a, S: Serial<'a>, F: ImageStore> Periodic for UpdateTask<'a, S, F> {
    const PERIOD_MS: u32 = 10;

    fn run(&mut self) {
        match self.session {
            Session::Command => self.command_step(),
            Session::Data => self.data_step(),
        }
    }
}
