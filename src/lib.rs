// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! spi-flash-update
//!
//! This crate provides the update engine of a serial bootloader which stages
//! a new application image into external SPI NOR flash: a driver for
//! GD25Q80C-style flash chips, a sector/page aware wrapper around it, the
//! 4-byte command codec, and the periodic update session task.

#![cfg_attr(not(feature = "std"), no_std)]

use core::sync::atomic::{AtomicBool, Ordering};

pub mod codec;
pub mod data;
pub mod ext_flash;
pub mod id;
pub mod serial;
pub mod sreg;
pub mod update;

#[cfg(test)]
mod mock;

pub use ext_flash::{Completion, ExtFlash, TransferState};
pub use id::FlashID;
pub use sreg::StatusRegister1;
pub use update::{UpdateTask, Session, DataPhase};

/// Page size of the GD25Q80C, the largest unit a single program may cover.
pub const PAGE_SIZE: usize = 256;

/// Sector size of the GD25Q80C, the smallest erasable unit.
pub const SECTOR_SIZE: usize = 4096;

/// Total capacity of the GD25Q80C (8 Mbit).
pub const CAPACITY: usize = 1 << 20;

/// Number of bytes clocked in while a read command and its 24-bit address are sent.
pub const READ_HEADER_LEN: usize = 4;

#[cfg(feature = "std")]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid argument.")]
    InvalidArgument,
    #[error("Timed out waiting for the flash or transfer to complete.")]
    Timeout,
    #[error("Operation at 0x{address:08X} of {length} bytes crosses a page or capacity boundary.")]
    ExceedsBoundary { address: u32, length: usize },
    #[error("No complete frame has been received.")]
    NoData,
    #[error("Unrecognised command 0x{0:08X}.")]
    Unrecognized(u32),
    #[error("Serial port is locked by another peripheral.")]
    Locked,
    #[error("Invalid manufacturer ID detected.")]
    InvalidManufacturer,

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}
#[cfg(not(feature = "std"))]
#[derive(Debug)]
pub enum Error {
    InvalidArgument,
    Timeout,
    ExceedsBoundary { address: u32, length: usize },
    NoData,
    Unrecognized(u32),
    Locked,
    InvalidManufacturer,

    Io,
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(feature = "std")]
pub type AnyhowResult<T> = anyhow::Result<T>;
#[cfg(not(feature = "std"))]
pub type AnyhowResult<T> = Result<T>;

/// Description of a single chip-select framed SPI exchange.
pub struct Transfer<'t> {
    /// Instruction opcode followed by any address bytes.
    pub command: &'t [u8],
    /// Bytes to clock out after `command`.
    pub tx: Option<&'t [u8]>,
    /// Receives every byte clocked in, starting with those clocked in during `command`.
    ///
    /// When present, its length sets the total length of the exchange and any
    /// bytes after `command` are clocked out as 0xFF.
    pub rx: Option<&'t mut [u8]>,
}

/// Trait for objects which provide access to the SPI flash.
///
/// `transfer()` may be blocking or may only start a DMA exchange, but any data
/// requested through `rx` must be in place before it returns. Every transfer
/// must be followed by a completion notification to the `TransferFlag` given
/// to the `Flash`, usually from the SPI receive-complete interrupt.
pub trait FlashAccess {
    /// Assert CS and exchange `xfer` with the flash.
    fn transfer(&mut self, xfer: Transfer<'_>) -> AnyhowResult<()>;

    /// Busy-wait for `us` microseconds.
    fn delay_us(&mut self, us: u32);
}

/// Transfer-in-progress flag shared between the driver and the completion interrupt.
#[derive(Debug, Default)]
pub struct TransferFlag(AtomicBool);

impl TransferFlag {
    pub const fn new() -> Self {
        TransferFlag(AtomicBool::new(false))
    }

    /// Mark a transfer as started.
    pub fn start(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Mark the current transfer as complete.
    ///
    /// Called from the transfer-complete interrupt; this is the only thing
    /// which unblocks a driver waiting on the flag.
    pub fn complete(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn in_progress(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// SPI Flash.
///
/// This struct drives a GD25Q80C-compatible flash through a `FlashAccess` provider.
pub struct Flash<'a, A: FlashAccess> {
    access: &'a mut A,

    /// Set while a transfer is outstanding, cleared by the completion interrupt.
    wait: &'a TransferFlag,

    /// Once read, ID details are cached.
    id: Option<FlashID>,

    /// Total data memory capacity in bytes.
    capacity: usize,

    /// Page size in bytes, used for programming operations.
    page_size: usize,

    /// Sector size in bytes, used for sector erase operations.
    sector_size: usize,

    /// Maximum number of polls of the status register or wait flag before giving up.
    max_polls: u32,
}

impl<'a, A: FlashAccess> Flash<'a, A> {
    pub const DEFAULT_MAX_POLLS: u32 = 100_000;

    /// Settling time after a software reset.
    const RESET_DELAY_US: u32 = 2500;

    /// Create a new Flash instance using the given FlashAccess provider and wait flag.
    pub fn new(access: &'a mut A, wait: &'a TransferFlag) -> Self {
        Flash {
            access,
            wait,
            id: None,
            capacity: CAPACITY,
            page_size: PAGE_SIZE,
            sector_size: SECTOR_SIZE,
            max_polls: Self::DEFAULT_MAX_POLLS,
        }
    }

    /// Get the total memory capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Set the total memory capacity in bytes.
    pub fn set_capacity(&mut self, n: usize) {
        self.capacity = n;
    }

    /// Get the page program size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Set the page program size in bytes.
    pub fn set_page_size(&mut self, n: usize) {
        self.page_size = n;
    }

    /// Get the sector erase size in bytes.
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Set the sector erase size in bytes.
    pub fn set_sector_size(&mut self, n: usize) {
        self.sector_size = n;
    }

    /// Get the busy-wait bound.
    pub fn max_polls(&self) -> u32 {
        self.max_polls
    }

    /// Set the number of polls after which busy-waits fail with `Error::Timeout`.
    pub fn set_max_polls(&mut self, n: u32) {
        self.max_polls = n;
    }

    /// Get the flash ID, if it has already been read.
    pub fn get_id(&self) -> Option<FlashID> {
        self.id
    }

    /// Signal that the outstanding transfer has completed.
    pub fn notify_transfer_complete(&self) {
        self.wait.complete();
    }

    /// Read the JEDEC manufacturer and device ID.
    ///
    /// The manufacturer ID may be prefixed with up to 13 of the
    /// continuation code 0x7F; the number of continuation codes
    /// is returned as the bank number.
    pub fn read_id(&mut self) -> Result<FlashID> {
        log::debug!("Reading SPI Flash ID");
        self.wait_while_busy()?;

        let mut rx = [0u8; 1 + 16];
        self.exchange(&[Command::ReadJEDECID.into()], &mut rx)?;
        let data = &rx[1..];

        let bank = match data.iter().take(14).position(|&b| b != 0x7F) {
            Some(bank) => bank,
            None => {
                log::error!("Found more than 13 continuation bytes in manufacturer ID");
                return Err(Error::InvalidManufacturer);
            }
        };
        let id = FlashID {
            manufacturer_bank: bank as u8,
            manufacturer_id: data[bank],
            memory_type: data[bank + 1],
            capacity_code: data[bank + 2],
        };
        if id.manufacturer_id == 0x00 || id.manufacturer_id == 0xFF {
            log::error!("No device or manufacturer ID found");
            return Err(Error::InvalidManufacturer);
        }

        log::debug!("Read ID: {:?}", id);
        self.id = Some(id);
        Ok(id)
    }

    /// Program up to one page of `data` at `address`.
    ///
    /// The data must not cross a page boundary and the flash must already be
    /// erased; see `ExtFlash::write()` for a splitting interface.
    pub fn program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.program_with(address, data, || ())
    }

    /// Program like `program()`, calling `on_issue` just before the page
    /// program transfer itself is started.
    ///
    /// The status polls and write enable which precede it complete first.
    pub fn program_with<F: FnOnce()>(&mut self, address: u32, data: &[u8], on_issue: F)
        -> Result<()>
    {
        if data.is_empty() {
            log::error!("Refusing to program zero bytes");
            return Err(Error::InvalidArgument);
        }
        self.check_address_length(address, data.len())?;
        if (address as usize % self.page_size) + data.len() > self.page_size {
            log::error!("Program of {} bytes at 0x{:06X} would cross a page boundary",
                        data.len(), address);
            return Err(Error::ExceedsBoundary { address, length: data.len() });
        }

        self.wait_while_busy()?;
        self.write_enable()?;
        let cmd = self.make_command(Command::PageProgram, address);
        log::trace!("Programming {} bytes at 0x{:06X}", data.len(), address);
        self.transfer_with(Transfer { command: &cmd, tx: Some(data), rx: None }, on_issue)
    }

    /// Read from `address` into `buf`.
    ///
    /// The exchange is full duplex: the first `READ_HEADER_LEN` bytes of `buf`
    /// are clocked in while the command and address are sent, and the
    /// `buf.len() - READ_HEADER_LEN` bytes after them hold the data.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        self.read_with(address, buf, || ())
    }

    /// Read like `read()`, calling `on_issue` just before the read transfer is started.
    pub fn read_with<F: FnOnce()>(&mut self, address: u32, buf: &mut [u8], on_issue: F)
        -> Result<()>
    {
        if buf.len() <= READ_HEADER_LEN {
            log::error!("Read buffer of {} bytes has no room for data", buf.len());
            return Err(Error::InvalidArgument);
        }
        self.check_address_length(address, buf.len() - READ_HEADER_LEN)?;

        self.wait_while_busy()?;
        let cmd = self.make_command(Command::ReadData, address);
        log::trace!("Reading {} bytes from 0x{:06X}", buf.len() - READ_HEADER_LEN, address);
        self.transfer_with(Transfer { command: &cmd, tx: None, rx: Some(buf) }, on_issue)
    }

    /// Erase the sector with index `sector`.
    pub fn erase_sector(&mut self, sector: u16) -> Result<()> {
        let address = sector as usize * self.sector_size;
        if address >= self.capacity {
            log::error!("Sector {} is beyond the end of the flash", sector);
            return Err(Error::InvalidArgument);
        }

        self.wait_while_busy()?;
        self.write_enable()?;
        log::debug!("Erasing sector {} at 0x{:06X}", sector, address);
        let cmd = self.make_command(Command::SectorErase, address as u32);
        self.transfer(Transfer { command: &cmd, tx: None, rx: None })
    }

    /// Erase entire flash chip.
    ///
    /// Returns as soon as the erase has been started; later operations wait
    /// for it to finish.
    pub fn erase_chip(&mut self) -> Result<()> {
        self.wait_while_busy()?;
        self.write_enable()?;
        log::debug!("Erasing entire flash");
        self.command(Command::ChipErase)
    }

    /// Reset the attached flash.
    ///
    /// The instruction sequence EnableReset 0x66 followed by Reset 0x99 is
    /// sent, then the chip is given time to come out of reset.
    pub fn reset(&mut self) -> Result<()> {
        self.wait_while_busy()?;
        self.command(Command::EnableReset)?;
        self.wait_for_transfer()?;
        self.command(Command::Reset)?;
        self.access.delay_us(Self::RESET_DELAY_US);
        Ok(())
    }

    /// Power down the flash.
    pub fn sleep(&mut self) -> Result<()> {
        self.wait_while_busy()?;
        log::debug!("Sending Powerdown command");
        self.command(Command::Powerdown)
    }

    /// Power up the flash.
    ///
    /// A powered down flash ignores status reads, so only the previous
    /// transfer is waited for.
    pub fn wake_up(&mut self) -> Result<()> {
        log::debug!("Sending Release Powerdown command");
        self.command(Command::ReleasePowerdown)
    }

    /// Send the WriteEnable command, setting the WEL in the status register.
    pub fn write_enable(&mut self) -> Result<()> {
        self.command(Command::WriteEnable)
    }

    /// Read status register 1.
    pub fn read_status1(&mut self) -> Result<StatusRegister1> {
        let mut rx = [0u8; 2];
        self.exchange(&[Command::ReadStatusRegister1.into()], &mut rx)?;
        Ok(StatusRegister1(rx[1]))
    }

    /// Check if the device is currently busy performing an operation.
    pub fn is_busy(&mut self) -> Result<bool> {
        self.read_status1().map(|status| status.get_busy())
    }

    /// Wait until the device stops being busy.
    ///
    /// Fails with `Error::Timeout` if the WIP bit is still set after `max_polls` reads.
    pub fn wait_while_busy(&mut self) -> Result<()> {
        for _ in 0..self.max_polls {
            if !self.is_busy()? {
                return Ok(());
            }
        }
        log::error!("Flash still busy after {} status polls", self.max_polls);
        Err(Error::Timeout)
    }

    /// Wait for the completion interrupt of the outstanding transfer, if any.
    fn wait_for_transfer(&self) -> Result<()> {
        let mut polls = 0;
        while self.wait.in_progress() {
            polls += 1;
            if polls >= self.max_polls {
                log::error!("No transfer completion after {} polls", polls);
                return Err(Error::Timeout);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Issue `xfer` once the previous transfer has completed.
    fn transfer(&mut self, xfer: Transfer<'_>) -> Result<()> {
        self.transfer_with(xfer, || ())
    }

    fn transfer_with<F: FnOnce()>(&mut self, xfer: Transfer<'_>, on_issue: F) -> Result<()> {
        self.wait_for_transfer()?;
        log::trace!("SPI transfer: command {:02X?}", xfer.command);
        on_issue();
        self.wait.start();
        if let Err(e) = self.access.transfer(xfer) {
            // No completion will arrive for a transfer that never started.
            self.wait.complete();
            log::error!("SPI transfer failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Send `command`, capturing the response into `rx` and waiting for it to complete.
    fn exchange(&mut self, command: &[u8], rx: &mut [u8]) -> Result<()> {
        self.transfer(Transfer { command, tx: None, rx: Some(rx) })?;
        self.wait_for_transfer()
    }

    /// Convenience method for issuing a single opcode with no address or data.
    fn command(&mut self, command: Command) -> Result<()> {
        self.transfer(Transfer { command: &[command.into()], tx: None, rx: None })
    }

    /// Checks `address` and `length` together stay within the flash capacity.
    fn check_address_length(&self, address: u32, length: usize) -> Result<()> {
        log::trace!("Checking address={:06X} length={}", address, length);
        match (address as usize).checked_add(length) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => {
                log::error!("Operation would exceed flash capacity");
                Err(Error::ExceedsBoundary { address, length })
            }
        }
    }

    /// Generate the opcode followed by a 3-byte big-endian address.
    fn make_command(&self, command: Command, address: u32) -> [u8; READ_HEADER_LEN] {
        let bytes = address.to_be_bytes();
        [command.into(), bytes[1], bytes[2], bytes[3]]
    }
}

/// GD25Q80C command opcodes.
///
/// Only the single I/O commands used by this driver are listed.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[repr(u8)]
enum Command {
    WriteEnable = 0x06,
    ReadData = 0x03,
    PageProgram = 0x02,
    ReadStatusRegister1 = 0x05,
    ReadJEDECID = 0x9F,
    SectorErase = 0x20,
    ChipErase = 0xC7,
    Powerdown = 0xB9,
    ReleasePowerdown = 0xAB,
    EnableReset = 0x66,
    Reset = 0x99,
}
