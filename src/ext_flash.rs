//! Sector/offset addressed access to the external flash.
//!
//! `ExtFlash` splits writes at page boundaries and tracks completion of the
//! outbound (program/erase) and inbound (read) directions separately. Both
//! are cleared asynchronously by the SPI interrupt handlers through the
//! shared `Completion`, so callers poll `state()` rather than assuming an
//! operation has finished when its method returns.

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::digital::OutputPin;

use crate::update::ImageStore;
use crate::{Error, Flash, FlashAccess, FlashID, Result, TransferFlag, READ_HEADER_LEN};

/// Largest number of bytes a single `start_read()` may request.
pub const MAX_READ: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    InProgress,
    Done,
}

/// Completion flags shared with the SPI interrupt handlers.
///
/// Place one in a `static` so the handlers can reach it.
#[derive(Debug, Default)]
pub struct Completion {
    tx_busy: AtomicBool,
    rx_busy: AtomicBool,
    wait: TransferFlag,
}

impl Completion {
    pub const fn new() -> Self {
        Completion {
            tx_busy: AtomicBool::new(false),
            rx_busy: AtomicBool::new(false),
            wait: TransferFlag::new(),
        }
    }

    /// The chip driver's wait flag.
    pub fn transfer_flag(&self) -> &TransferFlag {
        &self.wait
    }

    /// SPI transmit-complete handler.
    pub fn tx_done(&self) {
        self.tx_busy.store(false, Ordering::Release);
    }

    /// SPI receive-complete handler.
    ///
    /// Unblocks the chip driver and releases the flash chip select.
    pub fn rx_done<P: OutputPin>(&self, cs: &mut P) {
        self.rx_busy.store(false, Ordering::Release);
        self.wait.complete();
        if let Err(e) = cs.set_high() {
            log::error!("Failed to release flash chip select: {:?}", e);
        }
    }

    pub fn tx_state(&self) -> TransferState {
        Self::state_of(&self.tx_busy)
    }

    pub fn rx_state(&self) -> TransferState {
        Self::state_of(&self.rx_busy)
    }

    /// `Done` only once both directions are done.
    pub fn state(&self) -> TransferState {
        match (self.tx_state(), self.rx_state()) {
            (TransferState::Done, TransferState::Done) => TransferState::Done,
            _ => TransferState::InProgress,
        }
    }

    fn state_of(flag: &AtomicBool) -> TransferState {
        if flag.load(Ordering::Acquire) {
            TransferState::InProgress
        } else {
            TransferState::Done
        }
    }
}

/// External flash addressed by sector and offset.
pub struct ExtFlash<'a, A: FlashAccess> {
    flash: Flash<'a, A>,
    done: &'a Completion,

    /// Full-duplex read staging: command/address echo followed by data.
    rx_buf: [u8; READ_HEADER_LEN + MAX_READ],
}

impl<'a, A: FlashAccess> ExtFlash<'a, A> {
    pub fn new(access: &'a mut A, done: &'a Completion) -> Self {
        ExtFlash {
            flash: Flash::new(access, done.transfer_flag()),
            done,
            rx_buf: [0u8; READ_HEADER_LEN + MAX_READ],
        }
    }

    /// Bring the chip out of power-down, reset it and identify it.
    pub fn init(&mut self) -> Result<FlashID> {
        self.flash.wake_up()?;
        self.flash.reset()?;
        let id = self.flash.read_id()?;
        #[cfg(feature = "std")]
        log::info!("External flash: {}", id);
        #[cfg(not(feature = "std"))]
        log::info!("External flash: {:?}", id);

        match id.capacity_bytes() {
            Some(capacity) if capacity != self.flash.capacity() => {
                log::warn!("Flash reports {} bytes but is configured for {}",
                           capacity, self.flash.capacity());
            }
            _ => (),
        }
        if self.flash.read_status1()?.is_protected() {
            log::warn!("Flash block protection is set, programming will have no effect");
        }
        Ok(id)
    }

    /// Write `data` starting `offset` bytes into `sector`.
    ///
    /// The write is split into page program operations, continuing into the
    /// following sectors as needed. The target range must already be erased.
    pub fn write(&mut self, sector: u16, offset: u16, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let sector_size = self.flash.sector_size();
        let page_size = self.flash.page_size();
        if offset as usize >= sector_size {
            log::error!("Offset {} is outside a {} byte sector", offset, sector_size);
            return Err(Error::InvalidArgument);
        }
        let start = sector as usize * sector_size + offset as usize;
        if start.checked_add(data.len()).map_or(true, |end| end > self.flash.capacity()) {
            log::error!("Write of {} bytes at 0x{:06X} exceeds flash capacity", data.len(), start);
            return Err(Error::ExceedsBoundary { address: start as u32, length: data.len() });
        }

        log::trace!("Writing {} bytes to sector {} offset {}", data.len(), sector, offset);

        let done = self.done;
        let (mut sector, mut offset, mut data) = (sector as usize, offset as usize, data);
        while !data.is_empty() {
            let length = usize::min(page_size - (offset % page_size), data.len());
            let address = (sector * sector_size + offset) as u32;
            let issue = || done.tx_busy.store(true, Ordering::Release);
            if let Err(e) = self.flash.program_with(address, &data[..length], issue) {
                // Nothing more is in flight that would report completion.
                self.done.tx_done();
                return Err(e);
            }
            offset += length;
            if offset >= sector_size {
                offset = 0;
                sector += 1;
            }
            data = &data[length..];
        }
        Ok(())
    }

    /// Start reading `length` bytes from `offset` bytes into `sector`.
    ///
    /// Collect the data with `get_read()` once `state()` reports `Done`.
    pub fn start_read(&mut self, sector: u16, offset: u16, length: usize) -> Result<()> {
        if length == 0 || length > MAX_READ {
            log::error!("Read of {} bytes is not between 1 and {}", length, MAX_READ);
            return Err(Error::InvalidArgument);
        }
        let address = sector as usize * self.flash.sector_size() + offset as usize;

        let done = self.done;
        let issue = || done.rx_busy.store(true, Ordering::Release);
        let buf = &mut self.rx_buf[..READ_HEADER_LEN + length];
        let result = self.flash.read_with(address as u32, buf, issue);
        if result.is_err() {
            self.done.rx_busy.store(false, Ordering::Release);
        }
        result
    }

    /// Copy data from the last completed read into `data`.
    pub fn get_read(&self, data: &mut [u8]) -> Result<()> {
        if data.len() > MAX_READ {
            return Err(Error::InvalidArgument);
        }
        if self.done.rx_state() == TransferState::InProgress {
            return Err(Error::NoData);
        }
        data.copy_from_slice(&self.rx_buf[READ_HEADER_LEN..READ_HEADER_LEN + data.len()]);
        Ok(())
    }

    pub fn state(&self) -> TransferState {
        self.done.state()
    }

    pub fn erase_sector(&mut self, sector: u16) -> Result<()> {
        self.flash.erase_sector(sector)
    }
}

impl<'a, A: FlashAccess> ImageStore for ExtFlash<'a, A> {
    fn sector_size(&self) -> usize {
        self.flash.sector_size()
    }

    fn is_idle(&self) -> bool {
        self.state() == TransferState::Done
    }

    fn erase_sector(&mut self, sector: u16) -> Result<()> {
        ExtFlash::erase_sector(self, sector)
    }

    fn write(&mut self, sector: u16, offset: u16, data: &[u8]) -> Result<()> {
        ExtFlash::write(self, sector, offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{init_logging, MockNor, MockPin};
    use crate::{CAPACITY, PAGE_SIZE, SECTOR_SIZE};

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn write_read_round_trip() {
        init_logging();
        let cases: &[(u16, u16, usize)] = &[
            (0, 0, 1),
            (0, 10, 100),
            (1, 200, 100),
            (2, 0, 256),
            (3, 17, 1000),
            (4, 4000, 300),
            (9, 4095, 2),
        ];
        for (n, &(sector, offset, length)) in cases.iter().enumerate() {
            let done = Completion::new();
            let mut nor = MockNor::new(&done);
            let mut ext = ExtFlash::new(&mut nor, &done);

            let data = pattern(length, n as u8);
            ext.write(sector, offset, &data).unwrap();
            assert_eq!(ext.state(), TransferState::Done);
            ext.start_read(sector, offset, length).unwrap();
            assert_eq!(ext.state(), TransferState::Done);

            let mut out = vec![0u8; length];
            ext.get_read(&mut out).unwrap();
            assert_eq!(out, data, "sector {} offset {} length {}", sector, offset, length);
        }
    }

    #[test]
    fn write_splits_at_page_boundaries() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        let mut ext = ExtFlash::new(&mut nor, &done);

        ext.write(0, 250, &pattern(600, 1)).unwrap();
        assert_eq!(nor.programs, vec![(250, 6), (256, 256), (512, 256), (768, 82)]);
        for &(address, length) in nor.programs.iter() {
            assert!((address as usize % PAGE_SIZE) + length <= PAGE_SIZE);
        }
    }

    #[test]
    fn write_rolls_into_next_sector() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        let mut ext = ExtFlash::new(&mut nor, &done);

        ext.write(2, (SECTOR_SIZE - 8) as u16, &[0xAB; 16]).unwrap();
        let base = (2 * SECTOR_SIZE) as u32;
        assert_eq!(nor.programs, vec![(base + SECTOR_SIZE as u32 - 8, 8), (base + SECTOR_SIZE as u32, 8)]);
        assert!(nor.mem[3 * SECTOR_SIZE - 8..3 * SECTOR_SIZE + 8].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn write_beyond_capacity_is_rejected() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        let mut ext = ExtFlash::new(&mut nor, &done);

        let last = (CAPACITY / SECTOR_SIZE - 1) as u16;
        assert!(matches!(ext.write(last, (SECTOR_SIZE - 4) as u16, &[0; 8]),
                         Err(Error::ExceedsBoundary { .. })));
        assert!(matches!(ext.write(0, SECTOR_SIZE as u16, &[0; 8]),
                         Err(Error::InvalidArgument)));
        assert_eq!(ext.state(), TransferState::Done);
        assert!(nor.programs.is_empty());
    }

    #[test]
    fn write_state_waits_for_interrupt() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        nor.hold_opcode = Some(0x02);
        let mut ext = ExtFlash::new(&mut nor, &done);

        ext.write(0, 0, &[1, 2, 3]).unwrap();
        assert_eq!(ext.state(), TransferState::InProgress);

        let mut cs = MockPin::default();
        done.tx_done();
        done.rx_done(&mut cs);
        assert_eq!(ext.state(), TransferState::Done);
        assert!(cs.high);
    }

    #[test]
    fn read_state_waits_for_interrupt() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        nor.mem[..4].copy_from_slice(&[9, 8, 7, 6]);
        nor.hold_opcode = Some(0x03);
        let mut ext = ExtFlash::new(&mut nor, &done);

        ext.start_read(0, 0, 4).unwrap();
        assert_eq!(ext.state(), TransferState::InProgress);
        let mut out = [0u8; 4];
        assert!(matches!(ext.get_read(&mut out), Err(Error::NoData)));

        done.rx_done(&mut MockPin::default());
        assert_eq!(ext.state(), TransferState::Done);
        ext.get_read(&mut out).unwrap();
        assert_eq!(out, [9, 8, 7, 6]);
    }

    #[test]
    fn status_poll_completion_does_not_finish_write() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        nor.hold_opcode = Some(0x02);
        let mut ext = ExtFlash::new(&mut nor, &done);

        // The status read and write enable complete, the program does not.
        ext.write(1, 0, &[0x42]).unwrap();
        assert_eq!(done.tx_state(), TransferState::InProgress);
        assert_eq!(done.rx_state(), TransferState::Done);
        assert!(!ImageStore::is_idle(&ext));
        drop(ext);
        assert_eq!(nor.commands.iter().map(|c| c[0]).collect::<Vec<_>>(), vec![0x05, 0x06, 0x02]);
    }

    #[test]
    fn stale_read_buffer_is_not_returned() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        nor.mem[..2].copy_from_slice(&[0x11, 0x22]);
        nor.mem[SECTOR_SIZE..SECTOR_SIZE + 2].copy_from_slice(&[0x33, 0x44]);
        let mut ext = ExtFlash::new(&mut nor, &done);

        ext.start_read(0, 0, 2).unwrap();
        let mut out = [0u8; 2];
        ext.get_read(&mut out).unwrap();
        assert_eq!(out, [0x11, 0x22]);

        // The next read's data is not handed out until its transfer completes.
        drop(ext);
        nor.hold_opcode = Some(0x03);
        let mut ext = ExtFlash::new(&mut nor, &done);
        ext.start_read(1, 0, 2).unwrap();
        assert_eq!(ext.state(), TransferState::InProgress);
        assert!(matches!(ext.get_read(&mut out), Err(Error::NoData)));

        done.rx_done(&mut MockPin::default());
        ext.get_read(&mut out).unwrap();
        assert_eq!(out, [0x33, 0x44]);
    }

    #[test]
    fn read_length_is_bounded() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        let mut ext = ExtFlash::new(&mut nor, &done);
        assert!(matches!(ext.start_read(0, 0, 0), Err(Error::InvalidArgument)));
        assert!(matches!(ext.start_read(0, 0, MAX_READ + 1), Err(Error::InvalidArgument)));
        assert_eq!(ext.state(), TransferState::Done);
    }

    #[test]
    fn failed_write_returns_to_done() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        nor.fail_opcode = Some(0x02);
        let mut ext = ExtFlash::new(&mut nor, &done);
        assert!(matches!(ext.write(0, 0, &[1]), Err(Error::Io(_))));
        assert_eq!(ext.state(), TransferState::Done);
    }

    #[test]
    fn erase_then_rewrite() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        let mut ext = ExtFlash::new(&mut nor, &done);

        ext.write(1, 0, &[0x00; 4]).unwrap();
        ext.erase_sector(1).unwrap();
        ext.write(1, 0, &[0x5A; 4]).unwrap();
        ext.start_read(1, 0, 4).unwrap();
        let mut out = [0u8; 4];
        ext.get_read(&mut out).unwrap();
        assert_eq!(out, [0x5A; 4]);
    }

    #[test]
    fn init_identifies_chip() {
        let done = Completion::new();
        let mut nor = MockNor::new(&done);
        nor.asleep = true;
        let mut ext = ExtFlash::new(&mut nor, &done);

        let id = ext.init().unwrap();
        assert_eq!(id.manufacturer_id, 0xC8);
        assert!(!nor.asleep);
        assert_eq!(nor.delays, vec![2500]);
    }
}
