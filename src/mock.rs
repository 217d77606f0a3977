//! In-memory stand-ins for the flash chip, chip select and serial port.

use std::collections::VecDeque;
use std::convert::Infallible;

use embedded_hal::digital::{ErrorType, OutputPin};

use crate::serial::{PeripheralId, PortLock, RxListener, Serial};
use crate::{AnyhowResult, Completion, FlashAccess, Result, Transfer, CAPACITY, PAGE_SIZE,
            READ_HEADER_LEN, SECTOR_SIZE};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Default)]
pub struct MockPin {
    pub high: bool,
}

impl ErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> core::result::Result<(), Infallible> {
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> core::result::Result<(), Infallible> {
        self.high = true;
        Ok(())
    }
}

/// Simulated GD25Q80C which completes each transfer immediately.
pub struct MockNor<'a> {
    done: &'a Completion,
    cs: MockPin,
    wel: bool,
    reset_enabled: bool,

    pub mem: Vec<u8>,
    /// Every command (opcode and address) issued, in order.
    pub commands: Vec<Vec<u8>>,
    /// Address and length of every accepted page program.
    pub programs: Vec<(u32, usize)>,
    pub delays: Vec<u32>,
    pub jedec_id: [u8; 3],
    /// Report WIP on every status read.
    pub stuck_busy: bool,
    pub asleep: bool,
    /// Transfers with this opcode never signal completion.
    pub hold_opcode: Option<u8>,
    /// Transfers with this opcode are rejected by the transport.
    pub fail_opcode: Option<u8>,
}

impl<'a> MockNor<'a> {
    pub fn new(done: &'a Completion) -> Self {
        MockNor {
            done,
            cs: MockPin { high: true },
            wel: false,
            reset_enabled: false,
            mem: vec![0xFF; CAPACITY],
            commands: Vec::new(),
            programs: Vec::new(),
            delays: Vec::new(),
            jedec_id: [0xC8, 0x40, 0x14],
            stuck_busy: false,
            asleep: false,
            hold_opcode: None,
            fail_opcode: None,
        }
    }

    /// Number of transfers issued with `opcode`.
    pub fn count(&self, opcode: u8) -> usize {
        self.commands.iter().filter(|c| c[0] == opcode).count()
    }

    fn address(command: &[u8]) -> usize {
        u32::from_be_bytes([0, command[1], command[2], command[3]]) as usize
    }

    fn execute(&mut self, command: &[u8], tx: Option<&[u8]>, rx: Option<&mut [u8]>) {
        let opcode = command[0];
        if self.asleep {
            if opcode == 0xAB {
                self.asleep = false;
            } else if let Some(rx) = rx {
                rx.iter_mut().for_each(|b| *b = 0xFF);
            }
            return;
        }
        if opcode != 0x99 {
            self.reset_enabled = opcode == 0x66;
        }

        match opcode {
            0x05 => {
                if let Some(rx) = rx {
                    let status = if self.stuck_busy { 0x01 } else { (self.wel as u8) << 1 };
                    rx.iter_mut().skip(1).for_each(|b| *b = status);
                }
            }
            0x06 => self.wel = true,
            0x9F => {
                if let Some(rx) = rx {
                    rx.iter_mut().for_each(|b| *b = 0);
                    rx[1..4].copy_from_slice(&self.jedec_id);
                }
            }
            0x03 => {
                if let Some(rx) = rx {
                    let address = Self::address(command);
                    let len = rx.len() - READ_HEADER_LEN;
                    rx[..READ_HEADER_LEN].iter_mut().for_each(|b| *b = 0xFF);
                    rx[READ_HEADER_LEN..].copy_from_slice(&self.mem[address..address + len]);
                }
            }
            0x02 => {
                if self.wel {
                    let address = Self::address(command);
                    let data = tx.unwrap_or(&[]);
                    let page = address & !(PAGE_SIZE - 1);
                    for (i, byte) in data.iter().enumerate() {
                        self.mem[page + (address + i) % PAGE_SIZE] &= byte;
                    }
                    self.programs.push((address as u32, data.len()));
                }
                self.wel = false;
            }
            0x20 => {
                if self.wel {
                    let start = Self::address(command) & !(SECTOR_SIZE - 1);
                    self.mem[start..start + SECTOR_SIZE].iter_mut().for_each(|b| *b = 0xFF);
                }
                self.wel = false;
            }
            0xC7 => {
                if self.wel {
                    self.mem.iter_mut().for_each(|b| *b = 0xFF);
                }
                self.wel = false;
            }
            0x99 => {
                if self.reset_enabled {
                    self.wel = false;
                    self.reset_enabled = false;
                }
            }
            0xB9 => self.asleep = true,
            _ => (),
        }
    }
}

impl<'a> FlashAccess for MockNor<'a> {
    fn transfer(&mut self, xfer: Transfer<'_>) -> AnyhowResult<()> {
        let opcode = xfer.command[0];
        if self.fail_opcode == Some(opcode) {
            anyhow::bail!("SPI transfer of opcode 0x{:02X} rejected", opcode);
        }
        log::trace!("Mock flash command {:02X?}", xfer.command);
        self.commands.push(xfer.command.to_vec());
        self.cs.high = false;
        self.execute(xfer.command, xfer.tx, xfer.rx);

        if self.hold_opcode != Some(opcode) {
            let done = self.done;
            done.tx_done();
            done.rx_done(&mut self.cs);
        }
        Ok(())
    }

    fn delay_us(&mut self, us: u32) {
        self.delays.push(us);
    }
}

/// Serial port which records transmitted bytes and replays fed ones.
pub struct MockSerial<'a> {
    listener: Option<&'a dyn RxListener>,
    pending: VecDeque<u8>,

    pub lock: PortLock,
    pub sent: Vec<u8>,
    pub registrations: usize,
    pub deregistrations: usize,
}

impl<'a> MockSerial<'a> {
    pub const ENGINE: PeripheralId = 1;
    pub const OTHER: PeripheralId = 2;

    pub fn new() -> Self {
        MockSerial {
            listener: None,
            pending: VecDeque::new(),
            lock: PortLock::new(),
            sent: Vec::new(),
            registrations: 0,
            deregistrations: 0,
        }
    }

    /// Deliver `bytes` as if received, notifying the registered listener.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
        if let Some(listener) = self.listener {
            listener.on_receive(bytes.len());
        }
    }

    pub fn sent_frames(&self) -> Vec<u32> {
        self.sent
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl<'a> Serial<'a> for MockSerial<'a> {
    fn transmit(&mut self, data: &[u8]) -> AnyhowResult<()> {
        self.sent.extend_from_slice(data);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> AnyhowResult<()> {
        if self.pending.len() < buf.len() {
            anyhow::bail!("Only {} of {} bytes pending", self.pending.len(), buf.len());
        }
        for b in buf.iter_mut() {
            *b = self.pending.pop_front().unwrap_or(0);
        }
        Ok(())
    }

    fn discard_rx(&mut self) {
        self.pending.clear();
    }

    fn register_rx(&mut self, listener: &'a dyn RxListener) -> Result<()> {
        self.lock.claim(Self::ENGINE)?;
        self.listener = Some(listener);
        self.registrations += 1;
        Ok(())
    }

    fn deregister_rx(&mut self) -> Result<()> {
        self.listener = None;
        self.deregistrations += 1;
        Ok(())
    }

    fn unlock(&mut self) {
        self.lock.release();
    }
}
