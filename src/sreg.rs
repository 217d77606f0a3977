/// Status Register 1 (bits S7..S0), read with instruction 0x05.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister1(pub u8);

impl StatusRegister1 {
    /// Get WIP (write in progress) bit.
    pub fn get_busy(&self) -> bool {
        self.0 & 0b0000_0001 != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn get_write_enable_latch(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }

    /// Get the BP4..BP0 block protect bits, right-aligned.
    pub fn get_block_protect(&self) -> u8 {
        (self.0 & 0b0111_1100) >> 2
    }

    /// True if any block protect bit is set.
    pub fn is_protected(&self) -> bool {
        self.get_block_protect() != 0
    }

    /// Get SRP0 (status register protect) bit.
    pub fn get_srp0(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }
}

#[test]
fn test_status_register1() {
    let sr = StatusRegister1(0b1010_0011);
    assert!(sr.get_busy());
    assert!(sr.get_write_enable_latch());
    assert_eq!(sr.get_block_protect(), 0b01000);
    assert!(sr.is_protected());
    assert!(sr.get_srp0());

    let sr = StatusRegister1(0b0000_0010);
    assert!(!sr.get_busy());
    assert!(!sr.is_protected());
}
