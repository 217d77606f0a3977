/// Store the ID read off an SPI flash memory.
///
/// The manufacturer ID, memory type and capacity code are read using the 0x9F
/// command, and the number of 0x7F continuation code bytes present before the
/// manufacturer ID is stored as `manufacturer_bank`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashID {
    pub manufacturer_bank: u8,
    pub manufacturer_id: u8,
    pub memory_type: u8,
    pub capacity_code: u8,
}

impl FlashID {
    /// Capacity in bytes, if the capacity code follows the usual 2^N encoding.
    ///
    /// A GD25Q80C reports 0x14, for 1 MiB.
    pub fn capacity_bytes(&self) -> Option<usize> {
        match self.capacity_code {
            10..=31 => Some(1 << self.capacity_code),
            _ => None,
        }
    }

    /// Manufacturer name from the JEP106 list.
    ///
    /// GigaDevice parts report 0xC8 in bank 0 without the continuation codes
    /// their JEP106 entry needs, so that code is named GigaDevice here.
    #[cfg(feature = "std")]
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        match (self.manufacturer_bank, self.manufacturer_id) {
            (0, 0xC8) => Some("GigaDevice Semiconductor"),
            (bank, id) => jep106::JEP106Code::new(bank, id & 0x7F).get(),
        }
    }
}

#[cfg(feature = "std")]
impl std::fmt::Display for FlashID {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.manufacturer_name() {
            Some(name) => write!(f, "{}", name)?,
            None => write!(f, "manufacturer 0x{:02X} in bank {}",
                           self.manufacturer_id, self.manufacturer_bank)?,
        }
        write!(f, ", type 0x{:02X}", self.memory_type)?;
        match self.capacity_bytes() {
            Some(n) => write!(f, ", {} KiB", n / 1024),
            None => write!(f, ", capacity code 0x{:02X}", self.capacity_code),
        }
    }
}

#[test]
fn test_capacity_bytes() {
    let mut id = FlashID {
        manufacturer_bank: 0, manufacturer_id: 0xC8, memory_type: 0x40, capacity_code: 0x14,
    };
    assert_eq!(id.capacity_bytes(), Some(1024 * 1024));
    id.capacity_code = 0x00;
    assert_eq!(id.capacity_bytes(), None);
}

#[cfg(feature = "std")]
#[test]
fn test_display_gd25q80c() {
    let mut id = FlashID {
        manufacturer_bank: 0, manufacturer_id: 0xC8, memory_type: 0x40, capacity_code: 0x14,
    };
    assert_eq!(id.manufacturer_name(), Some("GigaDevice Semiconductor"));
    assert_eq!(id.to_string(), "GigaDevice Semiconductor, type 0x40, 1024 KiB");
    id.capacity_code = 0x02;
    assert!(id.to_string().ends_with(", capacity code 0x02"));
}
