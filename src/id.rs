/// Store the ID read off a flash memory.
///
/// The manufacturer ID and (long, 16-bit) device ID are read using the 0x9F command.
/// The low byte of the device ID is the capacity code: the device holds
/// `1 << capacity_code` bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JedecId {
    pub manufacturer_id: u8,
    pub device_id: u16,
}

impl JedecId {
    /// Parse the three bytes returned by the 0x9F command.
    pub fn from_bytes(data: [u8; 3]) -> Self {
        JedecId {
            manufacturer_id: data[0],
            device_id: u16::from_be_bytes([data[1], data[2]]),
        }
    }

    /// Memory type byte (high byte of the device ID).
    pub fn memory_type(&self) -> u8 {
        (self.device_id >> 8) as u8
    }

    /// Capacity code (low byte of the device ID).
    pub fn capacity_code(&self) -> u8 {
        self.device_id as u8
    }

    /// True if the ID looks like nothing answered on the bus.
    pub fn is_blank(&self) -> bool {
        matches!((self.manufacturer_id, self.device_id), (0x00, 0x0000) | (0xFF, 0xFFFF))
    }

    /// Look up a manufacturer name from the JEDEC ID.
    #[cfg(feature = "jep106")]
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        match jep106::JEP106Code::new(0, self.manufacturer_id & 0x7F).get() {
            // Winbond acquired NEXCOM and so the ID 0xEF is commonly used for Winbond memory.
            Some(mfn) if mfn == "NEXCOM" => Some("Winbond/NEXCOM"),
            // GigaDevice flash doesn't use a continuation code, so 0xC8 appears as Apple Computer.
            Some(mfn) if mfn == "Apple Computer" => Some("Apple Computer/GigaDevice Semiconductor"),
            Some(mfn) => Some(mfn),
            None => None,
        }
    }

    #[cfg(not(feature = "jep106"))]
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        crate::catalog::manufacturer(self.manufacturer_id).map(|m| m.name)
    }
}

impl std::fmt::Display for JedecId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mfn = match self.manufacturer_name() {
            Some(mfn) => format!(" ({})", mfn),
            None => "".to_string(),
        };
        write!(f, "Manufacturer 0x{:02X}{}, Device 0x{:04X}",
               self.manufacturer_id, mfn, self.device_id)
    }
}

#[test]
fn test_jedec_id_fields() {
    let id = JedecId::from_bytes([0xEF, 0x40, 0x18]);
    assert_eq!(id.manufacturer_id, 0xEF);
    assert_eq!(id.device_id, 0x4018);
    assert_eq!(id.memory_type(), 0x40);
    assert_eq!(id.capacity_code(), 0x18);
    assert!(!id.is_blank());
    assert!(JedecId::from_bytes([0xFF; 3]).is_blank());
    assert!(JedecId::from_bytes([0x00; 3]).is_blank());
    assert!(id.to_string().starts_with("Manufacturer 0xEF"));
    assert!(id.to_string().ends_with("Device 0x4018"));
}
