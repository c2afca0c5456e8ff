/// Status Register 1
#[derive(Copy, Clone, Debug)]
pub struct StatusRegister1(pub u8);

impl StatusRegister1 {
    /// Mask of the BUSY bit, for use with status polling.
    pub const BUSY: u8 = 0b0000_0001;

    /// Get BUSY bit.
    pub fn get_busy(&self) -> bool {
        self.0 & Self::BUSY != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn get_wel(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }
}

/// Winbond Status Register 2
#[derive(Copy, Clone, Debug)]
pub struct StatusRegister2(pub u8);

impl StatusRegister2 {
    /// Get QE (quad enable) bit.
    pub fn get_qe(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }

    /// Set QE (quad enable) bit.
    pub fn set_qe(&mut self, qe: bool) {
        self.0 &= 0b1111_1101;
        self.0 |= (qe as u8) << 1;
    }
}

/// Winbond QPI read parameters, written with the Set Read Parameters instruction.
#[derive(Copy, Clone, Debug)]
pub struct ReadParameters(pub u8);

impl ReadParameters {
    /// Get the number of dummy cycles used by QPI fast reads.
    pub fn get_dummy_cycles(&self) -> u8 {
        (((self.0 >> 4) & 0b11) + 1) * 2
    }

    /// Set the number of dummy cycles used by QPI fast reads.
    ///
    /// Only 2, 4, 6 and 8 cycles can be encoded; returns false for other values.
    pub fn set_dummy_cycles(&mut self, cycles: u8) -> bool {
        match cycles {
            2 | 4 | 6 | 8 => {
                self.0 &= 0b1100_1111;
                self.0 |= ((cycles / 2) - 1) << 4;
                true
            },
            _ => false,
        }
    }
}

/// Micron Volatile Configuration Register
#[derive(Copy, Clone, Debug)]
pub struct VolatileConfig(pub u8);

impl VolatileConfig {
    /// Get the number of dummy cycles for fast reads.
    pub fn get_dummy_cycles(&self) -> u8 {
        self.0 >> 4
    }

    /// Set the number of dummy cycles for fast reads.
    ///
    /// The field is four bits wide and 0 and 15 select the device default,
    /// so only 1 to 14 cycles can be set explicitly; returns false otherwise.
    pub fn set_dummy_cycles(&mut self, cycles: u8) -> bool {
        if (1..=14).contains(&cycles) {
            self.0 = (self.0 & 0x0F) | (cycles << 4);
            true
        } else {
            false
        }
    }
}

/// Micron Enhanced Volatile Configuration Register
#[derive(Copy, Clone, Debug)]
pub struct EnhancedVolatileConfig(pub u8);

impl EnhancedVolatileConfig {
    /// Get quad I/O protocol state. The register bit is active low.
    pub fn get_quad_protocol(&self) -> bool {
        self.0 & 0b1000_0000 == 0
    }

    /// Set quad I/O protocol state.
    pub fn set_quad_protocol(&mut self, quad: bool) {
        self.0 &= 0b0111_1111;
        self.0 |= (!quad as u8) << 7;
    }
}

#[test]
fn test_status_register_bits() {
    assert!(StatusRegister1(0x01).get_busy());
    assert!(!StatusRegister1(0x02).get_busy());
    assert!(StatusRegister1(0x02).get_wel());

    let mut sr2 = StatusRegister2(0x40);
    assert!(!sr2.get_qe());
    sr2.set_qe(true);
    assert_eq!(sr2.0, 0x42);
    sr2.set_qe(false);
    assert_eq!(sr2.0, 0x40);
}

#[test]
fn test_read_parameters() {
    let mut params = ReadParameters(0);
    assert_eq!(params.get_dummy_cycles(), 2);
    assert!(params.set_dummy_cycles(8));
    assert_eq!(params.0, 0x30);
    assert_eq!(params.get_dummy_cycles(), 8);
    assert!(params.set_dummy_cycles(6));
    assert_eq!(params.0, 0x20);
    assert!(!params.set_dummy_cycles(0));
    assert!(!params.set_dummy_cycles(5));
    assert_eq!(params.0, 0x20);
}

#[test]
fn test_micron_config_registers() {
    let mut vcr = VolatileConfig(0xFB);
    assert!(vcr.set_dummy_cycles(8));
    assert_eq!(vcr.0, 0x8B);
    assert!(!vcr.set_dummy_cycles(15));

    let mut evcr = EnhancedVolatileConfig(0xFF);
    assert!(!evcr.get_quad_protocol());
    evcr.set_quad_protocol(true);
    assert_eq!(evcr.0, 0x7F);
    assert!(evcr.get_quad_protocol());
}
