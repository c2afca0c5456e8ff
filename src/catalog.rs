//! Supported devices.
//!
//! Each manufacturer entry lists its devices and the quad-mode strategy used to bring
//! them into four-wire operation. The tables are curated so device IDs are unique within
//! a manufacturer.

use crate::quad::{Micron, QuadMode, Winbond};
use crate::transport::BusWidth;

pub const MANUFACTURER_ID_MICRON: u8 = 0x20;
pub const MANUFACTURER_ID_WINBOND: u8 = 0xEF;

/// Parameters of one flash device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// 16-bit JEDEC device ID; the low byte is the capacity code.
    pub device_id: u16,
    pub name: &'static str,
    /// Smallest erasable unit, in bytes.
    pub sector_size: u32,
    /// Double transfer rate support.
    pub supports_dtr: bool,
    /// Total cycles between address and data in quad fast read,
    /// including any alternate (mode) byte.
    pub quad_dummy_cycles: u8,
    /// Width of the mode byte sent after the address in quad fast read, if any.
    pub alt_bytes: Option<BusWidth>,
}

impl DeviceDescriptor {
    const fn new(device_id: u16, name: &'static str, supports_dtr: bool,
                 quad_dummy_cycles: u8, alt_bytes: Option<BusWidth>) -> Self {
        DeviceDescriptor {
            device_id, name, sector_size: 4096, supports_dtr, quad_dummy_cycles, alt_bytes
        }
    }

    /// Capacity code, the low byte of the device ID.
    pub fn capacity_code(&self) -> u8 {
        self.device_id as u8
    }

    /// Total capacity in bytes, derived from the capacity code.
    pub fn capacity(&self) -> u64 {
        1u64.checked_shl(self.capacity_code() as u32).unwrap_or(0)
    }

    /// Number of sectors on the device.
    pub fn sector_count(&self) -> u64 {
        self.capacity() / self.sector_size as u64
    }

    /// Clock cycles taken by the mode byte.
    pub fn alt_byte_cycles(&self) -> u8 {
        self.alt_bytes.map(|w| w.cycles_per_byte()).unwrap_or(0)
    }

    /// Dummy cycles to program into a read command, after the mode byte.
    pub fn read_dummy_cycles(&self) -> u8 {
        self.quad_dummy_cycles.saturating_sub(self.alt_byte_cycles())
    }
}

/// A supported manufacturer.
#[derive(Debug)]
pub struct ManufacturerEntry {
    pub id: u8,
    pub name: &'static str,
    pub devices: &'static [DeviceDescriptor],
    /// Constructs the quad-mode strategy for this manufacturer's devices.
    pub quad_mode: fn() -> Box<dyn QuadMode>,
}

impl ManufacturerEntry {
    /// Find one of this manufacturer's devices by ID.
    pub fn device(&self, device_id: u16) -> Option<&'static DeviceDescriptor> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }
}

static MICRON_DEVICES: [DeviceDescriptor; 2] = [
    DeviceDescriptor::new(0xBA18, "MT25QL128ABA", true, 8, None),
    DeviceDescriptor::new(0xBB18, "MT25QU128ABA", true, 8, None),
];

static WINBOND_DEVICES: [DeviceDescriptor; 8] = [
    DeviceDescriptor::new(0x4015, "W25Q16DV", false, 8, Some(BusWidth::Quad)),
    DeviceDescriptor::new(0x4016, "W25Q32FV", false, 8, Some(BusWidth::Quad)),
    DeviceDescriptor::new(0x6016, "W25Q32FV", false, 8, Some(BusWidth::Quad)),
    DeviceDescriptor::new(0x4017, "W25Q64FV", false, 8, Some(BusWidth::Quad)),
    DeviceDescriptor::new(0x6017, "W25Q64FV", false, 8, Some(BusWidth::Quad)),
    DeviceDescriptor::new(0x4018, "W25Q128FV", false, 8, Some(BusWidth::Quad)),
    DeviceDescriptor::new(0x6018, "W25Q128FV", false, 8, Some(BusWidth::Quad)),
    DeviceDescriptor::new(0x7018, "W25Q128JV", true, 8, Some(BusWidth::Quad)),
];

fn micron() -> Box<dyn QuadMode> {
    Box::new(Micron)
}

fn winbond() -> Box<dyn QuadMode> {
    Box::new(Winbond)
}

/// All supported manufacturers.
pub static MANUFACTURERS: [ManufacturerEntry; 2] = [
    ManufacturerEntry {
        id: MANUFACTURER_ID_MICRON,
        name: "Micron (ST)",
        devices: &MICRON_DEVICES,
        quad_mode: micron,
    },
    ManufacturerEntry {
        id: MANUFACTURER_ID_WINBOND,
        name: "Winbond",
        devices: &WINBOND_DEVICES,
        quad_mode: winbond,
    },
];

/// Find a manufacturer by JEDEC manufacturer ID.
pub fn manufacturer(manufacturer_id: u8) -> Option<&'static ManufacturerEntry> {
    MANUFACTURERS.iter().find(|m| m.id == manufacturer_id)
}

/// Look up a manufacturer and device by JEDEC ID.
///
/// Returns None for any ID not in the catalog.
pub fn identify(manufacturer_id: u8, device_id: u16)
    -> Option<(&'static ManufacturerEntry, &'static DeviceDescriptor)>
{
    let entry = manufacturer(manufacturer_id)?;
    let device = entry.device(device_id)?;
    log::trace!("Catalog match: {} {}", entry.name, device.name);
    Some((entry, device))
}
