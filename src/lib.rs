// Copyright 2020, 2021 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! qspi-flash
//!
//! This crate drives serial NOR flash memories attached to a quad SPI peripheral,
//! including identifying the device, switching it into quad mode, reading,
//! programming and erasing, and presenting it as a block device.

use core::time::Duration;
#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};

pub mod block;
pub mod catalog;
pub mod id;
pub mod quad;
pub mod sim;
pub mod sreg;
pub mod transport;
mod erase_plan;
mod sync;

pub use block::{BlockDevice, WritePath};
pub use catalog::{identify, DeviceDescriptor, ManufacturerEntry};
pub use id::JedecId;
pub use quad::QuadMode;
pub use sync::{EventHandle, Token};
pub use transport::{BusWidth, Command, Data, StatusPoll, Transport};

use erase_plan::ErasePlan;
use sreg::StatusRegister1;
use sync::{TimedGuard, TimedMutex};

/// Size of the page program buffer. Page program commands must not cross a page boundary.
pub const PAGE_SIZE: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Flash bus is busy.")]
    Busy,
    #[error("Timed out waiting for the flash device.")]
    Timeout,
    #[error("Unsupported flash device: manufacturer 0x{manufacturer_id:02X}, \
             device 0x{device_id:04X}.")]
    TypeNotFound { manufacturer_id: u8, device_id: u16 },
    #[error("Flash device has not been identified.")]
    NotInitialized,
    #[error("Address out of range for memory: 0x{address:08X}.")]
    InvalidAddress { address: u32 },
    #[error("Invalid data length: expected {expected} bytes, got {actual}.")]
    InvalidLength { expected: usize, actual: usize },
    #[error("Device cannot be configured for {cycles} dummy cycles.")]
    InvalidDummyCycles { cycles: u8 },

    #[error(transparent)]
    Access(#[from] anyhow::Error),
}

impl Error {
    /// Classify this error as one of the driver's result codes.
    pub fn status(&self) -> Status {
        match self {
            Error::Busy => Status::Busy,
            Error::Timeout => Status::Timeout,
            Error::TypeNotFound { .. } => Status::TypeNotFound,
            _ => Status::Error,
        }
    }
}

/// Result codes reported by the driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Generic transport or protocol failure.
    Error,
    /// The bus could not be locked in time.
    Busy,
    /// A transfer or status poll did not complete in time.
    Timeout,
    /// The device answered with an ID which is not in the catalog.
    TypeNotFound,
}

impl Status {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub type AnyhowResult<T> = anyhow::Result<T>;

/// Driver version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Deadlines for each class of operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Locking the bus, register access, reads and page programs.
    pub command: Duration,
    /// Sector and block erases.
    pub erase: Duration,
    /// Whole chip erase.
    pub chip_erase: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            command: Duration::from_millis(100),
            erase: Duration::from_millis(2000),
            chip_erase: Duration::from_secs(200),
        }
    }
}

/// Erase operations, by area of effect.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum EraseKind {
    /// 4kB sector.
    Sector = 0x20,
    /// 32kB block.
    Block32K = 0x52,
    /// 64kB block.
    Block64K = 0xD8,
    /// Entire device.
    Chip = 0xC7,
}

impl EraseKind {
    /// Number of bytes erased, or 0 for a chip erase, which depends on the device.
    pub fn size(&self) -> usize {
        match self {
            EraseKind::Sector => 4 * 1024,
            EraseKind::Block32K => 32 * 1024,
            EraseKind::Block64K => 64 * 1024,
            EraseKind::Chip => 0,
        }
    }
}

/// State protected by the bus lock.
struct Bus<T> {
    transport: T,
    /// Width of instruction phases the device currently expects.
    protocol: BusWidth,
    /// Set while the transport is in memory-mapped mode.
    mapped: bool,
}

/// Quad SPI Flash.
///
/// This struct sequences the command exchanges for each flash operation.
/// It exclusively owns its transport; operations from several threads are
/// serialized on an internal lock.
pub struct Flash<T: Transport> {
    bus: TimedMutex<Bus<T>>,

    /// Raised by the transport when a deferred operation completes.
    event: EventHandle,

    timeouts: Timeouts,

    /// Set once the device has been identified.
    manufacturer: Option<&'static ManufacturerEntry>,
    device: Option<&'static DeviceDescriptor>,
    quad: Option<Box<dyn QuadMode>>,
}

impl<T: Transport> Flash<T> {
    #[cfg(feature = "progress")]
    const DATA_PROGRESS_TPL: &'static str =
        " {msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}; {eta_precise})";
    #[cfg(feature = "progress")]
    const DATA_PROGRESS_CHARS: &'static str = "=> ";

    /// Create a new Flash instance using the given transport.
    ///
    /// The device is not accessed until `initialize()` is called.
    pub fn new(mut transport: T) -> Self {
        let event = EventHandle::new();
        transport.bind(event.clone());
        Flash {
            bus: TimedMutex::new(Bus { transport, protocol: BusWidth::Single, mapped: false }),
            event,
            timeouts: Timeouts::default(),
            manufacturer: None,
            device: None,
            quad: None,
        }
    }

    /// Get a handle for reporting completion of deferred transport operations.
    pub fn event_handle(&self) -> EventHandle {
        self.event.clone()
    }

    /// Get the operation timeouts.
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Set the operation timeouts.
    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    /// Get the identified device's parameters.
    pub fn device(&self) -> Option<&'static DeviceDescriptor> {
        self.device
    }

    /// Get the manufacturer name, or an empty string if no device has been identified.
    pub fn manufacturer_name(&self) -> &'static str {
        self.manufacturer.map(|m| m.name).unwrap_or("")
    }

    /// Get the device name, or an empty string if no device has been identified.
    pub fn memory_type(&self) -> &'static str {
        self.device.map(|d| d.name).unwrap_or("")
    }

    /// Get the sector size in bytes, or 0 if no device has been identified.
    pub fn sector_size(&self) -> usize {
        self.device.map(|d| d.sector_size as usize).unwrap_or(0)
    }

    /// Get the number of sectors, or 0 if no device has been identified.
    pub fn sector_count(&self) -> usize {
        self.device.map(|d| d.sector_count() as usize).unwrap_or(0)
    }

    /// Get the total memory capacity in bytes, or 0 if no device has been identified.
    pub fn capacity(&self) -> usize {
        self.device.map(|d| d.capacity() as usize).unwrap_or(0)
    }

    /// Identify the device and switch it into quad mode.
    ///
    /// If identification fails the device may be in deep power-down or left in quad
    /// mode, so it is woken and reset and identification is tried once more.
    ///
    /// Returns `Error::TypeNotFound` if the device answers but is not in the catalog.
    pub fn initialize(&mut self) -> Result<()> {
        log::debug!("Initializing flash");
        self.forget();
        if let Err(e) = self.identify() {
            log::warn!("Identification failed ({}), waking and resetting device", e);
            self.recover()?;
            self.identify()?;
        }
        if let Err(e) = self.enter_quad_mode() {
            log::warn!("Entering quad mode failed: {}", e);
            self.forget();
            return Err(e);
        }
        Ok(())
    }

    /// Forget the identified device and return it to its default state.
    pub fn uninitialize(&mut self) -> Result<()> {
        log::debug!("Uninitializing flash");
        self.forget();
        if let Err(e) = self.sleep(false) {
            log::debug!("Release power-down failed: {}", e);
        }
        self.reset()
    }

    /// Read the device's JEDEC manufacturer and device IDs.
    ///
    /// This does not consult the catalog.
    pub fn read_id(&self) -> Result<JedecId> {
        log::debug!("Reading JEDEC ID");
        let mut bus = self.lock()?;
        let mut data = [0u8; 3];
        let cmd = Command::new(Opcode::ReadJEDECID, BusWidth::Single)
            .read(&mut data, BusWidth::Single);
        self.transfer(&mut bus, cmd, self.timeouts.command)?;
        let id = JedecId::from_bytes(data);
        log::debug!("Read ID: {}", id);
        Ok(id)
    }

    /// Enter (`true`) or leave (`false`) deep power-down.
    pub fn sleep(&self, enter: bool) -> Result<()> {
        let opcode = if enter { Opcode::Powerdown } else { Opcode::ReleasePowerdown };
        log::debug!("Sending {:?} command", opcode);
        let mut bus = self.lock()?;
        let width = bus.protocol;
        bus.transport.command(Command::new(opcode, width))?;
        Ok(())
    }

    /// Software reset the device.
    ///
    /// The device returns to single-line mode, so quad mode must be entered again
    /// with `initialize()`.
    pub fn reset(&self) -> Result<()> {
        log::debug!("Resetting device");
        let mut bus = self.lock()?;
        let width = bus.protocol;
        bus.transport.command(Command::new(Opcode::EnableReset, width))?;
        bus.transport.command(Command::new(Opcode::Reset, width))?;
        bus.protocol = BusWidth::Single;
        Ok(())
    }

    /// Map the flash into the controller's address space.
    ///
    /// Any later operation on this Flash leaves memory-mapped mode first.
    pub fn enter_mem_mapped(&self) -> Result<()> {
        let device = self.require_device()?;
        let mut bus = self.lock()?;
        let cmd = Self::read_command(device, bus.protocol).address(0, BusWidth::Quad);
        bus.transport.memory_mapped(cmd)?;
        bus.mapped = true;
        log::debug!("Entered memory-mapped mode");
        Ok(())
    }

    /// Leave memory-mapped mode.
    pub fn exit_mem_mapped(&self) -> Result<()> {
        let mut bus = self.acquire()?;
        bus.transport.abort();
        bus.mapped = false;
        log::debug!("Left memory-mapped mode");
        Ok(())
    }

    /// Read `length` bytes of data from the attached flash, starting at `address`.
    pub fn read(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.require_device()?;
        self.check_address_length(address, length)?;
        let mut data = vec![0u8; length];
        self.read_into(address, &mut data)?;
        Ok(data)
    }

    /// Fill `buf` with data from the attached flash, starting at `address`.
    ///
    /// This uses the Fast Read Quad I/O instruction with the device's dummy cycles.
    pub fn read_into(&self, address: u32, buf: &mut [u8]) -> Result<()> {
        let device = self.require_device()?;
        if buf.is_empty() {
            return Ok(());
        }
        self.check_address_length(address, buf.len())?;
        let mut bus = self.lock()?;
        log::trace!("Reading {} bytes from 0x{:08X}", buf.len(), address);
        let cmd = Self::read_command(device, bus.protocol)
            .address(address, BusWidth::Quad)
            .read(buf, BusWidth::Quad);
        self.transfer(&mut bus, cmd, self.timeouts.command)
    }

    /// Read `length` bytes of data from the attached flash, starting at `address`.
    ///
    /// This method is similar to the `read()` method, except it calls the provided
    /// callback function at regular intervals with the number of bytes read so far.
    ///
    /// While `read()` performs a single long transfer, this method performs
    /// up to 128 separate transfers to allow progress to be reported.
    pub fn read_cb<F: Fn(usize)>(&self, address: u32, length: usize, cb: F) -> Result<Vec<u8>> {
        self.require_device()?;
        self.check_address_length(address, length)?;
        let chunk_size = usize::max(1024, length / 128);
        let start = address as usize;
        let end = start + length;
        let mut data = vec![0u8; length];
        cb(0);
        for addr in (start..end).step_by(chunk_size) {
            let size = usize::min(chunk_size, end - addr);
            self.read_into(addr as u32, &mut data[addr - start..addr - start + size])?;
            cb(addr - start + size);
        }
        cb(data.len());
        Ok(data)
    }

    /// Read `length` bytes of data from the attached flash, starting at `address`.
    ///
    /// This method is similar to the `read()` method, except it renders a progress
    /// bar to the terminal during the read.
    #[cfg(feature = "progress")]
    pub fn read_progress(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        let pb = ProgressBar::new(length as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Reading");
        let result = self.read_cb(address, length, |n| pb.set_position(n as u64));
        pb.finish();
        result
    }

    /// Program `data` to `address`, automatically split into multiple page program operations.
    ///
    /// Note that this does *not* erase the flash beforehand; see [`BlockDevice`]
    /// for a write interface which erases only when required.
    pub fn write(&self, address: u32, data: &[u8]) -> Result<()> {
        self.write_cb(address, data, |_| {})
    }

    /// Program `data` to `address`, automatically split into multiple page program operations,
    /// and draws a progress bar to the terminal.
    #[cfg(feature = "progress")]
    pub fn write_progress(&self, address: u32, data: &[u8]) -> Result<()> {
        let pb = ProgressBar::new(data.len() as u64).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Writing");
        self.write_cb(address, data, |n| pb.set_position(n as u64))?;
        pb.finish();
        Ok(())
    }

    /// Program `data` to `address`, automatically split into multiple page program operations.
    ///
    /// Calls `cb` with the number of bytes programmed so far after each
    /// page programming operation. Stops at the first failed page.
    pub fn write_cb<F: Fn(usize)>(&self, address: u32, mut data: &[u8], cb: F) -> Result<()> {
        self.require_device()?;
        if data.is_empty() {
            return Ok(());
        }
        self.check_address_length(address, data.len())?;

        log::trace!("Programming {} bytes to 0x{:08X}", data.len(), address);

        let mut total_bytes = 0;
        cb(total_bytes);

        // If the address is not page-aligned, we need to do a
        // smaller-than-page-size initial program.
        let first_write = PAGE_SIZE - ((address as usize) % PAGE_SIZE);
        if first_write != PAGE_SIZE {
            let first_write = usize::min(first_write, data.len());
            log::trace!("Programming partial first page of {} bytes", first_write);
            self.page_program(address, &data[..first_write])?;
            total_bytes += first_write;
            data = &data[first_write..];
            cb(total_bytes);
        }

        for page_data in data.chunks(PAGE_SIZE) {
            self.page_program(address + total_bytes as u32, page_data)?;
            total_bytes += page_data.len();
            cb(total_bytes);
        }

        Ok(())
    }

    /// Program up to one page of data.
    ///
    /// `data` must not cross a page boundary, or the device wraps around within the page.
    /// This method sets the write-enable latch and then waits for programming to complete.
    pub fn page_program(&self, address: u32, data: &[u8]) -> Result<()> {
        self.require_device()?;
        let mut bus = self.lock()?;
        let width = bus.protocol;
        Self::write_enable(&mut bus)?;
        let cmd = Command::new(Opcode::PageProgram, width)
            .address(address, width)
            .write(data, width);
        self.transfer(&mut bus, cmd, self.timeouts.command)?;
        self.wait_while_busy(&mut bus, self.timeouts.command)
    }

    /// Erase the sector, block or chip containing `address`.
    ///
    /// Returns only after the erase operation is complete. `address` is ignored
    /// for `EraseKind::Chip`.
    pub fn erase(&self, address: u32, kind: EraseKind) -> Result<()> {
        self.require_device()?;
        if kind != EraseKind::Chip {
            self.check_address_length(address, 1)?;
        }
        let mut bus = self.lock()?;
        let width = bus.protocol;
        log::debug!("Erasing {:?} at 0x{:08X}", kind, address);
        Self::write_enable(&mut bus)?;
        let mut cmd = Command::new(kind, width);
        if kind != EraseKind::Chip {
            cmd = cmd.address(address, width);
        }
        bus.transport.command(cmd)?;
        let timeout = match kind {
            EraseKind::Chip => self.timeouts.chip_erase,
            _ => self.timeouts.erase,
        };
        self.wait_while_busy(&mut bus, timeout)
    }

    /// Erase entire flash chip.
    pub fn erase_chip(&self) -> Result<()> {
        self.erase(0, EraseKind::Chip)
    }

    /// Erase all sectors and blocks covering `address` to `address + length`.
    ///
    /// The range is covered with the fewest sector and block erases, so data outside
    /// the range which shares an erase unit with it is lost too.
    pub fn erase_range(&self, address: u32, length: usize) -> Result<()> {
        self.erase_range_cb(address, length, |_| {})
    }

    /// Erase all sectors and blocks covering `address` to `address + length`.
    ///
    /// Calls `cb` with the number of bytes erased so far.
    pub fn erase_range_cb<F: Fn(usize)>(&self, address: u32, length: usize, cb: F)
        -> Result<()>
    {
        self.require_device()?;
        if length == 0 {
            return Ok(());
        }
        self.check_address_length(address, length)?;
        let kinds = [EraseKind::Sector, EraseKind::Block32K, EraseKind::Block64K];
        let plan = ErasePlan::new(&kinds, address as usize, length);
        let mut total_erased = 0;
        cb(total_erased);
        for (kind, base) in plan.0.iter() {
            self.erase(*base, *kind)?;
            total_erased += kind.size();
            cb(total_erased);
        }
        Ok(())
    }

    /// Erase all sectors and blocks covering `address` to `address + length`,
    /// and draw a progress bar to the terminal.
    #[cfg(feature = "progress")]
    pub fn erase_range_progress(&self, address: u32, length: usize) -> Result<()> {
        self.require_device()?;
        self.check_address_length(address, length)?;
        let kinds = [EraseKind::Sector, EraseKind::Block32K, EraseKind::Block64K];
        let erase_size = ErasePlan::new(&kinds, address as usize, length).total_size() as u64;
        let pb = ProgressBar::new(erase_size).with_style(ProgressStyle::default_bar()
            .template(Self::DATA_PROGRESS_TPL).progress_chars(Self::DATA_PROGRESS_CHARS));
        pb.set_message("Erasing");
        self.erase_range_cb(address, length, |n| pb.set_position(n as u64))?;
        pb.finish();
        Ok(())
    }

    /// Read `length` bytes starting at the beginning of `sector`.
    pub fn read_sector(&self, sector: u32, length: usize) -> Result<Vec<u8>> {
        self.read(self.sector_address(sector)?, length)
    }

    /// Program `data` starting at the beginning of `sector`.
    pub fn write_sector(&self, sector: u32, data: &[u8]) -> Result<()> {
        self.write(self.sector_address(sector)?, data)
    }

    /// Erase `sector`.
    pub fn erase_sector(&self, sector: u32) -> Result<()> {
        self.erase(self.sector_address(sector)?, EraseKind::Sector)
    }

    fn forget(&mut self) {
        self.manufacturer = None;
        self.device = None;
        self.quad = None;
    }

    /// Read the ID and look it up in the catalog.
    fn identify(&mut self) -> Result<()> {
        let id = self.read_id()?;
        if id.is_blank() {
            log::warn!("No device answered: {}", id);
        }
        match catalog::identify(id.manufacturer_id, id.device_id) {
            Some((manufacturer, device)) => {
                log::debug!("Identified {} {}", manufacturer.name, device.name);
                self.manufacturer = Some(manufacturer);
                self.device = Some(device);
                self.quad = Some((manufacturer.quad_mode)());
                Ok(())
            },
            None => {
                log::warn!("Unsupported device: {} (memory type 0x{:02X}, capacity code 0x{:02X})",
                           id, id.memory_type(), id.capacity_code());
                Err(Error::TypeNotFound {
                    manufacturer_id: id.manufacturer_id,
                    device_id: id.device_id,
                })
            },
        }
    }

    /// Wake and reset a device which did not answer identification.
    ///
    /// The device may be asleep or still in quad mode from an earlier session,
    /// so the sequence is sent on four lines and then on one.
    fn recover(&self) -> Result<()> {
        let sequence = [Opcode::ReleasePowerdown, Opcode::EnableReset, Opcode::Reset];
        let mut bus = self.lock()?;
        for opcode in sequence.iter() {
            if let Err(e) = bus.transport.command(Command::new(*opcode, BusWidth::Quad)) {
                log::debug!("Quad-width {:?} failed: {}", opcode, e);
            }
        }
        for opcode in sequence.iter() {
            bus.transport.command(Command::new(*opcode, BusWidth::Single))?;
        }
        bus.protocol = BusWidth::Single;
        Ok(())
    }

    fn enter_quad_mode(&self) -> Result<()> {
        let (device, quad) = match (self.device, self.quad.as_ref()) {
            (Some(device), Some(quad)) => (device, quad),
            _ => return Err(Error::NotInitialized),
        };
        let mut bus = self.lock()?;
        log::debug!("Entering quad mode using {} sequence", quad.name());
        let width = quad.enter_quad_mode(&mut bus.transport, device)?;
        bus.protocol = width;
        Ok(())
    }

    fn require_device(&self) -> Result<&'static DeviceDescriptor> {
        match self.device {
            Some(device) => Ok(device),
            None => {
                log::error!("No flash device has been identified");
                Err(Error::NotInitialized)
            },
        }
    }

    fn sector_address(&self, sector: u32) -> Result<u32> {
        let device = self.require_device()?;
        sector.checked_mul(device.sector_size).ok_or(Error::InvalidAddress { address: u32::MAX })
    }

    /// Lock the bus, waiting at most the command timeout.
    fn acquire(&self) -> Result<TimedGuard<'_, Bus<T>>> {
        match self.bus.lock_timeout(self.timeouts.command) {
            Some(bus) => Ok(bus),
            None => {
                log::warn!("Timed out waiting for the flash bus");
                Err(Error::Busy)
            },
        }
    }

    /// Lock the bus for a command, leaving memory-mapped mode if required.
    fn lock(&self) -> Result<TimedGuard<'_, Bus<T>>> {
        let mut bus = self.acquire()?;
        if bus.mapped {
            log::debug!("Leaving memory-mapped mode");
            bus.transport.abort();
            bus.mapped = false;
        }
        Ok(bus)
    }

    /// Build the fast read command for `device`, without address or data.
    fn read_command<'a>(device: &DeviceDescriptor, protocol: BusWidth) -> Command<'a> {
        let mut cmd = Command::new(Opcode::FastReadQuadIO, protocol)
            .dummy(device.read_dummy_cycles());
        if let Some(width) = device.alt_bytes {
            // A mode byte of 0x00 keeps continuous read mode disabled.
            cmd = cmd.alternate(0x00, width);
        }
        cmd
    }

    fn write_enable(bus: &mut Bus<T>) -> Result<()> {
        let width = bus.protocol;
        bus.transport.command(Command::new(Opcode::WriteEnable, width))?;
        Ok(())
    }

    /// Start a deferred transfer and wait for it to complete.
    fn transfer(&self, bus: &mut Bus<T>, cmd: Command<'_>, timeout: Duration) -> Result<()> {
        log::trace!("Transfer: instruction 0x{:02X}, {} data bytes",
                    cmd.instruction, cmd.data.len());
        self.event.arm();
        if let Err(e) = bus.transport.start(cmd) {
            bus.transport.abort();
            return Err(e.into());
        }
        self.await_completion(bus, timeout)
    }

    /// Wait until the device stops being busy, using automatic status polling.
    fn wait_while_busy(&self, bus: &mut Bus<T>, timeout: Duration) -> Result<()> {
        let poll = StatusPoll {
            instruction: Opcode::ReadStatusRegister1.into(),
            width: bus.protocol,
            mask: StatusRegister1::BUSY,
            matches: 0,
            interval: 0x10,
        };
        self.event.arm();
        if let Err(e) = bus.transport.start_polling(&poll) {
            bus.transport.abort();
            return Err(e.into());
        }
        self.await_completion(bus, timeout)
    }

    fn await_completion(&self, bus: &mut Bus<T>, timeout: Duration) -> Result<()> {
        if self.event.wait(timeout) {
            Ok(())
        } else {
            log::error!("No completion within {:?}, aborting", timeout);
            bus.transport.abort();
            Err(Error::Timeout)
        }
    }

    /// Checks that `address` to `address + length` lies within the device.
    /// Returns either Err(Error::InvalidAddress) or Ok(()).
    fn check_address_length(&self, address: u32, length: usize) -> Result<()> {
        log::trace!("Checking address={:08X} length={}", address, length);
        let end = (address as u64).saturating_add(length as u64);
        if end > self.capacity() as u64 {
            log::error!("Operation would exceed flash capacity");
            let last = end.saturating_sub(1).min(u32::MAX as u64) as u32;
            Err(Error::InvalidAddress { address: last })
        } else {
            Ok(())
        }
    }
}

/// Standard flash command opcodes.
///
/// These are taken from the Winbond W25Q128FV datasheet, but are shared by the
/// Micron MT25Q series. Erase instructions are in [`EraseKind`] and
/// manufacturer-specific instructions in [`quad`].
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[allow(unused)]
#[repr(u8)]
pub enum Opcode {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    WriteEnableVolatile = 0x50,
    ReadStatusRegister1 = 0x05,
    WriteStatusRegister1 = 0x01,

    ReadJEDECID = 0x9F,
    Powerdown = 0xB9,
    ReleasePowerdown = 0xAB,
    EnableReset = 0x66,
    Reset = 0x99,

    PageProgram = 0x02,
    QuadPageProgram = 0x32,

    ReadData = 0x03,
    FastRead = 0x0B,
    FastReadQuadOutput = 0x6B,
    FastReadQuadIO = 0xEB,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{test_pattern, SimCompletion, SimEvent, SimFlash};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn short_timeouts() -> Timeouts {
        Timeouts {
            command: Duration::from_millis(20),
            erase: Duration::from_millis(40),
            chip_erase: Duration::from_millis(60),
        }
    }

    fn flash(manufacturer_id: u8, device_id: u16) -> (Flash<SimFlash>, SimFlash) {
        let sim = SimFlash::new(manufacturer_id, device_id);
        let mut flash = Flash::new(sim.clone());
        flash.initialize().unwrap();
        (flash, sim)
    }

    #[test]
    fn info_empty_before_initialize() {
        let flash = Flash::new(SimFlash::new(0xEF, 0x4015));
        assert_eq!(flash.manufacturer_name(), "");
        assert_eq!(flash.memory_type(), "");
        assert_eq!(flash.sector_size(), 0);
        assert_eq!(flash.sector_count(), 0);
        assert!(flash.device().is_none());
    }

    #[test]
    fn operations_require_identified_device() {
        let flash = Flash::new(SimFlash::new(0xEF, 0x4015));
        assert!(matches!(flash.read(0, 4), Err(Error::NotInitialized)));
        assert!(matches!(flash.write(0, &[0]), Err(Error::NotInitialized)));
        assert!(matches!(flash.erase(0, EraseKind::Sector), Err(Error::NotInitialized)));
        assert!(matches!(flash.read_sector(0, 4), Err(Error::NotInitialized)));
        assert!(matches!(flash.write_sector(0, &[0]), Err(Error::NotInitialized)));
        assert!(matches!(flash.erase_sector(0), Err(Error::NotInitialized)));
        assert!(matches!(flash.enter_mem_mapped(), Err(Error::NotInitialized)));
        assert_eq!(Status::of(&flash.read(0, 4)), Status::Error);
        // These work without identification.
        flash.sleep(false).unwrap();
        flash.reset().unwrap();
    }

    #[test]
    fn initialize_winbond() {
        let (flash, sim) = flash(0xEF, 0x4018);
        assert_eq!(flash.manufacturer_name(), "Winbond");
        assert_eq!(flash.memory_type(), "W25Q128FV");
        assert_eq!(flash.sector_size(), 4096);
        assert_eq!(flash.sector_count(), 4096);
        assert_eq!(flash.sector_size() * flash.sector_count(), 16 * 1024 * 1024);
        assert!(sim.quad_protocol());
    }

    #[test]
    fn initialize_micron() {
        let (flash, sim) = flash(0x20, 0xBA18);
        assert_eq!(flash.manufacturer_name(), "Micron (ST)");
        assert_eq!(flash.memory_type(), "MT25QL128ABA");
        assert!(sim.quad_protocol());
        let data = test_pattern(3, 600);
        flash.write(0x1000, &data).unwrap();
        assert_eq!(flash.read(0x1000, 600).unwrap(), data);
    }

    #[test]
    fn sector_geometry_matches_capacity_for_all_devices() {
        for m in catalog::MANUFACTURERS.iter() {
            for d in m.devices.iter() {
                let (flash, _) = flash(m.id, d.device_id);
                assert_eq!((flash.sector_size() * flash.sector_count()) as u64, d.capacity());
            }
        }
    }

    #[test]
    fn initialize_unknown_device() {
        let sim = SimFlash::new(0xC2, 0x2018);
        let mut flash = Flash::new(sim.clone());
        let result = flash.initialize();
        assert_eq!(Status::of(&result), Status::TypeNotFound);
        assert!(matches!(result,
            Err(Error::TypeNotFound { manufacturer_id: 0xC2, device_id: 0x2018 })));
        assert_eq!(flash.memory_type(), "");
        // One recovery attempt: two ID reads in total.
        assert_eq!(sim.opcodes().iter().filter(|&&op| op == 0x9F).count(), 2);
        // The driver stays usable.
        flash.reset().unwrap();
    }

    #[test]
    fn initialize_wakes_sleeping_device() {
        let sim = SimFlash::new(0xEF, 0x4015);
        sim.set_power_down(true);
        let mut flash = Flash::new(sim.clone());
        flash.initialize().unwrap();
        assert!(!sim.power_down());
        assert_eq!(flash.memory_type(), "W25Q16DV");
        assert_eq!(sim.opcodes().iter().filter(|&&op| op == 0x9F).count(), 2);
    }

    #[test]
    fn initialize_resets_device_left_in_quad_mode() {
        let sim = SimFlash::new(0xEF, 0x4015);
        {
            let mut first = Flash::new(sim.clone());
            first.initialize().unwrap();
        }
        assert!(sim.quad_protocol());
        let mut flash = Flash::new(sim.clone());
        flash.initialize().unwrap();
        assert_eq!(flash.memory_type(), "W25Q16DV");
        assert!(sim.quad_protocol());
    }

    #[test]
    fn initialize_retries_transport_failure_once() {
        let sim = SimFlash::new(0xEF, 0x4015);
        sim.fail_next(1);
        let mut flash = Flash::new(sim.clone());
        flash.initialize().unwrap();
        assert_eq!(flash.memory_type(), "W25Q16DV");
    }

    #[test]
    fn initialize_surfaces_second_failure() {
        let sim = SimFlash::new(0xEF, 0x4015);
        let mut flash = Flash::new(sim.clone());
        flash.set_timeouts(short_timeouts());
        sim.set_completion(SimCompletion::Never);
        let result = flash.initialize();
        assert_eq!(Status::of(&result), Status::Timeout);
        assert_eq!(sim.opcodes().iter().filter(|&&op| op == 0x9F).count(), 2);
        assert!(flash.device().is_none());
    }

    #[test]
    fn failed_quad_entry_leaves_device_unidentified() {
        let sim = SimFlash::new(0xEF, 0x4015);
        let mut flash = Flash::new(sim.clone());
        // The ID read succeeds, the first quad mode register access fails.
        sim.fail_after(1);
        assert!(matches!(flash.initialize(), Err(Error::Access(_))));
        assert!(flash.device().is_none());
        assert_eq!(flash.memory_type(), "");
        assert_eq!(flash.sector_size(), 0);
        assert!(matches!(flash.write(0, &[0x12]), Err(Error::NotInitialized)));
        assert!(matches!(flash.read(0, 1), Err(Error::NotInitialized)));
        // A later initialize still works.
        flash.initialize().unwrap();
        assert_eq!(flash.memory_type(), "W25Q16DV");
    }

    #[test]
    fn recovery_continues_after_quad_pass_failure() {
        let sim = SimFlash::new(0xEF, 0x4015);
        sim.set_power_down(true);
        let mut flash = Flash::new(sim.clone());
        // The ID read succeeds, the quad-width release from power-down fails.
        sim.fail_after(1);
        flash.initialize().unwrap();
        assert!(!sim.power_down());
        assert_eq!(flash.memory_type(), "W25Q16DV");
        assert!(sim.quad_protocol());
    }

    #[test]
    fn uninitialize_returns_device_to_single_line_mode() {
        let (mut flash, sim) = flash(0xEF, 0x4015);
        flash.uninitialize().unwrap();
        assert!(!sim.quad_protocol());
        assert_eq!(flash.memory_type(), "");
        assert!(matches!(flash.read(0, 1), Err(Error::NotInitialized)));
        flash.initialize().unwrap();
        assert!(sim.quad_protocol());
    }

    #[test]
    fn round_trip_lengths() {
        let (flash, _) = flash(0xEF, 0x4015);
        let sector = flash.sector_size();
        for (i, &n) in [1, sector, sector + 1].iter().enumerate() {
            let address = (i as u32 + 1) * 2 * sector as u32;
            let data = test_pattern(i as u32 + 10, n);
            flash.write(address, &data).unwrap();
            assert_eq!(flash.read(address, n).unwrap(), data);
        }
    }

    #[test]
    fn write_splits_on_page_boundaries() {
        let (flash, sim) = flash(0xEF, 0x4015);
        sim.clear_log();
        let data = test_pattern(7, 600);
        flash.write(0x2F0, &data).unwrap();
        let programs: Vec<(u32, usize)> = sim.events().iter().filter_map(|e| match e {
            SimEvent::Program { address, len, .. } => Some((*address, *len)),
            _ => None,
        }).collect();
        assert_eq!(programs, vec![(0x2F0, 0x10), (0x300, 256), (0x400, 256), (0x500, 72)]);
        assert_eq!(flash.read(0x2F0, 600).unwrap(), data);
    }

    #[test]
    fn short_unaligned_write_stays_in_page() {
        let (flash, sim) = flash(0xEF, 0x4015);
        sim.clear_log();
        flash.write(0x10, &[1, 2, 3]).unwrap();
        assert_eq!(sim.events(), vec![
            SimEvent::Program { address: 0x10, len: 3, onto_erased: true, needs_erase: false },
        ]);
        assert_eq!(flash.read(0x10, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn write_stops_at_first_failure() {
        let (flash, sim) = flash(0xEF, 0x4015);
        sim.clear_log();
        // Fail the write enable of the second page.
        sim.fail_after(3);
        let data = test_pattern(1, 512);
        assert!(matches!(flash.write(0, &data), Err(Error::Access(_))));
        assert_eq!(sim.events().len(), 1);
    }

    #[test]
    fn erase_kinds_and_idempotence() {
        let (flash, sim) = flash(0xEF, 0x4015);
        flash.write(0x1_2345, &[0u8; 16]).unwrap();
        flash.erase(0x1_2345, EraseKind::Sector).unwrap();
        assert!(flash.read(0x1_2000, 4096).unwrap().iter().all(|&b| b == 0xFF));
        // Erasing an erased sector is fine and changes nothing.
        flash.erase(0x1_2000, EraseKind::Sector).unwrap();
        assert!(flash.read(0x1_2000, 4096).unwrap().iter().all(|&b| b == 0xFF));

        sim.clear_log();
        flash.erase(0x1_8000, EraseKind::Block32K).unwrap();
        flash.erase(0x2_0000, EraseKind::Block64K).unwrap();
        flash.erase_chip().unwrap();
        assert_eq!(sim.events(), vec![
            SimEvent::Erase { address: 0x1_8000, size: 0x8000 },
            SimEvent::Erase { address: 0x2_0000, size: 0x1_0000 },
            SimEvent::Erase { address: 0, size: 2 * 1024 * 1024 },
        ]);
    }

    #[test]
    fn erase_range_uses_plan() {
        let (flash, sim) = flash(0xEF, 0x4015);
        sim.clear_log();
        flash.erase_range(0xF000, 0x1_1000).unwrap();
        assert_eq!(sim.events(), vec![
            SimEvent::Erase { address: 0xF000, size: 0x1000 },
            SimEvent::Erase { address: 0x1_0000, size: 0x1_0000 },
        ]);
    }

    #[test]
    fn out_of_range_rejected() {
        let (flash, _) = flash(0xEF, 0x4015);
        let capacity = flash.capacity() as u32;
        assert!(matches!(flash.read(capacity - 1, 2),
                         Err(Error::InvalidAddress { address }) if address == capacity));
        assert!(matches!(flash.write(capacity, &[0]), Err(Error::InvalidAddress { .. })));
        assert!(matches!(flash.erase(capacity, EraseKind::Sector),
                         Err(Error::InvalidAddress { .. })));
        assert!(matches!(flash.read_sector(flash.sector_count() as u32, 1),
                         Err(Error::InvalidAddress { .. })));
        assert!(matches!(flash.read_sector(u32::MAX, 1), Err(Error::InvalidAddress { .. })));
        assert!(flash.read(capacity - 1, 1).is_ok());
        assert!(flash.read(0, 0).unwrap().is_empty());
    }

    #[test]
    fn oversized_ranges_rejected_without_panic() {
        let (flash, sim) = flash(0xEF, 0x4015);
        sim.clear_log();
        assert!(matches!(flash.read(0x1000, usize::MAX), Err(Error::InvalidAddress { .. })));
        assert!(matches!(flash.erase_range(0x1000, usize::MAX),
                         Err(Error::InvalidAddress { .. })));
        #[cfg(feature = "progress")]
        assert!(matches!(flash.erase_range_progress(0x1000, usize::MAX),
                         Err(Error::InvalidAddress { .. })));
        assert!(sim.opcodes().is_empty());
    }

    #[cfg(feature = "progress")]
    #[test]
    fn erase_range_progress_requires_identified_device() {
        let flash = Flash::new(SimFlash::new(0xEF, 0x4015));
        assert!(matches!(flash.erase_range_progress(0, 4096), Err(Error::NotInitialized)));
    }

    #[test]
    fn sector_operations_match_byte_operations() {
        let (flash, sim) = flash(0xEF, 0x4015);
        let sector = flash.sector_size();
        let last = flash.sector_count() as u32 - 1;
        for &s in [0, last].iter() {
            let address = s * sector as u32;
            let data = test_pattern(s + 1, sector);
            flash.write_sector(s, &data).unwrap();
            assert_eq!(sim.peek(address, sector), data);
            assert_eq!(flash.read(address, sector).unwrap(), data);
            assert_eq!(flash.read_sector(s, sector).unwrap(), data);

            flash.erase_sector(s).unwrap();
            assert!(sim.peek(address, sector).iter().all(|&b| b == 0xFF));
            flash.write(address, &data).unwrap();
            assert_eq!(flash.read_sector(s, sector).unwrap(), data);
            flash.erase_sector(s).unwrap();
        }
    }

    #[test]
    fn every_blocking_operation_times_out() {
        let (mut flash, sim) = flash(0xEF, 0x4015);
        flash.set_timeouts(short_timeouts());
        sim.set_completion(SimCompletion::Never);
        let t0 = Instant::now();
        let results = vec![
            Status::of(&flash.read_id()),
            Status::of(&flash.read(0, 16)),
            Status::of(&flash.write(0, &[0x55; 16])),
            Status::of(&flash.page_program(0x100, &[0x55; 16])),
            Status::of(&flash.erase(0, EraseKind::Sector)),
            Status::of(&flash.erase(0, EraseKind::Block32K)),
            Status::of(&flash.erase(0, EraseKind::Block64K)),
            Status::of(&flash.erase_chip()),
        ];
        assert!(results.iter().all(|&s| s == Status::Timeout), "{:?}", results);
        assert!(t0.elapsed() < Duration::from_secs(5));
        // Every timeout aborts the outstanding transaction.
        assert!(sim.aborts() >= results.len());
    }

    #[test]
    fn delayed_completion_is_waited_for() {
        let (flash, sim) = flash(0xEF, 0x4015);
        sim.set_completion(SimCompletion::Delayed(Duration::from_millis(10)));
        flash.write(0x40, &[1, 2, 3, 4]).unwrap();
        assert_eq!(flash.read(0x40, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn late_completion_does_not_complete_next_operation() {
        let (mut flash, sim) = flash(0xEF, 0x4015);
        flash.set_timeouts(short_timeouts());
        sim.set_completion(SimCompletion::Delayed(Duration::from_millis(50)));
        assert_eq!(Status::of(&flash.read(0, 4)), Status::Timeout);

        // The abandoned read completes while the next one is outstanding.
        flash.set_timeouts(Timeouts { command: Duration::from_millis(200), ..short_timeouts() });
        sim.set_completion(SimCompletion::Never);
        assert_eq!(Status::of(&flash.read(0, 4)), Status::Timeout);
    }

    #[test]
    fn concurrent_caller_gets_busy() {
        let (mut flash, sim) = flash(0xEF, 0x4015);
        flash.set_timeouts(Timeouts {
            command: Duration::from_millis(20),
            erase: Duration::from_secs(5),
            chip_erase: Duration::from_secs(5),
        });
        sim.set_completion(SimCompletion::Delayed(Duration::from_millis(300)));
        let flash = Arc::new(flash);
        let eraser = Arc::clone(&flash);
        // The write enable and erase commands are immediate; only the status poll waits.
        let t = thread::spawn(move || eraser.erase(0, EraseKind::Sector));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(Status::of(&flash.read(0, 4)), Status::Busy);
        assert!(t.join().unwrap().is_ok());
    }

    #[test]
    fn concurrent_callers_serialize() {
        let (flash, _) = flash(0xEF, 0x4015);
        let flash = Arc::new(flash);
        let threads: Vec<_> = (0..4u32).map(|i| {
            let flash = Arc::clone(&flash);
            thread::spawn(move || {
                let data = test_pattern(i + 100, 1000);
                flash.write(i * 0x1000, &data).unwrap();
                assert_eq!(flash.read(i * 0x1000, 1000).unwrap(), data);
            })
        }).collect();
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn memory_mapped_mode() {
        let (flash, sim) = flash(0xEF, 0x4015);
        let data = test_pattern(5, 64);
        flash.write(0x800, &data).unwrap();
        assert!(sim.mapped_read(0x800, 64).is_none());
        flash.enter_mem_mapped().unwrap();
        assert_eq!(sim.mapped_read(0x800, 64).unwrap(), data);
        flash.exit_mem_mapped().unwrap();
        assert!(sim.mapped_read(0x800, 64).is_none());
        // Exit always aborts, even when not mapped.
        let aborts = sim.aborts();
        flash.exit_mem_mapped().unwrap();
        assert_eq!(sim.aborts(), aborts + 1);
    }

    #[test]
    fn operations_leave_memory_mapped_mode() {
        let (flash, sim) = flash(0x20, 0xBA18);
        flash.enter_mem_mapped().unwrap();
        assert_eq!(flash.read(0, 4).unwrap(), vec![0xFF; 4]);
        assert!(sim.mapped_read(0, 4).is_none());
    }

    #[test]
    fn sleep_and_wake() {
        let (flash, sim) = flash(0xEF, 0x4015);
        flash.sleep(true).unwrap();
        assert!(sim.power_down());
        flash.sleep(false).unwrap();
        assert!(!sim.power_down());
        flash.write(0, &[0xA5]).unwrap();
        assert_eq!(flash.read(0, 1).unwrap(), vec![0xA5]);
    }

    #[test]
    fn status_classification() {
        assert_eq!(Error::Busy.status(), Status::Busy);
        assert_eq!(Error::Timeout.status(), Status::Timeout);
        assert_eq!(Error::TypeNotFound { manufacturer_id: 1, device_id: 2 }.status(),
                   Status::TypeNotFound);
        assert_eq!(Error::NotInitialized.status(), Status::Error);
        assert_eq!(Error::Access(anyhow::anyhow!("bus fault")).status(), Status::Error);
        assert_eq!(Status::of(&Ok::<(), Error>(())), Status::Ok);
        assert!(!version().is_empty());
    }
}
