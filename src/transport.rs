//! Interface to the quad SPI peripheral.
//!
//! The flash engine never touches bus registers itself. Instead it describes each
//! exchange as a [`Command`] (instruction, optional address, optional mode byte,
//! dummy cycles and optional data phase) and hands it to a [`Transport`].

use crate::sync::EventHandle;
use crate::AnyhowResult;

/// Number of lines used for one phase of a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusWidth {
    Single,
    Quad,
}

impl BusWidth {
    /// Number of data lines driven in this phase.
    pub fn lines(&self) -> u8 {
        match self {
            BusWidth::Single => 1,
            BusWidth::Quad => 4,
        }
    }

    /// Number of clock cycles needed to shift one byte in this phase.
    pub fn cycles_per_byte(&self) -> u8 {
        8 / self.lines()
    }
}

/// Data phase of a command.
#[derive(Debug)]
pub enum Data<'a> {
    None,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl<'a> Data<'a> {
    pub fn len(&self) -> usize {
        match self {
            Data::None => 0,
            Data::Read(buf) => buf.len(),
            Data::Write(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single command exchange.
///
/// Addresses are always sent as 24 bits.
#[derive(Debug)]
pub struct Command<'a> {
    pub instruction: u8,
    pub instruction_width: BusWidth,
    pub address: Option<(u32, BusWidth)>,
    /// Alternate (mode) byte sent after the address.
    pub alternate: Option<(u8, BusWidth)>,
    pub dummy_cycles: u8,
    pub data: Data<'a>,
    pub data_width: BusWidth,
}

impl<'a> Command<'a> {
    /// Create a command with only an instruction phase.
    pub fn new<C: Into<u8>>(instruction: C, width: BusWidth) -> Self {
        Command {
            instruction: instruction.into(),
            instruction_width: width,
            address: None,
            alternate: None,
            dummy_cycles: 0,
            data: Data::None,
            data_width: width,
        }
    }

    pub fn address(mut self, address: u32, width: BusWidth) -> Self {
        self.address = Some((address, width));
        self
    }

    pub fn alternate(mut self, byte: u8, width: BusWidth) -> Self {
        self.alternate = Some((byte, width));
        self
    }

    pub fn dummy(mut self, cycles: u8) -> Self {
        self.dummy_cycles = cycles;
        self
    }

    pub fn read(mut self, buf: &'a mut [u8], width: BusWidth) -> Self {
        self.data = Data::Read(buf);
        self.data_width = width;
        self
    }

    pub fn write(mut self, data: &'a [u8], width: BusWidth) -> Self {
        self.data = Data::Write(data);
        self.data_width = width;
        self
    }
}

/// Hardware status polling configuration.
///
/// The transport repeatedly issues `instruction`, reads one status byte and raises
/// completion once `status & mask == matches`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusPoll {
    pub instruction: u8,
    pub width: BusWidth,
    pub mask: u8,
    pub matches: u8,
    /// Polling interval in bus clock cycles.
    pub interval: u16,
}

/// Trait for quad SPI peripherals which can drive a flash chip.
///
/// `command()` runs an exchange to completion before returning. `start()` and
/// `start_polling()` only initiate the exchange; the transfer (or status match)
/// completes later, and the transport must then report it exactly once through the bound
/// [`EventHandle`], typically from its interrupt or DMA completion context. A transport
/// whose completion can outlive `abort()` should take [`EventHandle::token`] when the
/// exchange starts and report with [`EventHandle::signal_for`].
///
/// For `start()` with a [`Data::Read`] buffer, the buffer must be filled before
/// completion is signalled; the engine keeps it borrowed until it has either observed
/// completion or called `abort()`.
pub trait Transport: Send {
    /// Receive the handle used to report completion of deferred operations.
    ///
    /// Called once when the transport is handed to a [`crate::Flash`].
    fn bind(&mut self, _event: EventHandle) {}

    /// Perform `cmd` to completion.
    fn command(&mut self, cmd: Command<'_>) -> AnyhowResult<()>;

    /// Start `cmd`; completion is reported through the bound event.
    fn start(&mut self, cmd: Command<'_>) -> AnyhowResult<()>;

    /// Start automatic status polling; a status match is reported through the bound event.
    fn start_polling(&mut self, poll: &StatusPoll) -> AnyhowResult<()>;

    /// Configure memory-mapped mode, where host reads of the mapped window issue `cmd`
    /// with the address filled in.
    fn memory_mapped(&mut self, cmd: Command<'_>) -> AnyhowResult<()>;

    /// Abort any operation in progress, including memory-mapped mode.
    fn abort(&mut self);
}

#[test]
fn test_bus_width_cycles() {
    assert_eq!(BusWidth::Single.cycles_per_byte(), 8);
    assert_eq!(BusWidth::Quad.cycles_per_byte(), 2);
}

#[test]
fn test_command_builder() {
    let mut buf = [0u8; 4];
    let cmd = Command::new(0xEBu8, BusWidth::Quad)
        .address(0x1234, BusWidth::Quad)
        .alternate(0, BusWidth::Quad)
        .dummy(6)
        .read(&mut buf, BusWidth::Quad);
    assert_eq!(cmd.instruction, 0xEB);
    assert_eq!(cmd.address, Some((0x1234, BusWidth::Quad)));
    assert_eq!(cmd.dummy_cycles, 6);
    assert_eq!(cmd.data.len(), 4);
}
