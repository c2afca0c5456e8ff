//! In-memory emulation of a quad SPI NOR flash chip.
//!
//! [`SimFlash`] implements [`Transport`] by decoding each command the way a Winbond or
//! Micron device would: it tracks power-down, the write enable latch, the quad
//! configuration registers and which bus width the device currently listens on.
//! Programming can only clear bits, as on real NOR flash.
//!
//! Clones share the same device, so a test can keep a handle for inspection after
//! moving the transport into a [`crate::Flash`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::catalog::{MANUFACTURER_ID_MICRON, MANUFACTURER_ID_WINBOND};
use crate::sreg::{EnhancedVolatileConfig, ReadParameters, StatusRegister2, VolatileConfig};
use crate::sync::EventHandle;
use crate::transport::{BusWidth, Command, Data, StatusPoll, Transport};
use crate::AnyhowResult;

/// Largest memory the emulator allocates; bigger devices alias.
const MAX_SIZE: usize = 16 * 1024 * 1024;

/// How deferred operations report completion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimCompletion {
    /// Signal before `start()` returns.
    Immediate,
    /// Signal from another thread after a delay.
    Delayed(Duration),
    /// Never signal, as if the interrupt was lost.
    Never,
}

/// Memory-changing operations seen by the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    Erase { address: u32, size: u32 },
    Program {
        address: u32,
        len: usize,
        /// Every target byte was 0xFF beforehand.
        onto_erased: bool,
        /// Some bit had to go from 0 to 1, so the stored data differs from what was sent.
        needs_erase: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Vendor {
    Winbond,
    Micron,
    Other,
}

struct SimState {
    vendor: Vendor,
    jedec: [u8; 3],
    memory: Vec<u8>,

    power_down: bool,
    quad_protocol: bool,
    wel: bool,
    volatile_wel: bool,
    reset_enabled: bool,
    sr2: u8,
    sr2_nonvolatile: u8,
    read_params: u8,
    vcr: u8,
    evcr: u8,
    mapped: bool,

    protocol_checks: bool,
    completion: SimCompletion,
    event: Option<EventHandle>,
    skip_before_failure: usize,
    failures: usize,
    aborts: usize,
    opcodes: Vec<u8>,
    events: Vec<SimEvent>,
}

impl SimState {
    const VCR_DEFAULT: u8 = 0xFB;
    const EVCR_DEFAULT: u8 = 0xFF;

    fn reset_device(&mut self) {
        log::trace!("sim: device reset");
        self.quad_protocol = false;
        self.wel = false;
        self.volatile_wel = false;
        self.sr2 = self.sr2_nonvolatile;
        self.read_params = 0;
        self.vcr = Self::VCR_DEFAULT;
        self.evcr = Self::EVCR_DEFAULT;
    }

    fn protocol(&self) -> BusWidth {
        if self.quad_protocol { BusWidth::Quad } else { BusWidth::Single }
    }

    fn status1(&self) -> u8 {
        (self.wel as u8) << 1
    }

    /// Cycles the device expects between address and data of a quad I/O read.
    fn read_dummy_cycles(&self) -> u8 {
        match self.vendor {
            Vendor::Winbond if self.quad_protocol =>
                ReadParameters(self.read_params).get_dummy_cycles(),
            Vendor::Micron => match VolatileConfig(self.vcr).get_dummy_cycles() {
                0 | 15 => 10,
                n => n,
            },
            // Mode byte and four dummy cycles in SPI mode.
            _ => 6,
        }
    }

    /// Decide whether the next operation fails.
    fn take_failure(&mut self) -> bool {
        if self.failures == 0 {
            return false;
        }
        if self.skip_before_failure > 0 {
            self.skip_before_failure -= 1;
            return false;
        }
        self.failures -= 1;
        true
    }

    /// Returns true if the device would act on an instruction sent at `width`.
    fn listens(&self, width: BusWidth) -> bool {
        !self.protocol_checks || width == self.protocol()
    }

    fn latch_write(&mut self) -> bool {
        let latched = self.wel;
        self.wel = false;
        latched
    }

    fn check_read(&self, cmd: &Command<'_>) -> AnyhowResult<()> {
        if self.vendor == Vendor::Winbond && !StatusRegister2(self.sr2).get_qe() {
            anyhow::bail!("quad read issued with QE clear");
        }
        let alternate = cmd.alternate.map(|(_, w)| w.cycles_per_byte()).unwrap_or(0);
        let expected = self.read_dummy_cycles();
        if alternate + cmd.dummy_cycles != expected {
            anyhow::bail!("read with {} mode and {} dummy cycles, device expects {} in total",
                          alternate, cmd.dummy_cycles, expected);
        }
        Ok(())
    }

    fn index(&self, address: u32) -> usize {
        address as usize % self.memory.len()
    }

    fn erase(&mut self, address: u32, size: usize) {
        if !self.latch_write() {
            log::warn!("sim: erase without write enable ignored");
            return;
        }
        let size = usize::min(size, self.memory.len());
        let base = self.index(address) & !(size - 1);
        for byte in &mut self.memory[base..base + size] {
            *byte = 0xFF;
        }
        self.events.push(SimEvent::Erase { address: base as u32, size: size as u32 });
    }

    fn program(&mut self, address: u32, data: &[u8]) {
        if !self.latch_write() {
            log::warn!("sim: page program without write enable ignored");
            return;
        }
        // Data beyond the end of the page wraps to the start of the same page.
        let page = self.index(address) & !0xFF;
        let mut onto_erased = true;
        let mut needs_erase = false;
        for (i, &byte) in data.iter().enumerate() {
            let idx = page + ((address as usize + i) & 0xFF);
            let old = self.memory[idx];
            onto_erased &= old == 0xFF;
            needs_erase |= old & byte != byte;
            self.memory[idx] = old & byte;
        }
        self.events.push(SimEvent::Program {
            address, len: data.len(), onto_erased, needs_erase,
        });
    }

    fn read_memory(&self, address: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = self.memory[self.index(address.wrapping_add(i as u32))];
        }
    }

    /// Decode one command.
    fn execute(&mut self, cmd: Command<'_>) -> AnyhowResult<()> {
        if self.take_failure() {
            anyhow::bail!("simulated transport failure");
        }
        self.opcodes.push(cmd.instruction);

        if !self.listens(cmd.instruction_width) {
            log::trace!("sim: ignoring 0x{:02X} sent on {:?} lines", cmd.instruction,
                        cmd.instruction_width);
            Self::float(cmd.data);
            return Ok(());
        }
        if self.power_down {
            if cmd.instruction == 0xAB {
                log::trace!("sim: release power-down");
                self.power_down = false;
            }
            Self::float(cmd.data);
            return Ok(());
        }

        let reset_enabled = self.reset_enabled;
        self.reset_enabled = false;
        let address = cmd.address.map(|(a, _)| a).unwrap_or(0);
        match (cmd.instruction, self.vendor) {
            (0x9F, _) => {
                let jedec = self.jedec;
                Self::respond(cmd.data, &jedec);
            },
            (0x05, _) => {
                let status = self.status1();
                Self::respond(cmd.data, &[status]);
            },
            (0x06, _) => self.wel = true,
            (0x04, _) => self.wel = false,
            (0xB9, _) => self.power_down = true,
            (0xAB, _) => (),
            (0x66, _) => self.reset_enabled = true,
            (0x99, _) => if reset_enabled { self.reset_device() },
            (0x02, _) => if let Data::Write(data) = cmd.data { self.program(address, data) },
            (0x20, _) => self.erase(address, 4 * 1024),
            (0x52, _) => self.erase(address, 32 * 1024),
            (0xD8, _) => self.erase(address, 64 * 1024),
            (0xC7, _) => self.erase(0, self.memory.len()),
            (0xEB, _) => {
                self.check_read(&cmd)?;
                if let Data::Read(buf) = cmd.data {
                    self.read_memory(address, buf);
                }
            },

            (0x50, Vendor::Winbond) => self.volatile_wel = true,
            (0x35, Vendor::Winbond) => {
                let sr2 = self.sr2;
                Self::respond(cmd.data, &[sr2]);
            },
            (0x31, Vendor::Winbond) => {
                if let Data::Write(&[value, ..]) = cmd.data {
                    if self.wel {
                        self.sr2_nonvolatile = value;
                    }
                    if self.wel || self.volatile_wel {
                        self.sr2 = value;
                    }
                }
                self.wel = false;
                self.volatile_wel = false;
            },
            (0x38, Vendor::Winbond) => {
                if StatusRegister2(self.sr2).get_qe() {
                    self.quad_protocol = true;
                }
            },
            (0xC0, Vendor::Winbond) => {
                if let (true, Data::Write(&[value, ..])) = (self.quad_protocol, cmd.data) {
                    self.read_params = value;
                }
            },

            (0x85, Vendor::Micron) => {
                let vcr = self.vcr;
                Self::respond(cmd.data, &[vcr]);
            },
            (0x65, Vendor::Micron) => {
                let evcr = self.evcr;
                Self::respond(cmd.data, &[evcr]);
            },
            (0x81, Vendor::Micron) => {
                if let (true, Data::Write(&[value, ..])) = (self.latch_write(), cmd.data) {
                    self.vcr = value;
                }
            },
            (0x61, Vendor::Micron) => {
                if let (true, Data::Write(&[value, ..])) = (self.latch_write(), cmd.data) {
                    self.evcr = value;
                    self.quad_protocol = EnhancedVolatileConfig(value).get_quad_protocol();
                }
            },

            (op, _) => log::trace!("sim: ignoring unsupported instruction 0x{:02X}", op),
        }
        Ok(())
    }

    /// Undriven data lines read as 1.
    fn float(data: Data<'_>) {
        if let Data::Read(buf) = data {
            for byte in buf.iter_mut() {
                *byte = 0xFF;
            }
        }
    }

    /// Clock out `response`, repeating the last byte's absence as zeros.
    fn respond(data: Data<'_>, response: &[u8]) {
        if let Data::Read(buf) = data {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = response.get(i).copied().unwrap_or(0);
            }
        }
    }
}

/// Emulated flash device.
#[derive(Clone)]
pub struct SimFlash {
    state: Arc<Mutex<SimState>>,
}

impl SimFlash {
    /// Create an erased device answering with the given JEDEC ID.
    ///
    /// Manufacturers 0xEF and 0x20 get Winbond and Micron register behaviour;
    /// any other ID is a plain SPI device.
    pub fn new(manufacturer_id: u8, device_id: u16) -> Self {
        let vendor = match manufacturer_id {
            MANUFACTURER_ID_WINBOND => Vendor::Winbond,
            MANUFACTURER_ID_MICRON => Vendor::Micron,
            _ => Vendor::Other,
        };
        let size = 1usize
            .checked_shl(device_id as u8 as u32)
            .unwrap_or(MAX_SIZE)
            .max(4096)
            .min(MAX_SIZE);
        let [dev_hi, dev_lo] = device_id.to_be_bytes();
        SimFlash {
            state: Arc::new(Mutex::new(SimState {
                vendor,
                jedec: [manufacturer_id, dev_hi, dev_lo],
                memory: vec![0xFF; size],
                power_down: false,
                quad_protocol: false,
                wel: false,
                volatile_wel: false,
                reset_enabled: false,
                sr2: 0,
                sr2_nonvolatile: 0,
                read_params: 0,
                vcr: SimState::VCR_DEFAULT,
                evcr: SimState::EVCR_DEFAULT,
                mapped: false,
                protocol_checks: true,
                completion: SimCompletion::Immediate,
                event: None,
                skip_before_failure: 0,
                failures: 0,
                aborts: 0,
                opcodes: Vec::new(),
                events: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Size of the emulated memory in bytes.
    pub fn size(&self) -> usize {
        self.state().memory.len()
    }

    pub fn set_completion(&self, completion: SimCompletion) {
        self.state().completion = completion;
    }

    /// Make the next `n` transport operations fail.
    pub fn fail_next(&self, n: usize) {
        let mut s = self.state();
        s.skip_before_failure = 0;
        s.failures = n;
    }

    /// Let `n` transport operations succeed, then fail one.
    pub fn fail_after(&self, n: usize) {
        let mut s = self.state();
        s.skip_before_failure = n;
        s.failures = 1;
    }

    /// When disabled, the device acts on instructions sent at any width.
    pub fn set_protocol_checks(&self, enabled: bool) {
        self.state().protocol_checks = enabled;
    }

    pub fn set_power_down(&self, power_down: bool) {
        self.state().power_down = power_down;
    }

    pub fn power_down(&self) -> bool {
        self.state().power_down
    }

    /// Set the non-volatile Winbond QE bit.
    pub fn set_quad_enable(&self, enabled: bool) {
        let mut s = self.state();
        let mut sr2 = StatusRegister2(s.sr2_nonvolatile);
        sr2.set_qe(enabled);
        s.sr2_nonvolatile = sr2.0;
        s.sr2 = sr2.0;
    }

    /// Current Winbond QE bit.
    pub fn quad_enabled(&self) -> bool {
        StatusRegister2(self.state().sr2).get_qe()
    }

    /// True while the device expects four-line instructions.
    pub fn quad_protocol(&self) -> bool {
        self.state().quad_protocol
    }

    /// Total mode and dummy cycles the device expects in a quad I/O read.
    pub fn read_dummy_cycles(&self) -> u8 {
        self.state().read_dummy_cycles()
    }

    /// Instructions received so far, including ignored ones.
    pub fn opcodes(&self) -> Vec<u8> {
        self.state().opcodes.clone()
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state().events.clone()
    }

    /// Forget recorded instructions and events.
    pub fn clear_log(&self) {
        let mut s = self.state();
        s.opcodes.clear();
        s.events.clear();
    }

    /// Number of times the transport was aborted.
    pub fn aborts(&self) -> usize {
        self.state().aborts
    }

    /// Read memory directly.
    pub fn peek(&self, address: u32, length: usize) -> Vec<u8> {
        let s = self.state();
        let mut data = vec![0u8; length];
        s.read_memory(address, &mut data);
        data
    }

    /// Overwrite memory directly, without NOR programming rules.
    pub fn poke(&self, address: u32, data: &[u8]) {
        let mut s = self.state();
        for (i, &byte) in data.iter().enumerate() {
            let idx = s.index(address.wrapping_add(i as u32));
            s.memory[idx] = byte;
        }
    }

    /// Read through the memory-mapped window, or None if not mapped.
    pub fn mapped_read(&self, address: u32, length: usize) -> Option<Vec<u8>> {
        let s = self.state();
        if !s.mapped {
            return None;
        }
        let mut data = vec![0u8; length];
        s.read_memory(address, &mut data);
        Some(data)
    }

    fn complete(&self) {
        let s = self.state();
        let event = match &s.event {
            Some(event) => event.clone(),
            None => return,
        };
        let token = event.token();
        match s.completion {
            SimCompletion::Immediate => event.signal_for(token),
            SimCompletion::Delayed(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    event.signal_for(token);
                });
            },
            SimCompletion::Never => (),
        }
    }
}

impl std::fmt::Debug for SimFlash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = self.state();
        write!(f, "SimFlash({:?}, ID {:02X?}, {} bytes)", s.vendor, s.jedec, s.memory.len())
    }
}

impl Transport for SimFlash {
    fn bind(&mut self, event: EventHandle) {
        self.state().event = Some(event);
    }

    fn command(&mut self, cmd: Command<'_>) -> AnyhowResult<()> {
        self.state().execute(cmd)
    }

    fn start(&mut self, cmd: Command<'_>) -> AnyhowResult<()> {
        self.state().execute(cmd)?;
        self.complete();
        Ok(())
    }

    fn start_polling(&mut self, poll: &StatusPoll) -> AnyhowResult<()> {
        let matched = {
            let mut s = self.state();
            if s.take_failure() {
                anyhow::bail!("simulated transport failure");
            }
            s.opcodes.push(poll.instruction);
            let status = if s.listens(poll.width) && !s.power_down && poll.instruction == 0x05 {
                s.status1()
            } else {
                0xFF
            };
            status & poll.mask == poll.matches
        };
        // A status that never matches is polled forever.
        if matched {
            self.complete();
        }
        Ok(())
    }

    fn memory_mapped(&mut self, cmd: Command<'_>) -> AnyhowResult<()> {
        let mut s = self.state();
        if s.take_failure() {
            anyhow::bail!("simulated transport failure");
        }
        if s.power_down || !s.listens(cmd.instruction_width) {
            anyhow::bail!("device not responding to memory-mapped reads");
        }
        s.check_read(&cmd)?;
        s.mapped = true;
        Ok(())
    }

    fn abort(&mut self) {
        let mut s = self.state();
        s.aborts += 1;
        s.mapped = false;
    }
}

/// Deterministic pseudo-random bytes, for filling the emulated device.
pub fn test_pattern(seed: u32, length: usize) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9) | 1;
    (0..length).map(|_| {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        x as u8
    }).collect()
}
