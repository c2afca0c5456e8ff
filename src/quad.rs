//! Manufacturer-specific sequences for switching a device into quad mode.
//!
//! Each manufacturer keeps its quad enable and dummy cycle configuration in different
//! registers, so the flash engine delegates to the [`QuadMode`] implementation selected
//! from the catalog when the device is identified.

use crate::catalog::DeviceDescriptor;
use crate::sreg::{EnhancedVolatileConfig, ReadParameters, StatusRegister2, VolatileConfig};
use crate::transport::{BusWidth, Command, Transport};
use crate::{Error, Opcode, Result};

/// Capability implemented once per manufacturer.
pub trait QuadMode: core::fmt::Debug + Send + Sync {
    /// Short manufacturer name for log output.
    fn name(&self) -> &'static str;

    /// Switch the device into quad mode and program its read dummy cycles.
    ///
    /// Called with the device in single-line mode and the bus already locked.
    /// Returns the width to use for instruction phases from now on.
    fn enter_quad_mode(&self, transport: &mut dyn Transport, device: &DeviceDescriptor)
        -> Result<BusWidth>;
}

fn read_register<C: Into<u8>>(transport: &mut dyn Transport, opcode: C, width: BusWidth)
    -> Result<u8>
{
    let opcode = opcode.into();
    let mut data = [0u8; 1];
    transport.command(Command::new(opcode, width).read(&mut data, width))?;
    log::trace!("Read register 0x{:02X}: 0x{:02X}", opcode, data[0]);
    Ok(data[0])
}

fn write_register<C: Into<u8>>(transport: &mut dyn Transport, opcode: C, width: BusWidth,
                               value: u8) -> Result<()>
{
    let opcode = opcode.into();
    log::trace!("Write register 0x{:02X}: 0x{:02X}", opcode, value);
    transport.command(Command::new(opcode, width).write(&[value], width))?;
    Ok(())
}

fn instruction<C: Into<u8>>(transport: &mut dyn Transport, opcode: C, width: BusWidth)
    -> Result<()>
{
    transport.command(Command::new(opcode, width))?;
    Ok(())
}

/// Winbond specific instructions.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum WinbondOpcode {
    ReadStatusRegister2 = 0x35,
    WriteStatusRegister2 = 0x31,
    EnterQpi = 0x38,
    SetReadParameters = 0xC0,
}

/// Winbond W25Q series.
///
/// Quad operation needs the QE bit in status register 2, after which the device is put
/// in QPI mode, where every phase uses four lines. Read dummy cycles are set with the
/// QPI-only Set Read Parameters instruction.
#[derive(Copy, Clone, Debug)]
pub struct Winbond;

impl QuadMode for Winbond {
    fn name(&self) -> &'static str {
        "Winbond"
    }

    fn enter_quad_mode(&self, transport: &mut dyn Transport, device: &DeviceDescriptor)
        -> Result<BusWidth>
    {
        let mut params = ReadParameters(0);
        if !params.set_dummy_cycles(device.quad_dummy_cycles) {
            log::error!("{} cannot use {} dummy cycles", device.name, device.quad_dummy_cycles);
            return Err(Error::InvalidDummyCycles { cycles: device.quad_dummy_cycles });
        }

        let mut sr2 = StatusRegister2(
            read_register(transport, WinbondOpcode::ReadStatusRegister2, BusWidth::Single)?);
        if sr2.get_qe() {
            log::debug!("QE already set");
        } else {
            log::debug!("Setting QE in volatile status register 2");
            sr2.set_qe(true);
            instruction(transport, Opcode::WriteEnableVolatile, BusWidth::Single)?;
            write_register(transport, WinbondOpcode::WriteStatusRegister2, BusWidth::Single,
                           sr2.0)?;
        }

        // QPI mode is volatile, so it has to be entered even when QE was already set.
        instruction(transport, WinbondOpcode::EnterQpi, BusWidth::Single)?;
        write_register(transport, WinbondOpcode::SetReadParameters, BusWidth::Quad, params.0)?;
        log::debug!("Entered QPI mode with {} dummy cycles", params.get_dummy_cycles());
        Ok(BusWidth::Quad)
    }
}

/// Micron specific instructions.
#[derive(Copy, Clone, Debug, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum MicronOpcode {
    ReadVolatileConfig = 0x85,
    WriteVolatileConfig = 0x81,
    ReadEnhancedVolatileConfig = 0x65,
    WriteEnhancedVolatileConfig = 0x61,
}

/// Micron (formerly ST) MT25Q series.
///
/// The quad I/O protocol is selected by an active-low bit in the enhanced volatile
/// configuration register; dummy cycles live in the volatile configuration register.
#[derive(Copy, Clone, Debug)]
pub struct Micron;

impl QuadMode for Micron {
    fn name(&self) -> &'static str {
        "Micron"
    }

    fn enter_quad_mode(&self, transport: &mut dyn Transport, device: &DeviceDescriptor)
        -> Result<BusWidth>
    {
        let mut evcr = EnhancedVolatileConfig(
            read_register(transport, MicronOpcode::ReadEnhancedVolatileConfig, BusWidth::Single)?);
        if evcr.get_quad_protocol() {
            log::debug!("Quad protocol already enabled");
            return Ok(BusWidth::Quad);
        }

        let mut vcr = VolatileConfig(
            read_register(transport, MicronOpcode::ReadVolatileConfig, BusWidth::Single)?);
        if !vcr.set_dummy_cycles(device.quad_dummy_cycles) {
            log::error!("{} cannot use {} dummy cycles", device.name, device.quad_dummy_cycles);
            return Err(Error::InvalidDummyCycles { cycles: device.quad_dummy_cycles });
        }
        instruction(transport, Opcode::WriteEnable, BusWidth::Single)?;
        write_register(transport, MicronOpcode::WriteVolatileConfig, BusWidth::Single, vcr.0)?;

        evcr.set_quad_protocol(true);
        instruction(transport, Opcode::WriteEnable, BusWidth::Single)?;
        write_register(transport, MicronOpcode::WriteEnhancedVolatileConfig, BusWidth::Single,
                       evcr.0)?;
        log::debug!("Enabled quad protocol with {} dummy cycles", vcr.get_dummy_cycles());
        Ok(BusWidth::Quad)
    }
}
