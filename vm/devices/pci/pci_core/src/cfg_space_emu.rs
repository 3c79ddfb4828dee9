// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers that implement standardized PCI configuration space functionality.
//!
//! To be clear: PCI devices are not required to use these helpers, and may
//! choose to implement configuration space accesses manually.

use crate::spec::cfg_space;
use crate::spec::hwid::HardwareIds;
use std::ops::RangeInclusive;
use thiserror::Error;

const SUPPORTED_COMMAND_BITS: u16 = cfg_space::Command::new()
    .with_pio_enabled(true)
    .with_mmio_enabled(true)
    .with_bus_master(true)
    .with_special_cycles(true)
    .with_enable_memory_write_invalidate(true)
    .with_vga_palette_snoop(true)
    .with_parity_error_response(true)
    .with_enable_serr(true)
    .with_enable_fast_b2b(true)
    .with_intx_disable(true)
    .into_bits();

/// An error returned by a configuration space access.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum CfgAccessError {
    /// The register at this offset is not implemented.
    #[error("invalid register offset {0:#x}")]
    InvalidRegister(u16),
    /// The access crosses its natural alignment boundary.
    #[error("unaligned {width}-byte access at offset {offset:#x}")]
    Unaligned {
        /// The offset of the access.
        offset: u16,
        /// The width of the access in bytes.
        width: u8,
    },
}

#[derive(Debug)]
struct ConfigSpaceType1EmulatorState {
    /// The command register
    command: cfg_space::Command,
    /// The subordinate bus number register. Software programs
    /// this register with the highest bus number below the bridge.
    subordinate_bus_number: u8,
    /// The secondary bus number register. Software programs
    /// this register with the bus number assigned to the secondary
    /// side of the bridge.
    secondary_bus_number: u8,
    /// The primary bus number register. This is unused for PCI Express but
    /// is supposed to be read/write for compability with legacy software.
    primary_bus_number: u8,
    /// The I/O base register. Software programs the upper 4 bits of this
    /// register with bits 15:12 of the base address of the I/O window
    /// assigned to the hierarchy under the bridge (bits 11:0 are assumed to
    /// be 0s). The low 4 bits are read-only and report 16-bit decoding.
    io_base: u8,
    /// The I/O limit register, encoded like `io_base` (bits 11:0 of the limit
    /// address are assumed to be 1s).
    io_limit: u8,
    /// The memory base register. Software programs the upper 12 bits of this
    /// register with the upper 12 bits of a 32-bit base address of MMIO assigned
    /// to the hierarchy under the bridge (the lower 20 bits are assumed to be 0s).
    memory_base: u16,
    /// The memory limit register. Software programs the upper 12 bits of this
    /// register with the upper 12 bits of a 32-bit limit address of MMIO assigned
    /// to the hierarchy under the bridge (the lower 20 bits are assumed to be 1s).
    memory_limit: u16,
    /// The prefetchable memory base register, encoded like `memory_base`.
    prefetch_base: u16,
    /// The prefetchable memory limit register, encoded like `memory_limit`.
    prefetch_limit: u16,
}

impl ConfigSpaceType1EmulatorState {
    fn new() -> Self {
        Self {
            command: cfg_space::Command::new(),
            subordinate_bus_number: 0,
            secondary_bus_number: 0,
            primary_bus_number: 0,
            io_base: 0,
            io_limit: 0,
            memory_base: 0,
            memory_limit: 0,
            prefetch_base: 0,
            prefetch_limit: 0,
        }
    }
}

/// Emulator for the standard Type 1 PCI configuration space header.
///
/// Registers are stored as the bridge would latch them. Byte and word
/// accesses are folded into read-modify-write cycles on the containing
/// dword, the same way a bus controller issues them.
#[derive(Debug)]
pub struct ConfigSpaceType1Emulator {
    hardware_ids: HardwareIds,
    state: ConfigSpaceType1EmulatorState,
}

impl ConfigSpaceType1Emulator {
    /// Create a new [`ConfigSpaceType1Emulator`]
    pub fn new(hardware_ids: HardwareIds) -> Self {
        Self {
            hardware_ids,
            state: ConfigSpaceType1EmulatorState::new(),
        }
    }

    /// Returns the current command register.
    pub fn command(&self) -> cfg_space::Command {
        self.state.command
    }

    /// Returns the range of bus numbers the bridge is programmed to decode.
    pub fn assigned_bus_range(&self) -> RangeInclusive<u8> {
        let secondary = self.state.secondary_bus_number;
        let subordinate = self.state.subordinate_bus_number;
        if secondary <= subordinate {
            secondary..=subordinate
        } else {
            0..=0
        }
    }

    fn decode_memory_range(&self, base_register: u16, limit_register: u16) -> (u32, u32) {
        let base_addr = ((base_register & !0b1111) as u32) << 16;
        let limit_addr = ((limit_register & !0b1111) as u32) << 16 | 0xF_FFFF;
        (base_addr, limit_addr)
    }

    /// If memory decoding is currently enabled, and the memory window assignment is valid,
    /// returns the 32-bit memory addresses the bridge is programmed to decode.
    pub fn assigned_memory_range(&self) -> Option<RangeInclusive<u32>> {
        let (base_addr, limit_addr) =
            self.decode_memory_range(self.state.memory_base, self.state.memory_limit);
        if self.state.command.mmio_enabled() && base_addr <= limit_addr {
            Some(base_addr..=limit_addr)
        } else {
            None
        }
    }

    /// If I/O decoding is currently enabled, and the I/O window assignment is valid,
    /// returns the 16-bit I/O addresses the bridge is programmed to decode.
    pub fn assigned_io_range(&self) -> Option<RangeInclusive<u16>> {
        let base_addr = ((self.state.io_base & !0b1111) as u16) << 8;
        let limit_addr = ((self.state.io_limit & !0b1111) as u16) << 8 | 0xFFF;
        if self.state.command.pio_enabled() && base_addr <= limit_addr {
            Some(base_addr..=limit_addr)
        } else {
            None
        }
    }

    /// Read from the config space. `offset` must be 32-bit aligned.
    pub fn read_u32(&self, offset: u16, value: &mut u32) -> Result<(), CfgAccessError> {
        use cfg_space::HeaderType01;

        *value = match HeaderType01(offset) {
            HeaderType01::DEVICE_VENDOR => {
                (self.hardware_ids.device_id as u32) << 16 | self.hardware_ids.vendor_id as u32
            }
            HeaderType01::STATUS_COMMAND => self.state.command.into_bits() as u32,
            HeaderType01::CLASS_REVISION => {
                (u8::from(self.hardware_ids.base_class) as u32) << 24
                    | (u8::from(self.hardware_ids.sub_class) as u32) << 16
                    | (self.hardware_ids.prog_if as u32) << 8
                    | self.hardware_ids.revision_id as u32
            }
            HeaderType01::BIST_HEADER => {
                // Header type 01
                0x00010000
            }
            HeaderType01::LATENCY_BUS_NUMBERS => {
                (self.state.subordinate_bus_number as u32) << 16
                    | (self.state.secondary_bus_number as u32) << 8
                    | self.state.primary_bus_number as u32
            }
            HeaderType01::SEC_STATUS_IO_RANGE => {
                (self.state.io_limit as u32) << 8 | self.state.io_base as u32
            }
            HeaderType01::MEMORY_RANGE => {
                (self.state.memory_limit as u32) << 16 | self.state.memory_base as u32
            }
            HeaderType01::PREFETCH_RANGE => {
                (self.state.prefetch_limit as u32) << 16 | self.state.prefetch_base as u32
            }
            _ if offset < cfg_space::HEADER_TYPE_01_SIZE && offset.is_multiple_of(4) => 0,
            _ => {
                tracing::warn!(offset, "unexpected config space read");
                return Err(CfgAccessError::InvalidRegister(offset));
            }
        };

        Ok(())
    }

    /// Write to the config space. `offset` must be 32-bit aligned.
    pub fn write_u32(&mut self, offset: u16, val: u32) -> Result<(), CfgAccessError> {
        use cfg_space::HeaderType01;

        match HeaderType01(offset) {
            HeaderType01::STATUS_COMMAND => {
                let mut command = cfg_space::Command::from_bits(val as u16);
                if command.into_bits() & !SUPPORTED_COMMAND_BITS != 0 {
                    tracing::warn!(offset, val, "setting invalid command bits");
                    // still do our best
                    command =
                        cfg_space::Command::from_bits(command.into_bits() & SUPPORTED_COMMAND_BITS);
                };
                self.state.command = command;
            }
            HeaderType01::LATENCY_BUS_NUMBERS => {
                self.state.subordinate_bus_number = (val >> 16) as u8;
                self.state.secondary_bus_number = (val >> 8) as u8;
                self.state.primary_bus_number = val as u8;
            }
            HeaderType01::SEC_STATUS_IO_RANGE => {
                // Secondary status bits are write-1-to-clear and not emulated.
                self.state.io_base = val as u8;
                self.state.io_limit = (val >> 8) as u8;
            }
            HeaderType01::MEMORY_RANGE => {
                self.state.memory_base = val as u16;
                self.state.memory_limit = (val >> 16) as u16;
            }
            HeaderType01::PREFETCH_RANGE => {
                self.state.prefetch_base = val as u16;
                self.state.prefetch_limit = (val >> 16) as u16;
            }
            // all other base regs are noops
            _ if offset < cfg_space::HEADER_TYPE_01_SIZE && offset.is_multiple_of(4) => (),
            _ => {
                tracing::warn!(offset, value = val, "unexpected config space write");
                return Err(CfgAccessError::InvalidRegister(offset));
            }
        }

        Ok(())
    }

    fn check_alignment(offset: u16, width: u8) -> Result<(), CfgAccessError> {
        if !offset.is_multiple_of(width as u16) {
            return Err(CfgAccessError::Unaligned { offset, width });
        }
        Ok(())
    }

    fn read_sub_dword(&self, offset: u16, width: u8) -> Result<u32, CfgAccessError> {
        Self::check_alignment(offset, width)?;
        let mut dword = 0;
        self.read_u32(offset & !3, &mut dword)?;
        Ok(dword >> ((offset & 3) * 8))
    }

    fn write_sub_dword(&mut self, offset: u16, width: u8, val: u32) -> Result<(), CfgAccessError> {
        Self::check_alignment(offset, width)?;
        let shift = (offset & 3) * 8;
        let mask = (u32::MAX >> (32 - width as u32 * 8)) << shift;
        let mut dword = 0;
        self.read_u32(offset & !3, &mut dword)?;
        self.write_u32(offset & !3, (dword & !mask) | ((val << shift) & mask))
    }

    /// Read a byte register from the config space.
    pub fn read_u8(&self, offset: u16) -> Result<u8, CfgAccessError> {
        Ok(self.read_sub_dword(offset, 1)? as u8)
    }

    /// Read a word register from the config space. `offset` must be 16-bit
    /// aligned.
    pub fn read_u16(&self, offset: u16) -> Result<u16, CfgAccessError> {
        Ok(self.read_sub_dword(offset, 2)? as u16)
    }

    /// Write a byte register in the config space, leaving the rest of the
    /// containing dword untouched.
    pub fn write_u8(&mut self, offset: u16, val: u8) -> Result<(), CfgAccessError> {
        self.write_sub_dword(offset, 1, val.into())
    }

    /// Write a word register in the config space, leaving the rest of the
    /// containing dword untouched. `offset` must be 16-bit aligned.
    pub fn write_u16(&mut self, offset: u16, val: u16) -> Result<(), CfgAccessError> {
        self.write_sub_dword(offset, 2, val.into())
    }
}
