// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI spec.
//!
//! This module MUST NOT contain any vendor-specific constants!

pub mod hwid {
    //! Hardware ID types and constants

    #![expect(missing_docs)] // constants/fields are self-explanatory

    /// A collection of hard-coded hardware IDs specific to a particular PCI
    /// device, as reflected in their corresponding PCI configuration space
    /// registers.
    ///
    /// See PCI 2.3 Spec - 6.2.1 for details on each of these fields.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HardwareIds {
        pub vendor_id: u16,
        pub device_id: u16,
        pub revision_id: u8,
        pub prog_if: u8,
        pub sub_class: Subclass,
        pub base_class: ClassCode,
    }

    /// ClassCode identifies the PCI device's type.
    ///
    /// Only the codes this crate needs are named; any other value is still
    /// representable.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ClassCode(pub u8);

    impl ClassCode {
        pub const BRIDGE: Self = Self(0x06);
    }

    impl From<u8> for ClassCode {
        fn from(c: u8) -> Self {
            Self(c)
        }
    }

    impl From<ClassCode> for u8 {
        fn from(c: ClassCode) -> Self {
            c.0
        }
    }

    /// SubclassCode identifies the PCI device's function.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Subclass(pub u8);

    impl Subclass {
        // Bridge (Class code: 0x06)
        pub const BRIDGE_PCI_TO_PCI: Self = Self(0x04);
    }

    impl From<u8> for Subclass {
        fn from(c: u8) -> Self {
            Self(c)
        }
    }

    impl From<Subclass> for u8 {
        fn from(c: Subclass) -> Self {
            c.0
        }
    }
}

/// Configuration Space
///
/// Sources: PCI 2.3 Spec - Chapter 6, PCI-to-PCI Bridge Architecture Spec 1.2
/// - Chapter 3
#[expect(missing_docs)] // primarily consts/structs with self-explanatory names
pub mod cfg_space {
    use bitfield_struct::bitfield;
    use core::fmt;

    /// Dword offsets into the type 01h configuration space header.
    ///
    /// | Offset | Bits 31-24                       | Bits 23-16             | Bits 15-8                | Bits 7-0             |
    /// |--------|----------------------------------|------------------------|--------------------------|--------------------- |
    /// | 0x0    | Device ID                        |                        | Vendor ID                |                      |
    /// | 0x4    | Status                           |                        | Command                  |                      |
    /// | 0x8    | Class code                       |                        |                          | Revision ID          |
    /// | 0xC    | BIST                             | Header Type            | Latency Timer            | Cache Line Size      |
    /// | 0x10   | Base address #0 (BAR0)           |                        |                          |                      |
    /// | 0x14   | Base address #1 (BAR1)           |                        |                          |                      |
    /// | 0x18   | Secondary Latency Timer          | Subordinate Bus Number | Secondary Bus Number     | Primary Bus Number   |
    /// | 0x1C   | Secondary Status                 |                        | I/O Limit                | I/O Base             |
    /// | 0x20   | Memory Limit                     |                        | Memory Base              |                      |
    /// | 0x24   | Prefetchable Memory Limit        |                        | Prefetchable Memory Base |                      |
    /// | 0x28   | Prefetchable Base Upper 32 Bits  |                        |                          |                      |
    /// | 0x2C   | Prefetchable Limit Upper 32 Bits |                        |                          |                      |
    /// | 0x30   | I/O Limit Upper 16 Bits          |                        | I/O Base Upper 16 Bits   |                      |
    /// | 0x34   | Reserved                         |                        |                          | Capabilities Pointer |
    /// | 0x38   | Expansion ROM Base Address       |                        |                          |                      |
    /// | 0x3C   | Bridge Control                   |                        | Interrupt PIN            | Interrupt Line       |
    #[derive(Copy, Clone, PartialEq, Eq, Hash)]
    pub struct HeaderType01(pub u16);

    impl HeaderType01 {
        pub const DEVICE_VENDOR: Self = Self(0x00);
        pub const STATUS_COMMAND: Self = Self(0x04);
        pub const CLASS_REVISION: Self = Self(0x08);
        pub const BIST_HEADER: Self = Self(0x0C);
        pub const BAR0: Self = Self(0x10);
        pub const BAR1: Self = Self(0x14);
        pub const LATENCY_BUS_NUMBERS: Self = Self(0x18);
        pub const SEC_STATUS_IO_RANGE: Self = Self(0x1C);
        pub const MEMORY_RANGE: Self = Self(0x20);
        pub const PREFETCH_RANGE: Self = Self(0x24);
        pub const PREFETCH_BASE_UPPER: Self = Self(0x28);
        pub const PREFETCH_LIMIT_UPPER: Self = Self(0x2C);
        pub const IO_RANGE_UPPER: Self = Self(0x30);
        pub const RESERVED_CAP_PTR: Self = Self(0x34);
        pub const EXPANSION_ROM_BASE: Self = Self(0x38);
        pub const BRIDGE_CTRL_INTERRUPT: Self = Self(0x3C);
    }

    impl fmt::Debug for HeaderType01 {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "HeaderType01({:#04x})", self.0)
        }
    }

    pub const HEADER_TYPE_01_SIZE: u16 = 0x40;

    /// Sub-dword register offsets within the type 01h header, for software
    /// that programs individual byte or word registers.
    pub mod type1 {
        /// Command register (16 bits).
        pub const COMMAND: u16 = 0x04;
        /// I/O base register (8 bits).
        pub const IO_BASE: u16 = 0x1C;
        /// I/O limit register (8 bits).
        pub const IO_LIMIT: u16 = 0x1D;
        /// Memory base register (16 bits).
        pub const MEMORY_BASE: u16 = 0x20;
        /// Memory limit register (16 bits).
        pub const MEMORY_LIMIT: u16 = 0x22;
    }

    /// The memory base and limit registers carry address bits 31:20 in
    /// their upper 12 bits, so windows are forwarded in 1 MiB units.
    pub const MEMORY_RANGE_ADDR_MASK: u16 = 0xFFF0;
    pub const MEMORY_RANGE_ADDR_SHIFT: u32 = 16;

    /// The I/O base and limit registers carry address bits 15:12 in their
    /// upper 4 bits, so windows are forwarded in 4 KiB units.
    pub const IO_RANGE_ADDR_MASK: u8 = 0xF0;
    pub const IO_RANGE_ADDR_SHIFT: u32 = 8;

    /// Command Register
    #[bitfield(u16)]
    #[derive(PartialEq, Eq)]
    pub struct Command {
        pub pio_enabled: bool,
        pub mmio_enabled: bool,
        pub bus_master: bool,
        pub special_cycles: bool,
        pub enable_memory_write_invalidate: bool,
        pub vga_palette_snoop: bool,
        pub parity_error_response: bool,
        /// must be 0
        #[bits(1)]
        _reserved: u16,
        pub enable_serr: bool,
        pub enable_fast_b2b: bool,
        pub intx_disable: bool,
        #[bits(5)]
        _reserved2: u16,
    }
}
