// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bus topology model and the platform services the rescan consumes.
//!
//! The topology itself is owned by the platform. This crate only ever looks
//! a bus up by its identifier and walks the tree it is handed while the
//! platform's rescan/remove lock is held.

use std::fmt;
use thiserror::Error;

/// Identifies a bus within the platform topology.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId {
    /// The PCI domain (segment) number.
    pub domain: u32,
    /// The bus number within the domain.
    pub bus: u8,
}

impl BusId {
    /// Creates a new bus identifier.
    pub const fn new(domain: u32, bus: u8) -> Self {
        Self { domain, bus }
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:02x}", self.domain, self.bus)
    }
}

/// The address of a single PCI function.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    /// The PCI domain (segment) number.
    pub domain: u32,
    /// The bus number.
    pub bus: u8,
    /// The device number (0-31).
    pub device: u8,
    /// The function number (0-7).
    pub function: u8,
}

impl PciAddress {
    /// Creates a new function address.
    pub const fn new(domain: u32, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }

    /// The bus this function sits on.
    pub const fn bus_id(&self) -> BusId {
        BusId::new(self.domain, self.bus)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// The address space a [`ResourceWindow`] lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WindowKind {
    /// Non-prefetchable memory.
    Memory,
    /// I/O port space.
    Io,
}

/// An inclusive address range assigned to a bridge by the platform's
/// resource assignment.
///
/// A window whose `end` does not lie above `start` has zero size, which
/// means "no forwarding range needed" (or that assignment found no room).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResourceWindow {
    /// The address space of the window.
    pub kind: WindowKind,
    /// First address forwarded.
    pub start: u64,
    /// Last address forwarded.
    pub end: u64,
}

impl ResourceWindow {
    /// An unassigned memory window.
    pub const fn unassigned_memory() -> Self {
        Self::memory(0, 0)
    }

    /// An unassigned I/O window.
    pub const fn unassigned_io() -> Self {
        Self::io(0, 0)
    }

    /// A memory window covering `start..=end`.
    pub const fn memory(start: u64, end: u64) -> Self {
        Self {
            kind: WindowKind::Memory,
            start,
            end,
        }
    }

    /// An I/O window covering `start..=end`.
    pub const fn io(start: u64, end: u64) -> Self {
        Self {
            kind: WindowKind::Io,
            start,
            end,
        }
    }

    /// The number of addresses forwarded, or zero if nothing is assigned.
    pub fn size(&self) -> u64 {
        if self.end > self.start {
            (self.end - self.start).saturating_add(1)
        } else {
            0
        }
    }
}

impl fmt::Display for ResourceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WindowKind::Memory => write!(f, "[mem {:#010x}-{:#010x}]", self.start, self.end),
            WindowKind::Io => write!(f, "[io {:#06x}-{:#06x}]", self.start, self.end),
        }
    }
}

/// A bus and the devices discovered on it, in scan order.
#[derive(Debug, Clone)]
pub struct PciBus {
    /// The identifier of this bus.
    pub id: BusId,
    /// The devices on this bus.
    pub devices: Vec<PciDevice>,
}

impl PciBus {
    /// Creates an empty bus.
    pub fn new(id: BusId) -> Self {
        Self {
            id,
            devices: Vec::new(),
        }
    }
}

/// A function on a bus.
#[derive(Debug, Clone)]
pub struct PciDevice {
    /// The address of this function.
    pub address: PciAddress,
    /// Whether this function is a bridge, and what lies behind it.
    pub kind: DeviceKind,
}

impl PciDevice {
    /// Returns the bridge state if this device is a bridge.
    pub fn as_bridge(&self) -> Option<&PciBridge> {
        match &self.kind {
            DeviceKind::Endpoint => None,
            DeviceKind::Bridge(bridge) => Some(bridge),
        }
    }

    /// Returns the mutable bridge state if this device is a bridge.
    pub fn as_bridge_mut(&mut self) -> Option<&mut PciBridge> {
        match &mut self.kind {
            DeviceKind::Endpoint => None,
            DeviceKind::Bridge(bridge) => Some(bridge),
        }
    }
}

/// Distinguishes bridges from endpoints.
///
/// Only a bridge owns a subordinate bus.
#[derive(Debug, Clone)]
pub enum DeviceKind {
    /// A function with no subordinate bus.
    Endpoint,
    /// A PCI-to-PCI bridge.
    Bridge(PciBridge),
}

/// A PCI-to-PCI bridge, including its software-assigned windows.
#[derive(Debug, Clone)]
pub struct PciBridge {
    /// The memory window assigned by resource assignment.
    pub mem_window: ResourceWindow,
    /// The I/O window assigned by resource assignment.
    pub io_window: ResourceWindow,
    /// The bus on the secondary side of the bridge.
    pub subordinate: PciBus,
}

impl PciBridge {
    /// A bridge with no windows assigned yet.
    pub fn new(subordinate: PciBus) -> Self {
        Self {
            mem_window: ResourceWindow::unassigned_memory(),
            io_window: ResourceWindow::unassigned_io(),
            subordinate,
        }
    }
}

/// An error from a configuration space access.
#[derive(Debug, Error)]
pub enum ConfigSpaceError {
    /// No function responded at the address.
    #[error("no device at {0}")]
    NoDevice(PciAddress),
    /// The function rejected the access.
    #[error("config access to {address} at offset {offset:#x} failed")]
    Access {
        /// The function accessed.
        address: PciAddress,
        /// The register offset.
        offset: u16,
        /// The underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Byte and word configuration space accessors.
pub trait ConfigSpaceAccess {
    /// Reads the byte register at `offset`.
    fn read_u8(&self, address: PciAddress, offset: u16) -> Result<u8, ConfigSpaceError>;
    /// Reads the word register at `offset`.
    fn read_u16(&self, address: PciAddress, offset: u16) -> Result<u16, ConfigSpaceError>;
    /// Writes the byte register at `offset`.
    fn write_u8(&self, address: PciAddress, offset: u16, value: u8) -> Result<(), ConfigSpaceError>;
    /// Writes the word register at `offset`.
    fn write_u16(
        &self,
        address: PciAddress,
        offset: u16,
        value: u16,
    ) -> Result<(), ConfigSpaceError>;
}

/// The platform's PCI subsystem, as seen by the rescan.
pub trait PciHost: Send + Sync {
    /// Looks up a bus that the platform already knows about.
    fn find_bus(&self, id: BusId) -> Option<BusId>;

    /// Acquires the system-wide lock that every actor capable of
    /// restructuring the bus tree (including hot-plug) must hold.
    ///
    /// The lock is released when the returned session is dropped.
    fn lock_rescan_remove(&self) -> Box<dyn RescanSession + '_>;
}

/// Topology operations that are only valid under the rescan/remove lock.
pub trait RescanSession {
    /// Discovers devices on `bus` and below that were not present before.
    ///
    /// Devices that are already known are left untouched.
    fn scan_child_bus(&mut self, bus: BusId);

    /// Computes BAR and bridge window placements for newly discovered
    /// devices under `bus`.
    ///
    /// This only updates the platform's records; it never writes hardware
    /// registers.
    fn assign_unassigned_bus_resources(&mut self, bus: BusId);

    /// Returns the current view of `bus`, if it exists.
    fn bus(&self, bus: BusId) -> Option<&PciBus>;

    /// Returns the configuration space accessors.
    fn config_space(&self) -> &dyn ConfigSpaceAccess;

    /// Hands newly added devices under `bus` to driver attachment, which
    /// probes drivers immediately.
    fn bus_add_devices(&mut self, bus: BusId);
}
