// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Programs bridge forwarding windows into hardware configuration space.
//!
//! Resource assignment only records window placements in the platform's
//! topology structures. Until the memory base/limit and I/O base/limit
//! registers are written, and memory decoding is enabled, a bridge forwards
//! nothing to its secondary bus and every driver probe behind it fails.

use crate::topology::ConfigSpaceAccess;
use crate::topology::PciBridge;
use crate::topology::PciBus;
use crate::topology::PciDevice;
use crate::topology::ResourceWindow;
use pci_core::spec::cfg_space;
use pci_core::spec::cfg_space::type1;

/// Command bits every programmed bridge must have set.
const BRIDGE_ENABLE_BITS: u16 = cfg_space::Command::new()
    .with_mmio_enabled(true)
    .with_bus_master(true)
    .into_bits();

/// Encodes a memory window into its (base, limit) register values.
///
/// Both registers carry address bits 31:20 in their upper 12 bits.
pub fn encode_memory_window(window: &ResourceWindow) -> (u16, u16) {
    let encode = |addr: u64| {
        (addr >> cfg_space::MEMORY_RANGE_ADDR_SHIFT) as u16 & cfg_space::MEMORY_RANGE_ADDR_MASK
    };
    (encode(window.start), encode(window.end))
}

/// Encodes an I/O window into its (base, limit) register values.
///
/// Both registers carry address bits 15:12 in their upper 4 bits.
pub fn encode_io_window(window: &ResourceWindow) -> (u8, u8) {
    let encode =
        |addr: u64| (addr >> cfg_space::IO_RANGE_ADDR_SHIFT) as u8 & cfg_space::IO_RANGE_ADDR_MASK;
    (encode(window.start), encode(window.end))
}

/// Writes every bridge's assigned windows under `bus` into hardware and
/// enables memory decoding and bus mastering on it, recursing into each
/// bridge's secondary bus before moving to the next sibling.
///
/// Zero-size windows leave their registers untouched. Non-bridge devices are
/// never accessed. A failed register access is logged and that step is
/// skipped. Returns the number of bridges programmed.
pub fn program_bridge_windows(bus: &PciBus, cfg: &dyn ConfigSpaceAccess) -> usize {
    let mut bridges = 0;
    for device in &bus.devices {
        let Some(bridge) = device.as_bridge() else {
            continue;
        };
        program_bridge(device, bridge, cfg);
        bridges += 1 + program_bridge_windows(&bridge.subordinate, cfg);
    }
    bridges
}

fn program_bridge(device: &PciDevice, bridge: &PciBridge, cfg: &dyn ConfigSpaceAccess) {
    let address = device.address;

    if bridge.mem_window.size() > 0 {
        let (base, limit) = encode_memory_window(&bridge.mem_window);
        let result = cfg
            .write_u16(address, type1::MEMORY_BASE, base)
            .and_then(|()| cfg.write_u16(address, type1::MEMORY_LIMIT, limit));
        match result {
            Ok(()) => tracing::info!(
                device = %address,
                "bridge mem window {}",
                bridge.mem_window
            ),
            Err(err) => tracing::warn!(
                device = %address,
                error = &err as &dyn std::error::Error,
                "failed to program bridge mem window"
            ),
        }
    }

    if bridge.io_window.size() > 0 {
        let (base, limit) = encode_io_window(&bridge.io_window);
        if let Err(err) = cfg
            .write_u8(address, type1::IO_BASE, base)
            .and_then(|()| cfg.write_u8(address, type1::IO_LIMIT, limit))
        {
            tracing::warn!(
                device = %address,
                error = &err as &dyn std::error::Error,
                "failed to program bridge io window"
            );
        }
    }

    match cfg.read_u16(address, type1::COMMAND) {
        Ok(command) => {
            if let Err(err) = cfg.write_u16(address, type1::COMMAND, command | BRIDGE_ENABLE_BITS)
            {
                tracing::warn!(
                    device = %address,
                    error = &err as &dyn std::error::Error,
                    "failed to enable bridge"
                );
            }
        }
        Err(err) => tracing::warn!(
            device = %address,
            error = &err as &dyn std::error::Error,
            "failed to read bridge command register"
        ),
    }
}
