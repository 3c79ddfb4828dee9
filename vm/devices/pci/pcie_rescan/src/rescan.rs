// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The deferred rescan sequence.
//!
//! The platform offers scan, resource assignment and driver attachment as
//! separate operations, but resource assignment only updates its in-memory
//! records. Programming the bridge windows strictly between assignment and
//! attachment is what lets drivers behind a late switch probe successfully:
//! earlier, the windows are not decided yet; later, drivers have already
//! touched their devices through bridges that forward nothing.

use crate::bridge_windows::program_bridge_windows;
use crate::params::RescanParams;
use crate::topology::BusId;
use crate::topology::PciHost;

/// The result of one rescan pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RescanOutcome {
    /// The target bus does not exist. Nothing was locked or written.
    BusNotFound(BusId),
    /// The full sequence ran.
    Completed {
        /// The bus that was rescanned.
        bus: BusId,
        /// The number of bridges programmed.
        bridges: usize,
    },
}

/// Runs lookup, scan, assign, program and attach against `host`, once.
///
/// The rescan/remove lock is held from the scan through attachment, and is
/// only taken once the lookup has succeeded.
pub fn rescan(host: &dyn PciHost, params: &RescanParams) -> RescanOutcome {
    let target = BusId::new(params.domain, params.bus);
    let Some(bus) = host.find_bus(target) else {
        tracing::error!("bus {} not found", target);
        return RescanOutcome::BusNotFound(target);
    };

    tracing::info!("rescanning bus {}", bus);

    let bridges = {
        let mut session = host.lock_rescan_remove();
        session.scan_child_bus(bus);
        session.assign_unassigned_bus_resources(bus);
        let bridges = match session.bus(bus) {
            Some(root) => program_bridge_windows(root, session.config_space()),
            None => 0,
        };
        session.bus_add_devices(bus);
        bridges
    };

    tracing::info!(bus = %bus, bridges, "rescan complete, bridges programmed");
    RescanOutcome::Completed { bus, bridges }
}
