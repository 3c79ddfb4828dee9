// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deferred rescan of a PCIe switch that finishes link training late.
//!
//! On some boards the bus controller enumerates before a downstream switch's
//! ports have trained, so everything behind the switch is missing after
//! boot. [`SwitchRescan`] waits, rescans the switch's root bus, programs the
//! bridge windows the platform assigned (but never wrote to hardware), and
//! only then attaches drivers.

#![forbid(unsafe_code)]

pub mod bridge_windows;
pub mod deferred;
pub mod params;
pub mod rescan;
pub mod topology;

#[cfg(test)]
mod test_helpers;

use deferred::DeferredWork;
use deferred::TaskState;
use params::ParameterStore;
use std::sync::Arc;
use topology::PciHost;

/// The loaded rescan: one deferred pass against one host.
pub struct SwitchRescan {
    work: DeferredWork,
}

impl SwitchRescan {
    /// Arms the deferred rescan using the delay currently in `params`.
    ///
    /// The target bus is read from `params` when the rescan fires. Loading
    /// always succeeds; whether the rescan finds its bus is only reported
    /// through logs.
    pub fn load(params: Arc<ParameterStore>, host: Arc<dyn PciHost>) -> Self {
        let span = tracing::info_span!("pcie_switch_rescan");
        let _enter = span.enter();

        let delay = params.snapshot().delay;
        tracing::info!("scheduling rescan in {}ms", delay.as_millis());

        let mut work = DeferredWork::new("pcie-switch-rescan");
        if let Err(err) = work.schedule(delay, move || {
            rescan::rescan(host.as_ref(), &params.snapshot());
        }) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to schedule rescan"
            );
        }
        Self { work }
    }

    /// The state of the deferred rescan.
    pub fn state(&self) -> Option<TaskState> {
        self.work.state()
    }

    /// Cancels the rescan if it has not fired yet, or waits for it to finish.
    pub fn unload(mut self) {
        self.work.cancel_and_join();
        tracing::info!("pcie switch rescan unloaded");
    }
}
