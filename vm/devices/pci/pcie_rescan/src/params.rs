// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Externally configurable rescan parameters.
//!
//! Values may be changed at any time, from any thread. The rescan reads them
//! exactly once, when its deferred task fires, so a change made after that
//! point only affects the next load.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

/// Default delay before the rescan fires.
pub const DEFAULT_RESCAN_DELAY_MS: u32 = 3000;
/// Default PCI domain of the switch's root bus.
pub const DEFAULT_DOMAIN: u32 = 4;
/// Default bus number of the switch's root bus.
pub const DEFAULT_BUS_NR: u8 = 0x40;

/// A named parameter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Param {
    /// Delay in milliseconds before rescanning the bus.
    RescanDelayMs,
    /// PCI domain to rescan.
    Domain,
    /// Root bus number to rescan.
    BusNr,
}

impl Param {
    /// Every parameter, in display order.
    pub const ALL: [Param; 3] = [Param::RescanDelayMs, Param::Domain, Param::BusNr];

    /// The parameter's external name.
    pub fn name(&self) -> &'static str {
        match self {
            Param::RescanDelayMs => "rescan_delay_ms",
            Param::Domain => "domain",
            Param::BusNr => "bus_nr",
        }
    }

    /// A one-line description, including the default.
    pub fn description(&self) -> &'static str {
        match self {
            Param::RescanDelayMs => "Delay in ms before rescanning bus (default: 3000)",
            Param::Domain => "PCI domain to rescan (default: 4)",
            Param::BusNr => "Root bus number to rescan (default: 0x40)",
        }
    }

    /// Looks a parameter up by its external name.
    pub fn from_name(name: &str) -> Result<Self, ParamError> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| ParamError::Unknown(name.to_owned()))
    }

    fn max(&self) -> u32 {
        match self {
            Param::RescanDelayMs | Param::Domain => u32::MAX,
            Param::BusNr => u8::MAX.into(),
        }
    }
}

/// Errors from setting a parameter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    /// No parameter has this name.
    #[error("unknown parameter {0:?}")]
    Unknown(String),
    /// The value is not a decimal or `0x`-prefixed hexadecimal integer.
    #[error("invalid value {value:?} for parameter {name}")]
    Invalid {
        /// The parameter name.
        name: &'static str,
        /// The rejected value.
        value: String,
    },
    /// The value does not fit the parameter's type.
    #[error("value {value} out of range for parameter {name} (max {max})")]
    OutOfRange {
        /// The parameter name.
        name: &'static str,
        /// The rejected value.
        value: u64,
        /// The largest accepted value.
        max: u32,
    },
    /// An argument was not of the form `name=value`.
    #[error("malformed argument {0:?}, expected name=value")]
    Malformed(String),
}

/// An immutable view of the parameters, taken when the rescan fires.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RescanParams {
    /// How long to wait before rescanning.
    pub delay: Duration,
    /// The domain of the bus to rescan.
    pub domain: u32,
    /// The number of the bus to rescan.
    pub bus: u8,
}

/// The live, externally mutable parameter values.
#[derive(Debug)]
pub struct ParameterStore {
    rescan_delay_ms: AtomicU32,
    domain: AtomicU32,
    bus_nr: AtomicU32,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(DEFAULT_RESCAN_DELAY_MS, DEFAULT_DOMAIN, DEFAULT_BUS_NR)
    }
}

impl ParameterStore {
    /// Creates a store with explicit initial values.
    pub fn new(rescan_delay_ms: u32, domain: u32, bus_nr: u8) -> Self {
        Self {
            rescan_delay_ms: AtomicU32::new(rescan_delay_ms),
            domain: AtomicU32::new(domain),
            bus_nr: AtomicU32::new(bus_nr.into()),
        }
    }

    fn slot(&self, param: Param) -> &AtomicU32 {
        match param {
            Param::RescanDelayMs => &self.rescan_delay_ms,
            Param::Domain => &self.domain,
            Param::BusNr => &self.bus_nr,
        }
    }

    /// Sets the delay before the rescan fires.
    pub fn set_rescan_delay(&self, delay: Duration) {
        let ms = delay.as_millis().min(u32::MAX.into()) as u32;
        self.rescan_delay_ms.store(ms, Ordering::Relaxed);
    }

    /// Sets the domain of the bus to rescan.
    pub fn set_domain(&self, domain: u32) {
        self.domain.store(domain, Ordering::Relaxed);
    }

    /// Sets the number of the bus to rescan.
    pub fn set_bus_nr(&self, bus_nr: u8) {
        self.bus_nr.store(bus_nr.into(), Ordering::Relaxed);
    }

    /// Parses and stores `value` for the parameter called `name`.
    ///
    /// Accepts decimal or `0x`-prefixed hexadecimal. The only validation is
    /// that the value fits the parameter's type.
    pub fn set(&self, name: &str, value: &str) -> Result<(), ParamError> {
        let param = Param::from_name(name)?;
        let trimmed = value.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        }
        .map_err(|_| ParamError::Invalid {
            name: param.name(),
            value: value.to_owned(),
        })?;

        let max = param.max();
        let parsed = u32::try_from(parsed)
            .ok()
            .filter(|&v| v <= max)
            .ok_or(ParamError::OutOfRange {
                name: param.name(),
                value: parsed,
                max,
            })?;
        self.slot(param).store(parsed, Ordering::Relaxed);
        tracing::debug!(param = param.name(), value = parsed, "parameter set");
        Ok(())
    }

    /// Renders the current value of the parameter called `name`.
    pub fn get(&self, name: &str) -> Result<String, ParamError> {
        let param = Param::from_name(name)?;
        let value = self.slot(param).load(Ordering::Relaxed);
        Ok(match param {
            Param::BusNr => format!("{:#04x}", value),
            Param::RescanDelayMs | Param::Domain => value.to_string(),
        })
    }

    /// Applies whitespace separated `name=value` arguments, in order.
    ///
    /// Stops at the first argument that fails; earlier ones stay applied.
    pub fn apply_args(&self, args: &str) -> Result<(), ParamError> {
        for arg in args.split_whitespace() {
            let (name, value) = arg
                .split_once('=')
                .ok_or_else(|| ParamError::Malformed(arg.to_owned()))?;
            self.set(name, value)?;
        }
        Ok(())
    }

    /// Lists every parameter as `name: description`.
    pub fn describe() -> impl Iterator<Item = String> {
        Param::ALL
            .into_iter()
            .map(|p| format!("{}: {}", p.name(), p.description()))
    }

    /// Reads all parameters at once.
    pub fn snapshot(&self) -> RescanParams {
        RescanParams {
            delay: Duration::from_millis(self.rescan_delay_ms.load(Ordering::Relaxed).into()),
            domain: self.domain.load(Ordering::Relaxed),
            bus: self.bus_nr.load(Ordering::Relaxed) as u8,
        }
    }
}
