// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core PCI infrastructure.
//!
//! A collection of constants, types, and traits that are shared across
//! PCI-related crates.

#![forbid(unsafe_code)]

pub mod cfg_space_emu;
pub mod spec;
