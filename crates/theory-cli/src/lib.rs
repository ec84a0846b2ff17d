// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! theory-cli
#![deny(unsafe_code)]

/// Command implementations.
pub mod commands;
/// Environment-driven configuration.
pub mod config;
