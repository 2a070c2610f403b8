// Copyright (C) 2024 fil-rpc-proxy contributors
// SPDX-License-Identifier: AGPL-3.0
//! Shared functionality for fil-rpc-proxy components
//!
//! This crate provides the pieces that are useful to both the proxy binary
//! and its tests, currently the tracing/logging initialization.

pub mod logging;

pub use logging::*;
