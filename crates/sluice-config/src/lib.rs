// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Configuration for the sluice gateway.
//!
//! The configuration is a frozen value: it is loaded once at startup (or on
//! an explicit reload), wrapped in an `Arc`, and never mutated afterwards.
//! Components that need tunables receive a clone of the relevant section.
//!
//! YAML files are merged from lowest to highest priority; see [`load`].

mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    BatchConfig, Config, ImageWsConfig, MediaConfig, PoolConfig, RetryConfig, ServerConfig,
    StoreConfig, StreamConfig, UpstreamConfig,
};
