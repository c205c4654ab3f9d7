// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rendez Master server.
//!
//! Accepts node processes over TCP, runs their requests against a
//! [`rendez::MasterRegistry`] and pushes the resulting notifications back
//! to the affected clients. Clients that stop heartbeating are expired and
//! everything their nodes registered is torn down.

pub mod config;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use server::{MasterServer, ServerError};
