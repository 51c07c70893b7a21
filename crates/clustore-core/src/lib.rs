//! Core types shared across the Clustore cluster-control plane.
//!
//! This crate provides:
//! - Node descriptors and role/flag types (`types`)
//! - Configuration loading and defaults (`config`)
//! - The error taxonomy with stable wire codes (`error`)
//!
//! Everything here is deliberately free of I/O and async machinery so that
//! the metadata and cluster crates can share it without pulling in a runtime.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorEnvelope, Result};
pub use types::{NetEndpoint, NodeFlags, NodeRole, Snode};
