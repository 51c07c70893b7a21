//! Control-plane HTTP surface for Clustore.
//!
//! The server side is an axum router over [`ControlState`]; the client
//! side is [`ControlClient`], the production implementation of the
//! [`clustore_cluster::ControlPlane`] transport. Both speak the same JSON
//! messages defined in `clustore-cluster`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod server;

pub use client::ControlClient;
pub use server::{control_router, ControlState};
