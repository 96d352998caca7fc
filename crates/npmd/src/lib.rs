//! npmd — the node pool manager daemon.
//!
//! Assembles the NPM subsystems into one process:
//! - gRPC capacity service (mTLS) fed by router advertisements
//! - Capacity reconciler driving the configured control plane
//! - Admin HTTP API exposing per-group demand and supply
//!
//! The binary in `main.rs` is a thin CLI over [`daemon::Daemon`].

pub mod admin;
pub mod daemon;
