//! Scalegate - an on-demand TCP proxy with an embedded autoscaling controller
//!
//! This library provides a proxy that:
//! - Accepts client connections on configured local listener addresses
//! - Creates a cloud worker server on first use (Hetzner Cloud)
//! - Tunnels client bytes to upstreams on the server through SSH
//! - Pins the server's host key to a freshly generated RSA key shipped
//!   via cloud-init
//! - Deletes the server again after a configurable idle period
//! - Enforces a hard per-connection timeout so lingering connections
//!   cannot keep the server alive
//! - Runs auxiliary side-car processes with a templated environment

pub mod autoscaler;
pub mod config;
pub mod error;
pub mod hcloud;
pub mod probe;
pub mod procs;
pub mod proxy;
pub mod secrets;
pub mod ssh;
pub mod stream;
pub mod template;
