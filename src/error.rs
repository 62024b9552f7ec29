//! Error types for configuration, provisioning and tunneling.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. These are construction-time and fatal to the process.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(
        "scaledown_after ({scaledown_after:?}) must be greater than connection_timeout ({connection_timeout:?})"
    )]
    ScaledownTooShort {
        scaledown_after: Duration,
        connection_timeout: Duration,
    },

    #[error("failed to read variables file '{path}': {source}")]
    VariablesFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decrypt variable '{name}': {reason}")]
    Decrypt { name: String, reason: String },

    #[error("{0} is not set")]
    MissingKey(&'static str),
}

/// Cloud provider API failures.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("api request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error ({code}): {message}")]
    Api { code: String, message: String },

    #[error("no {kind} named '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("action {id} failed: {message}")]
    ActionFailed { id: u64, message: String },

    #[error("malformed api response: missing {0}")]
    Malformed(&'static str),
}

/// SSH tunnel failures.
#[derive(Error, Debug)]
pub enum SshError {
    #[error("key generation failed: {0}")]
    KeyGen(String),

    #[error("connection to {addr} failed: {source}")]
    Connect { addr: String, source: russh::Error },

    #[error("server presented an unexpected host key")]
    HostKeyMismatch,

    #[error("authentication rejected by server")]
    AuthRejected,

    #[error("failed to open tunnel to {net} {addr}: {source}")]
    Tunnel {
        net: &'static str,
        addr: String,
        source: russh::Error,
    },

    #[error("invalid upstream address '{0}': expected host:port")]
    InvalidAddr(String),

    #[error(transparent)]
    Protocol(#[from] russh::Error),
}

/// A bounded-retry probe ran out of attempts.
#[derive(Error, Debug)]
#[error("remote {addr} did not respond after {attempts} attempts")]
pub struct Unreachable {
    pub addr: String,
    pub attempts: u32,
}

/// Errors surfaced by the lifecycle controller to its callers.
#[derive(Error, Debug)]
pub enum AutoscalerError {
    /// Cloud API or action-watch failure. The host record is not advanced.
    #[error("failed to provision server: {0}")]
    Provision(#[from] ProviderError),

    /// Probe exhausted. An existing host record is left in place.
    #[error(transparent)]
    Unreachable(#[from] Unreachable),

    /// SSH dial failure.
    #[error("ssh handshake failed: {0}")]
    Handshake(#[from] SshError),

    /// Delete failure during scale-down. Retried on the next tick.
    #[error("failed to delete server: {0}")]
    Teardown(#[source] ProviderError),

    /// `get_connection` was called while no host record exists.
    #[error("no server online")]
    NoServer,

    /// The controller loop has exited.
    #[error("autoscaler is stopped")]
    Stopped,
}
