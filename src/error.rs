//! Error types for the EtherNet/IP driver.
//!
//! All fallible operations in this crate return [`Result`], with [`EipError`]
//! covering the full taxonomy: tag parsing, host resolution, TCP connect,
//! the encapsulation handshake, transport failures, protocol violations and
//! CIP-level status codes.
//!
//! Propagation policy: transport and protocol errors inside the scan worker
//! disconnect the PLC and recover locally by reconnecting on the next cycle.
//! Per-tag CIP errors (unknown tag, array index out of range) do not
//! disconnect; they invalidate that tag's cached value instead. Errors from
//! the structural API (`define_plc`, `add_tag`) are returned synchronously to
//! the caller.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::cip;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EipError>;

/// Errors produced by the EtherNet/IP driver.
#[derive(Debug, Error)]
pub enum EipError {
    /// Malformed tag string or an over-long CIP path.
    #[error("tag parse error: {0}")]
    Parse(String),

    /// Hostname lookup failed; no socket was created.
    #[error("cannot resolve host '{0}'")]
    Resolve(String),

    /// TCP-level connect failure.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// The connect attempt did not complete within the configured timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// ListServices reported no CIP PDU support, or RegisterSession was
    /// rejected by the target.
    #[error("session handshake failed: {0}")]
    Handshake(String),

    /// Send/receive failure on an established session: short write, EOF,
    /// or an I/O error mid-frame. Partial data is discarded.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A socket operation exceeded the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer violated the wire protocol: bad encapsulation status,
    /// service byte not echoing the request, count mismatch, truncation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The target returned a non-zero CIP general status.
    #[error("{}", cip_message(.status, .extended))]
    Cip {
        /// CIP general status byte.
        status: u8,
        /// First extended status word, if the response carried one.
        extended: Option<u16>,
    },

    /// Unknown CIP data type, or a value could not be coerced to the
    /// tag's observed type.
    #[error("type error: {0}")]
    Type(String),

    /// The operation needs type information that no prior read has
    /// provided yet.
    #[error("no valid data for tag")]
    NoData,
}

impl EipError {
    /// Builds a [`EipError::Cip`] from a response's status fields.
    pub fn cip(status: u8, extended: Option<u16>) -> Self {
        EipError::Cip { status, extended }
    }
}

fn cip_message(status: &u8, extended: &Option<u16>) -> String {
    let mut msg = format!("CIP error 0x{status:02X} ({})", cip::status_text(*status));
    if let Some(ext) = extended {
        match cip::extended_status_text(*status, *ext) {
            Some(text) => msg.push_str(&format!(", ext 0x{ext:04X}: {text}")),
            None => msg.push_str(&format!(", ext 0x{ext:04X}")),
        }
    }
    msg
}
