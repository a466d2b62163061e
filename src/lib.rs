//! # EtherNet/IP driver for Allen-Bradley ControlLogix PLCs
//!
//! A client library and scan engine that reads and writes named PLC tags
//! over TCP/IP using the encapsulated Common Industrial Protocol (CIP).
//!
//! Three layers build on each other:
//!
//! - the **wire codec**: bit-exact encapsulation headers, Connection
//!   Manager `Unconnected_Send` envelopes, Message-Router requests and
//!   responses, symbolic tag paths and CIP multi-request bundles,
//! - the **session layer**: TCP lifecycle with the ListServices /
//!   RegisterSession handshake, identity probe and framed, timeout-bounded
//!   I/O through a growable receive buffer,
//! - the **scan engine**: one worker per PLC that groups tags by requested
//!   period, bundles compatible reads and writes into multi-requests sized
//!   to a transfer limit, interleaves writes with reads under a latched
//!   read/write handoff, dispatches per-tag callbacks and reconnects on
//!   transport failure.
//!
//! Messaging is unconnected only (`Unconnected_Send` through the
//! backplane, port 1 + slot); connected Forward_Open/Forward_Close
//! messaging and UDP I/O are out of scope.
//!
//! ## Scanning tags
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use etherip_driver::{driver, TagCallback};
//!
//! #[tokio::main]
//! async fn main() -> etherip_driver::Result<()> {
//!     let drv = driver();
//!     let plc = drv.define_plc("line1", "192.168.1.10", 0).await;
//!     let tag = drv.add_tag(&plc, Duration::from_millis(500), "flow[3]", 1).await?;
//!
//!     let watcher: TagCallback = Arc::new(|info, state| {
//!         match state.get_f64(0) {
//!             Ok(value) => println!("{} = {value}", info.name()),
//!             Err(_) => println!("{}: no data", info.name()),
//!         }
//!     });
//!     drv.add_callback(&plc, &tag, watcher).await;
//!     drv.restart().await;
//!     Ok(())
//! }
//! ```
//!
//! ## One-shot reads
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use etherip_driver::{read_tag, cip};
//!
//! #[tokio::main]
//! async fn main() -> etherip_driver::Result<()> {
//!     let payload = read_tag("192.168.1.10", 0, "counter", 1,
//!                            Duration::from_millis(5000)).await?;
//!     println!("counter = {}", cip::format_payload(&payload, 1));
//!     Ok(())
//! }
//! ```

pub mod cip;
pub mod codec;
pub mod driver;
pub mod encap;
pub mod epath;
pub mod error;
pub mod plc;
mod scan;
pub mod session;
pub mod tag_path;

pub use cip::CipType;
pub use driver::{
    define_plc, driver, dump, init, read_tag, read_tag_adhoc, report, reset_statistics, restart,
    shutdown, Driver,
};
pub use encap::ENIP_PORT;
pub use error::{EipError, Result};
pub use plc::{Plc, ScanList, ScanStats, TagCallback, TagInfo, TagState};
pub use session::{Identity, TcpSession, DEFAULT_TIMEOUT, DEFAULT_TRANSFER_BUFFER_LIMIT};
pub use tag_path::{TagPath, TagSegment};

use tracing::level_filters::LevelFilter;

/// Maps the classic 0..=10 driver verbosity scale onto a tracing filter:
/// 0 shows errors only, 10 everything including frame hexdumps.
pub fn verbosity_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::ERROR,
        1..=2 => LevelFilter::WARN,
        3..=5 => LevelFilter::INFO,
        6..=8 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}
