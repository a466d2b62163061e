//! Driver registry and public surface.
//!
//! A [`Driver`] owns the ordered set of PLCs. PLCs are defined once and
//! never removed while the process runs; `restart` launches one scan
//! worker per PLC. A process-wide instance is available through
//! [`driver()`] together with free functions shaped like the classic
//! `drvEtherIP_*` entry points, so integration layers need not thread a
//! handle around.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use lazy_static::lazy_static;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::info;

use crate::cip::format_payload;
use crate::encap::ENIP_PORT;
use crate::error::Result;
use crate::plc::{Plc, TagCallback, TagInfo};
use crate::scan::spawn_scan_task;
use crate::session::TcpSession;
use crate::tag_path::TagPath;

/// Driver version reported by `report`.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long `report` waits for a busy PLC mutex before giving up on the
/// detailed sections.
const REPORT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// The PLC registry and system-wide operations.
#[derive(Debug)]
pub struct Driver {
    /// Ordered PLC list; the registry mutex guards traversal/insertion.
    plcs: AsyncMutex<Vec<Arc<Plc>>>,
    /// Default scan period for integration layers that do not provide one;
    /// zero means unset.
    default_rate: StdMutex<Duration>,
}

impl Driver {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Driver {
            plcs: AsyncMutex::new(Vec::new()),
            default_rate: StdMutex::new(Duration::ZERO),
        }
    }

    /// Default scan period handed to integration layers; zero = unset.
    pub fn default_rate(&self) -> Duration {
        *self.default_rate.lock().unwrap()
    }

    /// Sets the default scan period.
    pub fn set_default_rate(&self, rate: Duration) {
        *self.default_rate.lock().unwrap() = rate;
    }

    /// Defines a PLC under `name`, reachable at `host` with the processor
    /// in backplane `slot`. Idempotent: an existing entry keeps its scan
    /// lists and gets the new host/slot.
    pub async fn define_plc(&self, name: &str, host: &str, slot: u8) -> Arc<Plc> {
        let mut plcs = self.plcs.lock().await;
        if let Some(plc) = plcs.iter().find(|p| p.name() == name) {
            let plc = Arc::clone(plc);
            drop(plcs);
            {
                let mut state = plc.state.lock().await;
                state.host = host.to_string();
                state.slot = slot;
            }
            return plc;
        }
        let plc = Arc::new(Plc::new(name, host, slot));
        plcs.push(Arc::clone(&plc));
        plc
    }

    /// Looks a PLC up by name.
    pub async fn find_plc(&self, name: &str) -> Option<Arc<Plc>> {
        self.plcs
            .lock()
            .await
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    /// Registers `string_tag` on `plc` at `period`. A tag already known
    /// under a slower period migrates to the faster list; the element
    /// count only ever grows.
    pub async fn add_tag(
        &self,
        plc: &Plc,
        period: Duration,
        string_tag: &str,
        elements: usize,
    ) -> Result<Arc<TagInfo>> {
        plc.state.lock().await.add_tag(period, string_tag, elements)
    }

    /// Finds a tag by string on `plc`.
    pub async fn find_tag(&self, plc: &Plc, string_tag: &str) -> Option<Arc<TagInfo>> {
        plc.state.lock().await.find_tag(string_tag).map(|(_, t)| t)
    }

    /// Subscribes `callback` to `info`. Adding the same `Arc` twice is a
    /// no-op.
    pub async fn add_callback(&self, plc: &Plc, info: &TagInfo, callback: TagCallback) {
        let _state = plc.state.lock().await;
        let mut s = info.lock();
        if s.callbacks.iter().any(|cb| Arc::ptr_eq(cb, &callback)) {
            return;
        }
        s.callbacks.push(callback);
    }

    /// Removes a previously added callback by `Arc` identity.
    pub async fn remove_callback(&self, plc: &Plc, info: &TagInfo, callback: &TagCallback) {
        let _state = plc.state.lock().await;
        let mut s = info.lock();
        if let Some(i) = s.callbacks.iter().position(|cb| Arc::ptr_eq(cb, callback)) {
            s.callbacks.remove(i);
        }
    }

    /// Disconnects every PLC (workers reconnect on their next cycle) and
    /// spawns scan workers that are not already running. Returns the
    /// number of workers spawned.
    pub async fn restart(&self) -> usize {
        let plcs = self.plcs.lock().await;
        let mut spawned = 0;
        for plc in plcs.iter() {
            {
                let mut state = plc.state.lock().await;
                state.disconnect().await;
            }
            plc.shutdown.send_replace(false);
            if spawn_scan_task(plc) {
                spawned += 1;
            }
        }
        info!(spawned, "driver restarted");
        spawned
    }

    /// Signals every scan worker to exit; each disconnects its PLC on the
    /// way out. `restart` brings the engine back.
    pub async fn shutdown(&self) {
        let plcs = self.plcs.lock().await;
        for plc in plcs.iter() {
            plc.shutdown.send_replace(true);
        }
        // PLCs without a running worker still hold a session
        for plc in plcs.iter() {
            if !plc.scan_running.load(std::sync::atomic::Ordering::SeqCst) {
                plc.state.lock().await.disconnect().await;
            }
        }
        info!("driver shut down");
    }

    /// Clears every error counter and min/max scan time, and re-arms all
    /// scan schedules.
    pub async fn reset_statistics(&self) {
        let plcs = self.plcs.lock().await;
        for plc in plcs.iter() {
            plc.slow_scans.store(0, std::sync::atomic::Ordering::Relaxed);
            let mut state = plc.state.lock().await;
            state.plc_errors = 0;
            for list in &mut state.scanlists {
                list.reset_stats();
            }
        }
    }

    /// Renders a report at `level` (0..=10); higher levels add identity,
    /// connection, scan-list and per-tag detail.
    pub async fn report(&self, level: u8) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "drvEtherIP V{VERSION} report");
        let plcs = self.plcs.lock().await;
        for plc in plcs.iter() {
            let state = match timeout(REPORT_LOCK_TIMEOUT, plc.state.lock()).await {
                Ok(state) => state,
                Err(_) => {
                    let _ = writeln!(out, "* PLC '{}': CANNOT GET PLC'S LOCK!", plc.name());
                    continue;
                }
            };
            let _ = writeln!(
                out,
                "* PLC '{}', IP '{}', slot {}:",
                plc.name(),
                state.host,
                state.slot
            );
            if level > 0 {
                if let Some(ident) = state.session.as_ref().and_then(|s| s.identity()) {
                    let _ = writeln!(out, "  Interface name        : {}", ident.name);
                    let _ = writeln!(out, "  Interface vendor      : 0x{:X}", ident.vendor);
                    let _ = writeln!(out, "  Interface type        : 0x{:X}", ident.device_type);
                    let _ = writeln!(out, "  Interface revision    : 0x{:X}", ident.revision);
                    let _ = writeln!(out, "  Interface serial      : 0x{:X}", ident.serial_number);
                }
                let _ = writeln!(out, "  scan thread slow count: {}", plc.slow_scans());
                let _ = writeln!(out, "  connection errors     : {}", state.plc_errors);
            }
            if level > 1 {
                match state.session.as_ref() {
                    Some(session) => {
                        let _ = writeln!(
                            out,
                            "  session               : 0x{:08X}, timeout {} ms, limit {} bytes",
                            session.session_handle(),
                            state.timeout.as_millis(),
                            session.transfer_buffer_limit()
                        );
                    }
                    None => {
                        let _ = writeln!(out, "  session               : disconnected");
                    }
                }
            }
            if level > 3 {
                for list in &state.scanlists {
                    let stats = list.stats();
                    let _ = writeln!(
                        out,
                        "** Scanlist {:.3} secs ({})",
                        list.period().as_secs_f64(),
                        if list.enabled { "enabled" } else { "DISABLED" }
                    );
                    let _ = writeln!(out, "   Errors        : {}", stats.list_errors);
                    if stats.min_scan_time != Duration::MAX {
                        let _ = writeln!(
                            out,
                            "   Scan time     : last {:.3} s, min {:.3} s, max {:.3} s",
                            stats.last_scan_time.as_secs_f64(),
                            stats.min_scan_time.as_secs_f64(),
                            stats.max_scan_time.as_secs_f64()
                        );
                    }
                    if level > 5 {
                        for tag in &list.tags {
                            let s = tag.lock();
                            let _ = writeln!(
                                out,
                                "*** Tag '{}': elements {}, sizes r {}/{} w {}/{}, {}",
                                tag.name(),
                                s.elements(),
                                s.r_request_size,
                                s.r_response_size,
                                s.w_request_size,
                                s.w_response_size,
                                match s.raw() {
                                    Some(raw) => format_payload(raw, s.elements()),
                                    None => "-no data-".to_string(),
                                }
                            );
                        }
                    }
                }
            }
        }
        out
    }

    /// Short form of `report`: every tag with its current value.
    pub async fn dump(&self) -> String {
        let mut out = String::new();
        let plcs = self.plcs.lock().await;
        for plc in plcs.iter() {
            let state = plc.state.lock().await;
            let _ = writeln!(out, "PLC {}", plc.name());
            for list in &state.scanlists {
                for tag in &list.tags {
                    let s = tag.lock();
                    let _ = writeln!(
                        out,
                        "{} {}",
                        tag.name(),
                        match s.raw() {
                            Some(raw) => format_payload(raw, s.elements()),
                            None => "-no data-".to_string(),
                        }
                    );
                }
            }
        }
        out
    }
}

impl Default for Driver {
    fn default() -> Self {
        Driver::new()
    }
}

/// One-shot tag read without touching the registry: connect, read,
/// shut the session down. Returns the raw `type | data` payload.
/// Intended for command-line round-trip tests.
pub async fn read_tag_adhoc(
    host: &str,
    port: u16,
    slot: u8,
    string_tag: &str,
    elements: u16,
    millisec_timeout: Duration,
) -> Result<Vec<u8>> {
    let tag = TagPath::parse(string_tag)?;
    let mut session = TcpSession::connect(host, port, slot, millisec_timeout).await?;
    let result = session.read_tag(&tag, elements).await;
    session.shutdown().await;
    Ok(result?.data)
}

lazy_static! {
    /// The process-wide driver instance behind the `drvEtherIP_*`-shaped
    /// free functions.
    static ref DRIVER: Driver = Driver::new();
}

/// The process-wide driver registry.
pub fn driver() -> &'static Driver {
    &DRIVER
}

/// Initializes the global driver. Safe to call more than once.
pub fn init() -> &'static Driver {
    lazy_static::initialize(&DRIVER);
    &DRIVER
}

/// Defines a PLC on the global driver. See [`Driver::define_plc`].
pub async fn define_plc(name: &str, host: &str, slot: u8) -> Arc<Plc> {
    DRIVER.define_plc(name, host, slot).await
}

/// Ad-hoc single read on the default port. See [`read_tag_adhoc`].
pub async fn read_tag(
    host: &str,
    slot: u8,
    string_tag: &str,
    elements: u16,
    millisec_timeout: Duration,
) -> Result<Vec<u8>> {
    read_tag_adhoc(host, ENIP_PORT, slot, string_tag, elements, millisec_timeout).await
}

/// Restarts the global driver. See [`Driver::restart`].
pub async fn restart() -> usize {
    DRIVER.restart().await
}

/// Shuts the global driver down. See [`Driver::shutdown`].
pub async fn shutdown() {
    DRIVER.shutdown().await
}

/// Report on the global driver. See [`Driver::report`].
pub async fn report(level: u8) -> String {
    DRIVER.report(level).await
}

/// Dump of the global driver. See [`Driver::dump`].
pub async fn dump() -> String {
    DRIVER.dump().await
}

/// Statistics reset on the global driver. See [`Driver::reset_statistics`].
pub async fn reset_statistics() {
    DRIVER.reset_statistics().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn define_plc_is_idempotent_by_name() {
        let driver = Driver::new();
        let a = driver.define_plc("plc1", "10.0.0.1", 0).await;
        let b = driver.define_plc("plc1", "10.0.0.2", 3).await;
        assert!(Arc::ptr_eq(&a, &b));
        let state = a.state.lock().await;
        assert_eq!(state.host, "10.0.0.2");
        assert_eq!(state.slot, 3);
        drop(state);
        assert!(driver.find_plc("plc1").await.is_some());
        assert!(driver.find_plc("plc2").await.is_none());
    }

    #[tokio::test]
    async fn callbacks_dedup_and_remove_by_identity() {
        let driver = Driver::new();
        let plc = driver.define_plc("plc1", "10.0.0.1", 0).await;
        let tag = driver
            .add_tag(&plc, Duration::from_secs(1), "t", 1)
            .await
            .unwrap();

        let cb: TagCallback = Arc::new(|_, _| {});
        driver.add_callback(&plc, &tag, Arc::clone(&cb)).await;
        driver.add_callback(&plc, &tag, Arc::clone(&cb)).await;
        assert_eq!(tag.lock().callbacks.len(), 1);

        // a different closure with the same shape is a different identity
        let other: TagCallback = Arc::new(|_, _| {});
        driver.add_callback(&plc, &tag, Arc::clone(&other)).await;
        assert_eq!(tag.lock().callbacks.len(), 2);

        driver.remove_callback(&plc, &tag, &cb).await;
        assert_eq!(tag.lock().callbacks.len(), 1);
        assert!(Arc::ptr_eq(&tag.lock().callbacks[0], &other));
    }

    #[tokio::test]
    async fn report_and_dump_render_without_connection() {
        let driver = Driver::new();
        let plc = driver.define_plc("mill", "203.0.113.9", 2).await;
        driver
            .add_tag(&plc, Duration::from_millis(500), "speed", 1)
            .await
            .unwrap();

        let report = driver.report(10).await;
        assert!(report.contains("PLC 'mill'"));
        assert!(report.contains("203.0.113.9"));
        assert!(report.contains("Tag 'speed'"));

        let dump = driver.dump().await;
        assert!(dump.contains("speed -no data-"));
    }

    #[tokio::test]
    async fn reset_statistics_clears_counters() {
        let driver = Driver::new();
        let plc = driver.define_plc("plc1", "10.0.0.1", 0).await;
        driver
            .add_tag(&plc, Duration::from_secs(1), "t", 1)
            .await
            .unwrap();
        {
            let mut state = plc.state.lock().await;
            state.plc_errors = 7;
            state.scanlists[0].stats.list_errors = 3;
        }
        plc.slow_scans.store(2, std::sync::atomic::Ordering::Relaxed);

        driver.reset_statistics().await;
        let state = plc.state.lock().await;
        assert_eq!(state.plc_errors, 0);
        assert_eq!(state.scanlists[0].stats().list_errors, 0);
        assert_eq!(plc.slow_scans(), 0);
    }
}
