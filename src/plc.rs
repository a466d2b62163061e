//! Driver data model: tags, scan lists, PLCs.
//!
//! Ownership runs straight down: the registry owns PLCs, a PLC owns its
//! scan lists, a scan list owns its tags, a tag owns its value buffer and
//! subscriber list. Locks come in three levels and are always taken in the
//! order registry -> PLC -> tag:
//!
//! 1. the registry mutex (PLC list traversal, whole-system operations),
//! 2. the per-PLC mutex (all structural changes; the scan worker holds it
//!    for entire cycles),
//! 3. the per-tag mutex (short-held: the write-handoff flags, the value
//!    buffer, callback dispatch).
//!
//! The scan worker increments `slow_scans` without the PLC mutex, so that
//! counter is atomic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::debug;

use crate::cip;
use crate::error::{EipError, Result};
use crate::session::{TcpSession, DEFAULT_TIMEOUT};
use crate::tag_path::TagPath;

/// A subscriber callback: invoked after each read or write result for its
/// tag, in registration order, under the tag mutex. The locked state is
/// passed in; the callback must not block.
///
/// Callbacks are compared by `Arc` identity: adding the same `Arc` twice is
/// a no-op, and removal takes the same `Arc` that was added.
pub type TagCallback = Arc<dyn Fn(&TagInfo, &TagState) + Send + Sync>;

// =========================================================================
// TagInfo
// =========================================================================

/// Mutable per-tag state, guarded by the tag mutex.
pub struct TagState {
    /// Requested element count (highest request wins, never shrinks).
    pub(crate) elements: usize,
    /// Cached CIP sizes from discovery; 0 = unknown.
    pub(crate) r_request_size: usize,
    pub(crate) r_response_size: usize,
    pub(crate) w_request_size: usize,
    pub(crate) w_response_size: usize,
    /// Raw CIP payload: abbreviated type, then value bytes. Grows as
    /// needed; `valid_data_size == 0` means no valid data.
    pub(crate) data: Vec<u8>,
    pub(crate) valid_data_size: usize,
    /// Subscriber requested a write; picked up at the next bundling pass.
    pub(crate) do_write: bool,
    /// The engine committed this cycle to writing the tag.
    pub(crate) is_writing: bool,
    /// Duration of the network transfer that last carried this tag.
    pub(crate) transfer_time: Duration,
    pub(crate) callbacks: Vec<TagCallback>,
}

impl TagState {
    fn new(elements: usize) -> Self {
        TagState {
            elements,
            r_request_size: 0,
            r_response_size: 0,
            w_request_size: 0,
            w_response_size: 0,
            data: Vec::new(),
            valid_data_size: 0,
            do_write: false,
            is_writing: false,
            transfer_time: Duration::ZERO,
            callbacks: Vec::new(),
        }
    }

    /// Requested element count.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Whether the value buffer currently holds valid data.
    pub fn valid(&self) -> bool {
        self.valid_data_size > 0
    }

    /// The raw `type | data` payload, or `None` without valid data.
    pub fn raw(&self) -> Option<&[u8]> {
        if self.valid() {
            Some(&self.data[..self.valid_data_size])
        } else {
            None
        }
    }

    /// The observed CIP type, or `NoData` before the first read.
    pub fn payload_type(&self) -> Result<cip::CipType> {
        cip::payload_type(self.raw().ok_or(EipError::NoData)?)
    }

    /// Reads element `element` of the cached value as `f64`.
    pub fn get_f64(&self, element: usize) -> Result<f64> {
        cip::get_f64(self.raw().ok_or(EipError::NoData)?, element)
    }

    /// Reads element `element` of the cached value as `u32`.
    pub fn get_u32(&self, element: usize) -> Result<u32> {
        cip::get_u32(self.raw().ok_or(EipError::NoData)?, element)
    }

    /// Whether a write is pending or in flight.
    pub fn write_pending(&self) -> bool {
        self.do_write
    }

    /// Duration of the transfer that last carried this tag.
    pub fn transfer_time(&self) -> Duration {
        self.transfer_time
    }
}

impl fmt::Debug for TagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagState")
            .field("elements", &self.elements)
            .field("valid_data_size", &self.valid_data_size)
            .field("do_write", &self.do_write)
            .field("is_writing", &self.is_writing)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// One subscribed tag on one PLC. Created by `add_tag`, never destroyed;
/// the parsed path is immutable, everything else lives behind the tag
/// mutex.
#[derive(Debug)]
pub struct TagInfo {
    string_tag: String,
    tag: TagPath,
    state: Mutex<TagState>,
}

impl TagInfo {
    pub(crate) fn new(string_tag: &str, elements: usize) -> Result<Self> {
        let tag = TagPath::parse(string_tag)?;
        Ok(TagInfo {
            string_tag: string_tag.to_string(),
            tag,
            state: Mutex::new(TagState::new(elements)),
        })
    }

    /// The tag string as registered.
    pub fn name(&self) -> &str {
        &self.string_tag
    }

    /// The parsed tag path.
    pub fn path(&self) -> &TagPath {
        &self.tag
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TagState> {
        self.state.lock().unwrap()
    }

    /// Runs `f` with the tag state locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&TagState) -> R) -> R {
        f(&self.lock())
    }

    /// Requests a write of `value` to element `element`, coerced to the
    /// observed CIP type. The scan engine picks the write up on its next
    /// bundling pass; a second request before that merges into the same
    /// cycle, a request after bundling waits for the cycle after.
    ///
    /// Fails with [`EipError::NoData`] until a successful read has cached
    /// the tag's type.
    pub fn request_write_f64(&self, element: usize, value: f64) -> Result<()> {
        let mut s = self.lock();
        if !s.valid() {
            return Err(EipError::NoData);
        }
        let size = s.valid_data_size;
        cip::put_f64(&mut s.data[..size], element, value)?;
        s.do_write = true;
        Ok(())
    }

    /// Integer flavor of [`TagInfo::request_write_f64`].
    pub fn request_write_u32(&self, element: usize, value: u32) -> Result<()> {
        let mut s = self.lock();
        if !s.valid() {
            return Err(EipError::NoData);
        }
        let size = s.valid_data_size;
        cip::put_u32(&mut s.data[..size], element, value)?;
        s.do_write = true;
        Ok(())
    }
}

// =========================================================================
// ScanList
// =========================================================================

/// Per-list scan statistics.
#[derive(Debug, Clone)]
pub struct ScanStats {
    pub list_errors: u32,
    /// Next scheduled scan; `None` means "due now".
    pub scheduled: Option<Instant>,
    /// Start of the most recent scan.
    pub last_scan: Option<Instant>,
    pub min_scan_time: Duration,
    pub max_scan_time: Duration,
    pub last_scan_time: Duration,
}

impl ScanStats {
    fn new() -> Self {
        ScanStats {
            list_errors: 0,
            scheduled: None,
            last_scan: None,
            min_scan_time: Duration::MAX,
            max_scan_time: Duration::ZERO,
            last_scan_time: Duration::ZERO,
        }
    }
}

/// Tags scheduled at one period on one PLC. Created on the first
/// `add_tag` at a new period, never destroyed.
#[derive(Debug)]
pub struct ScanList {
    pub(crate) period: Duration,
    pub(crate) enabled: bool,
    pub(crate) tags: Vec<Arc<TagInfo>>,
    pub(crate) stats: ScanStats,
}

impl ScanList {
    fn new(period: Duration) -> Self {
        ScanList {
            period,
            enabled: true,
            tags: Vec::new(),
            stats: ScanStats::new(),
        }
    }

    /// Scan period of this list.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub(crate) fn reset_stats(&mut self) {
        self.enabled = true;
        self.stats = ScanStats::new();
    }

    fn find_tag(&self, string_tag: &str) -> Option<usize> {
        self.tags.iter().position(|t| t.name() == string_tag)
    }
}

// =========================================================================
// PLC
// =========================================================================

/// Everything about one PLC that the worker and the structural API share
/// under the PLC mutex.
#[derive(Debug)]
pub struct PlcState {
    pub(crate) host: String,
    pub(crate) slot: u8,
    pub(crate) timeout: Duration,
    pub(crate) session: Option<TcpSession>,
    pub(crate) scanlists: Vec<ScanList>,
    pub(crate) plc_errors: u32,
}

impl PlcState {
    /// Index of the scan list at `period`, creating it when missing.
    pub(crate) fn scanlist_at(&mut self, period: Duration) -> usize {
        if let Some(i) = self.scanlists.iter().position(|l| l.period == period) {
            return i;
        }
        self.scanlists.push(ScanList::new(period));
        self.scanlists.len() - 1
    }

    /// Finds a tag by string across all scan lists.
    pub(crate) fn find_tag(&self, string_tag: &str) -> Option<(usize, Arc<TagInfo>)> {
        for (li, list) in self.scanlists.iter().enumerate() {
            if let Some(ti) = list.find_tag(string_tag) {
                return Some((li, Arc::clone(&list.tags[ti])));
            }
        }
        None
    }

    /// Registers a tag, migrating an already-known tag to a faster list
    /// and maximizing its element count. Parsing happens only on first
    /// registration.
    pub(crate) fn add_tag(&mut self, period: Duration, string_tag: &str, elements: usize) -> Result<Arc<TagInfo>> {
        if elements > u16::MAX as usize {
            return Err(EipError::Parse(format!(
                "'{string_tag}': element count {elements} exceeds the 16-bit wire field"
            )));
        }
        let elements = elements.max(1);

        if let Some((li, info)) = self.find_tag(string_tag) {
            if self.scanlists[li].period > period {
                // current list is too slow, move the tag
                let ti = self.scanlists[li]
                    .find_tag(string_tag)
                    .expect("tag was just found on this list");
                self.scanlists[li].tags.remove(ti);
                let faster = self.scanlist_at(period);
                self.scanlists[faster].tags.push(Arc::clone(&info));
            }
            let mut s = info.lock();
            if s.elements < elements {
                s.elements = elements;
            }
            drop(s);
            return Ok(info);
        }

        let info = Arc::new(TagInfo::new(string_tag, elements)?);
        let li = self.scanlist_at(period);
        self.scanlists[li].tags.push(Arc::clone(&info));
        Ok(info)
    }

    /// Clears every tag's valid data, each under its own mutex.
    pub(crate) fn invalidate_tags(&self) {
        for list in &self.scanlists {
            for tag in &list.tags {
                tag.lock().valid_data_size = 0;
            }
        }
    }

    /// Drops the session (unregistering first) and invalidates all cached
    /// values so subscribers observe the loss of data.
    pub(crate) async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown().await;
            self.invalidate_tags();
        }
    }
}

/// One PLC entry: name, connection state, scan lists, worker bookkeeping.
/// Inserted into the registry by `define_plc`, never removed.
#[derive(Debug)]
pub struct Plc {
    name: String,
    pub(crate) state: AsyncMutex<PlcState>,
    /// Cycles that missed their schedule. Bumped outside the PLC mutex,
    /// hence atomic.
    pub(crate) slow_scans: AtomicU32,
    pub(crate) scan_running: AtomicBool,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl Plc {
    pub(crate) fn new(name: &str, host: &str, slot: u8) -> Self {
        let (shutdown, _) = watch::channel(false);
        debug!(name, host, slot, "PLC defined");
        Plc {
            name: name.to_string(),
            state: AsyncMutex::new(PlcState {
                host: host.to_string(),
                slot,
                timeout: DEFAULT_TIMEOUT,
                session: None,
                scanlists: Vec::new(),
                plc_errors: 0,
            }),
            slow_scans: AtomicU32::new(0),
            scan_running: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Logical name of this PLC.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cycles that missed their schedule since the last reset.
    pub fn slow_scans(&self) -> u32 {
        self.slow_scans.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Sets the socket timeout used for this PLC's transport operations
    /// and its reconnect back-off.
    pub async fn set_timeout(&self, timeout: Duration) {
        self.state.lock().await.timeout = timeout;
    }

    /// Connection error count since the last reset.
    pub async fn errors(&self) -> u32 {
        self.state.lock().await.plc_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PlcState {
        PlcState {
            host: "plc1".to_string(),
            slot: 0,
            timeout: DEFAULT_TIMEOUT,
            session: None,
            scanlists: Vec::new(),
            plc_errors: 0,
        }
    }

    #[test]
    fn add_tag_creates_lists_by_period() {
        let mut plc = state();
        let fast = Duration::from_millis(100);
        let slow = Duration::from_secs(1);

        let a = plc.add_tag(fast, "a", 1).unwrap();
        let b = plc.add_tag(slow, "b", 1).unwrap();
        assert_eq!(plc.scanlists.len(), 2);
        assert_eq!(plc.scanlists[0].period, fast);
        assert_eq!(plc.scanlists[1].period, slow);
        assert!(Arc::ptr_eq(&plc.find_tag("a").unwrap().1, &a));
        assert!(Arc::ptr_eq(&plc.find_tag("b").unwrap().1, &b));
    }

    #[test]
    fn add_tag_migrates_to_faster_list_and_maximizes_elements() {
        let mut plc = state();
        let slow = Duration::from_secs(2);
        let fast = Duration::from_millis(500);

        let first = plc.add_tag(slow, "counter[0]", 4).unwrap();
        // same tag requested faster and larger: migrates, keeps identity
        let second = plc.add_tag(fast, "counter[0]", 10).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let (li, _) = plc.find_tag("counter[0]").unwrap();
        assert_eq!(plc.scanlists[li].period, fast);
        assert_eq!(first.lock().elements, 10);

        // a later, slower request neither moves the tag nor shrinks it
        let third = plc.add_tag(slow, "counter[0]", 2).unwrap();
        assert!(Arc::ptr_eq(&first, &third));
        let (li, _) = plc.find_tag("counter[0]").unwrap();
        assert_eq!(plc.scanlists[li].period, fast);
        assert_eq!(first.lock().elements, 10);
    }

    #[test]
    fn add_tag_rejects_oversized_element_counts() {
        let mut plc = state();
        assert!(plc
            .add_tag(Duration::from_secs(1), "big", u16::MAX as usize + 1)
            .is_err());
    }

    #[test]
    fn add_tag_parses_once_and_propagates_parse_errors() {
        let mut plc = state();
        assert!(plc.add_tag(Duration::from_secs(1), "bad[", 1).is_err());
        assert!(plc.scanlists.is_empty() || plc.scanlists[0].tags.is_empty());
    }

    #[test]
    fn request_write_needs_prior_type() {
        let info = TagInfo::new("valve", 1).unwrap();
        assert!(matches!(
            info.request_write_f64(0, 1.0),
            Err(EipError::NoData)
        ));

        // a read populated DINT data: the write request coerces and lands
        {
            let mut s = info.lock();
            s.data = vec![0xC4, 0x00, 0, 0, 0, 0];
            s.valid_data_size = 6;
        }
        info.request_write_f64(0, 17.0).unwrap();
        let s = info.lock();
        assert!(s.do_write);
        assert_eq!(cip::get_u32(s.raw().unwrap(), 0).unwrap(), 17);
    }

    #[test]
    fn invalidate_clears_valid_sizes() {
        let mut plc = state();
        let tag = plc.add_tag(Duration::from_secs(1), "t", 1).unwrap();
        {
            let mut s = tag.lock();
            s.data = vec![0xC4, 0x00, 1, 0, 0, 0];
            s.valid_data_size = 6;
        }
        plc.invalidate_tags();
        assert!(!tag.lock().valid());
    }
}
