//! The per-PLC scan engine.
//!
//! One long-lived worker task per PLC. Each cycle the worker takes the PLC
//! mutex, (re)connects if needed, walks the scan lists that are due,
//! bundles as many tag reads/writes as fit one transfer into a single
//! `Unconnected_Send`-wrapped MultiRequest, dispatches per-tag results and
//! callbacks, and sleeps until the nearest schedule.
//!
//! The read/write handoff runs over two flags per tag, both only touched
//! under the tag mutex:
//!
//! ```text
//! do_write   is_writing
//!    1           0       subscriber requested a write
//!    1           1       engine committed this cycle to writing
//!    0           1       request sent / awaiting response
//!    0           0       steady state, reads proceed
//! ```
//!
//! Bundling latches `is_writing`; a `do_write` raised after that point is
//! deferred to the following cycle (otherwise the subscriber would block
//! until the response arrived). Read and write requests differ in size, so
//! the choice must hold from sizing through response handling.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::cip::{
    self, multi_request_size, multi_response_size, push_read_data, push_write_data,
    unwrap_unconnected_send_response, wrap_unconnected_send, MrResponse, MultiRequestBuilder,
    MultiResponse, S_MULTI_REQUEST, S_READ_DATA, S_WRITE_DATA, TYPECODE_SIZE,
};
use crate::encap::ENIP_PORT;
use crate::error::{EipError, Result};
use crate::plc::{Plc, PlcState, ScanList};
use crate::session::TcpSession;

/// Fallback sleep for a PLC with nothing scannable.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Launches the scan worker for `plc` unless one is already running.
/// Returns whether a worker was spawned.
pub(crate) fn spawn_scan_task(plc: &Arc<Plc>) -> bool {
    if plc.scan_running.swap(true, Ordering::SeqCst) {
        return false;
    }
    let plc = Arc::clone(plc);
    tokio::spawn(async move {
        scan_task(&plc).await;
        plc.scan_running.store(false, Ordering::SeqCst);
    });
    true
}

async fn scan_task(plc: &Plc) {
    let mut shutdown = plc.shutdown.subscribe();
    info!(plc = plc.name(), "scan worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        let mut state = plc.state.lock().await;
        let timeout = state.timeout;

        if !ensure_connected(plc.name(), &mut state).await {
            drop(state);
            // don't rush, connecting costs network bandwidth
            if wait_or_shutdown(&mut shutdown, timeout).await {
                break;
            }
            continue;
        }

        let mut next_schedule: Option<Instant> = None;
        let mut failed = false;
        for li in 0..state.scanlists.len() {
            if !state.scanlists[li].enabled {
                continue;
            }
            let period = state.scanlists[li].period;
            let start = Instant::now();
            let due = state.scanlists[li]
                .stats
                .scheduled
                .map_or(true, |t| start >= t);
            if due {
                let result = {
                    let PlcState {
                        session, scanlists, ..
                    } = &mut *state;
                    let session = session.as_mut().expect("connected above");
                    let list = &mut scanlists[li];
                    list.stats.last_scan = Some(start);
                    process_scan_list(session, list).await
                };
                let elapsed = start.elapsed();
                {
                    let stats = &mut state.scanlists[li].stats;
                    stats.last_scan_time = elapsed;
                    if elapsed > stats.max_scan_time {
                        stats.max_scan_time = elapsed;
                    }
                    if elapsed < stats.min_scan_time {
                        stats.min_scan_time = elapsed;
                    }
                }
                match result {
                    Ok(()) => {
                        // reschedule exactly, relative to the cycle start
                        state.scanlists[li].stats.scheduled = Some(start + period);
                    }
                    Err(e) => {
                        warn!(plc = plc.name(), period = ?period, "scan transfer failed: {e}");
                        state.scanlists[li].stats.list_errors += 1;
                        state.plc_errors += 1;
                        state.scanlists[li].stats.scheduled = Some(Instant::now() + timeout);
                        state.disconnect().await;
                        failed = true;
                        break;
                    }
                }
            }
            let scheduled = state.scanlists[li].stats.scheduled;
            if let Some(t) = scheduled {
                if next_schedule.map_or(true, |n| t < n) {
                    next_schedule = Some(t);
                }
            }
        }
        drop(state);

        if failed {
            continue;
        }
        match next_schedule {
            Some(t) => {
                let now = Instant::now();
                if now < t {
                    if wait_or_shutdown(&mut shutdown, t - now).await {
                        break;
                    }
                } else {
                    // behind schedule; note it and go right back around
                    plc.slow_scans.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                if wait_or_shutdown(&mut shutdown, IDLE_SLEEP).await {
                    break;
                }
            }
        }
    }

    plc.state.lock().await.disconnect().await;
    info!(plc = plc.name(), "scan worker stopped");
}

/// Sleeps for `duration` unless shutdown is signalled first.
/// Returns true when the worker should exit.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Connects and sizes undiscovered tags when there is no session yet.
async fn ensure_connected(name: &str, state: &mut PlcState) -> bool {
    if state.session.is_some() {
        return true;
    }
    let (host, port) = crate::session::split_host_port(&state.host, ENIP_PORT);
    let host = host.to_string();
    match TcpSession::connect(&host, port, state.slot, state.timeout).await {
        Ok(session) => {
            state.session = Some(session);
        }
        Err(e) => {
            warn!(plc = name, host = %state.host, "connect failed: {e}");
            return false;
        }
    }
    if discover_tag_sizes(state).await {
        true
    } else {
        warn!(plc = name, "no tag answered discovery");
        state.disconnect().await;
        false
    }
}

/// Discovery: reads every tag that has no cached CIP sizes once,
/// standalone, and records request/response sizes. Write sizes derive from
/// the read sizes; a response of only the 4 fixed MR bytes means the tag
/// carries no type+data and cannot be written.
///
/// Per-tag failure is tolerated; the connection counts as usable when at
/// least one tag (old or new) is sized.
async fn discover_tag_sizes(state: &mut PlcState) -> bool {
    let PlcState {
        session, scanlists, ..
    } = state;
    let session = match session.as_mut() {
        Some(s) => s,
        None => return false,
    };

    let mut any_ok = false;
    for list in scanlists.iter() {
        for info in &list.tags {
            let elements = {
                let s = info.lock();
                if s.r_request_size > 0 || s.r_response_size > 0 {
                    any_ok = true;
                    continue; // don't look twice
                }
                s.elements as u16
            };
            match session.read_tag(info.path(), elements).await {
                Ok(result) => {
                    let mut s = info.lock();
                    s.r_request_size = result.request_size;
                    s.r_response_size = result.response_size;
                    if result.response_size <= 4 {
                        // status only, no type+data: not writable
                        s.w_request_size = 0;
                        s.w_response_size = 0;
                    } else {
                        let type_and_data = result.response_size - 4;
                        s.w_request_size = result.request_size + type_and_data;
                        s.w_response_size = 4;
                    }
                    debug!(
                        tag = info.name(),
                        r_request = s.r_request_size,
                        r_response = s.r_response_size,
                        w_request = s.w_request_size,
                        "tag sized"
                    );
                    any_ok = true;
                }
                Err(e) => {
                    debug!(tag = info.name(), "discovery read failed: {e}");
                }
            }
        }
    }
    any_ok
}

/// One entry of a planned bundle.
struct BundleItem {
    /// Index into the scan list's tag vector.
    index: usize,
    /// Latched read/write decision for this cycle.
    writing: bool,
}

/// A bundle of consecutive (sized) tags that fits the transfer limit.
struct Bundle {
    items: Vec<BundleItem>,
    /// Position to resume the list walk at.
    next: usize,
}

/// Walks tags from `start`, decides read vs. write per tag under its
/// mutex, latches `is_writing`, and stops before the multi-request or
/// multi-response would exceed `limit`. Tags without discovered sizes are
/// passed over.
fn plan_bundle(limit: usize, list: &ScanList, start: usize) -> Bundle {
    let mut items = Vec::new();
    let mut requests_size = 0usize;
    let mut responses_size = 0usize;

    for index in start..list.tags.len() {
        let info = &list.tags[index];
        let mut s = info.lock();
        if s.r_request_size == 0 {
            continue;
        }
        let mut writing = s.do_write;
        if writing {
            // writable only with a cached type and at least one element
            let writable = s.w_request_size > 0
                && s.valid_data_size >= TYPECODE_SIZE
                && match cip::payload_type(&s.data[..s.valid_data_size]) {
                    Ok(ty) => s.valid_data_size >= TYPECODE_SIZE + ty.size(),
                    Err(_) => false,
                };
            if !writable {
                // no observed type to echo: suppress the write
                warn!(tag = info.name(), "write without prior type, suppressed");
                s.do_write = false;
                s.valid_data_size = 0;
                writing = false;
            }
        }
        let (req, resp) = if writing {
            (s.w_request_size, s.w_response_size)
        } else {
            (s.r_request_size, s.r_response_size)
        };
        let try_requests = requests_size + req;
        let try_responses = responses_size + resp;
        let count = items.len() + 1;
        if multi_request_size(count, try_requests) > limit
            || multi_response_size(count, try_responses) > limit
        {
            // full; this tag opens the next transfer
            return Bundle {
                items,
                next: index,
            };
        }
        if writing {
            s.is_writing = true;
        }
        drop(s);
        items.push(BundleItem { index, writing });
        requests_size = try_requests;
        responses_size = try_responses;
    }

    Bundle {
        items,
        next: list.tags.len(),
    }
}

/// Scans one list: bundles, transfers and dispatches until every tag was
/// carried once. `Ok` means the transfers worked, even if individual tag
/// reads returned errors.
async fn process_scan_list(session: &mut TcpSession, list: &mut ScanList) -> Result<()> {
    let limit = session.transfer_buffer_limit();
    let mut pos = 0;

    while pos < list.tags.len() {
        let bundle = plan_bundle(limit, list, pos);
        if bundle.items.is_empty() {
            return Ok(());
        }
        pos = bundle.next;
        transfer_bundle(session, list, &bundle).await?;
    }
    Ok(())
}

/// Assembles, sends and dispatches one bundle.
async fn transfer_bundle(session: &mut TcpSession, list: &mut ScanList, bundle: &Bundle) -> Result<()> {
    let mut multi = MultiRequestBuilder::new(bundle.items.len());
    for item in &bundle.items {
        let info = &list.tags[item.index];
        let mut request = Vec::new();
        if item.writing {
            let mut s = info.lock();
            let ty = cip::payload_type(&s.data[..s.valid_data_size])?;
            // bundling guaranteed at least one cached element
            let available = (s.valid_data_size - TYPECODE_SIZE) / ty.size();
            let elements = s.elements.min(available);
            let end = TYPECODE_SIZE + elements * ty.size();
            push_write_data(
                &mut request,
                info.path(),
                ty,
                elements as u16,
                &s.data[TYPECODE_SIZE..end],
            );
            s.do_write = false;
            trace!(tag = info.name(), elements, "bundled write");
        } else {
            let elements = info.lock().elements;
            push_read_data(&mut request, info.path(), elements as u16);
            trace!(tag = info.name(), elements, "bundled read");
        }
        multi.push(&request)?;
    }

    let wrapped = wrap_unconnected_send(&multi.finish()?, session.slot());
    let transfer_start = Instant::now();
    let raw = session.send_rr_data(&wrapped).await?;
    let response = unwrap_unconnected_send_response(raw)?;
    let transfer_time = transfer_start.elapsed();

    let data = MrResponse::parse(response)?.check(S_MULTI_REQUEST)?;
    let replies = MultiResponse::parse(data)?;
    if replies.count() != bundle.items.len() {
        return Err(EipError::Protocol(format!(
            "MultiResponse count {} does not match the {} bundled requests",
            replies.count(),
            bundle.items.len()
        )));
    }

    for (k, item) in bundle.items.iter().enumerate() {
        let reply = replies.get(k)?;
        let info = &list.tags[item.index];
        let mut s = info.lock();
        s.transfer_time = transfer_time;

        if item.writing {
            let outcome = MrResponse::parse(reply).and_then(|r| r.check(S_WRITE_DATA).map(|_| ()));
            if let Err(e) = outcome {
                // the PLC keeps its value; drop ours so the next read refreshes
                error!(tag = info.name(), "write failed: {e}");
                s.valid_data_size = 0;
            }
            s.is_writing = false;
        } else {
            match MrResponse::parse(reply).and_then(|r| r.check(S_READ_DATA)) {
                Ok(data) if !data.is_empty() => {
                    if s.do_write {
                        // read raced a fresh write request; next cycle writes
                        debug!(
                            tag = info.name(),
                            "write requested in middle of read cycle, read ignored"
                        );
                    } else {
                        if s.data.len() < data.len() {
                            s.data.resize(data.len(), 0);
                        }
                        s.data[..data.len()].copy_from_slice(data);
                        s.valid_data_size = data.len();
                    }
                }
                Ok(_) => {
                    if !s.do_write {
                        s.valid_data_size = 0;
                    }
                }
                Err(e) => {
                    debug!(tag = info.name(), "read failed: {e}");
                    if !s.do_write {
                        s.valid_data_size = 0;
                    }
                }
            }
        }

        // callbacks in registration order, still under the tag mutex
        for cb in &s.callbacks {
            (**cb)(info, &*s);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DEFAULT_TRANSFER_BUFFER_LIMIT;

    fn list_with(tags: &[(&str, usize, usize)]) -> ScanList {
        // (name, r_request, r_response); sizes of 0 leave the tag
        // undiscovered
        let mut state = crate::plc::PlcState {
            host: "x".into(),
            slot: 0,
            timeout: Duration::from_secs(1),
            session: None,
            scanlists: Vec::new(),
            plc_errors: 0,
        };
        for (name, r_req, r_resp) in tags {
            let info = state.add_tag(Duration::from_secs(1), name, 1).unwrap();
            let mut s = info.lock();
            s.r_request_size = *r_req;
            s.r_response_size = *r_resp;
            if *r_resp > 4 {
                s.w_request_size = r_req + (r_resp - 4);
                s.w_response_size = 4;
            }
        }
        state.scanlists.remove(0)
    }

    #[test]
    fn bundle_respects_transfer_limit() {
        // each read: request 30, response 30 bytes. The multi request
        // frames n items in 8 + 2n + 30n bytes, so 15 items need 488
        // bytes and a 16th would push past the 500-byte limit.
        let tags: Vec<(String, usize, usize)> =
            (0..40).map(|i| (format!("t{i}"), 30, 30)).collect();
        let refs: Vec<(&str, usize, usize)> =
            tags.iter().map(|(n, a, b)| (n.as_str(), *a, *b)).collect();
        let list = list_with(&refs);

        assert_eq!(multi_request_size(15, 15 * 30), 488);
        assert!(multi_request_size(16, 16 * 30) > DEFAULT_TRANSFER_BUFFER_LIMIT);

        let first = plan_bundle(DEFAULT_TRANSFER_BUFFER_LIMIT, &list, 0);
        assert_eq!(first.items.len(), 15);
        assert_eq!(first.next, 15);
        let second = plan_bundle(DEFAULT_TRANSFER_BUFFER_LIMIT, &list, first.next);
        assert_eq!(second.items.len(), 15);
        let third = plan_bundle(DEFAULT_TRANSFER_BUFFER_LIMIT, &list, second.next);
        assert_eq!(third.items.len(), 10);
        assert_eq!(third.next, 40);
    }

    #[test]
    fn bundle_skips_undiscovered_tags() {
        let list = list_with(&[("a", 10, 10), ("b", 0, 0), ("c", 10, 10)]);
        let bundle = plan_bundle(DEFAULT_TRANSFER_BUFFER_LIMIT, &list, 0);
        let included: Vec<usize> = bundle.items.iter().map(|i| i.index).collect();
        assert_eq!(included, [0, 2]);
        assert_eq!(bundle.next, 3);
    }

    #[test]
    fn bundle_latches_write_decision() {
        let list = list_with(&[("a", 10, 14)]);
        {
            let mut s = list.tags[0].lock();
            s.data = vec![0xC4, 0x00, 1, 0, 0, 0];
            s.valid_data_size = 6;
            s.do_write = true;
        }
        let bundle = plan_bundle(DEFAULT_TRANSFER_BUFFER_LIMIT, &list, 0);
        assert!(bundle.items[0].writing);
        let s = list.tags[0].lock();
        assert!(s.is_writing, "decision is latched on the tag");
        assert!(s.do_write, "do_write stays up until the request is built");
    }

    #[test]
    fn write_without_type_is_suppressed() {
        let list = list_with(&[("a", 10, 14)]);
        {
            let mut s = list.tags[0].lock();
            s.do_write = true; // no data ever read
            s.valid_data_size = 0;
        }
        let bundle = plan_bundle(DEFAULT_TRANSFER_BUFFER_LIMIT, &list, 0);
        assert!(!bundle.items[0].writing);
        let s = list.tags[0].lock();
        assert!(!s.do_write);
        assert!(!s.is_writing);
        assert_eq!(s.valid_data_size, 0);
    }

    #[test]
    fn oversized_first_tag_yields_empty_bundle() {
        let list = list_with(&[("a", 600, 10)]);
        let bundle = plan_bundle(DEFAULT_TRANSFER_BUFFER_LIMIT, &list, 0);
        assert!(bundle.items.is_empty());
        assert_eq!(bundle.next, 0);
    }
}
