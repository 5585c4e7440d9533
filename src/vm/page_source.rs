//! Page Source - Per-object paging front end
//!
//! Accepts page requests from the VM system, merges them against whatever
//! is already outstanding, hands genuinely new ranges to the external
//! provider, and fans provider completions and failures back out to every
//! waiter whose range overlapped.
//!
//! Coalescing happens at two points: a batching request grows page by page
//! without touching the provider until the batch closes, and a new request
//! whose start lands inside an already-outstanding range is chained onto
//! that request's overlap list instead of being re-sent.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write as _;
use core::ops::Bound;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::kern::lock::SpinLock;
use crate::types::Status;
use crate::vm::page_provider::PageProvider;
use crate::vm::page_request::{
    BatchState, PageRequest, PageRequestType, QueueState, RequestCore, UNINITIALIZED_OFFSET,
};
use crate::vm::{page_align_down, page_align_up, Page, PageList, PAGE_SIZE};

/// Result of feeding one page into a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulateOutcome {
    /// Page accepted into the batch; nothing sent yet
    Accepted,
    /// Page accepted and the request went to the provider
    Sent,
    /// Page NOT accepted: it was not adjacent, so the batch was flushed
    /// as-is and the caller must start a new request for this page
    Flushed,
}

struct SourceInner {
    detached: bool,
    closed: bool,
    /// Provider-owned requests, per type, keyed by start offset
    outstanding: [BTreeMap<u64, Arc<RequestCore>>; PageRequestType::COUNT],
}

/// Counters mirroring provider traffic
#[derive(Debug, Default)]
pub struct SourceStats {
    /// Requests handed to the provider
    pub sent: AtomicU64,
    /// Requests chained onto an already-outstanding range
    pub overlapped: AtomicU64,
    /// Requests resolved successfully (overlap entries included)
    pub completed: AtomicU64,
    /// Requests resolved with a failure code
    pub failed: AtomicU64,
}

/// The per-VM-object paging front end
pub struct PageSource {
    provider: Arc<dyn PageProvider>,
    inner: SpinLock<SourceInner>,
    stats: SourceStats,
}

impl PageSource {
    pub fn new(provider: Arc<dyn PageProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            inner: SpinLock::new(SourceInner {
                detached: false,
                closed: false,
                outstanding: [BTreeMap::new(), BTreeMap::new(), BTreeMap::new()],
            }),
            stats: SourceStats::default(),
        })
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    // === Failure-code taxonomy ===

    /// Codes a provider may report across the boundary
    pub fn is_valid_external_failure_code(status: Status) -> bool {
        matches!(
            status,
            Status::Io
                | Status::IoDataIntegrity
                | Status::BadState
                | Status::NoSpace
                | Status::BufferTooSmall
        )
    }

    /// External codes plus kernel-internal allocation failure
    pub fn is_valid_internal_failure_code(status: Status) -> bool {
        Self::is_valid_external_failure_code(status) || status == Status::NoMemory
    }

    pub fn supports_request_type(&self, request_type: PageRequestType) -> bool {
        self.provider.supports_page_request_type(request_type)
    }

    pub fn is_detached(&self) -> bool {
        self.inner.lock().detached
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Provider-owned requests of a type currently outstanding
    pub fn outstanding_count(&self, request_type: PageRequestType) -> usize {
        self.inner.lock().outstanding[request_type.index()].len()
    }

    // === Request intake ===

    /// Request a single page be supplied at `offset`.
    ///
    /// On success the request is with the provider (or chained onto an
    /// outstanding range) and the caller should `wait()` on it.
    pub fn request_page(
        self: &Arc<Self>,
        request: &PageRequest,
        offset: u64,
    ) -> Result<(), Status> {
        self.populate_page(request, offset).map(|_| ())
    }

    /// Feed one page at `offset` into `request`, initializing it on first
    /// use. Batching requests accumulate; unbatched requests send at once.
    pub fn populate_page(
        self: &Arc<Self>,
        request: &PageRequest,
        offset: u64,
    ) -> Result<PopulateOutcome, Status> {
        let offset = page_align_down(offset);
        let mut inner = self.inner.lock();
        if inner.detached {
            return Err(Status::BadState);
        }
        if !self.supports_request_type(PageRequestType::Read) {
            return Err(Status::NotSupported);
        }
        if !request.core().is_initialized() {
            request
                .core()
                .init(self.clone(), offset, PageRequestType::Read, "read", false);
        }
        Ok(self.populate_request_locked(&mut inner, request.core(), offset))
    }

    /// Request acknowledgement of a clean-to-dirty transition over
    /// `[offset, offset+len)`, batching the pages into as few provider
    /// trips as possible. The caller is only guaranteed to have asked for
    /// the first page; the rest ride along transparently.
    pub fn request_dirty_transition(
        self: &Arc<Self>,
        request: &PageRequest,
        offset: u64,
        len: u64,
    ) -> Result<(), Status> {
        assert!(len > 0, "empty dirty transition");
        let start = page_align_down(offset);
        let end = page_align_up(offset + len);
        let mut inner = self.inner.lock();
        if inner.detached {
            return Err(Status::BadState);
        }
        if !self.supports_request_type(PageRequestType::Dirty) {
            return Err(Status::NotSupported);
        }
        request
            .core()
            .init(self.clone(), start, PageRequestType::Dirty, "dirty", true);
        let mut cursor = start;
        while cursor < end {
            match self.populate_request_locked(&mut inner, request.core(), cursor) {
                PopulateOutcome::Accepted => {}
                // Adjacency with an outstanding request capped the batch;
                // it is already with the provider.
                PopulateOutcome::Sent => return Ok(()),
                PopulateOutcome::Flushed => {
                    debug_assert!(false, "contiguous dirty walk flushed");
                    return Ok(());
                }
            }
            cursor += PAGE_SIZE;
        }
        self.send_request_to_provider_locked(&mut inner, request.core());
        Ok(())
    }

    /// Close an accepting batch and send it
    pub(crate) fn finalize_request(&self, request: &Arc<RequestCore>) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(request.batch_state(), BatchState::Accepting);
        self.send_request_to_provider_locked(&mut inner, request);
    }

    /// Try to extend `request` by one page at `offset`.
    ///
    /// Growing the batch to exactly touch an existing outstanding request
    /// of the same type ends the batch eagerly; a non-adjacent page
    /// flushes the batch as-is and is not accepted.
    fn populate_request_locked(
        &self,
        inner: &mut SourceInner,
        request: &Arc<RequestCore>,
        offset: u64,
    ) -> PopulateOutcome {
        let (batch_state, request_type, cur_offset, cur_len) = {
            let rs = request.state.lock();
            (rs.batch_state, rs.request_type, rs.offset, rs.len)
        };
        debug_assert!(batch_state != BatchState::Finalized);
        match batch_state {
            BatchState::Unbatched => {
                {
                    let mut rs = request.state.lock();
                    debug_assert_eq!(rs.len, 0);
                    debug_assert_eq!(rs.offset, offset);
                    rs.len = PAGE_SIZE;
                }
                self.send_request_to_provider_locked(inner, request);
                PopulateOutcome::Sent
            }
            BatchState::Accepting | BatchState::Internal => {
                if offset == cur_offset + cur_len {
                    let new_end = {
                        let mut rs = request.state.lock();
                        rs.len += PAGE_SIZE;
                        rs.offset + rs.len
                    };
                    if Self::touches_outstanding(inner, request_type, cur_offset, new_end) {
                        self.send_request_to_provider_locked(inner, request);
                        PopulateOutcome::Sent
                    } else {
                        PopulateOutcome::Accepted
                    }
                } else {
                    self.send_request_to_provider_locked(inner, request);
                    PopulateOutcome::Flushed
                }
            }
            BatchState::Finalized => PopulateOutcome::Sent,
        }
    }

    /// Does `[start, end)` exactly touch an outstanding request of `t`?
    fn touches_outstanding(
        inner: &SourceInner,
        request_type: PageRequestType,
        start: u64,
        end: u64,
    ) -> bool {
        let map = &inner.outstanding[request_type.index()];
        if map.contains_key(&end) {
            return true;
        }
        if let Some((_, prev)) = map.range(..=start).next_back() {
            let ps = prev.state.lock();
            if ps.offset + ps.len == start {
                return true;
            }
        }
        false
    }

    /// Hand a closed request to the provider, unless its start lands
    /// inside an already-outstanding range, in which case it is chained
    /// onto that request's overlap list and resolved for free later.
    fn send_request_to_provider_locked(
        &self,
        inner: &mut SourceInner,
        request: &Arc<RequestCore>,
    ) {
        let (request_type, offset, len) = {
            let mut rs = request.state.lock();
            if rs.batch_state == BatchState::Accepting {
                rs.batch_state = BatchState::Finalized;
            }
            (rs.request_type, rs.offset, rs.len)
        };
        debug_assert!(len > 0);
        let t = request_type.index();
        let existing = inner.outstanding[t]
            .range(..=offset)
            .next_back()
            .map(|(_, r)| r.clone());
        if let Some(existing) = existing {
            let covers = {
                let es = existing.state.lock();
                es.offset <= offset && offset < es.offset + es.len
            };
            if covers {
                request.state.lock().queue_state = QueueState::AsOverlap;
                existing.state.lock().overlap.push_back(request.clone());
                self.stats.overlapped.fetch_add(1, Ordering::Relaxed);
                log::trace!(
                    "page source: {} request at {:#x} chained onto outstanding range",
                    request_type.name(),
                    offset
                );
                return;
            }
        }
        {
            let mut rs = request.state.lock();
            rs.provider_owned = true;
            rs.pending_size = len;
            rs.queue_state = QueueState::InSource;
        }
        inner.outstanding[t].insert(offset, request.clone());
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "page source: sending {} request [{:#x}, {:#x})",
            request_type.name(),
            offset,
            offset + len
        );
        self.provider.send_async_request(request);
    }

    // === Waiting ===

    /// Block the caller until the request resolves
    pub(crate) fn wait_on_request(&self, request: &Arc<RequestCore>) -> Status {
        self.provider.wait_on_event(&request.event)
    }

    // === Resolution ===

    /// The provider supplied `[offset, offset+len)`; resolve READ requests
    pub fn on_pages_supplied(&self, offset: u64, len: u64) {
        let mut inner = self.inner.lock();
        self.resolve_requests_locked(&mut inner, PageRequestType::Read, offset, len);
    }

    /// The provider acknowledged dirty transitions over the range
    pub fn on_pages_dirtied(&self, offset: u64, len: u64) {
        let mut inner = self.inner.lock();
        self.resolve_requests_locked(&mut inner, PageRequestType::Dirty, offset, len);
    }

    fn resolve_requests_locked(
        &self,
        inner: &mut SourceInner,
        request_type: PageRequestType,
        offset: u64,
        len: u64,
    ) {
        let end = offset.saturating_add(len);
        let t = request_type.index();
        for key in Self::intersecting_keys(&inner.outstanding[t], offset, end) {
            let request = inner.outstanding[t]
                .get(&key)
                .expect("outstanding key vanished")
                .clone();
            let completed = {
                let mut rs = request.state.lock();
                let r_end = rs.offset + rs.len;
                let covered = r_end.min(end).saturating_sub(rs.offset.max(offset));
                if covered == 0 {
                    false
                } else {
                    if covered > rs.pending_size {
                        // Legitimate when pages were concurrently
                        // decommitted and re-supplied.
                        log::debug!(
                            "page source: supply [{:#x}, {:#x}) over-covers request at {:#x} (pending {})",
                            offset,
                            end,
                            rs.offset,
                            rs.pending_size
                        );
                        rs.pending_size = 0;
                    } else {
                        rs.pending_size -= covered;
                    }
                    rs.pending_size == 0
                }
            };
            if completed {
                inner.outstanding[t].remove(&key);
                self.complete_request_locked(&request, Status::Ok);
            }
        }
    }

    /// The provider failed `[offset, offset+len)`; fail every intersecting
    /// request of every type.
    ///
    /// Pages an `Internal` DIRTY batch added past its first page were never
    /// explicitly requested by the caller, so a failure starting past that
    /// first page completes the request with `Ok`; the caller retries.
    pub fn on_pages_failed(&self, offset: u64, len: u64, error_status: Status) {
        assert!(
            Self::is_valid_internal_failure_code(error_status),
            "invalid page failure code {:?}",
            error_status
        );
        let end = offset.saturating_add(len);
        let mut inner = self.inner.lock();
        for request_type in PageRequestType::ALL {
            let t = request_type.index();
            for key in Self::intersecting_keys(&inner.outstanding[t], offset, end) {
                let request = inner.outstanding[t]
                    .get(&key)
                    .expect("outstanding key vanished")
                    .clone();
                let final_status = {
                    let rs = request.state.lock();
                    let suppressed = rs.request_type == PageRequestType::Dirty
                        && rs.batch_state == BatchState::Internal
                        && offset > rs.offset;
                    if suppressed {
                        Status::Ok
                    } else {
                        error_status
                    }
                };
                if final_status.is_ok() {
                    log::debug!(
                        "page source: suppressed {} failure past first page of batch at {:#x}",
                        error_status.name(),
                        key
                    );
                } else {
                    log::warn!(
                        "page source: provider failed [{:#x}, {:#x}): {}",
                        offset,
                        end,
                        error_status.name()
                    );
                }
                inner.outstanding[t].remove(&key);
                self.complete_request_locked(&request, final_status);
            }
        }
    }

    /// Wake a request and everything chained on it, in arrival order
    fn complete_request_locked(&self, request: &Arc<RequestCore>, status: Status) {
        let overlaps = {
            let mut rs = request.state.lock();
            RequestCore::reset_locked(&mut rs);
            core::mem::take(&mut rs.overlap)
        };
        let counter = if status.is_ok() {
            &self.stats.completed
        } else {
            &self.stats.failed
        };
        counter.fetch_add(1 + overlaps.len() as u64, Ordering::Relaxed);
        request.event.signal(status);
        for chained in overlaps {
            {
                let mut cs = chained.state.lock();
                RequestCore::reset_locked(&mut cs);
            }
            chained.event.signal(status);
        }
    }

    /// Keys of outstanding requests intersecting `[offset, end)`
    fn intersecting_keys(
        map: &BTreeMap<u64, Arc<RequestCore>>,
        offset: u64,
        end: u64,
    ) -> Vec<u64> {
        let mut keys = Vec::new();
        if let Some((&key, request)) = map.range(..=offset).next_back() {
            let rs = request.state.lock();
            if rs.offset + rs.len > offset {
                keys.push(key);
            }
        }
        keys.extend(
            map.range((Bound::Excluded(offset), Bound::Excluded(end)))
                .map(|(&key, _)| key),
        );
        keys
    }

    // === Cancellation ===

    /// Excise a request from all bookkeeping. If it was provider-owned and
    /// has overlap entries, the first entry is promoted in its place and
    /// the provider told to swap; otherwise the provider clears it.
    pub(crate) fn cancel_request(&self, request: &Arc<RequestCore>) {
        enum ProviderAction {
            None,
            Clear,
            Swap(Arc<RequestCore>),
        }
        let mut inner = self.inner.lock();
        let action = {
            let mut rs = request.state.lock();
            if rs.offset == UNINITIALIZED_OFFSET && rs.queue_state == QueueState::NotQueued {
                rs.src = None;
                return;
            }
            let t = rs.request_type.index();
            match rs.queue_state {
                QueueState::NotQueued => ProviderAction::None,
                QueueState::InSource => {
                    inner.outstanding[t].remove(&rs.offset);
                    if let Some(new_primary) = rs.overlap.pop_front() {
                        let remaining = core::mem::take(&mut rs.overlap);
                        let new_offset = {
                            let mut ns = new_primary.state.lock();
                            ns.provider_owned = true;
                            ns.queue_state = QueueState::InSource;
                            ns.pending_size = ns.len;
                            ns.overlap = remaining;
                            ns.offset
                        };
                        inner.outstanding[t].insert(new_offset, new_primary.clone());
                        ProviderAction::Swap(new_primary)
                    } else {
                        ProviderAction::Clear
                    }
                }
                QueueState::AsOverlap => {
                    for primary in inner.outstanding[t].values() {
                        let mut ps = primary.state.lock();
                        if let Some(pos) =
                            ps.overlap.iter().position(|o| Arc::ptr_eq(o, request))
                        {
                            ps.overlap.remove(pos);
                            break;
                        }
                    }
                    ProviderAction::None
                }
            }
        };
        match action {
            ProviderAction::None => {}
            ProviderAction::Clear => self.provider.clear_async_request(request),
            ProviderAction::Swap(new_primary) => {
                self.provider.swap_async_request(request, &new_primary)
            }
        }
        let mut rs = request.state.lock();
        RequestCore::reset_locked(&mut rs);
        rs.src = None;
    }

    // === Teardown ===

    /// Stop accepting requests and fail everything pending except
    /// writebacks, which are allowed to finish. Idempotent.
    pub fn detach(&self) {
        let mut inner = self.inner.lock();
        if inner.detached {
            return;
        }
        inner.detached = true;
        log::debug!("page source: detach");
        for request_type in [PageRequestType::Read, PageRequestType::Dirty] {
            let drained: Vec<_> =
                core::mem::take(&mut inner.outstanding[request_type.index()])
                    .into_values()
                    .collect();
            for request in drained {
                self.provider.clear_async_request(&request);
                self.complete_request_locked(&request, Status::NotFound);
            }
        }
        debug_assert!(
            inner.outstanding[PageRequestType::Writeback.index()].is_empty(),
            "writeback requests are never issued in this snapshot"
        );
        self.provider.on_detach();
    }

    /// Detach, then release the provider. Idempotent.
    pub fn close(&self) {
        self.detach();
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        log::debug!("page source: close");
        self.provider.on_close();
    }

    // === Provider passthroughs ===

    pub fn free_pages(&self, pages: &mut PageList) {
        self.provider.free_pages(pages);
    }

    pub fn debug_is_page_ok(&self, page: &Page, offset: u64) -> bool {
        self.provider.debug_is_page_ok(page, offset)
    }

    /// Log every outstanding request
    pub fn debug_dump(&self) {
        let inner = self.inner.lock();
        log::info!(
            "page source: detached={} closed={}",
            inner.detached,
            inner.closed
        );
        for request_type in PageRequestType::ALL {
            for request in inner.outstanding[request_type.index()].values() {
                let rs = request.state.lock();
                let mut line: heapless::String<128> = heapless::String::new();
                let _ = write!(
                    line,
                    "  {} [{:#x}, {:#x}) pending={} overlap={}",
                    request_type.name(),
                    rs.offset,
                    rs.offset + rs.len,
                    rs.pending_size,
                    rs.overlap.len()
                );
                log::info!("{}", line);
            }
        }
    }

    #[cfg(test)]
    fn overlap_count(&self, request_type: PageRequestType, offset: u64) -> usize {
        let inner = self.inner.lock();
        inner.outstanding[request_type.index()]
            .get(&offset)
            .map_or(0, |r| r.state.lock().overlap.len())
    }
}

impl Drop for PageSource {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        for map in &inner.outstanding {
            debug_assert!(
                map.is_empty(),
                "page source dropped with outstanding requests"
            );
        }
    }
}
