//! Page Requests
//!
//! One in-flight unit of "pages are needed in range X": a coalesced
//! `[offset, offset+len)` range of a single request type, the batch state
//! machine that lets it grow one page at a time, the overlap chain other
//! requests piggy-back on, and the event the requesting thread blocks on.
//!
//! `PageRequest` is the caller-owned handle; `RequestCore` is the shared
//! record the source and provider reference. A core with
//! `offset == UNINITIALIZED_OFFSET` is idle (never initialized, completed,
//! or cancelled) and may be initialized again.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::kern::event::Event;
use crate::types::Status;
use crate::vm::page_source::PageSource;

/// Offset sentinel for an idle request
pub const UNINITIALIZED_OFFSET: u64 = u64::MAX;

// ============================================================================
// Request Type
// ============================================================================

/// Kind of work a page request asks of the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PageRequestType {
    /// Supply page contents
    Read = 0,
    /// Acknowledge a clean-to-dirty transition
    Dirty = 1,
    /// Write dirty pages back to the store
    Writeback = 2,
}

impl PageRequestType {
    pub const COUNT: usize = 3;
    pub const ALL: [PageRequestType; Self::COUNT] =
        [Self::Read, Self::Dirty, Self::Writeback];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Dirty => "DIRTY",
            Self::Writeback => "WRITEBACK",
        }
    }
}

// ============================================================================
// Batch State
// ============================================================================

/// Batching mode of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Every populated page is sent immediately
    Unbatched,
    /// The caller is building a batch and will finalize it
    Accepting,
    /// The source batches internally; the caller only asked for page one
    Internal,
    /// The batch has been closed and handed to the provider
    Finalized,
}

/// Where the request currently lives in the source's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueState {
    NotQueued,
    /// Provider-owned, in the source's outstanding set
    InSource,
    /// Chained on another outstanding request's overlap list
    AsOverlap,
}

// ============================================================================
// Request Core
// ============================================================================

pub(crate) struct RequestState {
    pub src: Option<Arc<PageSource>>,
    pub request_type: PageRequestType,
    pub offset: u64,
    pub len: u64,
    /// Bytes the provider has yet to cover
    pub pending_size: u64,
    pub batch_state: BatchState,
    /// Batch state restored on (re-)init
    pub construction_batch_state: BatchState,
    pub queue_state: QueueState,
    pub provider_owned: bool,
    /// Requests resolved for free when this one completes, FIFO
    pub overlap: VecDeque<Arc<RequestCore>>,
    pub tag: heapless::String<32>,
}

/// Shared core of a page request
pub struct RequestCore {
    pub(crate) event: Event,
    pub(crate) state: spin::Mutex<RequestState>,
}

impl RequestCore {
    fn new(construction_batch_state: BatchState) -> Arc<Self> {
        Arc::new(Self {
            event: Event::new(),
            state: spin::Mutex::new(RequestState {
                src: None,
                request_type: PageRequestType::Read,
                offset: UNINITIALIZED_OFFSET,
                len: 0,
                pending_size: 0,
                batch_state: construction_batch_state,
                construction_batch_state,
                queue_state: QueueState::NotQueued,
                provider_owned: false,
                overlap: VecDeque::new(),
                tag: heapless::String::new(),
            }),
        })
    }

    /// Bind an idle core to a source and range start. Initializing a live
    /// request is a usage bug.
    pub(crate) fn init(
        &self,
        src: Arc<PageSource>,
        offset: u64,
        request_type: PageRequestType,
        tag: &str,
        internal_batching: bool,
    ) {
        let mut rs = self.state.lock();
        assert_eq!(
            rs.offset, UNINITIALIZED_OFFSET,
            "init of a live page request"
        );
        debug_assert_eq!(rs.queue_state, QueueState::NotQueued);
        debug_assert!(rs.overlap.is_empty());
        rs.src = Some(src);
        rs.request_type = request_type;
        rs.offset = offset;
        rs.len = 0;
        rs.pending_size = 0;
        rs.provider_owned = false;
        rs.batch_state = if internal_batching {
            BatchState::Internal
        } else {
            rs.construction_batch_state
        };
        rs.tag.clear();
        for c in tag.chars() {
            if rs.tag.push(c).is_err() {
                break;
            }
        }
        drop(rs);
        self.event.unsignal();
    }

    /// Reset range bookkeeping to the idle state; the source reference and
    /// signaled event survive so a late waiter still sees the outcome
    pub(crate) fn reset_locked(rs: &mut RequestState) {
        rs.offset = UNINITIALIZED_OFFSET;
        rs.len = 0;
        rs.pending_size = 0;
        rs.provider_owned = false;
        rs.queue_state = QueueState::NotQueued;
        rs.batch_state = rs.construction_batch_state;
    }

    // === Provider-visible accessors ===

    pub fn offset(&self) -> u64 {
        self.state.lock().offset
    }

    pub fn len(&self) -> u64 {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn request_type(&self) -> PageRequestType {
        self.state.lock().request_type
    }

    pub fn batch_state(&self) -> BatchState {
        self.state.lock().batch_state
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().offset != UNINITIALIZED_OFFSET
    }

    /// True while the provider holds this request for async fulfillment
    pub fn is_provider_owned(&self) -> bool {
        self.state.lock().provider_owned
    }

    pub fn tag(&self) -> heapless::String<32> {
        self.state.lock().tag.clone()
    }
}

// ============================================================================
// Page Request
// ============================================================================

/// Caller-owned handle to a page request; cancels itself on drop
pub struct PageRequest {
    core: Arc<RequestCore>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl PageRequest {
    /// A request that sends each populated page immediately
    pub fn new() -> Self {
        Self {
            core: RequestCore::new(BatchState::Unbatched),
        }
    }

    /// A request whose caller accumulates a batch and finalizes it
    pub fn new_batching() -> Self {
        Self {
            core: RequestCore::new(BatchState::Accepting),
        }
    }

    pub(crate) fn core(&self) -> &Arc<RequestCore> {
        &self.core
    }

    pub fn offset(&self) -> u64 {
        self.core.offset()
    }

    pub fn len(&self) -> u64 {
        self.core.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.core.is_initialized()
    }

    /// Block until the provider resolves the request.
    ///
    /// Must not be called while a batch is still accepting pages. Any
    /// outcome other than success or an interrupt-class status cancels the
    /// request as a cleanup safety net.
    pub fn wait(&self) -> Status {
        let (src, batch_state) = {
            let rs = self.core.state.lock();
            (rs.src.clone(), rs.batch_state)
        };
        assert!(
            batch_state != BatchState::Accepting,
            "wait on an unfinalized batch"
        );
        let Some(src) = src else {
            return Status::BadState;
        };
        let status = src.wait_on_request(&self.core);
        if !matches!(status, Status::Ok | Status::Retry | Status::Killed) {
            self.cancel();
        }
        status
    }

    /// Close an accepting batch and hand it to the provider
    pub fn finalize(&self) -> Result<(), Status> {
        let (src, batch_state) = {
            let rs = self.core.state.lock();
            (rs.src.clone(), rs.batch_state)
        };
        if batch_state != BatchState::Accepting {
            return Err(Status::BadState);
        }
        let Some(src) = src else {
            return Err(Status::BadState);
        };
        src.finalize_request(&self.core);
        Ok(())
    }

    /// Excise the request from all source and provider bookkeeping.
    /// Idempotent; a no-op after completion.
    pub fn cancel(&self) {
        let src = self.core.state.lock().src.clone();
        if let Some(src) = src {
            src.cancel_request(&self.core);
        }
    }
}

impl Drop for PageRequest {
    fn drop(&mut self) {
        self.cancel();
    }
}
