//! Page Providers
//!
//! The external supplier of page contents (e.g. a user-mode pager). The
//! page source consumes this narrow interface and nothing else; replies
//! come back asynchronously through `PageSource::on_pages_supplied`,
//! `on_pages_dirtied` and `on_pages_failed`.

use alloc::sync::Arc;

use crate::kern::event::Event;
use crate::types::Status;
use crate::vm::page_request::{PageRequestType, RequestCore};
use crate::vm::{Page, PageList};

/// Static capability descriptor for a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderProperties {
    pub supports_read: bool,
    pub supports_dirty: bool,
    pub supports_writeback: bool,
}

impl ProviderProperties {
    pub const fn read_only() -> Self {
        Self {
            supports_read: true,
            supports_dirty: false,
            supports_writeback: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            supports_read: true,
            supports_dirty: true,
            supports_writeback: false,
        }
    }

    pub fn supports(&self, request_type: PageRequestType) -> bool {
        match request_type {
            PageRequestType::Read => self.supports_read,
            PageRequestType::Dirty => self.supports_dirty,
            PageRequestType::Writeback => self.supports_writeback,
        }
    }
}

/// Asynchronous backing-store interface consumed by [`PageSource`].
///
/// The source invokes these while holding its own lock; implementations
/// must not call back into the source synchronously. Progress is reported
/// asynchronously via the source's `on_pages_*` entry points.
///
/// [`PageSource`]: crate::vm::page_source::PageSource
pub trait PageProvider: Send + Sync {
    fn properties(&self) -> ProviderProperties;

    fn supports_page_request_type(&self, request_type: PageRequestType) -> bool {
        self.properties().supports(request_type)
    }

    /// Begin servicing a request; the provider holds a reference until the
    /// range is supplied, failed, cleared or swapped
    fn send_async_request(&self, request: &Arc<RequestCore>);

    /// Drop a previously sent request without completing it
    fn clear_async_request(&self, request: &Arc<RequestCore>);

    /// Atomically replace a tracked request with another for the same range
    fn swap_async_request(&self, old: &Arc<RequestCore>, new: &Arc<RequestCore>);

    /// Block the caller on a request's completion event
    fn wait_on_event(&self, event: &Event) -> Status {
        event.wait()
    }

    /// Release pages the source no longer needs
    fn free_pages(&self, _pages: &mut PageList) {}

    /// Debug check that a page is consistent with the provider's view
    fn debug_is_page_ok(&self, _page: &Page, _offset: u64) -> bool {
        true
    }

    /// The source has detached; no further requests will arrive
    fn on_detach(&self);

    /// The source has closed; the provider may release its state
    fn on_close(&self);
}
