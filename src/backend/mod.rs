//! The GPU driver capability record every concrete backend implements.
//!
//! Real CUDA/HIP/ZE bindings are out of scope (see `SPEC_FULL.md` §3) — this trait is the seam a
//! real backend would plug into, and [`sim::SimBackend`] is the one implementation shipped
//! in-tree, used to drive the progress engine end-to-end in tests.

pub mod sim;

use crate::{error::Result, ptr_attr::PtrAttr, types::TypeNode};

pub type EventId = u64;

/// One registered memory/compute backend. Implementations must be safe to share across the
/// progress engine's worker and whatever thread calls `request_test`/`request_wait`.
pub trait GpuDriver: Send + Sync {
    fn name(&self) -> &str;

    fn malloc_device(&self, device: i32, bytes: usize) -> Result<*mut u8>;
    fn malloc_host(&self, bytes: usize) -> Result<*mut u8>;
    fn free_device(&self, device: i32, ptr: *mut u8);
    fn free_host(&self, ptr: *mut u8);

    /// Classifies `ptr` if this backend owns it, `None` otherwise.
    fn get_ptr_attr(&self, ptr: *const u8) -> Option<PtrAttr>;

    /// Whether this backend's `ipack`/`iunpack` can handle `ty` at all. Requests on types this
    /// rejects fall back to the sequential kernel on a flattened copy, or fail with
    /// `NotSupported` if the type doesn't fit a temporary slab either.
    fn pup_is_supported(&self, ty: &TypeNode) -> bool;

    /// Issues an async pack of `count` elements of `ty` starting at `inbuf` into the contiguous
    /// `outbuf`. Returns an event that completes once the bytes have landed.
    fn ipack(
        &self,
        device: i32,
        ty: &TypeNode,
        inbuf: *const u8,
        outbuf: *mut u8,
        count: usize,
    ) -> Result<EventId>;

    /// Issues an async unpack of `count` elements of `ty` from the contiguous `inbuf` into `outbuf`.
    fn iunpack(
        &self,
        device: i32,
        ty: &TypeNode,
        inbuf: *const u8,
        outbuf: *mut u8,
        count: usize,
    ) -> Result<EventId>;

    /// Non-blocking completion check. `true` once the event has fired.
    fn event_poll(&self, event: EventId) -> bool;
    fn event_synchronize(&self, event: EventId);

    /// Whether device `a` can access device `b`'s memory directly.
    fn check_p2p(&self, a: i32, b: i32) -> bool;

    /// Orders the issuing stream's next operation after `event` without blocking the host.
    fn add_dependency(&self, event: EventId);
}
