//! A software-simulated GPU backend: device memory is an ordinary heap allocation, and "events"
//! are a poll countdown rather than a real stream fence. Exists to drive the progress engine
//! end-to-end in tests without depending on real CUDA/HIP/ZE hardware or bindings.

use std::{
    alloc::{alloc, dealloc, Layout},
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;
#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

use super::{EventId, GpuDriver};
use crate::{
    error::{Error, Result},
    kernel,
    ptr_attr::{PointerKind, PtrAttr},
    types::TypeNode,
};

struct Region {
    base: usize,
    len: usize,
    device: Option<i32>,
}

struct State {
    regions: Vec<Region>,
    layouts: HashMap<usize, Layout>,
    /// Remaining `event_poll` calls before an event reports complete.
    pending: HashMap<EventId, u32>,
}

/// A single simulated device. `device_id` is the id this backend reports for every allocation it
/// makes; a test wiring up multiple simulated devices constructs one `SimBackend` per id.
pub struct SimBackend {
    device_id: i32,
    latency_polls: u32,
    next_event: AtomicU64,
    state: Mutex<State>,
}

#[cfg(feature = "parking_lot")]
fn lock(m: &Mutex<State>) -> parking_lot::MutexGuard<'_, State> {
    m.lock()
}
#[cfg(not(feature = "parking_lot"))]
fn lock(m: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    m.lock().unwrap()
}

impl SimBackend {
    pub fn new(device_id: i32) -> Self {
        Self::with_latency(device_id, 0)
    }

    /// `latency_polls` is how many `event_poll` calls an issued event takes to report complete —
    /// 0 completes on the very first poll. Tests exercising the progress engine's multi-pass
    /// behavior use a nonzero latency; everything else uses the default.
    pub fn with_latency(device_id: i32, latency_polls: u32) -> Self {
        SimBackend {
            device_id,
            latency_polls,
            next_event: AtomicU64::new(1),
            state: Mutex::new(State {
                regions: Vec::new(),
                layouts: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    fn alloc_region(&self, bytes: usize, device: Option<i32>) -> Result<*mut u8> {
        let layout = Layout::array::<u8>(bytes.max(1)).map_err(|_| Error::OutOfMemory)?;
        // SAFETY: layout has nonzero size (bytes.max(1)).
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(Error::OutOfMemory);
        }
        let mut state = lock(&self.state);
        state.regions.push(Region {
            base: ptr as usize,
            len: bytes,
            device,
        });
        state.layouts.insert(ptr as usize, layout);
        Ok(ptr)
    }

    fn free_region(&self, ptr: *mut u8) {
        let mut state = lock(&self.state);
        let addr = ptr as usize;
        state.regions.retain(|r| r.base != addr);
        if let Some(layout) = state.layouts.remove(&addr) {
            // SAFETY: `ptr` was allocated from `alloc` with this exact layout and is only freed once.
            unsafe { dealloc(ptr, layout) };
        }
    }

    fn next_event_id(&self) -> EventId {
        self.next_event.fetch_add(1, Ordering::Relaxed)
    }
}

impl GpuDriver for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }

    fn malloc_device(&self, device: i32, bytes: usize) -> Result<*mut u8> {
        self.alloc_region(bytes, Some(device))
    }

    fn malloc_host(&self, bytes: usize) -> Result<*mut u8> {
        self.alloc_region(bytes, None)
    }

    fn free_device(&self, _device: i32, ptr: *mut u8) {
        self.free_region(ptr);
    }

    fn free_host(&self, ptr: *mut u8) {
        self.free_region(ptr);
    }

    fn get_ptr_attr(&self, ptr: *const u8) -> Option<PtrAttr> {
        let state = lock(&self.state);
        let addr = ptr as usize;
        state
            .regions
            .iter()
            .find(|r| addr >= r.base && addr < r.base + r.len)
            .map(|r| match r.device {
                Some(device) => PtrAttr {
                    kind: PointerKind::Gpu,
                    device: Some(device),
                },
                None => PtrAttr {
                    kind: PointerKind::RegisteredHost,
                    device: None,
                },
            })
    }

    fn pup_is_supported(&self, _ty: &TypeNode) -> bool {
        true
    }

    fn ipack(
        &self,
        _device: i32,
        ty: &TypeNode,
        inbuf: *const u8,
        outbuf: *mut u8,
        count: usize,
    ) -> Result<EventId> {
        // SAFETY: caller guarantees inbuf/outbuf are valid for this pack per kernel::pack's contract.
        unsafe { kernel::pack(ty, count, inbuf, outbuf)? };
        let event = self.next_event_id();
        lock(&self.state).pending.insert(event, self.latency_polls);
        Ok(event)
    }

    fn iunpack(
        &self,
        _device: i32,
        ty: &TypeNode,
        inbuf: *const u8,
        outbuf: *mut u8,
        count: usize,
    ) -> Result<EventId> {
        // SAFETY: caller guarantees inbuf/outbuf are valid for this unpack per kernel::unpack's contract.
        unsafe { kernel::unpack(ty, count, inbuf, outbuf)? };
        let event = self.next_event_id();
        lock(&self.state).pending.insert(event, self.latency_polls);
        Ok(event)
    }

    fn event_poll(&self, event: EventId) -> bool {
        let mut state = lock(&self.state);
        match state.pending.get_mut(&event) {
            Some(0) => {
                state.pending.remove(&event);
                true
            }
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => true,
        }
    }

    fn event_synchronize(&self, event: EventId) {
        while !self.event_poll(event) {
            std::hint::spin_loop();
        }
    }

    fn check_p2p(&self, _a: i32, _b: i32) -> bool {
        true
    }

    fn add_dependency(&self, _event: EventId) {}
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        let addrs: Vec<usize> = lock(&self.state).regions.iter().map(|r| r.base).collect();
        for addr in addrs {
            self.free_region(addr as *mut u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_allocation_reports_gpu_kind() {
        let backend = SimBackend::new(3);
        let ptr = backend.malloc_device(3, 64).unwrap();
        let attr = backend.get_ptr_attr(ptr).unwrap();
        assert_eq!(attr.kind, PointerKind::Gpu);
        assert_eq!(attr.device, Some(3));
        backend.free_device(3, ptr);
    }

    #[test]
    fn host_allocation_reports_registered_host() {
        let backend = SimBackend::new(0);
        let ptr = backend.malloc_host(64).unwrap();
        assert_eq!(backend.get_ptr_attr(ptr).unwrap().kind, PointerKind::RegisteredHost);
        backend.free_host(ptr);
    }

    #[test]
    fn event_with_latency_needs_multiple_polls() {
        use crate::{context::Context, info::Info};

        let backend = SimBackend::with_latency(0, 2);
        let ctx = Context::create(&Info::create()).unwrap();
        let null_ty = ctx.resolve_type(ctx.predefined().null()).unwrap();

        // count = 0 so the walk never touches inbuf/outbuf; only the event's poll countdown
        // is under test here.
        let event = backend
            .ipack(0, &null_ty, std::ptr::null(), std::ptr::null_mut(), 0)
            .unwrap();
        assert!(!backend.event_poll(event));
        assert!(!backend.event_poll(event));
        assert!(backend.event_poll(event));
    }
}
