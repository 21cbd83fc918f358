//! Requests: the handle a caller polls or waits on, and (for the indirect/chunked path) the state
//! the progress engine advances.
//!
//! One request represents exactly one `ipack`/`iunpack`/`iacc_unpack` call. The original's
//! subrequest *list* exists to support batched/collective operations spec.md's external interface
//! doesn't expose (ipack/iunpack/iacc each take one buffer pair and one type) — so a `Request`
//! here owns at most one indirect operation rather than a list of them; see DESIGN.md.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;
#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

use crate::{
    backend::{EventId, GpuDriver},
    error::Error,
    kernel::ReduceOp,
    types::TypeNode,
};

/// The 15-way classification from the pointer-kind pair at dispatch time. `H2H` is always
/// synchronous (the request it's attached to is already complete by the time it's visible to the
/// caller); every other kind names an indirect operation the progress engine chunks through a
/// temporary slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    H2H,
    D2DSinglePack,
    D2DSingleUnpack,
    D2DIpcPack,
    D2DIpcUnpack,
    D2DStagedPack,
    D2DStagedUnpack,
    D2RHPack,
    D2RHUnpack,
    D2URHPack,
    D2URHUnpack,
    RH2DPack,
    RH2DUnpack,
    URH2DPack,
    URH2DUnpack,
}

impl RequestKind {
    pub fn is_direct(self) -> bool {
        matches!(self, RequestKind::H2H)
    }

    pub fn is_staged(self) -> bool {
        matches!(self, RequestKind::D2DStagedPack | RequestKind::D2DStagedUnpack)
    }
}

/// A slab reservation a chunk is holding, to be released back into its ring at retirement.
/// `backend_id`/`device` together identify which of the progress engine's rings it came from —
/// see [`SlabKey`].
pub(crate) struct SlabReservation {
    pub key: SlabKey,
    pub offset: usize,
    pub len: usize,
}

/// What to do with a chunk's bytes once its terminal event has retired, for the transports where
/// the last hop can only run on the CPU (the destination is unregistered host memory, so no
/// backend DMA can reach it). `None` for every transport whose terminal backend call already
/// deposited bytes in their final resting place.
pub(crate) enum Finalize {
    None,
    /// The packed byte stream now sitting in the pinned host slab is the final output; copy it
    /// byte-for-byte into the user's unregistered `outbuf` (`PACK_D2URH`).
    CopyPackedToOutbuf { host_offset: usize, len: usize },
    /// The packed byte stream now sitting in the pinned host slab must be scattered into the
    /// user's unregistered, strided `outbuf` by walking the datatype tree (`UNPACK` counterpart
    /// of `D2URH` — the one spec.md's progress engine section calls out by name).
    UnpackPackedToOutbuf { host_offset: usize },
}

/// One issued-but-not-yet-retired unit of work against one or two temporary slabs.
///
/// Staged D2D chunks go through two events: `event_intermediate` (the source-device leg, landing
/// packed bytes in the pinned host slab) must fire before the host→device leg's dependency is
/// satisfied, after which `event` (the terminal one) is what the progress engine actually polls.
/// Every other kind only ever populates `event`.
pub(crate) struct Chunk {
    pub backend: Arc<dyn GpuDriver>,
    pub event: EventId,
    pub event_intermediate: Option<(Arc<dyn GpuDriver>, EventId)>,
    pub elem_offset: u64,
    pub elems: u64,
    pub device_slab: Option<SlabReservation>,
    pub host_slab: Option<SlabReservation>,
    pub finalize: Finalize,
}

/// Identifies one of the progress engine's slab rings. `backend_id` is an `Arc<dyn GpuDriver>`'s
/// pointer identity (stable for the backend's lifetime, which outlives every request that
/// references it) — rings are per-backend because two installed backends never share device
/// memory or a pinned-host allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SlabKey {
    PinnedHost { backend_id: usize },
    Gpu { backend_id: usize, device: i32 },
}

impl SlabKey {
    pub fn pinned_host(backend: &Arc<dyn GpuDriver>) -> Self {
        SlabKey::PinnedHost {
            backend_id: Arc::as_ptr(backend) as *const () as usize,
        }
    }

    pub fn gpu(backend: &Arc<dyn GpuDriver>, device: i32) -> Self {
        SlabKey::Gpu {
            backend_id: Arc::as_ptr(backend) as *const () as usize,
            device,
        }
    }
}

pub(crate) struct IndirectState {
    pub kind: RequestKind,
    pub ty: Arc<TypeNode>,
    pub op: Option<ReduceOp>,
    pub inbuf: usize,
    pub outbuf: usize,
    /// The backend owning the GPU-resident side of the transfer (the source for `*Pack` kinds
    /// whose `in` is GPU, the destination for `*Unpack` kinds whose `out` is GPU, etc).
    pub backend: Arc<dyn GpuDriver>,
    /// For `D2D_*` kinds, the backend owning the destination device, when it differs from
    /// `backend` (which then owns the source device). `None` for every single-device kind.
    pub dest_backend: Option<Arc<dyn GpuDriver>>,
    pub device: i32,
    pub dest_device: i32,
    pub total_elems: u64,
    pub issued_elems: u64,
    pub completed_elems: u64,
    pub chunks: std::collections::VecDeque<Chunk>,
}

pub struct Request {
    completion_counter: AtomicU32,
    kind: RequestKind,
    pub(crate) indirect: Option<Mutex<IndirectState>>,
    /// Set by the progress engine when it gives up on this request (spec.md §7: "errors
    /// encountered during progress are attached to the request and reported on the next
    /// `request_test`/`request_wait`"). `request_test`/`request_wait` surface this instead of
    /// reporting plain completion once it's set.
    error: Mutex<Option<Error>>,
}

#[cfg(feature = "parking_lot")]
pub(crate) fn lock_indirect(m: &Mutex<IndirectState>) -> parking_lot::MutexGuard<'_, IndirectState> {
    m.lock()
}
#[cfg(not(feature = "parking_lot"))]
pub(crate) fn lock_indirect(m: &Mutex<IndirectState>) -> std::sync::MutexGuard<'_, IndirectState> {
    m.lock().unwrap()
}

impl Request {
    /// A request that is already complete (the trivial/`H2H` fast path).
    pub(crate) fn already_complete(kind: RequestKind) -> Self {
        Request {
            completion_counter: AtomicU32::new(0),
            kind,
            indirect: None,
            error: Mutex::new(None),
        }
    }

    pub(crate) fn indirect(kind: RequestKind, state: IndirectState) -> Self {
        Request {
            completion_counter: AtomicU32::new(1),
            kind,
            indirect: Some(Mutex::new(state)),
            error: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn is_complete(&self) -> bool {
        self.completion_counter.load(Ordering::Acquire) == 0
    }

    pub(crate) fn mark_complete(&self) {
        self.completion_counter.store(0, Ordering::Release);
    }

    /// Attaches a terminal error and marks the request complete in the same step — once the
    /// progress engine gives up on a request there is nothing left to wait for.
    pub(crate) fn fail(&self, err: Error) {
        *lock_error(&self.error) = Some(err);
        self.mark_complete();
    }

    /// Takes the attached error, if any. `request_test`/`request_wait` surface this instead of
    /// plain completion; the error is left in place (not consumed) so a caller that calls either
    /// more than once keeps seeing it.
    pub fn error(&self) -> Option<Error> {
        *lock_error(&self.error)
    }
}

#[cfg(feature = "parking_lot")]
fn lock_error(m: &Mutex<Option<Error>>) -> parking_lot::MutexGuard<'_, Option<Error>> {
    m.lock()
}
#[cfg(not(feature = "parking_lot"))]
fn lock_error(m: &Mutex<Option<Error>>) -> std::sync::MutexGuard<'_, Option<Error>> {
    m.lock().unwrap()
}
