//! The progress engine: advances every indirect (non-`H2H`) request a chunk at a time, bounded by
//! whatever temporary slab capacity is currently free.
//!
//! Every chunk moves data in two parts: an optional "real", `ty`-aware pack/unpack/accumulate-
//! unpack that runs wherever the strided side of the transfer lives, and an optional raw byte copy
//! (modeled as an `ipack`/`iunpack` of [`crate::types::ephemeral_bytes`], since a contiguous type's
//! pack/unpack degenerates to a plain `memcpy`) used to hop packed bytes across a boundary neither
//! side can reach directly. `device_slab`/`host_slab`/`finalize`/`event_intermediate` on
//! [`Chunk`](crate::request::Chunk) name the generic shape; which of them a given
//! [`RequestKind`](crate::request::RequestKind) actually uses is decided here. See DESIGN.md for
//! the per-kind leg table.
//!
//! Only the staged D2D kinds ever need a device-side scratch slab, to hold the compute kernel's
//! gather/scatter output on a device before it can be DMA'd across the host hop — every other
//! indirect kind either lands typed data at its final resting place directly or only ever needs the
//! pinned host slab.

pub(crate) mod slab;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[cfg(feature = "parking_lot")]
use parking_lot::Mutex;
#[cfg(not(feature = "parking_lot"))]
use std::sync::Mutex;

use crate::{
    backend::GpuDriver,
    config::SlabConfig,
    error::Error,
    kernel::{self, ReduceOp},
    request::{lock_indirect, Chunk, Finalize, IndirectState, Request, RequestKind, SlabKey, SlabReservation},
    types,
};
use slab::SlabRing;

#[cfg(feature = "parking_lot")]
fn lock(m: &Mutex<State>) -> parking_lot::MutexGuard<'_, State> {
    m.lock()
}
#[cfg(not(feature = "parking_lot"))]
fn lock(m: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    m.lock().unwrap()
}

/// One backing allocation plus the ring that tracks how much of it is in use: a pinned host
/// allocation for a `SlabKey::PinnedHost` ring, a device allocation for a `SlabKey::Gpu` one.
struct Ring {
    backend: Arc<dyn GpuDriver>,
    ring: SlabRing,
    base: *mut u8,
}

// SAFETY: `base` is a backend allocation used only through the slab ring's own bookkeeping, always
// behind `ProgressEngine`'s mutex; no aliasing reference to it escapes.
unsafe impl Send for Ring {}

struct State {
    queue: VecDeque<Arc<Request>>,
    rings: HashMap<SlabKey, Ring>,
    slab_config: SlabConfig,
}

unsafe impl Send for State {}

/// Owns every in-flight indirect request and the slab rings backing them. One lives on each
/// [`Context`](crate::context::Context); `request_test`/`request_wait` (in `api.rs`) call
/// [`poke`](ProgressEngine::poke) to drive it forward.
pub struct ProgressEngine {
    state: Mutex<State>,
}

impl ProgressEngine {
    pub(crate) fn new(slab_config: SlabConfig) -> Self {
        ProgressEngine {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                rings: HashMap::new(),
                slab_config,
            }),
        }
    }

    /// Registers a freshly dispatched indirect request and immediately tries to make progress on
    /// it, so a caller that never polls again still sees small requests complete inline.
    pub(crate) fn enqueue(&self, request: Arc<Request>) {
        lock(&self.state).queue.push_back(request);
        self.poke();
    }

    /// Reaps every chunk whose event has retired and issues new chunks against whatever slab
    /// capacity that freed up. Safe to call from any thread, any number of times; a request with
    /// nothing left to do is a no-op.
    pub fn poke(&self) {
        lock(&self.state).drive();
    }

    /// Blocks the calling thread on the oldest in-flight chunk of `request`, so `request_wait`
    /// doesn't busy-spin between pokes. A no-op for a trivial (`H2H`) request or one with nothing
    /// currently issued.
    pub(crate) fn synchronize_oldest(&self, request: &Request) {
        let Some(indirect) = &request.indirect else {
            return;
        };
        let st = lock_indirect(indirect);
        if let Some(chunk) = st.chunks.front() {
            chunk.backend.event_synchronize(chunk.event);
        }
    }
}

impl Drop for ProgressEngine {
    fn drop(&mut self) {
        let rings = std::mem::take(&mut lock(&self.state).rings);
        for (key, ring) in rings {
            match key {
                SlabKey::PinnedHost { .. } => ring.backend.free_host(ring.base),
                SlabKey::Gpu { device, .. } => ring.backend.free_device(device, ring.base),
            }
        }
    }
}

impl State {
    /// Advances only the head of the queue (spec.md §4.5/§5's "independent operations" invariant:
    /// subsequent requests never interleave chunk issue with the head, which bounds the work one
    /// `poke` does to a small constant regardless of how many requests are queued behind it). If
    /// the head finishes or fails during this call it's dequeued immediately; the new head, if
    /// any, only gets its turn on the *next* `poke`.
    fn drive(&mut self) {
        let Some(request) = self.queue.front().cloned() else {
            return;
        };
        let finished = match &request.indirect {
            None => true,
            Some(m) => {
                let mut st = lock_indirect(m);
                self.reap(&mut st);
                match self.issue(&mut st) {
                    Ok(()) => st.completed_elems >= st.total_elems && st.chunks.is_empty(),
                    Err(err) => {
                        request.fail(err);
                        true
                    }
                }
            }
        };
        if finished {
            if request.indirect.is_some() && request.error().is_none() {
                request.mark_complete();
            }
            self.queue.pop_front();
        }
    }

    fn ring_base(&self, key: SlabKey) -> *mut u8 {
        self.rings.get(&key).map(|r| r.base).unwrap_or(std::ptr::null_mut())
    }

    fn ring_mut(&mut self, key: SlabKey, backend: &Arc<dyn GpuDriver>) -> &mut Ring {
        let slab_config = self.slab_config;
        self.rings.entry(key).or_insert_with(|| {
            let size = match key {
                SlabKey::PinnedHost { .. } => slab_config.host_bytes,
                SlabKey::Gpu { .. } => slab_config.device_bytes,
            };
            let base = match key {
                SlabKey::PinnedHost { .. } => backend.malloc_host(size),
                SlabKey::Gpu { device, .. } => backend.malloc_device(device, size),
            }
            .expect("staging slab allocation");
            Ring {
                backend: Arc::clone(backend),
                ring: SlabRing::new(size),
                base,
            }
        })
    }

    /// The capacity of whichever ring `key` would use, without allocating it — lets `issue` reject
    /// a request up front (spec.md §8: "type `size > TMPBUF_SLAB_SIZE` ... → `NotSupported`")
    /// instead of allocating a slab it can then never make progress against.
    fn ring_capacity(&self, key: SlabKey) -> usize {
        match self.rings.get(&key) {
            Some(ring) => ring.ring.capacity(),
            None => match key {
                SlabKey::PinnedHost { .. } => self.slab_config.host_bytes,
                SlabKey::Gpu { .. } => self.slab_config.device_bytes,
            },
        }
    }

    fn release(&mut self, res: &SlabReservation) {
        if let Some(ring) = self.rings.get_mut(&res.key) {
            ring.ring.retire(res.len);
        }
    }

    fn reap(&mut self, st: &mut IndirectState) {
        while let Some(front) = st.chunks.front() {
            if !front.backend.event_poll(front.event) {
                break;
            }
            let chunk = st.chunks.pop_front().expect("front just matched Some");

            if let Some(slab) = &chunk.device_slab {
                self.release(slab);
            }

            match &chunk.finalize {
                Finalize::None => {}
                Finalize::CopyPackedToOutbuf { host_offset, len } => {
                    let slab = chunk.host_slab.as_ref().expect("CopyPackedToOutbuf needs a host slab");
                    let src = self.ring_base(slab.key).wrapping_add(slab.offset);
                    let dst = (st.outbuf as *mut u8).wrapping_add(*host_offset);
                    // SAFETY: `src` is `len` bytes inside a live slab reservation; `dst` is the
                    // caller's `outbuf` at the byte range this chunk owns exclusively.
                    unsafe { std::ptr::copy_nonoverlapping(src, dst, *len) };
                }
                Finalize::UnpackPackedToOutbuf { host_offset } => {
                    let slab = chunk.host_slab.as_ref().expect("UnpackPackedToOutbuf needs a host slab");
                    let packed = self.ring_base(slab.key).wrapping_add(slab.offset);
                    let typed = (st.outbuf as *mut u8)
                        .wrapping_offset(chunk.elem_offset as isize * st.ty.extent() as isize);
                    let _ = *host_offset;
                    // SAFETY: `packed` holds `chunk.elems` packed elements of `st.ty`; `typed`
                    // points at the caller's `outbuf` at this chunk's element range.
                    let result = unsafe {
                        match st.op {
                            None => kernel::unpack(&st.ty, chunk.elems as usize, packed, typed),
                            Some(op) => kernel::iacc_unpack(&st.ty, chunk.elems as usize, op, packed, typed),
                        }
                    };
                    if let Err(err) = result {
                        log::warn!("dtpack: finalize unpack failed: {err}");
                    }
                }
            }

            if let Some(slab) = &chunk.host_slab {
                self.release(slab);
            }

            st.completed_elems += chunk.elems;
        }
    }

    fn issue(&mut self, st: &mut IndirectState) -> Result<(), Error> {
        while st.issued_elems < st.total_elems {
            let remaining = st.total_elems - st.issued_elems;
            let elem_size = st.ty.size().max(1);

            let host_key = needs_host_slab(st.kind, st.op).then(|| SlabKey::pinned_host(&st.backend));
            let device_owner = device_slab_owner(st);
            let mut max_elems = remaining;

            if let Some(key) = host_key {
                let backend = Arc::clone(&st.backend);
                let ring = self.ring_mut(key, &backend);
                let cap_bytes = ring.ring.peek_alloc_len((max_elems * elem_size) as usize) as u64;
                max_elems = max_elems.min(cap_bytes / elem_size);
            }
            if let Some((key, backend)) = &device_owner {
                let ring = self.ring_mut(*key, backend);
                let cap_bytes = ring.ring.peek_alloc_len((max_elems * elem_size) as usize) as u64;
                max_elems = max_elems.min(cap_bytes / elem_size);
            }

            if max_elems == 0 {
                // Nothing issued yet for this request and both rings are fully free (not merely
                // saturated by someone else's in-flight chunks): the type itself can never fit
                // even a completely empty slab, so no amount of waiting will help. spec.md §8:
                // "type size > TMPBUF_SLAB_SIZE and route would require the [...] slab ->
                // NOT_SUPPORTED".
                if st.chunks.is_empty() {
                    let host_fits = host_key.map_or(true, |key| elem_size <= self.ring_capacity(key) as u64);
                    let device_fits = device_owner
                        .as_ref()
                        .map_or(true, |(key, _)| elem_size <= self.ring_capacity(*key) as u64);
                    if !host_fits || !device_fits {
                        return Err(Error::NotSupported);
                    }
                }
                break;
            }

            let host_slab = host_key.map(|key| {
                let backend = Arc::clone(&st.backend);
                let ring = self.ring_mut(key, &backend);
                let (offset, len) = ring
                    .ring
                    .try_alloc((max_elems * elem_size) as usize)
                    .expect("peek_alloc_len already reserved this capacity");
                SlabReservation { key, offset, len }
            });
            let device_slab = device_owner.map(|(key, backend)| {
                let ring = self.ring_mut(key, &backend);
                let (offset, len) = ring
                    .ring
                    .try_alloc((max_elems * elem_size) as usize)
                    .expect("peek_alloc_len already reserved this capacity");
                SlabReservation { key, offset, len }
            });

            let elem_offset = st.issued_elems;
            let chunk = issue_chunk(self, st, elem_offset, max_elems, host_slab, device_slab);
            st.issued_elems += max_elems;
            st.chunks.push_back(chunk);
        }
        Ok(())
    }
}

/// For the two staged-D2D kinds, which backend/device owns the device-side scratch slab the
/// compute kernel gathers into (`Pack`) or scatters out of (`Unpack`) before/after the host hop —
/// always the device the `ty`-aware kernel actually runs on. `None` for every other kind.
fn device_slab_owner(st: &IndirectState) -> Option<(SlabKey, Arc<dyn GpuDriver>)> {
    use RequestKind::*;
    match st.kind {
        D2DStagedPack => Some((SlabKey::gpu(&st.backend, st.device), Arc::clone(&st.backend))),
        D2DStagedUnpack => {
            let dest = st.dest_backend.clone()?;
            let key = SlabKey::gpu(&dest, st.dest_device);
            Some((key, dest))
        }
        _ => None,
    }
}

/// Whether a kind needs a pinned host staging buffer at all. `false` for every kind where at
/// least one side is already directly DMA-reachable from the other (same-device, p2p-connected
/// devices, or a `RegisteredHost`/`Managed` pointer a backend can target without staging) and for
/// plain (non-accumulate) `D2RHUnpack`, whose single backend call already lands typed data at its
/// final `RegisteredHost` destination.
fn needs_host_slab(kind: RequestKind, op: Option<ReduceOp>) -> bool {
    use RequestKind::*;
    match kind {
        H2H | D2RHPack | RH2DPack | RH2DUnpack | D2DSinglePack | D2DSingleUnpack | D2DIpcPack
        | D2DIpcUnpack => false,
        D2RHUnpack => op.is_some(),
        D2URHPack | D2URHUnpack | URH2DPack | URH2DUnpack | D2DStagedPack | D2DStagedUnpack => true,
    }
}

fn elem_ptr(base: usize, elem_offset: u64, stride: i64) -> *mut u8 {
    (base as *mut u8).wrapping_offset(elem_offset as isize * stride as isize)
}

/// Builds and issues the single chunk covering `[elem_offset, elem_offset + elems)` of `st`,
/// returning it once every backend call it needs has been posted. Synchronous CPU legs (a plain
/// pack of host-resident typed data, or a host-to-host memcpy) run inline here, before the chunk
/// is returned; only the final device-touching leg is tracked via an event.
fn issue_chunk(
    progress: &mut State,
    st: &IndirectState,
    elem_offset: u64,
    elems: u64,
    host_slab: Option<SlabReservation>,
    device_slab: Option<SlabReservation>,
) -> Chunk {
    use RequestKind::*;

    let host_ptr = host_slab.as_ref().map(|s| progress.ring_base(s.key).wrapping_add(s.offset));
    let device_ptr = device_slab.as_ref().map(|s| progress.ring_base(s.key).wrapping_add(s.offset));
    let byte_len = (elems * st.ty.size()) as usize;
    let host_offset = host_slab.as_ref().map(|s| (elem_offset * st.ty.size()) as usize).unwrap_or(0);

    let (backend, event, event_intermediate, finalize) = match st.kind {
        D2RHPack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.extent());
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.size() as i64);
            let event = st
                .backend
                .ipack(st.device, &st.ty, inbuf, outbuf, elems as usize)
                .expect("backend ipack");
            (Arc::clone(&st.backend), event, None, Finalize::None)
        }
        D2RHUnpack if st.op.is_none() => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.size() as i64);
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.extent());
            let event = st
                .backend
                .iunpack(st.device, &st.ty, inbuf, outbuf, elems as usize)
                .expect("backend iunpack");
            (Arc::clone(&st.backend), event, None, Finalize::None)
        }
        D2RHUnpack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.size() as i64);
            let scratch = types::ephemeral_bytes(byte_len as u64);
            let event = st
                .backend
                .iunpack(st.device, &scratch, inbuf, host_ptr.unwrap(), 1)
                .expect("backend raw copy");
            (
                Arc::clone(&st.backend),
                event,
                None,
                Finalize::UnpackPackedToOutbuf { host_offset },
            )
        }
        D2URHPack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.extent());
            let event = st
                .backend
                .ipack(st.device, &st.ty, inbuf, host_ptr.unwrap(), elems as usize)
                .expect("backend ipack");
            (
                Arc::clone(&st.backend),
                event,
                None,
                Finalize::CopyPackedToOutbuf { host_offset, len: byte_len },
            )
        }
        D2URHUnpack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.size() as i64);
            let scratch = types::ephemeral_bytes(byte_len as u64);
            let event = st
                .backend
                .iunpack(st.device, &scratch, inbuf, host_ptr.unwrap(), 1)
                .expect("backend raw copy");
            (
                Arc::clone(&st.backend),
                event,
                None,
                Finalize::UnpackPackedToOutbuf { host_offset },
            )
        }
        RH2DPack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.extent());
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.size() as i64);
            let event = st
                .backend
                .ipack(st.device, &st.ty, inbuf, outbuf, elems as usize)
                .expect("backend ipack");
            (Arc::clone(&st.backend), event, None, Finalize::None)
        }
        RH2DUnpack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.size() as i64);
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.extent());
            let event = st
                .backend
                .iunpack(st.device, &st.ty, inbuf, outbuf, elems as usize)
                .expect("backend iunpack");
            (Arc::clone(&st.backend), event, None, Finalize::None)
        }
        URH2DPack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.extent());
            // SAFETY: `inbuf` holds `elems` elements of `st.ty` in plain host memory; `host_ptr`
            // is a live reservation of at least `byte_len` bytes.
            unsafe { kernel::pack(&st.ty, elems as usize, inbuf, host_ptr.unwrap()) }.expect("host pack");
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.size() as i64);
            let scratch = types::ephemeral_bytes(byte_len as u64);
            let event = st
                .backend
                .ipack(st.device, &scratch, host_ptr.unwrap(), outbuf, 1)
                .expect("backend raw copy");
            (Arc::clone(&st.backend), event, None, Finalize::None)
        }
        URH2DUnpack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.size() as i64);
            // SAFETY: `inbuf` holds `byte_len` packed bytes in plain host memory; `host_ptr` is a
            // live reservation of at least that many bytes.
            unsafe { std::ptr::copy_nonoverlapping(inbuf, host_ptr.unwrap(), byte_len) };
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.extent());
            let event = st
                .backend
                .iunpack(st.device, &st.ty, host_ptr.unwrap(), outbuf, elems as usize)
                .expect("backend iunpack");
            (Arc::clone(&st.backend), event, None, Finalize::None)
        }
        D2DSinglePack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.extent());
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.size() as i64);
            let event = st
                .backend
                .ipack(st.device, &st.ty, inbuf, outbuf, elems as usize)
                .expect("backend ipack");
            (Arc::clone(&st.backend), event, None, Finalize::None)
        }
        D2DSingleUnpack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.size() as i64);
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.extent());
            let event = st
                .backend
                .iunpack(st.device, &st.ty, inbuf, outbuf, elems as usize)
                .expect("backend iunpack");
            (Arc::clone(&st.backend), event, None, Finalize::None)
        }
        D2DIpcPack => {
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.extent());
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.size() as i64);
            let event = st
                .backend
                .ipack(st.device, &st.ty, inbuf, outbuf, elems as usize)
                .expect("backend ipack (p2p)");
            (Arc::clone(&st.backend), event, None, Finalize::None)
        }
        D2DIpcUnpack => {
            let dest = st.dest_backend.clone().expect("D2DIpcUnpack always has a dest_backend");
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.size() as i64);
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.extent());
            let event = dest
                .iunpack(st.dest_device, &st.ty, inbuf, outbuf, elems as usize)
                .expect("backend iunpack (p2p)");
            (dest, event, None, Finalize::None)
        }
        D2DStagedPack => {
            // Leg 1: the source device's compute kernel gathers the strided input into its own
            // local scratch slab — a real backend's pack kernel can only write device memory it
            // owns. Leg 2: a raw byte copy off that scratch into the pinned host slab, issued on
            // the same backend right after leg 1, so its event alone (tracked as the
            // intermediate) implies leg 1 has also retired. Leg 3, on the destination backend
            // once it has waited on that intermediate, is the same raw-copy hop from host to the
            // destination device's final buffer.
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.extent());
            let dslab = device_ptr.expect("D2DStagedPack always reserves a device slab");
            let _ = st
                .backend
                .ipack(st.device, &st.ty, inbuf, dslab, elems as usize)
                .expect("backend pack to device scratch");
            let scratch = types::ephemeral_bytes(byte_len as u64);
            let intermediate = st
                .backend
                .ipack(st.device, &scratch, dslab, host_ptr.unwrap(), 1)
                .expect("backend raw copy (device scratch to host)");
            let dest = st.dest_backend.clone().expect("D2DStagedPack always has a dest_backend");
            dest.add_dependency(intermediate);
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.size() as i64);
            let event = dest
                .ipack(st.dest_device, &scratch, host_ptr.unwrap(), outbuf, 1)
                .expect("backend raw copy (stage to device)");
            (
                dest,
                event,
                Some((Arc::clone(&st.backend), intermediate)),
                Finalize::None,
            )
        }
        D2DStagedUnpack => {
            // Symmetric with `D2DStagedPack`: leg 1 hops the packed bytes off the source device
            // into the pinned host slab (tracked as the intermediate); leg 2, once the
            // destination backend has waited on that, raw-copies them into its own device-local
            // scratch; leg 3, same backend right after (so only leg 3's event needs tracking),
            // scatters out of that scratch into the caller's strided output.
            let inbuf = elem_ptr(st.inbuf, elem_offset, st.ty.size() as i64);
            let scratch = types::ephemeral_bytes(byte_len as u64);
            let intermediate = st
                .backend
                .iunpack(st.device, &scratch, inbuf, host_ptr.unwrap(), 1)
                .expect("backend raw copy (stage to host)");
            let dest = st.dest_backend.clone().expect("D2DStagedUnpack always has a dest_backend");
            dest.add_dependency(intermediate);
            let dslab = device_ptr.expect("D2DStagedUnpack always reserves a device slab");
            let _ = dest
                .iunpack(st.dest_device, &scratch, host_ptr.unwrap(), dslab, 1)
                .expect("backend raw copy (host to device scratch)");
            let outbuf = elem_ptr(st.outbuf, elem_offset, st.ty.extent());
            let event = dest
                .iunpack(st.dest_device, &st.ty, dslab, outbuf, elems as usize)
                .expect("backend scatter from device scratch");
            (
                dest,
                event,
                Some((Arc::clone(&st.backend), intermediate)),
                Finalize::None,
            )
        }
        H2H => unreachable!("H2H never reaches the progress engine"),
    };

    Chunk {
        backend,
        event,
        event_intermediate,
        elem_offset,
        elems,
        device_slab,
        host_slab,
        finalize,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        backend::{sim::SimBackend, EventId},
        config::EngineConfig,
        context::Context,
        dispatch::{self, PupType},
        info::Info,
        ptr_attr::PtrAttr,
        types::create_contig,
    };

    /// Wraps a [`SimBackend`], reporting no peer-to-peer access to anything so a GPU-GPU transfer
    /// between two devices it's installed for always takes the staged path (spec.md §8 scenario 6)
    /// instead of the IPC one `SimBackend::check_p2p` would otherwise always allow.
    struct NoP2p(Arc<SimBackend>);

    impl GpuDriver for NoP2p {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn malloc_device(&self, device: i32, bytes: usize) -> crate::error::Result<*mut u8> {
            self.0.malloc_device(device, bytes)
        }
        fn malloc_host(&self, bytes: usize) -> crate::error::Result<*mut u8> {
            self.0.malloc_host(bytes)
        }
        fn free_device(&self, device: i32, ptr: *mut u8) {
            self.0.free_device(device, ptr)
        }
        fn free_host(&self, ptr: *mut u8) {
            self.0.free_host(ptr)
        }
        fn get_ptr_attr(&self, ptr: *const u8) -> Option<PtrAttr> {
            self.0.get_ptr_attr(ptr)
        }
        fn pup_is_supported(&self, ty: &types::TypeNode) -> bool {
            self.0.pup_is_supported(ty)
        }
        fn ipack(
            &self,
            device: i32,
            ty: &types::TypeNode,
            inbuf: *const u8,
            outbuf: *mut u8,
            count: usize,
        ) -> crate::error::Result<EventId> {
            self.0.ipack(device, ty, inbuf, outbuf, count)
        }
        fn iunpack(
            &self,
            device: i32,
            ty: &types::TypeNode,
            inbuf: *const u8,
            outbuf: *mut u8,
            count: usize,
        ) -> crate::error::Result<EventId> {
            self.0.iunpack(device, ty, inbuf, outbuf, count)
        }
        fn event_poll(&self, event: EventId) -> bool {
            self.0.event_poll(event)
        }
        fn event_synchronize(&self, event: EventId) {
            self.0.event_synchronize(event)
        }
        fn check_p2p(&self, _a: i32, _b: i32) -> bool {
            false
        }
        fn add_dependency(&self, event: EventId) {
            self.0.add_dependency(event)
        }
    }

    /// spec.md §8 scenario 6: a 256 KiB contiguous type moved between two devices with no p2p path
    /// and a 1 MiB slab on each side chunks into exactly 4 pieces (4 elements per chunk), retired
    /// strictly FIFO, each holding both a device-scratch and a pinned-host reservation while
    /// in flight, with both rings back to fully quiescent once the request completes.
    #[test]
    fn staged_d2d_transfer_chunks_through_a_bounded_slab() {
        let sim_src = Arc::new(SimBackend::new(0));
        let sim_dst = Arc::new(SimBackend::new(1));
        let src_backend: Arc<dyn GpuDriver> = Arc::new(NoP2p(Arc::clone(&sim_src)));
        let dst_backend: Arc<dyn GpuDriver> = Arc::clone(&sim_dst) as Arc<dyn GpuDriver>;

        let config = EngineConfig {
            slab: SlabConfig {
                host_bytes: 1024 * 1024,
                device_bytes: 1024 * 1024,
            },
        };
        let ctx = Context::create_with_config(
            &Info::create(),
            vec![Arc::clone(&src_backend), Arc::clone(&dst_backend)],
            config,
        )
        .unwrap();

        let byte = ctx.predefined().byte();
        let elem_size = 256 * 1024u64;
        let ty = create_contig(&ctx, elem_size, byte).unwrap();
        let elems = 16u64;
        let total = (elem_size * elems) as usize;

        let inbuf = sim_src.malloc_device(0, total).unwrap();
        let outbuf = sim_dst.malloc_device(1, total).unwrap();
        let info = Info::create();

        let request = dispatch::dispatch(&ctx, PupType::Pack, inbuf, outbuf, ctx.resolve_type(ty).unwrap(), 0, elems, None, &info).unwrap();
        assert_eq!(request.kind(), RequestKind::D2DStagedPack);

        let mut seen_offsets = Vec::new();
        while !request.is_complete() {
            {
                let st = lock_indirect(request.indirect.as_ref().unwrap());
                if let Some(front) = st.chunks.front() {
                    if seen_offsets.last() != Some(&front.elem_offset) {
                        assert!(front.device_slab.is_some(), "staged chunk always reserves a device slab");
                        assert!(front.host_slab.is_some(), "staged chunk always reserves a host slab");
                        seen_offsets.push(front.elem_offset);
                    }
                }
            }
            ctx.progress.poke();
        }
        assert!(request.error().is_none());
        assert_eq!(seen_offsets, vec![0, 4, 8, 12]);

        let engine_state = lock(&ctx.progress.state);
        let host_key = SlabKey::pinned_host(&src_backend);
        let device_key = SlabKey::gpu(&src_backend, 0);
        assert!(engine_state.rings[&host_key].ring.is_quiescent());
        assert!(engine_state.rings[&device_key].ring.is_quiescent());
    }

    /// spec.md §8: "type `size > TMPBUF_SLAB_SIZE` and the route would require staging through the
    /// slab -> `NOT_SUPPORTED`". A type bigger than the only slab a device-to-unregistered-host pack
    /// would need can never be chunked down, so the request fails immediately instead of hanging.
    #[test]
    fn oversized_type_reports_not_supported_instead_of_never_progressing() {
        let sim = Arc::new(SimBackend::new(0));
        let backend: Arc<dyn GpuDriver> = sim.clone();
        let config = EngineConfig {
            slab: SlabConfig {
                host_bytes: 1024,
                device_bytes: 1024,
            },
        };
        let ctx = Context::create_with_config(&Info::create(), vec![backend], config).unwrap();

        let byte = ctx.predefined().byte();
        let ty = create_contig(&ctx, 4096, byte).unwrap();
        let inbuf = sim.malloc_device(0, 4096).unwrap();
        let mut outbuf = vec![0u8; 4096];
        let info = Info::create();

        let request = dispatch::dispatch(
            &ctx,
            PupType::Pack,
            inbuf,
            outbuf.as_mut_ptr(),
            ctx.resolve_type(ty).unwrap(),
            0,
            1,
            None,
            &info,
        )
        .unwrap();

        assert!(request.is_complete());
        assert_eq!(request.error(), Some(Error::NotSupported));
    }
}
