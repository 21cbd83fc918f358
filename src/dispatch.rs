//! The request dispatcher: classifies one `ipack`/`iunpack`/`iacc` call into one of the 15 request
//! kinds from spec.md §4.4, fast-paths the always-synchronous `H2H` case through the sequential
//! kernel, and hands every other kind to the progress engine as an indirect subrequest.

use std::sync::Arc;

use crate::{
    context::Context,
    error::{Error, Result},
    info::Info,
    kernel::{self, ReduceOp},
    ptr_attr::{self, PointerKind, PtrAttr},
    request::{IndirectState, Request, RequestKind},
    types::TypeNode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PupType {
    Pack,
    Unpack,
}

/// Which physical pointer plays which role in one transfer, independent of which memory kind
/// either side turns out to live in.
struct Roles {
    typed_ptr: usize,
    packed_ptr: usize,
}

fn roles(puptype: PupType, inbuf: usize, outbuf: usize) -> Roles {
    match puptype {
        PupType::Pack => Roles {
            typed_ptr: inbuf,
            packed_ptr: outbuf,
        },
        PupType::Unpack => Roles {
            typed_ptr: outbuf,
            packed_ptr: inbuf,
        },
    }
}

/// Folds `Managed` into the `RegisteredHost` bucket for routing purposes: both are DMA-reachable
/// without staging through a pinned slab, and spec.md's 15-kind table never distinguishes them.
/// Recorded as a deliberate simplification in DESIGN.md.
fn is_registered_like(kind: PointerKind) -> bool {
    matches!(kind, PointerKind::RegisteredHost | PointerKind::Managed)
}

/// Classifies `(inattr, outattr)` for a given `puptype` into one of the 15 request kinds,
/// following spec.md §4.4's table literally (the same `(inattr.kind, outattr.kind)` pair maps to
/// the same kind name under `Pack` and `Unpack` — only the suffix, and which physical argument is
/// "typed" vs "packed", differs). `in_backend` is consulted only for the GPU-GPU cross-device
/// `check_p2p` call; every other arm is a pure function of the two attrs.
fn classify(
    puptype: PupType,
    inattr: PtrAttr,
    outattr: PtrAttr,
    in_backend: Option<&Arc<dyn crate::backend::GpuDriver>>,
) -> Result<RequestKind> {
    use PointerKind::*;

    let in_host = matches!(inattr.kind, UnregisteredHost) || is_registered_like(inattr.kind);
    let out_host = matches!(outattr.kind, UnregisteredHost) || is_registered_like(outattr.kind);
    if in_host && out_host {
        return Ok(RequestKind::H2H);
    }

    let kind = match (puptype, inattr.kind, outattr.kind) {
        (PupType::Pack, Gpu, Gpu) => gpu_gpu_kind(in_attr_device(inattr, outattr)?, in_backend, true)?,
        (PupType::Unpack, Gpu, Gpu) => gpu_gpu_kind(in_attr_device(inattr, outattr)?, in_backend, false)?,
        (PupType::Pack, Gpu, out) if is_registered_like(out) => RequestKind::D2RHPack,
        (PupType::Unpack, Gpu, out) if is_registered_like(out) => RequestKind::D2RHUnpack,
        (PupType::Pack, Gpu, UnregisteredHost) => RequestKind::D2URHPack,
        (PupType::Unpack, Gpu, UnregisteredHost) => RequestKind::D2URHUnpack,
        (PupType::Pack, inn, Gpu) if is_registered_like(inn) => RequestKind::RH2DPack,
        (PupType::Unpack, inn, Gpu) if is_registered_like(inn) => RequestKind::RH2DUnpack,
        (PupType::Pack, UnregisteredHost, Gpu) => RequestKind::URH2DPack,
        (PupType::Unpack, UnregisteredHost, Gpu) => RequestKind::URH2DUnpack,
        _ => return Err(Error::Internal),
    };
    Ok(kind)
}

fn in_attr_device(in_attr: PtrAttr, out_attr: PtrAttr) -> Result<(i32, i32)> {
    match (in_attr.device, out_attr.device) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Error::Internal),
    }
}

fn gpu_gpu_kind(
    (in_dev, out_dev): (i32, i32),
    in_backend: Option<&Arc<dyn crate::backend::GpuDriver>>,
    pack: bool,
) -> Result<RequestKind> {
    if in_dev == out_dev {
        return Ok(if pack {
            RequestKind::D2DSinglePack
        } else {
            RequestKind::D2DSingleUnpack
        });
    }
    let backend = in_backend.ok_or(Error::Internal)?;
    if backend.check_p2p(in_dev, out_dev) {
        Ok(if pack {
            RequestKind::D2DIpcPack
        } else {
            RequestKind::D2DIpcUnpack
        })
    } else {
        Ok(if pack {
            RequestKind::D2DStagedPack
        } else {
            RequestKind::D2DStagedUnpack
        })
    }
}

/// Builds the request for one `ipack`/`iunpack`/`iacc` call. `elem_offset`/`nelems` describe the
/// already-offset-and-capped slice of `ty`-sized elements this call moves (see `api.rs` for how
/// `inoffset`/`max_pack_bytes` get turned into these).
pub(crate) fn dispatch(
    ctx: &Context,
    puptype: PupType,
    inbuf: *const u8,
    outbuf: *mut u8,
    ty: Arc<TypeNode>,
    elem_offset: u64,
    nelems: u64,
    op: Option<ReduceOp>,
    info: &Info,
) -> Result<Arc<Request>> {
    if nelems == 0 {
        return Ok(Arc::new(Request::already_complete(RequestKind::H2H)));
    }

    let forced_backend = info
        .get_str(crate::info::keys::GPU_DRIVER)
        .and_then(|name| ctx.backends().iter().find(|b| b.name() == name));

    let (probed_in_attr, in_backend) = ptr_attr::classify(ctx, inbuf);
    let (probed_out_attr, out_backend) = ptr_attr::classify(ctx, outbuf);
    let in_attr = info
        .get_str(crate::info::keys::CUDA_INBUF_PTR_ATTR)
        .and_then(ptr_attr::parse_attr)
        .unwrap_or(probed_in_attr);
    let out_attr = info
        .get_str(crate::info::keys::CUDA_OUTBUF_PTR_ATTR)
        .and_then(ptr_attr::parse_attr)
        .unwrap_or(probed_out_attr);
    let in_backend = forced_backend.cloned().or(in_backend);
    let out_backend = forced_backend.cloned().or(out_backend);

    let kind = classify(puptype, in_attr, out_attr, in_backend.as_ref())?;

    // Accumulating into a destination requires reading back the values already there, which only
    // this crate's CPU kernel knows how to do — so the typed destination must be CPU-addressable.
    // Every kind whose typed side ends up GPU-resident (the `*2D` kinds and both D2D flavors)
    // reports `NotSupported` for accumulate, same as a backend that never implemented reductions.
    if op.is_some() && !matches!(kind, RequestKind::H2H | RequestKind::D2RHUnpack | RequestKind::D2URHUnpack) {
        return Err(Error::NotSupported);
    }

    // `elem_offset` is this call's offset into the logical element stream (see `api.rs`); fold it
    // into both pointers now, by the stride appropriate to each one's role, so everything
    // downstream (the sequential kernel here, or the progress engine's own 0-based chunk offsets)
    // can treat `inbuf`/`outbuf` as already pointing at element 0 of this call.
    let Roles { typed_ptr, packed_ptr } = roles(puptype, inbuf as usize, outbuf as usize);
    let typed_base = (typed_ptr as *mut u8).wrapping_offset((elem_offset as i64 * ty.extent()) as isize);
    let packed_base =
        (packed_ptr as *mut u8).wrapping_offset((elem_offset as i64 * ty.size() as i64) as isize);
    let (inbuf, outbuf) = match puptype {
        PupType::Pack => (typed_base as *const u8, packed_base),
        PupType::Unpack => (packed_base as *const u8, typed_base),
    };

    if kind == RequestKind::H2H {
        run_sequential(puptype, &ty, nelems as usize, typed_base, packed_base, op)?;
        return Ok(Arc::new(Request::already_complete(RequestKind::H2H)));
    }

    let (backend, dest_backend, device, dest_device) = match kind {
        RequestKind::D2DIpcPack
        | RequestKind::D2DIpcUnpack
        | RequestKind::D2DStagedPack
        | RequestKind::D2DStagedUnpack => {
            let src = in_backend.ok_or(Error::Internal)?;
            let dst = out_backend.ok_or(Error::Internal)?;
            (src, Some(dst), in_attr.device.unwrap_or(0), out_attr.device.unwrap_or(0))
        }
        RequestKind::D2DSinglePack | RequestKind::D2DSingleUnpack => {
            let b = in_backend.ok_or(Error::Internal)?;
            let device = in_attr.device.unwrap_or(0);
            (b, None, device, device)
        }
        RequestKind::D2RHPack | RequestKind::D2URHPack => {
            let b = in_backend.ok_or(Error::Internal)?;
            let device = in_attr.device.unwrap_or(0);
            (b, None, device, device)
        }
        RequestKind::D2RHUnpack | RequestKind::D2URHUnpack => {
            let b = in_backend.ok_or(Error::Internal)?;
            let device = in_attr.device.unwrap_or(0);
            (b, None, device, device)
        }
        RequestKind::RH2DPack | RequestKind::URH2DPack => {
            let b = out_backend.ok_or(Error::Internal)?;
            let device = out_attr.device.unwrap_or(0);
            (b, None, device, device)
        }
        RequestKind::RH2DUnpack | RequestKind::URH2DUnpack => {
            let b = out_backend.ok_or(Error::Internal)?;
            let device = out_attr.device.unwrap_or(0);
            (b, None, device, device)
        }
        RequestKind::H2H => unreachable!(),
    };

    if !backend.pup_is_supported(&ty) {
        return Err(Error::NotSupported);
    }

    let state = IndirectState {
        kind,
        ty,
        op,
        inbuf: inbuf as usize,
        outbuf: outbuf as usize,
        backend,
        dest_backend,
        device,
        dest_device,
        total_elems: nelems,
        issued_elems: 0,
        completed_elems: 0,
        chunks: Default::default(),
    };

    let request = Arc::new(Request::indirect(kind, state));
    ctx.progress.enqueue(Arc::clone(&request));
    Ok(request)
}

fn run_sequential(
    puptype: PupType,
    ty: &TypeNode,
    nelems: usize,
    typed_buf: *mut u8,
    packed_buf: *mut u8,
    op: Option<ReduceOp>,
) -> Result<()> {
    // SAFETY: callers (`api::ipack`/`iunpack`/`iacc`) guarantee `typed_buf`/`packed_buf` are valid
    // for `nelems` elements of `ty`, per `kernel::{pack,unpack,iacc_unpack}`'s own contracts.
    unsafe {
        match (puptype, op) {
            (PupType::Pack, _) => kernel::pack(ty, nelems, typed_buf, packed_buf),
            (PupType::Unpack, None) => kernel::unpack(ty, nelems, packed_buf, typed_buf),
            (PupType::Unpack, Some(op)) => kernel::iacc_unpack(ty, nelems, op, packed_buf, typed_buf),
        }
    }
}
