//! The free functions implementing spec.md §6's client API.
//!
//! `ipack`/`iunpack`/`iacc` take the byte-granular offsets/counts the spec describes and turn them
//! into the element-offset/element-count calls [`crate::dispatch::dispatch`] understands — chunking
//! only ever happens on element boundaries (see the reduction-associativity note in spec.md §8), so
//! a byte offset or count that doesn't land on one is rejected rather than silently rounded.
//! `request_test`/`request_wait` are the caller's side of driving the progress engine.

use std::sync::Arc;

use crate::{
    context::Context,
    dispatch::{self, PupType},
    error::{Error, Result},
    handle,
    info::Info,
    kernel::ReduceOp,
    request::{Request, RequestKind},
    types::TypeNode,
};

fn resolve_type(ctx: &Context, type_handle: u64) -> Result<Arc<TypeNode>> {
    ctx.resolve_type(type_handle).ok_or(Error::BadArgs)
}

fn mint_request(ctx: &Context, request: Arc<Request>) -> u64 {
    let (object_id, _arc) = ctx.requests.alloc_existing(request);
    ctx.mint_request_handle(object_id)
}

fn trivial_request(ctx: &Context) -> u64 {
    mint_request(ctx, Arc::new(Request::already_complete(RequestKind::H2H)))
}

/// Packs up to `max_pack_bytes` bytes of the packed representation of `incount` elements of
/// `type_handle`, starting at packed-byte offset `inoffset`, from the typed `inbuf` into the
/// contiguous `outbuf`. Returns the number of bytes actually written and a request handle.
///
/// # Safety
/// `inbuf` must be valid for `incount` elements of the resolved type starting at element
/// `inoffset / type.size()`; `outbuf` for the returned byte count.
pub unsafe fn ipack(
    ctx: &Context,
    inbuf: *const u8,
    incount: u64,
    type_handle: u64,
    inoffset: u64,
    outbuf: *mut u8,
    max_pack_bytes: u64,
    info: &Info,
) -> Result<(u64, u64)> {
    let ty = resolve_type(ctx, type_handle)?;
    let elem_size = ty.size();
    if elem_size == 0 {
        return Ok((0, trivial_request(ctx)));
    }
    if inoffset % elem_size != 0 {
        return Err(Error::BadArgs);
    }
    let total_bytes = incount.checked_mul(elem_size).ok_or(Error::BadArgs)?;
    let available = total_bytes.checked_sub(inoffset).ok_or(Error::BadArgs)?;
    let capped = max_pack_bytes.min(available);
    let nelems = capped / elem_size;
    let elem_offset = inoffset / elem_size;

    let request = dispatch::dispatch(ctx, PupType::Pack, inbuf, outbuf, ty, elem_offset, nelems, None, info)?;
    Ok((nelems * elem_size, mint_request(ctx, request)))
}

/// Unpacks the `insize`-byte packed stream at `inbuf` into `outcount` elements of `type_handle`
/// starting at packed-byte offset `outoffset` in the typed `outbuf`. On success the number of bytes
/// consumed always equals `insize` — a non-element-multiple `insize` is rejected up front instead.
///
/// # Safety
/// `inbuf` must be valid for `insize` bytes; `outbuf` for `outcount` elements of the resolved type.
pub unsafe fn iunpack(
    ctx: &Context,
    inbuf: *const u8,
    insize: u64,
    outbuf: *mut u8,
    outcount: u64,
    type_handle: u64,
    outoffset: u64,
    info: &Info,
) -> Result<(u64, u64)> {
    let (elem_offset, nelems, ty) = unpack_range(ctx, type_handle, insize, outcount, outoffset)?;
    if nelems == 0 {
        return Ok((0, trivial_request(ctx)));
    }
    let request = dispatch::dispatch(ctx, PupType::Unpack, inbuf, outbuf, ty, elem_offset, nelems, None, info)?;
    Ok((insize, mint_request(ctx, request)))
}

/// `iunpack`'s reducing counterpart: the packed stream at `inbuf` is combined into the existing
/// contents of `outbuf` with `op` instead of overwriting them. Only transports whose typed
/// destination is CPU-addressable support this — see `dispatch::dispatch`'s accumulate gate.
///
/// A no-op reduction (zero elements) never touches `outbuf`, so unlike `ipack`/`iunpack` it doesn't
/// mint a real request — it hands back the reserved null handle outright.
///
/// # Safety
/// Same preconditions as [`iunpack`].
pub unsafe fn iacc(
    ctx: &Context,
    inbuf: *const u8,
    insize: u64,
    outbuf: *mut u8,
    outcount: u64,
    type_handle: u64,
    outoffset: u64,
    op: ReduceOp,
    info: &Info,
) -> Result<(u64, u64)> {
    let (elem_offset, nelems, ty) = unpack_range(ctx, type_handle, insize, outcount, outoffset)?;
    if nelems == 0 {
        return Ok((0, handle::NULL_HANDLE));
    }
    let request = dispatch::dispatch(
        ctx,
        PupType::Unpack,
        inbuf,
        outbuf,
        ty,
        elem_offset,
        nelems,
        Some(op),
        info,
    )?;
    Ok((insize, mint_request(ctx, request)))
}

fn unpack_range(
    ctx: &Context,
    type_handle: u64,
    insize: u64,
    outcount: u64,
    outoffset: u64,
) -> Result<(u64, u64, Arc<TypeNode>)> {
    let ty = resolve_type(ctx, type_handle)?;
    let elem_size = ty.size();
    if elem_size == 0 {
        return Ok((0, 0, ty));
    }
    if outoffset % elem_size != 0 || insize % elem_size != 0 {
        return Err(Error::BadArgs);
    }
    let total_bytes = outcount.checked_mul(elem_size).ok_or(Error::BadArgs)?;
    let end = outoffset.checked_add(insize).ok_or(Error::BadArgs)?;
    if end > total_bytes {
        return Err(Error::BadArgs);
    }
    Ok((outoffset / elem_size, insize / elem_size, ty))
}

/// Drives the progress engine once and reports whether `request_handle` has completed. Surfaces
/// an error the progress engine gave up on (spec.md §7) instead of reporting plain completion.
pub fn request_test(ctx: &Context, request_handle: u64) -> Result<bool> {
    let request = ctx.resolve_request(request_handle).ok_or(Error::BadArgs)?;
    ctx.progress.poke();
    if let Some(err) = request.error() {
        return Err(err);
    }
    Ok(request.is_complete())
}

/// Blocks until `request_handle` completes, alternating nonblocking progress pokes with a blocking
/// wait on the oldest in-flight chunk's backend event so the caller doesn't busy-spin. Surfaces an
/// error the progress engine gave up on (spec.md §7) instead of reporting plain completion.
pub fn request_wait(ctx: &Context, request_handle: u64) -> Result<()> {
    let request = ctx.resolve_request(request_handle).ok_or(Error::BadArgs)?;
    while !request.is_complete() {
        ctx.progress.poke();
        if request.is_complete() {
            break;
        }
        ctx.progress.synchronize_oldest(&request);
    }
    if let Some(err) = request.error() {
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::Context,
        types::{create_hvector, HvectorParams},
    };

    #[test]
    fn pack_then_unpack_round_trips_through_the_public_api() {
        let ctx = Context::create(&Info::create()).unwrap();
        let byte = ctx.predefined().byte();
        let ty = create_hvector(
            &ctx,
            HvectorParams {
                count: 3,
                blocklength: 2,
                stride: 4,
            },
            byte,
        )
        .unwrap();
        let node = ctx.resolve_type(ty).unwrap();

        let source: Vec<u8> = (0..node.extent() as usize).map(|i| i as u8).collect();
        let mut packed = vec![0u8; node.size() as usize];
        let mut roundtrip = vec![0xffu8; node.extent() as usize];

        let info = Info::create();
        unsafe {
            let (n, req) = ipack(
                &ctx,
                source.as_ptr(),
                1,
                ty,
                0,
                packed.as_mut_ptr(),
                node.size(),
                &info,
            )
            .unwrap();
            assert_eq!(n, node.size());
            request_wait(&ctx, req).unwrap();

            let (n, req) = iunpack(
                &ctx,
                packed.as_ptr(),
                node.size(),
                roundtrip.as_mut_ptr(),
                1,
                ty,
                0,
                &info,
            )
            .unwrap();
            assert_eq!(n, node.size());
            request_wait(&ctx, req).unwrap();
        }

        assert_eq!(&roundtrip[0..2], &source[0..2]);
        assert_eq!(&roundtrip[4..6], &source[4..6]);
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let ctx = Context::create(&Info::create()).unwrap();
        let int32 = ctx.predefined().int32();
        let mut buf = [0u8; 8];
        let info = Info::create();
        let err = unsafe { ipack(&ctx, buf.as_ptr(), 2, int32, 1, buf.as_mut_ptr(), 4, &info) }.unwrap_err();
        assert_eq!(err, Error::BadArgs);
    }

    #[test]
    fn request_test_reports_trivial_requests_complete_immediately() {
        let ctx = Context::create(&Info::create()).unwrap();
        let int32 = ctx.predefined().int32();
        let src = 0i32.to_ne_bytes();
        let mut dst = 0i32.to_ne_bytes();
        let info = Info::create();
        let (_, req) =
            unsafe { ipack(&ctx, src.as_ptr(), 1, int32, 0, dst.as_mut_ptr(), 4, &info) }.unwrap();
        assert!(request_test(&ctx, req).unwrap());
    }

    #[test]
    fn no_op_accumulate_returns_the_null_handle() {
        let ctx = Context::create(&Info::create()).unwrap();
        let int32 = ctx.predefined().int32();
        let src = 7i32.to_ne_bytes();
        let mut dst = 0i32.to_ne_bytes();
        let info = Info::create();
        // outcount=0 forces unpack_range's nelems == 0 branch.
        let (n, req) = unsafe {
            iacc(
                &ctx,
                src.as_ptr(),
                0,
                dst.as_mut_ptr(),
                0,
                int32,
                0,
                ReduceOp::Sum,
                &info,
            )
        }
        .unwrap();
        assert_eq!(n, 0);
        assert_eq!(req, handle::NULL_HANDLE);
    }
}
