//! The sequential pack/unpack/accumulate-unpack kernels: a synchronous, thread-safe-across-distinct-
//! requests tree walk over a fully host-resident buffer. Every GPU backend's device-side kernel
//! does the same walk against device memory; this is the one always-available fallback, and what
//! [`crate::backend::sim::SimBackend`] delegates the actual byte movement to.

use crate::{
    context::Context,
    error::{Error, Result},
    types::{predefined::PredefinedSeed, Payload, TypeNode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    BitAnd,
    BitOr,
    BitXor,
    Replace,
    NoOp,
}

/// Visits every contiguous byte span one instance of `ty` touches, rooted at `base`, in a fixed
/// traversal order. `pack` and `unpack` share this order so the Nth span produced while packing
/// lines up with the Nth span consumed while unpacking.
fn visit_spans(ty: &TypeNode, base: i64, f: &mut impl FnMut(i64, u64)) {
    match &ty.payload {
        Payload::Builtin { .. } => f(base, ty.size()),
        Payload::Contig { count, child } => {
            for k in 0..*count {
                visit_spans(child, base + k * child.extent(), f);
            }
        }
        Payload::Dup { child } | Payload::Resized { child } => visit_spans(child, base, f),
        Payload::Hvector {
            count,
            blocklength,
            stride,
            child,
        } => {
            for k in 0..*count {
                let block_base = base + k * stride;
                for b in 0..*blocklength {
                    visit_spans(child, block_base + b * child.extent(), f);
                }
            }
        }
        Payload::BlkHindx {
            blocklength,
            displacements,
            child,
        } => {
            for &d in displacements {
                for b in 0..*blocklength {
                    visit_spans(child, base + d + b * child.extent(), f);
                }
            }
        }
        Payload::Hindexed {
            blocklengths,
            displacements,
            child,
        } => {
            for (&blen, &d) in blocklengths.iter().zip(displacements) {
                for b in 0..blen {
                    visit_spans(child, base + d + b * child.extent(), f);
                }
            }
        }
        Payload::Struct {
            blocklengths,
            displacements,
            children,
        } => {
            for ((&blen, &d), c) in blocklengths.iter().zip(displacements).zip(children) {
                for b in 0..blen {
                    visit_spans(c, base + d + b * c.extent(), f);
                }
            }
        }
    }
}

fn leaf_seed(ty: &TypeNode) -> Option<PredefinedSeed> {
    match &ty.payload {
        Payload::Builtin { seed } => Some(*seed),
        Payload::Contig { child, .. }
        | Payload::Dup { child }
        | Payload::Resized { child }
        | Payload::Hvector { child, .. }
        | Payload::BlkHindx { child, .. }
        | Payload::Hindexed { child, .. } => leaf_seed(child),
        Payload::Struct { .. } => None,
    }
}

/// # Safety
/// `inbuf` must be valid for `count * ty.extent()` readable bytes and `outbuf` for the packed
/// size (`count * ty.size()` bytes, contiguous).
pub unsafe fn pack(ty: &TypeNode, count: usize, inbuf: *const u8, outbuf: *mut u8) -> Result<()> {
    let mut cursor = 0isize;
    for k in 0..count {
        visit_spans(ty, k as i64 * ty.extent(), &mut |offset, len| {
            std::ptr::copy_nonoverlapping(
                inbuf.offset(offset as isize),
                outbuf.offset(cursor),
                len as usize,
            );
            cursor += len as isize;
        });
    }
    Ok(())
}

/// # Safety
/// `inbuf` must be valid for the packed size readable bytes, `outbuf` for `count * ty.extent()`
/// writable bytes.
pub unsafe fn unpack(ty: &TypeNode, count: usize, inbuf: *const u8, outbuf: *mut u8) -> Result<()> {
    let mut cursor = 0isize;
    for k in 0..count {
        visit_spans(ty, k as i64 * ty.extent(), &mut |offset, len| {
            std::ptr::copy_nonoverlapping(
                inbuf.offset(cursor),
                outbuf.offset(offset as isize),
                len as usize,
            );
            cursor += len as isize;
        });
    }
    Ok(())
}

/// # Safety
/// Same preconditions as [`unpack`]; additionally every leaf reached must bottom out at a numeric
/// predefined seed unless `op` is [`ReduceOp::Replace`] or [`ReduceOp::NoOp`].
pub unsafe fn iacc_unpack(
    ty: &TypeNode,
    count: usize,
    op: ReduceOp,
    inbuf: *const u8,
    outbuf: *mut u8,
) -> Result<()> {
    if matches!(op, ReduceOp::Replace) {
        return unpack(ty, count, inbuf, outbuf);
    }
    if matches!(op, ReduceOp::NoOp) {
        return Ok(());
    }

    let seed = leaf_seed(ty).ok_or(Error::NotSupported)?;
    let mut cursor = 0isize;
    let mut fault = None;
    for k in 0..count {
        visit_spans(ty, k as i64 * ty.extent(), &mut |offset, len| {
            if fault.is_some() {
                return;
            }
            let src = std::slice::from_raw_parts(inbuf.offset(cursor), len as usize);
            let dst = std::slice::from_raw_parts_mut(outbuf.offset(offset as isize), len as usize);
            if let Err(e) = reduce_bytes(op, seed, dst, src) {
                fault = Some(e);
            }
            cursor += len as isize;
        });
    }
    fault.map_or(Ok(()), Err)
}

macro_rules! numeric_reduce {
    ($ty:ty, $op:expr, $dst:expr, $src:expr) => {{
        let dst: &mut [$ty] = bytemuck::cast_slice_mut($dst);
        let src: &[$ty] = bytemuck::cast_slice($src);
        for (d, s) in dst.iter_mut().zip(src) {
            *d = match $op {
                ReduceOp::Sum => *d + *s,
                ReduceOp::Prod => *d * *s,
                ReduceOp::Min => if *s < *d { *s } else { *d },
                ReduceOp::Max => if *s > *d { *s } else { *d },
                _ => return Err(Error::NotSupported),
            };
        }
        Ok(())
    }};
}

macro_rules! integer_reduce {
    ($ty:ty, $op:expr, $dst:expr, $src:expr) => {{
        let dst: &mut [$ty] = bytemuck::cast_slice_mut($dst);
        let src: &[$ty] = bytemuck::cast_slice($src);
        for (d, s) in dst.iter_mut().zip(src) {
            *d = match $op {
                ReduceOp::Sum => d.wrapping_add(*s),
                ReduceOp::Prod => d.wrapping_mul(*s),
                ReduceOp::Min => (*s).min(*d),
                ReduceOp::Max => (*s).max(*d),
                ReduceOp::BitAnd => *d & *s,
                ReduceOp::BitOr => *d | *s,
                ReduceOp::BitXor => *d ^ *s,
                ReduceOp::LogicalAnd => (((*d != 0) && (*s != 0)) as $ty),
                ReduceOp::LogicalOr => (((*d != 0) || (*s != 0)) as $ty),
                ReduceOp::LogicalXor => (((*d != 0) != (*s != 0)) as $ty),
                _ => return Err(Error::NotSupported),
            };
        }
        Ok(())
    }};
}

fn reduce_bytes(op: ReduceOp, seed: PredefinedSeed, dst: &mut [u8], src: &[u8]) -> Result<()> {
    use PredefinedSeed::*;
    match seed {
        Byte | UInt8 | Int8 | SignedChar | UnsignedChar | Char => integer_reduce!(u8, op, dst, src),
        Int16 | UInt16 => integer_reduce!(u16, op, dst, src),
        Int32 | UInt32 | WChar => integer_reduce!(u32, op, dst, src),
        Int64 | UInt64 | IntMax | UIntMax | Size | IntPtr | UIntPtr | PtrDiff => {
            integer_reduce!(u64, op, dst, src)
        }
        Float => numeric_reduce!(f32, op, dst, src),
        Double | LongDouble => numeric_reduce!(f64, op, dst, src),
        Bool => {
            let d = dst.first_mut().ok_or(Error::Internal)?;
            let s = *src.first().ok_or(Error::Internal)?;
            *d = match op {
                ReduceOp::LogicalAnd => ((*d != 0) && (s != 0)) as u8,
                ReduceOp::LogicalOr => ((*d != 0) || (s != 0)) as u8,
                ReduceOp::LogicalXor => ((*d != 0) != (s != 0)) as u8,
                _ => return Err(Error::NotSupported),
            };
            Ok(())
        }
        _ => Err(Error::NotSupported),
    }
}

/// Used by [`crate::dispatch`] to decide whether a request can even be attempted: the sequential
/// path handles every tree shape, so this always returns `true` for well-formed types. Kept as a
/// named entry point (rather than inlined as `true`) so a future backend-specific kernel can
/// narrow it without touching call sites.
pub fn pup_is_supported(_ty: &TypeNode, _ctx: &Context) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        info::Info,
        types::{create_hvector, HvectorParams},
    };

    #[test]
    fn pack_then_unpack_round_trips_a_vector() {
        let ctx = Context::create(&Info::create()).unwrap();
        let byte = ctx.predefined().byte();
        let ty_handle = create_hvector(
            &ctx,
            HvectorParams {
                count: 3,
                blocklength: 2,
                stride: 5,
            },
            byte,
        )
        .unwrap();
        let ty = ctx.resolve_type(ty_handle).unwrap();

        let source: Vec<u8> = (0..ty.extent() as usize).map(|i| i as u8).collect();
        let mut packed = vec![0u8; ty.size() as usize];
        let mut roundtrip = vec![0xffu8; ty.extent() as usize];

        unsafe {
            pack(&ty, 1, source.as_ptr(), packed.as_mut_ptr()).unwrap();
            unpack(&ty, 1, packed.as_ptr(), roundtrip.as_mut_ptr()).unwrap();
        }

        // Only the bytes the vector actually touches are required to match; the gaps the stride
        // skips over are untouched by unpack, so we only compare the touched spans.
        let mut touched = vec![];
        visit_spans(&ty, 0, &mut |offset, len| touched.push((offset as usize, len as usize)));
        for (offset, len) in touched {
            assert_eq!(source[offset..offset + len], roundtrip[offset..offset + len]);
        }
    }

    #[test]
    fn iacc_sum_accumulates_into_destination() {
        let ctx = Context::create(&Info::create()).unwrap();
        let i32_ty = ctx.predefined().int32();
        let ty = ctx.resolve_type(i32_ty).unwrap();

        let src = 7i32.to_ne_bytes();
        let mut dst = 3i32.to_ne_bytes();

        unsafe {
            iacc_unpack(&ty, 1, ReduceOp::Sum, src.as_ptr(), dst.as_mut_ptr()).unwrap();
        }
        assert_eq!(i32::from_ne_bytes(dst), 10);
    }

    #[test]
    fn no_op_leaves_destination_untouched() {
        let ctx = Context::create(&Info::create()).unwrap();
        let i32_ty = ctx.predefined().int32();
        let ty = ctx.resolve_type(i32_ty).unwrap();

        let src = 7i32.to_ne_bytes();
        let mut dst = 3i32.to_ne_bytes();
        unsafe {
            iacc_unpack(&ty, 1, ReduceOp::NoOp, src.as_ptr(), dst.as_mut_ptr()).unwrap();
        }
        assert_eq!(i32::from_ne_bytes(dst), 3);
    }
}
