//! The datatype tree algebra: builtins and eight derived kinds, each with its invariants
//! (`size`, `extent`, `lb`/`ub`, `true_lb`/`true_ub`, `alignment`, `is_contig`, `num_contig`,
//! `tree_depth`) derived once at construction and frozen for the node's lifetime.
//!
//! A node owns its children through `Arc`, so freeing a handle is just dropping the pool's `Arc`:
//! when the last reference anywhere (pool slot or parent payload) goes away, `Drop` recurses
//! through the tree on its own. There is no separate manual refcount field — `Arc::strong_count`
//! already is the invariant spec.md's "refcount" talks about, and keeping a second bookkeeping
//! field in sync with it would only invite drift.

pub mod flatten;
pub mod predefined;

use std::sync::Arc;

use derive_builder::Builder;

use crate::{
    context::Context,
    error::{Error, Result},
};
use predefined::PredefinedSeed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Builtin,
    Contig,
    Dup,
    Resized,
    Hvector,
    BlkHindx,
    Hindexed,
    Struct,
}

#[derive(Debug)]
pub(crate) enum Payload {
    Builtin {
        seed: PredefinedSeed,
    },
    Contig {
        count: i64,
        child: Arc<TypeNode>,
    },
    Dup {
        child: Arc<TypeNode>,
    },
    Resized {
        child: Arc<TypeNode>,
    },
    Hvector {
        count: i64,
        blocklength: i64,
        stride: i64,
        child: Arc<TypeNode>,
    },
    BlkHindx {
        blocklength: i64,
        displacements: Vec<i64>,
        child: Arc<TypeNode>,
    },
    Hindexed {
        blocklengths: Vec<i64>,
        displacements: Vec<i64>,
        child: Arc<TypeNode>,
    },
    Struct {
        blocklengths: Vec<i64>,
        displacements: Vec<i64>,
        children: Vec<Arc<TypeNode>>,
    },
}

/// A node in the datatype tree. Every derived invariant is computed once, in the constructor that
/// builds the node, and never touched again.
#[derive(Debug)]
pub struct TypeNode {
    kind: TypeKind,
    pub(crate) is_predefined: bool,
    tree_depth: u32,
    alignment: u32,
    size: u64,
    extent: i64,
    lb: i64,
    ub: i64,
    true_lb: i64,
    true_ub: i64,
    is_contig: bool,
    num_contig: u64,
    pub(crate) payload: Payload,
}

impl TypeNode {
    pub fn kind(&self) -> TypeKind {
        self.kind
    }
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn extent(&self) -> i64 {
        self.extent
    }
    pub fn lb(&self) -> i64 {
        self.lb
    }
    pub fn ub(&self) -> i64 {
        self.ub
    }
    pub fn true_lb(&self) -> i64 {
        self.true_lb
    }
    pub fn true_ub(&self) -> i64 {
        self.true_ub
    }
    pub fn true_extent(&self) -> i64 {
        self.true_ub - self.true_lb
    }
    pub fn alignment(&self) -> u32 {
        self.alignment
    }
    pub fn is_contig(&self) -> bool {
        self.is_contig
    }
    pub fn num_contig(&self) -> u64 {
        self.num_contig
    }
    pub fn tree_depth(&self) -> u32 {
        self.tree_depth
    }
}

/// Sorts `(start, len)` intervals and checks they tile with no gaps and no overlaps. Returns
/// `Some((origin, total_len))` on success. Used to decide whether an indexed/struct node happens
/// to be fully contiguous; when it doesn't tile cleanly we fall back to the safe (non-contiguous,
/// summed) `num_contig` rather than trying to detect partial merges.
fn tiled_span(mut intervals: Vec<(i64, i64)>) -> Option<(i64, i64)> {
    if intervals.is_empty() {
        return Some((0, 0));
    }
    intervals.sort_by_key(|&(start, _)| start);
    let origin = intervals[0].0;
    let mut cursor = origin;
    for (start, len) in intervals {
        if start != cursor {
            return None;
        }
        cursor += len;
    }
    Some((origin, cursor - origin))
}

fn check_depth(ctx: &Context, child_depth: u32) -> Result<u32> {
    let depth = child_depth + 1;
    if depth as usize > ctx.nesting_limit() {
        return Err(Error::BadArgs);
    }
    Ok(depth)
}

fn alloc(ctx: &Context, node: TypeNode) -> u64 {
    let (object_id, _arc) = ctx.types.alloc(node);
    ctx.mint_type_handle(object_id)
}

fn resolve(ctx: &Context, handle: u64) -> Result<Arc<TypeNode>> {
    ctx.resolve_type(handle).ok_or(Error::BadArgs)
}

pub fn create_contig(ctx: &Context, count: i64, oldtype: u64) -> Result<u64> {
    if count < 0 {
        return Err(Error::BadArgs);
    }
    let child = resolve(ctx, oldtype)?;
    let depth = check_depth(ctx, child.tree_depth)?;

    let size = count as u64 * child.size;
    let extent = count * child.extent;
    let true_lb = child.true_lb;
    let true_ub = if count == 0 {
        child.true_lb
    } else {
        (count - 1) * child.extent + child.true_ub
    };
    let is_contig = child.is_contig && child.size as i64 == child.extent;
    let num_contig = if is_contig {
        1
    } else {
        count as u64 * child.num_contig
    };

    Ok(alloc(
        ctx,
        TypeNode {
            kind: TypeKind::Contig,
            is_predefined: false,
            tree_depth: depth,
            alignment: child.alignment,
            size,
            extent,
            lb: true_lb,
            ub: true_lb + extent,
            true_lb,
            true_ub,
            is_contig,
            num_contig,
            payload: Payload::Contig { count, child },
        },
    ))
}

pub fn create_dup(ctx: &Context, oldtype: u64) -> Result<u64> {
    let child = resolve(ctx, oldtype)?;
    let depth = check_depth(ctx, child.tree_depth)?;

    Ok(alloc(
        ctx,
        TypeNode {
            kind: TypeKind::Dup,
            is_predefined: false,
            tree_depth: depth,
            alignment: child.alignment,
            size: child.size,
            extent: child.extent,
            lb: child.lb,
            ub: child.ub,
            true_lb: child.true_lb,
            true_ub: child.true_ub,
            is_contig: child.is_contig,
            num_contig: child.num_contig,
            payload: Payload::Dup { child },
        },
    ))
}

pub fn create_resized(ctx: &Context, oldtype: u64, lb: i64, extent: i64) -> Result<u64> {
    let child = resolve(ctx, oldtype)?;
    let depth = check_depth(ctx, child.tree_depth)?;

    let is_contig = child.is_contig && child.size as i64 == extent;

    Ok(alloc(
        ctx,
        TypeNode {
            kind: TypeKind::Resized,
            is_predefined: false,
            tree_depth: depth,
            alignment: child.alignment,
            size: child.size,
            extent,
            lb,
            ub: lb + extent,
            true_lb: child.true_lb,
            true_ub: child.true_ub,
            is_contig,
            num_contig: child.num_contig,
            payload: Payload::Resized { child },
        },
    ))
}

#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct HvectorParams {
    pub count: i64,
    pub blocklength: i64,
    pub stride: i64,
}

pub fn create_hvector(ctx: &Context, params: HvectorParams, oldtype: u64) -> Result<u64> {
    let HvectorParams {
        count,
        blocklength,
        stride,
    } = params;
    if count < 0 || blocklength < 0 {
        return Err(Error::BadArgs);
    }
    let child = resolve(ctx, oldtype)?;
    let depth = check_depth(ctx, child.tree_depth)?;

    let size = count as u64 * blocklength as u64 * child.size;
    let extent = if count == 0 {
        0
    } else {
        (count - 1) * stride + blocklength * child.extent
    };

    let block_lo = |k: i64| k * stride + child.true_lb;
    let block_hi = |k: i64| k * stride + (blocklength - 1) * child.extent + child.true_ub;
    let (true_lb, true_ub) = if count == 0 {
        (0, 0)
    } else {
        let (lo0, lo_last) = (block_lo(0), block_lo(count - 1));
        let (hi0, hi_last) = (block_hi(0), block_hi(count - 1));
        (lo0.min(lo_last), hi0.max(hi_last))
    };

    let is_contig = stride == blocklength * child.extent && child.is_contig;
    let block_runs = if child.is_contig {
        1
    } else {
        blocklength as u64 * child.num_contig
    };
    let num_contig = if is_contig { 1 } else { count as u64 * block_runs };

    Ok(alloc(
        ctx,
        TypeNode {
            kind: TypeKind::Hvector,
            is_predefined: false,
            tree_depth: depth,
            alignment: child.alignment,
            size,
            extent,
            lb: true_lb,
            ub: true_lb + extent,
            true_lb,
            true_ub,
            is_contig,
            num_contig,
            payload: Payload::Hvector {
                count,
                blocklength,
                stride,
                child,
            },
        },
    ))
}

pub fn create_hindexed_block(
    ctx: &Context,
    blocklength: i64,
    displacements: Vec<i64>,
    oldtype: u64,
) -> Result<u64> {
    if blocklength < 0 {
        return Err(Error::BadArgs);
    }
    let child = resolve(ctx, oldtype)?;
    let depth = check_depth(ctx, child.tree_depth)?;
    let count = displacements.len() as i64;

    let size = count as u64 * blocklength as u64 * child.size;
    let true_lb = displacements
        .iter()
        .map(|&d| d + child.true_lb)
        .min()
        .unwrap_or(0);
    let true_ub = displacements
        .iter()
        .map(|&d| d + (blocklength - 1) * child.extent + child.true_ub)
        .max()
        .unwrap_or(0);

    let is_contig = child.is_contig
        && tiled_span(
            displacements
                .iter()
                .map(|&d| (d, blocklength * child.size as i64))
                .collect(),
        ) == Some((true_lb, size as i64));
    let block_runs = if child.is_contig {
        1
    } else {
        blocklength as u64 * child.num_contig
    };
    let num_contig = if is_contig {
        1
    } else {
        count as u64 * block_runs
    };
    let extent = true_ub - true_lb;

    Ok(alloc(
        ctx,
        TypeNode {
            kind: TypeKind::BlkHindx,
            is_predefined: false,
            tree_depth: depth,
            alignment: child.alignment,
            size,
            extent,
            lb: true_lb,
            ub: true_lb + extent,
            true_lb,
            true_ub,
            is_contig,
            num_contig,
            payload: Payload::BlkHindx {
                blocklength,
                displacements,
                child,
            },
        },
    ))
}

pub fn create_hindexed(
    ctx: &Context,
    blocklengths: Vec<i64>,
    displacements: Vec<i64>,
    oldtype: u64,
) -> Result<u64> {
    if blocklengths.len() != displacements.len() {
        return Err(Error::BadArgs);
    }
    if blocklengths.iter().any(|&b| b < 0) {
        return Err(Error::BadArgs);
    }
    let child = resolve(ctx, oldtype)?;
    let depth = check_depth(ctx, child.tree_depth)?;

    let size = blocklengths.iter().sum::<i64>() as u64 * child.size;
    let true_lb = displacements
        .iter()
        .map(|&d| d + child.true_lb)
        .min()
        .unwrap_or(0);
    let true_ub = blocklengths
        .iter()
        .zip(&displacements)
        .map(|(&blen, &d)| d + (blen - 1) * child.extent + child.true_ub)
        .max()
        .unwrap_or(0);

    let is_contig = child.is_contig
        && tiled_span(
            blocklengths
                .iter()
                .zip(&displacements)
                .map(|(&blen, &d)| (d, blen * child.size as i64))
                .collect(),
        ) == Some((true_lb, size as i64));
    let num_contig = if is_contig {
        1
    } else {
        blocklengths
            .iter()
            .map(|&blen| {
                blen as u64
                    * if child.is_contig {
                        1
                    } else {
                        child.num_contig
                    }
            })
            .sum()
    };
    let extent = true_ub - true_lb;

    Ok(alloc(
        ctx,
        TypeNode {
            kind: TypeKind::Hindexed,
            is_predefined: false,
            tree_depth: depth,
            alignment: child.alignment,
            size,
            extent,
            lb: true_lb,
            ub: true_lb + extent,
            true_lb,
            true_ub,
            is_contig,
            num_contig,
            payload: Payload::Hindexed {
                blocklengths,
                displacements,
                child,
            },
        },
    ))
}

#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct StructParams {
    pub blocklengths: Vec<i64>,
    pub displacements: Vec<i64>,
}

pub fn create_struct(ctx: &Context, params: StructParams, oldtypes: Vec<u64>) -> Result<u64> {
    let StructParams {
        blocklengths,
        displacements,
    } = params;
    if blocklengths.len() != displacements.len() || blocklengths.len() != oldtypes.len() {
        return Err(Error::BadArgs);
    }
    if blocklengths.iter().any(|&b| b < 0) {
        return Err(Error::BadArgs);
    }

    let children: Vec<Arc<TypeNode>> = oldtypes
        .iter()
        .map(|&h| resolve(ctx, h))
        .collect::<Result<_>>()?;
    let depth = check_depth(
        ctx,
        children.iter().map(|c| c.tree_depth).max().unwrap_or(0),
    )?;

    let size: u64 = blocklengths
        .iter()
        .zip(&children)
        .map(|(&blen, c)| blen as u64 * c.size)
        .sum();
    let alignment = children.iter().map(|c| c.alignment).max().unwrap_or(1);
    let true_lb = displacements
        .iter()
        .zip(&children)
        .map(|(&d, c)| d + c.true_lb)
        .min()
        .unwrap_or(0);
    let true_ub = blocklengths
        .iter()
        .zip(&displacements)
        .zip(&children)
        .map(|((&blen, &d), c)| d + (blen - 1) * c.extent + c.true_ub)
        .max()
        .unwrap_or(0);

    let is_contig = children.iter().all(|c| c.is_contig)
        && tiled_span(
            blocklengths
                .iter()
                .zip(&displacements)
                .zip(&children)
                .map(|((&blen, &d), c)| (d, blen * c.extent))
                .collect(),
        ) == Some((true_lb, size as i64));
    let num_contig = if is_contig {
        1
    } else {
        blocklengths
            .iter()
            .zip(&children)
            .map(|(&blen, c)| blen as u64 * if c.is_contig { 1 } else { c.num_contig })
            .sum()
    };
    let extent = true_ub - true_lb;

    Ok(alloc(
        ctx,
        TypeNode {
            kind: TypeKind::Struct,
            is_predefined: false,
            tree_depth: depth,
            alignment,
            size,
            extent,
            lb: true_lb,
            ub: true_lb + extent,
            true_lb,
            true_ub,
            is_contig,
            num_contig,
            payload: Payload::Struct {
                blocklengths,
                displacements,
                children,
            },
        },
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayOrder {
    C,
    Fortran,
}

#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct SubarrayParams {
    pub sizes: Vec<i64>,
    pub subsizes: Vec<i64>,
    pub starts: Vec<i64>,
    #[builder(default = "ArrayOrder::C")]
    pub order: ArrayOrder,
}

/// Builds a subarray the way the original does: a chain of `HVECTOR`s (one per dimension, walked
/// from the fastest-varying dimension outward) topped with a `RESIZED` that places the origin
/// offset and the whole-array extent. No dedicated "subarray" node ever exists; every later
/// operation on the handle this returns flows through the `HVECTOR`/`RESIZED` code paths.
pub fn create_subarray(ctx: &Context, params: SubarrayParams, oldtype: u64) -> Result<u64> {
    let SubarrayParams {
        sizes,
        subsizes,
        starts,
        order,
    } = params;
    let ndims = sizes.len();
    if ndims == 0 || subsizes.len() != ndims || starts.len() != ndims {
        return Err(Error::BadArgs);
    }
    for i in 0..ndims {
        if sizes[i] < 1
            || subsizes[i] < 1
            || subsizes[i] > sizes[i]
            || starts[i] < 0
            || starts[i] + subsizes[i] > sizes[i]
        {
            return Err(Error::BadArgs);
        }
    }

    let order: Vec<usize> = match order {
        ArrayOrder::C => (0..ndims).rev().collect(),
        ArrayOrder::Fortran => (0..ndims).collect(),
    };

    let child = resolve(ctx, oldtype)?;
    let mut current = oldtype;
    let mut stride = child.extent;
    for &dim in &order {
        current = create_hvector(
            ctx,
            HvectorParams {
                count: subsizes[dim],
                blocklength: 1,
                stride,
            },
            current,
        )?;
        stride *= sizes[dim];
    }

    let mut displacement = 0i64;
    let mut dim_stride = child.extent;
    for &dim in &order {
        displacement += starts[dim] * dim_stride;
        dim_stride *= sizes[dim];
    }
    let whole_extent: i64 = sizes.iter().product::<i64>() * child.extent;

    create_resized(ctx, current, displacement, whole_extent)
}

/// An un-pooled, un-refcounted stand-in for "N contiguous bytes" used by the progress engine's
/// identity-copy legs (device-to-host DMA, device-to-device staging hops, ...). These never go
/// through a `Context`'s handle pool — they exist only for the duration of one backend call — so
/// there is nothing to free and no handle to hand back.
pub(crate) fn ephemeral_bytes(len: u64) -> TypeNode {
    TypeNode {
        kind: TypeKind::Builtin,
        is_predefined: false,
        tree_depth: 0,
        alignment: 1,
        size: len,
        extent: len as i64,
        lb: 0,
        ub: len as i64,
        true_lb: 0,
        true_ub: len as i64,
        is_contig: true,
        num_contig: if len == 0 { 0 } else { 1 },
        payload: Payload::Builtin {
            seed: PredefinedSeed::Byte,
        },
    }
}

/// Drops the context's reference to a type. Predefined types are never actually removed from the
/// pool — freeing one is a no-op, matching the original, where the static table outlives every
/// context that hands out handles into it.
pub fn free(ctx: &Context, handle: u64) -> Result<()> {
    let node = resolve(ctx, handle)?;
    if node.is_predefined {
        return Ok(());
    }
    let (_, object_id) = crate::handle::decode(handle);
    ctx.types.remove(object_id).ok_or(Error::BadArgs)?;
    Ok(())
}
