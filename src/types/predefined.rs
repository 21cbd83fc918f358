//! The predefined (builtin) type table every `Context` seeds itself with at construction.
//!
//! Scalar seeds are plain "N contiguous bytes, alignment N" nodes. Pair seeds (`FloatInt`,
//! `DoubleInt`, ...) derive their layout the way the original does it — by probing the padding
//! of an actual `repr(C)` struct — rather than assuming the pair is packed. `std::mem::offset_of!`
//! stands in for the original's pointer-subtraction trick.

use std::{
    collections::HashMap,
    mem::{align_of, size_of},
};

use super::{Payload, TypeKind, TypeNode};
use crate::handle::{self, HandlePool};

/// Rust has no native "C `int`/`long`/`long double`" ambiguity to resolve, so unlike the original
/// we don't carry width-matched aliases for them (see `SPEC_FULL.md` §2) — only the fixed-width
/// and pair seeds below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredefinedSeed {
    Null,
    Byte,
    Bool,
    Char,
    SignedChar,
    UnsignedChar,
    WChar,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    IntMax,
    UIntMax,
    Size,
    IntPtr,
    UIntPtr,
    PtrDiff,
    Float,
    Double,
    LongDouble,
    FloatComplex,
    DoubleComplex,
    LongDoubleComplex,
    FloatInt,
    DoubleInt,
    LongInt,
    TwoInt,
    ShortInt,
    LongDoubleInt,
}

struct Seed {
    size: u64,
    extent: i64,
    alignment: u32,
    true_ub: i64,
    is_contig: bool,
    num_contig: u64,
}

impl Seed {
    fn scalar(size: usize, alignment: usize) -> Self {
        Seed {
            size: size as u64,
            extent: size as i64,
            alignment: alignment as u32,
            true_ub: size as i64,
            is_contig: true,
            num_contig: if size == 0 { 0 } else { 1 },
        }
    }

    /// `size_a`/`size_b` are the logical payload sizes; `offset_b`/`struct_size`/`struct_align`
    /// come from probing an actual `repr(C) { a, b }` struct for its real padding.
    fn pair(size_a: usize, size_b: usize, offset_b: usize, struct_size: usize, struct_align: usize) -> Self {
        let size = (size_a + size_b) as u64;
        let extent = struct_size as i64;
        let true_ub = (offset_b + size_b) as i64;
        let is_contig = size as i64 == extent;
        Seed {
            size,
            extent,
            alignment: struct_align as u32,
            true_ub,
            is_contig,
            num_contig: if is_contig { 1 } else { 2 },
        }
    }
}

#[repr(C)]
struct FloatIntProbe {
    a: f32,
    b: i32,
}
#[repr(C)]
struct DoubleIntProbe {
    a: f64,
    b: i32,
}
#[repr(C)]
struct LongIntProbe {
    a: i64,
    b: i32,
}
#[repr(C)]
struct TwoIntProbe {
    a: i32,
    b: i32,
}
#[repr(C)]
struct ShortIntProbe {
    a: i16,
    b: i32,
}
#[repr(C)]
struct LongDoubleIntProbe {
    // Rust has no native `long double`; we model it as `f64`, which gives a narrower layout than
    // the 80/128-bit extended type most C ABIs use. Recorded as a known divergence in DESIGN.md.
    a: f64,
    b: i32,
}

fn seed_layout(seed: PredefinedSeed) -> Seed {
    use PredefinedSeed::*;
    match seed {
        Null => Seed {
            size: 0,
            extent: 0,
            alignment: 1,
            true_ub: 0,
            is_contig: true,
            num_contig: 0,
        },
        Byte | UnsignedChar => Seed::scalar(size_of::<u8>(), align_of::<u8>()),
        Bool => Seed::scalar(size_of::<bool>(), align_of::<bool>()),
        Char | SignedChar => Seed::scalar(size_of::<i8>(), align_of::<i8>()),
        WChar => Seed::scalar(size_of::<i32>(), align_of::<i32>()),
        Int8 | UInt8 => Seed::scalar(size_of::<u8>(), align_of::<u8>()),
        Int16 | UInt16 => Seed::scalar(size_of::<u16>(), align_of::<u16>()),
        Int32 | UInt32 => Seed::scalar(size_of::<u32>(), align_of::<u32>()),
        Int64 | UInt64 | IntMax | UIntMax => Seed::scalar(size_of::<u64>(), align_of::<u64>()),
        Size | IntPtr | UIntPtr | PtrDiff => Seed::scalar(size_of::<usize>(), align_of::<usize>()),
        Float => Seed::scalar(size_of::<f32>(), align_of::<f32>()),
        Double | LongDouble => Seed::scalar(size_of::<f64>(), align_of::<f64>()),
        FloatComplex => Seed::scalar(2 * size_of::<f32>(), align_of::<f32>()),
        DoubleComplex | LongDoubleComplex => Seed::scalar(2 * size_of::<f64>(), align_of::<f64>()),
        FloatInt => Seed::pair(
            size_of::<f32>(),
            size_of::<i32>(),
            std::mem::offset_of!(FloatIntProbe, b),
            size_of::<FloatIntProbe>(),
            align_of::<FloatIntProbe>(),
        ),
        DoubleInt => Seed::pair(
            size_of::<f64>(),
            size_of::<i32>(),
            std::mem::offset_of!(DoubleIntProbe, b),
            size_of::<DoubleIntProbe>(),
            align_of::<DoubleIntProbe>(),
        ),
        LongInt => Seed::pair(
            size_of::<i64>(),
            size_of::<i32>(),
            std::mem::offset_of!(LongIntProbe, b),
            size_of::<LongIntProbe>(),
            align_of::<LongIntProbe>(),
        ),
        TwoInt => Seed::pair(
            size_of::<i32>(),
            size_of::<i32>(),
            std::mem::offset_of!(TwoIntProbe, b),
            size_of::<TwoIntProbe>(),
            align_of::<TwoIntProbe>(),
        ),
        ShortInt => Seed::pair(
            size_of::<i16>(),
            size_of::<i32>(),
            std::mem::offset_of!(ShortIntProbe, b),
            size_of::<ShortIntProbe>(),
            align_of::<ShortIntProbe>(),
        ),
        LongDoubleInt => Seed::pair(
            size_of::<f64>(),
            size_of::<i32>(),
            std::mem::offset_of!(LongDoubleIntProbe, b),
            size_of::<LongDoubleIntProbe>(),
            align_of::<LongDoubleIntProbe>(),
        ),
    }
}

const ALL_SEEDS: &[PredefinedSeed] = {
    use PredefinedSeed::*;
    &[
        Null,
        Byte,
        Bool,
        Char,
        SignedChar,
        UnsignedChar,
        WChar,
        Int8,
        Int16,
        Int32,
        Int64,
        UInt8,
        UInt16,
        UInt32,
        UInt64,
        IntMax,
        UIntMax,
        Size,
        IntPtr,
        UIntPtr,
        PtrDiff,
        Float,
        Double,
        LongDouble,
        FloatComplex,
        DoubleComplex,
        LongDoubleComplex,
        FloatInt,
        DoubleInt,
        LongInt,
        TwoInt,
        ShortInt,
        LongDoubleInt,
    ]
};

/// The full set of predefined type handles for one context, plus the reverse lookup
/// `type_get_predefined_seed` needs.
pub struct PredefinedTable {
    handles: HashMap<PredefinedSeed, u64>,
    seeds: HashMap<u64, PredefinedSeed>,
}

impl PredefinedTable {
    pub(crate) fn build(context_id: u32, types: &HandlePool<TypeNode>) -> Self {
        let mut handles = HashMap::with_capacity(ALL_SEEDS.len());
        let mut seeds = HashMap::with_capacity(ALL_SEEDS.len());

        for &seed in ALL_SEEDS {
            let layout = seed_layout(seed);
            let node = TypeNode {
                kind: TypeKind::Builtin,
                is_predefined: true,
                tree_depth: 0,
                alignment: layout.alignment,
                size: layout.size,
                extent: layout.extent,
                lb: 0,
                ub: layout.extent,
                true_lb: 0,
                true_ub: layout.true_ub,
                is_contig: layout.is_contig,
                num_contig: layout.num_contig,
                payload: Payload::Builtin { seed },
            };
            let (object_id, _arc) = types.alloc(node);
            let handle = handle::encode(context_id, object_id);
            handles.insert(seed, handle);
            seeds.insert(handle, seed);
        }

        PredefinedTable { handles, seeds }
    }

    pub fn get(&self, seed: PredefinedSeed) -> u64 {
        self.handles[&seed]
    }

    pub fn seed_of(&self, handle: u64) -> Option<PredefinedSeed> {
        self.seeds.get(&handle).copied()
    }

    pub fn byte(&self) -> u64 {
        self.get(PredefinedSeed::Byte)
    }
    pub fn int32(&self) -> u64 {
        self.get(PredefinedSeed::Int32)
    }
    pub fn int64(&self) -> u64 {
        self.get(PredefinedSeed::Int64)
    }
    pub fn float32(&self) -> u64 {
        self.get(PredefinedSeed::Float)
    }
    pub fn float64(&self) -> u64 {
        self.get(PredefinedSeed::Double)
    }
    pub fn null(&self) -> u64 {
        self.get(PredefinedSeed::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PredefinedTable {
        let types = HandlePool::new();
        PredefinedTable::build(1, &types)
    }

    #[test]
    fn byte_is_one_contiguous_byte() {
        let types = HandlePool::new();
        let table = PredefinedTable::build(1, &types);
        let node = types.get(handle::decode(table.byte()).1).unwrap();
        assert_eq!(node.size(), 1);
        assert!(node.is_contig());
    }

    #[test]
    fn two_int_is_contiguous_pair() {
        let types = HandlePool::new();
        let table = PredefinedTable::build(1, &types);
        let node = types
            .get(handle::decode(table.get(PredefinedSeed::TwoInt)).1)
            .unwrap();
        assert!(node.is_contig());
        assert_eq!(node.size(), 8);
    }

    #[test]
    fn short_int_has_a_padding_gap() {
        let types = HandlePool::new();
        let table = PredefinedTable::build(1, &types);
        let node = types
            .get(handle::decode(table.get(PredefinedSeed::ShortInt)).1)
            .unwrap();
        assert!(!node.is_contig());
        assert_eq!(node.num_contig(), 2);
    }

    #[test]
    fn seed_of_reverses_get() {
        let table = table();
        let h = table.get(PredefinedSeed::Float);
        assert_eq!(table.seed_of(h), Some(PredefinedSeed::Float));
    }
}
