//! End-to-end coverage of the six host-memory scenarios named in spec.md §8: vector pack,
//! indexed-block pack/unpack, contig invariants, struct displacements, and accumulate SUM.
//! The seventh (staged D2D chunking through a simulated backend) lives next to the progress
//! engine's private state in `src/progress/mod.rs`, since observing exact chunk counts needs
//! access that's `pub(crate)`.

use dtpack::{
    request_wait,
    types::{create_contig, create_hindexed_block, create_hvector, create_struct, HvectorParams, StructParams},
    Context, Info,
};

fn ctx() -> std::sync::Arc<Context> {
    Context::create(&Info::create()).unwrap()
}

/// `T = HVECTOR(count=3, blocklength=2, stride=3·sizeof(int), child=INT)`. Packing the first 24
/// bytes' worth of blocks out of a 12-int buffer of `[0..11]` picks ints 0,1 (block 0), 3,4
/// (block 1), 6,7 (block 2) — spec.md §8 scenario 1, with `stride` converted from the spec's
/// element units to this constructor's byte units.
#[test]
fn vector_pack_on_host_matches_literal_scenario() {
    let ctx = ctx();
    let int32 = ctx.predefined().int32();
    let ty = create_hvector(
        &ctx,
        HvectorParams {
            count: 3,
            blocklength: 2,
            stride: 3 * 4,
        },
        int32,
    )
    .unwrap();
    let node = ctx.resolve_type(ty).unwrap();
    assert_eq!(node.size(), 24);

    let source: Vec<i32> = (0..12).collect();
    let mut packed = vec![0u8; 24];
    let info = Info::create();

    let (n, req) = unsafe {
        dtpack::api::ipack(
            &ctx,
            source.as_ptr() as *const u8,
            1,
            ty,
            0,
            packed.as_mut_ptr(),
            24,
            &info,
        )
        .unwrap()
    };
    request_wait(&ctx, req).unwrap();

    assert_eq!(n, 24);
    let values: &[i32] = bytemuck::cast_slice(&packed);
    assert_eq!(values, [0, 1, 3, 4, 6, 7]);
}

/// `T = BLKHINDX(blocklength=4, displs=[32,96,160,224], child=INT)` over a 64-int buffer with
/// `buf[i] == i`: picks ints 8..11, 24..27, 40..43, 56..59 (every other row of an 8x8 matrix,
/// first half of each row) — a self-contained variant of spec.md §8 scenario 2, with
/// displacements expressed in this constructor's byte units rather than the spec's element
/// units. Subsequent unpack restores exactly those positions and leaves the rest zero.
#[test]
fn indexed_block_pack_then_unpack_restores_only_touched_positions() {
    let ctx = ctx();
    let int32 = ctx.predefined().int32();
    let ty = create_hindexed_block(&ctx, 4, vec![32, 96, 160, 224], int32).unwrap();
    let node = ctx.resolve_type(ty).unwrap();
    assert_eq!(node.size(), 64);

    let matrix: Vec<i32> = (0..64).collect();
    let mut packed = vec![0u8; 64];
    let info = Info::create();

    unsafe {
        let (n, req) = dtpack::api::ipack(
            &ctx,
            matrix.as_ptr() as *const u8,
            1,
            ty,
            0,
            packed.as_mut_ptr(),
            64,
            &info,
        )
        .unwrap();
        assert_eq!(n, 64);
        request_wait(&ctx, req).unwrap();
    }

    let values: &[i32] = bytemuck::cast_slice(&packed);
    assert_eq!(values, [8, 9, 10, 11, 24, 25, 26, 27, 40, 41, 42, 43, 56, 57, 58, 59]);

    let mut restored = vec![0i32; 64];
    unsafe {
        let (n, req) = dtpack::api::iunpack(
            &ctx,
            packed.as_ptr(),
            64,
            restored.as_mut_ptr() as *mut u8,
            64,
            ty,
            0,
            &info,
        )
        .unwrap();
        assert_eq!(n, 64);
        request_wait(&ctx, req).unwrap();
    }

    for (i, &v) in restored.iter().enumerate() {
        let touched = (8..12).contains(&i) || (24..28).contains(&i) || (40..44).contains(&i) || (56..60).contains(&i);
        if touched {
            assert_eq!(v, i as i32);
        } else {
            assert_eq!(v, 0);
        }
    }
}

/// `T = CONTIG(10, INT)`: spec.md §8 scenario 3, literally.
#[test]
fn contig_invariants_match_literal_scenario() {
    let ctx = ctx();
    let int32 = ctx.predefined().int32();
    let ty = create_contig(&ctx, 10, int32).unwrap();
    let node = ctx.resolve_type(ty).unwrap();

    assert_eq!(node.size(), 40);
    assert_eq!(node.extent(), 40);
    assert!(node.is_contig());
    assert_eq!(node.true_lb(), 0);
    assert_eq!(node.true_ub(), 40);
}

/// `T = STRUCT(blens=[1,1], displs=[0,8], types=[DOUBLE,INT])`: spec.md §8 scenario 4, literally.
/// The two members tile with no gap (`f64` at `[0,8)`, `i32` at `[8,12)`), so the struct is
/// reported contiguous and a round-trip degenerates to a `memcpy`.
#[test]
fn struct_displacements_match_literal_scenario_and_round_trips() {
    let ctx = ctx();
    let f64_ty = ctx.predefined().float64();
    let i32_ty = ctx.predefined().int32();
    let ty = create_struct(
        &ctx,
        StructParams {
            blocklengths: vec![1, 1],
            displacements: vec![0, 8],
        },
        vec![f64_ty, i32_ty],
    )
    .unwrap();
    let node = ctx.resolve_type(ty).unwrap();

    assert_eq!(node.size(), 12);
    assert_eq!(node.extent(), 12);
    assert_eq!(node.alignment(), 8);
    assert!(node.is_contig());
    assert_eq!(node.true_lb(), 0);
    assert_eq!(node.true_ub(), 12);

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Pair {
        d: f64,
        i: i32,
    }
    let source = [Pair { d: 1.5, i: 7 }, Pair { d: -2.25, i: -9 }];
    let mut packed = vec![0u8; 24];
    let mut roundtrip = vec![0u8; 24];
    let info = Info::create();

    unsafe {
        let (n, req) = dtpack::api::ipack(
            &ctx,
            source.as_ptr() as *const u8,
            2,
            ty,
            0,
            packed.as_mut_ptr(),
            24,
            &info,
        )
        .unwrap();
        assert_eq!(n, 24);
        request_wait(&ctx, req).unwrap();

        let (n, req) = dtpack::api::iunpack(
            &ctx,
            packed.as_ptr(),
            24,
            roundtrip.as_mut_ptr(),
            2,
            ty,
            0,
            &info,
        )
        .unwrap();
        assert_eq!(n, 24);
        request_wait(&ctx, req).unwrap();
    }

    assert_eq!(packed, roundtrip);
    let out: &[Pair] = bytemuck::cast_slice(&roundtrip);
    assert_eq!(out[0].d, 1.5);
    assert_eq!(out[0].i, 7);
    assert_eq!(out[1].d, -2.25);
    assert_eq!(out[1].i, -9);
}

/// `T = HVECTOR(count=3, blocklength=1, stride=2·sizeof(int), child=INT)` touches int indices
/// 0, 2, 4. Accumulating `[10,20,30]` with `SUM` into `dst=[1,2,3,4,5,6]` only changes those
/// three positions — a self-contained variant of spec.md §8 scenario 5.
#[test]
fn accumulate_sum_only_touches_positions_hit_by_the_type() {
    let ctx = ctx();
    let int32 = ctx.predefined().int32();
    let ty = create_hvector(
        &ctx,
        HvectorParams {
            count: 3,
            blocklength: 1,
            stride: 2 * 4,
        },
        int32,
    )
    .unwrap();
    let node = ctx.resolve_type(ty).unwrap();
    assert_eq!(node.size(), 12);

    let src: Vec<i32> = vec![10, 20, 30];
    let mut dst: Vec<i32> = vec![1, 2, 3, 4, 5, 6];
    let info = Info::create();

    unsafe {
        let (n, req) = dtpack::api::iacc(
            &ctx,
            src.as_ptr() as *const u8,
            12,
            dst.as_mut_ptr() as *mut u8,
            6,
            ty,
            0,
            dtpack::ReduceOp::Sum,
            &info,
        )
        .unwrap();
        assert_eq!(n, 12);
        request_wait(&ctx, req).unwrap();
    }

    assert_eq!(dst, vec![11, 2, 23, 4, 35, 6]);
}

/// spec.md §8: "idempotence of `NO_OP` reduction" — `iacc(..., op=NO_OP)` leaves the destination
/// unchanged no matter what the source holds.
#[test]
fn no_op_accumulate_leaves_destination_unchanged() {
    let ctx = ctx();
    let int32 = ctx.predefined().int32();
    let src: i32 = 999;
    let mut dst: i32 = 42;
    let info = Info::create();

    unsafe {
        let (_, req) = dtpack::api::iacc(
            &ctx,
            &src as *const i32 as *const u8,
            4,
            &mut dst as *mut i32 as *mut u8,
            1,
            int32,
            0,
            dtpack::ReduceOp::NoOp,
            &info,
        )
        .unwrap();
        request_wait(&ctx, req).unwrap();
    }

    assert_eq!(dst, 42);
}
