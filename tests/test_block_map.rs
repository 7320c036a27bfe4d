/*
 * SPDX-FileCopyrightText: 2024 Tommaso Fontana
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use trmul::prelude::*;

fn random_map(rng: &mut SmallRng) -> BlockMap {
    let kernel = SidePair::new(1 << rng.random_range(0..4u32), 1 << rng.random_range(0..4u32));
    let dims = SidePair::from_fn(|side| kernel[side] * rng.random_range(1..100usize));
    let depth = rng.random_range(1..512);
    let elem_sizes = SidePair::new(4, 4);
    let threshold = if rng.random_range(0..4) == 0 {
        0
    } else {
        1 << rng.random_range(4..22)
    };
    BlockMap::new(dims, depth, kernel, elem_sizes, threshold)
}

/// Block indices decode to distinct grid coordinates covering the whole
/// grid, and every strip on both sides belongs to at least one block.
#[test]
fn test_index_decode_is_a_bijection() {
    let mut rng = SmallRng::seed_from_u64(0x0b10c);
    for _ in 0..200 {
        let map = random_map(&mut rng);
        let mut seen = HashSet::new();
        let mut strips = SidePair::new(HashSet::new(), HashSet::new());
        for index in 0..map.num_blocks() {
            let block = map.block_by_index(index);
            for side in Side::BOTH {
                assert!(block[side] < map.num_blocks_per_side(side));
                strips[side].insert(block[side]);
            }
            assert!(
                seen.insert((block[Side::Lhs], block[Side::Rhs])),
                "two indices decode to the same block"
            );
        }
        assert_eq!(seen.len(), map.num_blocks());
        for side in Side::BOTH {
            assert_eq!(strips[side].len(), map.num_blocks_per_side(side));
        }
    }
}

/// Per side, the strip spans are non-empty, kernel-aligned, and partition
/// the rounded dimension.
#[test]
fn test_strip_spans_partition_each_side() {
    let mut rng = SmallRng::seed_from_u64(0x51de);
    for _ in 0..200 {
        let kernel = SidePair::new(1 << rng.random_range(0..4u32), 1 << rng.random_range(0..4u32));
        let dims = SidePair::from_fn(|side| kernel[side] * rng.random_range(1..100usize));
        let map = BlockMap::new(dims, rng.random_range(1..256), kernel, SidePair::new(4, 4), 0);
        for side in Side::BOTH {
            let mut covered = 0;
            for strip in 0..map.num_blocks_per_side(side) {
                let mut block = SidePair::new(0, 0);
                block[side] = strip;
                let (start, end) = map.block_matrix_coords(block);
                assert_eq!(start[side], covered, "gap or overlap between strips");
                assert!(end[side] > start[side], "empty strip");
                assert_eq!(start[side] % kernel[side], 0);
                assert_eq!(end[side] % kernel[side], 0);
                covered = end[side];
            }
            assert_eq!(covered, map.dims()[side], "strips do not cover the matrix");
        }
    }
}

/// The coordinates of a block depend on its per-side strip alone: the span
/// a strip gets is the same whatever the other side's coordinate is.
#[test]
fn test_strip_spans_do_not_depend_on_other_side() {
    let mut rng = SmallRng::seed_from_u64(0xdeca);
    for _ in 0..50 {
        let map = random_map(&mut rng);
        for index in 0..map.num_blocks() {
            let block = map.block_by_index(index);
            let (start, end) = map.block_matrix_coords(block);
            for side in Side::BOTH {
                let mut lone = SidePair::new(0, 0);
                lone[side] = block[side];
                let (lone_start, lone_end) = map.block_matrix_coords(lone);
                assert_eq!(start[side], lone_start[side]);
                assert_eq!(end[side], lone_end[side]);
            }
        }
    }
}

/// Consecutive indices of an interleaved traversal revisit a recently used
/// strip more often than the block count alone would: the point of the
/// curve is strip reuse.
#[test]
fn test_interleaved_order_reuses_strips() {
    let dims = SidePair::new(256, 256);
    let map = BlockMap::new(dims, 256, SidePair::new(8, 8), SidePair::new(4, 4), 0);
    assert_eq!(map.traversal(), BlockTraversal::Interleaved);

    let mut reuses = 0;
    let mut previous: Option<SidePair<usize>> = None;
    for index in 0..map.num_blocks() {
        let block = map.block_by_index(index);
        if let Some(prev) = previous {
            if prev[Side::Lhs] == block[Side::Lhs] || prev[Side::Rhs] == block[Side::Rhs] {
                reuses += 1;
            }
        }
        previous = Some(block);
    }
    // The Z curve shares a strip on about half of all transitions (two out
    // of three within each 2x2 quad); require a conservative third.
    assert!(
        reuses * 3 >= map.num_blocks(),
        "only {reuses} of {} consecutive pairs share a strip",
        map.num_blocks()
    );
}
