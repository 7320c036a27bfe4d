/*
 * SPDX-FileCopyrightText: 2024 Tommaso Fontana
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Partition of the destination matrix into a grid of blocks, and the order
//! in which workers traverse them.
//!
//! A block is a rectangular tile of the destination, computed by one kernel
//! invocation; its projection on a source side is the *strip* of that side it
//! consumes, which is also the unit of packing. The map is a bijection
//! between block indices in `[0, num_blocks)` and grid coordinates, chosen so
//! that consecutive indices tend to share a strip with their predecessors:
//! workers claiming consecutive indices then hit packed data that is still
//! warm in the shared cache levels.
//!
//! Grid dimensions are powers of two. This keeps index decoding to a handful
//! of shifts and lets the interleaved traversal (a Z-shaped space-filling
//! curve, generalized to rectangular grids by prepending the excess bits of
//! the longer side) stay a bijection.

use crate::side::{Side, SidePair};
use log::trace;

/// How block indices are laid over the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTraversal {
    /// Column-major over the grid; LHS coordinate varies fastest.
    Linear,
    /// Bit-interleaved Z order.
    Interleaved,
}

/// A bijection between block indices and destination tiles.
#[derive(Debug, Clone)]
pub struct BlockMap {
    /// Rounded dimensions covered per side, in matrix units.
    dims: SidePair<usize>,
    /// Kernel width per side; block edges are multiples of it.
    kernel_dims: SidePair<usize>,
    /// Dimensions per side in kernel units (`dims / kernel_dims`).
    kernel_units: SidePair<usize>,
    /// Per-side grid size is `1 << grid_log2`.
    grid_log2: SidePair<u32>,
    traversal: BlockTraversal,
}

impl BlockMap {
    /// Builds the map for a `dims[Lhs] × dims[Rhs]` destination (rounded to
    /// kernel widths) at the given depth.
    ///
    /// The grid is subdivided, halving the side with the larger per-block
    /// packed footprint, until one block's LHS+RHS packed bytes fit the
    /// budget derived from `traversal_threshold` or until blocks reach one
    /// kernel width. The same threshold decides whether the traversal is
    /// worth interleaving.
    pub fn new(
        dims: SidePair<usize>,
        depth: usize,
        kernel_dims: SidePair<usize>,
        elem_sizes: SidePair<usize>,
        traversal_threshold: usize,
    ) -> Self {
        for side in Side::BOTH {
            assert!(kernel_dims[side] > 0, "zero kernel width");
            assert!(
                dims[side] > 0 && dims[side] % kernel_dims[side] == 0,
                "dimension {} not rounded to kernel width {}",
                dims[side],
                kernel_dims[side],
            );
        }
        let kernel_units = SidePair::from_fn(|side| dims[side] / kernel_dims[side]);
        let max_log2 = SidePair::from_fn(|side| kernel_units[side].ilog2());

        // Packed bytes of one block on `side` at the candidate grid size.
        let footprint = |side: Side, log2: u32| {
            let units = kernel_units[side].div_ceil(1 << log2);
            units * kernel_dims[side] * depth * elem_sizes[side]
        };

        // One block pair should stay well below the size at which traversal
        // has to become cache-friendly.
        let budget = (traversal_threshold >> 4).max(1);
        let mut grid_log2 = SidePair::new(0u32, 0u32);
        loop {
            if footprint(Side::Lhs, grid_log2[Side::Lhs]) + footprint(Side::Rhs, grid_log2[Side::Rhs])
                <= budget
            {
                break;
            }
            // Halve the splittable side with the larger footprint.
            let splittable =
                SidePair::from_fn(|side| grid_log2[side] < max_log2[side]);
            let side = match (splittable[Side::Lhs], splittable[Side::Rhs]) {
                (false, false) => break,
                (true, false) => Side::Lhs,
                (false, true) => Side::Rhs,
                (true, true) => {
                    if footprint(Side::Rhs, grid_log2[Side::Rhs])
                        > footprint(Side::Lhs, grid_log2[Side::Lhs])
                    {
                        Side::Rhs
                    } else {
                        Side::Lhs
                    }
                }
            };
            grid_log2[side] += 1;
        }

        let traversal = if grid_log2[Side::Lhs] > 0
            && grid_log2[Side::Rhs] > 0
            && (dims[Side::Lhs] + dims[Side::Rhs]) * depth >= traversal_threshold
        {
            BlockTraversal::Interleaved
        } else {
            BlockTraversal::Linear
        };

        let map = Self {
            dims,
            kernel_dims,
            kernel_units,
            grid_log2,
            traversal,
        };
        trace!(
            "block map: {}x{} blocks over {}x{} ({:?})",
            map.num_blocks_per_side(Side::Lhs),
            map.num_blocks_per_side(Side::Rhs),
            dims[Side::Lhs],
            dims[Side::Rhs],
            traversal,
        );
        map
    }

    /// Rounded dimensions the map covers, in matrix units.
    #[inline(always)]
    pub fn dims(&self) -> SidePair<usize> {
        self.dims
    }

    /// Total number of blocks.
    #[inline(always)]
    pub fn num_blocks(&self) -> usize {
        1 << (self.grid_log2[Side::Lhs] + self.grid_log2[Side::Rhs])
    }

    /// Number of blocks along `side`, which is also the number of strips of
    /// that side.
    #[inline(always)]
    pub fn num_blocks_per_side(&self, side: Side) -> usize {
        1 << self.grid_log2[side]
    }

    #[inline(always)]
    pub fn traversal(&self) -> BlockTraversal {
        self.traversal
    }

    /// Decodes a block index into grid coordinates.
    pub fn block_by_index(&self, index: usize) -> SidePair<usize> {
        debug_assert!(index < self.num_blocks());
        let lhs_log2 = self.grid_log2[Side::Lhs];
        let rhs_log2 = self.grid_log2[Side::Rhs];
        match self.traversal {
            BlockTraversal::Linear => SidePair::new(
                index & ((1 << lhs_log2) - 1),
                index >> lhs_log2,
            ),
            BlockTraversal::Interleaved => {
                let square = lhs_log2.min(rhs_log2);
                let mut lhs = 0;
                let mut rhs = 0;
                for bit in 0..square {
                    lhs |= ((index >> (2 * bit)) & 1) << bit;
                    rhs |= ((index >> (2 * bit + 1)) & 1) << bit;
                }
                let excess = index >> (2 * square);
                if lhs_log2 > rhs_log2 {
                    lhs |= excess << square;
                } else {
                    rhs |= excess << square;
                }
                SidePair::new(lhs, rhs)
            }
        }
    }

    /// Matrix-unit span `[start, end)` of a block, per side.
    ///
    /// Block edges divide the kernel-unit count evenly, so every block spans
    /// at least one kernel width and the spans of the blocks along a side
    /// partition `[0, dims[side])`.
    pub fn block_matrix_coords(
        &self,
        block: SidePair<usize>,
    ) -> (SidePair<usize>, SidePair<usize>) {
        let start = SidePair::from_fn(|side| {
            ((block[side] * self.kernel_units[side]) >> self.grid_log2[side])
                * self.kernel_dims[side]
        });
        let end = SidePair::from_fn(|side| {
            (((block[side] + 1) * self.kernel_units[side]) >> self.grid_log2[side])
                * self.kernel_dims[side]
        });
        (start, end)
    }
}
