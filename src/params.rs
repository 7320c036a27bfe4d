/*
 * SPDX-FileCopyrightText: 2024 Tommaso Fontana
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The parameter block one multiplication consumes.
//!
//! Packing and kernel routines are resolved exactly once, when the block is
//! built, and stored as callbacks: the worker loop calls through a stored
//! pointer per strip or block, never re-resolving element types or kernel
//! variants per block. [`dispatch`](crate::dispatch) builds blocks bound to
//! the reference routines; callers with their own kernels build them
//! directly.

use crate::mat::{Layout, PMat};
use crate::side::{Side, SidePair};
use crate::tune::Tuning;

/// Packs the kernel-unit span `[start, end)` of one side into its packed
/// buffer. Called from worker threads; must write only the strip it is
/// given.
pub type PackFn<'a> = Box<dyn Fn(&PMat, Tuning, usize, usize) + Sync + 'a>;

/// Runs the kernel on the destination tile `[start, end)` (per side),
/// reading the referenced packed strips. Callsites never overlap.
pub type KernelFn<'a> =
    Box<dyn Fn(&SidePair<PMat>, Tuning, SidePair<usize>, SidePair<usize>) + Sync + 'a>;

/// Everything one multiplication needs: source layouts, packed-matrix
/// descriptors, and the resolved packing/kernel callbacks.
pub struct TrMulParams<'a> {
    /// Layouts of the sources; `dst` rows/cols are the column counts (the
    /// LHS enters transposed) and the depth is the shared row count.
    pub src_layout: SidePair<Layout>,
    /// Packed-matrix descriptors. Buffers are attached by the driver unless
    /// the side is pre-packed.
    pub packed: SidePair<PMat>,
    /// A pre-packed side comes with caller-attached buffers, already filled:
    /// packing is skipped wholesale for it.
    pub is_prepacked: SidePair<bool>,
    /// Scalar governing both the simple/general decision and the block-map
    /// geometry.
    pub cache_friendly_traversal_threshold: usize,
    run_pack: SidePair<PackFn<'a>>,
    run_kernel: KernelFn<'a>,
}

impl<'a> TrMulParams<'a> {
    pub fn new(
        src_layout: SidePair<Layout>,
        packed: SidePair<PMat>,
        is_prepacked: SidePair<bool>,
        cache_friendly_traversal_threshold: usize,
        run_pack: SidePair<PackFn<'a>>,
        run_kernel: KernelFn<'a>,
    ) -> Self {
        Self {
            src_layout,
            packed,
            is_prepacked,
            cache_friendly_traversal_threshold,
            run_pack,
            run_kernel,
        }
    }

    /// Packs the span `[start, end)` of `side` into its packed buffer.
    #[inline]
    pub fn run_pack(&self, side: Side, tuning: Tuning, start: usize, end: usize) {
        (self.run_pack[side])(&self.packed[side], tuning, start, end);
    }

    /// Runs the kernel on the destination tile `[start, end)`.
    #[inline]
    pub fn run_kernel(&self, tuning: Tuning, start: SidePair<usize>, end: SidePair<usize>) {
        (self.run_kernel)(&self.packed, tuning, start, end);
    }
}

impl std::fmt::Debug for TrMulParams<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrMulParams")
            .field("src_layout", &self.src_layout)
            .field("packed", &self.packed)
            .field("is_prepacked", &self.is_prepacked)
            .field(
                "cache_friendly_traversal_threshold",
                &self.cache_friendly_traversal_threshold,
            )
            .finish_non_exhaustive()
    }
}
