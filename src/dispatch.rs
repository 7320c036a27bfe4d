/*
 * SPDX-FileCopyrightText: 2024 Tommaso Fontana
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Typed front-end: binds the reference packing and kernel routines to a
//! concrete element type and hands the resulting parameter block to
//! [`tr_mul`].
//!
//! The reference kernel is a plain scalar loop. It exists to make the crate
//! usable out of the box and to pin down semantics: it accumulates along the
//! depth in ascending order, and every destination element is written by
//! exactly one block, so the output is identical bit for bit whatever the
//! thread count and schedule. Vectorized kernels plug in by building a
//! [`TrMulParams`] with their own callbacks instead.

use crate::buf::SharedBuf;
use crate::context::Context;
use crate::mat::{Layout, Mat, MatMut, PMat, PackedLayout};
use crate::params::{KernelFn, PackFn, TrMulParams};
use crate::side::{Side, SidePair};
use crate::trmul::tr_mul;
use anyhow::{ensure, Result};
use std::cell::UnsafeCell;
use std::ops::{Add, Mul};

/// Element types the reference routines accept.
pub trait Element:
    Copy + Default + Send + Sync + Add<Output = Self> + Mul<Output = Self> + 'static
{
}

impl Element for f32 {}
impl Element for f64 {}
impl Element for i32 {}

/// Kernel width of the reference routines, per side: packed panels and block
/// edges are multiples of this.
pub const KERNEL_WIDTH: usize = 8;

/// Default for
/// [`cache_friendly_traversal_threshold`](TrMulParams::cache_friendly_traversal_threshold).
pub const DEFAULT_TRAVERSAL_THRESHOLD: usize = 32 * 1024;

/// The packed layout the reference routines use for a source with layout
/// `src`: same depth, columns rounded up to [`KERNEL_WIDTH`], no column sums.
pub fn packed_layout<T: Element>(src: &Layout) -> PackedLayout {
    PackedLayout {
        depth: src.rows,
        cols: src.cols.div_ceil(KERNEL_WIDTH) * KERNEL_WIDTH,
        kernel_cols: KERNEL_WIDTH,
        elem_size: std::mem::size_of::<T>(),
        sums_elem_size: 0,
    }
}

/// Destination view shared among workers.
///
/// Kernel callsites never overlap (the block map partitions the
/// destination), so concurrent writes hit disjoint elements. The elements
/// are held as a slice of [`UnsafeCell`]s and every write goes through
/// [`UnsafeCell::get`]: mutation through a shared `&SharedDst` is interior
/// mutability, never a write behind a plain shared reference.
pub struct SharedDst<'a, T> {
    cells: &'a [UnsafeCell<T>],
    layout: Layout,
}

unsafe impl<T: Send> Send for SharedDst<'_, T> {}
unsafe impl<T: Send> Sync for SharedDst<'_, T> {}

impl<T> Clone for SharedDst<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SharedDst<'_, T> {}

impl<'a, T> SharedDst<'a, T> {
    #[allow(trivial_casts)]
    pub fn new(dst: MatMut<'a, T>) -> Self {
        let layout = dst.layout();
        let data = dst.into_slice();
        // SAFETY: `UnsafeCell<T>` has the same memory layout as `T`, and the
        // slice comes out of an exclusive borrow.
        let cells = unsafe { &*(data as *mut [T] as *const [UnsafeCell<T>]) };
        Self { cells, layout }
    }

    #[inline(always)]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Writes one element.
    ///
    /// # Safety
    ///
    /// `(row, col)` must be in bounds and not written or read concurrently.
    #[inline(always)]
    pub unsafe fn write(&self, row: usize, col: usize, value: T) {
        *self.cells[self.layout.offset(row, col)].get() = value;
    }
}

impl<T> std::fmt::Debug for SharedDst<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDst").field("layout", &self.layout).finish()
    }
}

/// Reference packing routine: copies the columns `[start, end)` of `src`
/// into the packed panel, writing zeros for the padding columns past the
/// source's edge.
pub fn pack_strip<T: Element>(src: Mat<'_, T>, packed: &PMat, start: usize, end: usize) {
    let layout = packed.layout;
    debug_assert!(start < end && end <= layout.cols);
    debug_assert_eq!(start % layout.kernel_cols, 0);
    debug_assert_eq!(layout.depth, src.layout().rows);
    let depth = layout.depth;
    let data = packed
        .data
        .as_ref()
        .expect("packing into an unallocated buffer");
    // SAFETY: this strip has a unique packer, and readers look at it only
    // after it has been published.
    let panel: &mut [T] = unsafe { data.slice_mut(start * depth, (end - start) * depth) };
    for (panel_col, col) in (start..end).enumerate() {
        let out = &mut panel[panel_col * depth..(panel_col + 1) * depth];
        if col < src.layout().cols {
            out.copy_from_slice(src.col(col));
        } else {
            out.fill(T::default());
        }
    }
}

/// Reference kernel: a scalar dot-product per destination element of the
/// tile `[start, end)`, skipping the padding region.
pub fn kernel_block<T: Element>(
    packed: &SidePair<PMat>,
    dst: &SharedDst<'_, T>,
    start: SidePair<usize>,
    end: SidePair<usize>,
) {
    let depth = packed[Side::Lhs].layout.depth;
    debug_assert_eq!(depth, packed[Side::Rhs].layout.depth);
    let rows = dst.layout().rows;
    let cols = dst.layout().cols;

    let panels: SidePair<&SharedBuf> = SidePair::from_fn(|side| {
        packed[side]
            .data
            .as_ref()
            .expect("kernel on an unallocated buffer")
    });
    // SAFETY: both strips were published before this call and are immutable
    // for the rest of the multiplication.
    let lhs: &[T] = unsafe {
        panels[Side::Lhs].slice(
            start[Side::Lhs] * depth,
            (end[Side::Lhs] - start[Side::Lhs]) * depth,
        )
    };
    let rhs: &[T] = unsafe {
        panels[Side::Rhs].slice(
            start[Side::Rhs] * depth,
            (end[Side::Rhs] - start[Side::Rhs]) * depth,
        )
    };

    for (j_panel, j) in (start[Side::Rhs]..end[Side::Rhs]).enumerate() {
        if j >= cols {
            break;
        }
        let rhs_col = &rhs[j_panel * depth..(j_panel + 1) * depth];
        for (i_panel, i) in (start[Side::Lhs]..end[Side::Lhs]).enumerate() {
            if i >= rows {
                break;
            }
            let lhs_col = &lhs[i_panel * depth..(i_panel + 1) * depth];
            let mut acc = T::default();
            for k in 0..depth {
                acc = acc + lhs_col[k] * rhs_col[k];
            }
            // SAFETY: this tile belongs to this call alone.
            unsafe { dst.write(i, j, acc) };
        }
    }
}

/// A parameter block bound to the reference routines.
///
/// `dst = lhsᵀ · rhs`: `lhs` is `depth × rows`, `rhs` is `depth × cols`,
/// `dst` is `rows × cols`. Shapes are the caller's responsibility here; the
/// [`mul`] wrappers validate them.
pub fn reference_params<'a, T: Element>(
    lhs: Mat<'a, T>,
    rhs: Mat<'a, T>,
    dst: MatMut<'a, T>,
    cache_friendly_traversal_threshold: usize,
) -> TrMulParams<'a> {
    let src_layout = SidePair::new(lhs.layout(), rhs.layout());
    let packed = SidePair::from_fn(|side| PMat::new(packed_layout::<T>(&src_layout[side])));
    let dst = SharedDst::new(dst);

    let run_pack: SidePair<PackFn<'a>> = SidePair::new(
        Box::new(move |pmat: &PMat, _tuning, start, end| pack_strip(lhs, pmat, start, end)),
        Box::new(move |pmat: &PMat, _tuning, start, end| pack_strip(rhs, pmat, start, end)),
    );
    let run_kernel: KernelFn<'a> =
        Box::new(move |packed, _tuning, start, end| kernel_block(packed, &dst, start, end));

    TrMulParams::new(
        src_layout,
        packed,
        SidePair::new(false, false),
        cache_friendly_traversal_threshold,
        run_pack,
        run_kernel,
    )
}

/// Computes `dst = lhsᵀ · rhs` with the reference routines and the default
/// traversal threshold.
pub fn mul<T: Element>(
    lhs: Mat<'_, T>,
    rhs: Mat<'_, T>,
    dst: MatMut<'_, T>,
    context: &mut Context,
) -> Result<()> {
    mul_with_threshold(lhs, rhs, dst, DEFAULT_TRAVERSAL_THRESHOLD, context)
}

/// [`mul`] with an explicit traversal threshold.
pub fn mul_with_threshold<T: Element>(
    lhs: Mat<'_, T>,
    rhs: Mat<'_, T>,
    dst: MatMut<'_, T>,
    cache_friendly_traversal_threshold: usize,
    context: &mut Context,
) -> Result<()> {
    ensure!(
        lhs.layout().rows == rhs.layout().rows,
        "depth mismatch: lhs has {} rows, rhs has {}",
        lhs.layout().rows,
        rhs.layout().rows,
    );
    ensure!(
        dst.layout().rows == lhs.layout().cols && dst.layout().cols == rhs.layout().cols,
        "destination is {}x{}, sources give {}x{}",
        dst.layout().rows,
        dst.layout().cols,
        lhs.layout().cols,
        rhs.layout().cols,
    );
    ensure!(
        lhs.layout().rows > 0 && dst.layout().rows > 0 && dst.layout().cols > 0,
        "empty multiplication",
    );
    let mut params = reference_params(lhs, rhs, dst, cache_friendly_traversal_threshold);
    tr_mul(&mut params, context)
}
