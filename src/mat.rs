/*
 * SPDX-FileCopyrightText: 2024 Tommaso Fontana
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Matrix layouts, typed source/destination views, and the erased
//! packed-matrix descriptors the scheduling core manipulates.
//!
//! The core never touches element data: it sees sources and packed matrices
//! only through their layouts (for sizing the block map and the scratch
//! buffers) and hands the actual data movement to the callbacks in
//! [`TrMulParams`](crate::params::TrMulParams). The typed views here are the
//! currency of the reference callbacks in [`dispatch`](crate::dispatch) and
//! of user-supplied ones.

use crate::buf::{Allocator, SharedBuf};

/// Column-major layout of a matrix: `rows × cols` elements, column `c`
/// starting at element offset `c * stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub rows: usize,
    pub cols: usize,
    pub stride: usize,
}

impl Layout {
    /// A packed column-major layout (`stride == rows`).
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            stride: rows,
        }
    }

    pub fn with_stride(rows: usize, cols: usize, stride: usize) -> Self {
        assert!(stride >= rows, "stride {stride} smaller than {rows} rows");
        Self { rows, cols, stride }
    }

    /// Offset of element `(row, col)`.
    #[inline(always)]
    pub fn offset(&self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.rows && col < self.cols);
        col * self.stride + row
    }

    /// Number of elements a buffer must hold to back this layout.
    pub fn required_len(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            (self.cols - 1) * self.stride + self.rows
        }
    }
}

/// Read-only view of a caller-owned column-major matrix.
#[derive(Debug)]
pub struct Mat<'a, T> {
    layout: Layout,
    data: &'a [T],
}

impl<T> Clone for Mat<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Mat<'_, T> {}

impl<'a, T> Mat<'a, T> {
    pub fn new(layout: Layout, data: &'a [T]) -> Self {
        assert!(
            data.len() >= layout.required_len(),
            "{} elements cannot back a {}x{} matrix with stride {}",
            data.len(),
            layout.rows,
            layout.cols,
            layout.stride,
        );
        Self { layout, data }
    }

    #[inline(always)]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The elements of column `col`.
    #[inline(always)]
    pub fn col(&self, col: usize) -> &'a [T] {
        let start = col * self.layout.stride;
        &self.data[start..start + self.layout.rows]
    }

    #[inline(always)]
    pub fn get(&self, row: usize, col: usize) -> &T {
        &self.data[self.layout.offset(row, col)]
    }
}

/// Mutable view of a caller-owned column-major matrix.
#[derive(Debug)]
pub struct MatMut<'a, T> {
    layout: Layout,
    data: &'a mut [T],
}

impl<'a, T> MatMut<'a, T> {
    pub fn new(layout: Layout, data: &'a mut [T]) -> Self {
        assert!(
            data.len() >= layout.required_len(),
            "{} elements cannot back a {}x{} matrix with stride {}",
            data.len(),
            layout.rows,
            layout.cols,
            layout.stride,
        );
        Self { layout, data }
    }

    #[inline(always)]
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Consumes the view, returning the backing slice.
    #[inline(always)]
    pub(crate) fn into_slice(self) -> &'a mut [T] {
        self.data
    }
}

/// Layout of a packed matrix: a `depth × cols` column-major panel whose
/// column count has been rounded up to a multiple of the kernel width, so
/// that every kernel invocation sees whole panels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLayout {
    /// Rows of the panel; the depth of the multiplication.
    pub depth: usize,
    /// Columns of the panel, a multiple of `kernel_cols`.
    pub cols: usize,
    /// Packing granularity along the columns.
    pub kernel_cols: usize,
    /// Size in bytes of one element.
    pub elem_size: usize,
    /// Size in bytes of one column-sum entry; zero when the kernel keeps no
    /// column sums.
    pub sums_elem_size: usize,
}

impl PackedLayout {
    /// Size in bytes of the packed data buffer.
    pub fn data_size(&self) -> usize {
        self.depth * self.cols * self.elem_size
    }

    /// Size in bytes of the column-sums buffer.
    pub fn sums_size(&self) -> usize {
        self.cols * self.sums_elem_size
    }
}

/// A packed-matrix descriptor: the layout plus the shared buffers the packing
/// callbacks fill.
///
/// The driver allocates the buffers from the context arena right before the
/// multiplication and reclaims them right after, unless the side is
/// pre-packed, in which case the caller owns them.
#[derive(Debug)]
pub struct PMat {
    pub layout: PackedLayout,
    pub data: Option<SharedBuf>,
    pub sums: Option<SharedBuf>,
}

impl PMat {
    /// A descriptor with no buffers attached.
    pub fn new(layout: PackedLayout) -> Self {
        Self {
            layout,
            data: None,
            sums: None,
        }
    }

    /// Attaches buffers sized for the layout, leaving already-attached ones
    /// in place.
    pub fn allocate(&mut self, allocator: &mut Allocator) {
        if self.data.is_none() {
            self.data = Some(SharedBuf::new(allocator.acquire(self.layout.data_size())));
        }
        if self.sums.is_none() && self.layout.sums_size() > 0 {
            self.sums = Some(SharedBuf::new(allocator.acquire(self.layout.sums_size())));
        }
    }

    /// Detaches the buffers and returns them to `allocator`.
    pub fn release(&mut self, allocator: &mut Allocator) {
        if let Some(data) = self.data.take() {
            allocator.recycle(data.into_inner());
        }
        if let Some(sums) = self.sums.take() {
            allocator.recycle(sums.into_inner());
        }
    }
}
