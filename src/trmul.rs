/*
 * SPDX-FileCopyrightText: 2024 Tommaso Fontana
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The parallel block-scheduled multiply driver.
//!
//! [`tr_mul`] turns a [`TrMulParams`] block into a finished destination
//! matrix. Small single-threaded problems take a straight-line path: pack
//! both sides, run the kernel once. Everything else goes through the general
//! path, which is a functionally equivalent but scheduled version of the
//! same computation:
//!
//! * the destination is tiled by a [`BlockMap`] whose traversal order keeps
//!   adjacent strips warm across workers;
//! * a fixed set of workers claims block indices from a single shared
//!   counter, so load balancing is dynamic and free of any queue;
//! * each strip of each source is packed exactly once, by whichever worker
//!   claims it first; the claim is a per-strip atomic tri-state, and a
//!   worker that loses a claim race never blocks on the winner, it polls
//!   while trying to make progress on its other strip.
//!
//! The synchronization contract is deliberately minimal: the release store
//! publishing a strip and the acquire loads observing it carry all packed
//! data across threads; the block counter itself is relaxed.

use crate::block_map::BlockMap;
use crate::buf::{AlignedBytes, Allocator};
use crate::context::{Context, Task};
use crate::params::TrMulParams;
use crate::side::{Side, SidePair};
use crate::trace::{ThreadLog, Trace, TraceEvent};
use crate::tune::{Tuning, TuningResolver};
use anyhow::Result;
use crossbeam_utils::CachePadded;
use log::debug;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Packing state of one strip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PackingStatus {
    NotStarted = 0,
    InProgress = 1,
    Finished = 2,
}

impl PackingStatus {
    #[inline(always)]
    fn from_u8(status: u8) -> Self {
        match status {
            0 => PackingStatus::NotStarted,
            1 => PackingStatus::InProgress,
            2 => PackingStatus::Finished,
            _ => unreachable!("corrupted packing status {status}"),
        }
    }
}

/// One atomic tri-state per strip of one side.
///
/// The winner of [`try_claim`](PackingStatusArray::try_claim) is the strip's
/// unique packer; its [`publish`](PackingStatusArray::publish) release-store
/// pairs with the acquire loads of every other worker, making the packed
/// bytes visible to them.
struct PackingStatusArray(Box<[AtomicU8]>);

impl PackingStatusArray {
    fn new(num_strips: usize) -> Self {
        let mut states = Vec::with_capacity(num_strips);
        states.extend((0..num_strips).map(|_| AtomicU8::new(PackingStatus::NotStarted as u8)));
        Self(states.into_boxed_slice())
    }

    #[inline(always)]
    fn len(&self) -> usize {
        self.0.len()
    }

    /// Attempts the `NotStarted → InProgress` transition; the winner must
    /// pack the strip and then [`publish`](PackingStatusArray::publish) it.
    #[inline(always)]
    fn try_claim(&self, strip: usize) -> bool {
        self.0[strip]
            .compare_exchange(
                PackingStatus::NotStarted as u8,
                PackingStatus::InProgress as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Marks the strip `Finished`. Called exactly once per strip, by the
    /// claim winner, after the packed bytes are in place.
    #[inline(always)]
    fn publish(&self, strip: usize) {
        self.0[strip].store(PackingStatus::Finished as u8, Ordering::Release);
    }

    #[inline(always)]
    fn observe(&self, strip: usize) -> PackingStatus {
        PackingStatus::from_u8(self.0[strip].load(Ordering::Acquire))
    }
}

/// Issues block indices past the per-worker seed set, one relaxed
/// `fetch_add` per block.
///
/// Relaxed suffices: the packing tri-state carries all synchronization of
/// packed data, and destination tiles are disjoint. The padding keeps the
/// counter alone in its exclusives reservation granule.
struct BlockCoordinator {
    next_block: CachePadded<AtomicUsize>,
}

impl BlockCoordinator {
    fn new(first_unclaimed: usize) -> Self {
        Self {
            next_block: CachePadded::new(AtomicUsize::new(first_unclaimed)),
        }
    }

    #[inline(always)]
    fn reserve(&self) -> usize {
        self.next_block.fetch_add(1, Ordering::Relaxed)
    }
}

/// The task one worker thread runs for the duration of a multiplication.
struct TrMulTask<'a> {
    params: &'a TrMulParams<'a>,
    block_map: &'a BlockMap,
    coordinator: &'a BlockCoordinator,
    thread_id: usize,
    packing_status: &'a SidePair<Option<PackingStatusArray>>,
    tuning_resolver: &'a mut TuningResolver,
    local_allocator: &'a mut Allocator,
    trace: Option<&'a Trace>,
}

impl Task for TrMulTask<'_> {
    fn run(&mut self) {
        let num_blocks = self.block_map.num_blocks();
        let mut log = ThreadLog::new(self.trace, self.thread_id);
        log.record(TraceEvent::ThreadStart);

        // Local indicators of packedness, so strips this thread has already
        // seen finished cost no atomic load (and no shared cache line).
        let packing_status = self.packing_status;
        let mut local_packed = SidePair::from_fn(|side| {
            packing_status[side]
                .as_ref()
                .map(|status| self.local_allocator.acquire(status.len()))
        });

        let tuning = self.tuning_resolver.resolve();

        // Each worker starts on the block whose index is its own id.
        let mut block_id = self.thread_id;
        log.record(TraceEvent::BlockReserved(block_id));

        while block_id < num_blocks {
            // Reserve the next block before touching the current one: the
            // fetch-add costs a round trip to the shared cache level, and
            // issuing it here hides that latency behind the packing and
            // kernel work below.
            let next_block_id = self.coordinator.reserve();
            log.record(TraceEvent::BlockReserved(next_block_id));

            let block = self.block_map.block_by_index(block_id);
            let (start, end) = self.block_map.block_matrix_coords(block);
            self.ensure_packed(&mut local_packed, &mut log, block, start, end, tuning);
            self.params.run_kernel(tuning, start, end);
            log.record(TraceEvent::BlockFinished(block_id));

            block_id = next_block_id;
        }

        for side in Side::BOTH {
            if let Some(flags) = local_packed[side].take() {
                self.local_allocator.recycle(flags);
            }
        }
        log.record(TraceEvent::ThreadEnd);
        log.finish();
    }
}

impl TrMulTask<'_> {
    /// Guarantees both strips of `block` are packed before returning, without
    /// ever blocking: a strip in flight on another thread is polled, and in
    /// the meantime the loop keeps trying the other side, so a worker waiting
    /// on one strip can still pack the other one itself.
    fn ensure_packed(
        &self,
        local_packed: &mut SidePair<Option<AlignedBytes>>,
        log: &mut ThreadLog,
        block: SidePair<usize>,
        start: SidePair<usize>,
        end: SidePair<usize>,
        tuning: Tuning,
    ) {
        loop {
            let mut both_sides_packed = true;
            for side in Side::BOTH {
                both_sides_packed &= self.try_ensure_packed(
                    local_packed,
                    log,
                    side,
                    block[side],
                    start[side],
                    end[side],
                    tuning,
                );
            }
            if both_sides_packed {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Makes one attempt at having `strip` packed. Returns `false` only when
    /// the strip is currently being packed by another worker.
    #[allow(clippy::too_many_arguments)]
    fn try_ensure_packed(
        &self,
        local_packed: &mut SidePair<Option<AlignedBytes>>,
        log: &mut ThreadLog,
        side: Side,
        strip: usize,
        start: usize,
        end: usize,
        tuning: Tuning,
    ) -> bool {
        // A pre-packed side has no status array: every strip is ready.
        let Some(status) = self.packing_status[side].as_ref() else {
            return true;
        };
        let local = local_packed[side]
            .as_mut()
            .expect("local packed flags missing for a tracked side");
        if local[strip] != 0 {
            return true;
        }
        if status.try_claim(strip) {
            self.params.run_pack(side, tuning, start, end);
            status.publish(strip);
            log.record(TraceEvent::StripPacked(side, strip));
        } else if status.observe(strip) == PackingStatus::InProgress {
            // Another worker is packing this strip right now.
            return false;
        }
        debug_assert_eq!(status.observe(strip), PackingStatus::Finished);
        local[strip] = 1;
        true
    }
}

/// Worker count proportional to the arithmetic work of the multiplication.
fn suggested_thread_count(max_num_threads: usize, rows: usize, cols: usize, depth: usize) -> usize {
    let guess = ((rows as u64 * cols as u64 * depth as u64) >> 13) as usize;
    guess.clamp(1, max_num_threads)
}

/// Returns the buffers of every driver-allocated packed side to the arena.
fn release_packed(params: &mut TrMulParams, allocator: &mut Allocator) {
    for side in Side::BOTH {
        if !params.is_prepacked[side] {
            params.packed[side].release(allocator);
        }
    }
}

/// Runs the multiplication described by `params` to completion.
///
/// On return the destination is fully written and every driver-owned scratch
/// buffer is back in the context arenas. The only fallible step is building
/// the worker pool on first use.
pub fn tr_mul(params: &mut TrMulParams, context: &mut Context) -> Result<()> {
    let rows = params.src_layout[Side::Lhs].cols;
    let cols = params.src_layout[Side::Rhs].cols;
    let depth = params.src_layout[Side::Lhs].rows;

    let mut thread_count = suggested_thread_count(context.max_num_threads, rows, cols, depth);
    let simple = thread_count == 1
        && ((rows + cols) as u64 * depth as u64)
            < params.cache_friendly_traversal_threshold as u64;

    if simple {
        debug!("trmul {rows}x{cols}x{depth}: simple path");
        let tuning = context.main_thread_tuning();
        let rounded_dims =
            SidePair::from_fn(|side| params.packed[side].layout.cols);
        for side in Side::BOTH {
            if !params.is_prepacked[side] {
                params.packed[side].allocate(context.main_allocator());
                params.run_pack(side, tuning, 0, rounded_dims[side]);
            }
        }
        params.run_kernel(tuning, SidePair::new(0, 0), rounded_dims);
        release_packed(params, context.main_allocator());
        return Ok(());
    }

    context.ensure_pool()?;

    let block_map = BlockMap::new(
        SidePair::from_fn(|side| params.packed[side].layout.cols),
        depth,
        SidePair::from_fn(|side| params.packed[side].layout.kernel_cols),
        SidePair::from_fn(|side| params.packed[side].layout.elem_size),
        params.cache_friendly_traversal_threshold,
    );
    // Never more workers than blocks.
    thread_count = thread_count.min(block_map.num_blocks());
    debug!(
        "trmul {rows}x{cols}x{depth}: general path, {} blocks on {thread_count} threads",
        block_map.num_blocks(),
    );

    context.ensure_n_per_thread_states(thread_count);
    let explicit_tuning = context.explicit_tuning;
    for state in &mut context.per_thread_states {
        state.tuning_resolver.set_explicit(explicit_tuning);
    }

    for side in Side::BOTH {
        if !params.is_prepacked[side] {
            params.packed[side].allocate(context.main_allocator());
        }
    }
    let packing_status = SidePair::from_fn(|side| {
        (!params.is_prepacked[side])
            .then(|| PackingStatusArray::new(block_map.num_blocks_per_side(side)))
    });

    // Indices below the thread count are the workers' seed blocks.
    let coordinator = BlockCoordinator::new(thread_count);
    let trace = context.tracing.then(Trace::new);

    {
        let params: &TrMulParams = params;
        let Context {
            pool,
            per_thread_states,
            ..
        } = &mut *context;
        let pool = pool.as_ref().expect("worker pool initialized above");
        let mut tasks: Vec<TrMulTask> = per_thread_states[..thread_count]
            .iter_mut()
            .enumerate()
            .map(|(thread_id, state)| TrMulTask {
                params,
                block_map: &block_map,
                coordinator: &coordinator,
                thread_id,
                packing_status: &packing_status,
                tuning_resolver: &mut state.tuning_resolver,
                local_allocator: &mut state.allocator,
                trace: trace.as_ref(),
            })
            .collect();
        pool.execute(&mut tasks);
    }

    context.last_trace = trace;
    release_packed(params, context.main_allocator());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_race_has_one_winner() {
        let status = PackingStatusArray::new(4);
        assert!(status.try_claim(2));
        assert!(!status.try_claim(2));
        assert_eq!(status.observe(2), PackingStatus::InProgress);
        status.publish(2);
        assert_eq!(status.observe(2), PackingStatus::Finished);
        assert!(!status.try_claim(2));
        // Untouched strips are unaffected.
        assert_eq!(status.observe(0), PackingStatus::NotStarted);
    }

    #[test]
    fn test_coordinator_counts_from_seed() {
        let coordinator = BlockCoordinator::new(3);
        assert_eq!(coordinator.reserve(), 3);
        assert_eq!(coordinator.reserve(), 4);
        assert_eq!(coordinator.reserve(), 5);
    }

    #[test]
    fn test_thread_count_tracks_work() {
        // Tiny problems stay single-threaded.
        assert_eq!(suggested_thread_count(8, 8, 8, 8), 1);
        // 256³ wants far more threads than the cap.
        assert_eq!(suggested_thread_count(4, 256, 256, 256), 4);
        assert_eq!(suggested_thread_count(usize::MAX, 256, 256, 256), 2048);
    }
}
