/*
 * SPDX-FileCopyrightText: 2024 Tommaso Fontana
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The environment a multiplication runs in: the worker thread pool, one
//! state slot per worker, the main arena, and the tuning and tracing knobs.
//!
//! A [`Context`] is meant to be created once and passed to every
//! multiplication: the pool threads, the per-thread arenas and the cached
//! tuning resolutions all amortize across calls.

use crate::buf::Allocator;
use crate::trace::Trace;
use crate::tune::{Tuning, TuningResolver};
use anyhow::{Context as _, Result};

/// State owned by one worker thread: its tuning resolution and its private
/// arena, so workers never contend on allocation.
#[derive(Debug, Default)]
pub struct PerThreadState {
    pub tuning_resolver: TuningResolver,
    pub allocator: Allocator,
}

/// A task dispatched to the worker pool.
pub(crate) trait Task: Send {
    fn run(&mut self);
}

/// A fixed-size pool running one task per worker, synchronously.
pub(crate) struct ThreadPool {
    pool: rayon::ThreadPool,
    num_threads: usize,
}

impl ThreadPool {
    fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("trmul-{}", i))
            .build()
            .context("Could not create worker thread pool")?;
        Ok(Self { pool, num_threads })
    }

    pub(crate) fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Runs every task in parallel and returns when all have finished.
    pub(crate) fn execute<T: Task>(&self, tasks: &mut [T]) {
        debug_assert!(tasks.len() <= self.num_threads);
        self.pool.scope(|scope| {
            for task in tasks.iter_mut() {
                scope.spawn(move |_| task.run());
            }
        });
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

/// The reusable environment of a multiplication.
#[derive(Debug)]
pub struct Context {
    /// Upper bound on the number of workers; the actual count is derived per
    /// call from the problem size.
    pub max_num_threads: usize,
    /// Tuning forced on every worker; [`Tuning::Auto`] resolves per thread.
    pub explicit_tuning: Tuning,
    /// Record the schedule of the next general-path run; see
    /// [`take_trace`](Context::take_trace).
    pub tracing: bool,
    pub(crate) main_allocator: Allocator,
    main_tuning_resolver: TuningResolver,
    pub(crate) per_thread_states: Vec<PerThreadState>,
    pub(crate) pool: Option<ThreadPool>,
    pub(crate) last_trace: Option<Trace>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A context using all available cores.
    pub fn new() -> Self {
        Self::with_max_threads(num_cpus::get())
    }

    pub fn with_max_threads(max_num_threads: usize) -> Self {
        Self {
            max_num_threads: max_num_threads.max(1),
            explicit_tuning: Tuning::Auto,
            tracing: false,
            main_allocator: Allocator::new(),
            main_tuning_resolver: TuningResolver::new(),
            per_thread_states: Vec::new(),
            pool: None,
            last_trace: None,
        }
    }

    /// The arena backing packed buffers and other call-scoped shared state.
    pub fn main_allocator(&mut self) -> &mut Allocator {
        &mut self.main_allocator
    }

    /// The tuning the calling thread itself runs with (used by the
    /// single-threaded fast path).
    pub fn main_thread_tuning(&mut self) -> Tuning {
        let explicit = self.explicit_tuning;
        self.main_tuning_resolver.set_explicit(explicit);
        self.main_tuning_resolver.resolve()
    }

    /// The schedule recorded by the last traced run, if any.
    pub fn take_trace(&mut self) -> Option<Trace> {
        self.last_trace.take()
    }

    /// Builds (or rebuilds, after `max_num_threads` changed) the worker
    /// pool.
    pub(crate) fn ensure_pool(&mut self) -> Result<()> {
        if self.pool.as_ref().map(ThreadPool::num_threads) != Some(self.max_num_threads) {
            self.pool = Some(ThreadPool::new(self.max_num_threads)?);
        }
        Ok(())
    }

    /// Makes sure at least `n` per-thread state slots exist.
    pub(crate) fn ensure_n_per_thread_states(&mut self, n: usize) {
        while self.per_thread_states.len() < n {
            self.per_thread_states.push(PerThreadState::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountTask<'a>(&'a AtomicUsize);

    impl Task for CountTask<'_> {
        fn run(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_execute_runs_all_tasks() {
        let counter = AtomicUsize::new(0);
        let pool = ThreadPool::new(4).unwrap();
        let mut tasks: Vec<CountTask> = (0..4).map(|_| CountTask(&counter)).collect();
        pool.execute(&mut tasks);
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_pool_rebuilds_on_resize() {
        let mut ctx = Context::with_max_threads(2);
        ctx.ensure_pool().unwrap();
        assert_eq!(ctx.pool.as_ref().unwrap().num_threads(), 2);
        ctx.max_num_threads = 3;
        ctx.ensure_pool().unwrap();
        assert_eq!(ctx.pool.as_ref().unwrap().num_threads(), 3);
    }

    #[test]
    fn test_per_thread_states_grow_only() {
        let mut ctx = Context::with_max_threads(4);
        ctx.ensure_n_per_thread_states(3);
        assert_eq!(ctx.per_thread_states.len(), 3);
        ctx.ensure_n_per_thread_states(2);
        assert_eq!(ctx.per_thread_states.len(), 3);
    }
}
