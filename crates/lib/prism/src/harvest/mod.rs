//! Fence-driven result harvesting. Per profiled submission the layer
//! builds a [`HarvestWorker`] that waits for GPU completion, pulls timing
//! samples out of every command buffer in the batch, aligns them onto the
//! CPU timeline and delivers them to the sink. The wait runs inline or on
//! a bounded worker pool, selected by [`HarvestPolicy`].

use crate::{
    calibrate::{CalibrationTimestampPair, GpuTimeline},
    cmdbuf::CommandBufferWrapper,
    dispatch::{DeviceDispatch, FenceWait},
    trace::{ProfilerResult, ResultBatch, TraceSink},
};
use ash::vk;
use crossbeam_channel::{unbounded, Sender};
use serde::Deserialize;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, error};

/// Where the fence wait runs. A per-deployment choice: neither mode is
/// strictly better under load, so measure both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestPolicy {
    /// Wait on the submitting thread. Deterministic, but stalls the app.
    Inline,
    /// Wait on a pooled worker thread; never blocks the caller.
    Worker,
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed-size pool of harvest threads. Bounds peak thread count under
/// heavy submission rates; jobs queue when all threads are busy.
pub struct WorkerPool {
    jobs: Sender<Job>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> Self {
        let (jobs, job_rx) = unbounded::<Job>();
        let threads = (0..thread_count.max(1))
            .map(|index| {
                let job_rx = job_rx.clone();
                thread::Builder::new()
                    .name(format!("prism-harvest-{index}"))
                    .spawn(move || {
                        while let Ok(job) = job_rx.recv() {
                            job();
                        }
                    })
                    .expect("spawning harvest worker thread")
            })
            .collect();
        Self { jobs, threads }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Queues a job. Returns false once the pool has shut down.
    pub fn execute(&self, job: Job) -> bool {
        self.jobs.send(job).is_ok()
    }

    /// Drains the queue and joins every thread. Queued jobs still run.
    pub fn shutdown(self) {
        drop(self.jobs);
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

/// Snapshot of one command buffer's profiler state at submit time.
pub struct CmdBufRecord {
    pub wrapper: Arc<CommandBufferWrapper>,
    pub target_fill: u64,
    pub expected_calls: u32,
}

/// What a harvest run did, for logging and tests. Delivery happens inside
/// the run; this is purely observational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarvestOutcome {
    pub delivered: usize,
    pub failed_buffers: usize,
    pub fence_signaled: bool,
}

/// One in-flight harvest: the fence to wait on, the buffers to drain, and
/// the calibration data to project their samples with. Owned by the
/// scheduler for its lifetime; the queue wrapper only tracks membership.
pub struct HarvestWorker {
    pub id: u64,
    pub queue: u64,
    pub fence: vk::Fence,
    pub fence_is_internal: bool,
    pub records: Vec<CmdBufRecord>,
    pub calibration: CalibrationTimestampPair,
    pub timestamp_period_ns: f32,
    /// Thread that issued the submission.
    pub parent_thread: u64,
}

impl HarvestWorker {
    /// Waits for the fence, extracts and merges per-buffer results, aligns
    /// them, and pushes the batch to the sink. Always runs to completion
    /// and cleans up after itself: an internally owned fence is destroyed
    /// exactly once, on every path out of here.
    pub fn run(
        self,
        dispatch: &dyn DeviceDispatch,
        sink: &dyn TraceSink,
        fence_timeout_ns: u64,
        max_wait_retries: u32,
    ) -> HarvestOutcome {
        let signaled = self.wait_for_completion(dispatch, fence_timeout_ns, max_wait_retries);

        let outcome = if signaled {
            let (results, failed_buffers) = self.extract();
            let delivered = results.len();
            sink.result_batch(ResultBatch {
                queue: self.queue,
                thread: self.parent_thread,
                results,
            });
            HarvestOutcome {
                delivered,
                failed_buffers,
                fence_signaled: true,
            }
        } else {
            HarvestOutcome {
                delivered: 0,
                failed_buffers: self.records.len(),
                fence_signaled: false,
            }
        };

        if self.fence_is_internal {
            dispatch.destroy_fence(self.fence);
        }

        outcome
    }

    fn wait_for_completion(
        &self,
        dispatch: &dyn DeviceDispatch,
        fence_timeout_ns: u64,
        max_wait_retries: u32,
    ) -> bool {
        for _ in 0..max_wait_retries.max(1) {
            match dispatch.wait_for_fences(&[self.fence], fence_timeout_ns) {
                Ok(FenceWait::Signaled) => return true,
                Ok(FenceWait::TimedOut) => continue,
                Err(err) => {
                    error!(
                        queue = %format_args!("0x{:x}", self.queue),
                        worker = self.id,
                        error = %err,
                        "harvest fence wait failed"
                    );
                    return false;
                }
            }
        }
        error!(
            queue = %format_args!("0x{:x}", self.queue),
            worker = self.id,
            retries = max_wait_retries,
            "harvest fence never signaled within the retry budget"
        );
        false
    }

    /// Pulls each buffer's samples up to its submit-time fill generation
    /// and call count. A failing buffer is logged and skipped; the rest of
    /// the batch still delivers. The merged set is ordered by
    /// (buffer, ordinal), so delivery is deterministic regardless of
    /// extraction order.
    fn extract(&self) -> (Vec<ProfilerResult>, usize) {
        let mut merged: Vec<ProfilerResult> = Vec::new();
        let mut failed_buffers = 0;

        for record in &self.records {
            match record
                .wrapper
                .results(record.target_fill, record.expected_calls)
            {
                Ok(results) => merged.extend(results),
                Err(err) => {
                    failed_buffers += 1;
                    error!(
                        command_buffer = %format_args!("0x{:x}", record.wrapper.raw()),
                        queue = %format_args!("0x{:x}", self.queue),
                        error = %err,
                        "failed to retrieve full profiler results"
                    );
                }
            }
        }

        merged.sort_by_key(|result| (result.command_buffer, result.ordinal));

        let timeline = GpuTimeline::new(self.calibration, self.timestamp_period_ns);
        for result in &mut merged {
            result.cpu_begin_ns = timeline.to_cpu_ns(result.gpu_begin_ticks);
            result.cpu_end_ns = timeline.to_cpu_ns(result.gpu_end_ticks);
        }

        (merged, failed_buffers)
    }
}

/// Dispatches harvest workers per the configured policy.
pub struct HarvestScheduler {
    dispatch: Arc<dyn DeviceDispatch>,
    sink: Arc<dyn TraceSink>,
    pool: Option<WorkerPool>,
    policy: HarvestPolicy,
    fence_timeout_ns: u64,
    max_wait_retries: u32,
    next_worker_id: AtomicU64,
}

impl HarvestScheduler {
    pub fn new(
        dispatch: Arc<dyn DeviceDispatch>,
        sink: Arc<dyn TraceSink>,
        policy: HarvestPolicy,
        worker_threads: usize,
        fence_timeout_ns: u64,
        max_wait_retries: u32,
    ) -> Self {
        let pool = match policy {
            HarvestPolicy::Inline => None,
            HarvestPolicy::Worker => Some(WorkerPool::new(worker_threads)),
        };
        Self {
            dispatch,
            sink,
            pool,
            policy,
            fence_timeout_ns,
            max_wait_retries,
            next_worker_id: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> HarvestPolicy {
        self.policy
    }

    pub fn next_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs `worker` per policy. `on_complete` fires after the worker has
    /// delivered and cleaned up, on whichever thread ran it; queue
    /// wrappers use it to drop their in-flight record.
    pub fn schedule(&self, worker: HarvestWorker, on_complete: impl FnOnce() + Send + 'static) {
        match (&self.pool, self.policy) {
            (Some(pool), HarvestPolicy::Worker) => {
                let dispatch = Arc::clone(&self.dispatch);
                let sink = Arc::clone(&self.sink);
                let fence_timeout_ns = self.fence_timeout_ns;
                let max_wait_retries = self.max_wait_retries;
                let queued = pool.execute(Box::new(move || {
                    worker.run(&*dispatch, &*sink, fence_timeout_ns, max_wait_retries);
                    on_complete();
                }));
                if !queued {
                    debug!("harvest pool is shut down; nothing scheduled");
                }
            }
            _ => {
                worker.run(
                    &*self.dispatch,
                    &*self.sink,
                    self.fence_timeout_ns,
                    self.max_wait_retries,
                );
                on_complete();
            }
        }
    }

    /// Joins the worker pool. Called after the device has idled, so every
    /// queued worker completes promptly.
    pub fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}
