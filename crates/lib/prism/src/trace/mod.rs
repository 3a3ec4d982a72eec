//! Call tracing. Every intercepted entry point funnels through
//! [`Interceptor::call`], which forwards untraced calls with no extra work
//! and brackets traced calls with pre/post records pushed to the sink.

use crate::calibrate::Clock;
use ash::vk::{self, Handle};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

/// Intercepted entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FuncId {
    GetDeviceQueue,
    AllocateCommandBuffers,
    FreeCommandBuffers,
    BeginCommandBuffer,
    EndCommandBuffer,
    CmdDraw,
    CmdDrawIndexed,
    CmdDispatch,
    QueueSubmit,
    QueueBindSparse,
    QueueWaitIdle,
    QueuePresent,
}

impl FuncId {
    pub fn name(self) -> &'static str {
        match self {
            FuncId::GetDeviceQueue => "vkGetDeviceQueue",
            FuncId::AllocateCommandBuffers => "vkAllocateCommandBuffers",
            FuncId::FreeCommandBuffers => "vkFreeCommandBuffers",
            FuncId::BeginCommandBuffer => "vkBeginCommandBuffer",
            FuncId::EndCommandBuffer => "vkEndCommandBuffer",
            FuncId::CmdDraw => "vkCmdDraw",
            FuncId::CmdDrawIndexed => "vkCmdDrawIndexed",
            FuncId::CmdDispatch => "vkCmdDispatch",
            FuncId::QueueSubmit => "vkQueueSubmit",
            FuncId::QueueBindSparse => "vkQueueBindSparse",
            FuncId::QueueWaitIdle => "vkQueueWaitIdle",
            FuncId::QueuePresent => "vkQueuePresentKHR",
        }
    }
}

/// One traced call: pre-call fields captured before the driver is invoked,
/// post-call fields filled in on return.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub func: FuncId,
    pub thread: u64,
    pub arguments: String,
    pub start_ns: u64,
    pub end_ns: u64,
    pub status: &'static str,
}

/// One aligned timing sample, keyed by (command buffer, call ordinal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfilerResult {
    pub command_buffer: u64,
    pub ordinal: u32,
    pub func: FuncId,
    pub gpu_begin_ticks: u64,
    pub gpu_end_ticks: u64,
    pub cpu_begin_ns: u64,
    pub cpu_end_ns: u64,
}

/// A harvested submission's worth of aligned results.
#[derive(Debug, Clone, Serialize)]
pub struct ResultBatch {
    pub queue: u64,
    pub thread: u64,
    pub results: Vec<ProfilerResult>,
}

/// Append-only consumer of trace data. Implementations must not block the
/// producer; the render thread calls straight into this.
pub trait TraceSink: Send + Sync {
    fn call_record(&self, record: CallRecord);
    fn result_batch(&self, batch: ResultBatch);
}

/// Sink that forwards onto unbounded channels drained by the external
/// recorder. Sends never block; if the recorder went away the data is
/// dropped, which is the contract (tracing must not perturb the app).
pub struct ChannelSink {
    calls: Sender<CallRecord>,
    results: Sender<ResultBatch>,
}

impl ChannelSink {
    pub fn new(calls: Sender<CallRecord>, results: Sender<ResultBatch>) -> Self {
        Self { calls, results }
    }
}

impl TraceSink for ChannelSink {
    fn call_record(&self, record: CallRecord) {
        let _ = self.calls.send(record);
    }

    fn result_batch(&self, batch: ResultBatch) {
        let _ = self.results.send(batch);
    }
}

/// Sink for running with tracing compiled in but disconnected.
pub struct NullSink;

impl TraceSink for NullSink {
    fn call_record(&self, _record: CallRecord) {}
    fn result_batch(&self, _batch: ResultBatch) {}
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Small, stable numeric id for the calling thread.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// The per-entry-point shim. Owns the active flag; everything else is
/// borrowed from the layer context.
pub struct Interceptor {
    active: AtomicBool,
    sink: Arc<dyn TraceSink>,
    clock: Clock,
}

impl Interceptor {
    pub fn new(sink: Arc<dyn TraceSink>, clock: Clock) -> Self {
        Self {
            active: AtomicBool::new(false),
            sink,
            clock,
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Runs `call`, recording a pre/post trace entry around it when tracing
    /// is active. `arguments` is only evaluated on the traced path, so the
    /// inactive path does no formatting work.
    pub fn call<T>(
        &self,
        func: FuncId,
        arguments: impl FnOnce() -> String,
        call: impl FnOnce() -> (T, &'static str),
    ) -> T {
        if !self.is_active() {
            return call().0;
        }

        let thread = current_thread_id();
        let arguments = arguments();
        let start_ns = self.clock.now_ns();
        let (value, status) = call();
        let end_ns = self.clock.now_ns();

        self.sink.call_record(CallRecord {
            func,
            thread,
            arguments,
            start_ns,
            end_ns,
            status,
        });

        value
    }

    pub fn sink(&self) -> &Arc<dyn TraceSink> {
        &self.sink
    }
}

/// Renders a handle the way the trace viewer expects them.
pub fn fmt_handle<H: Handle>(handle: H) -> String {
    format!("0x{:x}", handle.as_raw())
}

/// Renders a driver status for post-call records.
pub fn fmt_status(result: Result<(), crate::error::DriverError>) -> &'static str {
    match result {
        Ok(()) => crate::error::status_str(vk::Result::SUCCESS),
        Err(err) => err.status(),
    }
}
