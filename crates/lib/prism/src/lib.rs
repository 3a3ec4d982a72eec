//! Transparent GPU command-stream interception and profiling harvest.
//!
//! The layer sits between an application and its driver's submission
//! entry points: it records every call, injects frame-capture work ahead
//! of application command buffers without changing observable semantics,
//! and pulls GPU timing data back off completed submissions without
//! blocking the render thread. The driver is reached exclusively through
//! [`dispatch::DeviceDispatch`]; captured data leaves through
//! [`trace::TraceSink`]; control arrives through
//! [`control::RequestSource`].

pub mod calibrate;
pub mod capture;
pub mod cmdbuf;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod harvest;
pub mod queue;
pub mod submit;
pub mod trace;

pub use crate::{
    capture::{CaptureRequest, CpuImage},
    control::{ControlRequest, RequestSource},
    dispatch::{AshDispatch, DeviceDispatch},
    error::{CaptureError, DriverError, DriverResult, ProfilerError},
    harvest::HarvestPolicy,
    trace::{CallRecord, FuncId, ProfilerResult, ResultBatch, TraceSink},
};

use crate::{
    calibrate::Clock,
    cmdbuf::CommandBufferWrapper,
    control::NullSource,
    harvest::HarvestScheduler,
    queue::QueueWrapper,
    trace::{fmt_handle, fmt_status, Interceptor},
};
use anyhow::Context as _;
use ash::vk::{self, Handle};
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{error, info, warn};
use wrapper_registry::Registry;

/// Layer behavior knobs. Deserializable so an embedding can ship them as
/// JSON next to its other settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Where fence waits run; see [`HarvestPolicy`].
    pub harvest_policy: HarvestPolicy,
    /// Thread count for the worker pool when the policy is `Worker`.
    pub harvest_threads: usize,
    /// Upper bound of one fence wait before it is retried.
    pub fence_timeout_ns: u64,
    /// Retries before a harvest is abandoned as failed.
    pub max_fence_wait_retries: u32,
    /// Collect GPU timing alongside the call trace.
    pub collect_gpu_time: bool,
    /// Start with tracing already enabled, instead of waiting for the
    /// control channel to switch it on.
    pub start_active: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            harvest_policy: HarvestPolicy::Worker,
            harvest_threads: 2,
            fence_timeout_ns: 1_000_000_000,
            max_fence_wait_retries: 16,
            collect_gpu_time: true,
            start_active: false,
        }
    }
}

impl LayerConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("parsing layer config")
    }
}

/// The explicit context object owning every piece of the layer: dispatch
/// table, interceptor, registries, harvest scheduler. One per device;
/// lifecycle belongs to process-level setup and teardown.
pub struct LayerContext {
    dispatch: Arc<dyn DeviceDispatch>,
    interceptor: Interceptor,
    scheduler: HarvestScheduler,
    requests: Box<dyn RequestSource>,
    clock: Clock,
    queues: Registry<QueueWrapper>,
    command_buffers: Registry<CommandBufferWrapper>,
    collect_gpu_time: bool,
    frame_index: AtomicU64,
}

impl LayerContext {
    pub fn new(
        dispatch: Arc<dyn DeviceDispatch>,
        sink: Arc<dyn TraceSink>,
        requests: Box<dyn RequestSource>,
        config: LayerConfig,
    ) -> Self {
        let clock = Clock::new();
        let interceptor = Interceptor::new(Arc::clone(&sink), clock);
        interceptor.set_active(config.start_active);

        let scheduler = HarvestScheduler::new(
            Arc::clone(&dispatch),
            sink,
            config.harvest_policy,
            config.harvest_threads,
            config.fence_timeout_ns,
            config.max_fence_wait_retries,
        );

        Self {
            dispatch,
            interceptor,
            scheduler,
            requests,
            clock,
            queues: Registry::new(),
            command_buffers: Registry::new(),
            collect_gpu_time: config.collect_gpu_time,
            frame_index: AtomicU64::new(0),
        }
    }

    /// A context with no trace consumer and no control channel; tracing
    /// state is driven through [`LayerContext::set_tracing`].
    pub fn detached(dispatch: Arc<dyn DeviceDispatch>, config: LayerConfig) -> Self {
        Self::new(
            dispatch,
            Arc::new(trace::NullSink),
            Box::new(NullSource),
            config,
        )
    }

    pub(crate) fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    pub(crate) fn scheduler(&self) -> &HarvestScheduler {
        &self.scheduler
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn command_buffers(&self) -> &Registry<CommandBufferWrapper> {
        &self.command_buffers
    }

    pub(crate) fn collect_gpu_time(&self) -> bool {
        self.collect_gpu_time
    }

    pub fn set_tracing(&self, enabled: bool) {
        self.interceptor.set_active(enabled);
    }

    pub fn tracing_active(&self) -> bool {
        self.interceptor.is_active()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index.load(Ordering::Relaxed)
    }

    // --- wrapped entry points ---

    /// `vkGetDeviceQueue`. Wraps the queue on first sight; later calls for
    /// the same handle are no-ops.
    pub fn get_device_queue(&self, queue: vk::Queue, family_index: u32) {
        self.interceptor.call(
            FuncId::GetDeviceQueue,
            || format!("{}, {}", fmt_handle(queue), family_index),
            || ((), "VK_SUCCESS"),
        );

        if self.queues.get(queue.as_raw()).is_none() {
            let wrapper = QueueWrapper::new(queue, family_index, Arc::clone(&self.dispatch));
            if self.queues.insert(queue.as_raw(), wrapper).is_ok() {
                info!(
                    queue = %format_args!("0x{:x}", queue.as_raw()),
                    family_index, "wrapped queue"
                );
            }
        }
    }

    /// `vkAllocateCommandBuffers`. Forwards, then wraps each returned
    /// handle.
    pub fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo,
    ) -> DriverResult<Vec<vk::CommandBuffer>> {
        let cmds = self.interceptor.call(
            FuncId::AllocateCommandBuffers,
            || format!("{} command buffers", info.command_buffer_count),
            || {
                let result = self.dispatch.allocate_app_command_buffers(info);
                let status = match &result {
                    Ok(_) => "VK_SUCCESS",
                    Err(err) => err.status(),
                };
                (result, status)
            },
        )?;

        for cmd in &cmds {
            let wrapper = CommandBufferWrapper::new(*cmd, Arc::clone(&self.dispatch));
            let _ = self.command_buffers.insert(cmd.as_raw(), wrapper);
        }
        Ok(cmds)
    }

    /// `vkFreeCommandBuffers`. Unwraps before forwarding; missing wrappers
    /// are fine, the handles just pass straight through.
    pub fn free_command_buffers(&self, pool: vk::CommandPool, cmds: &[vk::CommandBuffer]) {
        for cmd in cmds {
            if let Some(wrapper) = self.command_buffers.remove(cmd.as_raw()) {
                wrapper.release();
            }
        }
        self.interceptor.call(
            FuncId::FreeCommandBuffers,
            || format!("{}, {} command buffers", fmt_handle(pool), cmds.len()),
            || {
                self.dispatch.free_app_command_buffers(pool, cmds);
                ((), "VK_SUCCESS")
            },
        )
    }

    /// `vkBeginCommandBuffer`. Advances the wrapper's fill generation once
    /// the driver has accepted the begin.
    pub fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo,
    ) -> DriverResult<()> {
        let result = self.interceptor.call(
            FuncId::BeginCommandBuffer,
            || fmt_handle(cmd),
            || {
                let result = self.dispatch.begin_app_command_buffer(cmd, info);
                (result, fmt_status(result))
            },
        );

        if result.is_ok() {
            if let Some(wrapper) = self.command_buffers.get(cmd.as_raw()) {
                wrapper.on_begin();
            }
        }
        result
    }

    /// `vkEndCommandBuffer`.
    pub fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> DriverResult<()> {
        self.interceptor.call(
            FuncId::EndCommandBuffer,
            || fmt_handle(cmd),
            || {
                let result = self.dispatch.end_command_buffer(cmd);
                (result, fmt_status(result))
            },
        )
    }

    /// `vkCmdDraw`, bracketed with profiler timestamps when collection is
    /// on.
    pub fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.profiled_cmd(cmd, FuncId::CmdDraw, || {
            format!(
                "{}, {vertex_count}, {instance_count}, {first_vertex}, {first_instance}",
                fmt_handle(cmd)
            )
        }, || {
            self.dispatch
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        })
    }

    /// `vkCmdDrawIndexed`.
    pub fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.profiled_cmd(cmd, FuncId::CmdDrawIndexed, || {
            format!(
                "{}, {index_count}, {instance_count}, {first_index}, {vertex_offset}, {first_instance}",
                fmt_handle(cmd)
            )
        }, || {
            self.dispatch.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        })
    }

    /// `vkCmdDispatch`.
    pub fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.profiled_cmd(
            cmd,
            FuncId::CmdDispatch,
            || format!("{}, {x}, {y}, {z}", fmt_handle(cmd)),
            || self.dispatch.cmd_dispatch(cmd, x, y, z),
        )
    }

    fn profiled_cmd(
        &self,
        cmd: vk::CommandBuffer,
        func: FuncId,
        arguments: impl FnOnce() -> String,
        record: impl FnOnce(),
    ) {
        let profile = self.interceptor.is_active() && self.collect_gpu_time;
        self.interceptor.call(func, arguments, || {
            match self.command_buffers.get(cmd.as_raw()) {
                Some(wrapper) if profile => wrapper.profile_call(func, record),
                _ => record(),
            }
            ((), "VK_SUCCESS")
        })
    }

    /// `vkQueueSubmit`. An unwrapped queue falls back to the raw driver
    /// path.
    pub fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        match self.queues.get(queue.as_raw()) {
            Some(wrapper) => wrapper.submit(self, submits, fence),
            None => self.dispatch.queue_submit(queue, submits, fence),
        }
    }

    /// `vkQueueBindSparse`.
    pub fn queue_bind_sparse(
        &self,
        queue: vk::Queue,
        infos: &[vk::BindSparseInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        match self.queues.get(queue.as_raw()) {
            Some(wrapper) => wrapper.bind_sparse(self, infos, fence),
            None => self.dispatch.queue_bind_sparse(queue, infos, fence),
        }
    }

    /// `vkQueueWaitIdle`.
    pub fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()> {
        match self.queues.get(queue.as_raw()) {
            Some(wrapper) => wrapper.wait_idle(self),
            None => self.dispatch.queue_wait_idle(queue),
        }
    }

    /// `vkQueuePresentKHR`. The present boundary is where control
    /// requests are drained and the frame counter advances.
    pub fn queue_present(
        &self,
        queue: vk::Queue,
        info: &vk::PresentInfoKHR,
    ) -> DriverResult<bool> {
        match self.queues.get(queue.as_raw()) {
            Some(wrapper) => wrapper.present(self, info),
            None => {
                let result = self.dispatch.queue_present(queue, info);
                self.on_present_boundary();
                result
            }
        }
    }

    /// Records capture settings for the next submission on `queue`.
    /// Returns false if the queue was never wrapped.
    pub fn request_capture(&self, queue: u64, request: CaptureRequest) -> bool {
        match self.queues.get(queue) {
            Some(wrapper) => {
                wrapper.request_capture(request);
                true
            }
            None => {
                warn!(
                    queue = %format_args!("0x{queue:x}"),
                    "capture requested for unknown queue"
                );
                false
            }
        }
    }

    /// The most recently completed capture for `queue`, or `None` while
    /// no capture has finished yet.
    pub fn last_captured_image(&self, queue: u64, aux: bool) -> Option<Arc<CpuImage>> {
        self.queues.get(queue)?.last_captured_image(aux)
    }

    pub(crate) fn on_present_boundary(&self) {
        for request in self.requests.drain() {
            match request {
                ControlRequest::SetTracing { enabled } => {
                    info!(enabled, "tracing toggled by controller");
                    self.interceptor.set_active(enabled);
                }
                ControlRequest::Capture { queue, request } => {
                    self.request_capture(queue, request);
                }
            }
        }
        self.frame_index.fetch_add(1, Ordering::Relaxed);
    }

    /// Tears the layer down: idles the device, drains every outstanding
    /// harvest worker, then releases the wrapper registries.
    pub fn shutdown(&mut self) {
        if let Err(err) = self.dispatch.device_wait_idle() {
            error!(error = %err, "device failed to idle during shutdown");
        }
        self.scheduler.shutdown();

        for wrapper in self.command_buffers.clear() {
            wrapper.release();
        }
        self.queues.clear();
    }
}
