//! Wrapped queues. A `QueueWrapper` owns everything queue-scoped: the
//! capability probe, pending capture settings, the last-captured double
//! buffer, and the in-flight harvest bookkeeping. The submit path here is
//! the layer's hot spot: it augments the command stream for captures,
//! manufactures fences for profiled submissions, and hands harvest
//! workers to the scheduler without ever blocking on them.

use crate::{
    calibrate::CalibrationTimestampPair,
    capture::{CaptureFailureLog, CaptureRequest, CapturedImageSlot, CpuImage, ImageRenderer},
    dispatch::DeviceDispatch,
    error::DriverResult,
    harvest::{CmdBufRecord, HarvestWorker},
    submit::{command_buffers_of, SubmissionBatch},
    trace::{current_thread_id, fmt_handle, fmt_status, FuncId},
    LayerContext,
};
use ash::vk::{self, Handle};
use bitflags::bitflags;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tracing::{debug, warn};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueCaps: u32 {
        /// Queues of this family write valid GPU timestamps.
        const TIMESTAMPS = 1 << 0;
    }
}

struct InFlight {
    worker_id: u64,
}

pub struct QueueWrapper {
    handle: vk::Queue,
    family_index: u32,
    caps: QueueCaps,
    dispatch: Arc<dyn DeviceDispatch>,
    renderer: ImageRenderer,
    pending_capture: Mutex<Option<CaptureRequest>>,
    last_image: CapturedImageSlot,
    last_image_aux: CapturedImageSlot,
    capture_failures: CaptureFailureLog,
    calibration_warned: AtomicBool,
    fence_warned: AtomicBool,
    in_flight: Mutex<Vec<InFlight>>,
}

impl QueueWrapper {
    pub fn new(handle: vk::Queue, family_index: u32, dispatch: Arc<dyn DeviceDispatch>) -> Self {
        let mut caps = QueueCaps::empty();
        if dispatch.queue_family_supports_timestamps(family_index) {
            caps |= QueueCaps::TIMESTAMPS;
        }
        Self {
            handle,
            family_index,
            caps,
            renderer: ImageRenderer::new(Arc::clone(&dispatch)),
            dispatch,
            pending_capture: Mutex::new(None),
            last_image: CapturedImageSlot::default(),
            last_image_aux: CapturedImageSlot::default(),
            capture_failures: CaptureFailureLog::default(),
            calibration_warned: AtomicBool::new(false),
            fence_warned: AtomicBool::new(false),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn raw(&self) -> u64 {
        self.handle.as_raw()
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn caps(&self) -> QueueCaps {
        self.caps
    }

    /// Records the desired capture for the next submission. At most one
    /// capture is honored per present interval; a request arriving while
    /// one is already pending is ignored until the pending one is
    /// consumed.
    pub fn request_capture(&self, request: CaptureRequest) {
        let mut pending = self.pending_capture.lock().unwrap();
        if pending.is_some() {
            debug!(
                queue = %format_args!("0x{:x}", self.raw()),
                "capture request ignored; one is already pending"
            );
            return;
        }
        *pending = Some(request);
    }

    /// A copy of the most recently completed capture, decoupled from any
    /// capture in flight. `None` until the first capture succeeds.
    pub fn last_captured_image(&self, aux: bool) -> Option<Arc<CpuImage>> {
        if aux {
            self.last_image_aux.load()
        } else {
            self.last_image.load()
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    fn register_worker(&self, worker_id: u64) {
        self.in_flight.lock().unwrap().push(InFlight { worker_id });
    }

    fn complete_worker(&self, worker_id: u64) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(index) = in_flight
            .iter()
            .position(|entry| entry.worker_id == worker_id)
        {
            in_flight.swap_remove(index);
        }
    }

    /// The `vkQueueSubmit` shim. Propagates the driver's result verbatim;
    /// everything the layer adds (capture injection, fence manufacture,
    /// harvest scheduling) happens around the real call.
    pub fn submit(
        self: &Arc<Self>,
        layer: &LayerContext,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        let profiling = self.caps.contains(QueueCaps::TIMESTAMPS)
            && layer.interceptor().is_active()
            && layer.collect_gpu_time();

        if !profiling {
            return self.submit_with_capture(layer, submits, fence);
        }

        let records = self.gather_records(layer, submits);
        if records.is_empty() {
            return self.submit_with_capture(layer, submits, fence);
        }

        // Calibration is captured immediately before the submission so the
        // pair brackets this batch as tightly as possible.
        let calibration =
            match CalibrationTimestampPair::collect(&*self.dispatch, self.handle, layer.clock()) {
                Ok(pair) => pair,
                Err(err) => {
                    if !self.calibration_warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            queue = %format_args!("0x{:x}", self.raw()),
                            error = %err,
                            "calibration failed; submitting unprofiled"
                        );
                    }
                    return self.submit_with_capture(layer, submits, fence);
                }
            };

        let mut fence_to_wait = fence;
        let mut fence_is_internal = false;
        if fence_to_wait == vk::Fence::null() {
            match self.dispatch.create_fence() {
                Ok(internal) => {
                    fence_to_wait = internal;
                    fence_is_internal = true;
                }
                Err(err) => {
                    if !self.fence_warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            queue = %format_args!("0x{:x}", self.raw()),
                            error = %err,
                            "internal fence creation failed; submitting unprofiled"
                        );
                    }
                    return self.submit_with_capture(layer, submits, fence);
                }
            }
        }

        let result = self.submit_with_capture(layer, submits, fence_to_wait);

        if let Err(err) = result {
            // Nothing will wait on the fence; release it here so the
            // create/destroy pairing stays exact.
            if fence_is_internal {
                self.dispatch.destroy_fence(fence_to_wait);
            }
            return Err(err);
        }

        let worker = HarvestWorker {
            id: layer.scheduler().next_worker_id(),
            queue: self.raw(),
            fence: fence_to_wait,
            fence_is_internal,
            records,
            calibration,
            timestamp_period_ns: self.dispatch.timestamp_period_ns(),
            parent_thread: current_thread_id(),
        };

        let worker_id = worker.id;
        self.register_worker(worker_id);
        let queue = Arc::clone(self);
        layer
            .scheduler()
            .schedule(worker, move || queue.complete_worker(worker_id));

        Ok(())
    }

    /// Snapshot of every wrapped command buffer in the submission, with
    /// the fill generation and call count to harvest against.
    fn gather_records(&self, layer: &LayerContext, submits: &[vk::SubmitInfo]) -> Vec<CmdBufRecord> {
        let mut records = Vec::new();
        for submit in submits {
            for cmd in command_buffers_of(submit) {
                if let Some(wrapper) = layer.command_buffers().get(cmd.as_raw()) {
                    records.push(CmdBufRecord {
                        target_fill: wrapper.fill_id(),
                        expected_calls: wrapper.profiled_call_count(),
                        wrapper,
                    });
                }
            }
        }
        records
    }

    /// Wraps the real submission with an optional frame capture. With no
    /// pending capture the original submit infos go straight through; a
    /// capture failure falls back to the same unmodified path.
    fn submit_with_capture(
        &self,
        layer: &LayerContext,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        // An empty submission cannot carry the capture; leave the request
        // pending for the next real one.
        let pending = if submits.is_empty() {
            None
        } else {
            self.pending_capture.lock().unwrap().take()
        };

        let request = match pending {
            Some(request) => request,
            None => return self.traced_submit(layer, submits, fence),
        };

        let request_aux = request.full_resolution();

        let assets = match self.renderer.create_capture_assets(&request) {
            Ok(assets) => assets,
            Err(err) => {
                self.capture_failures.report(self.raw(), &err);
                return self.traced_submit(layer, submits, fence);
            }
        };
        let assets_aux = match self.renderer.create_capture_assets(&request_aux) {
            Ok(assets) => assets,
            Err(err) => {
                self.renderer.free_capture_assets(assets);
                self.capture_failures.report(self.raw(), &err);
                return self.traced_submit(layer, submits, fence);
            }
        };

        let recorded = self
            .renderer
            .record_capture(&request, &assets)
            .and_then(|()| self.renderer.record_capture(&request_aux, &assets_aux));
        if let Err(err) = recorded {
            self.renderer.free_capture_assets(assets);
            self.renderer.free_capture_assets(assets_aux);
            self.capture_failures.report(self.raw(), &err);
            return self.traced_submit(layer, submits, fence);
        }

        let prefix = [assets.command_buffer, assets_aux.command_buffer];
        let batch = SubmissionBatch::augmented(submits, &prefix, fence);

        let result = self.traced_submit(layer, batch.as_submits(), batch.fence);
        if let Err(err) = result {
            self.renderer.free_capture_assets(assets);
            self.renderer.free_capture_assets(assets_aux);
            return Err(err);
        }

        // The capture must read back deterministically, so this one
        // submission is drained before the pixels are fetched.
        match self.dispatch.queue_wait_idle(self.handle) {
            Ok(()) => {
                match self.renderer.fetch_results(&assets) {
                    Ok(image) => self.last_image.store(image),
                    Err(err) => self.capture_failures.report(self.raw(), &err),
                }
                match self.renderer.fetch_results(&assets_aux) {
                    Ok(image) => self.last_image_aux.store(image),
                    Err(err) => self.capture_failures.report(self.raw(), &err),
                }
            }
            Err(err) => {
                self.capture_failures.report(self.raw(), &err.into());
            }
        }

        self.renderer.free_capture_assets(assets);
        self.renderer.free_capture_assets(assets_aux);
        Ok(())
    }

    fn traced_submit(
        &self,
        layer: &LayerContext,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        let total_cmds: u32 = submits.iter().map(|s| s.command_buffer_count).sum();
        layer.interceptor().call(
            FuncId::QueueSubmit,
            || {
                format!(
                    "{}, {}, [{} command buffers], {}",
                    fmt_handle(self.handle),
                    submits.len(),
                    total_cmds,
                    fmt_handle(fence)
                )
            },
            || {
                let result = self.dispatch.queue_submit(self.handle, submits, fence);
                (result, fmt_status(result))
            },
        )
    }

    /// The `vkQueueBindSparse` shim. Traced but never profiled; sparse
    /// binds carry no command buffers to harvest.
    pub fn bind_sparse(
        &self,
        layer: &LayerContext,
        infos: &[vk::BindSparseInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        layer.interceptor().call(
            FuncId::QueueBindSparse,
            || {
                format!(
                    "{}, {}, {}",
                    fmt_handle(self.handle),
                    infos.len(),
                    fmt_handle(fence)
                )
            },
            || {
                let result = self.dispatch.queue_bind_sparse(self.handle, infos, fence);
                (result, fmt_status(result))
            },
        )
    }

    pub fn wait_idle(&self, layer: &LayerContext) -> DriverResult<()> {
        layer.interceptor().call(
            FuncId::QueueWaitIdle,
            || fmt_handle(self.handle),
            || {
                let result = self.dispatch.queue_wait_idle(self.handle);
                (result, fmt_status(result))
            },
        )
    }

    /// The `vkQueuePresentKHR` shim. After the real present the layer
    /// polls its control channel and advances the frame boundary.
    pub fn present(
        &self,
        layer: &LayerContext,
        info: &vk::PresentInfoKHR,
    ) -> DriverResult<bool> {
        let result = layer.interceptor().call(
            FuncId::QueuePresent,
            || fmt_handle(self.handle),
            || {
                let result = self.dispatch.queue_present(self.handle, info);
                let status = match &result {
                    Ok(_) => "VK_SUCCESS",
                    Err(err) => err.status(),
                };
                (result, status)
            },
        );

        layer.on_present_boundary();

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::MockDispatch;

    fn wrapper() -> Arc<QueueWrapper> {
        let dispatch = Arc::new(MockDispatch::new());
        Arc::new(QueueWrapper::new(
            vk::Queue::from_raw(0x10),
            0,
            dispatch as Arc<dyn DeviceDispatch>,
        ))
    }

    fn request() -> CaptureRequest {
        CaptureRequest {
            source_image: 0x500,
            source_width: 800,
            source_height: 600,
            source_layout: vk::ImageLayout::PRESENT_SRC_KHR.as_raw(),
            dest_width: 400,
            dest_height: 300,
            flip_x: false,
            flip_y: false,
        }
    }

    #[test]
    fn duplicate_capture_requests_are_ignored_until_consumed() {
        let queue = wrapper();
        queue.request_capture(request());

        let mut late = request();
        late.dest_width = 100;
        queue.request_capture(late);

        let pending = queue.pending_capture.lock().unwrap().take().unwrap();
        assert_eq!(pending.dest_width, 400);
    }

    #[test]
    fn timestamp_capability_comes_from_the_queue_family() {
        let dispatch = Arc::new(MockDispatch::new());
        dispatch.set_timestamps_supported(false);
        let queue = QueueWrapper::new(
            vk::Queue::from_raw(0x10),
            2,
            dispatch as Arc<dyn DeviceDispatch>,
        );
        assert!(!queue.caps().contains(QueueCaps::TIMESTAMPS));
        assert_eq!(queue.family_index(), 2);
    }

    #[test]
    fn worker_registry_supports_out_of_order_completion() {
        let queue = wrapper();
        queue.register_worker(1);
        queue.register_worker(2);
        queue.register_worker(3);
        assert_eq!(queue.in_flight_count(), 3);

        queue.complete_worker(2);
        queue.complete_worker(2);
        assert_eq!(queue.in_flight_count(), 2);

        queue.complete_worker(1);
        queue.complete_worker(3);
        assert_eq!(queue.in_flight_count(), 0);
    }

    #[test]
    fn last_captured_image_is_none_before_any_capture() {
        let queue = wrapper();
        assert!(queue.last_captured_image(false).is_none());
        assert!(queue.last_captured_image(true).is_none());
    }
}
