//! Scripted in-memory driver used by unit tests. Completes GPU work
//! instantly unless told to time out, hands out monotonically increasing
//! query values, and records every handle it creates or destroys so tests
//! can assert on lifetimes.

use super::{DeviceDispatch, FenceWait, TimestampStage};
use crate::error::{DriverError, DriverResult};
use ash::vk::{self, Handle};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

#[derive(Debug, Clone)]
pub struct RecordedSubmit {
    pub queue: u64,
    pub command_buffers: Vec<Vec<u64>>,
    pub fence: u64,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    failures: HashMap<&'static str, VecDeque<vk::Result>>,

    fences_created: Vec<u64>,
    fences_destroyed: Vec<u64>,
    timeouts_before_signal: u32,

    submits: Vec<RecordedSubmit>,
    queue_wait_idles: u32,
    device_wait_idles: u32,
    presents: u32,

    query_pools: HashSet<u64>,
    gpu_clock: u64,

    cmd_bufs_allocated: Vec<u64>,
    cmd_bufs_freed: Vec<u64>,
    blits: Vec<(u64, vk::ImageBlit)>,
    image_to_buffer_copies: Vec<(u64, u64)>,

    images_created: Vec<u64>,
    images_destroyed: Vec<u64>,
    buffers_created: Vec<u64>,
    buffers_destroyed: Vec<u64>,
    memory_allocated: Vec<u64>,
    memory_freed: Vec<u64>,

    no_host_visible: bool,
    timestamps_supported: bool,
    timestamp_period: f32,
    read_fill: u8,
}

pub struct MockDispatch {
    state: Mutex<MockState>,
}

impl Default for MockDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDispatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                timestamps_supported: true,
                timestamp_period: 1.0,
                gpu_clock: 1_000,
                ..Default::default()
            }),
        }
    }

    /// Script the next call to `call` to fail with `code`.
    pub fn fail_next(&self, call: &'static str, code: vk::Result) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(call)
            .or_default()
            .push_back(code);
    }

    /// Script the next `count` fence waits to time out before signaling.
    pub fn timeout_waits(&self, count: u32) {
        self.state.lock().unwrap().timeouts_before_signal = count;
    }

    pub fn set_timestamps_supported(&self, supported: bool) {
        self.state.lock().unwrap().timestamps_supported = supported;
    }

    pub fn set_no_host_visible_memory(&self) {
        self.state.lock().unwrap().no_host_visible = true;
    }

    pub fn submits(&self) -> Vec<RecordedSubmit> {
        self.state.lock().unwrap().submits.clone()
    }

    pub fn fences_created(&self) -> Vec<u64> {
        self.state.lock().unwrap().fences_created.clone()
    }

    pub fn fences_destroyed(&self) -> Vec<u64> {
        self.state.lock().unwrap().fences_destroyed.clone()
    }

    pub fn queue_wait_idles(&self) -> u32 {
        self.state.lock().unwrap().queue_wait_idles
    }

    pub fn device_wait_idles(&self) -> u32 {
        self.state.lock().unwrap().device_wait_idles
    }

    pub fn blits(&self) -> Vec<(u64, vk::ImageBlit)> {
        self.state.lock().unwrap().blits.clone()
    }

    pub fn image_to_buffer_copies(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().image_to_buffer_copies.clone()
    }

    pub fn presents(&self) -> u32 {
        self.state.lock().unwrap().presents
    }

    pub fn cmd_bufs_allocated(&self) -> Vec<u64> {
        self.state.lock().unwrap().cmd_bufs_allocated.clone()
    }

    pub fn cmd_bufs_freed(&self) -> Vec<u64> {
        self.state.lock().unwrap().cmd_bufs_freed.clone()
    }

    pub fn live_images(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.images_created.len() - state.images_destroyed.len()
    }

    pub fn live_buffers(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.buffers_created.len() - state.buffers_destroyed.len()
    }

    pub fn live_memory(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.memory_allocated.len() - state.memory_freed.len()
    }

    fn alloc_handle(state: &mut MockState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }

    fn take_failure(state: &mut MockState, call: &'static str) -> DriverResult<()> {
        if let Some(queue) = state.failures.get_mut(call) {
            if let Some(code) = queue.pop_front() {
                return Err(DriverError::new(call, code));
            }
        }
        Ok(())
    }
}

impl DeviceDispatch for MockDispatch {
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkQueueSubmit")?;

        let command_buffers = submits
            .iter()
            .map(|submit| {
                if submit.command_buffer_count == 0 || submit.p_command_buffers.is_null() {
                    Vec::new()
                } else {
                    unsafe {
                        std::slice::from_raw_parts(
                            submit.p_command_buffers,
                            submit.command_buffer_count as usize,
                        )
                    }
                    .iter()
                    .map(|cmd| cmd.as_raw())
                    .collect()
                }
            })
            .collect();

        state.submits.push(RecordedSubmit {
            queue: queue.as_raw(),
            command_buffers,
            fence: fence.as_raw(),
        });
        Ok(())
    }

    fn queue_bind_sparse(
        &self,
        _queue: vk::Queue,
        _infos: &[vk::BindSparseInfo],
        _fence: vk::Fence,
    ) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkQueueBindSparse")
    }

    fn queue_present(&self, _queue: vk::Queue, _info: &vk::PresentInfoKHR) -> DriverResult<bool> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkQueuePresentKHR")?;
        state.presents += 1;
        Ok(false)
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkQueueWaitIdle")?;
        state.queue_wait_idles += 1;
        Ok(())
    }

    fn device_wait_idle(&self) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        state.device_wait_idles += 1;
        Ok(())
    }

    fn create_fence(&self) -> DriverResult<vk::Fence> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkCreateFence")?;
        let handle = Self::alloc_handle(&mut state);
        state.fences_created.push(handle);
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state
            .lock()
            .unwrap()
            .fences_destroyed
            .push(fence.as_raw());
    }

    fn wait_for_fences(&self, _fences: &[vk::Fence], _timeout_ns: u64) -> DriverResult<FenceWait> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkWaitForFences")?;
        if state.timeouts_before_signal > 0 {
            state.timeouts_before_signal -= 1;
            return Ok(FenceWait::TimedOut);
        }
        Ok(FenceWait::Signaled)
    }

    fn timestamp_period_ns(&self) -> f32 {
        self.state.lock().unwrap().timestamp_period
    }

    fn queue_family_supports_timestamps(&self, _family_index: u32) -> bool {
        self.state.lock().unwrap().timestamps_supported
    }

    fn host_visible_memory_type(&self, _type_bits: u32) -> Option<u32> {
        if self.state.lock().unwrap().no_host_visible {
            None
        } else {
            Some(0)
        }
    }

    fn create_timestamp_query_pool(&self, _count: u32) -> DriverResult<vk::QueryPool> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkCreateQueryPool")?;
        let handle = Self::alloc_handle(&mut state);
        state.query_pools.insert(handle);
        Ok(vk::QueryPool::from_raw(handle))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.state.lock().unwrap().query_pools.remove(&pool.as_raw());
    }

    fn query_pool_results(
        &self,
        _pool: vk::QueryPool,
        _first: u32,
        count: u32,
    ) -> DriverResult<Vec<u64>> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkGetQueryPoolResults")?;
        let base = state.gpu_clock;
        state.gpu_clock += u64::from(count);
        Ok((0..u64::from(count)).map(|i| base + i).collect())
    }

    fn allocate_app_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo,
    ) -> DriverResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkAllocateCommandBuffers")?;
        Ok((0..info.command_buffer_count)
            .map(|_| {
                let handle = Self::alloc_handle(&mut state);
                state.cmd_bufs_allocated.push(handle);
                vk::CommandBuffer::from_raw(handle)
            })
            .collect())
    }

    fn free_app_command_buffers(&self, _pool: vk::CommandPool, cmds: &[vk::CommandBuffer]) {
        let mut state = self.state.lock().unwrap();
        for cmd in cmds {
            state.cmd_bufs_freed.push(cmd.as_raw());
        }
    }

    fn begin_app_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _info: &vk::CommandBufferBeginInfo,
    ) -> DriverResult<()> {
        self.begin_command_buffer(cmd)
    }

    fn allocate_command_buffer(&self) -> DriverResult<vk::CommandBuffer> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkAllocateCommandBuffers")?;
        let handle = Self::alloc_handle(&mut state);
        state.cmd_bufs_allocated.push(handle);
        Ok(vk::CommandBuffer::from_raw(handle))
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        self.state
            .lock()
            .unwrap()
            .cmd_bufs_freed
            .push(cmd.as_raw());
    }

    fn begin_command_buffer(&self, _cmd: vk::CommandBuffer) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkEndCommandBuffer")
    }

    fn cmd_reset_query_pool(&self, _cmd: vk::CommandBuffer, _pool: vk::QueryPool, _count: u32) {}

    fn cmd_write_timestamp(
        &self,
        _cmd: vk::CommandBuffer,
        _stage: TimestampStage,
        _pool: vk::QueryPool,
        _query: u32,
    ) {
    }

    fn cmd_draw(
        &self,
        _cmd: vk::CommandBuffer,
        _vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
    }

    fn cmd_draw_indexed(
        &self,
        _cmd: vk::CommandBuffer,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
    }

    fn cmd_dispatch(&self, _cmd: vk::CommandBuffer, _x: u32, _y: u32, _z: u32) {}

    fn cmd_transition_image(
        &self,
        _cmd: vk::CommandBuffer,
        _image: vk::Image,
        _old_layout: vk::ImageLayout,
        _new_layout: vk::ImageLayout,
    ) {
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        _src: vk::Image,
        _dst: vk::Image,
        region: &vk::ImageBlit,
    ) {
        self.state
            .lock()
            .unwrap()
            .blits
            .push((cmd.as_raw(), *region));
    }

    fn cmd_copy_image_to_buffer(
        &self,
        _cmd: vk::CommandBuffer,
        image: vk::Image,
        buffer: vk::Buffer,
        _width: u32,
        _height: u32,
    ) {
        self.state
            .lock()
            .unwrap()
            .image_to_buffer_copies
            .push((image.as_raw(), buffer.as_raw()));
    }

    fn create_capture_image(&self, _width: u32, _height: u32) -> DriverResult<vk::Image> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkCreateImage")?;
        let handle = Self::alloc_handle(&mut state);
        state.images_created.push(handle);
        Ok(vk::Image::from_raw(handle))
    }

    fn create_readback_buffer(&self, _size: u64) -> DriverResult<vk::Buffer> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkCreateBuffer")?;
        let handle = Self::alloc_handle(&mut state);
        state.buffers_created.push(handle);
        Ok(vk::Buffer::from_raw(handle))
    }

    fn image_memory_requirements(&self, _image: vk::Image) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 4096,
            alignment: 256,
            memory_type_bits: !0,
        }
    }

    fn buffer_memory_requirements(&self, _buffer: vk::Buffer) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 4096,
            alignment: 256,
            memory_type_bits: !0,
        }
    }

    fn allocate_memory(&self, _size: u64, _memory_type: u32) -> DriverResult<vk::DeviceMemory> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkAllocateMemory")?;
        let handle = Self::alloc_handle(&mut state);
        state.memory_allocated.push(handle);
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    fn bind_image_memory(&self, _image: vk::Image, _memory: vk::DeviceMemory) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkBindImageMemory")
    }

    fn bind_buffer_memory(
        &self,
        _buffer: vk::Buffer,
        _memory: vk::DeviceMemory,
    ) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkBindBufferMemory")
    }

    fn read_memory(&self, _memory: vk::DeviceMemory, out: &mut [u8]) -> DriverResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "vkMapMemory")?;
        // Each readback produces a new fill value so tests can tell
        // successive captures apart.
        state.read_fill = state.read_fill.wrapping_add(1);
        out.fill(state.read_fill);
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state
            .lock()
            .unwrap()
            .images_destroyed
            .push(image.as_raw());
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state
            .lock()
            .unwrap()
            .buffers_destroyed
            .push(buffer.as_raw());
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state
            .lock()
            .unwrap()
            .memory_freed
            .push(memory.as_raw());
    }

    fn sample_gpu_timestamp(&self, _queue: vk::Queue) -> DriverResult<u64> {
        let mut state = self.state.lock().unwrap();
        Self::take_failure(&mut state, "sample_gpu_timestamp")?;
        let tick = state.gpu_clock;
        state.gpu_clock += 1;
        Ok(tick)
    }
}
