//! The driver seam. Everything the layer needs from the native driver is
//! expressed as one dispatch-table trait so the interception core never
//! links against a loader directly; [`AshDispatch`] is the production
//! implementation over `ash`.

mod ash_dispatch;
#[cfg(test)]
pub(crate) mod testing;

pub use ash_dispatch::AshDispatch;

use crate::error::DriverResult;
use ash::vk;

/// Outcome of a timeout-guarded fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Pipeline position for a timestamp write. `Top` brackets the start of a
/// profiled call, `Bottom` its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampStage {
    Top,
    Bottom,
}

/// The driver's command-submission, synchronization, query and transfer
/// entry points, as the layer consumes them.
///
/// Implementations forward to the real driver; the layer owns no loader
/// state of its own. A handle passed in is always one the application (or
/// this layer) obtained from the same device.
pub trait DeviceDispatch: Send + Sync {
    // --- submission & synchronization ---

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> DriverResult<()>;

    fn queue_bind_sparse(
        &self,
        queue: vk::Queue,
        infos: &[vk::BindSparseInfo],
        fence: vk::Fence,
    ) -> DriverResult<()>;

    /// Returns true if the presentation engine reported the swapchain
    /// suboptimal, mirroring the driver's boolean success state.
    fn queue_present(&self, queue: vk::Queue, info: &vk::PresentInfoKHR) -> DriverResult<bool>;

    fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()>;

    fn device_wait_idle(&self) -> DriverResult<()>;

    fn create_fence(&self) -> DriverResult<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Waits for all of `fences`, bounded by `timeout_ns`. A timeout is not
    /// an error; callers decide how often to retry.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> DriverResult<FenceWait>;

    // --- physical-device properties ---

    /// Nanoseconds per GPU timestamp tick.
    fn timestamp_period_ns(&self) -> f32;

    /// Whether queues of this family write valid timestamps.
    fn queue_family_supports_timestamps(&self, family_index: u32) -> bool;

    /// Selects a host-visible, host-coherent memory type out of `type_bits`.
    fn host_visible_memory_type(&self, type_bits: u32) -> Option<u32>;

    // --- timestamp queries ---

    fn create_timestamp_query_pool(&self, count: u32) -> DriverResult<vk::QueryPool>;

    fn destroy_query_pool(&self, pool: vk::QueryPool);

    /// Reads back `count` 64-bit results starting at `first`. Only called
    /// after the governing fence has signaled; never waits.
    fn query_pool_results(
        &self,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) -> DriverResult<Vec<u64>>;

    // --- application command buffers (forwarded entry points) ---

    fn allocate_app_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo,
    ) -> DriverResult<Vec<vk::CommandBuffer>>;

    fn free_app_command_buffers(&self, pool: vk::CommandPool, cmds: &[vk::CommandBuffer]);

    fn begin_app_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo,
    ) -> DriverResult<()>;

    // --- layer-owned command buffers ---

    fn allocate_command_buffer(&self) -> DriverResult<vk::CommandBuffer>;

    fn free_command_buffer(&self, cmd: vk::CommandBuffer);

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> DriverResult<()>;

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> DriverResult<()>;

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, count: u32);

    fn cmd_write_timestamp(
        &self,
        cmd: vk::CommandBuffer,
        stage: TimestampStage,
        pool: vk::QueryPool,
        query: u32,
    );

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32);

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    );

    /// Records a scaled blit between TRANSFER_SRC and TRANSFER_DST images.
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageBlit,
    );

    /// Records a tightly packed copy of a TRANSFER_SRC image into `buffer`.
    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        buffer: vk::Buffer,
        width: u32,
        height: u32,
    );

    // --- capture resources ---

    /// Creates an RGBA8 image usable as both blit destination and copy
    /// source.
    fn create_capture_image(&self, width: u32, height: u32) -> DriverResult<vk::Image>;

    fn create_readback_buffer(&self, size: u64) -> DriverResult<vk::Buffer>;

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;

    fn allocate_memory(&self, size: u64, memory_type: u32) -> DriverResult<vk::DeviceMemory>;

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> DriverResult<()>;

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory)
        -> DriverResult<()>;

    /// Copies mapped contents of `memory` into `out`.
    fn read_memory(&self, memory: vk::DeviceMemory, out: &mut [u8]) -> DriverResult<()>;

    fn destroy_image(&self, image: vk::Image);

    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn free_memory(&self, memory: vk::DeviceMemory);

    // --- calibration ---

    /// Samples the GPU clock by running a one-timestamp batch on `queue`
    /// and waiting for it. Used only to pair with a CPU sample taken
    /// around the call.
    fn sample_gpu_timestamp(&self, queue: vk::Queue) -> DriverResult<u64>;
}
