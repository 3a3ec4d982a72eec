use super::{DeviceDispatch, FenceWait, TimestampStage};
use crate::error::{DriverError, DriverResult};
use ash::vk;
use std::sync::Mutex;

const SAMPLE_FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Production dispatch table over `ash`.
///
/// Physical-device data is captured once at construction; after that only
/// device-level entry points are reached. The embedded command pool backs
/// the layer's own command buffers (capture and calibration work) and is
/// serialized with a mutex since pools are externally synchronized.
pub struct AshDispatch {
    device: ash::Device,
    swapchain_loader: ash::extensions::khr::Swapchain,
    properties: vk::PhysicalDeviceProperties,
    queue_family_props: Vec<vk::QueueFamilyProperties>,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    command_pool: Mutex<vk::CommandPool>,
}

impl AshDispatch {
    pub fn new(
        instance: &ash::Instance,
        p_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_index: u32,
    ) -> DriverResult<Self> {
        let swapchain_loader = ash::extensions::khr::Swapchain::new(instance, &device);

        let properties = unsafe { instance.get_physical_device_properties(p_device) };
        let queue_family_props =
            unsafe { instance.get_physical_device_queue_family_properties(p_device) };
        let memory_props = unsafe { instance.get_physical_device_memory_properties(p_device) };

        let command_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                    .queue_family_index(queue_family_index),
                None,
            )
        }
        .map_err(|e| DriverError::new("vkCreateCommandPool", e))?;

        Ok(Self {
            device,
            swapchain_loader,
            properties,
            queue_family_props,
            memory_props,
            command_pool: Mutex::new(command_pool),
        })
    }

    /// Releases the layer-owned command pool. The device itself belongs to
    /// the application and is never destroyed here.
    pub fn destroy(&self) {
        let pool = self.command_pool.lock().unwrap();
        unsafe {
            self.device.destroy_command_pool(*pool, None);
        }
    }

    fn layout_masks(layout: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
        match layout {
            vk::ImageLayout::UNDEFINED => {
                (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
            }
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
            ),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_READ,
            ),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
            vk::ImageLayout::PRESENT_SRC_KHR => {
                (vk::PipelineStageFlags::BOTTOM_OF_PIPE, vk::AccessFlags::empty())
            }
            _ => (
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            ),
        }
    }
}

impl DeviceDispatch for AshDispatch {
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        unsafe { self.device.queue_submit(queue, submits, fence) }
            .map_err(|e| DriverError::new("vkQueueSubmit", e))
    }

    fn queue_bind_sparse(
        &self,
        queue: vk::Queue,
        infos: &[vk::BindSparseInfo],
        fence: vk::Fence,
    ) -> DriverResult<()> {
        unsafe { self.device.queue_bind_sparse(queue, infos, fence) }
            .map_err(|e| DriverError::new("vkQueueBindSparse", e))
    }

    fn queue_present(&self, queue: vk::Queue, info: &vk::PresentInfoKHR) -> DriverResult<bool> {
        unsafe { self.swapchain_loader.queue_present(queue, info) }
            .map_err(|e| DriverError::new("vkQueuePresentKHR", e))
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> DriverResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
            .map_err(|e| DriverError::new("vkQueueWaitIdle", e))
    }

    fn device_wait_idle(&self) -> DriverResult<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| DriverError::new("vkDeviceWaitIdle", e))
    }

    fn create_fence(&self) -> DriverResult<vk::Fence> {
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::builder(), None)
        }
        .map_err(|e| DriverError::new("vkCreateFence", e))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> DriverResult<FenceWait> {
        match unsafe { self.device.wait_for_fences(fences, true, timeout_ns) } {
            Ok(()) => Ok(FenceWait::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceWait::TimedOut),
            Err(e) => Err(DriverError::new("vkWaitForFences", e)),
        }
    }

    fn timestamp_period_ns(&self) -> f32 {
        self.properties.limits.timestamp_period
    }

    fn queue_family_supports_timestamps(&self, family_index: u32) -> bool {
        self.queue_family_props
            .get(family_index as usize)
            .map(|props| props.timestamp_valid_bits != 0)
            .unwrap_or(false)
    }

    fn host_visible_memory_type(&self, type_bits: u32) -> Option<u32> {
        let wanted =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        (0..self.memory_props.memory_type_count).find(|&index| {
            (type_bits & (1 << index)) != 0
                && self.memory_props.memory_types[index as usize]
                    .property_flags
                    .contains(wanted)
        })
    }

    fn create_timestamp_query_pool(&self, count: u32) -> DriverResult<vk::QueryPool> {
        let ci = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        unsafe { self.device.create_query_pool(&ci, None) }
            .map_err(|e| DriverError::new("vkCreateQueryPool", e))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) }
    }

    fn query_pool_results(
        &self,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) -> DriverResult<Vec<u64>> {
        let mut results = vec![0u64; count as usize];
        unsafe {
            self.device.get_query_pool_results(
                pool,
                first,
                count,
                &mut results,
                vk::QueryResultFlags::TYPE_64,
            )
        }
        .map_err(|e| DriverError::new("vkGetQueryPoolResults", e))?;
        Ok(results)
    }

    fn allocate_app_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo,
    ) -> DriverResult<Vec<vk::CommandBuffer>> {
        unsafe { self.device.allocate_command_buffers(info) }
            .map_err(|e| DriverError::new("vkAllocateCommandBuffers", e))
    }

    fn free_app_command_buffers(&self, pool: vk::CommandPool, cmds: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, cmds) }
    }

    fn begin_app_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo,
    ) -> DriverResult<()> {
        unsafe { self.device.begin_command_buffer(cmd, info) }
            .map_err(|e| DriverError::new("vkBeginCommandBuffer", e))
    }

    fn allocate_command_buffer(&self) -> DriverResult<vk::CommandBuffer> {
        let pool = self.command_pool.lock().unwrap();
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| DriverError::new("vkAllocateCommandBuffers", e))?;
        Ok(buffers[0])
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        let pool = self.command_pool.lock().unwrap();
        unsafe { self.device.free_command_buffers(*pool, &[cmd]) }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> DriverResult<()> {
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info) }
            .map_err(|e| DriverError::new("vkBeginCommandBuffer", e))
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> DriverResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| DriverError::new("vkEndCommandBuffer", e))
    }

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, count: u32) {
        unsafe { self.device.cmd_reset_query_pool(cmd, pool, 0, count) }
    }

    fn cmd_write_timestamp(
        &self,
        cmd: vk::CommandBuffer,
        stage: TimestampStage,
        pool: vk::QueryPool,
        query: u32,
    ) {
        let stage = match stage {
            TimestampStage::Top => vk::PipelineStageFlags::TOP_OF_PIPE,
            TimestampStage::Bottom => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        };
        unsafe { self.device.cmd_write_timestamp(cmd, stage, pool, query) }
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        }
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cmd, x, y, z) }
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_stage, src_access) = Self::layout_masks(old_layout);
        let (dst_stage, dst_access) = Self::layout_masks(new_layout);

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .base_array_layer(0)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS)
                    .build(),
            )
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        }
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageBlit,
    ) {
        unsafe {
            self.device.cmd_blit_image(
                cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[*region],
                vk::Filter::LINEAR,
            )
        }
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        buffer: vk::Buffer,
        width: u32,
        height: u32,
    ) {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1)
                    .build(),
            )
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .build();
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                buffer,
                &[region],
            )
        }
    }

    fn create_capture_image(&self, width: u32, height: u32) -> DriverResult<vk::Image> {
        let ci = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        unsafe { self.device.create_image(&ci, None) }
            .map_err(|e| DriverError::new("vkCreateImage", e))
    }

    fn create_readback_buffer(&self, size: u64) -> DriverResult<vk::Buffer> {
        let ci = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        unsafe { self.device.create_buffer(&ci, None) }
            .map_err(|e| DriverError::new("vkCreateBuffer", e))
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        unsafe { self.device.get_buffer_memory_requirements(buffer) }
    }

    fn allocate_memory(&self, size: u64, memory_type: u32) -> DriverResult<vk::DeviceMemory> {
        let info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_type);
        unsafe { self.device.allocate_memory(&info, None) }
            .map_err(|e| DriverError::new("vkAllocateMemory", e))
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> DriverResult<()> {
        unsafe { self.device.bind_image_memory(image, memory, 0) }
            .map_err(|e| DriverError::new("vkBindImageMemory", e))
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
    ) -> DriverResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }
            .map_err(|e| DriverError::new("vkBindBufferMemory", e))
    }

    fn read_memory(&self, memory: vk::DeviceMemory, out: &mut [u8]) -> DriverResult<()> {
        let ptr = unsafe {
            self.device.map_memory(
                memory,
                0,
                out.len() as u64,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(|e| DriverError::new("vkMapMemory", e))?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), out.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn sample_gpu_timestamp(&self, queue: vk::Queue) -> DriverResult<u64> {
        let pool = self.create_timestamp_query_pool(1)?;
        let cmd = match self.allocate_command_buffer() {
            Ok(cmd) => cmd,
            Err(e) => {
                self.destroy_query_pool(pool);
                return Err(e);
            }
        };

        let result: DriverResult<u64> = (|| {
            self.begin_command_buffer(cmd)?;
            self.cmd_reset_query_pool(cmd, pool, 1);
            self.cmd_write_timestamp(cmd, TimestampStage::Bottom, pool, 0);
            self.end_command_buffer(cmd)?;

            let fence = self.create_fence()?;
            let cmds = [cmd];
            let submit = vk::SubmitInfo::builder().command_buffers(&cmds).build();
            let submitted = self.queue_submit(queue, &[submit], fence);
            let waited = submitted.and_then(|()| {
                match self.wait_for_fences(&[fence], SAMPLE_FENCE_TIMEOUT_NS)? {
                    FenceWait::Signaled => Ok(()),
                    FenceWait::TimedOut => {
                        Err(DriverError::new("vkWaitForFences", vk::Result::TIMEOUT))
                    }
                }
            });
            self.destroy_fence(fence);
            waited?;

            Ok(self.query_pool_results(pool, 0, 1)?[0])
        })();

        self.free_command_buffer(cmd);
        self.destroy_query_pool(pool);
        result
    }
}
