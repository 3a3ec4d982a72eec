//! Frame image capture. A capture renders a down-sampled copy of a
//! designated source image into a CPU-readable buffer via a blit, using
//! transient GPU assets that live for exactly one capture.

use crate::{
    dispatch::DeviceDispatch,
    error::{CaptureError, CAPTURE_ERROR_KINDS},
};
use ash::vk::{self, Handle};
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tracing::{debug, warn};

/// Bytes per pixel in the RGBA8 capture target.
pub const BYTES_PER_PIXEL: u32 = 4;

fn default_source_layout() -> i32 {
    vk::ImageLayout::PRESENT_SRC_KHR.as_raw()
}

/// Desired capture parameters, recorded for the next submission on the
/// target queue.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureRequest {
    /// Native handle of the source image.
    pub source_image: u64,
    pub source_width: u32,
    pub source_height: u32,
    /// Raw `VkImageLayout` the source image is in outside the capture.
    #[serde(default = "default_source_layout")]
    pub source_layout: i32,
    pub dest_width: u32,
    pub dest_height: u32,
    pub flip_x: bool,
    pub flip_y: bool,
}

impl CaptureRequest {
    /// The auxiliary variant captures at full source resolution.
    pub fn full_resolution(&self) -> Self {
        Self {
            dest_width: self.source_width,
            dest_height: self.source_height,
            ..self.clone()
        }
    }

    pub fn source_layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.source_layout)
    }
}

/// Shrinks a requested destination size so it keeps the source aspect
/// ratio. Never grows either axis.
pub fn correct_size_for_aspect_ratio(
    src_width: u32,
    src_height: u32,
    dst_width: u32,
    dst_height: u32,
) -> (u32, u32) {
    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return (dst_width, dst_height);
    }

    let src_aspect = f64::from(src_width) / f64::from(src_height);
    let dst_aspect = f64::from(dst_width) / f64::from(dst_height);

    if dst_aspect > src_aspect {
        let corrected = (f64::from(dst_height) * src_aspect).round() as u32;
        (corrected.max(1), dst_height)
    } else {
        let corrected = (f64::from(dst_width) / src_aspect).round() as u32;
        (dst_width, corrected.max(1))
    }
}

/// A completed capture on the CPU. Tightly packed RGBA8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuImage {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub data: Vec<u8>,
}

/// GPU-side transients backing one capture. Strictly scoped to a single
/// capture operation; freed as soon as results are fetched.
#[derive(Debug)]
pub struct CaptureAssets {
    pub command_buffer: vk::CommandBuffer,
    image: vk::Image,
    image_memory: vk::DeviceMemory,
    readback: vk::Buffer,
    readback_memory: vk::DeviceMemory,
    width: u32,
    height: u32,
}

/// Records captures through the dispatch table: transient asset creation,
/// blit-downsample command recording, and readback.
pub struct ImageRenderer {
    dispatch: Arc<dyn DeviceDispatch>,
}

impl ImageRenderer {
    pub fn new(dispatch: Arc<dyn DeviceDispatch>) -> Self {
        Self { dispatch }
    }

    pub fn create_capture_assets(
        &self,
        request: &CaptureRequest,
    ) -> Result<CaptureAssets, CaptureError> {
        if request.source_image == 0 {
            return Err(CaptureError::MissingSourceImage);
        }
        if request.dest_width == 0 || request.dest_height == 0 {
            return Err(CaptureError::ZeroExtent {
                width: request.dest_width,
                height: request.dest_height,
            });
        }

        let (width, height) = correct_size_for_aspect_ratio(
            request.source_width,
            request.source_height,
            request.dest_width,
            request.dest_height,
        );

        let mut staged = StagedAssets::new(&*self.dispatch);
        match staged.create(width, height) {
            Ok(()) => Ok(staged.finish(width, height)),
            Err(err) => {
                staged.abort();
                Err(err)
            }
        }
    }

    /// Records the capture into the assets' command buffer: source into
    /// TRANSFER_SRC, blit with aspect-corrected extents (and flip via
    /// swapped offsets), copy into the readback buffer, source restored.
    pub fn record_capture(
        &self,
        request: &CaptureRequest,
        assets: &CaptureAssets,
    ) -> Result<(), CaptureError> {
        let dispatch = &*self.dispatch;
        let cmd = assets.command_buffer;
        let src = vk::Image::from_raw(request.source_image);
        let prev_layout = request.source_layout();

        dispatch.begin_command_buffer(cmd)?;

        dispatch.cmd_transition_image(
            cmd,
            src,
            prev_layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        dispatch.cmd_transition_image(
            cmd,
            assets.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        let region = blit_region(request, assets.width, assets.height);
        dispatch.cmd_blit_image(cmd, src, assets.image, &region);

        dispatch.cmd_transition_image(
            cmd,
            assets.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        dispatch.cmd_copy_image_to_buffer(
            cmd,
            assets.image,
            assets.readback,
            assets.width,
            assets.height,
        );

        dispatch.cmd_transition_image(
            cmd,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            prev_layout,
        );

        dispatch.end_command_buffer(cmd)?;
        Ok(())
    }

    /// Reads the completed capture back into a [`CpuImage`]. Only valid
    /// after the augmented submission has drained.
    pub fn fetch_results(&self, assets: &CaptureAssets) -> Result<CpuImage, CaptureError> {
        let size = (assets.width * assets.height * BYTES_PER_PIXEL) as usize;
        let mut data = vec![0u8; size];
        self.dispatch.read_memory(assets.readback_memory, &mut data)?;
        Ok(CpuImage {
            width: assets.width,
            height: assets.height,
            pitch: assets.width * BYTES_PER_PIXEL,
            data,
        })
    }

    pub fn free_capture_assets(&self, assets: CaptureAssets) {
        let dispatch = &*self.dispatch;
        dispatch.free_command_buffer(assets.command_buffer);
        dispatch.destroy_buffer(assets.readback);
        dispatch.free_memory(assets.readback_memory);
        dispatch.destroy_image(assets.image);
        dispatch.free_memory(assets.image_memory);
    }
}

/// Tracks capture transients as they come into existence, so a failure
/// partway through tears down exactly what was created.
struct StagedAssets<'a> {
    dispatch: &'a dyn DeviceDispatch,
    image: Option<vk::Image>,
    image_memory: Option<vk::DeviceMemory>,
    readback: Option<vk::Buffer>,
    readback_memory: Option<vk::DeviceMemory>,
    command_buffer: Option<vk::CommandBuffer>,
}

impl<'a> StagedAssets<'a> {
    fn new(dispatch: &'a dyn DeviceDispatch) -> Self {
        Self {
            dispatch,
            image: None,
            image_memory: None,
            readback: None,
            readback_memory: None,
            command_buffer: None,
        }
    }

    fn create(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
        let dispatch = self.dispatch;

        let image = dispatch.create_capture_image(width, height)?;
        self.image = Some(image);

        let image_reqs = dispatch.image_memory_requirements(image);
        let image_type = image_reqs.memory_type_bits.trailing_zeros();
        let image_memory = dispatch.allocate_memory(image_reqs.size, image_type)?;
        self.image_memory = Some(image_memory);
        dispatch.bind_image_memory(image, image_memory)?;

        let size = u64::from(width) * u64::from(height) * u64::from(BYTES_PER_PIXEL);
        let readback = dispatch.create_readback_buffer(size)?;
        self.readback = Some(readback);

        let buffer_reqs = dispatch.buffer_memory_requirements(readback);
        let buffer_type = dispatch
            .host_visible_memory_type(buffer_reqs.memory_type_bits)
            .ok_or(CaptureError::NoHostVisibleMemory)?;
        let readback_memory = dispatch.allocate_memory(buffer_reqs.size, buffer_type)?;
        self.readback_memory = Some(readback_memory);
        dispatch.bind_buffer_memory(readback, readback_memory)?;

        self.command_buffer = Some(dispatch.allocate_command_buffer()?);
        Ok(())
    }

    fn finish(self, width: u32, height: u32) -> CaptureAssets {
        CaptureAssets {
            command_buffer: self.command_buffer.unwrap(),
            image: self.image.unwrap(),
            image_memory: self.image_memory.unwrap(),
            readback: self.readback.unwrap(),
            readback_memory: self.readback_memory.unwrap(),
            width,
            height,
        }
    }

    fn abort(self) {
        if let Some(cmd) = self.command_buffer {
            self.dispatch.free_command_buffer(cmd);
        }
        if let Some(buffer) = self.readback {
            self.dispatch.destroy_buffer(buffer);
        }
        if let Some(memory) = self.readback_memory {
            self.dispatch.free_memory(memory);
        }
        if let Some(image) = self.image {
            self.dispatch.destroy_image(image);
        }
        if let Some(memory) = self.image_memory {
            self.dispatch.free_memory(memory);
        }
    }
}

/// Blit covering the full source, scaled to the corrected destination.
/// A flip swaps the destination offsets along that axis.
fn blit_region(request: &CaptureRequest, dst_width: u32, dst_height: u32) -> vk::ImageBlit {
    let subresource = vk::ImageSubresourceLayers::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .layer_count(1)
        .build();

    let (dst_x0, dst_x1) = if request.flip_x {
        (dst_width as i32, 0)
    } else {
        (0, dst_width as i32)
    };
    let (dst_y0, dst_y1) = if request.flip_y {
        (dst_height as i32, 0)
    } else {
        (0, dst_height as i32)
    };

    vk::ImageBlit::builder()
        .src_subresource(subresource)
        .src_offsets([
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: request.source_width as i32,
                y: request.source_height as i32,
                z: 1,
            },
        ])
        .dst_subresource(subresource)
        .dst_offsets([
            vk::Offset3D {
                x: dst_x0,
                y: dst_y0,
                z: 0,
            },
            vk::Offset3D {
                x: dst_x1,
                y: dst_y1,
                z: 1,
            },
        ])
        .build()
}

/// The "last captured image" slot. Double-buffered by construction: the
/// writer fully populates a fresh image and swaps it in under a brief
/// lock, so a reader never observes a half-written buffer.
#[derive(Default)]
pub struct CapturedImageSlot {
    current: Mutex<Option<Arc<CpuImage>>>,
}

impl CapturedImageSlot {
    pub fn store(&self, image: CpuImage) {
        *self.current.lock().unwrap() = Some(Arc::new(image));
    }

    /// Returns the most recently completed capture, or `None` until the
    /// first capture succeeds.
    pub fn load(&self) -> Option<Arc<CpuImage>> {
        self.current.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        *self.current.lock().unwrap() = None;
    }
}

/// Once-per-kind capture failure log, so a failure repeating every frame
/// does not flood the log.
pub struct CaptureFailureLog {
    logged: [AtomicBool; CAPTURE_ERROR_KINDS],
}

impl Default for CaptureFailureLog {
    fn default() -> Self {
        Self {
            logged: Default::default(),
        }
    }
}

impl CaptureFailureLog {
    pub fn report(&self, queue: u64, err: &CaptureError) {
        if !self.logged[err.kind()].swap(true, Ordering::Relaxed) {
            warn!(queue = %format_args!("0x{queue:x}"), error = %err, "frame capture disabled for this frame");
        } else {
            debug!(queue = %format_args!("0x{queue:x}"), error = %err, "frame capture failed again");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::MockDispatch;

    fn request() -> CaptureRequest {
        CaptureRequest {
            source_image: 0x500,
            source_width: 1920,
            source_height: 1080,
            source_layout: default_source_layout(),
            dest_width: 480,
            dest_height: 480,
            flip_x: false,
            flip_y: false,
        }
    }

    #[test]
    fn aspect_correction_shrinks_the_wrong_axis() {
        assert_eq!(correct_size_for_aspect_ratio(1920, 1080, 480, 480), (480, 270));
        assert_eq!(correct_size_for_aspect_ratio(1080, 1920, 480, 480), (270, 480));
        assert_eq!(correct_size_for_aspect_ratio(1920, 1080, 960, 540), (960, 540));
    }

    #[test]
    fn aspect_correction_leaves_degenerate_inputs_alone() {
        assert_eq!(correct_size_for_aspect_ratio(0, 1080, 480, 480), (480, 480));
        assert_eq!(correct_size_for_aspect_ratio(1920, 1080, 0, 480), (0, 480));
    }

    #[test]
    fn flip_swaps_destination_offsets() {
        let mut req = request();
        req.flip_y = true;
        let region = blit_region(&req, 480, 270);

        assert_eq!(region.src_offsets[1].x, 1920);
        assert_eq!(region.dst_offsets[0].y, 270);
        assert_eq!(region.dst_offsets[1].y, 0);
        assert_eq!(region.dst_offsets[0].x, 0);
        assert_eq!(region.dst_offsets[1].x, 480);
    }

    #[test]
    fn zero_extent_fails_before_touching_the_driver() {
        let dispatch = Arc::new(MockDispatch::new());
        let renderer = ImageRenderer::new(dispatch.clone());

        let mut req = request();
        req.dest_width = 0;
        req.dest_height = 0;

        match renderer.create_capture_assets(&req) {
            Err(CaptureError::ZeroExtent { .. }) => {}
            other => panic!("expected ZeroExtent, got {other:?}"),
        }
        assert_eq!(dispatch.live_images(), 0);
        assert_eq!(dispatch.live_buffers(), 0);
    }

    #[test]
    fn failed_asset_creation_leaks_nothing() {
        let dispatch = Arc::new(MockDispatch::new());
        dispatch.fail_next("vkCreateBuffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let renderer = ImageRenderer::new(dispatch.clone());

        assert!(renderer.create_capture_assets(&request()).is_err());
        assert_eq!(dispatch.live_images(), 0);
        assert_eq!(dispatch.live_buffers(), 0);
        assert_eq!(dispatch.live_memory(), 0);
    }

    #[test]
    fn capture_roundtrip_frees_all_transients() {
        let dispatch = Arc::new(MockDispatch::new());
        let renderer = ImageRenderer::new(dispatch.clone());
        let req = request();

        let assets = renderer.create_capture_assets(&req).unwrap();
        renderer.record_capture(&req, &assets).unwrap();

        // One blit into the scaled target, one copy into the readback
        // buffer, recorded on the capture command buffer.
        let blits = dispatch.blits();
        assert_eq!(blits.len(), 1);
        assert_eq!(blits[0].1.src_offsets[1].x, 1920);
        assert_eq!(blits[0].1.dst_offsets[1].x, 480);
        assert_eq!(dispatch.image_to_buffer_copies().len(), 1);

        let image = renderer.fetch_results(&assets).unwrap();
        assert_eq!(image.width, 480);
        assert_eq!(image.height, 270);
        assert_eq!(image.pitch, 480 * BYTES_PER_PIXEL);
        assert_eq!(image.data.len(), (480 * 270 * BYTES_PER_PIXEL) as usize);

        renderer.free_capture_assets(assets);
        assert_eq!(dispatch.live_images(), 0);
        assert_eq!(dispatch.live_buffers(), 0);
        assert_eq!(dispatch.live_memory(), 0);
        assert_eq!(dispatch.cmd_bufs_freed(), dispatch.cmd_bufs_allocated());
    }

    #[test]
    fn missing_host_visible_memory_is_reported_without_leaks() {
        let dispatch = Arc::new(MockDispatch::new());
        dispatch.set_no_host_visible_memory();
        let renderer = ImageRenderer::new(dispatch.clone());

        match renderer.create_capture_assets(&request()) {
            Err(CaptureError::NoHostVisibleMemory) => {}
            other => panic!("expected NoHostVisibleMemory, got {other:?}"),
        }
        assert_eq!(dispatch.live_images(), 0);
        assert_eq!(dispatch.live_buffers(), 0);
        assert_eq!(dispatch.live_memory(), 0);
    }

    #[test]
    fn slot_reads_are_idempotent_between_captures() {
        let slot = CapturedImageSlot::default();
        assert!(slot.load().is_none());

        slot.store(CpuImage {
            width: 2,
            height: 2,
            pitch: 8,
            data: vec![9; 16],
        });

        let first = slot.load().unwrap();
        let second = slot.load().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.data, vec![9; 16]);
    }
}
