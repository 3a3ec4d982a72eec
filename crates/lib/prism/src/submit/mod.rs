//! Submission descriptors. An augmented submission is composed from the
//! application's original submit infos plus an injected command-buffer
//! prefix, rather than rewriting the driver structs in place; the original
//! fence and semaphore data pass through untouched.

use ash::vk;
use std::marker::PhantomData;

/// One call to the submission entry point: the (possibly augmented)
/// submit infos, the fence that governs it, and whether that fence was
/// manufactured by the layer. Thread-confined to the submitting thread
/// and alive only for the duration of the call; harvest state is gathered
/// out of it before the call returns.
pub struct SubmissionBatch<'a> {
    submits: Vec<vk::SubmitInfo>,
    // Backing storage for the first submit's rebuilt command-buffer list.
    rebuilt: Vec<vk::CommandBuffer>,
    injected_len: usize,
    pub fence: vk::Fence,
    pub fence_is_internal: bool,
    _app_data: PhantomData<&'a [vk::SubmitInfo]>,
}

impl<'a> SubmissionBatch<'a> {
    /// A batch that forwards the application's submission unchanged.
    pub fn passthrough(original: &'a [vk::SubmitInfo], fence: vk::Fence) -> Self {
        Self {
            submits: original.to_vec(),
            rebuilt: Vec::new(),
            injected_len: 0,
            fence,
            fence_is_internal: false,
            _app_data: PhantomData,
        }
    }

    /// A batch whose first submission runs `prefix` ahead of the
    /// application's own command buffers. Original buffer order, the
    /// fence, and all semaphore data are preserved; later submissions are
    /// untouched.
    pub fn augmented(
        original: &'a [vk::SubmitInfo],
        prefix: &[vk::CommandBuffer],
        fence: vk::Fence,
    ) -> Self {
        debug_assert!(!original.is_empty());

        let mut submits = original.to_vec();
        let first_cmds = command_buffers_of(&original[0]);

        let mut rebuilt = Vec::with_capacity(prefix.len() + first_cmds.len());
        rebuilt.extend_from_slice(prefix);
        rebuilt.extend_from_slice(first_cmds);

        submits[0].p_command_buffers = rebuilt.as_ptr();
        submits[0].command_buffer_count = rebuilt.len() as u32;

        Self {
            submits,
            rebuilt,
            injected_len: prefix.len(),
            fence,
            fence_is_internal: false,
            _app_data: PhantomData,
        }
    }

    pub fn with_internal_fence(mut self, fence: vk::Fence) -> Self {
        self.fence = fence;
        self.fence_is_internal = true;
        self
    }

    pub fn as_submits(&self) -> &[vk::SubmitInfo] {
        &self.submits
    }

    /// Every command buffer in the batch, in submission order.
    pub fn command_buffers(&self) -> Vec<vk::CommandBuffer> {
        self.submits
            .iter()
            .flat_map(|submit| command_buffers_of(submit).iter().copied())
            .collect()
    }

    /// Number of command buffers the layer injected ahead of the
    /// application's own.
    pub fn injected_count(&self) -> usize {
        self.injected_len
    }

    /// The injected prefix itself.
    pub fn injected_buffers(&self) -> &[vk::CommandBuffer] {
        &self.rebuilt[..self.injected_len]
    }
}

/// View of a submit info's command-buffer array. The pointers come from
/// the application's live call (or this batch's own storage) and are valid
/// for the duration of the submission.
pub fn command_buffers_of(submit: &vk::SubmitInfo) -> &[vk::CommandBuffer] {
    if submit.command_buffer_count == 0 || submit.p_command_buffers.is_null() {
        return &[];
    }
    unsafe {
        std::slice::from_raw_parts(submit.p_command_buffers, submit.command_buffer_count as usize)
    }
}
