use ash::vk;
use std::fmt;
use thiserror::Error;

/// A driver entry point returned a failure code. Carries the entry point
/// name so log lines identify the call site without a backtrace.
///
/// Shim entry points propagate these verbatim; the layer never masks a
/// driver error from the wrapped application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverError {
    pub call: &'static str,
    pub code: vk::Result,
}

impl DriverError {
    pub fn new(call: &'static str, code: vk::Result) -> Self {
        Self { call, code }
    }

    /// The driver's textual status name, for trace entries and logs.
    pub fn status(&self) -> &'static str {
        status_str(self.code)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.call, self.status())
    }
}

impl std::error::Error for DriverError {}

pub type DriverResult<T> = Result<T, DriverError>;

/// Translate a driver status code to text.
pub fn status_str(code: vk::Result) -> &'static str {
    match code {
        vk::Result::SUCCESS => "VK_SUCCESS",
        vk::Result::NOT_READY => "VK_NOT_READY",
        vk::Result::TIMEOUT => "VK_TIMEOUT",
        vk::Result::EVENT_SET => "VK_EVENT_SET",
        vk::Result::EVENT_RESET => "VK_EVENT_RESET",
        vk::Result::INCOMPLETE => "VK_INCOMPLETE",
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => "VK_ERROR_OUT_OF_HOST_MEMORY",
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => "VK_ERROR_OUT_OF_DEVICE_MEMORY",
        vk::Result::ERROR_INITIALIZATION_FAILED => "VK_ERROR_INITIALIZATION_FAILED",
        vk::Result::ERROR_DEVICE_LOST => "VK_ERROR_DEVICE_LOST",
        vk::Result::ERROR_MEMORY_MAP_FAILED => "VK_ERROR_MEMORY_MAP_FAILED",
        vk::Result::ERROR_FEATURE_NOT_PRESENT => "VK_ERROR_FEATURE_NOT_PRESENT",
        vk::Result::ERROR_TOO_MANY_OBJECTS => "VK_ERROR_TOO_MANY_OBJECTS",
        vk::Result::ERROR_OUT_OF_DATE_KHR => "VK_ERROR_OUT_OF_DATE_KHR",
        vk::Result::SUBOPTIMAL_KHR => "VK_SUBOPTIMAL_KHR",
        _ => "VK_ERROR_UNKNOWN",
    }
}

/// Frame-capture setup failures. Recovered locally: the submission falls
/// back to the unmodified command-buffer list and the capture flag is
/// cleared so the failure does not repeat every frame.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture requested with no source image")]
    MissingSourceImage,
    #[error("capture destination extent {width}x{height} is empty")]
    ZeroExtent { width: u32, height: u32 },
    #[error("no host-visible memory type for capture readback")]
    NoHostVisibleMemory,
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl CaptureError {
    /// Stable kind tag for once-per-kind log flood guards.
    pub fn kind(&self) -> usize {
        match self {
            CaptureError::MissingSourceImage => 0,
            CaptureError::ZeroExtent { .. } => 1,
            CaptureError::NoHostVisibleMemory => 2,
            CaptureError::Driver(_) => 3,
        }
    }
}

pub const CAPTURE_ERROR_KINDS: usize = 4;

/// Per-command-buffer profiler extraction failures. Non-fatal to the
/// batch: the error is logged with identifying context and extraction
/// continues with the remaining buffers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfilerError {
    #[error("profiler results requested for fill {requested} but buffer is at fill {current}")]
    FillMismatch { requested: u64, current: u64 },
    #[error("profiler readback returned {got} samples, expected {expected}")]
    ShortRead { expected: u32, got: u32 },
    #[error("command buffer was never profiled")]
    NotProfiled,
    #[error("{0}")]
    Driver(DriverError),
}

impl From<DriverError> for ProfilerError {
    fn from(err: DriverError) -> Self {
        ProfilerError::Driver(err)
    }
}
