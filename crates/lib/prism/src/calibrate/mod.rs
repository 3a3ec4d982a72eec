//! CPU/GPU timeline calibration. One pair is captured back to back around
//! each profiled submission and is only valid for that submission's
//! results; clock drift across submissions is unbounded, so pairs are
//! never reused.

use crate::{dispatch::DeviceDispatch, error::DriverResult};
use ash::vk;
use std::time::Instant;

/// Monotonic wall-clock for the layer, anchored at context creation.
/// Everything the layer reports is expressed in nanoseconds since this
/// epoch.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// One CPU sample and one GPU sample taken together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationTimestampPair {
    pub cpu_ns: u64,
    pub gpu_ticks: u64,
}

impl CalibrationTimestampPair {
    /// Samples the GPU clock through the dispatch table and pairs it with
    /// the midpoint of the two CPU reads bracketing the sample.
    pub fn collect(
        dispatch: &dyn DeviceDispatch,
        queue: vk::Queue,
        clock: &Clock,
    ) -> DriverResult<Self> {
        let cpu_before = clock.now_ns();
        let gpu_ticks = dispatch.sample_gpu_timestamp(queue)?;
        let cpu_after = clock.now_ns();
        Ok(Self {
            cpu_ns: cpu_before + (cpu_after - cpu_before) / 2,
            gpu_ticks,
        })
    }
}

/// Linear projection from GPU ticks onto the CPU timeline, built from one
/// calibration pair and the device's fixed timestamp period.
#[derive(Debug, Clone, Copy)]
pub struct GpuTimeline {
    pair: CalibrationTimestampPair,
    period_ns: f32,
}

impl GpuTimeline {
    pub fn new(pair: CalibrationTimestampPair, period_ns: f32) -> Self {
        Self { pair, period_ns }
    }

    /// Projects a GPU timestamp onto the CPU timeline. Ticks before the
    /// calibration point clamp to the epoch rather than wrapping.
    pub fn to_cpu_ns(&self, gpu_ticks: u64) -> u64 {
        let delta_ticks = gpu_ticks as i128 - self.pair.gpu_ticks as i128;
        let delta_ns = (delta_ticks as f64 * f64::from(self.period_ns)) as i128;
        let projected = self.pair.cpu_ns as i128 + delta_ns;
        projected.max(0) as u64
    }
}
