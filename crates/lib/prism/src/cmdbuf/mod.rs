//! Wrapped command buffers and their per-buffer timestamp profiler. Each
//! profiled call is bracketed by a top/bottom timestamp pair in a pool
//! owned by the wrapper; the harvest side reads the pool back against the
//! fill generation and call count captured at submit time.

use crate::{
    dispatch::{DeviceDispatch, TimestampStage},
    error::ProfilerError,
    trace::{FuncId, ProfilerResult},
};
use ash::vk::{self, Handle};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Two timestamp queries per profiled call.
const MAX_PROFILED_CALLS: u32 = 256;

struct ProfilerState {
    /// Generation counter, bumped on every begin. Results are only valid
    /// against the generation they were recorded in.
    fill_id: u64,
    profiled_calls: u32,
    query_pool: Option<vk::QueryPool>,
    call_funcs: Vec<FuncId>,
    capacity_warned: bool,
}

pub struct CommandBufferWrapper {
    handle: vk::CommandBuffer,
    dispatch: Arc<dyn DeviceDispatch>,
    state: Mutex<ProfilerState>,
}

impl CommandBufferWrapper {
    pub fn new(handle: vk::CommandBuffer, dispatch: Arc<dyn DeviceDispatch>) -> Self {
        Self {
            handle,
            dispatch,
            state: Mutex::new(ProfilerState {
                fill_id: 0,
                profiled_calls: 0,
                query_pool: None,
                call_funcs: Vec::new(),
                capacity_warned: false,
            }),
        }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn raw(&self) -> u64 {
        self.handle.as_raw()
    }

    /// Begin-of-recording bookkeeping: advances the fill generation and
    /// resets this fill's query range.
    pub fn on_begin(&self) {
        let mut state = self.state.lock().unwrap();
        state.fill_id += 1;
        state.profiled_calls = 0;
        state.call_funcs.clear();
        if let Some(pool) = state.query_pool {
            self.dispatch
                .cmd_reset_query_pool(self.handle, pool, MAX_PROFILED_CALLS * 2);
        }
    }

    /// Brackets one profiled call with a timestamp pair, running `record`
    /// between the brackets. Calls past the pool capacity run unprofiled.
    pub fn profile_call(&self, func: FuncId, record: impl FnOnce()) {
        let mut state = self.state.lock().unwrap();

        if state.query_pool.is_none() {
            match self
                .dispatch
                .create_timestamp_query_pool(MAX_PROFILED_CALLS * 2)
            {
                Ok(pool) => {
                    self.dispatch
                        .cmd_reset_query_pool(self.handle, pool, MAX_PROFILED_CALLS * 2);
                    state.query_pool = Some(pool);
                }
                Err(err) => {
                    if !state.capacity_warned {
                        state.capacity_warned = true;
                        warn!(
                            command_buffer = %format_args!("0x{:x}", self.raw()),
                            error = %err,
                            "profiler query pool creation failed; recording unprofiled"
                        );
                    }
                    drop(state);
                    record();
                    return;
                }
            }
        }

        if state.profiled_calls >= MAX_PROFILED_CALLS {
            if !state.capacity_warned {
                state.capacity_warned = true;
                warn!(
                    command_buffer = %format_args!("0x{:x}", self.raw()),
                    "profiler query pool exhausted; further calls unprofiled"
                );
            }
            drop(state);
            record();
            return;
        }

        let pool = state.query_pool.unwrap();
        let ordinal = state.profiled_calls;
        state.profiled_calls += 1;
        state.call_funcs.push(func);
        drop(state);

        self.dispatch
            .cmd_write_timestamp(self.handle, TimestampStage::Top, pool, ordinal * 2);
        record();
        self.dispatch
            .cmd_write_timestamp(self.handle, TimestampStage::Bottom, pool, ordinal * 2 + 1);
    }

    pub fn fill_id(&self) -> u64 {
        self.state.lock().unwrap().fill_id
    }

    pub fn profiled_call_count(&self) -> u32 {
        self.state.lock().unwrap().profiled_calls
    }

    /// Reads back this buffer's samples for the given fill generation.
    /// Only called after the governing fence signaled. CPU-timeline
    /// fields are left unset; alignment happens at delivery.
    pub fn results(
        &self,
        target_fill: u64,
        expected_calls: u32,
    ) -> Result<Vec<ProfilerResult>, ProfilerError> {
        if expected_calls == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.lock().unwrap();
        let pool = state.query_pool.ok_or(ProfilerError::NotProfiled)?;

        if state.fill_id != target_fill {
            return Err(ProfilerError::FillMismatch {
                requested: target_fill,
                current: state.fill_id,
            });
        }

        let ticks = self
            .dispatch
            .query_pool_results(pool, 0, expected_calls * 2)?;
        if ticks.len() < (expected_calls * 2) as usize {
            return Err(ProfilerError::ShortRead {
                expected: expected_calls * 2,
                got: ticks.len() as u32,
            });
        }

        let results = (0..expected_calls)
            .map(|ordinal| ProfilerResult {
                command_buffer: self.raw(),
                ordinal,
                func: state.call_funcs[ordinal as usize],
                gpu_begin_ticks: ticks[(ordinal * 2) as usize],
                gpu_end_ticks: ticks[(ordinal * 2 + 1) as usize],
                cpu_begin_ns: 0,
                cpu_end_ns: 0,
            })
            .collect();
        Ok(results)
    }

    /// Releases the wrapper's query pool. Called when the native buffer is
    /// freed, after any outstanding harvest completed.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(pool) = state.query_pool.take() {
            self.dispatch.destroy_query_pool(pool);
        }
    }
}
