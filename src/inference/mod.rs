//! Inference job pipeline.
//!
//! One [`InferenceJob`] is built per decoded inference request and run to
//! completion by an [`InferenceRunner`] against the linked interpreter:
//! invalidate host regions, load and allocate the model, copy inputs in,
//! invoke, copy outputs out, optionally compare against expected outputs,
//! flush.  Any step failing aborts the job; the dispatcher reports a
//! single error status on the wire and the detail stays in the log.
//!
//! Tensor and model buffers are borrows of host memory for the duration
//! of the job.  Host mutation of a buffer while its job is in flight is a
//! protocol violation and is not defended against.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod invoker;

pub use invoker::{Invoker, InvokerError};

use core::ffi::c_void;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::cache::CacheOps;
use crate::proto::{BufferDesc, InferenceReq, BUFFER_MAX, PMU_EVENT_MAX};

/// A borrowed region of host-shared memory.
///
/// Carries no ownership: the host keeps the allocation alive for the
/// duration of the request that named it.  Reads and writes go directly
/// to the shared bytes; cache maintenance is explicit via
/// [`invalidate`](DataRegion::invalidate) and [`clean`](DataRegion::clean).
#[derive(Debug, Clone, Copy)]
pub struct DataRegion {
    ptr: *mut u8,
    size: usize,
}

impl DataRegion {
    /// Wrap a region.  The pointer must stay valid for as long as the
    /// region is read or written; the wire protocol guarantees that for
    /// buffers named in a request.
    pub fn new(ptr: *mut u8, size: usize) -> Self {
        Self { ptr, size }
    }

    /// Wrap the region a wire descriptor names.
    pub fn from_desc(desc: &BufferDesc) -> Self {
        Self::new(desc.ptr as usize as *mut u8, desc.size as usize)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0 || self.ptr.is_null()
    }

    /// Record how many bytes the co-processor wrote into the region.
    pub fn set_len(&mut self, len: usize) {
        self.size = len;
    }

    /// The region's bytes.  Empty for a null region.
    pub fn as_bytes(&self) -> &[u8] {
        if self.is_empty() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.size) }
    }

    /// The region's bytes, writable.  Empty for a null region.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        if self.is_empty() {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    /// Drop cached lines so subsequent loads observe host stores.
    pub fn invalidate<C: CacheOps>(&self) {
        C::invalidate(self.ptr, self.size);
    }

    /// Write back dirty lines so the host observes co-processor stores.
    pub fn clean<C: CacheOps>(&self) {
        C::flush(self.ptr, self.size);
    }
}

impl Default for DataRegion {
    fn default() -> Self {
        Self::new(core::ptr::null_mut(), 0)
    }
}

/// Fixed-capacity list of regions; sized by the wire limit so the hot
/// path never allocates.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionList {
    regions: [DataRegion; BUFFER_MAX],
    len: usize,
}

impl RegionList {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            regions: [DataRegion {
                ptr: core::ptr::null_mut(),
                size: 0,
            }; BUFFER_MAX],
            len: 0,
        }
    }

    /// Append a region; reports whether there was room.
    pub fn push(&mut self, region: DataRegion) -> bool {
        if self.len == BUFFER_MAX {
            return false;
        }
        self.regions[self.len] = region;
        self.len += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[DataRegion] {
        &self.regions[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [DataRegion] {
        &mut self.regions[..self.len]
    }
}

/// Job runner failures.  Collapsed to a single error status on the wire;
/// the detail is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobError {
    /// Model failed verification or its schema is unsupported.
    ModelInvalid,
    /// Tensor allocation failed.
    AllocationFailed,
    /// Request buffers do not line up with the model's tensors.
    IoMismatch,
    /// The forward pass failed.
    InvokeFailed,
    /// Output differs from the expected reference data.
    OutputMismatch,
}

/// Everything one inference request asks for, plus its results.
///
/// Created by the dispatcher from a decoded request, mutated only by the
/// runner during its single run, then serialised into the response.
pub struct InferenceJob {
    pub name: &'static str,
    pub network: DataRegion,
    pub input: RegionList,
    pub output: RegionList,
    pub expected_output: RegionList,
    /// Output bytes to log after a successful run; non-positive means
    /// none.
    pub bytes_to_print: isize,
    pub pmu_event_config: [u8; PMU_EVENT_MAX],
    pub pmu_cycle_counter_enable: u32,
    pub pmu_event_count: [u32; PMU_EVENT_MAX],
    pub pmu_cycle_counter_count: u64,
    /// Opaque context handed to the interpreter, null if unused.
    pub external_context: *mut c_void,
}

impl InferenceJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &'static str,
        network: DataRegion,
        input: RegionList,
        output: RegionList,
        expected_output: RegionList,
        bytes_to_print: isize,
        pmu_event_config: [u8; PMU_EVENT_MAX],
        pmu_cycle_counter_enable: u32,
    ) -> Self {
        Self {
            name,
            network,
            input,
            output,
            expected_output,
            bytes_to_print,
            pmu_event_config,
            pmu_cycle_counter_enable,
            pmu_event_count: [0; PMU_EVENT_MAX],
            pmu_cycle_counter_count: 0,
            external_context: core::ptr::null_mut(),
        }
    }

    /// Build a job from a decoded wire request.  Requests never carry
    /// expected outputs or a print budget.
    pub fn from_request(req: &InferenceReq) -> Self {
        let mut input = RegionList::new();
        for desc in &req.ifm[..(req.ifm_count as usize).min(BUFFER_MAX)] {
            input.push(DataRegion::from_desc(desc));
        }

        let mut output = RegionList::new();
        for desc in &req.ofm[..(req.ofm_count as usize).min(BUFFER_MAX)] {
            output.push(DataRegion::from_desc(desc));
        }

        Self::new(
            "job",
            DataRegion::from_desc(&req.network),
            input,
            output,
            RegionList::new(),
            -1,
            req.pmu_event_config,
            req.pmu_cycle_counter_enable,
        )
    }

    /// Invalidate every host region the job touches, before the run.
    pub fn invalidate<C: CacheOps>(&self) {
        self.network.invalidate::<C>();
        for region in self.input.as_slice() {
            region.invalidate::<C>();
        }
        for region in self.output.as_slice() {
            region.invalidate::<C>();
        }
        for region in self.expected_output.as_slice() {
            region.invalidate::<C>();
        }
    }

    /// Write back every host region the job touched, after the run.
    pub fn clean<C: CacheOps>(&self) {
        self.network.clean::<C>();
        for region in self.input.as_slice() {
            region.clean::<C>();
        }
        for region in self.output.as_slice() {
            region.clean::<C>();
        }
        for region in self.expected_output.as_slice() {
            region.clean::<C>();
        }
    }
}

/// Runs [`InferenceJob`]s against the linked interpreter.  Single
/// threaded and non-reentrant; the interpreter arena belongs to the
/// running job until `run_job` returns.
pub struct InferenceRunner<I: Invoker> {
    invoker: I,
}

impl<I: Invoker> InferenceRunner<I> {
    pub fn new(invoker: I) -> Self {
        Self { invoker }
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Execute one job to completion.
    ///
    /// Fail fast: the first failing step aborts the job, and the host
    /// regions are flushed whether the job succeeded or not.
    pub fn run_job<C: CacheOps>(&mut self, job: &mut InferenceJob) -> Result<(), JobError> {
        info!("Running inference job: {}", job.name);

        job.invalidate::<C>();
        let result = self.run_steps(job);
        job.clean::<C>();

        match result {
            Ok(()) => info!("Finished running job: {}", job.name),
            Err(e) => error!("Inference job failed: job={}, error={:?}", job.name, e),
        }

        result
    }

    fn run_steps(&mut self, job: &mut InferenceJob) -> Result<(), JobError> {
        if !job.external_context.is_null() {
            self.invoker.set_external_context(job.external_context);
        }

        self.invoker.load_model(&job.network).map_err(|e| {
            error!("Model rejected: job={}, error={:?}", job.name, e);
            JobError::ModelInvalid
        })?;

        self.invoker.allocate_tensors().map_err(|e| {
            error!(
                "Failed to allocate tensors for inference: job={}, error={:?}",
                job.name, e
            );
            JobError::AllocationFailed
        })?;

        self.copy_in(job)?;

        self.invoker.invoke().map_err(|e| {
            error!("Invoke failed for inference: job={}, error={:?}", job.name, e);
            JobError::InvokeFailed
        })?;

        info!("arena_used_bytes: {}", self.invoker.arena_used_bytes());
        info!("Inference runtime: {} cycles", self.invoker.total_cycles());

        if job.pmu_cycle_counter_enable != 0 {
            job.pmu_cycle_counter_count = self.invoker.total_cycles();
        }
        for counter in 0..PMU_EVENT_MAX {
            job.pmu_event_count[counter] = self.invoker.pmu_event_count(counter);
        }

        self.copy_out(job)?;
        self.print_output(job);
        self.compare_expected(job)?;

        Ok(())
    }

    // Pair request inputs with the model's non-empty input tensors and
    // copy the bytes in.
    fn copy_in(&mut self, job: &InferenceJob) -> Result<(), JobError> {
        let non_empty = (0..self.invoker.input_count())
            .filter(|&i| self.invoker.input_len(i) > 0)
            .count();
        if job.input.len() != non_empty {
            error!(
                "Number of input buffers does not match number of non empty network tensors: input={}, network={}",
                job.input.len(),
                non_empty
            );
            return Err(JobError::IoMismatch);
        }

        let mut next = 0;
        for index in 0..self.invoker.input_count() {
            let bytes = self.invoker.input_len(index);
            if bytes == 0 {
                continue;
            }

            let region = &job.input.as_slice()[next];
            next += 1;

            if region.len() != bytes {
                error!(
                    "Job input size does not match network input size: job={}, index={}, input={}, network={}",
                    job.name,
                    index,
                    region.len(),
                    bytes
                );
                return Err(JobError::IoMismatch);
            }

            self.invoker.input_buffer(index).copy_from_slice(region.as_bytes());
        }

        Ok(())
    }

    fn copy_out(&mut self, job: &mut InferenceJob) -> Result<(), JobError> {
        if job.output.is_empty() {
            return Ok(());
        }

        if self.invoker.output_count() != job.output.len() {
            error!(
                "Output size mismatch: job={}, network={}",
                job.output.len(),
                self.invoker.output_count()
            );
            return Err(JobError::IoMismatch);
        }

        for index in 0..self.invoker.output_count() {
            let bytes = self.invoker.output_len(index);
            let region = &mut job.output.as_mut_slice()[index];

            if bytes > region.len() {
                error!(
                    "Tensor size mismatch (bytes): actual={}, expected={}",
                    bytes,
                    region.len()
                );
                return Err(JobError::IoMismatch);
            }

            region.as_bytes_mut()[..bytes].copy_from_slice(self.invoker.output_buffer(index));
            region.set_len(bytes);
        }

        Ok(())
    }

    fn print_output(&self, job: &InferenceJob) {
        if job.bytes_to_print <= 0 {
            return;
        }

        info!("num_of_outputs: {}", self.invoker.output_count());
        for index in 0..self.invoker.output_count() {
            let data = self.invoker.output_buffer(index);
            let count = data.len().min(job.bytes_to_print as usize);
            info!("output[{}]: {:02x?}", index, &data[..count]);
        }
    }

    fn compare_expected(&self, job: &InferenceJob) -> Result<(), JobError> {
        if job.expected_output.is_empty() {
            return Ok(());
        }

        if job.expected_output.len() != self.invoker.output_count() {
            error!(
                "Expected number of output tensors mismatch: job={}, expected={}, network={}",
                job.name,
                job.expected_output.len(),
                self.invoker.output_count()
            );
            return Err(JobError::IoMismatch);
        }

        for index in 0..self.invoker.output_count() {
            let expected = &job.expected_output.as_slice()[index];
            let actual = self.invoker.output_buffer(index);

            if expected.len() != actual.len() {
                error!(
                    "Expected output tensor size mismatch: job={}, index={}, expected={}, network={}",
                    job.name,
                    index,
                    expected.len(),
                    actual.len()
                );
                return Err(JobError::OutputMismatch);
            }

            for (offset, (&want, &got)) in
                expected.as_bytes().iter().zip(actual.iter()).enumerate()
            {
                if want != got {
                    error!(
                        "Expected output tensor data mismatch: job={}, index={}, offset={}, expected={:02x}, network={:02x}",
                        job.name, index, offset, want, got
                    );
                    return Err(JobError::OutputMismatch);
                }
            }
        }

        Ok(())
    }
}
