//! Shared test harness: a fake shared-memory region, a software
//! interpreter built on the model parser, and doorbell doubles.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use airfrog_npu::cache::NoCache;
use airfrog_npu::channel::MsgChannel;
use airfrog_npu::dispatch::{DeviceInfo, Dispatcher};
use airfrog_npu::host::HostClient;
use airfrog_npu::inference::{InferenceRunner, Invoker, InvokerError};
use airfrog_npu::mailbox::{Doorbell, WakeFlag};
use airfrog_npu::parser::{self, ParseError};
use airfrog_npu::proto::{BufferDesc, InferenceReq, BUFFER_MAX, PMU_EVENT_MAX};
use airfrog_npu::queue::{Queue, QueueStorage};
use airfrog_npu::Result;

pub const QUEUE_SIZE: usize = 1024;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Both queue regions, heap-held so host and device views can coexist.
pub struct SharedMemory {
    cmd: Box<QueueStorage<QUEUE_SIZE>>,
    rsp: Box<QueueStorage<QUEUE_SIZE>>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self {
            cmd: Box::new(QueueStorage::new()),
            rsp: Box::new(QueueStorage::new()),
        }
    }

    /// Device view: command queue consumer, response queue producer.
    pub fn device_channels<'a>(&mut self) -> (MsgChannel<'a, NoCache>, MsgChannel<'a, NoCache>) {
        unsafe {
            (
                MsgChannel::new(Queue::from_raw(self.cmd.base_ptr()).unwrap()),
                MsgChannel::new(Queue::from_raw(self.rsp.base_ptr()).unwrap()),
            )
        }
    }

    /// Host view: command queue producer, response queue consumer.
    pub fn host_channels<'a>(&mut self) -> (MsgChannel<'a, NoCache>, MsgChannel<'a, NoCache>) {
        self.device_channels()
    }

    /// Raw view of the command queue, for injecting malformed frames.
    pub fn cmd_queue<'a>(&mut self) -> Queue<'a, NoCache> {
        unsafe { Queue::from_raw(self.cmd.base_ptr()).unwrap() }
    }

    /// Raw view of the response queue.
    pub fn rsp_queue<'a>(&mut self) -> Queue<'a, NoCache> {
        unsafe { Queue::from_raw(self.rsp.base_ptr()).unwrap() }
    }

    pub fn cmd_base(&mut self) -> u64 {
        self.cmd.base_ptr() as u64
    }

    pub fn rsp_base(&mut self) -> u64 {
        self.rsp.base_ptr() as u64
    }
}

/// Shared ring counter for asserting doorbell behaviour.
#[derive(Clone, Default)]
pub struct RingCounter(Rc<Cell<usize>>);

impl RingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.get()
    }
}

/// Doorbell double that counts rings; tests drive the dispatcher by hand
/// so nothing should ever wait.
pub struct CountingDoorbell {
    rings: RingCounter,
}

impl CountingDoorbell {
    pub fn new(rings: RingCounter) -> Self {
        Self { rings }
    }
}

impl Doorbell for CountingDoorbell {
    fn ring(&mut self) -> Result<()> {
        self.rings.0.set(self.rings.0.get() + 1);
        Ok(())
    }

    fn wait(&mut self) {
        unreachable!("manually drained tests never suspend");
    }
}

/// Host-side doorbell for tests that poll instead of suspending.
pub struct NullDoorbell;

impl Doorbell for NullDoorbell {
    fn ring(&mut self) -> Result<()> {
        Ok(())
    }

    fn wait(&mut self) {
        unreachable!("polling tests never suspend");
    }
}

// Software interpreter

/// Deterministic output transform shared between the interpreter and the
/// tests' expectations: concatenate all inputs, then
/// `out[k][j] = concat[(j + k) % concat.len()] + 1`.
pub fn reference_output(inputs: &[&[u8]], ofm_sizes: &[usize]) -> Vec<Vec<u8>> {
    let concat: Vec<u8> = inputs.concat();

    ofm_sizes
        .iter()
        .enumerate()
        .map(|(k, &size)| {
            (0..size)
                .map(|j| {
                    if concat.is_empty() {
                        0x5A
                    } else {
                        concat[(j + k) % concat.len()].wrapping_add(1)
                    }
                })
                .collect()
        })
        .collect()
}

/// A software interpreter over the crate's model container, with call
/// tracking so tests can assert which pipeline steps ran.
#[derive(Default)]
pub struct SoftInterpreter {
    ifm_sizes: Vec<usize>,
    ofm_sizes: Vec<usize>,
    inputs: Vec<Vec<u8>>,
    outputs: Vec<Vec<u8>>,
    cycles: u64,
    pub allocate_called: bool,
    pub invoke_called: bool,
}

impl SoftInterpreter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Invoker for SoftInterpreter {
    fn load_model(&mut self, model: &airfrog_npu::inference::DataRegion) -> std::result::Result<(), InvokerError> {
        let info = parser::parse_model(model.as_bytes()).map_err(|e| match e {
            ParseError::UnsupportedSchema => InvokerError::UnsupportedVersion,
            _ => InvokerError::InvalidModel,
        })?;

        self.ifm_sizes = info.ifm_sizes.as_slice().to_vec();
        self.ofm_sizes = info.ofm_sizes.as_slice().to_vec();
        self.inputs.clear();
        self.outputs.clear();

        Ok(())
    }

    fn allocate_tensors(&mut self) -> std::result::Result<(), InvokerError> {
        self.allocate_called = true;
        self.inputs = self.ifm_sizes.iter().map(|&s| vec![0; s]).collect();
        self.outputs = self.ofm_sizes.iter().map(|&s| vec![0; s]).collect();
        Ok(())
    }

    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn input_len(&self, index: usize) -> usize {
        self.inputs[index].len()
    }

    fn input_buffer(&mut self, index: usize) -> &mut [u8] {
        &mut self.inputs[index]
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn output_len(&self, index: usize) -> usize {
        self.outputs[index].len()
    }

    fn output_buffer(&self, index: usize) -> &[u8] {
        &self.outputs[index]
    }

    fn invoke(&mut self) -> std::result::Result<(), InvokerError> {
        self.invoke_called = true;

        let inputs: Vec<&[u8]> = self.inputs.iter().map(|v| v.as_slice()).collect();
        self.outputs = reference_output(&inputs, &self.ofm_sizes);
        self.cycles = 1000 + self.arena_used_bytes() as u64;

        Ok(())
    }

    fn arena_used_bytes(&self) -> usize {
        self.ifm_sizes.iter().sum::<usize>() + self.ofm_sizes.iter().sum::<usize>()
    }

    fn total_cycles(&self) -> u64 {
        self.cycles
    }

    fn pmu_event_count(&self, counter: usize) -> u32 {
        ((counter + 1) * 0x10) as u32
    }
}

// Model container builder

/// Serialise a single-subgraph model with 8-bit tensors, so a tensor's
/// byte size equals the product of its dims.
pub fn build_model(input_dims: &[&[u32]], output_dims: &[&[u32]]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&parser::MODEL_MAGIC.to_le_bytes());
    buf.extend_from_slice(&parser::MODEL_SCHEMA_VERSION.to_le_bytes());

    let mut description = [0u8; parser::DESCRIPTION_BYTES];
    description[..10].copy_from_slice(b"soft model");
    buf.extend_from_slice(&description);

    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&(input_dims.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(output_dims.len() as u32).to_le_bytes());

    for dims in input_dims.iter().chain(output_dims.iter()) {
        buf.extend_from_slice(&(parser::ElemType::I8 as u32).to_le_bytes());
        buf.extend_from_slice(&(dims.len() as u32).to_le_bytes());
        for &d in *dims {
            buf.extend_from_slice(&d.to_le_bytes());
        }
    }

    buf
}

/// Rewrite a serialised model's schema version in place.
pub fn set_schema_version(model: &mut [u8], version: u32) {
    model[4..8].copy_from_slice(&version.to_le_bytes());
}

/// Wire descriptor for a host-owned buffer the device only reads.
pub fn desc(buf: &[u8]) -> BufferDesc {
    BufferDesc::new(buf.as_ptr() as u64, buf.len() as u64)
}

/// Wire descriptor for a host-owned buffer the device writes into.
pub fn desc_mut(buf: &mut [u8]) -> BufferDesc {
    BufferDesc::new(buf.as_mut_ptr() as u64, buf.len() as u64)
}

/// Assemble an inference request from wire descriptors.
pub fn make_inference_req(
    user_arg: u64,
    network: BufferDesc,
    ifm: &[BufferDesc],
    ofm: &[BufferDesc],
) -> InferenceReq {
    let mut req = InferenceReq {
        user_arg,
        network,
        ifm_count: ifm.len() as u32,
        reserved0: 0,
        ifm: [BufferDesc::new(0, 0); BUFFER_MAX],
        ofm_count: ofm.len() as u32,
        reserved1: 0,
        ofm: [BufferDesc::new(0, 0); BUFFER_MAX],
        pmu_event_config: [0; PMU_EVENT_MAX],
        pmu_cycle_counter_enable: 0,
    };
    req.ifm[..ifm.len()].copy_from_slice(ifm);
    req.ofm[..ofm.len()].copy_from_slice(ofm);
    req
}

// Dispatcher wiring

pub type TestDispatcher<'a> = Dispatcher<'a, NoCache, SoftInterpreter, CountingDoorbell>;
pub type TestHostClient<'a> = HostClient<'a, NoCache, NullDoorbell>;

/// Device-side dispatcher over the shared region, with a counting
/// doorbell.
pub fn make_dispatcher<'a>(
    mem: &mut SharedMemory,
    wake: &'a WakeFlag,
    rings: RingCounter,
    device: DeviceInfo,
) -> TestDispatcher<'a> {
    let (cmd, rsp) = mem.device_channels();

    Dispatcher::new(
        cmd,
        rsp,
        CountingDoorbell::new(rings),
        InferenceRunner::new(SoftInterpreter::new()),
        wake,
        device,
    )
}

/// Host-side client over the shared region, polling (never suspending).
pub fn make_host_client<'a>(mem: &mut SharedMemory) -> TestHostClient<'a> {
    let (cmd, rsp) = mem.host_channels();
    HostClient::new(cmd, rsp, NullDoorbell)
}

/// Move a `!Send` harness into a test thread.  Sound here because the
/// two threads touch disjoint queue roles and the queue protocol itself
/// orders the shared accesses.
pub struct AssertSend<T>(pub T);

unsafe impl<T> Send for AssertSend<T> {}
