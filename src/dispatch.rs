//! The co-processor main loop.
//!
//! One foreground loop owns both queues: drain the command queue frame by
//! frame, run each request to completion, publish the response, ring the
//! host's doorbell, and suspend on the doorbell when the command queue is
//! empty.  There are no worker threads; the only other context is the
//! doorbell interrupt, whose handler raises the [`WakeFlag`] and returns.
//!
//! Responses are serialised in request order.  A malformed frame costs
//! only the current backlog: the dispatcher reports an error frame to the
//! host and resets the command queue, and the system keeps running.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::fmt::Write;

use bytemuck::Zeroable;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::cache::CacheOps;
use crate::channel::MsgChannel;
use crate::inference::{InferenceJob, InferenceRunner, Invoker};
use crate::mailbox::{Doorbell, WakeFlag};
use crate::proto::{
    CapabilitiesReq, CapabilitiesRsp, ErrMsg, ErrType, InferenceReq, InferenceRsp, MsgType,
    VersionRsp, ERR_MSG_MAX, MSG_MAGIC, STATUS_ERROR, STATUS_OK,
};

/// Accelerator and driver identification reported in capability
/// responses.  All zeros on platforms without an accelerator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceInfo {
    pub hw_version_status: u8,
    pub hw_version_minor: u8,
    pub hw_version_major: u8,
    pub hw_product_major: u8,
    pub arch_patch_rev: u8,
    pub arch_minor_rev: u8,
    pub arch_major_rev: u8,
    pub driver_patch: u8,
    pub driver_minor: u8,
    pub driver_major: u8,
    pub macs_per_cc: u32,
    pub cmd_stream_version: u32,
    pub custom_dma: u32,
}

impl DeviceInfo {
    fn capabilities_rsp(&self, user_arg: u64) -> CapabilitiesRsp {
        CapabilitiesRsp {
            user_arg,
            hw_version_status: self.hw_version_status,
            hw_version_minor: self.hw_version_minor,
            hw_version_major: self.hw_version_major,
            hw_product_major: self.hw_product_major,
            arch_patch_rev: self.arch_patch_rev,
            arch_minor_rev: self.arch_minor_rev,
            arch_major_rev: self.arch_major_rev,
            reserved: 0,
            driver_patch: self.driver_patch,
            driver_minor: self.driver_minor,
            driver_major: self.driver_major,
            driver_reserved: 0,
            macs_per_cc: self.macs_per_cc,
            cmd_stream_version: self.cmd_stream_version,
            custom_dma: self.custom_dma,
        }
    }
}

/// The dispatcher: command queue in, response queue out.
pub struct Dispatcher<'a, C: CacheOps, I: Invoker, D: Doorbell> {
    queue_in: MsgChannel<'a, C>,
    queue_out: MsgChannel<'a, C>,
    doorbell: D,
    runner: InferenceRunner<I>,
    wake: &'a WakeFlag,
    device: DeviceInfo,
}

impl<'a, C: CacheOps, I: Invoker, D: Doorbell> Dispatcher<'a, C, I, D> {
    /// Create a dispatcher over an initialized queue pair.
    ///
    /// `wake` is the flag the doorbell interrupt handler raises; wire the
    /// handler to [`WakeFlag::raise`] on the same object.
    pub fn new(
        queue_in: MsgChannel<'a, C>,
        queue_out: MsgChannel<'a, C>,
        doorbell: D,
        runner: InferenceRunner<I>,
        wake: &'a WakeFlag,
        device: DeviceInfo,
    ) -> Self {
        Self {
            queue_in,
            queue_out,
            doorbell,
            runner,
            wake,
            device,
        }
    }

    pub fn runner(&self) -> &InferenceRunner<I> {
        &self.runner
    }

    /// The foreground loop: drain, then suspend until the host rings.
    /// Never returns.
    pub fn run(&mut self) -> ! {
        loop {
            // Clear the pending wake before draining so a ring that lands
            // mid-drain is seen on the next pass.
            self.wake.take();

            self.process();

            if !self.wake.is_raised() {
                self.doorbell.wait();
            }
        }
    }

    /// Handle every frame currently in the command queue.
    pub fn process(&mut self) {
        while self.handle_message() {}
    }

    /// Handle at most one frame.  Returns whether the caller should keep
    /// draining.
    pub fn handle_message(&mut self) -> bool {
        let header = match self.queue_in.read_header() {
            Ok(Some(header)) => header,
            Ok(None) => return false,
            Err(_) => {
                self.send_error_and_reset(
                    ErrType::InvalidSize,
                    "Failed to read a complete header",
                );
                return false;
            }
        };

        info!(
            "Msg: header magic={:08X}, type={}, length={}",
            header.magic, header.msg_type, header.length
        );

        if header.magic != MSG_MAGIC {
            self.send_error_and_reset(ErrType::InvalidMagic, "Invalid magic");
            return false;
        }

        match MsgType::from_u32(header.msg_type) {
            Some(MsgType::Ping) => {
                info!("Msg: Ping");
                self.send_pong();
            }
            Some(MsgType::Err) => {
                match self.queue_in.read_payload::<ErrMsg>(header.length) {
                    Ok(err) => info!(
                        "Msg: Received an error response, type={}, msg=\"{}\"",
                        err.err_type,
                        core::str::from_utf8(err.text()).unwrap_or("<non-utf8>")
                    ),
                    Err(_) => error!("Msg: Failed to receive error message"),
                }
                self.queue_in.reset();
                return false;
            }
            Some(MsgType::VersionReq) => {
                info!("Msg: Version request");
                self.send_version_rsp();
            }
            Some(MsgType::CapabilitiesReq) => {
                let req: CapabilitiesReq = match self.queue_in.read_payload(header.length) {
                    Ok(req) => req,
                    Err(_) => {
                        self.send_error_and_reset(
                            ErrType::InvalidPayload,
                            "CapabilitiesReq. Failed to read payload",
                        );
                        return false;
                    }
                };

                info!("Msg: Capability request. user_arg={:#x}", req.user_arg);

                self.send_capabilities_rsp(req.user_arg);
            }
            Some(MsgType::InferenceReq) => {
                let req: InferenceReq = match self.queue_in.read_payload(header.length) {
                    Ok(req) => req,
                    Err(_) => {
                        self.send_error_and_reset(
                            ErrType::InvalidPayload,
                            "InferenceReq. Failed to read payload",
                        );
                        return false;
                    }
                };

                self.handle_inference(&req);
            }
            _ => {
                let mut text = ErrText::new();
                let _ = write!(
                    text,
                    "Unknown message type: {} with payload length {} bytes",
                    header.msg_type, header.length
                );
                self.send_error_and_reset(ErrType::UnsupportedType, text.as_str());
                return false;
            }
        }

        true
    }

    fn handle_inference(&mut self, req: &InferenceReq) {
        info!(
            "Msg: InferenceReq. user_arg={:#x}, network={{{:#x}, {}}}, ifm_count={}, ofm_count={}",
            req.user_arg, req.network.ptr, req.network.size, req.ifm_count, req.ofm_count
        );

        let mut job = InferenceJob::from_request(req);
        let failed = self.runner.run_job::<C>(&mut job).is_err();

        self.send_inference_rsp(req.user_arg, &job, failed);
    }

    fn send_pong(&mut self) {
        if self.queue_out.write_msg(MsgType::Pong, &[]).is_err() {
            error!("Msg: Failed to write pong response. No mailbox message sent");
        } else {
            self.ring();
        }
    }

    fn send_version_rsp(&mut self) {
        let version = VersionRsp::current();

        if self
            .queue_out
            .write_msg(MsgType::VersionRsp, bytemuck::bytes_of(&version))
            .is_err()
        {
            error!("Msg: Failed to write version response. No mailbox message sent");
        } else {
            self.ring();
        }
    }

    fn send_capabilities_rsp(&mut self, user_arg: u64) {
        let capabilities = self.device.capabilities_rsp(user_arg);

        if self
            .queue_out
            .write_msg(MsgType::CapabilitiesRsp, bytemuck::bytes_of(&capabilities))
            .is_err()
        {
            error!("Msg: Failed to write capability response. No mailbox message sent");
        } else {
            self.ring();
        }
    }

    fn send_inference_rsp(&mut self, user_arg: u64, job: &InferenceJob, failed: bool) {
        let mut rsp = InferenceRsp::zeroed();
        rsp.user_arg = user_arg;
        rsp.ofm_count = job.output.len() as u32;
        rsp.status = if failed { STATUS_ERROR } else { STATUS_OK };

        for (index, region) in job.output.as_slice().iter().enumerate() {
            rsp.ofm_size[index] = region.len() as u32;
        }

        rsp.pmu_event_config = job.pmu_event_config;
        rsp.pmu_cycle_counter_enable = job.pmu_cycle_counter_enable;
        rsp.pmu_event_count = job.pmu_event_count;
        rsp.pmu_cycle_counter_count = job.pmu_cycle_counter_count;

        info!(
            "Sending inference response. user_arg={:#x}, ofm_count={}, status={}",
            rsp.user_arg, rsp.ofm_count, rsp.status
        );

        if self
            .queue_out
            .write_msg(MsgType::InferenceRsp, bytemuck::bytes_of(&rsp))
            .is_err()
        {
            error!("Msg: Failed to write inference response. No mailbox message sent");
        } else {
            self.ring();
        }
    }

    // Report a protocol error to the host, then discard the inbound
    // backlog.  A failed write leaves the backlog in place and rings
    // nothing - the host has nothing coherent to read.
    fn send_error_and_reset(&mut self, err_type: ErrType, text: &str) {
        error!("Msg: \"{}\"", text);

        let err = ErrMsg::new(err_type, text.as_bytes());
        if self
            .queue_out
            .write_msg(MsgType::Err, bytemuck::bytes_of(&err))
            .is_err()
        {
            error!("Msg: Failed to write error response. No mailbox message sent");
            return;
        }

        self.queue_in.reset();
        self.ring();
    }

    fn ring(&mut self) {
        if self.doorbell.ring().is_err() {
            error!("Msg: Failed to ring host doorbell");
        }
    }
}

// Fixed-capacity text buffer for formatted error strings, truncating at
// the wire limit.
struct ErrText {
    buf: [u8; ERR_MSG_MAX],
    len: usize,
}

impl ErrText {
    fn new() -> Self {
        Self {
            buf: [0; ERR_MSG_MAX],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl Write for ErrText {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = ERR_MSG_MAX - 1 - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}
