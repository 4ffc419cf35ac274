//! Host-side clients for driving the co-processor:
//! - Command queue: host writes requests, co-processor reads
//! - Response queue: co-processor writes responses, host reads
//!
//! [`HostClient`] is the synchronous client for hosts that map the shared
//! region directly.  [`futures::AsyncHostClient`] reaches the queues
//! through an async memory transport instead, for example a debug link or
//! a kernel driver.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;

#[cfg(feature = "async")]
pub use futures::{AsyncDelay, AsyncHostClient};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::cache::CacheOps;
use crate::channel::MsgChannel;
use crate::mailbox::Doorbell;
use crate::proto::{
    CapabilitiesReq, CapabilitiesRsp, ErrMsg, ErrType, InferenceReq, InferenceRsp, MsgType,
    VersionRsp, MSG_MAGIC,
};
use crate::{Error, Result};

/// Addresses a host needs to reach the co-processor, as seen from the
/// co-processor's address map.
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    /// Command queue region (host is the producer).
    pub cmd_queue_addr: u64,
    /// Response queue region (host is the consumer).
    pub rsp_queue_addr: u64,
    /// Doorbell register; any store rings the co-processor.
    pub doorbell_addr: u64,
}

/// One decoded response frame.
#[derive(Debug)]
pub enum Response {
    Pong,
    Version(VersionRsp),
    Capabilities(CapabilitiesRsp),
    Inference(InferenceRsp),
    Error(ErrMsg),
}

/// Synchronous host client over a directly mapped shared region.
pub struct HostClient<'a, C: CacheOps, D: Doorbell> {
    commands: MsgChannel<'a, C>,
    responses: MsgChannel<'a, C>,
    doorbell: D,
}

impl<'a, C: CacheOps, D: Doorbell> HostClient<'a, C, D> {
    /// Create a client from the host's view of the two queues.
    ///
    /// Arguments:
    /// - `commands` - Producer view of the command queue
    /// - `responses` - Consumer view of the response queue
    /// - `doorbell` - Doorbell towards the co-processor
    pub fn new(
        commands: MsgChannel<'a, C>,
        responses: MsgChannel<'a, C>,
        doorbell: D,
    ) -> Self {
        Self {
            commands,
            responses,
            doorbell,
        }
    }

    /// Liveness probe; answered with a PONG.
    pub fn ping(&mut self) -> Result<()> {
        self.send(MsgType::Ping, &[])
    }

    /// Ask for the co-processor's protocol version.
    pub fn version_request(&mut self) -> Result<()> {
        self.send(MsgType::VersionReq, &[])
    }

    /// Ask for accelerator and driver capabilities.  `user_arg` is an
    /// opaque token echoed back in the response.
    pub fn capabilities_request(&mut self, user_arg: u64) -> Result<()> {
        let req = CapabilitiesReq { user_arg };
        self.send(MsgType::CapabilitiesReq, bytemuck::bytes_of(&req))
    }

    /// Submit an inference request.
    pub fn inference_request(&mut self, req: &InferenceReq) -> Result<()> {
        self.send(MsgType::InferenceReq, bytemuck::bytes_of(req))
    }

    /// Report a protocol error to the co-processor.  It logs and drops
    /// the report; no reply comes back.
    pub fn send_error(&mut self, err_type: ErrType, text: &str) -> Result<()> {
        let err = ErrMsg::new(err_type, text.as_bytes());
        self.send(MsgType::Err, bytemuck::bytes_of(&err))
    }

    /// Decode one response frame, if a complete one is waiting.
    pub fn poll(&mut self) -> Result<Option<Response>> {
        let header = match self.responses.read_header() {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e),
        };

        if header.magic != MSG_MAGIC {
            error!("Response stream desynchronised: magic={:08X}", header.magic);
            return Err(Error::InvalidMagic);
        }

        let response = match MsgType::from_u32(header.msg_type) {
            Some(MsgType::Pong) => {
                if header.length != 0 {
                    return Err(Error::InvalidPayload);
                }
                Response::Pong
            }
            Some(MsgType::VersionRsp) => {
                Response::Version(self.responses.read_payload(header.length)?)
            }
            Some(MsgType::CapabilitiesRsp) => {
                Response::Capabilities(self.responses.read_payload(header.length)?)
            }
            Some(MsgType::InferenceRsp) => {
                Response::Inference(self.responses.read_payload(header.length)?)
            }
            Some(MsgType::Err) => Response::Error(self.responses.read_payload(header.length)?),
            _ => {
                warn!("Unexpected response type {}", header.msg_type);
                self.responses.skip(header.length)?;
                return Err(Error::UnsupportedType);
            }
        };

        Ok(Some(response))
    }

    /// Block until a response frame arrives, suspending on the doorbell
    /// between polls.
    pub fn wait_response(&mut self) -> Result<Response> {
        loop {
            if let Some(response) = self.poll()? {
                return Ok(response);
            }
            self.doorbell.wait();
        }
    }

    fn send(&mut self, msg_type: MsgType, payload: &[u8]) -> Result<()> {
        self.commands.write_msg(msg_type, payload)?;
        self.doorbell.ring()
    }
}
