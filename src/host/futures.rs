//! Asynchronous host client - for hosts behind a memory transport.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::mem::size_of;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::host::{HostConfig, Response};
use crate::proto::{
    CapabilitiesReq, CapabilitiesRsp, InferenceReq, InferenceRsp, MsgHeader, MsgType, VersionRsp,
    MSG_MAGIC,
};
use crate::queue::{AsyncQueue, AsyncQueueIo};
use crate::{Error, Result};

/// Yield delay for async polling loops.
///
/// Application must provide an implementation of this trait in order for
/// the async client to be able to yield while waiting for the
/// co-processor to respond.
///
/// This trait keeps the crate free of any specific async runtime.
///
/// Example:
///
/// ```rust,ignore
/// use embassy_time::{Duration, Timer};
/// struct Delay;
/// impl AsyncDelay for Delay {
///     async fn delay() {
///         Timer::after(Duration::from_millis(1)).await;
///     }
/// }
/// ```
pub trait AsyncDelay {
    fn delay() -> impl core::future::Future<Output = ()>;
}

/// Async host client for request/response exchanges with the
/// co-processor.
///
/// See [`AsyncDelay`] for the required delay trait.
///
/// Each request sends one frame on the command queue, rings the
/// co-processor's doorbell register, then polls the response queue until
/// the matching response frame arrives.  Responses always come back in
/// request order, so one outstanding request at a time is the natural
/// usage.
pub struct AsyncHostClient<'a, I: AsyncQueueIo, D: AsyncDelay> {
    io: &'a mut I,
    config: HostConfig,
    _delay: core::marker::PhantomData<D>,
}

impl<'a, I: AsyncQueueIo, D: AsyncDelay> AsyncHostClient<'a, I, D> {
    /// Create a new AsyncHostClient
    ///
    /// Arguments:
    /// - `io`: Object implementing [`AsyncQueueIo`] to reach the shared
    ///   region and the doorbell register
    /// - `config`: Queue and doorbell addresses
    pub fn new(io: &'a mut I, config: HostConfig) -> Self {
        Self {
            io,
            config,
            _delay: core::marker::PhantomData,
        }
    }

    /// Liveness probe.
    pub async fn ping(&mut self) -> Result<()> {
        self.send(MsgType::Ping, &[]).await?;

        match self.recv().await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// The co-processor's protocol version.
    pub async fn version(&mut self) -> Result<VersionRsp> {
        self.send(MsgType::VersionReq, &[]).await?;

        match self.recv().await? {
            Response::Version(version) => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    /// Accelerator and driver capabilities.
    pub async fn capabilities(&mut self, user_arg: u64) -> Result<CapabilitiesRsp> {
        let req = CapabilitiesReq { user_arg };
        self.send(MsgType::CapabilitiesReq, bytemuck::bytes_of(&req))
            .await?;

        match self.recv().await? {
            Response::Capabilities(caps) => Ok(caps),
            other => Err(unexpected(other)),
        }
    }

    /// Run one inference and wait for its response.  The response carries
    /// the job status; a failed job is a successful exchange.
    pub async fn infer(&mut self, req: &InferenceReq) -> Result<InferenceRsp> {
        self.send(MsgType::InferenceReq, bytemuck::bytes_of(req))
            .await?;

        match self.recv().await? {
            Response::Inference(rsp) => Ok(rsp),
            other => Err(unexpected(other)),
        }
    }

    async fn send(&mut self, msg_type: MsgType, payload: &[u8]) -> Result<()> {
        debug!("Sending {msg_type:?} request ({} bytes)", payload.len());

        let mut commands = AsyncQueue::connect(&mut *self.io, self.config.cmd_queue_addr).await?;
        let header = MsgHeader::new(msg_type, payload.len() as u32);
        commands.write(&[bytemuck::bytes_of(&header), payload]).await?;
        drop(commands);

        // Any store to the doorbell register rings the co-processor
        self.io.write_u32(self.config.doorbell_addr, 1).await
    }

    async fn recv(&mut self) -> Result<Response> {
        let mut responses =
            AsyncQueue::connect(&mut *self.io, self.config.rsp_queue_addr).await?;

        // Wait for a complete header with polling
        loop {
            if responses.available().await? >= size_of::<MsgHeader>() {
                break;
            }
            D::delay().await;
        }

        let mut buf = [0u8; size_of::<MsgHeader>()];
        responses.read(&mut buf).await?;
        let header: MsgHeader = bytemuck::pod_read_unaligned(&buf);

        if header.magic != MSG_MAGIC {
            error!("Response stream desynchronised: magic={:08X}", header.magic);
            return Err(Error::InvalidMagic);
        }

        match MsgType::from_u32(header.msg_type) {
            Some(MsgType::Pong) => {
                if header.length != 0 {
                    return Err(Error::InvalidPayload);
                }
                Ok(Response::Pong)
            }
            Some(MsgType::VersionRsp) => Ok(Response::Version(
                read_payload(&mut responses, header.length).await?,
            )),
            Some(MsgType::CapabilitiesRsp) => Ok(Response::Capabilities(
                read_payload(&mut responses, header.length).await?,
            )),
            Some(MsgType::InferenceRsp) => Ok(Response::Inference(
                read_payload(&mut responses, header.length).await?,
            )),
            Some(MsgType::Err) => Ok(Response::Error(
                read_payload(&mut responses, header.length).await?,
            )),
            _ => {
                warn!("Unexpected response type {}", header.msg_type);
                responses.skip(header.length as usize).await?;
                Err(Error::UnsupportedType)
            }
        }
    }
}

async fn read_payload<I: AsyncQueueIo, T: bytemuck::Pod>(
    queue: &mut AsyncQueue<'_, I>,
    declared: u32,
) -> Result<T> {
    if declared as usize != size_of::<T>() {
        return Err(Error::InvalidPayload);
    }

    let mut value = T::zeroed();
    queue.read(bytemuck::bytes_of_mut(&mut value)).await?;

    Ok(value)
}

fn unexpected(response: Response) -> Error {
    match response {
        Response::Error(err) => {
            error!("Co-processor reported an error: {err:?}");
            Error::Io
        }
        other => {
            warn!("Out of order response: {other:?}");
            Error::UnsupportedType
        }
    }
}
