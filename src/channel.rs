//! Framed message layer over a shared-memory queue.
//!
//! Every message on a queue is a [`MsgHeader`] - magic sentinel, type,
//! payload length - followed by the payload bytes.  Header and payload are
//! published in a single queue transaction, so the peer never observes a
//! partial frame.
//!
//! The stream is self describing but not self synchronising: if a header
//! arrives with the wrong magic the only recovery is [`MsgChannel::reset`],
//! which discards everything up to the producer's current write position.
//! The protocol does not scan forward looking for a magic value in-stream.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::mem::size_of;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::cache::CacheOps;
use crate::proto::{MsgHeader, MsgType};
use crate::queue::Queue;
use crate::{Error, Result};

/// A queue carrying magic-tagged frames.
pub struct MsgChannel<'a, C: CacheOps> {
    queue: Queue<'a, C>,
}

impl<'a, C: CacheOps> MsgChannel<'a, C> {
    pub fn new(queue: Queue<'a, C>) -> Self {
        Self { queue }
    }

    /// Whether any bytes are waiting on the queue.
    pub fn empty(&self) -> bool {
        self.queue.empty()
    }

    /// Bytes currently readable from the underlying queue.
    pub fn available(&self) -> usize {
        self.queue.available()
    }

    /// Bytes currently writable to the underlying queue.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Publish one frame: header plus payload in a single transaction.
    ///
    /// Fails with [`Error::QueueFull`] - with nothing committed - if the
    /// queue cannot take the whole frame.
    pub fn write_msg(&mut self, msg_type: MsgType, payload: &[u8]) -> Result<()> {
        let header = MsgHeader::new(msg_type, payload.len() as u32);

        self.queue.write(&[bytemuck::bytes_of(&header), payload])
    }

    /// Read the next frame header.
    ///
    /// Returns `Ok(None)` if the queue is empty.  Fails with
    /// [`Error::NoData`] if bytes are present but fewer than a full
    /// header; the caller decides whether that warrants a reset.
    ///
    /// The returned header's magic is not checked here - the dispatcher
    /// owns that policy.
    pub fn read_header(&mut self) -> Result<Option<MsgHeader>> {
        if self.queue.available() == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; size_of::<MsgHeader>()];
        self.queue.read(&mut buf)?;

        Ok(Some(bytemuck::pod_read_unaligned(&buf)))
    }

    /// Read a payload of exactly the wire size of `T`.
    ///
    /// `declared` is the length field from the frame header.  A mismatch
    /// with `size_of::<T>()` fails with [`Error::InvalidPayload`] without
    /// consuming anything; short data fails with [`Error::NoData`].
    pub fn read_payload<T: bytemuck::Pod>(&mut self, declared: u32) -> Result<T> {
        if declared as usize != size_of::<T>() {
            return Err(Error::InvalidPayload);
        }

        let mut value = T::zeroed();
        self.queue.read(bytemuck::bytes_of_mut(&mut value))?;

        Ok(value)
    }

    /// Advance the read position by `len` bytes, discarding a payload.
    pub fn skip(&mut self, len: u32) -> Result<()> {
        self.queue.skip(len as usize)
    }

    /// Discard the whole inbound backlog to resynchronise the stream.
    pub fn reset(&mut self) {
        self.queue.reset()
    }
}
