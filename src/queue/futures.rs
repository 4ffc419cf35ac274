//! Asynchronous queue - used by the host.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use alloc::boxed::Box;
use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::{Reader, Writer};
use crate::queue::{check_base_addr, check_queue_size, QueueHeader};
use crate::{Error, Result};

/// Trait for accessing a queue region in co-processor memory.
///
/// Async version, typically used for accessing the region over a driver or
/// debug transport.  Addresses are absolute as seen by the co-processor.
#[async_trait(?Send)]
pub trait AsyncQueueIo {
    /// Atomic read u32 operation
    async fn read_u32(&mut self, addr: u64) -> Result<u32>;

    /// Atomic write u32 operation
    async fn write_u32(&mut self, addr: u64, value: u32) -> Result<()>;

    /// Bulk read access, no need for atomicity
    async fn read_bulk(&mut self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Bulk write access, no need for atomicity
    async fn write_bulk(&mut self, addr: u64, data: &[u8]) -> Result<()>;
}

/// Queue I/O implementation bridging [`Reader`] and [`Writer`]
/// implementations, for hosts that reach the co-processor over a transport
/// rather than a shared mapping.
pub struct ReaderWriterQueueIo<'a, R: Reader, W: Writer> {
    reader: &'a mut R,
    writer: &'a mut W,
}

impl<'a, R: Reader, W: Writer> ReaderWriterQueueIo<'a, R, W> {
    pub fn new(reader: &'a mut R, writer: &'a mut W) -> Self {
        Self { reader, writer }
    }
}

#[async_trait(?Send)]
impl<R: Reader, W: Writer> AsyncQueueIo for ReaderWriterQueueIo<'_, R, W> {
    async fn read_u32(&mut self, addr: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.reader.read(addr, &mut buf).await.map_err(|e| {
            error!("Queue read at {addr:#010x} failed: {e:?}");
            Error::Io
        })?;
        Ok(u32::from_le_bytes(buf))
    }

    async fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.writer
            .write(addr, &value.to_le_bytes())
            .await
            .map_err(|e| {
                error!("Queue write at {addr:#010x} failed: {e:?}");
                Error::Io
            })
    }

    async fn read_bulk(&mut self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.reader.read(addr, buf).await.map_err(|e| {
            error!("Queue bulk read at {addr:#010x} failed: {e:?}");
            Error::Io
        })
    }

    async fn write_bulk(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.writer.write(addr, data).await.map_err(|e| {
            error!("Queue bulk write at {addr:#010x} failed: {e:?}");
            Error::Io
        })
    }
}

/// Asynchronous view of a co-processor queue.
///
/// Mirrors the semantics of [`crate::queue::Queue`] over an
/// [`AsyncQueueIo`] transport.  Cache maintenance is the co-processor's
/// concern; host mappings and transports are expected to be coherent.
pub struct AsyncQueue<'a, I: AsyncQueueIo> {
    io: &'a mut I,
    base_addr: u64,
    size: usize,
}

impl<'a, I: AsyncQueueIo> AsyncQueue<'a, I> {
    /// Connect to a queue the co-processor has already initialized.
    ///
    /// Arguments:
    /// - `io` - Object implementing [`AsyncQueueIo`] to access the region
    /// - `base_addr` - Base address of the queue region
    pub async fn connect(io: &'a mut I, base_addr: u64) -> Result<Self> {
        check_base_addr(base_addr)?;

        let mut queue = Self {
            io,
            base_addr,
            size: 0,
        };

        let size = queue
            .io
            .read_u32(base_addr + QueueHeader::size_offset())
            .await? as usize;
        if size == 0 {
            return Err(Error::Uninit);
        }
        check_queue_size(size)?;
        queue.size = size;

        debug!("Connected to queue at {base_addr:#010x} size {size} bytes");

        Ok(queue)
    }

    /// Capacity of the data region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the queue currently holds no data.
    pub async fn empty(&mut self) -> Result<bool> {
        Ok(self.available().await? == 0)
    }

    /// Bytes currently readable.
    pub async fn available(&mut self) -> Result<usize> {
        let read = self.load_read().await?;
        let write = self.load_write().await?;

        Ok(if write >= read {
            write - read
        } else {
            self.size - read + write
        })
    }

    /// Bytes currently writable, as `size - available`.
    pub async fn capacity(&mut self) -> Result<usize> {
        Ok(self.size - self.available().await?)
    }

    /// Consume exactly `dst.len()` bytes.
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.available().await? {
            return Err(Error::NoData);
        }

        let pos = self.load_read().await?;
        let first = dst.len().min(self.size - pos);
        let (head, tail) = dst.split_at_mut(first);
        self.io.read_bulk(self.data_addr(pos), head).await?;
        if !tail.is_empty() {
            self.io.read_bulk(self.data_addr(0), tail).await?;
        }

        let rpos = (pos + dst.len()) % self.size;
        self.store_read(rpos).await
    }

    /// Publish the concatenation of `bufs` as one atomic transaction.  The
    /// write pointer is updated only after every payload byte has been
    /// transferred.
    pub async fn write(&mut self, bufs: &[&[u8]]) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();

        if total > self.size - self.available().await? {
            return Err(Error::QueueFull);
        }

        let mut pos = self.load_write().await?;
        for buf in bufs {
            let first = buf.len().min(self.size - pos);
            self.io.write_bulk(self.data_addr(pos), &buf[..first]).await?;
            if first < buf.len() {
                self.io.write_bulk(self.data_addr(0), &buf[first..]).await?;
            }
            pos = (pos + buf.len()) % self.size;
        }

        // Publication point
        self.store_write(pos).await
    }

    /// Discard `len` bytes without transferring them.
    pub async fn skip(&mut self, len: usize) -> Result<()> {
        if len > self.available().await? {
            return Err(Error::NoData);
        }

        let rpos = (self.load_read().await? + len) % self.size;
        self.store_read(rpos).await
    }

    /// Discard everything up to the co-processor's current write position.
    pub async fn reset(&mut self) -> Result<()> {
        let wpos = self.load_write().await?;
        self.store_read(wpos).await
    }
}

// Internal functions
impl<I: AsyncQueueIo> AsyncQueue<'_, I> {
    fn data_addr(&self, pos: usize) -> u64 {
        self.base_addr + QueueHeader::data_offset() + pos as u64
    }

    async fn load_read(&mut self) -> Result<usize> {
        let read = self
            .io
            .read_u32(self.base_addr + QueueHeader::read_offset())
            .await?;
        Ok(read as usize % self.size)
    }

    async fn load_write(&mut self) -> Result<usize> {
        let write = self
            .io
            .read_u32(self.base_addr + QueueHeader::write_offset())
            .await?;
        Ok(write as usize % self.size)
    }

    async fn store_read(&mut self, pos: usize) -> Result<()> {
        self.io
            .write_u32(self.base_addr + QueueHeader::read_offset(), pos as u32)
            .await
    }

    async fn store_write(&mut self, pos: usize) -> Result<()> {
        self.io
            .write_u32(self.base_addr + QueueHeader::write_offset(), pos as u32)
            .await
    }
}
