//! Synchronous queue - used by the co-processor.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::{addr_of, addr_of_mut};
use core::sync::atomic::{fence, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::cache::CacheOps;
use crate::queue::{check_base_addr, check_queue_size, QueueHeader, QueueStorage};
use crate::{Error, Result};

/// One side of a shared-memory circular queue, accessed directly.
///
/// Whether this view is the producer or the consumer side is decided by
/// which operations are used; each queue must have exactly one producer and
/// one consumer across the two agents.
///
/// All reads of peer-updated state invalidate the relevant cache lines
/// first; all publications finish with a clean.  Header and data ranges are
/// maintained separately so that invalidating the peer's header cannot
/// discard data bytes this side has staged but not yet published.
pub struct Queue<'a, C: CacheOps> {
    header: *mut QueueHeader,
    data: *mut u8,
    size: usize,
    _region: PhantomData<&'a mut [u8]>,
    _cache: PhantomData<C>,
}

impl<'a, C: CacheOps> Queue<'a, C> {
    /// Map a queue over an initialized shared region.
    ///
    /// Arguments:
    /// - `base` - Base address of the region: header followed by data.
    ///
    /// # Safety
    ///
    /// `base` must point to a readable and writable region laid out as a
    /// [`QueueHeader`] followed by `header.size` data bytes, and remain
    /// valid (and unaliased by other local code) for the queue's lifetime.
    pub unsafe fn from_raw(base: *mut u8) -> Result<Self> {
        check_base_addr(base as u64)?;

        let header = base as *mut QueueHeader;
        C::invalidate(base as *const u8, size_of::<QueueHeader>());
        let size = addr_of!((*header).size).read_volatile() as usize;
        if size == 0 {
            return Err(Error::Uninit);
        }
        check_queue_size(size)?;

        debug!(
            "Mapped queue at {:#010x} size {} bytes",
            base as usize, size
        );

        Ok(Self {
            header,
            data: base.add(size_of::<QueueHeader>()),
            size,
            _region: PhantomData,
            _cache: PhantomData,
        })
    }

    /// Map a queue over locally owned storage.
    pub fn from_storage<const N: usize>(storage: &'a mut QueueStorage<N>) -> Result<Self> {
        // Storage is a live borrow for 'a, so the region outlives the queue.
        unsafe { Self::from_raw(storage.base_ptr()) }
    }

    /// Capacity of the data region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the queue currently holds no data.
    pub fn empty(&self) -> bool {
        self.invalidate_header();

        self.load_read() == self.load_write()
    }

    /// Bytes currently readable.
    pub fn available(&self) -> usize {
        self.invalidate_header();

        self.available_raw()
    }

    /// Bytes currently writable, as `size - available`.
    pub fn capacity(&self) -> usize {
        self.size - self.available()
    }

    /// Consume exactly `dst.len()` bytes.
    ///
    /// Fails with [`Error::NoData`] - leaving the queue untouched - if
    /// fewer bytes are available.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        self.invalidate_header_data();

        if dst.len() > self.available_raw() {
            return Err(Error::NoData);
        }

        // Peer stores to the data region happen-before its write pointer
        // update; pair that with an acquire before loading the bytes.
        fence(Ordering::Acquire);

        let rpos = self.copy_out(self.load_read(), dst);

        // All loads complete before the slots are released to the producer
        fence(Ordering::Release);
        self.store_read(rpos);

        self.flush_header();

        Ok(())
    }

    /// Publish the concatenation of `bufs` as one atomic transaction.
    ///
    /// Fails with [`Error::QueueFull`] - leaving header and data untouched
    /// - if the queue cannot hold every byte.  On success the write pointer
    /// is updated only after all payload bytes are in place.
    pub fn write(&mut self, bufs: &[&[u8]]) -> Result<()> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();

        self.invalidate_header();

        if total > self.size - self.available_raw() {
            return Err(Error::QueueFull);
        }

        let mut wpos = self.load_write();
        for buf in bufs {
            wpos = self.copy_in(wpos, buf);
        }

        // Update the write position last; the store is the publication
        // point and must not be reordered before the payload copies.
        fence(Ordering::Release);
        self.store_write(wpos);

        self.flush_header_data();

        Ok(())
    }

    /// Discard `len` bytes without copying them out.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.invalidate_header();

        if len > self.available_raw() {
            return Err(Error::NoData);
        }

        let rpos = (self.load_read() + len) % self.size;
        self.store_read(rpos);

        self.flush_header();

        Ok(())
    }

    /// Discard everything up to the peer's current write position.  Used
    /// to recover from a desynchronised inbound stream.
    pub fn reset(&mut self) {
        self.invalidate_header();

        let wpos = self.load_write();
        self.store_read(wpos);

        self.flush_header();
    }
}

// Internal functions
impl<C: CacheOps> Queue<'_, C> {
    fn available_raw(&self) -> usize {
        let read = self.load_read();
        let write = self.load_write();

        if write >= read {
            write - read
        } else {
            self.size - read + write
        }
    }

    fn copy_in(&mut self, pos: usize, src: &[u8]) -> usize {
        let first = src.len().min(self.size - pos);
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.data.add(pos), first);
            core::ptr::copy_nonoverlapping(
                src[first..].as_ptr(),
                self.data,
                src.len() - first,
            );
        }
        (pos + src.len()) % self.size
    }

    fn copy_out(&mut self, pos: usize, dst: &mut [u8]) -> usize {
        let first = dst.len().min(self.size - pos);
        unsafe {
            core::ptr::copy_nonoverlapping(self.data.add(pos), dst.as_mut_ptr(), first);
            core::ptr::copy_nonoverlapping(
                self.data,
                dst[first..].as_mut_ptr(),
                dst.len() - first,
            );
        }
        (pos + dst.len()) % self.size
    }

    // Positions are reduced modulo size on load; a corrupt header then
    // cannot index outside the data region.
    fn load_read(&self) -> usize {
        unsafe { addr_of!((*self.header).read).read_volatile() as usize % self.size }
    }

    fn load_write(&self) -> usize {
        unsafe { addr_of!((*self.header).write).read_volatile() as usize % self.size }
    }

    fn store_read(&mut self, pos: usize) {
        unsafe { addr_of_mut!((*self.header).read).write_volatile(pos as u32) }
    }

    fn store_write(&mut self, pos: usize) {
        unsafe { addr_of_mut!((*self.header).write).write_volatile(pos as u32) }
    }

    fn invalidate_header(&self) {
        C::invalidate(self.header as *const u8, size_of::<QueueHeader>());
    }

    fn invalidate_header_data(&self) {
        self.invalidate_header();
        C::invalidate(self.data as *const u8, self.size);
    }

    fn flush_header(&self) {
        C::flush(self.header as *const u8, size_of::<QueueHeader>());
    }

    fn flush_header_data(&self) {
        self.flush_header();
        C::flush(self.data as *const u8, self.size);
    }
}
