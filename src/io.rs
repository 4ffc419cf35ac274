//! Async I/O traits for host access to co-processor memory.
//!
//! The host does not always share an address space with the co-processor:
//! the queue region may sit behind a mailbox window, a PCIe BAR or a debug
//! protocol.  These traits abstract that transport so the async host client
//! can drive the queues wherever they live.
//!
//! # Possible implementations
//!
//! - Same-address-space hosts: volatile reads/writes of the mapped region
//! - Remote hosts: SWD/JTAG memory access, or a kernel driver ioctl
//! - PC-side tooling and tests: plain reads/writes of an in-memory buffer
//!
//! # Address space
//!
//! Addresses are absolute as seen by the co-processor; the implementation
//! is responsible for translating them to its own representation (window
//! offsets, debug commands, etc.).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// Reader trait.
pub trait Reader {
    /// The error type returned by read operations.
    ///
    /// This allows implementations to use their own error types
    /// (e.g., `std::io::Error` for driver I/O, custom errors for SWD).
    type Error: core::fmt::Debug;

    /// Read bytes from co-processor memory at the specified absolute
    /// address.
    ///
    /// # Arguments
    ///
    /// * `addr` - The absolute address to read from
    /// * `buf` - Buffer to fill with the read data
    ///
    /// # Errors
    ///
    /// Returns an error if the address is out of bounds for the shared
    /// region or the underlying transport fails.
    fn read(
        &mut self,
        addr: u64,
        buf: &mut [u8],
    ) -> impl core::future::Future<Output = core::result::Result<(), Self::Error>> + Send;
}

/// Writer trait.
pub trait Writer {
    /// The error type returned by write operations.
    type Error: core::fmt::Debug;

    /// Write bytes to co-processor memory at the specified absolute
    /// address.
    ///
    /// # Arguments
    ///
    /// * `addr` - The absolute address to write to
    /// * `data` - Data to write
    ///
    /// # Errors
    ///
    /// Returns an error if the address is out of bounds for the shared
    /// region, the memory is not writable, or the underlying transport
    /// fails.
    fn write(
        &mut self,
        addr: u64,
        data: &[u8],
    ) -> impl core::future::Future<Output = core::result::Result<(), Self::Error>> + Send;
}
