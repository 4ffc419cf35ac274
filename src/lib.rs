//! Message transport and inference dispatch for NPU co-processors.
//!
//! This crate is the firmware-side control plane of a two-agent system: a
//! host CPU and a microcontroller co-processor driving a neural network
//! accelerator.  The two agents exchange framed messages through a pair of
//! unidirectional queues in shared memory, and ring a hardware doorbell at
//! each other whenever new data has been published.
//!
//! `no_std`.  Requires `alloc` only for the async host client.
//!
//! ## Architecture
//!
//! Communication uses two byte-granular circular queues in shared memory:
//! - **Command queue**: Host writes requests, co-processor reads
//! - **Response queue**: Co-processor writes responses, host reads
//!
//! Each queue starts with a small header (`{size, read, write}`) followed by
//! a data area.  The header layout is part of the ABI with the host.  Both
//! queues are strictly single-producer/single-consumer: the host is the only
//! producer of the command queue and the co-processor the only producer of
//! the response queue, so no locks are needed.  The producer publishes
//! payload bytes first and updates its queue pointer last; on systems where
//! the shared region is cached, every publication is paired with explicit
//! cache maintenance (see [`cache::CacheOps`]).
//!
//! On top of the queues sits a self-describing frame format: every message
//! carries a `{magic, type, length}` header.  A magic mismatch means the
//! inbound stream is desynchronised; the dispatcher reports an error to the
//! host and resets the queue to recover.
//!
//! The co-processor runs a single foreground loop (the [`dispatch`]
//! module): drain the command queue, handle each frame to completion, reply
//! on the response queue, ring the doorbell, and suspend on wait-for-event
//! when idle.  Inference requests are routed through a deterministic job
//! pipeline ([`inference`]) against an opaque interpreter behind the
//! [`inference::Invoker`] trait.
//!
//! ## Modules
//!
//! - [`queue`] - Shared-memory circular queues (sync device side, async
//!   host side)
//! - [`channel`] - Framed message layer over a queue
//! - [`proto`] - Wire protocol: message types and payload layouts
//! - [`mailbox`] - Doorbell abstraction and wake flag
//! - [`dispatch`] - The co-processor main loop
//! - [`inference`] - Inference job pipeline and the interpreter seam
//! - [`parser`] - Model container parsing (tensor geometry)
//! - [`host`] - Host-side clients for driving the co-processor
//! - [`io`] - Async traits for remote access to co-processor memory
//!
//! ## Supported targets
//!
//! The device side works on any core that can map the shared region and
//! provide a doorbell; it was written for ARM Cortex-M co-processors.  On
//! M-profile cores without a data cache use [`cache::NoCache`]; on cores
//! with one, implement [`cache::CacheOps`] over the SCB clean/invalidate
//! operations.  The host side can run in the same address space (sync
//! client) or behind a debug/mailbox transport (async client).
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable the asynchronous host client and queue IO traits
//!   (requires `alloc`).  Not needed by the co-processor itself.
//!
//! Compile with `--no-default-features` for a device-only build.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![no_std]

#[cfg(feature = "async")]
extern crate alloc;

pub mod cache;
pub mod channel;
pub mod dispatch;
pub mod host;
pub mod inference;
#[cfg(feature = "async")]
pub mod io;
pub mod mailbox;
pub mod parser;
pub mod proto;
pub mod queue;

/// Transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Not enough data available in the queue
    NoData,
    /// Not enough free space in the queue
    QueueFull,
    /// Frame magic does not match the protocol sentinel
    InvalidMagic,
    /// Declared payload length does not match the expected size
    InvalidPayload,
    /// Message type not understood
    UnsupportedType,
    /// Queue region too small to hold the header plus any data
    BufferTooSmall,
    /// Queue region not word aligned
    NotAligned,
    /// Uninitialized queue
    Uninit,
    /// I/O error on the underlying transport
    Io,
}

/// Type to represent the result of a transport operation
pub type Result<T> = core::result::Result<T, Error>;
