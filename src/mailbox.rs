//! Doorbell signalling between the two agents.
//!
//! A doorbell is a hardware register whose write raises an interrupt on
//! the peer.  It carries no data - it only says "look at your queue".
//! This module defines the [`Doorbell`] seam the dispatcher drives, the
//! [`WakeFlag`] an interrupt handler raises, and a software loopback
//! implementation for simulation and tests.
//!
//! The interrupt-context contract is strict: the handler body raises the
//! flag and executes the wake primitive (SEV on Cortex-M), nothing more.
//! All queue work happens in the foreground loop.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicBool, Ordering};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::Result;

/// Bi-directional doorbell seam.
///
/// `ring` is outbound: wake the peer after publishing to a queue.  `wait`
/// is inbound: suspend until the peer (or an earlier missed ring) wakes
/// this side.  Implementations must give `wait` event-register semantics:
/// a wake that arrives between draining the queue and calling `wait` makes
/// the next `wait` return immediately rather than being lost.  On
/// Cortex-M that is exactly WFE/SEV.
pub trait Doorbell {
    /// Ring the peer's doorbell.  Non-blocking; rings may coalesce.
    fn ring(&mut self) -> Result<()>;

    /// Suspend until woken.
    fn wait(&mut self);

    /// Optional probe that the doorbell hardware is present and sane.
    /// Not required for correctness.
    fn verify_hardware(&mut self) -> bool {
        true
    }
}

/// Wake-pending flag shared between the interrupt handler and the
/// foreground loop.
///
/// The interrupt handler calls [`WakeFlag::raise`] and returns; the
/// dispatcher clears the flag before draining so a ring that lands during
/// the drain is seen on the next pass.
pub struct WakeFlag(AtomicBool);

impl WakeFlag {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Mark a wake as pending.  Interrupt-context safe; this is the whole
    /// of the doorbell interrupt handler's job.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether a wake was pending.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::Acquire)
    }

    /// Whether a wake is pending, without clearing it.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Software doorbell connecting two agents in the same address space.
///
/// Each side constructs one from its own wake flag and the peer's:
/// `ring` raises the peer's flag, `wait` spins until the local flag has
/// been raised.  Useful for simulation, and for exercising the full
/// dispatch path in tests without mailbox hardware.
pub struct SoftDoorbell<'a> {
    local: &'a WakeFlag,
    peer: &'a WakeFlag,
}

impl<'a> SoftDoorbell<'a> {
    pub fn new(local: &'a WakeFlag, peer: &'a WakeFlag) -> Self {
        Self { local, peer }
    }
}

impl Doorbell for SoftDoorbell<'_> {
    fn ring(&mut self) -> Result<()> {
        self.peer.raise();
        Ok(())
    }

    fn wait(&mut self) {
        while !self.local.take() {
            core::hint::spin_loop();
        }
    }
}
