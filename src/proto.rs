//! Wire protocol shared with the host.
//!
//! Both queues carry the same framing: a [`MsgHeader`] tagged with
//! [`MSG_MAGIC`] followed by `length` payload bytes whose layout depends on
//! the message type.  All fields are native little-endian; the payload
//! structs in this module are the exact byte images exchanged with the
//! host, so they are `#[repr(C)]`, padding free and [`bytemuck::Pod`].
//!
//! Requests larger than their fixed wire layout do not exist: inference
//! requests carry up to [`BUFFER_MAX`] input and output buffer descriptors
//! inline, unused slots zeroed.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use bytemuck::{Pod, Zeroable};

/// Frame sentinel, constant for this protocol version ("AFN1").
pub const MSG_MAGIC: u32 = 0x314E_4641;

/// Protocol version reported in [`VersionRsp`].
pub const MSG_VERSION_MAJOR: u8 = 1;
/// Protocol version reported in [`VersionRsp`].
pub const MSG_VERSION_MINOR: u8 = 0;
/// Protocol version reported in [`VersionRsp`].
pub const MSG_VERSION_PATCH: u8 = 0;

/// Maximum number of IFM or OFM buffer descriptors per inference request.
pub const BUFFER_MAX: usize = 16;

/// Number of PMU event counters carried per job.
pub const PMU_EVENT_MAX: usize = 4;

/// Capacity of the NUL-padded text in an [`ErrMsg`].
pub const ERR_MSG_MAX: usize = 80;

/// Message kinds carried in [`MsgHeader::msg_type`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Ping = 1,
    Pong = 2,
    Err = 3,
    VersionReq = 4,
    VersionRsp = 5,
    CapabilitiesReq = 6,
    CapabilitiesRsp = 7,
    InferenceReq = 8,
    InferenceRsp = 9,
}

impl MsgType {
    /// Decode a wire value.  Unknown values are left to the caller to
    /// report; they must not be silently mapped to a valid type.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(MsgType::Ping),
            2 => Some(MsgType::Pong),
            3 => Some(MsgType::Err),
            4 => Some(MsgType::VersionReq),
            5 => Some(MsgType::VersionRsp),
            6 => Some(MsgType::CapabilitiesReq),
            7 => Some(MsgType::CapabilitiesRsp),
            8 => Some(MsgType::InferenceReq),
            9 => Some(MsgType::InferenceRsp),
            _ => None,
        }
    }
}

/// Error categories carried in [`ErrMsg::err_type`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrType {
    Generic = 0,
    UnsupportedType = 1,
    InvalidMagic = 2,
    InvalidSize = 3,
    InvalidPayload = 4,
}

impl From<u32> for ErrType {
    fn from(value: u32) -> Self {
        match value {
            1 => ErrType::UnsupportedType,
            2 => ErrType::InvalidMagic,
            3 => ErrType::InvalidSize,
            4 => ErrType::InvalidPayload,
            _ => ErrType::Generic,
        }
    }
}

/// Inference completion status carried in [`InferenceRsp::status`].
pub const STATUS_OK: u32 = 0;
/// Inference completion status carried in [`InferenceRsp::status`].
pub const STATUS_ERROR: u32 = 1;

/// Frame header preceding every payload on either queue.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MsgHeader {
    /// Must equal [`MSG_MAGIC`]; anything else means the stream is
    /// desynchronised.
    pub magic: u32,
    /// One of the [`MsgType`] values.
    pub msg_type: u32,
    /// Payload byte count following this header.
    pub length: u32,
}

impl MsgHeader {
    pub fn new(msg_type: MsgType, length: u32) -> Self {
        Self {
            magic: MSG_MAGIC,
            msg_type: msg_type as u32,
            length,
        }
    }
}

/// A borrow of host memory: pointer and byte count of one tensor or model
/// buffer.  Ownership stays with the host for the duration of the request.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BufferDesc {
    pub ptr: u64,
    pub size: u64,
}

impl BufferDesc {
    pub const fn new(ptr: u64, size: u64) -> Self {
        Self { ptr, size }
    }
}

/// ERR payload, sent in either direction.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct ErrMsg {
    /// One of the [`ErrType`] values.
    pub err_type: u32,
    /// NUL-padded human readable explanation.
    pub msg: [u8; ERR_MSG_MAX],
}

impl ErrMsg {
    /// Build an error payload, truncating `text` to the wire capacity and
    /// keeping at least one terminating NUL.
    pub fn new(err_type: ErrType, text: &[u8]) -> Self {
        let mut msg = [0u8; ERR_MSG_MAX];
        let len = text.len().min(ERR_MSG_MAX - 1);
        msg[..len].copy_from_slice(&text[..len]);
        Self {
            err_type: err_type as u32,
            msg,
        }
    }

    /// The explanation up to the first NUL.
    pub fn text(&self) -> &[u8] {
        let end = self.msg.iter().position(|&b| b == 0).unwrap_or(ERR_MSG_MAX);
        &self.msg[..end]
    }
}

impl core::fmt::Debug for ErrMsg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ErrMsg")
            .field("err_type", &ErrType::from(self.err_type))
            .field("msg", &core::str::from_utf8(self.text()).unwrap_or("<non-utf8>"))
            .finish()
    }
}

/// VERSION_RSP payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct VersionRsp {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub reserved: u8,
}

impl VersionRsp {
    /// The compile-time protocol version triple.
    pub const fn current() -> Self {
        Self {
            major: MSG_VERSION_MAJOR,
            minor: MSG_VERSION_MINOR,
            patch: MSG_VERSION_PATCH,
            reserved: 0,
        }
    }
}

/// CAPABILITIES_REQ payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CapabilitiesReq {
    /// Opaque host token echoed back in the response.
    pub user_arg: u64,
}

/// CAPABILITIES_RSP payload.  All hardware and driver fields are zero on
/// platforms without an accelerator.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CapabilitiesRsp {
    pub user_arg: u64,
    pub hw_version_status: u8,
    pub hw_version_minor: u8,
    pub hw_version_major: u8,
    pub hw_product_major: u8,
    pub arch_patch_rev: u8,
    pub arch_minor_rev: u8,
    pub arch_major_rev: u8,
    pub reserved: u8,
    pub driver_patch: u8,
    pub driver_minor: u8,
    pub driver_major: u8,
    pub driver_reserved: u8,
    pub macs_per_cc: u32,
    pub cmd_stream_version: u32,
    pub custom_dma: u32,
}

/// INFERENCE_REQ payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InferenceReq {
    /// Opaque host token echoed back in the response.
    pub user_arg: u64,
    /// The model buffer.
    pub network: BufferDesc,
    /// Number of valid entries in `ifm`.
    pub ifm_count: u32,
    pub reserved0: u32,
    /// Input feature maps, `ifm_count` valid entries.
    pub ifm: [BufferDesc; BUFFER_MAX],
    /// Number of valid entries in `ofm`.
    pub ofm_count: u32,
    pub reserved1: u32,
    /// Output feature maps, `ofm_count` valid entries.
    pub ofm: [BufferDesc; BUFFER_MAX],
    /// PMU event types to monitor during the job.
    pub pmu_event_config: [u8; PMU_EVENT_MAX],
    /// Non-zero to capture the cycle counter across the job.
    pub pmu_cycle_counter_enable: u32,
}

/// INFERENCE_RSP payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InferenceRsp {
    /// The request's `user_arg`, echoed.
    pub user_arg: u64,
    /// Number of valid entries in `ofm_size`.
    pub ofm_count: u32,
    /// [`STATUS_OK`] or [`STATUS_ERROR`].
    pub status: u32,
    /// Bytes written to each output feature map.
    pub ofm_size: [u32; BUFFER_MAX],
    /// The PMU event configuration the job ran with.
    pub pmu_event_config: [u8; PMU_EVENT_MAX],
    pub pmu_cycle_counter_enable: u32,
    /// Final PMU event counter values.
    pub pmu_event_count: [u32; PMU_EVENT_MAX],
    /// Final cycle counter value, when enabled.
    pub pmu_cycle_counter_count: u64,
}

// The payload structs are wire images; pin their sizes so a stray field
// change cannot silently alter the ABI.
const _: () = {
    assert!(core::mem::size_of::<MsgHeader>() == 12);
    assert!(core::mem::size_of::<BufferDesc>() == 16);
    assert!(core::mem::size_of::<ErrMsg>() == 84);
    assert!(core::mem::size_of::<VersionRsp>() == 4);
    assert!(core::mem::size_of::<CapabilitiesReq>() == 8);
    assert!(core::mem::size_of::<CapabilitiesRsp>() == 32);
    assert!(core::mem::size_of::<InferenceReq>() == 560);
    assert!(core::mem::size_of::<InferenceRsp>() == 112);
};
