//! Async host client against a manually driven dispatcher: every pending
//! poll of the client future hands the device one drain pass.

#![cfg(feature = "async")]

mod common;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use airfrog_npu::dispatch::DeviceInfo;
use airfrog_npu::host::{AsyncDelay, AsyncHostClient, HostConfig};
use airfrog_npu::io::{Reader, Writer};
use airfrog_npu::mailbox::WakeFlag;
use airfrog_npu::proto::{VersionRsp, STATUS_OK};
use airfrog_npu::queue::ReaderWriterQueueIo;

use common::{
    build_model, desc, desc_mut, init_logging, make_dispatcher, make_inference_req,
    reference_output, RingCounter, SharedMemory,
};

// Same-address-space transport: addresses are real pointers.
struct RamReader;

impl Reader for RamReader {
    type Error = core::convert::Infallible;

    fn read(
        &mut self,
        addr: u64,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    addr as usize as *const u8,
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
            Ok(())
        }
    }
}

struct RamWriter;

impl Writer for RamWriter {
    type Error = core::convert::Infallible;

    fn write(
        &mut self,
        addr: u64,
        data: &[u8],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async move {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    addr as usize as *mut u8,
                    data.len(),
                );
            }
            Ok(())
        }
    }
}

// Delay that suspends exactly once, so the executor can run the device.
struct YieldDelay;

impl AsyncDelay for YieldDelay {
    fn delay() -> impl Future<Output = ()> {
        YieldOnce(false)
    }
}

struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);

    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

// Drive the client future, giving the device one drain pass per pending
// poll.
fn block_on_with<F: Future>(fut: F, mut tick: impl FnMut()) -> F::Output {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut fut = std::pin::pin!(fut);

    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => tick(),
        }
    }
}

#[test]
fn async_client_round_trips() {
    init_logging();

    let mut mem = SharedMemory::new();
    let wake = WakeFlag::new();
    let rings = RingCounter::new();
    let mut dispatcher = make_dispatcher(&mut mem, &wake, rings.clone(), DeviceInfo::default());

    let mut doorbell_reg = 0u32;
    let config = HostConfig {
        cmd_queue_addr: mem.cmd_base(),
        rsp_queue_addr: mem.rsp_base(),
        doorbell_addr: &mut doorbell_reg as *mut u32 as u64,
    };

    let mut reader = RamReader;
    let mut writer = RamWriter;
    let mut io = ReaderWriterQueueIo::new(&mut reader, &mut writer);
    let mut client: AsyncHostClient<'_, _, YieldDelay> = AsyncHostClient::new(&mut io, config);

    block_on_with(client.ping(), || dispatcher.process()).unwrap();

    let version = block_on_with(client.version(), || dispatcher.process()).unwrap();
    assert_eq!(version, VersionRsp::current());

    let caps = block_on_with(client.capabilities(0x55AA), || dispatcher.process()).unwrap();
    assert_eq!(caps.user_arg, 0x55AA);

    let model = build_model(&[&[4]], &[&[4]]);
    let ifm = [3u8, 1, 4, 1];
    let mut ofm = [0u8; 4];
    let expected = reference_output(&[&ifm], &[4]).remove(0);

    let req = make_inference_req(99, desc(&model), &[desc(&ifm)], &[desc_mut(&mut ofm)]);
    let rsp = block_on_with(client.infer(&req), || dispatcher.process()).unwrap();

    assert_eq!(rsp.user_arg, 99);
    assert_eq!(rsp.status, STATUS_OK);
    assert_eq!(rsp.ofm_count, 1);
    assert_eq!(rsp.ofm_size[0], 4);
    assert_eq!(ofm.to_vec(), expected);

    // Every request rang the host-side doorbell register at least once
    assert_eq!(doorbell_reg, 1);
    // And the device rang back once per response
    assert_eq!(rings.count(), 4);
}
