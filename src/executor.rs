//! A minimal cooperative, single-threaded task scheduler.
//!
//! No async runtime is pulled in for this: the device's own event loop is
//! a simple poll-don't-block cycle, and the only reason to reach for
//! `Future` at all is to let a user run auxiliary coroutines (timers,
//! scripted host-side stimulus, a second proxy filter task) alongside the
//! device without introducing real threads. `Executor::run` round-robins
//! every spawned future until they've all resolved.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use crate::config::EmulationConfig;
use crate::device::Device;
use crate::error::{EndEmulation, Result};

fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn no_op(_: *const ()) {}
    let vtable = &RawWakerVTable::new(clone, no_op, no_op, no_op);
    RawWaker::new(std::ptr::null(), vtable)
}

fn noop_waker() -> Waker {
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

/// Runs a [`Device`]'s event loop as a future: each poll processes at most
/// one backend event and always yields afterward, so it interleaves
/// fairly with any other tasks spawned on the same executor.
pub struct DeviceTask {
    device: Option<Device>,
}

impl DeviceTask {
    pub fn new(device: Device) -> Self {
        Self {
            device: Some(device),
        }
    }

    pub fn into_device(mut self) -> Device {
        self.device.take().expect("DeviceTask polled to completion still owns its device")
    }
}

/// Disconnects the backend whenever a task holding a device is dropped,
/// whether that's because the future resolved normally or because a panic
/// unwound through the executor: the backend is a live socket/sysfs
/// resource on the other end and must not be left attached.
impl Drop for DeviceTask {
    fn drop(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.disconnect();
        }
    }
}

impl Future for DeviceTask {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let device = this.device.as_mut().expect("DeviceTask polled after completion");
        match device.poll_once() {
            Ok(_) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(EndEmulation) => Poll::Ready(()),
        }
    }
}

/// Cooperative executor that drives every spawned future to completion,
/// giving each a turn every pass instead of running one to completion
/// before starting the next.
#[derive(Default)]
pub struct Executor {
    tasks: Vec<Pin<Box<dyn Future<Output = ()>>>>,
}

impl Executor {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn spawn(&mut self, future: impl Future<Output = ()> + 'static) {
        self.tasks.push(Box::pin(future));
    }

    /// Polls every task once per pass until none remain, sleeping briefly
    /// between passes that made no progress so the loop doesn't spin the
    /// CPU while waiting on I/O-bound backends.
    pub fn run(&mut self) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        while !self.tasks.is_empty() {
            let mut made_progress = false;
            let mut i = 0;
            while i < self.tasks.len() {
                match self.tasks[i].as_mut().poll(&mut cx) {
                    Poll::Ready(()) => {
                        self.tasks.swap_remove(i);
                        made_progress = true;
                    }
                    Poll::Pending => {
                        i += 1;
                    }
                }
            }
            if !made_progress {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Convenience wrapper for the common case of running a single device to
/// completion without any auxiliary tasks. Does not connect the device
/// first; the caller is responsible for that, as with [`Device::run`].
pub fn block_on_device(device: Device) {
    let mut executor = Executor::new();
    executor.spawn(DeviceTask::new(device));
    executor.run();
}

/// Connects `device`, then runs it to completion alongside `user_coroutines`
/// on a fresh [`Executor`]. The device is guaranteed to be disconnected
/// before this returns -- whether the run ends normally, the device's own
/// event loop ends the session, or a spawned task panics -- because the
/// [`DeviceTask`] holding it disconnects on drop and `Executor::run` drives
/// every task inside a [`Box`] that Rust's unwinding drops regardless of
/// how the stack unwinds.
pub fn emulate(
    mut device: Device,
    config: &EmulationConfig,
    user_coroutines: Vec<Pin<Box<dyn Future<Output = ()>>>>,
) -> Result<()> {
    device.connect(config)?;

    let mut executor = Executor::new();
    executor.spawn(DeviceTask::new(device));
    for coroutine in user_coroutines {
        executor.tasks.push(coroutine);
    }
    executor.run();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct CountTo {
        remaining: u32,
        counter: Rc<RefCell<u32>>,
    }

    impl Future for CountTo {
        type Output = ();
        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            let this = self.get_mut();
            if this.remaining == 0 {
                return Poll::Ready(());
            }
            this.remaining -= 1;
            *this.counter.borrow_mut() += 1;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    #[test]
    fn executor_interleaves_tasks_and_runs_to_completion() {
        let counter = Rc::new(RefCell::new(0));
        let mut executor = Executor::new();
        executor.spawn(CountTo {
            remaining: 3,
            counter: counter.clone(),
        });
        executor.spawn(CountTo {
            remaining: 2,
            counter: counter.clone(),
        });
        executor.run();
        assert_eq!(*counter.borrow(), 5);
    }
}
