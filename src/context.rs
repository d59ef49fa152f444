/// Device-side state shared between the serial interrupt (FSM) and the main
/// loop (worker).
///
/// Firmware creates one context at boot, keeps it for the whole run and hands
/// a reference to both the SIO interrupt handler and the worker task.
use core::cell::RefCell;

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use crate::buffer::Buffer;

/// Where the serial FSM currently is.
///
/// The transfer context (`len`/`offset`, in 32-bit words) only exists while an
/// upload or download is in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    Idle,
    Uploading { len: u32, offset: u32 },
    Downloading { len: u32, offset: u32 },
    Reading,
    WorkerBusy,
}

/// Small state touched on every serial word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Shared {
    pub state: DeviceState,
    /// Worker command register: latched command word, then its result.
    pub register: u32,
}

pub struct DeviceContext<'b> {
    shared: Mutex<RefCell<Shared>>,
    /// Present while the FSM owns the buffer, taken by the worker during a job.
    buffer: Mutex<RefCell<Option<&'b mut Buffer>>>,
    /// Raised by the FSM whenever it latches a worker command.
    worker_signal: Signal<CriticalSectionRawMutex, ()>,
}

impl<'b> DeviceContext<'b> {
    pub fn new(buffer: &'b mut Buffer) -> Self {
        Self {
            shared: Mutex::new(RefCell::new(Shared {
                state: DeviceState::Idle,
                register: 0,
            })),
            buffer: Mutex::new(RefCell::new(Some(buffer))),
            worker_signal: Signal::new(),
        }
    }

    /// Snapshot of state and register.
    pub fn snapshot(&self) -> Shared {
        critical_section::with(|cs| *self.shared.borrow_ref(cs))
    }

    pub fn state(&self) -> DeviceState {
        self.snapshot().state
    }

    pub fn register(&self) -> u32 {
        self.snapshot().register
    }

    pub fn worker_signal(&self) -> &Signal<CriticalSectionRawMutex, ()> {
        &self.worker_signal
    }

    /// Run `f` with the shared state and the buffer (if the worker is not
    /// holding it) inside one critical section.
    pub(crate) fn with_locked<R>(
        &self,
        f: impl FnOnce(&mut Shared, Option<&mut Buffer>) -> R,
    ) -> R {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow_ref_mut(cs);
            let mut buffer = self.buffer.borrow_ref_mut(cs);
            f(&mut shared, buffer.as_deref_mut())
        })
    }

    /// Latched command word if a worker job is pending.
    pub(crate) fn pending_job(&self) -> Option<u32> {
        critical_section::with(|cs| {
            let shared = self.shared.borrow_ref(cs);
            match shared.state {
                DeviceState::WorkerBusy => Some(shared.register),
                _ => None,
            }
        })
    }

    /// Move the buffer out for exclusive use by the worker.
    pub(crate) fn take_buffer(&self) -> Option<&'b mut Buffer> {
        critical_section::with(|cs| self.buffer.borrow_ref_mut(cs).take())
    }

    /// Return the buffer, publish `result` and go back to Idle atomically, so a
    /// READ right after the first non-BUSY reply sees the result.
    pub(crate) fn finish_job(&self, buffer: &'b mut Buffer, result: u32) {
        critical_section::with(|cs| {
            *self.buffer.borrow_ref_mut(cs) = Some(buffer);
            let mut shared = self.shared.borrow_ref_mut(cs);
            shared.register = result;
            shared.state = DeviceState::Idle;
        });
    }

    /// Access the buffer from outside the protocol, e.g. to seed it at boot or
    /// inspect it in tests. Returns `None` while a worker job holds it.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> Option<R> {
        critical_section::with(|cs| {
            let mut buffer = self.buffer.borrow_ref_mut(cs);
            buffer.as_deref_mut().map(f)
        })
    }
}
