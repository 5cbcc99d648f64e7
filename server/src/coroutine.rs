//! Cooperative coroutine scheduler.
//!
//! Every fault and syscall handler runs on a coroutine so it can block on
//! disk I/O without stalling the dispatcher. The pool is a fixed set of
//! worker threads, one per slot, but the scheduling contract is strictly
//! single-threaded and cooperative: a condvar rendezvous guarantees that at
//! any instant exactly one of {the dispatcher, one coroutine} is executing.
//! Suspension happens only at explicit [`CoroutinePool::yield_now`] calls;
//! resumption order is controlled by the single-slot resume latch.
//!
//! Cancellation: destroying a process marks its suspended coroutine. The
//! mark is observed at the next resume, where `yield_now` returns
//! [`Cancelled`] and the handler unwinds instead of continuing user-visible
//! work. The dispatcher's cleanup pass resumes cancelled coroutines itself
//! so their slots cannot leak while the event they were waiting for never
//! arrives.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use sos_kernel_model::Word;

/// Returned by `yield_now` when the coroutine's process died while it was
/// suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl From<Cancelled> for crate::error::SosError {
    fn from(_: Cancelled) -> Self {
        crate::error::SosError::Cancelled
    }
}

/// What `start` / `resume` observed when control came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Done,
    Suspended,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// A task is executing (or about to execute) on the worker.
    Running,
    /// The task yielded and waits for a resume.
    Suspended,
    /// The task finished; the slot awaits reaping.
    Done,
}

struct SlotInner {
    state: SlotState,
    task: Option<Task>,
    cancelled: bool,
    shutdown: bool,
    panic: Option<Box<dyn std::any::Any + Send>>,
    /// Per-slot argument scratch for handlers started outside the syscall
    /// path (boot-time process creation stores its result here).
    args: [Word; 4],
}

impl Default for SlotInner {
    fn default() -> Self {
        Self {
            state: SlotState::Free,
            task: None,
            cancelled: false,
            shutdown: false,
            panic: None,
            args: [0; 4],
        }
    }
}

struct Slot {
    inner: Mutex<SlotInner>,
    cond: Condvar,
}

pub struct CoroutinePool {
    slots: Vec<Arc<Slot>>,
    next_resume: spin::Mutex<Option<usize>>,
    cleanup_queue: spin::Mutex<VecDeque<usize>>,
}

thread_local! {
    static CURRENT: RefCell<Option<(Arc<Slot>, usize)>> = const { RefCell::new(None) };
}

fn worker_loop(slot: Arc<Slot>, id: usize) {
    loop {
        let task = {
            let mut inner = slot.inner.lock().unwrap();
            loop {
                if inner.shutdown {
                    return;
                }
                if let Some(task) = inner.task.take() {
                    break task;
                }
                inner = slot.cond.wait(inner).unwrap();
            }
        };

        CURRENT.with(|c| *c.borrow_mut() = Some((Arc::clone(&slot), id)));
        let result = panic::catch_unwind(AssertUnwindSafe(task));
        CURRENT.with(|c| *c.borrow_mut() = None);

        let mut inner = slot.inner.lock().unwrap();
        if let Err(payload) = result {
            inner.panic = Some(payload);
        }
        inner.state = SlotState::Done;
        slot.cond.notify_all();
    }
}

impl CoroutinePool {
    pub fn new(size: usize) -> Self {
        let slots: Vec<Arc<Slot>> = (0..size)
            .map(|_| {
                Arc::new(Slot {
                    inner: Mutex::new(SlotInner::default()),
                    cond: Condvar::new(),
                })
            })
            .collect();
        for (i, slot) in slots.iter().enumerate() {
            let slot = Arc::clone(slot);
            thread::Builder::new()
                .name(format!("sos-coroutine-{i}"))
                .spawn(move || worker_loop(slot, i))
                .expect("spawn coroutine worker");
        }
        Self {
            slots,
            next_resume: spin::Mutex::new(None),
            cleanup_queue: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// Hand a task to a free slot and run it until it completes or yields.
    pub fn start(&self, task: Task) -> Result<(usize, RunState), Task> {
        let mut id = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let inner = slot.inner.lock().unwrap();
            if inner.state == SlotState::Free {
                id = Some(i);
                drop(inner);
                break;
            }
        }
        let Some(id) = id else {
            return Err(task);
        };
        let slot = &self.slots[id];
        {
            let mut inner = slot.inner.lock().unwrap();
            inner.state = SlotState::Running;
            inner.cancelled = false;
            inner.panic = None;
            inner.args = [0; 4];
            inner.task = Some(task);
            slot.cond.notify_all();
        }
        Ok((id, self.await_pause(id)))
    }

    /// Transfer control to a suspended coroutine and run it until it
    /// completes or yields again. Returns `None` if the slot is not
    /// suspended (it was already cleaned up).
    pub fn resume(&self, id: usize) -> Option<RunState> {
        let slot = &self.slots[id];
        {
            let mut inner = slot.inner.lock().unwrap();
            if inner.state != SlotState::Suspended {
                return None;
            }
            inner.state = SlotState::Running;
            slot.cond.notify_all();
        }
        Some(self.await_pause(id))
    }

    /// Block until the slot stops running, reaping it if it finished.
    fn await_pause(&self, id: usize) -> RunState {
        let slot = &self.slots[id];
        let mut inner = slot.inner.lock().unwrap();
        while inner.state == SlotState::Running {
            inner = slot.cond.wait(inner).unwrap();
        }
        match inner.state {
            SlotState::Done => {
                inner.state = SlotState::Free;
                let payload = inner.panic.take();
                drop(inner);
                if let Some(payload) = payload {
                    panic::resume_unwind(payload);
                }
                RunState::Done
            }
            SlotState::Suspended => RunState::Suspended,
            s => unreachable!("coroutine slot in state {s:?} after pause"),
        }
    }

    /// Suspend the calling coroutine until the dispatcher resumes it.
    ///
    /// Must be called from a coroutine. On resume, reports whether the
    /// owning process was destroyed in the interim; callers propagate
    /// [`Cancelled`] straight up so the handler unwinds.
    pub fn yield_now() -> Result<(), Cancelled> {
        let slot = CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .map(|(s, _)| Arc::clone(s))
                .expect("yield outside a coroutine")
        });
        let mut inner = slot.inner.lock().unwrap();
        inner.state = SlotState::Suspended;
        slot.cond.notify_all();
        while inner.state == SlotState::Suspended {
            inner = slot.cond.wait(inner).unwrap();
        }
        debug_assert_eq!(inner.state, SlotState::Running);
        if inner.cancelled {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Id of the coroutine the caller is running on, if any.
    pub fn current() -> Option<usize> {
        CURRENT.with(|c| c.borrow().as_ref().map(|(_, id)| *id))
    }

    /// Latch a coroutine for the dispatcher to resume before its next wait.
    pub fn set_resume(&self, id: usize) {
        let mut next = self.next_resume.lock();
        if let Some(prev) = *next {
            log::warn!("resume latch overwritten: {prev} -> {id}");
        }
        *next = Some(id);
    }

    pub fn take_resume(&self) -> Option<usize> {
        self.next_resume.lock().take()
    }

    /// Mark a coroutine cancelled and queue its slot for cleanup.
    pub fn cancel(&self, id: usize) {
        if Self::current() == Some(id) {
            // The running coroutine finishes normally; its slot is reaped
            // when it returns.
            return;
        }
        self.slots[id].inner.lock().unwrap().cancelled = true;
        self.cleanup_queue.lock().push_back(id);
    }

    /// Release cancelled slots. A cancelled coroutine that is still
    /// suspended is resumed here so it observes the cancellation, unwinds,
    /// and frees its slot.
    pub fn cleanup(&self) {
        loop {
            let id = { self.cleanup_queue.lock().pop_front() };
            let Some(id) = id else { break };
            if let Some(RunState::Suspended) = self.resume(id) {
                log::warn!("cancelled coroutine {id} yielded again instead of unwinding");
            }
        }
    }

    pub fn cleanup_pending(&self) -> bool {
        !self.cleanup_queue.lock().is_empty()
    }

    /// Whether a slot currently holds a suspended coroutine.
    pub fn is_suspended(&self, id: usize) -> bool {
        self.slots[id].inner.lock().unwrap().state == SlotState::Suspended
    }

    pub fn arg(&self, id: usize, i: usize) -> Word {
        self.slots[id].inner.lock().unwrap().args[i]
    }

    pub fn set_arg(&self, id: usize, i: usize, value: Word) {
        self.slots[id].inner.lock().unwrap().args[i] = value;
    }

    /// Set the argument scratch of the calling coroutine.
    pub fn set_own_arg(i: usize, value: Word) {
        CURRENT.with(|c| {
            let borrow = c.borrow();
            let (slot, _) = borrow.as_ref().expect("no current coroutine");
            slot.inner.lock().unwrap().args[i] = value;
        });
    }

    #[cfg(test)]
    fn state_of(&self, id: usize) -> SlotState {
        self.slots[id].inner.lock().unwrap().state
    }
}

impl Drop for CoroutinePool {
    fn drop(&mut self) {
        for slot in &self.slots {
            let mut inner = slot.inner.lock().unwrap();
            inner.shutdown = true;
            slot.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_start_runs_to_completion() {
        let pool = CoroutinePool::new(2);
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let (id, state) = pool
            .start(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .ok()
            .unwrap();
        assert_eq!(state, RunState::Done);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pool.state_of(id), SlotState::Free);
    }

    #[test]
    fn test_yield_and_resume() {
        let pool = CoroutinePool::new(2);
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let (id, state) = pool
            .start(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
                CoroutinePool::yield_now().unwrap();
                h.fetch_add(10, Ordering::SeqCst);
            }))
            .ok()
            .unwrap();
        assert_eq!(state, RunState::Suspended);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pool.resume(id), Some(RunState::Done));
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_cancel_observed_at_resume() {
        let pool = CoroutinePool::new(2);
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let (id, state) = pool
            .start(Box::new(move || {
                if CoroutinePool::yield_now().is_err() {
                    return;
                }
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .ok()
            .unwrap();
        assert_eq!(state, RunState::Suspended);
        pool.cancel(id);
        pool.cleanup();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(pool.state_of(id), SlotState::Free);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = CoroutinePool::new(1);
        let (_id, state) = pool
            .start(Box::new(|| {
                let _ = CoroutinePool::yield_now();
            }))
            .ok()
            .unwrap();
        assert_eq!(state, RunState::Suspended);
        assert!(pool.start(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_argument_scratch() {
        let pool = CoroutinePool::new(1);
        let (id, state) = pool
            .start(Box::new(|| {
                CoroutinePool::set_own_arg(0, 41);
                let _ = CoroutinePool::yield_now();
            }))
            .ok()
            .unwrap();
        assert_eq!(state, RunState::Suspended);
        assert_eq!(pool.arg(id, 0), 41);
        pool.set_arg(id, 1, 7);
        assert_eq!(pool.arg(id, 1), 7);
        pool.cancel(id);
        pool.cleanup();
    }
}
