//! Periodic background tasks
//!
//! The reaper and the detached-transaction watchdog each own one periodic task
//! created through a shared [`Scheduler`]. The default [`ThreadScheduler`] runs
//! every task on its own named thread that sleeps on a condvar between runs,
//! so a task can be woken early or cancelled at any time. [`ManualScheduler`]
//! never runs anything on its own; tests fire tasks explicitly.
//!
//! Cancellation is idempotent and safe to race with a running task.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// The body of a periodic task
pub type TaskFn = Arc<dyn Fn() + Send + Sync>;

/// Control surface of a scheduled task
pub trait TaskControl: Send + Sync {
    /// Run the task as soon as possible instead of waiting for the interval
    fn wakeup(&self);
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

/// Handle to a scheduled periodic task. Dropping the handle does not cancel it.
#[derive(Clone)]
pub struct TimerHandle {
    control: Arc<dyn TaskControl>,
}

impl TimerHandle {
    pub fn new(control: Arc<dyn TaskControl>) -> Self {
        Self { control }
    }

    pub fn wakeup(&self) {
        self.control.wakeup();
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub trait Scheduler: Send + Sync {
    /// Run `task` every `interval`, first after `initial_delay`.
    /// Failing to create the task is reported to the caller.
    fn schedule_periodic(
        &self,
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        task: TaskFn,
    ) -> io::Result<TimerHandle>;
}

struct ThreadTaskState {
    cancelled: bool,
    wakeup: bool,
}

struct ThreadTask {
    state: Mutex<ThreadTaskState>,
    condvar: Condvar,
}

impl TaskControl for ThreadTask {
    fn wakeup(&self) {
        let mut state = self.state.lock();
        state.wakeup = true;
        self.condvar.notify_all();
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.condvar.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

/// Runs each periodic task on a dedicated thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule_periodic(
        &self,
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        task: TaskFn,
    ) -> io::Result<TimerHandle> {
        let control = Arc::new(ThreadTask {
            state: Mutex::new(ThreadTaskState {
                cancelled: false,
                wakeup: false,
            }),
            condvar: Condvar::new(),
        });

        let worker = Arc::clone(&control);
        let thread_name = name.to_string();
        thread::Builder::new().name(thread_name.clone()).spawn(move || {
            log::debug!("{} timer started (interval: {:?})", thread_name, interval);
            let mut next_run = Instant::now() + initial_delay;
            loop {
                {
                    let mut state = worker.state.lock();
                    while !state.cancelled && !state.wakeup && Instant::now() < next_run {
                        worker.condvar.wait_until(&mut state, next_run);
                    }
                    if state.cancelled {
                        break;
                    }
                    state.wakeup = false;
                }
                task();
                next_run = Instant::now() + interval;
            }
            log::debug!("{} timer stopped", thread_name);
        })?;

        Ok(TimerHandle::new(control))
    }
}

#[derive(Default)]
struct ManualTask {
    cancelled: AtomicBool,
    wakeups: Mutex<usize>,
}

impl TaskControl for ManualTask {
    fn wakeup(&self) {
        *self.wakeups.lock() += 1;
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct ManualEntry {
    name: String,
    control: Arc<ManualTask>,
    task: TaskFn,
}

/// Scheduler that runs tasks only when [`ManualScheduler::run_pending`] is called
#[derive(Default)]
pub struct ManualScheduler {
    entries: Mutex<Vec<ManualEntry>>,
    fail_next: AtomicBool,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `schedule_periodic` call fail
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    /// Run every live task once. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let tasks: Vec<TaskFn> = {
            let mut entries = self.entries.lock();
            entries.retain(|e| !e.control.is_cancelled());
            entries.iter().map(|e| Arc::clone(&e.task)).collect()
        };
        for task in &tasks {
            task();
        }
        tasks.len()
    }

    /// Run the live tasks with the given name once
    pub fn run_named(&self, name: &str) -> usize {
        let tasks: Vec<TaskFn> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|e| e.name == name && !e.control.is_cancelled())
                .map(|e| Arc::clone(&e.task))
                .collect()
        };
        for task in &tasks {
            task();
        }
        tasks.len()
    }

    /// Number of scheduled tasks with this name that are still live
    pub fn live_count(&self, name: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.name == name && !e.control.is_cancelled())
            .count()
    }

    /// Total wakeups requested on live tasks with this name
    pub fn wakeups(&self, name: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.name == name && !e.control.is_cancelled())
            .map(|e| *e.control.wakeups.lock())
            .sum()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_periodic(
        &self,
        name: &str,
        _initial_delay: Duration,
        _interval: Duration,
        task: TaskFn,
    ) -> io::Result<TimerHandle> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("cannot create timer {}", name),
            ));
        }
        let control = Arc::new(ManualTask::default());
        self.entries.lock().push(ManualEntry {
            name: name.to_string(),
            control: Arc::clone(&control),
            task,
        });
        Ok(TimerHandle::new(control))
    }
}
