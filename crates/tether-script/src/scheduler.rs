//! Cooperative task scheduler.
//!
//! The scheduler only keeps bookkeeping. Creating and resuming coroutines is
//! delegated to a [`Coroutines`] implementation, so the ordering rules can be
//! exercised without a real VM.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Identifier of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a task was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Runs after a delay and receives the elapsed time.
    Delay,

    /// Runs at the next tick.
    Defer,

    /// Runs at the next tick.
    Spawn,
}

/// Lifecycle of a task, as reported by [`Scheduler::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for its due time.
    Suspended,

    /// Due, and taken out for the current tick.
    Ready,

    /// Being resumed.
    Running,

    /// Finished, failed or yielded without rescheduling itself.
    Done,
}

/// What a task runs.
#[derive(Debug, Clone)]
pub enum TaskBody<Thread, Function> {
    /// An existing suspended coroutine.
    Thread(Thread),

    /// A function not started yet; a coroutine is created for it.
    Function(Function),
}

/// Outcome of a successful resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The coroutine yielded and may be resumed again.
    Yielded,

    /// The coroutine returned.
    Finished,
}

/// Creates and resumes coroutines on behalf of the scheduler.
pub trait Coroutines {
    /// Handle of a coroutine.
    type Thread;

    /// Handle of a function.
    type Function;

    /// A value passed into a coroutine.
    type Value;

    /// Error raised by a coroutine.
    type Error;

    /// Creates a suspended coroutine running `function`.
    fn create(&mut self, function: Self::Function) -> Result<Self::Thread, Self::Error>;

    /// Checks whether the coroutine can still be resumed.
    fn is_resumable(&self, thread: &Self::Thread) -> bool;

    /// Resumes the coroutine with `args` until it yields or returns.
    fn resume(
        &mut self,
        thread: &Self::Thread,
        args: Vec<Self::Value>,
    ) -> Result<Resume, Self::Error>;

    /// Converts elapsed time into a value passed to delay tasks.
    fn elapsed(&mut self, elapsed: Duration) -> Self::Value;
}

/// A scheduled task.
#[derive(Debug)]
pub struct Task<Thread, Function, Value> {
    id: TaskId,
    kind: TaskKind,
    body: TaskBody<Thread, Function>,
    args: Vec<Value>,
    scheduled_at: Instant,
    due: Instant,
    cancelled: bool,
}

impl<Thread, Function, Value> Task<Thread, Function, Value> {
    /// Returns the task identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns how the task was scheduled.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Returns when the task becomes eligible.
    pub fn due(&self) -> Instant {
        self.due
    }
}

/// A task that raised an error while being resumed.
#[derive(Debug)]
pub struct TaskFailure<Error> {
    /// Failed task.
    pub id: TaskId,

    /// Raised error.
    pub error: Error,
}

/// Result of one tick.
#[derive(Debug)]
pub struct TickReport<Error> {
    /// Number of tasks resumed.
    pub resumed: usize,

    /// Tasks that failed. They are not rescheduled.
    pub failures: Vec<TaskFailure<Error>>,
}

/// Pending tasks in insertion order.
#[derive(Debug)]
pub struct Scheduler<Thread, Function, Value> {
    tasks: Vec<Task<Thread, Function, Value>>,
    next_id: u64,

    /// Tasks taken out by the current tick that did not start yet.
    ready: VecDeque<TaskId>,
    running: Option<TaskId>,
}

impl<Thread, Function, Value> Default for Scheduler<Thread, Function, Value> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Thread, Function, Value> Scheduler<Thread, Function, Value> {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            next_id: 1,
            ready: VecDeque::new(),
            running: None,
        }
    }

    /// Schedules a task that becomes eligible `delay` after `now`.
    pub fn schedule(
        &mut self,
        kind: TaskKind,
        body: TaskBody<Thread, Function>,
        args: Vec<Value>,
        now: Instant,
        delay: Duration,
    ) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;

        tracing::trace!(%id, ?kind, ?delay, "task scheduled");

        self.tasks.push(Task {
            id,
            kind,
            body,
            args,
            scheduled_at: now,
            due: now + delay,
            cancelled: false,
        });

        id
    }

    /// Schedules a task for the next tick.
    pub fn spawn(
        &mut self,
        body: TaskBody<Thread, Function>,
        args: Vec<Value>,
        now: Instant,
    ) -> TaskId {
        self.schedule(TaskKind::Spawn, body, args, now, Duration::ZERO)
    }

    /// Schedules a task for the next tick.
    pub fn defer(
        &mut self,
        body: TaskBody<Thread, Function>,
        args: Vec<Value>,
        now: Instant,
    ) -> TaskId {
        self.schedule(TaskKind::Defer, body, args, now, Duration::ZERO)
    }

    /// Schedules a task that receives the elapsed time when resumed.
    pub fn delay(
        &mut self,
        body: TaskBody<Thread, Function>,
        args: Vec<Value>,
        now: Instant,
        delay: Duration,
    ) -> TaskId {
        self.schedule(TaskKind::Delay, body, args, now, delay)
    }

    /// Cancels a pending task.
    ///
    /// Returns `false` if the task already ran, is running, or was
    /// cancelled before.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self
            .tasks
            .iter_mut()
            .find(|task| task.id == id && !task.cancelled)
        {
            Some(task) => {
                task.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Returns the pending task with the given identifier.
    pub fn get(&self, id: TaskId) -> Option<&Task<Thread, Function, Value>> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Returns the state of a task ever scheduled here.
    ///
    /// Tasks that left the scheduler, by running, failing or being
    /// cancelled, are `Done`.
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        if id.0 == 0 || id.0 >= self.next_id {
            return None;
        }

        let state = if self.running == Some(id) {
            TaskState::Running
        }
        else if self.ready.contains(&id) {
            TaskState::Ready
        }
        else if self.tasks.iter().any(|task| task.id == id) {
            TaskState::Suspended
        }
        else {
            TaskState::Done
        };

        Some(state)
    }

    /// Returns the number of pending tasks, cancelled ones included.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Checks whether no task is pending.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns the earliest due time of a live task.
    pub fn next_due(&self) -> Option<Instant> {
        self.tasks
            .iter()
            .filter(|task| !task.cancelled)
            .map(|task| task.due)
            .min()
    }

    /// Drops every pending task.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.ready.clear();
        self.running = None;
    }

    /// Removes cancelled tasks and takes out the tasks due at `now`,
    /// preserving insertion order.
    fn take_ready(&mut self, now: Instant) -> Vec<Task<Thread, Function, Value>> {
        let mut ready = Vec::new();
        let mut pending = Vec::with_capacity(self.tasks.len());

        for task in self.tasks.drain(..) {
            if task.cancelled {
                tracing::trace!(id = %task.id, "cancelled task dropped");
                continue;
            }

            if task.due <= now {
                self.ready.push_back(task.id);
                ready.push(task);
            }
            else {
                pending.push(task);
            }
        }

        self.tasks = pending;
        ready
    }
}

/// Resumes every task due at `now`.
///
/// The scheduler lock is released while tasks run, so they can schedule new
/// tasks. Those become eligible at the next call at the earliest.
pub fn run_ready<C>(
    scheduler: &Mutex<Scheduler<C::Thread, C::Function, C::Value>>,
    coroutines: &mut C,
    now: Instant,
) -> TickReport<C::Error>
where
    C: Coroutines,
{
    let ready = scheduler.lock().take_ready(now);

    let mut report = TickReport {
        resumed: 0,
        failures: Vec::new(),
    };

    for task in ready {
        {
            let mut scheduler = scheduler.lock();
            scheduler.ready.retain(|id| *id != task.id);
            scheduler.running = Some(task.id);
        }

        run_task(task, coroutines, now, &mut report);
        scheduler.lock().running = None;
    }

    report
}

fn run_task<C>(
    task: Task<C::Thread, C::Function, C::Value>,
    coroutines: &mut C,
    now: Instant,
    report: &mut TickReport<C::Error>,
) where
    C: Coroutines,
{
    let thread = match task.body {
        TaskBody::Thread(thread) => thread,
        TaskBody::Function(function) => match coroutines.create(function) {
            Ok(thread) => thread,
            Err(error) => {
                report.failures.push(TaskFailure { id: task.id, error });
                return;
            }
        },
    };

    if !coroutines.is_resumable(&thread) {
        tracing::trace!(id = %task.id, "task thread is no longer resumable");
        return;
    }

    let mut args = task.args;
    if task.kind == TaskKind::Delay {
        args.push(coroutines.elapsed(now.saturating_duration_since(task.scheduled_at)));
    }

    report.resumed += 1;

    match coroutines.resume(&thread, args) {
        Ok(outcome) => tracing::trace!(id = %task.id, ?outcome, "task resumed"),
        Err(error) => report.failures.push(TaskFailure { id: task.id, error }),
    }
}
