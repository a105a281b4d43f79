//! The per-connection task queue: a mutex-guarded FIFO of deferred
//! outbound actions, drained only by the task-runner thread.

use std::sync::Mutex;

/// Why a task is being invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TaskCommand {
    Execute,
    /// The queue is being destroyed; release resources, do no work.
    FreeResources,
}

/// Task status bits controlling queue iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TaskResult(u8);

impl TaskResult {
    const SUCCESS: u8 = 1 << 0;
    const DONT_ADVANCE: u8 = 1 << 1;
    const POP_ME: u8 = 1 << 2;

    pub const fn new() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn success(self) -> Self {
        Self(self.0 | Self::SUCCESS)
    }

    #[must_use]
    pub const fn dont_advance(self) -> Self {
        Self(self.0 | Self::DONT_ADVANCE)
    }

    #[must_use]
    pub const fn pop_me(self) -> Self {
        Self(self.0 | Self::POP_ME)
    }

    pub fn is_success(self) -> bool {
        self.0 & Self::SUCCESS != 0
    }

    pub fn is_dont_advance(self) -> bool {
        self.0 & Self::DONT_ADVANCE != 0
    }

    pub fn is_pop_me(self) -> bool {
        self.0 & Self::POP_ME != 0
    }
}

type TaskFn = Box<dyn FnMut(TaskCommand) -> TaskResult + Send>;

#[derive(Default)]
pub(crate) struct TaskQueue {
    tasks: Mutex<Vec<TaskFn>>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.tasks.lock().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("TaskQueue").field("len", &len).finish()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&self, task: TaskFn) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => error!("task queue poisoned, dropping task"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().map(|t| t.is_empty()).unwrap_or(true)
    }

    /// One pass over the queue. A task failing aborts the pass; a
    /// `dont_advance` result holds the pass at that task; `pop_me`
    /// removes the task without advancing past its successor.
    ///
    /// Returns false when any task reported failure.
    pub fn execute(&self) -> bool {
        let Ok(mut tasks) = self.tasks.lock() else {
            return false;
        };
        let mut i = 0;
        let mut res = true;
        while i < tasks.len() {
            let r = (tasks[i])(TaskCommand::Execute);
            res = res && r.is_success();
            let popped = r.is_pop_me();
            if popped {
                tasks.remove(i);
            }
            if r.is_dont_advance() || !res {
                break;
            }
            if popped {
                // the next element now has this index
                continue;
            }
            i += 1;
        }
        res
    }

    /// Invokes every remaining task once with `FreeResources`, then drops
    /// the queue content.
    pub fn destroy(&self) -> bool {
        let Ok(mut tasks) = self.tasks.lock() else {
            return false;
        };
        let mut res = true;
        for task in tasks.iter_mut() {
            res = task(TaskCommand::FreeResources).is_success() && res;
        }
        tasks.clear();
        res
    }
}
