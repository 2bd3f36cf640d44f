//! Dependency-ordered task execution on a bounded pool of worker threads.
//!
//! Tasks are registered with [`TaskScheduler::submit`] after their
//! dependencies. A task becomes ready once every dependency has completed
//! successfully. Ready tasks are pulled from a shared queue by N scoped
//! worker threads. When a task fails, every task that depends on it,
//! directly or transitively, is skipped; unrelated branches keep running.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::model::GraphError;

type Work<'a> = Box<dyn FnOnce() -> Result<()> + Send + 'a>;

struct Task<'a> {
    id: String,
    dependencies: Vec<usize>,
    work: Mutex<Option<Work<'a>>>,
}

/// A task that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    pub id: String,
    pub error: String,
}

/// Outcome of [`TaskScheduler::start_and_wait`].
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Successful tasks, in completion order.
    pub completed: Vec<String>,
    /// Failed tasks with their error messages.
    pub failed: Vec<FailedTask>,
    /// Tasks never started because a dependency failed.
    pub skipped: Vec<String>,
}

impl RunReport {
    /// True when no task failed or was skipped.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Ids of failed tasks.
    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

struct RunState {
    ready: VecDeque<usize>,
    waiting_on: Vec<usize>,
    status: Vec<Status>,
    /// Tasks not yet completed, failed or skipped.
    outstanding: usize,
    report: RunReport,
}

/// Runs a DAG of tasks with at most `workers` in flight.
pub struct TaskScheduler<'a> {
    workers: usize,
    tasks: Vec<Task<'a>>,
    index: HashMap<String, usize>,
}

impl<'a> TaskScheduler<'a> {
    /// Create a scheduler with a concurrency limit (at least 1).
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            tasks: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task has been registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Register a task. Every dependency must already be registered.
    pub fn submit<I, S, F>(&mut self, id: impl Into<String>, dependencies: I, work: F) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce() -> Result<()> + Send + 'a,
    {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(GraphError::DuplicateTask(id).into());
        }

        let mut deps = Vec::new();
        for dep in dependencies {
            let dep = dep.as_ref();
            let idx = *self.index.get(dep).ok_or_else(|| GraphError::UnknownTask {
                task: id.clone(),
                dependency: dep.to_string(),
            })?;
            if !deps.contains(&idx) {
                deps.push(idx);
            }
        }

        self.index.insert(id.clone(), self.tasks.len());
        self.tasks.push(Task {
            id,
            dependencies: deps,
            work: Mutex::new(Some(Box::new(work))),
        });
        Ok(())
    }

    /// Run every task and block until all are completed, failed or skipped.
    pub fn start_and_wait(self) -> RunReport {
        let total = self.tasks.len();
        if total == 0 {
            return RunReport::default();
        }

        let mut dependents = vec![Vec::new(); total];
        let mut waiting_on = vec![0; total];
        let mut ready = VecDeque::new();
        for (idx, task) in self.tasks.iter().enumerate() {
            waiting_on[idx] = task.dependencies.len();
            for &dep in &task.dependencies {
                dependents[dep].push(idx);
            }
            if task.dependencies.is_empty() {
                ready.push_back(idx);
            }
        }

        let state = Mutex::new(RunState {
            ready,
            waiting_on,
            status: vec![Status::Pending; total],
            outstanding: total,
            report: RunReport::default(),
        });
        let wakeup = Condvar::new();
        let workers = self.workers.min(total);

        tracing::debug!(tasks = total, workers, "starting task scheduler");

        thread::scope(|scope| {
            for worker in 0..workers {
                let tasks = &self.tasks;
                let dependents = &dependents;
                let state = &state;
                let wakeup = &wakeup;
                scope.spawn(move || worker_loop(worker, tasks, dependents, state, wakeup));
            }
        });

        let report = state.into_inner().report;
        tracing::debug!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "task scheduler finished"
        );
        report
    }
}

fn worker_loop(
    worker: usize,
    tasks: &[Task<'_>],
    dependents: &[Vec<usize>],
    state: &Mutex<RunState>,
    wakeup: &Condvar,
) {
    loop {
        let next = {
            let mut st = state.lock();
            loop {
                if let Some(idx) = st.ready.pop_front() {
                    st.status[idx] = Status::Running;
                    break Some(idx);
                }
                if st.outstanding == 0 {
                    break None;
                }
                wakeup.wait(&mut st);
            }
        };

        let Some(idx) = next else {
            wakeup.notify_all();
            return;
        };

        let task = &tasks[idx];
        tracing::debug!(worker, task = %task.id, "task started");
        let work = task.work.lock().take();
        let outcome = match work {
            Some(work) => panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|payload| Err(crate::Error::data_access(panic_message(&*payload)))),
            None => Ok(()),
        };

        let mut st = state.lock();
        st.outstanding -= 1;
        match outcome {
            Ok(()) => {
                st.status[idx] = Status::Done;
                st.report.completed.push(task.id.clone());
                for &child in &dependents[idx] {
                    st.waiting_on[child] -= 1;
                    if st.waiting_on[child] == 0 && st.status[child] == Status::Pending {
                        st.ready.push_back(child);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(task = %task.id, error = %err, "task failed");
                st.status[idx] = Status::Failed;
                st.report.failed.push(FailedTask {
                    id: task.id.clone(),
                    error: err.to_string(),
                });
                skip_dependents(idx, tasks, dependents, &mut st);
            }
        }
        drop(st);
        wakeup.notify_all();
    }
}

fn skip_dependents(failed: usize, tasks: &[Task<'_>], dependents: &[Vec<usize>], st: &mut RunState) {
    let mut stack: Vec<usize> = dependents[failed].clone();
    while let Some(idx) = stack.pop() {
        if st.status[idx] != Status::Pending {
            continue;
        }
        st.status[idx] = Status::Skipped;
        st.outstanding -= 1;
        st.report.skipped.push(tasks[idx].id.clone());
        stack.extend(dependents[idx].iter().copied());
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_dependencies_complete_before_dependents_start() {
        let log = Mutex::new(Vec::new());
        let mut scheduler = TaskScheduler::new(4);

        // three levels: a0..a3 <- b0..b3 (each on all a's) <- c0, c1
        for i in 0..4 {
            let log = &log;
            scheduler
                .submit(format!("a{}", i), Vec::<String>::new(), move || {
                    log.lock().push(format!("start a{}", i));
                    thread::sleep(Duration::from_millis(5));
                    log.lock().push(format!("end a{}", i));
                    Ok(())
                })
                .unwrap();
        }
        for i in 0..4 {
            let log = &log;
            let deps: Vec<String> = (0..4).map(|j| format!("a{}", j)).collect();
            scheduler
                .submit(format!("b{}", i), deps, move || {
                    log.lock().push(format!("start b{}", i));
                    log.lock().push(format!("end b{}", i));
                    Ok(())
                })
                .unwrap();
        }
        for i in 0..2 {
            let log = &log;
            scheduler
                .submit(format!("c{}", i), ["b0", "b3"], move || {
                    log.lock().push(format!("start c{}", i));
                    log.lock().push(format!("end c{}", i));
                    Ok(())
                })
                .unwrap();
        }

        let report = scheduler.start_and_wait();
        assert!(report.is_success());
        assert_eq!(report.completed.len(), 10);

        let log = log.into_inner();
        let pos = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        for b in 0..4 {
            for a in 0..4 {
                assert!(pos(&format!("end a{}", a)) < pos(&format!("start b{}", b)));
            }
        }
        for c in 0..2 {
            assert!(pos("end b0") < pos(&format!("start c{}", c)));
            assert!(pos("end b3") < pos(&format!("start c{}", c)));
        }
    }

    #[test]
    fn test_failure_skips_transitive_dependents_only() {
        let ran = AtomicUsize::new(0);
        let mut scheduler = TaskScheduler::new(2);
        let ran_ref = &ran;

        scheduler.submit("root", Vec::<&str>::new(), || Ok(())).unwrap();
        scheduler
            .submit("bad", ["root"], || Err(Error::data_access("boom")))
            .unwrap();
        scheduler
            .submit("child", ["bad"], move || {
                ran_ref.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        scheduler
            .submit("grandchild", ["child"], move || {
                ran_ref.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        scheduler
            .submit("sibling", ["root"], move || {
                ran_ref.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let report = scheduler.start_and_wait();
        assert_eq!(report.failed_ids(), vec!["bad"]);
        assert!(report.failed[0].error.contains("boom"));
        let mut skipped = report.skipped.clone();
        skipped.sort();
        assert_eq!(skipped, vec!["child", "grandchild"]);
        assert!(report.completed.contains(&"sibling".to_string()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_is_reported_as_failure() {
        let mut scheduler = TaskScheduler::new(1);
        scheduler
            .submit("explodes", Vec::<&str>::new(), || panic!("kaboom"))
            .unwrap();
        let report = scheduler.start_and_wait();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("kaboom"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut scheduler = TaskScheduler::new(1);
        let err = scheduler.submit("a", ["missing"], || Ok(())).unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::UnknownTask { .. })));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut scheduler = TaskScheduler::new(1);
        scheduler.submit("a", Vec::<&str>::new(), || Ok(())).unwrap();
        let err = scheduler.submit("a", Vec::<&str>::new(), || Ok(())).unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::DuplicateTask(_))));
    }

    #[test]
    fn test_concurrency_limit_respected() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let mut scheduler = TaskScheduler::new(3);
        for i in 0..12 {
            let active = &active;
            let peak = &peak;
            scheduler
                .submit(format!("t{}", i), Vec::<&str>::new(), move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        let report = scheduler.start_and_wait();
        assert_eq!(report.completed.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_empty_run() {
        let report = TaskScheduler::new(4).start_and_wait();
        assert!(report.is_success());
        assert!(report.completed.is_empty());
    }
}
