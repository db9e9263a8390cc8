//! Scripted work bodies and recording callbacks shared by the unit tests.
//!
//! The work type selects the behavior; the `failures` parameter says how many
//! attempts fail before the body starts succeeding (default: always fail).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::descriptor::{WorkDescriptor, WorkId};
use crate::error::WorkError;
use crate::failure::{CommitFailedError, ConnectionError, LockError, LockTimeoutError, PreconditionNotMetError};
use crate::pool::WorkExecutionCallback;
use crate::work::{Execution, Work, WorkContext, WorkFactory};

#[derive(Debug, Error)]
#[error("transient test failure")]
pub struct TransientError;

#[derive(Debug, Error)]
#[error("fatal test failure")]
pub struct FatalError;

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// One-shot latch blocking bodies until a test releases them.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    pub fn wait(&self) {
        let guard = self.open.lock().unwrap();
        let _ = self
            .cv
            .wait_timeout_while(guard, Duration::from_secs(10), |open| !*open)
            .unwrap();
    }
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub id: WorkId,
    pub work_type: String,
    pub retry_count: u32,
    pub threshold: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Script {
    gate: Gate,
    attempts: Mutex<Vec<Attempt>>,
    failed_so_far: Mutex<HashMap<WorkId, u32>>,
    handled: Mutex<Vec<(WorkId, String)>>,
}

impl Script {
    /// Whether this attempt of `work` should fail.
    fn should_fail(&self, work: &WorkDescriptor) -> bool {
        let allowed = work
            .parameter("failures")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
            .unwrap_or(u32::MAX);
        let mut failed = self.failed_so_far.lock().unwrap();
        let count = failed.entry(work.id).or_insert(0);
        if *count < allowed {
            *count += 1;
            true
        } else {
            false
        }
    }
}

/// Factory building [`ScriptedWork`]s; records every attempt.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gate(&self) -> &Gate {
        &self.script.gate
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.script.attempts.lock().unwrap().clone()
    }

    /// Terminal failure hook invocations: work id and cause.
    pub fn handled(&self) -> Vec<(WorkId, String)> {
        self.script.handled.lock().unwrap().clone()
    }
}

const KNOWN_TYPES: &[&str] = &[
    "ok",
    "fail",
    "panic",
    "block",
    "async",
    "async-fail",
    "transient",
    "fatal",
    "fatal-handler",
    "lock-timeout",
    "lock",
    "precondition",
    "connection",
    "commit",
];

impl WorkFactory for ScriptedFactory {
    fn create(&self, descriptor: &WorkDescriptor) -> Result<Box<dyn Work>, WorkError> {
        if !KNOWN_TYPES.contains(&descriptor.work_type.as_str()) {
            return Err(WorkError::UnknownWorkType(descriptor.work_type.clone()));
        }
        self.script.attempts.lock().unwrap().push(Attempt {
            id: descriptor.id,
            work_type: descriptor.work_type.clone(),
            retry_count: descriptor.retry_count,
            threshold: descriptor.execution_threshold,
        });
        Ok(Box::new(ScriptedWork {
            descriptor: descriptor.clone(),
            script: Arc::clone(&self.script),
        }))
    }
}

pub struct ScriptedWork {
    descriptor: WorkDescriptor,
    script: Arc<Script>,
}

impl Work for ScriptedWork {
    fn description(&self) -> String {
        format!("scripted {}", self.descriptor)
    }

    fn work(&self, _context: &mut WorkContext) -> anyhow::Result<Execution> {
        let work = &self.descriptor;
        match work.work_type.as_str() {
            "ok" => Ok(Execution::Completed),
            "fail" => Err(anyhow::anyhow!("scripted failure")),
            "panic" => panic!("scripted panic"),
            "block" => {
                self.script.gate.wait();
                Ok(Execution::Completed)
            }
            "async" | "async-fail" => {
                let script = Arc::clone(&self.script);
                let fail = work.work_type == "async-fail";
                Ok(Execution::Continue(Box::pin(async move {
                    while !script.gate.is_open() {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    if fail {
                        Err(anyhow::anyhow!("async failure"))
                    } else {
                        Ok(())
                    }
                })))
            }
            _ if !self.script.should_fail(work) => Ok(Execution::Completed),
            "transient" => Err(anyhow::Error::new(TransientError).context("running transient work")),
            "fatal" | "fatal-handler" => Err(FatalError.into()),
            "lock-timeout" => Err(LockTimeoutError::new("process-1", Duration::from_millis(100)).into()),
            "lock" => Err(LockError::new("process-1", "lock holder vanished").into()),
            "precondition" => Err(PreconditionNotMetError::new("flow node not ready").into()),
            "connection" => Err(ConnectionError::new("db:5432", "connection reset").into()),
            "commit" => Err(CommitFailedError::new(
                "commit of work effects",
                ConnectionError::new("db:5432", "connection reset"),
            )
            .into()),
            other => Err(anyhow::anyhow!("unscripted work type {other}")),
        }
    }

    fn handle_failure(&self, cause: &anyhow::Error, _context: &WorkContext) -> anyhow::Result<()> {
        self.script
            .handled
            .lock()
            .unwrap()
            .push((self.descriptor.id, format!("{cause:#}")));
        if self.descriptor.work_type == "fatal-handler" {
            anyhow::bail!("failure handler failed too");
        }
        Ok(())
    }
}

/// Callback recording every outcome.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    successes: Mutex<Vec<(WorkDescriptor, String)>>,
    failures: Mutex<Vec<(WorkDescriptor, String)>>,
}

impl RecordingCallback {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn successes(&self) -> usize {
        self.successes.lock().unwrap().len()
    }

    pub fn failures(&self) -> usize {
        self.failures.lock().unwrap().len()
    }

    pub fn succeeded(&self) -> Vec<WorkDescriptor> {
        self.successes.lock().unwrap().iter().map(|(w, _)| w.clone()).collect()
    }

    pub fn success_threads(&self) -> Vec<String> {
        self.successes.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn failure_messages(&self) -> Vec<String> {
        self.failures.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }
}

impl WorkExecutionCallback for RecordingCallback {
    fn on_success(&self, work: WorkDescriptor) {
        let thread = thread::current().name().unwrap_or_default().to_string();
        self.successes.lock().unwrap().push((work, thread));
    }

    fn on_failure(
        &self,
        work: WorkDescriptor,
        _body: Box<dyn Work>,
        _context: WorkContext,
        cause: anyhow::Error,
    ) {
        self.failures.lock().unwrap().push((work, format!("{cause:#}")));
    }
}
