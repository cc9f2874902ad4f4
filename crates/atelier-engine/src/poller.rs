use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use atelier_contracts::tasks::{GenerationTask, StatusSnapshot, TaskHandle, TaskStatus};

use crate::backends::BackendSet;
use crate::config::PollPolicy;
use crate::error::{EngineResult, GenerationError};
use crate::transport::{BackendTransport, HttpRequest};
use crate::truncate_text;

/// One status read against a backend.
pub trait StatusSource: Send + Sync {
    fn read_status(&self, handle: &TaskHandle) -> EngineResult<StatusSnapshot>;
}

pub struct StatusReader {
    transport: Arc<dyn BackendTransport>,
    backends: Arc<BackendSet>,
}

impl StatusReader {
    pub fn new(transport: Arc<dyn BackendTransport>, backends: Arc<BackendSet>) -> Self {
        Self {
            transport,
            backends,
        }
    }
}

impl StatusSource for StatusReader {
    fn read_status(&self, handle: &TaskHandle) -> EngineResult<StatusSnapshot> {
        let backend = self.backends.endpoints(handle.backend)?;
        let reply = self.transport.send(HttpRequest::get(
            backend.status_url(&handle.id),
            backend.auth_headers()?,
        ))?;
        if !reply.is_success() {
            return Err(GenerationError::Transport {
                context: format!("{} status query", handle.backend),
                message: format!(
                    "HTTP {}: {}",
                    reply.status,
                    truncate_text(&reply.text(), 512)
                ),
            });
        }
        let body = reply.json(&format!("{} status query", handle.backend))?;
        Ok(backend.parse_status(&handle.id, &body))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalStatus {
    pub snapshot: StatusSnapshot,
    pub queries: u32,
    pub elapsed: Duration,
}

pub struct JobPoller {
    source: Arc<dyn StatusSource>,
}

impl JobPoller {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self { source }
    }

    /// Blocks on the calling thread until the task is `Ready`, reports
    /// `Error`, or `policy.max_wait()` has passed. Sleeps never run past
    /// the wait budget. Always queries at least
    /// once; a read error ends the wait immediately.
    pub fn wait_until_terminal(
        &self,
        handle: &TaskHandle,
        policy: PollPolicy,
    ) -> EngineResult<TerminalStatus> {
        let started = Instant::now();
        let mut queries = 0u32;
        loop {
            let snapshot = self.source.read_status(handle)?;
            queries += 1;
            match snapshot.status {
                TaskStatus::Ready => {
                    let elapsed = started.elapsed();
                    info!(
                        task_id = %handle.id,
                        queries,
                        elapsed_s = elapsed.as_secs_f64(),
                        "task ready"
                    );
                    return Ok(TerminalStatus {
                        snapshot,
                        queries,
                        elapsed,
                    });
                }
                TaskStatus::Error => {
                    let detail = snapshot
                        .error_detail
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    warn!(task_id = %handle.id, detail = %detail, "task failed on backend");
                    return Err(GenerationError::BackendError { detail });
                }
                _ => {
                    debug!(
                        task_id = %handle.id,
                        status = %snapshot.raw_status,
                        queries,
                        "task still running"
                    );
                }
            }

            let remaining = policy.max_wait().saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                thread::sleep(policy.interval().min(remaining));
            }
            let elapsed = started.elapsed();
            if elapsed >= policy.max_wait() {
                warn!(task_id = %handle.id, queries, elapsed_s = elapsed.as_secs_f64(), "task wait timed out");
                return Err(GenerationError::TimedOut { elapsed });
            }
        }
    }

    /// Waits on `task` and records the outcome on it.
    pub fn drive(
        &self,
        task: &mut GenerationTask,
        policy: PollPolicy,
    ) -> EngineResult<TerminalStatus> {
        task.begin_polling();
        let outcome = self.wait_until_terminal(&task.handle(), policy);
        match &outcome {
            Ok(terminal) => task.apply_snapshot(&terminal.snapshot),
            Err(GenerationError::BackendError { detail }) => task.mark_failed(detail.clone()),
            Err(err @ GenerationError::TimedOut { .. }) => task.mark_timed_out(err.to_string()),
            Err(_) => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};

    use atelier_contracts::models::{BackendKind, ModelVariant};
    use atelier_contracts::tasks::{GenerationTask, StatusSnapshot, TaskHandle, TaskStatus};

    use super::{JobPoller, StatusSource};
    use crate::config::PollPolicy;
    use crate::error::{EngineResult, GenerationError};

    /// Reports `Polling` until the `ready_on`th read, then a fixed status.
    struct CountingSource {
        reads: AtomicU32,
        ready_on: u32,
        terminal: TaskStatus,
    }

    impl CountingSource {
        fn new(ready_on: u32, terminal: TaskStatus) -> Arc<Self> {
            Arc::new(Self {
                reads: AtomicU32::new(0),
                ready_on,
                terminal,
            })
        }

        fn reads(&self) -> u32 {
            self.reads.load(Ordering::SeqCst)
        }
    }

    impl StatusSource for CountingSource {
        fn read_status(&self, handle: &TaskHandle) -> EngineResult<StatusSnapshot> {
            let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            let status = if read >= self.ready_on {
                self.terminal
            } else {
                TaskStatus::Polling
            };
            Ok(StatusSnapshot {
                task_id: handle.id.clone(),
                status,
                raw_status: status.as_str().to_string(),
                result_refs: if status == TaskStatus::Ready {
                    vec!["https://cdn.test/out.jpg".to_string()]
                } else {
                    Vec::new()
                },
                error_detail: (status == TaskStatus::Error).then(|| "unsafe content".to_string()),
                raw: Value::Null,
            })
        }
    }

    fn handle() -> TaskHandle {
        TaskHandle {
            backend: BackendKind::Flux,
            id: "task-1".to_string(),
        }
    }

    #[test]
    fn ready_on_third_query() -> anyhow::Result<()> {
        let source = CountingSource::new(3, TaskStatus::Ready);
        let poller = JobPoller::new(source.clone());
        let interval = Duration::from_millis(20);
        let policy = PollPolicy::new(Duration::from_secs(5), interval)?;

        let terminal = poller.wait_until_terminal(&handle(), policy)?;
        assert_eq!(terminal.queries, 3);
        assert_eq!(source.reads(), 3);
        assert!(terminal.elapsed >= interval * 2);
        assert_eq!(terminal.snapshot.result_refs, vec!["https://cdn.test/out.jpg"]);
        Ok(())
    }

    #[test]
    fn max_wait_below_interval_times_out_after_one_query() -> anyhow::Result<()> {
        let source = CountingSource::new(u32::MAX, TaskStatus::Ready);
        let poller = JobPoller::new(source.clone());
        let interval = Duration::from_millis(400);
        let policy = PollPolicy::new(Duration::from_millis(20), interval)?;

        let result = poller.wait_until_terminal(&handle(), policy);
        let Err(GenerationError::TimedOut { elapsed }) = result else {
            anyhow::bail!("expected timeout, got {result:?}");
        };
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < interval, "slept past the wait budget: {elapsed:?}");
        assert_eq!(source.reads(), 1);
        Ok(())
    }

    #[test]
    fn query_count_is_bounded_by_max_wait() -> anyhow::Result<()> {
        let source = CountingSource::new(u32::MAX, TaskStatus::Ready);
        let poller = JobPoller::new(source.clone());
        let max_wait = Duration::from_millis(100);
        let interval = Duration::from_millis(30);

        let result = poller.wait_until_terminal(&handle(), PollPolicy::new(max_wait, interval)?);
        assert!(matches!(result, Err(GenerationError::TimedOut { elapsed }) if elapsed >= max_wait));
        let bound = (max_wait.as_millis() as f64 / interval.as_millis() as f64).ceil() as u32 + 1;
        assert!(source.reads() <= bound, "{} reads > {bound}", source.reads());
        Ok(())
    }

    #[test]
    fn backend_error_is_not_retried() -> anyhow::Result<()> {
        let source = CountingSource::new(2, TaskStatus::Error);
        let poller = JobPoller::new(source.clone());
        let mut task = GenerationTask::submitted("task-1", ModelVariant::ImagePro, json!({}));
        let policy = PollPolicy::new(Duration::from_secs(5), Duration::from_millis(5))?;

        let result = poller.drive(&mut task, policy);
        assert_eq!(
            result,
            Err(GenerationError::BackendError {
                detail: "unsafe content".to_string()
            })
        );
        assert_eq!(source.reads(), 2);
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error_detail.as_deref(), Some("unsafe content"));
        Ok(())
    }

    #[test]
    fn drive_marks_timeouts_and_successes() -> anyhow::Result<()> {
        let slow = JobPoller::new(CountingSource::new(u32::MAX, TaskStatus::Ready));
        let mut task = GenerationTask::submitted("task-1", ModelVariant::Video, json!({}));
        let _ = slow.drive(
            &mut task,
            PollPolicy::new(Duration::from_millis(1), Duration::from_millis(2))?,
        );
        assert_eq!(task.status, TaskStatus::TimedOut);

        let quick = JobPoller::new(CountingSource::new(1, TaskStatus::Ready));
        let mut task = GenerationTask::submitted("task-2", ModelVariant::ImagePro, json!({}));
        quick.drive(&mut task, PollPolicy::default())?;
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.primary_ref(), Some("https://cdn.test/out.jpg"));
        Ok(())
    }
}
