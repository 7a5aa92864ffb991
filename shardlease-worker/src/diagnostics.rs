use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::lease_metrics::REJECTED_TASKS_TOTAL;

/// A task the execution layer refused to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRejection {
    pub executor: String,
    pub error: String,
}

/// Events emitted by the scheduler loop about its execution layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    ExecutorState {
        active_consumers: usize,
        pending_errors: usize,
    },
    RejectedTask {
        executor: String,
        error: String,
    },
}

impl From<TaskRejection> for DiagnosticEvent {
    fn from(rejection: TaskRejection) -> Self {
        DiagnosticEvent::RejectedTask {
            executor: rejection.executor,
            error: rejection.error,
        }
    }
}

pub trait DiagnosticEventHandler: Send + Sync {
    fn handle(&self, event: &DiagnosticEvent);
}

/// Logs executor state at debug and rejected tasks at error.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDiagnosticHandler;

impl DiagnosticEventHandler for LoggingDiagnosticHandler {
    fn handle(&self, event: &DiagnosticEvent) {
        match event {
            DiagnosticEvent::ExecutorState {
                active_consumers,
                pending_errors,
            } => debug!(
                active_consumers = active_consumers,
                pending_errors = pending_errors,
                "executor state"
            ),
            DiagnosticEvent::RejectedTask { executor, error } => {
                error!(executor = %executor, error = %error, "task rejected by executor")
            }
        }
    }
}

/// Sending half of the task-error channel.
///
/// Handed to shard consumer factories so that a consumer whose work cannot
/// be scheduled reports it instead of failing the scheduler loop.
#[derive(Debug, Clone)]
pub struct TaskErrorReporter {
    tx: mpsc::UnboundedSender<TaskRejection>,
}

impl TaskErrorReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TaskRejection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the scheduler is gone.
    pub fn report_rejection(&self, executor: impl Into<String>, error: impl ToString) -> bool {
        metrics::counter!(REJECTED_TASKS_TOTAL.name).increment(1);
        self.tx
            .send(TaskRejection {
                executor: executor.into(),
                error: error.to_string(),
            })
            .is_ok()
    }
}

/// Drains every pending rejection without waiting.
pub(crate) fn drain_rejections(rx: &mut mpsc::UnboundedReceiver<TaskRejection>) -> Vec<TaskRejection> {
    let mut rejections = Vec::new();
    while let Ok(rejection) = rx.try_recv() {
        rejections.push(rejection);
    }
    rejections
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn rejections_are_drained_in_order() {
        let (reporter, mut rx) = TaskErrorReporter::channel();
        let clone = reporter.clone();
        assert!(reporter.report_rejection("shard-consumers", "pool saturated"));
        assert!(clone.report_rejection("shard-consumers", "shutting down"));

        let drained = drain_rejections(&mut rx);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].error, "pool saturated");
        assert!(drain_rejections(&mut rx).is_empty());

        drop(rx);
        assert!(!reporter.report_rejection("shard-consumers", "late"));
    }

    #[traced_test]
    #[test]
    fn logging_handler_reports_rejections_at_error() {
        let handler = LoggingDiagnosticHandler;
        handler.handle(&DiagnosticEvent::from(TaskRejection {
            executor: "shard-consumers".into(),
            error: "pool saturated".into(),
        }));
        assert!(logs_contain("task rejected by executor"));
        assert!(logs_contain("pool saturated"));
    }
}
