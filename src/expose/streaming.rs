//! Streamed workflows
//!
//! Runs an orchestrator workflow on its own task and hands back the receiving
//! end of its progress channel. Dropping the receiver stops observation only;
//! the workflow still runs to its terminal event.

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, Instrument};

use super::orchestrator::ExposeService;
use super::progress::{ProgressEvent, ProgressSink};
use crate::types::ExposureSource;

/// Workflows that can be streamed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowOp {
    Expose,
    Unexpose,
    ExposeDnsOnly,
    ExposeProxyOnly,
}

impl std::fmt::Display for WorkflowOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowOp::Expose => write!(f, "expose"),
            WorkflowOp::Unexpose => write!(f, "unexpose"),
            WorkflowOp::ExposeDnsOnly => write!(f, "expose-dns"),
            WorkflowOp::ExposeProxyOnly => write!(f, "expose-proxy"),
        }
    }
}

#[derive(Clone)]
pub struct StreamingExposeService {
    inner: Arc<ExposeService>,
}

impl StreamingExposeService {
    pub fn new(inner: Arc<ExposeService>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<ExposeService> {
        &self.inner
    }

    /// Spawn `op` for `service_id` and return its event stream
    pub fn start(&self, op: WorkflowOp, service_id: &str) -> UnboundedReceiver<ProgressEvent> {
        self.start_guarded(op, service_id, ())
    }

    /// Like [`start`](Self::start), keeping `guard` alive until the workflow ends
    pub fn start_guarded<G>(
        &self,
        op: WorkflowOp,
        service_id: &str,
        guard: G,
    ) -> UnboundedReceiver<ProgressEvent>
    where
        G: Send + 'static,
    {
        let (sink, rx) = ProgressSink::channel();
        let service = self.inner.clone();
        let service_id = service_id.to_string();
        let span = tracing::info_span!("workflow", op = %op, service_id = %service_id);

        tokio::spawn(
            async move {
                let _guard = guard;
                // Failures already reached the stream as an `error` event
                let outcome = match op {
                    WorkflowOp::Expose => {
                        service
                            .run_expose(&service_id, ExposureSource::Manual, sink)
                            .await
                    }
                    WorkflowOp::Unexpose => service.run_unexpose(&service_id, sink).await,
                    WorkflowOp::ExposeDnsOnly => service.run_expose_dns_only(&service_id, sink).await,
                    WorkflowOp::ExposeProxyOnly => {
                        service.run_expose_proxy_only(&service_id, sink).await
                    }
                };
                debug!(success = outcome.is_ok(), "Streamed workflow finished");
            }
            .instrument(span),
        );

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expose::progress::{EventType, StepStatus};
    use crate::testing::Harness;
    use crate::types::ServiceRecord;

    async fn collect(mut rx: UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal_event() {
        let service = ServiceRecord::new("grafana", "grafana", 3000);
        let h = Harness::new(vec![service.clone()]);
        let streaming = StreamingExposeService::new(Arc::new(h.service()));

        let events = collect(streaming.start(WorkflowOp::Expose, &service.id)).await;

        assert!(events.len() > 2);
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::Complete);
        assert_eq!(last.steps[0].status, StepStatus::Success);
        assert!(events[..events.len() - 1]
            .iter()
            .all(|e| e.event_type == EventType::Progress && e.result.is_none()));
    }

    #[tokio::test]
    async fn test_stream_reports_errors() {
        let h = Harness::new(vec![]);
        let streaming = StreamingExposeService::new(Arc::new(h.service()));

        let events = collect(streaming.start(WorkflowOp::Unexpose, "missing")).await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Error);
        assert!(events[0].result.as_ref().unwrap().error.as_ref().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_workflow_finishes_without_observer() {
        let service = ServiceRecord::new("grafana", "grafana", 3000);
        let h = Harness::new(vec![service.clone()]);
        let streaming = StreamingExposeService::new(Arc::new(h.service()));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        struct Done(Option<tokio::sync::oneshot::Sender<()>>);
        impl Drop for Done {
            fn drop(&mut self) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(());
                }
            }
        }

        drop(streaming.start_guarded(WorkflowOp::Expose, &service.id, Done(Some(done_tx))));
        done_rx.await.unwrap();

        assert!(h.stored(&service.id).await.enabled);
    }
}
