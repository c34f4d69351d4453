//! Progress Protocol
//!
//! Each workflow owns one `ExposeContext`. Phase transitions go through it,
//! and every change is sent as a `ProgressEvent` carrying a copy of the
//! step list. Terminal events (`complete` or `error`) are sent once.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// One half of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Dns,
    Proxy,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Dns => write!(f, "dns"),
            Phase::Proxy => write!(f, "proxy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Error,
    Warning,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Error | StepStatus::Warning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposeAction {
    Expose,
    Unexpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Progress,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    pub phase: Phase,
    pub status: StepStatus,
    /// 0-100
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProgressStep {
    fn pending(phase: Phase) -> Self {
        Self {
            phase,
            status: StepStatus::Pending,
            progress: 0,
            message: "Waiting".to_string(),
            detail: None,
        }
    }
}

/// Final outcome of a workflow, as returned to callers and sent on terminal events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_host_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_pending: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Wire shape of one progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub service_id: String,
    pub action: ExposeAction,
    pub steps: Vec<ProgressStep>,
    /// Unix milliseconds
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
}

/// Where progress events go; a disabled sink drops them
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the caller stopped watching; the workflow carries on
            let _ = tx.send(event);
        }
    }
}

/// Per-operation state: the step list and its sink
#[derive(Debug)]
pub struct ExposeContext {
    service_id: String,
    action: ExposeAction,
    steps: Vec<ProgressStep>,
    sink: ProgressSink,
    finished: bool,
}

impl ExposeContext {
    pub fn new(service_id: &str, action: ExposeAction, sink: ProgressSink) -> Self {
        Self {
            service_id: service_id.to_string(),
            action,
            steps: vec![ProgressStep::pending(Phase::Dns), ProgressStep::pending(Phase::Proxy)],
            sink,
            finished: false,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn steps(&self) -> &[ProgressStep] {
        &self.steps
    }

    pub fn step(&self, phase: Phase) -> &ProgressStep {
        // Both phases are always present
        &self.steps[phase_index(phase)]
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Mark a phase running (or advance it) with a progress percentage
    pub fn running(&mut self, phase: Phase, progress: u8, message: &str, detail: Option<String>) {
        self.transition(phase, StepStatus::Running, progress, message, detail);
    }

    pub fn succeed(&mut self, phase: Phase, message: &str) {
        self.transition(phase, StepStatus::Success, 100, message, None);
    }

    pub fn warn(&mut self, phase: Phase, message: &str, detail: Option<String>) {
        self.transition(phase, StepStatus::Warning, 100, message, detail);
    }

    pub fn fail_step(&mut self, phase: Phase, message: &str, detail: Option<String>) {
        let progress = self.step(phase).progress;
        self.transition(phase, StepStatus::Error, progress, message, detail);
    }

    /// Send the `complete` event
    pub fn complete(&mut self, result: OperationResult) {
        self.finish(EventType::Complete, result);
    }

    /// Send the `error` event
    pub fn fail(&mut self, error: &str) {
        self.finish(EventType::Error, OperationResult::failure(error));
    }

    fn transition(
        &mut self,
        phase: Phase,
        status: StepStatus,
        progress: u8,
        message: &str,
        detail: Option<String>,
    ) {
        if self.finished {
            debug!(service_id = %self.service_id, phase = %phase, "Ignoring step update after terminal event");
            return;
        }

        let step = &mut self.steps[phase_index(phase)];
        if step.status.is_terminal() {
            debug!(
                service_id = %self.service_id,
                phase = %phase,
                status = ?step.status,
                "Ignoring update to a finished step"
            );
            return;
        }

        let progress = progress.min(100).max(step.progress);
        if step.status == status
            && step.progress == progress
            && step.message == message
            && step.detail == detail
        {
            return;
        }

        step.status = status;
        step.progress = progress;
        step.message = message.to_string();
        step.detail = detail;

        self.emit(EventType::Progress, None);
    }

    fn finish(&mut self, event_type: EventType, result: OperationResult) {
        if self.finished {
            debug!(service_id = %self.service_id, "Workflow already finished");
            return;
        }
        self.emit(event_type, Some(result));
        self.finished = true;
    }

    fn emit(&self, event_type: EventType, result: Option<OperationResult>) {
        self.sink.send(ProgressEvent {
            event_type,
            service_id: self.service_id.clone(),
            action: self.action,
            steps: self.steps.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            result,
        });
    }
}

fn phase_index(phase: Phase) -> usize {
    match phase {
        Phase::Dns => 0,
        Phase::Proxy => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_steps_are_monotonic() {
        let (sink, mut rx) = ProgressSink::channel();
        let mut ctx = ExposeContext::new("svc-1", ExposeAction::Expose, sink);

        ctx.running(Phase::Dns, 40, "Waiting for propagation", None);
        ctx.running(Phase::Dns, 20, "Waiting for propagation", None);
        assert_eq!(ctx.step(Phase::Dns).progress, 40);

        ctx.succeed(Phase::Dns, "DNS record created");
        ctx.running(Phase::Dns, 50, "again", None);
        ctx.fail_step(Phase::Dns, "late failure", None);

        let dns = ctx.step(Phase::Dns);
        assert_eq!(dns.status, StepStatus::Success);
        assert_eq!(dns.progress, 100);

        // 40%, the duplicate-after-clamp is skipped, then success
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn test_short_circuit_jumps_straight_to_success() {
        let mut ctx = ExposeContext::new("svc-1", ExposeAction::Expose, ProgressSink::disabled());
        ctx.succeed(Phase::Proxy, "Already configured");
        assert_eq!(ctx.step(Phase::Proxy).status, StepStatus::Success);
        assert_eq!(ctx.step(Phase::Dns).status, StepStatus::Pending);
    }

    #[test]
    fn test_terminal_event_is_sent_once_and_freezes_context() {
        let (sink, mut rx) = ProgressSink::channel();
        let mut ctx = ExposeContext::new("svc-1", ExposeAction::Unexpose, sink);

        ctx.succeed(Phase::Dns, "Deleted");
        ctx.complete(OperationResult {
            success: true,
            ..Default::default()
        });
        ctx.fail("should be ignored");
        ctx.succeed(Phase::Proxy, "should be ignored");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, EventType::Complete);
        assert!(events[1].result.as_ref().unwrap().success);
        assert_eq!(ctx.step(Phase::Proxy).status, StepStatus::Pending);
        assert!(ctx.is_finished());
    }

    #[test]
    fn test_events_carry_snapshots() {
        let (sink, mut rx) = ProgressSink::channel();
        let mut ctx = ExposeContext::new("svc-1", ExposeAction::Expose, sink);

        ctx.running(Phase::Dns, 10, "Creating DNS record", None);
        ctx.succeed(Phase::Dns, "Created");

        let events = drain(&mut rx);
        assert_eq!(events[0].steps[0].status, StepStatus::Running);
        assert_eq!(events[1].steps[0].status, StepStatus::Success);
    }

    #[test]
    fn test_wire_shape() {
        let (sink, mut rx) = ProgressSink::channel();
        let mut ctx = ExposeContext::new("svc-1", ExposeAction::Expose, sink);
        ctx.warn(Phase::Proxy, "Proxy host created", Some("Rate limited".to_string()));
        ctx.complete(OperationResult {
            success: true,
            domain: Some("grafana.example.com".to_string()),
            ssl_pending: Some(true),
            ..Default::default()
        });

        let events = drain(&mut rx);
        let progress = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(progress["type"], "progress");
        assert_eq!(progress["serviceId"], "svc-1");
        assert_eq!(progress["action"], "expose");
        assert_eq!(progress["steps"][1]["status"], "warning");
        assert_eq!(progress["steps"][1]["detail"], "Rate limited");
        assert!(progress["steps"][0].get("detail").is_none());
        assert!(progress.get("result").is_none());

        let complete = serde_json::to_value(&events[1]).unwrap();
        assert_eq!(complete["type"], "complete");
        assert_eq!(complete["result"]["domain"], "grafana.example.com");
        assert_eq!(complete["result"]["sslPending"], true);
        assert!(complete["result"].get("dnsRecordId").is_none());
    }
}
