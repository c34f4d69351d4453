//! Expose/unexpose orchestration and its supporting machinery

pub mod orchestrator;
pub mod progress;
pub mod propagation;
pub mod reachability;
pub mod ssl;
pub mod streaming;

pub use orchestrator::{DeleteOutcome, ExposeService, ExposeSettings, MigrationResult};
pub use progress::{
    EventType, ExposeAction, ExposeContext, OperationResult, Phase, ProgressEvent, ProgressSink,
    ProgressStep, StepStatus,
};
pub use propagation::{DnsPropagationWaiter, PropagationConfig};
pub use reachability::{HttpProber, Prober, ReachabilityChecker, ReachabilityConfig};
pub use ssl::summarize_ssl_error;
pub use streaming::{StreamingExposeService, WorkflowOp};
