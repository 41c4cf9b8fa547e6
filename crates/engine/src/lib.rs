//! Job scheduling and execution engine.
//!
//! Services are persisted records processed by registered processors.
//! The [`Dispatcher`] claims eligible records from the store and runs their
//! [`Computation`]s on a bounded [`ComputationQueue`]; [`ServiceEngine`] is the
//! operator surface on top.

pub mod computation;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod job_queue;
pub mod output;
pub mod processors;
pub mod registry;
pub mod scheduler;
pub mod slots;
pub mod task_queue;
pub mod workflow;

pub use computation::{
    run_inline, suspend_until, Computation, ComputationError, Cond, ContinuationCond, FnCond,
    Progress,
};
pub use config::EngineConfig;
pub use context::{require_success, ProcessingContext, ServiceSubmitter};
pub use dispatcher::{CycleReport, Dispatcher};
pub use engine::{ServiceEngine, Stores};
pub use error::{EngineError, EngineResult};
pub use output::OutputStream;
pub use processors::ExternalProgramProcessor;
pub use registry::{ProcessorRegistry, ServiceProcessor};
pub use scheduler::ServiceScheduler;
pub use slots::{ServerStats, SlotManager};
pub use task_queue::{ComputationHandle, ComputationQueue, QueueStats};
pub use workflow::{PipelineGenerator, WorkflowConfig, WorkflowExecutor};
