#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pipewright_core::metadata::ProcessorMetadata;
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::ServiceId;
use pipewright_db::models::service::ServiceRecord;
use pipewright_db::store::ServiceStore;
use pipewright_db::MemoryStore;
use pipewright_engine::registry::RegistryBuilder;
use pipewright_engine::{
    suspend_until, Computation, ComputationError, Cond, EngineConfig, FnCond, ProcessingContext,
    ProcessorRegistry, ServiceEngine, ServiceProcessor, Stores,
};
use pipewright_events::EventBus;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const POLL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Test processors
// ---------------------------------------------------------------------------

/// Completes with its args and counts invocations.
#[derive(Clone, Default)]
pub struct Echo {
    pub calls: Arc<AtomicUsize>,
}

impl ServiceProcessor for Echo {
    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new("echo", "Completes with its arguments")
    }

    fn process(&self, ctx: ProcessingContext) -> Computation<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Computation::completed(json!({ "args": ctx.record.args }))
    }
}

/// Waits until the gate opens.
#[derive(Clone, Default)]
pub struct Gate {
    pub open: Arc<AtomicBool>,
}

impl Gate {
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }
}

impl ServiceProcessor for Gate {
    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new("gate", "Completes once the gate opens")
    }

    fn process(&self, _ctx: ProcessingContext) -> Computation<Value> {
        let open = self.open.clone();
        suspend_until(
            FnCond(move || {
                let satisfied = open.load(Ordering::SeqCst);
                async move {
                    Ok::<_, ComputationError>(Cond {
                        state: Value::Null,
                        satisfied,
                    })
                }
            }),
            POLL,
        )
    }
}

/// Never completes.
pub struct Never;

impl ServiceProcessor for Never {
    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new("never", "Never completes")
    }

    fn process(&self, _ctx: ProcessingContext) -> Computation<Value> {
        suspend_until(
            FnCond(|| async { Ok::<_, ComputationError>(Cond::pending(Value::Null)) }),
            POLL,
        )
    }
}

/// Always fails.
pub struct Fail;

impl ServiceProcessor for Fail {
    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new("fail", "Always fails")
    }

    fn process(&self, _ctx: ProcessingContext) -> Computation<Value> {
        Computation::failed(ComputationError::failed("boom"))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub engine: Arc<ServiceEngine>,
    pub store: Arc<MemoryStore>,
    pub echo: Echo,
    pub gate: Gate,
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

pub fn test_config(processing_slots: usize) -> EngineConfig {
    EngineConfig {
        queue_id: "q1".into(),
        processing_slots,
        dispatch_interval: Duration::from_millis(20),
        dependency_poll: POLL,
        ..EngineConfig::default()
    }
}

impl Harness {
    /// Engine over a fresh in-memory store with the test processors.
    /// The dispatcher loop is not started.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, |builder, _| builder)
    }

    /// Like [`new`](Self::new), registering extra processors that may need
    /// the harness store.
    pub fn with_registry(
        config: EngineConfig,
        extra: impl FnOnce(RegistryBuilder, &Arc<MemoryStore>) -> RegistryBuilder,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let echo = Echo::default();
        let gate = Gate::default();
        let builder = ProcessorRegistry::builder()
            .register(echo.clone())
            .register(gate.clone())
            .register(Never)
            .register(Fail);
        let engine = ServiceEngine::new(
            config,
            Stores::shared(store.clone()),
            extra(builder, &store).build(),
            Arc::new(EventBus::default()),
        );
        Self {
            engine: Arc::new(engine),
            store,
            echo,
            gate,
            cancel: CancellationToken::new(),
            loops: Vec::new(),
        }
    }

    /// Spawn the dispatcher loop.
    pub fn start(mut self) -> Self {
        let dispatcher = self.engine.dispatcher().clone();
        let cancel = self.cancel.clone();
        self.loops
            .push(tokio::spawn(async move { dispatcher.run(cancel).await }));
        self
    }

    pub async fn get(&self, id: ServiceId) -> ServiceRecord {
        self.store.find_by_id(id).await.unwrap().expect("service exists")
    }

    /// Poll until `id` reaches `state`; panics after 5s.
    pub async fn wait_for_state(&self, id: ServiceId, state: ServiceState) -> ServiceRecord {
        let wait = async {
            loop {
                let record = self.get(id).await;
                if record.state == state {
                    return record;
                }
                tokio::time::sleep(POLL).await;
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), wait).await {
            Ok(record) => record,
            Err(_) => panic!(
                "service {id} never reached {state}, last state {}",
                self.get(id).await.state
            ),
        }
    }

    /// Poll until this instance runs no computation; panics after 5s.
    pub async fn wait_until_idle(&self) {
        let running = self.engine.dispatcher().running();
        let wait = async {
            while !running.is_empty() {
                tokio::time::sleep(POLL).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
            panic!("{} services still running", running.len());
        }
    }

    /// Let the dispatcher run a few cycles.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in &self.loops {
            handle.abort();
        }
    }
}
