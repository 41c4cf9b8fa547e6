//! Workflow graph executor.
//!
//! A [`PipelineGenerator`] turns a target value into a [`WorkflowGraph`].
//! [`WorkflowExecutor`] is the composite processor that runs it: it takes
//! the per-target lock, persists the graph, submits one child service per
//! node that has to run, waits for them and reports the sink states.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use pipewright_core::error::CoreError;
use pipewright_core::graph::{GraphSnapshot, NodeState, WorkflowGraph};
use pipewright_core::metadata::{ArgDescriptor, ArgKind, ProcessorMetadata};
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::{DbId, ServiceId};
use pipewright_db::models::service::{FieldUpdate, NewService, ServiceRecord};
use pipewright_db::models::workflow::NewWorkflow;
use pipewright_db::store::{ServiceStore, WorkflowStore};
use serde_json::{json, Map, Value};

use crate::computation::{suspend_until, Computation, ComputationError, Cond, FnCond};
use crate::context::ProcessingContext;
use crate::error::EngineResult;
use crate::registry::ServiceProcessor;

// ---------------------------------------------------------------------------
// Generator and config
// ---------------------------------------------------------------------------

/// Produces the graph for one pipeline target.
pub trait PipelineGenerator: Send + Sync + 'static {
    /// Registered processor name of the pipeline.
    fn name(&self) -> &str;

    fn generate(&self, target: &Value) -> Result<WorkflowGraph, CoreError>;

    /// Key of the lock serializing runs on the same target; `None` runs
    /// without a lock.
    fn lock_key(&self, target: &Value) -> Option<String> {
        Some(format!("{}:{}", self.name(), target))
    }
}

/// Per-run options, read from the executing record's dictionary args.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowConfig {
    /// Nodes to run even when their output exists.
    pub force: BTreeSet<String>,
    pub force_all: bool,
    pub poll_interval: Duration,
}

impl WorkflowConfig {
    pub fn from_args(args: &Map<String, Value>, default_poll: Duration) -> Self {
        let force = args
            .get("force")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let force_all = args.get("forceAll").and_then(Value::as_bool).unwrap_or(false);
        let poll_interval = args
            .get("pollIntervalMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(default_poll);
        Self {
            force,
            force_all,
            poll_interval,
        }
    }

    pub fn forces(&self, node_id: &str) -> bool {
        self.force_all || self.force.contains(node_id)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct WorkflowExecutor {
    generator: Arc<dyn PipelineGenerator>,
    workflows: Arc<dyn WorkflowStore>,
}

impl WorkflowExecutor {
    pub fn new(generator: impl PipelineGenerator, workflows: Arc<dyn WorkflowStore>) -> Self {
        Self {
            generator: Arc::new(generator),
            workflows,
        }
    }
}

impl ServiceProcessor for WorkflowExecutor {
    fn metadata(&self) -> ProcessorMetadata {
        let name = self.generator.name();
        ProcessorMetadata::new(name, format!("Runs the '{name}' pipeline"))
            .with_arg(ArgDescriptor::required(
                "target",
                ArgKind::Any,
                "Target the pipeline is generated for",
            ))
            .with_arg(ArgDescriptor::optional(
                "force",
                ArgKind::List,
                "Node ids to run even when their output exists",
            ))
            .with_arg(ArgDescriptor::optional(
                "forceAll",
                ArgKind::Boolean,
                "Run every node",
            ))
            .with_arg(ArgDescriptor::optional(
                "pollIntervalMs",
                ArgKind::Integer,
                "Re-check interval while waiting for the lock and the nodes",
            ))
    }

    fn process(&self, ctx: ProcessingContext) -> Computation<Value> {
        let args = &ctx.record.dictionary_args;
        let target = args.get("target").cloned().unwrap_or(Value::Null);
        let config = WorkflowConfig::from_args(args, ctx.dependency_poll);
        let graph = match self.generator.generate(&target) {
            Ok(graph) => graph,
            Err(e) => {
                return Computation::failed(ComputationError::failed(format!(
                    "Cannot generate pipeline: {e}"
                )))
            }
        };

        let holder = format!("service:{}", ctx.service_id());
        let lock = match self.generator.lock_key(&target) {
            Some(key) => acquire_lock(self.workflows.clone(), key, holder, config.poll_interval)
                .map(Some),
            None => Computation::completed(None),
        };

        let run = WorkflowRun {
            ctx,
            workflows: self.workflows.clone(),
            name: self.generator.name().to_string(),
            graph,
            config,
        };
        lock.and_then(move |guard| {
            run.execute().map(move |result| {
                drop(guard);
                result
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// Held workflow lock; released when dropped, whichever way the run ends.
struct LockGuard {
    workflows: Arc<dyn WorkflowStore>,
    key: String,
    holder: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(lock = %self.key, "No runtime to release workflow lock");
            return;
        };
        let workflows = self.workflows.clone();
        let key = std::mem::take(&mut self.key);
        let holder = std::mem::take(&mut self.holder);
        runtime.spawn(async move {
            match workflows.unlock(&key, &holder).await {
                Ok(_) => tracing::debug!(lock = %key, holder = %holder, "Workflow lock released"),
                Err(e) => tracing::error!(error = %e, lock = %key, "Failed to release workflow lock"),
            }
        });
    }
}

fn acquire_lock(
    workflows: Arc<dyn WorkflowStore>,
    key: String,
    holder: String,
    poll: Duration,
) -> Computation<LockGuard> {
    let (w, k, h) = (workflows.clone(), key.clone(), holder.clone());
    suspend_until(
        FnCond(move || {
            let (workflows, key, holder) = (w.clone(), k.clone(), h.clone());
            async move {
                let held = workflows.try_lock(&key, &holder).await?;
                if !held {
                    tracing::debug!(lock = %key, "Workflow lock busy");
                }
                Ok::<_, ComputationError>(Cond {
                    state: (),
                    satisfied: held,
                })
            }
        }),
        poll,
    )
    .map(move |()| {
        tracing::debug!(lock = %key, holder = %holder, "Workflow lock acquired");
        LockGuard {
            workflows,
            key,
            holder,
        }
    })
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

struct WorkflowRun {
    ctx: ProcessingContext,
    workflows: Arc<dyn WorkflowStore>,
    name: String,
    graph: WorkflowGraph,
    config: WorkflowConfig,
}

/// What was submitted for one run.
struct Plan {
    workflow_id: DbId,
    node_services: BTreeMap<String, ServiceId>,
    skipped: BTreeSet<String>,
    sinks: Vec<String>,
}

impl WorkflowRun {
    fn execute(self) -> Computation<Value> {
        let ctx = self.ctx.clone();
        Computation::from_future(async move { Ok(self.submit_nodes().await?) }).and_then(
            move |plan: Plan| {
                let ids: Vec<ServiceId> = plan.node_services.values().copied().collect();
                let wait = if ids.is_empty() {
                    Computation::completed(Vec::new())
                } else {
                    ctx.wait_for_dependencies(ids)
                };
                wait.and_then(move |records| match conclude(&plan, &records) {
                    Ok(result) => Computation::completed(result),
                    Err(e) => Computation::failed(e),
                })
            },
        )
    }

    async fn submit_nodes(self) -> EngineResult<Plan> {
        let service_id = self.ctx.service_id();
        let workflow = self
            .workflows
            .save_workflow(NewWorkflow {
                name: self.name.clone(),
                service_id: Some(service_id),
                graph: self.graph.clone(),
            })
            .await?;
        self.ctx
            .store
            .update_field(service_id, FieldUpdate::WorkflowId(workflow.id))
            .await?;

        let mut node_services = BTreeMap::new();
        let mut skipped = BTreeSet::new();
        for node in self.graph.topological_order() {
            if node.existing_output.is_some() && !self.config.forces(&node.id) {
                self.workflows
                    .record_skipped_node(workflow.id, &node.id)
                    .await?;
                skipped.insert(node.id.clone());
                continue;
            }

            let mut child = NewService::new(&node.processor).with_args(node.args.clone());
            child.description = node.description.clone();
            child.dictionary_args = node.dictionary_args.clone();
            child.resources = node.resources.clone();
            child.workflow_id = Some(workflow.id);
            for upstream in self.graph.upstream(&node.id) {
                if let Some(&id) = node_services.get(upstream) {
                    child = child.depends_on(id);
                }
            }

            let record = self.ctx.submit_child(child).await?;
            self.workflows
                .record_node_service(workflow.id, &node.id, record.id())
                .await?;
            node_services.insert(node.id.clone(), record.id());
        }

        tracing::info!(
            service_id,
            workflow_id = workflow.id,
            submitted = node_services.len(),
            skipped = skipped.len(),
            "Workflow nodes submitted"
        );
        Ok(Plan {
            workflow_id: workflow.id,
            node_services,
            skipped,
            sinks: self.graph.sinks().iter().map(|n| n.id.clone()).collect(),
        })
    }
}

/// Result value of a finished run; fails if a submitted sink did not succeed.
fn conclude(plan: &Plan, records: &[ServiceRecord]) -> Result<Value, ComputationError> {
    let states: BTreeMap<ServiceId, ServiceState> =
        records.iter().map(|r| (r.id(), r.state)).collect();
    let mut sinks = Map::new();
    let mut failed = Vec::new();

    for sink in &plan.sinks {
        if plan.skipped.contains(sink) {
            sinks.insert(sink.clone(), json!({ "state": null, "skipped": true }));
            continue;
        }
        let service_id = plan.node_services.get(sink).copied();
        let state = service_id.and_then(|id| states.get(&id)).copied();
        if state != Some(ServiceState::Successful) {
            failed.push(format!(
                "{sink} ({})",
                state.map_or("UNKNOWN", ServiceState::as_str)
            ));
        }
        sinks.insert(
            sink.clone(),
            json!({ "serviceId": service_id, "state": state, "skipped": false }),
        );
    }

    if !failed.is_empty() {
        return Err(ComputationError::failed(format!(
            "Workflow {} sinks did not succeed: {}",
            plan.workflow_id,
            failed.join(", ")
        )));
    }
    Ok(json!({ "workflowId": plan.workflow_id, "sinks": sinks }))
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Nodes, edges and current node states of a stored workflow.
pub async fn workflow_snapshot(
    workflows: &dyn WorkflowStore,
    services: &dyn ServiceStore,
    workflow_id: DbId,
) -> EngineResult<Option<GraphSnapshot>> {
    let Some(workflow) = workflows.find_workflow(workflow_id).await? else {
        return Ok(None);
    };

    let mut states = BTreeMap::new();
    for node in workflow.graph.nodes() {
        let service_id = workflow.node_services.get(&node.id).copied();
        let state = match service_id {
            Some(id) => services.find_by_id(id).await?.map(|r| r.state),
            None => None,
        };
        states.insert(
            node.id.clone(),
            NodeState {
                service_id,
                state,
                skipped: workflow.skipped.contains(&node.id),
            },
        );
    }

    Ok(Some(GraphSnapshot {
        nodes: workflow.graph.nodes().to_vec(),
        edges: workflow.graph.edges().to_vec(),
        states,
    }))
}
