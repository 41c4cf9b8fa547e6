//! Leaf processor running an external program.
//!
//! Positional args are the program and its arguments. Output goes to
//! `<output root>/<service id>/stdout.log` and `stderr.log`; the exit is
//! polled with `suspend_until` so a long-running program never holds a
//! worker.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipewright_core::metadata::{ArgDescriptor, ArgKind, ProcessorMetadata};
use pipewright_db::models::service::FieldUpdate;
use serde_json::{json, Value};
use tokio::process::{Child, Command};

use crate::computation::{suspend_until, Computation, ComputationError, Cond, FnCond};
use crate::context::ProcessingContext;
use crate::error::EngineResult;
use crate::output::{output_dir, OutputStream};
use crate::registry::ServiceProcessor;

pub const EXEC_PROCESSOR: &str = "exec";

pub struct ExternalProgramProcessor {
    output_root: PathBuf,
}

impl ExternalProgramProcessor {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
        }
    }
}

/// A spawned program and where its output goes.
struct Spawned {
    child: Arc<Mutex<Child>>,
    stdout: PathBuf,
    stderr: PathBuf,
}

impl ServiceProcessor for ExternalProgramProcessor {
    fn metadata(&self) -> ProcessorMetadata {
        ProcessorMetadata::new(
            EXEC_PROCESSOR,
            "Runs an external program; positional args are the program and its arguments",
        )
        .with_min_positional_args(1)
        .with_arg(ArgDescriptor::optional(
            "workingDir",
            ArgKind::String,
            "Working directory of the program",
        ))
        .with_arg(ArgDescriptor::optional(
            "env",
            ArgKind::Object,
            "Extra environment variables",
        ))
        .with_arg(ArgDescriptor::optional(
            "pollIntervalMs",
            ArgKind::Integer,
            "How often the exit status is checked",
        ))
    }

    fn process(&self, ctx: ProcessingContext) -> Computation<Value> {
        let poll = ctx
            .record
            .dictionary_args
            .get("pollIntervalMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(ctx.dependency_poll);
        let root = self.output_root.clone();

        Computation::from_future(async move { Ok(spawn(&ctx, root).await?) })
            .and_then(move |spawned| wait_for_exit(spawned, poll))
    }
}

async fn spawn(ctx: &ProcessingContext, root: PathBuf) -> EngineResult<Spawned> {
    let record = &ctx.record;
    let dir = output_dir(&root, record.id());
    tokio::fs::create_dir_all(&dir).await?;
    let stdout = dir.join(OutputStream::Stdout.file_name());
    let stderr = dir.join(OutputStream::Stderr.file_name());

    let out_file = tokio::fs::File::create(&stdout).await?.into_std().await;
    let err_file = tokio::fs::File::create(&stderr).await?.into_std().await;

    let (program, args) = record
        .args
        .split_first()
        .ok_or_else(|| crate::error::EngineError::validation("No program given"))?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out_file))
        .stderr(Stdio::from(err_file))
        .kill_on_drop(true);
    if let Some(dir) = record.dictionary_args.get("workingDir").and_then(Value::as_str) {
        command.current_dir(dir);
    }
    if let Some(env) = record.dictionary_args.get("env").and_then(Value::as_object) {
        for (key, value) in env {
            match value {
                Value::String(s) => command.env(key, s),
                other => command.env(key, other.to_string()),
            };
        }
    }

    let child = command.spawn()?;
    tracing::info!(
        service_id = record.id(),
        program = %program,
        pid = ?child.id(),
        "External program started"
    );

    ctx.store
        .update_field(
            record.id(),
            FieldUpdate::OutputPaths {
                stdout: Some(stdout.display().to_string()),
                stderr: Some(stderr.display().to_string()),
            },
        )
        .await?;

    Ok(Spawned {
        child: Arc::new(Mutex::new(child)),
        stdout,
        stderr,
    })
}

/// Poll the child until it exits. Dropping the computation kills it.
fn wait_for_exit(spawned: Spawned, poll: Duration) -> Computation<Value> {
    let child = spawned.child.clone();
    suspend_until(
        FnCond(move || {
            let child = child.clone();
            async move {
                let status = {
                    let mut child = child
                        .lock()
                        .map_err(|_| ComputationError::failed("Child process lock poisoned"))?;
                    child.try_wait().map_err(|e| {
                        ComputationError::failed(format!("Cannot poll child process: {e}"))
                    })?
                };
                Ok::<_, ComputationError>(Cond {
                    state: status,
                    satisfied: status.is_some(),
                })
            }
        }),
        poll,
    )
    .and_then(move |status| {
        // Keep the child alive until here so an early drop cannot kill it.
        let Spawned {
            child: _child,
            stdout,
            stderr,
        } = spawned;
        match status {
            Some(status) => finished(status, stdout, stderr),
            None => Computation::failed(ComputationError::failed("Child process vanished")),
        }
    })
}

fn finished(status: ExitStatus, stdout: PathBuf, stderr: PathBuf) -> Computation<Value> {
    if !status.success() {
        return Computation::failed(ComputationError::failed(format!(
            "Program exited with {status}"
        )));
    }
    Computation::completed(json!({
        "exitCode": status.code(),
        "stdout": stdout.display().to_string(),
        "stderr": stderr.display().to_string(),
    }))
}
