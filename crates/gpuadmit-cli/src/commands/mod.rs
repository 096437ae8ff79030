//! CLI commands implementation

use anyhow::{bail, Context, Result};
use clap::Args;
use futures::future::join_all;
use gpuadmit_core::{
    AdmitConfig, AdmitError, ClusterFile, RawResourceSpec, RawResources, TaskFile, Toleration,
};
use gpuadmit_scheduler::{ClusterState, PlacementDecision, Scheduler, TolerationPolicy};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Resource flags shared by the single-task commands
#[derive(Args, Debug, Clone, Default)]
pub struct ResourceArgs {
    /// CPU request, e.g. 2 or 500m
    #[arg(long)]
    pub cpu: Option<String>,

    /// Memory request, e.g. 8Gi or 512M
    #[arg(long)]
    pub memory: Option<String>,

    /// Accelerator request as NAME=COUNT (repeatable)
    #[arg(long = "gpu", value_name = "NAME=COUNT", value_parser = parse_accelerator)]
    pub accelerators: Vec<(String, i64)>,
}

impl ResourceArgs {
    /// Requests only; limits default to the requests
    pub fn to_spec(&self) -> RawResourceSpec {
        RawResourceSpec {
            requests: RawResources {
                cpu: self.cpu.as_deref().map(Into::into),
                memory: self.memory.as_deref().map(Into::into),
                accelerators: self.accelerators.iter().cloned().collect(),
            },
            limits: None,
        }
    }
}

/// Parse `nvidia.com/gpu=2`
pub fn parse_accelerator(s: &str) -> std::result::Result<(String, i64), String> {
    let (name, count) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=COUNT, got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing accelerator name in '{}'", s));
    }
    let count = count
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("invalid accelerator count in '{}'", s))?;
    Ok((name.to_string(), count))
}

/// Load a cluster snapshot and build a scheduler over it
fn load_scheduler(config: &AdmitConfig, cluster: &Path) -> Result<Scheduler> {
    let nodes = ClusterFile::from_file(cluster)
        .and_then(ClusterFile::into_nodes)
        .with_context(|| format!("loading cluster file {}", cluster.display()))?;
    debug!(nodes = nodes.len(), "Loaded cluster snapshot");

    let state = Arc::new(ClusterState::from_nodes(nodes)?);
    Ok(Scheduler::from_config(config, state)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_tolerations(tolerations: &[Toleration]) {
    if tolerations.is_empty() {
        println!("No tolerations");
        return;
    }
    println!("{:<32} {:<10} {:<20} {:<18}", "KEY", "OPERATOR", "VALUE", "EFFECT");
    println!("{}", "-".repeat(84));
    for t in tolerations {
        println!(
            "{:<32} {:<10} {:<20} {:<18}",
            t.key,
            format!("{:?}", t.operator),
            if t.value.is_empty() { "-" } else { t.value.as_str() },
            t.effect
                .map(|e| e.to_string())
                .unwrap_or_else(|| "*".to_string()),
        );
    }
}

fn print_decision(decision: &PlacementDecision) {
    if decision.accepted {
        println!(
            "Placed on {}",
            decision.node_id.as_deref().unwrap_or_default()
        );
        if let Some(id) = decision.allocation_id {
            println!("Allocation: {}", id);
        }
    } else {
        let reason = decision
            .reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        println!("Rejected: {}", reason);
        if let Some(detail) = &decision.detail {
            println!("  {}", detail);
        }
    }
    println!();
    print_tolerations(&decision.tolerations);
}

/// Show the tolerations a task would be given
pub fn tolerations(config: &AdmitConfig, resources: &ResourceArgs, json: bool) -> Result<()> {
    let request = resources.to_spec().normalize()?;
    let policy = TolerationPolicy::from_config(config.policy())?;
    let tolerations = policy.resolve(&request.accelerators)?;

    if json {
        return print_json(&tolerations);
    }
    print_tolerations(&tolerations);
    Ok(())
}

/// Check whether one node would admit a task
pub async fn check(
    config: &AdmitConfig,
    cluster: &Path,
    node: &str,
    resources: &ResourceArgs,
    json: bool,
) -> Result<()> {
    let scheduler = load_scheduler(config, cluster)?;
    let request = resources.to_spec().normalize()?;

    let evaluation = scheduler
        .explain(&request)
        .await?
        .into_iter()
        .find(|e| e.node_id == node)
        .ok_or_else(|| AdmitError::NodeNotFound(node.to_string()))?;

    if json {
        return print_json(&evaluation);
    }

    match evaluation.verdict() {
        Ok(()) => println!("Node {} admits {}", node, request),
        Err(reason) => println!("Node {} rejects {}: {}", node, request, reason),
    }
    if !evaluation.shortfall.is_empty() {
        println!("  short of: {}", evaluation.shortfall.join(", "));
    }
    for taint in &evaluation.admission.untolerated {
        println!("  untolerated: {}", taint);
    }
    println!("  penalty: {}", evaluation.admission.penalty);
    println!("  score: {}", evaluation.score);
    Ok(())
}

/// Place one task against a cluster snapshot
pub async fn place(
    config: &AdmitConfig,
    cluster: &Path,
    resources: &ResourceArgs,
    json: bool,
) -> Result<()> {
    let scheduler = load_scheduler(config, cluster)?;
    let decision = scheduler.schedule_raw(&resources.to_spec()).await?;

    if json {
        return print_json(&decision);
    }
    print_decision(&decision);
    Ok(())
}

#[derive(Debug, Serialize)]
struct TaskOutcome {
    task: String,
    #[serde(flatten)]
    decision: Option<PlacementDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TaskOutcome {
    fn new(task: String, result: gpuadmit_core::AdmitResult<PlacementDecision>) -> Self {
        match result {
            Ok(decision) => Self {
                task,
                decision: Some(decision),
                error: None,
            },
            Err(e) => Self {
                task,
                decision: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn accepted(&self) -> bool {
        self.decision.as_ref().map(|d| d.accepted).unwrap_or(false)
    }
}

/// Place a batch of tasks against a cluster snapshot
pub async fn simulate(
    config: &AdmitConfig,
    cluster: &Path,
    tasks: &Path,
    concurrent: bool,
    json: bool,
) -> Result<()> {
    let scheduler = Arc::new(load_scheduler(config, cluster)?);
    let task_file = TaskFile::from_file(tasks)
        .with_context(|| format!("loading task file {}", tasks.display()))?;

    info!(
        tasks = task_file.tasks.len(),
        concurrent, "Simulating placements"
    );

    let outcomes: Vec<TaskOutcome> = if concurrent {
        let handles: Vec<_> = task_file
            .tasks
            .into_iter()
            .map(|task| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    let result = scheduler.schedule_raw(&task.resources).await;
                    TaskOutcome::new(task.name, result)
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in join_all(handles).await {
            outcomes.push(handle.context("placement task panicked")?);
        }
        outcomes
    } else {
        let mut outcomes = Vec::with_capacity(task_file.tasks.len());
        for task in task_file.tasks {
            let result = scheduler.schedule_raw(&task.resources).await;
            outcomes.push(TaskOutcome::new(task.name, result));
        }
        outcomes
    };

    for node in scheduler.cluster().snapshot().await {
        if !node.allocated.fits_within(&node.capacity) {
            bail!("node {} overcommitted after simulation", node.id);
        }
    }

    if json {
        return print_json(&outcomes);
    }

    println!(
        "{:<24} {:<10} {:<20} {:<40}",
        "TASK", "RESULT", "NODE", "DETAIL"
    );
    println!("{}", "-".repeat(100));
    for outcome in &outcomes {
        let (result, node, detail) = match (&outcome.decision, &outcome.error) {
            (Some(d), _) if d.accepted => (
                "Placed".to_string(),
                d.node_id.clone().unwrap_or_default(),
                d.allocation_id.map(|id| id.to_string()).unwrap_or_default(),
            ),
            (Some(d), _) => (
                d.reason.map(|r| r.to_string()).unwrap_or_default(),
                "-".to_string(),
                d.detail.clone().unwrap_or_default(),
            ),
            (None, Some(e)) => ("Error".to_string(), "-".to_string(), e.clone()),
            (None, None) => ("Error".to_string(), "-".to_string(), String::new()),
        };
        println!("{:<24} {:<10} {:<20} {:<40}", outcome.task, result, node, detail);
    }

    let placed = outcomes.iter().filter(|o| o.accepted()).count();
    println!();
    println!("{} of {} tasks placed", placed, outcomes.len());

    println!();
    println!(
        "{:<20} {:<12} {:<12} {:<30}",
        "NODE", "CPU", "MEMORY", "ACCELERATORS"
    );
    println!("{}", "-".repeat(76));
    for node in scheduler.cluster().snapshot().await {
        let accelerators: Vec<String> = node
            .capacity
            .accelerators
            .iter()
            .map(|(name, total)| {
                format!("{}={}/{}", name, node.allocated.accelerator(name), total)
            })
            .collect();
        println!(
            "{:<20} {:<12} {:<12} {:<30}",
            node.id,
            format!("{}/{}m", node.allocated.cpu_millis, node.capacity.cpu_millis),
            format!(
                "{}/{}Mi",
                node.allocated.memory_bytes >> 20,
                node.capacity.memory_bytes >> 20
            ),
            accelerators.join(","),
        );
    }

    Ok(())
}
