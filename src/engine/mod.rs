//! # Engine
//!
//! Schedules compiled from a configuration become [`plan::Plan`]s. Each plan
//! owns an [`assembler::Assembler`] of [`runner::Runner`]s; a runner asks its
//! provider for request material, sends it, and hands the response to its
//! consumer. Every step answers with a [`Next`] decision.

pub mod assembler;
pub mod consumer;
pub mod flow;
pub mod http;
pub mod latency;
pub mod plan;
pub mod provider;
pub mod runner;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::EngineError;
use plan::Plan;

/// Run blocking work from script code. On a multi-thread runtime the
/// worker hands its other tasks off first; elsewhere `f` runs inline.
pub(crate) fn blocking<R>(f: impl FnOnce() -> R) -> R {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Progression decision of a runner, assembler or plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    AbortPlan,
    AbortAll,
    Finished,
}

impl fmt::Display for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Next::Continue => "continue",
            Next::AbortPlan => "abort-plan",
            Next::AbortAll => "abort-all",
            Next::Finished => "finished",
        })
    }
}

/// How the schedules of one configuration are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// One schedule after another.
    #[default]
    Pipe,
    /// Every schedule at once.
    Concurrent,
}

/// Outcome of one schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub schedule: String,
    pub decision: Next,
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        self.decision == Next::Finished
    }
}

#[derive(Debug)]
pub struct Engine {
    mode: RunMode,
    plans: Vec<Plan>,
}

impl Engine {
    pub fn new(mode: RunMode, plans: Vec<Plan>) -> Self {
        Self { mode, plans }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub async fn run(self) -> Vec<Outcome> {
        let stop = Arc::new(AtomicBool::new(false));
        let outcomes = match self.mode {
            RunMode::Pipe => run_piped(self.plans, &stop).await,
            RunMode::Concurrent => run_concurrent(self.plans, &stop).await,
        };
        for outcome in &outcomes {
            if outcome.succeeded() {
                tracing::info!("schedule {}: success", outcome.schedule);
            } else {
                tracing::warn!("schedule {}: fail ({})", outcome.schedule, outcome.decision);
            }
        }
        outcomes
    }

    /// Like [`Engine::run`], but any schedule that did not finish cleanly
    /// turns into [`EngineError::Failed`].
    pub async fn run_checked(self) -> Result<Vec<Outcome>, EngineError> {
        let outcomes = self.run().await;
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|outcome| !outcome.succeeded())
            .map(|outcome| outcome.schedule.clone())
            .collect();
        if failed.is_empty() {
            Ok(outcomes)
        } else {
            Err(EngineError::Failed(failed))
        }
    }
}

fn log_start(plan: &Plan) {
    tracing::info!(
        schedule = plan.name(),
        concurrency = plan.concurrency(),
        count = plan.count(),
        "schedule started"
    );
}

async fn run_piped(plans: Vec<Plan>, stop: &Arc<AtomicBool>) -> Vec<Outcome> {
    let mut outcomes = Vec::with_capacity(plans.len());
    let mut plans = plans.into_iter();
    while let Some(mut plan) = plans.next() {
        log_start(&plan);
        let decision = plan.run(stop).await;
        outcomes.push(Outcome {
            schedule: plan.name().to_string(),
            decision,
        });
        if decision == Next::AbortAll {
            let skipped: Vec<String> = plans.by_ref().map(|plan| plan.name().to_string()).collect();
            if !skipped.is_empty() {
                tracing::error!(skipped = %skipped.join(", "), "run aborted");
            }
            break;
        }
    }
    outcomes
}

async fn run_concurrent(plans: Vec<Plan>, stop: &Arc<AtomicBool>) -> Vec<Outcome> {
    let mut handles = Vec::with_capacity(plans.len());
    for mut plan in plans {
        let stop = stop.clone();
        let name = plan.name().to_string();
        let handle = tokio::spawn(async move {
            log_start(&plan);
            plan.run(&stop).await
        });
        handles.push((name, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (schedule, handle) in handles {
        let decision = match handle.await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::error!(%schedule, error = %err, "schedule crashed");
                Next::AbortPlan
            }
        };
        outcomes.push(Outcome { schedule, decision });
    }
    outcomes
}
