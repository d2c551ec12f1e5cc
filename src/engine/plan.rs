use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::background::{Background, SEQUENTIAL_ROUTINE};
use crate::reporter::Reporter;
use crate::script::{Composable, Group, Segment};

use super::assembler::Assembler;
use super::flow::FlowControl;
use super::Next;

/// Reporter settings of a schedule; the writer starts when the plan runs.
#[derive(Debug, Default)]
pub struct ReporterSetup {
    pub path: Option<PathBuf>,
    pub format: Option<Segment>,
    pub templates: HashMap<String, Segment>,
}

/// Runtime owner of one schedule.
#[derive(Debug)]
pub struct Plan {
    name: String,
    background: Background,
    assembler: Arc<Assembler>,
    concurrency: usize,
    count: u64,
    pre_process: Group,
    post_process: Group,
    reporter: Option<ReporterSetup>,
}

impl Plan {
    pub fn new(name: impl Into<String>, background: Background, assembler: Assembler) -> Self {
        Self {
            name: name.into(),
            background,
            assembler: Arc::new(assembler),
            concurrency: 1,
            count: 0,
            pre_process: Group::default(),
            post_process: Group::default(),
            reporter: None,
        }
    }

    /// Concurrency below one runs sequentially.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Total iterations across all workers; zero runs until a feed ends.
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn with_flow_control(mut self, flow_control: Option<FlowControl>) -> Self {
        self.background = self
            .background
            .with_flow_control(flow_control.map(Arc::new));
        self
    }

    pub fn with_pre_process(mut self, segments: Vec<Arc<dyn Composable>>) -> Self {
        self.pre_process = Group::new(segments);
        self
    }

    pub fn with_post_process(mut self, segments: Vec<Arc<dyn Composable>>) -> Self {
        self.post_process = Group::new(segments);
        self
    }

    pub fn with_reporter(mut self, reporter: Option<ReporterSetup>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn background(&self) -> &Background {
        &self.background
    }

    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    /// Drive the schedule to its decision. `stop` is the run-wide flag; it is
    /// raised here when the plan ends with `AbortAll`.
    pub async fn run(&mut self, stop: &Arc<AtomicBool>) -> Next {
        let reporter = match self.start_reporter() {
            Ok(reporter) => reporter,
            Err(err) => {
                tracing::error!(schedule = %self.name, error = %err, "cannot start reporter");
                return Next::AbortPlan;
            }
        };
        self.background.set_reporter(reporter.clone());

        let decision = match self.pre_process.compose(&mut self.background) {
            Ok(_) => {
                let decision = if self.concurrency <= 1 {
                    self.run_sequential(stop).await
                } else {
                    self.run_concurrent(stop).await
                };
                if let Err(err) = self.post_process.compose(&mut self.background) {
                    tracing::warn!(schedule = %self.name, error = %err, "post-process failed");
                }
                decision
            }
            Err(err) => {
                tracing::error!(schedule = %self.name, error = %err, "pre-process failed");
                Next::AbortPlan
            }
        };

        if decision == Next::AbortAll {
            stop.store(true, Ordering::SeqCst);
        }
        self.finish(reporter.as_deref());
        decision
    }

    fn start_reporter(&mut self) -> std::io::Result<Option<Arc<Reporter>>> {
        let Some(setup) = self.reporter.take() else {
            return Ok(None);
        };
        let reporter = Reporter::start(setup.path.as_deref(), setup.format, setup.templates)?;
        tracing::debug!(schedule = %self.name, destination = reporter.destination(), "reporter started");
        Ok(Some(Arc::new(reporter)))
    }

    async fn run_sequential(&self, stop: &Arc<AtomicBool>) -> Next {
        let mut bg = self.background.dup();
        let mut sequence = 0u64;
        loop {
            if stop.load(Ordering::SeqCst) {
                return Next::AbortPlan;
            }
            sequence += 1;
            if self.count > 0 && sequence > self.count {
                return Next::Finished;
            }
            bg.next(sequence, SEQUENTIAL_ROUTINE);
            let decision = self.assembler.run(&mut bg).await;
            if decision != Next::Continue {
                return decision;
            }
        }
    }

    async fn run_concurrent(&self, stop: &Arc<AtomicBool>) -> Next {
        let sequence = Arc::new(AtomicU64::new(0));
        let plan_stop = Arc::new(AtomicBool::new(false));
        let (decision_tx, mut decision_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(self.concurrency);
        for routine in 0..self.concurrency {
            let mut bg = self.background.dup();
            let assembler = self.assembler.clone();
            let sequence = sequence.clone();
            let plan_stop = plan_stop.clone();
            let run_stop = stop.clone();
            let decision_tx = decision_tx.clone();
            let count = self.count;

            let handle = tokio::spawn(async move {
                loop {
                    if plan_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if run_stop.load(Ordering::SeqCst) {
                        let _ = decision_tx.send(Next::AbortPlan);
                        break;
                    }
                    let seq = sequence.fetch_add(1, Ordering::SeqCst) + 1;
                    if count > 0 && seq > count {
                        break;
                    }
                    bg.next(seq, routine as i64);
                    match assembler.run(&mut bg).await {
                        Next::Continue => {}
                        Next::Finished => break,
                        decision => {
                            plan_stop.store(true, Ordering::SeqCst);
                            let _ = decision_tx.send(decision);
                            break;
                        }
                    }
                }
            });
            handles.push(handle);
        }
        drop(decision_tx);

        let mut crashed = false;
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(schedule = %self.name, error = %err, "plan worker crashed");
                crashed = true;
            }
        }

        let first = decision_rx.recv().await;
        match first {
            Some(decision) => decision,
            None if crashed => Next::AbortPlan,
            None => Next::Finished,
        }
    }

    fn finish(&self, reporter: Option<&Reporter>) {
        for runner in self.assembler.runners() {
            if let Some(marker) = runner.marker() {
                tracing::info!(
                    schedule = %self.name,
                    test = runner.name(),
                    "latency {}",
                    marker.summary()
                );
            }
        }
        self.assembler.close();
        self.pre_process.close();
        self.post_process.close();
        if let Some(reporter) = reporter {
            reporter.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_assembler_runs_count_iterations() {
        let mut plan = Plan::new("empty", Background::new("empty"), Assembler::default())
            .with_concurrency(4)
            .with_count(50);
        let stop = Arc::new(AtomicBool::new(false));
        assert_eq!(plan.run(&stop).await, Next::Finished);
        assert!(!stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pre_and_post_process_run_on_root_background() {
        let pre = crate::script::compile_segments(&["`env -w -g -c ready STATE`".to_string()]).unwrap();
        let post = crate::script::compile_segments(&["`echo done | env -w -g STATE`".to_string()]).unwrap();
        let mut plan = Plan::new("hooks", Background::new("hooks"), Assembler::default())
            .with_count(3)
            .with_pre_process(pre)
            .with_post_process(post);
        let stop = Arc::new(AtomicBool::new(false));
        assert_eq!(plan.run(&stop).await, Next::Finished);
        assert_eq!(plan.background().get_global("STATE"), "done");
    }

    #[tokio::test]
    async fn failing_pre_process_aborts_plan() {
        let pre = crate::script::compile_segments(&["`assert 1 == 0`".to_string()]).unwrap();
        let mut plan = Plan::new("broken", Background::new("broken"), Assembler::default())
            .with_count(1)
            .with_pre_process(pre);
        assert_eq!(plan.run(&Arc::new(AtomicBool::new(false))).await, Next::AbortPlan);
    }

    #[tokio::test]
    async fn raised_run_stop_aborts_before_first_iteration() {
        let mut plan = Plan::new("late", Background::new("late"), Assembler::default()).with_count(10);
        let stop = Arc::new(AtomicBool::new(true));
        assert_eq!(plan.run(&stop).await, Next::AbortPlan);
    }
}
