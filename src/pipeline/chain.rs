use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::{Instrument, info_span};

use super::context::{PipelineContext, PipelineStep};
use super::helper::{Helper, HelperArgs, HelperStage};
use crate::error::PipelineError;
use crate::observability::MetricsCollector;

/// Runs an ordered helper list against one stage. A helper may await
/// [`HelperArgs::next`] to run everything downstream before it continues;
/// each helper still runs at most once per chain.
pub(crate) struct HelperChain<'c> {
    helpers: &'c [(usize, Helper)],
    context: &'c PipelineContext,
    metrics: &'c MetricsCollector,
    steps: Mutex<Vec<PipelineStep>>,
    visited: Mutex<Vec<bool>>,
}

/// Continuation handed to a helper through its args.
pub(crate) struct Next<'a> {
    chain: &'a HelperChain<'a>,
    position: usize,
    called: bool,
}

impl Next<'_> {
    pub(crate) fn run<'s>(&'s mut self, stage: HelperStage<'s>) -> Option<BoxFuture<'s, Result<()>>> {
        if self.called {
            return None;
        }
        self.called = true;
        Some(self.chain.run_from(self.position + 1, stage))
    }
}

impl<'c> HelperChain<'c> {
    pub(crate) fn new(
        helpers: &'c [(usize, Helper)],
        context: &'c PipelineContext,
        metrics: &'c MetricsCollector,
        steps: Vec<PipelineStep>,
    ) -> Self {
        Self {
            helpers,
            context,
            metrics,
            steps: Mutex::new(steps),
            visited: Mutex::new(vec![false; helpers.len()]),
        }
    }

    pub(crate) async fn run(&self, stage: HelperStage<'_>) -> Result<()> {
        self.run_from(0, stage).await
    }

    pub(crate) fn into_steps(self) -> Vec<PipelineStep> {
        self.steps.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_from<'s>(&'s self, start: usize, mut stage: HelperStage<'s>) -> BoxFuture<'s, Result<()>> {
        Box::pin(async move {
            for position in start..self.helpers.len() {
                if !self.claim(position) {
                    continue;
                }
                let (index, helper) = &self.helpers[position];
                let step = self.record_step(*index, helper);
                let args = HelperArgs {
                    context: self.context,
                    reporter: self.context.reporter.as_ref(),
                    stage: stage.reborrow(),
                    next: Next {
                        chain: self,
                        position,
                        called: false,
                    },
                };
                let duration_ms = self.invoke(helper, args).await?;
                self.lock_steps()[step].duration_ms = duration_ms;
            }
            Ok(())
        })
    }

    /// Mark a position visited. False when it already ran.
    fn claim(&self, position: usize) -> bool {
        let mut visited = self.visited.lock().unwrap_or_else(PoisonError::into_inner);
        !std::mem::replace(&mut visited[position], true)
    }

    fn lock_steps(&self) -> MutexGuard<'_, Vec<PipelineStep>> {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_step(&self, index: usize, helper: &Helper) -> usize {
        let mut steps = self.lock_steps();
        steps.push(PipelineStep {
            id: format!("{}#{index}", helper.id()),
            index,
            key: helper.key().to_string(),
            kind: helper.kind(),
            priority: helper.priority(),
            depends_on: helper.dependencies().to_vec(),
            origin: helper.origin().map(str::to_string),
            duration_ms: 0.0,
        });
        steps.len() - 1
    }

    /// Run one helper, returning its duration in milliseconds. Failures keep
    /// the helper's own error as root cause under a `HelperExecution` context.
    /// An error that already names a downstream helper passes through as is.
    async fn invoke(&self, helper: &Helper, args: HelperArgs<'_>) -> Result<f64> {
        let span = info_span!("helper", kind = %helper.kind(), key = helper.key());
        let timer = self.metrics.start_helper(helper.kind(), helper.key());
        let outcome = helper.invoke(args).instrument(span).await;
        let duration_ms = timer.finish();
        outcome.map_err(|err| {
            if matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::HelperExecution { .. })
            ) {
                return err;
            }
            err.context(PipelineError::HelperExecution {
                kind: helper.kind(),
                key: helper.key().to_string(),
            })
        })?;
        Ok(duration_ms)
    }
}
