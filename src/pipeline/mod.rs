//! Helper pipeline: fragment helpers assemble an IR draft, extension hooks
//! observe or replace the finalized artifact, builder helpers turn it into
//! queued file actions.

mod chain;
pub mod context;
pub mod extension;
pub mod graph;
pub mod helper;
pub mod registry;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::Result;
use futures::future::join_all;
use tracing::{Instrument, debug, info, info_span};

use crate::error::PipelineError;
use crate::observability::{MetricsCollector, log_snapshot};

use chain::HelperChain;

pub use context::{
    Artifact, BuildOptions, BuilderOutput, Draft, GenerationPhase, OutputAction,
    PipelineContext, PipelineDiagnostic, PipelineRunContext, PipelineRunResult, PipelineStep,
    RunOptions,
};
pub use extension::{
    ExtensionBuilder, ExtensionHook, ExtensionRegistration, HookArgs, HookResult, Lifecycle,
    PipelineExtension, create_pipeline_extension,
};
pub use graph::{DependencyGraph, GraphNode};
pub use helper::{
    Helper, HelperApply, HelperArgs, HelperBuilder, HelperKind, HelperStage, builder_helper,
    create_helper, fragment_helper,
};
pub use registry::HelperRegistry;

use extension::{HookTransaction, PendingRegistration};

enum ExtensionState {
    Resolved(Option<ExtensionHook>),
    Pending(PendingRegistration),
}

struct ExtensionSlot {
    key: String,
    state: ExtensionState,
}

struct PipelineState {
    fragments: HelperRegistry,
    builders: HelperRegistry,
    extensions: Vec<ExtensionSlot>,
}

/// Cheap, clonable access to a pipeline's registries. Extensions receive
/// one during registration.
#[derive(Clone)]
pub struct PipelineHandle {
    state: Arc<Mutex<PipelineState>>,
}

impl PipelineHandle {
    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fragments(&self) -> Helpers {
        Helpers {
            handle: self.clone(),
            kind: HelperKind::Fragment,
        }
    }

    pub fn builders(&self) -> Helpers {
        Helpers {
            handle: self.clone(),
            kind: HelperKind::Builder,
        }
    }

    pub fn extensions(&self) -> Extensions {
        Extensions {
            handle: self.clone(),
        }
    }
}

/// Registration surface for one helper kind.
pub struct Helpers {
    handle: PipelineHandle,
    kind: HelperKind,
}

impl Helpers {
    pub fn register(&self, helper: Helper) -> Result<(), PipelineError> {
        let mut state = self.handle.lock();
        match self.kind {
            HelperKind::Fragment => state.fragments.register(helper),
            HelperKind::Builder => state.builders.register(helper),
        }
    }

    pub fn known_helpers(&self) -> Vec<String> {
        let state = self.handle.lock();
        match self.kind {
            HelperKind::Fragment => state.fragments.known_helpers(),
            HelperKind::Builder => state.builders.known_helpers(),
        }
    }

    pub fn len(&self) -> usize {
        self.known_helpers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Extensions {
    handle: PipelineHandle,
}

impl Extensions {
    /// Run the extension's register function now. Helpers it registers are
    /// visible immediately; a pending registration resolves on the next run.
    pub fn register(&self, extension: PipelineExtension) -> Result<()> {
        let (key, register) = extension.into_parts();
        let registration = register(self.handle.clone())?;
        let state = match registration {
            ExtensionRegistration::Done => ExtensionState::Resolved(None),
            ExtensionRegistration::Hook(hook) => ExtensionState::Resolved(Some(hook)),
            ExtensionRegistration::Pending(pending) => ExtensionState::Pending(pending),
        };
        debug!(extension = key.as_str(), "Registered pipeline extension");
        self.handle
            .lock()
            .extensions
            .push(ExtensionSlot { key, state });
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.handle
            .lock()
            .extensions
            .iter()
            .map(|slot| slot.key.clone())
            .collect()
    }
}

pub struct Pipeline {
    handle: PipelineHandle,
    metrics: MetricsCollector,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            handle: PipelineHandle {
                state: Arc::new(Mutex::new(PipelineState {
                    fragments: HelperRegistry::new(HelperKind::Fragment),
                    builders: HelperRegistry::new(HelperKind::Builder),
                    extensions: Vec::new(),
                })),
            },
            metrics: MetricsCollector::new(),
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    pub fn fragments(&self) -> Helpers {
        self.handle.fragments()
    }

    pub fn builders(&self) -> Helpers {
        self.handle.builders()
    }

    pub fn extensions(&self) -> Extensions {
        self.handle.extensions()
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub async fn run(&self, options: RunOptions) -> Result<PipelineRunResult> {
        let span = info_span!("pipeline_run", phase = ?options.phase);
        let started = Instant::now();
        let result = async {
            self.resolve_pending_extensions().await?;
            self.execute(options).await
        }
        .instrument(span)
        .await;
        self.metrics.record_run(started.elapsed(), result.is_ok());
        log_snapshot(&self.metrics.snapshot());
        result
    }

    /// Await every pending registration together, then apply outcomes in
    /// registration order. The first failure is returned unchanged.
    async fn resolve_pending_extensions(&self) -> Result<()> {
        let pending: Vec<(usize, PendingRegistration)> = {
            let mut state = self.handle.lock();
            let mut pending = Vec::new();
            for (idx, slot) in state.extensions.iter_mut().enumerate() {
                if matches!(slot.state, ExtensionState::Pending(_)) {
                    let previous =
                        std::mem::replace(&mut slot.state, ExtensionState::Resolved(None));
                    if let ExtensionState::Pending(future) = previous {
                        pending.push((idx, future));
                    }
                }
            }
            pending
        };
        if pending.is_empty() {
            return Ok(());
        }

        let (indices, futures): (Vec<usize>, Vec<PendingRegistration>) =
            pending.into_iter().unzip();
        let outcomes = join_all(futures).await;

        let mut first_error = None;
        let mut state = self.handle.lock();
        for (idx, outcome) in indices.into_iter().zip(outcomes) {
            match outcome {
                Ok(hook) => state.extensions[idx].state = ExtensionState::Resolved(hook),
                Err(err) => {
                    debug!(
                        extension = state.extensions[idx].key.as_str(),
                        "Extension registration failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        drop(state);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn execute(&self, options: RunOptions) -> Result<PipelineRunResult> {
        let (fragments, builders, hooks) = {
            let state = self.handle.lock();
            let hooks: Vec<(String, ExtensionHook)> = state
                .extensions
                .iter()
                .filter_map(|slot| match &slot.state {
                    ExtensionState::Resolved(Some(hook)) => Some((slot.key.clone(), hook.clone())),
                    _ => None,
                })
                .collect();
            (state.fragments.clone(), state.builders.clone(), hooks)
        };

        let PipelineRunContext {
            context,
            build,
            mut draft,
            steps,
            mut diagnostics,
        } = PipelineRunContext::new(options);
        let ordered = fragments.ordered(&mut diagnostics)?;
        let chain = HelperChain::new(&ordered, &context, &self.metrics, steps);
        chain
            .run(HelperStage::Fragment { draft: &mut draft })
            .await?;
        let steps = chain.into_steps();

        let mut artifact = draft.finalize(&build);
        let mut transaction = HookTransaction::default();
        for (position, (key, hook)) in hooks.iter().enumerate() {
            let args = HookArgs {
                context: &context,
                options: &build,
                artifact: &artifact,
                lifecycle: Lifecycle {
                    extension: key,
                    position,
                    phase: context.phase,
                },
            };
            let span = info_span!("extension_hook", extension = key.as_str(), position);
            match hook.call(args).instrument(span).await {
                Ok(HookResult {
                    artifact: replacement,
                    commit,
                    rollback,
                }) => {
                    if let Some(replacement) = replacement {
                        debug!(extension = key.as_str(), "Extension replaced the artifact");
                        artifact = replacement;
                    }
                    transaction.push(key, commit, rollback);
                }
                Err(err) => {
                    transaction.rollback(context.reporter.as_ref()).await;
                    return Err(err);
                }
            }
        }

        let mut output = BuilderOutput::default();
        let built: Result<Vec<PipelineStep>> = async {
            let ordered = builders.ordered(&mut diagnostics)?;
            let chain = HelperChain::new(&ordered, &context, &self.metrics, steps);
            chain
                .run(HelperStage::Builder {
                    artifact: &mut artifact,
                    output: &mut output,
                })
                .await?;
            Ok(chain.into_steps())
        }
        .await;
        let steps = match built {
            Ok(steps) => steps,
            Err(err) => {
                transaction.rollback(context.reporter.as_ref()).await;
                return Err(err);
            }
        };
        transaction.commit(context.reporter.as_ref()).await?;

        for diagnostic in &diagnostics {
            context.reporter.warn(diagnostic.message(), None);
        }
        info!(
            steps = steps.len(),
            actions = output.actions().len(),
            diagnostics = diagnostics.len(),
            fingerprint = %artifact.fingerprint(),
            "Pipeline run completed"
        );
        Ok(PipelineRunResult {
            artifact,
            diagnostics,
            steps,
            actions: output.into_actions(),
        })
    }
}
