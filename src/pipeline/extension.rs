//! Pipeline extensions.
//!
//! An extension is registered once. Its registration function may add
//! helpers immediately and may hand back a hook that runs after fragment
//! helpers finish and before builder helpers start. Registration can also be
//! asynchronous; pending registrations are awaited together at the start of
//! the next run and their outcomes are applied in registration order.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::future::{self, BoxFuture};

use super::PipelineHandle;
use super::context::{Artifact, BuildOptions, GenerationPhase, PipelineContext};
use crate::reporter::Reporter;

pub type HookCallback = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Where in the hook chain an invocation sits.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle<'a> {
    pub extension: &'a str,
    pub position: usize,
    pub phase: GenerationPhase,
}

pub struct HookArgs<'a> {
    pub context: &'a PipelineContext,
    pub options: &'a BuildOptions,
    pub artifact: &'a Artifact,
    pub lifecycle: Lifecycle<'a>,
}

/// What a hook hands back: an optional replacement artifact plus callbacks
/// run once the builders succeed (`commit`) or after a later failure
/// (`rollback`).
#[derive(Default)]
pub struct HookResult {
    pub artifact: Option<Artifact>,
    pub commit: Option<HookCallback>,
    pub rollback: Option<HookCallback>,
}

impl HookResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn replace(artifact: Artifact) -> Self {
        Self {
            artifact: Some(artifact),
            ..Self::default()
        }
    }

    pub fn on_commit<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.commit = Some(Box::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(callback())
        }));
        self
    }

    pub fn on_rollback<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.rollback = Some(Box::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(callback())
        }));
        self
    }
}

impl fmt::Debug for HookResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookResult")
            .field("artifact", &self.artifact)
            .field("commit", &self.commit.is_some())
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}

pub trait HookFn: Send + Sync {
    fn call<'a>(&'a self, args: HookArgs<'a>) -> BoxFuture<'a, Result<HookResult>>;
}

struct AsyncHook<F>(F);

impl<F> HookFn for AsyncHook<F>
where
    F: for<'a> Fn(HookArgs<'a>) -> BoxFuture<'a, Result<HookResult>> + Send + Sync,
{
    fn call<'a>(&'a self, args: HookArgs<'a>) -> BoxFuture<'a, Result<HookResult>> {
        (self.0)(args)
    }
}

struct SyncHook<F>(F);

impl<F> HookFn for SyncHook<F>
where
    F: Fn(HookArgs<'_>) -> Result<HookResult> + Send + Sync,
{
    fn call<'a>(&'a self, args: HookArgs<'a>) -> BoxFuture<'a, Result<HookResult>> {
        Box::pin(future::ready((self.0)(args)))
    }
}

#[derive(Clone)]
pub struct ExtensionHook(Arc<dyn HookFn>);

impl ExtensionHook {
    pub fn new<F>(hook: F) -> Self
    where
        F: for<'a> Fn(HookArgs<'a>) -> BoxFuture<'a, Result<HookResult>> + Send + Sync + 'static,
    {
        Self(Arc::new(AsyncHook(hook)))
    }

    pub fn sync<F>(hook: F) -> Self
    where
        F: Fn(HookArgs<'_>) -> Result<HookResult> + Send + Sync + 'static,
    {
        Self(Arc::new(SyncHook(hook)))
    }

    pub fn call<'a>(&'a self, args: HookArgs<'a>) -> BoxFuture<'a, Result<HookResult>> {
        self.0.call(args)
    }
}

impl fmt::Debug for ExtensionHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExtensionHook")
    }
}

pub type PendingRegistration = BoxFuture<'static, Result<Option<ExtensionHook>>>;

pub enum ExtensionRegistration {
    /// Registered helpers only; no hook.
    Done,
    Hook(ExtensionHook),
    Pending(PendingRegistration),
}

impl ExtensionRegistration {
    pub fn pending<Fut>(registration: Fut) -> Self
    where
        Fut: Future<Output = Result<Option<ExtensionHook>>> + Send + 'static,
    {
        ExtensionRegistration::Pending(Box::pin(registration))
    }
}

type RegisterFn = Box<dyn FnOnce(PipelineHandle) -> Result<ExtensionRegistration> + Send>;

pub struct PipelineExtension {
    key: String,
    register: RegisterFn,
}

impl PipelineExtension {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn into_parts(self) -> (String, RegisterFn) {
        (self.key, self.register)
    }
}

impl fmt::Debug for PipelineExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineExtension")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Custom form: the register function decides what to hand back.
pub fn create_pipeline_extension<F>(key: impl Into<String>, register: F) -> PipelineExtension
where
    F: FnOnce(PipelineHandle) -> Result<ExtensionRegistration> + Send + 'static,
{
    PipelineExtension {
        key: key.into(),
        register: Box::new(register),
    }
}

type SetupFn = Box<dyn FnOnce(PipelineHandle) -> BoxFuture<'static, Result<()>> + Send>;

/// Sugar form: an optional async setup step followed by an optional hook.
/// With a setup step the registration is always pending.
pub struct ExtensionBuilder {
    key: String,
    setup: Option<SetupFn>,
    hook: Option<ExtensionHook>,
}

impl ExtensionBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            setup: None,
            hook: None,
        }
    }

    pub fn setup<F, Fut>(mut self, setup: F) -> Self
    where
        F: FnOnce(PipelineHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.setup = Some(Box::new(
            move |handle| -> BoxFuture<'static, Result<()>> { Box::pin(setup(handle)) },
        ));
        self
    }

    pub fn hook(mut self, hook: ExtensionHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn build(self) -> PipelineExtension {
        let ExtensionBuilder { key, setup, hook } = self;
        create_pipeline_extension(key, move |handle| {
            Ok(match (setup, hook) {
                (Some(setup), hook) => ExtensionRegistration::pending(async move {
                    setup(handle).await?;
                    Ok::<_, anyhow::Error>(hook)
                }),
                (None, Some(hook)) => ExtensionRegistration::Hook(hook),
                (None, None) => ExtensionRegistration::Done,
            })
        })
    }
}

/// Commit and rollback callbacks collected from hooks that already ran.
#[derive(Default)]
pub(crate) struct HookTransaction {
    entries: Vec<(String, HookResultCallbacks)>,
}

struct HookResultCallbacks {
    commit: Option<HookCallback>,
    rollback: Option<HookCallback>,
}

impl HookTransaction {
    pub(crate) fn push(
        &mut self,
        extension: &str,
        commit: Option<HookCallback>,
        rollback: Option<HookCallback>,
    ) {
        self.entries.push((
            extension.to_string(),
            HookResultCallbacks { commit, rollback },
        ));
    }

    /// Run commit callbacks in hook order. On the first failure every hook
    /// is rolled back in reverse order and that failure is returned.
    pub(crate) async fn commit(mut self, reporter: &dyn Reporter) -> Result<()> {
        let mut failure = None;
        for (extension, callbacks) in &mut self.entries {
            let Some(commit) = callbacks.commit.take() else {
                continue;
            };
            tracing::debug!(extension = extension.as_str(), "Committing extension hook");
            if let Err(err) = commit().await {
                tracing::debug!(extension = extension.as_str(), "Extension commit failed");
                failure = Some(err);
                break;
            }
        }
        match failure {
            Some(err) => {
                self.rollback(reporter).await;
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Run rollback callbacks in reverse hook order. Failures are reported
    /// and do not stop the remaining rollbacks.
    pub(crate) async fn rollback(self, reporter: &dyn Reporter) {
        for (extension, callbacks) in self.entries.into_iter().rev() {
            let Some(rollback) = callbacks.rollback else {
                continue;
            };
            if let Err(err) = rollback().await {
                reporter.warn(
                    &format!("Rollback for extension '{extension}' failed: {err:#}"),
                    None,
                );
            }
        }
    }
}
