use std::fmt;
use std::sync::Arc;

use anyhow::{Result, bail};
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};

use super::chain::Next;
use super::context::{Artifact, BuilderOutput, Draft, PipelineContext};
use crate::reporter::Reporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HelperKind {
    Fragment,
    Builder,
}

impl HelperKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HelperKind::Fragment => "fragment",
            HelperKind::Builder => "builder",
        }
    }
}

impl fmt::Display for HelperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutable state a helper is allowed to touch, depending on its kind.
pub enum HelperStage<'a> {
    Fragment {
        draft: &'a mut Draft,
    },
    Builder {
        artifact: &'a mut Artifact,
        output: &'a mut BuilderOutput,
    },
}

impl HelperStage<'_> {
    pub fn reborrow(&mut self) -> HelperStage<'_> {
        match self {
            HelperStage::Fragment { draft } => HelperStage::Fragment { draft: &mut **draft },
            HelperStage::Builder { artifact, output } => HelperStage::Builder {
                artifact: &mut **artifact,
                output: &mut **output,
            },
        }
    }
}

pub struct HelperArgs<'a> {
    pub context: &'a PipelineContext,
    pub reporter: &'a dyn Reporter,
    pub stage: HelperStage<'a>,
    pub(crate) next: Next<'a>,
}

impl<'a> HelperArgs<'a> {
    /// Run every downstream helper of the same kind now, then return so this
    /// helper can continue. Later calls are no-ops, and downstream helpers are
    /// not run again once this helper returns.
    pub fn next(&mut self) -> BoxFuture<'_, Result<()>> {
        let stage = self.stage.reborrow();
        match self.next.run(stage) {
            Some(downstream) => downstream,
            None => Box::pin(future::ready(Ok(()))),
        }
    }

    pub fn draft(&mut self) -> Result<&mut Draft> {
        match &mut self.stage {
            HelperStage::Fragment { draft } => Ok(&mut **draft),
            HelperStage::Builder { .. } => bail!("builder helpers cannot access the draft"),
        }
    }

    pub fn artifact(&mut self) -> Result<&mut Artifact> {
        self.builder().map(|(artifact, _)| artifact)
    }

    pub fn output(&mut self) -> Result<&mut BuilderOutput> {
        self.builder().map(|(_, output)| output)
    }

    /// Split access to the artifact and the queued output.
    pub fn builder(&mut self) -> Result<(&mut Artifact, &mut BuilderOutput)> {
        match &mut self.stage {
            HelperStage::Builder { artifact, output } => Ok((&mut **artifact, &mut **output)),
            HelperStage::Fragment { .. } => {
                bail!("fragment helpers cannot access the artifact or builder output")
            }
        }
    }
}

pub trait HelperApply: Send + Sync {
    fn apply<'a>(&'a self, args: HelperArgs<'a>) -> BoxFuture<'a, Result<()>>;
}

struct AsyncApply<F>(F);

impl<F> HelperApply for AsyncApply<F>
where
    F: for<'a> Fn(HelperArgs<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    fn apply<'a>(&'a self, args: HelperArgs<'a>) -> BoxFuture<'a, Result<()>> {
        (self.0)(args)
    }
}

struct SyncApply<F>(F);

impl<F> HelperApply for SyncApply<F>
where
    F: Fn(HelperArgs<'_>) -> Result<()> + Send + Sync,
{
    fn apply<'a>(&'a self, args: HelperArgs<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(future::ready((self.0)(args)))
    }
}

/// Immutable helper descriptor. Cloning is cheap; the apply function is shared.
#[derive(Clone)]
pub struct Helper {
    key: String,
    kind: HelperKind,
    priority: i32,
    dependencies: Vec<String>,
    origin: Option<String>,
    apply: Arc<dyn HelperApply>,
}

impl fmt::Debug for Helper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Helper")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl Helper {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> HelperKind {
        self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// `kind:key`, the identity used in metrics and tracing.
    pub fn id(&self) -> String {
        format!("{}:{}", self.kind, self.key)
    }

    pub fn invoke<'a>(&'a self, args: HelperArgs<'a>) -> BoxFuture<'a, Result<()>> {
        self.apply.apply(args)
    }
}

/// Start describing a helper. Finish with one of the `apply*` methods.
pub fn create_helper(key: impl Into<String>, kind: HelperKind) -> HelperBuilder {
    HelperBuilder {
        key: key.into(),
        kind,
        priority: 0,
        dependencies: Vec::new(),
        origin: None,
    }
}

pub fn fragment_helper(key: impl Into<String>) -> HelperBuilder {
    create_helper(key, HelperKind::Fragment)
}

pub fn builder_helper(key: impl Into<String>) -> HelperBuilder {
    create_helper(key, HelperKind::Builder)
}

#[derive(Debug, Clone)]
pub struct HelperBuilder {
    key: String,
    kind: HelperKind,
    priority: i32,
    dependencies: Vec<String>,
    origin: Option<String>,
}

impl HelperBuilder {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn apply<F>(self, apply: F) -> Helper
    where
        F: for<'a> Fn(HelperArgs<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.apply_with(AsyncApply(apply))
    }

    pub fn apply_sync<F>(self, apply: F) -> Helper
    where
        F: Fn(HelperArgs<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.apply_with(SyncApply(apply))
    }

    pub fn apply_with(self, apply: impl HelperApply + 'static) -> Helper {
        Helper {
            key: self.key,
            kind: self.kind,
            priority: self.priority,
            dependencies: self.dependencies,
            origin: self.origin,
            apply: Arc::new(apply),
        }
    }
}
