use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Structured logging sink threaded through every helper and hook call.
pub trait Reporter: Send + Sync {
    fn info(&self, message: &str, context: Option<&Value>);
    fn warn(&self, message: &str, context: Option<&Value>);
    fn error(&self, message: &str, context: Option<&Value>);
    fn debug(&self, message: &str, context: Option<&Value>);
    fn child(&self, namespace: &str) -> Arc<dyn Reporter>;
}

/// Reporter backed by `tracing` events; the namespace travels as a field.
#[derive(Debug, Clone)]
pub struct TracingReporter {
    namespace: String,
}

impl TracingReporter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn render_context(context: Option<&Value>) -> String {
    context.map(Value::to_string).unwrap_or_default()
}

impl Reporter for TracingReporter {
    fn info(&self, message: &str, context: Option<&Value>) {
        info!(
            namespace = self.namespace.as_str(),
            context = %render_context(context),
            "{message}"
        );
    }

    fn warn(&self, message: &str, context: Option<&Value>) {
        warn!(
            namespace = self.namespace.as_str(),
            context = %render_context(context),
            "{message}"
        );
    }

    fn error(&self, message: &str, context: Option<&Value>) {
        error!(
            namespace = self.namespace.as_str(),
            context = %render_context(context),
            "{message}"
        );
    }

    fn debug(&self, message: &str, context: Option<&Value>) {
        debug!(
            namespace = self.namespace.as_str(),
            context = %render_context(context),
            "{message}"
        );
    }

    fn child(&self, namespace: &str) -> Arc<dyn Reporter> {
        Arc::new(TracingReporter::new(format!(
            "{}.{}",
            self.namespace, namespace
        )))
    }
}
