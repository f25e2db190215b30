#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use kernelgen::Workspace;
use kernelgen::reporter::Reporter;
use kernelgen::pipeline::RunOptions;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub level: &'static str,
    pub namespace: String,
    pub message: String,
}

/// Reporter that keeps every message for later assertions.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    namespace: String,
    messages: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Recorded> {
        self.messages.lock().unwrap().clone()
    }

    pub fn at(&self, level: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.level == level)
            .map(|m| m.message)
            .collect()
    }

    fn push(&self, level: &'static str, message: &str) {
        self.messages.lock().unwrap().push(Recorded {
            level,
            namespace: self.namespace.clone(),
            message: message.to_string(),
        });
    }
}

impl Reporter for RecordingReporter {
    fn info(&self, message: &str, _context: Option<&Value>) {
        self.push("info", message);
    }

    fn warn(&self, message: &str, _context: Option<&Value>) {
        self.push("warn", message);
    }

    fn error(&self, message: &str, _context: Option<&Value>) {
        self.push("error", message);
    }

    fn debug(&self, message: &str, _context: Option<&Value>) {
        self.push("debug", message);
    }

    fn child(&self, namespace: &str) -> Arc<dyn Reporter> {
        Arc::new(RecordingReporter {
            namespace: format!("{}.{}", self.namespace, namespace),
            messages: self.messages.clone(),
        })
    }
}

pub fn open_workspace(root: &Path) -> Arc<Workspace> {
    Arc::new(Workspace::open(root).unwrap())
}

pub fn run_options(workspace: Arc<Workspace>, reporter: &RecordingReporter) -> RunOptions {
    RunOptions::new(workspace, Arc::new(reporter.clone()))
}

pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

pub fn read_file(root: &Path, relative: &str) -> Option<String> {
    std::fs::read_to_string(root.join(relative)).ok()
}
