//! The test engine capability a session drives.
//!
//! A fresh engine is created for every discover or run request through a
//! [`TestEngineFactory`], and dropped when the request's scope is disposed.

pub mod manifest;

use async_trait::async_trait;

use crate::context::ExecutionContext;
use crate::protocol::{Artifact, TestRef};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine stopped because its cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which tests a request applies to. Both criteria must match when both
/// are present; an empty selection matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSelection {
    pub uids: Option<Vec<String>>,
    pub pattern: Option<String>,
}

impl TestSelection {
    pub fn new(tests: Option<Vec<TestRef>>, filter: Option<String>) -> Self {
        Self {
            uids: tests.map(|refs| refs.into_iter().map(|r| r.uid).collect()),
            pattern: filter.filter(|f| !f.is_empty()),
        }
    }

    pub fn matches(&self, uid: &str) -> bool {
        if let Some(uids) = &self.uids {
            if !uids.iter().any(|u| u == uid) {
                return false;
            }
        }
        match &self.pattern {
            Some(pattern) => wildcard_match(pattern, uid),
            None => true,
        }
    }
}

/// Match `text` against a pattern where `*` stands for any run of
/// characters. Everything else matches literally.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryMetrics {
    pub discovered: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMetrics {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub metrics: RunMetrics,
    pub artifacts: Vec<Artifact>,
}

#[async_trait]
pub trait TestEngine: Send + Sync {
    /// Enumerate matching tests, reporting each as it is found.
    async fn discover(
        &self,
        selection: &TestSelection,
        ctx: &ExecutionContext,
    ) -> Result<DiscoveryMetrics, EngineError>;

    /// Execute matching tests, reporting progress and outcomes.
    async fn run(
        &self,
        selection: &TestSelection,
        ctx: &ExecutionContext,
    ) -> Result<RunReport, EngineError>;
}

pub trait TestEngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn TestEngine>, EngineError>;
}
