//! An engine that runs shell commands listed in a TOML manifest.
//!
//! ```toml
//! [[tests]]
//! uid = "math.add"
//! display_name = "adds numbers"
//! command = "test 2 -eq $((1 + 1))"
//! timeout_ms = 5000
//! skip = false
//! artifact = "reports/math.xml"
//! ```
//!
//! Each command runs as its own process group under `sh -c`. Timeouts and
//! cancellation kill the whole group, so processes the command started in
//! the background go down with it.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use super::{
    DiscoveryMetrics, EngineError, RunReport, TestEngine, TestEngineFactory, TestSelection,
};
use crate::context::ExecutionContext;
use crate::protocol::{Artifact, NodeState, TestNode};

/// Longest failure message carried in a node update.
const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub tests: Vec<ManifestTest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestTest {
    pub uid: String,
    pub display_name: Option<String>,
    /// Shell command; exit status 0 passes. No command means the test
    /// always passes.
    pub command: Option<String>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub skip: bool,
    /// File the command leaves behind, reported as a run attachment.
    pub artifact: Option<PathBuf>,
}

impl ManifestTest {
    fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.uid)
    }

    fn node(&self, state: NodeState) -> TestNode {
        TestNode {
            uid: self.uid.clone(),
            display_name: self.display_name().to_string(),
            state,
            duration_ms: None,
            message: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, std::io::Error),
    #[error("Failed to parse manifest {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("duplicate test uid '{0}'")]
    DuplicateUid(String),
    #[error("test uid must not be empty")]
    EmptyUid,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::ReadFailed(path.to_path_buf(), e))?;
        let manifest: Self = toml::from_str(&contents)
            .map_err(|e| ManifestError::ParseFailed(path.to_path_buf(), e))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = HashSet::new();
        for test in &self.tests {
            if test.uid.is_empty() {
                return Err(ManifestError::EmptyUid);
            }
            if !seen.insert(test.uid.as_str()) {
                return Err(ManifestError::DuplicateUid(test.uid.clone()));
            }
        }
        Ok(())
    }

    fn selected<'a>(
        &'a self,
        selection: &'a TestSelection,
    ) -> impl Iterator<Item = &'a ManifestTest> + 'a {
        self.tests.iter().filter(move |t| selection.matches(&t.uid))
    }
}

pub struct ManifestEngine {
    manifest: Arc<Manifest>,
    /// Working directory for commands and relative artifact paths.
    base_dir: PathBuf,
}

impl ManifestEngine {
    pub fn new(manifest: Arc<Manifest>, base_dir: PathBuf) -> Self {
        Self { manifest, base_dir }
    }

    async fn execute(&self, test: &ManifestTest, ctx: &ExecutionContext) -> TestNode {
        let started = Instant::now();
        let mut node = test.node(NodeState::Passed);

        if let Some(command) = &test.command {
            let (state, message) = self.run_command(command, test.timeout_ms, ctx).await;
            node.state = state;
            node.message = message;
        }

        node.duration_ms = Some(started.elapsed().as_millis() as u64);
        node
    }

    async fn run_command(
        &self,
        command: &str,
        timeout_ms: Option<u64>,
        ctx: &ExecutionContext,
    ) -> (NodeState, Option<String>) {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.base_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return (NodeState::Failed, Some(format!("failed to spawn: {}", e))),
        };

        let group = child.id();
        let output = child.wait_with_output();
        tokio::pin!(output);
        let limit = async {
            match timeout_ms {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            result = &mut output => result,
            _ = ctx.cancellation().cancelled() => {
                kill_group(group);
                return (NodeState::Cancelled, None);
            }
            _ = limit => {
                kill_group(group);
                return (
                    NodeState::TimedOut,
                    timeout_ms.map(|ms| format!("timed out after {} ms", ms)),
                );
            }
        };

        match result {
            Err(e) => (NodeState::Failed, Some(format!("failed to wait: {}", e))),
            Ok(output) if output.status.success() => (NodeState::Passed, None),
            Ok(output) => {
                let mut message = match output.status.code() {
                    Some(code) => format!("exited with status {}", code),
                    None => "terminated by signal".to_string(),
                };
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stdout = String::from_utf8_lossy(&output.stdout);
                let detail = if stderr.trim().is_empty() { stdout } else { stderr };
                if !detail.trim().is_empty() {
                    message.push('\n');
                    message.push_str(tail(detail.trim(), MAX_MESSAGE_LEN));
                }
                (NodeState::Failed, Some(message))
            }
        }
    }

    async fn artifact_for(&self, test: &ManifestTest) -> Option<Artifact> {
        let path = test.artifact.as_ref()?;
        let path = if path.is_absolute() {
            path.clone()
        } else {
            self.base_dir.join(path)
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(uid = %test.uid, path = %path.display(), "artifact not produced");
            return None;
        }
        Some(Artifact {
            uri: format!("file://{}", path.display()),
            display_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| test.uid.clone()),
            description: Some(format!("artifact of {}", test.uid)),
        })
    }
}

/// SIGKILL the process group led by `pid`.
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()).filter(|pid| *pid > 0) else {
        return;
    };
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

/// The last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[async_trait]
impl TestEngine for ManifestEngine {
    async fn discover(
        &self,
        selection: &TestSelection,
        ctx: &ExecutionContext,
    ) -> Result<DiscoveryMetrics, EngineError> {
        let mut metrics = DiscoveryMetrics::default();
        for test in self.manifest.selected(selection) {
            ctx.check_cancelled()?;
            ctx.report(test.node(NodeState::Discovered));
            metrics.discovered += 1;
        }
        Ok(metrics)
    }

    async fn run(
        &self,
        selection: &TestSelection,
        ctx: &ExecutionContext,
    ) -> Result<RunReport, EngineError> {
        let mut report = RunReport::default();
        for test in self.manifest.selected(selection) {
            ctx.check_cancelled()?;
            report.metrics.total += 1;

            if test.skip {
                ctx.report(test.node(NodeState::Skipped));
                report.metrics.skipped += 1;
                continue;
            }

            ctx.report(test.node(NodeState::InProgress));
            let node = self.execute(test, ctx).await;
            let state = node.state;
            ctx.report(node);

            match state {
                NodeState::Passed => report.metrics.passed += 1,
                NodeState::Cancelled => return Err(EngineError::Cancelled),
                _ => report.metrics.failed += 1,
            }
            if let Some(artifact) = self.artifact_for(test).await {
                report.artifacts.push(artifact);
            }
        }
        Ok(report)
    }
}

/// Creates a [`ManifestEngine`] per request over one parsed manifest.
pub struct ManifestEngineFactory {
    manifest: Arc<Manifest>,
    base_dir: PathBuf,
}

impl ManifestEngineFactory {
    pub fn new(manifest: Manifest, base_dir: PathBuf) -> Self {
        Self {
            manifest: Arc::new(manifest),
            base_dir,
        }
    }

    /// Load a manifest; commands run relative to the manifest's directory.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let manifest = Manifest::load(path)?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::new(manifest, base_dir))
    }

    pub fn test_count(&self) -> usize {
        self.manifest.tests.len()
    }
}

impl TestEngineFactory for ManifestEngineFactory {
    fn create(&self) -> Result<Box<dyn TestEngine>, EngineError> {
        Ok(Box::new(ManifestEngine::new(
            self.manifest.clone(),
            self.base_dir.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DataConsumer, NotificationBus};
    use crate::engine::RunMetrics;
    use crate::protocol::RequestId;
    use crate::updates::{BusItem, UpdateSink};
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Collect(Mutex<Vec<TestNode>>);

    #[async_trait]
    impl DataConsumer<BusItem> for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn consume(&self, item: &BusItem) -> anyhow::Result<()> {
            if let BusItem::NodeUpdate { change, .. } = item {
                self.0.lock().push(change.node.clone());
            }
            Ok(())
        }
    }

    fn manifest(toml: &str) -> Manifest {
        let manifest: Manifest = toml::from_str(toml).unwrap();
        manifest.validate().unwrap();
        manifest
    }

    fn context(
        token: CancellationToken,
    ) -> (ExecutionContext, NotificationBus<BusItem>, Arc<Collect>) {
        let bus = NotificationBus::new();
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        bus.subscribe(collect.clone()).unwrap();
        let ctx = ExecutionContext::new(
            RequestId::Number(1),
            token,
            UpdateSink::new(Uuid::new_v4(), bus.clone()),
        );
        (ctx, bus, collect)
    }

    async fn states(bus: &NotificationBus<BusItem>, collect: &Collect) -> Vec<(String, NodeState)> {
        bus.drain(Duration::from_secs(5)).await.unwrap();
        collect
            .0
            .lock()
            .iter()
            .map(|n| (n.uid.clone(), n.state))
            .collect()
    }

    const SUITE: &str = r#"
        [[tests]]
        uid = "math.add"
        command = "test 2 -eq $((1 + 1))"

        [[tests]]
        uid = "math.fail"
        display_name = "always fails"
        command = "echo nope >&2; exit 3"

        [[tests]]
        uid = "io.skip"
        skip = true

        [[tests]]
        uid = "io.noop"
    "#;

    #[test]
    fn duplicate_uids_are_rejected() {
        let manifest: Manifest = toml::from_str(
            r#"
            [[tests]]
            uid = "a"
            [[tests]]
            uid = "a"
            "#,
        )
        .unwrap();
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::DuplicateUid(uid)) if uid == "a"
        ));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
    }

    #[tokio::test]
    async fn discover_reports_matching_tests() {
        let engine = ManifestEngine::new(Arc::new(manifest(SUITE)), PathBuf::from("."));
        let (ctx, bus, collect) = context(CancellationToken::new());
        let selection = TestSelection::new(None, Some("math.*".into()));

        let metrics = engine.discover(&selection, &ctx).await.unwrap();
        assert_eq!(metrics.discovered, 2);
        assert_eq!(
            states(&bus, &collect).await,
            vec![
                ("math.add".to_string(), NodeState::Discovered),
                ("math.fail".to_string(), NodeState::Discovered),
            ]
        );
    }

    #[tokio::test]
    async fn run_tallies_outcomes() {
        let engine = ManifestEngine::new(Arc::new(manifest(SUITE)), PathBuf::from("."));
        let (ctx, bus, collect) = context(CancellationToken::new());

        let report = engine.run(&TestSelection::default(), &ctx).await.unwrap();
        assert_eq!(
            report.metrics,
            RunMetrics {
                total: 4,
                passed: 2,
                failed: 1,
                skipped: 1
            }
        );

        let seen = states(&bus, &collect).await;
        assert_eq!(
            seen,
            vec![
                ("math.add".to_string(), NodeState::InProgress),
                ("math.add".to_string(), NodeState::Passed),
                ("math.fail".to_string(), NodeState::InProgress),
                ("math.fail".to_string(), NodeState::Failed),
                ("io.skip".to_string(), NodeState::Skipped),
                ("io.noop".to_string(), NodeState::InProgress),
                ("io.noop".to_string(), NodeState::Passed),
            ]
        );

        let failed = collect
            .0
            .lock()
            .iter()
            .find(|n| n.uid == "math.fail" && n.state == NodeState::Failed)
            .cloned()
            .unwrap();
        assert_eq!(failed.display_name, "always fails");
        let message = failed.message.unwrap();
        assert!(message.contains("exited with status 3"));
        assert!(message.contains("nope"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let suite = manifest(
            r#"
            [[tests]]
            uid = "slow"
            command = "sleep 5"
            timeout_ms = 50
            "#,
        );
        let engine = ManifestEngine::new(Arc::new(suite), PathBuf::from("."));
        let (ctx, bus, collect) = context(CancellationToken::new());

        let report = engine.run(&TestSelection::default(), &ctx).await.unwrap();
        assert_eq!(report.metrics.failed, 1);
        assert_eq!(
            states(&bus, &collect).await.last().unwrap().1,
            NodeState::TimedOut
        );
    }

    #[tokio::test]
    async fn timeout_kills_background_processes_too() {
        let dir = tempfile::tempdir().unwrap();
        let suite = manifest(
            r#"
            [[tests]]
            uid = "forks"
            command = "(sleep 1; touch late) & sleep 5"
            timeout_ms = 100
            "#,
        );
        let engine = ManifestEngine::new(Arc::new(suite), dir.path().to_path_buf());
        let (ctx, _bus, _collect) = context(CancellationToken::new());

        let report = engine.run(&TestSelection::default(), &ctx).await.unwrap();
        assert_eq!(report.metrics.failed, 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late").exists());
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let suite = manifest(
            r#"
            [[tests]]
            uid = "slow"
            command = "sleep 5"

            [[tests]]
            uid = "never"
            "#,
        );
        let engine = ManifestEngine::new(Arc::new(suite), PathBuf::from("."));
        let token = CancellationToken::new();
        let (ctx, bus, collect) = context(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let started = Instant::now();
        let err = engine.run(&TestSelection::default(), &ctx).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, EngineError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(4));
        let seen = states(&bus, &collect).await;
        assert_eq!(seen.last().unwrap(), &("slow".to_string(), NodeState::Cancelled));
        assert!(seen.iter().all(|(uid, _)| uid != "never"));
    }

    #[tokio::test]
    async fn artifacts_are_collected_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let suite = manifest(
            r#"
            [[tests]]
            uid = "writes"
            command = "echo report > out.txt"
            artifact = "out.txt"

            [[tests]]
            uid = "forgets"
            artifact = "missing.txt"
            "#,
        );
        let engine = ManifestEngine::new(Arc::new(suite), dir.path().to_path_buf());
        let (ctx, _bus, _collect) = context(CancellationToken::new());

        let report = engine.run(&TestSelection::default(), &ctx).await.unwrap();
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].display_name, "out.txt");
        assert!(report.artifacts[0].uri.starts_with("file://"));
    }

    #[test]
    fn factory_creates_independent_engines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tests.toml");
        std::fs::write(&path, SUITE).unwrap();

        let factory = ManifestEngineFactory::from_path(&path).unwrap();
        assert_eq!(factory.test_count(), 4);
        let a = factory.create().unwrap();
        let b = factory.create().unwrap();
        assert!(!std::ptr::eq(
            a.as_ref() as *const dyn TestEngine as *const u8,
            b.as_ref() as *const dyn TestEngine as *const u8
        ));
    }
}
