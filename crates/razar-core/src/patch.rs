//! Sandboxed patch application with backup and rollback.
//!
//! Flow for one suggestion:
//! 1. validate the module path, content and test list
//! 2. write the candidate into a throwaway sandbox and run the tests there
//! 3. back up the live file, write the candidate in place, re-run the tests
//! 4. on failure restore the backup; on success reactivate and log the diff

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use razar_state::{JsonlLog, PatchRecord};

use crate::agent::PatchSuggestion;
use crate::domain::{RazarError, Result};
use crate::obs;
use crate::quarantine::QuarantineManager;

/// Runs a patch's test commands.
///
/// Both runs use the live project root as working directory. During the
/// isolated run the candidate exists only under `RAZAR_SANDBOX`, an overlay
/// root that holds the patched file at its module path; `RAZAR_CANDIDATE`
/// names that file and `RAZAR_MODULE` its path relative to the root. A test
/// that must exercise the candidate looks it up there, e.g. by putting
/// `$RAZAR_SANDBOX` ahead of the root on its search path. The in-place run
/// sets only `RAZAR_MODULE`.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run every command in `workdir` with `env` added. All must pass.
    async fn run(&self, workdir: &Path, env: &[(String, String)], tests: &[String]) -> Result<bool>;
}

/// Runs each test through `sh -c` with a per-command timeout.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    timeout: Duration,
}

impl CommandTestRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, workdir: &Path, env: &[(String, String)], tests: &[String]) -> Result<bool> {
        for test in tests {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(test)
                .current_dir(workdir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            for (k, v) in env {
                cmd.env(k, v);
            }
            let passed = match tokio::time::timeout(self.timeout, cmd.status()).await {
                Ok(status) => status?.success(),
                Err(_) => {
                    tracing::warn!(test = %test, timeout = ?self.timeout, "patch test timed out");
                    false
                }
            };
            if !passed {
                tracing::info!(test = %test, "patch test failed");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Result of applying one suggestion.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub module: String,
    pub applied: bool,
    pub diff: Option<String>,
    pub backup: Option<PathBuf>,
    pub reason: Option<String>,
    /// Components reactivated as a result of this patch
    pub reactivated: Vec<String>,
}

impl PatchOutcome {
    fn rejected(module: &str, reason: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            applied: false,
            diff: None,
            backup: None,
            reason: Some(reason.into()),
            reactivated: Vec::new(),
        }
    }
}

/// Applies suggestions under a project root.
#[derive(Clone)]
pub struct PatchApplier {
    root: PathBuf,
    backup_dir: PathBuf,
    patch_log: Arc<JsonlLog>,
    tests: Arc<dyn TestRunner>,
    quarantine: QuarantineManager,
}

impl PatchApplier {
    pub fn new(
        root: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        patch_log: Arc<JsonlLog>,
        tests: Arc<dyn TestRunner>,
        quarantine: QuarantineManager,
    ) -> Self {
        Self {
            root: root.into(),
            backup_dir: backup_dir.into(),
            patch_log,
            tests,
            quarantine,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative_module(module: &str) -> Result<PathBuf> {
        let path = PathBuf::from(module);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if module.trim().is_empty() || escapes {
            return Err(RazarError::PatchValidation {
                module: module.to_string(),
                reason: "module path must be relative to the project root".to_string(),
            });
        }
        Ok(path)
    }

    /// Apply one suggestion for `component`.
    ///
    /// Validation, test and I/O failures all come back as an outcome with
    /// `applied == false` and are written to the patch log. `Err` means the
    /// patch log itself could not be written.
    pub async fn apply(
        &self,
        component: &str,
        attempt: u32,
        suggestion: &PatchSuggestion,
        fallback_tests: &[String],
    ) -> Result<PatchOutcome> {
        let outcome = match self.apply_inner(component, suggestion, fallback_tests).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(component = %component, module = %suggestion.module, error = %e, "patch could not be applied");
                PatchOutcome::rejected(&suggestion.module, format!("patch errored: {e}"))
            }
        };
        self.patch_log.append(&PatchRecord {
            component: component.to_string(),
            module: suggestion.module.clone(),
            attempt,
            success: outcome.applied,
            diff: outcome.diff.clone(),
            backup: outcome.backup.as_ref().map(|p| p.display().to_string()),
            reason: outcome.reason.clone(),
            timestamp: Utc::now(),
        })?;
        obs::emit_patch_result(component, &suggestion.module, outcome.applied);
        Ok(outcome)
    }

    async fn apply_inner(
        &self,
        component: &str,
        suggestion: &PatchSuggestion,
        fallback_tests: &[String],
    ) -> Result<PatchOutcome> {
        let module = suggestion.module.as_str();
        let relative = match Self::relative_module(module) {
            Ok(p) => p,
            Err(e) => return Ok(PatchOutcome::rejected(module, e.to_string())),
        };
        let Some(content) = suggestion.content.as_deref() else {
            return Ok(PatchOutcome::rejected(module, "suggestion has no replacement content"));
        };
        let tests: &[String] = if suggestion.tests.is_empty() {
            fallback_tests
        } else {
            &suggestion.tests
        };
        if tests.is_empty() {
            return Ok(PatchOutcome::rejected(module, "no tests available to verify the patch"));
        }

        let target = self.root.join(&relative);
        let original = match tokio::fs::read_to_string(&target).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        // Isolated run: the candidate lives only in the sandbox.
        let sandbox = tempfile::tempdir()?;
        let candidate = sandbox.path().join(&relative);
        if let Some(parent) = candidate.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&candidate, content).await?;
        let sandbox_env = vec![
            ("RAZAR_SANDBOX".to_string(), sandbox.path().display().to_string()),
            ("RAZAR_CANDIDATE".to_string(), candidate.display().to_string()),
            ("RAZAR_MODULE".to_string(), module.to_string()),
        ];
        if !self.tests.run(&self.root, &sandbox_env, tests).await? {
            return Ok(PatchOutcome::rejected(module, "tests failed in sandbox"));
        }

        let backup = match &original {
            Some(_) => Some(self.snapshot(&target, &relative).await?),
            None => None,
        };
        write_atomic(&target, content)?;

        let live_env = vec![("RAZAR_MODULE".to_string(), module.to_string())];
        let passed = match self.tests.run(&self.root, &live_env, tests).await {
            Ok(passed) => passed,
            Err(e) => {
                self.restore(&target, original.as_deref())?;
                return Err(e);
            }
        };
        if !passed {
            self.restore(&target, original.as_deref())?;
            let mut out = PatchOutcome::rejected(module, "tests failed in place; backup restored");
            out.backup = backup;
            return Ok(out);
        }

        let diff = unified_diff(module, original.as_deref().unwrap_or(""), content);
        let reactivated = self.reactivate_for(component, &relative)?;
        Ok(PatchOutcome {
            module: module.to_string(),
            applied: true,
            diff: Some(diff),
            backup,
            reason: None,
            reactivated,
        })
    }

    async fn snapshot(&self, target: &Path, relative: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module".to_string());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let backup = self.backup_dir.join(format!("{file_name}.{stamp}"));
        tokio::fs::copy(target, &backup).await?;
        Ok(backup)
    }

    fn restore(&self, target: &Path, original: Option<&str>) -> Result<()> {
        match original {
            Some(text) => write_atomic(target, text),
            None => match std::fs::remove_file(target) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Reactivate the module's stem and the component, where quarantined.
    fn reactivate_for(&self, component: &str, relative: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if let Some(stem) = relative.file_stem() {
            names.push(stem.to_string_lossy().into_owned());
        }
        if !names.iter().any(|n| n == component) {
            names.push(component.to_string());
        }
        let note = format!("patched {}", relative.display());
        let mut reactivated = Vec::new();
        for name in names {
            if self.quarantine.is_quarantined(&name)? {
                self.quarantine.reactivate(&name, true, true, Some(&note))?;
                reactivated.push(name);
            }
        }
        Ok(reactivated)
    }
}

fn write_atomic(target: &Path, content: &str) -> Result<()> {
    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Unified diff
// ---------------------------------------------------------------------------

const CONTEXT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// Matching (old, new) line index pairs of the longest common subsequence.
fn lcs_alignment(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let m = a.len();
    let n = b.len();
    if m == 0 || n == 0 {
        return Vec::new();
    }

    let mut dp = vec![vec![0usize; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            dp[i][j] = if a[i - 1] == b[j - 1] {
                dp[i - 1][j - 1] + 1
            } else {
                dp[i][j - 1].max(dp[i - 1][j])
            };
        }
    }

    let mut pairs = Vec::new();
    let (mut i, mut j) = (m, n);
    while i > 0 && j > 0 {
        if a[i - 1] == b[j - 1] {
            pairs.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if dp[i][j - 1] > dp[i - 1][j] {
            j -= 1;
        } else {
            i -= 1;
        }
    }
    pairs.reverse();
    pairs
}

/// Render a unified diff between two texts.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();

    // (op, old index, new index, text)
    let mut ops: Vec<(Op, usize, usize, &str)> = Vec::new();
    let (mut i, mut j) = (0, 0);
    for (ai, bj) in lcs_alignment(&a, &b).into_iter().chain([(a.len(), b.len())]) {
        while i < ai {
            ops.push((Op::Delete, i, j, a[i]));
            i += 1;
        }
        while j < bj {
            ops.push((Op::Insert, i, j, b[j]));
            j += 1;
        }
        if ai < a.len() && bj < b.len() {
            ops.push((Op::Equal, i, j, a[i]));
            i += 1;
            j += 1;
        }
    }

    let mut out = format!("--- a/{path}\n+++ b/{path}\n");
    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| op.0 != Op::Equal)
        .map(|(idx, _)| idx)
        .collect();
    if changes.is_empty() {
        return out;
    }

    let mut groups: Vec<(usize, usize)> = Vec::new();
    for &idx in &changes {
        match groups.last_mut() {
            Some((_, end)) if idx <= *end + 2 * CONTEXT + 1 => *end = idx,
            _ => groups.push((idx, idx)),
        }
    }

    for (first, last) in groups {
        let start = first.saturating_sub(CONTEXT);
        let end = (last + CONTEXT + 1).min(ops.len());
        let slice = &ops[start..end];
        let old_count = slice.iter().filter(|o| o.0 != Op::Insert).count();
        let new_count = slice.iter().filter(|o| o.0 != Op::Delete).count();
        let old_start = if old_count == 0 { slice[0].1 } else { slice[0].1 + 1 };
        let new_start = if new_count == 0 { slice[0].2 } else { slice[0].2 + 1 };
        out.push_str(&format!(
            "@@ -{old_start},{old_count} +{new_start},{new_count} @@\n"
        ));
        for (op, _, _, text) in slice {
            let marker = match op {
                Op::Equal => ' ',
                Op::Delete => '-',
                Op::Insert => '+',
            };
            out.push(marker);
            out.push_str(text);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use razar_state::fakes::MemoryQuarantineStore;
    use std::sync::Mutex;

    /// Captures each run's env and the sandboxed candidate, then answers
    /// from `results` in order.
    struct RecordingRunner {
        calls: Mutex<Vec<(Vec<(String, String)>, Option<String>)>>,
        results: Mutex<Vec<Result<bool>>>,
    }

    impl RecordingRunner {
        fn new(results: Vec<Result<bool>>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl TestRunner for RecordingRunner {
        async fn run(&self, _workdir: &Path, env: &[(String, String)], _tests: &[String]) -> Result<bool> {
            let overlay = env
                .iter()
                .find(|(k, _)| k == "RAZAR_SANDBOX")
                .and_then(|(_, v)| std::fs::read_to_string(Path::new(v).join("cfg/db.cfg")).ok());
            self.calls.lock().unwrap().push((env.to_vec(), overlay));
            self.results.lock().unwrap().remove(0)
        }
    }

    fn applier(root: &Path, runner: Arc<RecordingRunner>) -> PatchApplier {
        PatchApplier::new(
            root,
            root.join("backups"),
            Arc::new(JsonlLog::new(root.join("patches.jsonl"))),
            runner,
            QuarantineManager::new(Arc::new(MemoryQuarantineStore::new())),
        )
    }

    fn suggestion() -> PatchSuggestion {
        let mut s = PatchSuggestion::replace("cfg/db.cfg", "candidate");
        s.tests = vec!["true".to_string()];
        s
    }

    #[tokio::test]
    async fn sandbox_run_sees_candidate_under_overlay_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cfg")).unwrap();
        std::fs::write(dir.path().join("cfg/db.cfg"), "original").unwrap();
        let runner = Arc::new(RecordingRunner::new(vec![Ok(true), Ok(true)]));

        let outcome = applier(dir.path(), runner.clone())
            .apply("db", 1, &suggestion(), &[])
            .await
            .unwrap();
        assert!(outcome.applied);

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1.as_deref(), Some("candidate"));
        let keys: Vec<&str> = calls[0].0.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["RAZAR_SANDBOX", "RAZAR_CANDIDATE", "RAZAR_MODULE"]);
        assert_eq!(
            calls[1].0,
            vec![("RAZAR_MODULE".to_string(), "cfg/db.cfg".to_string())]
        );
    }

    #[tokio::test]
    async fn erroring_live_run_restores_original_and_logs_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cfg")).unwrap();
        std::fs::write(dir.path().join("cfg/db.cfg"), "original").unwrap();
        let runner = Arc::new(RecordingRunner::new(vec![
            Ok(true),
            Err(std::io::Error::other("runner crashed").into()),
        ]));

        let outcome = applier(dir.path(), runner)
            .apply("db", 2, &suggestion(), &[])
            .await
            .unwrap();

        assert!(!outcome.applied);
        assert!(outcome.reason.unwrap().contains("runner crashed"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cfg/db.cfg")).unwrap(),
            "original"
        );
        let log: Vec<PatchRecord> = JsonlLog::new(dir.path().join("patches.jsonl"))
            .read_all()
            .unwrap();
        assert_eq!(log.len(), 1);
        assert!(!log[0].success);
        assert_eq!(log[0].attempt, 2);
    }

    #[tokio::test]
    async fn directory_module_is_a_logged_rejection() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("svc")).unwrap();
        let runner = Arc::new(RecordingRunner::new(Vec::new()));

        let outcome = applier(dir.path(), runner)
            .apply("svc", 1, &PatchSuggestion::replace("svc", "x"), &["true".to_string()])
            .await
            .unwrap();

        assert!(!outcome.applied);
        assert!(dir.path().join("svc").is_dir());
        let log: Vec<PatchRecord> = JsonlLog::new(dir.path().join("patches.jsonl"))
            .read_all()
            .unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn diff_of_identical_text_has_no_hunks() {
        let d = unified_diff("a.py", "x\ny\n", "x\ny\n");
        assert_eq!(d, "--- a/a.py\n+++ b/a.py\n");
    }

    #[test]
    fn diff_marks_changed_line_with_context() {
        let old = "one\ntwo\nthree\nfour\nfive\n";
        let new = "one\ntwo\nTHREE\nfour\nfive\n";
        let d = unified_diff("m.py", old, new);
        assert!(d.contains("@@ -1,5 +1,5 @@"));
        assert!(d.contains("-three\n+THREE\n"));
        assert!(d.contains(" two\n"));
    }

    #[test]
    fn diff_from_empty_file() {
        let d = unified_diff("new.py", "", "a\nb\n");
        assert!(d.contains("@@ -0,0 +1,2 @@"));
        assert!(d.contains("+a\n+b\n"));
    }

    #[test]
    fn distant_changes_form_separate_hunks() {
        let old: String = (0..30).map(|i| format!("line{i}\n")).collect();
        let new = old.replace("line2\n", "LINE2\n").replace("line27\n", "LINE27\n");
        let d = unified_diff("big.txt", &old, &new);
        assert_eq!(d.matches("@@ -").count(), 2);
    }

    #[test]
    fn rejects_paths_outside_root() {
        assert!(PatchApplier::relative_module("../etc/passwd").is_err());
        assert!(PatchApplier::relative_module("/etc/passwd").is_err());
        assert!(PatchApplier::relative_module("svc/db.py").is_ok());
    }
}
