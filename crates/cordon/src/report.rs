//! Machine-readable run evidence.
//!
//! Writes one JSONL artifact per collected run: a summary line followed by
//! one line per test outcome, in registration order. The artifact is
//! written atomically (temp file + rename) so a crashed writer never
//! leaves a half-written file behind. Rendering for humans is someone
//! else's job; this layer exists for CI and replay tooling.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::results::{Results, TestStatus};

/// Evidence schema version, bumped on any layout change.
pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

const EVIDENCE_FILE_NAME: &str = "run_evidence.jsonl";

/// First line of the artifact: the whole-run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvidence {
    pub schema_version: u32,
    pub generated_at_utc: String,
    pub test_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub crashed: usize,
    pub harness_errors: Vec<String>,
    pub success: bool,
}

/// One line per test outcome.
///
/// Captured bytes are carried lossily as UTF-8: evidence is for reading
/// and diffing, and the exact bytes stay available in-process on the
/// [`TestOutcome`](crate::TestOutcome).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEvidence {
    pub test_name: String,
    pub group_name: String,
    pub status: String,
    pub assertion_count: usize,
    pub failed_assertion_indices: Vec<u64>,
    pub std_out: String,
    pub std_err: String,
}

/// Collects run evidence under a root directory.
#[derive(Debug, Clone)]
pub struct EvidenceCollector {
    root: PathBuf,
}

impl EvidenceCollector {
    /// Creates the collector, making the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Writes the JSONL artifact for `results` and returns its path.
    pub fn collect(&self, results: &Results) -> io::Result<PathBuf> {
        let mut lines = String::new();

        let summary = summarize(results);
        push_json_line(&mut lines, &summary)?;

        for i in 0..results.test_count() {
            let outcome = results.test_outcome(i);
            let line = TestEvidence {
                test_name: outcome.test_name().to_string(),
                group_name: outcome.group_name().to_string(),
                status: outcome.status().as_str().to_string(),
                assertion_count: outcome.assertions().len(),
                failed_assertion_indices: outcome
                    .assertions()
                    .iter()
                    .filter(|a| !a.passed())
                    .map(|a| a.index())
                    .collect(),
                std_out: String::from_utf8_lossy(outcome.std_out()).into_owned(),
                std_err: String::from_utf8_lossy(outcome.std_err()).into_owned(),
            };
            push_json_line(&mut lines, &line)?;
        }

        let path = self.root.join(EVIDENCE_FILE_NAME);
        write_atomic(&path, lines.as_bytes())?;
        Ok(path)
    }
}

fn summarize(results: &Results) -> RunEvidence {
    let mut passed = 0;
    let mut failed = 0;
    let mut crashed = 0;
    for i in 0..results.test_count() {
        match results.test_outcome(i).status() {
            TestStatus::Passed => passed += 1,
            TestStatus::Failed => failed += 1,
            TestStatus::Crashed | TestStatus::TimedOut => crashed += 1,
        }
    }

    RunEvidence {
        schema_version: EVIDENCE_SCHEMA_VERSION,
        generated_at_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        test_count: results.test_count(),
        passed,
        failed,
        crashed,
        harness_errors: (0..results.error_count())
            .map(|i| results.error(i).to_string())
            .collect(),
        success: results.success(),
    }
}

fn push_json_line<T: Serialize>(lines: &mut String, value: &T) -> io::Result<()> {
    let line = serde_json::to_string(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    lines.push_str(&line);
    lines.push('\n');
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
