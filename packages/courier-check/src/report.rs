//! Pass/fail report for one suite run.
//!
//! A run produces a JSON array of records: one `test-start`, one
//! `assert-status` per registered assertion, and one `test-finish`.
//! Assertions that were never evaluated are reported as `skipped`.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use chrono::Utc;
use colored::Colorize;
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertStatus {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for AssertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AssertStatus::Passed => "passed".green(),
            AssertStatus::Failed => "failed".red(),
            AssertStatus::Skipped => "skipped".yellow(),
        };
        write!(f, "{label}")
    }
}

/// One line of the JSON log.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "msg-type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum Record {
    TestStart {
        test_suite: String,
        test_type: String,
        test_name: String,
        test_user: String,
        commit_id: String,
        test_desc: String,
        timestamp: f64,
        test_id: String,
    },
    AssertStatus {
        assert_no: u32,
        assert_desc: String,
        assert_cond: String,
        test_status: AssertStatus,
        test_id: String,
    },
    TestFinish {
        timestamp: f64,
        test_id: String,
    },
}

/// Identifies a run.
#[derive(Debug, Clone)]
pub struct TestInfo {
    pub suite: String,
    pub kind: String,
    pub name: String,
    pub desc: String,
    pub user: String,
    pub commit_id: String,
}

#[derive(Debug)]
struct Assertion {
    desc: String,
    cond: String,
    status: AssertStatus,
}

#[derive(Debug)]
pub struct Report {
    info: TestInfo,
    test_id: String,
    started_at: f64,
    assertions: BTreeMap<u32, Assertion>,
}

impl Report {
    /// Start a run. The test id is the SHA-256 of the run's identity and
    /// start time.
    pub fn start(info: TestInfo) -> Self {
        let now = Utc::now();
        let test_id = test_id(&info, now.timestamp());
        tracing::info!(
            test_id = %test_id,
            suite = %info.suite,
            name = %info.name,
            user = %info.user,
            commit_id = %info.commit_id,
            "starting test"
        );
        Self {
            info,
            test_id,
            started_at: now.timestamp_millis() as f64 / 1000.0,
            assertions: BTreeMap::new(),
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Register an assertion; it stays `skipped` until evaluated.
    pub fn add_assertion(&mut self, number: u32, desc: &str) {
        self.assertions.insert(
            number,
            Assertion {
                desc: desc.to_string(),
                cond: "none".to_string(),
                status: AssertStatus::Skipped,
            },
        );
    }

    /// Record the outcome of an assertion. Returns `passed`.
    pub fn assert_test(&mut self, number: u32, passed: bool, cond: &str) -> Result<bool> {
        let Some(assertion) = self.assertions.get_mut(&number) else {
            bail!("assertion {number} was never registered");
        };
        assertion.cond = cond.to_string();
        assertion.status = if passed {
            AssertStatus::Passed
        } else {
            AssertStatus::Failed
        };
        eprintln!(
            "assertion {}, {}: {}",
            number.to_string().bold(),
            assertion.desc,
            assertion.status
        );
        if !passed {
            eprintln!("    {}", cond.dimmed());
        }
        Ok(passed)
    }

    pub fn failed(&self) -> usize {
        self.count(AssertStatus::Failed)
    }

    pub fn count(&self, status: AssertStatus) -> usize {
        self.assertions
            .values()
            .filter(|a| a.status == status)
            .count()
    }

    /// Close the run and return its records.
    pub fn finish(self) -> Vec<Record> {
        for (number, assertion) in &self.assertions {
            if assertion.status == AssertStatus::Skipped {
                eprintln!(
                    "assertion {}, {}: {}",
                    number.to_string().bold(),
                    assertion.desc,
                    assertion.status
                );
            }
        }
        tracing::info!(
            test_id = %self.test_id,
            passed = self.count(AssertStatus::Passed),
            failed = self.count(AssertStatus::Failed),
            skipped = self.count(AssertStatus::Skipped),
            "test {} ended",
            self.info.name
        );

        let mut records = Vec::with_capacity(self.assertions.len() + 2);
        records.push(Record::TestStart {
            test_suite: self.info.suite,
            test_type: self.info.kind,
            test_name: self.info.name,
            test_user: self.info.user,
            commit_id: self.info.commit_id,
            test_desc: self.info.desc,
            timestamp: self.started_at,
            test_id: self.test_id.clone(),
        });
        records.extend(
            self.assertions
                .into_iter()
                .map(|(number, assertion)| Record::AssertStatus {
                    assert_no: number,
                    assert_desc: assertion.desc,
                    assert_cond: assertion.cond,
                    test_status: assertion.status,
                    test_id: self.test_id.clone(),
                }),
        );
        records.push(Record::TestFinish {
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            test_id: self.test_id,
        });
        records
    }
}

fn test_id(info: &TestInfo, timestamp: i64) -> String {
    let identity = format!(
        "{}:{}:{}:{}:{}:{}",
        info.suite, info.kind, info.name, info.user, info.commit_id, timestamp
    );
    format!("{:x}", Sha256::digest(identity.as_bytes()))
}
