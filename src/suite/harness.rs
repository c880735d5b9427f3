//! Run-all-and-report test execution

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Error;

const MAX_ERROR_LEN: usize = 200;

/// Outcome of one test
#[derive(Debug)]
pub struct TestResult {
    /// Test name
    pub name: String,
    /// Whether the test passed
    pub passed: bool,
    /// Wall time spent in the test
    pub duration: Duration,
    /// Failure message
    pub error: Option<String>,
}

/// Runs tests one after another, recording every outcome
pub struct TestHarness {
    suite: String,
    filter: Option<String>,
    results: Vec<TestResult>,
}

impl TestHarness {
    /// Harness for `suite`; only tests whose name contains `filter` run
    pub fn new(suite: &str, filter: Option<String>) -> Self {
        Self {
            suite: suite.to_string(),
            filter: filter.filter(|f| !f.is_empty()),
            results: Vec::new(),
        }
    }

    /// Whether `name` passes the filter
    pub fn selected(&self, name: &str) -> bool {
        self.filter.as_deref().map_or(true, |f| name.contains(f))
    }

    /// Run a single test, catching errors and panics
    pub async fn run<F, Fut>(&mut self, name: &str, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        if !self.selected(name) {
            debug!(test = %name, "Skipped by filter");
            return;
        }

        info!(test = %name, "=== RUN");
        let start = Instant::now();
        let result = AssertUnwindSafe(f()).catch_unwind().await;
        let (passed, error) = match result {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                (false, Some(format!("PANIC: {msg}")))
            }
        };

        let duration = start.elapsed();
        match &error {
            None => info!(test = %name, secs = duration.as_secs_f64(), "--- PASS"),
            Some(e) => warn!(test = %name, secs = duration.as_secs_f64(), error = %e, "--- FAIL"),
        }

        self.results.push(TestResult {
            name: name.to_string(),
            passed,
            duration,
            error,
        });
    }

    /// Recorded outcomes, in run order
    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    /// Print the summary; fails when any test failed
    pub fn finish(&self) -> Result<(), Error> {
        let total_duration: Duration = self.results.iter().map(|r| r.duration).sum();
        let passed = self.results.iter().filter(|r| r.passed).count();
        let failed = self.results.len() - passed;

        if self.results.is_empty() {
            warn!(suite = %self.suite, filter = ?self.filter, "No tests to run");
        }

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in &self.results {
            let tag = if r.passed { "PASS" } else { "FAIL" };
            info!("  {tag}  {:40} {:.1}s", r.name, r.duration.as_secs_f64());
            if let Some(e) = &r.error {
                let truncated: String = e.chars().take(MAX_ERROR_LEN).collect();
                info!("        -> {truncated}");
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total)",
            passed,
            failed,
            total_duration.as_secs_f64()
        );
        info!("========================================");

        if failed > 0 {
            let failures: Vec<_> = self
                .results
                .iter()
                .filter(|r| !r.passed)
                .map(|r| r.name.as_str())
                .collect();
            Err(Error::assertion(format!(
                "{} test(s) failed in {}: {}",
                failed,
                self.suite,
                failures.join(", ")
            )))
        } else {
            Ok(())
        }
    }
}
