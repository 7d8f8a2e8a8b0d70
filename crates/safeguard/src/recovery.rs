//! Error classification, diagnostics reports and recovery.
//!
//! Every operation attempt follows one state machine:
//!
//! ```text
//! Attempting -> Failed -> Recovering -> Retrying -> Attempting
//!                                    \-> GivingUp -> Reported
//! Attempting -> Succeeded
//! ```
//!
//! Retries are bounded: transient provider failures by
//! [`RetryConfig::max_attempts`], corruption repair and lock reclamation by a
//! single shot each. Every path that gives up files exactly one
//! [`ErrorReport`] in the diagnostics directory.

use crate::config::{ReportConfig, RetryConfig, SafetyConfig};
use crate::error::{Error, ErrorCategory};
use crate::fsutil;
use crate::lock::LockManager;
use crate::logtail::LogTail;
use crate::process;
use crate::retry::{Retryable, jittered_delay};
use crate::state::StateStore;
use crate::types::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

static REPORT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Report Structures
// ============================================================================

/// What the failing operation was doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    /// Operation name (e.g. "delete")
    pub operation: String,
    /// Resource the operation targets, if any
    #[serde(default)]
    pub resource: Option<ResourceId>,
}

impl OperationContext {
    /// Context for an operation with no single target.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            resource: None,
        }
    }

    /// Context for an operation on `resource`.
    pub fn for_resource(operation: impl Into<String>, resource: ResourceId) -> Self {
        Self {
            operation: operation.into(),
            resource: Some(resource),
        }
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{} {resource}", self.operation),
            None => f.write_str(&self.operation),
        }
    }
}

/// Whether recovery was tried, and how it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryOutcome {
    /// Recovery ran and fixed the problem
    Succeeded,
    /// Recovery ran (possibly several times) and did not help
    Failed,
    /// The category has no recovery routine
    NotAttempted,
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::NotAttempted => "not-attempted",
        })
    }
}

/// Process and environment at the time of the failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Process id
    pub pid: u32,
    /// Host name
    pub hostname: String,
    /// Login name, if known
    pub user: Option<String>,
    /// Working directory, if readable
    pub cwd: Option<PathBuf>,
    /// Command line
    pub args: Vec<String>,
    /// Operating system
    pub os: String,
    /// CPU architecture
    pub arch: String,
    /// Every `CLOUDSWEEP_*` variable
    pub env: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    /// Capture the current process environment.
    pub fn capture() -> Self {
        Self {
            pid: std::process::id(),
            hostname: process::hostname(),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
            cwd: std::env::current_dir().ok(),
            args: std::env::args().collect(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            env: std::env::vars()
                .filter(|(k, _)| k.starts_with("CLOUDSWEEP_"))
                .collect(),
        }
    }
}

/// Step of the per-attempt state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Running the operation
    Attempting,
    /// The attempt returned an error
    Failed,
    /// Running the category's recovery routine
    Recovering,
    /// Recovery allows another attempt
    Retrying,
    /// No further attempts
    GivingUp,
    /// Report filed (terminal)
    Reported,
    /// Operation completed (terminal)
    Succeeded,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Attempting => "attempting",
            Self::Failed => "failed",
            Self::Recovering => "recovering",
            Self::Retrying => "retrying",
            Self::GivingUp => "giving up",
            Self::Reported => "reported",
            Self::Succeeded => "succeeded",
        };
        f.write_str(name)
    }
}

/// Diagnostic record of one handled failure. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// `<CODE>-<timestamp>-<pid>-<seq>`
    pub id: String,
    /// Failure category
    pub category: ErrorCategory,
    /// Human-readable message
    pub message: String,
    /// What was being done
    pub context: OperationContext,
    /// When the report was created
    pub created_at: DateTime<Utc>,
    /// How recovery went
    pub recovery: RecoveryOutcome,
    /// Attempts made before giving up
    pub attempts: u32,
    /// State machine steps of the operation, in order
    #[serde(default)]
    pub transitions: Vec<AttemptState>,
    /// Process snapshot
    pub environment: EnvironmentSnapshot,
    /// Recent log lines, oldest first
    #[serde(default)]
    pub log_tail: Vec<String>,
}

/// Result of a single recovery routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Safe to attempt the operation again
    Recovered,
    /// Give up
    NotRecovered,
}

/// Final result of [`Coordinator::run`].
#[derive(Debug)]
pub enum Outcome<T> {
    /// The operation completed
    Succeeded(T),
    /// The operation gave up; the report is on disk
    Reported {
        /// The filed report
        report: ErrorReport,
        /// The last error
        error: Error,
    },
}

impl<T> Outcome<T> {
    /// Convert into a `Result`, dropping the report.
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Self::Succeeded(value) => Ok(value),
            Self::Reported { error, .. } => Err(error),
        }
    }

    /// The filed report, if the operation gave up.
    pub fn report(&self) -> Option<&ErrorReport> {
        match self {
            Self::Succeeded(_) => None,
            Self::Reported { report, .. } => Some(report),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Dispatches failures to recovery routines and files reports.
pub struct Coordinator<'a> {
    locks: &'a LockManager,
    state: &'a StateStore,
    diagnostics_dir: PathBuf,
    retry: RetryConfig,
    report: ReportConfig,
    log_tail: LogTail,
}

impl<'a> Coordinator<'a> {
    /// Create a coordinator over the given lock manager and state store.
    pub fn new(config: &SafetyConfig, locks: &'a LockManager, state: &'a StateStore) -> Self {
        Self {
            locks,
            state,
            diagnostics_dir: config.diagnostics_dir.clone(),
            retry: config.retry,
            report: config.report,
            log_tail: LogTail::default(),
        }
    }

    /// Capture log lines from `tail` into reports.
    pub fn with_log_tail(mut self, tail: LogTail) -> Self {
        self.log_tail = tail;
        self
    }

    /// Directory reports are written to.
    pub fn diagnostics_dir(&self) -> &Path {
        &self.diagnostics_dir
    }

    /// Handle one failure outside an operation loop: run its repair once, then file a report.
    ///
    /// There is no operation to retry here, so backoff categories are filed
    /// as `not-attempted`, and a lock timeout only counts as recovered when
    /// a stale entry was actually removed.
    pub fn handle(&self, category: ErrorCategory, ctx: &OperationContext, details: &str) -> ErrorReport {
        let outcome = match category {
            ErrorCategory::StateCorruption => match self.repair_state() {
                Recovery::Recovered => RecoveryOutcome::Succeeded,
                Recovery::NotRecovered => RecoveryOutcome::Failed,
            },
            ErrorCategory::LockTimeout => match &ctx.resource {
                Some(resource) => match self.reclaim_lock(resource) {
                    Some(true) => RecoveryOutcome::Succeeded,
                    Some(false) | None => RecoveryOutcome::Failed,
                },
                None => RecoveryOutcome::NotAttempted,
            },
            _ => RecoveryOutcome::NotAttempted,
        };
        self.file_report(category, ctx, details, outcome, 1, Vec::new())
    }

    /// Run the recovery routine for `category` once.
    pub fn recover(&self, category: ErrorCategory, ctx: &OperationContext) -> Recovery {
        self.recover_after(category, ctx.resource.as_ref(), ctx, 1, None)
    }

    fn repair_state(&self) -> Recovery {
        match self.state.backup_and_repair() {
            Ok(Some(backup)) => {
                log::info!("Repaired state document, corrupt copy at {}", backup.display());
                Recovery::Recovered
            }
            Ok(None) => Recovery::Recovered,
            Err(e) => {
                log::error!("State repair failed: {e}");
                Recovery::NotRecovered
            }
        }
    }

    /// `Some(true)` when a stale entry was removed, `None` when reclaiming failed.
    fn reclaim_lock(&self, resource: &ResourceId) -> Option<bool> {
        match self.locks.reclaim_if_stale(resource) {
            Ok(reclaimed) => {
                if reclaimed {
                    log::info!("Reclaimed stale lock on {resource}");
                }
                Some(reclaimed)
            }
            Err(e) => {
                log::error!("Reclaiming lock on {resource} failed: {e}");
                None
            }
        }
    }

    /// Recovery dispatch. `failures` counts failed attempts so far.
    fn recover_after(
        &self,
        category: ErrorCategory,
        resource: Option<&ResourceId>,
        ctx: &OperationContext,
        failures: u32,
        hint: Option<Duration>,
    ) -> Recovery {
        match category {
            ErrorCategory::StateCorruption => self.repair_state(),
            ErrorCategory::LockTimeout => {
                let Some(resource) = resource else {
                    return Recovery::NotRecovered;
                };
                match self.reclaim_lock(resource) {
                    Some(true) => Recovery::Recovered,
                    Some(false) => {
                        log::info!("Lock on {resource} is held by a live owner, retrying once");
                        Recovery::Recovered
                    }
                    None => Recovery::NotRecovered,
                }
            }
            c if c.is_retryable() => {
                if failures >= self.retry.max_attempts {
                    return Recovery::NotRecovered;
                }
                let mut delay = jittered_delay(&self.retry, failures.saturating_sub(1));
                if let Some(hint) = hint {
                    delay = delay.max(hint);
                }
                log::warn!(
                    "{ctx}: {c} (attempt {failures}/{}), backing off {}ms",
                    self.retry.max_attempts,
                    delay.as_millis()
                );
                thread::sleep(delay);
                Recovery::Recovered
            }
            _ => Recovery::NotRecovered,
        }
    }

    /// Drive `attempt` through the state machine until it succeeds or a report is filed.
    pub fn run<T>(
        &self,
        ctx: &OperationContext,
        mut attempt: impl FnMut() -> Result<T, Error>,
    ) -> Outcome<T> {
        let mut transitions = Vec::new();
        let mut failures = 0u32;
        let mut one_shot_used: HashSet<ErrorCategory> = HashSet::new();

        loop {
            self.step(ctx, &mut transitions, AttemptState::Attempting);
            let error = match attempt() {
                Ok(value) => {
                    self.step(ctx, &mut transitions, AttemptState::Succeeded);
                    return Outcome::Succeeded(value);
                }
                Err(e) => e,
            };

            failures += 1;
            let category = error.category();
            log::warn!("{ctx} failed ({category}): {error}");
            self.step(ctx, &mut transitions, AttemptState::Failed);

            let eligible = category.has_recovery()
                && (category.is_retryable() || !one_shot_used.contains(&category));
            let outcome = if eligible {
                self.step(ctx, &mut transitions, AttemptState::Recovering);
                // A cascade can time out on a dependent rather than the root
                let resource = error.resource().or(ctx.resource.as_ref());
                let recovery =
                    self.recover_after(category, resource, ctx, failures, error.retry_after());
                if recovery == Recovery::Recovered {
                    if !category.is_retryable() {
                        one_shot_used.insert(category);
                    }
                    if category == ErrorCategory::StateCorruption {
                        // The incident is recorded even though the operation continues
                        self.file_report(
                            category,
                            ctx,
                            &error.to_string(),
                            RecoveryOutcome::Succeeded,
                            failures,
                            transitions.clone(),
                        );
                    }
                    self.step(ctx, &mut transitions, AttemptState::Retrying);
                    continue;
                }
                RecoveryOutcome::Failed
            } else if category.has_recovery() {
                // One-shot recovery already spent
                RecoveryOutcome::Failed
            } else {
                RecoveryOutcome::NotAttempted
            };

            self.step(ctx, &mut transitions, AttemptState::GivingUp);
            transitions.push(AttemptState::Reported);
            let report = self.file_report(
                category,
                ctx,
                &error.to_string(),
                outcome,
                failures,
                transitions,
            );
            log::debug!("{ctx}: {}", AttemptState::Reported);
            return Outcome::Reported { report, error };
        }
    }

    fn step(&self, ctx: &OperationContext, transitions: &mut Vec<AttemptState>, next: AttemptState) {
        log::debug!("{ctx}: {next}");
        transitions.push(next);
    }

    /// Build the report and persist it. Persistence failures are logged, not
    /// propagated: the caller still gets the report.
    fn file_report(
        &self,
        category: ErrorCategory,
        ctx: &OperationContext,
        details: &str,
        recovery: RecoveryOutcome,
        attempts: u32,
        transitions: Vec<AttemptState>,
    ) -> ErrorReport {
        let created_at = Utc::now();
        let report = ErrorReport {
            id: error_id(category, created_at),
            category,
            message: details.to_string(),
            context: ctx.clone(),
            created_at,
            recovery,
            attempts,
            transitions,
            environment: EnvironmentSnapshot::capture(),
            log_tail: self.log_tail.recent(self.report.log_tail_lines),
        };

        match write_report(&self.diagnostics_dir, &report) {
            Ok(path) => log::error!(
                "{} [{}]: {} (recovery {recovery}); report at {}",
                category.description(),
                report.id,
                report.message,
                path.display()
            ),
            Err(e) => log::error!(
                "{} [{}]: {} (recovery {recovery}); report could not be saved: {e}",
                category.description(),
                report.id,
                report.message
            ),
        }
        report
    }
}

/// `<CODE>-<YYYYMMDDTHHMMSSZ>-<pid>-<seq>`
fn error_id(category: ErrorCategory, at: DateTime<Utc>) -> String {
    let seq = REPORT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}-{}-{seq}",
        category.code(),
        at.format("%Y%m%dT%H%M%SZ"),
        std::process::id()
    )
}

fn write_report(dir: &Path, report: &ErrorReport) -> Result<PathBuf, Error> {
    let path = dir.join(format!("{}.json", report.id));
    let diagnostics = |source: io::Error| Error::Diagnostics {
        path: path.clone(),
        source,
    };
    let data = serde_json::to_vec_pretty(report).map_err(|e| diagnostics(io::Error::other(e)))?;
    if !fsutil::create_exclusive(&path, &data).map_err(diagnostics)? {
        return Err(diagnostics(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "report already exists",
        )));
    }
    Ok(path)
}

// ============================================================================
// Report Inspection
// ============================================================================

/// Every report in `dir`, oldest first. Unreadable files are skipped.
pub fn list_reports(dir: &Path) -> Result<Vec<ErrorReport>, Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(Error::Diagnostics {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut reports = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| Error::Diagnostics {
                path: dir.to_path_buf(),
                source,
            })?
            .path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_report(&path) {
            Ok(report) => reports.push(report),
            Err(e) => log::warn!("Skipping unreadable report {}: {e}", path.display()),
        }
    }
    reports.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(reports)
}

/// The report with identifier `id`, if present.
pub fn load_report(dir: &Path, id: &str) -> Result<Option<ErrorReport>, Error> {
    let path = dir.join(format!("{id}.json"));
    if !path.exists() {
        return Ok(None);
    }
    read_report(&path).map(Some)
}

fn read_report(path: &Path) -> Result<ErrorReport, Error> {
    let raw = fs::read(path).map_err(|source| Error::Diagnostics {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|e| Error::Diagnostics {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })
}
