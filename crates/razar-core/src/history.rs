//! Boot history: bounded run log, best-known sequence, cumulative failures.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use razar_state::{BestSequence, BootHistory, ComponentRun, HistoryStore, RunMetrics};

use crate::domain::Result;

/// Build the snapshot for a finished run.
pub fn summarize_run(components: Vec<ComponentRun>, total_time: f64) -> RunMetrics {
    let attempted = components.len();
    let successes = components.iter().filter(|c| c.success).count();
    let component_attempts: u32 = components.iter().map(|c| c.attempts).sum();
    let retries: u32 = components
        .iter()
        .map(|c| c.attempts.saturating_sub(1))
        .sum();
    let first_attempt_successes = components
        .iter()
        .filter(|c| c.success && c.attempts <= 1)
        .count() as u32;
    let success_rate = if attempted == 0 {
        0.0
    } else {
        successes as f64 / attempted as f64
    };
    RunMetrics {
        timestamp: chrono::Utc::now(),
        components,
        success_rate,
        total_time,
        component_attempts,
        retries,
        first_attempt_successes,
    }
}

/// Fewest failures, then higher success rate, then shorter total time.
fn better_than(candidate: &RunMetrics, best: &BestSequence) -> bool {
    let failures = candidate.failures();
    if failures != best.failures {
        return failures < best.failures;
    }
    match candidate
        .success_rate
        .partial_cmp(&best.success_rate)
        .unwrap_or(Ordering::Equal)
    {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.total_time < best.total_time,
    }
}

/// Append `run`, trim to `limit`, refresh the best sequence and replace the
/// cumulative failure counts. Returns the saved document.
pub fn finalize_metrics(
    store: &dyn HistoryStore,
    run: &RunMetrics,
    failure_counts: &BTreeMap<String, u32>,
    limit: usize,
) -> Result<BootHistory> {
    let mut history = store.load()?;
    history.history.push(run.clone());
    if limit > 0 && history.history.len() > limit {
        let excess = history.history.len() - limit;
        history.history.drain(..excess);
    }

    let replace = match &history.best_sequence {
        None => true,
        Some(best) => better_than(run, best),
    };
    if replace && !run.components.is_empty() {
        history.best_sequence = Some(BestSequence {
            components: run.components.iter().map(|c| c.name.clone()).collect(),
            success_rate: run.success_rate,
            total_time: run.total_time,
            failures: run.failures(),
            timestamp: run.timestamp,
        });
    }
    history.component_failures = failure_counts.clone();

    store.save(&history)?;
    tracing::debug!(
        runs = history.history.len(),
        success_rate = run.success_rate,
        "boot history updated"
    );
    Ok(history)
}
