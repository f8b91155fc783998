//! Pure aggregations over the contribution log.
//!
//! Aggregates are recomputed from the append-only log on every call,
//! never stored. Invariant: the sum of per-contributor month totals
//! equals the month total equals the sum of that month's contribution
//! amounts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::contribution::Contribution;

/// Per-contributor aggregate within one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributorTotal {
    pub user_id: String,
    pub total_usd_cents: u64,
    pub contribution_count: usize,
}

/// One month of pool activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthSummary {
    pub month: String,
    pub total_usd_cents: u64,
    pub contribution_count: usize,
    pub unique_contributors: usize,
    /// Sorted by total desc, user id asc on ties.
    pub contributors: Vec<ContributorTotal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthTotal {
    pub month: String,
    pub total_usd_cents: u64,
    pub contribution_count: usize,
}

/// Lifetime view of one contributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub user_id: String,
    pub lifetime_usd_cents: u64,
    /// Sorted by month desc (most recent first).
    pub months: Vec<MonthTotal>,
    pub last_contribution_at: Option<DateTime<Utc>>,
}

pub fn monthly_summary(contributions: &[Contribution], month: &str) -> MonthSummary {
    let mut totals: BTreeMap<&str, ContributorTotal> = BTreeMap::new();
    let mut total_usd_cents = 0u64;
    let mut contribution_count = 0usize;

    for contribution in contributions.iter().filter(|c| c.month == month) {
        total_usd_cents += contribution.amount_usd_cents;
        contribution_count += 1;
        let entry = totals
            .entry(contribution.user_id.as_str())
            .or_insert_with(|| ContributorTotal {
                user_id: contribution.user_id.clone(),
                total_usd_cents: 0,
                contribution_count: 0,
            });
        entry.total_usd_cents += contribution.amount_usd_cents;
        entry.contribution_count += 1;
    }

    let mut contributors: Vec<ContributorTotal> = totals.into_values().collect();
    contributors.sort_by(|a, b| {
        b.total_usd_cents
            .cmp(&a.total_usd_cents)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    MonthSummary {
        month: month.to_string(),
        total_usd_cents,
        contribution_count,
        unique_contributors: contributors.len(),
        contributors,
    }
}

pub fn user_summary(contributions: &[Contribution], user_id: &str) -> UserSummary {
    let mut months: BTreeMap<&str, MonthTotal> = BTreeMap::new();
    let mut lifetime_usd_cents = 0u64;
    let mut last_contribution_at: Option<DateTime<Utc>> = None;

    for contribution in contributions.iter().filter(|c| c.user_id == user_id) {
        lifetime_usd_cents += contribution.amount_usd_cents;
        last_contribution_at = Some(match last_contribution_at {
            Some(latest) => latest.max(contribution.contributed_at),
            None => contribution.contributed_at,
        });
        let entry = months
            .entry(contribution.month.as_str())
            .or_insert_with(|| MonthTotal {
                month: contribution.month.clone(),
                total_usd_cents: 0,
                contribution_count: 0,
            });
        entry.total_usd_cents += contribution.amount_usd_cents;
        entry.contribution_count += 1;
    }

    let mut months: Vec<MonthTotal> = months.into_values().collect();
    months.sort_by(|a, b| b.month.cmp(&a.month));

    UserSummary {
        user_id: user_id.to_string(),
        lifetime_usd_cents,
        months,
        last_contribution_at,
    }
}

/// Per-contributor aggregates for the batch driver's weights.
pub fn month_contributors(contributions: &[Contribution], month: &str) -> Vec<ContributorTotal> {
    monthly_summary(contributions, month).contributors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contribution::{ContributionInput, ContributionSource};

    fn contribution(user: &str, cents: u64, at: &str) -> Contribution {
        ContributionInput {
            user_id: Some(user.to_string()),
            amount_usd_cents: cents,
            contributed_at: at.to_string(),
            source: Some(ContributionSource::OneOff),
            ..Default::default()
        }
        .into_record(format!("c-{}-{}", user, at))
        .unwrap()
    }

    fn sample_log() -> Vec<Contribution> {
        vec![
            contribution("alice", 300, "2026-03-01T00:00:00Z"),
            contribution("bob", 500, "2026-03-10T00:00:00Z"),
            contribution("alice", 200, "2026-03-20T00:00:00Z"),
            contribution("alice", 100, "2026-04-02T00:00:00Z"),
        ]
    }

    #[test]
    fn month_totals_reconcile() {
        let log = sample_log();
        let summary = monthly_summary(&log, "2026-03");
        assert_eq!(summary.total_usd_cents, 1000);
        assert_eq!(summary.contribution_count, 3);
        assert_eq!(summary.unique_contributors, 2);
        let contributor_sum: u64 = summary.contributors.iter().map(|c| c.total_usd_cents).sum();
        assert_eq!(contributor_sum, summary.total_usd_cents);
    }

    #[test]
    fn contributors_sorted_desc_with_stable_ties() {
        let log = vec![
            contribution("zed", 100, "2026-03-01T00:00:00Z"),
            contribution("amy", 100, "2026-03-01T00:00:00Z"),
            contribution("bob", 900, "2026-03-01T00:00:00Z"),
        ];
        let summary = monthly_summary(&log, "2026-03");
        let order: Vec<&str> = summary
            .contributors
            .iter()
            .map(|c| c.user_id.as_str())
            .collect();
        assert_eq!(order, vec!["bob", "amy", "zed"]);
    }

    #[test]
    fn user_summary_spans_months_most_recent_first() {
        let log = sample_log();
        let summary = user_summary(&log, "alice");
        assert_eq!(summary.lifetime_usd_cents, 600);
        let months: Vec<&str> = summary.months.iter().map(|m| m.month.as_str()).collect();
        assert_eq!(months, vec!["2026-04", "2026-03"]);
        assert_eq!(
            summary.last_contribution_at.unwrap().to_rfc3339(),
            "2026-04-02T00:00:00+00:00"
        );
    }

    #[test]
    fn unknown_user_and_empty_month_are_empty() {
        let log = sample_log();
        assert_eq!(user_summary(&log, "nobody").lifetime_usd_cents, 0);
        assert_eq!(monthly_summary(&log, "2025-01").contribution_count, 0);
    }
}
