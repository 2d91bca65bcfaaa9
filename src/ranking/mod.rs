//! Frecency ranking of payment apps.
//!
//! Preferred apps come first. Apps sharing an `installation_key` stay
//! adjacent: each group ranks by its best member, and members rank by their
//! own score. Equal scores keep discovery order.

pub mod store;

use std::cmp::Ordering;

use crate::app::PaymentApp;

pub use self::store::{FrecencyRecord, FrecencyStore, SharedFrecencyStore};

const MILLIS_PER_DAY: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// Source of usage records for ranking.
pub trait FrecencyLookup {
    fn frecency_record(&self, id: &str) -> FrecencyRecord;
}

/// Frecency score; higher ranks earlier.
///
/// `-ln(days_since_last_use + 2) / ln(use_count + 2)`. More uses and more
/// recent use both raise the score.
pub fn frecency_score(record: &FrecencyRecord, now_ms: i64) -> f64 {
    let elapsed_ms = now_ms.saturating_sub(record.last_use_date).max(0);
    let days_since_last_use = elapsed_ms as f64 / MILLIS_PER_DAY;
    -(days_since_last_use + 2.0).ln() / (record.use_count as f64 + 2.0).ln()
}

struct Scored {
    app: PaymentApp,
    score: f64,
}

struct Group {
    key: String,
    preferred: bool,
    best_score: f64,
    members: Vec<Scored>,
}

fn by_preference_then_score(
    a_preferred: bool,
    a_score: f64,
    b_preferred: bool,
    b_score: f64,
) -> Ordering {
    b_preferred
        .cmp(&a_preferred)
        .then_with(|| b_score.total_cmp(&a_score))
}

/// Order `apps` (given in discovery order) for display.
pub fn rank(apps: Vec<PaymentApp>, lookup: &dyn FrecencyLookup, now_ms: i64) -> Vec<PaymentApp> {
    let mut groups: Vec<Group> = Vec::new();
    for app in apps {
        let score = frecency_score(&lookup.frecency_record(&app.identifier), now_ms);
        let scored = Scored { app, score };
        match groups
            .iter_mut()
            .find(|group| group.key == scored.app.installation_key)
        {
            Some(group) => {
                group.preferred |= scored.app.preferred;
                group.best_score = group.best_score.max(score);
                group.members.push(scored);
            }
            None => groups.push(Group {
                key: scored.app.installation_key.clone(),
                preferred: scored.app.preferred,
                best_score: score,
                members: vec![scored],
            }),
        }
    }

    // Both sorts are stable, so ties keep discovery order.
    groups.sort_by(|a, b| by_preference_then_score(a.preferred, a.best_score, b.preferred, b.best_score));
    groups
        .into_iter()
        .flat_map(|mut group| {
            group.members.sort_by(|a, b| {
                by_preference_then_score(a.app.preferred, a.score, b.app.preferred, b.score)
            });
            group.members.into_iter().map(|scored| scored.app)
        })
        .collect()
}

/// Index of the first ranked app that may be pre-selected.
pub fn preselected_index(ranked: &[PaymentApp]) -> Option<usize> {
    ranked.iter().position(|app| app.can_preselect)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn identifiers(apps: &[PaymentApp]) -> Vec<&str> {
        apps.iter().map(|a| a.identifier.as_str()).collect()
    }

    fn store_with_counts(counts: &[(&str, u64)]) -> FrecencyStore {
        let mut store = FrecencyStore::in_memory();
        for (id, count) in counts {
            store.set_use_count(id, *count);
        }
        store
    }

    #[test]
    fn more_uses_and_recent_use_score_higher() {
        let never = FrecencyRecord::default();
        let used_once = FrecencyRecord {
            use_count: 1,
            last_use_date: 0,
        };
        let recent = FrecencyRecord {
            use_count: 1,
            last_use_date: NOW,
        };
        assert!(frecency_score(&used_once, NOW) > frecency_score(&never, NOW));
        assert!(frecency_score(&recent, NOW) > frecency_score(&used_once, NOW));
    }

    #[test]
    fn unused_apps_keep_discovery_order() {
        let apps = vec![
            PaymentApp::mock("c", &["m"]),
            PaymentApp::mock("a", &["m"]),
            PaymentApp::mock("b", &["m"]),
        ];
        let ranked = rank(apps, &FrecencyStore::in_memory(), NOW);
        assert_eq!(identifiers(&ranked), vec!["c", "a", "b"]);
    }

    #[test]
    fn use_counts_order_apps() {
        let apps = vec![
            PaymentApp::mock("alicepay", &["m"]),
            PaymentApp::mock("bobpay", &["m"]),
            PaymentApp::mock("charliepay", &["m"]),
        ];
        let mut store = store_with_counts(&[("alicepay", 5), ("bobpay", 10), ("charliepay", 15)]);
        let ranked = rank(apps.clone(), &store, NOW);
        assert_eq!(identifiers(&ranked), vec!["charliepay", "bobpay", "alicepay"]);

        store.set_use_count("alicepay", 20);
        let ranked = rank(apps, &store, NOW);
        assert_eq!(identifiers(&ranked), vec!["alicepay", "charliepay", "bobpay"]);
    }

    #[test]
    fn preferred_apps_rank_first() {
        let mut twa = PaymentApp::mock("twa", &["m"]);
        twa.preferred = true;
        let apps = vec![PaymentApp::mock("popular", &["m"]), twa];
        let store = store_with_counts(&[("popular", 100)]);
        assert_eq!(identifiers(&rank(apps, &store, NOW)), vec!["twa", "popular"]);
    }

    #[test]
    fn same_installation_stays_adjacent() {
        let mut first = PaymentApp::mock("shared/one", &["m"]);
        first.installation_key = "shared".to_string();
        let mut second = PaymentApp::mock("shared/two", &["m"]);
        second.installation_key = "shared".to_string();
        let apps = vec![first, PaymentApp::mock("middle", &["m"]), second];

        let store = store_with_counts(&[("shared/one", 1), ("middle", 5), ("shared/two", 10)]);
        let ranked = rank(apps, &store, NOW);
        assert_eq!(identifiers(&ranked), vec!["shared/two", "shared/one", "middle"]);
    }

    #[test]
    fn preselection_skips_apps_that_cannot_be_preselected() {
        let mut hidden = PaymentApp::mock("hidden", &["m"]);
        hidden.can_preselect = false;
        let ranked = vec![hidden, PaymentApp::mock("shown", &["m"])];
        assert_eq!(preselected_index(&ranked), Some(1));
        assert!(preselected_index(&[]).is_none());
    }
}
