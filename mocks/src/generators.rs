//! Random test data generators using the fake crate
//!
//! Provides realistic random data including:
//! - Report ids and names
//! - Random reports with plausible totals and currencies
//! - Property-based testing strategies

use crate::builders::ReportBuilder;
use expense_core::Report;
use fake::faker::lorem::en::Sentence;
use fake::faker::name::en::Name;
use fake::Fake;
use proptest::prelude::*;
use rand::Rng;

const CURRENCIES: [&str; 5] = ["USD", "EUR", "GBP", "CHF", "JPY"];
const STATUSES: [&str; 4] = ["Not Submitted", "Submitted", "Approved", "Sent Back to Employee"];

/// Generate a backend-style report id (upper-case alphanumerics)
pub fn generate_report_id() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let idx = rng.gen_range(0..36u8);
            if idx < 10 {
                char::from(b'0' + idx)
            } else {
                char::from(b'A' + idx - 10)
            }
        })
        .collect()
}

/// Generate a random report with realistic data
pub fn generate_random_report() -> Report {
    let mut rng = rand::thread_rng();
    let total = f64::from(rng.gen_range(100..500_000u32)) / 100.0;
    ReportBuilder::new(generate_report_id())
        .with_name(Sentence(2..5).fake::<String>())
        .with_total(total, CURRENCIES[rng.gen_range(0..CURRENCIES.len())])
        .with_status(STATUSES[rng.gen_range(0..STATUSES.len())])
        .with_owner(Name().fake::<String>())
        .build()
}

/// Generate `count` random reports
pub fn generate_random_reports(count: usize) -> Vec<Report> {
    (0..count).map(|_| generate_random_report()).collect()
}

/// Any requested page size, including out-of-range values
pub fn limit_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![0u32..=150, any::<u32>()]
}

/// Report ids the backend accepts
pub fn report_id_strategy() -> impl Strategy<Value = String> {
    "[A-Z0-9]{1,24}"
}

/// Strings that must never be accepted as report ids
pub fn hostile_report_id_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        "[A-Z0-9]{0,8}/[A-Z0-9]{0,8}",
        "[A-Z0-9]{0,8}\\.\\.[A-Z0-9]{0,8}",
        "[A-Z0-9]{0,8}[?#][A-Z0-9]{0,8}",
    ]
}

prop_compose! {
    /// Arbitrary report with an id and optional total
    pub fn arb_report()(id in report_id_strategy(), total in proptest::option::of(0.0f64..1.0e6)) -> Report {
        Report { id, total, ..Report::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expense_core::{clamp_limit, MAX_LIMIT, MIN_LIMIT};

    #[test]
    fn test_generated_reports_are_plausible() {
        for report in generate_random_reports(20) {
            assert_eq!(report.id.len(), 16);
            assert!(report.id.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(report.total.unwrap_or_default() >= 1.0);
        }
    }

    proptest! {
        #[test]
        fn prop_clamp_limit_in_range(limit in limit_strategy()) {
            let clamped = clamp_limit(limit);
            prop_assert!((MIN_LIMIT..=MAX_LIMIT).contains(&clamped));
            if (MIN_LIMIT..=MAX_LIMIT).contains(&limit) {
                prop_assert_eq!(clamped, limit);
            }
        }

        #[test]
        fn prop_arb_report_has_id(report in arb_report()) {
            prop_assert!(!report.id.is_empty());
        }
    }
}
