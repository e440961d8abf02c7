use faer::Mat;
use num_traits::ToPrimitive;

use crate::utils::usize_to_f64;

/// Observed/missing counts and category frequencies for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemResponseSummary {
    pub item: usize,
    pub n_observed: usize,
    pub n_missing: usize,
    /// Count per category `0..=max observed`; empty when nothing is observed.
    pub category_counts: Vec<usize>,
    pub observed_share: f64,
}

impl ItemResponseSummary {
    #[must_use]
    pub const fn all_missing(&self) -> bool {
        self.n_observed == 0
    }

    /// Number of categories the item model uses (at least two).
    #[must_use]
    pub fn n_categories(&self) -> usize {
        self.category_counts.len().max(2)
    }
}

/// Category index of a response cell, or `None` for a missing response.
#[must_use]
pub fn response_category(value: f64) -> Option<usize> {
    if value.is_nan() { None } else { value.to_usize() }
}

/// Per-item response diagnostics. Items without any observed response are
/// logged, since their parameters are then driven by the prior alone.
#[must_use]
pub fn response_diagnostics(responses: &Mat<f64>) -> Vec<ItemResponseSummary> {
    let n_rows = responses.nrows();
    (0..responses.ncols())
        .map(|item| {
            let mut category_counts: Vec<usize> = Vec::new();
            let mut n_observed = 0usize;
            for row in 0..n_rows {
                let Some(category) = response_category(responses[(row, item)]) else {
                    continue;
                };
                n_observed += 1;
                if category >= category_counts.len() {
                    category_counts.resize(category + 1, 0);
                }
                category_counts[category] += 1;
            }
            if n_observed == 0 {
                log::warn!("item {item} has no observed responses; its parameters follow the prior");
            }
            let observed_share = if n_rows > 0 {
                usize_to_f64(n_observed) / usize_to_f64(n_rows)
            } else {
                0.0
            };
            ItemResponseSummary {
                item,
                n_observed,
                n_missing: n_rows - n_observed,
                category_counts,
                observed_share,
            }
        })
        .collect()
}

/// Items whose categories skip a value between 0 and the observed maximum.
///
/// Empty categories leave their thresholds weakly identified.
#[must_use]
pub fn items_with_empty_categories(summaries: &[ItemResponseSummary]) -> Vec<usize> {
    summaries
        .iter()
        .filter(|summary| summary.category_counts.contains(&0))
        .map(|summary| summary.item)
        .collect()
}
