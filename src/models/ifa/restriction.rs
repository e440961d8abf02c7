//! Structure descriptors for the loading restriction `L` and the regression
//! restriction `T`.
//!
//! Dense restriction matrices are parsed once into index sets so that the
//! item and regression stages only ever visit free entries.

use std::collections::BTreeMap;

use faer::Mat;
use num_traits::ToPrimitive;

use super::types::IfaError;

/// Role of a single loading entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingConstraint {
    /// Structural zero; never sampled.
    Zero,
    /// Sampled freely with its item.
    Free,
    /// Shares one value with every entry carrying the same label.
    Tied(usize),
}

/// Entries sharing one tie label, as `(item, factor)` pairs in row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieGroup {
    pub label: usize,
    pub members: Vec<(usize, usize)>,
}

impl TieGroup {
    /// Factors of `item` that belong to the group.
    pub fn factors_of(&self, item: usize) -> impl Iterator<Item = usize> + '_ {
        self.members
            .iter()
            .filter(move |(member_item, _)| *member_item == item)
            .map(|(_, factor)| *factor)
    }

    /// Distinct items touched by the group.
    #[must_use]
    pub fn items(&self) -> Vec<usize> {
        let mut items: Vec<usize> = self.members.iter().map(|(item, _)| *item).collect();
        items.dedup();
        items
    }
}

/// Parsed loading restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadingStructure {
    n_items: usize,
    n_factors: usize,
    entries: Vec<LoadingConstraint>,
    free_by_item: Vec<Vec<usize>>,
    tie_groups: Vec<TieGroup>,
}

impl LoadingStructure {
    /// Parse `L`: `0` is a structural zero, `1` a free entry and any integer
    /// `g >= 2` a tie label. A label used only once behaves as a free entry.
    ///
    /// # Errors
    ///
    /// Returns `IfaError::InvalidRestriction` for negative, fractional or
    /// non-finite codes.
    pub fn from_matrix(restriction: &Mat<f64>) -> Result<Self, IfaError> {
        let n_items = restriction.nrows();
        let n_factors = restriction.ncols();
        let mut codes = Vec::with_capacity(n_items * n_factors);
        for item in 0..n_items {
            for factor in 0..n_factors {
                let value = restriction[(item, factor)];
                let code = integer_code(value).ok_or(IfaError::InvalidRestriction {
                    what: "loading restriction",
                    row: item,
                    col: factor,
                    value,
                })?;
                codes.push(code);
            }
        }

        let mut labelled: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        for (index, code) in codes.iter().enumerate() {
            if *code >= 2 {
                labelled
                    .entry(*code)
                    .or_default()
                    .push((index / n_factors, index % n_factors));
            }
        }

        let entries: Vec<LoadingConstraint> = codes
            .iter()
            .map(|code| match *code {
                0 => LoadingConstraint::Zero,
                1 => LoadingConstraint::Free,
                label if labelled.get(&label).is_some_and(|members| members.len() > 1) => {
                    LoadingConstraint::Tied(label)
                }
                _ => LoadingConstraint::Free,
            })
            .collect();

        let free_by_item = (0..n_items)
            .map(|item| {
                (0..n_factors)
                    .filter(|factor| entries[item * n_factors + factor] == LoadingConstraint::Free)
                    .collect()
            })
            .collect();
        let tie_groups = labelled
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(label, members)| TieGroup { label, members })
            .collect();

        Ok(Self {
            n_items,
            n_factors,
            entries,
            free_by_item,
            tie_groups,
        })
    }

    /// Every loading free.
    #[must_use]
    pub fn unrestricted(n_items: usize, n_factors: usize) -> Self {
        Self {
            n_items,
            n_factors,
            entries: vec![LoadingConstraint::Free; n_items * n_factors],
            free_by_item: vec![(0..n_factors).collect(); n_items],
            tie_groups: Vec::new(),
        }
    }

    #[must_use]
    pub const fn n_items(&self) -> usize {
        self.n_items
    }

    #[must_use]
    pub const fn n_factors(&self) -> usize {
        self.n_factors
    }

    #[must_use]
    pub fn constraint(&self, item: usize, factor: usize) -> LoadingConstraint {
        self.entries[item * self.n_factors + factor]
    }

    /// Factors of `item` sampled in the per-item block.
    #[must_use]
    pub fn free_factors(&self, item: usize) -> &[usize] {
        &self.free_by_item[item]
    }

    #[must_use]
    pub fn tie_groups(&self) -> &[TieGroup] {
        &self.tie_groups
    }

    /// `L o A`: the discriminations with structural zeros enforced.
    #[must_use]
    pub fn restrict(&self, discrimination: &Mat<f64>) -> Mat<f64> {
        Mat::from_fn(self.n_items, self.n_factors, |item, factor| {
            match self.constraint(item, factor) {
                LoadingConstraint::Zero => 0.0,
                LoadingConstraint::Free | LoadingConstraint::Tied(_) => {
                    discrimination[(item, factor)]
                }
            }
        })
    }

    /// Copy of `discrimination` with zeros enforced and each tie group set to
    /// the mean of its members.
    #[must_use]
    pub fn harmonize(&self, discrimination: &Mat<f64>) -> Mat<f64> {
        let mut harmonized = self.restrict(discrimination);
        for group in &self.tie_groups {
            let total: f64 = group
                .members
                .iter()
                .map(|(item, factor)| harmonized[(*item, *factor)])
                .sum();
            let mean = total / crate::utils::usize_to_f64(group.members.len());
            for (item, factor) in &group.members {
                harmonized[(*item, *factor)] = mean;
            }
        }
        harmonized
    }
}

/// Parsed regression restriction: `1` marks a free coefficient, `0` a zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovariateStructure {
    n_predictors: usize,
    n_factors: usize,
    free_entries: Vec<(usize, usize)>,
}

impl CovariateStructure {
    /// # Errors
    ///
    /// Returns `IfaError::InvalidRestriction` for codes other than `0`/`1`.
    pub fn from_matrix(restriction: &Mat<f64>) -> Result<Self, IfaError> {
        let mut free_entries = Vec::new();
        for predictor in 0..restriction.nrows() {
            for factor in 0..restriction.ncols() {
                let value = restriction[(predictor, factor)];
                match integer_code(value) {
                    Some(0) => {}
                    Some(1) => free_entries.push((predictor, factor)),
                    _ => {
                        return Err(IfaError::InvalidRestriction {
                            what: "covariate restriction",
                            row: predictor,
                            col: factor,
                            value,
                        });
                    }
                }
            }
        }
        Ok(Self {
            n_predictors: restriction.nrows(),
            n_factors: restriction.ncols(),
            free_entries,
        })
    }

    #[must_use]
    pub fn unrestricted(n_predictors: usize, n_factors: usize) -> Self {
        Self {
            n_predictors,
            n_factors,
            free_entries: (0..n_predictors)
                .flat_map(|predictor| (0..n_factors).map(move |factor| (predictor, factor)))
                .collect(),
        }
    }

    #[must_use]
    pub const fn n_predictors(&self) -> usize {
        self.n_predictors
    }

    #[must_use]
    pub const fn n_factors(&self) -> usize {
        self.n_factors
    }

    /// Free `(predictor, factor)` coefficients in row-major order.
    #[must_use]
    pub fn free_entries(&self) -> &[(usize, usize)] {
        &self.free_entries
    }

    /// Copy of `coefficients` with restricted entries set to zero.
    #[must_use]
    pub fn restrict(&self, coefficients: &Mat<f64>) -> Mat<f64> {
        let mut restricted = Mat::<f64>::zeros(self.n_predictors, self.n_factors);
        for (predictor, factor) in &self.free_entries {
            restricted[(*predictor, *factor)] = coefficients[(*predictor, *factor)];
        }
        restricted
    }
}

fn integer_code(value: f64) -> Option<usize> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 {
        value.to_usize()
    } else {
        None
    }
}
