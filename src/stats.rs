/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("Cannot compute mean of an empty sample set")]
    Empty,
}

/// Running sum and count of a stream of samples.
///
/// Summaries can be built independently over shards of the samples and merged with
/// [`Summary::combine`]; the mean of the merged summary equals the mean of all samples
/// (up to ordinary floating point rounding).
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Summary {
    sum: f64,
    count: usize,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn combine(&mut self, other: &Summary) {
        self.sum += other.sum;
        self.count += other.count;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Arithmetic mean of every accepted sample. An empty summary is an error rather
    /// than 0.0, which would be indistinguishable from a real zero result.
    pub fn mean(&self) -> Result<f64, StatsError> {
        if self.count == 0 {
            return Err(StatsError::Empty);
        }
        Ok(self.sum / self.count as f64)
    }
}

impl Extend<f64> for Summary {
    fn extend<T: IntoIterator<Item = f64>>(&mut self, iter: T) {
        for value in iter {
            self.accept(value);
        }
    }
}

impl FromIterator<f64> for Summary {
    fn from_iter<T: IntoIterator<Item = f64>>(iter: T) -> Self {
        let mut summary = Summary::new();
        summary.extend(iter);
        summary
    }
}

pub fn mean<I: IntoIterator<Item = f64>>(samples: I) -> Result<f64, StatsError> {
    samples.into_iter().collect::<Summary>().mean()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_mean(samples: &[f64]) -> f64 {
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted.iter().sum::<f64>() / sorted.len() as f64
    }

    #[test]
    fn mean_matches_reference_implementation() {
        let cases: Vec<Vec<f64>> = vec![
            vec![1.0],
            vec![10.0, 10.0],
            vec![12.3, 45.6, 78.9],
            vec![0.001, 1_000_000.0, 3.5, -2.25, 17.0],
            (1..=100).map(|i| i as f64 * 0.37).collect(),
        ];

        for samples in cases {
            let actual = mean(samples.iter().copied()).unwrap();
            let expected = reference_mean(&samples);
            assert!(
                (actual - expected).abs() < 1e-9 * expected.abs().max(1.0),
                "{actual} != {expected} for {samples:?}"
            );
        }
    }

    #[test]
    fn empty_mean_is_an_error_not_zero() {
        assert_eq!(mean(std::iter::empty()), Err(StatsError::Empty));
        assert_eq!(Summary::new().mean(), Err(StatsError::Empty));
    }

    #[test]
    fn combined_shards_equal_single_pass() {
        let samples = [4.0, 8.0, 15.0, 16.0, 23.0, 42.0];
        let whole: Summary = samples.iter().copied().collect();

        let mut left: Summary = samples[..2].iter().copied().collect();
        let right: Summary = samples[2..].iter().copied().collect();
        left.combine(&right);

        assert_eq!(left.count(), whole.count());
        assert_eq!(left.mean(), whole.mean());
        assert_eq!(whole.mean(), Ok(18.0));
    }

    #[test]
    fn combining_with_empty_is_identity() {
        let mut summary: Summary = [2.0, 4.0].into_iter().collect();
        summary.combine(&Summary::new());
        assert_eq!(summary.count(), 2);
        assert_eq!(summary.sum(), 6.0);
        assert_eq!(summary.mean(), Ok(3.0));
    }
}
