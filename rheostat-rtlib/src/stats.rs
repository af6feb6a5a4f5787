// Copyright 2025 Rheostat Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Sliding-window accumulator for cycle-time and CPU-usage samples.
//! Count, mean and sample variance are maintained incrementally as the
//! window slides.

use std::collections::VecDeque;

const Z_90: f64 = 1.645;
const Z_99: f64 = 2.576;

#[derive(Debug, Clone)]
pub struct SlidingStats {
    window: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    sum_of_squares: f64,
    last: f64,
}

impl Default for SlidingStats {
    fn default() -> Self {
        Self::new(30)
    }
}

impl SlidingStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            sum_of_squares: 0.0,
            last: 0.0,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.window.len() == self.capacity {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
                self.sum_of_squares -= evicted * evicted;
            }
        }
        self.window.push_back(sample);
        self.sum += sample;
        self.sum_of_squares += sample * sample;
        self.last = sample;
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.sum = 0.0;
        self.sum_of_squares = 0.0;
        self.last = 0.0;
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.sum / self.window.len() as f64
        }
    }

    /// Sample variance over the window.
    pub fn variance(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        let n = n as f64;
        ((self.sum_of_squares - self.sum * self.sum / n) / (n - 1.0)).max(0.0)
    }

    pub fn standard_deviation(&self) -> f64 {
        self.variance().sqrt()
    }

    fn confidence_interval(&self, z: f64) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        z * self.standard_deviation() / (n as f64).sqrt()
    }

    pub fn confidence_interval_90(&self) -> f64 {
        self.confidence_interval(Z_90)
    }

    pub fn confidence_interval_99(&self) -> f64 {
        self.confidence_interval(Z_99)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn mean_and_variance_track_the_window() {
        let mut stats = SlidingStats::new(4);
        for sample in [10.0, 12.0, 14.0, 16.0] {
            stats.push(sample);
        }
        assert_eq!(stats.count(), 4);
        assert_eq!(stats.mean(), 13.0);
        assert!((stats.variance() - 20.0 / 3.0).abs() < 1e-9);

        // Sliding out the oldest sample moves the mean.
        stats.push(18.0);
        assert_eq!(stats.count(), 4);
        assert_eq!(stats.mean(), 15.0);
        assert_eq!(stats.last(), 18.0);
    }

    #[test]
    fn degenerate_windows_have_no_spread() {
        let mut stats = SlidingStats::new(8);
        assert_eq!(stats.mean(), 0.0);
        stats.push(5.0);
        assert_eq!(stats.variance(), 0.0);
        assert_eq!(stats.confidence_interval_99(), 0.0);
    }
}
