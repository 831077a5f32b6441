/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bounded rolling average of an integer metric.
//!
//! The [`SimulationManager`](crate::simulation::manager::SimulationManager) keeps one `MovingAverage`
//! for the local frame execution time, and one per remote peer for the round trip time measured from
//! commit acknowledgements.
//!
//! The window starts out filled with the seed value, so before `window` samples have been recorded the
//! average is pulled toward the seed, and exactly equal to it before the first sample.

use std::collections::VecDeque;

#[derive(Clone, Debug)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<u64>,
    sum: u64,
}

impl MovingAverage {
    /// Create a new `MovingAverage` over the last `window` samples, seeded with `seed`. A `window` of 0
    /// is treated as 1.
    pub fn new(window: usize, seed: u64) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: std::iter::repeat(seed).take(window).collect(),
            sum: seed.saturating_mul(window as u64),
        }
    }

    /// Push a new sample, overwriting the oldest one.
    pub fn record(&mut self, sample: u64) {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(oldest);
            }
        }
        self.samples.push_back(sample);
        self.sum = self.sum.saturating_add(sample);
    }

    /// The integer mean of the samples currently held.
    pub fn average(&self) -> u64 {
        self.sum / self.samples.len() as u64
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

#[test]
fn moving_average_starts_at_seed_test() {
    let average = MovingAverage::new(4, 70);
    assert_eq!(average.average(), 70);
}

#[test]
fn moving_average_overwrites_oldest_sample_test() {
    let mut average = MovingAverage::new(4, 0);
    average.record(40);
    assert_eq!(average.average(), 10);

    for sample in [10, 20, 30, 40] {
        average.record(sample);
    }
    assert_eq!(average.average(), 25);

    // The first 10 falls out of the window.
    average.record(50);
    assert_eq!(average.average(), 35);
}

#[test]
fn moving_average_zero_window_test() {
    let mut average = MovingAverage::new(0, 5);
    assert_eq!(average.window(), 1);
    average.record(9);
    assert_eq!(average.average(), 9);
}
