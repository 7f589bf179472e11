use std::collections::VecDeque;

/// Mean of the last `window` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    /// Window used for a pass over `num_batches` batches.
    pub fn for_epoch(num_batches: usize) -> Self {
        Self::new(num_batches / 100 + 1)
    }

    pub fn add(&mut self, sample: f64) -> f64 {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
        self.value()
    }

    pub fn value(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }
}

/// Running edit-distance numerator over reference-length denominator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorRate {
    pub errors: usize,
    pub reference_tokens: usize,
}

impl ErrorRate {
    pub fn update(&mut self, errors: usize, reference_tokens: usize) {
        self.errors += errors;
        self.reference_tokens += reference_tokens;
    }

    /// `100 * errors / reference_tokens`, undefined for an empty reference set.
    pub fn percent(&self) -> Option<f64> {
        if self.reference_tokens == 0 {
            None
        } else {
            Some(self.errors as f64 * 100.0 / self.reference_tokens as f64)
        }
    }
}

#[derive(Debug, Clone)]
pub struct EpochSummary {
    /// Epoch counter after the pass completed.
    pub epoch: usize,
    pub average_loss: f64,
    pub batches: usize,
    pub degraded_batches: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct EvaluationSummary {
    pub epoch: usize,
    pub rate: ErrorRate,
    pub percent: f64,
}
