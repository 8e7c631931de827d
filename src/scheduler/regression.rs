//! Linear transfer-cost models for the multi-kernel scheduler.
//!
//! Transfer time is fitted against moved share. A fit whose relative RMS
//! residual is within tolerance is considered settled and stops taking
//! samples.

/// Ordinary least squares fit `y = intercept + slope * x`.
#[derive(Debug, Clone, Default)]
pub struct LinearFit {
    samples: Vec<(f64, f64)>,
    intercept: f64,
    slope: f64,
    residual: f64,
    frozen: bool,
}

impl LinearFit {
    /// Minimum samples before a fit can be frozen.
    pub const MIN_SAMPLES: usize = 3;

    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sample and refits. Ignored once frozen.
    pub fn add(&mut self, x: f64, y: f64) {
        if self.frozen || !x.is_finite() || !y.is_finite() {
            return;
        }
        self.samples.push((x, y));
        self.refit();
    }

    fn refit(&mut self) {
        let n = self.samples.len() as f64;
        if n == 0.0 {
            return;
        }
        let mean_x = self.samples.iter().map(|s| s.0).sum::<f64>() / n;
        let mean_y = self.samples.iter().map(|s| s.1).sum::<f64>() / n;
        let sxx: f64 = self.samples.iter().map(|s| (s.0 - mean_x).powi(2)).sum();
        let sxy: f64 = self
            .samples
            .iter()
            .map(|s| (s.0 - mean_x) * (s.1 - mean_y))
            .sum();

        if sxx > 1e-18 {
            self.slope = sxy / sxx;
            self.intercept = mean_y - self.slope * mean_x;
        } else {
            self.slope = 0.0;
            self.intercept = mean_y;
        }

        let sse: f64 = self
            .samples
            .iter()
            .map(|&(x, y)| (y - self.predict(x)).powi(2))
            .sum();
        self.residual = (sse / n).sqrt();
    }

    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn slope(&self) -> f64 {
        self.slope
    }

    /// RMS residual of the current fit.
    pub fn residual(&self) -> f64 {
        self.residual
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Residual relative to the mean magnitude of `y` is within `tolerance`.
    pub fn is_acceptable(&self, tolerance: f64) -> bool {
        if self.samples.len() < Self::MIN_SAMPLES {
            return false;
        }
        let scale = self.samples.iter().map(|s| s.1.abs()).sum::<f64>() / self.samples.len() as f64;
        if scale <= 0.0 {
            return true;
        }
        self.residual / scale <= tolerance
    }

    /// Freezes the fit if it is acceptable; returns whether it is frozen.
    pub fn settle(&mut self, tolerance: f64) -> bool {
        if !self.frozen && self.is_acceptable(tolerance) {
            self.frozen = true;
        }
        self.frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exact_line() {
        let mut fit = LinearFit::new();
        for i in 0..5 {
            let x = i as f64 * 0.1;
            fit.add(x, 2.0 + 10.0 * x);
        }
        assert_relative_eq!(fit.intercept(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(fit.slope(), 10.0, epsilon = 1e-9);
        assert!(fit.residual() < 1e-9);
        assert!(fit.settle(0.05));
        fit.add(1.0, 100.0);
        assert_eq!(fit.len(), 5);
    }

    #[test]
    fn test_constant_x_falls_back_to_mean() {
        let mut fit = LinearFit::new();
        fit.add(0.5, 1.0);
        fit.add(0.5, 3.0);
        assert_eq!(fit.slope(), 0.0);
        assert_relative_eq!(fit.predict(0.9), 2.0);
    }

    #[test]
    fn test_noisy_fit_not_settled() {
        let mut fit = LinearFit::new();
        for (x, y) in [(0.0, 1.0), (0.1, 9.0), (0.2, 0.5), (0.3, 8.0)] {
            fit.add(x, y);
        }
        assert!(!fit.settle(0.1));
        assert!(!fit.is_frozen());
    }
}
