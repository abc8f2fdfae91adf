//! Adams-Bashforth / Adams-Moulton coefficients
//!
//! Weights for the explicit (predictor) and implicit (corrector) Adams
//! formulas of any order up to [`MAX_ORDER`], generated with the recurrence
//! from Danby, "Fundamentals of Celestial Mechanics", §10.9.
//!
//! For order `k` the predictor advances with
//! `y[n+1] = y[n] + h * sum(b[m] * f[n+1-m], m = 1..=k)` and the corrector with
//! `y[n+1] = y[n] + h * (bs[1] * f[n+1] + sum(bs[m] * f[n+2-m], m = 2..=k))`,
//! so the corrector of order `k` uses the predicted value plus `k - 1`
//! history entries.

/// Highest order the history ring buffer can feed.
pub const MAX_ORDER: usize = 16;

/// Length of a triangular table holding orders `1..=MAX_ORDER`.
pub const TABLE_LEN: usize = MAX_ORDER * (MAX_ORDER + 1) / 2;

/// Start of order `k` inside a flattened triangular table.
pub const fn table_offset(order: usize) -> usize {
    order * (order - 1) / 2
}

/// Predictor and corrector weights for one order.
#[derive(Clone, Debug, PartialEq)]
pub struct AdamsCoefficients {
    pub predictor: Vec<f64>,
    pub corrector: Vec<f64>,
}

impl AdamsCoefficients {
    /// Weights of order `order`. Returns `None` outside `1..=MAX_ORDER`.
    pub fn new(order: usize) -> Option<Self> {
        if order == 0 || order > MAX_ORDER {
            return None;
        }
        let k = order;

        // p[i][j], 1-based; row 1 is all ones.
        let mut p = vec![vec![0.0f64; k + 1]; k + 1];
        for j in 1..=k {
            p[1][j] = 1.0;
        }
        for i in 2..=k {
            for j in i..=k {
                p[i][j] = -p[i - 1][j] * (j - i + 1) as f64 / (i - 1) as f64;
            }
        }

        let mut g = vec![0.0f64; k + 1];
        let mut gs = vec![0.0f64; k + 1];
        g[1] = 1.0;
        gs[1] = 1.0;
        for i in 2..=k {
            let mut sum = 0.0;
            let mut sum_star = 0.0;
            for j in 2..=i {
                sum += g[i - j + 1] / j as f64;
                sum_star += gs[i - j + 1] / j as f64;
            }
            g[i] = 1.0 - sum;
            gs[i] = -sum_star;
        }

        let predictor = (1..=k).map(|m| (m..=k).map(|j| p[m][j] * g[j]).sum()).collect();
        let corrector = (1..=k).map(|m| (m..=k).map(|j| p[m][j] * gs[j]).sum()).collect();

        Some(Self { predictor, corrector })
    }
}

/// All orders flattened the way the kernels store them.
#[derive(Clone, Debug)]
pub struct CoefficientTable {
    predictor: Vec<f64>,
    corrector: Vec<f64>,
}

impl CoefficientTable {
    pub fn new() -> Self {
        let mut predictor = Vec::with_capacity(TABLE_LEN);
        let mut corrector = Vec::with_capacity(TABLE_LEN);
        for order in 1..=MAX_ORDER {
            if let Some(c) = AdamsCoefficients::new(order) {
                predictor.extend(c.predictor);
                corrector.extend(c.corrector);
            }
        }
        Self { predictor, corrector }
    }

    pub fn predictor(&self, order: usize) -> &[f64] {
        let start = table_offset(order);
        &self.predictor[start..start + order]
    }

    pub fn corrector(&self, order: usize) -> &[f64] {
        let start = table_offset(order);
        &self.corrector[start..start + order]
    }

    pub fn flat_predictor(&self) -> &[f64] {
        &self.predictor
    }

    pub fn flat_corrector(&self) -> &[f64] {
        &self.corrector
    }
}

impl Default for CoefficientTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fourth_order_bashforth() {
        let c = AdamsCoefficients::new(4).unwrap();
        let expected = [55.0 / 24.0, -59.0 / 24.0, 37.0 / 24.0, -9.0 / 24.0];
        for (got, want) in c.predictor.iter().zip(expected) {
            assert_relative_eq!(*got, want, max_relative = 1e-14);
        }
    }

    #[test]
    fn test_low_order_moulton() {
        let trapezoid = AdamsCoefficients::new(2).unwrap();
        assert_relative_eq!(trapezoid.corrector[0], 0.5);
        assert_relative_eq!(trapezoid.corrector[1], 0.5);

        let c = AdamsCoefficients::new(4).unwrap();
        let expected = [9.0 / 24.0, 19.0 / 24.0, -5.0 / 24.0, 1.0 / 24.0];
        for (got, want) in c.corrector.iter().zip(expected) {
            assert_relative_eq!(*got, want, max_relative = 1e-14);
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        for order in 1..=MAX_ORDER {
            let c = AdamsCoefficients::new(order).unwrap();
            let b: f64 = c.predictor.iter().sum();
            let bs: f64 = c.corrector.iter().sum();
            assert!((b - 1.0).abs() < 1e-10, "order {} predictor sums to {}", order, b);
            assert!((bs - 1.0).abs() < 1e-10, "order {} corrector sums to {}", order, bs);
        }
    }

    #[test]
    fn test_order_bounds() {
        assert!(AdamsCoefficients::new(0).is_none());
        assert!(AdamsCoefficients::new(MAX_ORDER + 1).is_none());
    }

    #[test]
    fn test_table_layout() {
        let table = CoefficientTable::new();
        assert_eq!(table.flat_predictor().len(), TABLE_LEN);
        assert_eq!(table_offset(1), 0);
        assert_eq!(table_offset(4), 6);
        assert_eq!(table.predictor(1), &[1.0]);
        assert_eq!(table.corrector(11).len(), 11);
        assert_eq!(table.predictor(16), AdamsCoefficients::new(16).unwrap().predictor.as_slice());
    }
}
