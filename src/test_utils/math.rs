use crate::body::Double4;

/// Element-wise comparisons of state vectors.
pub struct StateComparison;

impl StateComparison {
    /// Largest absolute difference over every component, `w` included.
    pub fn max_abs_diff(a: &[Double4], b: &[Double4]) -> f64 {
        assert_eq!(a.len(), b.len(), "state vectors differ in length");
        a.iter()
            .zip(b)
            .flat_map(|(x, y)| [x.x - y.x, x.y - y.y, x.z - y.z, x.w - y.w])
            .fold(0.0, |max, d| max.max(d.abs()))
    }

    /// Distance between the `xyz` parts, relative to the length of `expected`.
    pub fn relative_position_error(actual: &Double4, expected: [f64; 3]) -> f64 {
        let reference = Double4::position(expected, 0.0);
        actual.distance(&reference) / reference.norm3()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_abs_diff_sees_every_component() {
        let a = [Double4::new(1.0, 2.0, 3.0, 4.0)];
        let b = [Double4::new(1.0, 2.0, 3.0, 4.5)];
        assert_eq!(StateComparison::max_abs_diff(&a, &b), 0.5);
        assert_eq!(StateComparison::max_abs_diff(&a, &a), 0.0);
    }

    #[test]
    fn test_relative_position_error() {
        let actual = Double4::position([2.0, 0.0, 0.0], 1.0);
        assert_eq!(StateComparison::relative_position_error(&actual, [2.0, 0.0, 0.0]), 0.0);
        assert_eq!(StateComparison::relative_position_error(&actual, [4.0, 0.0, 0.0]), 0.5);
    }
}
