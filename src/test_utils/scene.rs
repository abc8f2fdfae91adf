use std::f64::consts::PI;

use crate::body::{Double4, InitialState};
use crate::error::Result;

/// A test body on a circular orbit around a single gravitating body at the
/// origin.
#[derive(Debug, Clone, Copy)]
pub struct OrbitConfig {
    /// Gravitational parameter of the central body.
    pub central_mu: f64,
    pub radius: f64,
    /// Relativistic factor carried in the test body's velocity `w`.
    pub relativistic_factor: f64,
}

impl Default for OrbitConfig {
    fn default() -> Self {
        Self {
            central_mu: 1.0,
            radius: 1.0,
            relativistic_factor: 0.0,
        }
    }
}

impl OrbitConfig {
    pub fn speed(&self) -> f64 {
        (self.central_mu / self.radius).sqrt()
    }

    pub fn period(&self) -> f64 {
        2.0 * PI * (self.radius.powi(3) / self.central_mu).sqrt()
    }

    /// Analytic position of the test body at time `t`.
    pub fn position_at(&self, t: f64) -> [f64; 3] {
        let angle = self.speed() / self.radius * t;
        [self.radius * angle.cos(), self.radius * angle.sin(), 0.0]
    }
}

pub struct SceneBuilder;

impl SceneBuilder {
    /// Body 0 is the gravitating center, body 1 starts at `(r, 0, 0)` moving
    /// along `+y`.
    pub fn circular_orbit(config: OrbitConfig) -> InitialState {
        let positions = vec![
            Double4::position([0.0; 3], config.central_mu),
            Double4::position([config.radius, 0.0, 0.0], 0.0),
        ];
        let velocities = vec![
            Double4::velocity([0.0; 3], 0.0),
            Double4::velocity([0.0, config.speed(), 0.0], config.relativistic_factor),
        ];
        InitialState {
            positions,
            velocities,
            num_grav: 1,
            julian_date: 0.0,
        }
    }

    /// Several massless test bodies on concentric circular orbits around one
    /// center, so a session of `count` bodies can be built with any group size.
    pub fn orbit_ring(count: usize, central_mu: f64) -> InitialState {
        let mut positions = vec![Double4::position([0.0; 3], central_mu)];
        let mut velocities = vec![Double4::velocity([0.0; 3], 0.0)];
        for i in 1..count {
            let orbit = OrbitConfig {
                central_mu,
                radius: 1.0 + 0.25 * i as f64,
                relativistic_factor: 0.0,
            };
            positions.push(Double4::position([orbit.radius, 0.0, 0.0], 0.0));
            velocities.push(Double4::velocity([0.0, orbit.speed(), 0.0], 0.0));
        }
        InitialState {
            positions,
            velocities,
            num_grav: 1,
            julian_date: 0.0,
        }
    }

    pub fn random_cloud(count: usize, num_grav: usize) -> Result<InitialState> {
        InitialState::random_cube(count, num_grav)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_orbit_closes_after_one_period() {
        let orbit = OrbitConfig::default();
        let end = orbit.position_at(orbit.period());
        assert_relative_eq!(end[0], 1.0, epsilon = 1e-12);
        assert!(end[1].abs() < 1e-12);
    }

    #[test]
    fn test_ring_layout() {
        let ring = SceneBuilder::orbit_ring(8, 2.0);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.num_grav, 1);
        assert_eq!(ring.positions[0].w, 2.0);
        assert!(ring.positions[1..].iter().all(|p| p.w == 0.0));
    }
}
