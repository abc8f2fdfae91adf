//! Host-side body state and GPU transfer types.
//!
//! Positions carry the gravitational parameter (G·m) in `w`, velocities carry
//! the per-body relativistic correction factor in `w`. Both are 32-byte
//! aligned to match `vec4<f64>` storage in the kernels.

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, SimError};

/// Four doubles matching the kernel `real4` layout (32 bytes).
#[repr(C, align(32))]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Double4 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

/// Display vertex: four floats, `xyz` relative to the center body, `w = 1`.
#[repr(C, align(16))]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Float4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

const _: () = assert!(std::mem::size_of::<Double4>() == 32);
const _: () = assert!(std::mem::size_of::<Float4>() == 16);

impl Float4 {
    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

impl Double4 {
    pub const fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    /// Position with gravitational parameter `mu`.
    pub const fn position(xyz: [f64; 3], mu: f64) -> Self {
        Self::new(xyz[0], xyz[1], xyz[2], mu)
    }

    /// Velocity with relativistic factor `k`.
    pub const fn velocity(xyz: [f64; 3], k: f64) -> Self {
        Self::new(xyz[0], xyz[1], xyz[2], k)
    }

    pub fn xyz(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    pub fn sub3(&self, other: &Double4) -> [f64; 3] {
        [self.x - other.x, self.y - other.y, self.z - other.z]
    }

    pub fn dot3(&self, other: &Double4) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm3(&self) -> f64 {
        self.dot3(self).sqrt()
    }

    /// Distance between the `xyz` parts.
    pub fn distance(&self, other: &Double4) -> f64 {
        let d = self.sub3(other);
        (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()
    }
}

/// Positions and velocities for every simulated body plus the epoch they
/// describe. The first `num_grav` bodies are the gravitating subset.
#[derive(Clone, Debug, PartialEq)]
pub struct InitialState {
    pub positions: Vec<Double4>,
    pub velocities: Vec<Double4>,
    pub num_grav: usize,
    pub julian_date: f64,
}

impl InitialState {
    pub fn new(positions: Vec<Double4>, velocities: Vec<Double4>, num_grav: usize) -> Result<Self> {
        if positions.len() != velocities.len() {
            return Err(SimError::InvalidConfig(format!(
                "{} positions but {} velocities",
                positions.len(),
                velocities.len()
            )));
        }
        if num_grav == 0 || num_grav > positions.len() {
            return Err(SimError::InvalidConfig(format!(
                "gravitating count {} outside 1..={}",
                num_grav,
                positions.len()
            )));
        }

        Ok(Self {
            positions,
            velocities,
            num_grav,
            julian_date: 0.0,
        })
    }

    pub fn with_julian_date(mut self, julian_date: f64) -> Self {
        self.julian_date = julian_date;
        self
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Deterministic random cube of bodies: the first sits at the origin,
    /// the rest are spread uniformly over a 1000-unit cube, all at rest with
    /// gravitational parameters in `[0, 0.2)`.
    pub fn random_cube(num_particles: usize, num_grav: usize) -> Result<Self> {
        let mut rng = Xor128::default();
        let mut positions = Vec::with_capacity(num_particles);

        for i in 0..num_particles {
            let mu = 0.2 * rng.next_unit();
            let position = if i == 0 {
                Double4::position([0.0, 0.0, 0.0], mu)
            } else {
                let x = 1000.0 * (rng.next_unit() - 0.5);
                let y = 1000.0 * (rng.next_unit() - 0.5);
                let z = 1000.0 * (rng.next_unit() - 0.5);
                Double4::position([x, y, z], mu)
            };
            positions.push(position);
        }

        let velocities = vec![Double4::default(); num_particles];
        Self::new(positions, velocities, num_grav)
    }
}

/// Marsaglia xor128 generator with its published seed.
#[derive(Clone, Debug)]
pub struct Xor128 {
    x: u64,
    y: u64,
    z: u64,
    w: u64,
}

impl Default for Xor128 {
    fn default() -> Self {
        Self {
            x: 123456789,
            y: 362436069,
            z: 521288629,
            w: 88675123,
        }
    }
}

impl Xor128 {
    pub fn next_u64(&mut self) -> u64 {
        let t = self.x ^ (self.x << 11);
        self.x = self.y;
        self.y = self.z;
        self.z = self.w;
        self.w = (self.w ^ (self.w >> 19)) ^ (t ^ (t >> 8));
        self.w
    }

    /// Uniform in `[0, 1]`.
    pub fn next_unit(&mut self) -> f64 {
        self.next_u64() as f64 / u64::MAX as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_type_layout() {
        assert_eq!(std::mem::size_of::<Double4>(), 32);
        assert_eq!(std::mem::align_of::<Double4>(), 32);
        assert_eq!(std::mem::size_of::<Float4>(), 16);
        let _bytes: &[u8] = bytemuck::bytes_of(&Double4::default());
    }

    #[test]
    fn test_vector_helpers() {
        let a = Double4::position([3.0, 4.0, 0.0], 1.0);
        let b = Double4::position([0.0, 0.0, 0.0], 2.0);
        assert_eq!(a.norm3(), 5.0);
        assert_eq!(a.distance(&b), 5.0);
        assert_eq!(a.sub3(&b), [3.0, 4.0, 0.0]);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let result = InitialState::new(vec![Double4::default(); 2], vec![Double4::default(); 3], 1);
        assert!(matches!(result, Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn test_xor128_is_deterministic() {
        let mut a = Xor128::default();
        let mut b = Xor128::default();
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        let u = a.next_unit();
        assert!((0.0..=1.0).contains(&u));
    }

    #[test]
    fn test_random_cube() {
        let state = InitialState::random_cube(256, 16).unwrap();
        assert_eq!(state.len(), 256);
        assert_eq!(state.num_grav, 16);
        assert_eq!(state.positions[0].xyz(), [0.0, 0.0, 0.0]);
        for p in &state.positions[1..] {
            assert!(p.x.abs() <= 500.0 && p.y.abs() <= 500.0 && p.z.abs() <= 500.0);
            assert!(p.w >= 0.0 && p.w <= 0.2);
        }
        assert!(state.velocities.iter().all(|v| *v == Double4::default()));
    }
}
