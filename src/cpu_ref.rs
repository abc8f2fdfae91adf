//! Host reference model.
//!
//! Runs the kernels of `shaders/nbody.wgsl` on the CPU, one body at a time,
//! behind the same [`StepBackend`] seam as the GPU executor. Buffers come
//! from a [`HostAllocator`] so the allocation bookkeeping of a session can be
//! exercised without a device.

use std::cell::Cell;

use log::{debug, info};

use crate::body::{Double4, Float4, InitialState};
use crate::coefficients::CoefficientTable;
use crate::error::{DeviceErrorKind, Result, SimError};
use crate::gpu::capabilities::DeviceLimits;
use crate::physics::buffer_manager::{
    history_slot, AllocationGuard, AllocationTracker, BufferAllocator, BufferManager, BufferRole, BufferSet,
    HISTORY_DEPTH,
};
use crate::physics::gpu_pipeline::plan_sizing;
use crate::physics::integrator::{Driver, IntegrationState, IntegratorKernel, StepBackend};
use crate::physics::simulation_parameters::{AccelerationModel, SimulationConfig};

const STARTUP_MAX_ORDER: usize = 4;

/// Plain memory standing in for a device buffer. Storage is kept as
/// 32-byte words; display buffers view it as `Float4`.
#[derive(Debug)]
pub struct HostBuffer {
    words: Vec<Double4>,
    len: usize,
    _guard: AllocationGuard,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_doubles(&self) -> &[Double4] {
        &self.words[..self.len]
    }

    pub fn as_doubles_mut(&mut self) -> &mut [Double4] {
        &mut self.words[..self.len]
    }

    pub fn as_floats(&self) -> &[Float4] {
        &bytemuck::cast_slice::<Double4, Float4>(&self.words)[..self.len]
    }

    pub fn as_floats_mut(&mut self) -> &mut [Float4] {
        &mut bytemuck::cast_slice_mut::<Double4, Float4>(&mut self.words)[..self.len]
    }
}

/// Hands out [`HostBuffer`]s and counts them. `failing_after(k)` makes every
/// allocation after the first `k` fail, for exercising batch release.
#[derive(Debug, Default)]
pub struct HostAllocator {
    tracker: AllocationTracker,
    fail_after: Option<usize>,
    allocated: Cell<usize>,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_after(count: usize) -> Self {
        Self {
            fail_after: Some(count),
            ..Self::default()
        }
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }
}

impl BufferAllocator for HostAllocator {
    type Buffer = HostBuffer;

    fn allocate(&self, role: BufferRole, len: usize) -> Result<HostBuffer> {
        let index = self.allocated.get();
        if self.fail_after.is_some_and(|limit| index >= limit) {
            return Err(SimError::Allocation {
                buffer: role.label().to_string(),
                kind: DeviceErrorKind::OutOfMemory,
                detail: format!("host allocator refused allocation {}", index),
            });
        }
        self.allocated.set(index + 1);

        let bytes = len * role.element_size();
        let words = (bytes + std::mem::size_of::<Double4>() - 1) / std::mem::size_of::<Double4>();
        Ok(HostBuffer {
            words: vec![Double4::default(); words],
            len,
            _guard: self.tracker.register(),
        })
    }
}

fn scale(v: [f64; 3], s: f64) -> [f64; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn newtonian_term(p: &Double4, g: &Double4, eps_sqr: f64) -> [f64; 3] {
    let d = p.sub3(g);
    let r2 = dot(d, d) + eps_sqr;
    let r = r2.sqrt();
    scale(d, -(g.w / (r2 * r)))
}

/// First post-Newtonian correction; `v.w` scales it per body.
pub fn relativistic_term(p: &Double4, v: &Double4, g: &Double4, eps_sqr: f64) -> [f64; 3] {
    let d = p.sub3(g);
    let r2 = dot(d, d) + eps_sqr;
    let r = r2.sqrt();
    let mu = g.w;
    let k = v.w;
    let vel = v.xyz();
    let radial = 1.0 - 4.0 * mu * k / r + dot(vel, vel) * k;
    let tangential = 4.0 * k * dot(d, vel);
    let bracket = add(scale(d, radial), scale(vel, -tangential));
    scale(bracket, -(mu / (r2 * r)))
}

/// Acceleration of every body from the gravitating prefix. Body `i` skips
/// gravitating entry `i`.
pub fn accelerations(
    model: AccelerationModel,
    positions: &[Double4],
    velocities: &[Double4],
    grav: &[Double4],
    eps_sqr: f64,
) -> Vec<Double4> {
    positions
        .iter()
        .zip(velocities)
        .enumerate()
        .map(|(i, (p, v))| {
            let mut a = [0.0; 3];
            for (j, g) in grav.iter().enumerate() {
                if j == i {
                    continue;
                }
                let term = match model {
                    AccelerationModel::Newtonian => newtonian_term(p, g, eps_sqr),
                    AccelerationModel::Relativistic | AccelerationModel::RelativisticLocal => {
                        relativistic_term(p, v, g, eps_sqr)
                    }
                };
                a = add(a, term);
            }
            Double4::new(a[0], a[1], a[2], 0.0)
        })
        .collect()
}

fn ring_index(body: usize, step: i64) -> usize {
    body * HISTORY_DEPTH + (step & (HISTORY_DEPTH as i64 - 1)) as usize
}

/// The host rendition of one session's buffers and kernels.
pub struct HostModel {
    buffers: BufferSet<HostBuffer>,
    acceleration: AccelerationModel,
    eps_sqr: f64,
    del_t: f64,
    num_stages: i32,
    order: usize,
    center_body: usize,
    coefficients: CoefficientTable,
}

impl HostModel {
    pub fn new(config: &SimulationConfig, initial: &InitialState, allocator: &HostAllocator) -> Result<Self> {
        config.validate()?;
        let sizing = plan_sizing(config, &DeviceLimits::host())?;
        let buffers = BufferManager::new(allocator).allocate(sizing)?;
        let mut model = Self {
            buffers,
            acceleration: config.acceleration,
            eps_sqr: config.eps_sqr,
            del_t: config.del_t,
            num_stages: config.num_stages,
            order: config.integrator.order(),
            center_body: config.center_body,
            coefficients: CoefficientTable::new(),
        };
        model.write_initial_state(initial)?;
        info!(
            "host model ready: {} bodies, {} gravitating, {}",
            sizing.num_particles, sizing.num_grav, config.integrator
        );
        Ok(model)
    }

    pub fn buffers(&self) -> &BufferSet<HostBuffer> {
        &self.buffers
    }

    pub fn write_initial_state(&mut self, initial: &InitialState) -> Result<()> {
        let n = self.buffers.num_particles();
        let g = self.buffers.num_grav();
        if initial.len() < n {
            return Err(SimError::InvalidConfig(format!(
                "initial state has {} bodies, session needs {}",
                initial.len(),
                n
            )));
        }

        self.buffers
            .get_mut(BufferRole::CurrPos)
            .as_doubles_mut()
            .copy_from_slice(&initial.positions[..n]);
        self.buffers
            .get_mut(BufferRole::GravPos)
            .as_doubles_mut()
            .copy_from_slice(&initial.positions[..g]);
        self.buffers
            .get_mut(BufferRole::CurrVel)
            .as_doubles_mut()
            .copy_from_slice(&initial.velocities[..n]);
        Ok(())
    }

    pub fn read_state(&self) -> (Vec<Double4>, Vec<Double4>) {
        (
            self.buffers.get(BufferRole::CurrPos).as_doubles().to_vec(),
            self.buffers.get(BufferRole::CurrVel).as_doubles().to_vec(),
        )
    }

    pub fn read_display(&self) -> Result<Vec<Float4>> {
        let guard = self.buffers.display().begin_render()?;
        Ok(guard.as_floats().to_vec())
    }

    fn doubles(&self, role: BufferRole) -> &[Double4] {
        self.buffers.get(role).as_doubles()
    }

    fn predict(&mut self, order: usize, step: u64) {
        let n = self.buffers.num_particles();
        let h = self.del_t;
        let step = step as i64;
        let slot = history_slot(step as u64);
        let coeffs = self.coefficients.predictor(order).to_vec();

        for i in 0..n {
            let p = self.doubles(BufferRole::CurrPos)[i];
            let v = self.doubles(BufferRole::CurrVel)[i];
            let a = self.doubles(BufferRole::Acc)[i];

            self.buffers.get_mut(BufferRole::VelHistory).as_doubles_mut()[i * HISTORY_DEPTH + slot] = v;
            self.buffers.get_mut(BufferRole::AccHistory).as_doubles_mut()[i * HISTORY_DEPTH + slot] = a;
            self.buffers.get_mut(BufferRole::PosLast).as_doubles_mut()[i] = p;
            self.buffers.get_mut(BufferRole::VelLast).as_doubles_mut()[i] = v;

            let mut dp = [0.0; 3];
            let mut dv = [0.0; 3];
            for (m, c) in coeffs.iter().enumerate() {
                let index = ring_index(i, step - m as i64);
                dp = add(dp, scale(self.doubles(BufferRole::VelHistory)[index].xyz(), *c));
                dv = add(dv, scale(self.doubles(BufferRole::AccHistory)[index].xyz(), *c));
            }

            let new_p = add(p.xyz(), scale(dp, h));
            let new_v = add(v.xyz(), scale(dv, h));
            self.buffers.get_mut(BufferRole::NewPos).as_doubles_mut()[i] = Double4::position(new_p, p.w);
            self.buffers.get_mut(BufferRole::NewVel).as_doubles_mut()[i] = Double4::velocity(new_v, v.w);
        }
    }

    fn correct(&mut self, order: usize, step: u64) {
        let n = self.buffers.num_particles();
        let h = self.del_t;
        let step = step as i64;
        let coeffs = self.coefficients.corrector(order).to_vec();

        for i in 0..n {
            let v = self.doubles(BufferRole::CurrVel)[i];
            let a = self.doubles(BufferRole::Acc)[i];
            let mut dp = scale(v.xyz(), coeffs[0]);
            let mut dv = scale(a.xyz(), coeffs[0]);
            for (m, c) in coeffs.iter().enumerate().skip(1) {
                let index = ring_index(i, step + 1 - m as i64);
                dp = add(dp, scale(self.doubles(BufferRole::VelHistory)[index].xyz(), *c));
                dv = add(dv, scale(self.doubles(BufferRole::AccHistory)[index].xyz(), *c));
            }

            let pl = self.doubles(BufferRole::PosLast)[i];
            let vl = self.doubles(BufferRole::VelLast)[i];
            let new_p = add(pl.xyz(), scale(dp, h));
            let new_v = add(vl.xyz(), scale(dv, h));
            self.buffers.get_mut(BufferRole::NewPos).as_doubles_mut()[i] = Double4::position(new_p, pl.w);
            self.buffers.get_mut(BufferRole::NewVel).as_doubles_mut()[i] = Double4::velocity(new_v, vl.w);
        }
    }
}

impl StepBackend for HostModel {
    fn compute_acceleration(&mut self) -> Result<()> {
        let acc = accelerations(
            self.acceleration,
            self.doubles(BufferRole::CurrPos),
            self.doubles(BufferRole::CurrVel),
            self.doubles(BufferRole::GravPos),
            self.eps_sqr,
        );
        self.buffers.get_mut(BufferRole::Acc).as_doubles_mut().copy_from_slice(&acc);
        Ok(())
    }

    fn integrate(&mut self, kernel: IntegratorKernel, stage: i32, step: u64) -> Result<()> {
        match kernel {
            IntegratorKernel::Bootstrap => {
                let order = (step as usize + 1).min(STARTUP_MAX_ORDER);
                if stage == self.num_stages {
                    self.predict(order, step);
                } else {
                    self.correct(order + 1, step);
                }
            }
            IntegratorKernel::Predictor => self.predict(self.order, step),
            IntegratorKernel::Corrector => self.correct(self.order, step),
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let g = self.buffers.num_grav();
        let new_pos = self.doubles(BufferRole::NewPos).to_vec();
        let new_vel = self.doubles(BufferRole::NewVel).to_vec();
        self.buffers.get_mut(BufferRole::CurrPos).as_doubles_mut().copy_from_slice(&new_pos);
        self.buffers
            .get_mut(BufferRole::GravPos)
            .as_doubles_mut()
            .copy_from_slice(&new_pos[..g]);
        self.buffers.get_mut(BufferRole::CurrVel).as_doubles_mut().copy_from_slice(&new_vel);
        Ok(())
    }

    fn refresh_display(&mut self) -> Result<()> {
        let center = self.doubles(BufferRole::GravPos)[self.center_body];
        let frame: Vec<Float4> = self
            .doubles(BufferRole::CurrPos)
            .iter()
            .map(|p| {
                let d = p.sub3(&center);
                Float4::new(d[0] as f32, d[1] as f32, d[2] as f32, 1.0)
            })
            .collect();

        self.buffers
            .display_mut()
            .write_acquired(|buffer| buffer.as_floats_mut().copy_from_slice(&frame))?;
        debug!("display refreshed around body {}", self.center_body);
        Ok(())
    }
}

/// Host model plus a fresh driver for `config`.
pub fn host_driver(
    config: &SimulationConfig,
    initial: &InitialState,
    allocator: &HostAllocator,
) -> Result<Driver<HostModel>> {
    let model = HostModel::new(config, initial, allocator)?;
    let state = IntegrationState::new(config.num_stages, config.del_t, initial.julian_date);
    Ok(Driver::new(model, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::buffer_manager::BufferSizing;
    use approx::assert_relative_eq;

    fn two_body() -> InitialState {
        InitialState::new(
            vec![Double4::position([0.0; 3], 1.0), Double4::position([1.0, 0.0, 0.0], 0.0)],
            vec![Double4::velocity([0.0; 3], 0.0), Double4::velocity([0.0, 1.0, 0.0], 0.0)],
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_newtonian_points_at_source() {
        let acc = accelerations(
            AccelerationModel::Newtonian,
            &two_body().positions,
            &two_body().velocities,
            &two_body().positions[..1],
            0.0,
        );
        assert_eq!(acc[0], Double4::default());
        assert_relative_eq!(acc[1].x, -1.0, epsilon = 1e-15);
        assert_relative_eq!(acc[1].y, 0.0);
    }

    #[test]
    fn test_relativistic_reduces_to_newtonian_without_factor() {
        let p = Double4::position([3.0, -1.0, 2.0], 0.0);
        let v = Double4::velocity([0.1, 0.2, -0.3], 0.0);
        let g = Double4::position([0.5, 0.5, 0.5], 2.0);
        let newtonian = newtonian_term(&p, &g, 1e-6);
        let relativistic = relativistic_term(&p, &v, &g, 1e-6);
        for axis in 0..3 {
            assert_relative_eq!(newtonian[axis], relativistic[axis], epsilon = 1e-15);
        }
    }

    #[test]
    fn test_failed_batch_releases_everything() {
        let allocator = HostAllocator::failing_after(4);
        let sizing = BufferSizing::negotiate(8, 2, 1, &DeviceLimits::host()).unwrap();
        let result = BufferManager::new(&allocator).allocate(sizing);
        assert!(matches!(result, Err(SimError::Allocation { .. })));
        assert_eq!(allocator.tracker().outstanding(), 0);
    }

    #[test]
    fn test_allocation_counts_every_role() {
        let allocator = HostAllocator::new();
        let config = SimulationConfig::new(2, 1);
        let model = HostModel::new(&config, &two_body(), &allocator).unwrap();
        assert_eq!(allocator.tracker().outstanding(), BufferRole::ALL.len());
        assert_eq!(model.buffers().get(BufferRole::AccHistory).len(), 32);
        drop(model);
        assert_eq!(allocator.tracker().outstanding(), 0);
    }

    #[test]
    fn test_display_is_relative_to_center() {
        let allocator = HostAllocator::new();
        let initial = InitialState::new(
            vec![Double4::position([10.0, 0.0, 0.0], 1.0), Double4::position([11.0, 2.0, 0.0], 0.0)],
            vec![Double4::default(); 2],
            1,
        )
        .unwrap();
        let mut model = HostModel::new(&SimulationConfig::new(2, 1), &initial, &allocator).unwrap();
        model.refresh_display().unwrap();
        let frame = model.read_display().unwrap();
        assert_eq!(frame[0], Float4::new(0.0, 0.0, 0.0, 1.0));
        assert_eq!(frame[1], Float4::new(1.0, 2.0, 0.0, 1.0));
    }

    #[test]
    fn test_predictor_records_history_slot() {
        let allocator = HostAllocator::new();
        let mut driver = host_driver(&SimulationConfig::new(2, 1), &two_body(), &allocator).unwrap();
        driver.step().unwrap();
        let history = driver.backend().buffers().get(BufferRole::VelHistory).as_doubles();
        assert_eq!(history[HISTORY_DEPTH], Double4::velocity([0.0, 1.0, 0.0], 0.0));
    }
}
