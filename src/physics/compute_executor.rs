use log::{error, info};
use wgpu::{CommandEncoder, Device};

use crate::body::{Double4, Float4, InitialState};
use crate::error::{Result, SimError};
use crate::gpu::DeviceBinding;
use super::buffer_manager::{read_buffer, BufferRole, BufferSet, TrackedBuffer, HISTORY_DEPTH};
use super::gpu_pipeline::{BoundKernel, KernelSet};
use super::integrator::{IntegratorKernel, StepBackend};
use super::kernel_args::{KernelRole, ARG_STAGE, ARG_STEP};

const STEP_WRAP: u64 = 1 << 30;

/// Step counter as seen by the kernels. Past the bootstrap the counter only
/// selects ring slots, so it wraps on a multiple of the ring depth and stays
/// above the bootstrap range.
pub fn kernel_step(step: u64) -> i32 {
    let bootstrap = HISTORY_DEPTH as u64;
    if step < bootstrap {
        step as i32
    } else {
        (bootstrap + (step - bootstrap) % STEP_WRAP) as i32
    }
}

pub fn calculate_workgroups(count: usize, group_size: u32) -> u32 {
    let group_size = group_size.max(1) as usize;
    ((count + group_size - 1) / group_size) as u32
}

fn create_command_encoder(device: &Device, label: &str) -> CommandEncoder {
    device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
}

fn dispatch_compute_pass(encoder: &mut CommandEncoder, kernel: &BoundKernel, workgroups: u32) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(kernel.name()),
        timestamp_writes: None,
    });
    pass.set_pipeline(kernel.pipeline());
    pass.set_bind_group(0, kernel.buffer_group(), &[]);
    pass.set_bind_group(1, kernel.params_group(), &[]);
    pass.dispatch_workgroups(workgroups, 1, 1);
}

fn submit_and_wait(binding: &DeviceBinding, encoder: CommandEncoder) {
    binding.queue().submit(Some(encoder.finish()));
    binding.wait_idle();
}

/// The device half of a session: bound kernels, the buffer set and the
/// binding they were created on. Fields drop in declaration order.
pub struct GpuBackend {
    kernels: KernelSet,
    buffers: BufferSet<TrackedBuffer>,
    binding: DeviceBinding,
}

impl GpuBackend {
    pub fn new(binding: DeviceBinding, buffers: BufferSet<TrackedBuffer>, kernels: KernelSet) -> Self {
        Self {
            kernels,
            buffers,
            binding,
        }
    }

    pub fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    pub fn buffers(&self) -> &BufferSet<TrackedBuffer> {
        &self.buffers
    }

    pub fn kernels(&self) -> &KernelSet {
        &self.kernels
    }

    /// Release kernels and buffers, keeping the device for a rebuild.
    pub fn into_binding(self) -> DeviceBinding {
        let GpuBackend {
            kernels,
            buffers,
            binding,
        } = self;
        drop(kernels);
        drop(buffers);
        binding.wait_idle();
        info!(
            "released session resources, {} device buffers outstanding",
            binding.tracker().outstanding()
        );
        binding
    }

    fn dispatch(&self, role: KernelRole, count: usize) -> Result<()> {
        let kernel = self.kernels.get(role);
        self.binding.loss().check(kernel.name())?;
        let workgroups = calculate_workgroups(count, self.kernels.group_size());

        let (_, scope_error) = self.binding.capture(|| {
            kernel.write_params(&self.binding);
            let mut encoder = create_command_encoder(self.binding.device(), kernel.name());
            dispatch_compute_pass(&mut encoder, kernel, workgroups);
            submit_and_wait(&self.binding, encoder);
        });

        match scope_error {
            Some(err) => {
                self.binding.loss().check(kernel.name())?;
                error!("dispatch of {} failed: {}", kernel.name(), err);
                Err(SimError::dispatch(kernel.name(), &err))
            }
            None => Ok(()),
        }
    }

    fn copy(&self, label: &str, copies: &[(BufferRole, BufferRole, usize)]) -> Result<()> {
        self.binding.loss().check(label)?;
        let (_, scope_error) = self.binding.capture(|| {
            let mut encoder = create_command_encoder(self.binding.device(), label);
            for (src, dst, count) in copies {
                let bytes = (*count * std::mem::size_of::<Double4>()) as u64;
                encoder.copy_buffer_to_buffer(
                    self.buffers.get(*src).buffer(),
                    0,
                    self.buffers.get(*dst).buffer(),
                    0,
                    bytes,
                );
            }
            submit_and_wait(&self.binding, encoder);
        });

        match scope_error {
            Some(err) => {
                self.binding.loss().check(label)?;
                error!("{} failed: {}", label, err);
                Err(SimError::dispatch(label, &err))
            }
            None => Ok(()),
        }
    }

    /// Blocking upload of positions, gravitating prefix and velocities.
    pub fn write_initial_state(&self, initial: &InitialState) -> Result<()> {
        let n = self.buffers.num_particles();
        let g = self.buffers.num_grav();
        if initial.len() < n {
            return Err(SimError::InvalidConfig(format!(
                "initial state has {} bodies, session needs {}",
                initial.len(),
                n
            )));
        }

        let queue = self.binding.queue();
        let positions = bytemuck::cast_slice(&initial.positions[..n]);
        queue.write_buffer(self.buffers.get(BufferRole::CurrPos).buffer(), 0, positions);
        queue.write_buffer(
            self.buffers.get(BufferRole::GravPos).buffer(),
            0,
            bytemuck::cast_slice(&initial.positions[..g]),
        );
        queue.write_buffer(
            self.buffers.get(BufferRole::CurrVel).buffer(),
            0,
            bytemuck::cast_slice(&initial.velocities[..n]),
        );

        let (_, scope_error) = self.binding.capture(|| {
            queue.submit(std::iter::empty::<wgpu::CommandBuffer>());
            self.binding.wait_idle();
        });
        match scope_error {
            Some(err) => Err(SimError::dispatch("write initial state", &err)),
            None => Ok(()),
        }
    }

    /// Blocking read of the committed positions and velocities.
    pub fn read_state(&self) -> Result<(Vec<Double4>, Vec<Double4>)> {
        let n = self.buffers.num_particles();
        let positions = read_buffer(&self.binding, self.buffers.get(BufferRole::CurrPos).buffer(), n)?;
        let velocities = read_buffer(&self.binding, self.buffers.get(BufferRole::CurrVel).buffer(), n)?;
        Ok((positions, velocities))
    }

    /// Renderer-side read of the display buffer.
    pub fn read_display(&self) -> Result<Vec<Float4>> {
        let guard = self.buffers.display().begin_render()?;
        read_buffer(&self.binding, guard.buffer(), self.buffers.num_particles())
    }
}

impl StepBackend for GpuBackend {
    fn compute_acceleration(&mut self) -> Result<()> {
        self.dispatch(KernelRole::Acceleration, self.buffers.num_particles())
    }

    fn integrate(&mut self, kernel: IntegratorKernel, stage: i32, step: u64) -> Result<()> {
        let role = match kernel {
            IntegratorKernel::Bootstrap => KernelRole::Bootstrap,
            IntegratorKernel::Predictor => KernelRole::Predictor,
            IntegratorKernel::Corrector => KernelRole::Corrector,
        };
        let args = self.kernels.get_mut(role).args_mut();
        args.set_int(ARG_STAGE, stage)?;
        args.set_int(ARG_STEP, kernel_step(step))?;
        self.dispatch(role, self.buffers.num_particles())
    }

    fn commit(&mut self) -> Result<()> {
        let n = self.buffers.num_particles();
        let g = self.buffers.num_grav();
        self.copy(
            "commit stage",
            &[
                (BufferRole::NewPos, BufferRole::CurrPos, n),
                (BufferRole::NewPos, BufferRole::GravPos, g),
                (BufferRole::NewVel, BufferRole::CurrVel, n),
            ],
        )
    }

    fn refresh_display(&mut self) -> Result<()> {
        let _guard = self.buffers.display().acquire()?;
        self.dispatch(KernelRole::Display, self.buffers.num_particles())
    }
}
