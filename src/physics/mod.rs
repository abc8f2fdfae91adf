pub mod buffer_manager;
pub mod compute_executor;
pub mod gpu_pipeline;
pub mod integrator;
pub mod kernel_args;
pub mod simulation_parameters;

pub use buffer_manager::{AllocationTracker, BufferRole, BufferSet, BufferSizing, DisplayOwner};
pub use integrator::{Driver, IntegrationState, IntegratorKernel, StageOutcome, StepBackend};
pub use simulation_parameters::{AccelerationModel, IntegratorOrder, SimulationConfig};

use log::info;

use crate::body::{Float4, InitialState};
use crate::error::Result;
use crate::gpu::DeviceBinding;
use crate::shaders::ShaderBuilder;
use self::{
    buffer_manager::BufferManager,
    compute_executor::GpuBackend,
    gpu_pipeline::{plan_sizing, KernelCompiler},
};

/// A running simulation on one device. Built in dependency order: the
/// device binding, then the buffer set, then the kernels bound to it.
pub struct Session {
    driver: Driver<GpuBackend>,
}

impl Session {
    /// Select a device for `config` and build a session on it.
    pub fn build(config: &SimulationConfig, initial: &InitialState) -> Result<Self> {
        config.validate()?;
        let binding = DeviceBinding::new_blocking(&config.selection_request())?;
        Self::new(binding, config, initial)
    }

    pub fn new(binding: DeviceBinding, config: &SimulationConfig, initial: &InitialState) -> Result<Self> {
        config.validate()?;

        let sizing = plan_sizing(config, binding.limits())?;
        let buffers = BufferManager::new(&binding).allocate(sizing)?;
        let builder = ShaderBuilder::from_config(config.kernel_source.as_deref())?;
        let kernels = KernelCompiler::new(&binding).compile(builder, &buffers, config)?;

        let backend = GpuBackend::new(binding, buffers, kernels);
        backend.write_initial_state(initial)?;

        info!(
            "session ready on '{}': {} bodies, {} gravitating, {}, {}",
            backend.binding().device_name(),
            sizing.num_particles,
            sizing.num_grav,
            config.acceleration,
            config.integrator
        );

        let state = IntegrationState::new(config.num_stages, config.del_t, initial.julian_date);
        Ok(Self {
            driver: Driver::new(backend, state),
        })
    }

    /// Run one stage.
    pub fn step(&mut self) -> Result<StageOutcome> {
        self.driver.step()
    }

    /// Run until `steps` more steps have completed.
    pub fn advance(&mut self, steps: u64) -> Result<()> {
        self.driver.advance(steps)
    }

    pub fn request_display_update(&mut self) {
        self.driver.request_display_update();
    }

    pub fn state(&self) -> &IntegrationState {
        self.driver.state()
    }

    pub fn julian_date(&self) -> f64 {
        self.driver.state().julian_date()
    }

    pub fn num_particles(&self) -> usize {
        self.driver.backend().buffers().num_particles()
    }

    pub fn num_grav(&self) -> usize {
        self.driver.backend().buffers().num_grav()
    }

    pub fn binding(&self) -> &DeviceBinding {
        self.driver.backend().binding()
    }

    pub fn display_owner(&self) -> DisplayOwner {
        self.driver.backend().buffers().display().owner()
    }

    /// Replace the current state and restart the integrator from step 0.
    pub fn write_initial_state(&mut self, initial: &InitialState) -> Result<()> {
        self.driver.backend().write_initial_state(initial)?;
        self.driver.reset(initial.julian_date);
        Ok(())
    }

    /// Snapshot of the committed state as a new initial state.
    pub fn read_state(&self) -> Result<InitialState> {
        let (positions, velocities) = self.driver.backend().read_state()?;
        let num_grav = self.num_grav();
        Ok(InitialState::new(positions, velocities, num_grav)?.with_julian_date(self.julian_date()))
    }

    /// What the renderer would draw right now.
    pub fn read_display(&self) -> Result<Vec<Float4>> {
        self.driver.backend().read_display()
    }

    /// Release kernels and buffers in reverse order of creation and hand the
    /// device back for a rebuild.
    pub fn teardown(self) -> DeviceBinding {
        let binding = self.driver.into_backend().into_binding();
        info!("session torn down on '{}'", binding.device_name());
        binding
    }
}
