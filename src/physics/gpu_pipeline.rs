use std::collections::HashMap;

use log::{debug, error, info, warn};
use pollster::block_on;
use wgpu::{BindGroup, BindGroupLayout, ComputePipeline, ShaderModule};

use crate::body::Double4;
use crate::error::{Result, SimError};
use crate::gpu::capabilities::DeviceLimits;
use crate::gpu::DeviceBinding;
use crate::shaders::ShaderBuilder;
use super::buffer_manager::{BindingKind, BufferSet, BufferSizing, TrackedBuffer};
use super::kernel_args::{KernelArgs, KernelRole};
use super::simulation_parameters::{AccelerationModel, SimulationConfig};

/// Largest group one kernel accepts on this device. The local acceleration
/// kernel keeps one tile entry per invocation in work-group memory.
pub fn kernel_max_group_size(role: KernelRole, model: AccelerationModel, limits: &DeviceLimits) -> u32 {
    let device_max = limits.max_group_size_1d();
    if role == KernelRole::Acceleration && model.uses_local_memory() {
        let by_local_memory = limits.local_memory_size / std::mem::size_of::<Double4>() as u32;
        device_max.min(by_local_memory)
    } else {
        device_max
    }
}

/// Shrink the requested group size to the smallest per-kernel maximum.
pub fn negotiate_group_size(requested: u32, model: AccelerationModel, limits: &DeviceLimits) -> u32 {
    let mut group_size = requested.min(limits.max_group_size_1d());
    for role in KernelRole::ALL {
        let max = kernel_max_group_size(role, model, limits);
        debug!("kernel {:?} accepts groups up to {}", role, max);
        group_size = group_size.min(max);
    }
    group_size.max(1)
}

/// Buffer sizes for `config` on a device with `limits`. The group size is
/// settled first, so the particle count rounds to the group the kernels run.
pub fn plan_sizing(config: &SimulationConfig, limits: &DeviceLimits) -> Result<BufferSizing> {
    let group_size = negotiate_group_size(config.group_size, config.acceleration, limits);
    if group_size != config.group_size {
        info!("work-group size reduced from {} to {}", config.group_size, group_size);
    }

    let sizing = BufferSizing::negotiate(config.num_particles, config.num_grav, group_size, limits)?;
    if config.center_body >= sizing.num_grav {
        return Err(SimError::InvalidConfig(format!(
            "center body {} is not one of the {} gravitating bodies",
            config.center_body, sizing.num_grav
        )));
    }
    Ok(sizing)
}

/// Map an error captured while creating `kernel`'s objects.
fn check_creation(kernel: &str, scope_error: Option<wgpu::Error>) -> Result<()> {
    match scope_error {
        Some(err) => {
            error!("kernel {} could not be created: {}", kernel, err);
            Err(SimError::KernelCreation {
                kernel: kernel.to_string(),
                kind: (&err).into(),
                detail: err.to_string(),
            })
        }
        None => Ok(()),
    }
}

/// One compiled kernel with its arguments bound.
pub struct BoundKernel {
    args: KernelArgs,
    pipeline: ComputePipeline,
    buffer_group: BindGroup,
    params_group: BindGroup,
    params: TrackedBuffer,
}

impl BoundKernel {
    pub fn name(&self) -> &'static str {
        self.args.name()
    }

    pub fn args(&self) -> &KernelArgs {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut KernelArgs {
        &mut self.args
    }

    pub fn pipeline(&self) -> &ComputePipeline {
        &self.pipeline
    }

    pub fn buffer_group(&self) -> &BindGroup {
        &self.buffer_group
    }

    pub fn params_group(&self) -> &BindGroup {
        &self.params_group
    }

    /// Upload the current scalar arguments. Takes effect at the next submit.
    pub fn write_params(&self, binding: &DeviceBinding) {
        binding
            .queue()
            .write_buffer(self.params.buffer(), 0, &self.args.pack_scalars());
    }
}

/// The five kernels of a session and the shared dispatch group size.
pub struct KernelSet {
    pub acceleration: BoundKernel,
    pub bootstrap: BoundKernel,
    pub predictor: BoundKernel,
    pub corrector: BoundKernel,
    pub display: BoundKernel,
    group_size: u32,
}

impl KernelSet {
    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    pub fn get(&self, role: KernelRole) -> &BoundKernel {
        match role {
            KernelRole::Acceleration => &self.acceleration,
            KernelRole::Bootstrap => &self.bootstrap,
            KernelRole::Predictor => &self.predictor,
            KernelRole::Corrector => &self.corrector,
            KernelRole::Display => &self.display,
        }
    }

    pub fn get_mut(&mut self, role: KernelRole) -> &mut BoundKernel {
        match role {
            KernelRole::Acceleration => &mut self.acceleration,
            KernelRole::Bootstrap => &mut self.bootstrap,
            KernelRole::Predictor => &mut self.predictor,
            KernelRole::Corrector => &mut self.corrector,
            KernelRole::Display => &mut self.display,
        }
    }
}

/// Builds the program for a bound device and instantiates its kernels.
pub struct KernelCompiler<'a> {
    binding: &'a DeviceBinding,
}

impl<'a> KernelCompiler<'a> {
    pub fn new(binding: &'a DeviceBinding) -> Self {
        Self { binding }
    }

    pub fn compile(
        &self,
        builder: ShaderBuilder,
        buffers: &BufferSet<TrackedBuffer>,
        config: &SimulationConfig,
    ) -> Result<KernelSet> {
        let group_size = buffers.sizing().group_size;
        let accepted = negotiate_group_size(group_size, config.acceleration, self.binding.limits());
        if accepted != group_size {
            return Err(SimError::InvalidConfig(format!(
                "buffers sized for groups of {} but the kernels accept at most {}",
                group_size, accepted
            )));
        }
        let n = buffers.num_particles();
        if n % group_size as usize != 0 {
            return Err(SimError::InvalidConfig(format!(
                "{} particles is not a multiple of the group size {}",
                n, group_size
            )));
        }

        let accel_args = KernelArgs::acceleration(config.acceleration, buffers.num_grav(), config.eps_sqr, group_size);
        if accel_args.local_memory() > self.binding.limits().local_memory_size as u64 {
            return Err(SimError::KernelCreation {
                kernel: accel_args.name().to_string(),
                kind: crate::error::DeviceErrorKind::OutOfMemory,
                detail: format!("{} bytes of local memory requested", accel_args.local_memory()),
            });
        }

        let builder = builder
            .with_extensions(self.binding.extensions())
            .with_grav_capacity(buffers.num_grav())
            .with_local_tile(accel_args.local_tile_len());
        let module = self.load_shader(&builder)?;

        let build = |args: KernelArgs| self.create_kernel(&module, args, buffers, group_size, config.num_stages);
        let kernels = KernelSet {
            acceleration: build(accel_args)?,
            bootstrap: build(KernelArgs::bootstrap(config.del_t, n))?,
            predictor: build(KernelArgs::predictor(config.integrator, config.del_t, n))?,
            corrector: build(KernelArgs::corrector(config.integrator, config.del_t, n))?,
            display: build(KernelArgs::display(config.center_body))?,
            group_size,
        };

        info!(
            "kernels ready: {}, {}, {}, group size {}",
            kernels.acceleration.name(),
            kernels.predictor.name(),
            kernels.corrector.name(),
            group_size
        );
        Ok(kernels)
    }

    fn load_shader(&self, builder: &ShaderBuilder) -> Result<ShaderModule> {
        let source = builder.build();
        let (module, scope_error) = self.binding.capture(|| {
            self.binding.device().create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("nbody kernels"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        });

        let info = block_on(module.get_compilation_info());
        let mut log = String::new();
        let mut failed = false;
        for message in &info.messages {
            let location = message
                .location
                .map(|l| format!("{}:{}: ", l.line_number, l.line_position))
                .unwrap_or_default();
            match message.message_type {
                wgpu::CompilationMessageType::Error => failed = true,
                wgpu::CompilationMessageType::Warning => warn!("kernel source: {}{}", location, message.message),
                wgpu::CompilationMessageType::Info => debug!("kernel source: {}{}", location, message.message),
            }
            log.push_str(&format!("{}{}\n", location, message.message));
        }

        if let Some(err) = scope_error {
            failed = true;
            log.push_str(&err.to_string());
        }
        if failed {
            error!("program build failed");
            return Err(SimError::Compilation { log });
        }

        Ok(module)
    }

    fn create_kernel(
        &self,
        module: &ShaderModule,
        args: KernelArgs,
        buffers: &BufferSet<TrackedBuffer>,
        group_size: u32,
        num_stages: i32,
    ) -> Result<BoundKernel> {
        let device = self.binding.device();
        let constants = HashMap::from([
            ("WORKGROUP_SIZE".to_string(), group_size as f64),
            ("NUM_STAGES".to_string(), num_stages as f64),
        ]);
        let entries: Vec<wgpu::BindGroupEntry> = args
            .buffers()
            .map(|role| wgpu::BindGroupEntry {
                binding: role.binding(),
                resource: buffers.get(role).buffer().as_entire_binding(),
            })
            .collect();

        let ((params_layout, pipeline, buffer_group), scope_error) = self.binding.capture(|| {
            let buffer_layout = self.create_buffer_layout(&args);
            let params_layout = self.create_params_layout(&args);
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(args.name()),
                bind_group_layouts: &[&buffer_layout, &params_layout],
                push_constant_ranges: &[],
            });

            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(args.name()),
                layout: Some(&pipeline_layout),
                module,
                entry_point: Some(args.name()),
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    ..Default::default()
                },
                cache: None,
            });

            let buffer_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(args.name()),
                layout: &buffer_layout,
                entries: &entries,
            });
            (params_layout, pipeline, buffer_group)
        });
        check_creation(args.name(), scope_error)?;

        let scalars = args.pack_scalars();
        let params = TrackedBuffer::create(
            self.binding,
            args.name(),
            scalars.len(),
            scalars.len() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )?;
        let (params_group, scope_error) = self.binding.capture(|| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(args.name()),
                layout: &params_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: args.role().params_binding(),
                    resource: params.buffer().as_entire_binding(),
                }],
            })
        });
        check_creation(args.name(), scope_error)?;

        let kernel = BoundKernel {
            args,
            pipeline,
            buffer_group,
            params_group,
            params,
        };
        kernel.write_params(self.binding);
        Ok(kernel)
    }

    fn create_buffer_layout(&self, args: &KernelArgs) -> BindGroupLayout {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = args
            .buffers()
            .map(|role| {
                let ty = match role.binding_kind() {
                    BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
                    BindingKind::Storage { read_only } => wgpu::BufferBindingType::Storage { read_only },
                };
                wgpu::BindGroupLayoutEntry {
                    binding: role.binding(),
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }
            })
            .collect();

        self.binding.device().create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(args.name()),
            entries: &entries,
        })
    }

    fn create_params_layout(&self, args: &KernelArgs) -> BindGroupLayout {
        self.binding.device().create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(args.name()),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: args.role().params_binding(),
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        })
    }
}
