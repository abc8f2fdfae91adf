//! Headless simulation runner.
//!
//! Builds a session from command-line options, integrates a number of steps
//! and refreshes the display buffer every `--display-every` steps, logging
//! progress as it goes. The vendor id of the chosen device is remembered in
//! `--vendor-cache` so the next run takes the fast path.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use nbody_compute::{
    body::InitialState,
    gpu::{capabilities::DeviceClass, selector::VendorIdCache, DeviceBinding},
    physics::{AccelerationModel, IntegratorOrder, Session, SimulationConfig, StageOutcome},
};

#[derive(Parser, Debug)]
#[command(name = "nbody_compute")]
#[command(about = "Multistep n-body integration on a compute device")]
struct Args {
    /// Number of simulated bodies (rounded down to the work-group size)
    #[arg(long, default_value = "20480")]
    particles: usize,

    /// Number of gravitating bodies at the front of the list
    #[arg(long, default_value = "16")]
    grav: usize,

    /// Time step in seconds; negative integrates backwards
    #[arg(long, default_value = "14400", allow_hyphen_values = true)]
    dt: f64,

    /// Softening added to every squared distance
    #[arg(long, default_value = "1e-6")]
    eps: f64,

    /// Corrector passes per step
    #[arg(long, default_value = "1")]
    stages: i32,

    /// Predictor order or kernel name (4, 8, 10, 11, 12, 16)
    #[arg(long, default_value = "11")]
    integrator: IntegratorOrder,

    /// Acceleration model: newtonian, relativistic, relativisticLocal
    #[arg(long, default_value = "relativistic")]
    acceleration: AccelerationModel,

    /// Index of the gravitating body the display is centered on
    #[arg(long, default_value = "0")]
    center: usize,

    /// Requested work-group size
    #[arg(long, default_value = "64")]
    group_size: u32,

    /// Preferred device class: gpu, cpu or any
    #[arg(long, default_value = "gpu")]
    device: DeviceClass,

    /// Restrict selection to one platform
    #[arg(long)]
    platform: Option<String>,

    /// File remembering the vendor id of the last device used
    #[arg(long, default_value = ".nbody_vendor")]
    vendor_cache: PathBuf,

    /// External kernel source instead of the bundled one
    #[arg(long)]
    kernels: Option<PathBuf>,

    /// Steps to integrate
    #[arg(long, default_value = "100")]
    steps: u64,

    /// Refresh the display buffer every this many steps (0 disables)
    #[arg(long, default_value = "10")]
    display_every: u64,

    /// Julian date of the initial state
    #[arg(long, default_value = "2451545.0")]
    julian_date: f64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cache = VendorIdCache::new(&args.vendor_cache);
    let config = SimulationConfig::new(args.particles, args.grav)
        .with_time_step(args.dt)
        .with_softening(args.eps)
        .with_num_stages(args.stages)
        .with_integrator(args.integrator)
        .with_acceleration(args.acceleration)
        .with_center_body(args.center)
        .with_group_size(args.group_size)
        .with_device_class(args.device)
        .with_vendor_id(cache.load())
        .with_platform_hint(args.platform.clone())
        .with_kernel_source(args.kernels.clone());
    config.validate()?;

    let initial = InitialState::random_cube(config.num_particles, config.num_grav)?
        .with_julian_date(args.julian_date);

    let binding = DeviceBinding::new_blocking(&config.selection_request()).context("no usable compute device")?;
    if let Err(e) = cache.store(binding.vendor_id()) {
        warn!("could not remember vendor id in {:?}: {}", cache.path(), e);
    }
    info!(
        "device '{}' on '{}' (vendor 0x{:X})",
        binding.device_name(),
        binding.platform_name(),
        binding.vendor_id()
    );

    let mut session = Session::new(binding, &config, &initial).context("session setup failed")?;
    run(&mut session, &args)?;

    let final_state = session.read_state()?;
    info!(
        "finished at step {} (JD {:.5}), body 0 at ({:.6e}, {:.6e}, {:.6e})",
        session.state().step,
        final_state.julian_date,
        final_state.positions[0].x,
        final_state.positions[0].y,
        final_state.positions[0].z
    );

    let binding = session.teardown();
    info!("{} device buffers outstanding after teardown", binding.tracker().outstanding());
    Ok(())
}

fn run(session: &mut Session, args: &Args) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut completed = 0u64;

    if args.display_every > 0 {
        session.request_display_update();
    }

    while completed < args.steps {
        let outcome = session
            .step()
            .with_context(|| format!("integration stopped at step {}", session.state().step))?;

        if let StageOutcome::Completed { displayed } = outcome {
            completed += 1;
            if displayed {
                info!(
                    "step {} t={:.1}s JD {:.5}",
                    session.state().step,
                    session.state().time,
                    session.julian_date()
                );
            }
            if args.display_every > 0 && completed % args.display_every == 0 {
                session.request_display_update();
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    let interactions = completed as f64 * session.num_particles() as f64 * session.num_grav() as f64;
    info!(
        "{} steps in {:.3}s ({:.1} steps/s, {:.3e} interactions/s)",
        completed,
        elapsed,
        completed as f64 / elapsed,
        interactions / elapsed
    );
    Ok(())
}
