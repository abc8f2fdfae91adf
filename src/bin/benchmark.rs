/*
N-Body Integration Throughput Benchmark

Measures stage throughput of the device integrator for a range of body counts and
acceleration models. One device binding is reused across runs: each configuration
builds a session, warms it up past the bootstrap phase, times a fixed number of
steps and tears the session down again, checking that no device buffers leak
between rebuilds.
*/

use std::time::Instant;

use nbody_compute::{
    body::InitialState,
    gpu::{selector::SelectionRequest, DeviceBinding},
    physics::{AccelerationModel, Session, SimulationConfig},
};

const WARMUP_STEPS: u64 = 20;
const TIMED_STEPS: u64 = 50;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let test_counts = [1024usize, 4096, 16384, 65536];
    let models = [AccelerationModel::Newtonian, AccelerationModel::Relativistic, AccelerationModel::RelativisticLocal];

    println!("N-Body Integration Benchmark");
    println!("============================\n");

    let mut binding = DeviceBinding::new_blocking(&SelectionRequest::default())?;
    println!("Device: {} ({})\n", binding.device_name(), binding.platform_name());
    println!("{:>8} {:>18} {:>10} {:>12} {:>16}", "bodies", "model", "ms/step", "steps/s", "interactions/s");

    for &count in &test_counts {
        for &model in &models {
            let config = SimulationConfig::new(count, 16)
                .with_acceleration(model)
                .with_time_step(3600.0);
            let initial = InitialState::random_cube(count, 16)?;

            let mut session = Session::new(binding, &config, &initial)?;
            session.advance(WARMUP_STEPS)?;

            let start = Instant::now();
            session.advance(TIMED_STEPS)?;
            let elapsed = start.elapsed().as_secs_f64();

            let per_step = elapsed / TIMED_STEPS as f64;
            let interactions = (session.num_particles() * session.num_grav()) as f64 / per_step;
            println!(
                "{:>8} {:>18} {:>10.3} {:>12.1} {:>16.3e}",
                session.num_particles(),
                model.to_string(),
                per_step * 1000.0,
                1.0 / per_step,
                interactions
            );

            binding = session.teardown();
            let outstanding = binding.tracker().outstanding();
            if outstanding != 0 {
                anyhow::bail!("{} device buffers leaked after teardown", outstanding);
            }
        }
    }

    Ok(())
}
