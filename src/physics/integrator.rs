//! Integration driver.
//!
//! One call to [`Driver::step`] runs one stage: acceleration, one integrator
//! kernel, then the commit of the new state. A simulated step is complete
//! after `num_stages + 1` stages; only then do `step` and `time` advance.

use log::{debug, trace};

use crate::error::Result;
use super::buffer_manager::HISTORY_DEPTH;

/// Steps integrated by the bootstrap kernel before the history ring is full.
pub const BOOTSTRAP_STEPS: u64 = HISTORY_DEPTH as u64;

const SECONDS_PER_DAY: f64 = 86400.0;

/// Which integrator kernel a stage dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegratorKernel {
    Bootstrap,
    Predictor,
    Corrector,
}

/// Device-side operations of one stage. Every call returns only after the
/// device has finished the work it issued.
pub trait StepBackend {
    fn compute_acceleration(&mut self) -> Result<()>;

    fn integrate(&mut self, kernel: IntegratorKernel, stage: i32, step: u64) -> Result<()>;

    /// Copy the stage result into the current state and gravitating prefix.
    fn commit(&mut self) -> Result<()>;

    fn refresh_display(&mut self) -> Result<()>;
}

/// Counters of the stage state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationState {
    pub step: u64,
    pub stage: i32,
    pub num_stages: i32,
    pub del_t: f64,
    /// Simulated seconds since the initial state.
    pub time: f64,
    pub initial_julian_date: f64,
    pub display_requested: bool,
}

impl IntegrationState {
    pub fn new(num_stages: i32, del_t: f64, initial_julian_date: f64) -> Self {
        Self {
            step: 0,
            stage: num_stages,
            num_stages,
            del_t,
            time: 0.0,
            initial_julian_date,
            display_requested: false,
        }
    }

    pub fn next_kernel(&self) -> IntegratorKernel {
        if self.step < BOOTSTRAP_STEPS {
            IntegratorKernel::Bootstrap
        } else if self.stage == self.num_stages {
            IntegratorKernel::Predictor
        } else {
            IntegratorKernel::Corrector
        }
    }

    pub fn julian_date(&self) -> f64 {
        self.initial_julian_date + self.time / SECONDS_PER_DAY
    }

    pub fn in_bootstrap(&self) -> bool {
        self.step < BOOTSTRAP_STEPS
    }

    /// Count one stage down. Returns true when this completed a step.
    fn rotate(&mut self) -> bool {
        self.stage -= 1;
        if self.stage < 0 {
            self.stage = self.num_stages;
            self.time += self.del_t;
            self.step += 1;
            true
        } else {
            false
        }
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// More stages of the current step remain.
    Staged,
    /// The step completed; `displayed` is true if the display was refreshed.
    Completed { displayed: bool },
}

pub struct Driver<B: StepBackend> {
    backend: B,
    state: IntegrationState,
}

impl<B: StepBackend> Driver<B> {
    pub fn new(backend: B, state: IntegrationState) -> Self {
        Self { backend, state }
    }

    pub fn state(&self) -> &IntegrationState {
        &self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Restart the counters, keeping the request flag.
    pub fn reset(&mut self, initial_julian_date: f64) {
        let display_requested = self.state.display_requested;
        self.state = IntegrationState::new(self.state.num_stages, self.state.del_t, initial_julian_date);
        self.state.display_requested = display_requested;
    }

    /// Ask for a display refresh at the next completed step.
    pub fn request_display_update(&mut self) {
        self.state.display_requested = true;
    }

    /// Run one stage. On error nothing is rotated: the state counters still
    /// describe the last committed stage.
    pub fn step(&mut self) -> Result<StageOutcome> {
        let kernel = self.state.next_kernel();
        trace!("step {} stage {} -> {:?}", self.state.step, self.state.stage, kernel);

        self.backend.compute_acceleration()?;
        self.backend.integrate(kernel, self.state.stage, self.state.step)?;
        self.backend.commit()?;

        if !self.state.rotate() {
            return Ok(StageOutcome::Staged);
        }

        if self.state.step == BOOTSTRAP_STEPS {
            debug!("bootstrap complete after {} steps", BOOTSTRAP_STEPS);
        }

        let displayed = if self.state.display_requested {
            self.backend.refresh_display()?;
            self.state.display_requested = false;
            true
        } else {
            false
        };
        Ok(StageOutcome::Completed { displayed })
    }

    /// Run stages until `steps` more steps have completed.
    pub fn advance(&mut self, steps: u64) -> Result<()> {
        let target = self.state.step + steps;
        while self.state.step < target {
            self.step()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceErrorKind, SimError};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Acceleration,
        Integrate(IntegratorKernel, i32, u64),
        Commit,
        Display,
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
        fail_commit: bool,
    }

    impl StepBackend for Recorder {
        fn compute_acceleration(&mut self) -> Result<()> {
            self.calls.push(Call::Acceleration);
            Ok(())
        }

        fn integrate(&mut self, kernel: IntegratorKernel, stage: i32, step: u64) -> Result<()> {
            self.calls.push(Call::Integrate(kernel, stage, step));
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            if self.fail_commit {
                return Err(SimError::Dispatch {
                    operation: "commit".into(),
                    kind: DeviceErrorKind::DeviceLost,
                    detail: "lost".into(),
                });
            }
            self.calls.push(Call::Commit);
            Ok(())
        }

        fn refresh_display(&mut self) -> Result<()> {
            self.calls.push(Call::Display);
            Ok(())
        }
    }

    fn integrations(calls: &[Call]) -> Vec<(IntegratorKernel, i32, u64)> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Integrate(k, stage, step) => Some((*k, *stage, *step)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_stage_order_within_a_stage() {
        let mut driver = Driver::new(Recorder::default(), IntegrationState::new(1, 10.0, 0.0));
        driver.step().unwrap();
        assert_eq!(
            driver.backend().calls,
            vec![Call::Acceleration, Call::Integrate(IntegratorKernel::Bootstrap, 1, 0), Call::Commit]
        );
    }

    #[test]
    fn test_step_counts_once_per_cycle() {
        for num_stages in 1..4 {
            let mut driver = Driver::new(Recorder::default(), IntegrationState::new(num_stages, 2.5, 0.0));
            let stages = 20 * (num_stages as usize + 1);
            for _ in 0..stages {
                driver.step().unwrap();
            }
            assert_eq!(driver.state().step, 20);
            assert_eq!(driver.state().time, 50.0);
            assert_eq!(driver.state().stage, num_stages);
        }
    }

    #[test]
    fn test_kernel_schedule() {
        let mut driver = Driver::new(Recorder::default(), IntegrationState::new(1, 1.0, 0.0));
        driver.advance(18).unwrap();
        let calls = integrations(&driver.backend().calls);
        assert_eq!(calls.len(), 36);
        for (i, (kernel, stage, step)) in calls.iter().enumerate() {
            assert_eq!(*step, i as u64 / 2);
            assert_eq!(*stage, if i % 2 == 0 { 1 } else { 0 });
            let expected = match (*step < 16, *stage) {
                (true, _) => IntegratorKernel::Bootstrap,
                (false, 1) => IntegratorKernel::Predictor,
                _ => IntegratorKernel::Corrector,
            };
            assert_eq!(*kernel, expected);
        }
    }

    #[test]
    fn test_display_only_on_request() {
        let mut driver = Driver::new(Recorder::default(), IntegrationState::new(1, 1.0, 0.0));
        driver.advance(3).unwrap();
        assert!(!driver.backend().calls.contains(&Call::Display));

        driver.request_display_update();
        assert_eq!(driver.step().unwrap(), StageOutcome::Staged);
        assert_eq!(driver.step().unwrap(), StageOutcome::Completed { displayed: true });
        assert_eq!(driver.step().unwrap(), StageOutcome::Staged);
        assert_eq!(driver.step().unwrap(), StageOutcome::Completed { displayed: false });
        let displays = driver.backend().calls.iter().filter(|c| **c == Call::Display).count();
        assert_eq!(displays, 1);
    }

    #[test]
    fn test_failure_does_not_rotate() {
        let mut driver = Driver::new(Recorder::default(), IntegrationState::new(1, 1.0, 0.0));
        driver.step().unwrap();
        let before = driver.state().clone();

        driver.backend_mut().fail_commit = true;
        let err = driver.step().unwrap_err();
        assert!(err.is_dispatch_failure());
        assert_eq!(driver.state(), &before);
    }

    #[test]
    fn test_julian_date_tracks_time() {
        let mut driver = Driver::new(Recorder::default(), IntegrationState::new(1, 43200.0, 2451545.0));
        driver.advance(4).unwrap();
        assert_eq!(driver.state().julian_date(), 2451547.0);

        driver.reset(2451600.0);
        assert_eq!(driver.state().step, 0);
        assert_eq!(driver.state().julian_date(), 2451600.0);
    }
}
