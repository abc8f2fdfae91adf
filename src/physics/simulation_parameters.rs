use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, SimError};
use crate::gpu::capabilities::DeviceClass;
use crate::gpu::selector::SelectionRequest;

const DEFAULT_NUM_PARTICLES: usize = 20480;
const DEFAULT_NUM_GRAV: usize = 16;
const DEFAULT_TIME_STEP: f64 = 4.0 * 60.0 * 60.0;
const DEFAULT_EPS_SQR: f64 = 1.0e-6;
const DEFAULT_GROUP_SIZE: u32 = 64;

/// Predictor/corrector pairs the kernel source provides. The corrector is
/// always one order below its predictor by name and uses the same number of
/// ordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegratorOrder {
    Ab4Am3,
    Ab8Am7,
    Ab10Am9,
    Ab11Am10,
    Ab12Am11,
    Ab16Am15,
}

impl IntegratorOrder {
    pub const ALL: [IntegratorOrder; 6] = [
        IntegratorOrder::Ab4Am3,
        IntegratorOrder::Ab8Am7,
        IntegratorOrder::Ab10Am9,
        IntegratorOrder::Ab11Am10,
        IntegratorOrder::Ab12Am11,
        IntegratorOrder::Ab16Am15,
    ];

    /// Number of history ordinates the predictor consumes.
    pub fn order(&self) -> usize {
        match self {
            IntegratorOrder::Ab4Am3 => 4,
            IntegratorOrder::Ab8Am7 => 8,
            IntegratorOrder::Ab10Am9 => 10,
            IntegratorOrder::Ab11Am10 => 11,
            IntegratorOrder::Ab12Am11 => 12,
            IntegratorOrder::Ab16Am15 => 16,
        }
    }

    pub fn predictor_kernel(&self) -> &'static str {
        match self {
            IntegratorOrder::Ab4Am3 => "adamsBashforth4",
            IntegratorOrder::Ab8Am7 => "adamsBashforth8",
            IntegratorOrder::Ab10Am9 => "adamsBashforth10",
            IntegratorOrder::Ab11Am10 => "adamsBashforth11",
            IntegratorOrder::Ab12Am11 => "adamsBashforth12",
            IntegratorOrder::Ab16Am15 => "adamsBashforth16",
        }
    }

    pub fn corrector_kernel(&self) -> &'static str {
        match self {
            IntegratorOrder::Ab4Am3 => "adamsMoulton3",
            IntegratorOrder::Ab8Am7 => "adamsMoulton7",
            IntegratorOrder::Ab10Am9 => "adamsMoulton9",
            IntegratorOrder::Ab11Am10 => "adamsMoulton10",
            IntegratorOrder::Ab12Am11 => "adamsMoulton11",
            IntegratorOrder::Ab16Am15 => "adamsMoulton15",
        }
    }
}

impl FromStr for IntegratorOrder {
    type Err = SimError;

    /// Accepts the predictor order ("11"), the predictor kernel name or the
    /// corrector kernel name.
    fn from_str(s: &str) -> Result<Self> {
        IntegratorOrder::ALL
            .iter()
            .copied()
            .find(|o| s == o.order().to_string() || s == o.predictor_kernel() || s == o.corrector_kernel())
            .ok_or_else(|| SimError::InvalidConfig(format!("unknown integrator order '{}'", s)))
    }
}

impl fmt::Display for IntegratorOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.predictor_kernel(), self.corrector_kernel())
    }
}

/// Acceleration kernels. The argument list of each is fixed by its tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationModel {
    Newtonian,
    /// Post-Newtonian correction driven by each body's velocity `w` factor.
    Relativistic,
    /// Relativistic, staging gravitating positions through work-group memory.
    RelativisticLocal,
}

impl AccelerationModel {
    pub const ALL: [AccelerationModel; 3] = [
        AccelerationModel::Newtonian,
        AccelerationModel::Relativistic,
        AccelerationModel::RelativisticLocal,
    ];

    pub fn kernel_name(&self) -> &'static str {
        match self {
            AccelerationModel::Newtonian => "newtonian",
            AccelerationModel::Relativistic => "relativistic",
            AccelerationModel::RelativisticLocal => "relativisticLocal",
        }
    }

    pub fn uses_velocity(&self) -> bool {
        !matches!(self, AccelerationModel::Newtonian)
    }

    pub fn uses_local_memory(&self) -> bool {
        matches!(self, AccelerationModel::RelativisticLocal)
    }
}

impl FromStr for AccelerationModel {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        AccelerationModel::ALL
            .iter()
            .copied()
            .find(|m| m.kernel_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| SimError::InvalidConfig(format!("unknown acceleration model '{}'", s)))
    }
}

impl fmt::Display for AccelerationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kernel_name())
    }
}

/// Everything read once per (re)initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub num_particles: usize,
    pub num_grav: usize,
    /// Signed seconds per step; the sign picks the direction of integration.
    pub del_t: f64,
    pub eps_sqr: f64,
    pub num_stages: i32,
    pub integrator: IntegratorOrder,
    pub acceleration: AccelerationModel,
    pub center_body: usize,
    /// Requested work-group size before device clamping.
    pub group_size: u32,
    pub device_class: DeviceClass,
    pub vendor_id: Option<u32>,
    pub platform_hint: Option<String>,
    /// External kernel source; `None` uses the bundled file.
    pub kernel_source: Option<PathBuf>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_particles: DEFAULT_NUM_PARTICLES,
            num_grav: DEFAULT_NUM_GRAV,
            del_t: DEFAULT_TIME_STEP,
            eps_sqr: DEFAULT_EPS_SQR,
            num_stages: 1,
            integrator: IntegratorOrder::Ab11Am10,
            acceleration: AccelerationModel::Relativistic,
            center_body: 0,
            group_size: DEFAULT_GROUP_SIZE,
            device_class: DeviceClass::Gpu,
            vendor_id: None,
            platform_hint: None,
            kernel_source: None,
        }
    }
}

impl SimulationConfig {
    pub fn new(num_particles: usize, num_grav: usize) -> Self {
        Self {
            num_particles,
            num_grav,
            ..Self::default()
        }
    }

    pub fn with_time_step(mut self, del_t: f64) -> Self {
        self.del_t = del_t;
        self
    }

    pub fn with_softening(mut self, eps_sqr: f64) -> Self {
        self.eps_sqr = eps_sqr;
        self
    }

    pub fn with_num_stages(mut self, num_stages: i32) -> Self {
        self.num_stages = num_stages;
        self
    }

    pub fn with_integrator(mut self, integrator: IntegratorOrder) -> Self {
        self.integrator = integrator;
        self
    }

    pub fn with_acceleration(mut self, acceleration: AccelerationModel) -> Self {
        self.acceleration = acceleration;
        self
    }

    pub fn with_center_body(mut self, center_body: usize) -> Self {
        self.center_body = center_body;
        self
    }

    pub fn with_group_size(mut self, group_size: u32) -> Self {
        self.group_size = group_size;
        self
    }

    pub fn with_device_class(mut self, device_class: DeviceClass) -> Self {
        self.device_class = device_class;
        self
    }

    pub fn with_vendor_id(mut self, vendor_id: Option<u32>) -> Self {
        self.vendor_id = vendor_id;
        self
    }

    pub fn with_platform_hint(mut self, platform_hint: Option<String>) -> Self {
        self.platform_hint = platform_hint;
        self
    }

    pub fn with_kernel_source(mut self, path: Option<PathBuf>) -> Self {
        self.kernel_source = path;
        self
    }

    pub fn selection_request(&self) -> SelectionRequest {
        SelectionRequest::default()
            .with_vendor_id(self.vendor_id)
            .with_platform_hint(self.platform_hint.clone())
            .with_class(self.device_class)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(SimError::InvalidConfig(msg));

        if self.num_particles == 0 {
            return fail("particle count must be positive".into());
        }
        if self.num_grav == 0 || self.num_grav > self.num_particles {
            return fail(format!(
                "gravitating count {} outside 1..={}",
                self.num_grav, self.num_particles
            ));
        }
        if !self.del_t.is_finite() || self.del_t == 0.0 {
            return fail(format!("time step {} must be finite and non-zero", self.del_t));
        }
        if !self.eps_sqr.is_finite() || self.eps_sqr < 0.0 {
            return fail(format!("softening {} must be finite and non-negative", self.eps_sqr));
        }
        if self.num_stages < 1 {
            return fail(format!("stage count {} must be at least 1", self.num_stages));
        }
        if self.center_body >= self.num_grav {
            return fail(format!(
                "center body {} is not one of the {} gravitating bodies",
                self.center_body, self.num_grav
            ));
        }
        if self.group_size == 0 {
            return fail("work-group size must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SimulationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.del_t, 14400.0);
        assert_eq!(config.integrator, IntegratorOrder::Ab11Am10);
        assert_eq!(config.acceleration, AccelerationModel::Relativistic);
    }

    #[test]
    fn test_validation_failures() {
        let base = SimulationConfig::new(128, 4);
        assert!(base.clone().with_time_step(0.0).validate().is_err());
        assert!(base.clone().with_time_step(f64::NAN).validate().is_err());
        assert!(base.clone().with_softening(-1.0).validate().is_err());
        assert!(base.clone().with_num_stages(0).validate().is_err());
        assert!(base.clone().with_center_body(4).validate().is_err());
        assert!(SimulationConfig::new(4, 8).validate().is_err());
        assert!(base.with_time_step(-60.0).validate().is_ok());
    }

    #[test]
    fn test_integrator_names() {
        for order in IntegratorOrder::ALL {
            let predictor: usize = order.predictor_kernel()["adamsBashforth".len()..].parse().unwrap();
            let corrector: usize = order.corrector_kernel()["adamsMoulton".len()..].parse().unwrap();
            assert_eq!(predictor, order.order());
            assert_eq!(corrector + 1, predictor);
        }
        assert_eq!("11".parse::<IntegratorOrder>().unwrap(), IntegratorOrder::Ab11Am10);
        assert_eq!("adamsMoulton3".parse::<IntegratorOrder>().unwrap(), IntegratorOrder::Ab4Am3);
        assert!("adamsBashforth5".parse::<IntegratorOrder>().is_err());
    }

    #[test]
    fn test_acceleration_names() {
        assert_eq!("newtonian".parse::<AccelerationModel>().unwrap(), AccelerationModel::Newtonian);
        assert_eq!(
            "relativisticLocal".parse::<AccelerationModel>().unwrap(),
            AccelerationModel::RelativisticLocal
        );
        assert!("mond".parse::<AccelerationModel>().is_err());
        assert!(!AccelerationModel::Newtonian.uses_velocity());
        assert!(AccelerationModel::RelativisticLocal.uses_local_memory());
    }

    #[test]
    fn test_selection_request_mirrors_config() {
        let config = SimulationConfig::default()
            .with_vendor_id(Some(0x10de))
            .with_device_class(DeviceClass::Cpu);
        let request = config.selection_request();
        assert_eq!(request.vendor_id, Some(0x10de));
        assert_eq!(request.class, DeviceClass::Cpu);
    }
}
