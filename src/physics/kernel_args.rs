//! Kernel argument lists.
//!
//! Each kernel takes an ordered argument list. Buffer arguments bind at the
//! `@group(0)` slot of their [`BufferRole`]; scalar arguments are packed, in
//! argument order and at natural alignment, into the kernel's `@group(1)`
//! uniform block; a local-memory argument reserves work-group storage.

use crate::body::Double4;
use crate::error::{Result, SimError};
use super::buffer_manager::BufferRole;
use super::simulation_parameters::{AccelerationModel, IntegratorOrder};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferRole),
    Int(i32),
    Double(f64),
    /// Work-group scratch of this many bytes.
    Local(u64),
}

/// The five kernel slots of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelRole {
    Acceleration,
    Bootstrap,
    Predictor,
    Corrector,
    Display,
}

impl KernelRole {
    pub const ALL: [KernelRole; 5] = [
        KernelRole::Acceleration,
        KernelRole::Bootstrap,
        KernelRole::Predictor,
        KernelRole::Corrector,
        KernelRole::Display,
    ];

    /// `@group(1)` slot of this kernel's scalar block.
    pub fn params_binding(&self) -> u32 {
        match self {
            KernelRole::Acceleration => 0,
            KernelRole::Bootstrap | KernelRole::Predictor | KernelRole::Corrector => 1,
            KernelRole::Display => 2,
        }
    }
}

pub const BOOTSTRAP_KERNEL: &str = "adamsStartup";
pub const DISPLAY_KERNEL: &str = "copyToDisplay";

/// Argument positions of the shared integrator signature.
pub const ARG_DEL_T: usize = 3;
pub const ARG_STAGE: usize = 6;
pub const ARG_STEP: usize = 7;
pub const ARG_NUM_PARTICLES: usize = 8;

/// Argument position of the display kernel's center-body index.
pub const ARG_CENTER_BODY: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct KernelArgs {
    name: &'static str,
    role: KernelRole,
    args: Vec<KernelArg>,
}

impl KernelArgs {
    /// `gravPos, pos, [vel], numGrav, epsSqr, acc, [local]`; velocity only
    /// for the relativistic models, local scratch only for the local one.
    pub fn acceleration(model: AccelerationModel, num_grav: usize, eps_sqr: f64, group_size: u32) -> Self {
        let mut args = vec![KernelArg::Buffer(BufferRole::GravPos), KernelArg::Buffer(BufferRole::CurrPos)];
        if model.uses_velocity() {
            args.push(KernelArg::Buffer(BufferRole::CurrVel));
        }
        args.push(KernelArg::Int(num_grav as i32));
        args.push(KernelArg::Double(eps_sqr));
        args.push(KernelArg::Buffer(BufferRole::Acc));
        if model.uses_local_memory() {
            args.push(KernelArg::Local(group_size as u64 * std::mem::size_of::<Double4>() as u64));
        }

        Self {
            name: model.kernel_name(),
            role: KernelRole::Acceleration,
            args,
        }
    }

    pub fn bootstrap(del_t: f64, num_particles: usize) -> Self {
        Self::integrator(BOOTSTRAP_KERNEL, KernelRole::Bootstrap, del_t, num_particles)
    }

    pub fn predictor(order: IntegratorOrder, del_t: f64, num_particles: usize) -> Self {
        Self::integrator(order.predictor_kernel(), KernelRole::Predictor, del_t, num_particles)
    }

    pub fn corrector(order: IntegratorOrder, del_t: f64, num_particles: usize) -> Self {
        Self::integrator(order.corrector_kernel(), KernelRole::Corrector, del_t, num_particles)
    }

    fn integrator(name: &'static str, role: KernelRole, del_t: f64, num_particles: usize) -> Self {
        let args = vec![
            KernelArg::Buffer(BufferRole::CurrPos),
            KernelArg::Buffer(BufferRole::CurrVel),
            KernelArg::Buffer(BufferRole::Acc),
            KernelArg::Double(del_t),
            KernelArg::Buffer(BufferRole::NewPos),
            KernelArg::Buffer(BufferRole::NewVel),
            KernelArg::Int(0),
            KernelArg::Int(0),
            KernelArg::Int(num_particles as i32),
            KernelArg::Buffer(BufferRole::PosLast),
            KernelArg::Buffer(BufferRole::VelLast),
            KernelArg::Buffer(BufferRole::VelHistory),
            KernelArg::Buffer(BufferRole::AccHistory),
        ];
        Self { name, role, args }
    }

    pub fn display(center_body: usize) -> Self {
        Self {
            name: DISPLAY_KERNEL,
            role: KernelRole::Display,
            args: vec![
                KernelArg::Buffer(BufferRole::GravPos),
                KernelArg::Buffer(BufferRole::CurrPos),
                KernelArg::Buffer(BufferRole::Display),
                KernelArg::Int(center_body as i32),
            ],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn role(&self) -> KernelRole {
        self.role
    }

    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn buffers(&self) -> impl Iterator<Item = BufferRole> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            KernelArg::Buffer(role) => Some(*role),
            _ => None,
        })
    }

    pub fn local_memory(&self) -> u64 {
        self.args
            .iter()
            .map(|arg| match arg {
                KernelArg::Local(bytes) => *bytes,
                _ => 0,
            })
            .sum()
    }

    /// Work-group tile entries the local-memory argument reserves.
    pub fn local_tile_len(&self) -> usize {
        (self.local_memory() / std::mem::size_of::<Double4>() as u64) as usize
    }

    pub fn set_int(&mut self, index: usize, value: i32) -> Result<()> {
        match self.args.get_mut(index) {
            Some(KernelArg::Int(slot)) => {
                *slot = value;
                Ok(())
            }
            _ => Err(SimError::InvalidConfig(format!(
                "argument {} of {} is not an integer",
                index, self.name
            ))),
        }
    }

    pub fn set_double(&mut self, index: usize, value: f64) -> Result<()> {
        match self.args.get_mut(index) {
            Some(KernelArg::Double(slot)) => {
                *slot = value;
                Ok(())
            }
            _ => Err(SimError::InvalidConfig(format!(
                "argument {} of {} is not a double",
                index, self.name
            ))),
        }
    }

    /// Scalar block bytes: argument order, natural alignment, total rounded
    /// up to 16.
    pub fn pack_scalars(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for arg in &self.args {
            match arg {
                KernelArg::Int(value) => {
                    align_to(&mut bytes, 4);
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
                KernelArg::Double(value) => {
                    align_to(&mut bytes, 8);
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
                _ => {}
            }
        }
        align_to(&mut bytes, 16);
        if bytes.is_empty() {
            bytes.resize(16, 0);
        }
        bytes
    }
}

fn align_to(bytes: &mut Vec<u8>, alignment: usize) {
    let padded = (bytes.len() + alignment - 1) / alignment * alignment;
    bytes.resize(padded, 0);
}
