pub mod capabilities;
pub mod selector;

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info};
use pollster::block_on;
use wgpu::{Adapter, Device, Instance, Queue};

use crate::error::{DeviceErrorKind, Result, SimError};
use crate::physics::AllocationTracker;
use self::capabilities::{platform_name, DeviceDescriptor, DeviceLimits, ExtensionSet};
use self::selector::{select_device, PlatformDescriptor, Selection, SelectionRequest};

/// Reason the device reported itself lost, once it has.
#[derive(Clone, Debug, Default)]
pub struct DeviceLoss {
    reason: Arc<Mutex<Option<String>>>,
}

impl DeviceLoss {
    /// Keep the first reported reason.
    pub fn record(&self, reason: String) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(reason);
    }

    pub fn is_lost(&self) -> bool {
        self.reason.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Fail `operation` if the device is gone.
    pub fn check(&self, operation: &str) -> Result<()> {
        match self.reason.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(reason) => {
                error!("{} on a lost device: {}", operation, reason);
                Err(SimError::Dispatch {
                    operation: operation.to_string(),
                    kind: DeviceErrorKind::DeviceLost,
                    detail: reason.clone(),
                })
            }
            None => Ok(()),
        }
    }
}

/// A compute context bound to exactly one device.
///
/// The binding is immutable once created; a capability change means dropping
/// it and selecting again.
pub struct DeviceBinding {
    device: Device,
    queue: Queue,
    adapter: Adapter,
    instance: Instance,
    descriptor: DeviceDescriptor,
    platform_name: String,
    selection: Selection,
    tracker: AllocationTracker,
    loss: DeviceLoss,
}

impl DeviceBinding {
    pub async fn new(request: &SelectionRequest) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let (platforms, mut adapters) = enumerate(&instance);
        for platform in &platforms {
            debug!("platform '{}' has {} devices", platform.name, platform.devices.len());
        }

        let selection = select_device(&platforms, request)?;
        let descriptor = platforms[selection.platform].devices[selection.device].clone();
        let platform_name = platforms[selection.platform].name.clone();
        let adapter = adapters[selection.platform].swap_remove(selection.device);
        drop(adapters);

        let required_features = adapter.features() & wgpu::Features::SHADER_F64;
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("N-Body Compute Device"),
                    required_features,
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| {
                error!("context creation refused by '{}': {}", descriptor.name, e);
                SimError::DeviceNotFound(format!("'{}' refused context creation: {}", descriptor.name, e))
            })?;

        let loss = DeviceLoss::default();
        let on_lost = loss.clone();
        device.set_device_lost_callback(move |reason, message| {
            debug!("device lost callback: {:?} {}", reason, message);
            on_lost.record(format!("{:?}: {}", reason, message));
        });

        info!(
            "bound '{}' on '{}' [{}]",
            descriptor.name,
            platform_name,
            descriptor.extensions.extension_string()
        );

        Ok(Self {
            device,
            queue,
            adapter,
            instance,
            descriptor,
            platform_name,
            selection,
            tracker: AllocationTracker::new(),
            loss,
        })
    }

    pub fn new_blocking(request: &SelectionRequest) -> Result<Self> {
        block_on(Self::new(request))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn device_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    /// Vendor id to hand back as the fast-path hint next time.
    pub fn vendor_id(&self) -> u32 {
        self.selection.vendor_id
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn extensions(&self) -> &ExtensionSet {
        &self.descriptor.extensions
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.descriptor.limits
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    pub fn loss(&self) -> &DeviceLoss {
        &self.loss
    }

    /// Run `f` inside validation and out-of-memory error scopes and report
    /// the first captured error.
    pub fn capture<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = block_on(self.device.pop_error_scope());
        let out_of_memory = block_on(self.device.pop_error_scope());
        (value, validation.or(out_of_memory))
    }

    /// Block until every submitted command has finished.
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }
}

/// Group adapters by backend. Each backend is one platform; platform and
/// adapter vectors share indices.
fn enumerate(instance: &Instance) -> (Vec<PlatformDescriptor>, Vec<Vec<Adapter>>) {
    let mut platforms: Vec<PlatformDescriptor> = Vec::new();
    let mut adapters: Vec<Vec<Adapter>> = Vec::new();
    let mut backends: Vec<wgpu::Backend> = Vec::new();

    for adapter in instance.enumerate_adapters(wgpu::Backends::all()) {
        let backend = adapter.get_info().backend;
        let index = match backends.iter().position(|b| *b == backend) {
            Some(index) => index,
            None => {
                backends.push(backend);
                platforms.push(PlatformDescriptor {
                    name: platform_name(backend).to_string(),
                    devices: Vec::new(),
                });
                adapters.push(Vec::new());
                backends.len() - 1
            }
        };
        platforms[index].devices.push(DeviceDescriptor::from_adapter(&adapter));
        adapters[index].push(adapter);
    }

    (platforms, adapters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lost_device_fails_later_operations() {
        let loss = DeviceLoss::default();
        assert!(loss.check("newtonian").is_ok());

        let callback_side = loss.clone();
        callback_side.record("Unknown: driver reset".to_string());
        callback_side.record("Destroyed: second report".to_string());
        assert!(loss.is_lost());

        match loss.check("commit stage") {
            Err(SimError::Dispatch { operation, kind, detail }) => {
                assert_eq!(operation, "commit stage");
                assert_eq!(kind, DeviceErrorKind::DeviceLost);
                assert_eq!(detail, "Unknown: driver reset");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
