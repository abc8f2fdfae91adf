//! Device capability model.
//!
//! A [`DeviceDescriptor`] is a plain snapshot of what an adapter offers:
//! class, vendor, extension flags and numeric limits. Selection and
//! kernel-source assembly work on descriptors only, so they can be exercised
//! without a device.

use std::str::FromStr;

use crate::body::Double4;
use crate::error::SimError;

pub const EXT_FP64_KHR: &str = "khr_fp64";
pub const EXT_FP64_VENDOR: &str = "vendor_fp64";
pub const EXT_SHARING_KHR: &str = "khr_buffer_sharing";
pub const EXT_SHARING_VENDOR: &str = "vendor_buffer_sharing";

/// Requested device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Any,
    Cpu,
    Gpu,
}

/// Class a device actually reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Other,
}

impl DeviceClass {
    pub fn matches(&self, kind: DeviceKind) -> bool {
        match self {
            DeviceClass::Any => true,
            DeviceClass::Cpu => kind == DeviceKind::Cpu,
            DeviceClass::Gpu => kind == DeviceKind::Gpu,
        }
    }
}

impl FromStr for DeviceClass {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, SimError> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(DeviceClass::Any),
            "cpu" => Ok(DeviceClass::Cpu),
            "gpu" => Ok(DeviceClass::Gpu),
            _ => Err(SimError::InvalidConfig(format!("unknown device class '{}'", s))),
        }
    }
}

impl From<wgpu::DeviceType> for DeviceKind {
    fn from(device_type: wgpu::DeviceType) -> Self {
        match device_type {
            wgpu::DeviceType::Cpu => DeviceKind::Cpu,
            wgpu::DeviceType::DiscreteGpu
            | wgpu::DeviceType::IntegratedGpu
            | wgpu::DeviceType::VirtualGpu => DeviceKind::Gpu,
            wgpu::DeviceType::Other => DeviceKind::Other,
        }
    }
}

/// Double-precision and buffer-sharing support.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionSet {
    pub fp64_khr: bool,
    pub fp64_vendor: bool,
    pub sharing_khr: bool,
    pub sharing_vendor: bool,
}

impl ExtensionSet {
    /// Parse a space-separated extension string.
    pub fn from_extension_string(extensions: &str) -> Self {
        let mut set = Self::default();
        for name in extensions.split_whitespace() {
            match name {
                EXT_FP64_KHR => set.fp64_khr = true,
                EXT_FP64_VENDOR => set.fp64_vendor = true,
                EXT_SHARING_KHR => set.sharing_khr = true,
                EXT_SHARING_VENDOR => set.sharing_vendor = true,
                _ => {}
            }
        }
        set
    }

    pub fn extension_string(&self) -> String {
        let names = [
            (self.fp64_khr, EXT_FP64_KHR),
            (self.fp64_vendor, EXT_FP64_VENDOR),
            (self.sharing_khr, EXT_SHARING_KHR),
            (self.sharing_vendor, EXT_SHARING_VENDOR),
        ];
        names
            .iter()
            .filter(|(present, _)| *present)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn has_fp64(&self) -> bool {
        self.fp64_khr || self.fp64_vendor
    }

    pub fn has_sharing(&self) -> bool {
        self.sharing_khr || self.sharing_vendor
    }

    /// Map an adapter's features onto extension flags.
    ///
    /// DX12 compiles doubles through its own shader compiler, which is
    /// treated as the vendor path. Buffer sharing is the GL path when the
    /// backend is GL and the portable path everywhere else.
    pub fn from_adapter(
        backend: wgpu::Backend,
        features: wgpu::Features,
        downlevel: wgpu::DownlevelFlags,
    ) -> Self {
        let fp64 = features.contains(wgpu::Features::SHADER_F64);
        let compute = downlevel.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
        let is_gl = backend == wgpu::Backend::Gl;
        let is_dx12 = backend == wgpu::Backend::Dx12;

        Self {
            fp64_khr: fp64 && !is_dx12,
            fp64_vendor: fp64 && is_dx12,
            sharing_khr: compute && !is_gl,
            sharing_vendor: compute && is_gl,
        }
    }
}

/// Numeric limits consumed by the buffer manager and kernel binder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_work_group_size: u32,
    pub max_work_item_sizes: [u32; 3],
    pub local_memory_size: u32,
    pub constant_buffer_size: u32,
    pub max_buffer_size: u64,
}

impl DeviceLimits {
    pub fn from_wgpu(limits: &wgpu::Limits) -> Self {
        Self {
            max_work_group_size: limits.max_compute_invocations_per_workgroup,
            max_work_item_sizes: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            local_memory_size: limits.max_compute_workgroup_storage_size,
            constant_buffer_size: limits.max_uniform_buffer_binding_size,
            max_buffer_size: limits.max_buffer_size,
        }
    }

    /// Limits of the host reference model: one work item per group, no
    /// meaningful constant-memory cap.
    pub fn host() -> Self {
        Self {
            max_work_group_size: 1,
            max_work_item_sizes: [1, 1, 1],
            local_memory_size: u32::MAX,
            constant_buffer_size: u32::MAX,
            max_buffer_size: u64::MAX,
        }
    }

    /// Largest dispatch group the device accepts in one dimension.
    pub fn max_group_size_1d(&self) -> u32 {
        self.max_work_group_size.min(self.max_work_item_sizes[0])
    }

    /// How many gravitating positions fit in one constant buffer.
    pub fn max_gravitating(&self) -> usize {
        self.constant_buffer_size as usize / std::mem::size_of::<Double4>()
    }
}

/// Everything the selector and compiler need to know about one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub vendor_id: u32,
    pub kind: DeviceKind,
    pub extensions: ExtensionSet,
    /// Preferred vector width for doubles; zero means no native doubles.
    pub preferred_double_width: u32,
    pub limits: DeviceLimits,
}

impl DeviceDescriptor {
    pub fn from_adapter(adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        let downlevel = adapter.get_downlevel_capabilities();
        let extensions = ExtensionSet::from_adapter(info.backend, adapter.features(), downlevel.flags);

        Self {
            name: info.name,
            vendor_id: info.vendor,
            kind: DeviceKind::from(info.device_type),
            preferred_double_width: u32::from(extensions.has_fp64()),
            extensions,
            limits: DeviceLimits::from_wgpu(&adapter.limits()),
        }
    }

    /// Usable for the simulation: native doubles (or the vendor double
    /// path) and at least one buffer-sharing variant.
    pub fn is_suitable(&self) -> bool {
        (self.preferred_double_width > 0 || self.extensions.fp64_vendor) && self.extensions.has_sharing()
    }
}

/// Readable platform name for a wgpu backend.
pub fn platform_name(backend: wgpu::Backend) -> &'static str {
    match backend {
        wgpu::Backend::Vulkan => "Vulkan",
        wgpu::Backend::Metal => "Metal",
        wgpu::Backend::Dx12 => "DirectX 12",
        wgpu::Backend::Gl => "OpenGL",
        wgpu::Backend::BrowserWebGpu => "WebGPU",
        _ => "Unknown",
    }
}
