//! Device selection retry ladder.
//!
//! Selection walks platforms in enumeration order and stops at the first
//! device accepted by the current pass. Passes, in order:
//!
//! 1. remembered vendor id (any class, no capability check, no platform hint)
//! 2. requested class with capability check
//! 3. the other class with capability check
//! 4. every class with capability check
//!
//! The platform-name hint only filters platforms when no vendor id is given.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::capabilities::{DeviceClass, DeviceDescriptor};
use crate::error::{Result, SimError};

/// Platform vendor strings the desktop application offered as hints.
pub const KNOWN_PLATFORM_HINTS: [&str; 3] = [
    "Advanced Micro Devices, Inc.",
    "NVIDIA Corporation",
    "Intel(R) Corporation",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PlatformDescriptor {
    pub name: String,
    pub devices: Vec<DeviceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRequest {
    pub vendor_id: Option<u32>,
    pub platform_hint: Option<String>,
    pub class: DeviceClass,
}

impl Default for SelectionRequest {
    fn default() -> Self {
        Self {
            vendor_id: None,
            platform_hint: None,
            class: DeviceClass::Gpu,
        }
    }
}

impl SelectionRequest {
    pub fn with_vendor_id(mut self, vendor_id: Option<u32>) -> Self {
        self.vendor_id = vendor_id;
        self
    }

    pub fn with_platform_hint(mut self, hint: Option<String>) -> Self {
        self.platform_hint = hint;
        self
    }

    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.class = class;
        self
    }
}

/// Which rung of the ladder produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPass {
    RememberedVendor,
    PreferredClass,
    OtherClass,
    AnyClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub platform: usize,
    pub device: usize,
    pub vendor_id: u32,
    pub pass: SelectionPass,
}

/// Run the retry ladder over enumerated platforms.
pub fn select_device(platforms: &[PlatformDescriptor], request: &SelectionRequest) -> Result<Selection> {
    if platforms.is_empty() {
        return Err(SimError::DeviceNotFound("no compute platforms available".to_string()));
    }

    if let Some(vendor_id) = request.vendor_id {
        debug!("looking for vendor id 0x{:X}", vendor_id);
        if let Some(selection) = scan(platforms, DeviceClass::Any, None, SelectionPass::RememberedVendor, |d| {
            d.vendor_id == vendor_id
        }) {
            return Ok(selection);
        }
        warn!("remembered vendor id 0x{:X} not present, scanning devices", vendor_id);
    }

    let hint = request.platform_hint.as_deref();
    for (class, pass) in ladder(request.class) {
        match scan(platforms, class, hint, pass, DeviceDescriptor::is_suitable) {
            Some(selection) => {
                if pass != SelectionPass::PreferredClass {
                    warn!("no suitable {:?} device, fell back via {:?}", request.class, pass);
                }
                return Ok(selection);
            }
            None => debug!("no suitable device for class {:?}", class),
        }
    }

    Err(SimError::DeviceNotFound(format!(
        "no device with double precision and buffer sharing (class {:?}, platform hint {:?})",
        request.class, request.platform_hint
    )))
}

fn ladder(class: DeviceClass) -> Vec<(DeviceClass, SelectionPass)> {
    match class {
        DeviceClass::Any => vec![(DeviceClass::Any, SelectionPass::AnyClass)],
        DeviceClass::Cpu => vec![
            (DeviceClass::Cpu, SelectionPass::PreferredClass),
            (DeviceClass::Gpu, SelectionPass::OtherClass),
            (DeviceClass::Any, SelectionPass::AnyClass),
        ],
        DeviceClass::Gpu => vec![
            (DeviceClass::Gpu, SelectionPass::PreferredClass),
            (DeviceClass::Cpu, SelectionPass::OtherClass),
            (DeviceClass::Any, SelectionPass::AnyClass),
        ],
    }
}

fn scan(
    platforms: &[PlatformDescriptor],
    class: DeviceClass,
    hint: Option<&str>,
    pass: SelectionPass,
    accept: impl Fn(&DeviceDescriptor) -> bool,
) -> Option<Selection> {
    for (platform_index, platform) in platforms.iter().enumerate() {
        if let Some(hint) = hint {
            if platform.name != hint {
                continue;
            }
        }

        let found = platform
            .devices
            .iter()
            .enumerate()
            .filter(|(_, device)| class.matches(device.kind))
            .find(|(_, device)| accept(device));

        if let Some((device_index, device)) = found {
            info!(
                "selected '{}' on platform '{}' (vendor 0x{:X})",
                device.name, platform.name, device.vendor_id
            );
            return Some(Selection {
                platform: platform_index,
                device: device_index,
                vendor_id: device.vendor_id,
                pass,
            });
        }
    }
    None
}

/// Persists the last resolved vendor id so the next session can take the
/// vendor fast path.
#[derive(Debug, Clone)]
pub struct VendorIdCache {
    path: PathBuf,
}

impl VendorIdCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The remembered id, or `None` when the file is missing or unreadable.
    pub fn load(&self) -> Option<u32> {
        let text = fs::read_to_string(&self.path).ok()?;
        let text = text.trim();
        let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
        match u32::from_str_radix(digits, 16) {
            Ok(0) => None,
            Ok(id) => Some(id),
            Err(_) => {
                warn!("ignoring malformed vendor id cache {:?}", self.path);
                None
            }
        }
    }

    pub fn store(&self, vendor_id: u32) -> Result<()> {
        fs::write(&self.path, format!("0x{:X}\n", vendor_id))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::capabilities::{DeviceKind, DeviceLimits, ExtensionSet};

    fn device(name: &str, vendor_id: u32, kind: DeviceKind, extensions: &str) -> DeviceDescriptor {
        let extensions = ExtensionSet::from_extension_string(extensions);
        DeviceDescriptor {
            name: name.to_string(),
            vendor_id,
            kind,
            preferred_double_width: u32::from(extensions.fp64_khr),
            extensions,
            limits: DeviceLimits::host(),
        }
    }

    fn platform(name: &str, devices: Vec<DeviceDescriptor>) -> PlatformDescriptor {
        PlatformDescriptor {
            name: name.to_string(),
            devices,
        }
    }

    #[test]
    fn test_preferred_class_wins() {
        let platforms = vec![platform(
            "Vulkan",
            vec![
                device("cpu", 0x1, DeviceKind::Cpu, "khr_fp64 khr_buffer_sharing"),
                device("gpu", 0x2, DeviceKind::Gpu, "khr_fp64 khr_buffer_sharing"),
            ],
        )];
        let selection = select_device(&platforms, &SelectionRequest::default()).unwrap();
        assert_eq!(selection.device, 1);
        assert_eq!(selection.vendor_id, 0x2);
        assert_eq!(selection.pass, SelectionPass::PreferredClass);
    }

    #[test]
    fn test_vendor_fast_path_skips_capability_check() {
        let platforms = vec![platform("Vulkan", vec![device("old", 0x1002, DeviceKind::Other, "")])];
        let request = SelectionRequest::default().with_vendor_id(Some(0x1002));
        let selection = select_device(&platforms, &request).unwrap();
        assert_eq!(selection.pass, SelectionPass::RememberedVendor);
        assert_eq!(selection.vendor_id, 0x1002);
    }

    #[test]
    fn test_stale_vendor_falls_back_to_ladder() {
        let platforms = vec![platform(
            "Vulkan",
            vec![device("gpu", 0x10de, DeviceKind::Gpu, "khr_fp64 khr_buffer_sharing")],
        )];
        let request = SelectionRequest::default().with_vendor_id(Some(0x8086));
        let selection = select_device(&platforms, &request).unwrap();
        assert_eq!(selection.pass, SelectionPass::PreferredClass);
        assert_eq!(selection.vendor_id, 0x10de);
    }

    #[test]
    fn test_platform_hint_filters() {
        let platforms = vec![
            platform("A", vec![device("a", 0x1, DeviceKind::Gpu, "khr_fp64 khr_buffer_sharing")]),
            platform("B", vec![device("b", 0x2, DeviceKind::Gpu, "khr_fp64 khr_buffer_sharing")]),
        ];
        let request = SelectionRequest::default().with_platform_hint(Some("B".to_string()));
        let selection = select_device(&platforms, &request).unwrap();
        assert_eq!(selection.platform, 1);

        let request = SelectionRequest::default().with_platform_hint(Some("C".to_string()));
        assert!(matches!(select_device(&platforms, &request), Err(SimError::DeviceNotFound(_))));
    }

    #[test]
    fn test_any_class_catches_other_devices() {
        let platforms = vec![platform(
            "GL",
            vec![device("sw", 0x5, DeviceKind::Other, "khr_fp64 vendor_buffer_sharing")],
        )];
        let selection = select_device(&platforms, &SelectionRequest::default()).unwrap();
        assert_eq!(selection.pass, SelectionPass::AnyClass);
    }

    #[test]
    fn test_empty_and_incapable() {
        assert!(matches!(
            select_device(&[], &SelectionRequest::default()),
            Err(SimError::DeviceNotFound(_))
        ));
        let platforms = vec![platform("Vulkan", vec![device("f32 only", 0x1, DeviceKind::Gpu, "khr_buffer_sharing")])];
        assert!(matches!(
            select_device(&platforms, &SelectionRequest::default()),
            Err(SimError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_vendor_id_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VendorIdCache::new(dir.path().join("last_device"));
        assert_eq!(cache.load(), None);

        cache.store(0x10DE).unwrap();
        assert_eq!(cache.load(), Some(0x10DE));

        cache.clear().unwrap();
        assert_eq!(cache.load(), None);
        cache.clear().unwrap();
    }

    #[test]
    fn test_vendor_id_cache_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_device");
        std::fs::write(&path, "not a number").unwrap();
        assert_eq!(VendorIdCache::new(&path).load(), None);
    }
}
