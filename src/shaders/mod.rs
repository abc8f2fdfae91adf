use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{Result, SimError};
use crate::gpu::capabilities::ExtensionSet;

/// Kernel source shipped with the crate.
pub const BUNDLED_KERNELS: &str = include_str!("nbody.wgsl");

/// Capability preamble entries, emitted in the order chosen by
/// [`select_pragmas`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pragma {
    SharingKhr,
    SharingVendor,
    Fp64Khr,
    Fp64Vendor,
}

impl Pragma {
    pub fn directive(&self) -> &'static str {
        match self {
            Pragma::SharingKhr => "const DISPLAY_SHARING_KHR: bool = true;",
            Pragma::SharingVendor => "const DISPLAY_SHARING_VENDOR: bool = true;",
            Pragma::Fp64Khr => "// fp64: khr\nalias real = f64;\nalias real4 = vec4<f64>;",
            Pragma::Fp64Vendor => "// fp64: vendor\nalias real = f64;\nalias real4 = vec4<f64>;",
        }
    }
}

/// Sharing first (the portable variant only when the vendor double path is
/// not in play, since that path pairs with vendor sharing), then double
/// precision with the portable variant preferred.
pub fn select_pragmas(extensions: &ExtensionSet) -> Vec<Pragma> {
    let mut pragmas = Vec::new();

    if extensions.sharing_khr && !extensions.fp64_vendor {
        pragmas.push(Pragma::SharingKhr);
    }
    if extensions.sharing_vendor {
        pragmas.push(Pragma::SharingVendor);
    }

    if extensions.fp64_khr {
        pragmas.push(Pragma::Fp64Khr);
    } else if extensions.fp64_vendor {
        pragmas.push(Pragma::Fp64Vendor);
    }

    pragmas
}

/// Assembles the program text handed to the compiler: capability preamble,
/// gravitating capacity and work-group tile length, then the kernel file.
pub struct ShaderBuilder {
    kernel_source: String,
    pragmas: Vec<Pragma>,
    grav_capacity: usize,
    local_tile: usize,
}

impl ShaderBuilder {
    pub fn bundled() -> Self {
        Self {
            kernel_source: BUNDLED_KERNELS.to_string(),
            pragmas: Vec::new(),
            grav_capacity: 1,
            local_tile: 1,
        }
    }

    /// Read an external kernel file once.
    pub fn from_file(path: &Path) -> Result<Self> {
        let kernel_source = fs::read_to_string(path).map_err(|e| {
            SimError::Compilation {
                log: format!("cannot read kernel source {}: {}", path.display(), e),
            }
        })?;
        info!("loaded kernel source {}", path.display());
        Ok(Self {
            kernel_source,
            ..Self::bundled()
        })
    }

    pub fn from_config(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::bundled()),
        }
    }

    pub fn with_extensions(mut self, extensions: &ExtensionSet) -> Self {
        self.pragmas = select_pragmas(extensions);
        self
    }

    pub fn with_grav_capacity(mut self, grav_capacity: usize) -> Self {
        self.grav_capacity = grav_capacity.max(1);
        self
    }

    /// Entries of the work-group tile, as reserved by the local-memory
    /// argument of the acceleration kernel.
    pub fn with_local_tile(mut self, entries: usize) -> Self {
        self.local_tile = entries.max(1);
        self
    }

    pub fn pragmas(&self) -> &[Pragma] {
        &self.pragmas
    }

    pub fn kernel_source(&self) -> &str {
        &self.kernel_source
    }

    pub fn build(&self) -> String {
        let mut source = String::new();
        for pragma in &self.pragmas {
            source.push_str(pragma.directive());
            source.push('\n');
        }
        source.push_str(&format!("const GRAV_CAPACITY: u32 = {}u;\n", self.grav_capacity));
        source.push_str(&format!("const LOCAL_TILE: u32 = {}u;\n\n", self.local_tile));
        source.push_str(&self.kernel_source);
        debug!("assembled program with pragmas {:?}", self.pragmas);
        source
    }

    /// True if the kernel file defines an entry point called `name`.
    pub fn defines_kernel(&self, name: &str) -> bool {
        let needle = format!("fn {}(", name);
        self.kernel_source.contains(&needle)
    }
}

impl Default for ShaderBuilder {
    fn default() -> Self {
        Self::bundled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extensions(names: &str) -> ExtensionSet {
        ExtensionSet::from_extension_string(names)
    }

    #[test]
    fn test_khr_everything() {
        let pragmas = select_pragmas(&extensions("khr_fp64 khr_buffer_sharing"));
        assert_eq!(pragmas, vec![Pragma::SharingKhr, Pragma::Fp64Khr]);
    }

    #[test]
    fn test_vendor_fp64_suppresses_khr_sharing() {
        let pragmas = select_pragmas(&extensions("vendor_fp64 khr_buffer_sharing vendor_buffer_sharing"));
        assert_eq!(pragmas, vec![Pragma::SharingVendor, Pragma::Fp64Vendor]);
    }

    #[test]
    fn test_khr_fp64_preferred_over_vendor() {
        let pragmas = select_pragmas(&extensions("khr_fp64 vendor_fp64 vendor_buffer_sharing"));
        assert_eq!(pragmas, vec![Pragma::SharingVendor, Pragma::Fp64Khr]);
    }

    #[test]
    fn test_no_capabilities_no_pragmas() {
        assert!(select_pragmas(&ExtensionSet::default()).is_empty());
    }

    #[test]
    fn test_build_prefixes_preamble() {
        let source = ShaderBuilder::bundled()
            .with_extensions(&extensions("khr_fp64 khr_buffer_sharing"))
            .with_grav_capacity(16)
            .build();
        let sharing = source.find("DISPLAY_SHARING_KHR").unwrap();
        let alias = source.find("alias real = f64;").unwrap();
        let capacity = source.find("const GRAV_CAPACITY: u32 = 16u;").unwrap();
        let body = source.find("override WORKGROUP_SIZE").unwrap();
        assert!(sharing < alias && alias < capacity && capacity < body);
    }

    #[test]
    fn test_tile_length_comes_from_preamble() {
        assert!(!BUNDLED_KERNELS.contains("const LOCAL_TILE"));
        let source = ShaderBuilder::bundled().with_local_tile(48).build();
        assert_eq!(source.matches("const LOCAL_TILE: u32 = 48u;").count(), 1);
        let source = ShaderBuilder::bundled().with_local_tile(0).build();
        assert!(source.contains("const LOCAL_TILE: u32 = 1u;"));
    }

    #[test]
    fn test_bundled_defines_every_kernel() {
        let builder = ShaderBuilder::bundled();
        for name in ["newtonian", "relativistic", "relativisticLocal", "adamsStartup", "copyToDisplay"] {
            assert!(builder.defines_kernel(name), "missing {}", name);
        }
        assert!(!builder.defines_kernel("adamsBashforth5"));
    }

    #[test]
    fn test_missing_file_is_a_build_error() {
        let result = ShaderBuilder::from_file(Path::new("/nonexistent/kernels.wgsl"));
        assert!(matches!(result, Err(SimError::Compilation { .. })));
    }
}
