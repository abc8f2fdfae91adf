use log::warn;

use crate::error::Result;
use crate::gpu::capabilities::DeviceClass;
use crate::gpu::selector::SelectionRequest;
use crate::gpu::DeviceBinding;

/// Device access for GPU tests. Any capable device will do.
pub struct TestHarness {
    pub binding: DeviceBinding,
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let request = SelectionRequest::default().with_class(DeviceClass::Any);
        let binding = DeviceBinding::new(&request).await?;
        Ok(Self { binding })
    }

    pub fn new_blocking() -> Result<Self> {
        pollster::block_on(Self::new())
    }

    /// `None` when the machine has no device with double precision and
    /// display sharing; callers skip the test.
    pub fn try_new() -> Option<Self> {
        match Self::new_blocking() {
            Ok(harness) => Some(harness),
            Err(e) => {
                warn!("skipping GPU test: {}", e);
                None
            }
        }
    }
}
