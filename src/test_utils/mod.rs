pub mod harness;
pub mod math;
pub mod scene;

pub use harness::TestHarness;
pub use math::StateComparison;
pub use scene::{OrbitConfig, SceneBuilder};
