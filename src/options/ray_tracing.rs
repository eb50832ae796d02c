use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// When the top-level acceleration structure is rebuilt.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TlasRebuildPolicy {
    /// Rebuild once per frame.
    #[default]
    EveryFrame,
    /// Rebuild only when transforms or instance membership changed.
    OnChange,
}

/// Ray tracing pass construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[schemars(title = "Ray Tracing", inline)]
#[serde(default)]
pub struct RayTracingOptions {
    /// Texture-array length of the binding table. A scene with more
    /// sub-meshes is rejected.
    #[schemars(skip)]
    pub max_meshes: u32,
    /// Maximum trace recursion depth.
    #[schemars(title = "Max Bounces", range(min = 1, max = 31))]
    pub max_recursion_depth: u32,
    /// TLAS rebuild policy.
    #[schemars(title = "TLAS Rebuild")]
    pub tlas_rebuild: TlasRebuildPolicy,
    /// Fixed seed for the per-dispatch random seeds (entropy when unset).
    #[schemars(skip)]
    pub seed: Option<u64>,
}

impl Default for RayTracingOptions {
    fn default() -> Self {
        Self {
            max_meshes: 256,
            max_recursion_depth: 4,
            tlas_rebuild: TlasRebuildPolicy::EveryFrame,
            seed: None,
        }
    }
}
