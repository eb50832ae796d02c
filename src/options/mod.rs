//! Renderer options with TOML file support.
//!
//! Runtime toggles (`[render]`), ray tracing construction parameters
//! (`[ray_tracing]`) and the shader directory (`[shaders]`) are consolidated
//! here. Every section uses `#[serde(default)]` so a file only needs to list
//! the values it overrides.

mod ray_tracing;
mod render;
mod shaders;

use std::path::Path;

pub use ray_tracing::{RayTracingOptions, TlasRebuildPolicy};
pub use render::RenderOptions;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
pub use shaders::ShaderOptions;

use crate::error::PrismError;

/// Top-level options container.
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema,
)]
#[serde(default)]
pub struct Options {
    /// Per-frame toggles.
    pub render: RenderOptions,
    /// Ray tracing pass parameters.
    pub ray_tracing: RayTracingOptions,
    /// Shader loading.
    #[schemars(skip)]
    pub shaders: ShaderOptions,
}

impl Options {
    /// Generate JSON Schema describing the UI-exposed options.
    #[must_use]
    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(Options)
    }

    /// Load options from a TOML file. Missing fields use defaults.
    ///
    /// # Errors
    ///
    /// [`PrismError::Io`] if the file cannot be read,
    /// [`PrismError::OptionsParse`] if it is not valid options TOML.
    pub fn load(path: &Path) -> Result<Self, PrismError> {
        let content = std::fs::read_to_string(path).map_err(PrismError::Io)?;
        toml::from_str(&content)
            .map_err(|e| PrismError::OptionsParse(e.to_string()))
    }

    /// Save options to a TOML file (pretty-printed).
    ///
    /// # Errors
    ///
    /// [`PrismError::OptionsParse`] on serialization failure,
    /// [`PrismError::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), PrismError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PrismError::OptionsParse(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(PrismError::Io)?;
        }
        std::fs::write(path, content).map_err(PrismError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let opts = Options::default();
        let toml_str = toml::to_string_pretty(&opts).unwrap();
        let parsed: Options = toml::from_str(&toml_str).unwrap();
        assert_eq!(opts, parsed);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r#"
[render]
render_scale = 0.5

[ray_tracing]
tlas_rebuild = "on_change"
"#;
        let opts: Options = toml::from_str(toml_str).unwrap();
        assert_eq!(opts.render.render_scale, 0.5);
        assert_eq!(opts.ray_tracing.tlas_rebuild, TlasRebuildPolicy::OnChange);
        // Everything else should be default
        assert!(opts.render.ray_tracing);
        assert_eq!(opts.ray_tracing.max_meshes, 256);
        assert_eq!(opts.ray_tracing.seed, None);
        assert_eq!(opts.shaders, ShaderOptions::default());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prism.toml");
        let mut opts = Options::default();
        opts.render.ray_tracing = false;
        opts.ray_tracing.seed = Some(42);
        opts.save(&path).unwrap();
        assert_eq!(Options::load(&path).unwrap(), opts);
    }

    #[test]
    fn malformed_file_is_an_options_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[render]\nrender_scale = \"big\"\n").unwrap();
        assert!(matches!(
            Options::load(&path),
            Err(PrismError::OptionsParse(_))
        ));
        assert!(matches!(
            Options::load(&dir.path().join("missing.toml")),
            Err(PrismError::Io(_))
        ));
    }

    #[test]
    fn schema_has_expected_properties() {
        let schema_value =
            serde_json::to_value(Options::json_schema()).unwrap();
        let props = schema_value["properties"].as_object().unwrap();

        assert!(props.contains_key("render"));
        assert!(props.contains_key("ray_tracing"));
        assert!(!props.contains_key("shaders"));

        let rt = &props["ray_tracing"]["properties"];
        assert!(rt.get("max_recursion_depth").is_some());
        assert!(rt.get("max_meshes").is_none());
    }
}
