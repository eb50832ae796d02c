use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where pass programs are loaded from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShaderOptions {
    /// Directory holding `<pass>.<stage>.wgsl` files. Relative paths
    /// resolve against the working directory.
    pub directory: PathBuf,
}

impl Default for ShaderOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("shaders"),
        }
    }
}
