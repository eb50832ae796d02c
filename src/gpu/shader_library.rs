use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::types::{ShaderModule, ShaderStage};
use crate::error::PrismError;

/// Pass name of the G-buffer raster programs.
pub const GEOMETRY_PASS: &str = "geometry";
/// Pass name of the full-screen composite programs.
pub const LIGHTING_PASS: &str = "lighting";
/// Pass name of the ray tracing programs.
pub const RAYTRACE_PASS: &str = "raytrace";

/// Every (pass, stage) pair the frame pipeline loads.
pub const PIPELINE_PROGRAMS: [(&str, ShaderStage); 7] = [
    (GEOMETRY_PASS, ShaderStage::Vertex),
    (GEOMETRY_PASS, ShaderStage::Fragment),
    (LIGHTING_PASS, ShaderStage::Vertex),
    (LIGHTING_PASS, ShaderStage::Fragment),
    (RAYTRACE_PASS, ShaderStage::RayGeneration),
    (RAYTRACE_PASS, ShaderStage::Miss),
    (RAYTRACE_PASS, ShaderStage::ClosestHit),
];

/// Registry of pass programs loaded from one directory.
///
/// Programs live at `<directory>/<pass>.<stage>.wgsl` (stage infixes:
/// `vert`, `frag`, `rgen`, `rmiss`, `rchit`). Each file is read once and
/// shared by every pipeline built from it.
#[derive(Debug)]
pub struct ShaderLibrary {
    directory: PathBuf,
    modules: FxHashMap<(&'static str, ShaderStage), ShaderModule>,
}

impl ShaderLibrary {
    /// Empty library reading from `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            modules: FxHashMap::default(),
        }
    }

    /// Library with every program of [`PIPELINE_PROGRAMS`] loaded.
    ///
    /// # Errors
    ///
    /// [`PrismError::ShaderLoad`] for the first file that fails to read.
    pub fn load_pipeline_programs(
        directory: impl Into<PathBuf>,
    ) -> Result<Self, PrismError> {
        let mut library = Self::new(directory);
        for (pass, stage) in PIPELINE_PROGRAMS {
            let _ = library.load(pass, stage)?;
        }
        log::info!(
            "loaded {} shader programs from {}",
            library.modules.len(),
            library.directory.display()
        );
        Ok(library)
    }

    /// Directory programs are read from.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path a program is expected at.
    #[must_use]
    pub fn program_path(&self, pass: &str, stage: ShaderStage) -> PathBuf {
        self.directory
            .join(format!("{pass}.{}.wgsl", stage.file_infix()))
    }

    /// Load (or return the cached) program for `pass`/`stage`.
    ///
    /// # Errors
    ///
    /// [`PrismError::ShaderLoad`] if the file cannot be read.
    pub fn load(
        &mut self,
        pass: &'static str,
        stage: ShaderStage,
    ) -> Result<&ShaderModule, PrismError> {
        if !self.modules.contains_key(&(pass, stage)) {
            let path = self.program_path(pass, stage);
            let code = std::fs::read(&path)
                .map_err(|source| PrismError::ShaderLoad { path, source })?;
            let _ = self.modules.insert(
                (pass, stage),
                ShaderModule {
                    pass,
                    stage,
                    code: Arc::from(code),
                },
            );
        }
        self.get(pass, stage)
    }

    /// A previously loaded program.
    ///
    /// # Errors
    ///
    /// [`PrismError::MissingShader`] if it was never loaded.
    pub fn get(
        &self,
        pass: &str,
        stage: ShaderStage,
    ) -> Result<&ShaderModule, PrismError> {
        self.modules
            .iter()
            .find(|((p, s), _)| *p == pass && *s == stage)
            .map(|(_, module)| module)
            .ok_or_else(|| {
                PrismError::MissingShader(format!(
                    "{pass}.{}",
                    stage.file_infix()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_every_bundled_program() {
        let library = ShaderLibrary::load_pipeline_programs(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/shaders"
        ))
        .unwrap();
        for (pass, stage) in PIPELINE_PROGRAMS {
            let module = library.get(pass, stage).unwrap();
            assert!(!module.code.is_empty());
            assert_eq!(module.stage, stage);
        }
    }

    #[test]
    fn missing_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("geometry.vert.wgsl"), "// vs").unwrap();
        let mut library = ShaderLibrary::new(dir.path());
        assert!(library.load(GEOMETRY_PASS, ShaderStage::Vertex).is_ok());
        match library.load(GEOMETRY_PASS, ShaderStage::Fragment) {
            Err(PrismError::ShaderLoad { path, .. }) => {
                assert!(path.ends_with("geometry.frag.wgsl"));
            }
            other => panic!("expected ShaderLoad, got {other:?}"),
        }
    }

    #[test]
    fn unloaded_program_is_missing() {
        let library = ShaderLibrary::new("does-not-matter");
        assert!(matches!(
            library.get(RAYTRACE_PASS, ShaderStage::Miss),
            Err(PrismError::MissingShader(name)) if name == "raytrace.rmiss"
        ));
    }

    #[test]
    fn modules_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lighting.frag.wgsl");
        std::fs::write(&path, "first").unwrap();
        let mut library = ShaderLibrary::new(dir.path());
        let first = library
            .load(LIGHTING_PASS, ShaderStage::Fragment)
            .unwrap()
            .code
            .clone();
        std::fs::write(&path, "second").unwrap();
        let again = library.load(LIGHTING_PASS, ShaderStage::Fragment).unwrap();
        assert_eq!(again.code, first);
    }
}
