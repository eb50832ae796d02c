//! The passes of the hybrid frame pipeline.
//!
//! Per frame: the geometry pass fills the G-buffer, the ray tracing pass
//! refreshes the TLAS and traces into the current output image, the
//! accumulator snapshots it into the previous-frame image and the
//! compositor writes the surface.

pub mod accumulator;
pub mod acceleration;
pub mod binding_table;
pub mod compositor;
pub mod gbuffer;
pub mod raytrace;
pub mod sbt;
pub mod scene_buffers;
pub mod uniforms;

pub use accumulator::FrameAccumulator;
pub use acceleration::TlasBuilder;
pub use binding_table::RtBinding;
pub use compositor::{CompositeSource, Compositor, LightingBinding};
pub use gbuffer::{GBuffer, GeometryPass};
pub use raytrace::{OutputPair, RayTracingPass};
pub use sbt::ShaderBindingTable;
pub use scene_buffers::SceneBuffers;
