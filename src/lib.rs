// -- Lint policy ---------------------------------------------------------
// This is the single source of truth for crate-wide lints.

// Broad lint groups
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
// Documentation
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::bare_urls)]
// No panicking in library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
// No debug/print artifacts
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
// Import hygiene
#![deny(clippy::wildcard_imports)]
// Complexity limits (thresholds in clippy.toml)
#![deny(clippy::cognitive_complexity)]
#![deny(clippy::too_many_lines)]
#![deny(clippy::excessive_nesting)]
// Function signature hygiene
#![deny(clippy::too_many_arguments)]
#![deny(clippy::fn_params_excessive_bools)]
// Clone / pass-by-value hygiene
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::implicit_clone)]
// String hygiene
#![deny(clippy::inefficient_to_string)]
#![deny(clippy::redundant_closure_for_method_calls)]
#![deny(clippy::manual_string_new)]
#![deny(clippy::str_to_string)]
// Cargo lints (warn, not deny since cargo lints can be noisy)
#![warn(clippy::cargo)]
// Unused / redundant code
#![deny(unused_results)]
#![deny(unused_qualifications)]
// Cast hygiene
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]

//! Hybrid raster and ray-traced frame pipeline.
//!
//! Prism draws a scene into a G-buffer with a raster pass, traces rays
//! from it against a top-level acceleration structure, blends the result
//! with the previous frame, and composites onto a swapchain image. Two
//! frames are in flight; each owns its fence, semaphore and command list.
//!
//! # Key entry points
//!
//! - [`engine::HybridRenderer`] - owns the device and every pass
//! - [`scene::Scene`] - meshes, materials, models and instances
//! - [`options::Options`] - runtime toggles and ray tracing parameters
//! - [`gpu::HeadlessDevice`] - deterministic software backend for tests
//!
//! # Architecture
//!
//! Passes record into a [`gpu::CommandList`]; a [`gpu::GpuDevice`] backend
//! replays it at submit time. Image layouts are tracked at record time by
//! [`gpu::LayoutTracker`]. A stale surface at acquire or present runs the
//! resize protocol, which rebuilds only the surface-sized state.

pub mod camera;
pub mod engine;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod options;
pub mod renderer;
pub mod scene;
pub mod util;

pub use error::PrismError;
