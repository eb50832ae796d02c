//! Shared utilities for the frame pipeline.

pub mod frame_timing;
