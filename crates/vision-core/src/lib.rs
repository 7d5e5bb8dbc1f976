//! Shared primitives for the visual-extraction pipeline: a monotonic
//! deadline type, image fetch/decode, and the pure-Rust morphology building
//! blocks used by both the table and bar-chart detectors.

pub mod deadline;
pub mod fetch;
pub mod morph;

pub use deadline::Deadline;
pub use fetch::{decode_image, fetch_image_bytes, sha256_hex};
