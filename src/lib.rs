//! Emberwatch: live face recognition with spoken-name enrollment
//!
//! Frames flow through `pipeline::MainLoop`: detection, rate-limited
//! recognition against the `gallery`, and voice-driven `enrollment` of
//! faces the gallery does not know. Detection, embedding, audio capture,
//! and speech-to-text sit behind traits in `vision`, `audio`, and `speech`.

pub mod archive;
pub mod audio;
pub mod config;
pub mod enrollment;
pub mod gallery;
pub mod paths;
pub mod pipeline;
pub mod recognition;
pub mod speech;
pub mod validation;
pub mod vision;
