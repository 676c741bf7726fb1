//! Face detection and dense face mesh tracking.
//!
//! The heart of this crate is the [`pipeline::Pipeline`], which tracks faces across the frames of
//! a video: it runs the (comparatively expensive) BlazeFace detector only when it has lost track
//! of faces, and otherwise derives each face's region of interest from the landmarks computed in
//! the previous frame. Every region is rotated upright and cropped before being passed to the face
//! mesh network, and the optional iris network refines the eye contours.
//!
//! [`facemesh::FaceMesh`] wraps the pipeline in a per-frame API that accepts raw pixel buffers or
//! decoded images and returns plain data structures.
//!
//! Neural networks are accessed through the [`detection::DetectorNetwork`],
//! [`landmark::MeshNetwork`] and [`iris::IrisNetwork`] traits. [`nn`] implements them for ONNX
//! models using `tract`.
//!
//! # Coordinates
//!
//! All 2D coordinates are in pixels, with X pointing right and Y pointing *down*. Landmark Z
//! coordinates are whatever the face mesh network outputs (roughly in the scale of the X axis,
//! with smaller values closer to the camera).

pub mod detection;
pub mod facemesh;
pub mod image;
pub mod iris;
pub mod iter;
pub mod landmark;
pub mod nn;
pub mod num;
pub mod pipeline;
pub mod scope;
pub mod timer;


pub use meshtrack_geom as geom;

use log::LevelFilter;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("tract_onnx"), LevelFilter::Warn)
        .filter(Some("tract_core"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and meshtrack will log at *trace*
/// level. Otherwise, they will log at *debug* level. `tract` always logs at *warn* level.
///
/// The `RUST_LOG` environment variable can be used to override these defaults.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
