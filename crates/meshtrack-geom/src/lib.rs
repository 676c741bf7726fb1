//! Geometry primitives shared by the `meshtrack` face tracker.
//!
//! All coordinates are in pixels of some image (the original frame, a model input, or a crop),
//! with X pointing right and Y pointing *down*, matching the layout of the image data the neural
//! networks consume.

mod bounds;
mod resolution;
pub mod transform;

pub use bounds::BoundingBox;
pub use resolution::Resolution;
pub use transform::{compute_rotation, normalize_radians, Transform};
