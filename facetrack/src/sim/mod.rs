//! Closed-loop simulator for the external collaborators.
//!
//! A [`SimWorld`] holds one target face and one vehicle. The vehicle's
//! commanded velocity moves the target in the image the way a real camera
//! would see it, so a session driven by the simulator actually converges.
//!
//! ```text
//!   SimVehicle ──set_velocity──► SimWorld ◄──advance/render── SimCamera
//!       │                            │                            │
//!    CallLog                     target pose                   Frame
//!   (every call)                                                  │
//!                                    SimDetector ◄────────────────┘
//!                                 (marker bounding box)
//! ```
//!
//! [`SimFactory`] bundles the pieces behind [`crate::session::SessionFactory`]
//! and exposes the call log and fault switches to tests.

mod camera;
mod detector;
mod factory;
mod vehicle;
mod world;

pub use camera::SimCamera;
pub use detector::SimDetector;
pub use factory::{FrameMode, SimFactory, DEFAULT_CAMERA_FPS};
pub use vehicle::{CallLog, SimFaults, SimVehicle, VehicleCall};
pub use world::{SimWorld, TargetPose, WorldConfig, MARKER};
