//! Core motion control for a 3D printer: kinematic transforms, bed and axis
//! compensation, delta auto-calibration, and the DDA ring that turns queued
//! moves into timed step pulses.
//!
//! This crate intentionally avoids any transport- or MCU-specific
//! dependencies; the platform is reached through the traits in [`platform`].

pub mod bed;
pub mod calibration;
pub mod dda;
pub mod kinematics;
pub mod platform;
pub mod ring;

pub use kinematics::{Geometry, GeometryError};
pub use platform::{
    EndstopHit, MoveRequest, MoveSource, Platform, ReplyChannel, AXES, DRIVES, STEP_CLOCK_RATE,
};
pub use ring::MoveRing;
