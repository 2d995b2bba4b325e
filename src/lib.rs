pub mod config;
pub mod math;
pub mod render;
pub mod vr;
