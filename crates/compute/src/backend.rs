//! Concrete [`ComputeDevice`](crate::ComputeDevice) implementations.

#[cfg(feature = "cpu")]
pub mod cpu;
#[cfg(feature = "gpu")]
pub mod wgpu_backend;
