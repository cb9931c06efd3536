#![deny(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions,
    clippy::missing_panics_doc
)]

//! Device, memory and dispatch lifecycle for a single element-wise kernel.
//!
//! A [`Dispatcher`] owns everything one kernel needs on one device: the
//! loaded [`KernelProgram`], three [`MemoryRegion`]s bound by the slot
//! contract in [`layout`], and an [`ExecutionQueue`]. Backends plug in
//! through [`ComputeDevice`]; the `cpu` feature ships a simulated device,
//! `gpu` a `wgpu` one.

pub mod backend;
pub mod device;
pub mod dispatcher;
pub mod element;
pub mod error;
pub mod kernels;
pub mod layout;
pub mod program;
pub mod queue;
pub mod region;

pub use device::{CompletionSignal, ComputeDevice, DeviceInfo, DispatchCommand, StorageMode};
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use element::{Element, ElementType};
pub use error::{ComputeError, ErrorPhase};
pub use program::KernelProgram;
pub use queue::{CommandEncoder, DispatchGeometry, ExecutionQueue, Submission};
pub use region::{MemoryRegion, RegionState};

#[cfg(feature = "cpu")]
pub use backend::cpu::{CpuDevice, CpuDeviceBuilder};
#[cfg(feature = "gpu")]
pub use backend::wgpu_backend::WgpuDevice;
