//! The device-handle seam between the dispatch lifecycle and a concrete backend.

use std::time::Duration;

use crate::layout::{BindingDecl, BINDING_COUNT};
use crate::queue::DispatchGeometry;
use crate::{ComputeError, ElementType};

/// Limits and capabilities a device reports once, at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub backend: String,
    pub supports_compute: bool,
    /// Whether buffers can be populated and read back by the host without
    /// explicit copy commands from the caller.
    pub shared_memory: bool,
    pub max_buffer_bytes: u64,
    /// Largest number of invocations a single thread group may contain.
    pub max_group_size: u32,
    pub max_groups_per_dimension: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Visible to host and device.
    Shared,
    /// Device only; needs explicit transfers.
    Private,
}

/// Everything a backend needs to encode one dispatch.
pub struct DispatchCommand<'a, D: ComputeDevice> {
    pub program: &'a D::Program,
    /// Indexed by slot: input A, input B, result.
    pub bindings: [&'a D::Buffer; BINDING_COUNT],
    pub element_count: usize,
    pub geometry: DispatchGeometry,
}

/// Signals that a submitted batch left the device timeline.
pub trait CompletionSignal: Send + 'static {
    /// Blocks until the batch completes.
    ///
    /// # Errors
    ///
    /// [`ComputeError::DeviceLost`] if the device went away before completion.
    fn wait(&self) -> Result<(), ComputeError>;

    /// Blocks for at most `timeout`. `Ok(false)` means the batch is still in flight.
    ///
    /// # Errors
    ///
    /// [`ComputeError::DeviceLost`] if the device went away before completion.
    fn wait_timeout(&self, timeout: Duration) -> Result<bool, ComputeError>;

    fn is_complete(&self) -> bool;
}

pub trait ComputeDevice: Send + Sync + Sized + 'static {
    type Buffer: Send + Sync + 'static;
    type Program: Send + Sync + 'static;
    type Queue: Send + 'static;
    type Signal: CompletionSignal;

    fn info(&self) -> &DeviceInfo;

    /// Allocates zero-initialized, host-visible memory.
    ///
    /// # Errors
    ///
    /// [`ComputeError::Allocation`] when the device cannot provide it.
    fn allocate(&self, label: &str, size_bytes: u64) -> Result<Self::Buffer, ComputeError>;

    /// Host write into device-visible memory. Callers guarantee no batch
    /// referencing `buffer` is in flight.
    ///
    /// # Errors
    ///
    /// [`ComputeError::DeviceLost`] if the backend cannot reach the memory
    /// any more, [`ComputeError::OutOfBounds`] for a range past the end.
    fn write_buffer(
        &self,
        buffer: &Self::Buffer,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), ComputeError>;

    /// Host read of device-visible memory, same precondition as [`Self::write_buffer`].
    ///
    /// # Errors
    ///
    /// [`ComputeError::DeviceLost`] if the device is gone.
    fn read_buffer(
        &self,
        buffer: &Self::Buffer,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, ComputeError>;

    /// Resolves `name` in the backend's kernel library.
    ///
    /// # Errors
    ///
    /// [`ComputeError::Compilation`] if the kernel is unknown or fails to build.
    fn load_program(&self, name: &str, element: ElementType) -> Result<Self::Program, ComputeError>;

    /// Bindings as the loaded kernel declares them.
    fn program_bindings(&self, program: &Self::Program) -> Vec<BindingDecl>;

    fn max_group_size(&self, program: &Self::Program) -> u32;

    /// Builds whatever the backend needs to dispatch `program` with `group_size`.
    ///
    /// # Errors
    ///
    /// [`ComputeError::Compilation`] if the specialized kernel fails to build.
    fn prepare_program(&self, program: &Self::Program, group_size: u32) -> Result<(), ComputeError>;

    /// # Errors
    ///
    /// Backend specific; the CPU device fails if it cannot spawn its worker.
    fn create_queue(&self, label: &str) -> Result<Self::Queue, ComputeError>;

    /// Appends one batch to `queue`.
    ///
    /// # Errors
    ///
    /// [`ComputeError::Submission`] when the queue rejects the batch.
    fn submit(
        &self,
        queue: &mut Self::Queue,
        command: DispatchCommand<'_, Self>,
    ) -> Result<Self::Signal, ComputeError>;
}
