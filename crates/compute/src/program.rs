//! Loaded kernels and their dispatch limits.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::ComputeDevice;
use crate::{layout, ComputeError, ElementType};

/// A kernel resolved by name on one device, checked against the slot contract.
///
/// Any kernel used with a [`Dispatcher`](crate::Dispatcher) must bounds-check
/// its global index against the result's element count: the last thread
/// group is partially filled whenever the count is not a multiple of the
/// group size.
pub struct KernelProgram<D: ComputeDevice> {
    device: Arc<D>,
    name: String,
    element: ElementType,
    max_group_size: u32,
    prepared: Mutex<Vec<u32>>,
    raw: D::Program,
}

impl<D: ComputeDevice> KernelProgram<D> {
    /// Loads `name` for `element` and verifies its bindings.
    ///
    /// # Errors
    ///
    /// [`ComputeError::UnsupportedDevice`] if the device cannot run compute
    /// work, [`ComputeError::Compilation`] if the kernel is unknown or fails to
    /// build, [`ComputeError::BindingContract`] if its bindings do not follow
    /// slot order A, B, result.
    pub fn load(device: &Arc<D>, name: &str, element: ElementType) -> Result<Self, ComputeError> {
        let info = device.info();
        if !info.supports_compute {
            return Err(ComputeError::UnsupportedDevice {
                device: info.name.clone(),
                reason: "compute dispatch is not supported".to_string(),
            });
        }

        let raw = device.load_program(name, element)?;
        layout::verify(name, element, &device.program_bindings(&raw))?;

        let max_group_size = device.max_group_size(&raw).min(info.max_group_size);
        if max_group_size == 0 {
            return Err(ComputeError::UnsupportedDevice {
                device: info.name.clone(),
                reason: format!("reports a maximum group size of 0 for `{name}`"),
            });
        }

        tracing::info!(kernel = name, %element, max_group_size, "kernel loaded");
        Ok(Self {
            device: Arc::clone(device),
            name: name.to_string(),
            element,
            max_group_size,
            prepared: Mutex::new(Vec::new()),
            raw,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.element
    }

    /// The largest group size the device accepts for this kernel.
    #[must_use]
    pub fn max_group_size(&self) -> u32 {
        self.max_group_size
    }

    /// Builds the kernel for `group_size`. Repeated calls with the same size are free.
    ///
    /// # Errors
    ///
    /// [`ComputeError::GroupSizeExceeded`] if `group_size` is 0 or above
    /// [`Self::max_group_size`], [`ComputeError::Compilation`] if the backend
    /// fails to build it.
    pub fn prepare(&self, group_size: u32) -> Result<(), ComputeError> {
        if group_size == 0 || group_size > self.max_group_size {
            return Err(ComputeError::GroupSizeExceeded {
                requested: group_size,
                max: self.max_group_size,
            });
        }
        let mut prepared = self.prepared.lock();
        if prepared.contains(&group_size) {
            return Ok(());
        }
        self.device.prepare_program(&self.raw, group_size)?;
        prepared.push(group_size);
        tracing::debug!(kernel = %self.name, group_size, "kernel prepared");
        Ok(())
    }

    #[must_use]
    pub fn is_prepared(&self, group_size: u32) -> bool {
        self.prepared.lock().contains(&group_size)
    }

    pub(crate) fn raw(&self) -> &D::Program {
        &self.raw
    }
}

impl<D: ComputeDevice> std::fmt::Debug for KernelProgram<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelProgram")
            .field("name", &self.name)
            .field("element", &self.element)
            .field("max_group_size", &self.max_group_size)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;
    use crate::kernels::CpuKernel;
    use crate::layout::{Access, BindingDecl};
    use crate::CpuDevice;

    #[test]
    fn add_loads_with_device_group_limit() {
        let device = Arc::new(CpuDevice::builder().max_group_size(32).build());
        let program = KernelProgram::load(&device, "add", ElementType::F32).unwrap();
        assert_eq!(program.max_group_size(), 32);
        assert_eq!(program.name(), "add");
    }

    #[test]
    fn unknown_kernel_is_a_compilation_error() {
        let device = Arc::new(CpuDevice::new());
        let err = KernelProgram::load(&device, "mul", ElementType::F32).unwrap_err();
        assert!(
            matches!(err, ComputeError::Compilation { ref name, .. } if name == "mul"),
            "{err:?}"
        );
    }

    #[test]
    fn device_without_compute_is_unsupported() {
        let device = Arc::new(CpuDevice::builder().supports_compute(false).build());
        let err = KernelProgram::load(&device, "add", ElementType::F32).unwrap_err();
        assert!(matches!(err, ComputeError::UnsupportedDevice { .. }), "{err:?}");
    }

    #[test]
    fn mismatched_bindings_fail_at_load() {
        let swapped = CpuKernel::new(
            "add_swapped",
            [
                BindingDecl {
                    slot: 0,
                    access: Access::ReadWrite,
                    element: None,
                },
                BindingDecl {
                    slot: 1,
                    access: Access::ReadOnly,
                    element: None,
                },
                BindingDecl {
                    slot: 2,
                    access: Access::ReadOnly,
                    element: None,
                },
            ],
            |_| {},
        );
        let device = Arc::new(CpuDevice::builder().kernel(swapped).build());
        let err = KernelProgram::load(&device, "add_swapped", ElementType::U32).unwrap_err();
        assert!(matches!(err, ComputeError::BindingContract { .. }), "{err:?}");
    }

    #[test]
    fn group_size_above_maximum_is_fatal() {
        let device = Arc::new(CpuDevice::builder().max_group_size(8).build());
        let program = KernelProgram::load(&device, "add", ElementType::I32).unwrap();
        assert_eq!(
            program.prepare(9),
            Err(ComputeError::GroupSizeExceeded {
                requested: 9,
                max: 8,
            })
        );
        assert!(program.prepare(0).is_err());
        program.prepare(8).unwrap();
        assert!(program.is_prepared(8));
    }
}
