//! Host- and device-visible typed memory.

use std::ops::Range;
use std::sync::Arc;

use crate::device::{ComputeDevice, StorageMode};
use crate::{ComputeError, Element, ElementType};

/// Whether the host may touch a region right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// No batch references the region and its contents are defined.
    Ready,
    /// A submitted batch references the region and has not been observed to
    /// complete. Host reads and writes are refused.
    InFlight,
    /// The last batch writing the region failed; contents must not be read
    /// until a fresh dispatch or a full host write replaces them.
    Undefined,
}

/// A fixed-length block of `element`-typed memory shared by host and device.
///
/// The region owns its device buffer. A device only ever holds a non-owning
/// reference to it for the duration of one batch.
pub struct MemoryRegion<D: ComputeDevice> {
    device: Arc<D>,
    label: String,
    element: ElementType,
    len: usize,
    buffer: D::Buffer,
    state: RegionState,
}

impl<D: ComputeDevice> MemoryRegion<D> {
    /// Allocates `len` zeroed elements of `element` in shared storage.
    ///
    /// # Errors
    ///
    /// [`ComputeError::Allocation`] when the device has no shared storage or
    /// the byte size exceeds its limits.
    pub fn allocate(
        device: &Arc<D>,
        label: impl Into<String>,
        len: usize,
        element: ElementType,
    ) -> Result<Self, ComputeError> {
        let label = label.into();
        let info = device.info();
        let requested = u64::try_from(len)
            .ok()
            .and_then(|len| len.checked_mul(element.size_bytes() as u64));
        let Some(requested) = requested else {
            return Err(ComputeError::Allocation {
                label,
                requested: u64::MAX,
                reason: format!("{len} elements of {element} overflow the address space"),
            });
        };
        if !info.shared_memory {
            return Err(ComputeError::Allocation {
                label,
                requested,
                reason: format!("device `{}` has no shared storage mode", info.name),
            });
        }
        if requested > info.max_buffer_bytes {
            return Err(ComputeError::Allocation {
                label,
                requested,
                reason: format!("device limit is {} bytes", info.max_buffer_bytes),
            });
        }

        let buffer = device.allocate(&label, requested)?;
        tracing::debug!(
            region = %label,
            len,
            %element,
            bytes = requested,
            "allocated shared region"
        );
        Ok(Self {
            device: Arc::clone(device),
            label,
            element,
            len,
            buffer,
            state: RegionState::Ready,
        })
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.element
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.len * self.element.size_bytes()
    }

    #[must_use]
    pub fn storage_mode(&self) -> StorageMode {
        StorageMode::Shared
    }

    #[must_use]
    pub fn state(&self) -> RegionState {
        self.state
    }

    /// The backend buffer, for inspection only.
    #[must_use]
    pub fn device_buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    /// Writes `values` starting at element `offset`.
    ///
    /// A write covering the whole region makes it [`RegionState::Ready`] again.
    ///
    /// # Errors
    ///
    /// [`ComputeError::RegionInFlight`] while a batch references the region,
    /// plus type and bounds errors.
    pub fn write<T: Element>(&mut self, offset: usize, values: &[T]) -> Result<(), ComputeError> {
        self.check_type::<T>()?;
        if self.state == RegionState::InFlight {
            return Err(ComputeError::RegionInFlight(self.label.clone()));
        }
        let range = self.check_range(offset..offset.saturating_add(values.len()))?;
        if values.is_empty() {
            return Ok(());
        }

        let byte_offset = (range.start * self.element.size_bytes()) as u64;
        self.device
            .write_buffer(&self.buffer, byte_offset, bytemuck::cast_slice(values))?;
        if range == (0..self.len) {
            self.state = RegionState::Ready;
        }
        Ok(())
    }

    /// Reads the elements in `range`.
    ///
    /// # Errors
    ///
    /// [`ComputeError::RegionInFlight`] or [`ComputeError::UndefinedContents`]
    /// unless the region is [`RegionState::Ready`], plus type and bounds errors.
    pub fn read<T: Element>(&self, range: Range<usize>) -> Result<Vec<T>, ComputeError> {
        self.check_type::<T>()?;
        match self.state {
            RegionState::Ready => {}
            RegionState::InFlight => {
                return Err(ComputeError::RegionInFlight(self.label.clone()));
            }
            RegionState::Undefined => {
                return Err(ComputeError::UndefinedContents(self.label.clone()));
            }
        }
        let range = self.check_range(range)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let size = self.element.size_bytes();
        let bytes = self.device.read_buffer(
            &self.buffer,
            (range.start * size) as u64,
            (range.len() * size) as u64,
        )?;
        Ok(bytes.chunks_exact(size).map(bytemuck::pod_read_unaligned).collect())
    }

    /// # Errors
    ///
    /// Same as [`Self::read`].
    pub fn read_all<T: Element>(&self) -> Result<Vec<T>, ComputeError> {
        self.read(0..self.len)
    }

    pub(crate) fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    pub(crate) fn set_state(&mut self, state: RegionState) {
        self.state = state;
    }

    fn check_type<T: Element>(&self) -> Result<(), ComputeError> {
        if T::TYPE == self.element {
            Ok(())
        } else {
            Err(ComputeError::ElementTypeMismatch {
                expected: self.element,
                actual: T::TYPE,
            })
        }
    }

    fn check_range(&self, range: Range<usize>) -> Result<Range<usize>, ComputeError> {
        if range.start > range.end || range.end > self.len {
            return Err(ComputeError::OutOfBounds {
                label: self.label.clone(),
                start: range.start,
                end: range.end,
                len: self.len,
            });
        }
        Ok(range)
    }
}

impl<D: ComputeDevice> std::fmt::Debug for MemoryRegion<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("label", &self.label)
            .field("element", &self.element)
            .field("len", &self.len)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "cpu"))]
mod tests {
    use super::*;
    use crate::CpuDevice;

    fn device() -> Arc<CpuDevice> {
        Arc::new(CpuDevice::new())
    }

    #[test]
    fn fresh_region_reads_zeroes() {
        let region = MemoryRegion::allocate(&device(), "a", 4, ElementType::F32).unwrap();
        assert_eq!(region.state(), RegionState::Ready);
        assert_eq!(region.read_all::<f32>().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn partial_write_and_read() {
        let mut region = MemoryRegion::allocate(&device(), "a", 6, ElementType::I32).unwrap();
        region.write(2, &[7i32, -8]).unwrap();
        assert_eq!(region.read::<i32>(1..5).unwrap(), vec![0, 7, -8, 0]);
    }

    #[test]
    fn wrong_type_is_refused() {
        let mut region = MemoryRegion::allocate(&device(), "a", 2, ElementType::F32).unwrap();
        let err = region.write(0, &[1u32, 2]).unwrap_err();
        assert_eq!(
            err,
            ComputeError::ElementTypeMismatch {
                expected: ElementType::F32,
                actual: ElementType::U32
            }
        );
    }

    #[test]
    fn out_of_range_is_refused() {
        let mut region = MemoryRegion::allocate(&device(), "a", 2, ElementType::F32).unwrap();
        assert!(matches!(
            region.write(1, &[1.0f32, 2.0]),
            Err(ComputeError::OutOfBounds { start: 1, end: 3, len: 2, .. })
        ));
        assert!(matches!(region.read::<f32>(0..3), Err(ComputeError::OutOfBounds { .. })));
    }

    #[test]
    fn in_flight_region_refuses_host_access() {
        let mut region = MemoryRegion::allocate(&device(), "result", 2, ElementType::F32).unwrap();
        region.set_state(RegionState::InFlight);
        assert_eq!(
            region.write(0, &[1.0f32, 2.0]),
            Err(ComputeError::RegionInFlight("result".into()))
        );
        assert!(matches!(region.read_all::<f32>(), Err(ComputeError::RegionInFlight(_))));
    }

    #[test]
    fn undefined_region_becomes_ready_after_full_write() {
        let mut region = MemoryRegion::allocate(&device(), "result", 3, ElementType::U32).unwrap();
        region.set_state(RegionState::Undefined);
        assert!(matches!(region.read_all::<u32>(), Err(ComputeError::UndefinedContents(_))));

        region.write(0, &[1u32]).unwrap();
        assert_eq!(region.state(), RegionState::Undefined);
        region.write(0, &[1u32, 2, 3]).unwrap();
        assert_eq!(region.read_all::<u32>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn oversized_allocation_fails() {
        let device = Arc::new(CpuDevice::builder().max_buffer_bytes(64).build());
        let err = MemoryRegion::allocate(&device, "big", 17, ElementType::F32).unwrap_err();
        assert!(matches!(err, ComputeError::Allocation { requested: 68, .. }), "{err:?}");
        assert!(MemoryRegion::allocate(&device, "fits", 16, ElementType::F32).is_ok());
    }

    #[test]
    fn device_without_shared_storage_cannot_allocate() {
        let device = Arc::new(CpuDevice::builder().shared_memory(false).build());
        let err = MemoryRegion::allocate(&device, "a", 1, ElementType::F32).unwrap_err();
        assert!(err.to_string().contains("shared storage"), "{err}");
    }
}
