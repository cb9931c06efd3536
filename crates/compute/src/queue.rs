//! FIFO submission of command batches and the encoder that builds them.

use std::sync::Arc;
use std::time::Duration;

use crate::device::{CompletionSignal, ComputeDevice, DispatchCommand};
use crate::layout::{slot_label, BINDING_COUNT};
use crate::region::RegionState;
use crate::{ComputeError, KernelProgram, MemoryRegion};

/// How many thread groups of which size cover a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGeometry {
    pub groups: u32,
    pub group_size: u32,
}

impl DispatchGeometry {
    /// `min(n, max_group_size)` threads per group and `ceil(n / group_size)`
    /// groups: every element is covered by the fewest groups the device allows.
    /// `None` for an empty dispatch.
    #[must_use]
    pub fn for_elements(element_count: usize, max_group_size: u32) -> Option<Self> {
        if element_count == 0 || max_group_size == 0 {
            return None;
        }
        let group_size =
            u32::try_from(element_count).map_or(max_group_size, |n| n.min(max_group_size));
        let groups = element_count.div_ceil(group_size as usize);
        Some(Self {
            groups: u32::try_from(groups).unwrap_or(u32::MAX),
            group_size,
        })
    }

    #[must_use]
    pub fn threads(&self) -> u64 {
        u64::from(self.groups) * u64::from(self.group_size)
    }

    #[must_use]
    pub fn covers(&self, element_count: usize) -> bool {
        self.threads() >= element_count as u64
    }
}

/// Ordered, append-only channel of command batches to one device.
///
/// Batches complete in submission order.
pub struct ExecutionQueue<D: ComputeDevice> {
    device: Arc<D>,
    label: String,
    raw: D::Queue,
    submitted: u64,
}

impl<D: ComputeDevice> ExecutionQueue<D> {
    /// # Errors
    ///
    /// Whatever the device reports when it cannot create a queue.
    pub fn new(device: &Arc<D>, label: impl Into<String>) -> Result<Self, ComputeError> {
        let label = label.into();
        let raw = device.create_queue(&label)?;
        Ok(Self {
            device: Arc::clone(device),
            label,
            raw,
            submitted: 0,
        })
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of batches accepted so far.
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Opens a fresh encoding context bound to this queue.
    pub fn encoder(&mut self) -> CommandEncoder<'_, D> {
        CommandEncoder {
            queue: self,
            program: None,
            bindings: [None; BINDING_COUNT],
            geometry: None,
        }
    }
}

/// Records one dispatch; [`CommandEncoder::commit`] closes it and submits.
pub struct CommandEncoder<'q, D: ComputeDevice> {
    queue: &'q mut ExecutionQueue<D>,
    program: Option<&'q KernelProgram<D>>,
    bindings: [Option<&'q MemoryRegion<D>>; BINDING_COUNT],
    geometry: Option<DispatchGeometry>,
}

impl<'q, D: ComputeDevice> CommandEncoder<'q, D> {
    pub fn set_program(&mut self, program: &'q KernelProgram<D>) -> &mut Self {
        self.program = Some(program);
        self
    }

    /// Binds `region` at `slot`. Slots outside the contract are reported by `commit`.
    pub fn bind(&mut self, slot: u32, region: &'q MemoryRegion<D>) -> &mut Self {
        if let Some(binding) = self.bindings.get_mut(slot as usize) {
            *binding = Some(region);
        }
        self
    }

    pub fn dispatch(&mut self, geometry: DispatchGeometry) -> &mut Self {
        self.geometry = Some(geometry);
        self
    }

    /// Validates the recorded dispatch and appends it to the queue.
    ///
    /// # Errors
    ///
    /// Configuration errors (missing program, slot or geometry, mismatched
    /// regions, oversized groups) are reported before anything reaches the
    /// device. [`ComputeError::Submission`] if the device rejects the batch.
    pub fn commit(self) -> Result<Submission<D>, ComputeError> {
        let Some(program) = self.program else {
            return Err(ComputeError::Submission("no kernel bound to the encoder".into()));
        };
        let Some(geometry) = self.geometry else {
            return Err(ComputeError::Submission("no dispatch recorded".into()));
        };

        let mut regions: Vec<&MemoryRegion<D>> = Vec::with_capacity(BINDING_COUNT);
        for (slot, binding) in (0u32..).zip(self.bindings) {
            let Some(region) = binding else {
                return Err(ComputeError::BindingContract {
                    name: program.name().to_string(),
                    reason: format!("slot {slot} ({}) has no region bound", slot_label(slot)),
                });
            };
            if region.element_type() != program.element_type() {
                return Err(ComputeError::ElementTypeMismatch {
                    expected: program.element_type(),
                    actual: region.element_type(),
                });
            }
            if region.state() == RegionState::InFlight {
                return Err(ComputeError::RegionInFlight(region.label().to_string()));
            }
            if let Some(&bound) = regions.iter().find(|bound| std::ptr::eq(**bound, region)) {
                return Err(ComputeError::BindingContract {
                    name: program.name().to_string(),
                    reason: format!("`{}` is bound to more than one slot", bound.label()),
                });
            }
            regions.push(region);
        }

        let element_count = regions[BINDING_COUNT - 1].len();
        if let Some(other) = regions.iter().find(|region| region.len() != element_count) {
            return Err(ComputeError::LengthMismatch {
                label: other.label().to_string(),
                expected: element_count,
                actual: other.len(),
            });
        }
        if element_count == 0 {
            return Err(ComputeError::Submission("refusing to submit an empty dispatch".into()));
        }
        if geometry.group_size > program.max_group_size() {
            return Err(ComputeError::GroupSizeExceeded {
                requested: geometry.group_size,
                max: program.max_group_size(),
            });
        }
        if !geometry.covers(element_count) {
            return Err(ComputeError::Submission(format!(
                "{} groups of {} do not cover {element_count} elements",
                geometry.groups, geometry.group_size
            )));
        }
        program.prepare(geometry.group_size)?;

        let queue = self.queue;
        let command = DispatchCommand {
            program: program.raw(),
            bindings: [regions[0].buffer(), regions[1].buffer(), regions[2].buffer()],
            element_count,
            geometry,
        };
        let signal = queue.device.submit(&mut queue.raw, command)?;
        queue.submitted += 1;
        tracing::debug!(
            queue = %queue.label,
            sequence = queue.submitted,
            kernel = program.name(),
            groups = geometry.groups,
            group_size = geometry.group_size,
            "batch submitted"
        );
        Ok(Submission {
            sequence: queue.submitted,
            signal,
        })
    }
}

/// A batch on the device timeline and its completion signal.
pub struct Submission<D: ComputeDevice> {
    sequence: u64,
    signal: D::Signal,
}

impl<D: ComputeDevice> Submission<D> {
    /// 1-based position of the batch in its queue.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// # Errors
    ///
    /// [`ComputeError::DeviceLost`] if the device went away first.
    pub fn wait(&self) -> Result<(), ComputeError> {
        self.signal.wait()
    }

    /// `Ok(false)` if the batch is still running after `timeout`.
    ///
    /// # Errors
    ///
    /// [`ComputeError::DeviceLost`] if the device went away first.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, ComputeError> {
        self.signal.wait_timeout(timeout)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.signal.is_complete()
    }
}

impl<D: ComputeDevice> std::fmt::Debug for Submission<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("sequence", &self.sequence)
            .field("complete", &self.is_complete())
            .finish_non_exhaustive()
    }
}
