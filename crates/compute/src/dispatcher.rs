//! One element-wise kernel, three regions, one queue: the full dispatch cycle.

use std::sync::Arc;
use std::time::Duration;

use crate::device::ComputeDevice;
use crate::layout::{slot_label, SLOT_INPUT_A, SLOT_INPUT_B, SLOT_RESULT};
use crate::queue::{DispatchGeometry, ExecutionQueue, Submission};
use crate::region::RegionState;
use crate::{ComputeError, Element, ElementType, KernelProgram, MemoryRegion};

/// 16M elements, 64 MiB per f32 region.
pub const DEFAULT_ELEMENT_COUNT: usize = 1 << 24;

pub const DEFAULT_KERNEL: &str = "add";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub kernel: String,
    pub element_count: usize,
    pub element_type: ElementType,
    /// Bounded wait for each dispatch. `None` blocks until the device answers.
    pub timeout: Option<Duration>,
    /// Caller cap on the group size, applied below the device maximum.
    pub max_group_size: Option<u32>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            kernel: DEFAULT_KERNEL.to_string(),
            element_count: DEFAULT_ELEMENT_COUNT,
            element_type: ElementType::F32,
            timeout: None,
            max_group_size: None,
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub fn with_kernel(mut self, kernel: impl Into<String>) -> Self {
        self.kernel = kernel.into();
        self
    }

    #[must_use]
    pub fn with_element_count(mut self, element_count: usize) -> Self {
        self.element_count = element_count;
        self
    }

    #[must_use]
    pub fn with_element_type(mut self, element_type: ElementType) -> Self {
        self.element_type = element_type;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_max_group_size(mut self, max_group_size: u32) -> Self {
        self.max_group_size = Some(max_group_size);
        self
    }
}

/// Owns everything one compute cycle touches and runs that cycle on demand.
///
/// Host access to the regions is only possible between cycles: [`run`]
/// takes `&mut self` and returns after the batch's completion signal fired,
/// or after recording the regions as in flight when a bounded wait expires.
///
/// [`run`]: Dispatcher::run
pub struct Dispatcher<D: ComputeDevice> {
    device: Arc<D>,
    config: DispatchConfig,
    program: KernelProgram<D>,
    queue: ExecutionQueue<D>,
    input_a: MemoryRegion<D>,
    input_b: MemoryRegion<D>,
    result: MemoryRegion<D>,
    geometry: Option<DispatchGeometry>,
    pending: Option<Submission<D>>,
}

impl<D: ComputeDevice> Dispatcher<D> {
    /// Sets up a dispatcher with [`DispatchConfig::default`].
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::with_config`].
    pub fn initialize(device: Arc<D>) -> Result<Self, ComputeError> {
        Self::with_config(device, DispatchConfig::default())
    }

    /// Loads the kernel, picks the dispatch geometry, allocates the three
    /// regions and creates the queue.
    ///
    /// # Errors
    ///
    /// Setup errors only: [`ComputeError::UnsupportedDevice`],
    /// [`ComputeError::Compilation`], [`ComputeError::BindingContract`],
    /// [`ComputeError::GroupSizeExceeded`], [`ComputeError::Allocation`].
    pub fn with_config(device: Arc<D>, config: DispatchConfig) -> Result<Self, ComputeError> {
        let info = device.info();
        tracing::info!(
            device = %info.name,
            backend = %info.backend,
            kernel = %config.kernel,
            elements = config.element_count,
            element = %config.element_type,
            "initializing dispatcher"
        );

        let program = KernelProgram::load(&device, &config.kernel, config.element_type)?;
        let max_group_size = match config.max_group_size {
            Some(0) => {
                return Err(ComputeError::GroupSizeExceeded {
                    requested: 0,
                    max: program.max_group_size(),
                })
            }
            Some(cap) => cap.min(program.max_group_size()),
            None => program.max_group_size(),
        };

        let geometry = DispatchGeometry::for_elements(config.element_count, max_group_size);
        if let Some(geometry) = geometry {
            if geometry.groups > info.max_groups_per_dimension {
                return Err(ComputeError::UnsupportedDevice {
                    device: info.name.clone(),
                    reason: format!(
                        "{} elements need {} groups, the device allows {}",
                        config.element_count, geometry.groups, info.max_groups_per_dimension
                    ),
                });
            }
            program.prepare(geometry.group_size)?;
        }

        let allocate = |slot| {
            MemoryRegion::allocate(
                &device,
                slot_label(slot),
                config.element_count,
                config.element_type,
            )
        };
        let input_a = allocate(SLOT_INPUT_A)?;
        let input_b = allocate(SLOT_INPUT_B)?;
        let result = allocate(SLOT_RESULT)?;
        let queue = ExecutionQueue::new(&device, format!("{}-queue", config.kernel))?;

        Ok(Self {
            device,
            config,
            program,
            queue,
            input_a,
            input_b,
            result,
            geometry,
            pending: None,
        })
    }

    /// N: the element count of every region.
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.config.element_count
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    #[must_use]
    pub fn program(&self) -> &KernelProgram<D> {
        &self.program
    }

    #[must_use]
    pub fn queue(&self) -> &ExecutionQueue<D> {
        &self.queue
    }

    /// `None` when N is zero and nothing is ever dispatched.
    #[must_use]
    pub fn geometry(&self) -> Option<DispatchGeometry> {
        self.geometry
    }

    #[must_use]
    pub fn group_size(&self) -> Option<u32> {
        self.geometry.map(|geometry| geometry.group_size)
    }

    #[must_use]
    pub fn input_a(&self) -> &MemoryRegion<D> {
        &self.input_a
    }

    #[must_use]
    pub fn input_b(&self) -> &MemoryRegion<D> {
        &self.input_b
    }

    #[must_use]
    pub fn result(&self) -> &MemoryRegion<D> {
        &self.result
    }

    #[must_use]
    pub fn result_state(&self) -> RegionState {
        self.result.state()
    }

    /// Whether a timed-out batch has not been observed to finish yet.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Output of the last completed dispatch.
    ///
    /// # Errors
    ///
    /// [`ComputeError::RegionInFlight`] or [`ComputeError::UndefinedContents`]
    /// when the last dispatch has not completed or failed.
    pub fn read_result<T: Element>(&self) -> Result<Vec<T>, ComputeError> {
        self.result.read_all()
    }

    /// Populates the inputs, dispatches the kernel once, waits for it and
    /// returns the result. The dispatcher never retries.
    ///
    /// # Errors
    ///
    /// [`ComputeError::LengthMismatch`] / [`ComputeError::ElementTypeMismatch`]
    /// for bad inputs, [`ComputeError::Submission`] when the queue rejects the
    /// batch, [`ComputeError::DeviceLost`] when the device goes away during the
    /// wait (the result is then undefined), [`ComputeError::DispatchTimeout`]
    /// when a configured bounded wait expires (the regions stay in flight).
    /// [`ComputeError::RegionInFlight`] while such a batch has not been
    /// drained with [`Dispatcher::settle`]; the new inputs are not touched.
    pub fn run<T: Element>(
        &mut self,
        input_a: &[T],
        input_b: &[T],
    ) -> Result<Vec<T>, ComputeError> {
        if T::TYPE != self.config.element_type {
            return Err(ComputeError::ElementTypeMismatch {
                expected: self.config.element_type,
                actual: T::TYPE,
            });
        }
        let lengths = [(&self.input_a, input_a.len()), (&self.input_b, input_b.len())];
        for (region, values) in lengths {
            if values != self.config.element_count {
                return Err(ComputeError::LengthMismatch {
                    label: region.label().to_string(),
                    expected: self.config.element_count,
                    actual: values,
                });
            }
        }

        if self.pending.is_some() {
            tracing::warn!("previous batch still in flight, settle it before running again");
            return Err(ComputeError::RegionInFlight(self.result.label().to_string()));
        }

        let Some(geometry) = self.geometry else {
            tracing::debug!("empty dispatch, nothing submitted");
            return Ok(Vec::new());
        };

        self.input_a.write(0, input_a)?;
        self.input_b.write(0, input_b)?;
        self.result.set_state(RegionState::Undefined);

        let mut encoder = self.queue.encoder();
        encoder
            .set_program(&self.program)
            .bind(SLOT_INPUT_A, &self.input_a)
            .bind(SLOT_INPUT_B, &self.input_b)
            .bind(SLOT_RESULT, &self.result)
            .dispatch(geometry);
        let submission = match encoder.commit() {
            Ok(submission) => submission,
            Err(err) => {
                tracing::warn!(error = %err, "dispatch was not submitted");
                return Err(err);
            }
        };
        self.mark_in_flight();

        self.observe(submission)?;
        self.result.read_all()
    }

    /// Waits out a batch left in flight by an expired bounded wait. [`run`]
    /// refuses new inputs until this has succeeded.
    ///
    /// Uses the configured timeout again; without one it blocks.
    ///
    /// [`run`]: Dispatcher::run
    ///
    /// # Errors
    ///
    /// [`ComputeError::DispatchTimeout`] if the batch is still running,
    /// [`ComputeError::DeviceLost`] if it never will complete.
    pub fn settle(&mut self) -> Result<(), ComputeError> {
        match self.pending.take() {
            Some(submission) => {
                tracing::debug!(sequence = submission.sequence(), "settling in-flight batch");
                self.observe(submission)
            }
            None => Ok(()),
        }
    }

    fn observe(&mut self, submission: Submission<D>) -> Result<(), ComputeError> {
        let outcome = match self.config.timeout {
            Some(timeout) => match submission.wait_timeout(timeout) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    tracing::warn!(
                        sequence = submission.sequence(),
                        ?timeout,
                        "dispatch still in flight after bounded wait"
                    );
                    self.pending = Some(submission);
                    return Err(ComputeError::DispatchTimeout(timeout));
                }
                Err(err) => Err(err),
            },
            None => submission.wait(),
        };

        self.input_a.set_state(RegionState::Ready);
        self.input_b.set_state(RegionState::Ready);
        match outcome {
            Ok(()) => {
                self.result.set_state(RegionState::Ready);
                tracing::debug!(sequence = submission.sequence(), "batch completed");
                Ok(())
            }
            Err(err) => {
                self.result.set_state(RegionState::Undefined);
                tracing::warn!(sequence = submission.sequence(), error = %err, "batch failed");
                Err(err)
            }
        }
    }

    fn mark_in_flight(&mut self) {
        self.input_a.set_state(RegionState::InFlight);
        self.input_b.set_state(RegionState::InFlight);
        self.result.set_state(RegionState::InFlight);
    }
}

impl<D: ComputeDevice> Drop for Dispatcher<D> {
    fn drop(&mut self) {
        if let Some(submission) = self.pending.take() {
            if let Err(err) = submission.wait() {
                tracing::warn!(error = %err, "in-flight batch failed during teardown");
            }
        }
    }
}

impl<D: ComputeDevice> std::fmt::Debug for Dispatcher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("geometry", &self.geometry)
            .field("submitted", &self.queue.submitted())
            .field("pending", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}
