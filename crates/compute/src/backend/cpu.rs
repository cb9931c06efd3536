//! A device simulated on the host.
//!
//! Buffers are plain byte vectors, every queue owns one worker thread that
//! executes batches strictly in submission order, and kernels are Rust
//! functions run once per thread of the dispatch geometry. The device can be
//! told to misbehave (lose itself, reject batches, run slowly) so the
//! dispatcher's failure paths can be exercised without hardware.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::device::{CompletionSignal, ComputeDevice, DeviceInfo, DispatchCommand};
use crate::kernels::{self, CpuKernel, Invocation};
use crate::layout::BindingDecl;
use crate::queue::DispatchGeometry;
use crate::{ComputeError, Element, ElementType};

/// Value written into guard padding behind every buffer.
pub const GUARD_BYTE: u8 = 0xA5;

pub struct CpuDevice {
    info: DeviceInfo,
    kernels: HashMap<String, CpuKernel>,
    guard_bytes: usize,
    completion_delay: Duration,
    faults: Arc<Faults>,
    recorder: Option<Arc<Mutex<Vec<BatchRecord>>>>,
    next_buffer_id: AtomicU64,
}

impl CpuDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> CpuDeviceBuilder {
        CpuDeviceBuilder::default()
    }

    /// Marks the device lost. In-flight and future batches fail.
    pub fn lose(&self, reason: impl Into<String>) {
        self.faults.mark_lost(reason.into());
    }

    /// The next batch a worker picks up loses the device instead of running.
    pub fn lose_during_next_batch(&self) {
        self.faults.lose_during_next_batch.store(true, Ordering::SeqCst);
    }

    /// While set, every submission is refused before it reaches a queue.
    pub fn reject_submissions(&self, reject: bool) {
        self.faults.reject_submissions.store(reject, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.faults.lost_reason().is_some()
    }

    /// Batches executed so far, in completion order. Empty unless the device
    /// was built with [`CpuDeviceBuilder::record_batches`].
    #[must_use]
    pub fn records(&self) -> Vec<BatchRecord> {
        self.recorder.as_ref().map(|records| records.lock().clone()).unwrap_or_default()
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDevice")
            .field("info", &self.info)
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .field("lost", &self.faults.lost_reason())
            .finish_non_exhaustive()
    }
}

pub struct CpuDeviceBuilder {
    info: DeviceInfo,
    kernels: Vec<CpuKernel>,
    guard_bytes: usize,
    completion_delay: Duration,
    record_batches: bool,
}

impl Default for CpuDeviceBuilder {
    fn default() -> Self {
        Self {
            info: DeviceInfo {
                name: "cpu-sim".into(),
                backend: "cpu".into(),
                supports_compute: true,
                shared_memory: true,
                max_buffer_bytes: 1 << 30,
                max_group_size: 1024,
                max_groups_per_dimension: 65_535,
            },
            kernels: kernels::builtin_cpu_kernels(),
            guard_bytes: 0,
            completion_delay: Duration::ZERO,
            record_batches: false,
        }
    }
}

impl CpuDeviceBuilder {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.info.name = name.into();
        self
    }

    #[must_use]
    pub fn max_group_size(mut self, max_group_size: u32) -> Self {
        self.info.max_group_size = max_group_size;
        self
    }

    #[must_use]
    pub fn max_groups_per_dimension(mut self, max_groups: u32) -> Self {
        self.info.max_groups_per_dimension = max_groups;
        self
    }

    #[must_use]
    pub fn max_buffer_bytes(mut self, max_buffer_bytes: u64) -> Self {
        self.info.max_buffer_bytes = max_buffer_bytes;
        self
    }

    #[must_use]
    pub fn supports_compute(mut self, supports_compute: bool) -> Self {
        self.info.supports_compute = supports_compute;
        self
    }

    #[must_use]
    pub fn shared_memory(mut self, shared_memory: bool) -> Self {
        self.info.shared_memory = shared_memory;
        self
    }

    /// Every batch sleeps this long before it runs.
    #[must_use]
    pub fn completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }

    /// Padding allocated behind each buffer and filled with [`GUARD_BYTE`];
    /// kernels that write past the end land there instead of faulting.
    #[must_use]
    pub fn guard_bytes(mut self, guard_bytes: usize) -> Self {
        self.guard_bytes = guard_bytes;
        self
    }

    #[must_use]
    pub fn record_batches(mut self, record: bool) -> Self {
        self.record_batches = record;
        self
    }

    /// Adds a kernel, replacing any builtin with the same name.
    #[must_use]
    pub fn kernel(mut self, kernel: CpuKernel) -> Self {
        self.kernels.retain(|existing| existing.name != kernel.name);
        self.kernels.push(kernel);
        self
    }

    #[must_use]
    pub fn build(self) -> CpuDevice {
        CpuDevice {
            info: self.info,
            kernels: self.kernels.into_iter().map(|kernel| (kernel.name.clone(), kernel)).collect(),
            guard_bytes: self.guard_bytes,
            completion_delay: self.completion_delay,
            faults: Arc::new(Faults::default()),
            recorder: self.record_batches.then(|| Arc::new(Mutex::new(Vec::new()))),
            next_buffer_id: AtomicU64::new(0),
        }
    }
}

#[derive(Default)]
struct Faults {
    lost: Mutex<Option<String>>,
    lose_during_next_batch: AtomicBool,
    reject_submissions: AtomicBool,
}

impl Faults {
    fn lost_reason(&self) -> Option<String> {
        self.lost.lock().clone()
    }

    fn mark_lost(&self, reason: String) {
        let mut lost = self.lost.lock();
        if lost.is_none() {
            tracing::warn!(%reason, "cpu device lost");
            *lost = Some(reason);
        }
    }
}

struct CpuStorage {
    bytes: Mutex<Vec<u8>>,
    /// Usable length; anything behind it is guard padding.
    len: usize,
}

pub struct CpuBuffer {
    id: u64,
    storage: Arc<CpuStorage>,
}

impl CpuBuffer {
    /// Unique per device.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.len == 0
    }

    /// Whether the padding behind the buffer still holds [`GUARD_BYTE`].
    #[must_use]
    pub fn guard_intact(&self) -> bool {
        self.storage.bytes.lock()[self.storage.len..].iter().all(|&byte| byte == GUARD_BYTE)
    }
}

impl std::fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuBuffer")
            .field("id", &self.id)
            .field("len", &self.storage.len)
            .finish()
    }
}

#[derive(Debug)]
pub struct CpuProgram {
    kernel: CpuKernel,
    element: ElementType,
}

/// One batch as the worker executed it.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    /// 1-based position within its queue.
    pub sequence: u64,
    pub queue: String,
    pub kernel: String,
    pub element: ElementType,
    pub geometry: DispatchGeometry,
    pub element_count: usize,
    /// Input bytes as the kernel saw them.
    pub input_a: Vec<u8>,
    pub input_b: Vec<u8>,
    pub started: Instant,
    pub finished: Instant,
}

impl BatchRecord {
    #[must_use]
    pub fn input_a_as<T: Element>(&self) -> Vec<T> {
        decode(&self.input_a)
    }

    #[must_use]
    pub fn input_b_as<T: Element>(&self) -> Vec<T> {
        decode(&self.input_b)
    }
}

fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

struct CpuBatch {
    sequence: u64,
    kernel: CpuKernel,
    element: ElementType,
    storages: [Arc<CpuStorage>; 3],
    element_count: usize,
    geometry: DispatchGeometry,
    completer: Completer,
}

pub struct CpuQueue {
    sender: Option<mpsc::Sender<CpuBatch>>,
    worker: Option<JoinHandle<()>>,
    next_sequence: u64,
}

impl Drop for CpuQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("cpu queue worker panicked");
            }
        }
    }
}

/// Everything a queue worker needs from its device.
struct Worker {
    queue: String,
    delay: Duration,
    faults: Arc<Faults>,
    recorder: Option<Arc<Mutex<Vec<BatchRecord>>>>,
}

impl Worker {
    fn run(self, batches: mpsc::Receiver<CpuBatch>) {
        for batch in batches {
            self.execute(batch);
        }
        tracing::trace!(queue = %self.queue, "cpu queue worker exiting");
    }

    fn execute(&self, batch: CpuBatch) {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if let Some(reason) = self.faults.lost_reason() {
            batch.completer.finish(Err(reason));
            return;
        }
        if self.faults.lose_during_next_batch.swap(false, Ordering::SeqCst) {
            let reason = format!(
                "lost while executing batch {} on `{}`",
                batch.sequence, self.queue
            );
            self.faults.mark_lost(reason.clone());
            batch.completer.finish(Err(reason));
            return;
        }

        let started = Instant::now();
        let input_a = batch.storages[0].bytes.lock().clone();
        let input_b = batch.storages[1].bytes.lock().clone();
        let faulted = {
            let mut result = batch.storages[2].bytes.lock();
            let func = batch.kernel.func;
            let geometry = batch.geometry;
            catch_unwind(AssertUnwindSafe(|| {
                let mut invocation = Invocation::new(
                    batch.element,
                    batch.element_count,
                    &input_a,
                    &input_b,
                    &mut result[..],
                );
                for group in 0..geometry.groups as usize {
                    for local in 0..geometry.group_size as usize {
                        invocation.global_id = group * geometry.group_size as usize + local;
                        func(&mut invocation);
                    }
                }
            }))
            .is_err()
        };
        let finished = Instant::now();

        if faulted {
            let reason = format!(
                "kernel `{}` faulted in batch {}",
                batch.kernel.name, batch.sequence
            );
            self.faults.mark_lost(reason.clone());
            batch.completer.finish(Err(reason));
            return;
        }

        if let Some(recorder) = &self.recorder {
            let used = batch.element_count * batch.element.size_bytes();
            recorder.lock().push(BatchRecord {
                sequence: batch.sequence,
                queue: self.queue.clone(),
                kernel: batch.kernel.name.clone(),
                element: batch.element,
                geometry: batch.geometry,
                element_count: batch.element_count,
                input_a: input_a[..used.min(input_a.len())].to_vec(),
                input_b: input_b[..used.min(input_b.len())].to_vec(),
                started,
                finished,
            });
        }
        tracing::trace!(
            queue = %self.queue,
            sequence = batch.sequence,
            elapsed = ?(finished - started),
            "batch done"
        );
        batch.completer.finish(Ok(()));
    }
}

enum Completion {
    Pending,
    Done,
    Lost(String),
}

struct SignalShared {
    state: Mutex<Completion>,
    ready: Condvar,
}

pub struct CpuSignal {
    shared: Arc<SignalShared>,
}

impl CpuSignal {
    fn outcome(state: &Completion) -> Result<bool, ComputeError> {
        match state {
            Completion::Pending => Ok(false),
            Completion::Done => Ok(true),
            Completion::Lost(reason) => Err(ComputeError::DeviceLost(reason.clone())),
        }
    }
}

impl CompletionSignal for CpuSignal {
    fn wait(&self) -> Result<(), ComputeError> {
        let mut state = self.shared.state.lock();
        while matches!(*state, Completion::Pending) {
            self.shared.ready.wait(&mut state);
        }
        Self::outcome(&state).map(|_| ())
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool, ComputeError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while matches!(*state, Completion::Pending) {
            if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Self::outcome(&state)
    }

    fn is_complete(&self) -> bool {
        !matches!(*self.shared.state.lock(), Completion::Pending)
    }
}

/// Worker half of a [`CpuSignal`]. A batch dropped without finishing fails
/// its signal.
struct Completer {
    shared: Arc<SignalShared>,
}

impl Completer {
    fn pair() -> (Self, CpuSignal) {
        let shared = Arc::new(SignalShared {
            state: Mutex::new(Completion::Pending),
            ready: Condvar::new(),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            CpuSignal { shared },
        )
    }

    fn finish(&self, outcome: Result<(), String>) {
        let mut state = self.shared.state.lock();
        if matches!(*state, Completion::Pending) {
            *state = match outcome {
                Ok(()) => Completion::Done,
                Err(reason) => Completion::Lost(reason),
            };
            self.shared.ready.notify_all();
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        self.finish(Err("batch dropped before it completed".into()));
    }
}

impl ComputeDevice for CpuDevice {
    type Buffer = CpuBuffer;
    type Program = CpuProgram;
    type Queue = CpuQueue;
    type Signal = CpuSignal;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, label: &str, size_bytes: u64) -> Result<CpuBuffer, ComputeError> {
        let allocation = |reason: String| ComputeError::Allocation {
            label: label.to_string(),
            requested: size_bytes,
            reason,
        };
        if let Some(reason) = self.faults.lost_reason() {
            return Err(allocation(format!("device lost: {reason}")));
        }
        if size_bytes > self.info.max_buffer_bytes {
            return Err(allocation(format!(
                "exceeds the device limit of {} bytes",
                self.info.max_buffer_bytes
            )));
        }
        let len = usize::try_from(size_bytes)
            .map_err(|_| allocation("does not fit the host address space".into()))?;
        let total = len
            .checked_add(self.guard_bytes)
            .ok_or_else(|| allocation("guard padding overflows".into()))?;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(total)
            .map_err(|err| allocation(err.to_string()))?;
        bytes.resize(len, 0);
        bytes.resize(total, GUARD_BYTE);

        let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(label, id, size_bytes, "cpu buffer allocated");
        Ok(CpuBuffer {
            id,
            storage: Arc::new(CpuStorage {
                bytes: Mutex::new(bytes),
                len,
            }),
        })
    }

    // Host memory stays reachable after the device is lost; only
    // submissions are refused.
    fn write_buffer(
        &self,
        buffer: &CpuBuffer,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), ComputeError> {
        let range = byte_range(buffer, offset, bytes.len())?;
        buffer.storage.bytes.lock()[range].copy_from_slice(bytes);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &CpuBuffer,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, ComputeError> {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        let range = byte_range(buffer, offset, len)?;
        Ok(buffer.storage.bytes.lock()[range].to_vec())
    }

    fn load_program(&self, name: &str, element: ElementType) -> Result<CpuProgram, ComputeError> {
        let kernel = self.kernels.get(name).ok_or_else(|| ComputeError::Compilation {
            name: name.to_string(),
            reason: format!("no kernel named `{name}` in the cpu library"),
        })?;
        Ok(CpuProgram {
            kernel: kernel.clone(),
            element,
        })
    }

    fn program_bindings(&self, program: &CpuProgram) -> Vec<BindingDecl> {
        program.kernel.declared_bindings(program.element)
    }

    fn max_group_size(&self, _program: &CpuProgram) -> u32 {
        self.info.max_group_size
    }

    fn prepare_program(&self, _program: &CpuProgram, _group_size: u32) -> Result<(), ComputeError> {
        Ok(())
    }

    fn create_queue(&self, label: &str) -> Result<CpuQueue, ComputeError> {
        let (sender, receiver) = mpsc::channel();
        let worker = Worker {
            queue: label.to_string(),
            delay: self.completion_delay,
            faults: Arc::clone(&self.faults),
            recorder: self.recorder.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("cpu-queue-{label}"))
            .spawn(move || worker.run(receiver))
            .map_err(|err| {
                tracing::error!(%err, "failed to spawn cpu queue worker");
                ComputeError::BackendUnavailable
            })?;
        Ok(CpuQueue {
            sender: Some(sender),
            worker: Some(handle),
            next_sequence: 1,
        })
    }

    fn submit(
        &self,
        queue: &mut CpuQueue,
        command: DispatchCommand<'_, Self>,
    ) -> Result<CpuSignal, ComputeError> {
        if self.faults.reject_submissions.load(Ordering::SeqCst) {
            return Err(ComputeError::Submission("device is refusing new batches".into()));
        }
        if let Some(reason) = self.faults.lost_reason() {
            return Err(ComputeError::Submission(format!("device lost: {reason}")));
        }
        let [a, b, result] = command.bindings;
        if Arc::ptr_eq(&a.storage, &result.storage)
            || Arc::ptr_eq(&b.storage, &result.storage)
            || Arc::ptr_eq(&a.storage, &b.storage)
        {
            return Err(ComputeError::Submission("bound buffers alias each other".into()));
        }
        let Some(sender) = &queue.sender else {
            return Err(ComputeError::Submission("queue is closed".into()));
        };

        let (completer, signal) = Completer::pair();
        let batch = CpuBatch {
            sequence: queue.next_sequence,
            kernel: command.program.kernel.clone(),
            element: command.program.element,
            storages: [Arc::clone(&a.storage), Arc::clone(&b.storage), Arc::clone(&result.storage)],
            element_count: command.element_count,
            geometry: command.geometry,
            completer,
        };
        sender
            .send(batch)
            .map_err(|_| ComputeError::Submission("queue worker has exited".into()))?;
        queue.next_sequence += 1;
        Ok(signal)
    }
}

fn byte_range(
    buffer: &CpuBuffer,
    offset: u64,
    len: usize,
) -> Result<std::ops::Range<usize>, ComputeError> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX);
    match start.checked_add(len) {
        Some(end) if end <= buffer.storage.len => Ok(start..end),
        end => Err(ComputeError::OutOfBounds {
            label: format!("cpu buffer {}", buffer.id),
            start,
            end: end.unwrap_or(usize::MAX),
            len: buffer.storage.len,
        }),
    }
}
