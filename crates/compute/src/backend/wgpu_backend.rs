//! [`ComputeDevice`] on top of `wgpu`.
//!
//! Kernels are WGSL templates rendered per element type and group size,
//! validated with naga before the driver sees them, and cached per group
//! size. wgpu exposes a single hardware queue per device, so every
//! [`WgpuQueue`] feeds the same timeline and FIFO order holds across them.
//! Storage buffers are device local; host access goes through
//! `Queue::write_buffer` and a mapped staging copy.

use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::device::{CompletionSignal, ComputeDevice, DeviceInfo, DispatchCommand};
use crate::kernels::{add_op, wgsl};
use crate::layout::{self, Access, BindingDecl};
use crate::{ComputeError, ElementType};

/// Renders WGSL for an element type and a group size.
pub type KernelTemplate = Arc<dyn Fn(ElementType, u32) -> String + Send + Sync>;

type LostFlag = Arc<Mutex<Option<String>>>;

pub struct WgpuDevice {
    info: DeviceInfo,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    lost: LostFlag,
    kernels: HashMap<String, KernelTemplate>,
}

impl WgpuDevice {
    /// Opens the system's default high-performance adapter.
    ///
    /// # Errors
    ///
    /// [`ComputeError::BackendUnavailable`] if no adapter or device can be acquired.
    pub fn try_new() -> Result<Self, ComputeError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or_else(|| {
            tracing::warn!("no wgpu adapter available");
            ComputeError::BackendUnavailable
        })?;
        Self::from_adapter(&adapter)
    }

    /// Opens the adapter at `index` in [`Self::adapter_names`] order.
    ///
    /// # Errors
    ///
    /// [`ComputeError::BackendUnavailable`] if there is no such adapter or it
    /// refuses to create a device.
    pub fn with_adapter(index: usize) -> Result<Self, ComputeError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .nth(index)
            .ok_or_else(|| {
                tracing::warn!(index, "no wgpu adapter at index");
                ComputeError::BackendUnavailable
            })?;
        Self::from_adapter(&adapter)
    }

    #[must_use]
    pub fn adapter_names() -> Vec<String> {
        wgpu::Instance::default()
            .enumerate_adapters(wgpu::Backends::all())
            .iter()
            .map(|adapter| {
                let info = adapter.get_info();
                format!("{} ({:?})", info.name, info.backend)
            })
            .collect()
    }

    fn from_adapter(adapter: &wgpu::Adapter) -> Result<Self, ComputeError> {
        let adapter_info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("compute device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
            },
            None,
        ))
        .map_err(|err| {
            tracing::warn!(adapter = %adapter_info.name, %err, "failed to request device");
            ComputeError::BackendUnavailable
        })?;

        let limits = device.limits();
        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend),
            supports_compute: adapter
                .get_downlevel_capabilities()
                .flags
                .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
            shared_memory: true,
            max_buffer_bytes: limits
                .max_buffer_size
                .min(u64::from(limits.max_storage_buffer_binding_size)),
            max_group_size: limits
                .max_compute_invocations_per_workgroup
                .min(limits.max_compute_workgroup_size_x),
            max_groups_per_dimension: limits.max_compute_workgroups_per_dimension,
        };

        let lost: LostFlag = Arc::default();
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            tracing::error!(?reason, %message, "wgpu device lost");
            *flag.lock() = Some(format!("{reason:?}: {message}"));
        });

        tracing::info!(adapter = %info.name, backend = %info.backend, "wgpu device ready");

        let mut kernels: HashMap<String, KernelTemplate> = HashMap::new();
        kernels.insert(add_op::NAME.to_string(), Arc::new(add_op::wgsl_source));
        Ok(Self {
            info,
            device: Arc::new(device),
            queue: Arc::new(queue),
            lost,
            kernels,
        })
    }

    /// Adds a WGSL kernel to the library, replacing any kernel of that name.
    pub fn register_kernel(&mut self, name: impl Into<String>, template: KernelTemplate) {
        self.kernels.insert(name.into(), template);
    }

    fn lost_reason(&self) -> Option<String> {
        self.lost.lock().clone()
    }

    fn pop_error(&self) -> Option<wgpu::Error> {
        pollster::block_on(self.device.pop_error_scope())
    }
}

impl std::fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("info", &self.info)
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

impl WgpuBuffer {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

pub struct WgpuProgram {
    name: String,
    element: ElementType,
    template: KernelTemplate,
    bindings: Vec<BindingDecl>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: Mutex<HashMap<u32, Arc<wgpu::ComputePipeline>>>,
}

impl std::fmt::Debug for WgpuProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuProgram")
            .field("name", &self.name)
            .field("element", &self.element)
            .field("prepared", &self.pipelines.lock().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// A named submission stream onto the device's single queue.
#[derive(Debug)]
pub struct WgpuQueue {
    label: String,
}

struct SignalState {
    done: Mutex<bool>,
    ready: Condvar,
}

pub struct WgpuSignal {
    device: Arc<wgpu::Device>,
    lost: LostFlag,
    state: Arc<SignalState>,
}

impl WgpuSignal {
    fn check(&self) -> Result<bool, ComputeError> {
        if *self.state.done.lock() {
            return Ok(true);
        }
        match self.lost.lock().clone() {
            Some(reason) => Err(ComputeError::DeviceLost(reason)),
            None => Ok(false),
        }
    }
}

impl CompletionSignal for WgpuSignal {
    fn wait(&self) -> Result<(), ComputeError> {
        if self.check()? {
            return Ok(());
        }
        self.device.poll(wgpu::Maintain::Wait);
        if self.check()? {
            Ok(())
        } else {
            Err(ComputeError::DeviceLost("device idle but batch never completed".into()))
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool, ComputeError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.device.poll(wgpu::Maintain::Poll);
            if self.check()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let mut done = self.state.done.lock();
            if !*done {
                let slice = (deadline - now).min(Duration::from_millis(1));
                self.state.ready.wait_for(&mut done, slice);
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.device.poll(wgpu::Maintain::Poll);
        *self.state.done.lock()
    }
}

impl ComputeDevice for WgpuDevice {
    type Buffer = WgpuBuffer;
    type Program = WgpuProgram;
    type Queue = WgpuQueue;
    type Signal = WgpuSignal;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&self, label: &str, size_bytes: u64) -> Result<WgpuBuffer, ComputeError> {
        let allocation = |reason: String| ComputeError::Allocation {
            label: label.to_string(),
            requested: size_bytes,
            reason,
        };
        if let Some(reason) = self.lost_reason() {
            return Err(allocation(format!("device lost: {reason}")));
        }
        if size_bytes > self.info.max_buffer_bytes {
            return Err(allocation(format!(
                "exceeds the device limit of {} bytes",
                self.info.max_buffer_bytes
            )));
        }
        let padded = storage_size(size_bytes);

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = self.pop_error() {
            return Err(allocation(err.to_string()));
        }
        Ok(WgpuBuffer {
            buffer,
            size: size_bytes,
        })
    }

    fn write_buffer(
        &self,
        buffer: &WgpuBuffer,
        offset: u64,
        bytes: &[u8],
    ) -> Result<(), ComputeError> {
        if let Some(reason) = self.lost_reason() {
            return Err(ComputeError::DeviceLost(reason));
        }
        if !bytes.is_empty() {
            self.queue.write_buffer(&buffer.buffer, offset, bytes);
        }
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: &WgpuBuffer,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, ComputeError> {
        if let Some(reason) = self.lost_reason() {
            return Err(ComputeError::DeviceLost(reason));
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: len,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(&buffer.buffer, offset, &staging, 0, len);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(ComputeError::DeviceLost(format!("readback failed: {err}"))),
            Err(_) => return Err(ComputeError::DeviceLost("readback never completed".into())),
        }
        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn load_program(&self, name: &str, element: ElementType) -> Result<WgpuProgram, ComputeError> {
        let template = self.kernels.get(name).cloned().ok_or_else(|| ComputeError::Compilation {
            name: name.to_string(),
            reason: format!("no kernel named `{name}` in the wgsl library"),
        })?;
        let shader = wgsl::validate(name, &template(element, 1))?;

        let entries: Vec<wgpu::BindGroupLayoutEntry> = layout::contract(element)
            .iter()
            .map(|decl| wgpu::BindGroupLayoutEntry {
                binding: decl.slot,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: decl.access == Access::ReadOnly,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(name),
                    entries: &entries,
                });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        Ok(WgpuProgram {
            name: name.to_string(),
            element,
            template,
            bindings: shader.bindings,
            bind_group_layout,
            pipeline_layout,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    fn program_bindings(&self, program: &WgpuProgram) -> Vec<BindingDecl> {
        program.bindings.clone()
    }

    fn max_group_size(&self, _program: &WgpuProgram) -> u32 {
        self.info.max_group_size
    }

    fn prepare_program(&self, program: &WgpuProgram, group_size: u32) -> Result<(), ComputeError> {
        if program.pipelines.lock().contains_key(&group_size) {
            return Ok(());
        }
        let compilation = |reason: String| ComputeError::Compilation {
            name: program.name.clone(),
            reason,
        };
        let source = (program.template)(program.element, group_size);
        let shader = wgsl::validate(&program.name, &source)?;
        if shader.workgroup_size != [group_size, 1, 1] {
            return Err(compilation(format!(
                "template rendered workgroup size {:?} for group size {group_size}",
                shader.workgroup_size
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.name.as_str()),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(program.name.as_str()),
            layout: Some(&program.pipeline_layout),
            module: &module,
            entry_point: wgsl::ENTRY_POINT,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        if let Some(err) = self.pop_error() {
            return Err(compilation(err.to_string()));
        }

        tracing::debug!(
            kernel = %program.name,
            element = %program.element,
            group_size,
            "pipeline built"
        );
        program.pipelines.lock().insert(group_size, Arc::new(pipeline));
        Ok(())
    }

    fn create_queue(&self, label: &str) -> Result<WgpuQueue, ComputeError> {
        Ok(WgpuQueue {
            label: label.to_string(),
        })
    }

    fn submit(
        &self,
        queue: &mut WgpuQueue,
        command: DispatchCommand<'_, Self>,
    ) -> Result<WgpuSignal, ComputeError> {
        if let Some(reason) = self.lost_reason() {
            return Err(ComputeError::Submission(format!("device lost: {reason}")));
        }
        let program = command.program;
        let pipeline = program
            .pipelines
            .lock()
            .get(&command.geometry.group_size)
            .cloned()
            .ok_or_else(|| {
                ComputeError::Submission(format!(
                    "`{}` was not prepared for group size {}",
                    program.name, command.geometry.group_size
                ))
            })?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let entries: Vec<wgpu::BindGroupEntry> = (0u32..)
            .zip(command.bindings)
            .map(|(slot, buffer)| wgpu::BindGroupEntry {
                binding: slot,
                resource: buffer.buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(queue.label.as_str()),
            layout: &program.bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(queue.label.as_str()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(program.name.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(command.geometry.groups, 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));

        let state = Arc::new(SignalState {
            done: Mutex::new(false),
            ready: Condvar::new(),
        });
        let completion = Arc::clone(&state);
        self.queue.on_submitted_work_done(move || {
            *completion.done.lock() = true;
            completion.ready.notify_all();
        });

        if let Some(err) = self.pop_error() {
            return Err(ComputeError::Submission(err.to_string()));
        }
        Ok(WgpuSignal {
            device: Arc::clone(&self.device),
            lost: Arc::clone(&self.lost),
            state,
        })
    }
}

/// Bytes reserved for a region of `size_bytes`. Zero-sized bindings are
/// invalid, so the size rounds up to the copy alignment; element sizes are
/// already aligned, which keeps `arrayLength` equal to N in the kernels.
fn storage_size(size_bytes: u64) -> u64 {
    size_bytes
        .max(wgpu::COPY_BUFFER_ALIGNMENT)
        .next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}
