//! GPU context lifecycle and program management.
//!
//! [`GpuContext`] owns the wgpu device/queue and the two compiled
//! conversion pipelines. It is created lazily by the accelerator on first
//! use, lives until the accelerator is dropped, and is bound to the thread
//! that created it: the context is not designed for concurrent use, so a
//! cross-thread call fails with [`ConvertError::ContextBind`] instead of
//! racing the queue.

use std::ffi::CStr;
use std::thread::ThreadId;

use bytemuck::Zeroable;
use wgpu::util::DeviceExt;

use crate::convert::Direction;
use crate::error::ConvertError;
use crate::shaders::{self, ConvertParams};

const KHR_EXTERNAL_MEMORY_FD: &CStr = c"VK_KHR_external_memory_fd";
const EXT_EXTERNAL_MEMORY_DMA_BUF: &CStr = c"VK_EXT_external_memory_dma_buf";

pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_layout: wgpu::BindGroupLayout,
    nv12_to_rgb8: wgpu::ComputePipeline,
    rgb8_to_nv12: wgpu::ComputePipeline,
    params_buffer: wgpu::Buffer,
    adapter_name: String,
    owner: ThreadId,
}

impl GpuContext {
    /// Opens the Vulkan device and compiles both conversion programs.
    ///
    /// Fails with [`ConvertError::ContextInit`] if no adapter is found,
    /// the device cannot be created, the dma-buf import extensions are
    /// missing, or a shader fails to compile (the compiler diagnostic is
    /// included in the error).
    pub fn new() -> Result<Self, ConvertError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| ConvertError::ContextInit {
            detail: "no Vulkan adapter found".into(),
        })?;

        let adapter_name = adapter.get_info().name;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("dmaconv"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| ConvertError::ContextInit {
            detail: format!("device creation failed: {e}"),
        })?;

        if !dmabuf_import_supported(&device) {
            return Err(ConvertError::ContextInit {
                detail: format!(
                    "{} / {} not enabled on this device",
                    KHR_EXTERNAL_MEMORY_FD.to_string_lossy(),
                    EXT_EXTERNAL_MEMORY_DMA_BUF.to_string_lossy()
                ),
            });
        }

        tracing::info!(adapter = %adapter_name, "creating conversion pipelines");

        // Capture shader/pipeline diagnostics instead of panicking on the
        // uncaptured-error handler.
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("convert_bind_layout"),
            entries: &[
                // Params uniform
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Source image bytes
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Destination image bytes
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("convert_pipeline_layout"),
            bind_group_layouts: &[&bind_layout],
            push_constant_ranges: &[],
        });

        let nv12_to_rgb8 = create_pipeline(
            &device,
            &pipeline_layout,
            "nv12_to_rgb8",
            shaders::SHADER_NV12_TO_RGB8,
        );
        let rgb8_to_nv12 = create_pipeline(
            &device,
            &pipeline_layout,
            "rgb8_to_nv12",
            shaders::SHADER_RGB8_TO_NV12,
        );

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(ConvertError::ContextInit {
                detail: format!("pipeline compilation failed: {err}"),
            });
        }

        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("convert_params"),
            contents: bytemuck::bytes_of(&ConvertParams::zeroed()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        Ok(Self {
            device,
            queue,
            bind_layout,
            nv12_to_rgb8,
            rgb8_to_nv12,
            params_buffer,
            adapter_name,
            owner: std::thread::current().id(),
        })
    }

    /// Asserts that the calling thread is the one the context belongs to.
    pub fn make_current(&self) -> Result<(), ConvertError> {
        if std::thread::current().id() != self.owner {
            return Err(ConvertError::ContextBind);
        }
        Ok(())
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn bind_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_layout
    }

    pub fn params_buffer(&self) -> &wgpu::Buffer {
        &self.params_buffer
    }

    pub fn pipeline(&self, direction: Direction) -> &wgpu::ComputePipeline {
        match direction {
            Direction::Nv12ToRgb8 => &self.nv12_to_rgb8,
            Direction::Rgb8ToNv12 => &self.rgb8_to_nv12,
        }
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::PipelineLayout,
    label: &str,
    source: &str,
) -> wgpu::ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        module: &module,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}

/// Whether wgpu's Vulkan device came up with the extensions the dma-buf
/// bridge needs. wgpu enables them when the driver offers them; on
/// drivers that don't, imports can never work and the context refuses to
/// initialize.
fn dmabuf_import_supported(device: &wgpu::Device) -> bool {
    unsafe {
        device.as_hal::<wgpu::hal::api::Vulkan, _, bool>(|hal_device| {
            hal_device
                .map(|d| {
                    let extensions = d.enabled_device_extensions();
                    extensions.contains(&KHR_EXTERNAL_MEMORY_FD)
                        && extensions.contains(&EXT_EXTERNAL_MEMORY_DMA_BUF)
                })
                .unwrap_or(false)
        })
        .unwrap_or(false)
    }
}
