//! dma-buf import bridge.
//!
//! Wraps a dma-buf file descriptor as a wgpu storage buffer without
//! copying: the fd is dup'd, imported as `VkDeviceMemory` through
//! `VK_EXT_external_memory_dma_buf`, bound to a fresh `VkBuffer`, and the
//! result is handed to wgpu through its Vulkan HAL. The caller's fd stays
//! owned by the caller; the dup'd one is consumed by Vulkan on success
//! and closed here on any failure before that point.

use ash::vk;

use crate::buffer::{fd_byte_size, BufferDescriptor};
use crate::context::GpuContext;
use crate::error::ConvertError;

/// A dma-buf mapped into the GPU address space for the duration of a
/// conversion.
///
/// Must be released with [`ImportedBuffer::release`] once the work that
/// references it has completed. Dropping without releasing still frees
/// the Vulkan memory, but without waiting for the device, and is logged
/// as a bug.
pub struct ImportedBuffer {
    descriptor: BufferDescriptor,
    buffer: Option<wgpu::Buffer>,
    memory: vk::DeviceMemory,
    raw_device: ash::Device,
    released: bool,
}

/// Imports the buffer the conversion reads from.
pub fn import_readable(
    ctx: &GpuContext,
    desc: &BufferDescriptor,
) -> Result<ImportedBuffer, ConvertError> {
    import(ctx, desc, "src")
}

/// Imports the buffer the conversion writes to.
pub fn import_writable(
    ctx: &GpuContext,
    desc: &BufferDescriptor,
) -> Result<ImportedBuffer, ConvertError> {
    import(ctx, desc, "dst")
}

fn import(
    ctx: &GpuContext,
    desc: &BufferDescriptor,
    role: &str,
) -> Result<ImportedBuffer, ConvertError> {
    desc.validate()?;

    // The fd may have been closed or swapped since the descriptor was
    // built; re-check it just before handing it to the driver.
    let actual_size = fd_byte_size(desc.fd)?;
    if actual_size < desc.required_bytes() {
        return Err(ConvertError::Import {
            detail: format!(
                "{role} dma-buf holds {actual_size} bytes, {} required",
                desc.required_bytes()
            ),
        });
    }

    // Vulkan takes ownership of the fd it imports, so give it a private
    // duplicate and leave the caller's untouched.
    let dup_fd = unsafe { libc::dup(desc.fd) };
    if dup_fd < 0 {
        return Err(ConvertError::Import {
            detail: format!(
                "dup({}) failed: {}",
                desc.fd,
                std::io::Error::last_os_error()
            ),
        });
    }

    let import_result = unsafe {
        ctx.device().as_hal::<wgpu::hal::api::Vulkan, _, _>(|hal_device| match hal_device {
            // SAFETY: dup_fd is a freshly dup'd fd owned by this call, and
            // the raw handles only live within the closure.
            Some(hal_device) => unsafe { import_vulkan(hal_device, dup_fd, actual_size) },
            None => {
                // SAFETY: dup_fd came from dup() above and is unused elsewhere.
                unsafe { libc::close(dup_fd) };
                Err(ConvertError::Import {
                    detail: "device is not backed by Vulkan".into(),
                })
            }
        })
    }
    .unwrap_or_else(|| {
        // SAFETY: dup_fd came from dup() above and is unused elsewhere.
        unsafe { libc::close(dup_fd) };
        Err(ConvertError::Import {
            detail: "device is not backed by Vulkan".into(),
        })
    });
    let (hal_buffer, memory, raw_device) = import_result?;

    let buffer = unsafe {
        ctx.device().create_buffer_from_hal::<wgpu::hal::api::Vulkan>(
            hal_buffer,
            &wgpu::BufferDescriptor {
                label: Some(role),
                size: actual_size,
                usage: wgpu::BufferUsages::STORAGE,
                mapped_at_creation: false,
            },
        )
    };

    tracing::debug!(
        fd = desc.fd,
        bytes = actual_size,
        role,
        "imported dma-buf as storage buffer"
    );

    Ok(ImportedBuffer {
        descriptor: *desc,
        buffer: Some(buffer),
        memory,
        raw_device,
        released: false,
    })
}

impl ImportedBuffer {
    pub fn buffer(&self) -> &wgpu::Buffer {
        // Invariant: `buffer` is only None after release(), which consumes self.
        self.buffer.as_ref().unwrap()
    }

    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// Detaches the dma-buf from the GPU.
    ///
    /// Destroys the wgpu buffer (and with it the `VkBuffer`), waits for
    /// the device to go idle so no in-flight work still references the
    /// memory, then frees the imported allocation. The caller's fd and
    /// the dma-buf contents are unaffected.
    pub fn release(mut self, device: &wgpu::Device) {
        drop(self.buffer.take());
        let _ = device.poll(wgpu::Maintain::Wait);
        unsafe {
            self.raw_device.free_memory(self.memory, None);
        }
        self.released = true;
    }
}

impl Drop for ImportedBuffer {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                fd = self.descriptor.fd,
                "imported dma-buf dropped without release(); freeing memory without a device wait"
            );
            drop(self.buffer.take());
            unsafe {
                self.raw_device.free_memory(self.memory, None);
            }
        }
    }
}

/// Binds `dup_fd` to a fresh `VkBuffer` as imported external memory.
///
/// On success the fd belongs to the allocation and must not be closed; on
/// every failure path the fd and any resource created up to that point are
/// cleaned up here.
unsafe fn import_vulkan(
    hal_device: &wgpu::hal::vulkan::Device,
    dup_fd: i32,
    size: u64,
) -> Result<(wgpu::hal::vulkan::Buffer, vk::DeviceMemory, ash::Device), ConvertError> {
    let raw_device = hal_device.raw_device();
    let physical_device = hal_device.raw_physical_device();
    let instance = hal_device.shared_instance().raw_instance();

    let mut external_info = vk::ExternalMemoryBufferCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::STORAGE_BUFFER)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .push_next(&mut external_info);

    let vk_buffer = raw_device.create_buffer(&buffer_info, None).map_err(|e| {
        libc::close(dup_fd);
        ConvertError::Import {
            detail: format!("vkCreateBuffer failed: {e:?}"),
        }
    })?;

    let requirements = raw_device.get_buffer_memory_requirements(vk_buffer);

    let memory_type_index = find_memory_type_index(
        instance,
        physical_device,
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .or_else(|| {
        find_memory_type_index(
            instance,
            physical_device,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::empty(),
        )
    })
    .ok_or_else(|| {
        raw_device.destroy_buffer(vk_buffer, None);
        libc::close(dup_fd);
        ConvertError::Import {
            detail: "no compatible memory type for dma-buf import".into(),
        }
    })?;

    let mut import_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        .fd(dup_fd);
    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().buffer(vk_buffer);
    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index)
        .push_next(&mut import_info)
        .push_next(&mut dedicated_info);

    let memory = raw_device
        .allocate_memory(&allocate_info, None)
        .map_err(|e| {
            raw_device.destroy_buffer(vk_buffer, None);
            libc::close(dup_fd);
            ConvertError::Import {
                detail: format!("vkAllocateMemory (dma-buf import) failed: {e:?}"),
            }
        })?;

    raw_device
        .bind_buffer_memory(vk_buffer, memory, 0)
        .map_err(|e| {
            raw_device.free_memory(memory, None);
            raw_device.destroy_buffer(vk_buffer, None);
            ConvertError::Import {
                detail: format!("vkBindBufferMemory failed: {e:?}"),
            }
        })?;

    let hal_buffer = wgpu::hal::vulkan::Device::buffer_from_raw(vk_buffer);
    Ok((hal_buffer, memory, raw_device.clone()))
}

fn find_memory_type_index(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let properties =
        unsafe { instance.get_physical_device_memory_properties(physical_device) };
    (0..properties.memory_type_count).find(|&i| {
        let supported = type_bits & (1 << i) != 0;
        let flags = properties
            .memory_types
            .get(i as usize)
            .map(|t| t.property_flags)
            .unwrap_or_default();
        supported && flags.contains(required)
    })
}
