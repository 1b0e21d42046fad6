// SPDX-License-Identifier: CEPL-1.0
//! Resource allocator: one device-memory allocation per buffer/image, no
//! sub-allocation. Fine for a handful of objects; a real scene would want a
//! pooling allocator.

use anyhow::{ensure, Context, Result};
use ash::vk;
use bytemuck::Pod;
use prism_render::TextureData;
use std::ptr::NonNull;

use crate::context::DeviceContext;
use crate::error::{FatalError, Unwind};

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// First (lowest) index allowed by `type_bits` whose flags contain `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32))
        .find(|&i| {
            type_bits & (1 << i) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or_else(|| {
            FatalError::NoMemoryType {
                type_bits,
                required,
            }
            .into()
        })
}

unsafe fn allocate(
    ctx: &DeviceContext,
    req: vk::MemoryRequirements,
    props: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let mem_type = find_memory_type(&ctx.memory_props, req.memory_type_bits, props)?;
    let mai = vk::MemoryAllocateInfo {
        s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
        allocation_size: req.size,
        memory_type_index: mem_type,
        ..Default::default()
    };
    Ok(ctx
        .device
        .allocate_memory(&mai, None)
        .context("allocate_memory")?)
}

pub struct Buffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
}

impl Buffer {
    pub unsafe fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let d = &ctx.device;
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = d.create_buffer(&bci, None).context("create_buffer")?;
        let req = d.get_buffer_memory_requirements(buffer);
        let memory = match allocate(ctx, req, props) {
            Ok(m) => m,
            Err(e) => {
                d.destroy_buffer(buffer, None);
                return Err(e);
            }
        };
        if let Err(e) = d.bind_buffer_memory(buffer, memory, 0) {
            d.destroy_buffer(buffer, None);
            d.free_memory(memory, None);
            return Err(e).context("bind_buffer_memory");
        }
        Ok(Self {
            buffer,
            memory,
            size,
            mapped: None,
        })
    }

    /// Host-visible + coherent, mapped for its whole lifetime. Writes become
    /// visible to the device without flushes.
    pub unsafe fn new_mapped(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let mut buf = Self::new(
            ctx,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let ptr = match ctx
            .device
            .map_memory(buf.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        {
            Ok(ptr) => ptr,
            Err(e) => {
                buf.destroy(&ctx.device);
                return Err(e).context("map_memory");
            }
        };
        buf.mapped = NonNull::new(ptr.cast::<u8>());
        Ok(buf)
    }

    /// Device-local buffer filled through a staging copy.
    pub unsafe fn device_local_with<T: Pod>(
        ctx: &DeviceContext,
        pool: vk::CommandPool,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;
        let mut dst = Self::new(
            ctx,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        let mut staging = match Self::new_mapped(ctx, size, vk::BufferUsageFlags::TRANSFER_SRC) {
            Ok(b) => b,
            Err(e) => {
                dst.destroy(&ctx.device);
                return Err(e);
            }
        };
        if let Err(e) = staging.write(bytes) {
            staging.destroy(&ctx.device);
            dst.destroy(&ctx.device);
            return Err(e);
        }

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        let copied = one_time_submit(ctx, pool, |cmd| {
            ctx.device
                .cmd_copy_buffer(cmd, staging.buffer, dst.buffer, std::slice::from_ref(&region));
        });
        // one_time_submit waits on its fence, so the copy is done either way
        staging.destroy(&ctx.device);
        if let Err(e) = copied {
            dst.destroy(&ctx.device);
            return Err(e);
        }
        Ok(dst)
    }

    pub unsafe fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let dst = self
            .mapped
            .context("write to a buffer that is not host-mapped")?;
        ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "write of {} bytes into {}-byte buffer",
            bytes.len(),
            self.size
        );
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
        Ok(())
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.mapped.take().is_some() {
            device.unmap_memory(self.memory);
        }
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// Records `record` into a throwaway command buffer, submits it and blocks
/// on a fence until the GPU has finished it.
pub unsafe fn one_time_submit(
    ctx: &DeviceContext,
    pool: vk::CommandPool,
    record: impl FnOnce(vk::CommandBuffer),
) -> Result<()> {
    let d = &ctx.device;
    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = d
        .allocate_command_buffers(&ai)
        .context("allocate_command_buffers(one-time)")?[0];
    let fence = match d.create_fence(&vk::FenceCreateInfo::default(), None) {
        Ok(f) => f,
        Err(e) => {
            d.free_command_buffers(pool, &[cmd]);
            return Err(e).context("create_fence(one-time)");
        }
    };

    let result = (|| -> Result<()> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        d.begin_command_buffer(cmd, &bi)
            .context("begin_command_buffer(one-time)")?;
        record(cmd);
        d.end_command_buffer(cmd)
            .context("end_command_buffer(one-time)")?;

        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            ..Default::default()
        };
        d.queue_submit(ctx.queue, std::slice::from_ref(&si), fence)
            .context("queue_submit(one-time)")?;
        d.wait_for_fences(&[fence], true, u64::MAX)
            .context("wait_for_fences(one-time)")?;
        Ok(())
    })();

    if result.is_err() {
        // the submit may have happened; never free under a running copy
        d.device_wait_idle().ok();
    }
    d.destroy_fence(fence, None);
    d.free_command_buffers(pool, &[cmd]);
    result
}

/// Sampled RGBA8 image with its view and sampler.
pub struct Texture {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub extent: vk::Extent2D,
}

unsafe fn layout_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    (old_layout, new_layout): (vk::ImageLayout, vk::ImageLayout),
    (src_access_mask, dst_access_mask): (vk::AccessFlags, vk::AccessFlags),
    (src_stage, dst_stage): (vk::PipelineStageFlags, vk::PipelineStageFlags),
) {
    let barrier = vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask,
        dst_access_mask,
        old_layout,
        new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: color_subresource(),
        ..Default::default()
    };
    device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        std::slice::from_ref(&barrier),
    );
}

pub fn color_subresource() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl Texture {
    pub unsafe fn upload(
        ctx: &DeviceContext,
        pool: vk::CommandPool,
        data: &TextureData,
    ) -> Result<Self> {
        let d = &ctx.device;
        let extent = vk::Extent2D {
            width: data.width,
            height: data.height,
        };

        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: TEXTURE_FORMAT,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let mut unwind = Unwind::new();
        let image = d.create_image(&img_ci, None).context("create_image(texture)")?;
        unwind.push(move || d.destroy_image(image, None));
        let memory = allocate(
            ctx,
            d.get_image_memory_requirements(image),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        unwind.push(move || d.free_memory(memory, None));
        d.bind_image_memory(image, memory, 0)
            .context("bind_image_memory(texture)")?;

        let mut staging = Buffer::new_mapped(
            ctx,
            data.byte_len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        if let Err(e) = staging.write(&data.rgba) {
            staging.destroy(d);
            return Err(e);
        }

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: img_ci.extent,
        };
        let copied = one_time_submit(ctx, pool, |cmd| {
            layout_barrier(
                d,
                cmd,
                image,
                (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE),
                (vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::TRANSFER),
            );
            d.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );
            layout_barrier(
                d,
                cmd,
                image,
                (
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ),
                (vk::AccessFlags::TRANSFER_WRITE, vk::AccessFlags::SHADER_READ),
                (
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                ),
            );
        });
        staging.destroy(d);
        copied?;

        let view_ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: TEXTURE_FORMAT,
            subresource_range: color_subresource(),
            ..Default::default()
        };
        let view = d
            .create_image_view(&view_ci, None)
            .context("create_image_view(texture)")?;
        unwind.push(move || d.destroy_image_view(view, None));

        let sampler_ci = vk::SamplerCreateInfo {
            s_type: vk::StructureType::SAMPLER_CREATE_INFO,
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            anisotropy_enable: vk::FALSE,
            max_anisotropy: 1.0,
            border_color: vk::BorderColor::INT_OPAQUE_BLACK,
            compare_op: vk::CompareOp::ALWAYS,
            ..Default::default()
        };
        let sampler = d
            .create_sampler(&sampler_ci, None)
            .context("create_sampler")?;
        unwind.disarm();

        Ok(Self {
            image,
            memory,
            view,
            sampler,
            extent,
        })
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_sampler(self.sampler, None);
        device.destroy_image_view(self.view, None);
        device.destroy_image(self.image, None);
        device.free_memory(self.memory, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props_with(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    fn sample_props() -> vk::PhysicalDeviceMemoryProperties {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props_with(&[local, local, host, local, host])
    }

    #[test]
    fn test_find_memory_type_first_match_in_allowed_bits() {
        let props = sample_props();
        let idx = find_memory_type(&props, 0b0110, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn test_find_memory_type_ascending_order() {
        let props = sample_props();
        let idx =
            find_memory_type(&props, 0b1_0100, vk::MemoryPropertyFlags::HOST_COHERENT).unwrap();
        assert_eq!(idx, 2);
        let idx =
            find_memory_type(&props, 0b1_0000, vk::MemoryPropertyFlags::HOST_COHERENT).unwrap();
        assert_eq!(idx, 4);
    }

    #[test]
    fn test_find_memory_type_requires_superset() {
        let props = sample_props();
        let want = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let err = find_memory_type(&props, 0b1_1111, want).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FatalError>(),
            Some(FatalError::NoMemoryType { type_bits: 0b1_1111, .. })
        ));
    }

    #[test]
    fn test_find_memory_type_ignores_bits_past_count() {
        let props = sample_props();
        let err = find_memory_type(&props, 1 << 7, vk::MemoryPropertyFlags::empty());
        assert!(err.is_err());
    }
}
