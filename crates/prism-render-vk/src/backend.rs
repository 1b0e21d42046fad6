// SPDX-License-Identifier: CEPL-1.0
//! Vulkan implementation of [`FrameBackend`]: owns the device context and
//! every renderer-lifetime object; builds and drives [`Swapchain`]s.

use anyhow::{Context, Result};
use ash::vk;
use prism_math::{aspect_ratio, Transforms, Vec2};
use prism_render::{FrameInput, RecordMode, RenderSettings, RenderSize, TextureData};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info};

use crate::context::{DeviceContext, PresentPolicy};
use crate::error::Unwind;
use crate::frame::{Acquired, FrameBackend, Presented};
use crate::memory::{Buffer, Texture};
use crate::pipeline::{Bindings, PipelineInputs, ShaderBlob};
use crate::scene::{Batch, SceneGeometry};
use crate::swapchain::{ChainInputs, Swapchain};
use crate::sync::FrameSyncSet;

/// Device-local vertex + index buffers and the batches drawn from them.
pub struct SceneBuffers {
    pub vertex: Buffer,
    pub index: Buffer,
    pub batches: Vec<Batch>,
}

impl SceneBuffers {
    pub unsafe fn upload(
        ctx: &DeviceContext,
        pool: vk::CommandPool,
        geometry: &SceneGeometry,
    ) -> Result<Self> {
        let mut vertex = Buffer::device_local_with(
            ctx,
            pool,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &geometry.vertices,
        )?;
        let index = match Buffer::device_local_with(
            ctx,
            pool,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &geometry.indices,
        ) {
            Ok(b) => b,
            Err(e) => {
                vertex.destroy(&ctx.device);
                return Err(e);
            }
        };
        debug!(
            "scene: {} vertices, {} indices",
            geometry.vertices.len(),
            geometry.indices.len()
        );
        for (i, b) in geometry.batches.iter().enumerate() {
            debug!(
                "  batch {i} '{}': {} indices from {}{}",
                b.name,
                b.index_count,
                b.first_index,
                if b.textured { ", textured" } else { "" }
            );
        }
        Ok(Self {
            vertex,
            index,
            batches: geometry.batches.clone(),
        })
    }

    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.index.destroy(device);
        self.vertex.destroy(device);
    }
}

pub struct VkBackend {
    ctx: DeviceContext,
    command_pool: vk::CommandPool,
    sync: FrameSyncSet,
    inputs: PipelineInputs,
    scene: SceneBuffers,
    texture: Texture,

    clear_color: [f32; 4],
    acquire_timeout_ns: u64,
    record_mode: RecordMode,
    window_extent: vk::Extent2D,
    hidden_batches: u32,
}

impl VkBackend {
    /// STRICT ORDER: device context -> command pool -> sync -> pipeline
    /// inputs -> texture -> scene buffers. The swap chain comes later, from
    /// the frame loop. A failure part way destroys what was already created.
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: &RenderSettings,
        pixels: &TextureData,
    ) -> Result<Self> {
        let policy = PresentPolicy::new(settings.present, settings.strict_present_mode);
        let ctx = DeviceContext::new(window, display, policy)?;
        let d = &ctx.device;

        let command_pool;
        let mut sync;
        let inputs;
        let texture;
        let mut unwind = Unwind::new();
        unwind.push(|| ctx.destroy());

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: ctx.queue_family,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        command_pool = d
            .create_command_pool(&pool_info, None)
            .context("create_command_pool")?;
        unwind.push(move || d.destroy_command_pool(command_pool, None));

        sync = FrameSyncSet::new(d, settings.frames_in_flight())?;
        unwind.push(|| sync.destroy(d));

        let (vert, frag) = ShaderBlob::pair(settings.shader_dir.as_deref())?;
        inputs = PipelineInputs::new(d, Bindings::TRANSFORM | Bindings::TEXTURE, &vert, &frag)?;
        unwind.push(|| inputs.destroy(d));

        texture = Texture::upload(&ctx, command_pool, pixels)?;
        unwind.push(|| texture.destroy(d));

        let scene = SceneBuffers::upload(&ctx, command_pool, &SceneGeometry::demo())?;
        unwind.disarm();

        info!(
            "vk backend ready: {} frames in flight, record mode {:?}",
            sync.len(),
            settings.record_mode
        );

        Ok(Self {
            ctx,
            command_pool,
            sync,
            inputs,
            scene,
            texture,
            clear_color: settings.clear_color,
            acquire_timeout_ns: u64::try_from(settings.acquire_timeout.as_nanos()).unwrap_or(u64::MAX),
            record_mode: settings.record_mode,
            window_extent: vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            hidden_batches: 0,
        })
    }

    pub fn set_window_extent(&mut self, size: RenderSize) {
        self.window_extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }

    /// Batch mask baked into prerecorded command buffers at the next build.
    pub fn set_hidden_batches(&mut self, mask: u32) {
        self.hidden_batches = mask;
    }

    unsafe fn record_image(&self, chain: &Swapchain, image: usize, hidden_batches: u32) -> Result<()> {
        let d = &self.ctx.device;
        let img = &chain.images[image];
        let cmd = img.command_buffer;

        d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("reset_command_buffer")?;
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        d.begin_command_buffer(cmd, &begin)
            .context("begin_command_buffer")?;

        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        };
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: chain.render_pass,
            framebuffer: img.framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: chain.extent,
            },
            clear_value_count: 1,
            p_clear_values: &clear,
            ..Default::default()
        };
        d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
        d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, chain.pipeline);

        let offsets = [0_u64];
        d.cmd_bind_vertex_buffers(cmd, 0, std::slice::from_ref(&self.scene.vertex.buffer), &offsets);
        d.cmd_bind_index_buffer(cmd, self.scene.index.buffer, 0, vk::IndexType::UINT16);
        if let Some(set) = img.descriptor_set {
            d.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.inputs.layout,
                0,
                std::slice::from_ref(&set),
                &[],
            );
        }

        for (i, batch) in self.scene.batches.iter().enumerate() {
            if i < 32 && hidden_batches & (1 << i) != 0 {
                continue;
            }
            let textured = u32::from(batch.textured);
            d.cmd_push_constants(
                cmd,
                self.inputs.layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&textured),
            );
            d.cmd_draw_indexed(cmd, batch.index_count, 1, batch.first_index, 0, 0);
        }

        d.cmd_end_render_pass(cmd);
        d.end_command_buffer(cmd).context("end_command_buffer")?;
        Ok(())
    }

    /// A suboptimal acquire still signals `image_available`. Consume it with
    /// an empty submission so the semaphore is unsignaled before its next use,
    /// and leave the slot fence signaled again.
    unsafe fn drain_acquire_signal(&self, slot: usize) -> Result<()> {
        let d = &self.ctx.device;
        let sync = self.sync.get(slot);
        let wait_stage = vk::PipelineStageFlags::ALL_COMMANDS;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &sync.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            ..Default::default()
        };
        d.reset_fences(&[sync.in_flight])
            .context("reset_fences(drain)")?;
        d.queue_submit(self.ctx.queue, std::slice::from_ref(&submit), sync.in_flight)
            .context("queue_submit(drain)")?;
        d.wait_for_fences(&[sync.in_flight], true, u64::MAX)
            .context("wait_for_fences(drain)")?;
        Ok(())
    }
}

impl FrameBackend for VkBackend {
    type Chain = Swapchain;

    fn build_chain(&mut self, old: Option<&Swapchain>, generation: u64) -> Result<Option<Swapchain>> {
        let inputs = ChainInputs {
            command_pool: self.command_pool,
            pipeline: &self.inputs,
            texture: Some(&self.texture),
            window_extent: self.window_extent,
        };
        let Some(mut chain) = (unsafe { Swapchain::build(&self.ctx, &inputs, old, generation)? }) else {
            return Ok(None);
        };
        if self.record_mode == RecordMode::Prerecorded {
            for i in 0..chain.images.len() {
                if let Err(e) = unsafe { self.record_image(&chain, i, self.hidden_batches) } {
                    unsafe { chain.destroy(&self.ctx, self.command_pool) };
                    return Err(e);
                }
            }
        }
        Ok(Some(chain))
    }

    fn destroy_chain(&mut self, mut chain: Swapchain) {
        unsafe { chain.destroy(&self.ctx, self.command_pool) };
    }

    fn image_count(&self, chain: &Swapchain) -> usize {
        chain.image_count()
    }

    fn wait_fence(&mut self, slot: usize) -> Result<()> {
        let fence = self.sync.get(slot).in_flight;
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&[fence], true, u64::MAX)
                .context("wait_for_fences(in_flight)")
        }
    }

    fn acquire(&mut self, chain: &Swapchain, slot: usize) -> Result<Acquired> {
        let sem = self.sync.get(slot).image_available;
        let res = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                chain.handle,
                self.acquire_timeout_ns,
                sem,
                vk::Fence::null(),
            )
        };
        match res {
            Ok((index, false)) => Ok(Acquired::Image(index as usize)),
            Ok((_, true)) => {
                unsafe { self.drain_acquire_signal(slot)? };
                Ok(Acquired::Stale)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::Stale),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(Acquired::TimedOut),
            Err(e) => Err(e).context("acquire_next_image"),
        }
    }

    fn update(&mut self, chain: &mut Swapchain, image: usize, input: &FrameInput) -> Result<()> {
        let Some(ubo) = chain.images[image].uniform.as_ref() else {
            return Ok(());
        };
        let aspect = aspect_ratio(chain.extent.width, chain.extent.height);
        let nudge = input.pointer.map(Vec2::from).unwrap_or(Vec2::ZERO);
        let block = Transforms::orbit(input.seconds, aspect, nudge).to_uniform();
        // coherent memory; the image guard already retired the last reader
        unsafe { ubo.write(&[block]) }
    }

    fn record(&mut self, chain: &mut Swapchain, image: usize, input: &FrameInput) -> Result<()> {
        unsafe { self.record_image(chain, image, input.hidden_batches) }
    }

    fn submit(&mut self, chain: &Swapchain, slot: usize, image: usize) -> Result<()> {
        let d = &self.ctx.device;
        let sync = self.sync.get(slot);
        let cmd = chain.images[image].command_buffer;
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &sync.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &sync.render_finished,
            ..Default::default()
        };
        unsafe {
            // reset right before submit, never earlier
            d.reset_fences(&[sync.in_flight])
                .context("reset_fences(in_flight)")?;
            d.queue_submit(self.ctx.queue, std::slice::from_ref(&submit), sync.in_flight)
                .context("queue_submit")?;
        }
        Ok(())
    }

    fn present(&mut self, chain: &Swapchain, slot: usize, image: usize) -> Result<Presented> {
        let sync = self.sync.get(slot);
        let index = image as u32;
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &sync.render_finished,
            swapchain_count: 1,
            p_swapchains: &chain.handle,
            p_image_indices: &index,
            ..Default::default()
        };
        match unsafe { self.ctx.swapchain_loader.queue_present(self.ctx.queue, &present) } {
            Ok(false) => Ok(Presented::Shown),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::Stale),
            Err(e) => Err(e).context("queue_present"),
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe {
            self.ctx
                .device
                .device_wait_idle()
                .context("device_wait_idle")
        }
    }
}

impl Drop for VkBackend {
    // STRICT ORDER: the live swap chain is already gone (FrameLoop drops
    // first). Then scene + texture -> sync -> command pool -> pipeline
    // inputs -> device context.
    fn drop(&mut self) {
        unsafe {
            info!("draining GPU before teardown");
            let d = &self.ctx.device;
            d.device_wait_idle().ok();

            self.scene.destroy(d);
            self.texture.destroy(d);
            self.sync.destroy(d);
            d.destroy_command_pool(self.command_pool, None);
            self.inputs.destroy(d);

            self.ctx.destroy();
        }
    }
}
