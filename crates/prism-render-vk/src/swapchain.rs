// SPDX-License-Identifier: CEPL-1.0
//! Swap chain manager: the lifecycle state machine and the Vulkan chain it
//! manages (images plus everything derived from them, one record per image).

use anyhow::{Context, Result};
use ash::vk;
use prism_math::UniformBlock;
use tracing::{debug, info};

use crate::context::{format_name, present_mode_name, DeviceContext};
use crate::memory::{color_subresource, Buffer, Texture};
use crate::pipeline::{create_graphics_pipeline, create_render_pass, Bindings, PipelineInputs};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainState {
    Uninitialized,
    Live,
    StaleDetected,
    Rebuilding,
    Destroyed,
}

/// Owns at most one chain and tracks where it is in its lifecycle:
/// `Uninitialized -> Live -> (StaleDetected -> Rebuilding -> Live)* -> Destroyed`.
///
/// Chains are replaced wholesale. During `Rebuilding` the retiring chain is
/// still held here so its handle can be passed to the new build.
#[derive(Debug)]
pub struct ChainManager<C> {
    state: ChainState,
    chain: Option<C>,
    generation: u64,
}

impl<C> Default for ChainManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ChainManager<C> {
    pub fn new() -> Self {
        Self {
            state: ChainState::Uninitialized,
            chain: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Number of chains installed so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn live(&self) -> Option<&C> {
        match self.state {
            ChainState::Live => self.chain.as_ref(),
            _ => None,
        }
    }

    pub fn live_mut(&mut self) -> Option<&mut C> {
        match self.state {
            ChainState::Live => self.chain.as_mut(),
            _ => None,
        }
    }

    /// The held chain in any state (the retiring one while rebuilding).
    pub fn current(&self) -> Option<&C> {
        self.chain.as_ref()
    }

    pub fn needs_rebuild(&self) -> bool {
        matches!(
            self.state,
            ChainState::Uninitialized | ChainState::StaleDetected
        )
    }

    /// Live -> StaleDetected. Returns false (and changes nothing) otherwise.
    pub fn mark_stale(&mut self) -> bool {
        if self.state == ChainState::Live {
            self.state = ChainState::StaleDetected;
            true
        } else {
            false
        }
    }

    pub fn begin_rebuild(&mut self) -> bool {
        if self.needs_rebuild() {
            self.state = ChainState::Rebuilding;
            true
        } else {
            false
        }
    }

    /// The surface cannot take a chain right now (zero extent); go back to
    /// waiting for a rebuild with the retiring chain, if any, still held.
    pub fn defer_rebuild(&mut self) {
        if self.state == ChainState::Rebuilding {
            self.state = if self.chain.is_some() {
                ChainState::StaleDetected
            } else {
                ChainState::Uninitialized
            };
        }
    }

    /// Rebuilding -> Live. Returns the retired chain, which the caller
    /// destroys once the device is idle.
    pub fn install(&mut self, chain: C) -> Option<C> {
        debug_assert_eq!(self.state, ChainState::Rebuilding);
        self.state = ChainState::Live;
        self.generation += 1;
        self.chain.replace(chain)
    }

    /// Any state -> Destroyed. Returns the held chain, if any.
    pub fn retire(&mut self) -> Option<C> {
        self.state = ChainState::Destroyed;
        self.chain.take()
    }
}

/// `min + 1`, capped by `max` (0 = no cap), never below `min`.
pub fn image_count_for(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count = count.min(caps.max_image_count);
    }
    count.max(caps.min_image_count)
}

/// The surface's current extent, or the window size clamped to the surface
/// limits when the surface leaves it to us (`u32::MAX`).
pub fn resolve_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    let clamp = |want: u32, lo: u32, hi: u32| want.max(lo).min(hi);
    vk::Extent2D {
        width: clamp(
            window.width,
            caps.min_image_extent.width,
            caps.max_image_extent.width,
        ),
        height: clamp(
            window.height,
            caps.min_image_extent.height,
            caps.max_image_extent.height,
        ),
    }
}

fn composite_alpha_for(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&a| caps.supported_composite_alpha.contains(a))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Everything that belongs to one presentable image.
pub struct ImageResources {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    pub command_buffer: vk::CommandBuffer,
    /// Persistently mapped transform uniform (binding 0).
    pub uniform: Option<Buffer>,
    pub descriptor_set: Option<vk::DescriptorSet>,
}

impl ImageResources {
    fn new(image: vk::Image) -> Self {
        Self {
            image,
            view: vk::ImageView::null(),
            framebuffer: vk::Framebuffer::null(),
            command_buffer: vk::CommandBuffer::null(),
            uniform: None,
            descriptor_set: None,
        }
    }
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub generation: u64,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub descriptor_pool: vk::DescriptorPool,
    pub images: Vec<ImageResources>,
}

/// What a build needs besides the device.
pub struct ChainInputs<'a> {
    pub command_pool: vk::CommandPool,
    pub pipeline: &'a PipelineInputs,
    pub texture: Option<&'a Texture>,
    /// Window size in pixels; used only when the surface does not fix the extent.
    pub window_extent: vk::Extent2D,
}

impl Swapchain {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Builds a complete chain, or `None` if the surface currently has a
    /// zero extent. `old` stays valid until the caller destroys it.
    ///
    /// STRICT ORDER: swapchain -> views -> render pass -> pipeline ->
    /// framebuffers -> uniforms + descriptor sets -> command buffers.
    pub unsafe fn build(
        ctx: &DeviceContext,
        inputs: &ChainInputs<'_>,
        old: Option<&Swapchain>,
        generation: u64,
    ) -> Result<Option<Self>> {
        // Re-queried every build: the extent is what changes on resize.
        let caps = ctx.surface_capabilities()?;
        let extent = resolve_extent(&caps, inputs.window_extent);
        if extent.width == 0 || extent.height == 0 {
            debug!("surface extent is {}x{}, deferring swap chain build", extent.width, extent.height);
            return Ok(None);
        }

        let desc = ctx.surface_desc;
        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface,
            min_image_count: image_count_for(&caps),
            image_format: desc.format.format,
            image_color_space: desc.format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: caps.current_transform,
            composite_alpha: composite_alpha_for(&caps),
            present_mode: desc.present_mode,
            clipped: vk::TRUE,
            old_swapchain: old.map_or(vk::SwapchainKHR::null(), |o| o.handle),
            ..Default::default()
        };
        let handle = ctx
            .swapchain_loader
            .create_swapchain(&swap_info, None)
            .context("create_swapchain")?;

        let mut chain = Self {
            handle,
            generation,
            format: desc.format.format,
            extent,
            render_pass: vk::RenderPass::null(),
            pipeline: vk::Pipeline::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            images: Vec::new(),
        };
        if let Err(e) = chain.populate(ctx, inputs) {
            chain.destroy(ctx, inputs.command_pool);
            return Err(e);
        }

        info!(
            "swap chain #{generation}: {}x{}, {} images (min {}, max {}), {} / {}",
            extent.width,
            extent.height,
            chain.images.len(),
            caps.min_image_count,
            caps.max_image_count,
            format_name(chain.format),
            present_mode_name(desc.present_mode)
        );
        Ok(Some(chain))
    }

    unsafe fn populate(&mut self, ctx: &DeviceContext, inputs: &ChainInputs<'_>) -> Result<()> {
        let d = &ctx.device;

        self.images = ctx
            .swapchain_loader
            .get_swapchain_images(self.handle)
            .context("get_swapchain_images")?
            .into_iter()
            .map(ImageResources::new)
            .collect();

        for img in &mut self.images {
            let iv_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image: img.image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: self.format,
                subresource_range: color_subresource(),
                ..Default::default()
            };
            img.view = d
                .create_image_view(&iv_info, None)
                .context("create_image_view(swapchain)")?;
        }

        self.render_pass = create_render_pass(d, self.format)?;
        self.pipeline = create_graphics_pipeline(d, self.render_pass, self.extent, inputs.pipeline)?;

        for img in &mut self.images {
            let fb_info = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass: self.render_pass,
                attachment_count: 1,
                p_attachments: &img.view,
                width: self.extent.width,
                height: self.extent.height,
                layers: 1,
                ..Default::default()
            };
            img.framebuffer = d
                .create_framebuffer(&fb_info, None)
                .context("create_framebuffer")?;
        }

        if inputs.pipeline.uses_descriptors() {
            self.create_descriptors(ctx, inputs)?;
        }

        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: inputs.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: self.images.len() as u32,
            ..Default::default()
        };
        let cmds = d
            .allocate_command_buffers(&alloc_info)
            .context("allocate_command_buffers")?;
        for (img, cmd) in self.images.iter_mut().zip(cmds) {
            img.command_buffer = cmd;
        }
        Ok(())
    }

    unsafe fn create_descriptors(&mut self, ctx: &DeviceContext, inputs: &ChainInputs<'_>) -> Result<()> {
        let d = &ctx.device;
        let bindings = inputs.pipeline.bindings;
        let count = self.images.len() as u32;

        let pool_sizes = bindings.pool_sizes(count);
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: count,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        self.descriptor_pool = d
            .create_descriptor_pool(&pool_ci, None)
            .context("create_descriptor_pool")?;

        let layouts = vec![inputs.pipeline.set_layout; self.images.len()];
        let alloc = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: count,
            p_set_layouts: layouts.as_ptr(),
            ..Default::default()
        };
        let sets = d
            .allocate_descriptor_sets(&alloc)
            .context("allocate_descriptor_sets")?;

        let ubo_size = std::mem::size_of::<UniformBlock>() as vk::DeviceSize;
        let image_info = inputs.texture.map(|t| vk::DescriptorImageInfo {
            sampler: t.sampler,
            image_view: t.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });

        for (img, set) in self.images.iter_mut().zip(sets) {
            img.descriptor_set = Some(set);
            if inputs.pipeline.uses_transform() {
                // owned by the record before the first write, so destroy() sees it
                let ubo = img.uniform.insert(Buffer::new_mapped(
                    ctx,
                    ubo_size,
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                )?);
                ubo.write(&[UniformBlock::default()])?;
            }

            let buffer_info = img.uniform.as_ref().map(|u| vk::DescriptorBufferInfo {
                buffer: u.buffer,
                offset: 0,
                range: ubo_size,
            });
            let mut writes = Vec::with_capacity(2);
            if let Some(info) = buffer_info.as_ref() {
                writes.push(vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: set,
                    dst_binding: Bindings::TRANSFORM_BINDING,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    p_buffer_info: info,
                    ..Default::default()
                });
            }
            if let (true, Some(info)) = (bindings.contains(Bindings::TEXTURE), image_info.as_ref()) {
                writes.push(vk::WriteDescriptorSet {
                    s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
                    dst_set: set,
                    dst_binding: Bindings::TEXTURE_BINDING,
                    descriptor_count: 1,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    p_image_info: info,
                    ..Default::default()
                });
            }
            d.update_descriptor_sets(&writes, &[]);
        }
        Ok(())
    }

    /// Reverse-dependency teardown. The caller must have waited for the
    /// device to go idle; nothing here waits. Null handles (from a build
    /// that failed halfway) are skipped by Vulkan.
    pub unsafe fn destroy(&mut self, ctx: &DeviceContext, command_pool: vk::CommandPool) {
        let d = &ctx.device;
        for img in &self.images {
            d.destroy_framebuffer(img.framebuffer, None);
        }
        let cmds: Vec<vk::CommandBuffer> = self
            .images
            .iter()
            .map(|i| i.command_buffer)
            .filter(|c| *c != vk::CommandBuffer::null())
            .collect();
        if !cmds.is_empty() {
            d.free_command_buffers(command_pool, &cmds);
        }
        d.destroy_pipeline(self.pipeline, None);
        d.destroy_render_pass(self.render_pass, None);
        for img in &mut self.images {
            d.destroy_image_view(img.view, None);
            if let Some(mut ubo) = img.uniform.take() {
                ubo.destroy(d);
            }
        }
        self.images.clear();
        ctx.swapchain_loader.destroy_swapchain(self.handle, None);
        // frees every set allocated from it
        d.destroy_descriptor_pool(self.descriptor_pool, None);

        self.handle = vk::SwapchainKHR::null();
        self.pipeline = vk::Pipeline::null();
        self.render_pass = vk::RenderPass::null();
        self.descriptor_pool = vk::DescriptorPool::null();
        debug!("swap chain #{} destroyed", self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_image_count_capped_by_max() {
        assert_eq!(image_count_for(&caps(2, 3)), 3);
    }

    #[test]
    fn test_image_count_min_plus_one() {
        assert_eq!(image_count_for(&caps(3, 8)), 4);
    }

    #[test]
    fn test_image_count_unbounded_max() {
        assert_eq!(image_count_for(&caps(2, 0)), 3);
    }

    #[test]
    fn test_image_count_never_below_min() {
        assert_eq!(image_count_for(&caps(3, 3)), 3);
        let c = caps(1, 8);
        let n = image_count_for(&c);
        assert!(c.min_image_count <= n && n <= c.max_image_count);
    }

    #[test]
    fn test_rebuild_with_same_caps_is_deterministic() {
        let c = caps(2, 8);
        let window = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let first = (image_count_for(&c), resolve_extent(&c, window));
        let second = (image_count_for(&c), resolve_extent(&c, window));
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_extent_prefers_surface() {
        let c = caps(2, 3);
        let e = resolve_extent(
            &c,
            vk::Extent2D {
                width: 10,
                height: 10,
            },
        );
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn test_resolve_extent_sentinel_uses_clamped_window() {
        let mut c = caps(2, 3);
        c.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        let e = resolve_extent(
            &c,
            vk::Extent2D {
                width: 9000,
                height: 720,
            },
        );
        assert_eq!((e.width, e.height), (4096, 720));
    }

    #[test]
    fn test_composite_alpha_prefers_opaque() {
        let mut c = caps(2, 3);
        c.supported_composite_alpha =
            vk::CompositeAlphaFlagsKHR::INHERIT | vk::CompositeAlphaFlagsKHR::OPAQUE;
        assert_eq!(composite_alpha_for(&c), vk::CompositeAlphaFlagsKHR::OPAQUE);
        c.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(composite_alpha_for(&c), vk::CompositeAlphaFlagsKHR::INHERIT);
    }

    #[test]
    fn test_manager_lifecycle() {
        let mut m: ChainManager<&str> = ChainManager::new();
        assert_eq!(m.state(), ChainState::Uninitialized);
        assert!(m.needs_rebuild());
        assert!(m.live().is_none());

        assert!(m.begin_rebuild());
        assert_eq!(m.state(), ChainState::Rebuilding);
        assert_eq!(m.install("a"), None);
        assert_eq!(m.state(), ChainState::Live);
        assert_eq!(m.live(), Some(&"a"));
        assert_eq!(m.generation(), 1);

        assert!(m.mark_stale());
        assert!(m.live().is_none());
        assert_eq!(m.current(), Some(&"a"));
        assert!(m.begin_rebuild());
        assert_eq!(m.install("b"), Some("a"));
        assert_eq!(m.generation(), 2);

        assert_eq!(m.retire(), Some("b"));
        assert_eq!(m.state(), ChainState::Destroyed);
        assert!(!m.mark_stale());
        assert!(!m.begin_rebuild());
    }

    #[test]
    fn test_manager_defer_keeps_retiring_chain() {
        let mut m: ChainManager<u32> = ChainManager::new();
        m.begin_rebuild();
        m.defer_rebuild();
        assert_eq!(m.state(), ChainState::Uninitialized);

        m.begin_rebuild();
        m.install(7);
        m.mark_stale();
        m.begin_rebuild();
        m.defer_rebuild();
        assert_eq!(m.state(), ChainState::StaleDetected);
        assert_eq!(m.current(), Some(&7));
    }

    #[test]
    fn test_mark_stale_only_from_live() {
        let mut m: ChainManager<u32> = ChainManager::new();
        assert!(!m.mark_stale());
        assert_eq!(m.state(), ChainState::Uninitialized);
    }
}
