// SPDX-License-Identifier: CEPL-1.0
//! Pipeline builder. Layout-level objects (shader modules, descriptor set
//! layout, pipeline layout) live as long as the renderer; the render pass
//! and the pipeline itself are rebuilt with every swap chain.

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;
use bitflags::bitflags;
use std::ffi::CStr;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use crate::error::{FatalError, Unwind};
use crate::scene::Vertex;

pub const ENTRY_POINT: &CStr = c"main";
pub const VERTEX_SHADER: &str = "quad.vert.spv";
pub const FRAGMENT_SHADER: &str = "quad.frag.spv";

/// `layout(push_constant) uniform { uint textured; }` in `quad.frag`.
pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<u32>() as u32;

/// Compiled SPIR-V, word-aligned and magic-checked.
#[derive(Clone, Debug)]
pub struct ShaderBlob {
    name: String,
    words: Vec<u32>,
}

impl ShaderBlob {
    /// Reads the whole file. A short read or a size that is not a whole
    /// number of words is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let read_err = |source| FatalError::ShaderRead {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(read_err)?;
        let expected = file.metadata().map_err(read_err)?.len() as usize;
        let mut bytes = Vec::with_capacity(expected);
        let read = file.read_to_end(&mut bytes).map_err(read_err)?;
        if read != expected {
            return Err(FatalError::ShaderTruncated {
                path: path.to_path_buf(),
                read,
                expected,
            }
            .into());
        }
        Self::from_bytes(&path.display().to_string(), &bytes)
    }

    pub fn from_bytes(name: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(FatalError::ShaderMisaligned {
                name: name.to_string(),
                len: bytes.len(),
            }
            .into());
        }
        let words = read_spv(&mut Cursor::new(bytes)).with_context(|| format!("decode SPIR-V {name}"))?;
        Ok(Self {
            name: name.to_string(),
            words,
        })
    }

    pub fn embedded_vertex() -> Result<Self> {
        Self::from_bytes(
            VERTEX_SHADER,
            include_bytes!(concat!(env!("OUT_DIR"), "/quad.vert.spv")),
        )
    }

    pub fn embedded_fragment() -> Result<Self> {
        Self::from_bytes(
            FRAGMENT_SHADER,
            include_bytes!(concat!(env!("OUT_DIR"), "/quad.frag.spv")),
        )
    }

    /// `quad.vert.spv` + `quad.frag.spv` from `dir`, or the build-time blobs.
    pub fn pair(dir: Option<&Path>) -> Result<(Self, Self)> {
        match dir {
            Some(dir) => Ok((
                Self::load(&dir.join(VERTEX_SHADER))?,
                Self::load(&dir.join(FRAGMENT_SHADER))?,
            )),
            None => Ok((Self::embedded_vertex()?, Self::embedded_fragment()?)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

bitflags! {
    /// Descriptor bindings declared by the pipeline's single set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Bindings: u32 {
        /// binding 0: model/view/proj uniform, vertex stage
        const TRANSFORM = 1 << 0;
        /// binding 1: combined image sampler, fragment stage
        const TEXTURE = 1 << 1;
    }
}

impl Bindings {
    pub const TRANSFORM_BINDING: u32 = 0;
    pub const TEXTURE_BINDING: u32 = 1;

    pub fn layout_bindings(self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        let mut out = Vec::new();
        if self.contains(Self::TRANSFORM) {
            out.push(vk::DescriptorSetLayoutBinding {
                binding: Self::TRANSFORM_BINDING,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::VERTEX,
                ..Default::default()
            });
        }
        if self.contains(Self::TEXTURE) {
            out.push(vk::DescriptorSetLayoutBinding {
                binding: Self::TEXTURE_BINDING,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            });
        }
        out
    }

    /// Pool sizes for `sets` descriptor sets of this layout.
    pub fn pool_sizes(self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        self.layout_bindings()
            .iter()
            .map(|b| vk::DescriptorPoolSize {
                ty: b.descriptor_type,
                descriptor_count: b.descriptor_count * sets,
            })
            .collect()
    }
}

/// Everything the pipeline needs that does not depend on the swap chain.
pub struct PipelineInputs {
    pub bindings: Bindings,
    pub set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub vert: vk::ShaderModule,
    pub frag: vk::ShaderModule,
}

unsafe fn create_shader_module(device: &ash::Device, blob: &ShaderBlob) -> Result<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        code_size: blob.words().len() * 4,
        p_code: blob.words().as_ptr(),
        ..Default::default()
    };
    device
        .create_shader_module(&ci, None)
        .with_context(|| format!("create_shader_module({})", blob.name()))
}

impl PipelineInputs {
    pub unsafe fn new(
        device: &ash::Device,
        bindings: Bindings,
        vert: &ShaderBlob,
        frag: &ShaderBlob,
    ) -> Result<Self> {
        let layout_bindings = bindings.layout_bindings();
        let dsl_ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: layout_bindings.len() as u32,
            p_bindings: layout_bindings.as_ptr(),
            ..Default::default()
        };
        let mut unwind = Unwind::new();
        let set_layout = device
            .create_descriptor_set_layout(&dsl_ci, None)
            .context("create_descriptor_set_layout")?;
        unwind.push(move || device.destroy_descriptor_set_layout(set_layout, None));

        let push = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: PUSH_CONSTANT_SIZE,
        };
        let layout_ci = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            set_layout_count: 1,
            p_set_layouts: &set_layout,
            push_constant_range_count: 1,
            p_push_constant_ranges: &push,
            ..Default::default()
        };
        let layout = device
            .create_pipeline_layout(&layout_ci, None)
            .context("create_pipeline_layout")?;
        unwind.push(move || device.destroy_pipeline_layout(layout, None));

        let vert = create_shader_module(device, vert)?;
        unwind.push(move || device.destroy_shader_module(vert, None));
        let frag = create_shader_module(device, frag)?;
        unwind.disarm();

        Ok(Self {
            bindings,
            set_layout,
            layout,
            vert,
            frag,
        })
    }

    /// Per-image uniform buffers and descriptor sets are only built when set.
    pub fn uses_transform(&self) -> bool {
        self.bindings.contains(Bindings::TRANSFORM)
    }

    pub fn uses_descriptors(&self) -> bool {
        !self.bindings.is_empty()
    }

    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_shader_module(self.frag, None);
        device.destroy_shader_module(self.vert, None);
        device.destroy_pipeline_layout(self.layout, None);
        device.destroy_descriptor_set_layout(self.set_layout, None);
    }
}

/// Single color attachment: cleared on load, stored, handed to present.
pub unsafe fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let color = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        ..Default::default()
    };
    // Orders this frame's color writes after the presentation engine is
    // done reading the image (the acquire semaphore waits at this stage).
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let rp_ci = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    device
        .create_render_pass(&rp_ci, None)
        .context("create_render_pass")
}

pub fn full_viewport(extent: vk::Extent2D) -> (vk::Viewport, vk::Rect2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    (viewport, scissor)
}

/// Bakes viewport/scissor for `extent`; the result is only valid with
/// `render_pass` and must be rebuilt alongside it.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    inputs: &PipelineInputs,
) -> Result<vk::Pipeline> {
    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: inputs.vert,
            p_name: ENTRY_POINT.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: inputs.frag,
            p_name: ENTRY_POINT.as_ptr(),
            ..Default::default()
        },
    ];

    let vb = Vertex::binding_description();
    let va = Vertex::attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };

    let (viewport, scissor) = full_viewport(extent);
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        p_viewports: &viewport,
        scissor_count: 1,
        p_scissors: &scissor,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        layout: inputs.layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    let pipelines = device
        .create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
        .map_err(|(_, err)| anyhow!("create_graphics_pipelines: {err:?}"))?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(tag: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("prism-{tag}-{}.spv", std::process::id()));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_embedded_shaders_decode() {
        let (vs, fs) = ShaderBlob::pair(None).unwrap();
        assert_eq!(vs.words()[0], 0x0723_0203);
        assert_eq!(fs.words()[0], 0x0723_0203);
        assert_eq!(vs.name(), VERTEX_SHADER);
    }

    #[test]
    fn test_load_rejects_misaligned_file() {
        let path = temp_file("misaligned", &[0x03, 0x02, 0x23, 0x07, 0x00]);
        let err = ShaderBlob::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(
            err.downcast_ref::<FatalError>(),
            Some(FatalError::ShaderMisaligned { len: 5, .. })
        ));
    }

    #[test]
    fn test_load_missing_file_is_fatal() {
        let path = std::env::temp_dir().join("prism-definitely-missing.spv");
        let err = ShaderBlob::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FatalError>(),
            Some(FatalError::ShaderRead { .. })
        ));
    }

    #[test]
    fn test_load_reads_whole_file() {
        let words: [u32; 2] = [0x0723_0203, 0x0001_0000];
        let path = temp_file("whole", bytemuck::cast_slice(&words));
        let blob = ShaderBlob::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(blob.words(), &words);
    }

    #[test]
    fn test_from_bytes_rejects_bad_magic() {
        assert!(ShaderBlob::from_bytes("zeros", &[0u8; 8]).is_err());
        assert!(ShaderBlob::from_bytes("empty", &[]).is_err());
    }

    #[test]
    fn test_bindings_layout() {
        let all = (Bindings::TRANSFORM | Bindings::TEXTURE).layout_bindings();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].binding, 0);
        assert_eq!(all[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(all[0].stage_flags, vk::ShaderStageFlags::VERTEX);
        assert_eq!(all[1].binding, 1);
        assert_eq!(all[1].descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(all[1].stage_flags, vk::ShaderStageFlags::FRAGMENT);

        let tex_only = Bindings::TEXTURE.layout_bindings();
        assert_eq!(tex_only.len(), 1);
        assert_eq!(tex_only[0].binding, Bindings::TEXTURE_BINDING);
        assert!(Bindings::empty().layout_bindings().is_empty());
    }

    #[test]
    fn test_pool_sizes_scale_with_image_count() {
        let sizes = (Bindings::TRANSFORM | Bindings::TEXTURE).pool_sizes(3);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|s| s.descriptor_count == 3));
    }

    #[test]
    fn test_full_viewport_matches_extent() {
        let (vp, sc) = full_viewport(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!((vp.width, vp.height), (800.0, 600.0));
        assert_eq!((vp.min_depth, vp.max_depth), (0.0, 1.0));
        assert_eq!(sc.extent.width, 800);
        assert_eq!(sc.offset.x, 0);
    }
}
