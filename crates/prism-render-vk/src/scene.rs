// SPDX-License-Identifier: CEPL-1.0
//! Static scene: one vertex-colored triangle batch and one textured batch of
//! two quads, packed into a single vertex buffer and a single index buffer.

use ash::vk;
use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    const fn new(pos: [f32; 3], color: [f32; 3], uv: [f32; 2]) -> Self {
        Self { pos, color, uv }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, uv) as u32,
            },
        ]
    }
}

/// A contiguous index range drawn with one `cmd_draw_indexed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Batch {
    pub name: &'static str,
    pub first_index: u32,
    pub index_count: u32,
    /// Fragment shader samples the texture when set (push constant).
    pub textured: bool,
}

pub struct SceneGeometry {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
    pub batches: Vec<Batch>,
}

const WHITE: [f32; 3] = [1.0, 1.0, 1.0];

// Front faces wind clockwise as seen from +Z.
fn triangle() -> [Vertex; 3] {
    [
        Vertex::new([0.0, 0.6, 0.0], [1.0, 0.0, 0.0], [0.5, 0.0]),
        Vertex::new([0.5, -0.3, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0]),
        Vertex::new([-0.5, -0.3, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
    ]
}

fn quad(center: [f32; 2], half: f32, z: f32) -> [Vertex; 4] {
    let [cx, cy] = center;
    [
        Vertex::new([cx - half, cy + half, z], WHITE, [0.0, 0.0]),
        Vertex::new([cx + half, cy + half, z], WHITE, [1.0, 0.0]),
        Vertex::new([cx + half, cy - half, z], WHITE, [1.0, 1.0]),
        Vertex::new([cx - half, cy - half, z], WHITE, [0.0, 1.0]),
    ]
}

impl SceneGeometry {
    pub fn demo() -> Self {
        let mut vertices = Vec::new();
        let mut indices: Vec<u16> = Vec::new();
        let mut batches = Vec::new();

        let first = indices.len() as u32;
        vertices.extend_from_slice(&triangle());
        indices.extend_from_slice(&[0, 1, 2]);
        batches.push(Batch {
            name: "triangle",
            first_index: first,
            index_count: indices.len() as u32 - first,
            textured: false,
        });

        let first = indices.len() as u32;
        for (center, z) in [([-0.45, 0.0], -0.05), ([0.45, 0.0], 0.05)] {
            let base = vertices.len() as u16;
            vertices.extend_from_slice(&quad(center, 0.4, z));
            indices.extend(
                [0u16, 1, 2, 2, 3, 0]
                    .iter()
                    .map(|i| base + i),
            );
        }
        batches.push(Batch {
            name: "textured quads",
            first_index: first,
            index_count: indices.len() as u32 - first,
            textured: true,
        });

        Self {
            vertices,
            indices,
            batches,
        }
    }
}
