//! Geometry pool
//!
//! Allocates index/vertex (or meshlet) buffers out of the resource pool and
//! feeds their contents through the async copy queue. Handles are
//! generational: a freed handle can never dereference a recycled slot.
//! Consumers must observe [`GeometryPool::availability_wait_group`] before
//! first use.

use std::sync::Arc;

use ash::vk;
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::error::{GfxResult, GraphicsError};
use crate::jobs::WaitGroup;
use crate::resource::{Buffer, BufferDesc, BufferUsage, ResourcePool};
use crate::transfer::{AsyncCopyCommandList, AsyncCopyQueue};

/// Maximum number of vertex streams per geometry
pub const MAX_VERTEX_STREAMS: usize = 4;

slotmap::new_key_type! {
    /// Generational handle into the geometry pool
    pub struct GeometryHandle;
}

/// Packed meshlet descriptor: 8-bit counts, 24-bit offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshletHeader(u32, u32);

impl MeshletHeader {
    /// Pack counts and offsets, asserting field ranges
    pub fn pack(vertex_count: u32, vertex_offset: u32, primitive_count: u32, primitive_offset: u32) -> Self {
        debug_assert!(vertex_count < (1 << 8) && vertex_offset < (1 << 24));
        debug_assert!(primitive_count < (1 << 8) && primitive_offset < (1 << 24));
        Self(
            vertex_count | (vertex_offset << 8),
            primitive_count | (primitive_offset << 8),
        )
    }

    /// Vertex count (≤ 255)
    pub fn vertex_count(self) -> u32 {
        self.0 & 0xFF
    }

    /// Offset into the vertex-index buffer
    pub fn vertex_offset(self) -> u32 {
        self.0 >> 8
    }

    /// Primitive count (≤ 255)
    pub fn primitive_count(self) -> u32 {
        self.1 & 0xFF
    }

    /// Offset into the primitive-index buffer
    pub fn primitive_offset(self) -> u32 {
        self.1 >> 8
    }
}

/// One triangle of a meshlet: three 10-bit local indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedTriangle(u32);

impl PackedTriangle {
    /// Pack three local vertex indices
    pub fn pack(index0: u32, index1: u32, index2: u32) -> Self {
        debug_assert!(index0 < (1 << 10) && index1 < (1 << 10) && index2 < (1 << 10));
        Self(index0 | (index1 << 10) | (index2 << 20))
    }

    /// Unpack the three indices
    pub fn unpack(self) -> (u32, u32, u32) {
        (self.0 & 0x3FF, (self.0 >> 10) & 0x3FF, (self.0 >> 20) & 0x3FF)
    }
}

/// One vertex stream of a regular geometry allocation
pub struct StreamData<'a> {
    /// Tightly-packed vertex bytes
    pub data: &'a [u8],
    /// Bytes per vertex
    pub stride: u32,
}

/// Allocation request for index/vertex geometry
pub struct GeometryAllocationDesc<'a> {
    /// Debug name, used for the backing buffer names
    pub name: &'a str,
    /// Index data bytes
    pub index_data: &'a [u8],
    /// 16- or 32-bit indices
    pub index_type: vk::IndexType,
    /// Vertex streams (at most [`MAX_VERTEX_STREAMS`])
    pub streams: &'a [StreamData<'a>],
}

/// Allocation request for meshlet geometry
pub struct MeshletAllocationDesc<'a> {
    /// Debug name
    pub name: &'a str,
    /// Packed [`MeshletHeader`] array bytes
    pub header_data: &'a [u8],
    /// Meshlet-local vertex index bytes
    pub vertex_index_data: &'a [u8],
    /// Packed [`PackedTriangle`] array bytes
    pub primitive_index_data: &'a [u8],
    /// Vertex attribute bytes
    pub vertex_data: &'a [u8],
    /// Number of meshlets described by `header_data`
    pub meshlet_count: u32,
}

struct StreamBuffer {
    buffer: Arc<Buffer>,
    stride: u32,
}

enum GeometryEntry {
    Regular {
        index_buffer: Arc<Buffer>,
        index_type: vk::IndexType,
        index_count: u32,
        streams: SmallVec<[StreamBuffer; MAX_VERTEX_STREAMS]>,
        wait_group: Arc<WaitGroup>,
    },
    Meshlet {
        // header / vertex-index / primitive-index / vertex-data
        buffers: [Arc<Buffer>; 4],
        meshlet_count: u32,
        wait_group: Arc<WaitGroup>,
    },
}

/// Borrowed view of a regular geometry for draw recording
pub struct GeometryView {
    /// Index buffer handle
    pub index_buffer: vk::Buffer,
    /// Index width
    pub index_type: vk::IndexType,
    /// Total index count
    pub index_count: u32,
    /// Vertex stream buffer handles, binding order
    pub streams: SmallVec<[vk::Buffer; MAX_VERTEX_STREAMS]>,
}

/// Borrowed view of a meshlet geometry for mesh-shading paths
pub struct MeshletGeometryView {
    /// Meshlet header buffer
    pub header_buffer: vk::Buffer,
    /// Meshlet-local vertex index buffer
    pub vertex_index_buffer: vk::Buffer,
    /// Packed triangle buffer
    pub primitive_index_buffer: vk::Buffer,
    /// Vertex attribute buffer
    pub vertex_buffer: vk::Buffer,
    /// Number of meshlets
    pub meshlet_count: u32,
}

/// Pool of GPU geometries fed by the async copy queue
pub struct GeometryPool {
    resource_pool: Arc<ResourcePool>,
    copy_queue: Arc<AsyncCopyQueue>,
    geometries: SlotMap<GeometryHandle, GeometryEntry>,
}

impl GeometryPool {
    /// Create the pool
    pub fn new(resource_pool: Arc<ResourcePool>, copy_queue: Arc<AsyncCopyQueue>) -> Self {
        Self {
            resource_pool,
            copy_queue,
            geometries: SlotMap::with_key(),
        }
    }

    /// Allocate a regular geometry and schedule its upload.
    ///
    /// Returns the handle; the availability wait group signals once the
    /// upload retires on the GPU.
    pub fn allocate(&mut self, desc: &GeometryAllocationDesc) -> GfxResult<GeometryHandle> {
        if desc.streams.len() > MAX_VERTEX_STREAMS {
            return Err(GraphicsError::InvalidOperation {
                reason: format!(
                    "geometry {:?} uses {} vertex streams, limit is {MAX_VERTEX_STREAMS}",
                    desc.name,
                    desc.streams.len()
                ),
            });
        }
        if desc.index_data.is_empty() || desc.streams.iter().any(|stream| stream.data.is_empty()) {
            return Err(GraphicsError::InvalidOperation {
                reason: format!("geometry {:?} has an empty index or vertex stream", desc.name),
            });
        }

        let index_buffer = self.resource_pool.create_buffer(
            &format!("{}_indices", desc.name),
            BufferDesc::device_only(
                desc.index_data.len() as u64,
                BufferUsage::INDEX | BufferUsage::TRANSFER_DST,
            ),
        )?;

        let mut command_list = AsyncCopyCommandList::new();
        command_list.upload_buffer(Arc::clone(&index_buffer), 0, desc.index_data.to_vec());

        let mut streams = SmallVec::new();
        for (stream_index, stream) in desc.streams.iter().enumerate() {
            let buffer = self.resource_pool.create_buffer(
                &format!("{}_stream{}", desc.name, stream_index),
                BufferDesc::device_only(
                    stream.data.len() as u64,
                    BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
                ),
            )?;
            command_list.upload_buffer(Arc::clone(&buffer), 0, stream.data.to_vec());
            streams.push(StreamBuffer {
                buffer,
                stride: stream.stride,
            });
        }

        let index_size = match desc.index_type {
            vk::IndexType::UINT16 => 2,
            _ => 4,
        };
        let index_count = (desc.index_data.len() / index_size) as u32;

        let wait_group = command_list.wait_group();
        self.copy_queue.execute_command_list(command_list);

        Ok(self.geometries.insert(GeometryEntry::Regular {
            index_buffer,
            index_type: desc.index_type,
            index_count,
            streams,
            wait_group,
        }))
    }

    /// Allocate a meshlet geometry (header, vertex-index, primitive-index
    /// and vertex-data buffers) and schedule its upload
    pub fn allocate_meshlet(&mut self, desc: &MeshletAllocationDesc) -> GfxResult<GeometryHandle> {
        let mut command_list = AsyncCopyCommandList::new();

        let make_buffer = |suffix: &str, data: &[u8], list: &mut AsyncCopyCommandList| {
            let buffer = self.resource_pool.create_buffer(
                &format!("{}_{suffix}", desc.name),
                BufferDesc::device_only(
                    data.len() as u64,
                    BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
                ),
            )?;
            list.upload_buffer(Arc::clone(&buffer), 0, data.to_vec());
            Ok::<Arc<Buffer>, GraphicsError>(buffer)
        };

        let buffers = [
            make_buffer("meshlet_headers", desc.header_data, &mut command_list)?,
            make_buffer("meshlet_vertex_indices", desc.vertex_index_data, &mut command_list)?,
            make_buffer("meshlet_primitives", desc.primitive_index_data, &mut command_list)?,
            make_buffer("meshlet_vertices", desc.vertex_data, &mut command_list)?,
        ];

        let wait_group = command_list.wait_group();
        self.copy_queue.execute_command_list(command_list);

        Ok(self.geometries.insert(GeometryEntry::Meshlet {
            buffers,
            meshlet_count: desc.meshlet_count,
            wait_group,
        }))
    }

    /// Free a geometry; its buffers are reclaimed through the deferred
    /// destroy path
    pub fn free(&mut self, handle: GeometryHandle) {
        if self.geometries.remove(handle).is_none() {
            log::warn!("attempted to free an invalid geometry handle");
        }
    }

    /// View of a regular geometry
    pub fn view(&self, handle: GeometryHandle) -> GfxResult<GeometryView> {
        match self.geometries.get(handle) {
            Some(GeometryEntry::Regular {
                index_buffer,
                index_type,
                index_count,
                streams,
                ..
            }) => Ok(GeometryView {
                index_buffer: index_buffer.handle(),
                index_type: *index_type,
                index_count: *index_count,
                streams: streams.iter().map(|stream| stream.buffer.handle()).collect(),
            }),
            Some(GeometryEntry::Meshlet { .. }) => Err(GraphicsError::InvalidOperation {
                reason: "geometry is a meshlet allocation".to_string(),
            }),
            None => Err(GraphicsError::NotFound("geometry handle".to_string())),
        }
    }

    /// View of a meshlet geometry
    pub fn meshlet_view(&self, handle: GeometryHandle) -> GfxResult<MeshletGeometryView> {
        match self.geometries.get(handle) {
            Some(GeometryEntry::Meshlet {
                buffers,
                meshlet_count,
                ..
            }) => Ok(MeshletGeometryView {
                header_buffer: buffers[0].handle(),
                vertex_index_buffer: buffers[1].handle(),
                primitive_index_buffer: buffers[2].handle(),
                vertex_buffer: buffers[3].handle(),
                meshlet_count: *meshlet_count,
            }),
            Some(GeometryEntry::Regular { .. }) => Err(GraphicsError::InvalidOperation {
                reason: "geometry is a regular allocation".to_string(),
            }),
            None => Err(GraphicsError::NotFound("geometry handle".to_string())),
        }
    }

    /// Wait group that signals once the geometry's upload has retired
    pub fn availability_wait_group(&self, handle: GeometryHandle) -> GfxResult<Arc<WaitGroup>> {
        match self.geometries.get(handle) {
            Some(GeometryEntry::Regular { wait_group, .. })
            | Some(GeometryEntry::Meshlet { wait_group, .. }) => Ok(Arc::clone(wait_group)),
            None => Err(GraphicsError::NotFound("geometry handle".to_string())),
        }
    }

    /// Number of live geometries
    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    /// True when the pool holds no geometries
    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meshlet_header_roundtrip() {
        let header = MeshletHeader::pack(64, 1 << 20, 124, 12345);
        assert_eq!(header.vertex_count(), 64);
        assert_eq!(header.vertex_offset(), 1 << 20);
        assert_eq!(header.primitive_count(), 124);
        assert_eq!(header.primitive_offset(), 12345);
    }

    #[test]
    fn test_packed_triangle_roundtrip() {
        let triangle = PackedTriangle::pack(0, 511, 1023);
        assert_eq!(triangle.unpack(), (0, 511, 1023));
    }

    #[test]
    fn test_packed_triangle_fields_independent() {
        let triangle = PackedTriangle::pack(1, 2, 3);
        let (a, b, c) = triangle.unpack();
        assert_eq!((a, b, c), (1, 2, 3));
    }
}
