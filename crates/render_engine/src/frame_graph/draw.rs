//! Draw call batching for frame-graph passes

use std::sync::Arc;

use crate::geometry::GeometryHandle;
use crate::pipeline::Pipeline;

/// Arguments of one draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawArguments {
    /// Indexed draw
    Indexed {
        /// First index within the geometry's index buffer
        index_offset: u32,
        /// Number of indices
        index_count: u32,
        /// Value added to each index before vertex fetch
        vertex_offset: i32,
    },
    /// Non-indexed draw
    Linear {
        /// First vertex
        vertex_offset: u32,
        /// Number of vertices
        vertex_count: u32,
    },
}

/// One draw of a pass: pipeline + geometry + arguments + per-draw root
/// constants
pub struct DrawCall {
    /// Pipeline to bind (skipped with a log when not yet compiled)
    pub pipeline: Arc<Pipeline>,
    /// Geometry to source vertices from
    pub geometry: GeometryHandle,
    /// Draw arguments
    pub arguments: DrawArguments,
    /// Number of instances
    pub instance_count: u32,
    /// Per-draw root constant blob (≤128 bytes); empty uses the pass-level
    /// constants
    pub root_constants: Vec<u8>,
}

/// Append-only list of draws recorded by a single pass
#[derive(Default)]
pub struct DrawList {
    calls: Vec<DrawCall>,
}

impl DrawList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a draw
    pub fn push(&mut self, call: DrawCall) {
        self.calls.push(call);
    }

    /// Iterate in append order
    pub fn iter(&self) -> impl Iterator<Item = &DrawCall> {
        self.calls.iter()
    }

    /// Number of draws
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// True when no draws were recorded
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
