//! Frame graph
//!
//! A per-frame DAG of passes declaring every resource read and write through
//! versioned handles. From the declarations the graph derives resource
//! lifetimes, aliases non-overlapping transients onto shared physical
//! resources from the pool, and inserts the exact pipeline barrier between
//! every producer and consumer. One instance lives across the present loop
//! and is reset-and-reused each frame.

pub mod blackboard;
pub mod context;
pub mod draw;
pub mod pool;

use fxhash::FxHashMap;

use crate::bindless::BindlessManager;
use crate::command::{BufferAccess, BufferBarrier, CommandBuffer, ImageAccess, ImageBarrier};
use crate::error::{GfxResult, GraphicsError};
use crate::geometry::GeometryPool;
use crate::resource::{BufferDesc, ImageDesc, ImageSubresource};

pub use blackboard::FrameGraphBlackboard;
pub use context::{
    FrameGraphContext, LoadOp, PipelineStateFlags, RenderTargetLoadOperations,
    RenderTargetStoreOperations, ScissorRect, StoreOp, ViewportRect,
};
pub use draw::{DrawArguments, DrawCall, DrawList};
pub use pool::{FrameGraphResourcePool, TransientResource, TransientResourceFactory};

/// Handle to a virtual frame-graph image. `(index, version)`; every write
/// bumps the version so readers name the data they depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle {
    index: u32,
    version: u32,
}

impl ImageHandle {
    /// Sentinel invalid handle
    pub const INVALID: ImageHandle = ImageHandle {
        index: u32::MAX,
        version: 0,
    };

    /// True for any non-sentinel handle
    pub fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

/// Handle to a virtual frame-graph buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    version: u32,
}

impl BufferHandle {
    /// Sentinel invalid handle
    pub const INVALID: BufferHandle = BufferHandle {
        index: u32::MAX,
        version: 0,
    };

    /// True for any non-sentinel handle
    pub fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceAccess {
    Image(ImageAccess),
    Buffer(BufferAccess),
}

impl ResourceAccess {
    fn is_write(self) -> bool {
        match self {
            ResourceAccess::Image(access) => access.is_write(),
            ResourceAccess::Buffer(access) => access.is_write(),
        }
    }
}

enum ResourceKind {
    Image(ImageDesc),
    Buffer(BufferDesc),
}

struct ImportedResource {
    resource: TransientResource,
    initial: ResourceAccess,
    final_access: Option<ResourceAccess>,
}

struct VirtualResource {
    name: String,
    kind: ResourceKind,
    imported: Option<ImportedResource>,
    version: u32,
    first_use: Option<u32>,
    last_use: Option<u32>,
    physical_slot: Option<usize>,
}

struct PassAccess {
    resource: u32,
    version: u32,
    access: ResourceAccess,
}

struct Pass {
    name: String,
    accesses: Vec<PassAccess>,
    record: Option<Box<dyn FnMut(&mut FrameGraphContext)>>,
    skipped: bool,
}

struct PhysicalSlot {
    resource: TransientResource,
    state: ResourceAccess,
}

pub(crate) struct GraphResources {
    virtuals: Vec<VirtualResource>,
    physical: Vec<PhysicalSlot>,
}

enum Transition {
    Image {
        image: ash::vk::Image,
        src: ImageAccess,
        dst: ImageAccess,
        subresource: ImageSubresource,
    },
    Buffer {
        buffer: ash::vk::Buffer,
        src: BufferAccess,
        dst: BufferAccess,
    },
}

impl GraphResources {
    fn whole_subresource(resource: &TransientResource) -> ImageSubresource {
        resource
            .image_desc()
            .map(|desc| desc.whole_subresource())
            .expect("image transition on a buffer resource")
    }

    /// Compute the transitions required before one pass runs and update the
    /// tracked states
    fn plan_pass_transitions(&mut self, accesses: &[PassAccess]) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for access in accesses {
            let virtual_resource = &self.virtuals[access.resource as usize];
            let slot_index = virtual_resource
                .physical_slot
                .expect("pass executed before compile assigned physical resources");
            let slot = &mut self.physical[slot_index];

            let needs_barrier = slot.state != access.access || access.access.is_write();
            if !needs_barrier {
                continue;
            }

            match (slot.state, access.access) {
                (ResourceAccess::Image(src), ResourceAccess::Image(dst)) => {
                    transitions.push(Transition::Image {
                        image: slot
                            .resource
                            .native_image()
                            .expect("image access declared on a buffer"),
                        src,
                        dst,
                        subresource: Self::whole_subresource(&slot.resource),
                    });
                }
                (ResourceAccess::Buffer(src), ResourceAccess::Buffer(dst)) => {
                    transitions.push(Transition::Buffer {
                        buffer: slot
                            .resource
                            .native_buffer()
                            .expect("buffer access declared on an image"),
                        src,
                        dst,
                    });
                }
                _ => unreachable!("image/buffer access mismatch survived setup validation"),
            }
            slot.state = access.access;
        }
        transitions
    }

    /// Transitions bringing imported resources to their requested final
    /// state (e.g. the swapchain target to `Present`)
    fn plan_final_transitions(&mut self) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for virtual_resource in &self.virtuals {
            let Some(imported) = &virtual_resource.imported else {
                continue;
            };
            let Some(final_access) = imported.final_access else {
                continue;
            };
            let Some(slot_index) = virtual_resource.physical_slot else {
                continue;
            };
            let slot = &mut self.physical[slot_index];
            if slot.state == final_access {
                continue;
            }
            match (slot.state, final_access) {
                (ResourceAccess::Image(src), ResourceAccess::Image(dst)) => {
                    transitions.push(Transition::Image {
                        image: slot.resource.native_image().expect("imported image"),
                        src,
                        dst,
                        subresource: Self::whole_subresource(&slot.resource),
                    });
                }
                (ResourceAccess::Buffer(src), ResourceAccess::Buffer(dst)) => {
                    transitions.push(Transition::Buffer {
                        buffer: slot.resource.native_buffer().expect("imported buffer"),
                        src,
                        dst,
                    });
                }
                _ => {}
            }
            slot.state = final_access;
        }
        transitions
    }

    pub(crate) fn resolve_image(&self, handle: ImageHandle) -> GfxResult<&TransientResource> {
        let virtual_resource = self
            .virtuals
            .get(handle.index as usize)
            .ok_or_else(|| GraphicsError::NotFound("frame graph image handle".to_string()))?;
        let slot = virtual_resource.physical_slot.ok_or_else(|| {
            GraphicsError::InvalidOperation {
                reason: format!("resource {:?} has no physical backing", virtual_resource.name),
            }
        })?;
        Ok(&self.physical[slot].resource)
    }

    pub(crate) fn resolve_buffer(&self, handle: BufferHandle) -> GfxResult<&TransientResource> {
        self.resolve_image(ImageHandle {
            index: handle.index,
            version: handle.version,
        })
    }
}

/// Pure scheduling check: every read of version `v` must be preceded by the
/// pass that wrote version `v`.
pub(crate) fn validate_schedule(
    passes: &[Vec<(u32, u32, bool)>], // (resource, version, is_write)
) -> Result<(), String> {
    let mut producers: FxHashMap<(u32, u32), usize> = FxHashMap::default();
    for (pass_index, accesses) in passes.iter().enumerate() {
        for &(resource, version, is_write) in accesses {
            if is_write {
                producers.insert((resource, version), pass_index);
            } else if version > 0 {
                match producers.get(&(resource, version)) {
                    Some(&producer) if producer < pass_index => {}
                    Some(&producer) => {
                        return Err(format!(
                            "pass {pass_index} reads resource {resource} v{version} produced by later pass {producer}"
                        ));
                    }
                    None => {
                        return Err(format!(
                            "pass {pass_index} reads resource {resource} v{version} that no pass produced"
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Pure transient-aliasing assignment.
///
/// Resources are considered in declaration order; a transient may share a
/// physical slot with an earlier transient of identical desc hash whose
/// lifetime ended strictly before this one begins. Imported resources always
/// get their own slot.
pub(crate) fn assign_physical_slots(
    requests: &[(u64, u32, u32, bool)], // (desc_hash, first_use, last_use, imported)
) -> Vec<usize> {
    struct Slot {
        desc_hash: u64,
        last_use: u32,
        imported: bool,
    }

    let mut slots: Vec<Slot> = Vec::new();
    let mut assignment = Vec::with_capacity(requests.len());

    for &(desc_hash, first_use, last_use, imported) in requests {
        let reusable = (!imported)
            .then(|| {
                slots.iter().position(|slot| {
                    !slot.imported && slot.desc_hash == desc_hash && slot.last_use < first_use
                })
            })
            .flatten();

        let slot_index = match reusable {
            Some(index) => {
                slots[index].last_use = last_use;
                index
            }
            None => {
                slots.push(Slot {
                    desc_hash,
                    last_use,
                    imported,
                });
                slots.len() - 1
            }
        };
        assignment.push(slot_index);
    }

    assignment
}

/// The frame graph
pub struct FrameGraph {
    resources: GraphResources,
    passes: Vec<Pass>,
    blackboard: FrameGraphBlackboard,
    pool: FrameGraphResourcePool,
    compiled: bool,
}

impl FrameGraph {
    /// Create the graph over a transient resource pool
    pub fn new(pool: FrameGraphResourcePool) -> Self {
        Self {
            resources: GraphResources {
                virtuals: Vec::new(),
                physical: Vec::new(),
            },
            passes: Vec::new(),
            blackboard: FrameGraphBlackboard::new(),
            pool,
            compiled: false,
        }
    }

    /// Reset for a new frame: drop passes, virtual resources and blackboard
    /// entries, and recycle last frame's physical resources
    pub fn begin_frame(&mut self) {
        self.resources.virtuals.clear();
        self.resources.physical.clear();
        self.passes.clear();
        self.blackboard.reset();
        self.pool.reset();
        self.compiled = false;
    }

    /// The blackboard of the current frame
    pub fn blackboard(&self) -> &FrameGraphBlackboard {
        &self.blackboard
    }

    /// Mutable blackboard access for setup code
    pub fn blackboard_mut(&mut self) -> &mut FrameGraphBlackboard {
        &mut self.blackboard
    }

    /// Import an external image (e.g. the swapchain render target).
    ///
    /// The graph does not allocate it, but tracks its state: `initial` is
    /// the access it enters the frame with, `final_access` the state to
    /// leave it in after the last pass.
    pub fn import_image(
        &mut self,
        name: &str,
        resource: TransientResource,
        initial: ImageAccess,
        final_access: Option<ImageAccess>,
    ) -> ImageHandle {
        debug_assert!(resource.image_desc().is_some());
        let desc = *resource.image_desc().expect("imported image without desc");
        let index = self.resources.virtuals.len() as u32;
        self.resources.virtuals.push(VirtualResource {
            name: name.to_string(),
            kind: ResourceKind::Image(desc),
            imported: Some(ImportedResource {
                resource,
                initial: ResourceAccess::Image(initial),
                final_access: final_access.map(ResourceAccess::Image),
            }),
            version: 0,
            first_use: None,
            last_use: None,
            physical_slot: None,
        });
        ImageHandle { index, version: 0 }
    }

    /// Import an external buffer
    pub fn import_buffer(
        &mut self,
        name: &str,
        resource: TransientResource,
        initial: BufferAccess,
    ) -> BufferHandle {
        debug_assert!(resource.native_buffer().is_some());
        let desc = match &resource {
            TransientResource::Buffer(buffer) => *buffer.desc(),
            _ => unreachable!(),
        };
        let index = self.resources.virtuals.len() as u32;
        self.resources.virtuals.push(VirtualResource {
            name: name.to_string(),
            kind: ResourceKind::Buffer(desc),
            imported: Some(ImportedResource {
                resource,
                initial: ResourceAccess::Buffer(initial),
                final_access: None,
            }),
            version: 0,
            first_use: None,
            last_use: None,
            physical_slot: None,
        });
        BufferHandle { index, version: 0 }
    }

    /// Start declaring a pass
    pub fn add_pass(&mut self, name: &str) -> PassBuilder<'_> {
        let pass_index = self.passes.len();
        self.passes.push(Pass {
            name: name.to_string(),
            accesses: Vec::new(),
            record: None,
            skipped: false,
        });
        PassBuilder {
            graph: self,
            pass_index,
        }
    }

    /// Number of declared passes this frame
    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    /// Compile: validate the schedule, compute lifetimes, alias transients
    /// and materialize physical resources from the pool
    pub fn compile(&mut self) -> GfxResult<()> {
        debug_assert!(!self.compiled, "frame graph compiled twice in one frame");

        let schedule: Vec<Vec<(u32, u32, bool)>> = self
            .passes
            .iter()
            .map(|pass| {
                pass.accesses
                    .iter()
                    .map(|access| (access.resource, access.version, access.access.is_write()))
                    .collect()
            })
            .collect();
        validate_schedule(&schedule)
            .map_err(|reason| GraphicsError::InvalidOperation { reason })?;

        // Transients no pass ever touched are skipped entirely; imported
        // resources keep a slot regardless so their final transitions run.
        let mut request_owners: Vec<usize> = Vec::new();
        let mut requests: Vec<(u64, u32, u32, bool)> = Vec::new();
        for (resource_index, resource) in self.resources.virtuals.iter().enumerate() {
            if resource.first_use.is_none() && resource.imported.is_none() {
                continue;
            }
            let desc_hash = match &resource.kind {
                ResourceKind::Image(desc) => desc.hash64(),
                ResourceKind::Buffer(desc) => desc.hash64(),
            };
            request_owners.push(resource_index);
            requests.push((
                desc_hash,
                resource.first_use.unwrap_or(u32::MAX),
                resource.last_use.unwrap_or(0),
                resource.imported.is_some(),
            ));
        }
        let assignment = assign_physical_slots(&requests);

        // Materialize one physical resource per slot; aliased virtuals share
        // it sequentially.
        let slot_count = assignment.iter().copied().max().map_or(0, |max| max + 1);
        let mut slots: Vec<Option<PhysicalSlot>> = Vec::new();
        slots.resize_with(slot_count, || None);

        for (request_index, &slot_index) in assignment.iter().enumerate() {
            let virtual_resource = &mut self.resources.virtuals[request_owners[request_index]];
            virtual_resource.physical_slot = Some(slot_index);

            if slots[slot_index].is_none() {
                let slot = match &virtual_resource.imported {
                    Some(imported) => Some(PhysicalSlot {
                        resource: imported.resource.clone(),
                        state: imported.initial,
                    }),
                    None => {
                        let physical = match &virtual_resource.kind {
                            ResourceKind::Image(desc) => Self::acquire_image_with_retry(
                                &mut self.pool,
                                &virtual_resource.name,
                                desc,
                            ),
                            ResourceKind::Buffer(desc) => {
                                self.pool.acquire_buffer(&virtual_resource.name, desc)
                            }
                        };
                        match physical {
                            Ok(physical) => {
                                let state = match &virtual_resource.kind {
                                    ResourceKind::Image(_) => {
                                        ResourceAccess::Image(ImageAccess::Undefined)
                                    }
                                    ResourceKind::Buffer(_) => {
                                        ResourceAccess::Buffer(BufferAccess::Undefined)
                                    }
                                };
                                Some(PhysicalSlot {
                                    resource: physical,
                                    state,
                                })
                            }
                            // Allocation failed twice; passes touching this
                            // resource are skipped below.
                            Err(error) => {
                                log::error!(
                                    "transient {:?} could not be allocated: {error}",
                                    virtual_resource.name
                                );
                                None
                            }
                        }
                    }
                };
                match slot {
                    Some(slot) => slots[slot_index] = Some(slot),
                    None => {
                        virtual_resource.physical_slot = None;
                    }
                }
            }
        }

        // Re-index around failed slots and mark the affected passes skipped.
        let mut remap: Vec<Option<usize>> = Vec::with_capacity(slots.len());
        let mut physical = Vec::new();
        for slot in slots {
            match slot {
                Some(slot) => {
                    remap.push(Some(physical.len()));
                    physical.push(slot);
                }
                None => remap.push(None),
            }
        }
        for resource in &mut self.resources.virtuals {
            resource.physical_slot = resource
                .physical_slot
                .and_then(|slot_index| remap.get(slot_index).copied().flatten());
        }
        for pass in &mut self.passes {
            let unbacked = pass.accesses.iter().any(|access| {
                self.resources.virtuals[access.resource as usize]
                    .physical_slot
                    .is_none()
            });
            if unbacked {
                log::error!("skipping pass {:?}: a transient resource has no backing", pass.name);
                pass.skipped = true;
            }
        }

        self.resources.physical = physical;
        self.compiled = true;
        Ok(())
    }

    /// Transient allocation failure path: recycle everything the pool holds
    /// and retry once before giving up.
    fn acquire_image_with_retry(
        pool: &mut FrameGraphResourcePool,
        name: &str,
        desc: &ImageDesc,
    ) -> GfxResult<TransientResource> {
        match pool.acquire_image(name, desc) {
            Ok(resource) => Ok(resource),
            Err(first_error) => {
                log::warn!("transient image {name:?} allocation failed, evicting pool and retrying");
                pool.reset();
                pool.acquire_image(name, desc).map_err(|_| first_error)
            }
        }
    }

    /// Execute every pass in declaration order, inserting the planned
    /// barriers at the head of each consuming pass
    pub fn execute(
        &mut self,
        cmd: &mut CommandBuffer,
        bindless: &mut BindlessManager,
        geometry: &GeometryPool,
    ) -> GfxResult<()> {
        debug_assert!(self.compiled, "frame graph executed before compile");

        let mut passes = std::mem::take(&mut self.passes);
        for pass in passes.iter_mut() {
            if pass.skipped {
                continue;
            }
            let transitions = self.resources.plan_pass_transitions(&pass.accesses);
            Self::emit_transitions(cmd, transitions);
            cmd.flush_barriers();

            let Some(record) = pass.record.as_mut() else {
                log::debug!("pass {:?} declared without a record callback", pass.name);
                continue;
            };

            let mut context = FrameGraphContext::new(
                cmd,
                bindless,
                geometry,
                &self.resources,
                &mut self.blackboard,
            );
            record(&mut context);
            context.finish();
        }

        let final_transitions = self.resources.plan_final_transitions();
        Self::emit_transitions(cmd, final_transitions);
        cmd.flush_barriers();
        Ok(())
    }

    fn emit_transitions(cmd: &mut CommandBuffer, transitions: Vec<Transition>) {
        for transition in transitions {
            match transition {
                Transition::Image {
                    image,
                    src,
                    dst,
                    subresource,
                } => cmd.add_image_barrier(ImageBarrier::new(image, src, dst, subresource)),
                Transition::Buffer { buffer, src, dst } => {
                    cmd.add_buffer_barrier(BufferBarrier::new(buffer, src, dst));
                }
            }
        }
    }
}

/// Declares the resource accesses of one pass
pub struct PassBuilder<'graph> {
    graph: &'graph mut FrameGraph,
    pass_index: usize,
}

impl<'graph> PassBuilder<'graph> {
    /// Create a transient image owned by the graph pool
    pub fn create_image(&mut self, name: &str, desc: ImageDesc) -> ImageHandle {
        let index = self.graph.resources.virtuals.len() as u32;
        self.graph.resources.virtuals.push(VirtualResource {
            name: name.to_string(),
            kind: ResourceKind::Image(desc),
            imported: None,
            version: 0,
            first_use: None,
            last_use: None,
            physical_slot: None,
        });
        ImageHandle { index, version: 0 }
    }

    /// Create a transient buffer owned by the graph pool
    pub fn create_buffer(&mut self, name: &str, desc: BufferDesc) -> BufferHandle {
        let index = self.graph.resources.virtuals.len() as u32;
        self.graph.resources.virtuals.push(VirtualResource {
            name: name.to_string(),
            kind: ResourceKind::Buffer(desc),
            imported: None,
            version: 0,
            first_use: None,
            last_use: None,
            physical_slot: None,
        });
        BufferHandle { index, version: 0 }
    }

    fn touch(&mut self, resource: u32) {
        let pass_index = self.pass_index as u32;
        let virtual_resource = &mut self.graph.resources.virtuals[resource as usize];
        if virtual_resource.first_use.is_none() {
            virtual_resource.first_use = Some(pass_index);
        }
        virtual_resource.last_use = Some(pass_index);
    }

    /// Declare a read of an image version
    pub fn read_image(&mut self, handle: ImageHandle, access: ImageAccess) -> ImageHandle {
        debug_assert!(!access.is_write(), "write access used in a read declaration");
        let resource = &self.graph.resources.virtuals[handle.index as usize];
        assert_eq!(
            handle.version, resource.version,
            "read of a stale version of {:?}",
            resource.name
        );
        self.touch(handle.index);
        self.graph.passes[self.pass_index].accesses.push(PassAccess {
            resource: handle.index,
            version: handle.version,
            access: ResourceAccess::Image(access),
        });
        handle
    }

    /// Declare a write to an image; returns the new version's handle
    pub fn write_image(&mut self, handle: ImageHandle, access: ImageAccess) -> ImageHandle {
        debug_assert!(access.is_write(), "read access used in a write declaration");
        let resource = &mut self.graph.resources.virtuals[handle.index as usize];
        assert_eq!(
            handle.version, resource.version,
            "write to a stale version of {:?}",
            resource.name
        );
        resource.version += 1;
        let new_version = resource.version;
        self.touch(handle.index);
        self.graph.passes[self.pass_index].accesses.push(PassAccess {
            resource: handle.index,
            version: new_version,
            access: ResourceAccess::Image(access),
        });
        ImageHandle {
            index: handle.index,
            version: new_version,
        }
    }

    /// Declare a read of a buffer version
    pub fn read_buffer(&mut self, handle: BufferHandle, access: BufferAccess) -> BufferHandle {
        debug_assert!(!access.is_write());
        let resource = &self.graph.resources.virtuals[handle.index as usize];
        assert_eq!(
            handle.version, resource.version,
            "read of a stale version of {:?}",
            resource.name
        );
        self.touch(handle.index);
        self.graph.passes[self.pass_index].accesses.push(PassAccess {
            resource: handle.index,
            version: handle.version,
            access: ResourceAccess::Buffer(access),
        });
        handle
    }

    /// Declare a write to a buffer; returns the new version's handle
    pub fn write_buffer(&mut self, handle: BufferHandle, access: BufferAccess) -> BufferHandle {
        debug_assert!(access.is_write());
        let resource = &mut self.graph.resources.virtuals[handle.index as usize];
        assert_eq!(
            handle.version, resource.version,
            "write to a stale version of {:?}",
            resource.name
        );
        resource.version += 1;
        let new_version = resource.version;
        self.touch(handle.index);
        self.graph.passes[self.pass_index].accesses.push(PassAccess {
            resource: handle.index,
            version: new_version,
            access: ResourceAccess::Buffer(access),
        });
        BufferHandle {
            index: handle.index,
            version: new_version,
        }
    }

    /// Finalize the pass with its record callback
    pub fn record(self, callback: impl FnMut(&mut FrameGraphContext) + 'static) {
        self.graph.passes[self.pass_index].record = Some(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_start_invalid() {
        assert!(!ImageHandle::INVALID.is_valid());
        assert!(!BufferHandle::INVALID.is_valid());
    }

    #[test]
    fn test_schedule_accepts_write_then_read() {
        // pass 0 writes v1, pass 1 reads v1
        let passes = vec![vec![(0, 1, true)], vec![(0, 1, false)]];
        assert!(validate_schedule(&passes).is_ok());
    }

    #[test]
    fn test_schedule_rejects_read_before_write() {
        // pass 0 reads v1, pass 1 writes v1
        let passes = vec![vec![(0, 1, false)], vec![(0, 1, true)]];
        assert!(validate_schedule(&passes).is_err());
    }

    #[test]
    fn test_schedule_rejects_unproduced_version() {
        let passes = vec![vec![(0, 3, false)]];
        assert!(validate_schedule(&passes).is_err());
    }

    #[test]
    fn test_aliasing_shares_non_overlapping_transients() {
        // Two 512x512 R8 transients: first lives in pass 0, second in pass
        // 1. They must land in the same physical slot.
        let requests = vec![(0x1234, 0, 0, false), (0x1234, 1, 1, false)];
        let assignment = assign_physical_slots(&requests);
        assert_eq!(assignment[0], assignment[1]);
    }

    #[test]
    fn test_aliasing_rejects_overlapping_lifetimes() {
        // Both alive in pass 1: no aliasing.
        let requests = vec![(0x1234, 0, 1, false), (0x1234, 1, 2, false)];
        let assignment = assign_physical_slots(&requests);
        assert_ne!(assignment[0], assignment[1]);
    }

    #[test]
    fn test_aliasing_requires_matching_desc() {
        let requests = vec![(0x1234, 0, 0, false), (0x9999, 1, 1, false)];
        let assignment = assign_physical_slots(&requests);
        assert_ne!(assignment[0], assignment[1]);
    }

    #[test]
    fn test_imported_never_aliases() {
        let requests = vec![(0x1234, 0, 0, true), (0x1234, 1, 1, false), (0x1234, 2, 2, true)];
        let assignment = assign_physical_slots(&requests);
        assert_ne!(assignment[0], assignment[1]);
        assert_ne!(assignment[0], assignment[2]);
        assert_ne!(assignment[1], assignment[2]);
    }

    #[test]
    fn test_aliasing_chain_reuses_one_slot() {
        // Three sequential transients collapse onto one physical slot.
        let requests = vec![
            (0xAB, 0, 0, false),
            (0xAB, 1, 1, false),
            (0xAB, 2, 2, false),
        ];
        let assignment = assign_physical_slots(&requests);
        assert_eq!(assignment[0], assignment[1]);
        assert_eq!(assignment[1], assignment[2]);
    }
}
