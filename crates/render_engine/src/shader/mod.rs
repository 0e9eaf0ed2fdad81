//! Shader modules and the interning shader library
//!
//! SPIR-V byte code is the only ingest format; compilation from source is an
//! external concern behind [`ShaderSourceProvider`]. Modules are interned by
//! `(name, defines)`; the first request schedules a background load whose
//! completion is observed through the handle's wait group.

pub mod reflection;

use std::sync::Arc;

use ash::vk;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::device::DeviceCore;
use crate::error::{GfxResult, GraphicsError};
use crate::jobs::{JobSystem, WaitGroup};
use crate::resource::desc_hash;

pub use reflection::{
    ShaderInputAttribute, ShaderReflection, ShaderResourceBinding, ShaderResourceKind,
    ShaderRootConstant, SpecConstant,
};

/// Shader pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Vertex shader
    Vertex,
    /// Fragment shader
    Fragment,
    /// Compute shader
    Compute,
    /// Task (amplification) shader
    Task,
    /// Mesh shader
    Mesh,
}

impl ShaderStage {
    /// Translate to Vulkan stage flags
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::Task => vk::ShaderStageFlags::TASK_EXT,
            ShaderStage::Mesh => vk::ShaderStageFlags::MESH_EXT,
        }
    }
}

/// Ordered preprocessor define list.
///
/// Defines participate in the shader-module cache key: different define sets
/// produce different SPIR-V. The list is kept sorted by name so equal sets
/// hash equally regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ShaderDefines {
    defines: Vec<(String, String)>,
}

impl ShaderDefines {
    /// Empty define set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a define, replacing any previous value of the same name
    pub fn with(mut self, name: &str, value: &str) -> Self {
        match self.defines.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            Ok(index) => self.defines[index].1 = value.to_string(),
            Err(index) => self
                .defines
                .insert(index, (name.to_string(), value.to_string())),
        }
        self
    }

    /// Iterate over `(name, value)` pairs in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.defines.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of defines
    pub fn len(&self) -> usize {
        self.defines.len()
    }

    /// True when no defines are set
    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }

    /// Stable 64-bit hash over the ordered define list
    pub fn hash64(&self) -> u64 {
        desc_hash(self)
    }
}

/// Source of SPIR-V byte code for named shaders.
///
/// Implementations typically resolve `name` against the asset system; the
/// runtime only requires that the returned bytes are valid little-endian
/// SPIR-V compiled with the given defines.
pub trait ShaderSourceProvider: Send + Sync + 'static {
    /// Load the SPIR-V binary for `(name, defines)`
    fn load(&self, name: &str, defines: &ShaderDefines) -> GfxResult<Vec<u8>>;
}

/// Handle into the shader library; cheap to copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderHandle(u32);

struct ShaderSlot {
    module: vk::ShaderModule,
    reflection: Option<Arc<ShaderReflection>>,
    failed: bool,
}

struct ShaderEntry {
    name: String,
    wait_group: Arc<WaitGroup>,
    slot: Mutex<ShaderSlot>,
}

/// Interning cache of shader modules keyed by `(name, defines)`
pub struct ShaderLibrary {
    core: Arc<DeviceCore>,
    provider: Arc<dyn ShaderSourceProvider>,
    jobs: Arc<JobSystem>,
    map: Mutex<FxHashMap<u64, ShaderHandle>>,
    entries: Mutex<Vec<Arc<ShaderEntry>>>,
}

impl ShaderLibrary {
    /// Create the library
    pub fn new(
        core: Arc<DeviceCore>,
        provider: Arc<dyn ShaderSourceProvider>,
        jobs: Arc<JobSystem>,
    ) -> Self {
        Self {
            core,
            provider,
            jobs,
            map: Mutex::new(FxHashMap::default()),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Intern `(name, defines)`: returns an existing handle or schedules a
    /// background load and returns the new pending handle.
    pub fn get_shader(&self, name: &str, defines: &ShaderDefines) -> ShaderHandle {
        let mut key_hasher = fxhash::FxHasher64::default();
        use std::hash::{Hash, Hasher};
        name.hash(&mut key_hasher);
        defines.hash(&mut key_hasher);
        let key = key_hasher.finish();

        let mut map = self.map.lock();
        if let Some(&handle) = map.get(&key) {
            return handle;
        }

        let entry = Arc::new(ShaderEntry {
            name: name.to_string(),
            wait_group: WaitGroup::with_count(1),
            slot: Mutex::new(ShaderSlot {
                module: vk::ShaderModule::null(),
                reflection: None,
                failed: false,
            }),
        });

        let handle = {
            let mut entries = self.entries.lock();
            entries.push(Arc::clone(&entry));
            ShaderHandle((entries.len() - 1) as u32)
        };
        map.insert(key, handle);
        drop(map);

        let core = Arc::clone(&self.core);
        let provider = Arc::clone(&self.provider);
        let defines = defines.clone();
        self.jobs.spawn(move || {
            let result = Self::load_shader(&core, provider.as_ref(), &entry.name, &defines);
            let mut slot = entry.slot.lock();
            match result {
                Ok((module, reflection)) => {
                    slot.module = module;
                    slot.reflection = Some(Arc::new(reflection));
                }
                Err(error) => {
                    log::error!("shader {:?} failed to load: {error}", entry.name);
                    slot.failed = true;
                }
            }
            drop(slot);
            // Signal even on failure so waiters never deadlock.
            entry.wait_group.done();
        });

        handle
    }

    fn load_shader(
        core: &DeviceCore,
        provider: &dyn ShaderSourceProvider,
        name: &str,
        defines: &ShaderDefines,
    ) -> GfxResult<(vk::ShaderModule, ShaderReflection)> {
        let bytes = provider.load(name, defines)?;
        let words = reflection::words_from_bytes(&bytes)?;
        let reflection = reflection::reflect(&words)?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe {
            core.raw()
                .create_shader_module(&create_info, None)
                .map_err(GraphicsError::Api)?
        };
        Ok((module, reflection))
    }

    fn entry(&self, handle: ShaderHandle) -> Arc<ShaderEntry> {
        Arc::clone(&self.entries.lock()[handle.0 as usize])
    }

    /// Wait group that signals when the shader is loaded (or failed)
    pub fn completion_wait_group(&self, handle: ShaderHandle) -> Arc<WaitGroup> {
        Arc::clone(&self.entry(handle).wait_group)
    }

    /// True once the entry finished loading with an error
    pub fn is_failed(&self, handle: ShaderHandle) -> bool {
        self.entry(handle).slot.lock().failed
    }

    /// Native module and entry point. Only valid after the wait group
    /// signaled successfully.
    pub fn module_info(&self, handle: ShaderHandle) -> GfxResult<(vk::ShaderModule, String)> {
        let entry = self.entry(handle);
        debug_assert!(entry.wait_group.is_signaled(), "shader module queried before completion");
        let slot = entry.slot.lock();
        if slot.failed || slot.module == vk::ShaderModule::null() {
            return Err(GraphicsError::Shader(format!(
                "shader {:?} is not available",
                entry.name
            )));
        }
        let entry_point = slot
            .reflection
            .as_ref()
            .map(|r| r.entry_point.clone())
            .unwrap_or_else(|| "main".to_string());
        Ok((slot.module, entry_point))
    }

    /// Reflection data. Only valid after the wait group signaled
    /// successfully.
    pub fn reflection(&self, handle: ShaderHandle) -> GfxResult<Arc<ShaderReflection>> {
        let entry = self.entry(handle);
        debug_assert!(entry.wait_group.is_signaled(), "shader reflection queried before completion");
        let slot = entry.slot.lock();
        slot.reflection.clone().ok_or_else(|| {
            GraphicsError::Shader(format!("shader {:?} has no reflection", entry.name))
        })
    }
}

impl Drop for ShaderLibrary {
    fn drop(&mut self) {
        // Outstanding load jobs still reference the entries; wait for them.
        for entry in self.entries.lock().iter() {
            entry.wait_group.wait();
            let slot = entry.slot.lock();
            if slot.module != vk::ShaderModule::null() {
                unsafe {
                    self.core.raw().destroy_shader_module(slot.module, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defines_order_independent_hash() {
        let a = ShaderDefines::new().with("FEATURE_X", "1").with("LIGHTING", "pbr");
        let b = ShaderDefines::new().with("LIGHTING", "pbr").with("FEATURE_X", "1");
        assert_eq!(a.hash64(), b.hash64());
        assert_eq!(a, b);
    }

    #[test]
    fn test_defines_value_changes_hash() {
        let a = ShaderDefines::new().with("FEATURE_X", "0");
        let b = ShaderDefines::new().with("FEATURE_X", "1");
        assert_ne!(a.hash64(), b.hash64());
    }

    #[test]
    fn test_defines_replace_existing() {
        let defines = ShaderDefines::new().with("A", "1").with("A", "2");
        assert_eq!(defines.len(), 1);
        assert_eq!(defines.iter().next(), Some(("A", "2")));
    }
}
