//! Frame graph blackboard
//!
//! A type-keyed container passes use to publish their outputs (handle
//! structs) to downstream passes. This is the only inter-pass coupling the
//! graph exposes; reset with the graph every frame.

use std::any::{Any, TypeId};

use fxhash::FxHashMap;

/// Type-keyed pass data container
#[derive(Default)]
pub struct FrameGraphBlackboard {
    entries: FxHashMap<TypeId, Box<dyn Any>>,
}

impl FrameGraphBlackboard {
    /// Empty blackboard
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a pass-data value, replacing any previous value of the same
    /// type
    pub fn add<T: 'static>(&mut self, value: T) -> &mut T {
        self.entries.insert(TypeId::of::<T>(), Box::new(value));
        self.entries
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut())
            .expect("value was just inserted")
    }

    /// Look up a pass-data value
    pub fn try_get<T: 'static>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref())
    }

    /// Look up a pass-data value that must exist
    pub fn get_required<T: 'static>(&self) -> &T {
        self.try_get::<T>().unwrap_or_else(|| {
            panic!(
                "blackboard entry {} missing; the producing pass did not run",
                std::any::type_name::<T>()
            )
        })
    }

    /// Mutable lookup
    pub fn try_get_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.entries
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut())
    }

    /// Drop every entry
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Number of published entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is published
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ShadowPassData {
        atlas_index: u32,
    }

    struct LightingPassData {
        output_index: u32,
    }

    #[test]
    fn test_publish_and_consume() {
        let mut blackboard = FrameGraphBlackboard::new();
        blackboard.add(ShadowPassData { atlas_index: 3 });
        blackboard.add(LightingPassData { output_index: 7 });

        assert_eq!(blackboard.get_required::<ShadowPassData>().atlas_index, 3);
        assert_eq!(blackboard.get_required::<LightingPassData>().output_index, 7);
        assert_eq!(blackboard.len(), 2);
    }

    #[test]
    fn test_replaces_same_type() {
        let mut blackboard = FrameGraphBlackboard::new();
        blackboard.add(ShadowPassData { atlas_index: 1 });
        blackboard.add(ShadowPassData { atlas_index: 2 });
        assert_eq!(blackboard.get_required::<ShadowPassData>().atlas_index, 2);
        assert_eq!(blackboard.len(), 1);
    }

    #[test]
    fn test_reset_clears() {
        let mut blackboard = FrameGraphBlackboard::new();
        blackboard.add(ShadowPassData { atlas_index: 1 });
        blackboard.reset();
        assert!(blackboard.try_get::<ShadowPassData>().is_none());
        assert!(blackboard.is_empty());
    }

    #[test]
    #[should_panic(expected = "blackboard entry")]
    fn test_missing_required_panics() {
        let blackboard = FrameGraphBlackboard::new();
        let _ = blackboard.get_required::<ShadowPassData>();
    }
}
