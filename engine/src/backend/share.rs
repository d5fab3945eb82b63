/// Process-level namespace for shareable textures
///
/// A shared handle outlives the device call that produced it and can be
/// opened by any device created on the same adapter. The registry is an
/// explicit value: every device that takes part in sharing is built with a
/// clone of the same registry.
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{AdapterId, OpenSharedError, SharedHandle, TextureDesc};

/// Backend specific texture storage carried by a shared handle
pub type SharedPayload = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct ShareEntry {
    pub adapter: AdapterId,
    pub desc: TextureDesc,
    pub payload: SharedPayload,
}

impl std::fmt::Debug for ShareEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareEntry")
            .field("adapter", &self.adapter)
            .field("desc", &self.desc)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<SharedHandle, ShareEntry>,
}

#[derive(Clone, Default)]
pub struct ShareRegistry {
    state: Arc<Mutex<RegistryState>>,
    next_handle: Arc<AtomicU64>,
    next_adapter: Arc<AtomicU64>,
}

impl ShareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an adapter identity for a device that cannot share with others.
    ///
    /// Identities start at 1; `AdapterId(0)` is left to the reference adapter.
    pub fn allocate_adapter(&self) -> AdapterId {
        AdapterId(self.next_adapter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn register(&self, adapter: AdapterId, desc: TextureDesc, payload: SharedPayload) -> SharedHandle {
        // Handle values look like small kernel handles and are never zero
        let handle = SharedHandle(0x1000 + self.next_handle.fetch_add(1, Ordering::Relaxed) * 4);
        let entry = ShareEntry {
            adapter,
            desc,
            payload,
        };
        self.lock().entries.insert(handle, entry);
        log::debug!("Registered shared handle {} ({}x{} {})", handle, desc.width, desc.height, desc.format);
        handle
    }

    /// Look up a handle on behalf of a device running on `adapter`.
    pub fn open(&self, handle: SharedHandle, adapter: AdapterId) -> Result<ShareEntry, OpenSharedError> {
        let state = self.lock();
        let entry = state
            .entries
            .get(&handle)
            .ok_or(OpenSharedError::UnknownHandle(handle))?;
        if entry.adapter != adapter {
            return Err(OpenSharedError::IncompatibleAdapter(handle));
        }
        Ok(entry.clone())
    }

    /// Find the handle already registered for a payload, if any.
    pub fn handle_of(&self, payload: &SharedPayload) -> Option<SharedHandle> {
        self.lock()
            .entries
            .iter()
            .find(|(_, entry)| Arc::ptr_eq(&entry.payload, payload))
            .map(|(handle, _)| *handle)
    }

    /// Point `handle` at the texture behind `other`, the way a producer that
    /// recreates its surface keeps publishing the same handle.
    ///
    /// Returns false when either handle is unknown.
    pub fn retarget(&self, handle: SharedHandle, other: SharedHandle) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get(&other).cloned() else {
            return false;
        };
        match state.entries.get_mut(&handle) {
            Some(slot) => {
                log::debug!(
                    "Shared handle {} now {}x{} {}",
                    handle,
                    entry.desc.width,
                    entry.desc.height,
                    entry.desc.format
                );
                *slot = entry;
                true
            }
            None => false,
        }
    }

    pub fn unregister(&self, handle: SharedHandle) -> bool {
        self.lock().entries.remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ShareRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TextureUsage;
    use common::PixelFormat;

    fn desc() -> TextureDesc {
        TextureDesc::new(PixelFormat::Rgba8Unorm, 4, 4, TextureUsage::SHAREABLE)
    }

    #[test]
    fn test_open_same_adapter() {
        let registry = ShareRegistry::new();
        let payload: SharedPayload = Arc::new(42u32);
        let handle = registry.register(AdapterId(0), desc(), payload.clone());

        let entry = registry.open(handle, AdapterId(0)).unwrap();
        assert_eq!(entry.desc, desc());
        assert_eq!(registry.handle_of(&payload), Some(handle));
        assert_ne!(handle.0, 0);
    }

    #[test]
    fn test_open_other_adapter_fails() {
        let registry = ShareRegistry::new();
        let adapter = registry.allocate_adapter();
        let handle = registry.register(adapter, desc(), Arc::new(()));

        assert_eq!(
            registry.open(handle, AdapterId(0)).unwrap_err(),
            OpenSharedError::IncompatibleAdapter(handle)
        );
        assert_eq!(
            registry.open(SharedHandle(7), adapter).unwrap_err(),
            OpenSharedError::UnknownHandle(SharedHandle(7))
        );
    }

    #[test]
    fn test_retarget_swaps_the_texture_behind_a_handle() {
        let registry = ShareRegistry::new();
        let first = registry.register(AdapterId(0), desc(), Arc::new(1u32));
        let wider = TextureDesc::new(PixelFormat::Rgba16Float, 8, 2, TextureUsage::SHAREABLE);
        let second = registry.register(AdapterId(0), wider, Arc::new(2u32));

        assert!(registry.retarget(first, second));
        assert_eq!(registry.open(first, AdapterId(0)).unwrap().desc, wider);
        assert!(!registry.retarget(first, SharedHandle(7)));
        assert!(!registry.retarget(SharedHandle(7), first));
    }

    #[test]
    fn test_clones_share_state() {
        let registry = ShareRegistry::new();
        let other = registry.clone();
        let handle = registry.register(AdapterId(0), desc(), Arc::new(()));
        assert_eq!(other.len(), 1);
        assert!(other.unregister(handle));
        assert!(registry.is_empty());
        assert_ne!(registry.allocate_adapter(), other.allocate_adapter());
    }
}
