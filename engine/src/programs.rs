/// Compiled effect programs, one slot per effect kind
use common::EffectKind;

use crate::backend::{GpuDevice, ProgramHandle};
use crate::error::EngineError;

/// Built-in WGSL source of an effect
pub fn builtin_source(kind: EffectKind) -> &'static str {
    match kind {
        EffectKind::Copy => include_str!("shaders/copy.wgsl"),
        EffectKind::Flip => include_str!("shaders/flip.wgsl"),
        EffectKind::Mirror => include_str!("shaders/mirror.wgsl"),
        EffectKind::Swap => include_str!("shaders/swap.wgsl"),
        EffectKind::Blur => include_str!("shaders/blur.wgsl"),
        EffectKind::Sharpen => include_str!("shaders/sharpen.wgsl"),
        EffectKind::AdaptiveSharpen => include_str!("shaders/adaptive_sharpen.wgsl"),
        EffectKind::Adjust => include_str!("shaders/adjust.wgsl"),
        EffectKind::Temperature => include_str!("shaders/temperature.wgsl"),
    }
}

#[derive(Debug, Default)]
pub struct ProgramCache {
    slots: [Option<ProgramHandle>; EffectKind::COUNT],
    overrides: [Option<String>; EffectKind::COUNT],
    compiles: usize,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the source of an effect; used by the next compilation of `kind`.
    pub fn set_override(&mut self, kind: EffectKind, source: String) {
        self.overrides[kind.index()] = Some(source);
    }

    pub fn source(&self, kind: EffectKind) -> &str {
        self.overrides[kind.index()]
            .as_deref()
            .unwrap_or_else(|| builtin_source(kind))
    }

    pub fn get(&self, kind: EffectKind) -> Option<ProgramHandle> {
        self.slots[kind.index()]
    }

    /// Number of successful compilations so far
    pub fn compiles(&self) -> usize {
        self.compiles
    }

    /// Return the program of `kind`, compiling it on first use.
    ///
    /// A failed compilation is not cached; the next call tries again.
    pub fn get_or_compile(
        &mut self,
        device: &mut dyn GpuDevice,
        kind: EffectKind,
    ) -> Result<ProgramHandle, EngineError> {
        if let Some(program) = self.slots[kind.index()] {
            return Ok(program);
        }

        let source = self.source(kind);
        if source.trim().is_empty() {
            return Err(EngineError::EmptySource(kind));
        }

        match device.compile_program(kind, source) {
            Ok(program) => {
                log::debug!("Compiled {} program", kind);
                self.slots[kind.index()] = Some(program);
                self.compiles += 1;
                Ok(program)
            }
            Err(e) => {
                log::warn!("Failed to compile {} program: {}", kind, e);
                Err(EngineError::Compile { kind, source: e })
            }
        }
    }

    /// Release every compiled program
    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        for slot in &mut self.slots {
            if let Some(program) = slot.take() {
                device.release_program(program);
            }
        }
    }

    /// Drop the slot of one kind; the caller released its program
    pub fn forget_kind(&mut self, kind: EffectKind) {
        self.slots[kind.index()] = None;
    }

    /// Forget programs without touching the device (the device is gone)
    pub fn forget(&mut self) {
        self.slots = [None; EffectKind::COUNT];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ReferenceDevice, ShareRegistry};

    #[test]
    fn test_compiles_once_per_kind() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        let mut cache = ProgramCache::new();

        let first = cache.get_or_compile(&mut device, EffectKind::Blur).unwrap();
        let second = cache.get_or_compile(&mut device, EffectKind::Blur).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.compiles(), 1);
        assert_eq!(device.counters().programs_compiled, 1);

        cache.get_or_compile(&mut device, EffectKind::Swap).unwrap();
        assert_eq!(cache.compiles(), 2);
    }

    #[test]
    fn test_failure_is_retried() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        device.faults_mut().fail_compile.insert(EffectKind::Adjust);
        let mut cache = ProgramCache::new();

        assert!(matches!(
            cache.get_or_compile(&mut device, EffectKind::Adjust),
            Err(EngineError::Compile { kind: EffectKind::Adjust, .. })
        ));
        assert!(cache.get(EffectKind::Adjust).is_none());

        device.faults_mut().fail_compile.clear();
        assert!(cache.get_or_compile(&mut device, EffectKind::Adjust).is_ok());
    }

    #[test]
    fn test_empty_override() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        let mut cache = ProgramCache::new();
        cache.set_override(EffectKind::Copy, "  ".to_string());
        assert!(matches!(
            cache.get_or_compile(&mut device, EffectKind::Copy),
            Err(EngineError::EmptySource(EffectKind::Copy))
        ));
        assert_eq!(device.counters().programs_compiled, 0);
    }

    #[test]
    fn test_builtin_sources_are_compute_programs() {
        for kind in EffectKind::ALL {
            let source = builtin_source(kind);
            assert!(source.contains("@compute"), "{} has no compute entry point", kind);
            assert!(source.contains("fn main"));
        }
    }

    #[test]
    fn test_release_frees_programs() {
        let mut device = ReferenceDevice::new(ShareRegistry::new());
        let mut cache = ProgramCache::new();
        cache.get_or_compile(&mut device, EffectKind::Flip).unwrap();
        cache.release(&mut device);
        assert_eq!(device.live_programs(), 0);
        assert!(cache.get(EffectKind::Flip).is_none());
    }
}
