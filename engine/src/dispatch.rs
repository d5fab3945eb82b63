/// Effect dispatcher - the single path every effect goes through
use common::EffectKind;

use crate::backend::reference::GROUP_SIZE;
use crate::backend::{BackendError, GpuDevice};
use crate::binder::{BindRequest, DispatchTarget, ResourceBinder};
use crate::error::EngineError;
use crate::governor::LoadGovernor;
use crate::programs::ProgramCache;

/// How long `apply` waits for the GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    /// Submit the work and return
    #[default]
    Async,
    /// Submit the work and push it to the GPU, do not wait for it
    Flush,
    /// Submit and block until the GPU has finished
    Wait,
}

/// Outcome of a successful call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Applied,
    /// Skipped this frame by the load governor
    Throttled,
}

/// Thread groups needed to cover `width x height` with one invocation per texel
pub fn group_count(width: u32, height: u32) -> (u32, u32, u32) {
    (width.div_ceil(GROUP_SIZE), height.div_ceil(GROUP_SIZE), 1)
}

pub struct EffectDispatcher<'a> {
    device: &'a mut dyn GpuDevice,
    programs: &'a mut ProgramCache,
    binder: &'a mut ResourceBinder,
    governor: &'a mut LoadGovernor,
}

impl<'a> EffectDispatcher<'a> {
    pub fn new(
        device: &'a mut dyn GpuDevice,
        programs: &'a mut ProgramCache,
        binder: &'a mut ResourceBinder,
        governor: &'a mut LoadGovernor,
    ) -> Self {
        Self {
            device,
            programs,
            binder,
            governor,
        }
    }

    pub fn device(&mut self) -> &mut dyn GpuDevice {
        &mut *self.device
    }

    /// Release views, parameter buffer and parameter cache
    pub fn release_bindings(&mut self) {
        self.binder.release(self.device);
    }

    /// Fail fast on the cheap preconditions: program source and destination
    pub fn check(&self, kind: EffectKind, request: &BindRequest) -> Result<(), EngineError> {
        if self.programs.source(kind).trim().is_empty() {
            return Err(EngineError::EmptySource(kind));
        }
        if self.device.texture_desc(request.dest).is_none() {
            return Err(EngineError::MissingDestination);
        }
        Ok(())
    }

    pub fn apply(
        &mut self,
        kind: EffectKind,
        request: &BindRequest,
        completion: Completion,
    ) -> Result<Dispatch, EngineError> {
        self.check(kind, request)?;
        self.run(kind, request, completion)
    }

    /// Everything after the precondition checks
    pub fn run(
        &mut self,
        kind: EffectKind,
        request: &BindRequest,
        completion: Completion,
    ) -> Result<Dispatch, EngineError> {
        if self.governor.veto() {
            return Ok(Dispatch::Throttled);
        }

        let target = self.binder.bind(self.device, request)?;
        let program = self.programs.get_or_compile(self.device, kind)?;

        self.governor.start_timing(self.device);
        if let Err(e) = self.dispatch(program, &target) {
            self.governor.abandon_timing(self.device);
            return Err(e.into());
        }
        self.governor.end_timing(self.device);

        self.governor.read_timing(self.device);
        self.governor.advance_frame();

        self.complete(completion)?;
        Ok(Dispatch::Applied)
    }

    fn dispatch(&mut self, program: crate::backend::ProgramHandle, target: &DispatchTarget) -> Result<(), BackendError> {
        let device = &mut *self.device;
        device.bind_params(Some(target.params));
        device.bind_read_view(target.read_view);
        device.bind_write_view(Some(target.write_view));
        device.bind_program(Some(program));

        let (x, y, z) = group_count(target.width, target.height);
        let result = device.dispatch(x, y, z);

        // Views must not stay attached once the caller may release the texture
        device.bind_read_view(None);
        device.bind_write_view(None);
        result
    }

    fn complete(&mut self, completion: Completion) -> Result<(), EngineError> {
        match completion {
            Completion::Async => Ok(self.device.submit()?),
            Completion::Flush => Ok(self.device.flush()?),
            Completion::Wait => {
                let fence = self.device.insert_fence()?;
                while !self.device.fence_signaled(fence) {
                    std::thread::yield_now();
                }
                Ok(())
            }
        }
    }
}
