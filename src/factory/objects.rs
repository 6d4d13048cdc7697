//! Device Object Wrappers
//!
//! Tracked resources for the simple backend objects: buffers, samplers,
//! frame buffers and input layouts. Their builds are a single render-domain
//! upload; none of them are deduplicated, every create call yields a fresh
//! resource.

use std::sync::Arc;

use crate::device::{
    BufferDesc, BufferKind, DeviceHandle, DeviceResourceKind, FrameBufferDesc, InputLayoutDesc,
    SamplerDesc,
};
use crate::errors::Result;
use crate::factory::program::ProgramResource;
use crate::factory::upload_body;
use crate::manager::ManagerCore;
use crate::resource::{DeviceResource, ResourceCore, ResourceId, ResourceKind};
use crate::task::Launch;

// ============================================================================
// Resource wrappers
// ============================================================================

/// A vertex, index or constant buffer.
pub struct BufferResource {
    core: ResourceCore,
    desc: BufferDesc,
    handle: DeviceHandle,
}

impl BufferResource {
    fn new(id: ResourceId, desc: BufferDesc, handle: DeviceHandle) -> Self {
        let label = format!("{:?} buffer ({} bytes)", desc.kind, desc.size);
        Self {
            core: ResourceCore::new(id, label),
            desc,
            handle,
        }
    }

    #[must_use]
    pub fn desc(&self) -> BufferDesc {
        self.desc
    }

    #[must_use]
    pub fn device_handle(&self) -> DeviceHandle {
        self.handle
    }
}

impl DeviceResource for BufferResource {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        match self.desc.kind {
            BufferKind::Vertex => ResourceKind::VertexBuffer,
            BufferKind::Index => ResourceKind::IndexBuffer,
            BufferKind::Const => ResourceKind::ConstBuffer,
        }
    }
}

/// A sampler state object.
pub struct SamplerResource {
    core: ResourceCore,
    desc: SamplerDesc,
    handle: DeviceHandle,
}

impl SamplerResource {
    fn new(id: ResourceId, desc: SamplerDesc, handle: DeviceHandle) -> Self {
        let label = format!("sampler {:?}/{:?}", desc.filter, desc.address);
        Self {
            core: ResourceCore::new(id, label),
            desc,
            handle,
        }
    }

    #[must_use]
    pub fn desc(&self) -> SamplerDesc {
        self.desc
    }

    #[must_use]
    pub fn device_handle(&self) -> DeviceHandle {
        self.handle
    }
}

impl DeviceResource for SamplerResource {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Sampler
    }
}

/// A render target with its attachments.
pub struct FrameBufferResource {
    core: ResourceCore,
    desc: FrameBufferDesc,
    handle: DeviceHandle,
}

impl FrameBufferResource {
    fn new(id: ResourceId, desc: FrameBufferDesc, handle: DeviceHandle) -> Self {
        let label = format!("frame buffer {}x{}", desc.width, desc.height);
        Self {
            core: ResourceCore::new(id, label),
            desc,
            handle,
        }
    }

    #[must_use]
    pub fn desc(&self) -> &FrameBufferDesc {
        &self.desc
    }

    #[must_use]
    pub fn device_handle(&self) -> DeviceHandle {
        self.handle
    }
}

impl DeviceResource for FrameBufferResource {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::FrameBuffer
    }
}

/// A vertex input layout, valid only against its program.
pub struct InputLayoutResource {
    core: ResourceCore,
    desc: InputLayoutDesc,
    handle: DeviceHandle,
    program: Arc<ProgramResource>,
}

impl InputLayoutResource {
    fn new(
        id: ResourceId,
        desc: InputLayoutDesc,
        handle: DeviceHandle,
        program: Arc<ProgramResource>,
    ) -> Self {
        let label = format!("input layout ({} elements)", desc.elements.len());
        Self {
            core: ResourceCore::new(id, label),
            desc,
            handle,
            program,
        }
    }

    #[must_use]
    pub fn desc(&self) -> &InputLayoutDesc {
        &self.desc
    }

    #[must_use]
    pub fn device_handle(&self) -> DeviceHandle {
        self.handle
    }

    /// The program this layout was validated against.
    #[must_use]
    pub fn program(&self) -> &Arc<ProgramResource> {
        &self.program
    }
}

impl DeviceResource for InputLayoutResource {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::InputLayout
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Creates and schedules the simple device objects.
pub struct DeviceObjectFactory {
    core: Arc<ManagerCore>,
}

impl DeviceObjectFactory {
    pub(crate) fn new(core: Arc<ManagerCore>) -> Self {
        Self { core }
    }

    /// Creates a buffer and schedules its upload with `initial` contents.
    /// An empty `initial` leaves allocation to the backend.
    pub fn create_buffer(
        &self,
        launch: Launch,
        desc: BufferDesc,
        initial: Vec<u8>,
    ) -> Result<Arc<BufferResource>> {
        self.core.ensure_live()?;
        let shell = self.core.device.create(shell_kind(desc.kind));
        let res = self.core.register(|id| BufferResource::new(id, desc, shell));
        res.set_prepared();
        self.core.track(res.core().id());

        let device = Arc::clone(&self.core.device);
        let body = upload_body(
            self.core.scheduler.dispatcher(),
            Arc::clone(&res) as Arc<dyn DeviceResource>,
            move || {
                if shell.is_null() {
                    return Err("device refused to allocate a buffer object".into());
                }
                Ok(device.load_buffer(shell, &desc, &initial))
            },
        );
        self.core.queue_build(res.core().id(), launch, body);
        if launch == Launch::Sync {
            self.core.drive_now(res.core().id())?;
        }
        Ok(res)
    }

    /// Creates a sampler state object.
    pub fn create_sampler(
        &self,
        launch: Launch,
        desc: SamplerDesc,
    ) -> Result<Arc<SamplerResource>> {
        self.core.ensure_live()?;
        let shell = self.core.device.create(DeviceResourceKind::Sampler);
        let res = self.core.register(|id| SamplerResource::new(id, desc, shell));
        res.set_prepared();
        self.core.track(res.core().id());

        let device = Arc::clone(&self.core.device);
        let body = upload_body(
            self.core.scheduler.dispatcher(),
            Arc::clone(&res) as Arc<dyn DeviceResource>,
            move || {
                if shell.is_null() {
                    return Err("device refused to allocate a sampler object".into());
                }
                Ok(device.load_sampler(shell, &desc))
            },
        );
        self.core.queue_build(res.core().id(), launch, body);
        if launch == Launch::Sync {
            self.core.drive_now(res.core().id())?;
        }
        Ok(res)
    }

    /// Creates a frame buffer with the described attachments.
    pub fn create_frame_buffer(
        &self,
        launch: Launch,
        desc: FrameBufferDesc,
    ) -> Result<Arc<FrameBufferResource>> {
        self.core.ensure_live()?;
        let shell = self.core.device.create(DeviceResourceKind::FrameBuffer);
        let res = self.core.register(|id| FrameBufferResource::new(id, desc.clone(), shell));
        res.set_prepared();
        self.core.track(res.core().id());

        let device = Arc::clone(&self.core.device);
        let body = upload_body(
            self.core.scheduler.dispatcher(),
            Arc::clone(&res) as Arc<dyn DeviceResource>,
            move || {
                if shell.is_null() {
                    return Err("device refused to allocate a frame buffer object".into());
                }
                Ok(device.load_frame_buffer(shell, &desc))
            },
        );
        self.core.queue_build(res.core().id(), launch, body);
        if launch == Launch::Sync {
            self.core.drive_now(res.core().id())?;
        }
        Ok(res)
    }

    /// Creates an input layout validated against `program`. The layout
    /// depends on the program: it is not driven until the program reaches a
    /// terminal state, and fails if the program did not link.
    pub fn create_input_layout(
        &self,
        launch: Launch,
        desc: InputLayoutDesc,
        program: &Arc<ProgramResource>,
    ) -> Result<Arc<InputLayoutResource>> {
        self.core.ensure_live()?;
        let shell = self.core.device.create(DeviceResourceKind::InputLayout);
        let res = self.core.register(|id| {
            InputLayoutResource::new(id, desc.clone(), shell, Arc::clone(program))
        });
        res.set_prepared();
        self.core.track(res.core().id());
        self.core.add_dependency(res.core().id(), program.as_ref());

        let device = Arc::clone(&self.core.device);
        let program = Arc::clone(program);
        let body = upload_body(
            self.core.scheduler.dispatcher(),
            Arc::clone(&res) as Arc<dyn DeviceResource>,
            move || {
                if shell.is_null() {
                    return Err("device refused to allocate an input layout object".into());
                }
                if !program.is_loaded() {
                    return Err(format!(
                        "input layout requires a linked program, {} failed",
                        program.core().label()
                    ));
                }
                Ok(device.load_input_layout(shell, program.device_handle(), &desc))
            },
        );
        self.core.queue_build(res.core().id(), launch, body);
        if launch == Launch::Sync {
            // The program may still be in flight from an earlier async
            // request; the validation below needs it terminal.
            if !res.program().is_load_complete() {
                self.core.wait_settled(res.program().as_ref())?;
            }
            self.core.drive_now(res.core().id())?;
        }
        Ok(res)
    }
}

fn shell_kind(kind: BufferKind) -> DeviceResourceKind {
    match kind {
        BufferKind::Vertex => DeviceResourceKind::VertexBuffer,
        BufferKind::Index => DeviceResourceKind::IndexBuffer,
        BufferKind::Const => DeviceResourceKind::ConstBuffer,
    }
}
