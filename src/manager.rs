//! Resource Manager
//!
//! This module contains [`ResourceManager`], the coordinator of the whole
//! lifecycle core: it owns the device factory boundary, the task scheduler,
//! the resource arena, the dependency graph and the per-family build
//! factories, and it is the driver the render loop ticks every frame.
//!
//! # Components
//!
//! - **Arena**: stable [`ResourceId`]s mapped to weak resource references,
//!   so bookkeeping never extends resource lifetimes
//! - **`DependencyGraph`**: schedules builds in dependency order by driving
//!   top nodes and retiring settled ones
//! - **Factories**: programs, textures, materials and the simple device
//!   objects, each with its own deduplication policy
//! - **`TaskScheduler`**: the worker pool and the render-thread job queue
//!
//! # Lifecycle
//!
//! 1. Create with [`ResourceManager::new`], handing it a backend
//! 2. Register material plans, create resources from any thread
//! 3. Call [`ResourceManager::update_for_loading`] once per frame from the
//!    render thread; the first caller binds it
//! 4. [`ResourceManager::dispose`] (or drop) aborts in-flight builds and
//!    resolves their resources as failed

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::device::{
    BufferDesc, BufferKind, DeviceFactory, FrameBufferDesc, HwUsage, InputLayoutDesc, SamplerDesc,
    TexelData, TextureDesc,
};
use crate::errors::{KilnError, Result};
use crate::factory::material::{MaterialFactory, MaterialPlan, MaterialPlanSource, MaterialResource};
use crate::factory::objects::{
    BufferResource, DeviceObjectFactory, FrameBufferResource, InputLayoutResource, SamplerResource,
};
use crate::factory::program::{ProgramFactory, ProgramKey, ProgramResource};
use crate::factory::texture::{TextureFactory, TextureResource};
use crate::graph::DependencyGraph;
use crate::resource::{DeviceResource, ResourceId};
use crate::task::{BuildFuture, Launch, TaskScheduler};

/// Tunables captured at manager construction.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Worker pool size for compiles, decodes and file reads.
    pub worker_threads: usize,
    /// Directory holding shader sources; the bytecode cache lives in a
    /// per-platform subdirectory next to them.
    pub shader_dir: PathBuf,
    /// Whether compiled stage bytecode is cached on disk.
    pub bytecode_cache: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            shader_dir: PathBuf::from("shader"),
            bytecode_cache: true,
        }
    }
}

struct PendingBuild {
    launch: Launch,
    body: BuildFuture,
}

/// Shared state the factories build against.
///
/// Split out of [`ResourceManager`] so factories can hold it behind an
/// `Arc` without borrowing the manager itself.
pub(crate) struct ManagerCore {
    pub(crate) device: Arc<dyn DeviceFactory>,
    pub(crate) scheduler: TaskScheduler,
    arena: Mutex<SlotMap<ResourceId, Weak<dyn DeviceResource>>>,
    graph: Mutex<DependencyGraph>,
    pending: Mutex<FxHashMap<ResourceId, PendingBuild>>,
    disposed: AtomicBool,
}

impl ManagerCore {
    fn new(device: Arc<dyn DeviceFactory>, scheduler: TaskScheduler) -> Self {
        Self {
            device,
            scheduler,
            arena: Mutex::new(SlotMap::with_key()),
            graph: Mutex::new(DependencyGraph::new()),
            pending: Mutex::new(FxHashMap::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(KilnError::Disposed("create rejected".into()));
        }
        Ok(())
    }

    /// Allocates an arena id and constructs the resource around it.
    pub(crate) fn register<R: DeviceResource>(
        &self,
        make: impl FnOnce(ResourceId) -> R,
    ) -> Arc<R> {
        let mut arena = self.arena.lock();
        let mut created = None;
        arena.insert_with_key(|id| {
            let res = Arc::new(make(id));
            created = Some(Arc::clone(&res));
            Arc::downgrade(&(res as Arc<dyn DeviceResource>))
        });
        created.expect("insert_with_key always runs its closure")
    }

    fn lookup(&self, id: ResourceId) -> Option<Arc<dyn DeviceResource>> {
        self.arena.lock().get(id).and_then(Weak::upgrade)
    }

    pub(crate) fn track(&self, id: ResourceId) {
        self.graph.lock().track(id);
    }

    /// Records `dependent -> prerequisite`. A prerequisite that already
    /// settled never enters the graph; the dependent is tracked standalone
    /// so it still gets driven.
    pub(crate) fn add_dependency(&self, dependent: ResourceId, prerequisite: &dyn DeviceResource) {
        let mut graph = self.graph.lock();
        if prerequisite.is_load_complete() {
            graph.track(dependent);
        } else {
            graph.add_edge(dependent, prerequisite.core().id());
        }
    }

    pub(crate) fn queue_build(&self, id: ResourceId, launch: Launch, body: BuildFuture) {
        self.pending.lock().insert(id, PendingBuild { launch, body });
    }

    /// Runs the pending build for `id` inline, driving the render queue on
    /// the calling thread. No-op if the build was already dispatched.
    pub(crate) fn drive_now(&self, id: ResourceId) -> Result<()> {
        let build = self.pending.lock().remove(&id);
        if let Some(build) = build {
            self.scheduler.execute_sync(build.body)?;
        }
        Ok(())
    }

    /// One driver tick: pump the render queue, dispatch every prepared top
    /// node, pump again and retire the settled ones. Retirement releases
    /// dependency edges, so dependents surface on a later tick.
    ///
    /// Nodes whose resource handle was dropped are detached; a node whose
    /// resource is already terminal is retired even if this manager never
    /// drove it (its edge may have been added after the build settled).
    pub(crate) fn tick(&self) -> Result<()> {
        self.ensure_live()?;
        let render = self.scheduler.render();
        render.bind_current_thread()?;
        render.pump();

        let tops = self.graph.lock().top_nodes();
        for id in &tops {
            let Some(res) = self.lookup(*id) else {
                continue;
            };
            if !res.is_prepared_need_loading() {
                continue;
            }
            let Some(build) = self.pending.lock().remove(id) else {
                continue;
            };
            log::debug!("driving load of {}", res.core().label());
            match build.launch {
                Launch::Sync => self.scheduler.execute_sync(build.body)?,
                Launch::Async => self.scheduler.spawn(build.body),
            }
        }

        render.pump();

        {
            let mut graph = self.graph.lock();
            let mut pending = self.pending.lock();
            for id in tops {
                match self.lookup(id) {
                    Some(res) if res.is_load_complete() => {
                        log::trace!("retired {} ({:?})", res.core().label(), res.state());
                        pending.remove(&id);
                        graph.remove_node(id);
                    }
                    Some(_) => {}
                    None => {
                        pending.remove(&id);
                        graph.detach(id);
                    }
                }
            }
        }
        self.arena.lock().retain(|_, weak| weak.strong_count() > 0);
        Ok(())
    }

    /// Blocks until `res` settles, ticking the driver from the calling
    /// thread. Must run on (or become) the render thread.
    pub(crate) fn wait_settled(&self, res: &dyn DeviceResource) -> Result<bool> {
        let watch = res.core().watch();
        loop {
            if let Some(outcome) = watch.try_outcome() {
                return Ok(outcome);
            }
            self.tick()?;
            if watch.try_outcome().is_none() {
                self.scheduler.render().pump_one(Duration::from_micros(200));
            }
        }
    }

    /// Removes `id` and everything connected to it from the graph. Pending
    /// bodies are dropped; their load guards resolve the resources as
    /// failed, waking any waiters.
    pub(crate) fn unload_subgraph(&self, id: ResourceId) {
        let mut graph = self.graph.lock();
        let mut pending = self.pending.lock();
        graph.remove_connected_subgraph(id, |removed| {
            pending.remove(&removed);
        });
    }

    pub(crate) fn tracked_count(&self) -> usize {
        self.graph.lock().len()
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("resource manager disposed");
        self.scheduler.abort_spawned();
        self.pending.lock().clear();
        self.graph.lock().clear();
        self.arena.lock().clear();
    }
}

/// The coordinator of the resource lifecycle core.
///
/// All `create_*` methods are callable from any thread and return
/// immediately for [`Launch::Async`]; the driver thread completes those
/// builds over subsequent [`ResourceManager::update_for_loading`] ticks.
/// With [`Launch::Sync`] the creating call drives everything inline and
/// returns with the resource settled.
pub struct ResourceManager {
    core: Arc<ManagerCore>,
    programs: ProgramFactory,
    textures: TextureFactory,
    materials: MaterialFactory,
    objects: DeviceObjectFactory,
    plans: Arc<MaterialPlanSource>,
}

impl ResourceManager {
    /// Builds a manager around `device`.
    pub fn new(device: Arc<dyn DeviceFactory>, options: ManagerOptions) -> Result<Self> {
        let scheduler = TaskScheduler::new(options.worker_threads)?;
        let core = Arc::new(ManagerCore::new(device, scheduler));
        let plans = Arc::new(MaterialPlanSource::new());
        Ok(Self {
            programs: ProgramFactory::new(Arc::clone(&core), &options),
            textures: TextureFactory::new(Arc::clone(&core)),
            materials: MaterialFactory::new(Arc::clone(&core), Arc::clone(&plans)),
            objects: DeviceObjectFactory::new(Arc::clone(&core)),
            plans,
            core,
        })
    }

    // ========================================================================
    // Creation entry points
    // ========================================================================

    /// Shared program for `key`; compiles and links on the first request.
    pub fn create_program(&self, launch: Launch, key: ProgramKey) -> Result<Arc<ProgramResource>> {
        self.programs.create_program(launch, key)
    }

    /// Shared texture for `path` and the desc's format.
    pub fn create_texture_from_file(
        &self,
        launch: Launch,
        path: impl AsRef<std::path::Path>,
        desc: TextureDesc,
    ) -> Result<Arc<TextureResource>> {
        self.textures.create_from_file(launch, path.as_ref(), desc)
    }

    /// Texture from an already decoded payload. Never deduplicated.
    pub fn create_texture_from_data(
        &self,
        launch: Launch,
        label: &str,
        desc: TextureDesc,
        data: TexelData,
    ) -> Result<Arc<TextureResource>> {
        self.textures.create_from_data(launch, label, desc, data)
    }

    pub fn create_vertex_buffer(
        &self,
        launch: Launch,
        usage: HwUsage,
        size: usize,
        stride: usize,
        initial: Vec<u8>,
    ) -> Result<Arc<BufferResource>> {
        let desc = BufferDesc {
            kind: BufferKind::Vertex,
            usage,
            size,
            stride,
        };
        self.objects.create_buffer(launch, desc, initial)
    }

    /// `stride` is the index width in bytes (2 or 4).
    pub fn create_index_buffer(
        &self,
        launch: Launch,
        usage: HwUsage,
        size: usize,
        stride: usize,
        initial: Vec<u8>,
    ) -> Result<Arc<BufferResource>> {
        let desc = BufferDesc {
            kind: BufferKind::Index,
            usage,
            size,
            stride,
        };
        self.objects.create_buffer(launch, desc, initial)
    }

    pub fn create_const_buffer(
        &self,
        launch: Launch,
        usage: HwUsage,
        size: usize,
        initial: Vec<u8>,
    ) -> Result<Arc<BufferResource>> {
        let desc = BufferDesc {
            kind: BufferKind::Const,
            usage,
            size,
            stride: 0,
        };
        self.objects.create_buffer(launch, desc, initial)
    }

    pub fn create_sampler(
        &self,
        launch: Launch,
        desc: SamplerDesc,
    ) -> Result<Arc<SamplerResource>> {
        self.objects.create_sampler(launch, desc)
    }

    pub fn create_frame_buffer(
        &self,
        launch: Launch,
        desc: FrameBufferDesc,
    ) -> Result<Arc<FrameBufferResource>> {
        self.objects.create_frame_buffer(launch, desc)
    }

    /// Input layout validated against `program`; fails if the program does
    /// not link.
    pub fn create_input_layout(
        &self,
        launch: Launch,
        desc: InputLayoutDesc,
        program: &Arc<ProgramResource>,
    ) -> Result<Arc<InputLayoutResource>> {
        self.objects.create_input_layout(launch, desc, program)
    }

    /// Shared material for `name` + `variant`, instantiated from its
    /// registered plan. An unregistered name yields a valid handle that is
    /// permanently failed.
    pub fn create_material(
        &self,
        launch: Launch,
        name: &str,
        variant: &str,
    ) -> Result<Arc<MaterialResource>> {
        self.materials.create_material(self, launch, name, variant)
    }

    /// Independently parameterized instance sharing `proto`'s programs,
    /// samplers, textures and targets.
    pub fn clone_material(
        &self,
        launch: Launch,
        proto: &Arc<MaterialResource>,
    ) -> Result<Arc<MaterialResource>> {
        self.materials.clone_material(self, launch, proto)
    }

    // ========================================================================
    // Plans
    // ========================================================================

    /// The material plan registry.
    #[must_use]
    pub fn plans(&self) -> &MaterialPlanSource {
        &self.plans
    }

    /// Registers a material plan for later [`Self::create_material`] calls.
    pub fn register_plan(&self, plan: MaterialPlan) {
        self.plans.register(plan);
    }

    // ========================================================================
    // Driving
    // ========================================================================

    /// One driver tick. Binds the render service to the calling thread on
    /// first use; the per-frame call site of a render loop.
    pub fn update_for_loading(&self) -> Result<()> {
        self.core.tick()
    }

    /// Blocks until `res` reaches a terminal state, ticking the driver, and
    /// returns whether it loaded. Render thread only.
    pub fn wait_complete(&self, res: &dyn DeviceResource) -> Result<bool> {
        self.core.wait_settled(res)
    }

    /// Records that `dependent` must not be driven before `prerequisite`
    /// settles. `None` tracks the dependent standalone. No-op once the
    /// dependent itself settled.
    pub fn add_resource_dependency(
        &self,
        dependent: &dyn DeviceResource,
        prerequisite: Option<&dyn DeviceResource>,
    ) {
        if dependent.is_load_complete() {
            return;
        }
        match prerequisite {
            Some(prerequisite) => self.core.add_dependency(dependent.core().id(), prerequisite),
            None => self.core.track(dependent.core().id()),
        }
    }

    /// Overwrites a buffer's contents. Render thread only.
    pub fn update_buffer(&self, buffer: &BufferResource, bytes: &[u8]) -> Result<bool> {
        self.core.ensure_live()?;
        if !self.core.scheduler.render().is_render_thread() {
            return Err(KilnError::WrongThread(
                "update_buffer must run on the render thread".into(),
            ));
        }
        Ok(self.core.device.update_buffer(buffer.device_handle(), bytes))
    }

    /// Whether the calling thread is the bound render thread.
    #[must_use]
    pub fn is_render_thread(&self) -> bool {
        self.core.scheduler.render().is_render_thread()
    }

    /// Number of resources still tracked by the dependency graph.
    #[must_use]
    pub fn pending_loads(&self) -> usize {
        self.core.tracked_count()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Removes `res` and everything load-connected to it from the graph.
    /// Undispatched builds in the subgraph resolve as failed.
    pub fn unload(&self, res: &dyn DeviceResource) {
        self.core.unload_subgraph(res.core().id());
    }

    /// Drops every deduplication cache entry. Resources stay alive as long
    /// as someone holds them; later creates build fresh ones.
    pub fn purge_all(&self) {
        log::debug!(
            "purging build caches ({} programs, {} textures, {} materials)",
            self.programs.cached_count(),
            self.textures.cached_count(),
            self.materials.cached_count(),
        );
        self.programs.purge();
        self.textures.purge();
        self.materials.purge();
    }

    /// Aborts in-flight builds, fails their resources and rejects further
    /// creates. Idempotent; also runs on drop.
    pub fn dispose(&self) {
        self.programs.purge();
        self.textures.purge();
        self.materials.purge();
        self.core.dispose();
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
