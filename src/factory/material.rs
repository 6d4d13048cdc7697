//! Material Composition
//!
//! A material is assembled from a registered [`MaterialPlan`]: techniques,
//! each a list of passes, each pass referencing a program, samplers,
//! file-backed textures, an optional parameter block backed by a constant
//! buffer and an optional render target. Creating a material creates every
//! referenced resource through the sibling factories (sharing whatever the
//! keyed caches already hold) and records one dependency edge per reference.
//!
//! The material's own build is a finalize step: it waits for every
//! referenced resource to settle and then reports success iff the program,
//! the textures and the parameter buffers of every pass loaded. Samplers
//! and render targets settle independently and do not gate the material.
//!
//! Materials are deduplicated by plan name and variant.
//! [`MaterialFactory::clone_material`] produces an independently
//! parameterized instance that shares the immutable references.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use futures::future::join_all;
use glam::Vec4;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::KeyedCache;
use crate::device::{FrameBufferDesc, HwUsage, SamplerDesc, ShaderCompileDesc, TextureDesc};
use crate::errors::Result;
use crate::factory::objects::{BufferResource, FrameBufferResource, SamplerResource};
use crate::factory::program::{ProgramKey, ProgramResource};
use crate::factory::texture::TextureResource;
use crate::manager::{ManagerCore, ResourceManager};
use crate::resource::{DeviceResource, LoadGuard, LoadWatch, ResourceCore, ResourceId, ResourceKind};
use crate::task::{BuildFuture, Launch};

// ============================================================================
// Plans
// ============================================================================

/// A named constant-buffer parameter with its default value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    pub name: String,
    pub default: Vec4,
}

impl ParamDef {
    #[must_use]
    pub fn new(name: impl Into<String>, default: Vec4) -> Self {
        Self {
            name: name.into(),
            default,
        }
    }
}

/// A texture reference inside a pass plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TexturePlan {
    pub path: String,
    pub desc: TextureDesc,
}

/// One pass of a technique.
#[derive(Debug, Clone, Default)]
pub struct PassPlan {
    pub name: String,
    /// Shader source name shared by both stages.
    pub shader: String,
    pub vertex: ShaderCompileDesc,
    pub pixel: ShaderCompileDesc,
    pub samplers: Vec<SamplerDesc>,
    pub textures: Vec<TexturePlan>,
    pub params: Vec<ParamDef>,
    pub target: Option<FrameBufferDesc>,
}

/// One technique, an ordered list of passes.
#[derive(Debug, Clone, Default)]
pub struct TechniquePlan {
    pub name: String,
    pub passes: Vec<PassPlan>,
}

/// Recipe a material is instantiated from.
#[derive(Debug, Clone, Default)]
pub struct MaterialPlan {
    pub name: String,
    pub variant: String,
    pub techniques: Vec<TechniquePlan>,
}

/// Deduplication key for materials.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MaterialKey {
    pub name: String,
    pub variant: String,
}

impl MaterialKey {
    #[must_use]
    pub fn new(name: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variant: variant.into(),
        }
    }
}

impl fmt::Display for MaterialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.variant.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}:{}", self.name, self.variant)
        }
    }
}

/// Registry of material plans, looked up by name and variant at creation.
#[derive(Debug, Default)]
pub struct MaterialPlanSource {
    plans: Mutex<FxHashMap<MaterialKey, Arc<MaterialPlan>>>,
}

impl MaterialPlanSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plan` under its name and variant, replacing any previous
    /// registration. Materials already created keep their old recipe.
    pub fn register(&self, plan: MaterialPlan) {
        let key = MaterialKey::new(plan.name.clone(), plan.variant.clone());
        self.plans.lock().insert(key, Arc::new(plan));
    }

    #[must_use]
    pub fn lookup(&self, key: &MaterialKey) -> Option<Arc<MaterialPlan>> {
        self.plans.lock().get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.lock().is_empty()
    }
}

// ============================================================================
// Parameter block
// ============================================================================

/// Named `Vec4` parameters backing one constant buffer.
///
/// Values are 16 bytes each, laid out in declaration order. Writes mark the
/// block dirty; [`MaterialResource::flush_params`] pushes dirty blocks to
/// the device in one call per block.
pub struct ParameterBlock {
    names: Arc<[String]>,
    values: Mutex<Vec<Vec4>>,
    dirty: AtomicBool,
    buffer: Arc<BufferResource>,
}

impl ParameterBlock {
    fn new(names: Arc<[String]>, values: Vec<Vec4>, buffer: Arc<BufferResource>) -> Self {
        Self {
            names,
            values: Mutex::new(values),
            dirty: AtomicBool::new(false),
            buffer,
        }
    }

    /// The constant buffer this block uploads into.
    #[must_use]
    pub fn buffer(&self) -> &Arc<BufferResource> {
        &self.buffer
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// Updates a parameter by name. Returns `false` for unknown names.
    pub fn set(&self, name: &str, value: Vec4) -> bool {
        let Some(index) = self.index_of(name) else {
            return false;
        };
        self.values.lock()[index] = value;
        self.dirty.store(true, Ordering::Release);
        true
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Vec4> {
        let index = self.index_of(name)?;
        Some(self.values.lock()[index])
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn snapshot_values(&self) -> Vec<Vec4> {
        self.values.lock().clone()
    }

    fn snapshot_bytes(&self) -> Vec<u8> {
        pack_values(&self.values.lock())
    }
}

/// Byte image of a value list, 16 bytes per parameter, little endian.
fn pack_values(values: &[Vec4]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 16);
    for value in values {
        for component in value.to_array() {
            bytes.extend_from_slice(&component.to_le_bytes());
        }
    }
    bytes
}

// ============================================================================
// Instantiated passes and techniques
// ============================================================================

/// One realized pass holding its resource references.
pub struct Pass {
    name: String,
    program: Arc<ProgramResource>,
    samplers: Vec<Arc<SamplerResource>>,
    textures: Vec<Arc<TextureResource>>,
    params: Option<ParameterBlock>,
    target: Option<Arc<FrameBufferResource>>,
}

impl Pass {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn program(&self) -> &Arc<ProgramResource> {
        &self.program
    }

    #[must_use]
    pub fn samplers(&self) -> &[Arc<SamplerResource>] {
        &self.samplers
    }

    #[must_use]
    pub fn textures(&self) -> &[Arc<TextureResource>] {
        &self.textures
    }

    #[must_use]
    pub fn params(&self) -> Option<&ParameterBlock> {
        self.params.as_ref()
    }

    #[must_use]
    pub fn target(&self) -> Option<&Arc<FrameBufferResource>> {
        self.target.as_ref()
    }

    /// Loaded iff the program, every texture and the parameter buffer
    /// loaded. Samplers and the render target settle on their own and are
    /// not part of the conjunction.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.program.is_loaded()
            && self.textures.iter().all(|t| t.is_loaded())
            && self.params.as_ref().is_none_or(|p| p.buffer.is_loaded())
    }

    fn first_unloaded_reference(&self) -> Option<String> {
        if !self.program.is_loaded() {
            return Some(self.program.core().label().to_string());
        }
        if let Some(texture) = self.textures.iter().find(|t| !t.is_loaded()) {
            return Some(texture.core().label().to_string());
        }
        match &self.params {
            Some(p) if !p.buffer.is_loaded() => Some(p.buffer.core().label().to_string()),
            _ => None,
        }
    }

    // Everything the finalize step must wait for before judging the pass.
    fn watches(&self, out: &mut Vec<LoadWatch>) {
        out.push(self.program.core().watch());
        for texture in &self.textures {
            out.push(texture.core().watch());
        }
        if let Some(params) = &self.params {
            out.push(params.buffer.core().watch());
        }
        for sampler in &self.samplers {
            out.push(sampler.core().watch());
        }
        if let Some(target) = &self.target {
            out.push(target.core().watch());
        }
    }
}

/// One realized technique.
pub struct Technique {
    name: String,
    passes: Vec<Pass>,
}

impl Technique {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.passes.iter().all(Pass::is_loaded)
    }
}

// ============================================================================
// Resource
// ============================================================================

/// A material instance: techniques, an active technique index and named
/// parameters spread over its passes' blocks.
pub struct MaterialResource {
    core: ResourceCore,
    key: MaterialKey,
    techniques: OnceLock<Vec<Technique>>,
    active: AtomicUsize,
}

impl MaterialResource {
    fn new(id: ResourceId, key: MaterialKey) -> Self {
        let label = format!("material {key}");
        Self {
            core: ResourceCore::new(id, label),
            key,
            techniques: OnceLock::new(),
            active: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn key(&self) -> &MaterialKey {
        &self.key
    }

    fn install(&self, techniques: Vec<Technique>) {
        let _ = self.techniques.set(techniques);
    }

    /// All techniques; empty until instantiation (and forever for a
    /// material whose plan was never registered).
    #[must_use]
    pub fn techniques(&self) -> &[Technique] {
        self.techniques.get().map_or(&[], Vec::as_slice)
    }

    /// The currently selected technique, if the index is valid.
    #[must_use]
    pub fn active_technique(&self) -> Option<&Technique> {
        self.techniques().get(self.active.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Selects a technique by index. Returns `false` when out of range.
    pub fn select_technique(&self, index: usize) -> bool {
        if index >= self.techniques().len() {
            return false;
        }
        self.active.store(index, Ordering::Release);
        true
    }

    /// Selects a technique by name. Returns `false` when unknown.
    pub fn select_technique_named(&self, name: &str) -> bool {
        match self.techniques().iter().position(|t| t.name() == name) {
            Some(index) => self.select_technique(index),
            None => false,
        }
    }

    /// Sets `name` in every pass block that declares it, across all
    /// techniques. Returns `false` if no block knows the name.
    pub fn set_param(&self, name: &str, value: Vec4) -> bool {
        let mut hit = false;
        for technique in self.techniques() {
            for pass in technique.passes() {
                if let Some(params) = pass.params() {
                    hit |= params.set(name, value);
                }
            }
        }
        hit
    }

    /// First declared value of `name` across all pass blocks.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<Vec4> {
        self.techniques()
            .iter()
            .flat_map(Technique::passes)
            .filter_map(Pass::params)
            .find_map(|p| p.get(name))
    }

    /// Pushes every dirty parameter block to the device. Render thread
    /// only. Returns how many buffers were updated; a rejected update
    /// leaves its block dirty for the next flush.
    pub fn flush_params(&self, manager: &ResourceManager) -> Result<usize> {
        let mut flushed = 0;
        for technique in self.techniques() {
            for pass in technique.passes() {
                let Some(params) = pass.params() else {
                    continue;
                };
                if !params.take_dirty() {
                    continue;
                }
                let bytes = params.snapshot_bytes();
                if manager.update_buffer(params.buffer(), &bytes)? {
                    flushed += 1;
                } else {
                    params.mark_dirty();
                }
            }
        }
        Ok(flushed)
    }

    fn gating_watches(&self) -> Vec<LoadWatch> {
        let mut watches = Vec::new();
        for technique in self.techniques() {
            for pass in technique.passes() {
                pass.watches(&mut watches);
            }
        }
        watches
    }

    fn first_unloaded_reference(&self) -> Option<String> {
        self.techniques()
            .iter()
            .flat_map(Technique::passes)
            .find_map(Pass::first_unloaded_reference)
    }
}

impl DeviceResource for MaterialResource {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Material
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Instantiates materials from registered plans and clones existing ones.
pub struct MaterialFactory {
    core: Arc<ManagerCore>,
    cache: KeyedCache<MaterialKey, Arc<MaterialResource>>,
    plans: Arc<MaterialPlanSource>,
}

impl MaterialFactory {
    pub(crate) fn new(core: Arc<ManagerCore>, plans: Arc<MaterialPlanSource>) -> Self {
        Self {
            core,
            cache: KeyedCache::new(),
            plans,
        }
    }

    /// Returns the shared material for `name` + `variant`, instantiating it
    /// from the registered plan on the first request.
    ///
    /// An unregistered plan still yields a valid handle; it settles as
    /// failed immediately and stays that way.
    pub fn create_material(
        &self,
        manager: &ResourceManager,
        launch: Launch,
        name: &str,
        variant: &str,
    ) -> Result<Arc<MaterialResource>> {
        self.core.ensure_live()?;
        let key = MaterialKey::new(name, variant);
        let (res, inserted) = self.cache.get_or_add(&key, || {
            self.core.register(|id| MaterialResource::new(id, key.clone()))
        });
        if !inserted {
            if launch == Launch::Sync && !res.is_load_complete() {
                self.core.wait_settled(res.as_ref())?;
            }
            return Ok(res);
        }

        let Some(plan) = self.plans.lookup(&key) else {
            let diagnostic = format!("no material plan registered for {key}");
            log::warn!("{diagnostic}");
            res.set_prepared();
            res.core().record_failure(diagnostic);
            res.set_loaded(false);
            return Ok(res);
        };

        res.core().set_origin(format!("plan {key}"));
        res.set_prepared();
        self.core.track(res.core().id());
        let techniques = self.instantiate(manager, launch, res.core().id(), &plan)?;
        res.install(techniques);

        let body = finalize_body(Arc::clone(&res));
        self.core.queue_build(res.core().id(), launch, body);
        if launch == Launch::Sync {
            self.core.drive_now(res.core().id())?;
        }
        Ok(res)
    }

    /// Creates an independently parameterized instance of `proto`.
    ///
    /// Programs, samplers, textures and render targets are shared by
    /// reference; parameter blocks are re-created with freshly built
    /// constant buffers carrying the prototype's current values. The clone
    /// is registered as its own resource and never enters the keyed cache.
    pub fn clone_material(
        &self,
        manager: &ResourceManager,
        launch: Launch,
        proto: &Arc<MaterialResource>,
    ) -> Result<Arc<MaterialResource>> {
        self.core.ensure_live()?;
        let res = self.core.register(|id| MaterialResource::new(id, proto.key().clone()));
        res.core().set_origin(format!("clone of {}", proto.core().label()));
        res.set_prepared();
        self.core.track(res.core().id());

        let id = res.core().id();
        let mut techniques = Vec::with_capacity(proto.techniques().len());
        for technique in proto.techniques() {
            let mut passes = Vec::with_capacity(technique.passes().len());
            for pass in technique.passes() {
                self.core.add_dependency(id, pass.program().as_ref());
                for texture in pass.textures() {
                    self.core.add_dependency(id, texture.as_ref());
                }
                let params = match pass.params() {
                    Some(block) => {
                        let values = block.snapshot_values();
                        let bytes = pack_values(&values);
                        let buffer = manager.create_const_buffer(
                            launch,
                            block.buffer().desc().usage,
                            bytes.len(),
                            bytes,
                        )?;
                        self.core.add_dependency(id, buffer.as_ref());
                        Some(ParameterBlock::new(Arc::clone(&block.names), values, buffer))
                    }
                    None => None,
                };
                passes.push(Pass {
                    name: pass.name().to_string(),
                    program: Arc::clone(pass.program()),
                    samplers: pass.samplers().to_vec(),
                    textures: pass.textures().to_vec(),
                    params,
                    target: pass.target().cloned(),
                });
            }
            techniques.push(Technique {
                name: technique.name().to_string(),
                passes,
            });
        }
        res.install(techniques);
        res.select_technique(proto.active_index());

        let body = finalize_body(Arc::clone(&res));
        self.core.queue_build(id, launch, body);
        if launch == Launch::Sync {
            self.core.drive_now(id)?;
        }
        Ok(res)
    }

    fn instantiate(
        &self,
        manager: &ResourceManager,
        launch: Launch,
        id: ResourceId,
        plan: &MaterialPlan,
    ) -> Result<Vec<Technique>> {
        let mut techniques = Vec::with_capacity(plan.techniques.len());
        for technique_plan in &plan.techniques {
            let mut passes = Vec::with_capacity(technique_plan.passes.len());
            for pass_plan in &technique_plan.passes {
                passes.push(self.build_pass(manager, launch, id, pass_plan)?);
            }
            techniques.push(Technique {
                name: technique_plan.name.clone(),
                passes,
            });
        }
        Ok(techniques)
    }

    fn build_pass(
        &self,
        manager: &ResourceManager,
        launch: Launch,
        id: ResourceId,
        plan: &PassPlan,
    ) -> Result<Pass> {
        let program = manager.create_program(
            launch,
            ProgramKey {
                name: plan.shader.clone(),
                vertex: plan.vertex.clone(),
                pixel: plan.pixel.clone(),
            },
        )?;
        self.core.add_dependency(id, program.as_ref());

        let mut samplers = Vec::with_capacity(plan.samplers.len());
        for desc in &plan.samplers {
            let sampler = manager.create_sampler(launch, *desc)?;
            self.core.add_dependency(id, sampler.as_ref());
            samplers.push(sampler);
        }

        let mut textures = Vec::with_capacity(plan.textures.len());
        for texture_plan in &plan.textures {
            let texture = manager.create_texture_from_file(
                launch,
                std::path::Path::new(&texture_plan.path),
                texture_plan.desc,
            )?;
            self.core.add_dependency(id, texture.as_ref());
            textures.push(texture);
        }

        let params = if plan.params.is_empty() {
            None
        } else {
            let names: Arc<[String]> =
                plan.params.iter().map(|p| p.name.clone()).collect::<Vec<_>>().into();
            let values: Vec<Vec4> = plan.params.iter().map(|p| p.default).collect();
            let bytes = pack_values(&values);
            let buffer =
                manager.create_const_buffer(launch, HwUsage::Dynamic, bytes.len(), bytes)?;
            self.core.add_dependency(id, buffer.as_ref());
            Some(ParameterBlock::new(names, values, buffer))
        };

        let target = match &plan.target {
            Some(desc) => {
                let frame_buffer = manager.create_frame_buffer(launch, desc.clone())?;
                self.core.add_dependency(id, frame_buffer.as_ref());
                Some(frame_buffer)
            }
            None => None,
        };

        Ok(Pass {
            name: plan.name.clone(),
            program,
            samplers,
            textures,
            params,
            target,
        })
    }

    pub(crate) fn purge(&self) {
        self.cache.clear();
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

/// Finalize step queued as the material's build: wait for every referenced
/// resource, then judge the loaded conjunction.
fn finalize_body(res: Arc<MaterialResource>) -> BuildFuture {
    let guard = LoadGuard::new(Arc::clone(&res) as Arc<dyn DeviceResource>);
    async move {
        res.set_loading();
        join_all(res.gating_watches().into_iter().map(LoadWatch::wait)).await;
        match res.first_unloaded_reference() {
            None => guard.finish(true),
            Some(reference) => {
                guard.fail(format!("referenced resource did not load: {reference}"));
            }
        }
    }
    .boxed()
}
