//! Program Build Pipeline
//!
//! Programs are the most expensive resources in the pipeline, so everything
//! here is built around not doing the work twice:
//!
//! - a [`ProgramKey`] deduplicates build requests through the keyed cache;
//!   two callers with an equal key share one resource and one build,
//! - compiled stage bytecode lands in an on-disk cache partitioned by
//!   backend platform, keyed by a fingerprint of the compile request and
//!   invalidated by the shader source's modification time.
//!
//! A build runs in two hops: source read and compilation in the worker
//! domain, shader object creation and program linking in the render domain.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use xxhash_rust::xxh3::xxh3_128;

use crate::cache::KeyedCache;
use crate::device::{
    DeviceFactory, DeviceHandle, DeviceResourceKind, ShaderCompileDesc, ShaderStage,
};
use crate::errors::Result;
use crate::manager::{ManagerCore, ManagerOptions};
use crate::resource::{DeviceResource, LoadGuard, ResourceCore, ResourceId, ResourceKind};
use crate::task::{BuildFuture, Launch};

// ============================================================================
// Key
// ============================================================================

/// Deduplication key for a program build.
///
/// Two keys that compare equal always produce the same linked program, so
/// the factory is free to hand both callers one shared resource. Keys are
/// normalized before use: absent stages stay empty, present stages get the
/// stage default shader model filled in and their macro lists sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    /// Shader source name, resolved as `<shader_dir>/<name>.hlsl`.
    pub name: String,
    pub vertex: ShaderCompileDesc,
    pub pixel: ShaderCompileDesc,
}

impl ProgramKey {
    /// Key for a plain vertex + pixel program with default shader models
    /// and no macros. An empty entry point leaves that stage out.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        vertex_entry: impl Into<String>,
        pixel_entry: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            vertex: ShaderCompileDesc {
                entry_point: vertex_entry.into(),
                ..ShaderCompileDesc::default()
            },
            pixel: ShaderCompileDesc {
                entry_point: pixel_entry.into(),
                ..ShaderCompileDesc::default()
            },
        }
    }

    /// Canonical form used for cache lookups and fingerprints.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        for (stage, desc) in [
            (ShaderStage::Vertex, &mut self.vertex),
            (ShaderStage::Pixel, &mut self.pixel),
        ] {
            if desc.is_present() {
                if desc.shader_model.is_empty() {
                    desc.shader_model = stage.default_model().to_string();
                }
                desc.macros.sort();
            }
        }
        self
    }

    /// Both stage slots paired with their stage tag, absent ones included.
    #[must_use]
    pub fn stages(&self) -> [(ShaderStage, &ShaderCompileDesc); 2] {
        [
            (ShaderStage::Vertex, &self.vertex),
            (ShaderStage::Pixel, &self.pixel),
        ]
    }
}

// ============================================================================
// Resource
// ============================================================================

/// A linked shader program.
pub struct ProgramResource {
    core: ResourceCore,
    key: ProgramKey,
    handle: DeviceHandle,
}

impl ProgramResource {
    fn new(id: ResourceId, key: ProgramKey, handle: DeviceHandle) -> Self {
        let label = format!("program {}", key.name);
        Self {
            core: ResourceCore::new(id, label),
            key,
            handle,
        }
    }

    /// The normalized key this program was built from.
    #[must_use]
    pub fn key(&self) -> &ProgramKey {
        &self.key
    }

    #[must_use]
    pub fn device_handle(&self) -> DeviceHandle {
        self.handle
    }
}

impl DeviceResource for ProgramResource {
    fn core(&self) -> &ResourceCore {
        &self.core
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Program
    }
}

// ============================================================================
// Bytecode disk cache
// ============================================================================

/// On-disk cache of compiled stage bytecode, one directory per backend
/// platform so caches from different backends never mix.
///
/// An entry is fresh while its file is at least as new as the shader
/// source; editing the source invalidates every entry derived from it.
/// Cache writes are best-effort: a failed write costs a recompile later,
/// never the build.
#[derive(Debug, Clone)]
pub(crate) struct BytecodeCache {
    dir: PathBuf,
    enabled: bool,
}

impl BytecodeCache {
    fn new(shader_dir: &Path, platform: &str, enabled: bool) -> Self {
        Self {
            dir: shader_dir.join(format!("asm_{platform}")),
            enabled,
        }
    }

    fn entry_path(&self, fingerprint: u128) -> PathBuf {
        self.dir.join(format!("{fingerprint:032x}.kasm"))
    }

    fn lookup(&self, fingerprint: u128, source: &Path) -> Option<Vec<u8>> {
        if !self.enabled {
            return None;
        }
        let path = self.entry_path(fingerprint);
        let entry_time = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        let source_time = fs::metadata(source).and_then(|m| m.modified()).ok()?;
        if entry_time < source_time {
            return None;
        }
        fs::read(&path).ok()
    }

    fn store(&self, fingerprint: u128, bytecode: &[u8]) {
        if !self.enabled {
            return;
        }
        let write = fs::create_dir_all(&self.dir)
            .and_then(|()| fs::write(self.entry_path(fingerprint), bytecode));
        if let Err(err) = write {
            log::warn!("bytecode cache write failed under {}: {err}", self.dir.display());
        }
    }
}

/// Stable fingerprint of one stage compile request.
fn fingerprint(name: &str, stage: ShaderStage, desc: &ShaderCompileDesc) -> u128 {
    let mut text = format!(
        "src:{name};stage:{};entry:{};sm:{};",
        stage.tag(),
        desc.entry_point,
        desc.model_or_default(stage),
    );
    for (macro_name, value) in &desc.macros {
        text.push_str(macro_name);
        text.push(':');
        text.push_str(value);
        text.push(';');
    }
    xxh3_128(text.as_bytes())
}

// ============================================================================
// Build phases
// ============================================================================

/// Worker-domain phase: produce bytecode for every present stage, from the
/// disk cache when fresh, otherwise by compiling the source.
fn stage_bytecode(
    device: &dyn DeviceFactory,
    cache: &BytecodeCache,
    source_path: &Path,
    key: &ProgramKey,
) -> std::result::Result<Vec<(ShaderStage, Vec<u8>)>, String> {
    let mut source: Option<Vec<u8>> = None;
    let mut blobs = Vec::new();
    for (stage, desc) in key.stages() {
        if !desc.is_present() {
            continue;
        }
        let fingerprint = fingerprint(&key.name, stage, desc);
        if let Some(cached) = cache.lookup(fingerprint, source_path) {
            log::trace!("bytecode cache hit for {} {}", key.name, stage.tag());
            blobs.push((stage, cached));
            continue;
        }
        let src: &[u8] = match &mut source {
            Some(bytes) => bytes,
            slot => slot.insert(fs::read(source_path).map_err(|err| {
                format!("failed to read shader source {}: {err}", source_path.display())
            })?),
        };
        let compiled = device
            .compile_shader(stage, desc, src)
            .map_err(|diagnostic| format!("{} stage of {}: {diagnostic}", stage.tag(), key.name))?;
        cache.store(fingerprint, &compiled);
        blobs.push((stage, compiled));
    }
    Ok(blobs)
}

/// Render-domain phase: realize stage shaders and link them into `program`.
fn link_stage_blobs(
    device: &dyn DeviceFactory,
    program: DeviceHandle,
    name: &str,
    blobs: &[(ShaderStage, Vec<u8>)],
) -> std::result::Result<(), String> {
    let mut shaders = Vec::with_capacity(blobs.len());
    for (stage, bytecode) in blobs {
        let shader = device.create(DeviceResourceKind::Shader);
        if shader.is_null() {
            return Err(format!("device refused to allocate a {} shader object", stage.tag()));
        }
        if !device.load_shader(shader, *stage, bytecode) {
            return Err(format!("device rejected {} bytecode for {name}", stage.tag()));
        }
        shaders.push(shader);
    }
    if !device.load_program(program, &shaders) {
        return Err(format!("device failed to link program {name}"));
    }
    Ok(())
}

// ============================================================================
// Factory
// ============================================================================

/// Builds and deduplicates shader programs.
pub struct ProgramFactory {
    core: Arc<ManagerCore>,
    cache: KeyedCache<ProgramKey, Arc<ProgramResource>>,
    shader_dir: PathBuf,
    bytecode: BytecodeCache,
}

impl ProgramFactory {
    pub(crate) fn new(core: Arc<ManagerCore>, options: &ManagerOptions) -> Self {
        let bytecode = BytecodeCache::new(
            &options.shader_dir,
            core.device.platform(),
            options.bytecode_cache,
        );
        Self {
            core,
            cache: KeyedCache::new(),
            shader_dir: options.shader_dir.clone(),
            bytecode,
        }
    }

    fn source_path(&self, name: &str) -> PathBuf {
        self.shader_dir.join(format!("{name}.hlsl"))
    }

    /// Returns the shared program for `key`, starting a build on the first
    /// request. A `Sync` launch returns with the program settled, even when
    /// it joins a build already in flight.
    pub fn create_program(&self, launch: Launch, key: ProgramKey) -> Result<Arc<ProgramResource>> {
        self.core.ensure_live()?;
        let key = key.normalized();
        let (res, inserted) = self.cache.get_or_add(&key, || {
            let shell = self.core.device.create(DeviceResourceKind::Program);
            self.core.register(|id| ProgramResource::new(id, key.clone(), shell))
        });
        if inserted {
            res.core().set_origin(self.source_path(&key.name).display().to_string());
            res.set_prepared();
            self.core.track(res.core().id());
            let body = self.build_body(launch, &res);
            self.core.queue_build(res.core().id(), launch, body);
            if launch == Launch::Sync {
                self.core.drive_now(res.core().id())?;
            }
        } else if launch == Launch::Sync && !res.is_load_complete() {
            self.core.wait_settled(res.as_ref())?;
        }
        Ok(res)
    }

    fn build_body(&self, launch: Launch, res: &Arc<ProgramResource>) -> BuildFuture {
        let dispatcher = self.core.scheduler.dispatcher();
        let compile_device = Arc::clone(&self.core.device);
        let link_device = Arc::clone(&self.core.device);
        let cache = self.bytecode.clone();
        let source_path = self.source_path(&res.key().name);
        let key = res.key().clone();
        let name = key.name.clone();
        let program = res.device_handle();
        let res = Arc::clone(res);
        let guard = LoadGuard::new(Arc::clone(&res) as Arc<dyn DeviceResource>);
        async move {
            res.set_loading();
            log::debug!("building program {name}");
            if program.is_null() {
                return guard.fail("device refused to allocate a program object");
            }
            let staged = dispatcher
                .offload(launch, move || {
                    stage_bytecode(compile_device.as_ref(), &cache, &source_path, &key)
                })
                .await;
            let blobs = match staged {
                Ok(Ok(blobs)) => blobs,
                Ok(Err(diagnostic)) => return guard.fail(diagnostic),
                Err(err) => return guard.fail(err.to_string()),
            };
            let link_name = name.clone();
            let linked = dispatcher
                .render()
                .run(move || link_stage_blobs(link_device.as_ref(), program, &link_name, &blobs))
                .await;
            match linked {
                Ok(Ok(())) => {
                    log::debug!("program {name} linked");
                    guard.finish(true);
                }
                Ok(Err(diagnostic)) => guard.fail(diagnostic),
                Err(err) => guard.fail(err.to_string()),
            }
        }
        .boxed()
    }

    /// Drops every cached program. In-flight builds keep their resources
    /// alive until they settle.
    pub(crate) fn purge(&self) {
        self.cache.clear();
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kiln-program-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_normalized_fills_default_models_for_present_stages() {
        let key = ProgramKey::new("model", "vs_main", "ps_main").normalized();
        assert_eq!(key.vertex.shader_model, "vs_4_0");
        assert_eq!(key.pixel.shader_model, "ps_4_0");

        let vertex_only = ProgramKey::new("depth", "vs_main", "").normalized();
        assert!(!vertex_only.pixel.is_present());
        assert_eq!(vertex_only.pixel.shader_model, "");
    }

    #[test]
    fn test_normalized_sorts_macros_into_one_key() {
        let mut a = ProgramKey::new("model", "vs_main", "ps_main");
        a.pixel.macros = vec![
            ("SHADOW".into(), "1".into()),
            ("FOG".into(), "1".into()),
        ];
        let mut b = ProgramKey::new("model", "vs_main", "ps_main");
        b.pixel.macros = vec![
            ("FOG".into(), "1".into()),
            ("SHADOW".into(), "1".into()),
        ];
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_fingerprint_separates_stages_and_macros() {
        let key = ProgramKey::new("model", "vs_main", "ps_main").normalized();
        let vs = fingerprint(&key.name, ShaderStage::Vertex, &key.vertex);
        let ps = fingerprint(&key.name, ShaderStage::Pixel, &key.pixel);
        assert_ne!(vs, ps);

        let mut with_macro = key.pixel.clone();
        with_macro.macros.push(("FOG".into(), "1".into()));
        assert_ne!(ps, fingerprint(&key.name, ShaderStage::Pixel, &with_macro));
        assert_eq!(ps, fingerprint(&key.name, ShaderStage::Pixel, &key.pixel));
    }

    #[test]
    fn test_bytecode_cache_round_trip() {
        let dir = scratch_dir("roundtrip");
        let source = dir.join("model.hlsl");
        fs::write(&source, "float4 main() {}").unwrap();

        let cache = BytecodeCache::new(&dir, "mock", true);
        assert_eq!(cache.lookup(7, &source), None);

        cache.store(7, b"DXBC");
        assert_eq!(cache.lookup(7, &source), Some(b"DXBC".to_vec()));
        assert_eq!(cache.lookup(8, &source), None);
    }

    #[test]
    fn test_bytecode_cache_rejects_entries_older_than_source() {
        let dir = scratch_dir("stale");
        let source = dir.join("model.hlsl");
        fs::write(&source, "v1").unwrap();

        let cache = BytecodeCache::new(&dir, "mock", true);
        cache.store(1, b"OLD");
        // Backdate the entry so the source is strictly newer.
        let entry = cache.entry_path(1);
        File::options()
            .write(true)
            .open(&entry)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(60))
            .unwrap();
        fs::write(&source, "v2").unwrap();

        assert_eq!(cache.lookup(1, &source), None);
    }

    #[test]
    fn test_disabled_cache_never_hits_disk() {
        let dir = scratch_dir("disabled");
        let source = dir.join("model.hlsl");
        fs::write(&source, "v1").unwrap();

        let cache = BytecodeCache::new(&dir, "mock", false);
        cache.store(1, b"DXBC");
        assert_eq!(cache.lookup(1, &source), None);
        assert!(!cache.dir.exists());
    }
}
