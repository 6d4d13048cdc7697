//! Resource Load-State Machine
//!
//! Every device resource tracked by the manager carries a [`ResourceCore`]:
//! a stable arena id, an atomic load state, a once-only loaded hook guard and
//! a completion channel that lets any number of tasks await the terminal
//! outcome without polling.
//!
//! # Design Principles
//! - State lives in a single `AtomicU8`; readers never take a lock
//! - The `on_loaded` hook fires at most once per resource, ever, even under
//!   racing terminal stores
//! - Both terminal states wake completion waiters; a resource dropped before
//!   reaching a terminal state wakes them with a failure outcome
//! - Diagnostics (origin path, failure text) are write-once and cheap to read

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::sync::watch;

slotmap::new_key_type! {
    /// Stable identity of a tracked resource, valid for the lifetime of its
    /// manager. Graph nodes and pending builds refer to resources by id, not
    /// by `Arc`, so bookkeeping never extends resource lifetimes.
    pub struct ResourceId;
}

/// Families of tracked resources.
///
/// Distinct from the backend object kinds in [`crate::device`]: a material
/// is tracked by the lifecycle but never allocated by the device factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Program,
    Texture,
    VertexBuffer,
    IndexBuffer,
    ConstBuffer,
    Sampler,
    FrameBuffer,
    InputLayout,
    Material,
}

/// Load state of a device resource.
///
/// Legal flow is `None -> Prepared -> Loading -> LoadedSuccess | LoadedFailed`.
/// The two `Loaded*` states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResourceState {
    /// Shell exists, load parameters not captured yet.
    None = 0,
    /// Parameters captured; waiting to be driven by the loader.
    Prepared = 1,
    /// A build task is executing for this resource.
    Loading = 2,
    /// Terminal: the device object is usable.
    LoadedSuccess = 3,
    /// Terminal: the build failed and the resource will never become usable.
    LoadedFailed = 4,
}

impl ResourceState {
    #[inline]
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Prepared,
            2 => Self::Loading,
            3 => Self::LoadedSuccess,
            _ => Self::LoadedFailed,
        }
    }

    /// Whether this state ends the lifecycle (success or failure).
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::LoadedSuccess | Self::LoadedFailed)
    }
}

/// Lock-free cell holding a [`ResourceState`].
#[derive(Debug)]
pub struct StateCell {
    raw: AtomicU8,
}

impl StateCell {
    fn new() -> Self {
        Self {
            raw: AtomicU8::new(ResourceState::None as u8),
        }
    }

    /// Current state.
    #[inline]
    pub fn get(&self) -> ResourceState {
        ResourceState::from_raw(self.raw.load(Ordering::Acquire))
    }

    /// Stores a new state. Returns `true` if the stored value actually
    /// changed, `false` if the cell already held `next`.
    pub fn set(&self, next: ResourceState) -> bool {
        let mut current = self.raw.load(Ordering::Relaxed);
        loop {
            if current == next as u8 {
                return false;
            }
            match self.raw.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Shared lifecycle bookkeeping embedded in every tracked resource.
#[derive(Debug)]
pub struct ResourceCore {
    id: ResourceId,
    state: StateCell,
    hook_fired: AtomicBool,
    done: watch::Sender<Option<bool>>,
    label: String,
    origin: OnceLock<String>,
    failure: OnceLock<String>,
}

impl ResourceCore {
    pub(crate) fn new(id: ResourceId, label: impl Into<String>) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            id,
            state: StateCell::new(),
            hook_fired: AtomicBool::new(false),
            done,
            label: label.into(),
            origin: OnceLock::new(),
            failure: OnceLock::new(),
        }
    }

    /// Arena id of this resource.
    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Human-readable label, set at creation (cache key text, file path...).
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current load state.
    #[inline]
    pub fn state(&self) -> ResourceState {
        self.state.get()
    }

    /// Records where this resource came from (file path, plan name).
    /// First write wins; later writes are ignored.
    pub fn set_origin(&self, origin: impl Into<String>) {
        let _ = self.origin.set(origin.into());
    }

    /// Origin recorded by the build pipeline, if any.
    pub fn origin(&self) -> Option<&str> {
        self.origin.get().map(String::as_str)
    }

    /// Records the diagnostic explaining a failed build. First write wins.
    pub(crate) fn record_failure(&self, diagnostic: impl Into<String>) {
        let _ = self.failure.set(diagnostic.into());
    }

    /// Diagnostic recorded for a failed build, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    /// Subscribes to the terminal outcome of this resource.
    pub fn watch(&self) -> LoadWatch {
        LoadWatch {
            rx: self.done.subscribe(),
        }
    }
}

/// Behavior shared by every tracked device resource.
///
/// Implementors embed a [`ResourceCore`] and expose it through [`Self::core`];
/// all state machine operations are provided methods on top of that.
pub trait DeviceResource: Send + Sync + 'static {
    /// The embedded lifecycle core.
    fn core(&self) -> &ResourceCore;

    /// What family of resource this is.
    fn kind(&self) -> ResourceKind;

    /// Hook invoked exactly once, on the thread that first stores
    /// `LoadedSuccess`. Typical use is deriving post-load metadata such as
    /// the real byte size of an uploaded texture.
    fn on_loaded(&self) {}

    /// Current load state.
    #[inline]
    fn state(&self) -> ResourceState {
        self.core().state()
    }

    /// Stores a new state, firing [`Self::on_loaded`] on the first transition
    /// into `LoadedSuccess` and waking completion waiters on any terminal
    /// store.
    fn set_state(&self, next: ResourceState) {
        let core = self.core();
        core.state.set(next);
        if next == ResourceState::LoadedSuccess && !core.hook_fired.swap(true, Ordering::AcqRel) {
            self.on_loaded();
        }
        if next.is_terminal() {
            core.done.send_replace(Some(next == ResourceState::LoadedSuccess));
        }
    }

    /// Marks the resource ready to be driven by the loader.
    fn set_prepared(&self) {
        self.set_state(ResourceState::Prepared);
    }

    /// Marks a build as executing.
    fn set_loading(&self) {
        self.set_state(ResourceState::Loading);
    }

    /// Stores the terminal outcome of a build.
    fn set_loaded(&self, success: bool) {
        self.set_state(if success {
            ResourceState::LoadedSuccess
        } else {
            ResourceState::LoadedFailed
        });
    }

    /// Prepared and waiting for the loader to pick it up.
    #[inline]
    fn is_prepared_need_loading(&self) -> bool {
        self.state() == ResourceState::Prepared
    }

    /// A build is currently executing.
    #[inline]
    fn is_loading(&self) -> bool {
        self.state() == ResourceState::Loading
    }

    /// Terminal success.
    #[inline]
    fn is_loaded(&self) -> bool {
        self.state() == ResourceState::LoadedSuccess
    }

    /// Terminal failure.
    #[inline]
    fn is_loaded_failed(&self) -> bool {
        self.state() == ResourceState::LoadedFailed
    }

    /// Either terminal state.
    #[inline]
    fn is_load_complete(&self) -> bool {
        self.state().is_terminal()
    }
}

/// Scope guard a build body holds while it runs.
///
/// Guarantees the resource reaches a terminal state on every exit path: the
/// happy path calls [`LoadGuard::finish`], failure paths call
/// [`LoadGuard::fail`] with a diagnostic, and if the body is dropped without
/// either (task aborted, manager disposed) the guard resolves the resource
/// as failed so waiters are never stranded.
pub(crate) struct LoadGuard {
    res: Option<Arc<dyn DeviceResource>>,
}

impl LoadGuard {
    pub(crate) fn new(res: Arc<dyn DeviceResource>) -> Self {
        Self { res: Some(res) }
    }

    /// Stores the terminal outcome and disarms the guard.
    pub(crate) fn finish(mut self, success: bool) {
        if let Some(res) = self.res.take() {
            res.set_loaded(success);
        }
    }

    /// Records a diagnostic, stores `LoadedFailed` and disarms the guard.
    pub(crate) fn fail(mut self, diagnostic: impl Into<String>) {
        if let Some(res) = self.res.take() {
            let diagnostic = diagnostic.into();
            log::warn!("load failed: {} ({diagnostic})", res.core().label());
            res.core().record_failure(diagnostic);
            res.set_loaded(false);
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if let Some(res) = self.res.take() {
            res.core().record_failure("build dropped before completion");
            res.set_loaded(false);
        }
    }
}

/// Await handle for a resource's terminal outcome.
///
/// Cheap to clone out of [`ResourceCore::watch`]; any number of waiters can
/// wait on the same resource. This is the shared-task primitive: one build
/// execution, many awaiters.
#[derive(Debug)]
pub struct LoadWatch {
    rx: watch::Receiver<Option<bool>>,
}

impl LoadWatch {
    /// Terminal outcome if one was already published, without waiting.
    #[must_use]
    pub fn try_outcome(&self) -> Option<bool> {
        *self.rx.borrow()
    }

    /// Waits until the resource reaches a terminal state and returns whether
    /// it loaded successfully. A resource dropped before reaching a terminal
    /// state resolves as failed.
    pub async fn wait(mut self) -> bool {
        loop {
            if let Some(success) = *self.rx.borrow_and_update() {
                return success;
            }
            if self.rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct Probe {
        core: ResourceCore,
        loaded_calls: AtomicUsize,
    }

    impl Probe {
        fn new() -> Self {
            Self {
                core: ResourceCore::new(ResourceId::default(), "probe"),
                loaded_calls: AtomicUsize::new(0),
            }
        }
    }

    impl DeviceResource for Probe {
        fn core(&self) -> &ResourceCore {
            &self.core
        }

        fn kind(&self) -> ResourceKind {
            ResourceKind::ConstBuffer
        }

        fn on_loaded(&self) {
            self.loaded_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_state_flow_and_predicates() {
        let probe = Probe::new();
        assert_eq!(probe.state(), ResourceState::None);
        assert!(!probe.is_load_complete());

        probe.set_prepared();
        assert!(probe.is_prepared_need_loading());

        probe.set_loading();
        assert!(probe.is_loading());
        assert!(!probe.is_prepared_need_loading());

        probe.set_loaded(true);
        assert!(probe.is_loaded());
        assert!(probe.is_load_complete());
        assert!(!probe.is_loaded_failed());
    }

    #[test]
    fn test_failed_is_terminal_but_not_loaded() {
        let probe = Probe::new();
        probe.set_prepared();
        probe.set_loaded(false);
        assert!(probe.is_loaded_failed());
        assert!(probe.is_load_complete());
        assert!(!probe.is_loaded());
        assert_eq!(probe.loaded_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_on_loaded_fires_once_under_races() {
        let probe = Arc::new(Probe::new());
        probe.set_prepared();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let probe = Arc::clone(&probe);
                scope.spawn(move || probe.set_loaded(true));
            }
        });

        assert_eq!(probe.loaded_calls.load(Ordering::SeqCst), 1);
        assert!(probe.is_loaded());
    }

    #[test]
    fn test_redundant_success_does_not_refire_hook() {
        let probe = Probe::new();
        probe.set_loaded(true);
        probe.set_loaded(true);
        probe.set_state(ResourceState::LoadedSuccess);
        assert_eq!(probe.loaded_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watch_sees_already_terminal_outcome() {
        let probe = Probe::new();
        probe.set_loaded(false);

        let watch = probe.core().watch();
        assert_eq!(watch.try_outcome(), Some(false));
        assert!(!futures::executor::block_on(watch.wait()));
    }

    #[test]
    fn test_watch_wakes_on_late_completion() {
        let probe = Arc::new(Probe::new());
        probe.set_prepared();
        let watch = probe.core().watch();
        assert_eq!(watch.try_outcome(), None);

        let setter = {
            let probe = Arc::clone(&probe);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                probe.set_loaded(true);
            })
        };

        assert!(futures::executor::block_on(watch.wait()));
        setter.join().unwrap();
    }

    #[test]
    fn test_watch_resolves_failed_when_resource_dropped() {
        let probe = Probe::new();
        let watch = probe.core().watch();
        drop(probe);
        assert!(!futures::executor::block_on(watch.wait()));
    }

    #[test]
    fn test_dropped_guard_resolves_resource_as_failed() {
        let probe: Arc<dyn DeviceResource> = Arc::new(Probe::new());
        probe.set_prepared();
        let watch = probe.core().watch();

        drop(LoadGuard::new(Arc::clone(&probe)));

        assert!(probe.is_loaded_failed());
        assert_eq!(watch.try_outcome(), Some(false));
        assert_eq!(probe.core().failure(), Some("build dropped before completion"));
    }

    #[test]
    fn test_finished_guard_does_not_fail_on_drop() {
        let probe: Arc<dyn DeviceResource> = Arc::new(Probe::new());
        LoadGuard::new(Arc::clone(&probe)).finish(true);
        assert!(probe.is_loaded());
        assert_eq!(probe.core().failure(), None);
    }

    #[test]
    fn test_failure_diagnostic_first_write_wins() {
        let probe = Probe::new();
        probe.core().record_failure("compile error: X3000");
        probe.core().record_failure("second");
        assert_eq!(probe.core().failure(), Some("compile error: X3000"));

        probe.core().set_origin("shaders/model.hlsl");
        assert_eq!(probe.core().origin(), Some("shaders/model.hlsl"));
    }
}
