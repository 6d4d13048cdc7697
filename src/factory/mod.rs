//! Build Factories
//!
//! One factory per resource family, all following the same creation
//! protocol:
//!
//! 1. allocate the backend shell and record the resource (through the keyed
//!    cache for deduplicated families),
//! 2. register the graph node and any dependency edges,
//! 3. queue the build body,
//! 4. for [`Launch::Sync`](crate::task::Launch) drive the body inline before
//!    returning.
//!
//! Queued bodies carry an armed [`LoadGuard`], so a body that is dropped
//! before (or while) running still resolves its resource as failed.

pub mod material;
pub mod objects;
pub mod program;
pub mod texture;

use std::sync::Arc;

use futures::FutureExt;

use crate::resource::{DeviceResource, LoadGuard};
use crate::task::{BuildFuture, Dispatcher};

/// Standard single-hop body: run `upload` in the render domain, resolve the
/// resource from its result. `Err` carries a diagnostic, `Ok(false)` is a
/// plain device rejection.
pub(crate) fn upload_body(
    dispatcher: Dispatcher,
    res: Arc<dyn DeviceResource>,
    upload: impl FnOnce() -> std::result::Result<bool, String> + Send + 'static,
) -> BuildFuture {
    let guard = LoadGuard::new(Arc::clone(&res));
    async move {
        res.set_loading();
        match dispatcher.render().run(upload).await {
            Ok(Ok(true)) => guard.finish(true),
            Ok(Ok(false)) => guard.fail("device rejected the upload"),
            Ok(Err(diagnostic)) => guard.fail(diagnostic),
            Err(err) => guard.fail(err.to_string()),
        }
    }
    .boxed()
}
