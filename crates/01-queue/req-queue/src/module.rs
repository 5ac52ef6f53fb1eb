//! Process-wide request queue instance driven by attach/detach entry points.
//!
//! Code that can thread a [`RequestQueue`] through explicitly should do so;
//! this accessor exists for callers that only have the module entry points.

use std::sync::Arc;

use log::debug;
use parking_lot::{const_rwlock, RwLock};

use crate::queue::{QueueConfig, RequestQueue};
use crate::{QueueError, QueueResult};

static INSTANCE: RwLock<Option<Arc<RequestQueue>>> = const_rwlock(None);

/// Creates the process-wide queue. Fails if it already exists.
pub fn init(config: QueueConfig) -> QueueResult<Arc<RequestQueue>> {
    let mut slot = INSTANCE.write();
    if slot.is_some() {
        return Err(QueueError::AlreadyInitialized);
    }
    let queue = Arc::new(RequestQueue::new(config));
    *slot = Some(Arc::clone(&queue));
    Ok(queue)
}

/// Tears the process-wide queue down, destroying whatever is still queued.
///
/// Returns the number of records destroyed.
pub fn finit() -> QueueResult<usize> {
    let queue = INSTANCE.write().take().ok_or(QueueError::NotInitialized)?;
    let destroyed = queue.finit();
    debug!(
        "request queue module released, {} outstanding handles",
        Arc::strong_count(&queue) - 1
    );
    Ok(destroyed)
}

/// Returns the process-wide queue.
pub fn current() -> QueueResult<Arc<RequestQueue>> {
    INSTANCE.read().clone().ok_or(QueueError::NotInitialized)
}
