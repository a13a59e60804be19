//! Adapter handles and the leases that reference-count them.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use relay_kernel::{ModelAdapter, ModelId};
use tokio_util::sync::CancellationToken;

use super::RegistryInner;

/// The adapter owned by one Ready model.
///
/// A handle belongs to exactly one load of one model. It is revoked when the
/// model is marked degraded or unloaded; sessions watch
/// [`revoked`](Self::revoked) and stop with an explicit error.
#[derive(Clone)]
pub struct AdapterHandle {
    model_id: ModelId,
    load_id: u64,
    adapter: Arc<dyn ModelAdapter>,
    revoked: CancellationToken,
}

impl AdapterHandle {
    pub(crate) fn new(model_id: ModelId, load_id: u64, adapter: Arc<dyn ModelAdapter>) -> Self {
        Self {
            model_id,
            load_id,
            adapter,
            revoked: CancellationToken::new(),
        }
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    /// Identifies the load that produced this handle.
    pub fn load_id(&self) -> u64 {
        self.load_id
    }

    pub fn adapter(&self) -> &Arc<dyn ModelAdapter> {
        &self.adapter
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.is_cancelled()
    }

    /// Token cancelled when the handle is invalidated.
    pub fn revoked(&self) -> CancellationToken {
        self.revoked.clone()
    }

    pub(crate) fn revoke(&self) {
        self.revoked.cancel();
    }
}

impl PartialEq for AdapterHandle {
    fn eq(&self, other: &Self) -> bool {
        self.load_id == other.load_id && Arc::ptr_eq(&self.adapter, &other.adapter)
    }
}

impl fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("model_id", &self.model_id)
            .field("load_id", &self.load_id)
            .field("adapter", &self.adapter.name())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

/// Scoped acquisition of an [`AdapterHandle`].
///
/// Holding a lease keeps the model's reference count above zero, which
/// protects it from eviction. Dropping the lease releases the reference on
/// every exit path, including cancellation and panics.
pub struct HandleLease {
    handle: AdapterHandle,
    registry: Arc<RegistryInner>,
}

impl HandleLease {
    pub(crate) fn new(handle: AdapterHandle, registry: Arc<RegistryInner>) -> Self {
        Self { handle, registry }
    }

    pub fn handle(&self) -> &AdapterHandle {
        &self.handle
    }
}

impl Deref for HandleLease {
    type Target = AdapterHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.registry.release(&self.handle.model_id);
    }
}

impl fmt::Debug for HandleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandleLease").field(&self.handle).finish()
    }
}
