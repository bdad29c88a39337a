use std::sync::Arc;

use async_trait::async_trait;

/// A synchronous external effector participating in two-phase commit.
///
/// Contract, per transition:
/// - `acquire_lock` reserves the intent to move to `label`. It may fail
///   with any error to veto the transition. Re-entrant acquisition (the
///   handler is already locked) must fail.
/// - After a non-failing `acquire_lock`, `change` must succeed; a failure
///   there is a contract violation and is fatal for the transition.
/// - `release_lock` releases the reservation: immediately if `change` was
///   never called (refused transition), otherwise once the physical effect
///   is observable.
///
/// Handlers must tolerate abandonment: a dropped in-flight transition may
/// leave a lock held without a matching `change`/`release_lock`.
pub trait Output: Send + Sync {
    fn acquire_lock(&self, label: &str) -> anyhow::Result<()>;
    fn change(&self) -> anyhow::Result<()>;
    fn release_lock(&self) -> anyhow::Result<()>;
}

/// The cooperative-async variant of [`Output`], with the same contract.
/// Each method is a suspension point for the driving task.
#[async_trait]
pub trait AsyncOutput: Send + Sync {
    async fn acquire_lock(&self, label: &str) -> anyhow::Result<()>;
    async fn change(&self) -> anyhow::Result<()>;
    async fn release_lock(&self) -> anyhow::Result<()>;
}

/// An output handler bound to a machine. Whether the handler requires
/// cooperative suspension is fixed by the variant, so it cannot change
/// over the handler's lifetime.
#[derive(Clone)]
pub enum OutputBinding {
    Sync(Arc<dyn Output>),
    Async(Arc<dyn AsyncOutput>),
}

impl OutputBinding {
    pub fn sync<T: Output + 'static>(handler: Arc<T>) -> Self {
        OutputBinding::Sync(handler)
    }

    pub fn asynchronous<T: AsyncOutput + 'static>(handler: Arc<T>) -> Self {
        OutputBinding::Async(handler)
    }

    /// Whether driving this handler needs a cooperative-async transition.
    pub fn require_async(&self) -> bool {
        matches!(self, OutputBinding::Async(_))
    }

    /// Identity of the underlying handler allocation. Binding is
    /// idempotent by this identity.
    pub(crate) fn handler_ptr(&self) -> *const () {
        match self {
            OutputBinding::Sync(h) => Arc::as_ptr(h) as *const (),
            OutputBinding::Async(h) => Arc::as_ptr(h) as *const (),
        }
    }
}

impl From<Arc<dyn Output>> for OutputBinding {
    fn from(handler: Arc<dyn Output>) -> Self {
        OutputBinding::Sync(handler)
    }
}

impl From<Arc<dyn AsyncOutput>> for OutputBinding {
    fn from(handler: Arc<dyn AsyncOutput>) -> Self {
        OutputBinding::Async(handler)
    }
}
