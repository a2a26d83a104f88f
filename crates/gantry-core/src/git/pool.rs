//! Bounded execution pool for git shell-outs.
//!
//! Git fetches and clones can take minutes; running them unbounded on the
//! blocking pool would let a burst of branch refreshes starve everything
//! else. The pool is an explicit service injected wherever git work is
//! spawned from async code.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// Default number of concurrent git commands.
pub const DEFAULT_GIT_POOL_SIZE: usize = 8;

#[derive(Clone)]
pub struct GitTaskPool {
    permits: Arc<Semaphore>,
}

impl GitTaskPool {
    pub fn new(size: usize) -> Self {
        GitTaskPool {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Run a blocking git closure on the blocking pool, holding one permit
    /// for the duration.
    pub async fn run<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("git pool semaphore closed");
        tokio::task::spawn_blocking(f)
            .await
            .expect("git task panicked")
    }
}

impl Default for GitTaskPool {
    fn default() -> Self {
        Self::new(DEFAULT_GIT_POOL_SIZE)
    }
}
