//! # Engine Worker
//!
//! The [`Engine`] owns a `rusqlite::Connection`, which is `Send` but not
//! `Sync`. Rather than wrapping it in a mutex, the engine lives on a dedicated
//! OS thread and receives work as boxed closures over a bounded channel:
//!
//! ```text
//!   ┌─────────────┐   Request{id, job}    ┌──────────────────────────┐
//!   │  Lix (N×)   │ ────── mpsc ────────► │  lix-engine thread       │
//!   │  clones     │                       │  current_thread runtime  │
//!   │             │ ◄──── oneshot ─────── │  job(&mut Engine)        │
//!   └─────────────┘   Result<T>           └──────────────────────────┘
//! ```
//!
//! Jobs run one at a time, so every operation observes the effects of all
//! earlier ones. When the last handle is dropped the channel closes and the
//! thread exits, closing the connection.
//!
//! # Rust Pattern: Type-Erased Jobs
//!
//! Each call boxes a closure that captures its own `oneshot::Sender`, so one
//! channel carries requests of every result type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::engine::Engine;
use crate::error::{Error, Result};

type Job = Box<dyn FnOnce(&mut Engine) + Send + 'static>;

struct Request {
    id: u64,
    job: Job,
}

/// Cloneable sender side of the engine thread.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Request>,
    next_id: Arc<AtomicU64>,
}

impl WorkerHandle {
    /// Runs `f` on the engine thread and waits for its result.
    ///
    /// # Errors
    ///
    /// `EngineClosed` if the thread is gone (or exits before replying),
    /// otherwise whatever `f` returns.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Engine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job: Job = Box::new(move |engine| {
            let _ = reply_tx.send(f(engine));
        });

        self.tx
            .send(Request { id, job })
            .await
            .map_err(|_| Error::EngineClosed)?;
        reply_rx.await.map_err(|_| Error::EngineClosed)?
    }

    /// True once the engine thread has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Moves `engine` onto a new thread and returns the handle to it.
///
/// # Errors
///
/// `Io` if the OS refuses to spawn the thread.
pub fn spawn_worker(engine: Engine, channel_size: usize) -> Result<WorkerHandle> {
    let (tx, rx) = mpsc::channel(channel_size.max(1));

    std::thread::Builder::new()
        .name("lix-engine".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to create engine runtime");
            rt.block_on(run_worker(engine, rx));
        })?;

    Ok(WorkerHandle {
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
    })
}

async fn run_worker(mut engine: Engine, mut rx: mpsc::Receiver<Request>) {
    tracing::info!(session_id = %engine.session_id(), "engine worker started");
    let mut handled: u64 = 0;

    while let Some(Request { id, job }) = rx.recv().await {
        tracing::trace!(request_id = id, "engine request");
        job(&mut engine);
        handled += 1;
    }

    tracing::info!(
        session_id = %engine.session_id(),
        handled,
        "engine worker stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LixConfig;
    use crate::schema::Database;

    fn handle() -> WorkerHandle {
        let engine = Engine::new(Database::open_in_memory().unwrap(), LixConfig::default()).unwrap();
        spawn_worker(engine, 4).unwrap()
    }

    #[tokio::test]
    async fn test_calls_run_in_order() {
        let worker = handle();
        let mut pending = Vec::new();
        for _ in 0..8 {
            let w = worker.clone();
            pending.push(tokio::spawn(async move {
                w.call(|engine| Ok(engine.versions()?.len())).await
            }));
        }
        for p in pending {
            assert_eq!(p.await.unwrap().unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_errors_are_returned_to_the_caller() {
        let worker = handle();
        let err = worker
            .call(|engine| engine.version(&"missing".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(!worker.is_closed());
    }
}
