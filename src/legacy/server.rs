// src/legacy/server.rs

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use super::{BackendState, BucketRecord, LegacyBackend};
use crate::error::{RateLimiterError, Result};
use crate::storage::{NodeConnector, StorageBackend};

const REQUEST_QUEUE: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Request {
    CountHit {
        bucket: u64,
        id: String,
        now: u64,
        increment: u64,
        reply: Reply<u64>,
    },
    GetBucket {
        bucket: u64,
        id: String,
        reply: Reply<Option<BucketRecord>>,
    },
    DeleteBuckets {
        id: String,
        reply: Reply<u64>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

impl<S, C> LegacyBackend<S, C>
where
    S: StorageBackend,
    C: NodeConnector<S>,
{
    /// Connected -> Serving. Spawns the request loop and hands back a handle
    /// to it; each request runs on its own task.
    pub fn serve(mut self) -> Result<LegacyHandle> {
        match self.state {
            BackendState::Connected => {}
            BackendState::Idle => {
                return Err(RateLimiterError::Config(
                    "legacy backend must be connected before serving".to_string(),
                ))
            }
            BackendState::Serving | BackendState::Stopped => {
                return Err(RateLimiterError::Stopped)
            }
        }

        self.mark(BackendState::Serving);
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let (state_tx, state_rx) = watch::channel(BackendState::Serving);
        tokio::spawn(request_loop(Arc::new(self), rx, state_tx));
        info!("Legacy backend serving");

        Ok(LegacyHandle {
            requests: tx,
            state: state_rx,
        })
    }
}

async fn request_loop<S, C>(
    backend: Arc<LegacyBackend<S, C>>,
    mut rx: mpsc::Receiver<Request>,
    state: watch::Sender<BackendState>,
) where
    S: StorageBackend,
    C: NodeConnector<S>,
{
    while let Some(request) = rx.recv().await {
        let backend = Arc::clone(&backend);
        match request {
            Request::CountHit {
                bucket,
                id,
                now,
                increment,
                reply,
            } => {
                tokio::spawn(async move {
                    let _ = reply.send(backend.count_hit(bucket, &id, now, increment).await);
                });
            }
            Request::GetBucket { bucket, id, reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(backend.get_bucket(bucket, &id).await);
                });
            }
            Request::DeleteBuckets { id, reply } => {
                tokio::spawn(async move {
                    let _ = reply.send(backend.delete_buckets(&id).await);
                });
            }
            Request::Stop { done } => {
                // refuse anything still queued behind the stop
                rx.close();
                let _ = state.send(BackendState::Stopped);
                let _ = done.send(());
                break;
            }
        }
    }
    debug!("Legacy request loop exited");
}

/// Cloneable client of a serving [`LegacyBackend`]
#[derive(Debug, Clone)]
pub struct LegacyHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<BackendState>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Request::CountHit { .. } => "CountHit",
            Request::GetBucket { .. } => "GetBucket",
            Request::DeleteBuckets { .. } => "DeleteBuckets",
            Request::Stop { .. } => "Stop",
        };
        f.write_str(name)
    }
}

impl LegacyHandle {
    pub fn state(&self) -> BackendState {
        *self.state.borrow()
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| RateLimiterError::Stopped)?;
        response.await.map_err(|_| RateLimiterError::Stopped)?
    }

    pub async fn count_hit(&self, bucket: u64, id: &str, now: u64, increment: u64) -> Result<u64> {
        let id = id.to_string();
        self.call(|reply| Request::CountHit {
            bucket,
            id,
            now,
            increment,
            reply,
        })
        .await
    }

    pub async fn get_bucket(&self, bucket: u64, id: &str) -> Result<Option<BucketRecord>> {
        let id = id.to_string();
        self.call(|reply| Request::GetBucket { bucket, id, reply })
            .await
    }

    pub async fn delete_buckets(&self, id: &str) -> Result<u64> {
        let id = id.to_string();
        self.call(|reply| Request::DeleteBuckets { id, reply }).await
    }

    /// Serving -> Stopped. Later calls on any clone of this handle fail with
    /// [`RateLimiterError::Stopped`]. Stopping twice is a no-op.
    pub async fn stop(&self) {
        let (done, stopped) = oneshot::channel();
        if self.requests.send(Request::Stop { done }).await.is_ok() {
            let _ = stopped.await;
        }
        info!("Legacy backend stopped");
    }
}
