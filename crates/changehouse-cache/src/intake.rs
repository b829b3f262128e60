//! Async Intake - Bounded Queue and Worker Pool
//!
//! The feed producer pushes raw documents onto a bounded queue
//! (3x the worker cap); a dispatcher drains it and spawns one worker per
//! document, admitted through a semaphore so at most `max_concurrent_docs`
//! run at once. When the queue is full the producer's send suspends, which
//! is the backpressure mechanism.
//!
//! Workers run concurrently, so documents can reach the ingestion core in
//! any order even when the feed was in order. That is deliberate
//! throughput: the pending buffer downstream is the reorder point.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::cache::ChangeCache;

/// A raw document handed over by the feed.
#[derive(Debug)]
pub(crate) struct IncomingDoc {
    pub id: String,
    pub body: Bytes,
}

/// Spawn the dispatcher that drains the intake queue into workers.
pub(crate) fn spawn_dispatcher(
    cache: Arc<ChangeCache>,
    mut rx: mpsc::Receiver<IncomingDoc>,
) -> JoinHandle<()> {
    let workers = Arc::new(Semaphore::new(cache.options().max_concurrent_docs));
    tokio::spawn(async move {
        let mut shutdown = cache.shutdown_signal();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                doc = rx.recv() => {
                    let Some(doc) = doc else { break };
                    let Ok(permit) = Arc::clone(&workers).acquire_owned().await else {
                        break;
                    };
                    let cache = Arc::clone(&cache);
                    tokio::spawn(async move {
                        let _permit = permit;
                        cache.process_doc(&doc.id, &doc.body).await;
                    });
                }
            }
        }
        tracing::debug!("intake dispatcher stopped");
    })
}
