//! Worker pool draining the webhook intake queue into the dialog engine.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::{AppState, WebhookJob, scheduler};

pub async fn run(n: usize, state: Arc<AppState>, queue: Arc<Mutex<mpsc::Receiver<WebhookJob>>>) {
    log::info!("worker {n} started");
    loop {
        // Hold the receiver lock only while waiting for the next job so the
        // pool drains in parallel.
        let job = { queue.lock().await.recv().await };
        let Some(job) = job else {
            log::info!("worker {n} stopping: queue closed");
            return;
        };

        let Some(adapter) = scheduler::adapter_for(&state, &job.bot_id) else {
            log::warn!("worker {n}: no usable adapter for bot {}; dropping update", job.bot_id);
            continue;
        };

        let outcome = state
            .manager
            .handle_update(adapter.as_ref(), &job.bot_id, &job.raw)
            .await;
        log::debug!("worker {n}: bot {} update handled: {outcome:?}", job.bot_id);
    }
}
