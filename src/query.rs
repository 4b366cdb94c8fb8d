//! The handle `run_loop` hands back: a lazy, non-restartable message stream
//! plus the running totals `spec.md` §4.1's `Query` contract exposes
//! (`Messages`, `Wait`, `TurnCount`, `TotalCostUSD`, `TotalUsage`).

use crate::types::{Message, Usage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
pub(crate) struct LoopStats {
    pub turn_count: AtomicUsize,
    pub total_usage: Mutex<Usage>,
    pub total_cost_usd: Mutex<f64>,
}

pub struct Query {
    pub(crate) session_id: String,
    pub(crate) rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    pub(crate) join: Mutex<Option<JoinHandle<()>>>,
    pub(crate) stats: std::sync::Arc<LoopStats>,
}

impl Query {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The loop's emitted messages, in emission order. Finite: ends once the
    /// loop terminates. Can only be drained once — the receiver is moved out
    /// on first call.
    pub fn messages(&self) -> UnboundedReceiverStream<Message> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("Query::messages() already consumed");
        UnboundedReceiverStream::new(rx)
    }

    /// Wait for the driving task to finish. Idempotent after the first call
    /// only in the sense that it returns immediately once already awaited.
    pub async fn wait(&self) {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn turn_count(&self) -> usize {
        self.stats.turn_count.load(Ordering::Acquire)
    }

    pub fn total_cost_usd(&self) -> f64 {
        *self.stats.total_cost_usd.lock().unwrap()
    }

    pub fn total_usage(&self) -> Usage {
        *self.stats.total_usage.lock().unwrap()
    }
}
