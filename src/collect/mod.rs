//! Message collection: a bounded queue between the capture loop and the
//! publisher.
//!
//! The capture path must never exert backpressure on the kernel packet
//! buffer, so [`Accepter::accept`] is non-blocking and discards on
//! overflow. The publish loop on the other end applies the compiled
//! filter and hands accepted messages to the publisher; publish failures
//! are logged and counted, never retried.

mod metrics;
mod msg;

pub use metrics::CollectMetrics;
pub use msg::Msg;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::filters::Filter;
use crate::sip::SipMessage;

/// More outstanding messages await publishing than the queue can hold;
/// the offered message was discarded.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("publish queue is full")]
pub struct Full;

/// Anything that can deliver an envelope to the outside world.
#[async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, msg: &Msg) -> anyhow::Result<()>;
}

/// The accept side of the collector, handed to the extractor. Cheap to
/// clone.
#[derive(Clone)]
pub struct Accepter {
    tx: mpsc::Sender<SipMessage>,
    metrics: Arc<CollectMetrics>,
}

impl Accepter {
    /// Enqueue a message for filtering and publishing. Never blocks; a
    /// full queue drops the message and reports [`Full`].
    pub fn accept(&self, sip: SipMessage) -> Result<(), Full> {
        self.tx.try_send(sip).map_err(|_| {
            self.metrics.dropped.inc();
            Full
        })
    }
}

/// The consume side: filters queued messages and publishes the ones
/// that pass.
pub struct Collector {
    filter: Filter,
    publisher: Arc<dyn Publish>,
    rx: mpsc::Receiver<SipMessage>,
    metrics: Arc<CollectMetrics>,
}

/// Build a collector with an internal queue of the given depth.
pub fn new(
    filter: Filter,
    publisher: Arc<dyn Publish>,
    depth: usize,
    metrics: Arc<CollectMetrics>,
) -> (Accepter, Collector) {
    let (tx, rx) = mpsc::channel(depth);
    (
        Accepter {
            tx,
            metrics: metrics.clone(),
        },
        Collector {
            filter,
            publisher,
            rx,
            metrics,
        },
    )
}

impl Collector {
    /// Consume the queue until cancellation or until every accept handle
    /// is gone. FIFO order is preserved from accept to publish.
    pub async fn publish_loop(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                received = self.rx.recv() => {
                    let Some(sip) = received else {
                        info!("queue closed, collector exiting");
                        return;
                    };
                    if !(self.filter)(&sip) {
                        self.metrics.rejected.inc();
                        debug!("discarding SIP message that does not match filter");
                        continue;
                    }
                    let msg = Msg::new(&sip);
                    if let Err(err) = self.publisher.publish(&msg).await {
                        error!(error = %err, id = %msg.id, "publish failed");
                    }
                    self.metrics.published.inc();
                }
            }
        }
    }
}
