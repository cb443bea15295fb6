//! Prometheus metrics for message collection and publishing.

use prometheus::{IntCounter, IntGaugeVec, Opts, Registry};

pub struct CollectMetrics {
    /// Constant gauge labeled with the configured SIP filter source.
    pub filter_info: IntGaugeVec,
    pub rejected: IntCounter,
    pub published: IntCounter,
    pub dropped: IntCounter,
}

impl CollectMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(CollectMetrics {
            filter_info: IntGaugeVec::new(
                Opts::new("msgs_filter_info", "Constant, labeled with SIP filter setting"),
                &["sip_filter"],
            )?,
            rejected: IntCounter::new(
                "msgs_rejected_total",
                "Number of messages rejected by SIP filter",
            )?,
            published: IntCounter::new(
                "msgs_published_total",
                "Number of messages published to MQTT",
            )?,
            dropped: IntCounter::new(
                "msgs_dropped_total",
                "Number of messages dropped due to full publishing queue",
            )?,
        })
    }

    /// Record the active filter source as a constant labeled gauge.
    pub fn set_filter(&self, source: &str) {
        self.filter_info.with_label_values(&[source]).set(1);
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.filter_info.clone()))?;
        registry.register(Box::new(self.rejected.clone()))?;
        registry.register(Box::new(self.published.clone()))?;
        registry.register(Box::new(self.dropped.clone()))?;
        Ok(())
    }
}
