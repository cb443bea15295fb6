//! Prometheus metrics for the packet extraction pipeline. The metric
//! names and label values here are part of the external contract.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

pub struct ExtractMetrics {
    pub incoming: IntCounter,
    pub invalid: IntCounter,
    pub fragments: IntCounter,
    pub short_frags: IntCounter,
    pub bad_defrag: IntCounter,
    pub defrag: IntCounter,

    pub seen: IntCounterVec,
    pub incomplete: IntCounterVec,
    pub discarded: IntCounterVec,
    pub captured: IntCounterVec,
}

impl ExtractMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let transport = &["transport"];
        let m = ExtractMetrics {
            incoming: IntCounter::new(
                "packets_incoming_total",
                "incoming packets after bpf filtering",
            )?,
            invalid: IntCounter::new(
                "packets_invalid_total",
                "packets with invalid transport or network layers",
            )?,
            fragments: IntCounter::new(
                "packets_fragment_total",
                "packet fragments (IP-level)",
            )?,
            short_frags: IntCounter::new(
                "packets_short_fragment_total",
                "packet fragments with under minimum spec length",
            )?,
            bad_defrag: IntCounter::new(
                "packets_defragment_failed_total",
                "IP packet reassembly failure",
            )?,
            defrag: IntCounter::new(
                "packets_defragmented_total",
                "packet fragments successfully reassembled into whole packets",
            )?,
            seen: IntCounterVec::new(
                Opts::new("msgs_seen_total", "SIP messages encountered"),
                transport,
            )?,
            incomplete: IntCounterVec::new(
                Opts::new("msgs_incomplete_total", "SIP messages ignored as incomplete"),
                transport,
            )?,
            discarded: IntCounterVec::new(
                Opts::new("msgs_discarded_total", "SIP messages discarded as unparseable"),
                transport,
            )?,
            captured: IntCounterVec::new(
                Opts::new("msgs_captured_total", "SIP messages successfully prepared for capture"),
                transport,
            )?,
        };

        // Zero-fill the transport labels we know about so they show up
        // before any traffic arrives.
        for label in ["udp", "tcp"] {
            m.seen.with_label_values(&[label]);
            m.incomplete.with_label_values(&[label]);
            m.discarded.with_label_values(&[label]);
            m.captured.with_label_values(&[label]);
        }

        Ok(m)
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.incoming.clone()))?;
        registry.register(Box::new(self.invalid.clone()))?;
        registry.register(Box::new(self.fragments.clone()))?;
        registry.register(Box::new(self.short_frags.clone()))?;
        registry.register(Box::new(self.bad_defrag.clone()))?;
        registry.register(Box::new(self.defrag.clone()))?;
        registry.register(Box::new(self.seen.clone()))?;
        registry.register(Box::new(self.incomplete.clone()))?;
        registry.register(Box::new(self.discarded.clone()))?;
        registry.register(Box::new(self.captured.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_labels_are_zero_filled() {
        let metrics = ExtractMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();

        let families = registry.gather();
        let seen = families
            .iter()
            .find(|f| f.get_name() == "msgs_seen_total")
            .expect("seen metric registered");
        let labels: Vec<_> = seen
            .get_metric()
            .iter()
            .flat_map(|m| m.get_label())
            .map(|l| l.get_value().to_string())
            .collect();
        assert!(labels.contains(&"udp".to_string()));
        assert!(labels.contains(&"tcp".to_string()));
    }
}
