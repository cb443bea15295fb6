//! Live packet capture.
//!
//! Thin wrapper over libpcap: opens the interface, applies the BPF
//! filter, and pumps captured frames into a bounded channel from a
//! blocking task. Everything downstream of the channel is async.

use chrono::{DateTime, Utc};
use pcap::{Active, Capture, Linktype};
use prometheus::{IntGaugeVec, Opts, Registry};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::packet::{LinkLayer, Packet};

/// Capacity of the capture-to-extractor channel. Kernel-side buffering
/// absorbs bursts; this only smooths the handoff between the blocking
/// capture thread and the async pipeline.
const CHANNEL_DEPTH: usize = 1024;

/// Read timeout so the capture loop can notice shutdown on a quiet
/// interface.
const READ_TIMEOUT_MS: i32 = 500;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("opening capture interface {iface}: {source}")]
    Open {
        iface: String,
        source: pcap::Error,
    },
    #[error("setting BPF filter to {filter:?}: {source}")]
    Filter {
        filter: String,
        source: pcap::Error,
    },
    #[error("unsupported link type {0:?}")]
    UnsupportedLinkType(Linktype),
}

/// Constant gauge recording the capture interface and BPF filter as
/// labels.
pub struct SourceMetrics {
    pub cap_source: IntGaugeVec,
}

impl SourceMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(SourceMetrics {
            cap_source: IntGaugeVec::new(
                Opts::new(
                    "packets_source_info",
                    "Constant, labeled with BPF filter and capture interface",
                ),
                &["source", "bpf_filter"],
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.cap_source.clone()))
    }
}

/// A live pcap source delivering packets over a channel. Dropping the
/// receiver, or signaling shutdown, stops the capture thread.
pub struct PacketSource {
    rx: mpsc::Receiver<Packet>,
}

impl PacketSource {
    /// Open the interface for live capture with the given BPF filter and
    /// start pumping packets.
    pub fn open(
        interface: &str,
        bpf_filter: &str,
        shutdown: watch::Receiver<bool>,
        metrics: &SourceMetrics,
    ) -> Result<Self, CaptureError> {
        let mut capture = Capture::from_device(interface)
            .and_then(|c| {
                c.promisc(true)
                    .snaplen(65535)
                    .timeout(READ_TIMEOUT_MS)
                    .open()
            })
            .map_err(|source| CaptureError::Open {
                iface: interface.to_string(),
                source,
            })?;

        capture
            .filter(bpf_filter, true)
            .map_err(|source| CaptureError::Filter {
                filter: bpf_filter.to_string(),
                source,
            })?;

        let link = link_layer(capture.get_datalink())?;
        metrics
            .cap_source
            .with_label_values(&[interface, bpf_filter])
            .set(1);

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        tokio::task::spawn_blocking(move || pump(capture, link, tx, shutdown));

        Ok(PacketSource { rx })
    }

    /// Hand the packet channel to the consumer.
    pub fn into_packets(self) -> mpsc::Receiver<Packet> {
        self.rx
    }
}

fn link_layer(linktype: Linktype) -> Result<LinkLayer, CaptureError> {
    match linktype {
        Linktype::ETHERNET => Ok(LinkLayer::Ethernet),
        Linktype::NULL | Linktype::LOOP => Ok(LinkLayer::Null),
        Linktype::RAW => Ok(LinkLayer::Raw),
        other => Err(CaptureError::UnsupportedLinkType(other)),
    }
}

/// Blocking capture loop. Runs until shutdown, the receiver hanging up,
/// or a capture error.
fn pump(
    mut capture: Capture<Active>,
    link: LinkLayer,
    tx: mpsc::Sender<Packet>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            debug!("capture loop observed shutdown");
            return;
        }
        match capture.next_packet() {
            Ok(raw) => {
                let pkt = Packet {
                    data: raw.data.to_vec(),
                    timestamp: capture_timestamp(raw.header.ts.tv_sec as i64, raw.header.ts.tv_usec as i64),
                    link,
                };
                if tx.blocking_send(pkt).is_err() {
                    debug!("packet channel closed, capture loop exiting");
                    return;
                }
            }
            // Timeouts just mean a quiet wire; loop to re-check shutdown.
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(err) => {
                warn!(error = %err, "capture read failed, stopping source");
                return;
            }
        }
    }
}

fn capture_timestamp(secs: i64, micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, (micros * 1000).clamp(0, 999_999_999) as u32)
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_layer_mapping() {
        assert_eq!(link_layer(Linktype::ETHERNET).unwrap(), LinkLayer::Ethernet);
        assert_eq!(link_layer(Linktype::NULL).unwrap(), LinkLayer::Null);
        assert_eq!(link_layer(Linktype::RAW).unwrap(), LinkLayer::Raw);
        assert!(matches!(
            link_layer(Linktype(147)),
            Err(CaptureError::UnsupportedLinkType(_))
        ));
    }

    #[test]
    fn timestamps_convert_to_utc() {
        let ts = capture_timestamp(1_700_000_000, 250_000);
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_micros(), 250_000);
    }

    #[test]
    fn source_metrics_register() {
        let metrics = SourceMetrics::new().unwrap();
        metrics.cap_source.with_label_values(&["lo", "udp and port 5060"]).set(1);
        let registry = Registry::new();
        metrics.register(&registry).unwrap();
        assert!(registry
            .gather()
            .iter()
            .any(|f| f.get_name() == "packets_source_info"));
    }
}
