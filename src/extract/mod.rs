//! The packet extraction pipeline.
//!
//! Consumes decoded packets from the capture source and produces
//! complete SIP messages for the collector: IPv4 fragments are
//! reassembled, TCP segments flow through per-stream reassembly and the
//! SIP splitter, UDP payloads are decoded directly. Defective packets
//! are dropped without error but always recorded in metrics.

mod metrics;
mod tcp;

pub use metrics::ExtractMetrics;
pub use tcp::{FlowKey, TcpReassembler};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::collect::Full;
use crate::defrag::Ipv4Defragmenter;
use crate::packet::{self, Packet, Transport};
use crate::sip::SipMessage;

/// Callback handed each extracted SIP message. Must not block; a full
/// downstream queue reports [`Full`] and the message is dropped.
pub type Accept = Arc<dyn Fn(SipMessage) -> Result<(), Full> + Send + Sync>;

/// How often to sweep fragment and flow state.
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);
/// Even if reassembly eventually succeeds, nobody cares about capturing
/// a message this long after its first fragment.
const EVICT_AGE: Duration = Duration::from_secs(120);

/// Minimum length of a legal IPv4 datagram; fragments claiming less are
/// tolerated but counted.
const MIN_IPV4_LEN: u16 = 28;

pub struct Extractor {
    metrics: Arc<ExtractMetrics>,
    defragger: Ipv4Defragmenter,
}

impl Extractor {
    pub fn new(metrics: Arc<ExtractMetrics>) -> Self {
        Extractor {
            metrics,
            defragger: Ipv4Defragmenter::new(),
        }
    }

    /// Drive the pipeline until the packet channel closes or shutdown is
    /// signaled. Packets are processed in arrival order; SIP messages
    /// within one TCP flow reach `accept` in stream order.
    pub async fn extract(
        mut self,
        mut packets: mpsc::Receiver<Packet>,
        accept: Accept,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut assembler = TcpReassembler::new(self.metrics.clone(), accept.clone());
        let mut sweep = tokio::time::interval_at(
            tokio::time::Instant::now() + FLUSH_INTERVAL,
            FLUSH_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let flushed = assembler.flush_all();
                    debug!(flushed, "shutdown, flushing tcp assembly");
                    return;
                }
                received = packets.recv() => {
                    let Some(pkt) = received else {
                        let flushed = assembler.flush_all();
                        debug!(flushed, "packet source closed, flushing tcp assembly");
                        return;
                    };
                    self.handle_packet(pkt, &mut assembler, &accept);
                }
                _ = sweep.tick() => {
                    let cutoff = Instant::now() - EVICT_AGE;
                    let flows = assembler.flush_older_than(cutoff);
                    let frags = self.defragger.discard_older_than(cutoff);
                    debug!(flows, frags, "swept stale reassembly state");
                }
            }
        }
    }

    fn handle_packet(&mut self, pkt: Packet, assembler: &mut TcpReassembler, accept: &Accept) {
        self.metrics.incoming.inc();

        let decoded = match packet::decode(&pkt) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.metrics.invalid.inc();
                debug!(error = %err, "undecodable packet");
                return;
            }
        };
        let mut ip4 = decoded.ipv4;
        let mut transport = decoded.transport;

        if ip4.is_fragment() {
            if ip4.total_len < MIN_IPV4_LEN && ip4.fragment_offset > 0 {
                // Strict reassemblers reject these; we accept them but
                // track how often they happen.
                self.metrics.short_frags.inc();
            }
            let length_before = ip4.total_len;
            match self.defragger.defragment(ip4, Instant::now()) {
                Ok(Some(whole)) => {
                    self.metrics.defrag.inc();
                    if whole.total_len != length_before {
                        // Reassembly grew the datagram; the transport
                        // layer must be re-decoded from the new payload.
                        transport = match packet::decode_transport(&whole) {
                            Ok(transport) => transport,
                            Err(err) => {
                                self.metrics.bad_defrag.inc();
                                warn!(error = %err, "re-decoding reassembled packet");
                                return;
                            }
                        };
                    }
                    ip4 = whole;
                }
                Ok(None) => {
                    self.metrics.fragments.inc();
                    debug!("incomplete ipv4 fragment, continuing");
                    return;
                }
                Err(err) => {
                    self.metrics.bad_defrag.inc();
                    warn!(error = %err, "reassembling ipv4 packet");
                    return;
                }
            }
        }

        match transport {
            None => {
                // Not TCP or UDP; probably ICMP.
                self.metrics.invalid.inc();
                warn!("no transport layer after reassembly, adjust the BPF filter");
            }
            Some(Transport::Tcp(segment)) => {
                self.metrics.seen.with_label_values(&["tcp"]).inc();
                debug!("sending tcp segment to assembler");
                assembler.assemble(&ip4, &segment, Instant::now());
            }
            Some(Transport::Udp(segment)) => {
                self.metrics.seen.with_label_values(&["udp"]).inc();
                match SipMessage::parse(&segment.payload) {
                    Err(_) => {
                        // This UDP packet had no identifiable SIP data.
                        self.metrics.discarded.with_label_values(&["udp"]).inc();
                    }
                    Ok(sip) => {
                        // UDP SIP packets are complete; hand off now.
                        self.metrics.captured.with_label_values(&["udp"]).inc();
                        if let Err(err) = accept(sip) {
                            warn!(error = %err, "unable to accept UDP sip packet");
                        }
                    }
                }
            }
            Some(Transport::Other(protocol)) => {
                self.metrics.seen.with_label_values(&["unknown"]).inc();
                self.metrics.discarded.with_label_values(&["unknown"]).inc();
                debug!(protocol, "unhandled transport protocol");
            }
        }
    }
}
