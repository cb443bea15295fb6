//! TCP stream reassembly and per-stream SIP framing.
//!
//! A single SIP message may be spread across multiple TCP segments, TCP
//! streams between SIP agents are long lived, several messages can share
//! one stream, and a message does not have to start on a segment
//! boundary. Flows are tracked in a single-threaded table keyed by the
//! directional four-tuple; each flow delivers its in-order byte stream
//! into a splitter-driven handler that frames, decodes, and hands off
//! complete messages.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::packet::{Ipv4Datagram, TcpSegment};
use crate::sip::SipMessage;
use crate::splitter::{Splitter, Step, Trace};

use super::{Accept, ExtractMetrics};

/// One direction of a TCP conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// Splitter-driven handler for one flow's ordered byte stream: frames
/// SIP messages, decodes them, and passes them to the accept callback.
struct SipStream {
    buf: Vec<u8>,
    splitter: Splitter,
    metrics: Arc<ExtractMetrics>,
    accept: Accept,
}

impl SipStream {
    fn new(metrics: Arc<ExtractMetrics>, accept: Accept) -> Self {
        SipStream {
            buf: Vec::new(),
            splitter: Splitter::new(stream_trace(&metrics), false),
            metrics,
            accept,
        }
    }

    fn deliver(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.drain(false);
    }

    /// Final pass at stream end; anything still incomplete is dropped.
    fn finish(&mut self) {
        self.drain(true);
    }

    fn drain(&mut self, at_eof: bool) {
        loop {
            // exit_on_error is off, so splitting cannot fail.
            match self.splitter.split(&self.buf, at_eof).unwrap_or(Step::More) {
                Step::More => return,
                Step::Skip(n) => {
                    self.buf.drain(..n);
                }
                Step::Message(n) => {
                    match SipMessage::parse(&self.buf[..n]) {
                        Err(err) => {
                            self.metrics.discarded.with_label_values(&["tcp"]).inc();
                            debug!(error = %err, "error decoding tcp SIP message, skipping");
                        }
                        Ok(sip) => {
                            if let Err(err) = (self.accept)(sip) {
                                warn!(error = %err, "unable to accept TCP SIP message");
                            }
                            self.metrics.captured.with_label_values(&["tcp"]).inc();
                        }
                    }
                    self.buf.drain(..n);
                }
            }
        }
    }
}

/// Splitter trace hooks bound to the extraction metrics.
fn stream_trace(metrics: &Arc<ExtractMetrics>) -> Trace {
    let discarded = metrics.discarded.clone();
    let no_start = metrics.incomplete.clone();
    let no_headers = metrics.incomplete.clone();
    let no_body = metrics.incomplete.clone();
    Trace {
        discard: Some(Box::new(move |bytes| {
            warn!(contents = %String::from_utf8_lossy(bytes), "invalid SIP bytes discarded");
            discarded.with_label_values(&["tcp"]).inc();
        })),
        no_start_line: Some(Box::new(move || {
            debug!("no SIP request or status line found");
            no_start.with_label_values(&["tcp"]).inc();
        })),
        no_headers: Some(Box::new(move || {
            debug!("incomplete SIP headers");
            no_headers.with_label_values(&["tcp"]).inc();
        })),
        no_body: Some(Box::new(move || {
            debug!("incomplete SIP body");
            no_body.with_label_values(&["tcp"]).inc();
        })),
        complete: Some(Box::new(|bytes| {
            debug!(len = bytes.len(), "complete message found");
        })),
        ..Trace::default()
    }
}

struct Flow {
    /// Stream position the sequence offsets are measured from.
    base: Option<u32>,
    /// Next byte offset (relative to base) to hand to the stream.
    next_rel: u64,
    /// Out-of-order segments waiting for the gap before them to fill,
    /// keyed by relative offset.
    pending: BTreeMap<u64, Vec<u8>>,
    stream: SipStream,
    last_seen: Instant,
}

impl Flow {
    fn new(stream: SipStream, now: Instant) -> Self {
        Flow {
            base: None,
            next_rel: 0,
            pending: BTreeMap::new(),
            stream,
            last_seen: now,
        }
    }

    /// Hand every segment that is now contiguous to the stream, trimming
    /// retransmitted prefixes.
    fn deliver_ready(&mut self) {
        while let Some((&rel, _)) = self.pending.first_key_value() {
            if rel > self.next_rel {
                // Gap: delivery blocks until it fills or the flow ages out.
                return;
            }
            let data = self.pending.remove(&rel).expect("first key present");
            let end = rel + data.len() as u64;
            if end <= self.next_rel {
                // Entirely retransmitted bytes.
                continue;
            }
            let skip = (self.next_rel - rel) as usize;
            self.stream.deliver(&data[skip..]);
            self.next_rel = end;
        }
    }
}

/// Reassembles per-flow TCP byte streams and runs the SIP splitter over
/// each. Out-of-order and retransmitted segments are reconciled; gaps
/// block a flow's consumer until filled or the flow is evicted.
pub struct TcpReassembler {
    flows: HashMap<FlowKey, Flow>,
    metrics: Arc<ExtractMetrics>,
    accept: Accept,
}

impl TcpReassembler {
    pub fn new(metrics: Arc<ExtractMetrics>, accept: Accept) -> Self {
        TcpReassembler {
            flows: HashMap::new(),
            metrics,
            accept,
        }
    }

    pub fn assemble(&mut self, ip4: &Ipv4Datagram, segment: &TcpSegment, now: Instant) {
        let key = FlowKey {
            src: ip4.src,
            src_port: segment.src_port,
            dst: ip4.dst,
            dst_port: segment.dst_port,
        };
        let flow = self.flows.entry(key).or_insert_with(|| {
            debug!(flow = %key, "new tcp flow");
            Flow::new(SipStream::new(self.metrics.clone(), self.accept.clone()), now)
        });
        flow.last_seen = now;

        if segment.syn {
            // SYN consumes one sequence number; data starts after it.
            flow.base = Some(segment.seq.wrapping_add(1));
        }

        if !segment.payload.is_empty() {
            let base = *flow.base.get_or_insert(segment.seq);
            let rel = segment.seq.wrapping_sub(base);
            if rel < 0x8000_0000 {
                flow.pending
                    .entry(rel as u64)
                    .or_insert_with(|| segment.payload.clone());
                flow.deliver_ready();
            }
            // Otherwise the segment predates the stream base: a stale
            // retransmit from before we started watching.
        }

        if segment.fin || segment.rst {
            if let Some(mut flow) = self.flows.remove(&key) {
                debug!(flow = %key, "tcp flow closed");
                flow.stream.finish();
            }
        }
    }

    /// Evict flows idle since `cutoff`, running a final framing pass on
    /// each. Returns how many were flushed.
    pub fn flush_older_than(&mut self, cutoff: Instant) -> usize {
        let stale: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| flow.last_seen < cutoff)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            if let Some(mut flow) = self.flows.remove(key) {
                flow.stream.finish();
            }
        }
        stale.len()
    }

    /// Drain every flow on shutdown.
    pub fn flush_all(&mut self) -> usize {
        let count = self.flows.len();
        for (_, mut flow) in self.flows.drain() {
            flow.stream.finish();
        }
        count
    }

    #[cfg(test)]
    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }
}
