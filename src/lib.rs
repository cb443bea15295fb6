//! Passive SIP signaling capture pipeline.
//!
//! Packets come in from a pcap source, get reassembled (IPv4 fragments,
//! TCP streams), are framed into individual SIP messages, matched against
//! a compiled filter expression, and published as JSON envelopes to an
//! MQTT broker.
//!
//! Dataflow: capture -> extract -> collect -> publisher, with the
//! defragmenter and the stream splitter doing the heavy lifting inside
//! the extract stage.

pub mod capture;
pub mod collect;
pub mod defrag;
pub mod extract;
pub mod filters;
pub mod metrics;
pub mod packet;
pub mod publisher;
pub mod sip;
pub mod splitter;

#[cfg(test)]
pub(crate) mod testutil;
