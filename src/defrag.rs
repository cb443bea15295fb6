//! IPv4 datagram defragmentation.
//!
//! Buffers fragments keyed by (src, dst, protocol, identification) and
//! emits the reassembled datagram once contiguous coverage from offset
//! zero through the total length exists. Unlike strict reassemblers,
//! fragments below the 28-octet minimum IPv4 length are accepted; real
//! traffic contains them and dropping them loses capturable messages.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::time::Instant;

use thiserror::Error;

use crate::packet::Ipv4Datagram;

#[derive(Debug, Error)]
pub enum DefragError {
    #[error("bad reassembly: {0}")]
    BadReassembly(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    identification: u16,
}

impl FragmentKey {
    fn of(dgram: &Ipv4Datagram) -> Self {
        Self {
            src: dgram.src,
            dst: dgram.dst,
            protocol: dgram.protocol,
            identification: dgram.identification,
        }
    }
}

#[derive(Debug)]
struct FragmentEntry {
    /// Byte offset into the reassembled payload -> fragment payload.
    segments: BTreeMap<usize, Vec<u8>>,
    /// Payload length once the MF=0 fragment has arrived.
    total_len: Option<usize>,
    last_seen: Instant,
}

impl FragmentEntry {
    fn new(now: Instant) -> Self {
        Self {
            segments: BTreeMap::new(),
            total_len: None,
            last_seen: now,
        }
    }

    fn insert(&mut self, offset: usize, payload: Vec<u8>) -> Result<(), DefragError> {
        if let Some(existing) = self.segments.get(&offset) {
            if *existing == payload {
                // Straight retransmit, nothing to do.
                return Ok(());
            }
            return Err(DefragError::BadReassembly(format!(
                "conflicting duplicate fragment at offset {offset}"
            )));
        }

        let end = offset + payload.len();
        if let Some((&prev_off, prev)) = self.segments.range(..offset).next_back() {
            if prev_off + prev.len() > offset {
                return Err(DefragError::BadReassembly(format!(
                    "fragment at offset {offset} overlaps previous segment"
                )));
            }
        }
        if let Some((&next_off, _)) = self.segments.range(offset..).next() {
            if end > next_off {
                return Err(DefragError::BadReassembly(format!(
                    "fragment at offset {offset} overlaps following segment"
                )));
            }
        }
        if let Some(total) = self.total_len {
            if end > total {
                return Err(DefragError::BadReassembly(format!(
                    "fragment data at {offset}..{end} extends past total length {total}"
                )));
            }
        }

        self.segments.insert(offset, payload);
        Ok(())
    }

    /// Contiguous coverage from zero through the known total length?
    fn is_complete(&self) -> bool {
        let Some(total) = self.total_len else {
            return false;
        };
        let mut pos = 0;
        for (&offset, payload) in &self.segments {
            if offset != pos {
                return false;
            }
            pos += payload.len();
        }
        pos == total
    }

    fn assemble(self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.total_len.unwrap_or(0));
        for (_, segment) in self.segments {
            payload.extend_from_slice(&segment);
        }
        payload
    }
}

/// Reassembles fragmented IPv4 datagrams. Entries live until complete or
/// evicted by [`Ipv4Defragmenter::discard_older_than`].
#[derive(Debug, Default)]
pub struct Ipv4Defragmenter {
    entries: HashMap<FragmentKey, FragmentEntry>,
}

impl Ipv4Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one datagram in. Non-fragments pass through unchanged.
    /// Fragments are buffered and `None` is returned until the datagram
    /// they belong to can be fully reassembled, at which point the whole
    /// datagram comes back out.
    pub fn defragment(
        &mut self,
        dgram: Ipv4Datagram,
        now: Instant,
    ) -> Result<Option<Ipv4Datagram>, DefragError> {
        if !dgram.is_fragment() {
            return Ok(Some(dgram));
        }

        let key = FragmentKey::of(&dgram);
        let entry = self.entries.entry(key).or_insert_with(|| FragmentEntry::new(now));
        entry.last_seen = now;

        let mut outcome = Ok(());
        if !dgram.more_fragments {
            let total = dgram.fragment_offset + dgram.payload.len();
            match entry.total_len {
                Some(existing) if existing != total => {
                    outcome = Err(DefragError::BadReassembly(format!(
                        "final fragment disagrees on total length ({existing} vs {total})"
                    )));
                }
                _ => entry.total_len = Some(total),
            }
        }
        if outcome.is_ok() {
            outcome = entry.insert(dgram.fragment_offset, dgram.payload);
        }
        let complete = outcome.is_ok() && entry.is_complete();

        if let Err(err) = outcome {
            // A poisoned entry never becomes whole; drop it.
            self.entries.remove(&key);
            return Err(err);
        }
        if !complete {
            return Ok(None);
        }

        let entry = self.entries.remove(&key).expect("entry present");
        let payload = entry.assemble();
        let total_len = u16::try_from(Ipv4Datagram::HEADER_LEN + payload.len()).unwrap_or(u16::MAX);
        Ok(Some(Ipv4Datagram {
            src: dgram.src,
            dst: dgram.dst,
            protocol: dgram.protocol,
            identification: dgram.identification,
            dont_fragment: false,
            more_fragments: false,
            fragment_offset: 0,
            total_len,
            payload,
        }))
    }

    /// Evict entries that have not been touched since `cutoff`. Returns
    /// how many were dropped.
    pub fn discard_older_than(&mut self, cutoff: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_seen >= cutoff);
        before - self.entries.len()
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}
