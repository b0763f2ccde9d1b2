//! Per-session QoS delivery state.
//!
//! Outbound: packet ids the broker is waiting on (PUBACK for QoS 1,
//! PUBREC then PUBCOMP for QoS 2), with bounded dup-retransmission on a
//! doubling interval. Inbound: QoS 2 publishes parked until PUBREL so a
//! retransmitted PUBLISH is not delivered twice.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::Message;

/// Outbound handshake stage for one packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundStage {
    /// QoS 1: PUBLISH sent, waiting for PUBACK.
    AwaitPuback,
    /// QoS 2: PUBLISH sent, waiting for PUBREC.
    AwaitPubrec,
    /// QoS 2: PUBREL sent, waiting for PUBCOMP.
    AwaitPubcomp,
}

#[derive(Debug)]
struct OutboundEntry {
    /// Kept until PUBREC/PUBACK; a PUBREL retransmit needs no payload.
    message: Option<Message>,
    stage: OutboundStage,
    last_sent: Instant,
    retries: u32,
}

/// What to put back on the wire for an overdue entry.
#[derive(Debug)]
pub enum Retransmit {
    /// Resend the PUBLISH with dup=1.
    Publish { pkid: u16, message: Message },
    /// Resend the PUBREL.
    PubRel { pkid: u16 },
}

/// In-flight delivery table for one session.
#[derive(Debug, Default)]
pub struct Inflight {
    outbound: HashMap<u16, OutboundEntry>,
    /// Inbound QoS 2 publishes awaiting PUBREL.
    inbound: HashMap<u16, Message>,
    next_pkid: u16,
}

impl Inflight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next free non-zero packet id.
    ///
    /// Returns `None` only when all 65535 ids are in flight.
    pub fn alloc_pkid(&mut self) -> Option<u16> {
        if self.outbound.len() >= u16::MAX as usize {
            return None;
        }

        loop {
            self.next_pkid = self.next_pkid.wrapping_add(1);
            if self.next_pkid == 0 {
                continue;
            }
            if !self.outbound.contains_key(&self.next_pkid) {
                return Some(self.next_pkid);
            }
        }
    }

    /// Track an outbound QoS 1 PUBLISH.
    pub fn sent_qos1(&mut self, pkid: u16, message: Message, now: Instant) {
        self.outbound.insert(
            pkid,
            OutboundEntry {
                message: Some(message),
                stage: OutboundStage::AwaitPuback,
                last_sent: now,
                retries: 0,
            },
        );
    }

    /// Track an outbound QoS 2 PUBLISH.
    pub fn sent_qos2(&mut self, pkid: u16, message: Message, now: Instant) {
        self.outbound.insert(
            pkid,
            OutboundEntry {
                message: Some(message),
                stage: OutboundStage::AwaitPubrec,
                last_sent: now,
                retries: 0,
            },
        );
    }

    /// PUBACK received: settle the QoS 1 delivery. False if unknown.
    pub fn on_puback(&mut self, pkid: u16) -> bool {
        match self.outbound.get(&pkid) {
            Some(entry) if entry.stage == OutboundStage::AwaitPuback => {
                self.outbound.remove(&pkid);
                true
            }
            _ => false,
        }
    }

    /// PUBREC received: the caller sends PUBREL, we now await PUBCOMP.
    /// False if the pkid is unknown (duplicate PUBRECs are tolerated).
    pub fn on_pubrec(&mut self, pkid: u16, now: Instant) -> bool {
        match self.outbound.get_mut(&pkid) {
            Some(entry) if entry.stage == OutboundStage::AwaitPubrec => {
                entry.stage = OutboundStage::AwaitPubcomp;
                entry.message = None;
                entry.last_sent = now;
                entry.retries = 0;
                true
            }
            // A lost PUBREL makes the receiver repeat PUBREC; answer it
            // again without restarting the handshake.
            Some(entry) if entry.stage == OutboundStage::AwaitPubcomp => true,
            _ => false,
        }
    }

    /// PUBCOMP received: settle the QoS 2 delivery. False if unknown.
    pub fn on_pubcomp(&mut self, pkid: u16) -> bool {
        match self.outbound.get(&pkid) {
            Some(entry) if entry.stage == OutboundStage::AwaitPubcomp => {
                self.outbound.remove(&pkid);
                true
            }
            _ => false,
        }
    }

    /// Park an inbound QoS 2 PUBLISH until its PUBREL.
    ///
    /// Returns true when the pkid is new; a dup with a known pkid only
    /// needs another PUBREC, not another delivery.
    pub fn store_incoming(&mut self, pkid: u16, message: Message) -> bool {
        if self.inbound.contains_key(&pkid) {
            return false;
        }
        self.inbound.insert(pkid, message);
        true
    }

    /// PUBREL received: release the parked message for delivery.
    pub fn release_incoming(&mut self, pkid: u16) -> Option<Message> {
        self.inbound.remove(&pkid)
    }

    /// Collect overdue retransmits and expired entries.
    ///
    /// The retry interval doubles per attempt; entries past `max_retries`
    /// are dropped and their pkids returned so the caller can log the
    /// abandonment.
    pub fn due(
        &mut self,
        now: Instant,
        retry_interval: Duration,
        max_retries: u32,
    ) -> (Vec<Retransmit>, Vec<u16>) {
        let mut retransmits = Vec::new();
        let mut expired = Vec::new();

        for (&pkid, entry) in &mut self.outbound {
            let deadline = retry_interval
                .checked_mul(1u32 << entry.retries.min(16))
                .unwrap_or(Duration::MAX);
            if now.duration_since(entry.last_sent) < deadline {
                continue;
            }

            if entry.retries >= max_retries {
                expired.push(pkid);
                continue;
            }

            entry.retries += 1;
            entry.last_sent = now;

            match entry.stage {
                OutboundStage::AwaitPuback | OutboundStage::AwaitPubrec => {
                    if let Some(ref message) = entry.message {
                        retransmits.push(Retransmit::Publish { pkid, message: message.clone() });
                    }
                }
                OutboundStage::AwaitPubcomp => {
                    retransmits.push(Retransmit::PubRel { pkid });
                }
            }
        }

        for pkid in &expired {
            self.outbound.remove(pkid);
        }

        (retransmits, expired)
    }

    /// Number of unsettled outbound deliveries.
    #[cfg(test)]
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }
}
