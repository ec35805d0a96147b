//! Receiver session: reassembles the objects of one TSI.
//!
//! [`Receiver::push`] consumes raw datagrams.  A bad packet is logged and
//! dropped, never propagated: over a unidirectional lossy link one corrupt
//! datagram must not stop the stream.  [`Receiver::try_push`] exposes the
//! reason a packet was refused.
//!
//! # FDT handling
//! TOI 0 carries FDT instances, reassembled per instance id with the OTI of
//! their EXT_FTI.  A completed instance replaces the current one only when
//! its id is strictly newer; expired instances are ignored.
//!
//! # Objects
//! The OTI of an object comes from its FDT entry or, failing that, from the
//! EXT_FTI of its packets; without either, packets are parked.  Objects that
//! complete before their FDT entry is known wait for it, since the sink
//! needs the content location.  The entry also names the content encoding,
//! which is undone before the digest check.
//!
//! # Memory bounds
//! An OTI whose reassembly footprint exceeds `max_object_bytes` is refused
//! before anything is allocated.  Partial objects, partial FDT instances and
//! objects waiting for their FDT entry are each capped in number; the least
//! recently active entry makes room for a new one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;

use crate::alc::{AlcError, AlcPacket};
use crate::cenc::ContentEncoding;
use crate::fdt::{is_newer, FdtError, FdtFile, FdtInstance};
use crate::fec::FecRegistry;
use crate::lct::LctError;
use crate::oti::OtiError;

mod object;
pub mod multi;
pub mod writer;

use object::{ObjectReceiver, SymbolOutcome};
pub use multi::{MultiReceiver, UdpEndpoint};
pub use writer::{BufferWriter, FsWriter, ObjectMeta, ObjectWriter, ReceivedObject, WriterError};

/// Completed TOIs remembered so carousel repeats are ignored.
pub const DEFAULT_MAX_OBJECTS_COMPLETED: usize    = 1024;
/// Packets parked per object while its OTI is unknown.
pub const DEFAULT_MAX_PENDING_PACKETS:   usize    = 256;
/// Idle time after which [`Receiver::cleanup`] drops an incomplete object.
pub const DEFAULT_OBJECT_TIMEOUT:        Duration = Duration::from_secs(60);
/// Reassembly memory one object may reserve, symbol buffers included.
pub const DEFAULT_MAX_OBJECT_BYTES:      u64      = 1 << 30;
/// Objects under reassembly at once.
pub const DEFAULT_MAX_ACTIVE_OBJECTS:    usize    = 256;
/// Reconstructed objects held while their FDT entry is unknown.
pub const DEFAULT_MAX_AWAITING_FDT:      usize    = 64;

/// FDT instances reassembled at once.
const MAX_FDT_RECEIVERS: usize = 4;
/// Reassembly memory one FDT instance may reserve.
const MAX_FDT_BYTES:     u64   = 16 << 20;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum PacketError {
    #[error(transparent)]
    Alc(#[from] AlcError),
    #[error("Packet TSI {got} does not belong to session {expected}")]
    SessionMismatch { expected: u64, got: u64 },
    #[error("FDT packet without EXT_FDT")]
    MissingFdtExtension,
    #[error("FDT packet without EXT_FTI")]
    MissingFti,
    #[error(transparent)]
    InvalidOti(#[from] OtiError),
    #[error(transparent)]
    Fdt(#[from] FdtError),
    #[error("Object {toi} needs {needed} bytes to reassemble, limit is {limit}")]
    ObjectTooLarge { toi: u64, needed: u64, limit: u64 },
    #[error("Rejected packet: {0}")]
    Rejected(String),
}

// ── ReceiverConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub max_objects_completed: usize,
    pub max_pending_packets:   usize,
    /// `None` disables eviction in [`Receiver::cleanup`].
    pub object_timeout:        Option<Duration>,
    /// Check the FDT's content digest before handing an object to the sink.
    pub verify_digest:         bool,
    /// Also bounds the decoded size of content-encoded objects.
    pub max_object_bytes:      u64,
    pub max_active_objects:    usize,
    pub max_awaiting_fdt:      usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_objects_completed: DEFAULT_MAX_OBJECTS_COMPLETED,
            max_pending_packets:   DEFAULT_MAX_PENDING_PACKETS,
            object_timeout:        Some(DEFAULT_OBJECT_TIMEOUT),
            verify_digest:         true,
            max_object_bytes:      DEFAULT_MAX_OBJECT_BYTES,
            max_active_objects:    DEFAULT_MAX_ACTIVE_OBJECTS,
            max_awaiting_fdt:      DEFAULT_MAX_AWAITING_FDT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub packets:             u64,
    pub dropped:             u64,
    pub unsupported_version: u64,
    pub duplicates:          u64,
    pub objects_completed:   u64,
    pub objects_discarded:   u64,
    pub fdt_instances:       u64,
}

/// A fully decoded transport object, still content encoded.
struct Reconstructed {
    data:  Vec<u8>,
    /// From EXT_CENC, when the packets carried it.
    cenc:  Option<ContentEncoding>,
    since: Instant,
}

// ── Receiver ─────────────────────────────────────────────────────────────────

pub struct Receiver {
    tsi:            u64,
    config:         ReceiverConfig,
    writer:         Arc<dyn ObjectWriter>,
    registry:       FecRegistry,
    fdt:            Option<FdtInstance>,
    fdt_receivers:  HashMap<u32, ObjectReceiver>,
    objects:        HashMap<u64, ObjectReceiver>,
    /// Reconstructed objects whose FDT entry has not arrived yet.
    awaiting_fdt:   HashMap<u64, Reconstructed>,
    completed:      HashSet<u64>,
    completed_fifo: VecDeque<u64>,
    closed:         bool,
    stats:          ReceiverStats,
}

impl Receiver {
    pub fn new(tsi: u64, writer: Arc<dyn ObjectWriter>, config: ReceiverConfig) -> Self {
        Self::with_registry(tsi, writer, config, FecRegistry::new())
    }

    pub fn with_registry(
        tsi:      u64,
        writer:   Arc<dyn ObjectWriter>,
        config:   ReceiverConfig,
        registry: FecRegistry,
    ) -> Self {
        Self {
            tsi,
            config,
            writer,
            registry,
            fdt:            None,
            fdt_receivers:  HashMap::new(),
            objects:        HashMap::new(),
            awaiting_fdt:   HashMap::new(),
            completed:      HashSet::new(),
            completed_fifo: VecDeque::new(),
            closed:         false,
            stats:          ReceiverStats::default(),
        }
    }

    pub fn tsi(&self) -> u64 { self.tsi }
    pub fn fdt(&self) -> Option<&FdtInstance> { self.fdt.as_ref() }
    pub fn stats(&self) -> ReceiverStats { self.stats }

    /// The sender signalled the end of the session.
    pub fn is_closed(&self) -> bool { self.closed }

    /// Objects under reassembly, FDT instances excluded.
    pub fn nb_objects(&self) -> usize {
        self.objects.len()
    }

    /// Feed one datagram.  Failures are logged and the packet dropped.
    pub fn push(&mut self, data: &[u8]) {
        if let Err(e) = self.try_push(data) {
            self.stats.dropped += 1;
            if matches!(e, PacketError::Alc(AlcError::Lct(LctError::UnsupportedVersion(_)))) {
                self.stats.unsupported_version += 1;
            }
            tracing::debug!(tsi = self.tsi, err = %e, "packet dropped");
        }
    }

    pub fn try_push(&mut self, data: &[u8]) -> Result<(), PacketError> {
        self.stats.packets += 1;
        let pkt = AlcPacket::decode(data)?;
        if pkt.lct.tsi != self.tsi {
            return Err(PacketError::SessionMismatch { expected: self.tsi, got: pkt.lct.tsi });
        }
        if pkt.lct.close_session {
            if !self.closed {
                tracing::info!(tsi = self.tsi, "session closed by sender");
            }
            self.closed = true;
            if pkt.lct.toi == 0 && pkt.lct.fdt_instance_id.is_none() {
                return Ok(());
            }
        }
        if pkt.lct.toi == 0 {
            self.push_fdt(pkt)
        } else {
            self.push_object(pkt)
        }
    }

    fn count(&mut self, outcome: &SymbolOutcome) -> Result<(), PacketError> {
        match outcome {
            SymbolOutcome::Duplicate => {
                self.stats.duplicates += 1;
                Ok(())
            }
            SymbolOutcome::Rejected(reason) => Err(PacketError::Rejected(reason.clone())),
            _ => Ok(()),
        }
    }

    // ── FDT ──────────────────────────────────────────────────────────────────

    fn push_fdt(&mut self, pkt: AlcPacket) -> Result<(), PacketError> {
        let instance_id = pkt.lct.fdt_instance_id.ok_or(PacketError::MissingFdtExtension)?;
        if let Some(current) = &self.fdt {
            if !is_newer(instance_id, current.instance_id) {
                self.stats.duplicates += 1;
                return Ok(());
            }
        }
        let oti = pkt.fti()?.ok_or(PacketError::MissingFti)?;
        if !self.fdt_receivers.contains_key(&instance_id) {
            self.make_room_for_fdt();
            let mut receiver = ObjectReceiver::new(0, self.config.max_pending_packets, MAX_FDT_BYTES);
            receiver.set_oti(oti, &self.registry)?;
            self.fdt_receivers.insert(instance_id, receiver);
        }
        let Some(receiver) = self.fdt_receivers.get_mut(&instance_id) else {
            return Ok(());
        };
        let outcome = receiver.push(pkt);
        self.count(&outcome)?;
        if outcome != SymbolOutcome::ObjectComplete {
            return Ok(());
        }

        let data = self
            .fdt_receivers
            .remove(&instance_id)
            .and_then(|mut r| r.take_data())
            .unwrap_or_default();
        let fdt = FdtInstance::from_bytes(&data)?;
        if fdt.instance_id != instance_id {
            return Err(PacketError::Rejected(format!(
                "FDT payload declares instance {} but EXT_FDT says {instance_id}",
                fdt.instance_id
            )));
        }
        if fdt.is_expired(Utc::now()) {
            tracing::warn!(tsi = self.tsi, instance_id, "ignoring expired FDT instance");
            return Ok(());
        }
        self.apply_fdt(fdt);
        Ok(())
    }

    fn make_room_for_fdt(&mut self) {
        while self.fdt_receivers.len() >= MAX_FDT_RECEIVERS {
            let Some(oldest) = least_recent(&self.fdt_receivers) else { break };
            self.fdt_receivers.remove(&oldest);
            tracing::debug!(tsi = self.tsi, instance_id = oldest, "partial FDT instance dropped");
        }
    }

    fn apply_fdt(&mut self, fdt: FdtInstance) {
        let instance_id = fdt.instance_id;
        tracing::info!(
            tsi = self.tsi,
            instance_id,
            files = fdt.files.len(),
            complete = fdt.complete,
            "new FDT instance"
        );
        self.fdt_receivers.retain(|id, _| is_newer(*id, instance_id));
        self.stats.fdt_instances += 1;

        for file in &fdt.files {
            let Some(oti) = file.oti else { continue };
            let Some(obj) = self.objects.get_mut(&file.toi) else { continue };
            if let Err(e) = obj.set_oti(oti, &self.registry) {
                tracing::warn!(tsi = self.tsi, toi = file.toi, err = %e, "FDT entry has unusable OTI");
                self.objects.remove(&file.toi);
            }
        }
        let ready: Vec<u64> = fdt
            .files
            .iter()
            .map(|f| f.toi)
            .filter(|toi| {
                self.awaiting_fdt.contains_key(toi)
                    || self.objects.get(toi).is_some_and(ObjectReceiver::is_complete)
            })
            .collect();
        self.fdt = Some(fdt);
        for toi in ready {
            if let Some(mut obj) = self.objects.remove(&toi) {
                if let Some(data) = obj.take_data() {
                    self.mark_completed(toi);
                    self.awaiting_fdt.insert(toi, Reconstructed { data, cenc: obj.cenc, since: Instant::now() });
                }
            }
            if let Some(rec) = self.awaiting_fdt.remove(&toi) {
                self.deliver(toi, rec);
            }
        }
    }

    // ── Objects ──────────────────────────────────────────────────────────────

    fn push_object(&mut self, pkt: AlcPacket) -> Result<(), PacketError> {
        let toi = pkt.lct.toi;
        if self.completed.contains(&toi) {
            self.stats.duplicates += 1;
            return Ok(());
        }
        if !self.objects.contains_key(&toi) {
            self.make_room_for_object();
            let obj = ObjectReceiver::new(toi, self.config.max_pending_packets, self.config.max_object_bytes);
            self.objects.insert(toi, obj);
        }
        let Some(obj) = self.objects.get_mut(&toi) else {
            return Ok(());
        };

        if obj.oti().is_none() {
            let from_fdt = self.fdt.as_ref().and_then(|f| f.get(toi)).and_then(|f| f.oti);
            let oti = match from_fdt {
                Some(oti) => Some(oti),
                None => pkt.fti()?,
            };
            if let Some(oti) = oti {
                if let Err(e) = obj.set_oti(oti, &self.registry) {
                    self.objects.remove(&toi);
                    return Err(e);
                }
            }
        }
        if let Some(cenc) = pkt.cenc()? {
            obj.cenc = Some(cenc);
        }
        let outcome = obj.push(pkt);
        let complete = obj.is_complete();
        self.count(&outcome)?;
        if complete {
            self.complete_object(toi);
        }
        Ok(())
    }

    fn make_room_for_object(&mut self) {
        while self.objects.len() >= self.config.max_active_objects.max(1) {
            let Some(oldest) = least_recent(&self.objects) else { break };
            self.objects.remove(&oldest);
            tracing::debug!(tsi = self.tsi, toi = oldest, "least recently active object evicted");
        }
    }

    fn complete_object(&mut self, toi: u64) {
        let Some(mut obj) = self.objects.remove(&toi) else { return };
        let Some(data) = obj.take_data() else { return };
        self.mark_completed(toi);
        let rec = Reconstructed { data, cenc: obj.cenc, since: Instant::now() };
        if self.fdt.as_ref().and_then(|f| f.get(toi)).is_some() {
            self.deliver(toi, rec);
        } else {
            tracing::debug!(tsi = self.tsi, toi, "object complete, waiting for its FDT entry");
            self.park(toi, rec);
        }
    }

    /// Hold a reconstructed object until an FDT instance lists it.  The
    /// oldest held object is dropped and forgotten when the cap is reached.
    fn park(&mut self, toi: u64, rec: Reconstructed) {
        while self.awaiting_fdt.len() >= self.config.max_awaiting_fdt.max(1) {
            let Some(oldest) = self
                .awaiting_fdt
                .iter()
                .min_by_key(|(_, r)| r.since)
                .map(|(t, _)| *t)
            else {
                break;
            };
            self.awaiting_fdt.remove(&oldest);
            self.forget_completed(oldest);
            self.stats.objects_discarded += 1;
            tracing::warn!(tsi = self.tsi, toi = oldest, "no FDT entry arrived, dropping reconstructed object");
        }
        self.awaiting_fdt.insert(toi, rec);
    }

    fn mark_completed(&mut self, toi: u64) {
        if self.completed.insert(toi) {
            self.completed_fifo.push_back(toi);
        }
        while self.completed_fifo.len() > self.config.max_objects_completed {
            if let Some(old) = self.completed_fifo.pop_front() {
                self.completed.remove(&old);
            }
        }
    }

    fn forget_completed(&mut self, toi: u64) {
        if self.completed.remove(&toi) {
            self.completed_fifo.retain(|t| *t != toi);
        }
    }

    fn deliver(&mut self, toi: u64, rec: Reconstructed) {
        let Some(entry) = self.fdt.as_ref().and_then(|f| f.get(toi)).cloned() else {
            self.park(toi, rec);
            return;
        };
        let data = match self.unpack(&entry, rec) {
            Ok(data) => data,
            Err(reason) => {
                tracing::warn!(tsi = self.tsi, toi, reason = %reason, "discarding reconstructed object");
                self.stats.objects_discarded += 1;
                self.forget_completed(toi);
                return;
            }
        };
        let meta = ObjectMeta {
            toi,
            content_location: entry.content_location,
            content_type:     entry.content_type,
        };
        match self.writer.write(&meta, &data) {
            Ok(()) => {
                self.stats.objects_completed += 1;
                tracing::info!(
                    tsi = self.tsi,
                    toi,
                    len = data.len(),
                    content_location = %meta.content_location,
                    "object received"
                );
            }
            Err(e) => {
                tracing::warn!(tsi = self.tsi, toi, err = %e, "object writer failed");
            }
        }
    }

    /// Check the object against its FDT entry and undo the content encoding.
    fn unpack(&self, entry: &FdtFile, rec: Reconstructed) -> Result<Vec<u8>, String> {
        if rec.data.len() as u64 != entry.transfer_length {
            return Err("transfer length differs from FDT entry".into());
        }
        if let Some(cenc) = rec.cenc.filter(|c| *c != entry.content_encoding) {
            return Err(format!(
                "EXT_CENC says {} but FDT entry says {}", cenc.name(), entry.content_encoding.name()
            ));
        }
        let data = match entry.content_encoding {
            ContentEncoding::Null => rec.data,
            cenc => cenc
                .decode(&rec.data, entry.content_length.min(self.config.max_object_bytes))
                .map_err(|e| e.to_string())?,
        };
        if data.len() as u64 != entry.content_length {
            return Err("content length differs from FDT entry".into());
        }
        if self.config.verify_digest {
            if let Some(expected) = &entry.content_digest {
                if *expected != hex::encode(blake3::hash(&data).as_bytes()) {
                    return Err("content digest mismatch".into());
                }
            }
        }
        Ok(data)
    }

    // ── Eviction ─────────────────────────────────────────────────────────────

    /// Drop the state of an incomplete object.  Later packets for the TOI
    /// start from scratch.
    pub fn evict(&mut self, toi: u64) -> bool {
        let mut removed = self.objects.remove(&toi).is_some();
        if self.awaiting_fdt.remove(&toi).is_some() {
            self.forget_completed(toi);
            removed = true;
        }
        if removed {
            tracing::debug!(tsi = self.tsi, toi, "object evicted");
        }
        removed
    }

    /// Drop incomplete objects idle for at least `max_idle`, and
    /// reconstructed objects whose FDT entry has not come in that time.
    /// Returns how many objects were dropped.
    pub fn evict_stale(&mut self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale = |t: Instant| now.saturating_duration_since(t) >= max_idle;
        let before = self.objects.len();
        self.objects.retain(|_, o| !stale(o.last_activity));
        self.fdt_receivers.retain(|_, o| !stale(o.last_activity));
        let orphans: Vec<u64> = self
            .awaiting_fdt
            .iter()
            .filter(|(_, r)| stale(r.since))
            .map(|(t, _)| *t)
            .collect();
        for toi in &orphans {
            self.awaiting_fdt.remove(toi);
            self.forget_completed(*toi);
        }
        let evicted = before - self.objects.len() + orphans.len();
        if evicted > 0 {
            tracing::info!(tsi = self.tsi, evicted, "stale objects evicted");
        }
        evicted
    }

    /// Apply the configured object timeout.
    pub fn cleanup(&mut self) -> usize {
        match self.config.object_timeout {
            Some(timeout) => self.evict_stale(timeout),
            None => 0,
        }
    }
}

fn least_recent<K: Copy>(receivers: &HashMap<K, ObjectReceiver>) -> Option<K> {
    receivers
        .iter()
        .min_by_key(|(_, r)| r.last_activity)
        .map(|(k, _)| *k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alc::fti_extension;
    use crate::lct::{LctHeader, EXT_CENC};
    use crate::oti::{FecEncodingId, Oti};
    use crate::sender::{ObjectOptions, Sender, SenderConfig};

    fn session(tsi: u64) -> (Receiver, Arc<BufferWriter>) {
        let writer = Arc::new(BufferWriter::new());
        (Receiver::new(tsi, writer.clone(), ReceiverConfig::default()), writer)
    }

    fn packets(sender: &mut Sender) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| sender.read()).collect()
    }

    /// Split into (FDT packets, data packets).
    fn split(all: Vec<Vec<u8>>) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        all.into_iter().partition(|p| AlcPacket::decode(p).unwrap().lct.toi == 0)
    }

    #[test]
    fn test_drops_garbage_and_foreign_tsi() {
        let (mut rx, writer) = session(1);
        rx.push(&[0xFF; 3]);
        rx.push(&[0x20, 0, 3, 0, 0, 0, 0, 0, 0, 1, 0, 1]);
        let foreign = AlcPacket { lct: LctHeader::new(2, 1, 0), sbn: 0, esi: 0, payload: vec![1] }
            .encode()
            .unwrap();
        assert!(matches!(rx.try_push(&foreign), Err(PacketError::SessionMismatch { expected: 1, got: 2 })));
        let stats = rx.stats();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.unsupported_version, 1);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_object_before_fdt_waits() {
        let mut sender = Sender::new(1, SenderConfig::default()).unwrap();
        sender.add_object(b"late fdt".to_vec(), "text/plain", "a.txt", None).unwrap();
        sender.publish().unwrap();
        let all = packets(&mut sender);
        let (fdt, data): (Vec<_>, Vec<_>) = all.into_iter().partition(|p| {
            AlcPacket::decode(p).unwrap().lct.toi == 0
        });

        let (mut rx, writer) = session(1);
        for p in &data {
            rx.push(p);
        }
        assert!(writer.is_empty());
        assert_eq!(rx.nb_objects(), 0);
        for p in &fdt {
            rx.push(p);
        }
        let objects = writer.objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].data, b"late fdt");
        assert_eq!(objects[0].meta.content_location, "a.txt");
    }

    #[test]
    fn test_parked_without_fti() {
        let config = SenderConfig { inband_fti: false, ..SenderConfig::default() };
        let mut sender = Sender::new(1, config).unwrap();
        sender.add_object(vec![3u8; 4000], "", "b", None).unwrap();
        sender.publish().unwrap();
        let mut all = packets(&mut sender);
        // data first, FDT last
        all.rotate_left(1);
        let (mut rx, writer) = session(1);
        for p in &all {
            rx.push(p);
        }
        assert_eq!(writer.len(), 1);
        assert_eq!(writer.objects()[0].data, vec![3u8; 4000]);
    }

    #[test]
    fn test_stale_fdt_ignored() {
        let mut sender = Sender::new(1, SenderConfig::default()).unwrap();
        sender.publish().unwrap();
        let first = packets(&mut sender);
        sender.publish().unwrap();
        let second = packets(&mut sender);

        let (mut rx, _) = session(1);
        for p in &second {
            rx.push(p);
        }
        assert_eq!(rx.fdt().unwrap().instance_id, 2);
        for p in &first {
            rx.push(p);
        }
        assert_eq!(rx.fdt().unwrap().instance_id, 2);
        assert_eq!(rx.stats().fdt_instances, 1);
    }

    #[test]
    fn test_evict_then_fresh_state() {
        let config = SenderConfig { max_payload_size: 16, ..SenderConfig::default() };
        let mut sender = Sender::new(1, config).unwrap();
        sender.add_object(vec![9u8; 64], "", "c", None).unwrap();
        sender.publish().unwrap();
        let all = packets(&mut sender);
        let (fdt, data): (Vec<_>, Vec<_>) = all.into_iter().partition(|p| {
            AlcPacket::decode(p).unwrap().lct.toi == 0
        });

        let (mut rx, writer) = session(1);
        for p in &fdt {
            rx.push(p);
        }
        rx.push(&data[0]);
        assert_eq!(rx.nb_objects(), 1);
        assert!(rx.evict(1));
        assert!(!rx.evict(1));
        assert_eq!(rx.nb_objects(), 0);
        for p in &data {
            rx.push(p);
        }
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_evict_stale_and_cleanup() {
        let (mut rx, _) = session(1);
        let mut sender = Sender::new(1, SenderConfig { max_payload_size: 8, ..SenderConfig::default() }).unwrap();
        sender.add_object(vec![1u8; 32], "", "d", None).unwrap();
        sender.publish().unwrap();
        let data: Vec<_> = packets(&mut sender)
            .into_iter()
            .filter(|p| AlcPacket::decode(p).unwrap().lct.toi != 0)
            .collect();
        rx.push(&data[0]);
        assert_eq!(rx.cleanup(), 0);
        assert_eq!(rx.evict_stale(Duration::ZERO), 1);
        assert_eq!(rx.nb_objects(), 0);
    }

    #[test]
    fn test_digest_mismatch_discards() {
        let mut sender = Sender::new(1, SenderConfig::default()).unwrap();
        sender.add_object(b"genuine".to_vec(), "", "e", None).unwrap();
        sender.publish().unwrap();
        let mut all = packets(&mut sender);
        let last = all.last_mut().unwrap();
        let n = last.len();
        last[n - 1] ^= 0xFF;

        let (mut rx, writer) = session(1);
        for p in &all {
            rx.push(p);
        }
        assert!(writer.is_empty());
        assert_eq!(rx.stats().objects_discarded, 1);
    }

    #[test]
    fn test_oversized_oti_refused_before_allocation() {
        let (mut rx, _) = session(1);
        let mut lct = LctHeader::new(1, 9, FecEncodingId::NoCode.id());
        let oti = Oti::no_code(1, 65536).with_transfer_length(1 << 32);
        lct.extensions.push(fti_extension(&oti).unwrap());
        let pkt = AlcPacket { lct, sbn: 0, esi: 0, payload: vec![0] }.encode().unwrap();
        assert!(matches!(
            rx.try_push(&pkt),
            Err(PacketError::ObjectTooLarge { toi: 9, limit: DEFAULT_MAX_OBJECT_BYTES, .. })
        ));
        assert_eq!(rx.nb_objects(), 0);
    }

    #[test]
    fn test_active_objects_bounded() {
        let config = ReceiverConfig { max_active_objects: 2, ..ReceiverConfig::default() };
        let writer = Arc::new(BufferWriter::new());
        let mut rx = Receiver::new(1, writer.clone(), config);
        let mut sender = Sender::new(1, SenderConfig { max_payload_size: 16, ..SenderConfig::default() }).unwrap();
        for name in ["a", "b", "c"] {
            sender.add_object(vec![1u8; 64], "", name, None).unwrap();
        }
        sender.publish().unwrap();
        let all = packets(&mut sender);
        let (_, data) = split(all.clone());
        for toi in 1..=3 {
            let first = data.iter().find(|p| AlcPacket::decode(p).unwrap().lct.toi == toi).unwrap();
            rx.push(first);
        }
        assert_eq!(rx.nb_objects(), 2);

        for p in &all {
            rx.push(p);
        }
        assert_eq!(writer.len(), 3);
    }

    #[test]
    fn test_awaiting_fdt_bounded() {
        let config = ReceiverConfig { max_awaiting_fdt: 2, ..ReceiverConfig::default() };
        let writer = Arc::new(BufferWriter::new());
        let mut rx = Receiver::new(1, writer.clone(), config);
        let mut sender = Sender::new(1, SenderConfig::default()).unwrap();
        for name in ["a", "b", "c"] {
            sender.add_object(name.as_bytes().to_vec(), "", name, None).unwrap();
        }
        sender.publish().unwrap();
        let (fdt, data) = split(packets(&mut sender));

        for p in &data {
            rx.push(p);
        }
        assert_eq!(rx.awaiting_fdt.len(), 2);
        assert_eq!(rx.stats().objects_discarded, 1);

        for p in &fdt {
            rx.push(p);
        }
        assert_eq!(writer.len(), 2);
        // the dropped object was forgotten, so the next pass delivers it
        for p in &data {
            rx.push(p);
        }
        assert_eq!(writer.len(), 3);
    }

    #[test]
    fn test_awaiting_fdt_expires() {
        let mut sender = Sender::new(1, SenderConfig::default()).unwrap();
        sender.add_object(b"orphan".to_vec(), "", "o", None).unwrap();
        sender.publish().unwrap();
        let (fdt, data) = split(packets(&mut sender));

        let (mut rx, writer) = session(1);
        for p in &data {
            rx.push(p);
        }
        assert_eq!(rx.awaiting_fdt.len(), 1);
        assert_eq!(rx.evict_stale(Duration::ZERO), 1);
        assert!(rx.awaiting_fdt.is_empty());

        for p in fdt.iter().chain(&data) {
            rx.push(p);
        }
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_partial_fdt_instances_bounded() {
        let config = SenderConfig { max_payload_size: 16, ..SenderConfig::default() };
        let mut sender = Sender::new(1, config).unwrap();
        let instances: Vec<Vec<Vec<u8>>> = (0..6)
            .map(|_| {
                sender.publish().unwrap();
                packets(&mut sender)
            })
            .collect();

        let (mut rx, _) = session(1);
        for inst in &instances[..5] {
            assert!(inst.len() > 1);
            rx.push(&inst[0]);
            assert!(rx.fdt_receivers.len() <= MAX_FDT_RECEIVERS);
        }
        assert_eq!(rx.fdt_receivers.len(), MAX_FDT_RECEIVERS);
        assert!(rx.fdt().is_none());

        for p in &instances[5] {
            rx.push(p);
        }
        assert_eq!(rx.fdt().unwrap().instance_id, 6);
        assert!(rx.fdt_receivers.is_empty());
    }

    #[test]
    fn test_content_encoding_restored() {
        let content: Vec<u8> = b"0123456789".iter().copied().cycle().take(50_000).collect();
        let mut sender = Sender::new(1, SenderConfig::default()).unwrap();
        for cenc in [ContentEncoding::Zlib, ContentEncoding::Deflate, ContentEncoding::Gzip] {
            let options = ObjectOptions { content_encoding: cenc, ..ObjectOptions::default() };
            sender.add_object_with(content.clone(), "", cenc.name(), options).unwrap();
        }
        sender.publish().unwrap();

        let (mut rx, writer) = session(1);
        for p in packets(&mut sender) {
            rx.push(&p);
        }
        let objects = writer.objects();
        assert_eq!(objects.len(), 3);
        assert!(objects.iter().all(|o| o.data == content));
    }

    #[test]
    fn test_content_encoding_mismatch_discards() {
        let mut sender = Sender::new(1, SenderConfig::default()).unwrap();
        let options = ObjectOptions { content_encoding: ContentEncoding::Gzip, ..ObjectOptions::default() };
        sender.add_object_with(vec![b'x'; 5000], "", "x", options).unwrap();
        sender.publish().unwrap();
        let (fdt, mut data) = split(packets(&mut sender));
        for p in &mut data {
            // 12 bytes of LCT and 16 of EXT_FTI precede EXT_CENC
            assert_eq!(p[28], EXT_CENC);
            p[29] = ContentEncoding::Deflate.id();
        }

        let (mut rx, writer) = session(1);
        for p in fdt.iter().chain(&data) {
            rx.push(p);
        }
        assert!(writer.is_empty());
        assert_eq!(rx.stats().objects_discarded, 1);
    }

    #[test]
    fn test_close_session() {
        let sender = Sender::new(1, SenderConfig::default()).unwrap();
        let (mut rx, _) = session(1);
        assert!(!rx.is_closed());
        rx.push(&sender.close_session_packet().unwrap());
        assert!(rx.is_closed());
        assert_eq!(rx.stats().dropped, 0);
    }
}
