//! Sender engine: object queue, FDT carousel and packet generation.
//!
//! # Object lifecycle
//! ```text
//! add_object ──► Queued ──publish()──► Publishing ──read()──► Draining ──► Done
//! ```
//! Done objects are dropped from the engine, unless their
//! `max_transfer_count` asks for more passes: they then go back to
//! Publishing at the end of the transmission order.  [`Sender::read`] is a pull
//! cursor: each call yields one encoded ALC packet, or `None` once every
//! published object and the FDT have been fully emitted.
//!
//! # FDT carousel
//! Every `publish()` seals a new FDT instance and schedules it ahead of any
//! object data.  With `interleave_blocks = n > 0` the instance is sent again
//! after every `n` source blocks of object data, so receivers joining late
//! still learn the table.  With `0` it is sent once per publish.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::alc::{fti_extension, AlcError, AlcPacket};
use crate::cenc::{cenc_extension, CencError, ContentEncoding};
use crate::fdt::{expiry_after, next_instance_id, FdtError, FdtFile, FdtInstance};
use crate::fec::{FecCodec, FecError, FecRegistry};
use crate::lct::{HeaderExtension, LctHeader};
use crate::oti::{FecEncodingId, Oti, OtiError};
use crate::partition::{partition, Layout};

/// Default encoding symbol length: fits a 1500-byte MTU with IP/UDP/LCT headers.
pub const DEFAULT_MAX_PAYLOAD_SIZE:        u16      = 1400;
/// Default source symbols per block.
pub const DEFAULT_MAX_SOURCE_BLOCK_LENGTH: u32      = 64;
/// Default FDT re-injection period, in source blocks.
pub const DEFAULT_INTERLEAVE_BLOCKS:       u32      = 4;
/// Default limit on objects tracked at once.
pub const DEFAULT_MAX_OBJECTS:             usize    = 1024;
/// Default FDT validity.
pub const DEFAULT_FDT_DURATION:            Duration = Duration::from_secs(3600);

const MAX_TSI: u64 = 0xFFFF_FFFF_FFFF;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Object queue full ({0} objects)")]
    QueueFull(usize),
    #[error(transparent)]
    InvalidOti(#[from] OtiError),
    #[error("FDT is marked complete, no more objects accepted")]
    FdtComplete,
    #[error("Invalid sender configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Fdt(#[from] FdtError),
    #[error(transparent)]
    Alc(#[from] AlcError),
    #[error(transparent)]
    Fec(#[from] FecError),
    #[error(transparent)]
    Cenc(#[from] CencError),
}

// ── SenderConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Encoding symbol length in bytes.
    pub max_payload_size:             u16,
    pub fec_encoding:                 FecEncodingId,
    pub max_source_block_length:      u32,
    /// Ignored by the no-code scheme.
    pub max_number_of_parity_symbols: u16,
    /// Source blocks between FDT re-injections; 0 sends the FDT once per publish.
    pub interleave_blocks:            u32,
    pub max_objects:                  usize,
    /// Carry EXT_FTI on data packets as well as on FDT packets.
    pub inband_fti:                   bool,
    pub fdt_duration:                 Duration,
    pub fdt_start_instance_id:        u32,
    /// Publish a BLAKE3 digest of each object in the FDT.
    pub content_digest:               bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_payload_size:             DEFAULT_MAX_PAYLOAD_SIZE,
            fec_encoding:                 FecEncodingId::NoCode,
            max_source_block_length:      DEFAULT_MAX_SOURCE_BLOCK_LENGTH,
            max_number_of_parity_symbols: 0,
            interleave_blocks:            DEFAULT_INTERLEAVE_BLOCKS,
            max_objects:                  DEFAULT_MAX_OBJECTS,
            inband_fti:                   true,
            fdt_duration:                 DEFAULT_FDT_DURATION,
            fdt_start_instance_id:        1,
            content_digest:               true,
        }
    }
}

impl SenderConfig {
    /// Session default OTI, not yet bound to an object length.
    pub fn oti(&self) -> Oti {
        let parity = match self.fec_encoding {
            FecEncodingId::NoCode          => 0,
            FecEncodingId::ReedSolomonGf28 => self.max_number_of_parity_symbols,
        };
        Oti {
            fec_encoding_id:              self.fec_encoding,
            transfer_length:              0,
            encoding_symbol_length:       self.max_payload_size,
            max_source_block_length:      self.max_source_block_length,
            max_number_of_parity_symbols: parity,
            inband_fti:                   self.inband_fti,
        }
    }
}

// ── Object bookkeeping ───────────────────────────────────────────────────────

/// Per-object transmission options for [`Sender::add_object_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectOptions {
    /// Overrides the session OTI; the transfer length is filled in.
    pub oti:                Option<Oti>,
    pub content_encoding:   ContentEncoding,
    /// Full passes over the object's symbols before it is dropped.
    pub max_transfer_count: u32,
}

impl Default for ObjectOptions {
    fn default() -> Self {
        Self { oti: None, content_encoding: ContentEncoding::Null, max_transfer_count: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Queued,
    Publishing,
    Draining,
}

struct SenderObject {
    content_location: String,
    content_type:     String,
    content_length:   u64,
    content_encoding: ContentEncoding,
    /// Content after encoding; this is what gets FEC encoded.
    payload:          Vec<u8>,
    oti:              Oti,
    digest:           Option<String>,
    state:            ObjectState,
    transfers_left:   u32,
}

struct ObjectCursor {
    toi:     u64,
    oti:     Oti,
    layout:  Layout,
    codec:   Arc<dyn FecCodec>,
    fti:     Option<HeaderExtension>,
    cenc:    Option<HeaderExtension>,
    sbn:     u32,
    esi:     usize,
    /// Encoding symbols of block `sbn`, filled lazily.
    symbols: Vec<Vec<u8>>,
}

// ── Sender ───────────────────────────────────────────────────────────────────

pub struct Sender {
    tsi:              u64,
    config:           SenderConfig,
    registry:         FecRegistry,
    objects:          BTreeMap<u64, SenderObject>,
    /// Published objects not yet started, in transmission order.
    order:            VecDeque<u64>,
    current:          Option<ObjectCursor>,
    fdt:              Option<FdtInstance>,
    fdt_packets:      Vec<Vec<u8>>,
    fdt_cursor:       Option<usize>,
    fdt_due:          bool,
    blocks_since_fdt: u32,
    next_toi:         u64,
    next_instance_id: u32,
    complete:         bool,
}

impl Sender {
    pub fn new(tsi: u64, config: SenderConfig) -> Result<Self, SenderError> {
        Self::with_registry(tsi, config, FecRegistry::new())
    }

    pub fn with_registry(tsi: u64, config: SenderConfig, registry: FecRegistry) -> Result<Self, SenderError> {
        if tsi > MAX_TSI {
            return Err(SenderError::InvalidConfig(format!("TSI {tsi} exceeds 48 bits")));
        }
        if config.max_objects == 0 {
            return Err(SenderError::InvalidConfig("max_objects is 0".into()));
        }
        config.oti().validate()?;
        let next_instance_id = config.fdt_start_instance_id & crate::fdt::FDT_INSTANCE_ID_MASK;
        Ok(Self {
            tsi,
            config,
            registry,
            objects:          BTreeMap::new(),
            order:            VecDeque::new(),
            current:          None,
            fdt:              None,
            fdt_packets:      Vec::new(),
            fdt_cursor:       None,
            fdt_due:          false,
            blocks_since_fdt: 0,
            next_toi:         1,
            next_instance_id,
            complete:         false,
        })
    }

    pub fn tsi(&self) -> u64 {
        self.tsi
    }

    /// Queue an object and return its TOI.  It is not transmitted before the
    /// next [`Sender::publish`].
    pub fn add_object(
        &mut self,
        content:          Vec<u8>,
        content_type:     &str,
        content_location: &str,
        oti:              Option<Oti>,
    ) -> Result<u64, SenderError> {
        let options = ObjectOptions { oti, ..ObjectOptions::default() };
        self.add_object_with(content, content_type, content_location, options)
    }

    /// [`Sender::add_object`] with content encoding and repetition.
    pub fn add_object_with(
        &mut self,
        content:          Vec<u8>,
        content_type:     &str,
        content_location: &str,
        options:          ObjectOptions,
    ) -> Result<u64, SenderError> {
        if self.complete {
            return Err(SenderError::FdtComplete);
        }
        if self.objects.len() >= self.config.max_objects {
            return Err(SenderError::QueueFull(self.config.max_objects));
        }
        let digest = self
            .config
            .content_digest
            .then(|| hex::encode(blake3::hash(&content).as_bytes()));
        let content_length = content.len() as u64;
        let payload = match options.content_encoding {
            ContentEncoding::Null => content,
            cenc => cenc.encode(&content)?,
        };
        let oti = options
            .oti
            .unwrap_or_else(|| self.config.oti())
            .with_transfer_length(payload.len() as u64);
        oti.validate()?;

        let toi = self.allocate_toi();
        tracing::debug!(
            tsi = self.tsi,
            toi,
            len = content_length,
            transfer_length = payload.len(),
            cenc = options.content_encoding.name(),
            content_location,
            "object queued"
        );
        self.objects.insert(toi, SenderObject {
            content_location: content_location.to_string(),
            content_type:     content_type.to_string(),
            content_length,
            content_encoding: options.content_encoding,
            payload,
            oti,
            digest,
            state:            ObjectState::Queued,
            transfers_left:   options.max_transfer_count.max(1),
        });
        Ok(toi)
    }

    fn allocate_toi(&mut self) -> u64 {
        loop {
            let toi = self.next_toi;
            self.next_toi = self.next_toi.wrapping_add(1);
            if toi != 0 && !self.objects.contains_key(&toi) {
                return toi;
            }
        }
    }

    /// Drop an object that has not finished transmitting.
    pub fn remove_object(&mut self, toi: u64) -> bool {
        if self.objects.remove(&toi).is_none() {
            return false;
        }
        self.order.retain(|t| *t != toi);
        if self.current.as_ref().is_some_and(|c| c.toi == toi) {
            self.current = None;
        }
        tracing::debug!(tsi = self.tsi, toi, "object removed");
        true
    }

    /// Objects still tracked (Queued, Publishing or Draining).
    pub fn nb_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn object_state(&self, toi: u64) -> Option<ObjectState> {
        self.objects.get(&toi).map(|o| o.state)
    }

    /// Mark the FDT complete: the next published instance carries the
    /// `Complete` attribute and further objects are refused.
    pub fn set_complete(&mut self) {
        self.complete = true;
    }

    /// Last sealed FDT instance.
    pub fn fdt(&self) -> Option<&FdtInstance> {
        self.fdt.as_ref()
    }

    /// Seal a new FDT instance and commit every Queued object for transmission.
    pub fn publish(&mut self) -> Result<u32, SenderError> {
        let instance_id = self.next_instance_id;
        let mut fdt = FdtInstance::new(
            instance_id,
            expiry_after(Utc::now(), self.config.fdt_duration),
        );
        fdt.complete = self.complete;
        let mut published = Vec::new();
        for (toi, obj) in self.objects.iter_mut() {
            if obj.state == ObjectState::Queued {
                obj.state = ObjectState::Publishing;
                published.push(*toi);
            }
            fdt.files.push(FdtFile {
                toi:              *toi,
                content_location: obj.content_location.clone(),
                content_type:     obj.content_type.clone(),
                content_length:   obj.content_length,
                transfer_length:  obj.payload.len() as u64,
                content_encoding: obj.content_encoding,
                oti:              Some(obj.oti),
                content_digest:   obj.digest.clone(),
            });
        }

        let payload = fdt.to_bytes()?;
        let fdt_oti = self.config.oti().with_transfer_length(payload.len() as u64);
        fdt_oti.validate()?;
        self.fdt_packets = self.encode_fdt(&payload, &fdt_oti, instance_id)?;
        self.next_instance_id = next_instance_id(instance_id);
        self.order.extend(published.iter().copied());
        self.fdt = Some(fdt);
        self.fdt_cursor = None;
        self.fdt_due = true;
        tracing::info!(
            tsi = self.tsi,
            instance_id,
            files = self.objects.len(),
            published = published.len(),
            "FDT instance sealed"
        );
        Ok(instance_id)
    }

    fn encode_fdt(&self, payload: &[u8], oti: &Oti, instance_id: u32) -> Result<Vec<Vec<u8>>, SenderError> {
        let layout = partition(payload.len() as u64, oti)?;
        let codec = self.registry.get(oti.fec_encoding_id);
        let fti = fti_extension(oti)?;
        let mut packets = Vec::new();
        for block in &layout.blocks {
            let data = &payload[block.offset as usize..(block.offset + block.block_byte_length) as usize];
            let symbols = codec.encode(data, block, oti)?;
            let last_block = block.sbn as usize + 1 == layout.nb_blocks();
            let nb = symbols.len();
            for (esi, symbol) in symbols.into_iter().enumerate() {
                let mut lct = LctHeader::new(self.tsi, 0, oti.fec_encoding_id.id());
                lct.fdt_instance_id = Some(instance_id);
                lct.close_object = last_block && esi + 1 == nb;
                lct.extensions.push(fti.clone());
                let pkt = AlcPacket { lct, sbn: block.sbn, esi: esi as u32, payload: symbol };
                packets.push(pkt.encode()?);
            }
        }
        Ok(packets)
    }

    /// Produce the next packet, or `None` once everything published is sent.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(pkt) = self.next_fdt_packet() {
                return Some(pkt);
            }
            if self.current.is_none() && !self.start_next_object() {
                return None;
            }
            match self.next_object_packet() {
                Ok(Some(pkt)) => return Some(pkt),
                Ok(None) => continue,
                Err(e) => {
                    if let Some(cursor) = self.current.take() {
                        tracing::error!(tsi = self.tsi, toi = cursor.toi, err = %e, "dropping object");
                        self.objects.remove(&cursor.toi);
                    }
                }
            }
        }
    }

    fn next_fdt_packet(&mut self) -> Option<Vec<u8>> {
        if let Some(i) = self.fdt_cursor {
            if let Some(pkt) = self.fdt_packets.get(i) {
                self.fdt_cursor = Some(i + 1);
                return Some(pkt.clone());
            }
            self.fdt_cursor = None;
        }
        if self.fdt_due {
            self.fdt_due = false;
            self.blocks_since_fdt = 0;
            if let Some(pkt) = self.fdt_packets.first() {
                self.fdt_cursor = Some(1);
                return Some(pkt.clone());
            }
        }
        None
    }

    fn start_next_object(&mut self) -> bool {
        while let Some(toi) = self.order.pop_front() {
            let Some(obj) = self.objects.get_mut(&toi) else { continue };
            let layout = match partition(obj.payload.len() as u64, &obj.oti) {
                Ok(layout) => layout,
                Err(e) => {
                    tracing::error!(tsi = self.tsi, toi, err = %e, "cannot partition object");
                    self.objects.remove(&toi);
                    continue;
                }
            };
            let fti = if obj.oti.inband_fti {
                match fti_extension(&obj.oti) {
                    Ok(ext) => Some(ext),
                    Err(e) => {
                        tracing::error!(tsi = self.tsi, toi, err = %e, "cannot encode FTI");
                        self.objects.remove(&toi);
                        continue;
                    }
                }
            } else {
                None
            };
            let cenc = (!obj.content_encoding.is_null()).then(|| cenc_extension(obj.content_encoding));
            obj.state = ObjectState::Draining;
            self.current = Some(ObjectCursor {
                toi,
                oti: obj.oti,
                layout,
                codec: self.registry.get(obj.oti.fec_encoding_id),
                fti,
                cenc,
                sbn: 0,
                esi: 0,
                symbols: Vec::new(),
            });
            return true;
        }
        false
    }

    fn next_object_packet(&mut self) -> Result<Option<Vec<u8>>, SenderError> {
        let Some(cursor) = self.current.as_mut() else { return Ok(None) };
        let Some(obj) = self.objects.get(&cursor.toi) else {
            self.current = None;
            return Ok(None);
        };
        let Some(block) = cursor.layout.block(cursor.sbn).copied() else {
            self.current = None;
            return Ok(None);
        };

        if cursor.symbols.is_empty() {
            let start = block.offset as usize;
            let data = &obj.payload[start..start + block.block_byte_length as usize];
            cursor.symbols = cursor.codec.encode(data, &block, &cursor.oti)?;
            cursor.esi = 0;
        }

        let esi = cursor.esi;
        let nb_symbols = cursor.symbols.len();
        let Some(symbol) = cursor.symbols.get_mut(esi) else {
            return Err(FecError::Encode(format!(
                "codec produced {nb_symbols} symbols for block {}, ESI {esi} missing", block.sbn
            ))
            .into());
        };
        let payload = std::mem::take(symbol);
        let block_done = esi + 1 == cursor.symbols.len();
        let object_done = block_done && cursor.sbn as usize + 1 == cursor.layout.nb_blocks();

        let mut lct = LctHeader::new(self.tsi, cursor.toi, cursor.oti.fec_encoding_id.id());
        lct.close_object = object_done;
        if let Some(fti) = &cursor.fti {
            lct.extensions.push(fti.clone());
        }
        if let Some(cenc) = &cursor.cenc {
            lct.extensions.push(cenc.clone());
        }
        let pkt = AlcPacket { lct, sbn: block.sbn, esi: esi as u32, payload }.encode()?;

        cursor.esi += 1;
        let toi = cursor.toi;
        if block_done {
            cursor.sbn += 1;
            cursor.symbols.clear();
        }
        if object_done {
            self.current = None;
            self.finish_transfer(toi);
        }
        if block_done {
            self.blocks_since_fdt += 1;
            let more = self.current.is_some() || !self.order.is_empty();
            if self.config.interleave_blocks > 0
                && self.blocks_since_fdt >= self.config.interleave_blocks
                && more
            {
                self.fdt_due = true;
            }
        }
        Ok(Some(pkt))
    }

    /// One pass over `toi` is done: requeue it or drop it.
    fn finish_transfer(&mut self, toi: u64) {
        let Some(obj) = self.objects.get_mut(&toi) else { return };
        obj.transfers_left = obj.transfers_left.saturating_sub(1);
        if obj.transfers_left > 0 {
            obj.state = ObjectState::Publishing;
            self.order.push_back(toi);
            tracing::debug!(tsi = self.tsi, toi, left = obj.transfers_left, "object requeued");
        } else {
            self.objects.remove(&toi);
            tracing::debug!(tsi = self.tsi, toi, "object sent");
        }
    }

    /// A packet telling receivers the session is over (LCT A flag).
    pub fn close_session_packet(&self) -> Result<Vec<u8>, SenderError> {
        let fec = self.config.fec_encoding;
        let mut lct = LctHeader::new(self.tsi, 0, fec.id());
        lct.close_session = true;
        Ok(AlcPacket { lct, sbn: 0, esi: 0, payload: Vec::new() }.encode()?)
    }
}
