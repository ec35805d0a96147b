//! Demultiplexer over many sessions.
//!
//! A session is identified by the UDP endpoint its packets arrive on plus
//! the TSI in their LCT header.  Sessions are created on first packet and
//! dropped once the sender closes them.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::fec::FecRegistry;
use crate::lct;

use super::{ObjectWriter, Receiver, ReceiverConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpEndpoint {
    /// Source address for source-specific multicast, `None` for any source.
    pub source: Option<IpAddr>,
    pub group:  IpAddr,
    pub port:   u16,
}

impl UdpEndpoint {
    pub fn new(source: Option<IpAddr>, group: IpAddr, port: u16) -> Self {
        Self { source, group, port }
    }
}

type SessionKey = (UdpEndpoint, u64);

pub struct MultiReceiver {
    writer:     Arc<dyn ObjectWriter>,
    config:     ReceiverConfig,
    registry:   FecRegistry,
    sessions:   Mutex<HashMap<SessionKey, Arc<Mutex<Receiver>>>>,
    /// `None` accepts every TSI.
    tsi_filter: Mutex<Option<HashSet<u64>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MultiReceiver {
    pub fn new(writer: Arc<dyn ObjectWriter>, config: ReceiverConfig) -> Self {
        Self::with_registry(writer, config, FecRegistry::new())
    }

    pub fn with_registry(writer: Arc<dyn ObjectWriter>, config: ReceiverConfig, registry: FecRegistry) -> Self {
        Self {
            writer,
            config,
            registry,
            sessions:   Mutex::new(HashMap::new()),
            tsi_filter: Mutex::new(None),
        }
    }

    /// Restrict reception to the listed TSIs.  The first call switches from
    /// accepting every session to accepting only listed ones.
    pub fn add_listen_tsi(&self, tsi: u64) {
        lock(&self.tsi_filter).get_or_insert_with(HashSet::new).insert(tsi);
    }

    pub fn remove_listen_tsi(&self, tsi: u64) {
        if let Some(filter) = lock(&self.tsi_filter).as_mut() {
            filter.remove(&tsi);
        }
        lock(&self.sessions).retain(|(_, t), _| *t != tsi);
    }

    fn accepts(&self, tsi: u64) -> bool {
        lock(&self.tsi_filter).as_ref().map_or(true, |f| f.contains(&tsi))
    }

    /// Route one datagram to its session.
    pub fn push(&self, endpoint: &UdpEndpoint, data: &[u8]) {
        let summary = match lct::peek(data) {
            Ok(summary) => summary,
            Err(e) => {
                tracing::debug!(?endpoint, err = %e, "undecodable datagram dropped");
                return;
            }
        };
        if !self.accepts(summary.tsi) {
            return;
        }
        let key = (*endpoint, summary.tsi);
        let session = {
            let mut sessions = lock(&self.sessions);
            if summary.close_session && !sessions.contains_key(&key) {
                return;
            }
            sessions
                .entry(key)
                .or_insert_with(|| {
                    tracing::info!(?endpoint, tsi = summary.tsi, "new session");
                    Arc::new(Mutex::new(Receiver::with_registry(
                        summary.tsi,
                        self.writer.clone(),
                        self.config.clone(),
                        self.registry.clone(),
                    )))
                })
                .clone()
        };

        let closed = {
            let mut receiver = lock(&session);
            receiver.push(data);
            receiver.is_closed()
        };
        if closed {
            lock(&self.sessions).remove(&key);
            tracing::info!(?endpoint, tsi = summary.tsi, "session removed");
        }
    }

    pub fn nb_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn session(&self, endpoint: &UdpEndpoint, tsi: u64) -> Option<Arc<Mutex<Receiver>>> {
        lock(&self.sessions).get(&(*endpoint, tsi)).cloned()
    }

    /// Run [`Receiver::cleanup`] on every session.
    pub fn cleanup(&self) -> usize {
        let sessions: Vec<_> = lock(&self.sessions).values().cloned().collect();
        sessions.iter().map(|s| lock(s).cleanup()).sum()
    }
}
