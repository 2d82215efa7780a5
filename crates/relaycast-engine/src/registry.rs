//! System-wide registry of active producers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use relaycast_ipc::{MediaKind, ProducerId, ProducerInfo};

/// Registry shared between the gateway and the controller.
pub type SharedRegistry = Arc<RwLock<ProducerRegistry>>;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The id is registered, or was registered before.
    #[error("Producer id already used: {0}")]
    DuplicateId(ProducerId),

    /// The id is not registered.
    #[error("Producer not found: {0}")]
    NotFound(ProducerId),
}

struct Entry {
    info: ProducerInfo,
    seq: u64,
}

/// Tracks every active producer. Emits nothing; callers notify the
/// controller after mutating it.
#[derive(Default)]
pub struct ProducerRegistry {
    producers: HashMap<ProducerId, Entry>,
    // Ids are never reused, even after the producer is gone.
    retired: HashSet<ProducerId>,
    next_seq: u64,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry wrapped for sharing.
    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn register(&mut self, producer: ProducerInfo) -> Result<(), RegistryError> {
        if self.producers.contains_key(&producer.id) || self.retired.contains(&producer.id) {
            return Err(RegistryError::DuplicateId(producer.id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.producers
            .insert(producer.id.clone(), Entry { info: producer, seq });
        Ok(())
    }

    /// Remove and return a producer. Racing removals get `NotFound`.
    pub fn unregister(&mut self, id: &str) -> Result<ProducerInfo, RegistryError> {
        let entry = self
            .producers
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.retired.insert(entry.info.id.clone());
        Ok(entry.info)
    }

    pub fn list_by_kind(&self, kind: MediaKind) -> Vec<ProducerInfo> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.kind == kind)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ProducerInfo> {
        self.producers.get(id).map(|e| &e.info)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.producers.contains_key(id)
    }

    /// All producers in registration order.
    pub fn snapshot(&self) -> Vec<ProducerInfo> {
        let mut entries: Vec<&Entry> = self.producers.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.info.clone()).collect()
    }

    pub fn ids(&self) -> Vec<ProducerId> {
        self.snapshot().into_iter().map(|p| p.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_ipc::CodecDescriptor;
    use std::collections::BTreeMap;

    fn producer(id: &str, kind: MediaKind) -> ProducerInfo {
        ProducerInfo {
            id: id.to_string(),
            session_id: "s1".to_string(),
            kind,
            codec: CodecDescriptor {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
                payload_type: 96,
                parameters: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_register_and_list() {
        let mut registry = ProducerRegistry::new();
        registry.register(producer("v1", MediaKind::Video)).unwrap();
        registry.register(producer("a1", MediaKind::Audio)).unwrap();
        registry.register(producer("v2", MediaKind::Video)).unwrap();

        assert_eq!(registry.count(), 3);
        let video: Vec<_> = registry
            .list_by_kind(MediaKind::Video)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(video, vec!["v1", "v2"]);
        assert_eq!(registry.ids(), vec!["v1", "a1", "v2"]);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let mut registry = ProducerRegistry::new();
        registry.register(producer("v1", MediaKind::Video)).unwrap();

        let err = registry.register(producer("v1", MediaKind::Video)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId("v1".to_string()));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_unregister_twice_reports_not_found() {
        let mut registry = ProducerRegistry::new();
        registry.register(producer("v1", MediaKind::Video)).unwrap();

        let removed = registry.unregister("v1").unwrap();
        assert_eq!(removed.id, "v1");
        assert_eq!(
            registry.unregister("v1").unwrap_err(),
            RegistryError::NotFound("v1".to_string())
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retired_ids_are_never_reused() {
        let mut registry = ProducerRegistry::new();
        registry.register(producer("v1", MediaKind::Video)).unwrap();
        registry.unregister("v1").unwrap();

        assert!(matches!(
            registry.register(producer("v1", MediaKind::Video)),
            Err(RegistryError::DuplicateId(_))
        ));
    }
}
