/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Durable session storage for in-flight QoS 1+ publish traffic.

When `clean_session` is false, unacknowledged publishes (in both directions) must survive a
client restart.  This module persists them as JSON records in an injected key-value store,
keyed by direction, connection identity and packet id, and restores them into replayable
packets on construction of a new protocol state over the same store.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::publish::PublishPacket;
use crate::mqtt::utils::convert_u8_to_quality_of_service;

use log::*;
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SENT_RECORD_PREFIX: &str = "Sent:";
const RECEIVED_RECORD_PREFIX: &str = "Received:";

const STORED_RECORD_VERSION: u8 = 1;
const STORED_RECORD_PUBLISH_TYPE: u8 = 3;

/// Minimal key-value contract the durable session store must satisfy.  Keys and values are
/// strings; enumeration of all keys must be possible so that a new client can discover the
/// records belonging to its connection identity.
///
/// A single store may be shared by many clients, but records are private to one
/// `(host, port, path, client id)` tuple via their key prefix.  Concurrent client instances
/// sharing that tuple will corrupt each other's records; this is a documented constraint, not
/// something the implementation guards against.
pub trait SessionStore: Send {

    /// Returns the value stored under a key, if any.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Stores a value under a key, replacing any previous value.
    fn set_item(&mut self, key: &str, value: &str);

    /// Removes a key and its value.  Removing an absent key is a no-op.
    fn remove_item(&mut self, key: &str);

    /// Returns every key currently present in the store.
    fn keys(&self) -> Vec<String>;
}

/// Hash-map backed session store.  Clones share the same underlying storage, which lets a
/// fresh client instance restore the session a previous instance persisted.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySessionStore {

    /// Creates a new, empty store.
    pub fn new() -> Self {
        MemorySessionStore {
            ..Default::default()
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set_item(&mut self, key: &str, value: &str) {
        self.entries.lock().unwrap().insert(key.to_string(), value.to_string());
    }

    fn remove_item(&mut self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredPublishRecord {
    record_version: u8,
    packet_type: u8,
    packet_id: u16,
    pubrec_received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    topic: String,
    qos: u8,
    retain: bool,
    duplicate: bool,
    payload_hex: String,
}

/// An unacknowledged sent publish rebuilt from durable storage.
pub(crate) struct RestoredPublish {

    /// The publish packet, marked as a duplicate delivery, with its original packet id bound.
    pub publish: PublishPacket,

    /// True if the broker's PUBREC was seen before the restart; replay continues with PUBREL.
    pub pubrec_received: bool,

    /// Submission-order stamp; replay must happen in ascending sequence order.
    pub sequence: u64,
}

/// Everything found in durable storage for one connection identity.
pub(crate) struct RestoredSession {
    pub sent: Vec<RestoredPublish>,
    pub received: Vec<PublishPacket>,
}

/// Owns the key scheme and record codec for one connection identity's durable session state.
pub(crate) struct SessionState {
    store: Box<dyn SessionStore>,
    local_key: String,
    next_sequence: u64,
}

impl SessionState {

    /// Creates session state scoped to one connection identity.  The path segment only
    /// participates in the key when it differs from the conventional default, which keeps keys
    /// stable for the overwhelmingly common case.
    pub fn new(store: Box<dyn SessionStore>, host: &str, port: u16, path: &str, client_id: &str) -> Self {
        let path_segment =
            if path == crate::config::DEFAULT_ENDPOINT_PATH {
                String::new()
            } else {
                format!(":{}", path)
            };

        SessionState {
            store,
            local_key: format!("{}:{}{}:{}:", host, port, path_segment, client_id),
            next_sequence: 1,
        }
    }

    fn sent_key(&self, packet_id: u16) -> String {
        format!("{}{}{}", SENT_RECORD_PREFIX, self.local_key, packet_id)
    }

    fn received_key(&self, packet_id: u16) -> String {
        format!("{}{}{}", RECEIVED_RECORD_PREFIX, self.local_key, packet_id)
    }

    fn build_record(publish: &PublishPacket, pubrec_received: bool, sequence: Option<u64>) -> StoredPublishRecord {
        StoredPublishRecord {
            record_version: STORED_RECORD_VERSION,
            packet_type: STORED_RECORD_PUBLISH_TYPE,
            packet_id: publish.packet_id,
            pubrec_received,
            sequence,
            topic: publish.topic.clone(),
            qos: publish.qos as u8,
            retain: publish.retain,
            duplicate: publish.duplicate,
            payload_hex: hex::encode(&publish.payload),
        }
    }

    fn write_record(&mut self, key: &str, record: &StoredPublishRecord) -> MqttResult<()> {
        let serialized = serde_json::to_string(record)
            .map_err(MqttError::new_session_store_failure)?;

        self.store.set_item(key, &serialized);

        Ok(())
    }

    /// Persists an unacknowledged sent publish.  A sequence number is assigned the first time
    /// a given packet id is stored and preserved by subsequent updates (such as recording
    /// pubrec receipt).
    pub fn store_sent(&mut self, publish: &PublishPacket, pubrec_received: bool) -> MqttResult<()> {
        let key = self.sent_key(publish.packet_id);

        let existing_sequence =
            self.store.get_item(&key)
                .and_then(|value| serde_json::from_str::<StoredPublishRecord>(&value).ok())
                .and_then(|record| record.sequence);

        let sequence =
            if let Some(sequence) = existing_sequence {
                sequence
            } else {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                sequence
            };

        debug!("session store - persisting sent publish with packet id {} at sequence {}", publish.packet_id, sequence);
        let record = Self::build_record(publish, pubrec_received, Some(sequence));
        self.write_record(&key, &record)
    }

    /// Persists an incompletely-received inbound QoS 2 publish awaiting its PUBREL.
    pub fn store_received(&mut self, publish: &PublishPacket) -> MqttResult<()> {
        debug!("session store - persisting received publish with packet id {}", publish.packet_id);
        let key = self.received_key(publish.packet_id);
        let record = Self::build_record(publish, false, None);
        self.write_record(&key, &record)
    }

    pub fn remove_sent(&mut self, packet_id: u16) {
        let key = self.sent_key(packet_id);
        self.store.remove_item(&key);
    }

    pub fn remove_received(&mut self, packet_id: u16) {
        let key = self.received_key(packet_id);
        self.store.remove_item(&key);
    }

    /// Removes every record belonging to this connection identity.  Invoked on a successful
    /// clean-session CONNACK.
    pub fn clear(&mut self) {
        let keys = self.store.keys();
        for key in keys {
            if self.key_direction(&key).is_some() {
                self.store.remove_item(&key);
            }
        }
    }

    fn key_direction(&self, key: &str) -> Option<bool> {
        if let Some(remainder) = key.strip_prefix(SENT_RECORD_PREFIX) {
            if remainder.starts_with(&self.local_key) {
                return Some(true);
            }
        } else if let Some(remainder) = key.strip_prefix(RECEIVED_RECORD_PREFIX) {
            if remainder.starts_with(&self.local_key) {
                return Some(false);
            }
        }

        None
    }

    fn parse_record(&self, key: &str) -> MqttResult<StoredPublishRecord> {
        let value = self.store.get_item(key)
            .ok_or_else(|| MqttError::new_session_store_failure("session record vanished during restore"))?;

        let record: StoredPublishRecord = serde_json::from_str(&value)
            .map_err(MqttError::new_session_store_failure)?;

        if record.record_version != STORED_RECORD_VERSION {
            error!("session store - record under key \"{}\" has unrecognized version {}", key, record.record_version);
            return Err(MqttError::new_session_store_failure("session record has an unrecognized version"));
        }

        if record.packet_type != STORED_RECORD_PUBLISH_TYPE {
            error!("session store - record under key \"{}\" is not a publish", key);
            return Err(MqttError::new_session_store_failure("only publish records may be restored"));
        }

        Ok(record)
    }

    fn rebuild_publish(record: &StoredPublishRecord) -> MqttResult<PublishPacket> {
        let payload = hex::decode(&record.payload_hex)
            .map_err(MqttError::new_session_store_failure)?;

        Ok(PublishPacket {
            packet_id: record.packet_id,
            topic: record.topic.clone(),
            qos: convert_u8_to_quality_of_service(record.qos)?,
            retain: record.retain,
            duplicate: record.duplicate,
            payload,
        })
    }

    /// Scans the store for every record belonging to this connection identity and rebuilds the
    /// replayable packets.  Sent publishes come back marked as duplicates, ordered by their
    /// original submission sequence.
    pub fn restore(&mut self) -> MqttResult<RestoredSession> {
        let mut session = RestoredSession {
            sent: Vec::new(),
            received: Vec::new(),
        };

        let keys = self.store.keys();
        for key in keys {
            let Some(is_sent) = self.key_direction(&key) else {
                continue;
            };

            let record = self.parse_record(&key)?;
            let mut publish = Self::rebuild_publish(&record)?;

            if is_sent {
                // replayed sends are redeliveries
                publish.duplicate = true;

                let sequence = record.sequence.unwrap_or(0);
                self.next_sequence = self.next_sequence.max(sequence + 1);

                session.sent.push(RestoredPublish {
                    publish,
                    pubrec_received: record.pubrec_received,
                    sequence,
                });
            } else {
                session.received.push(publish);
            }
        }

        session.sent.sort_by_key(|restored| restored.sequence);

        info!("session store - restored {} sent and {} received publish records", session.sent.len(), session.received.len());

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_ENDPOINT_PATH;
    use crate::mqtt::QualityOfService;

    fn build_session_state(store: &MemorySessionStore) -> SessionState {
        SessionState::new(Box::new(store.clone()), "broker.example.com", 8080, DEFAULT_ENDPOINT_PATH, "client-a")
    }

    fn build_publish(packet_id: u16, qos: QualityOfService) -> PublishPacket {
        PublishPacket {
            packet_id,
            topic: "telemetry/stream".to_string(),
            qos,
            payload: vec![0xde, 0xad, 0xbe, 0xef],
            ..Default::default()
        }
    }

    #[test]
    fn sent_record_survives_restart() {
        let store = MemorySessionStore::new();

        let mut session = build_session_state(&store);
        let publish = build_publish(5, QualityOfService::AtLeastOnce);
        session.store_sent(&publish, false).unwrap();

        // a fresh session state over the same backing store simulates a client restart
        let mut restarted = build_session_state(&store);
        let restored = restarted.restore().unwrap();

        assert_eq!(1, restored.sent.len());
        assert_eq!(0, restored.received.len());

        let replayed = &restored.sent[0];
        assert!(replayed.publish.duplicate);
        assert!(!replayed.pubrec_received);
        assert_eq!(publish.packet_id, replayed.publish.packet_id);
        assert_eq!(publish.topic, replayed.publish.topic);
        assert_eq!(publish.qos, replayed.publish.qos);
        assert_eq!(publish.payload, replayed.publish.payload);
    }

    #[test]
    fn sent_records_restore_in_sequence_order() {
        let store = MemorySessionStore::new();

        let mut session = build_session_state(&store);
        for packet_id in [9u16, 2, 5] {
            let publish = build_publish(packet_id, QualityOfService::AtLeastOnce);
            session.store_sent(&publish, false).unwrap();
        }

        let mut restarted = build_session_state(&store);
        let restored = restarted.restore().unwrap();

        let replay_order: Vec<u16> = restored.sent.iter().map(|r| r.publish.packet_id).collect();
        assert_eq!(vec![9, 2, 5], replay_order);
    }

    #[test]
    fn sequence_is_stable_across_record_updates() {
        let store = MemorySessionStore::new();

        let mut session = build_session_state(&store);
        session.store_sent(&build_publish(1, QualityOfService::ExactlyOnce), false).unwrap();
        session.store_sent(&build_publish(2, QualityOfService::ExactlyOnce), false).unwrap();

        // recording pubrec receipt must not move packet 1 behind packet 2
        session.store_sent(&build_publish(1, QualityOfService::ExactlyOnce), true).unwrap();

        let mut restarted = build_session_state(&store);
        let restored = restarted.restore().unwrap();

        assert_eq!(2, restored.sent.len());
        assert_eq!(1, restored.sent[0].publish.packet_id);
        assert!(restored.sent[0].pubrec_received);
        assert_eq!(2, restored.sent[1].publish.packet_id);
    }

    #[test]
    fn received_records_round_trip() {
        let store = MemorySessionStore::new();

        let mut session = build_session_state(&store);
        let publish = build_publish(77, QualityOfService::ExactlyOnce);
        session.store_received(&publish).unwrap();

        let mut restarted = build_session_state(&store);
        let restored = restarted.restore().unwrap();

        assert_eq!(0, restored.sent.len());
        assert_eq!(1, restored.received.len());
        assert_eq!(publish, restored.received[0]);

        restarted.remove_received(77);
        let restored = restarted.restore().unwrap();
        assert_eq!(0, restored.received.len());
    }

    #[test]
    fn clear_removes_only_matching_identity() {
        let store = MemorySessionStore::new();

        let mut session = build_session_state(&store);
        session.store_sent(&build_publish(1, QualityOfService::AtLeastOnce), false).unwrap();

        let mut other = SessionState::new(Box::new(store.clone()), "broker.example.com", 8080, DEFAULT_ENDPOINT_PATH, "client-b");
        other.store_sent(&build_publish(4, QualityOfService::AtLeastOnce), false).unwrap();

        session.clear();

        assert_eq!(0, build_session_state(&store).restore().unwrap().sent.len());
        assert_eq!(1, other.restore().unwrap().sent.len());
    }

    #[test]
    fn restore_failure_corrupt_record() {
        let mut store = MemorySessionStore::new();

        {
            let mut session = build_session_state(&store);
            session.store_sent(&build_publish(1, QualityOfService::AtLeastOnce), false).unwrap();
        }

        let key = store.keys().pop().unwrap();
        store.set_item(&key, "not json at all");

        let mut restarted = build_session_state(&store);
        assert!(restarted.restore().is_err());
    }

    #[test]
    fn restore_failure_non_publish_record() {
        let mut store = MemorySessionStore::new();

        {
            let mut session = build_session_state(&store);
            session.store_sent(&build_publish(1, QualityOfService::AtLeastOnce), false).unwrap();
        }

        let key = store.keys().pop().unwrap();
        let altered = store.get_item(&key).unwrap().replace("\"packet_type\":3", "\"packet_type\":8");
        store.set_item(&key, &altered);

        let mut restarted = build_session_state(&store);
        assert!(restarted.restore().is_err());
    }
}
