//! A minimal key-value state machine.
//!
//! The full command dispatcher and its on-disk layout for strings, hashes,
//! sets, deques, and leases lives outside this crate; this is a stand-in so
//! the director has something to apply committed entries to and so
//! end-to-end replication scenarios are exercisable in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{Entry, Request};

#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    async fn apply(&self, entry: &Entry) -> anyhow::Result<Vec<u8>>;
    async fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

pub struct KvStateMachine {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self { data: RwLock::new(HashMap::new()) }
    }
}

impl Default for KvStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateMachine for KvStateMachine {
    async fn apply(&self, entry: &Entry) -> anyhow::Result<Vec<u8>> {
        apply_request(&self.data, &entry.request).await
    }

    async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().await.get(key).cloned()
    }
}

async fn apply_request(data: &RwLock<HashMap<Vec<u8>, Vec<u8>>>, request: &Request) -> anyhow::Result<Vec<u8>> {
    let Some(command) = request.first() else {
        return Ok(Vec::new());
    };
    match command.to_ascii_uppercase().as_slice() {
        b"__GENESIS__" | b"__MEMBERSHIP__" | b"NOOP" => Ok(Vec::new()),
        b"SET" => {
            let (Some(key), Some(value)) = (request.get(1), request.get(2)) else {
                return Err(anyhow::anyhow!("SET requires key and value"));
            };
            data.write().await.insert(key.clone(), value.clone());
            Ok(b"OK".to_vec())
        }
        b"DEL" => {
            let Some(key) = request.get(1) else {
                return Err(anyhow::anyhow!("DEL requires a key"));
            };
            let existed = data.write().await.remove(key).is_some();
            Ok(if existed { b"1".to_vec() } else { b"0".to_vec() })
        }
        other => Err(anyhow::anyhow!("unknown command '{}'", String::from_utf8_lossy(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(request: Request) -> Entry {
        Entry { index: 1, term: 1, request }
    }

    #[tokio::test]
    async fn set_then_get_returns_the_stored_value() {
        let sm = KvStateMachine::new();
        sm.apply(&entry(vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()])).await.unwrap();
        assert_eq!(sm.get(b"k").await, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn del_reports_whether_the_key_existed() {
        let sm = KvStateMachine::new();
        let result = sm.apply(&entry(vec![b"DEL".to_vec(), b"missing".to_vec()])).await.unwrap();
        assert_eq!(result, b"0".to_vec());
        sm.apply(&entry(vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()])).await.unwrap();
        let result = sm.apply(&entry(vec![b"DEL".to_vec(), b"k".to_vec()])).await.unwrap();
        assert_eq!(result, b"1".to_vec());
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let sm = KvStateMachine::new();
        assert!(sm.apply(&entry(vec![b"WATEVER".to_vec()])).await.is_err());
    }
}
