use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kubestrap_core::config::FactWait;
use kubestrap_core::error::{Result, StrapError};
use kubestrap_core::types::FactScope;

/// Address of a fact: global, or bound to one host's fact bag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactKey {
    pub host: Option<String>,
    pub name: String,
}

impl FactKey {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            host: None,
            name: name.into(),
        }
    }

    pub fn for_host(host: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            name: name.into(),
        }
    }

    /// Key for a fact of the given scope as seen from `host`.
    pub fn scoped(scope: FactScope, host: &str, name: &str) -> Self {
        match scope {
            FactScope::Global => Self::global(name),
            FactScope::Host => Self::for_host(host, name),
        }
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}/{}", host, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Run-scoped store of values passed between steps and hosts.
///
/// Each key is written once unless its name was declared overwritable.
/// Readers either fail fast or wait for the writer, depending on
/// [`FactWait`]; waiting readers are released when the run is cancelled.
pub struct FactStore {
    facts: RwLock<HashMap<FactKey, String>>,
    overwritable: HashSet<String>,
    notify: Notify,
    mode: FactWait,
    cancel: CancellationToken,
}

impl FactStore {
    pub fn new(mode: FactWait, cancel: CancellationToken) -> Self {
        Self {
            facts: RwLock::new(HashMap::new()),
            overwritable: HashSet::new(),
            notify: Notify::new(),
            mode,
            cancel,
        }
    }

    /// Allow repeated writes for facts with these names.
    pub fn with_overwritable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overwritable.extend(names.into_iter().map(Into::into));
        self
    }

    /// Write a fact. Fails with `DuplicateFact` on a second write unless
    /// the name is overwritable.
    pub async fn set(&self, key: FactKey, value: impl Into<String>) -> Result<()> {
        {
            let mut facts = self.facts.write().await;
            if facts.contains_key(&key) && !self.overwritable.contains(&key.name) {
                return Err(StrapError::DuplicateFact(key.to_string()));
            }
            debug!(fact = %key, "Fact set");
            facts.insert(key, value.into());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Read a fact without waiting.
    pub async fn try_get(&self, key: &FactKey) -> Option<String> {
        self.facts.read().await.get(key).cloned()
    }

    /// Read a fact according to the configured wait mode.
    pub async fn get(&self, key: &FactKey) -> Result<String> {
        match self.mode {
            FactWait::FailFast => self
                .try_get(key)
                .await
                .ok_or_else(|| StrapError::MissingFact(key.to_string())),
            FactWait::Block => self.wait_for(key).await,
        }
    }

    async fn wait_for(&self, key: &FactKey) -> Result<String> {
        loop {
            // Register interest before checking so a concurrent `set`
            // between the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_get(key).await {
                return Ok(value);
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = self.cancel.cancelled() => {
                    return Err(StrapError::MissingFact(key.to_string()));
                }
            }
        }
    }

    /// All facts, ordered by key.
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.facts
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.facts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.facts.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn store(mode: FactWait) -> FactStore {
        FactStore::new(mode, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_set_then_get_returns_value() {
        let facts = store(FactWait::FailFast);
        let key = FactKey::global("join_command");
        facts
            .set(key.clone(), "kubeadm join 10.0.0.1:6443 --token abc")
            .await
            .unwrap();
        assert_eq!(
            facts.get(&key).await.unwrap(),
            "kubeadm join 10.0.0.1:6443 --token abc"
        );
    }

    #[tokio::test]
    async fn test_second_set_is_duplicate() {
        let facts = store(FactWait::FailFast);
        let key = FactKey::global("join_command");
        facts.set(key.clone(), "first").await.unwrap();
        let err = facts.set(key.clone(), "second").await.unwrap_err();
        assert!(matches!(err, StrapError::DuplicateFact(k) if k == "join_command"));
        assert_eq!(facts.try_get(&key).await.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_overwritable_allows_rewrite() {
        let facts = store(FactWait::FailFast).with_overwritable(["cluster_status"]);
        let key = FactKey::global("cluster_status");
        facts.set(key.clone(), "initializing").await.unwrap();
        facts.set(key.clone(), "ready").await.unwrap();
        assert_eq!(facts.get(&key).await.unwrap(), "ready");
    }

    #[tokio::test]
    async fn test_fail_fast_missing() {
        let facts = store(FactWait::FailFast);
        let err = facts.get(&FactKey::global("nope")).await.unwrap_err();
        assert!(matches!(err, StrapError::MissingFact(_)));
        assert!(facts.try_get(&FactKey::global("nope")).await.is_none());
    }

    #[tokio::test]
    async fn test_host_scoped_keys_are_independent() {
        let facts = store(FactWait::FailFast);
        facts
            .set(FactKey::for_host("w1", "node_ip"), "10.0.0.11")
            .await
            .unwrap();
        facts
            .set(FactKey::for_host("w2", "node_ip"), "10.0.0.12")
            .await
            .unwrap();
        assert!(facts.try_get(&FactKey::global("node_ip")).await.is_none());

        let snapshot = facts.snapshot().await;
        assert_eq!(snapshot.get("w1/node_ip").map(String::as_str), Some("10.0.0.11"));
        assert_eq!(snapshot.get("w2/node_ip").map(String::as_str), Some("10.0.0.12"));
    }

    #[tokio::test]
    async fn test_blocking_get_wakes_on_set() {
        let facts = Arc::new(store(FactWait::Block));
        let reader = {
            let facts = facts.clone();
            tokio::spawn(async move { facts.get(&FactKey::global("token")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        facts.set(FactKey::global("token"), "abc").await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader finished")
            .unwrap()
            .unwrap();
        assert_eq!(value, "abc");
    }

    #[tokio::test]
    async fn test_blocking_get_released_on_cancel() {
        let cancel = CancellationToken::new();
        let facts = Arc::new(FactStore::new(FactWait::Block, cancel.clone()));
        let reader = {
            let facts = facts.clone();
            tokio::spawn(async move { facts.get(&FactKey::global("never")).await })
        };

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader finished")
            .unwrap();
        assert!(matches!(result, Err(StrapError::MissingFact(_))));
    }
}
