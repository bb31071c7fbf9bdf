use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Deserialize;

use crate::config::{HANDLE_CACHE_CAPACITY, HTTP_TIMEOUT, PLC_DIRECTORY_URL};
use crate::types::SkywatchError;

#[derive(Debug, Clone, Deserialize)]
pub struct DidDocument {
    pub id: String,
    #[serde(rename = "alsoKnownAs")]
    pub also_known_as: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct AuditLogEntry {
    #[serde(rename = "alsoKnownAs")]
    also_known_as: Option<Vec<String>>,
}

/// Extract the handle from an alsoKnownAs alias list: the suffix of the
/// first entry starting with "at://".
pub fn handle_from_aliases(aliases: &[String]) -> Option<String> {
    aliases
        .iter()
        .find(|alias| alias.starts_with("at://"))
        .map(|alias| alias[5..].to_string())
}

/// Bounded DID → handle cache with insertion-order eviction. Negative
/// results are cached too, to suppress repeated lookups of dead DIDs.
struct HandleCache {
    capacity: usize,
    entries: HashMap<String, Option<String>>,
    order: VecDeque<String>,
}

impl HandleCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, did: &str) -> Option<Option<String>> {
        self.entries.get(did).cloned()
    }

    fn insert(&mut self, did: String, handle: Option<String>) {
        if self.entries.insert(did.clone(), handle).is_none() {
            self.order.push_back(did);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

/// Resolves DIDs to their current (and previous) handles via the plc
/// directory or a did:web well-known document. Best-effort: failures
/// resolve to None and callers must not depend on cache contents.
pub struct HandleResolver {
    plc_url: String,
    client: reqwest::Client,
    cache: Mutex<HandleCache>,
}

impl HandleResolver {
    pub fn new(plc_url: String) -> Result<Self, SkywatchError> {
        let client = reqwest::Client::builder().timeout(*HTTP_TIMEOUT).build()?;
        Ok(Self {
            plc_url: plc_url.trim_end_matches('/').to_string(),
            client,
            cache: Mutex::new(HandleCache::new(HANDLE_CACHE_CAPACITY)),
        })
    }

    pub fn from_env() -> Result<Self, SkywatchError> {
        Self::new(PLC_DIRECTORY_URL.clone())
    }

    fn doc_url(&self, did: &str) -> Option<String> {
        if let Some(host) = did.strip_prefix("did:web:") {
            Some(format!("https://{host}/.well-known/did.json"))
        } else if did.starts_with("did:plc:") {
            Some(format!("{}/{}", self.plc_url, did))
        } else {
            None
        }
    }

    /// Current handle for a DID, or None when unknown.
    pub async fn resolve(&self, did: &str) -> Option<String> {
        if let Some(cached) = self.cache.lock().unwrap().get(did) {
            return cached;
        }

        let resolved = match self.fetch_handle(did).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::debug!("handle resolution failed for {did}: {e}");
                None
            }
        };

        self.cache
            .lock()
            .unwrap()
            .insert(did.to_string(), resolved.clone());
        resolved
    }

    async fn fetch_handle(&self, did: &str) -> Result<Option<String>, SkywatchError> {
        let Some(url) = self.doc_url(did) else {
            return Ok(None);
        };

        let response = self
            .client
            .get(&url)
            .header("Connection", "Keep-Alive")
            .header("Keep-Alive", "timeout=5, max=1000")
            .send()
            .await?;

        match response.error_for_status_ref() {
            Ok(_) => {
                let doc = response.json::<DidDocument>().await?;
                Ok(doc
                    .also_known_as
                    .as_deref()
                    .and_then(handle_from_aliases))
            }
            // Positively not found, versus due to e.g. network error
            Err(error) if error.status() == Some(reqwest::StatusCode::NOT_FOUND) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// The handle a DID held before its most recent identity operation,
    /// read from the plc audit log (ordered newest first).
    pub async fn resolve_previous(&self, did: &str) -> Option<String> {
        if !did.starts_with("did:plc:") {
            return None;
        }
        match self.fetch_previous(did).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::debug!("audit log lookup failed for {did}: {e}");
                None
            }
        }
    }

    async fn fetch_previous(&self, did: &str) -> Result<Option<String>, SkywatchError> {
        let url = format!("{}/{}/log", self.plc_url, did);
        let response = self.client.get(&url).send().await?;

        match response.error_for_status_ref() {
            Ok(_) => {
                let log = response.json::<Vec<AuditLogEntry>>().await?;
                Ok(log
                    .get(1)
                    .and_then(|entry| entry.also_known_as.as_deref())
                    .and_then(handle_from_aliases))
            }
            Err(error) if error.status() == Some(reqwest::StatusCode::NOT_FOUND) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn resolve_many(&self, dids: &[String]) -> Vec<(String, Option<String>)> {
        let mut resolved = Vec::with_capacity(dids.len());
        for did in dids {
            let handle = self.resolve(did).await;
            resolved.push((did.clone(), handle));
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_from_aliases() {
        assert_eq!(handle_from_aliases(&[]), None);

        assert_eq!(
            handle_from_aliases(&["at://alice.bsky.social".to_string()]),
            Some("alice.bsky.social".to_string())
        );

        // first at:// entry wins, non-at entries are skipped
        assert_eq!(
            handle_from_aliases(&[
                "https://example.com".to_string(),
                "at://bob.test".to_string(),
                "at://other.test".to_string(),
            ]),
            Some("bob.test".to_string())
        );
    }

    #[test]
    fn test_did_document_parsing() {
        let data = "{\"@context\":[\"https://www.w3.org/ns/did/v1\"],\"id\":\"did:plc:test\",\"alsoKnownAs\":[\"at://alice.bsky.social\"],\"verificationMethod\":[]}";
        let doc: DidDocument = serde_json::from_str(data).unwrap();
        assert_eq!(doc.id, "did:plc:test");
        assert_eq!(
            doc.also_known_as.as_deref().and_then(handle_from_aliases),
            Some("alice.bsky.social".to_string())
        );
    }

    #[test]
    fn test_doc_url_mapping() {
        let resolver = HandleResolver::new("https://plc.directory".to_string()).unwrap();

        assert_eq!(
            resolver.doc_url("did:plc:abc123"),
            Some("https://plc.directory/did:plc:abc123".to_string())
        );
        assert_eq!(
            resolver.doc_url("did:web:example.com"),
            Some("https://example.com/.well-known/did.json".to_string())
        );
        assert_eq!(resolver.doc_url("did:key:z6Mk"), None);
    }

    #[test]
    fn test_cache_insertion_order_eviction() {
        let mut cache = HandleCache::new(2);
        cache.insert("did:plc:a".to_string(), Some("a.test".to_string()));
        cache.insert("did:plc:b".to_string(), Some("b.test".to_string()));
        cache.insert("did:plc:c".to_string(), Some("c.test".to_string()));

        assert_eq!(cache.get("did:plc:a"), None);
        assert_eq!(cache.get("did:plc:b"), Some(Some("b.test".to_string())));
        assert_eq!(cache.get("did:plc:c"), Some(Some("c.test".to_string())));
    }

    #[test]
    fn test_cache_negative_results() {
        let mut cache = HandleCache::new(2);
        cache.insert("did:plc:gone".to_string(), None);
        assert_eq!(cache.get("did:plc:gone"), Some(None));
        assert_eq!(cache.get("did:plc:unseen"), None);
    }

    #[test]
    fn test_cache_update_does_not_grow_order() {
        let mut cache = HandleCache::new(2);
        cache.insert("did:plc:a".to_string(), None);
        cache.insert("did:plc:a".to_string(), Some("a.test".to_string()));
        cache.insert("did:plc:b".to_string(), Some("b.test".to_string()));

        assert_eq!(cache.get("did:plc:a"), Some(Some("a.test".to_string())));
        assert_eq!(cache.get("did:plc:b"), Some(Some("b.test".to_string())));
    }
}
