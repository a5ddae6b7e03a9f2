//! Endpoint registry: the immutable snapshot mapping routes and MCP names
//! to endpoint descriptors. Reloads build a new snapshot and swap it
//! atomically; in-flight requests keep the snapshot they captured.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::model::EndpointConfig;

/// A registered endpoint plus its origin file (for reloads and the
/// configuration API).
#[derive(Debug, Clone)]
pub struct EndpointEntry {
    pub endpoint: Arc<EndpointConfig>,
    /// Descriptor file path, relative to the template root.
    pub source_file: Option<String>,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn compile_pattern(path: &str) -> Vec<Segment> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

impl EndpointEntry {
    pub fn new(endpoint: EndpointConfig, source_file: Option<String>) -> Self {
        let segments = endpoint
            .url_path
            .as_deref()
            .map(compile_pattern)
            .unwrap_or_default();
        Self {
            endpoint: Arc::new(endpoint),
            source_file,
            segments,
        }
    }

    /// Match a request path against this entry's pattern, returning the
    /// extracted path parameters. The score is the number of literal
    /// segments, so more specific patterns win ties.
    fn match_path(&self, path: &str) -> Option<(usize, BTreeMap<String, String>)> {
        self.endpoint.url_path.as_deref()?;
        let supplied: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if supplied.len() != self.segments.len() {
            return None;
        }
        let mut params = BTreeMap::new();
        let mut score = 0;
        for (segment, value) in self.segments.iter().zip(&supplied) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != value {
                        return None;
                    }
                    score += 1;
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), (*value).to_string());
                }
            }
        }
        Some((score, params))
    }
}

/// One immutable registry snapshot.
#[derive(Debug, Default, Clone)]
pub struct EndpointRegistry {
    entries: Vec<EndpointEntry>,
    tools: HashMap<String, usize>,
    resources: HashMap<String, usize>,
    prompts: HashMap<String, usize>,
}

impl EndpointRegistry {
    pub fn new(entries: Vec<EndpointEntry>) -> Self {
        let mut registry = Self {
            entries,
            ..Default::default()
        };
        for (idx, entry) in registry.entries.iter().enumerate() {
            if let Some(view) = &entry.endpoint.mcp_tool {
                registry.tools.insert(view.name.clone(), idx);
            }
            if let Some(view) = &entry.endpoint.mcp_resource {
                registry.resources.insert(view.name.clone(), idx);
            }
            if let Some(view) = &entry.endpoint.mcp_prompt {
                registry.prompts.insert(view.name.clone(), idx);
            }
        }
        registry
    }

    pub fn entries(&self) -> &[EndpointEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a REST route. Among matching patterns the one with the most
    /// literal segments wins.
    pub fn match_route(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(Arc<EndpointConfig>, BTreeMap<String, String>)> {
        let method = method.to_ascii_uppercase();
        self.entries
            .iter()
            .filter(|e| e.endpoint.method.to_ascii_uppercase() == method)
            .filter_map(|e| {
                e.match_path(path)
                    .map(|(score, params)| (score, e.endpoint.clone(), params))
            })
            .max_by_key(|(score, _, _)| *score)
            .map(|(_, endpoint, params)| (endpoint, params))
    }

    /// Look up an endpoint by its exact `url-path`.
    pub fn by_path(&self, path: &str) -> Option<&EndpointEntry> {
        self.entries
            .iter()
            .find(|e| e.endpoint.url_path.as_deref() == Some(path))
    }

    pub fn tool(&self, name: &str) -> Option<&EndpointEntry> {
        self.tools.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn resource(&self, name: &str) -> Option<&EndpointEntry> {
        self.resources.get(name).map(|&idx| &self.entries[idx])
    }

    pub fn prompt(&self, name: &str) -> Option<&EndpointEntry> {
        self.prompts.get(name).map(|&idx| &self.entries[idx])
    }

    /// Cache-enabled endpoints, for the scheduler and status projection.
    pub fn cached_entries(&self) -> impl Iterator<Item = &EndpointEntry> {
        self.entries.iter().filter(|e| {
            e.endpoint
                .cache
                .as_ref()
                .is_some_and(|cache| cache.enabled)
        })
    }
}

/// Shared handle over the current registry snapshot.
#[derive(Clone, Default)]
pub struct RegistryHandle {
    inner: Arc<RwLock<Arc<EndpointRegistry>>>,
}

impl RegistryHandle {
    pub fn new(registry: EndpointRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    /// The current snapshot. Callers hold the `Arc` for the duration of a
    /// request so a concurrent swap never changes what they see.
    pub fn snapshot(&self) -> Arc<EndpointRegistry> {
        self.inner.read().expect("registry lock poisoned").clone()
    }

    /// Replace the whole registry.
    pub fn swap(&self, registry: EndpointRegistry) {
        *self.inner.write().expect("registry lock poisoned") = Arc::new(registry);
    }

    /// Replace or add a single endpoint, building a new snapshot. The old
    /// snapshot stays live for requests already in flight.
    pub fn upsert(&self, entry: EndpointEntry) {
        let current = self.snapshot();
        let mut entries: Vec<EndpointEntry> = current
            .entries
            .iter()
            .filter(|e| e.endpoint.url_path != entry.endpoint.url_path)
            .cloned()
            .collect();
        entries.push(entry);
        self.swap(EndpointRegistry::new(entries));
    }

    /// Remove the endpoint with the given `url-path`. Returns whether an
    /// entry was removed.
    pub fn remove(&self, path: &str) -> bool {
        let current = self.snapshot();
        let entries: Vec<EndpointEntry> = current
            .entries
            .iter()
            .filter(|e| e.endpoint.url_path.as_deref() != Some(path))
            .cloned()
            .collect();
        let removed = entries.len() != current.entries.len();
        if removed {
            self.swap(EndpointRegistry::new(entries));
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(method: &str, path: &str) -> EndpointEntry {
        EndpointEntry::new(
            EndpointConfig {
                url_path: Some(path.to_string()),
                method: method.to_string(),
                ..Default::default()
            },
            None,
        )
    }

    #[test]
    fn exact_match_and_trailing_slash_tolerance() {
        let registry = EndpointRegistry::new(vec![entry("GET", "/customers/")]);
        assert!(registry.match_route("GET", "/customers/").is_some());
        assert!(registry.match_route("GET", "/customers").is_some());
        assert!(registry.match_route("POST", "/customers/").is_none());
        assert!(registry.match_route("GET", "/orders/").is_none());
    }

    #[test]
    fn path_params_extracted() {
        let registry = EndpointRegistry::new(vec![entry("GET", "/products/:id")]);
        let (_, params) = registry.match_route("GET", "/products/42").unwrap();
        assert_eq!(params["id"], "42");
    }

    #[test]
    fn literal_segments_beat_params() {
        let registry = EndpointRegistry::new(vec![
            entry("GET", "/products/:id"),
            entry("GET", "/products/featured"),
        ]);
        let (endpoint, params) = registry.match_route("GET", "/products/featured").unwrap();
        assert_eq!(endpoint.url_path.as_deref(), Some("/products/featured"));
        assert!(params.is_empty());

        let (endpoint, params) = registry.match_route("GET", "/products/7").unwrap();
        assert_eq!(endpoint.url_path.as_deref(), Some("/products/:id"));
        assert_eq!(params["id"], "7");
    }

    #[test]
    fn segment_count_must_match() {
        let registry = EndpointRegistry::new(vec![entry("GET", "/a/:b")]);
        assert!(registry.match_route("GET", "/a").is_none());
        assert!(registry.match_route("GET", "/a/b/c").is_none());
    }

    #[test]
    fn mcp_lookups() {
        let mut endpoint = EndpointConfig {
            url_path: Some("/customers/".into()),
            ..Default::default()
        };
        endpoint.mcp_tool = Some(crate::model::McpView {
            name: "list_customers".into(),
            description: "List customers".into(),
            template: None,
            arguments: None,
        });
        let registry = EndpointRegistry::new(vec![EndpointEntry::new(endpoint, None)]);
        assert!(registry.tool("list_customers").is_some());
        assert!(registry.tool("nope").is_none());
        assert!(registry.resource("list_customers").is_none());
    }

    #[test]
    fn handle_swap_is_atomic_for_held_snapshots() {
        let handle = RegistryHandle::new(EndpointRegistry::new(vec![entry("GET", "/a/")]));
        let before = handle.snapshot();
        handle.upsert(entry("GET", "/b/"));
        assert_eq!(before.len(), 1);
        assert_eq!(handle.snapshot().len(), 2);
    }

    #[test]
    fn upsert_replaces_same_path() {
        let handle = RegistryHandle::new(EndpointRegistry::new(vec![entry("GET", "/a/")]));
        handle.upsert(entry("POST", "/a/"));
        let snap = handle.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(snap.match_route("POST", "/a/").is_some());
    }

    #[test]
    fn remove_endpoint() {
        let handle = RegistryHandle::new(EndpointRegistry::new(vec![
            entry("GET", "/a/"),
            entry("GET", "/b/"),
        ]));
        assert!(handle.remove("/a/"));
        assert!(!handle.remove("/a/"));
        assert_eq!(handle.snapshot().len(), 1);
    }
}
