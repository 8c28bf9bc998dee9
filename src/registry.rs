//! Versioned site registry and host+path router
//!
//! Descriptors are immutable once installed. Every upload appends to the
//! history, replaces the per-id latest entry, and re-sorts the per-host
//! candidate lists newest-version-first, so a new version starts receiving
//! traffic the moment [`Registry::add_site`] returns. Old versions keep
//! serving only their in-flight requests, which drain through the supervisor.

use crate::process::RunningSite;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// The slot binding a descriptor to its (at most one) live backend.
///
/// Publication and clearing go through this lock; the supervisor's launch
/// mutex serializes who gets to publish, and whoever clears the slot owns
/// teardown of the run it held.
#[derive(Default)]
pub struct RunningSlot(RwLock<Option<Arc<RunningSite>>>);

impl RunningSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<RunningSite>> {
        self.0.read().clone()
    }

    pub(crate) fn publish(&self, run: Arc<RunningSite>) {
        *self.0.write() = Some(run);
    }

    /// Clear the slot iff it still holds `run`. Returns true when this call
    /// cleared it, making the caller the sole owner of the run's teardown.
    pub(crate) fn clear_if(&self, run: &Arc<RunningSite>) -> bool {
        let mut slot = self.0.write();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, run) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

/// Immutable description of one uploaded application version.
pub struct Site {
    /// Application name, shared across versions.
    pub id: String,
    /// Monotonically increasing per-id version, assigned at upload time.
    pub version: u32,
    /// Virtual hosts this site answers for.
    pub hostnames: Vec<String>,
    /// URL path prefixes the site claims.
    pub paths: Vec<String>,
    /// Command template; `${PORT}` is substituted before the whitespace
    /// split. Empty means "serve `data` statically".
    pub command: String,
    /// Extra `KEY=VALUE` environment entries for the child.
    pub env: Vec<String>,
    /// Directory holding the extracted bundle.
    pub data: PathBuf,
    /// MD5 of cert || key when the upload shipped TLS material, else empty.
    pub cert_id: Vec<u8>,
    /// Answer plain-HTTP requests with a 302 to the https:// URL.
    pub https_only: bool,
    /// The live backend, if any.
    pub running: RunningSlot,
}

impl Site {
    pub fn is_static(&self) -> bool {
        self.command.is_empty()
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Append-only history of every descriptor ever added.
    history: Vec<Arc<Site>>,
    /// Highest-version descriptor per id.
    latest: HashMap<String, Arc<Site>>,
    /// Hostname to candidates, sorted by version descending.
    routes: HashMap<String, Vec<Arc<Site>>>,
}

/// Process-wide registry of sites.
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Install a descriptor and make it routable.
    ///
    /// Panics on a duplicate (id, version) pair: versions are allocated by
    /// the upload handler, so a duplicate is a programming error.
    pub fn add_site(&self, site: Arc<Site>) {
        info!(site = %site.id, version = site.version, hosts = ?site.hostnames, "adding site");

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if let Some(existing) = inner.latest.get(&site.id) {
            assert!(
                existing.version != site.version,
                "registering site {} at already known version {}",
                site.id,
                site.version
            );
        }
        inner.latest.insert(site.id.clone(), site.clone());
        inner.history.push(site.clone());

        for host in &site.hostnames {
            let candidates = inner.routes.entry(host.clone()).or_default();
            candidates.push(site.clone());
            candidates.sort_by(|a, b| b.version.cmp(&a.version));
        }

        // The localhost pseudo-host tracks the site only while it is the
        // single application on this server; once a second id shows up the
        // shortcut goes away for good.
        if inner.latest.len() == 1 {
            let candidates = inner.routes.entry("localhost".to_string()).or_default();
            candidates.push(site);
            candidates.sort_by(|a, b| b.version.cmp(&a.version));
        } else {
            inner.routes.insert("localhost".to_string(), Vec::new());
        }
    }

    /// Highest-version descriptor with the given id.
    pub fn find_site(&self, id: &str) -> Option<Arc<Site>> {
        let inner = self.inner.read();
        let mut result: Option<&Arc<Site>> = None;
        for site in &inner.history {
            if site.id == id && result.map_or(true, |r| r.version < site.version) {
                result = Some(site);
            }
        }
        result.cloned()
    }

    /// Route a request: strip the port from `host`, walk the candidates
    /// newest-first and return the first whose path prefixes match, along
    /// with a snapshot of its running slot.
    pub fn match_site(&self, host: &str, path: &str) -> Option<(Arc<Site>, Option<Arc<RunningSite>>)> {
        let host = host.split(':').next().unwrap_or(host);
        let inner = self.inner.read();
        for site in inner.routes.get(host)? {
            if site.paths.iter().any(|prefix| path.starts_with(prefix.as_str())) {
                return Some((site.clone(), site.running.get()));
            }
        }
        None
    }

    /// Latest descriptor of every live id (used for shutdown teardown).
    pub fn latest_sites(&self) -> Vec<Arc<Site>> {
        self.inner.read().latest.values().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(id: &str, version: u32, hosts: &[&str]) -> Arc<Site> {
        site_with_paths(id, version, hosts, &["/"])
    }

    fn site_with_paths(id: &str, version: u32, hosts: &[&str], paths: &[&str]) -> Arc<Site> {
        Arc::new(Site {
            id: id.to_string(),
            version,
            hostnames: hosts.iter().map(|h| h.to_string()).collect(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
            command: "app ${PORT}".to_string(),
            env: Vec::new(),
            data: PathBuf::from("/tmp/none"),
            cert_id: Vec::new(),
            https_only: false,
            running: RunningSlot::new(),
        })
    }

    #[test]
    fn match_returns_latest_version() {
        let registry = Registry::new();
        let v1 = site("blog", 1, &["example.com"]);
        let v2 = site("blog", 2, &["example.com"]);
        registry.add_site(v1);
        registry.add_site(v2.clone());

        let (matched, running) = registry.match_site("example.com", "/post/1").unwrap();
        assert!(Arc::ptr_eq(&matched, &v2));
        assert!(running.is_none());
    }

    #[test]
    fn routes_sorted_descending_by_version() {
        let registry = Registry::new();
        registry.add_site(site("blog", 2, &["example.com"]));
        registry.add_site(site("blog", 1, &["example.com"]));
        registry.add_site(site("blog", 3, &["example.com"]));

        let inner = registry.inner.read();
        let versions: Vec<u32> = inner.routes["example.com"].iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[test]
    #[should_panic(expected = "already known version")]
    fn duplicate_id_version_panics() {
        let registry = Registry::new();
        registry.add_site(site("blog", 1, &["example.com"]));
        registry.add_site(site("blog", 1, &["example.com"]));
    }

    #[test]
    fn find_site_returns_highest_version() {
        let registry = Registry::new();
        registry.add_site(site("blog", 1, &["a.com"]));
        registry.add_site(site("blog", 2, &["a.com"]));
        registry.add_site(site("shop", 7, &["b.com"]));

        assert_eq!(registry.find_site("blog").unwrap().version, 2);
        assert_eq!(registry.find_site("shop").unwrap().version, 7);
        assert!(registry.find_site("missing").is_none());
    }

    #[test]
    fn host_port_is_stripped() {
        let registry = Registry::new();
        registry.add_site(site("blog", 1, &["example.com"]));

        assert!(registry.match_site("example.com:8000", "/").is_some());
        assert!(registry.match_site("other.com:8000", "/").is_none());
    }

    #[test]
    fn path_prefix_filtering() {
        let registry = Registry::new();
        registry.add_site(site_with_paths("api", 1, &["example.com"], &["/api/", "/internal/"]));

        assert!(registry.match_site("example.com", "/api/users").is_some());
        assert!(registry.match_site("example.com", "/internal/metrics").is_some());
        assert!(registry.match_site("example.com", "/index.html").is_none());
    }

    #[test]
    fn first_matching_candidate_wins() {
        let registry = Registry::new();
        registry.add_site(site_with_paths("old", 1, &["example.com"], &["/"]));
        registry.add_site(site_with_paths("api", 5, &["example.com"], &["/api/"]));

        // The api site is newer so it is tried first, but only claims /api/.
        let (matched, _) = registry.match_site("example.com", "/api/x").unwrap();
        assert_eq!(matched.id, "api");
        let (matched, _) = registry.match_site("example.com", "/page").unwrap();
        assert_eq!(matched.id, "old");
    }

    #[test]
    fn localhost_routes_to_single_site() {
        let registry = Registry::new();
        registry.add_site(site("blog", 1, &["example.com"]));

        let (matched, _) = registry.match_site("localhost", "/").unwrap();
        assert_eq!(matched.id, "blog");

        // A version bump keeps the shortcut and routes to the new version.
        registry.add_site(site("blog", 2, &["example.com"]));
        let (matched, _) = registry.match_site("localhost:8000", "/").unwrap();
        assert_eq!(matched.version, 2);
    }

    #[test]
    fn localhost_emptied_once_second_id_exists() {
        let registry = Registry::new();
        registry.add_site(site("blog", 1, &["a.com"]));
        registry.add_site(site("shop", 1, &["b.com"]));

        assert!(registry.match_site("localhost", "/").is_none());

        // Never re-populated, even by further uploads.
        registry.add_site(site("blog", 2, &["a.com"]));
        assert!(registry.match_site("localhost", "/").is_none());
    }

    #[test]
    fn running_slot_clear_if_is_owner_exclusive() {
        let slot = RunningSlot::new();
        let run = RunningSite::adopted("localhost:1".to_string());
        slot.publish(run.clone());

        let other = RunningSite::adopted("localhost:2".to_string());
        assert!(!slot.clear_if(&other));
        assert!(slot.get().is_some());

        assert!(slot.clear_if(&run));
        assert!(slot.get().is_none());
        // Second clear loses: the run is already orphaned.
        assert!(!slot.clear_if(&run));
    }
}
