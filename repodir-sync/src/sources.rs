//! Tracking of sources, bounded auto-discovery and the settled indicator.

use std::{collections::BTreeMap, str::FromStr};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    config::{SettleConfig, SyncConfig},
    error::DiscoveryBoundExceeded,
    incoming::Origin,
    record::RepositoryRecord,
};

/// The normalized URI of a source.
///
/// Only `ws`, `wss`, `http` and `https` URIs with a host are accepted. The host is lower-cased
/// and trailing slashes are dropped, so `wss://Relay.example/` and `wss://relay.example` are the
/// same source.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(try_from = "String", into = "String")]
pub struct SourceUri(String);

impl SourceUri {
    /// The normalized URI.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SourceUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourceUri({})", self.0)
    }
}

/// Error when a string is not a usable source URI.
#[derive(Debug, thiserror::Error)]
pub enum InvalidSourceUri {
    /// Not a URI at all.
    #[error(transparent)]
    Parse(#[from] url::ParseError),
    /// A scheme no source speaks.
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    /// No host to connect to.
    #[error("missing host")]
    MissingHost,
}

impl FromStr for SourceUri {
    type Err = InvalidSourceUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = url::Url::parse(s.trim())?;
        match url.scheme() {
            "ws" | "wss" | "http" | "https" => {}
            other => return Err(InvalidSourceUri::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(InvalidSourceUri::MissingHost);
        }
        let mut uri = String::from(url);
        while uri.ends_with('/') {
            uri.pop();
        }
        Ok(Self(uri))
    }
}

impl TryFrom<String> for SourceUri {
    type Error = InvalidSourceUri;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceUri> for String {
    fn from(value: SourceUri) -> Self {
        value.0
    }
}

/// What the engine knows about one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// The source.
    pub uri: SourceUri,
    /// The source whose record advertised this one. `None` for configured sources.
    pub discovered_from: Option<SourceUri>,
    /// Whether the source counts towards the priority settle threshold.
    pub priority: bool,
    /// Whether the source finished its initial batch, or timed out doing so.
    pub quiescent: bool,
    /// Whether the subscription failed. A failed source never becomes quiescent.
    pub failed: bool,
}

impl SourceDescriptor {
    fn new(uri: SourceUri, discovered_from: Option<SourceUri>, priority: bool) -> Self {
        Self {
            uri,
            discovered_from,
            priority,
            quiescent: false,
            failed: false,
        }
    }
}

/// The set of sources and the settled indicator derived from them.
///
/// Sources are only ever added. The set never grows beyond `max_sources`, and no source is
/// more than `max_discovery_hops` discovery steps away from a configured one.
#[derive(Debug)]
pub struct SourceManager {
    sources: BTreeMap<SourceUri, SourceDescriptor>,
    max_hops: usize,
    max_sources: usize,
    settle: SettleConfig,
    stored: u64,
    started: Instant,
    settled: bool,
}

impl SourceManager {
    /// Create an empty manager. The settle timeout runs from `started`.
    pub fn new(config: &SyncConfig, started: Instant) -> Self {
        Self {
            sources: BTreeMap::new(),
            max_hops: config.max_discovery_hops,
            max_sources: config.max_sources,
            settle: config.settle.clone(),
            stored: 0,
            started,
            settled: false,
        }
    }

    /// Add a configured source. Returns `false` if it is known already.
    pub fn add_static(
        &mut self,
        uri: SourceUri,
        priority: bool,
    ) -> Result<bool, DiscoveryBoundExceeded> {
        if let Some(existing) = self.sources.get_mut(&uri) {
            existing.priority |= priority;
            return Ok(false);
        }
        self.check_capacity(&uri)?;
        self.sources
            .insert(uri.clone(), SourceDescriptor::new(uri, None, priority));
        Ok(true)
    }

    /// Add a source advertised by a record that arrived from `from`.
    ///
    /// Returns `false` if the source is known already. `from` must be tracked.
    pub fn add_discovered(
        &mut self,
        uri: SourceUri,
        from: &SourceUri,
    ) -> Result<bool, DiscoveryBoundExceeded> {
        if self.sources.contains_key(&uri) {
            return Ok(false);
        }
        if !self.sources.contains_key(from) {
            return Err(DiscoveryBoundExceeded::UntrackedParent {
                uri,
                from: from.clone(),
            });
        }
        let hops = self.chain_len(from) + 1;
        if hops > self.max_hops {
            return Err(DiscoveryBoundExceeded::Hops {
                uri,
                hops,
                max: self.max_hops,
            });
        }
        self.check_capacity(&uri)?;
        let descriptor = SourceDescriptor::new(uri.clone(), Some(from.clone()), false);
        self.sources.insert(uri, descriptor);
        Ok(true)
    }

    fn check_capacity(&self, uri: &SourceUri) -> Result<(), DiscoveryBoundExceeded> {
        if self.sources.len() >= self.max_sources {
            return Err(DiscoveryBoundExceeded::Capacity {
                uri: uri.clone(),
                max: self.max_sources,
            });
        }
        Ok(())
    }

    /// Number of discovery steps between `uri` and a configured source.
    ///
    /// Unknown and configured sources are zero steps away.
    pub fn chain_len(&self, uri: &SourceUri) -> usize {
        let mut hops = 0;
        let mut current = uri;
        while let Some(from) = self
            .sources
            .get(current)
            .and_then(|s| s.discovered_from.as_ref())
        {
            hops += 1;
            current = from;
            // sources are only added with a known parent, this cannot loop
            if hops > self.sources.len() {
                break;
            }
        }
        hops
    }

    /// Note a stored record and discover the sources it advertises.
    ///
    /// Only records that arrived from a tracked source can extend the source set. Returns the
    /// sources that were added; refused and unparseable ones are dropped silently.
    pub fn on_record_stored(
        &mut self,
        origin: &Origin,
        record: &RepositoryRecord,
    ) -> Vec<SourceUri> {
        self.stored += 1;
        let Some(from) = origin.source() else {
            return Vec::new();
        };
        if !self.sources.contains_key(from) {
            if !record.sources.is_empty() {
                debug!(%from, "record from untracked source, not discovering");
            }
            return Vec::new();
        }
        let mut added = Vec::new();
        for advertised in &record.sources {
            let uri = match SourceUri::from_str(advertised) {
                Ok(uri) => uri,
                Err(err) => {
                    debug!(uri = %advertised, %err, "ignoring advertised source");
                    continue;
                }
            };
            match self.add_discovered(uri.clone(), from) {
                Ok(true) => added.push(uri),
                Ok(false) => {}
                Err(err) => debug!(%err, "discovery refused"),
            }
        }
        added
    }

    /// Mark `uri` quiescent. Returns whether this changed anything.
    pub fn on_quiescent(&mut self, uri: &SourceUri) -> bool {
        match self.sources.get_mut(uri) {
            Some(s) if !s.quiescent && !s.failed => {
                s.quiescent = true;
                true
            }
            _ => false,
        }
    }

    /// Mark `uri` failed.
    pub fn on_failed(&mut self, uri: &SourceUri) {
        if let Some(s) = self.sources.get_mut(uri) {
            s.failed = true;
            s.quiescent = false;
        }
    }

    /// When the settle timeout expires.
    pub fn settle_deadline(&self) -> Instant {
        self.started + self.settle.max_wait
    }

    /// Recompute the settled indicator. Returns `true` if it just became settled.
    ///
    /// Once settled the indicator stays settled.
    pub fn check_settled(&mut self, now: Instant) -> bool {
        if self.settled {
            return false;
        }
        let quiescent = self.sources.values().filter(|s| s.quiescent);
        let priority = quiescent.clone().filter(|s| s.priority).count();
        let all = quiescent.count();
        let by_priority =
            self.settle.min_priority_sources > 0 && priority >= self.settle.min_priority_sources;
        let by_sources = all >= self.settle.min_sources && self.stored > 0;
        let by_timeout = now >= self.settle_deadline();
        if by_priority || by_sources || by_timeout {
            debug!(
                by_priority,
                by_sources, by_timeout, quiescent = all, stored = self.stored, "settled"
            );
            self.settled = true;
            return true;
        }
        false
    }

    /// Whether the indicator is settled.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Number of records stored since start.
    pub fn stored(&self) -> u64 {
        self.stored
    }

    /// Get a source.
    pub fn get(&self, uri: &SourceUri) -> Option<&SourceDescriptor> {
        self.sources.get(uri)
    }

    /// All sources, in URI order.
    pub fn iter(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.values()
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether there are no sources.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::record::tests::{owner, record};

    fn uri(s: &str) -> SourceUri {
        s.parse().unwrap()
    }

    fn config(max_hops: usize, max_sources: usize) -> SyncConfig {
        SyncConfig {
            max_discovery_hops: max_hops,
            max_sources,
            ..Default::default()
        }
    }

    fn advertising(sources: &[&str]) -> RepositoryRecord {
        let mut r = record(owner(1), "demo", "e1", 1);
        r.sources = sources.iter().map(|s| s.to_string()).collect();
        r
    }

    #[test]
    fn uri_normalization() {
        assert_eq!(uri("wss://Relay.Example/").as_str(), "wss://relay.example");
        assert_eq!(uri(" https://a.example/x/ ").as_str(), "https://a.example/x");
        assert!("ftp://a.example".parse::<SourceUri>().is_err());
        assert!("wss://".parse::<SourceUri>().is_err());
        assert!("not a uri".parse::<SourceUri>().is_err());
        let json = serde_json::to_string(&uri("wss://r.example")).unwrap();
        assert_eq!(json, "\"wss://r.example\"");
        assert!(serde_json::from_str::<SourceUri>("\"mailto:x@y\"").is_err());
    }

    #[test]
    fn discovery_follows_chain_bound() {
        let mut m = SourceManager::new(&config(2, 32), Instant::now());
        let root = uri("wss://root.example");
        m.add_static(root.clone(), false).unwrap();

        let added = m.on_record_stored(
            &Origin::Remote(root.clone()),
            &advertising(&["wss://one.example", "garbage", "wss://root.example/"]),
        );
        assert_eq!(added, vec![uri("wss://one.example")]);
        assert_eq!(m.chain_len(&uri("wss://one.example")), 1);

        let added = m.on_record_stored(
            &Origin::Remote(uri("wss://one.example")),
            &advertising(&["wss://two.example"]),
        );
        assert_eq!(added, vec![uri("wss://two.example")]);

        // three hops is over the limit
        let added = m.on_record_stored(
            &Origin::Remote(uri("wss://two.example")),
            &advertising(&["wss://three.example"]),
        );
        assert!(added.is_empty());
        assert!(matches!(
            m.add_discovered(uri("wss://three.example"), &uri("wss://two.example")),
            Err(DiscoveryBoundExceeded::Hops { hops: 3, max: 2, .. })
        ));
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn discovery_respects_capacity() {
        let mut m = SourceManager::new(&config(3, 2), Instant::now());
        let root = uri("wss://root.example");
        m.add_static(root.clone(), false).unwrap();
        let added = m.on_record_stored(
            &Origin::Remote(root),
            &advertising(&["wss://a.example", "wss://b.example"]),
        );
        assert_eq!(added.len(), 1);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn local_records_do_not_discover() {
        let mut m = SourceManager::new(&config(3, 32), Instant::now());
        let added = m.on_record_stored(&Origin::Local, &advertising(&["wss://a.example"]));
        assert!(added.is_empty());
        assert_eq!(m.stored(), 1);
    }

    #[test]
    fn untracked_origins_do_not_discover() {
        let mut m = SourceManager::new(&config(1, 32), Instant::now());
        m.add_static(uri("wss://root.example"), false).unwrap();
        let unknown = uri("wss://unknown.example");
        let added = m.on_record_stored(
            &Origin::Remote(unknown.clone()),
            &advertising(&["wss://new.example"]),
        );
        assert!(added.is_empty());
        assert!(m.get(&uri("wss://new.example")).is_none());
        assert_eq!(m.stored(), 1);
        assert!(matches!(
            m.add_discovered(uri("wss://new.example"), &unknown),
            Err(DiscoveryBoundExceeded::UntrackedParent { .. })
        ));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn settles_on_ordinary_sources_with_a_record() {
        let now = Instant::now();
        let mut m = SourceManager::new(&SyncConfig::default(), now);
        let up = uri("wss://up.example");
        let down = uri("wss://down.example");
        m.add_static(up.clone(), false).unwrap();
        m.add_static(down.clone(), false).unwrap();

        m.on_failed(&down);
        assert!(!m.on_quiescent(&down));
        assert!(m.on_quiescent(&up));
        // no record stored yet
        assert!(!m.check_settled(now));

        m.on_record_stored(&Origin::Remote(up), &advertising(&[]));
        assert!(m.check_settled(now));
        assert!(m.is_settled());
        assert!(!m.check_settled(now));
    }

    #[test]
    fn settles_on_priority_sources() {
        let now = Instant::now();
        let mut m = SourceManager::new(&SyncConfig::default(), now);
        let p = uri("wss://priority.example");
        m.add_static(p.clone(), true).unwrap();
        m.on_quiescent(&p);
        assert!(m.check_settled(now));
    }

    #[test]
    fn settles_on_timeout() {
        let now = Instant::now();
        let config = SyncConfig::default();
        let mut m = SourceManager::new(&config, now);
        m.add_static(uri("wss://silent.example"), false).unwrap();
        assert!(!m.check_settled(now + Duration::from_millis(1)));
        assert!(m.check_settled(now + config.settle.max_wait));
    }

    proptest! {
        #[test]
        fn discovery_bound_holds(
            max_hops in 0usize..4,
            max_sources in 1usize..8,
            edges in prop::collection::vec((0usize..10, 0usize..10), 0..40),
        ) {
            let mut m = SourceManager::new(&config(max_hops, max_sources), Instant::now());
            let name = |i: usize| uri(&format!("wss://s{i}.example"));
            m.add_static(name(0), false).unwrap();
            for (from, to) in edges {
                let from = name(from);
                if m.get(&from).is_none() {
                    continue;
                }
                let _ = m.add_discovered(name(to), &from);
            }
            prop_assert!(m.len() <= max_sources);
            for s in m.iter() {
                prop_assert!(m.chain_len(&s.uri) <= max_hops);
            }
        }
    }
}
