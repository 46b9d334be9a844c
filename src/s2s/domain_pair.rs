//! Domain-pair bookkeeping (component A).
//!
//! A `DomainPair` records that a local domain is authorized to exchange
//! stanzas with a remote domain over a particular session. A session may
//! authorize several pairs at once when sub/superdomains piggyback onto an
//! existing dialback-authenticated link.

use std::collections::HashSet;

/// An ordered `(local, remote)` domain pair, with case-insensitive equality.
#[derive(Debug, Clone)]
pub struct DomainPair {
    local: String,
    remote: String,
}

impl DomainPair {
    /// Construct a new domain pair. Domains are stored as given; comparisons
    /// are case-insensitive.
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// The local domain.
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The remote domain.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn key(&self) -> (String, String) {
        (self.local.to_lowercase(), self.remote.to_lowercase())
    }
}

impl PartialEq for DomainPair {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DomainPair {}

impl std::hash::Hash for DomainPair {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// A trait through which the domain-pair set notifies the routing table
/// when a pair becomes authorized. The routing table itself is out of
/// scope here; this crate only needs to signal it.
pub trait RouteRegistrar: Send + Sync {
    /// Register that `pair` should route to the session identified by
    /// `session_key`.
    fn register_route(&self, pair: &DomainPair, session_key: &str);
}

/// The set of domain pairs authorized on one session.
pub struct DomainPairSet {
    pairs: HashSet<DomainPair>,
    session_key: String,
    registrar: Option<std::sync::Arc<dyn RouteRegistrar>>,
}

impl DomainPairSet {
    /// Create an empty set for the session identified by `session_key`.
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            pairs: HashSet::new(),
            session_key: session_key.into(),
            registrar: None,
        }
    }

    /// Attach a route registrar that gets notified on every `add`.
    pub fn with_registrar(mut self, registrar: std::sync::Arc<dyn RouteRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Insert `pair`, registering it with the routing table. Idempotent.
    pub fn add(&mut self, pair: DomainPair) {
        if let Some(registrar) = &self.registrar {
            registrar.register_route(&pair, &self.session_key);
        }
        self.pairs.insert(pair);
    }

    /// O(1) membership test.
    pub fn contains(&self, pair: &DomainPair) -> bool {
        self.pairs.contains(pair)
    }

    /// Snapshot enumeration of all authorized pairs.
    pub fn all(&self) -> Vec<&DomainPair> {
        self.pairs.iter().collect()
    }

    /// Whether the set has no authorized pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The session key this set's pairs are (or will be) indexed under.
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Number of authorized pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}
