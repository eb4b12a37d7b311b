//! Two-tier reads with an explicit cache.
//!
//! A [`DualPathReader`] walks an ordered list of [`FetchStrategy`]s and returns
//! the first answer. The usual order is the unauthenticated raw mirror (no
//! quota, public resources only, may lag) followed by the authenticated
//! metadata read (always works, rate limited). Whatever wins is stored in the
//! reader's [`ReadCache`] so the next conditional fetch can send a validator.

use tracing::{debug, instrument, warn};

use crate::core::types::{Location, Snapshot, Version};
use crate::io::resource::{ResourceError, VersionedResource};

/// Last body seen by a reader, keyed by its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Validator to send on the next conditional fetch (ETag or blob sha).
    pub validator: Option<String>,
    pub version: Version,
    pub body: String,
}

/// Process-lifetime cache owned by a [`DualPathReader`].
#[derive(Debug, Default)]
pub struct ReadCache {
    entry: Option<CacheEntry>,
}

impl ReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&CacheEntry> {
        self.entry.as_ref()
    }

    pub fn store(&mut self, entry: CacheEntry) {
        self.entry = Some(entry);
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

/// Result of one strategy attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The cached validator is still current.
    NotModified,
    Fresh(CacheEntry),
}

/// One way of resolving the current content of a resource.
pub trait FetchStrategy {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    fn fetch(
        &self,
        location: &Location,
        cached: Option<&CacheEntry>,
    ) -> Result<FetchOutcome, ResourceError>;
}

/// Strategy backed by [`VersionedResource::read`]; the version doubles as validator.
pub struct Authoritative<R> {
    resource: R,
}

impl<R: VersionedResource> Authoritative<R> {
    pub fn new(resource: R) -> Self {
        Self { resource }
    }
}

impl<R: VersionedResource> FetchStrategy for Authoritative<R> {
    fn name(&self) -> &'static str {
        "metadata"
    }

    fn fetch(
        &self,
        location: &Location,
        _cached: Option<&CacheEntry>,
    ) -> Result<FetchOutcome, ResourceError> {
        let snapshot = self.resource.read(location)?;
        Ok(FetchOutcome::Fresh(CacheEntry {
            validator: Some(snapshot.version.as_str().to_string()),
            version: snapshot.version,
            body: snapshot.body,
        }))
    }
}

/// Answer from [`DualPathReader::fetch_current`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub snapshot: Snapshot,
    pub from_cache: bool,
    /// Name of the strategy that answered.
    pub source: &'static str,
}

pub struct DualPathReader {
    strategies: Vec<Box<dyn FetchStrategy + Send>>,
    cache: ReadCache,
}

impl DualPathReader {
    /// Strategies are tried in the given order; the first success wins.
    pub fn new(strategies: Vec<Box<dyn FetchStrategy + Send>>, cache: ReadCache) -> Self {
        Self { strategies, cache }
    }

    /// Resolve the current content, falling back across strategies on any error.
    ///
    /// When every strategy fails, the last error is returned.
    #[instrument(skip_all, fields(location = %location))]
    pub fn fetch_current(&mut self, location: &Location) -> Result<Fetched, ResourceError> {
        let mut last_err = None;
        for strategy in &self.strategies {
            match strategy.fetch(location, self.cache.get()) {
                Ok(FetchOutcome::NotModified) => match self.cache.get() {
                    Some(entry) => {
                        debug!(source = strategy.name(), "not modified, serving cache");
                        return Ok(Fetched {
                            snapshot: Snapshot {
                                version: entry.version.clone(),
                                body: entry.body.clone(),
                            },
                            from_cache: true,
                            source: strategy.name(),
                        });
                    }
                    None => {
                        warn!(
                            source = strategy.name(),
                            "not modified reported without a cached entry"
                        );
                        last_err = Some(ResourceError::Protocol(format!(
                            "{} reported not modified with an empty cache",
                            strategy.name()
                        )));
                    }
                },
                Ok(FetchOutcome::Fresh(entry)) => {
                    debug!(source = strategy.name(), version = %entry.version, "fresh content");
                    let snapshot = Snapshot {
                        version: entry.version.clone(),
                        body: entry.body.clone(),
                    };
                    self.cache.store(entry);
                    return Ok(Fetched {
                        snapshot,
                        from_cache: false,
                        source: strategy.name(),
                    });
                }
                Err(err) => {
                    debug!(source = strategy.name(), %err, "fetch path failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ResourceError::Protocol("no fetch strategies configured".to_string())
        }))
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }
}
