//! Schema sources, compiled contexts and the repository that builds them.
//!
//! The crate never parses models itself. A [`SourceRepository`] fetches
//! source text and compiles a set of sources into an opaque
//! [`SchemaContext`]; [`SchemaResolver`] drives it, stripping sources the
//! repository cannot use until a context builds.

mod cache;
mod directory;
mod monitoring;
mod resolver;

pub use cache::SchemaCache;
pub use directory::DirectoryRepository;
pub use monitoring::DeviceSourceRepository;
pub use resolver::{ResolvedSchema, SchemaResolver, UnresolvedCapability, UnresolvedReason};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// A model source: module name plus optional revision date.
///
/// Ordered by name, then revision (revision-less sorts first).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceIdentifier {
    name: String,
    revision: Option<String>,
}

impl SourceIdentifier {
    pub fn new(name: impl Into<String>, revision: Option<String>) -> Self {
        Self {
            name: name.into(),
            revision: revision.filter(|r| !r.is_empty()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }
}

impl fmt::Display for SourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(rev) => write!(f, "{}@{}", self.name, rev),
            None => f.write_str(&self.name),
        }
    }
}

/// A compiled schema context.
///
/// Opaque to this crate apart from the exact source set it was built from.
/// Implementations of [`SourceRepository`] may attach their own compiled
/// representation through `payload`.
#[derive(Clone)]
pub struct SchemaContext {
    sources: BTreeSet<SourceIdentifier>,
    payload: Option<Arc<dyn std::any::Any + Send + Sync>>,
}

impl SchemaContext {
    pub fn new(sources: BTreeSet<SourceIdentifier>) -> Self {
        Self {
            sources,
            payload: None,
        }
    }

    /// Attach a repository-specific compiled model.
    pub fn with_payload(mut self, payload: Arc<dyn std::any::Any + Send + Sync>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn sources(&self) -> &BTreeSet<SourceIdentifier> {
        &self.sources
    }

    pub fn contains(&self, source: &SourceIdentifier) -> bool {
        self.sources.contains(source)
    }

    /// Downcast the attached payload.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for SchemaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaContext")
            .field("sources", &self.sources)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

/// Failure reported by a [`SourceRepository`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaBuildError {
    /// The source text for this identifier is not available.
    MissingSource(SourceIdentifier),

    /// Sources are present but could not be linked.
    ///
    /// Either a single offending source is named, or the repository reports
    /// the subset it could resolve and the sources left unsatisfied.
    Resolution {
        failed_source: Option<SourceIdentifier>,
        resolved: BTreeSet<SourceIdentifier>,
        unsatisfied: BTreeSet<SourceIdentifier>,
    },

    /// Any other failure. Not recoverable by degrading.
    Other(String),
}

impl fmt::Display for SchemaBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaBuildError::MissingSource(id) => write!(f, "source {} is missing", id),
            SchemaBuildError::Resolution {
                failed_source: Some(id),
                ..
            } => write!(f, "source {} failed to resolve", id),
            SchemaBuildError::Resolution { unsatisfied, .. } => {
                write!(f, "{} sources have unsatisfied imports", unsatisfied.len())
            }
            SchemaBuildError::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for SchemaBuildError {}

/// Fetches model sources and compiles them into contexts.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Fetch the text of one source.
    async fn fetch_source(&self, id: &SourceIdentifier)
    -> std::result::Result<Bytes, SchemaBuildError>;

    /// Compile exactly `sources` into a context.
    async fn build_context(
        &self,
        sources: &BTreeSet<SourceIdentifier>,
    ) -> std::result::Result<SchemaContext, SchemaBuildError>;

    /// Compile a context from source texts already in hand.
    ///
    /// Used when some texts came from somewhere other than this repository,
    /// such as the device itself. The default ignores the texts and builds
    /// from the identifiers alone.
    async fn build_context_from(
        &self,
        texts: &BTreeMap<SourceIdentifier, Bytes>,
    ) -> std::result::Result<SchemaContext, SchemaBuildError> {
        let sources: BTreeSet<SourceIdentifier> = texts.keys().cloned().collect();
        self.build_context(&sources).await
    }

    /// Keep a source obtained elsewhere so later fetches find it.
    ///
    /// Repositories that cannot store sources accept and drop it.
    async fn store_source(
        &self,
        _id: &SourceIdentifier,
        _text: Bytes,
    ) -> std::result::Result<(), SchemaBuildError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_identifier_ordering() {
        let a = SourceIdentifier::new("a", None);
        let a_rev = SourceIdentifier::new("a", Some("2020-01-01".into()));
        let b = SourceIdentifier::new("b", None);
        let mut set = BTreeSet::new();
        set.insert(b.clone());
        set.insert(a_rev.clone());
        set.insert(a.clone());
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![a, a_rev, b]);
    }

    #[test]
    fn test_empty_revision_is_none() {
        let id = SourceIdentifier::new("m", Some(String::new()));
        assert_eq!(id.revision(), None);
        assert_eq!(id.to_string(), "m");
        assert_eq!(
            SourceIdentifier::new("m", Some("2021-02-03".into())).to_string(),
            "m@2021-02-03"
        );
    }

    #[test]
    fn test_context_payload() {
        let ctx = SchemaContext::new(BTreeSet::new()).with_payload(Arc::new(42u32));
        assert_eq!(ctx.payload::<u32>(), Some(&42));
        assert_eq!(ctx.payload::<String>(), None);
    }
}
