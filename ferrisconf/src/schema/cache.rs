//! Shared source and context cache.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::debug;

use super::{SchemaBuildError, SchemaContext, SourceIdentifier, SourceRepository};

/// Caching decorator around a [`SourceRepository`].
///
/// Successfully fetched sources and built contexts are kept until
/// [`clear`](Self::clear). Building a context goes through the source cache,
/// and the inner repository compiles from the cached texts. Contexts are
/// keyed by the exact source set, so devices advertising identical
/// capabilities share one context. Failures are never cached.
///
/// One instance is meant to be shared by every device session that should
/// share models; pass it to each builder as the source repository.
pub struct SchemaCache {
    inner: Arc<dyn SourceRepository>,
    sources: DashMap<SourceIdentifier, Bytes>,
    contexts: DashMap<BTreeSet<SourceIdentifier>, SchemaContext>,
}

impl SchemaCache {
    pub fn new(inner: Arc<dyn SourceRepository>) -> Self {
        Self {
            inner,
            sources: DashMap::new(),
            contexts: DashMap::new(),
        }
    }

    /// Number of cached contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Number of cached sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Drop everything cached.
    pub fn clear(&self) {
        self.sources.clear();
        self.contexts.clear();
    }
}

#[async_trait]
impl SourceRepository for SchemaCache {
    async fn fetch_source(
        &self,
        id: &SourceIdentifier,
    ) -> std::result::Result<Bytes, SchemaBuildError> {
        if let Some(text) = self.sources.get(id) {
            return Ok(text.clone());
        }
        let text = self.inner.fetch_source(id).await?;
        self.sources.insert(id.clone(), text.clone());
        Ok(text)
    }

    async fn build_context(
        &self,
        sources: &BTreeSet<SourceIdentifier>,
    ) -> std::result::Result<SchemaContext, SchemaBuildError> {
        if let Some(ctx) = self.contexts.get(sources) {
            debug!("Reusing cached schema context for {} sources", sources.len());
            return Ok(ctx.clone());
        }
        let mut texts = BTreeMap::new();
        for id in sources {
            texts.insert(id.clone(), self.fetch_source(id).await?);
        }
        let ctx = self.inner.build_context_from(&texts).await?;
        self.contexts.insert(sources.clone(), ctx.clone());
        Ok(ctx)
    }

    async fn build_context_from(
        &self,
        texts: &BTreeMap<SourceIdentifier, Bytes>,
    ) -> std::result::Result<SchemaContext, SchemaBuildError> {
        let sources: BTreeSet<SourceIdentifier> = texts.keys().cloned().collect();
        if let Some(ctx) = self.contexts.get(&sources) {
            return Ok(ctx.clone());
        }
        for (id, text) in texts {
            self.sources.entry(id.clone()).or_insert_with(|| text.clone());
        }
        let ctx = self.inner.build_context_from(texts).await?;
        self.contexts.insert(sources, ctx.clone());
        Ok(ctx)
    }

    async fn store_source(
        &self,
        id: &SourceIdentifier,
        text: Bytes,
    ) -> std::result::Result<(), SchemaBuildError> {
        self.inner.store_source(id, text.clone()).await?;
        self.sources.insert(id.clone(), text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRepository;

    fn set(names: &[&str]) -> BTreeSet<SourceIdentifier> {
        names
            .iter()
            .map(|n| SourceIdentifier::new(*n, None))
            .collect()
    }

    #[tokio::test]
    async fn test_context_built_once_per_set() {
        let repo = Arc::new(FakeRepository::new());
        let cache = SchemaCache::new(repo.clone());

        cache.build_context(&set(&["a", "b"])).await.unwrap();
        cache.build_context(&set(&["a", "b"])).await.unwrap();
        assert_eq!(repo.build_calls(), 1);
        assert_eq!(cache.context_count(), 1);

        cache.build_context(&set(&["a"])).await.unwrap();
        assert_eq!(repo.build_calls(), 2);

        cache.clear();
        cache.build_context(&set(&["a"])).await.unwrap();
        assert_eq!(repo.build_calls(), 3);
    }

    #[tokio::test]
    async fn test_building_fills_source_cache() {
        let repo = Arc::new(FakeRepository::new());
        let cache = SchemaCache::new(repo.clone());

        cache.build_context(&set(&["a", "b"])).await.unwrap();
        assert_eq!(cache.source_count(), 2);
        assert_eq!(repo.fetch_calls(), 2);

        // A different set reuses the cached texts.
        cache.build_context(&set(&["a", "b", "c"])).await.unwrap();
        assert_eq!(cache.source_count(), 3);
        assert_eq!(repo.fetch_calls(), 3);
        assert_eq!(repo.build_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_build() {
        let missing = SourceIdentifier::new("gone", None);
        let repo = Arc::new(FakeRepository::new().with_missing(missing.clone()));
        let cache = SchemaCache::new(repo.clone());

        let mut sources = set(&["a"]);
        sources.insert(missing.clone());
        let err = cache.build_context(&sources).await.unwrap_err();
        assert_eq!(err, SchemaBuildError::MissingSource(missing));
        assert_eq!(repo.build_calls(), 0);
        assert_eq!(cache.context_count(), 0);
    }

    #[tokio::test]
    async fn test_stored_sources_reach_inner_repository() {
        let missing = SourceIdentifier::new("gone", None);
        let repo = Arc::new(FakeRepository::new().with_missing(missing.clone()));
        let cache = SchemaCache::new(repo.clone());

        cache
            .store_source(&missing, Bytes::from_static(b"module gone {}"))
            .await
            .unwrap();

        assert_eq!(repo.stored(&missing), Some(Bytes::from_static(b"module gone {}")));
        let text = cache.fetch_source(&missing).await.unwrap();
        assert_eq!(&text[..], b"module gone {}");
        assert_eq!(repo.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let missing = SourceIdentifier::new("gone", None);
        let repo = Arc::new(FakeRepository::new().with_missing(missing.clone()));
        let cache = SchemaCache::new(repo.clone());

        assert!(cache.fetch_source(&missing).await.is_err());
        assert!(cache.fetch_source(&missing).await.is_err());
        assert_eq!(cache.source_count(), 0);

        let present = SourceIdentifier::new("here", None);
        cache.fetch_source(&present).await.unwrap();
        cache.fetch_source(&present).await.unwrap();
        assert_eq!(cache.source_count(), 1);
        assert_eq!(repo.fetch_calls(), 3);
    }
}
