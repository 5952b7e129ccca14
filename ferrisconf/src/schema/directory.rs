//! Sources read from a local model directory.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use regex::Regex;

use super::{SchemaBuildError, SchemaContext, SourceIdentifier, SourceRepository};

static IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*import\s+"?([\w.-]+)"?"#).expect("static regex"));

/// Repository over a directory of `.yang` files.
///
/// A source is looked up as `<name>@<revision>.yang`, then `<name>.yang`.
/// Stored sources are written under the first of those names.
/// Building a context checks that every `import` names a module in the set;
/// sources whose imports are not satisfied are reported so the resolver can
/// drop them. The compiled payload is the source text of each module, as a
/// `BTreeMap<SourceIdentifier, Bytes>`.
#[derive(Debug, Clone)]
pub struct DirectoryRepository {
    root: PathBuf,
}

impl DirectoryRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, id: &SourceIdentifier) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(2);
        if let Some(revision) = id.revision() {
            paths.push(self.root.join(format!("{}@{}.yang", id.name(), revision)));
        }
        paths.push(self.root.join(format!("{}.yang", id.name())));
        paths
    }
}

/// Module names imported by a source.
fn imports(text: &str) -> BTreeSet<String> {
    IMPORT
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// Check that the imports of `texts` are closed over the set.
fn link(texts: BTreeMap<SourceIdentifier, Bytes>) -> Result<SchemaContext, SchemaBuildError> {
    let sources: BTreeSet<SourceIdentifier> = texts.keys().cloned().collect();

    // Drop sources with unmet imports until the rest is closed.
    let mut resolved = sources.clone();
    loop {
        let names: BTreeSet<&str> = resolved.iter().map(|id| id.name()).collect();
        let broken: Vec<SourceIdentifier> = resolved
            .iter()
            .filter(|id| {
                let text = String::from_utf8_lossy(&texts[*id]);
                imports(&text).iter().any(|m| !names.contains(m.as_str()))
            })
            .cloned()
            .collect();
        if broken.is_empty() {
            break;
        }
        for id in &broken {
            resolved.remove(id);
        }
    }

    if resolved.len() < sources.len() {
        let unsatisfied: BTreeSet<_> = sources.difference(&resolved).cloned().collect();
        debug!(
            "{} of {} sources have unsatisfied imports",
            unsatisfied.len(),
            sources.len()
        );
        return Err(SchemaBuildError::Resolution {
            failed_source: None,
            resolved,
            unsatisfied,
        });
    }

    Ok(SchemaContext::new(sources).with_payload(Arc::new(texts)))
}

#[async_trait]
impl SourceRepository for DirectoryRepository {
    async fn fetch_source(&self, id: &SourceIdentifier) -> Result<Bytes, SchemaBuildError> {
        for path in self.candidates(id) {
            match tokio::fs::read(&path).await {
                Ok(text) => {
                    trace!("Read {} from {}", id, path.display());
                    return Ok(Bytes::from(text));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(SchemaBuildError::Other(format!(
                        "failed to read {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        Err(SchemaBuildError::MissingSource(id.clone()))
    }

    async fn build_context(
        &self,
        sources: &BTreeSet<SourceIdentifier>,
    ) -> Result<SchemaContext, SchemaBuildError> {
        let mut texts = BTreeMap::new();
        for id in sources {
            texts.insert(id.clone(), self.fetch_source(id).await?);
        }
        link(texts)
    }

    async fn build_context_from(
        &self,
        texts: &BTreeMap<SourceIdentifier, Bytes>,
    ) -> Result<SchemaContext, SchemaBuildError> {
        link(texts.clone())
    }

    async fn store_source(
        &self,
        id: &SourceIdentifier,
        text: Bytes,
    ) -> Result<(), SchemaBuildError> {
        let Some(path) = self.candidates(id).into_iter().next() else {
            return Ok(());
        };
        tokio::fs::write(&path, &text[..]).await.map_err(|e| {
            SchemaBuildError::Other(format!("failed to write {}: {}", path.display(), e))
        })?;
        debug!("Stored {} as {}", id, path.display());
        Ok(())
    }
}
