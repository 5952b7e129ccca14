//! Degrade-and-retry schema context construction.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, warn};

use super::{SchemaBuildError, SchemaContext, SourceIdentifier, SourceRepository};
use crate::error::SchemaResolutionError;

/// Why a required source was left out of the built context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// The repository has no text for the source.
    MissingSource,
    /// The source, or one of its imports, could not be linked.
    UnableToResolve,
}

/// A required source that did not make it into the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedCapability {
    pub source: SourceIdentifier,
    pub reason: UnresolvedReason,
}

/// Result of a successful resolution.
#[derive(Debug, Clone)]
pub struct ResolvedSchema {
    pub context: Arc<SchemaContext>,
    /// The exact source set the context was built from.
    pub sources: BTreeSet<SourceIdentifier>,
    /// Sources stripped on the way, in the order they were dropped.
    pub unresolved: Vec<UnresolvedCapability>,
}

/// Builds a schema context from a required source set, dropping sources the
/// repository cannot use until a context builds or nothing is left.
///
/// Every retry works on a strictly smaller set, so the loop runs at most once
/// per required source.
#[derive(Clone)]
pub struct SchemaResolver {
    device: String,
    repository: Arc<dyn SourceRepository>,
}

impl SchemaResolver {
    pub fn new(device: impl Into<String>, repository: Arc<dyn SourceRepository>) -> Self {
        Self {
            device: device.into(),
            repository,
        }
    }

    pub fn repository(&self) -> &Arc<dyn SourceRepository> {
        &self.repository
    }

    /// The same resolver over another repository.
    pub fn with_repository(&self, repository: Arc<dyn SourceRepository>) -> Self {
        Self {
            device: self.device.clone(),
            repository,
        }
    }

    pub async fn resolve(
        &self,
        required: BTreeSet<SourceIdentifier>,
    ) -> std::result::Result<ResolvedSchema, SchemaResolutionError> {
        let mut current = required;
        let mut unresolved = Vec::new();

        loop {
            if current.is_empty() {
                return Err(SchemaResolutionError::NoSources);
            }

            debug!(
                "{}: Trying to build schema context from {} sources",
                self.device,
                current.len()
            );

            let err = match self.repository.build_context(&current).await {
                Ok(ctx) => {
                    debug!(
                        "{}: Schema context built from {} sources ({} unresolved)",
                        self.device,
                        current.len(),
                        unresolved.len()
                    );
                    return Ok(ResolvedSchema {
                        context: Arc::new(ctx),
                        sources: current,
                        unresolved,
                    });
                }
                Err(err) => err,
            };

            match err {
                SchemaBuildError::MissingSource(source) => {
                    if !current.remove(&source) {
                        return Err(SchemaResolutionError::UnknownSource(source));
                    }
                    warn!(
                        "{}: Unable to build schema context, missing source {}, attempting without it",
                        self.device, source
                    );
                    unresolved.push(UnresolvedCapability {
                        source,
                        reason: UnresolvedReason::MissingSource,
                    });
                }

                SchemaBuildError::Resolution {
                    failed_source: Some(source),
                    ..
                } => {
                    if !current.remove(&source) {
                        return Err(SchemaResolutionError::UnknownSource(source));
                    }
                    warn!(
                        "{}: Unable to build schema context, failed to resolve {}, attempting without it",
                        self.device, source
                    );
                    unresolved.push(UnresolvedCapability {
                        source,
                        reason: UnresolvedReason::UnableToResolve,
                    });
                }

                SchemaBuildError::Resolution {
                    failed_source: None,
                    resolved,
                    unsatisfied,
                } => {
                    let shrinks = resolved.len() < current.len() && resolved.is_subset(&current);
                    if !shrinks {
                        return Err(SchemaResolutionError::NoProgress {
                            remaining: current.len(),
                        });
                    }
                    warn!(
                        "{}: Unable to build schema context, unsatisfied imports {:?}, attempting with {} resolved sources",
                        self.device,
                        unsatisfied.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        resolved.len()
                    );
                    // Anything dropped counts as unresolvable, whether or not
                    // the repository listed it.
                    for source in current.difference(&resolved) {
                        unresolved.push(UnresolvedCapability {
                            source: source.clone(),
                            reason: UnresolvedReason::UnableToResolve,
                        });
                    }
                    current = resolved;
                }

                SchemaBuildError::Other(msg) => {
                    return Err(SchemaResolutionError::Unrecoverable(msg));
                }
            }
        }
    }
}
