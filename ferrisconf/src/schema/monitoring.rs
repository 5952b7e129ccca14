//! Sources downloaded from the device with `<get-schema>`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, warn};

use super::{SchemaBuildError, SchemaContext, SourceIdentifier, SourceRepository};
use crate::error::RpcError;
use crate::rpc::Rpc;
use crate::rpc::message::data_text;
use crate::session::RequestCorrelator;

/// Falls back to the device for sources the local repository lacks.
///
/// Used for sessions whose device advertises ietf-netconf-monitoring.
/// Downloaded text is handed to the local repository's `store_source`, and
/// contexts are compiled by the local repository from the combined texts.
/// A source the device cannot supply stays missing.
pub struct DeviceSourceRepository {
    device: String,
    local: Arc<dyn SourceRepository>,
    correlator: Arc<RequestCorrelator>,
    downloaded: DashMap<SourceIdentifier, Bytes>,
}

impl DeviceSourceRepository {
    pub fn new(
        device: impl Into<String>,
        local: Arc<dyn SourceRepository>,
        correlator: Arc<RequestCorrelator>,
    ) -> Self {
        Self {
            device: device.into(),
            local,
            correlator,
            downloaded: DashMap::new(),
        }
    }

    async fn download(&self, id: &SourceIdentifier) -> Result<Bytes, SchemaBuildError> {
        if let Some(text) = self.downloaded.get(id) {
            return Ok(text.clone());
        }

        let rpc = Rpc::GetSchema {
            identifier: id.name().to_string(),
            version: id.revision().map(str::to_string),
        };
        let text = match self.correlator.send(&rpc).await {
            Ok(reply) => data_text(&reply.raw).filter(|text| !text.trim().is_empty()),
            Err(RpcError::Remote(err)) => {
                debug!("{}: Device has no source {}: {}", self.device, id, err);
                None
            }
            Err(err) => {
                warn!("{}: Downloading source {} failed: {}", self.device, id, err);
                None
            }
        };
        let Some(text) = text else {
            return Err(SchemaBuildError::MissingSource(id.clone()));
        };

        debug!("{}: Downloaded source {} from device", self.device, id);
        let text = Bytes::from(text);
        self.downloaded.insert(id.clone(), text.clone());
        if let Err(e) = self.local.store_source(id, text.clone()).await {
            warn!("{}: Unable to store downloaded source {}: {}", self.device, id, e);
        }
        Ok(text)
    }
}

#[async_trait]
impl SourceRepository for DeviceSourceRepository {
    async fn fetch_source(&self, id: &SourceIdentifier) -> Result<Bytes, SchemaBuildError> {
        match self.local.fetch_source(id).await {
            Err(SchemaBuildError::MissingSource(_)) => self.download(id).await,
            other => other,
        }
    }

    async fn build_context(
        &self,
        sources: &BTreeSet<SourceIdentifier>,
    ) -> Result<SchemaContext, SchemaBuildError> {
        let mut texts = BTreeMap::new();
        for id in sources {
            texts.insert(id.clone(), self.fetch_source(id).await?);
        }
        self.local.build_context_from(&texts).await
    }

    async fn build_context_from(
        &self,
        texts: &BTreeMap<SourceIdentifier, Bytes>,
    ) -> Result<SchemaContext, SchemaBuildError> {
        self.local.build_context_from(texts).await
    }

    async fn store_source(
        &self,
        id: &SourceIdentifier,
        text: Bytes,
    ) -> Result<(), SchemaBuildError> {
        self.local.store_source(id, text).await
    }
}
