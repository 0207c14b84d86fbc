use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::coordinator::{DownloadCoordinator, FinalArtifact, Postprocessor};
use crate::descriptor::Extractor;
use crate::error::EngineError;
use crate::progress::SharedProgressListener;
use crate::selector::FormatSelector;

/// Entry point tying an extractor, the format selector and the coordinator together.
pub struct MediaEngine {
    coordinator: DownloadCoordinator,
}

impl MediaEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self {
            coordinator: DownloadCoordinator::from_config(config)?,
        })
    }

    pub fn from_coordinator(coordinator: DownloadCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.coordinator = self.coordinator.with_postprocessor(postprocessor);
        self
    }

    pub fn with_progress_listener(mut self, listener: SharedProgressListener) -> Self {
        self.coordinator = self.coordinator.with_progress_listener(listener);
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.coordinator = self.coordinator.with_cancellation_token(token);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.coordinator.cancellation_token()
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.coordinator
    }

    /// Extract `reference`, select streams with `expression` and download them.
    ///
    /// The expression is parsed before extraction so syntax errors never cost
    /// a network round trip.
    #[instrument(skip(self, extractor), fields(extractor = extractor.name()))]
    pub async fn download(
        &self,
        extractor: &dyn Extractor,
        reference: &str,
        expression: &str,
    ) -> Result<FinalArtifact, EngineError> {
        if !extractor.suitable(reference) {
            return Err(EngineError::Extraction {
                reason: format!("{} does not handle `{reference}`", extractor.name()),
            });
        }
        let selector = FormatSelector::parse(expression)?;

        let item = extractor.extract(reference).await?;
        info!(
            media_id = %item.id,
            title = item.title.as_deref().unwrap_or_default(),
            streams = item.streams.len(),
            "Extracted media item"
        );

        let groups = selector.select(&item.streams)?;
        self.coordinator.run(&item.id, &groups).await
    }
}
