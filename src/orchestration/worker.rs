//! The per-order pipeline.
//!
//! Validate, optionally preprocess, import, terminal event. Every failure
//! in any step becomes exactly one `Import Failed` event with a one-line
//! message; nothing propagates out of the worker task.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::config::AdiConfig;
use crate::error::PipelineError;
use crate::import::Importer;
use crate::models::OrderRecord;
use crate::omero::OmeroGateway;
use crate::preprocess::{Preprocessor, StagedFile};
use crate::state_machine::Stage;
use crate::tracker::IngestTracker;
use crate::validation::OrderValidator;

pub struct OrderPipeline {
    config: AdiConfig,
    tracker: IngestTracker,
    gateway: Arc<dyn OmeroGateway>,
    shutdown: watch::Receiver<bool>,
}

impl OrderPipeline {
    pub fn new(
        config: AdiConfig,
        tracker: IngestTracker,
        gateway: Arc<dyn OmeroGateway>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            tracker,
            gateway,
            shutdown,
        }
    }

    /// Run the pipeline for one claimed order and record its terminal
    /// event. Never returns an error; the event log is the outcome.
    #[instrument(skip(self, record), fields(uuid = %record.uuid))]
    pub async fn process(&self, record: OrderRecord) {
        let uuid = record.uuid;

        let (stage, message) = match self.run_steps(&record).await {
            Ok(()) => {
                info!(uuid = %uuid, "order completed");
                (Stage::ImportCompleted, None)
            }
            Err(e) => {
                error!(uuid = %uuid, kind = e.kind(), error = %e, "order failed");
                (Stage::ImportFailed, Some(e.to_string()))
            }
        };

        if let Err(e) = self.tracker.record(uuid, stage, message.as_deref()).await {
            // The order will surface as dangling and be failed on the next
            // startup.
            error!(uuid = %uuid, error = %e, "failed to record terminal event");
        }
    }

    async fn run_steps(&self, record: &OrderRecord) -> Result<(), PipelineError> {
        let validator = OrderValidator::new(self.gateway.as_ref());
        let validated = validator.validate(record).await?;

        self.check_shutdown(&validated.uuid, "validation")?;

        let staged: Option<Vec<StagedFile>> = match validated.preprocessing_id {
            Some(preprocessing_id) => {
                let spec = self
                    .tracker
                    .load_preprocessing(preprocessing_id)
                    .await
                    .map_err(PipelineError::from)?
                    .ok_or_else(|| {
                        PipelineError::PreprocessFailed(format!(
                            "preprocessing row {preprocessing_id} not found"
                        ))
                    })?;

                let preprocessor = Preprocessor::new(&self.config.omero_data_root);
                Some(
                    preprocessor
                        .run(&validated.uuid, &spec, &validated.files)
                        .await?,
                )
            }
            None => None,
        };

        self.check_shutdown(&validated.uuid, "preprocessing")?;

        let importer = Importer::new(self.config.clone(), Arc::clone(&self.gateway));
        importer.import_order(&validated, staged.as_deref()).await
    }

    /// Observed between pipeline steps only; a running subprocess is never
    /// interrupted.
    fn check_shutdown(&self, uuid: &uuid::Uuid, after: &str) -> Result<(), PipelineError> {
        if *self.shutdown.borrow() {
            warn!(uuid = %uuid, after, "shutdown observed, abandoning order");
            return Err(PipelineError::ImportFailed(format!(
                "aborted by service shutdown after {after}"
            )));
        }
        Ok(())
    }
}
