//! The wired-up pipeline: configuration, provider catalog, ledger store and
//! acquisition engine, built once per invocation and shared by reference
//! with every job.

use std::sync::Arc;

use nrtgnss_core::acquisition::AcquisitionEngine;
use nrtgnss_core::catalog::ProviderCatalog;
use nrtgnss_core::ledger::Ledger;
use nrtgnss_core::transport::{registry_for, TransportRegistry};
use tracing::info;

use crate::config::{PipelineConfig, RunId};
use crate::orchestrator::OrchestratorError;

pub struct Pipeline {
    config: PipelineConfig,
    catalog: ProviderCatalog,
    ledger: Ledger,
    engine: AcquisitionEngine,
    run_id: RunId,
    owner: String,
}

impl Pipeline {
    /// Load the catalog, build one transport per provider and open the ledger.
    ///
    /// These are the only failures that abort a run.
    pub fn open(config: PipelineConfig) -> Result<Self, OrchestratorError> {
        let catalog = ProviderCatalog::from_file(&config.catalog)?;
        let transports = registry_for(&catalog)?;
        let ledger = Ledger::open(&config.paths.ledger)?;
        info!(
            providers = catalog.len(),
            ledger = %config.paths.ledger.display(),
            "pipeline opened"
        );
        Ok(Self::from_parts(config, catalog, ledger, transports))
    }

    /// Assemble a pipeline from already-built parts (tests inject mock
    /// transports and an in-memory ledger this way).
    pub fn from_parts(
        config: PipelineConfig,
        catalog: ProviderCatalog,
        ledger: Ledger,
        transports: TransportRegistry,
    ) -> Self {
        let engine = AcquisitionEngine::new(config.acquisition_config(), transports)
            .with_breaker(Arc::new(config.breaker()));
        let run_id = config.run_id(&catalog.fingerprint());
        let owner = format!("{}-{}", std::process::id(), &run_id[..12]);
        Self {
            config,
            catalog,
            ledger,
            engine,
            run_id,
            owner,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn engine(&self) -> &AcquisitionEngine {
        &self.engine
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Claim owner tag for this invocation.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}
