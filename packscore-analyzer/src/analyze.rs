// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! The per-package analysis orchestrator.
//!
//! `analyze` drives acquire, download, collect, evaluate, persist.
//! The working directory is removed on success and failure alike. A package
//! that disappeared upstream gets its analysis document deleted; any other
//! failure is recorded as a degraded document so the stale observer keeps a
//! timestamp to reconsider it by.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use packscore_common::{fs as common_fs, AnalyzerError, AnalyzerErrorKind, AnalyzerResult};
use packscore_docstore::{delete_with_retry, put_with_retry, DocumentStore};
use packscore_registry::PackageRegistry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::collect::{Collected, CollectorSet, Metadata};
use crate::compact::compact_json;
use crate::download::PackageDownloader;
use crate::evaluate::{evaluate, Evaluation};
use crate::manifest::manifest_from_package_data;
use crate::metrics::ANALYZER_METRICS;
use crate::{analysis_key, docstore_error, registry_error};

static WORKDIR_SEQ: AtomicU64 = AtomicU64::new(0);

/// Serialized failure carried by a degraded analysis document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedError {
    pub kind: AnalyzerErrorKind,
    pub message: String,
    pub caught_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDocument {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub collected: Collected,
    pub evaluation: Evaluation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordedError>,
}

enum PipelineFailure {
    /// The package no longer exists upstream; its analysis was deleted.
    PackageGone,
    Failed(AnalyzerError),
}

impl From<AnalyzerError> for PipelineFailure {
    fn from(error: AnalyzerError) -> Self {
        PipelineFailure::Failed(error)
    }
}

pub struct Analyzer {
    registry: Arc<dyn PackageRegistry>,
    docstore: Arc<dyn DocumentStore>,
    downloader: Arc<dyn PackageDownloader>,
    collectors: Arc<dyn CollectorSet>,
    workdir_root: PathBuf,
}

impl Analyzer {
    pub fn new(
        registry: Arc<dyn PackageRegistry>,
        docstore: Arc<dyn DocumentStore>,
        downloader: Arc<dyn PackageDownloader>,
        collectors: Arc<dyn CollectorSet>,
        workdir_root: PathBuf,
    ) -> Self {
        Self {
            registry,
            docstore,
            downloader,
            collectors,
            workdir_root,
        }
    }

    #[instrument(name = "analyze", level = "info", skip(self), fields(name = %name))]
    pub async fn analyze(&self, name: &str) -> AnalyzerResult<AnalysisDocument> {
        let started_at = Utc::now();
        let workdir = self.workdir_root.join(format!(
            "{}-{}",
            name.replace(['/', '\\'], "-"),
            WORKDIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let timer = std::time::Instant::now();
        let outcome = self.run_pipeline(name, started_at, &workdir).await;
        if let Err(cleanup_error) = common_fs::remove_dir_all_if_exists(&workdir).await {
            warn!(err = %cleanup_error, workdir = %workdir.display(), "failed to remove working directory");
        }
        let outcome_label = match &outcome {
            Ok(_) => "success",
            Err(PipelineFailure::PackageGone) => "gone",
            Err(PipelineFailure::Failed(_)) => "failure",
        };
        ANALYZER_METRICS
            .analyses_total
            .with_label_values([outcome_label])
            .inc();
        ANALYZER_METRICS
            .analysis_duration_secs
            .with_label_values([outcome_label])
            .observe(timer.elapsed().as_secs_f64());
        match outcome {
            Ok(analysis) => {
                self.persist(name, &analysis).await?;
                info!(name = %name, "analysis persisted");
                Ok(analysis)
            }
            Err(PipelineFailure::PackageGone) => {
                Err(AnalyzerErrorKind::Unrecoverable
                    .with_error(anyhow::anyhow!("package `{name}` not found upstream")))
            }
            Err(PipelineFailure::Failed(error)) => {
                if let Err(record_error) = self.record_failure(name, &error, started_at).await {
                    warn!(err = %record_error, name = %name, "failed to record degraded analysis");
                }
                Err(error)
            }
        }
    }

    async fn run_pipeline(
        &self,
        name: &str,
        started_at: DateTime<Utc>,
        workdir: &std::path::Path,
    ) -> Result<AnalysisDocument, PipelineFailure> {
        // Acquire.
        let package_data = match self.registry.fetch_package(name).await {
            Ok(package_data) => package_data,
            Err(fetch_error) if fetch_error.is_not_found() => {
                warn!(name = %name, "package gone upstream, deleting its analysis");
                delete_with_retry(&*self.docstore, &analysis_key(name))
                    .await
                    .map_err(|delete_error| PipelineFailure::Failed(docstore_error(delete_error)))?;
                return Err(PipelineFailure::PackageGone);
            }
            Err(fetch_error) => return Err(registry_error(fetch_error).into()),
        };
        let manifest = manifest_from_package_data(&package_data)?;

        // Download.
        tokio::fs::create_dir_all(workdir).await.map_err(|io_error| {
            PipelineFailure::Failed(AnalyzerErrorKind::Transient.with_error(anyhow::Error::from(io_error)))
        })?;
        let merged_manifest = self
            .downloader
            .download(&package_data, &manifest, workdir)
            .await?;

        // Collect, then evaluate.
        let collected = self
            .collectors
            .collect(&package_data, &merged_manifest, workdir)
            .await?;
        let evaluation = evaluate(&collected);

        Ok(AnalysisDocument {
            started_at,
            finished_at: Utc::now(),
            collected,
            evaluation,
            error: None,
        })
    }

    async fn persist(&self, name: &str, analysis: &AnalysisDocument) -> AnalyzerResult<()> {
        let analysis_value = serde_json::to_value(analysis)
            .expect("an analysis document is always serializable");
        let compacted = compact_json(analysis_value).unwrap_or_else(|| json!({}));
        put_with_retry(&*self.docstore, &analysis_key(name), compacted)
            .await
            .map_err(docstore_error)?;
        Ok(())
    }

    /// Persists a degraded document: the error, a collected stub, and an
    /// evaluation derived from the stub, so the stale view still sees a
    /// timestamp for this package.
    pub async fn record_failure(
        &self,
        name: &str,
        error: &AnalyzerError,
        started_at: DateTime<Utc>,
    ) -> AnalyzerResult<()> {
        let collected_stub = Collected {
            metadata: Metadata {
                name: name.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let degraded = AnalysisDocument {
            started_at,
            finished_at: Utc::now(),
            evaluation: evaluate(&collected_stub),
            collected: collected_stub,
            error: Some(RecordedError {
                kind: error.kind(),
                message: error.message(),
                caught_at: Utc::now(),
            }),
        };
        self.persist(name, &degraded).await
    }
}
