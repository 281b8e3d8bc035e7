//! The sync pipeline: seven strictly sequential phases over one request.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sync_common::metrics::{timing_guard, TimingGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregation::{AggregationConfig, AggregationEngine, AggregationStatistics};
use crate::catalog::{Catalog, InterfaceMeta};
use crate::config::{SyncConfig, SyncRequest};
use crate::error::{ConfigError, SyncError};
use crate::fetcher::{FetchSettings, SourceFetcher, Watermark};
use crate::governance::{ComplianceStatus, GovernanceEngine};
use crate::governance::recommend::Recommendation;
use crate::lineage::{LineageRecorder, TransformationStep, WrittenRecord, DEFAULT_LINEAGE_BATCH_SIZE};
use crate::mapper::{validate_mapping, FieldMapper};
use crate::metrics_consts::{PHASE_DURATION_MS, QUALITY_SCORE, RECORDS_REJECTED, SYNC_RUNS};
use crate::store::{ExecutionRecord, ExecutionStatus, ExecutionStore, SourceStore, TargetStore};
use crate::strategy::strategy_for;
use crate::writer::{DataWriter, DEFAULT_DELETE_BATCH_SIZE, DEFAULT_WRITE_BATCH_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Initialize,
    DataFetch,
    Aggregation,
    Governance,
    DataWrite,
    Lineage,
    Complete,
}

impl SyncPhase {
    pub const ALL: [SyncPhase; 7] = [
        SyncPhase::Initialize,
        SyncPhase::DataFetch,
        SyncPhase::Aggregation,
        SyncPhase::Governance,
        SyncPhase::DataWrite,
        SyncPhase::Lineage,
        SyncPhase::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Initialize => "initialize",
            SyncPhase::DataFetch => "data_fetch",
            SyncPhase::Aggregation => "aggregation",
            SyncPhase::Governance => "governance",
            SyncPhase::DataWrite => "data_write",
            SyncPhase::Lineage => "lineage",
            SyncPhase::Complete => "complete",
        }
    }

    /// Share of the pipeline done when this phase starts, in [0, 100].
    pub fn progress(&self) -> f64 {
        let index = Self::ALL.iter().position(|p| p == self).unwrap_or_default();
        index as f64 / Self::ALL.len() as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseStep {
    pub phase: SyncPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub record_count: usize,
    pub error_count: usize,
    pub status: StepStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernanceSummary {
    pub quality_score: f64,
    pub issue_count: usize,
    pub validation_error_count: usize,
    pub cleansing_applied_count: usize,
    pub masked_count: usize,
    pub compliance_status: ComplianceStatus,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncExecutionResult {
    pub source_record_count: usize,
    pub processed_record_count: usize,
    pub inserted_record_count: u64,
    pub updated_record_count: u64,
    pub deleted_record_count: u64,
    pub error_record_count: usize,
    pub lineage_record_count: usize,
    pub quality_score: f64,
    pub steps: Vec<PhaseStep>,
    pub watermarks: Vec<Watermark>,
    pub aggregation: Option<AggregationStatistics>,
    pub governance: Option<GovernanceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub result: SyncExecutionResult,
    pub error: Option<String>,
    pub failed_phase: Option<SyncPhase>,
    pub processing_time_ms: u64,
    pub progress: f64,
}

/// Sent on every phase transition.
#[derive(Debug, Clone, Serialize)]
pub struct SyncProgress {
    pub execution_id: Uuid,
    pub phase: SyncPhase,
    pub progress: f64,
    pub source_record_count: usize,
    pub processed_record_count: usize,
    pub error_record_count: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub fetch: FetchSettings,
    pub write_batch_size: usize,
    pub delete_batch_size: usize,
    pub lineage_batch_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch: FetchSettings::default(),
            write_batch_size: DEFAULT_WRITE_BATCH_SIZE,
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
            lineage_batch_size: DEFAULT_LINEAGE_BATCH_SIZE,
        }
    }
}

/// Runs sync requests against a fixed set of stores. One pipeline may serve many runs.
pub struct SyncPipeline {
    catalog: Arc<dyn Catalog>,
    source: Arc<dyn SourceStore>,
    target: Arc<dyn TargetStore>,
    executions: Arc<dyn ExecutionStore>,
    settings: PipelineSettings,
    progress: Option<mpsc::Sender<SyncProgress>>,
    cancelled: Arc<AtomicBool>,
}

/// Mutable state of one run.
struct Run {
    execution_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    result: SyncExecutionResult,
    phase: SyncPhase,
    phase_started_at: DateTime<Utc>,
    phase_timer: Option<TimingGuard>,
    /// Set once the execution row exists.
    recorded: bool,
}

impl Run {
    fn new() -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            started_at: Utc::now(),
            clock: Instant::now(),
            result: SyncExecutionResult::default(),
            phase: SyncPhase::Initialize,
            phase_started_at: Utc::now(),
            phase_timer: None,
            recorded: false,
        }
    }

    fn step(
        &mut self,
        record_count: usize,
        error_count: usize,
        status: StepStatus,
        message: String,
    ) -> PhaseStep {
        let status_label = match status {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        };
        let duration_ms = self
            .phase_timer
            .take()
            .map(|timer| timer.label("status", status_label).fin())
            .unwrap_or_default();

        PhaseStep {
            phase: self.phase,
            started_at: self.phase_started_at,
            finished_at: Utc::now(),
            duration_ms,
            record_count,
            error_count,
            status,
            message,
        }
    }

    fn finish(&mut self, record_count: usize, error_count: usize, message: impl Into<String>) {
        let message = message.into();
        info!(
            execution_id = %self.execution_id,
            phase = self.phase.as_str(),
            record_count,
            error_count,
            detail = message.as_str(),
            "phase finished"
        );
        let step = self.step(record_count, error_count, StepStatus::Success, message);
        self.result.steps.push(step);
    }

    fn fail(&mut self, error: &SyncError) {
        let step = self.step(0, 1, StepStatus::Failed, error.to_string());
        self.result.steps.push(step);
    }
}

impl SyncPipeline {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        executions: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self {
            catalog,
            source,
            target,
            executions,
            settings: PipelineSettings::default(),
            progress: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Progress updates are dropped when the channel is full or closed.
    pub fn with_progress(mut self, sender: mpsc::Sender<SyncProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Setting the flag stops a run before its next phase starts.
    pub fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Run one request to completion. Failures are reported in the response, never retried.
    pub async fn run(&self, request: &SyncRequest) -> SyncResponse {
        let mut run = Run::new();
        info!(
            execution_id = %run.execution_id,
            task_id = %request.task_id,
            execution_type = request.execution_type.as_str(),
            "starting sync"
        );

        let outcome = self.execute(&mut run, request).await;

        let (status, error, failed_phase) = match &outcome {
            Ok(()) => (ExecutionStatus::Success, None, None),
            Err(e) => {
                error!(
                    execution_id = %run.execution_id,
                    phase = run.phase.as_str(),
                    error = %e,
                    "sync failed"
                );
                run.fail(e);
                (ExecutionStatus::Failed, Some(e.to_string()), Some(run.phase))
            }
        };

        // A failed run still gets its bookkeeping written. A failed complete phase already tried.
        if status == ExecutionStatus::Failed
            && run.recorded
            && !matches!(outcome, Err(SyncError::Complete(_)))
        {
            let record = self.execution_record(&run, request, status, error.clone(), failed_phase);
            if let Err(e) = self.executions.finish_execution(&record).await {
                warn!(execution_id = %run.execution_id, error = %e, "failed to record failed execution");
            }
        }

        metrics::counter!(SYNC_RUNS, &[("status", status.as_str())]).increment(1);

        let progress = match status {
            ExecutionStatus::Success => 100.0,
            _ => run.phase.progress(),
        };
        SyncResponse {
            execution_id: run.execution_id,
            status,
            result: run.result.clone(),
            error,
            failed_phase,
            processing_time_ms: run.clock.elapsed().as_millis() as u64,
            progress,
        }
    }

    fn start(&self, run: &mut Run, phase: SyncPhase) -> Result<(), SyncError> {
        run.phase = phase;
        run.phase_started_at = Utc::now();
        run.phase_timer = Some(timing_guard(
            PHASE_DURATION_MS,
            &[("phase", phase.as_str().to_owned())],
        ));

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled(phase.as_str()));
        }

        info!(execution_id = %run.execution_id, phase = phase.as_str(), "phase started");
        self.report(run);
        Ok(())
    }

    fn report(&self, run: &Run) {
        let Some(sender) = &self.progress else {
            return;
        };

        let update = SyncProgress {
            execution_id: run.execution_id,
            phase: run.phase,
            progress: run.phase.progress(),
            source_record_count: run.result.source_record_count,
            processed_record_count: run.result.processed_record_count,
            error_record_count: run.result.error_record_count,
        };
        if let Err(e) = sender.try_send(update) {
            debug!(execution_id = %run.execution_id, error = %e, "dropped progress update");
        }
    }

    fn execution_record(
        &self,
        run: &Run,
        request: &SyncRequest,
        status: ExecutionStatus,
        error: Option<String>,
        failed_phase: Option<SyncPhase>,
    ) -> ExecutionRecord {
        let finished = status != ExecutionStatus::Running;
        let result = match finished {
            true => match serde_json::to_value(&run.result) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(execution_id = %run.execution_id, error = %e, "failed to serialize result");
                    None
                }
            },
            false => None,
        };

        ExecutionRecord {
            id: run.execution_id,
            task_id: request.task_id.clone(),
            execution_type: request.execution_type.as_str().to_owned(),
            status,
            target_library_id: request.target_library_id.clone(),
            target_interface_id: request.target_interface_id.clone(),
            started_at: run.started_at,
            finished_at: finished.then(Utc::now),
            duration_ms: finished.then(|| run.clock.elapsed().as_millis() as i64),
            failed_phase: failed_phase.map(|p| p.as_str().to_owned()),
            error,
            result,
        }
    }

    fn target_interface(&self, request: &SyncRequest) -> Result<InterfaceMeta, ConfigError> {
        let target = self
            .catalog
            .interface(&request.target_library_id, &request.target_interface_id)
            .ok_or_else(|| ConfigError::UnknownTarget {
                library_id: request.target_library_id.clone(),
                interface_id: request.target_interface_id.clone(),
            })?;

        if target.fields.is_empty() {
            return Err(ConfigError::NoTargetFields(target.interface_id));
        }
        Ok(target)
    }

    async fn execute(&self, run: &mut Run, request: &SyncRequest) -> Result<(), SyncError> {
        // initialize
        self.start(run, SyncPhase::Initialize)?;
        let config = SyncConfig::from_request(request)?;
        let target = self.target_interface(request)?;
        validate_mapping(&config.field_mapping, &target)?;
        let mut governance = GovernanceEngine::new(&config.governance)?;
        let aggregation = AggregationEngine::new(
            config
                .aggregation
                .clone()
                .unwrap_or_else(|| AggregationConfig::default_for(&target.primary_key())),
        );
        let writer = DataWriter::new(self.target.as_ref(), &target)?
            .with_batch_size(self.settings.write_batch_size)
            .with_delete_batch_size(self.settings.delete_batch_size);
        let strategy = strategy_for(config.sync_mode);

        self.executions
            .begin_execution(&self.execution_record(
                run,
                request,
                ExecutionStatus::Running,
                None,
                None,
            ))
            .await
            .map_err(SyncError::Bookkeeping)?;
        run.recorded = true;
        run.finish(
            config.sources.len(),
            0,
            format!(
                "{} source(s), {} sync into {}",
                config.sources.len(),
                config.sync_mode.as_str(),
                writer.table()
            ),
        );

        // data_fetch
        self.start(run, SyncPhase::DataFetch)?;
        let fetcher = SourceFetcher::new(
            self.catalog.as_ref(),
            self.source.as_ref(),
            self.target.as_ref(),
            &self.settings.fetch,
        );
        let fetched = fetcher
            .fetch(&config.sources, &target, &config.field_mapping)
            .await?;
        run.result.source_record_count = fetched.total;
        run.result.watermarks = fetched.watermarks;
        run.finish(fetched.total, 0, format!("fetched {} record(s)", fetched.total));

        // aggregation
        self.start(run, SyncPhase::Aggregation)?;
        let aggregated = aggregation.aggregate(fetched.records)?;
        let mut records = aggregated.records;
        run.finish(
            records.len(),
            0,
            format!(
                "{} strategy produced {} record(s), {} matched pair(s)",
                aggregation.config().strategy.as_str(),
                records.len(),
                aggregated.statistics.matched_pairs
            ),
        );
        run.result.aggregation = Some(aggregated.statistics);

        // governance
        self.start(run, SyncPhase::Governance)?;
        let governed = governance.apply(records.iter().map(|r| r.data().clone()).collect())?;
        let report = governed.result;
        for (record, data) in records.iter_mut().zip(governed.records) {
            record.info.data = data;
            record.steps.push(TransformationStep::new(
                "governance",
                format!("quality score {:.2}", report.overall_score),
            ));
        }
        metrics::gauge!(QUALITY_SCORE).set(report.overall_score);
        run.result.quality_score = report.overall_score;
        run.result.governance = Some(GovernanceSummary {
            quality_score: report.overall_score,
            issue_count: report.issues.len(),
            validation_error_count: report.validation_error_count,
            cleansing_applied_count: report.cleansing_applied_count,
            masked_count: report.masked_count,
            compliance_status: report.compliance_status,
            recommendations: report.recommendations.clone(),
        });
        run.finish(
            report.processed_count,
            report.validation_error_count,
            format!(
                "quality score {:.2}, {} issue(s)",
                report.overall_score,
                report.issues.len()
            ),
        );

        // data_write
        self.start(run, SyncPhase::DataWrite)?;
        let mapper = FieldMapper::new(&target, &config.field_mapping);
        let mapped = mapper.map_records(records.iter().map(|r| r.data()));
        // Rejected records still exist at the source, so full sync must not delete their rows.
        let protected: Vec<Vec<String>> = mapped
            .rejected
            .iter()
            .filter_map(|rejected| mapper.primary_key(records[rejected.index].data()))
            .collect();
        let mut prepared = writer.prepare(mapped.records);
        prepared.protected = protected;
        let rejected = mapped.rejected.len() + prepared.rejected.len();
        if rejected > 0 {
            metrics::counter!(RECORDS_REJECTED).increment(rejected as u64);
        }

        let written = strategy.sync(&writer, &prepared).await?;
        run.result.processed_record_count = prepared.len();
        run.result.inserted_record_count = written.inserted;
        run.result.updated_record_count = written.updated;
        run.result.deleted_record_count = written.deleted;
        run.result.error_record_count = rejected;
        run.finish(
            prepared.len(),
            rejected,
            format!(
                "{} inserted, {} updated, {} deleted, {} rejected",
                written.inserted,
                written.updated,
                written.deleted,
                rejected
            ),
        );

        // lineage
        self.start(run, SyncPhase::Lineage)?;
        let lineage: Vec<WrittenRecord> = prepared
            .rows
            .iter()
            .zip(&prepared.keys)
            .enumerate()
            .map(|(i, (row, key))| {
                let source = &records[row.index];
                let mut steps = source.steps.clone();
                steps.push(TransformationStep::new(
                    "field_mapping",
                    format!("mapped onto {}", target.interface_id),
                ));
                steps.push(TransformationStep::new(
                    "write",
                    format!("{} upsert into {}", strategy.mode().as_str(), writer.table()),
                ));

                WrittenRecord {
                    target_record_id: match key.is_empty() {
                        true => format!("record_{}", i),
                        false => key.join("_"),
                    },
                    sources: source.sources.clone(),
                    steps,
                    quality_score: report
                        .record_scores
                        .get(row.index)
                        .copied()
                        .unwrap_or(report.overall_score),
                }
            })
            .collect();
        let recorder = LineageRecorder::new(
            self.executions.as_ref(),
            run.execution_id,
            &request.target_library_id,
            &request.target_interface_id,
        )
        .with_batch_size(self.settings.lineage_batch_size);
        run.result.lineage_record_count = recorder.record(&lineage).await?;
        run.finish(
            run.result.lineage_record_count,
            0,
            format!("{} lineage record(s)", run.result.lineage_record_count),
        );

        // complete
        self.start(run, SyncPhase::Complete)?;
        run.finish(run.result.processed_record_count, run.result.error_record_count, "sync completed");
        self.executions
            .finish_execution(&self.execution_record(
                run,
                request,
                ExecutionStatus::Success,
                None,
                None,
            ))
            .await
            .map_err(SyncError::Complete)?;

        info!(
            execution_id = %run.execution_id,
            source_records = run.result.source_record_count,
            processed = run.result.processed_record_count,
            rejected = run.result.error_record_count,
            quality_score = run.result.quality_score,
            "sync finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_progress() {
        assert_eq!(SyncPhase::Initialize.progress(), 0.0);
        assert!((SyncPhase::Governance.progress() - 300.0 / 7.0).abs() < 1e-9);
        assert_eq!(SyncPhase::ALL.len(), 7);
        assert_eq!(SyncPhase::DataWrite.as_str(), "data_write");
    }
}
