pub const SYNC_RUNS: &str = "sync_runs_total";
pub const PHASE_DURATION_MS: &str = "sync_phase_duration_ms";
pub const RECORDS_FETCHED: &str = "sync_records_fetched";
pub const RECORDS_WRITTEN: &str = "sync_records_written";
pub const RECORDS_DELETED: &str = "sync_records_deleted";
pub const RECORDS_REJECTED: &str = "sync_records_rejected";
pub const WRITE_BATCH_MS: &str = "sync_write_batch_ms";
pub const QUALITY_SCORE: &str = "sync_quality_score";
