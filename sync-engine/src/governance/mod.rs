//! Data governance: cleansing, quality scoring, masking and compliance.
pub mod cleansing;
pub mod issues;
pub mod privacy;
pub mod quality;
pub mod recommend;
pub mod validator;

use serde::{Deserialize, Serialize};
use sync_common::record::Record;
use tracing::{info, warn};

use crate::error::{ConfigError, GovernanceError};
use cleansing::{CleansingEngine, CleansingRule, Severity};
use issues::{QualityIssue, QualityStatistics};
use privacy::{check_compliance, ComplianceFramework, ComplianceReport, PrivacyEngine, PrivacyRule};
use quality::{checker_for, QualityRule, QualityRuleResult};
use recommend::{recommend, Recommendation};
use validator::PatternCache;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GovernanceConfig {
    pub enable_quality_check: bool,
    pub enable_cleansing: bool,
    pub enable_masking: bool,
    pub stop_on_quality_failure: bool,
    /// Minimum overall score. Values up to 1 are read as fractions.
    pub quality_threshold: f64,
    pub cleansing_rules: Vec<CleansingRule>,
    pub quality_rules: Vec<QualityRule>,
    #[serde(alias = "masking_rules")]
    pub privacy_rules: Vec<PrivacyRule>,
    /// Defaults to `enable_masking`.
    pub compliance_check: Option<bool>,
    pub compliance_framework: ComplianceFramework,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            enable_quality_check: true,
            enable_cleansing: true,
            enable_masking: false,
            stop_on_quality_failure: false,
            quality_threshold: 80.0,
            cleansing_rules: vec![],
            quality_rules: vec![],
            privacy_rules: vec![],
            compliance_check: None,
            compliance_framework: ComplianceFramework::default(),
        }
    }
}

impl GovernanceConfig {
    pub fn threshold(&self) -> f64 {
        match self.quality_threshold <= 1.0 {
            true => self.quality_threshold * 100.0,
            false => self.quality_threshold,
        }
    }

    pub fn compliance_enabled(&self) -> bool {
        self.compliance_check.unwrap_or(self.enable_masking)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    NonCompliant,
}

#[derive(Debug, Clone, Serialize)]
pub struct GovernanceResult {
    pub overall_score: f64,
    pub processed_count: usize,
    pub cleansing_applied_count: usize,
    pub masked_count: usize,
    pub validation_error_count: usize,
    pub rule_results: Vec<QualityRuleResult>,
    pub issues: Vec<QualityIssue>,
    pub statistics: QualityStatistics,
    pub recommendations: Vec<Recommendation>,
    pub compliance_report: Option<ComplianceReport>,
    pub compliance_status: ComplianceStatus,
    /// Quality of each output record, in input order.
    pub record_scores: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct GovernanceOutcome {
    pub records: Vec<Record>,
    pub result: GovernanceResult,
}

pub struct GovernanceEngine {
    config: GovernanceConfig,
    cleansing: CleansingEngine,
    quality_rules: Vec<QualityRule>,
    patterns: PatternCache,
    privacy: PrivacyEngine,
}

impl GovernanceEngine {
    /// Compiles every rule pattern up front, so a bad pattern fails before any data moves.
    pub fn new(config: &GovernanceConfig) -> Result<Self, ConfigError> {
        let cleansing = CleansingEngine::new(&config.cleansing_rules)?;

        let quality_rules: Vec<QualityRule> = config
            .quality_rules
            .iter()
            .filter(|rule| rule.is_enabled)
            .cloned()
            .collect();
        let mut patterns = PatternCache::default();
        for rule in &quality_rules {
            rule.compile(&mut patterns)?;
        }

        Ok(Self {
            config: config.clone(),
            cleansing,
            quality_rules,
            patterns,
            privacy: PrivacyEngine::new(&config.privacy_rules),
        })
    }

    pub fn apply(&mut self, records: Vec<Record>) -> Result<GovernanceOutcome, GovernanceError> {
        if records.is_empty() {
            return Ok(GovernanceOutcome {
                records,
                result: GovernanceResult::empty(),
            });
        }

        let processed_count = records.len();
        let mut records = records;
        let mut cleansing_applied_count = 0;
        let mut error_severity_count = 0;
        let mut validation_error_count = 0;
        let mut cleansing_scores = None;

        if self.config.enable_cleansing && !self.cleansing.is_empty() {
            let mut scores = Vec::with_capacity(records.len());
            for record in records.iter_mut() {
                let cleansed = self.cleansing.cleanse(record);
                if !cleansed.applied_rules.is_empty() {
                    cleansing_applied_count += 1;
                }
                validation_error_count += cleansed.validation_errors.len();
                error_severity_count += cleansed
                    .validation_errors
                    .iter()
                    .filter(|e| e.severity == Severity::Error)
                    .count();
                scores.push(cleansed.quality_score);
                *record = cleansed.record;
            }
            cleansing_scores = Some(scores);
        }

        let mut rule_results = Vec::new();
        let mut issues = Vec::new();
        if self.config.enable_quality_check {
            for rule in &self.quality_rules {
                let (result, found) = checker_for(rule.dimension).check(&records, rule, &self.patterns);
                rule_results.push(result);
                issues.extend(found);
            }
        }

        let statistics = QualityStatistics::calculate(&records, &issues);
        let recommendations = recommend(&rule_results, &issues, &statistics);

        let record_scores: Vec<f64> = match cleansing_scores {
            Some(scores) => scores,
            None => records.iter().map(|r| r.completeness() * 100.0).collect(),
        };
        let overall_score = self.overall_score(&rule_results, &record_scores);

        let threshold = self.config.threshold();
        if overall_score < threshold {
            if self.config.stop_on_quality_failure {
                return Err(GovernanceError::QualityBelowThreshold {
                    score: overall_score,
                    threshold,
                });
            }
            warn!(overall_score, threshold, "quality score below threshold");
        }

        let mut masked_count = 0;
        if self.config.enable_masking && !self.privacy.is_empty() {
            for record in records.iter_mut() {
                let masked = self.privacy.mask_record(record);
                if !masked.log.is_empty() {
                    masked_count += 1;
                }
                *record = masked.record;
            }
        }

        let compliance_report = match self.config.compliance_enabled() {
            true => Some(check_compliance(&records, self.config.compliance_framework)),
            false => None,
        };
        let compliant = error_severity_count == 0
            && compliance_report.as_ref().map_or(true, |r| r.is_compliant);

        info!(
            processed_count,
            cleansing_applied_count,
            masked_count,
            validation_error_count,
            issues = issues.len(),
            overall_score,
            "governance applied"
        );

        Ok(GovernanceOutcome {
            records,
            result: GovernanceResult {
                overall_score,
                processed_count,
                cleansing_applied_count,
                masked_count,
                validation_error_count,
                rule_results,
                issues,
                statistics,
                recommendations,
                compliance_report,
                compliance_status: match compliant {
                    true => ComplianceStatus::Compliant,
                    false => ComplianceStatus::NonCompliant,
                },
                record_scores,
            },
        })
    }

    fn overall_score(&self, rule_results: &[QualityRuleResult], record_scores: &[f64]) -> f64 {
        if !rule_results.is_empty() {
            let (weighted, weights) = self
                .quality_rules
                .iter()
                .zip(rule_results)
                .fold((0.0, 0.0), |(sum, total), (rule, result)| {
                    let weight = rule.effective_weight();
                    (sum + result.score * weight, total + weight)
                });
            return weighted / weights;
        }

        match record_scores.is_empty() {
            true => 100.0,
            false => record_scores.iter().sum::<f64>() / record_scores.len() as f64,
        }
    }
}

impl GovernanceResult {
    fn empty() -> Self {
        Self {
            overall_score: 100.0,
            processed_count: 0,
            cleansing_applied_count: 0,
            masked_count: 0,
            validation_error_count: 0,
            rule_results: vec![],
            issues: vec![],
            statistics: QualityStatistics::default(),
            recommendations: vec![],
            compliance_report: None,
            compliance_status: ComplianceStatus::Compliant,
            record_scores: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> GovernanceConfig {
        serde_json::from_value(value).unwrap()
    }

    fn records(values: Vec<serde_json::Value>) -> Vec<Record> {
        values
            .into_iter()
            .map(|v| Record::from_json(v).unwrap())
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = GovernanceConfig::default();
        assert!(config.enable_quality_check);
        assert!(config.enable_cleansing);
        assert!(!config.compliance_enabled());
        assert_eq!(config.threshold(), 80.0);

        let config = self::config(json!({"enable_masking": true, "quality_threshold": 0.6}));
        assert!(config.compliance_enabled());
        assert_eq!(config.threshold(), 60.0);
    }

    #[test]
    fn test_weighted_rule_score() {
        let mut engine = GovernanceEngine::new(&config(json!({
            "quality_threshold": 0,
            "quality_rules": [
                {"id": "c", "dimension": "completeness", "weight": 3, "target_fields": ["a", "b"]},
                {"id": "u", "dimension": "uniqueness", "weight": 0, "target_fields": ["a"]}
            ]
        })))
        .unwrap();

        let outcome = engine
            .apply(records(vec![json!({"a": 1, "b": null}), json!({"a": 1, "b": 2})]))
            .unwrap();

        // completeness 75 weighted 3, uniqueness 50 weighted 1
        assert_eq!(outcome.result.overall_score, (75.0 * 3.0 + 50.0) / 4.0);
        assert_eq!(outcome.result.rule_results.len(), 2);
        assert_eq!(outcome.result.compliance_status, ComplianceStatus::Compliant);
    }

    #[test]
    fn test_stop_on_quality_failure() {
        let mut engine = GovernanceEngine::new(&config(json!({
            "stop_on_quality_failure": true,
            "quality_threshold": 0.9
        })))
        .unwrap();

        let err = engine
            .apply(records(vec![json!({"a": 1, "b": null})]))
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::QualityBelowThreshold { score, threshold } if score == 50.0 && threshold == 90.0
        ));
    }

    #[test]
    fn test_full_pass_cleanses_then_masks() {
        let mut engine = GovernanceEngine::new(&config(json!({
            "enable_masking": true,
            "cleansing_rules": [
                {"id": "trim", "actions": [{"type": "transform", "field": "phone", "transform": "normalize_phone"}]}
            ],
            "masking_rules": [
                {"id": "m", "field_pattern": "^phone$", "masking_strategy": "partial",
                 "masking_config": {"prefix_length": 3, "suffix_length": 4}}
            ]
        })))
        .unwrap();

        let outcome = engine
            .apply(records(vec![
                json!({"phone": "138-1234-5678"}),
                json!({"phone": "139 0000 1111", "email": "x@y.cn"}),
            ]))
            .unwrap();

        assert_eq!(outcome.records[0].get_str("phone"), Ok("138****5678"));
        assert_eq!(outcome.result.cleansing_applied_count, 2);
        assert_eq!(outcome.result.masked_count, 2);
        assert_eq!(outcome.result.record_scores.len(), 2);

        let report = outcome.result.compliance_report.unwrap();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(outcome.result.compliance_status, ComplianceStatus::NonCompliant);
    }

    #[test]
    fn test_empty_input_scores_full() {
        let mut engine = GovernanceEngine::new(&GovernanceConfig::default()).unwrap();
        let outcome = engine.apply(vec![]).unwrap();
        assert_eq!(outcome.result.overall_score, 100.0);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn test_invalid_quality_pattern() {
        let err = GovernanceEngine::new(&config(json!({
            "quality_rules": [{"id": "p", "dimension": "accuracy",
                               "config": {"check_type": "pattern", "pattern": "(("}}]
        })))
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }
}
