use serde::{Deserialize, Serialize};

/// Heuristic categories the behavioral analyzer can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    BurstTraffic,
    MissingAssetCorrelation,
    NonHumanNavigation,
    RepeatedIdenticalRequests,
    KnownAutomationSignature,
    MissingBrowserFingerprint,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingKind::BurstTraffic => "burst-traffic",
            FindingKind::MissingAssetCorrelation => "missing-asset-correlation",
            FindingKind::NonHumanNavigation => "non-human-navigation",
            FindingKind::RepeatedIdenticalRequests => "repeated-identical-requests",
            FindingKind::KnownAutomationSignature => "known-automation-signature",
            FindingKind::MissingBrowserFingerprint => "missing-browser-fingerprint",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Weight used when folding findings into a single risk score.
    pub fn weight(self) -> f64 {
        match self {
            Severity::Low => 0.3,
            Severity::Medium => 0.6,
            Severity::High => 0.8,
            Severity::Critical => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// One heuristic match for one request analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspicionFinding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// How certain the heuristic is that this is not a false positive (0–1)
    pub confidence: f64,
    /// How strongly this finding should pull the aggregate score (0–1)
    pub contribution: f64,
    /// Structured evidence for audit (counts, matched signature, ...)
    pub details: serde_json::Value,
}

impl SuspicionFinding {
    pub fn new(
        kind: FindingKind,
        severity: Severity,
        confidence: f64,
        contribution: f64,
        details: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            contribution: contribution.clamp(0.0, 1.0),
            details,
        }
    }
}

/// Fold findings into a single [0,1] risk score: the severity-weighted mean
/// of the triggered findings' contributions. Normalizing by the sum of
/// triggered weights (rather than the count of all possible findings) keeps
/// one near-certain signal able to dominate the score.
pub fn risk_score(findings: &[SuspicionFinding]) -> f64 {
    if findings.is_empty() {
        return 0.0;
    }
    let mut weighted = 0.0;
    let mut weights = 0.0;
    for finding in findings {
        let weight = finding.severity.weight();
        weighted += weight * finding.contribution;
        weights += weight;
    }
    if weights <= 0.0 {
        return 0.0;
    }
    (weighted / weights).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finding(severity: Severity, contribution: f64) -> SuspicionFinding {
        SuspicionFinding::new(
            FindingKind::BurstTraffic,
            severity,
            0.9,
            contribution,
            json!({}),
        )
    }

    #[test]
    fn empty_findings_score_zero() {
        assert_eq!(risk_score(&[]), 0.0);
    }

    #[test]
    fn single_full_contribution_scores_one() {
        let findings = vec![finding(Severity::Critical, 1.0)];
        assert!((risk_score(&findings) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn weighted_mean_matches_hand_computation() {
        // high 0.8 * 1.0 + medium 0.6 * 0.5 over weights 1.4
        let findings = vec![finding(Severity::High, 1.0), finding(Severity::Medium, 0.5)];
        let expected = (0.8 + 0.3) / 1.4;
        assert!((risk_score(&findings) - expected).abs() < 1e-9);
    }

    #[test]
    fn low_severity_noise_dilutes_less_than_plain_mean_would() {
        let findings = vec![finding(Severity::High, 1.0), finding(Severity::Low, 0.1)];
        // plain mean of weighted terms would be (0.8 + 0.03) / 2 = 0.415
        assert!(risk_score(&findings) > 0.7);
    }

    #[test]
    fn contribution_and_confidence_are_clamped() {
        let finding = SuspicionFinding::new(
            FindingKind::KnownAutomationSignature,
            Severity::High,
            1.7,
            -0.5,
            json!({}),
        );
        assert_eq!(finding.confidence, 1.0);
        assert_eq!(finding.contribution, 0.0);
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let value = serde_json::to_value(FindingKind::MissingAssetCorrelation).unwrap();
        assert_eq!(value, json!("missing-asset-correlation"));
    }
}
