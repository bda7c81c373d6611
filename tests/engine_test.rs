//! 引擎协议无关部分测试: 进度合成、严重级别与评级

use proptest::prelude::*;
use scan_pool::engine::{
    cvss_score, Alert, ProgressReport, RiskGrade, ScanPhase, ScanResult, ScanStatus, Severity,
    SeverityCounts,
};
use test_utils::alert;

mod progress {
    use super::*;

    #[test]
    fn test_blend_weights_phases() {
        let report = ProgressReport::blend(100, 50);
        assert_eq!(report.percent, 65);
        assert_eq!(report.phase, ScanPhase::Attack);
        assert_eq!(report.status, ScanStatus::Running);
    }

    #[test]
    fn test_blend_completed_only_when_both_done() {
        let done = ProgressReport::blend(100, 100);
        assert_eq!(done.percent, 100);
        assert_eq!(done.status, ScanStatus::Completed);
        assert_eq!(done.phase, ScanPhase::Done);

        let discovering = ProgressReport::blend(40, 0);
        assert_eq!(discovering.percent, 12);
        assert_eq!(discovering.phase, ScanPhase::Discovery);
        assert_eq!(discovering.status, ScanStatus::Running);
    }

    #[test]
    fn test_blend_error_sentinel_fails() {
        assert_eq!(ProgressReport::blend(-1, 0).status, ScanStatus::Failed);
        assert_eq!(ProgressReport::blend(100, -1).status, ScanStatus::Failed);
    }
}

mod grading {
    use super::*;

    fn counts(critical: u32, high: u32, medium: u32, low: u32) -> SeverityCounts {
        SeverityCounts {
            critical,
            high,
            medium,
            low,
            info: 0,
        }
    }

    #[test]
    fn test_risk_grade_table() {
        assert_eq!(RiskGrade::from_counts(&counts(1, 0, 0, 0)), RiskGrade::F);
        assert_eq!(RiskGrade::from_counts(&counts(0, 3, 0, 0)), RiskGrade::D);
        assert_eq!(RiskGrade::from_counts(&counts(0, 1, 0, 0)), RiskGrade::C);
        assert_eq!(RiskGrade::from_counts(&counts(0, 0, 5, 0)), RiskGrade::C);
        assert_eq!(RiskGrade::from_counts(&counts(0, 0, 1, 0)), RiskGrade::B);
        assert_eq!(RiskGrade::from_counts(&counts(0, 0, 0, 10)), RiskGrade::B);
        assert_eq!(RiskGrade::from_counts(&counts(0, 0, 0, 9)), RiskGrade::A);
        assert_eq!(RiskGrade::from_counts(&SeverityCounts::default()), RiskGrade::A);
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(Severity::from_engine_risk("High"), Severity::High);
        assert_eq!(Severity::from_engine_risk("Medium"), Severity::Medium);
        assert_eq!(Severity::from_engine_risk("Low"), Severity::Low);
        assert_eq!(Severity::from_engine_risk("Informational"), Severity::Info);
        assert_eq!(Severity::from_engine_risk("Bogus"), Severity::Low);
    }

    #[test]
    fn test_cvss_estimate() {
        assert_eq!(cvss_score(Severity::High, "High"), 7.0);
        assert_eq!(cvss_score(Severity::High, "Medium"), 6.3);
        assert_eq!(cvss_score(Severity::Medium, "Low"), 4.0);
        assert_eq!(cvss_score(Severity::Info, "Unknown"), 0.9);
    }

    #[test]
    fn test_result_from_alerts() {
        let alerts = vec![
            alert("High", "High"),
            alert("Medium", "Medium"),
            alert("Informational", "Low"),
            Alert::default(),
        ];
        let result = ScanResult::from_alerts("https://example.com", alerts);

        assert_eq!(result.total_findings(), 4);
        assert_eq!(result.severity_counts.high, 1);
        assert_eq!(result.severity_counts.medium, 1);
        assert_eq!(result.severity_counts.low, 1);
        assert_eq!(result.severity_counts.info, 1);
        assert_eq!(result.risk_grade, RiskGrade::C);

        let untitled = &result.findings[3];
        assert_eq!(untitled.title, "Unknown Vulnerability");
        assert_eq!(untitled.affected_url, "https://example.com");
        assert_eq!(untitled.method, "GET");
    }

    #[test]
    fn test_alert_wire_names() {
        let raw = r#"{"name":"XSS","risk":"High","confidence":"Medium","cweid":"79","pluginId":"40012"}"#;
        let alert: Alert = serde_json::from_str(raw).unwrap();
        assert_eq!(alert.cwe_id.as_deref(), Some("79"));
        assert_eq!(alert.plugin_id.as_deref(), Some("40012"));
        assert!(alert.url.is_none());
    }
}

proptest! {
    #[test]
    fn test_blend_percent_bounded(d in -1i32..=100, a in -1i32..=100) {
        let report = ProgressReport::blend(d, a);
        prop_assert!(report.percent <= 100);
        if d >= 0 && a >= 0 && d < 100 {
            prop_assert_eq!(report.status, ScanStatus::Running);
        }
    }

    #[test]
    fn test_counts_total_matches_records(sev in proptest::collection::vec(0usize..5, 0..40)) {
        let all = [Severity::Critical, Severity::High, Severity::Medium, Severity::Low, Severity::Info];
        let mut counts = SeverityCounts::default();
        for s in &sev {
            counts.record(all[*s]);
        }
        prop_assert_eq!(counts.total() as usize, sev.len());
    }
}
