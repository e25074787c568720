//! Security posture scoring and compliance evidence derivation.
//!
//! Pure derivation over a [`SecurityConfig`] snapshot and (optionally) an
//! attached [`claw_audit::AuditLedger`]. Nothing here mutates core state —
//! every report is a read-only synthesis of what the other components
//! already recorded.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use claw_audit::AuditLedger;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("audit ledger error: {0}")]
    Audit(#[from] claw_audit::AuditError),
    #[error("report io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("report serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ComplianceError>;

/// The closed configuration dictionary the reporter derives posture from
/// (spec.md §6). `encryption_at_rest` is not a field: it is always reported
/// `true`. `loopback_only` is derived from `gateway_host`, not stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub gateway_host: String,
    pub sandbox_enabled: bool,
    pub policy_engine_enabled: bool,
    pub canary_tokens_enabled: bool,
    pub egress_filtering_enabled: bool,
    pub audit_logging_enabled: bool,
    pub skill_signature_required: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            gateway_host: "127.0.0.1".to_string(),
            sandbox_enabled: true,
            policy_engine_enabled: true,
            canary_tokens_enabled: true,
            egress_filtering_enabled: true,
            audit_logging_enabled: true,
            skill_signature_required: true,
        }
    }
}

impl SecurityConfig {
    fn loopback_only(&self) -> bool {
        self.gateway_host == "127.0.0.1"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwaspStatus {
    Compliant,
    Partial,
    NonCompliant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwaspCheck {
    pub id: &'static str,
    pub title: &'static str,
    pub status: OwaspStatus,
    pub mitigation: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwaspReport {
    pub score: String,
    pub checks: Vec<OwaspCheck>,
}

fn owasp_compliance(config: &SecurityConfig) -> OwaspReport {
    let compliant = |b: bool| {
        if b {
            OwaspStatus::Compliant
        } else {
            OwaspStatus::NonCompliant
        }
    };

    let checks = vec![
        OwaspCheck {
            id: "ASI01",
            title: "Goal hijack / instruction injection",
            status: compliant(config.canary_tokens_enabled),
            mitigation: "Canary tokens, task-consistency checks, input sanitization",
        },
        OwaspCheck {
            id: "ASI02",
            title: "Tool misuse",
            status: compliant(config.policy_engine_enabled),
            mitigation: "Policy engine evaluates every tool call before execution",
        },
        OwaspCheck {
            id: "ASI03",
            title: "Identity abuse",
            status: OwaspStatus::Compliant,
            mitigation: "Scrypt-hashed credentials, per-tool scoped permissions, session isolation",
        },
        OwaspCheck {
            id: "ASI04",
            title: "Supply chain compromise",
            status: compliant(config.skill_signature_required),
            mitigation: "Skill signature verification required before install",
        },
        OwaspCheck {
            id: "ASI05",
            title: "Arbitrary code execution",
            status: compliant(config.sandbox_enabled),
            mitigation: "Mandatory sandboxed tool execution with resource limits",
        },
        OwaspCheck {
            id: "ASI06",
            title: "Memory / context poisoning",
            status: OwaspStatus::Compliant,
            mitigation: "Hash-chained audit ledger detects tampering with recorded state",
        },
        OwaspCheck {
            id: "ASI07",
            title: "Inter-agent communication abuse",
            status: OwaspStatus::Partial,
            mitigation: "Single-core deployment today; signed inter-agent messaging planned",
        },
        OwaspCheck {
            id: "ASI08",
            title: "Cascading failures",
            status: OwaspStatus::Compliant,
            mitigation: "Rate limiting and sliding-window threat detection bound blast radius",
        },
        OwaspCheck {
            id: "ASI09",
            title: "Human trust exploitation",
            status: OwaspStatus::Compliant,
            mitigation: "ask_user decisions recorded in the audit ledger for high-risk actions",
        },
        OwaspCheck {
            id: "ASI10",
            title: "Rogue agents",
            status: compliant(config.policy_engine_enabled),
            mitigation: "Policy engine guardrails plus behavioral anomaly detection",
        },
    ];

    let compliant_count = checks
        .iter()
        .filter(|c| c.status == OwaspStatus::Compliant)
        .count();

    OwaspReport {
        score: format!("{compliant_count}/10"),
        checks,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationSection {
    pub gateway_binding: String,
    pub sandbox_enabled: bool,
    pub policy_engine_enabled: bool,
    pub canary_tokens_enabled: bool,
    pub egress_filtering_enabled: bool,
    pub audit_logging_enabled: bool,
    pub skill_signatures_required: bool,
    pub encryption_at_rest: bool,
    pub loopback_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditIntegritySection {
    pub chain_valid: bool,
    pub last_verified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostureReport {
    pub report_type: &'static str,
    pub generated_at: DateTime<Utc>,
    pub version: &'static str,
    pub configuration: ConfigurationSection,
    pub audit_integrity: Option<AuditIntegritySection>,
    pub owasp_agentic: OwaspReport,
    pub score: u32,
    pub grade: char,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Soc2Control {
    pub description: &'static str,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Soc2Report {
    pub report_type: &'static str,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub controls: Vec<(&'static str, Soc2Control)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoControl {
    pub title: &'static str,
    pub mapping: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iso27001Report {
    pub report_type: &'static str,
    pub generated_at: DateTime<Utc>,
    pub controls: Vec<(&'static str, IsoControl)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentTimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub action: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentDetail {
    pub incident_type: String,
    pub severity: String,
    pub description: String,
    pub status: &'static str,
    pub timeline: Vec<IncidentTimelineEntry>,
    pub affected_systems: Vec<String>,
    pub mitigation: String,
    pub root_cause: String,
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentReport {
    pub report_type: &'static str,
    pub generated_at: DateTime<Utc>,
    pub incident: IncidentDetail,
}

/// Weighted scoring contribution of each toggle (spec.md §4.8).
const SANDBOX_POINTS: u32 = 10;
const POLICY_ENGINE_POINTS: u32 = 10;
const CANARY_POINTS: u32 = 8;
const EGRESS_POINTS: u32 = 8;
const AUDIT_LOGGING_POINTS: u32 = 8;
const SKILL_SIGNATURE_POINTS: u32 = 8;
const ENCRYPTION_POINTS: u32 = 8;
const LOOPBACK_POINTS: u32 = 10;
const CHAIN_VALID_POINTS: u32 = 15;
const OWASP_MAX_POINTS: u32 = 15;

fn calculate_score(
    config: &ConfigurationSection,
    audit: &Option<AuditIntegritySection>,
    owasp: &OwaspReport,
) -> u32 {
    let mut score = 0u32;

    if config.sandbox_enabled {
        score += SANDBOX_POINTS;
    }
    if config.policy_engine_enabled {
        score += POLICY_ENGINE_POINTS;
    }
    if config.canary_tokens_enabled {
        score += CANARY_POINTS;
    }
    if config.egress_filtering_enabled {
        score += EGRESS_POINTS;
    }
    if config.audit_logging_enabled {
        score += AUDIT_LOGGING_POINTS;
    }
    if config.skill_signatures_required {
        score += SKILL_SIGNATURE_POINTS;
    }
    if config.encryption_at_rest {
        score += ENCRYPTION_POINTS;
    }
    if config.loopback_only {
        score += LOOPBACK_POINTS;
    }
    if audit.as_ref().is_some_and(|a| a.chain_valid) {
        score += CHAIN_VALID_POINTS;
    }

    let compliant: u32 = owasp
        .score
        .split('/')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    score += (compliant * OWASP_MAX_POINTS) / 10;

    score.min(100)
}

fn score_to_grade(score: u32) -> char {
    if score >= 90 {
        'A'
    } else if score >= 80 {
        'B'
    } else if score >= 70 {
        'C'
    } else if score >= 60 {
        'D'
    } else {
        'F'
    }
}

/// Derives posture, SOC 2, ISO 27001, and incident reports from a
/// [`SecurityConfig`] snapshot and an optional attached audit ledger.
pub struct ComplianceReporter<'a> {
    audit_ledger: Option<&'a AuditLedger>,
}

impl<'a> ComplianceReporter<'a> {
    pub fn new(audit_ledger: Option<&'a AuditLedger>) -> Self {
        Self { audit_ledger }
    }

    /// Security posture summary: configuration echo, audit chain validity
    /// (if a ledger is attached), OWASP Agentic Top 10 mapping, and an
    /// overall score/grade.
    pub fn generate_security_posture(&self, config: &SecurityConfig) -> Result<PostureReport> {
        let configuration = ConfigurationSection {
            gateway_binding: config.gateway_host.clone(),
            sandbox_enabled: config.sandbox_enabled,
            policy_engine_enabled: config.policy_engine_enabled,
            canary_tokens_enabled: config.canary_tokens_enabled,
            egress_filtering_enabled: config.egress_filtering_enabled,
            audit_logging_enabled: config.audit_logging_enabled,
            skill_signatures_required: config.skill_signature_required,
            encryption_at_rest: true,
            loopback_only: config.loopback_only(),
        };

        let audit_integrity = match self.audit_ledger {
            Some(ledger) => {
                let (chain_valid, _) = ledger.verify(None)?;
                Some(AuditIntegritySection {
                    chain_valid,
                    last_verified: Utc::now(),
                })
            }
            None => None,
        };

        let owasp_agentic = owasp_compliance(config);
        let score = calculate_score(&configuration, &audit_integrity, &owasp_agentic);
        let grade = score_to_grade(score);

        Ok(PostureReport {
            report_type: "security_posture",
            generated_at: Utc::now(),
            version: "1.0",
            configuration,
            audit_integrity,
            owasp_agentic,
            score,
            grade,
        })
    }

    /// SOC 2 Type II evidence collection for the `days` prior to now.
    pub fn generate_soc2_evidence(&self, days: i64) -> Soc2Report {
        let now = Utc::now();
        let period_start = now - chrono::Duration::days(days);

        let controls = vec![
            (
                "CC6.1",
                Soc2Control {
                    description: "Logical and physical access controls",
                    evidence: [
                        "Scrypt-hashed credentials required for all interactive users",
                        "Loopback-only binding by default (127.0.0.1)",
                        "Opaque API keys with expiry and per-user revocation",
                        "User authorization resolved via channel-specific external ids",
                    ]
                    .map(str::to_string)
                    .to_vec(),
                },
            ),
            (
                "CC6.6",
                Soc2Control {
                    description: "Security measures against threats from outside system boundaries",
                    evidence: [
                        "Sliding-window brute-force detection with automatic source blocking",
                        "Rate limiting on every authenticated request",
                        "Privilege-escalation indicator matching on tool arguments",
                        "Data exfiltration volume thresholds on data access",
                    ]
                    .map(str::to_string)
                    .to_vec(),
                },
            ),
            (
                "CC7.2",
                Soc2Control {
                    description: "The entity monitors system components and operations",
                    evidence: vec![
                        "Hash-chained, tamper-evident audit ledger for every authorization decision"
                            .to_string(),
                        "Real-time threat event stream with level and category filtering".to_string(),
                        "Behavioral baseline tracking per user".to_string(),
                        format!("Audit chain integrity verified (last {days} days)"),
                    ],
                },
            ),
            (
                "CC8.1",
                Soc2Control {
                    description: "The entity manages changes to infrastructure and software",
                    evidence: [
                        "Role registry restricts custom roles to the fixed permission catalog",
                        "System roles are immutable and undeletable",
                        "Team ownership transfer is atomic (old owner, new owner, pointer together)",
                    ]
                    .map(str::to_string)
                    .to_vec(),
                },
            ),
        ];

        Soc2Report {
            report_type: "soc2_evidence",
            period_start,
            period_end: now,
            generated_at: now,
            controls,
        }
    }

    /// ISO 27001 Annex A control mapping.
    pub fn generate_iso27001_mapping(&self) -> Iso27001Report {
        let controls = vec![
            (
                "A.5",
                IsoControl {
                    title: "Information security policies",
                    mapping: "Security-first configuration defaults (SecurityConfig)",
                },
            ),
            (
                "A.6",
                IsoControl {
                    title: "Organization of information security",
                    mapping: "Role-based access control with system and custom roles",
                },
            ),
            (
                "A.8",
                IsoControl {
                    title: "Asset management",
                    mapping: "Identity, team, and API key registries; audit ledger inventory",
                },
            ),
            (
                "A.9",
                IsoControl {
                    title: "Access control",
                    mapping: "Scrypt password auth, RBAC, channel-based identity resolution, API keys",
                },
            ),
            (
                "A.10",
                IsoControl {
                    title: "Cryptography",
                    mapping: "Scrypt key derivation, SHA-256 hash-chained audit ledger",
                },
            ),
            (
                "A.12",
                IsoControl {
                    title: "Operations security",
                    mapping: "Sandbox, policy engine, and egress filtering toggles surfaced in posture",
                },
            ),
            (
                "A.14",
                IsoControl {
                    title: "System acquisition, development and maintenance",
                    mapping: "Skill signature requirement surfaced in posture and OWASP mapping",
                },
            ),
            (
                "A.16",
                IsoControl {
                    title: "Information security incident management",
                    mapping: "Tamper-evident audit logs, threat event stream, incident report template",
                },
            ),
            (
                "A.18",
                IsoControl {
                    title: "Compliance",
                    mapping: "This report, SOC 2 evidence, OWASP Agentic Top 10 compliance",
                },
            ),
        ];

        Iso27001Report {
            report_type: "iso27001_mapping",
            generated_at: Utc::now(),
            controls,
        }
    }

    /// A templated incident record with one timeline entry stamped at
    /// generation time.
    pub fn generate_incident_report(
        &self,
        incident_type: &str,
        description: &str,
        severity: &str,
    ) -> IncidentReport {
        let now = Utc::now();
        IncidentReport {
            report_type: "incident",
            generated_at: now,
            incident: IncidentDetail {
                incident_type: incident_type.to_string(),
                severity: severity.to_string(),
                description: description.to_string(),
                status: "investigating",
                timeline: vec![IncidentTimelineEntry {
                    timestamp: now,
                    action: "Incident detected and report generated",
                }],
                affected_systems: Vec::new(),
                mitigation: String::new(),
                root_cause: String::new(),
                resolution: String::new(),
            },
        }
    }

    /// Pretty-print a serializable report to `path`, creating parent
    /// directories as needed.
    pub fn export_report<T: Serialize>(&self, report: &T, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "compliance report exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claw_audit::{Actor, Decision};

    #[test]
    fn full_on_configuration_scores_high() {
        let config = SecurityConfig::default();
        let reporter = ComplianceReporter::new(None);
        let report = reporter.generate_security_posture(&config).unwrap();
        // Without an attached ledger, chain-valid (15) and the partial
        // ASI07 OWASP check keep this just shy of 100/"A", matching
        // scenario 6's "score >= 80, grade in {A, B}".
        assert!(report.score >= 80);
        assert!(matches!(report.grade, 'A' | 'B'));
    }

    #[test]
    fn all_off_configuration_scores_low() {
        let config = SecurityConfig {
            gateway_host: "0.0.0.0".to_string(),
            sandbox_enabled: false,
            policy_engine_enabled: false,
            canary_tokens_enabled: false,
            egress_filtering_enabled: false,
            audit_logging_enabled: false,
            skill_signature_required: false,
        };
        let reporter = ComplianceReporter::new(None);
        let report = reporter.generate_security_posture(&config).unwrap();
        assert!(report.score < 50);
        assert!(matches!(report.grade, 'D' | 'F'));
    }

    #[test]
    fn valid_chain_and_full_config_scores_perfect() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = AuditLedger::open(dir.path()).unwrap();
        ledger
            .append("read", Actor::User, "/a", Decision::Allow, None, None, None)
            .unwrap();

        let config = SecurityConfig::default();
        let reporter = ComplianceReporter::new(Some(&ledger));
        let report = reporter.generate_security_posture(&config).unwrap();

        // Every weighted toggle on, loopback, valid chain — only ASI07's
        // "partial" keeps OWASP below a perfect 10/10, so this lands at 97/A
        // rather than exactly 100, still within the spec's "score>=90, A".
        assert!(report.score >= 90);
        assert_eq!(report.grade, 'A');
        assert!(report.audit_integrity.unwrap().chain_valid);
    }

    #[test]
    fn owasp_partial_check_is_not_compliant() {
        let config = SecurityConfig::default();
        let owasp = owasp_compliance(&config);
        let asi07 = owasp.checks.iter().find(|c| c.id == "ASI07").unwrap();
        assert_eq!(asi07.status, OwaspStatus::Partial);
        assert_ne!(owasp.score, "10/10");
    }

    #[test]
    fn scoring_formula_reaches_100_with_every_weight_maxed() {
        // The live OWASP table can never report 10/10 (ASI07 is always
        // partial), so this exercises the weighted formula itself directly,
        // matching the testable property "all seven toggles + loopback +
        // valid chain + OWASP 10/10 => score 100, grade A".
        let config = ConfigurationSection {
            gateway_binding: "127.0.0.1".to_string(),
            sandbox_enabled: true,
            policy_engine_enabled: true,
            canary_tokens_enabled: true,
            egress_filtering_enabled: true,
            audit_logging_enabled: true,
            skill_signatures_required: true,
            encryption_at_rest: true,
            loopback_only: true,
        };
        let audit = Some(AuditIntegritySection {
            chain_valid: true,
            last_verified: Utc::now(),
        });
        let owasp = OwaspReport {
            score: "10/10".to_string(),
            checks: Vec::new(),
        };
        let score = calculate_score(&config, &audit, &owasp);
        assert_eq!(score, 100);
        assert_eq!(score_to_grade(score), 'A');
    }

    #[test]
    fn soc2_evidence_covers_fixed_controls() {
        let reporter = ComplianceReporter::new(None);
        let report = reporter.generate_soc2_evidence(90);
        let ids: Vec<&str> = report.controls.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec!["CC6.1", "CC6.6", "CC7.2", "CC8.1"]);
    }

    #[test]
    fn iso_mapping_covers_fixed_annex_controls() {
        let reporter = ComplianceReporter::new(None);
        let report = reporter.generate_iso27001_mapping();
        assert_eq!(report.controls.len(), 9);
    }

    #[test]
    fn incident_report_starts_investigating() {
        let reporter = ComplianceReporter::new(None);
        let report = reporter.generate_incident_report(
            "brute_force",
            "Repeated failed auth from a single source",
            "high",
        );
        assert_eq!(report.incident.status, "investigating");
        assert_eq!(report.incident.timeline.len(), 1);
    }

    #[test]
    fn export_report_writes_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("posture.json");
        let reporter = ComplianceReporter::new(None);
        let report = reporter
            .generate_security_posture(&SecurityConfig::default())
            .unwrap();
        reporter.export_report(&report, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"report_type\""));
        let parsed: PostureReport = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.score, report.score);
    }
}
