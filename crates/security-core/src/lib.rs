//! Facade crate wiring every Security Core component into one cohesive API
//! surface: audit ledger, identity, rbac, api keys, sso, teams, threat
//! detection, and compliance reporting.
//!
//! [`SecurityCore::evaluate`] implements the ingress data flow from
//! spec.md §2: resolve an identity, check a permission, record the
//! attempt with the threat detector (which may veto via its block list),
//! and append the decision to the audit ledger — every path through it.

#![forbid(unsafe_code)]

use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

pub use claw_audit::{Actor, AuditEntry, AuditError, AuditLedger, AuditSummary, Decision};
pub use claw_auth::{ApiKeyRecord, ApiKeyStore, AuthError};
pub use claw_compliance::{ComplianceError, ComplianceReporter, PostureReport, SecurityConfig};
pub use claw_identity::{IdentityError, IdentityStore, User};
pub use claw_rbac::{Permission, RbacError, Role, RoleRegistry};
pub use claw_sso::{SsoBroker, SsoConfig, SsoError, SsoProvider, SsoUser};
pub use claw_teams::{Capability, Invitation, Team, TeamError, TeamRegistry, TeamRole};
pub use claw_threat::{ThreatDetector, ThreatDetectorConfig, ThreatError, ThreatEvent, ThreatLevel};

/// A single error type covering every component, for callers that want one
/// propagation path across the whole core.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Rbac(#[from] RbacError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Sso(#[from] SsoError),
    #[error(transparent)]
    Team(#[from] TeamError),
    #[error(transparent)]
    Threat(#[from] ThreatError),
    #[error(transparent)]
    Compliance(#[from] ComplianceError),
}

pub type Result<T> = std::result::Result<T, SecurityError>;

/// The outcome of [`SecurityCore::evaluate`]: whether the request was
/// allowed, and the audit entry recorded for it.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub allowed: bool,
    pub entry: AuditEntry,
    pub threat_event: Option<ThreatEvent>,
}

/// Wires every registry together behind one handle. Each component owns its
/// own synchronization; this struct holds no lock of its own and never
/// holds one component's lock while calling another.
pub struct SecurityCore {
    pub identity: IdentityStore,
    pub roles: RoleRegistry,
    pub api_keys: ApiKeyStore,
    pub sso: SsoBroker,
    pub teams: TeamRegistry,
    pub threat: ThreatDetector,
    pub audit: AuditLedger,
}

impl SecurityCore {
    /// Open every persisted registry rooted at `state_dir`, and the audit
    /// ledger's journal directory at `state_dir/audit`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let audit_dir = state_dir.join("audit");
        Ok(Self {
            identity: IdentityStore::open(state_dir),
            roles: RoleRegistry::open(state_dir),
            api_keys: ApiKeyStore::open(state_dir),
            sso: SsoBroker::new(),
            teams: TeamRegistry::open(state_dir),
            threat: ThreatDetector::default(),
            audit: AuditLedger::open(&audit_dir)?,
        })
    }

    /// The ingress data flow from spec.md §2: resolve `source` against the
    /// threat detector's block list, check the user's role for
    /// `permission`, and append the decision to the audit ledger either
    /// way. Returns the recorded entry regardless of the outcome — a
    /// denial is still a decision, not an error.
    pub fn evaluate(
        &self,
        user: &User,
        permission: Permission,
        action: &str,
        resource: &str,
        source: &str,
        channel: Option<&str>,
    ) -> Result<EvaluationOutcome> {
        if self.threat.is_blocked(source) {
            warn!(user_id = %user.id, source, action, "evaluate vetoed by threat block list");
            let entry = self.audit.append(
                action,
                Actor::User,
                resource,
                Decision::Deny,
                Some("threat_blocklist".to_string()),
                Some(format!("source {source} is on the block list")),
                channel.map(str::to_string),
            )?;
            return Ok(EvaluationOutcome {
                allowed: false,
                entry,
                threat_event: None,
            });
        }

        let threat_event = self.threat.check_rate(&user.id.to_string());

        let allowed = self
            .roles
            .check(&user.role_name, user.active, permission);
        let decision = if allowed { Decision::Allow } else { Decision::Deny };

        let entry = self.audit.append(
            action,
            Actor::User,
            resource,
            decision,
            Some(permission.to_string()),
            None,
            channel.map(str::to_string),
        )?;

        info!(user_id = %user.id, action, permission = %permission, allowed, "evaluate decided");

        Ok(EvaluationOutcome {
            allowed,
            entry,
            threat_event,
        })
    }

    /// A [`ComplianceReporter`] borrowing this core's audit ledger.
    pub fn compliance(&self) -> ComplianceReporter<'_> {
        ComplianceReporter::new(Some(&self.audit))
    }
}
