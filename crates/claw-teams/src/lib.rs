//! Teams, memberships, team-role capabilities, invitations, and ownership
//! transfer.
//!
//! Four fixed team roles — owner, admin, member, viewer — each granting a
//! fixed subset of capabilities via a const lookup table. No custom team
//! roles; the matrix is closed.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use claw_persist::JsonStore;
use parking_lot::RwLock;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const INVITE_CODE_LEN: usize = 8;
const INVITE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const DEFAULT_MAX_MEMBERS: usize = 50;

#[derive(Debug, Error)]
pub enum TeamError {
    #[error("team not found: {0}")]
    NotFound(String),
    #[error("user already a member: {0}")]
    AlreadyExists(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("team has reached its member limit")]
    LimitExceeded,
    #[error("invitation invalid or already used")]
    Expired,
}

pub type Result<T> = std::result::Result<T, TeamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl TeamRole {
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "owner" => Ok(Self::Owner),
            "admin" => Ok(Self::Admin),
            "member" => Ok(Self::Member),
            "viewer" => Ok(Self::Viewer),
            other => Err(TeamError::InvalidArgument(format!(
                "invalid team role: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ManageTeam,
    Invite,
    Remove,
    ManageSkills,
    ViewAudit,
    ShareMemory,
    DeleteTeam,
}

/// Fixed owner/admin/member/viewer × capability matrix (spec.md §4.6).
fn grants(role: TeamRole, cap: Capability) -> bool {
    use Capability::*;
    use TeamRole::*;
    matches!(
        (role, cap),
        (Owner, ManageTeam)
            | (Owner, Invite)
            | (Owner, Remove)
            | (Owner, ManageSkills)
            | (Owner, ViewAudit)
            | (Owner, ShareMemory)
            | (Owner, DeleteTeam)
            | (Admin, ManageTeam)
            | (Admin, Invite)
            | (Admin, Remove)
            | (Admin, ManageSkills)
            | (Admin, ViewAudit)
            | (Admin, ShareMemory)
            | (Member, ShareMemory)
            | (Viewer, ViewAudit)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditVisibility {
    Admin,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamSettings {
    pub shared_memory_enabled: bool,
    pub skill_sharing_enabled: bool,
    pub audit_visibility: AuditVisibility,
    pub max_members: usize,
}

impl Default for TeamSettings {
    fn default() -> Self {
        Self {
            shared_memory_enabled: true,
            skill_sharing_enabled: true,
            audit_visibility: AuditVisibility::Admin,
            max_members: DEFAULT_MAX_MEMBERS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub user_id: Uuid,
    pub team_role: TeamRole,
    pub joined_at: DateTime<Utc>,
    pub invited_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub members: HashMap<Uuid, TeamMember>,
    pub settings: TeamSettings,
    pub shared_skills: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    pub code: String,
    pub team_id: Uuid,
    pub inviter: Uuid,
    pub target_role: TeamRole,
    pub created_at: DateTime<Utc>,
    pub used: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamSummary {
    pub team_id: Uuid,
    pub name: String,
    pub role: TeamRole,
    pub member_count: usize,
}

fn gen_invite_code() -> String {
    let mut bytes = [0u8; INVITE_CODE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| INVITE_ALPHABET[*b as usize % INVITE_ALPHABET.len()] as char)
        .collect()
}

/// Registry of teams, memberships, and invitations.
pub struct TeamRegistry {
    teams: RwLock<HashMap<String, Team>>,
    invitations: RwLock<HashMap<String, Invitation>>,
    teams_store: JsonStore,
    invitations_store: JsonStore,
}

impl TeamRegistry {
    pub fn open(state_path: &Path) -> Self {
        let teams_store = JsonStore::new(state_path, "teams");
        let invitations_store = JsonStore::new(state_path, "team_invitations");
        let teams: HashMap<String, Team> = teams_store.load();
        let invitations: HashMap<String, Invitation> = invitations_store.load();
        info!(team_count = teams.len(), "team registry opened");
        Self {
            teams: RwLock::new(teams),
            invitations: RwLock::new(invitations),
            teams_store,
            invitations_store,
        }
    }

    fn snapshot_teams(&self, teams: &HashMap<String, Team>) {
        let _ = self.teams_store.save(teams);
    }

    fn snapshot_invitations(&self, invitations: &HashMap<String, Invitation>) {
        let _ = self.invitations_store.save(invitations);
    }

    /// Create a team. The owner is auto-added as a member with role `owner`.
    pub fn create(&self, name: &str, owner_id: Uuid, description: &str) -> Team {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut members = HashMap::new();
        members.insert(
            owner_id,
            TeamMember {
                user_id: owner_id,
                team_role: TeamRole::Owner,
                joined_at: now,
                invited_by: None,
            },
        );

        let team = Team {
            id,
            name: name.to_string(),
            description: description.to_string(),
            owner_id,
            created_at: now,
            members,
            settings: TeamSettings::default(),
            shared_skills: Vec::new(),
            active: true,
        };

        let mut teams = self.teams.write();
        teams.insert(id.to_string(), team.clone());
        self.snapshot_teams(&teams);
        info!(team_id = %id, name, owner = %owner_id, "team created");
        team
    }

    pub fn get(&self, team_id: Uuid) -> Option<Team> {
        self.teams.read().get(&team_id.to_string()).cloned()
    }

    pub fn add_member(
        &self,
        team_id: Uuid,
        user_id: Uuid,
        role: &str,
        inviter: Option<Uuid>,
    ) -> Result<TeamMember> {
        let role = TeamRole::from_str(role)?;
        let mut teams = self.teams.write();
        let team = teams
            .get_mut(&team_id.to_string())
            .ok_or_else(|| TeamError::NotFound(team_id.to_string()))?;

        if team.members.contains_key(&user_id) {
            return Err(TeamError::AlreadyExists(user_id.to_string()));
        }
        if team.members.len() >= team.settings.max_members {
            return Err(TeamError::LimitExceeded);
        }

        let member = TeamMember {
            user_id,
            team_role: role,
            joined_at: Utc::now(),
            invited_by: inviter,
        };
        team.members.insert(user_id, member.clone());
        info!(team_id = %team_id, user_id = %user_id, role = ?role, "member added");
        self.snapshot_teams(&teams);
        Ok(member)
    }

    /// Remove a member. Forbidden for the owner — transfer ownership first.
    pub fn remove_member(&self, team_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut teams = self.teams.write();
        let team = teams
            .get_mut(&team_id.to_string())
            .ok_or_else(|| TeamError::NotFound(team_id.to_string()))?;

        let member = team
            .members
            .get(&user_id)
            .ok_or_else(|| TeamError::NotFound(user_id.to_string()))?;
        if member.team_role == TeamRole::Owner {
            return Err(TeamError::PermissionDenied(
                "cannot remove the team owner; transfer ownership first".to_string(),
            ));
        }

        team.members.remove(&user_id);
        self.snapshot_teams(&teams);
        Ok(())
    }

    /// Update a member's role. Forbidden to demote the owner directly.
    pub fn update_role(&self, team_id: Uuid, user_id: Uuid, new_role: &str) -> Result<()> {
        let new_role = TeamRole::from_str(new_role)?;
        let mut teams = self.teams.write();
        let team = teams
            .get_mut(&team_id.to_string())
            .ok_or_else(|| TeamError::NotFound(team_id.to_string()))?;

        let member = team
            .members
            .get_mut(&user_id)
            .ok_or_else(|| TeamError::NotFound(user_id.to_string()))?;

        if member.team_role == TeamRole::Owner && new_role != TeamRole::Owner {
            return Err(TeamError::PermissionDenied(
                "cannot demote the owner; transfer ownership first".to_string(),
            ));
        }

        member.team_role = new_role;
        self.snapshot_teams(&teams);
        Ok(())
    }

    /// Atomically transfer ownership: old owner becomes `admin`, new owner
    /// becomes `owner`, and `team.owner_id` updates — all three or none.
    pub fn transfer_ownership(&self, team_id: Uuid, new_owner_id: Uuid) -> Result<()> {
        let mut teams = self.teams.write();
        let team = teams
            .get_mut(&team_id.to_string())
            .ok_or_else(|| TeamError::NotFound(team_id.to_string()))?;

        if !team.members.contains_key(&new_owner_id) {
            return Err(TeamError::NotFound(new_owner_id.to_string()));
        }

        let old_owner_id = team.owner_id;
        team.members.get_mut(&old_owner_id).unwrap().team_role = TeamRole::Admin;
        team.members.get_mut(&new_owner_id).unwrap().team_role = TeamRole::Owner;
        team.owner_id = new_owner_id;

        self.snapshot_teams(&teams);
        info!(team_id = %team_id, old_owner = %old_owner_id, new_owner = %new_owner_id, "ownership transferred");
        Ok(())
    }

    /// Create an 8-character uppercase alphanumeric single-use invitation.
    pub fn create_invitation(&self, team_id: Uuid, inviter: Uuid, role: &str) -> Result<String> {
        let target_role = TeamRole::from_str(role)?;
        if self.get(team_id).is_none() {
            return Err(TeamError::NotFound(team_id.to_string()));
        }

        let code = gen_invite_code();
        let invite = Invitation {
            code: code.clone(),
            team_id,
            inviter,
            target_role,
            created_at: Utc::now(),
            used: false,
        };

        let mut invitations = self.invitations.write();
        invitations.insert(code.clone(), invite);
        self.snapshot_invitations(&invitations);
        info!(team_id = %team_id, code = %code, "invitation created");
        Ok(code)
    }

    /// Accept an invitation. Consumes the code atomically on success; a
    /// failed `add_member` (duplicate membership, limit reached) leaves the
    /// code unconsumed.
    pub fn accept_invitation(&self, code: &str, user_id: Uuid) -> Result<Team> {
        let invite = {
            let invitations = self.invitations.read();
            invitations.get(code).cloned()
        };
        let invite = match invite {
            Some(i) if !i.used => i,
            _ => return Err(TeamError::Expired),
        };

        let role_name = match invite.target_role {
            TeamRole::Owner => "owner",
            TeamRole::Admin => "admin",
            TeamRole::Member => "member",
            TeamRole::Viewer => "viewer",
        };
        self.add_member(invite.team_id, user_id, role_name, Some(invite.inviter))?;

        let mut invitations = self.invitations.write();
        if let Some(stored) = invitations.get_mut(code) {
            stored.used = true;
        }
        self.snapshot_invitations(&invitations);

        self.get(invite.team_id)
            .ok_or_else(|| TeamError::NotFound(invite.team_id.to_string()))
    }

    pub fn share_skill(&self, team_id: Uuid, skill_name: &str) -> Result<()> {
        let mut teams = self.teams.write();
        let team = teams
            .get_mut(&team_id.to_string())
            .ok_or_else(|| TeamError::NotFound(team_id.to_string()))?;
        if !team.shared_skills.iter().any(|s| s == skill_name) {
            team.shared_skills.push(skill_name.to_string());
            self.snapshot_teams(&teams);
        }
        Ok(())
    }

    pub fn unshare_skill(&self, team_id: Uuid, skill_name: &str) -> Result<()> {
        let mut teams = self.teams.write();
        let team = teams
            .get_mut(&team_id.to_string())
            .ok_or_else(|| TeamError::NotFound(team_id.to_string()))?;
        team.shared_skills.retain(|s| s != skill_name);
        self.snapshot_teams(&teams);
        Ok(())
    }

    /// Teams a user belongs to, with their role and the team's member count.
    pub fn user_teams(&self, user_id: Uuid) -> Vec<TeamSummary> {
        self.teams
            .read()
            .values()
            .filter(|t| t.active && t.members.contains_key(&user_id))
            .map(|t| TeamSummary {
                team_id: t.id,
                name: t.name.clone(),
                role: t.members[&user_id].team_role,
                member_count: t.members.len(),
            })
            .collect()
    }

    pub fn check_permission(&self, team_id: Uuid, user_id: Uuid, cap: Capability) -> bool {
        let teams = self.teams.read();
        let Some(team) = teams.get(&team_id.to_string()) else {
            return false;
        };
        team.members
            .get(&user_id)
            .is_some_and(|m| grants(m.team_role, cap))
    }

    pub fn list_teams(&self) -> Vec<Team> {
        self.teams
            .read()
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect()
    }

    /// Soft-delete a team. Membership records remain but the team no longer
    /// appears in listings or `user_teams`.
    pub fn delete(&self, team_id: Uuid) -> Result<()> {
        let mut teams = self.teams.write();
        let team = teams
            .get_mut(&team_id.to_string())
            .ok_or_else(|| TeamError::NotFound(team_id.to_string()))?;
        team.active = false;
        self.snapshot_teams(&teams);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, TeamRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = TeamRegistry::open(dir.path());
        (dir, reg)
    }

    #[test]
    fn create_auto_adds_owner() {
        let (_dir, reg) = registry();
        let owner = Uuid::new_v4();
        let team = reg.create("engineering", owner, "eng team");
        assert_eq!(team.owner_id, owner);
        assert_eq!(team.members.len(), 1);
        assert_eq!(team.members[&owner].team_role, TeamRole::Owner);
    }

    #[test]
    fn add_member_rejects_duplicate() {
        let (_dir, reg) = registry();
        let owner = Uuid::new_v4();
        let team = reg.create("t", owner, "");
        let member = Uuid::new_v4();
        reg.add_member(team.id, member, "member", None).unwrap();
        let result = reg.add_member(team.id, member, "member", None);
        assert!(matches!(result, Err(TeamError::AlreadyExists(_))));
    }

    #[test]
    fn add_member_enforces_max_members() {
        let (_dir, reg) = registry();
        let owner = Uuid::new_v4();
        let team = reg.create("t", owner, "");
        {
            let mut teams = reg.teams.write();
            teams.get_mut(&team.id.to_string()).unwrap().settings.max_members = 1;
        }
        let result = reg.add_member(team.id, Uuid::new_v4(), "member", None);
        assert!(matches!(result, Err(TeamError::LimitExceeded)));
    }

    #[test]
    fn remove_member_forbids_owner() {
        let (_dir, reg) = registry();
        let owner = Uuid::new_v4();
        let team = reg.create("t", owner, "");
        let result = reg.remove_member(team.id, owner);
        assert!(matches!(result, Err(TeamError::PermissionDenied(_))));
    }

    #[test]
    fn update_role_forbids_direct_owner_demotion() {
        let (_dir, reg) = registry();
        let owner = Uuid::new_v4();
        let team = reg.create("t", owner, "");
        let result = reg.update_role(team.id, owner, "member");
        assert!(matches!(result, Err(TeamError::PermissionDenied(_))));
    }

    #[test]
    fn transfer_ownership_preserves_member_count_and_single_owner() {
        let (_dir, reg) = registry();
        let owner = Uuid::new_v4();
        let team = reg.create("t", owner, "");
        let new_owner = Uuid::new_v4();
        reg.add_member(team.id, new_owner, "admin", None).unwrap();

        reg.transfer_ownership(team.id, new_owner).unwrap();

        let updated = reg.get(team.id).unwrap();
        assert_eq!(updated.members.len(), 2);
        assert_eq!(updated.owner_id, new_owner);
        assert_eq!(updated.members[&new_owner].team_role, TeamRole::Owner);
        assert_eq!(updated.members[&owner].team_role, TeamRole::Admin);
        let owners = updated
            .members
            .values()
            .filter(|m| m.team_role == TeamRole::Owner)
            .count();
        assert_eq!(owners, 1);
    }

    #[test]
    fn invitation_is_single_use() {
        let (_dir, reg) = registry();
        let owner = Uuid::new_v4();
        let team = reg.create("t", owner, "");
        let code = reg.create_invitation(team.id, owner, "member").unwrap();

        let invitee = Uuid::new_v4();
        reg.accept_invitation(&code, invitee).unwrap();

        let result = reg.accept_invitation(&code, Uuid::new_v4());
        assert!(matches!(result, Err(TeamError::Expired)));
    }

    #[test]
    fn failed_accept_does_not_consume_code() {
        let (_dir, reg) = registry();
        let owner = Uuid::new_v4();
        let team = reg.create("t", owner, "");
        let code = reg.create_invitation(team.id, owner, "member").unwrap();

        // Accepting as the owner fails (already a member) but must not burn the code.
        let result = reg.accept_invitation(&code, owner);
        assert!(result.is_err());

        let invitee = Uuid::new_v4();
        assert!(reg.accept_invitation(&code, invitee).is_ok());
    }

    #[test]
    fn capability_matrix_matches_spec() {
        assert!(grants(TeamRole::Owner, Capability::DeleteTeam));
        assert!(!grants(TeamRole::Admin, Capability::DeleteTeam));
        assert!(grants(TeamRole::Member, Capability::ShareMemory));
        assert!(!grants(TeamRole::Member, Capability::ManageTeam));
        assert!(grants(TeamRole::Viewer, Capability::ViewAudit));
        assert!(!grants(TeamRole::Viewer, Capability::ShareMemory));
    }

    #[test]
    fn delete_removes_team_from_user_listing() {
        let (_dir, reg) = registry();
        let owner = Uuid::new_v4();
        let team = reg.create("t", owner, "");
        assert_eq!(reg.user_teams(owner).len(), 1);
        reg.delete(team.id).unwrap();
        assert_eq!(reg.user_teams(owner).len(), 0);
    }
}
