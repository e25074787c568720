//! Permission catalog, role registry, and authorization decisions.
//!
//! `check(role, permission)` is a single set-membership test — no
//! inheritance, no wildcards, no deny-overrides. Denial is the default.

#![forbid(unsafe_code)]

use claw_persist::JsonStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("role not found: {0}")]
    NotFound(String),
    #[error("role already exists: {0}")]
    AlreadyExists(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, RbacError>;

/// The closed permission catalog, fixed at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ChatSend,
    ChatStream,
    ChatHistory,
    ToolsExecute,
    ToolsShell,
    ToolsFileRead,
    ToolsFileWrite,
    ToolsNetwork,
    ToolsBrowser,
    ToolsEmail,
    ToolsCodeExec,
    AdminUsers,
    AdminRoles,
    AdminConfig,
    AdminSkills,
    AdminVault,
    DataOwn,
    DataAll,
    DataExport,
    DataAudit,
    SystemStart,
    SystemMonitor,
    SystemUpdate,
}

impl Permission {
    pub const ALL: [Permission; 23] = [
        Self::ChatSend,
        Self::ChatStream,
        Self::ChatHistory,
        Self::ToolsExecute,
        Self::ToolsShell,
        Self::ToolsFileRead,
        Self::ToolsFileWrite,
        Self::ToolsNetwork,
        Self::ToolsBrowser,
        Self::ToolsEmail,
        Self::ToolsCodeExec,
        Self::AdminUsers,
        Self::AdminRoles,
        Self::AdminConfig,
        Self::AdminSkills,
        Self::AdminVault,
        Self::DataOwn,
        Self::DataAll,
        Self::DataExport,
        Self::DataAudit,
        Self::SystemStart,
        Self::SystemMonitor,
        Self::SystemUpdate,
    ];

    /// Dotted name, e.g. `tools.shell`.
    pub fn dotted(&self) -> &'static str {
        match self {
            Self::ChatSend => "chat.send",
            Self::ChatStream => "chat.stream",
            Self::ChatHistory => "chat.history",
            Self::ToolsExecute => "tools.execute",
            Self::ToolsShell => "tools.shell",
            Self::ToolsFileRead => "tools.file_read",
            Self::ToolsFileWrite => "tools.file_write",
            Self::ToolsNetwork => "tools.network",
            Self::ToolsBrowser => "tools.browser",
            Self::ToolsEmail => "tools.email",
            Self::ToolsCodeExec => "tools.code_exec",
            Self::AdminUsers => "admin.users",
            Self::AdminRoles => "admin.roles",
            Self::AdminConfig => "admin.config",
            Self::AdminSkills => "admin.skills",
            Self::AdminVault => "admin.vault",
            Self::DataOwn => "data.own",
            Self::DataAll => "data.all",
            Self::DataExport => "data.export",
            Self::DataAudit => "data.audit",
            Self::SystemStart => "system.start",
            Self::SystemMonitor => "system.monitor",
            Self::SystemUpdate => "system.update",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::ChatSend | Self::ChatStream | Self::ChatHistory => "chat",
            Self::ToolsExecute
            | Self::ToolsShell
            | Self::ToolsFileRead
            | Self::ToolsFileWrite
            | Self::ToolsNetwork
            | Self::ToolsBrowser
            | Self::ToolsEmail
            | Self::ToolsCodeExec => "tools",
            Self::AdminUsers
            | Self::AdminRoles
            | Self::AdminConfig
            | Self::AdminSkills
            | Self::AdminVault => "admin",
            Self::DataOwn | Self::DataAll | Self::DataExport | Self::DataAudit => "data",
            Self::SystemStart | Self::SystemMonitor | Self::SystemUpdate => "system",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dotted())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub description: String,
    pub permissions: HashSet<Permission>,
    pub is_system: bool,
}

fn perms(list: &[Permission]) -> HashSet<Permission> {
    list.iter().copied().collect()
}

fn built_in_roles() -> Vec<Role> {
    use Permission::*;
    vec![
        Role {
            name: "admin".to_string(),
            description: "Full access to every permission in the catalog.".to_string(),
            permissions: perms(&Permission::ALL),
            is_system: true,
        },
        Role {
            name: "operator".to_string(),
            description: "Chat, all tools, skills administration, audit view, monitoring."
                .to_string(),
            permissions: perms(&[
                ChatSend,
                ChatStream,
                ChatHistory,
                ToolsExecute,
                ToolsShell,
                ToolsFileRead,
                ToolsFileWrite,
                ToolsNetwork,
                ToolsBrowser,
                ToolsEmail,
                ToolsCodeExec,
                AdminSkills,
                DataAudit,
                SystemMonitor,
            ]),
            is_system: true,
        },
        Role {
            name: "user".to_string(),
            description: "Chat and a safe subset of tools over the user's own data."
                .to_string(),
            permissions: perms(&[
                ChatSend,
                ChatStream,
                ChatHistory,
                ToolsExecute,
                ToolsFileRead,
                ToolsNetwork,
                DataOwn,
                SystemMonitor,
            ]),
            is_system: true,
        },
        Role {
            name: "viewer".to_string(),
            description: "Read-only chat history and own data.".to_string(),
            permissions: perms(&[ChatSend, ChatHistory, DataOwn]),
            is_system: true,
        },
        Role {
            name: "guest".to_string(),
            description: "May send chat messages only.".to_string(),
            permissions: perms(&[ChatSend]),
            is_system: true,
        },
    ]
}

/// Registry of roles: five preloaded system roles plus any custom roles.
pub struct RoleRegistry {
    roles: RwLock<HashMap<String, Role>>,
    store: JsonStore,
}

impl RoleRegistry {
    pub fn open(state_path: &Path) -> Self {
        let store = JsonStore::new(state_path, "rbac_roles");
        let mut roles: HashMap<String, Role> = store.load();
        for role in built_in_roles() {
            roles.entry(role.name.clone()).or_insert(role);
        }
        info!(role_count = roles.len(), "role registry opened");
        Self {
            roles: RwLock::new(roles),
            store,
        }
    }

    fn snapshot(&self, roles: &HashMap<String, Role>) {
        let _ = self.store.save(roles);
    }

    /// `check(role, permission)` is true iff the user is active, the role
    /// exists, and the permission is a member of the role's set.
    pub fn check(&self, role_name: &str, active: bool, permission: Permission) -> bool {
        if !active {
            return false;
        }
        self.roles
            .read()
            .get(role_name)
            .is_some_and(|r| r.permissions.contains(&permission))
    }

    pub fn permissions(&self, role_name: &str) -> HashSet<Permission> {
        self.roles
            .read()
            .get(role_name)
            .map(|r| r.permissions.clone())
            .unwrap_or_default()
    }

    pub fn role_exists(&self, role_name: &str) -> bool {
        self.roles.read().contains_key(role_name)
    }

    pub fn create_role(
        &self,
        name: &str,
        description: &str,
        permissions: HashSet<Permission>,
    ) -> Result<Role> {
        let mut roles = self.roles.write();
        if roles.contains_key(name) {
            return Err(RbacError::AlreadyExists(name.to_string()));
        }
        let role = Role {
            name: name.to_string(),
            description: description.to_string(),
            permissions,
            is_system: false,
        };
        roles.insert(name.to_string(), role.clone());
        self.snapshot(&roles);
        Ok(role)
    }

    /// Delete a custom role. `in_use` is supplied by the caller (the
    /// identity store owns user-to-role references).
    pub fn delete_role(&self, name: &str, in_use: bool) -> Result<()> {
        let mut roles = self.roles.write();
        let role = roles
            .get(name)
            .ok_or_else(|| RbacError::NotFound(name.to_string()))?;
        if role.is_system {
            return Err(RbacError::PermissionDenied(format!(
                "{name} is a system role and cannot be deleted"
            )));
        }
        if in_use {
            return Err(RbacError::InvalidArgument(format!(
                "{name} is still referenced by at least one user"
            )));
        }
        roles.remove(name);
        self.snapshot(&roles);
        Ok(())
    }

    pub fn list_roles(&self) -> Vec<Role> {
        self.roles.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, RoleRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = RoleRegistry::open(dir.path());
        (dir, reg)
    }

    #[test]
    fn guest_can_only_send_chat() {
        let (_dir, reg) = registry();
        assert!(reg.check("guest", true, Permission::ChatSend));
        assert!(!reg.check("guest", true, Permission::ToolsExecute));
    }

    #[test]
    fn inactive_user_always_denied() {
        let (_dir, reg) = registry();
        assert!(!reg.check("admin", false, Permission::ChatSend));
    }

    #[test]
    fn admin_has_every_permission() {
        let (_dir, reg) = registry();
        for p in Permission::ALL {
            assert!(reg.check("admin", true, p));
        }
    }

    #[test]
    fn system_roles_cannot_be_deleted() {
        let (_dir, reg) = registry();
        let result = reg.delete_role("admin", false);
        assert!(matches!(result, Err(RbacError::PermissionDenied(_))));
    }

    #[test]
    fn custom_role_lifecycle() {
        let (_dir, reg) = registry();
        reg.create_role(
            "auditor",
            "Read-only audit access",
            [Permission::DataAudit].into_iter().collect(),
        )
        .unwrap();

        assert!(reg.check("auditor", true, Permission::DataAudit));
        assert!(reg.delete_role("auditor", false).is_ok());
        assert!(!reg.role_exists("auditor"));
    }

    #[test]
    fn custom_role_in_use_cannot_be_deleted() {
        let (_dir, reg) = registry();
        reg.create_role("temp", "temp role", HashSet::new()).unwrap();
        let result = reg.delete_role("temp", true);
        assert!(matches!(result, Err(RbacError::InvalidArgument(_))));
    }

    #[test]
    fn role_upgrade_scenario() {
        let (_dir, reg) = registry();
        // scenario from the testable-properties set: guest -> operator
        assert!(reg.check("guest", true, Permission::ChatSend));
        assert!(!reg.check("guest", true, Permission::ToolsExecute));
        assert!(reg.check("operator", true, Permission::ToolsExecute));
    }
}
