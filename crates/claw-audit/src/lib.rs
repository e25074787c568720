//! Tamper-evident, hash-chained audit ledger.
//!
//! Every authorization decision is appended here before the caller acts on
//! it. Entries are chained by SHA-256 hash: each entry's hash binds the
//! previous entry's hash, so mutating any past entry is detectable by
//! [`AuditLedger::verify`].

#![forbid(unsafe_code)]

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Bumped whenever the canonical hash preimage's field set, order, or
/// encoding changes. Entries hashed under a different version cannot be
/// verified against this one.
pub const LEDGER_FORMAT_VERSION: u32 = 1;

const GENESIS: &str = "genesis";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit journal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit journal serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt audit entry at {file}:{line}: {reason}")]
    CorruptEntry {
        file: String,
        line: usize,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, AuditError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    AskUser,
}

impl Decision {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::AskUser => "ask_user",
        }
    }
}

/// A single immutable, hash-chained audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor: Actor,
    pub resource: String,
    pub decision: Decision,
    pub policy: Option<String>,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub channel: String,
    pub prev_hash: String,
    pub entry_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuditSummary {
    pub total: usize,
    pub decisions: HashMap<String, usize>,
    pub actions: HashMap<String, usize>,
    pub chain_valid: bool,
}

/// Append-only, hash-chained event log backed by day-bucketed JSONL journals.
///
/// `append` holds an exclusive lock across hash computation, the journal
/// write, and advancing the in-memory `prev_hash` pointer — the three must
/// succeed or fail together or the chain invariant breaks.
pub struct AuditLedger {
    dir: PathBuf,
    prev_hash: Mutex<String>,
}

impl AuditLedger {
    /// Open (or initialize) the ledger rooted at `dir`, replaying existing
    /// journal files to recover the current chain head.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let prev_hash = Self::recover_chain_head(dir)?;
        info!(dir = %dir.display(), prev_hash = %prev_hash, "audit ledger opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            prev_hash: Mutex::new(prev_hash),
        })
    }

    fn journal_files_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if dir.exists() {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                let is_journal = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("audit-") && n.ends_with(".jsonl"));
                if is_journal {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn recover_chain_head(dir: &Path) -> Result<String> {
        for path in Self::journal_files_sorted(dir)?.into_iter().rev() {
            let content = std::fs::read_to_string(&path)?;
            if let Some(last_line) = content.lines().next_back() {
                let entry: AuditEntry = serde_json::from_str(last_line)?;
                return Ok(entry.entry_hash);
            }
        }
        Ok(GENESIS.to_string())
    }

    fn journal_path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn canonical_preimage(
        timestamp: &DateTime<Utc>,
        action: &str,
        actor: Actor,
        resource: &str,
        decision: Decision,
        policy: &Option<String>,
        detail: &str,
        channel: &str,
        prev_hash: &str,
    ) -> String {
        // serde_json::Map defaults to a BTreeMap, so this object serializes
        // with lexicographically sorted keys — the canonical form.
        serde_json::json!({
            "action": action,
            "actor": actor,
            "channel": channel,
            "decision": decision,
            "detail": detail,
            "policy": policy,
            "prev_hash": prev_hash,
            "resource": resource,
            "timestamp": timestamp,
        })
        .to_string()
    }

    fn hash_entry(
        timestamp: &DateTime<Utc>,
        action: &str,
        actor: Actor,
        resource: &str,
        decision: Decision,
        policy: &Option<String>,
        detail: &str,
        channel: &str,
        prev_hash: &str,
    ) -> String {
        let preimage = Self::canonical_preimage(
            timestamp, action, actor, resource, decision, policy, detail, channel, prev_hash,
        );
        let mut hasher = Sha256::new();
        hasher.update(preimage.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Append a new entry, chaining it from the current head.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        action: &str,
        actor: Actor,
        resource: &str,
        decision: Decision,
        policy: Option<String>,
        detail: Option<String>,
        channel: Option<String>,
    ) -> Result<AuditEntry> {
        let mut head = self.prev_hash.lock();
        let timestamp = Utc::now();
        let detail = detail.unwrap_or_default();
        let channel = channel.unwrap_or_default();

        let entry_hash = Self::hash_entry(
            &timestamp, action, actor, resource, decision, &policy, &detail, &channel, &head,
        );

        let entry = AuditEntry {
            timestamp,
            action: action.to_string(),
            actor,
            resource: resource.to_string(),
            decision,
            policy,
            detail,
            channel,
            prev_hash: head.clone(),
            entry_hash: entry_hash.clone(),
        };

        let path = self.journal_path_for(timestamp.date_naive());
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        // Only advance the pointer once the write has landed.
        *head = entry_hash;

        info!(action = %entry.action, decision = entry.decision.as_str(), "audit entry appended");
        Ok(entry)
    }

    /// Read entries for a single UTC date (default: today) in insertion order.
    pub fn read(&self, date: Option<NaiveDate>) -> Result<Vec<AuditEntry>> {
        let date = date.unwrap_or_else(|| Utc::now().date_naive());
        let path = self.journal_path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut entries = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(line).map_err(|e| {
                AuditError::CorruptEntry {
                    file: path.display().to_string(),
                    line: i + 1,
                    reason: e.to_string(),
                }
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let mut all = Vec::new();
        for path in Self::journal_files_sorted(&self.dir)? {
            let content = std::fs::read_to_string(&path)?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                all.push(serde_json::from_str::<AuditEntry>(line)?);
            }
        }
        Ok(all)
    }

    /// Verify a chain of entries (or the whole ledger, if `None`).
    ///
    /// Returns `(true, message)` if the chain is intact, or `(false,
    /// message)` naming the first broken index and failure mode.
    pub fn verify(&self, entries: Option<&[AuditEntry]>) -> Result<(bool, String)> {
        let owned;
        let (entries, is_full_chain) = match entries {
            Some(e) => (e, false),
            None => {
                owned = self.read_all()?;
                (owned.as_slice(), true)
            }
        };

        if entries.is_empty() {
            return Ok((true, "0 entries verified".to_string()));
        }

        if is_full_chain && entries[0].prev_hash != GENESIS {
            return Ok((
                false,
                "prev_hash mismatch at index 0: expected genesis anchor".to_string(),
            ));
        }

        for (i, entry) in entries.iter().enumerate() {
            let expected_hash = Self::hash_entry(
                &entry.timestamp,
                &entry.action,
                entry.actor,
                &entry.resource,
                entry.decision,
                &entry.policy,
                &entry.detail,
                &entry.channel,
                &entry.prev_hash,
            );
            if expected_hash != entry.entry_hash {
                return Ok((false, format!("hash mismatch at index {i}")));
            }
            if i > 0 && entry.prev_hash != entries[i - 1].entry_hash {
                return Ok((false, format!("prev_hash mismatch at index {i}")));
            }
        }

        Ok((true, format!("{} entries verified", entries.len())))
    }

    /// Summarize a day's entries plus the overall chain's validity.
    pub fn summary(&self, date: Option<NaiveDate>) -> Result<AuditSummary> {
        let entries = self.read(date)?;
        let mut decisions = HashMap::new();
        let mut actions = HashMap::new();
        for entry in &entries {
            *decisions.entry(entry.decision.as_str().to_string()).or_insert(0) += 1;
            *actions.entry(entry.action.clone()).or_insert(0) += 1;
        }
        let (chain_valid, _) = self.verify(None)?;
        Ok(AuditSummary {
            total: entries.len(),
            decisions,
            actions,
            chain_valid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> (tempfile::TempDir, AuditLedger) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = AuditLedger::open(dir.path()).expect("open");
        (dir, ledger)
    }

    #[test]
    fn genesis_anchors_first_entry() {
        let (_dir, ledger) = ledger();
        let entry = ledger
            .append("read", Actor::User, "/a", Decision::Allow, None, None, None)
            .expect("append");
        assert_eq!(entry.prev_hash, "genesis");
    }

    #[test]
    fn chain_sanity_three_entries() {
        let (_dir, ledger) = ledger();
        let e1 = ledger
            .append("read", Actor::User, "/a", Decision::Allow, None, None, None)
            .unwrap();
        let e2 = ledger
            .append(
                "exec",
                Actor::Agent,
                "ls",
                Decision::AskUser,
                None,
                None,
                None,
            )
            .unwrap();
        let e3 = ledger
            .append(
                "request",
                Actor::System,
                "https://x",
                Decision::Deny,
                None,
                None,
                None,
            )
            .unwrap();

        assert_eq!(e2.prev_hash, e1.entry_hash);
        assert_eq!(e3.prev_hash, e2.entry_hash);

        let (valid, msg) = ledger.verify(None).unwrap();
        assert!(valid);
        assert_eq!(msg, "3 entries verified");
    }

    #[test]
    fn tamper_breaks_verification() {
        let (_dir, ledger) = ledger();
        for _ in 0..3 {
            ledger
                .append("read", Actor::User, "/a", Decision::Allow, None, None, None)
                .unwrap();
        }
        let mut entries = ledger.read(None).unwrap();
        entries[0].decision = Decision::Deny;

        let (valid, msg) = ledger.verify(Some(&entries)).unwrap();
        assert!(!valid);
        assert!(msg.contains("hash mismatch"));
    }

    #[test]
    fn restart_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let last_hash = {
            let ledger = AuditLedger::open(dir.path()).unwrap();
            ledger
                .append("read", Actor::User, "/a", Decision::Allow, None, None, None)
                .unwrap()
                .entry_hash
        };

        let ledger2 = AuditLedger::open(dir.path()).unwrap();
        let next = ledger2
            .append("read", Actor::User, "/b", Decision::Allow, None, None, None)
            .unwrap();
        assert_eq!(next.prev_hash, last_hash);
    }

    #[test]
    fn summary_counts_decisions_and_actions() {
        let (_dir, ledger) = ledger();
        ledger
            .append("read", Actor::User, "/a", Decision::Allow, None, None, None)
            .unwrap();
        ledger
            .append("read", Actor::User, "/b", Decision::Deny, None, None, None)
            .unwrap();
        let summary = ledger.summary(None).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.decisions.get("allow"), Some(&1));
        assert_eq!(summary.decisions.get("deny"), Some(&1));
        assert!(summary.chain_valid);
    }
}
