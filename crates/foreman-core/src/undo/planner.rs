//! Rollback planning: generates reverse commands for known action kinds.
//!
//! Given an action kind and its context (files, git commit, metadata),
//! produces an [`UndoAction`] with the reverse command and an assessed
//! risk level. Kinds without a mechanical reverse get a manual marker.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{RiskLevel, UndoAction};

/// Kinds of actions the planner knows how to reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    FileEdit,
    FileCreate,
    FileDelete,
    ConfigChange,
    PackageInstall,
    DatabaseMigration,
    ApiDeployment,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FileEdit => "file_edit",
            Self::FileCreate => "file_create",
            Self::FileDelete => "file_delete",
            Self::ConfigChange => "config_change",
            Self::PackageInstall => "package_install",
            Self::DatabaseMigration => "database_migration",
            Self::ApiDeployment => "api_deployment",
        };
        f.write_str(s)
    }
}

impl FromStr for ActionKind {
    type Err = ActionKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_edit" => Ok(Self::FileEdit),
            "file_create" => Ok(Self::FileCreate),
            "file_delete" => Ok(Self::FileDelete),
            "config_change" => Ok(Self::ConfigChange),
            "package_install" => Ok(Self::PackageInstall),
            "database_migration" => Ok(Self::DatabaseMigration),
            "api_deployment" => Ok(Self::ApiDeployment),
            other => Err(ActionKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ActionKind`] string.
#[derive(Debug, Clone)]
pub struct ActionKindParseError(pub String);

impl fmt::Display for ActionKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid action kind: {:?}", self.0)
    }
}

impl std::error::Error for ActionKindParseError {}

/// Generates undo actions for the known action kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackPlanner;

impl RollbackPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Generate an [`UndoAction`] for an action of the given kind.
    ///
    /// `git_commit` is the pre-action commit hash for git-restorable
    /// kinds; without it those kinds fall back to a manual reverse.
    pub fn generate(
        &self,
        kind: ActionKind,
        description: impl Into<String>,
        files: &[String],
        git_commit: Option<&str>,
        metadata: Map<String, Value>,
    ) -> UndoAction {
        let undo_command = undo_command_for(kind, files, git_commit, &metadata);
        let risk_level = self.assess_risk(kind);

        let mut action = UndoAction::new(
            kind.to_string(),
            undo_command,
            description,
            risk_level,
        )
        .files(files.iter().cloned());
        action.metadata = metadata;
        action
    }

    /// Risk level per action kind.
    pub fn assess_risk(&self, kind: ActionKind) -> RiskLevel {
        match kind {
            ActionKind::DatabaseMigration | ActionKind::ApiDeployment => RiskLevel::Critical,
            ActionKind::FileDelete | ActionKind::ConfigChange => RiskLevel::High,
            ActionKind::FileEdit => RiskLevel::Medium,
            ActionKind::FileCreate | ActionKind::PackageInstall => RiskLevel::Low,
        }
    }

    /// Whether an undo command is actually executable: non-empty and not
    /// a comment placeholder.
    pub fn verify_rollback(&self, action: &UndoAction) -> bool {
        !action.is_manual()
    }
}

fn undo_command_for(
    kind: ActionKind,
    files: &[String],
    git_commit: Option<&str>,
    metadata: &Map<String, Value>,
) -> String {
    let files_str = files.join(" ");

    match kind {
        ActionKind::FileEdit | ActionKind::FileDelete | ActionKind::ConfigChange => {
            match git_commit {
                Some(commit) if !files.is_empty() => {
                    format!("git checkout {commit} -- {files_str}")
                }
                _ => "# Manual rollback required".to_owned(),
            }
        }
        ActionKind::FileCreate => {
            if files.is_empty() {
                "# Manual rollback required".to_owned()
            } else {
                format!("rm {files_str}")
            }
        }
        ActionKind::PackageInstall => {
            match metadata.get("package").and_then(Value::as_str) {
                Some(package) if !package.is_empty() => {
                    format!("cargo remove {package}")
                }
                _ => "# Identify and remove the installed package".to_owned(),
            }
        }
        ActionKind::DatabaseMigration => "# Run rollback migration script".to_owned(),
        ActionKind::ApiDeployment => "# Redeploy previous version".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| (*p).to_owned()).collect()
    }

    #[test]
    fn action_kind_display_roundtrip() {
        let variants = [
            ActionKind::FileEdit,
            ActionKind::FileCreate,
            ActionKind::FileDelete,
            ActionKind::ConfigChange,
            ActionKind::PackageInstall,
            ActionKind::DatabaseMigration,
            ActionKind::ApiDeployment,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ActionKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
        assert!("teleport".parse::<ActionKind>().is_err());
    }

    #[test]
    fn file_edit_with_commit_uses_git_checkout() {
        let planner = RollbackPlanner::new();
        let action = planner.generate(
            ActionKind::FileEdit,
            "edited the parser",
            &files(&["src/parser.rs", "src/lexer.rs"]),
            Some("abc123"),
            Map::new(),
        );

        assert_eq!(action.undo_command, "git checkout abc123 -- src/parser.rs src/lexer.rs");
        assert_eq!(action.risk_level, RiskLevel::Medium);
        assert!(planner.verify_rollback(&action));
    }

    #[test]
    fn file_edit_without_commit_is_manual() {
        let planner = RollbackPlanner::new();
        let action = planner.generate(
            ActionKind::FileEdit,
            "edited something",
            &files(&["src/parser.rs"]),
            None,
            Map::new(),
        );
        assert!(action.is_manual());
        assert!(!planner.verify_rollback(&action));
    }

    #[test]
    fn file_create_reverses_with_rm() {
        let planner = RollbackPlanner::new();
        let action = planner.generate(
            ActionKind::FileCreate,
            "created scratch file",
            &files(&["notes.txt"]),
            None,
            Map::new(),
        );
        assert_eq!(action.undo_command, "rm notes.txt");
        assert_eq!(action.risk_level, RiskLevel::Low);
    }

    #[test]
    fn package_install_uses_metadata() {
        let planner = RollbackPlanner::new();
        let mut metadata = Map::new();
        metadata.insert("package".to_owned(), json!("serde"));

        let action = planner.generate(
            ActionKind::PackageInstall,
            "added serde",
            &[],
            None,
            metadata,
        );
        assert_eq!(action.undo_command, "cargo remove serde");
        assert!(planner.verify_rollback(&action));
    }

    #[test]
    fn migration_and_deployment_are_critical_and_manual() {
        let planner = RollbackPlanner::new();
        for kind in [ActionKind::DatabaseMigration, ActionKind::ApiDeployment] {
            let action = planner.generate(kind, "risky thing", &[], None, Map::new());
            assert_eq!(action.risk_level, RiskLevel::Critical);
            assert!(action.is_manual());
        }
    }

    #[test]
    fn risk_table_matches_kind_classes() {
        let planner = RollbackPlanner::new();
        assert_eq!(planner.assess_risk(ActionKind::FileDelete), RiskLevel::High);
        assert_eq!(planner.assess_risk(ActionKind::ConfigChange), RiskLevel::High);
        assert_eq!(planner.assess_risk(ActionKind::FileEdit), RiskLevel::Medium);
        assert_eq!(planner.assess_risk(ActionKind::FileCreate), RiskLevel::Low);
    }
}
