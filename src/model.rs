//! Work-item domain types.
//!
//! A `WorkItem` is one backlog entry: the descriptive payload authored by
//! the external planning step, the lifecycle status the engine transitions,
//! and optional run metadata the engine preserves but never interprets.
//! Records are persisted camelCase; optional fields are emitted only when
//! defined so the on-disk format never carries null placeholders.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a work item.
///
/// ```text
/// backlog -> in_progress -> verified
///                 |  \----> waiting_approval
///                 \-------> error (retryable)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Backlog,
    InProgress,
    WaitingApproval,
    Verified,
    Error,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::WaitingApproval => "waiting_approval",
            Self::Verified => "verified",
            Self::Error => "error",
        }
    }

    /// Whether the scheduler may pick this item up automatically.
    ///
    /// `verified` is done and `waiting_approval` needs a human; everything
    /// else is eligible, including `error` (retried on a later pass) and
    /// `in_progress` left behind by an interrupted run.
    pub fn is_auto_selectable(&self) -> bool {
        !matches!(self, Self::Verified | Self::WaitingApproval)
    }

    /// Whether the item needs no further automatic work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::WaitingApproval | Self::Error)
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "in_progress" => Ok(Self::InProgress),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "verified" => Ok(Self::Verified),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid feature status: {}", s)),
        }
    }
}

/// One backlog entry.
///
/// `id`, `category`, `description`, `steps` and `status` are always
/// persisted. Everything else is optional run configuration or outcome
/// metadata, serialized only when present. `images` and `image_paths` are
/// opaque payloads owned by the planning collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_tests: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_paths: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
}

impl WorkItem {
    /// Create a fresh backlog item with a generated id.
    pub fn new(category: &str, description: &str, steps: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            category: category.to_string(),
            description: description.to_string(),
            steps,
            status: FeatureStatus::Backlog,
            skip_tests: None,
            images: None,
            image_paths: None,
            started_at: None,
            summary: None,
            model: None,
            thinking_level: None,
            error: None,
            worktree_path: None,
            branch_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_status_roundtrip() {
        for s in &[
            "backlog",
            "in_progress",
            "waiting_approval",
            "verified",
            "error",
        ] {
            let parsed: FeatureStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<FeatureStatus>().is_err());
    }

    #[test]
    fn test_serde_produces_snake_case_status() {
        assert_eq!(
            serde_json::to_string(&FeatureStatus::WaitingApproval).unwrap(),
            "\"waiting_approval\""
        );
        assert_eq!(
            serde_json::from_str::<FeatureStatus>("\"in_progress\"").unwrap(),
            FeatureStatus::InProgress
        );
    }

    #[test]
    fn test_auto_selectable_excludes_verified_and_waiting() {
        assert!(FeatureStatus::Backlog.is_auto_selectable());
        assert!(FeatureStatus::InProgress.is_auto_selectable());
        assert!(FeatureStatus::Error.is_auto_selectable());
        assert!(!FeatureStatus::Verified.is_auto_selectable());
        assert!(!FeatureStatus::WaitingApproval.is_auto_selectable());
    }

    #[test]
    fn test_new_item_has_unique_ids() {
        let a = WorkItem::new("ui", "first", vec![]);
        let b = WorkItem::new("ui", "second", vec![]);
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, FeatureStatus::Backlog);
    }

    #[test]
    fn test_undefined_optionals_are_not_serialized() {
        let item = WorkItem::new("core", "minimal item", vec!["one step".into()]);
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"id\""));
        assert!(json.contains("\"category\""));
        assert!(json.contains("\"status\":\"backlog\""));
        for absent in &[
            "skipTests",
            "images",
            "imagePaths",
            "startedAt",
            "summary",
            "model",
            "thinkingLevel",
            "error",
            "worktreePath",
            "branchName",
        ] {
            assert!(!json.contains(absent), "{} should not be emitted", absent);
        }
    }

    #[test]
    fn test_persisted_fields_are_camel_case() {
        let mut item = WorkItem::new("core", "full item", vec![]);
        item.skip_tests = Some(true);
        item.worktree_path = Some("/tmp/wt".into());
        item.branch_name = Some("autodev/item".into());
        item.thinking_level = Some("high".into());
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"skipTests\":true"));
        assert!(json.contains("\"worktreePath\""));
        assert!(json.contains("\"branchName\""));
        assert!(json.contains("\"thinkingLevel\""));
    }

    #[test]
    fn test_unknown_metadata_roundtrips_opaquely() {
        let raw = r#"{
            "id": "f-1",
            "category": "ui",
            "description": "add button",
            "steps": ["wire it up"],
            "status": "backlog",
            "images": [{"name": "mock.png", "data": "aGk="}],
            "imagePaths": ["/tmp/mock.png"]
        }"#;
        let item: WorkItem = serde_json::from_str(raw).unwrap();
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("mock.png"));
        assert!(json.contains("aGk="));
    }
}
