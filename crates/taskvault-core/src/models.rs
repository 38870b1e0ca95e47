//! Record types persisted by the store.
//!
//! A [`Task`] or [`Project`] is serialised as one pretty-printed JSON file.
//! Field order is fixed by the struct definitions and `metadata` is a
//! `BTreeMap`, so the same record always produces the same bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, SubsecRound, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Longest id accepted from callers.
pub const MAX_ID_LEN: usize = 128;

// =============================================================================
// Timestamps
// =============================================================================

/// Current UTC time truncated to microseconds.
#[must_use]
pub fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Next `updated_at` for a record whose previous stamp is `previous`.
///
/// Never returns a value `<= previous`, even when the wall clock went backwards.
#[must_use]
pub fn next_stamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + ChronoDuration::microseconds(1);
    if now < floor { floor } else { now }
}

/// RFC 3339 with exactly six fractional digits and a `Z` suffix.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(6))
}

pub mod ts_micros {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_str(&super::super::format_timestamp(ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| {
                    super::super::parse_timestamp(&raw).ok_or_else(|| {
                        serde::de::Error::custom(format!("invalid timestamp: {raw}"))
                    })
                })
                .transpose()
        }
    }
}

/// Distinguishes an absent patch field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, D, T>(d: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Some)
}

// =============================================================================
// Status and metadata
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub const ALL: [Self; 3] = [Self::Pending, Self::InProgress, Self::Completed];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(Error::validation(format!(
                "invalid status {other:?} (expected pending, in_progress or completed)"
            ))),
        }
    }
}

/// A metadata value: one of a closed set of scalar kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

// =============================================================================
// Task
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_name: String,
    pub description: Option<String>,
    pub action_required: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub category: Option<String>,
    pub status: TaskStatus,
    pub project_path: Option<String>,
    pub parent_task_id: Option<String>,
    #[serde(with = "ts_micros")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_micros::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(with = "ts_micros")]
    pub updated_at: DateTime<Utc>,
    pub priority: i64,
    #[serde(default)]
    pub metadata: Metadata,
    pub completion_report: Option<String>,
}

/// A status transition produced by [`Task::apply_patch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl Task {
    /// Build a fresh record from validated creation input.
    pub fn from_new(id: String, new: NewTask, now: DateTime<Utc>) -> Result<Self> {
        new.validate()?;
        let status = new.status.unwrap_or(TaskStatus::Pending);
        let completed = status == TaskStatus::Completed;
        Ok(Self {
            id,
            task_name: new.task_name.trim().to_string(),
            description: new.description,
            action_required: new.action_required,
            due_date: new.due_date,
            category: new.category,
            status,
            project_path: new.project_path,
            parent_task_id: new.parent_task_id,
            created_at: now,
            completed_at: completed.then_some(now),
            updated_at: now,
            priority: new.priority.unwrap_or(0),
            metadata: new.metadata,
            completion_report: new.completion_report.filter(|_| completed),
        })
    }

    #[must_use]
    pub const fn is_subtask(&self) -> bool {
        self.parent_task_id.is_some()
    }

    /// Apply the fields present in `patch`, keeping `completed_at` and
    /// `completion_report` paired with `status == completed`.
    ///
    /// Parent existence and nesting depth need the other records, so the
    /// store checks them; this only rejects self-reference.
    pub fn apply_patch(
        &mut self,
        patch: TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusChange>> {
        patch.validate()?;
        if let Some(Some(parent)) = &patch.parent_task_id
            && parent == &self.id
        {
            return Err(Error::validation("a task cannot be its own parent"));
        }

        let TaskPatch {
            task_name,
            description,
            action_required,
            due_date,
            category,
            status,
            project_path,
            parent_task_id,
            priority,
            metadata,
            completion_report,
        } = patch;

        if let Some(name) = task_name {
            self.task_name = name.trim().to_string();
        }
        if let Some(v) = description {
            self.description = v;
        }
        if let Some(v) = action_required {
            self.action_required = v;
        }
        if let Some(v) = due_date {
            self.due_date = v;
        }
        if let Some(v) = category {
            self.category = v;
        }
        if let Some(v) = project_path {
            self.project_path = v;
        }
        if let Some(v) = parent_task_id {
            self.parent_task_id = v;
        }
        if let Some(v) = priority {
            self.priority = v;
        }
        if let Some(v) = metadata {
            self.metadata = v;
        }

        let mut change = None;
        if let Some(next) = status {
            let previous = self.status;
            if next != previous {
                change = Some(StatusChange {
                    from: previous,
                    to: next,
                });
                self.status = next;
                if next == TaskStatus::Completed {
                    self.completed_at = Some(now);
                } else {
                    self.completed_at = None;
                    self.completion_report = None;
                }
            }
            if next == TaskStatus::Completed && completion_report.is_some() {
                self.completion_report = completion_report;
            }
        }

        self.updated_at = next_stamp(self.updated_at, now);
        Ok(change)
    }

    /// Whether the pairing of status with its completion fields holds.
    #[must_use]
    pub const fn completion_consistent(&self) -> bool {
        match self.status {
            TaskStatus::Completed => self.completed_at.is_some(),
            _ => self.completed_at.is_none() && self.completion_report.is_none(),
        }
    }
}

/// Creation input for a task.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewTask {
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub action_required: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub completion_report: Option<String>,
}

impl NewTask {
    pub fn named(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_project(mut self, project_path: impl Into<String>) -> Self {
        self.project_path = Some(project_path.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    /// Decode a loose JSON field map as sent by the API layer.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        reject_store_owned_fields(&value)?;
        serde_json::from_value(value).map_err(|e| Error::validation(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        validate_task_name(&self.task_name)?;
        if self.completion_report.is_some() && self.status != Some(TaskStatus::Completed) {
            return Err(Error::validation(
                "completion_report requires status=completed",
            ));
        }
        if let Some(parent) = &self.parent_task_id {
            validate_record_id(parent)?;
        }
        validate_optional_key("project_path", self.project_path.as_deref())?;
        Ok(())
    }
}

/// Partial update for a task. `None` leaves a field untouched; for nullable
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskPatch {
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub action_required: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "double_option")]
    pub category: Option<Option<String>>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default, deserialize_with = "double_option")]
    pub project_path: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub parent_task_id: Option<Option<String>>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub completion_report: Option<String>,
}

impl TaskPatch {
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn complete(report: Option<String>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            completion_report: report,
            ..Self::default()
        }
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        reject_store_owned_fields(&value)?;
        serde_json::from_value(value).map_err(|e| Error::validation(e.to_string()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.task_name {
            validate_task_name(name)?;
        }
        if self.completion_report.is_some() && self.status != Some(TaskStatus::Completed) {
            return Err(Error::validation(
                "completion_report requires status=completed",
            ));
        }
        if let Some(Some(parent)) = &self.parent_task_id {
            validate_record_id(parent)?;
        }
        if let Some(project) = &self.project_path {
            validate_optional_key("project_path", project.as_deref())?;
        }
        Ok(())
    }
}

fn reject_store_owned_fields(value: &serde_json::Value) -> Result<()> {
    let Some(map) = value.as_object() else {
        return Err(Error::validation("expected a JSON object of fields"));
    };
    for owned in ["id", "created_at", "updated_at", "completed_at"] {
        if map.contains_key(owned) {
            return Err(Error::validation(format!(
                "{owned} is assigned by the store and cannot be set"
            )));
        }
    }
    Ok(())
}

fn validate_task_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("task_name is required"));
    }
    Ok(())
}

fn validate_optional_key(field: &str, value: Option<&str>) -> Result<()> {
    if let Some(v) = value
        && v.trim().is_empty()
    {
        return Err(Error::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

// =============================================================================
// Ids and keys
// =============================================================================

/// Fresh task id: `t-` followed by 16 lowercase hex characters.
pub fn generate_task_id() -> Result<String> {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf)
        .map_err(|e| Error::Internal(format!("OS random source failed: {e}")))?;
    Ok(format!("t-{}", hex::encode(buf)))
}

/// Ids double as file names, so they are restricted to `[A-Za-z0-9_-]`.
pub fn validate_record_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(Error::validation(format!("invalid id {id:?}")));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(Error::validation(format!("invalid id {id:?}")));
    }
    Ok(())
}

fn key_slug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9._-]+").expect("valid regex"))
}

/// File key for a project: a filesystem-safe slug of the path plus a short
/// SHA-1 suffix so distinct paths never collide.
#[must_use]
pub fn project_key(project_path: &str) -> String {
    let lowered = project_path.trim().to_lowercase();
    let slug = key_slug_re().replace_all(&lowered, "-");
    let slug = slug.trim_matches(|c| c == '-' || c == '.');
    let slug: String = slug.chars().take(48).collect();
    let slug = if slug.is_empty() { "project".to_string() } else { slug };

    let mut hasher = Sha1::new();
    hasher.update(project_path.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{slug}-{}", &digest[..8])
}

/// `project_path` used when a project is created without one.
#[must_use]
pub fn default_project_path(project_name: &str) -> String {
    project_name.trim().to_lowercase().replace(' ', "-")
}

// =============================================================================
// Project
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub project_path: String,
    pub project_name: String,
    pub description: Option<String>,
    #[serde(with = "ts_micros")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "ts_micros")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewProject {
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewProject {
    pub fn named(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            ..Self::default()
        }
    }

    pub fn into_project(self, now: DateTime<Utc>) -> Result<Project> {
        let name = self.project_name.trim();
        if name.is_empty() {
            return Err(Error::validation("project_name is required"));
        }
        let path = self
            .project_path
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| default_project_path(name));
        if path.is_empty() {
            return Err(Error::validation("project_path is required"));
        }
        Ok(Project {
            project_path: path,
            project_name: name.to_string(),
            description: self.description,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectPatch {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
}

impl Project {
    pub fn apply_patch(&mut self, patch: ProjectPatch, now: DateTime<Utc>) -> Result<()> {
        if let Some(name) = patch.project_name {
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::validation("project_name must not be empty"));
            }
            self.project_name = name.to_string();
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        self.updated_at = next_stamp(self.updated_at, now);
        Ok(())
    }
}

/// Per-status task totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
        }
    }
}

/// A project with its derived task counts. `implicit` projects are
/// referenced by tasks but have no project file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSummary {
    pub project_path: String,
    pub project_name: Option<String>,
    pub description: Option<String>,
    pub implicit: bool,
    pub task_count: usize,
    pub pending_count: usize,
    pub in_progress_count: usize,
    pub completed_count: usize,
}

impl ProjectSummary {
    #[must_use]
    pub fn new(project_path: String, project: Option<&Project>, stats: TaskStats) -> Self {
        Self {
            project_path,
            project_name: project.map(|p| p.project_name.clone()),
            description: project.and_then(|p| p.description.clone()),
            implicit: project.is_none(),
            task_count: stats.total,
            pending_count: stats.pending,
            in_progress_count: stats.in_progress,
            completed_count: stats.completed,
        }
    }
}

// =============================================================================
// Listing
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub status: Option<TaskStatus>,
    pub project_path: Option<String>,
    pub category: Option<String>,
    pub parent_task_id: Option<String>,
    /// Exclude subtasks.
    pub top_level_only: bool,
    pub limit: Option<usize>,
}

impl ListFilter {
    #[must_use]
    pub const fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn project(mut self, project_path: impl Into<String>) -> Self {
        self.project_path = Some(project_path.into());
        self
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    #[must_use]
    pub const fn top_level(mut self) -> Self {
        self.top_level_only = true;
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        if self.status.is_some_and(|s| s != task.status) {
            return false;
        }
        if let Some(project) = &self.project_path
            && task.project_path.as_ref() != Some(project)
        {
            return false;
        }
        if let Some(category) = &self.category
            && task.category.as_ref() != Some(category)
        {
            return false;
        }
        if let Some(parent) = &self.parent_task_id
            && task.parent_task_id.as_ref() != Some(parent)
        {
            return false;
        }
        !(self.top_level_only && task.is_subtask())
    }
}
