//! Core records, error taxonomy, and configuration for taskvault.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod models;
pub mod paths;

pub use config::{Config, ConfigEntry, ConfigSource};
pub use error::{Error, RecordKind, Result};
pub use models::{
    ListFilter, Metadata, MetadataValue, NewProject, NewTask, Project, ProjectPatch,
    ProjectSummary, StatusChange, Task, TaskPatch, TaskStats, TaskStatus,
};
