//! taskvault - git-backed task store
//!
//! Operator CLI over the record store. Results are JSON on stdout; errors are
//! `{"error": <type>, "message": ...}` on stderr.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use taskvault_core::config::{redact_remote_url, update_envfile};
use taskvault_core::paths::env_file_path;
use taskvault_core::{
    Config, Error, ListFilter, MetadataValue, NewProject, NewTask, ProjectPatch, Result,
    TaskPatch, TaskStatus,
};
use taskvault_storage::{OpenOptions, RepositoryStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taskvault")]
#[command(version, about = "Git-backed task store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a task
    Create(CreateArgs),
    /// Show one task
    Show { id: String },
    /// Update fields of a task
    Update(UpdateArgs),
    /// Mark a task completed
    Complete {
        id: String,
        /// Completion report stored with the task
        #[arg(long)]
        report: Option<String>,
    },
    /// Delete a task (its subtasks are kept)
    Delete { id: String },
    /// List tasks
    List(ListArgs),
    /// List the subtasks of a task
    Subtasks { id: String },
    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Task counts per status
    Stats {
        #[arg(long)]
        project: Option<String>,
    },
    /// Fetch, reconcile and push now
    Sync,
    /// Show sync status
    Status,
    /// Configure the remote
    #[command(subcommand)]
    Remote(RemoteCommand),
    /// Show effective configuration
    Config,
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Task name (may instead come from --json)
    task_name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long = "action")]
    action_required: Option<String>,
    /// Due date, YYYY-MM-DD
    #[arg(long)]
    due: Option<NaiveDate>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long, value_parser = parse_status)]
    status: Option<TaskStatus>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    parent: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    priority: Option<i64>,
    /// Metadata entry KEY=VALUE (repeatable); VALUE is parsed as a JSON scalar when possible
    #[arg(long = "meta", value_parser = parse_meta)]
    metadata: Vec<(String, MetadataValue)>,
    /// Full field map as a JSON object; flags override it
    #[arg(long)]
    json: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ClearField {
    Description,
    Action,
    Due,
    Category,
    Project,
    Parent,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long = "action")]
    action_required: Option<String>,
    #[arg(long)]
    due: Option<NaiveDate>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long, value_parser = parse_status)]
    status: Option<TaskStatus>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    parent: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    priority: Option<i64>,
    /// Completion report (requires --status completed)
    #[arg(long)]
    report: Option<String>,
    /// Replace metadata with these KEY=VALUE entries
    #[arg(long = "meta", value_parser = parse_meta)]
    metadata: Vec<(String, MetadataValue)>,
    /// Set a nullable field to null (repeatable)
    #[arg(long, value_enum)]
    clear: Vec<ClearField>,
    /// Patch as a JSON object; flags override it
    #[arg(long)]
    json: Option<String>,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long, value_parser = parse_status)]
    status: Option<TaskStatus>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    parent: Option<String>,
    /// Exclude subtasks
    #[arg(long)]
    top_level: bool,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum ProjectCommand {
    /// Create a project
    Create {
        name: String,
        /// Project key; defaults to the lowercased name with dashes
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Show one project
    Show { path: String },
    /// List projects with task counts
    List,
    /// Rename or re-describe a project
    Update {
        path: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, conflicts_with = "clear_description")]
        description: Option<String>,
        #[arg(long)]
        clear_description: bool,
    },
    /// Delete a project (its tasks are kept)
    Delete { path: String },
}

#[derive(Subcommand, Debug)]
enum RemoteCommand {
    /// Point the repository at a remote and persist it in the user env file
    Set { url: String },
}

fn parse_status(raw: &str) -> std::result::Result<TaskStatus, String> {
    raw.parse().map_err(|e: Error| e.to_string())
}

fn parse_meta(raw: &str) -> std::result::Result<(String, MetadataValue), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("metadata key is empty".to_string());
    }
    let value =
        serde_json::from_str::<MetadataValue>(value).unwrap_or_else(|_| MetadataValue::from(value));
    Ok((key.to_string(), value))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command, config) {
        Ok(value) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| "null".to_string())
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            let body = json!({ "error": err.error_type(), "message": err.to_string() });
            eprintln!("{body}");
            ExitCode::from(exit_code(&err))
        }
    }
}

const fn exit_code(err: &Error) -> u8 {
    if err.is_caller_error() { 2 } else { 1 }
}

fn open(config: Config) -> Result<RepositoryStore> {
    RepositoryStore::open_with(config, OpenOptions::manual())
}

fn run(command: Commands, config: Config) -> Result<Value> {
    match command {
        Commands::Config => Ok(serde_json::to_value(config.describe())?),
        Commands::Remote(RemoteCommand::Set { url }) => set_remote(config, &url),
        Commands::Project(cmd) => run_project(cmd, &open(config)?),
        command => run_task(command, &open(config)?),
    }
}

fn run_task(command: Commands, store: &RepositoryStore) -> Result<Value> {
    let value = match command {
        Commands::Create(args) => serde_json::to_value(store.create_task(new_task(args)?)?)?,
        Commands::Show { id } => serde_json::to_value(store.read_task(&id)?)?,
        Commands::Update(args) => {
            let id = args.id.clone();
            serde_json::to_value(store.update_task(&id, task_patch(args)?)?)?
        }
        Commands::Complete { id, report } => {
            serde_json::to_value(store.update_task(&id, TaskPatch::complete(report))?)?
        }
        Commands::Delete { id } => {
            store.delete_task(&id)?;
            json!({ "deleted": id })
        }
        Commands::List(args) => {
            let listing = store.list_tasks(&list_filter(args))?;
            json!({
                "tasks": serde_json::to_value(listing.iter().collect::<Vec<_>>())?,
                "warnings": serde_json::to_value(listing.warnings())?,
            })
        }
        Commands::Subtasks { id } => serde_json::to_value(store.subtasks(&id)?)?,
        Commands::Stats { project } => serde_json::to_value(store.task_stats(project.as_deref())?)?,
        Commands::Sync => serde_json::to_value(store.sync_now()?)?,
        Commands::Status => serde_json::to_value(store.status())?,
        Commands::Project(_) | Commands::Remote(_) | Commands::Config => {
            return Err(Error::Internal("command routed to the wrong handler".into()));
        }
    };
    Ok(value)
}

fn run_project(command: ProjectCommand, store: &RepositoryStore) -> Result<Value> {
    let value = match command {
        ProjectCommand::Create {
            name,
            path,
            description,
        } => {
            let new = NewProject {
                project_name: name,
                project_path: path,
                description,
            };
            serde_json::to_value(store.create_project(new)?)?
        }
        ProjectCommand::Show { path } => serde_json::to_value(store.read_project(&path)?)?,
        ProjectCommand::List => serde_json::to_value(store.list_projects()?)?,
        ProjectCommand::Update {
            path,
            name,
            description,
            clear_description,
        } => {
            let patch = ProjectPatch {
                project_name: name,
                description: if clear_description {
                    Some(None)
                } else {
                    description.map(Some)
                },
            };
            serde_json::to_value(store.update_project(&path, patch)?)?
        }
        ProjectCommand::Delete { path } => {
            store.delete_project(&path)?;
            json!({ "deleted": path })
        }
    };
    Ok(value)
}

fn set_remote(config: Config, url: &str) -> Result<Value> {
    let store = open(config)?;
    store.set_remote(url)?;

    let env_file = env_file_path();
    if let Some(parent) = env_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let updates = HashMap::from([("TASKS_REPO_REMOTE", url.trim().to_string())]);
    update_envfile(&env_file, &updates)?;
    tracing::info!(env_file = %env_file.display(), "remote saved");

    Ok(json!({
        "remote_url": redact_remote_url(url.trim()),
        "env_file": env_file.display().to_string(),
    }))
}

fn new_task(args: CreateArgs) -> Result<NewTask> {
    let mut new = match args.json {
        Some(raw) => NewTask::from_json(parse_json_object(&raw)?)?,
        None => NewTask::default(),
    };
    if let Some(name) = args.task_name {
        new.task_name = name;
    }
    if args.description.is_some() {
        new.description = args.description;
    }
    if args.action_required.is_some() {
        new.action_required = args.action_required;
    }
    if args.due.is_some() {
        new.due_date = args.due;
    }
    if args.category.is_some() {
        new.category = args.category;
    }
    if args.status.is_some() {
        new.status = args.status;
    }
    if args.project.is_some() {
        new.project_path = args.project;
    }
    if args.parent.is_some() {
        new.parent_task_id = args.parent;
    }
    if args.priority.is_some() {
        new.priority = args.priority;
    }
    new.metadata.extend(args.metadata);
    Ok(new)
}

fn task_patch(args: UpdateArgs) -> Result<TaskPatch> {
    let mut patch = match args.json {
        Some(raw) => TaskPatch::from_json(parse_json_object(&raw)?)?,
        None => TaskPatch::default(),
    };
    if args.name.is_some() {
        patch.task_name = args.name;
    }
    if let Some(v) = args.description {
        patch.description = Some(Some(v));
    }
    if let Some(v) = args.action_required {
        patch.action_required = Some(Some(v));
    }
    if let Some(v) = args.due {
        patch.due_date = Some(Some(v));
    }
    if let Some(v) = args.category {
        patch.category = Some(Some(v));
    }
    if args.status.is_some() {
        patch.status = args.status;
    }
    if let Some(v) = args.project {
        patch.project_path = Some(Some(v));
    }
    if let Some(v) = args.parent {
        patch.parent_task_id = Some(Some(v));
    }
    if args.priority.is_some() {
        patch.priority = args.priority;
    }
    if args.report.is_some() {
        patch.completion_report = args.report;
    }
    if !args.metadata.is_empty() {
        patch.metadata = Some(args.metadata.into_iter().collect());
    }
    for field in args.clear {
        match field {
            ClearField::Description => patch.description = Some(None),
            ClearField::Action => patch.action_required = Some(None),
            ClearField::Due => patch.due_date = Some(None),
            ClearField::Category => patch.category = Some(None),
            ClearField::Project => patch.project_path = Some(None),
            ClearField::Parent => patch.parent_task_id = Some(None),
        }
    }
    if patch.is_empty() {
        return Err(Error::validation("nothing to update"));
    }
    Ok(patch)
}

fn list_filter(args: ListArgs) -> ListFilter {
    ListFilter {
        status: args.status,
        project_path: args.project,
        category: args.category,
        parent_task_id: args.parent,
        top_level_only: args.top_level,
        limit: args.limit,
    }
}

fn parse_json_object(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| Error::validation(format!("invalid --json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            repo_path: dir.path().join("repo"),
            auto_sync_enabled: false,
            sync_on_startup: false,
            sync_on_close: false,
            ..Config::default()
        }
    }

    fn parse(args: &[&str]) -> Commands {
        let mut argv = vec!["taskvault"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().command
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn meta_values_parse_as_json_scalars() {
        assert_eq!(
            parse_meta("points=3").unwrap(),
            ("points".to_string(), MetadataValue::from(3_i64))
        );
        assert_eq!(
            parse_meta("owner=alice").unwrap().1,
            MetadataValue::from("alice")
        );
        assert_eq!(parse_meta("flag=true").unwrap().1, MetadataValue::from(true));
        assert!(parse_meta("novalue").is_err());
        assert!(parse_meta("=x").is_err());
    }

    #[test]
    fn status_flag_rejects_unknown_values() {
        assert!(Cli::try_parse_from(["taskvault", "list", "--status", "blocked"]).is_err());
    }

    #[test]
    fn create_update_complete_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let created = run(
            parse(&["create", "Write docs", "--priority", "-1", "--meta", "pts=2"]),
            config.clone(),
        )
        .unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["priority"], -1);
        assert_eq!(created["metadata"]["pts"], 2);

        let updated = run(
            parse(&["update", &id, "--status", "in_progress", "--category", "docs"]),
            config.clone(),
        )
        .unwrap();
        assert_eq!(updated["status"], "in_progress");

        let done = run(
            parse(&["complete", &id, "--report", "published"]),
            config.clone(),
        )
        .unwrap();
        assert_eq!(done["status"], "completed");
        assert_eq!(done["completion_report"], "published");

        let listed = run(parse(&["list", "--status", "completed"]), config.clone()).unwrap();
        assert_eq!(listed["tasks"].as_array().unwrap().len(), 1);

        let cleared = run(parse(&["update", &id, "--clear", "category"]), config).unwrap();
        assert_eq!(cleared["category"], Value::Null);
    }

    #[test]
    fn caller_errors_exit_with_two() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let err = run(parse(&["show", "t-0000000000000000"]), config.clone()).unwrap_err();
        assert_eq!(err.error_type(), "NOT_FOUND");
        assert_eq!(exit_code(&err), 2);

        let err = run(parse(&["update", "t-0000000000000000"]), config).unwrap_err();
        assert_eq!(err.error_type(), "VALIDATION_ERROR");

        assert_eq!(exit_code(&Error::Sync("rejected".into())), 1);
    }

    #[test]
    fn projects_via_cli() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let project = run(parse(&["project", "create", "Side Quest"]), config.clone()).unwrap();
        assert_eq!(project["project_path"], "side-quest");

        run(
            parse(&["create", "explore", "--project", "side-quest"]),
            config.clone(),
        )
        .unwrap();
        let list = run(parse(&["project", "list"]), config.clone()).unwrap();
        assert_eq!(list[0]["task_count"], 1);

        let sync = run(parse(&["sync"]), config).unwrap();
        assert_eq!(sync["outcome"], "no_remote");
    }
}
