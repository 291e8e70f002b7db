//! Command surface for driving the quick course completion aggregator
//! against a SQLite copy of the host's completion tables.
//!
//! Embedders can call:
//! - [`run_cli`] for full parsed CLI execution, printing JSON to stdout.
//! - [`run_cli_json`] for the same execution returning the JSON document.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use quick_completion_core::{
    now_utc, parse_rfc3339_utc, ActivityCompletion, ActivityCompletionState, AggregationMethod,
    Aggregator, CompletionCriterion, ContextLevel, CourseGrade, CriterionType, EventContext,
    ModuleCompletionUpdatedEvent, Settings, UserGradedEvent,
};
use quick_completion_store_sqlite::SqliteCompletionStore;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_STUDENT_ROLE: i64 = 5;

#[derive(Debug, Parser)]
#[command(name = "qcc")]
#[command(about = "Quick course completion CLI")]
pub struct Cli {
    #[arg(long, default_value = "./quick_completion.sqlite3")]
    db: PathBuf,

    /// JSON settings file layered over the stored plugin settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create or upgrade the completion tables.
    Migrate,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Seed {
        #[command(subcommand)]
        command: Box<SeedCommand>,
    },
    Event {
        #[command(subcommand)]
        command: EventCommand,
    },
    /// Re-aggregate course completion for one user.
    Aggregate(CourseUserArgs),
    Status(StatusArgs),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective settings.
    Show,
    /// Persist plugin and site switches.
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    #[arg(long)]
    enabled: Option<bool>,
    #[arg(long)]
    site_completion: Option<bool>,
}

#[derive(Debug, Subcommand)]
pub enum SeedCommand {
    Course(SeedCourseArgs),
    Module(SeedModuleArgs),
    Enrol(SeedEnrolArgs),
    Criterion(SeedCriterionArgs),
    Method(SeedMethodArgs),
    Activity(SeedActivityArgs),
    Grade(SeedGradeArgs),
}

#[derive(Debug, Args)]
pub struct SeedCourseArgs {
    #[arg(long)]
    id: i64,
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    completion_enabled: bool,
}

#[derive(Debug, Args)]
pub struct SeedModuleArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    course: i64,
}

#[derive(Debug, Args)]
pub struct SeedEnrolArgs {
    #[arg(long)]
    course: i64,
    #[arg(long)]
    user: i64,
    #[arg(long, default_value_t = DEFAULT_STUDENT_ROLE)]
    role: i64,
}

#[derive(Debug, Args)]
pub struct SeedCriterionArgs {
    #[arg(long)]
    course: i64,
    #[arg(long = "type")]
    criterion_type: CriterionTypeArg,
    /// Course module id for activity criteria.
    #[arg(long)]
    module: Option<i64>,
    /// Prerequisite course id for course criteria.
    #[arg(long)]
    course_instance: Option<i64>,
    #[arg(long)]
    role: Option<i64>,
    #[arg(long)]
    grade_pass: Option<f64>,
}

#[derive(Debug, Args)]
pub struct SeedMethodArgs {
    #[arg(long)]
    course: i64,
    /// Omit for the course-level (overall) method.
    #[arg(long = "type")]
    criterion_type: Option<CriterionTypeArg>,
    #[arg(long)]
    method: MethodArg,
}

#[derive(Debug, Args)]
pub struct SeedActivityArgs {
    #[arg(long)]
    module: i64,
    #[arg(long)]
    user: i64,
    #[arg(long, default_value = "complete")]
    state: StateArg,
    #[arg(long)]
    time: Option<String>,
}

#[derive(Debug, Args)]
pub struct SeedGradeArgs {
    #[arg(long)]
    course: i64,
    #[arg(long)]
    user: i64,
    #[arg(long)]
    grade: Option<f64>,
    #[arg(long)]
    time: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    /// Dispatch a "user graded" event.
    Graded(GradedArgs),
    /// Record an activity completion state and dispatch the matching
    /// "course module completion updated" event.
    ModuleCompleted(SeedActivityArgs),
}

#[derive(Debug, Args)]
pub struct GradedArgs {
    #[arg(long)]
    user: i64,
    #[arg(long)]
    course: i64,
    #[arg(long)]
    item: i64,
    #[arg(long, default_value = "course")]
    context_level: ContextLevelArg,
}

#[derive(Debug, Args)]
pub struct CourseUserArgs {
    #[arg(long)]
    course: i64,
    #[arg(long)]
    user: i64,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    course: i64,
    /// Omit to list every course completion row of the course.
    #[arg(long)]
    user: Option<i64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CriterionTypeArg {
    #[value(name = "self")]
    SelfCompletion,
    Date,
    Unenrol,
    Activity,
    Duration,
    Grade,
    Role,
    Course,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MethodArg {
    All,
    Any,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StateArg {
    Incomplete,
    Complete,
    CompletePass,
    CompleteFail,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ContextLevelArg {
    System,
    User,
    CourseCategory,
    Course,
    Module,
    Block,
}

impl From<CriterionTypeArg> for CriterionType {
    fn from(value: CriterionTypeArg) -> Self {
        match value {
            CriterionTypeArg::SelfCompletion => Self::SelfCompletion,
            CriterionTypeArg::Date => Self::Date,
            CriterionTypeArg::Unenrol => Self::Unenrol,
            CriterionTypeArg::Activity => Self::Activity,
            CriterionTypeArg::Duration => Self::Duration,
            CriterionTypeArg::Grade => Self::Grade,
            CriterionTypeArg::Role => Self::Role,
            CriterionTypeArg::Course => Self::Course,
        }
    }
}

impl From<MethodArg> for AggregationMethod {
    fn from(value: MethodArg) -> Self {
        match value {
            MethodArg::All => Self::All,
            MethodArg::Any => Self::Any,
        }
    }
}

impl From<StateArg> for ActivityCompletionState {
    fn from(value: StateArg) -> Self {
        match value {
            StateArg::Incomplete => Self::Incomplete,
            StateArg::Complete => Self::Complete,
            StateArg::CompletePass => Self::CompletePass,
            StateArg::CompleteFail => Self::CompleteFail,
        }
    }
}

impl From<ContextLevelArg> for ContextLevel {
    fn from(value: ContextLevelArg) -> Self {
        match value {
            ContextLevelArg::System => Self::System,
            ContextLevelArg::User => Self::User,
            ContextLevelArg::CourseCategory => Self::CourseCategory,
            ContextLevelArg::Course => Self::Course,
            ContextLevelArg::Module => Self::Module,
            ContextLevelArg::Block => Self::Block,
        }
    }
}

/// Executes a parsed CLI invocation and prints its JSON result.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, the
/// settings file is invalid, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let output = run_cli_json(cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Executes a parsed CLI invocation and returns its JSON result.
///
/// # Errors
/// See [`run_cli`].
pub fn run_cli_json(cli: Cli) -> Result<Value> {
    run_with_db(&cli.db, cli.config.as_deref(), cli.command)
}

/// Opens and migrates the database at `db_path`, then runs `command`.
///
/// # Errors
/// See [`run_cli`].
pub fn run_with_db(db_path: &Path, config_path: Option<&Path>, command: Command) -> Result<Value> {
    let mut store = SqliteCompletionStore::open(db_path)?;
    store.migrate()?;

    match command {
        Command::Migrate => Ok(json!({ "migrated": true, "db": db_path.display().to_string() })),
        Command::Config { command } => run_config(command, &store, config_path),
        Command::Seed { command } => run_seed(*command, &mut store),
        Command::Event { command } => {
            let settings = effective_settings(&store, config_path)?;
            run_event(command, store, settings)
        }
        Command::Aggregate(args) => {
            let settings = effective_settings(&store, config_path)?;
            let mut aggregator = Aggregator::new(store, settings);
            let outcome = aggregator.aggregate_course(args.course, args.user)?;
            Ok(serde_json::to_value(outcome)?)
        }
        Command::Status(args) => match args.user {
            Some(user_id) => Ok(serde_json::to_value(
                store.completion_status(args.course, user_id)?,
            )?),
            None => Ok(serde_json::to_value(
                store.list_course_completions(args.course)?,
            )?),
        },
    }
}

fn run_config(
    command: ConfigCommand,
    store: &SqliteCompletionStore,
    config_path: Option<&Path>,
) -> Result<Value> {
    match command {
        ConfigCommand::Show => Ok(serde_json::to_value(effective_settings(store, config_path)?)?),
        ConfigCommand::Set(args) => {
            let mut settings = store.load_settings()?;
            if let Some(enabled) = args.enabled {
                settings.enabled = enabled;
            }
            if let Some(site_completion) = args.site_completion {
                settings.site_completion_enabled = site_completion;
            }
            store.save_settings(&settings)?;
            Ok(serde_json::to_value(settings)?)
        }
    }
}

fn run_seed(command: SeedCommand, store: &mut SqliteCompletionStore) -> Result<Value> {
    match command {
        SeedCommand::Course(args) => {
            store.insert_course(args.id, &args.name, args.completion_enabled)?;
            Ok(json!({ "course_id": args.id, "completion_enabled": args.completion_enabled }))
        }
        SeedCommand::Module(args) => {
            store.insert_course_module(args.id, args.course)?;
            Ok(json!({ "course_module_id": args.id, "course_id": args.course }))
        }
        SeedCommand::Enrol(args) => {
            store.enrol_user(args.course, args.user, args.role)?;
            Ok(json!({ "course_id": args.course, "user_id": args.user, "role_id": args.role }))
        }
        SeedCommand::Criterion(args) => {
            let criterion_type = CriterionType::from(args.criterion_type);
            validate_criterion_args(criterion_type, &args)?;
            let mut criterion = CompletionCriterion {
                id: 0,
                course_id: args.course,
                criterion_type,
                module_instance: args.module,
                course_instance: args.course_instance,
                role: args.role,
                grade_pass: args.grade_pass,
            };
            criterion.id = store.insert_criterion(&criterion)?;
            Ok(serde_json::to_value(criterion)?)
        }
        SeedCommand::Method(args) => {
            let criterion_type = args.criterion_type.map(CriterionType::from);
            let method = AggregationMethod::from(args.method);
            store.set_aggregation_method(args.course, criterion_type, method)?;
            Ok(json!({
                "course_id": args.course,
                "criterion_type": criterion_type,
                "method": method,
            }))
        }
        SeedCommand::Activity(args) => {
            let completion = activity_completion(&args)?;
            store.upsert_activity_completion(&completion)?;
            Ok(serde_json::to_value(completion)?)
        }
        SeedCommand::Grade(args) => {
            let grade = CourseGrade {
                course_id: args.course,
                user_id: args.user,
                final_grade: args.grade,
                time_modified: parse_optional_utc(args.time.as_deref())?,
            };
            let item_id = store.upsert_course_grade(&grade)?;
            Ok(json!({ "grade_item_id": item_id, "grade": grade }))
        }
    }
}

fn run_event(
    command: EventCommand,
    store: SqliteCompletionStore,
    settings: Settings,
) -> Result<Value> {
    let mut aggregator = Aggregator::new(store, settings);
    let outcome = match command {
        EventCommand::Graded(args) => {
            let event = UserGradedEvent {
                user_id: args.user,
                context: EventContext {
                    level: args.context_level.into(),
                    instance_id: args.course,
                },
                item_id: args.item,
            };
            aggregator.user_graded(&event)?
        }
        EventCommand::ModuleCompleted(args) => {
            let snapshot = activity_completion(&args)?;
            aggregator
                .repository()
                .upsert_activity_completion(&snapshot)?;
            let event = ModuleCompletionUpdatedEvent {
                user_id: snapshot.user_id,
                course_module_id: snapshot.course_module_id,
                snapshot,
            };
            aggregator.course_module_completion_updated(&event)?
        }
    };
    Ok(serde_json::to_value(outcome)?)
}

/// Defaults, then stored settings, then the `--config` file; later wins.
fn effective_settings(store: &SqliteCompletionStore, config_path: Option<&Path>) -> Result<Settings> {
    let stored = store.load_settings()?;
    let Some(path) = config_path else {
        return Ok(stored);
    };

    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file {}", path.display()))?;
    let overlay: Value = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse settings file {}", path.display()))?;
    let settings = merge_settings(stored, &overlay)
        .with_context(|| format!("invalid settings file {}", path.display()))?;
    debug!(?settings, "settings file applied");
    Ok(settings)
}

fn merge_settings(base: Settings, overlay: &Value) -> Result<Settings> {
    let Value::Object(fields) = overlay else {
        return Err(anyhow!("settings file must contain a JSON object"));
    };
    let mut merged = serde_json::to_value(base)?;
    if let Value::Object(target) = &mut merged {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
    Ok(Settings::from_json(&merged)?)
}

fn validate_criterion_args(criterion_type: CriterionType, args: &SeedCriterionArgs) -> Result<()> {
    match criterion_type {
        CriterionType::Activity if args.module.is_none() => {
            Err(anyhow!("activity criteria require --module"))
        }
        CriterionType::Grade if args.grade_pass.is_none() => {
            Err(anyhow!("grade criteria require --grade-pass"))
        }
        CriterionType::Course if args.course_instance.is_none() => {
            Err(anyhow!("course criteria require --course-instance"))
        }
        CriterionType::Role if args.role.is_none() => Err(anyhow!("role criteria require --role")),
        _ => Ok(()),
    }
}

fn activity_completion(args: &SeedActivityArgs) -> Result<ActivityCompletion> {
    Ok(ActivityCompletion {
        course_module_id: args.module,
        user_id: args.user,
        state: args.state.into(),
        time_modified: parse_optional_utc(args.time.as_deref())?,
    })
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => Ok(parse_rfc3339_utc(value)?),
        None => Ok(now_utc()),
    }
}
