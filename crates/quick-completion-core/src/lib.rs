//! Accelerated course-completion aggregation for a learning-management host.
//!
//! The host's records are reached only through [`CompletionRepository`]; the
//! [`Aggregator`] reacts to grade and activity-completion events, marks the
//! criteria they satisfy and re-aggregates course completion for that user
//! without waiting for the host's completion cron.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

mod aggregation;
mod evaluator;
mod observer;

#[cfg(test)]
mod test_support;

pub use aggregation::{
    aggregate_statuses, fold_status, group_rows, AggregationMethods, CourseVerdict, StatusBucket,
};
pub use evaluator::{
    activity_satisfaction, evaluate_activity_criteria, evaluate_grade_criteria, grade_satisfaction,
    Satisfaction,
};
pub use observer::{
    AggregationReport, Aggregator, ContextLevel, EventContext, HandlerOutcome,
    ModuleCompletionUpdatedEvent, SkipReason, UserGradedEvent,
};

/// Component name under which the host stores this plugin's settings.
pub const PLUGIN_COMPONENT: &str = "local_quick_course_completion";
/// Plugin setting that gates both event handlers.
pub const ENABLE_SETTING: &str = "enable";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CompletionError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Completion criterion kinds, numbered with the host's type codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CriterionType {
    SelfCompletion,
    Date,
    Unenrol,
    Activity,
    Duration,
    Grade,
    Role,
    Course,
}

impl CriterionType {
    pub const ALL: [Self; 8] = [
        Self::SelfCompletion,
        Self::Date,
        Self::Unenrol,
        Self::Activity,
        Self::Duration,
        Self::Grade,
        Self::Role,
        Self::Course,
    ];

    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::SelfCompletion => 1,
            Self::Date => 2,
            Self::Unenrol => 3,
            Self::Activity => 4,
            Self::Duration => 5,
            Self::Grade => 6,
            Self::Role => 7,
            Self::Course => 8,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfCompletion => "self",
            Self::Date => "date",
            Self::Unenrol => "unenrol",
            Self::Activity => "activity",
            Self::Duration => "duration",
            Self::Grade => "grade",
            Self::Role => "role",
            Self::Course => "course",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Bucket this criterion type is folded into during course aggregation.
    #[must_use]
    pub fn bucket(self) -> StatusBucket {
        match self {
            Self::Activity => StatusBucket::Activity,
            Self::Course => StatusBucket::Prerequisite,
            Self::Role => StatusBucket::Role,
            Self::SelfCompletion | Self::Date | Self::Unenrol | Self::Duration | Self::Grade => {
                StatusBucket::Overall
            }
        }
    }
}

impl Display for CriterionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean combinator applied when folding criterion statuses.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    #[default]
    All,
    Any,
}

impl AggregationMethod {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::All => 1,
            Self::Any => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::All),
            2 => Some(Self::Any),
            _ => None,
        }
    }
}

/// Per-user completion state of a course module.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCompletionState {
    Incomplete,
    Complete,
    CompletePass,
    CompleteFail,
}

impl ActivityCompletionState {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Incomplete => 0,
            Self::Complete => 1,
            Self::CompletePass => 2,
            Self::CompleteFail => 3,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Incomplete),
            1 => Some(Self::Complete),
            2 => Some(Self::CompletePass),
            3 => Some(Self::CompleteFail),
            _ => None,
        }
    }

    /// A failed completion still counts: the activity was finished.
    #[must_use]
    pub fn is_complete(self) -> bool {
        !matches!(self, Self::Incomplete)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Course {
    pub id: i64,
    pub completion_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionCriterion {
    pub id: i64,
    pub course_id: i64,
    pub criterion_type: CriterionType,
    pub module_instance: Option<i64>,
    pub course_instance: Option<i64>,
    pub role: Option<i64>,
    pub grade_pass: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionCompletion {
    pub criterion_id: i64,
    pub course_id: i64,
    pub user_id: i64,
    pub grade_final: Option<f64>,
    #[serde(with = "time::serde::timestamp")]
    pub time_completed: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CourseCompletion {
    pub course_id: i64,
    pub user_id: i64,
    #[serde(with = "time::serde::timestamp::option")]
    pub time_enrolled: Option<OffsetDateTime>,
    #[serde(with = "time::serde::timestamp::option")]
    pub time_started: Option<OffsetDateTime>,
    #[serde(with = "time::serde::timestamp::option")]
    pub time_completed: Option<OffsetDateTime>,
    /// Set while the row is waiting to be re-aggregated; `None` once settled.
    #[serde(with = "time::serde::timestamp::option")]
    pub reaggregate: Option<OffsetDateTime>,
}

impl CourseCompletion {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.time_completed.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActivityCompletion {
    pub course_module_id: i64,
    pub user_id: i64,
    pub state: ActivityCompletionState,
    #[serde(with = "time::serde::timestamp")]
    pub time_modified: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CourseGrade {
    pub course_id: i64,
    pub user_id: i64,
    pub final_grade: Option<f64>,
    #[serde(with = "time::serde::timestamp")]
    pub time_modified: OffsetDateTime,
}

/// One criterion of a course paired with the user's completion of it, if any.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AggregationRow {
    pub course_id: i64,
    pub user_id: i64,
    pub criterion_id: i64,
    pub criterion_type: CriterionType,
    #[serde(with = "time::serde::timestamp::option")]
    pub time_completed: Option<OffsetDateTime>,
}

impl AggregationRow {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.time_completed.is_some()
    }
}

/// Runtime settings handed to the [`Aggregator`] at construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Plugin switch; when off both event handlers are no-ops.
    pub enabled: bool,
    /// Site-wide completion tracking switch of the host.
    pub site_completion_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            site_completion_enabled: true,
        }
    }
}

impl Settings {
    /// Decodes settings from JSON; absent fields keep their defaults.
    ///
    /// # Errors
    /// Returns [`CompletionError::Configuration`] when the payload is not an
    /// object of known settings.
    pub fn from_json(value: &Value) -> Result<Self, CompletionError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            CompletionError::Configuration(format!("invalid settings JSON payload: {err}"))
        })
    }

    /// Parses a host-style boolean setting value (`"1"`, `"0"`, `"true"`, ...).
    ///
    /// # Errors
    /// Returns [`CompletionError::Configuration`] for anything else.
    pub fn parse_flag(name: &str, raw: &str) -> Result<bool, CompletionError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "" | "false" | "no" | "off" => Ok(false),
            other => Err(CompletionError::Configuration(format!(
                "setting {name} has non-boolean value {other:?}"
            ))),
        }
    }
}

/// Data access to the host platform's completion tables.
///
/// Reads take `&self`; anything that creates or mutates a completion row
/// takes `&mut self`.
pub trait CompletionRepository {
    fn course(&self, course_id: i64) -> Result<Option<Course>, CompletionError>;

    /// Resolves a course module to the course that owns it.
    fn course_for_module(&self, course_module_id: i64) -> Result<Option<i64>, CompletionError>;

    /// True when `item_id` is the course-level (total) grade item.
    fn is_course_grade_item(&self, item_id: i64) -> Result<bool, CompletionError>;

    /// True when the user holds any role assignment in the course context.
    fn has_course_role(&self, course_id: i64, user_id: i64) -> Result<bool, CompletionError>;

    fn criteria(
        &self,
        course_id: i64,
        criterion_type: CriterionType,
    ) -> Result<Vec<CompletionCriterion>, CompletionError>;

    fn criterion_completion(
        &self,
        criterion_id: i64,
        user_id: i64,
    ) -> Result<Option<CriterionCompletion>, CompletionError>;

    /// Stores a criterion completion unless one already exists for the pair.
    /// Returns `false` when the row was already present.
    fn insert_criterion_completion(
        &mut self,
        completion: &CriterionCompletion,
    ) -> Result<bool, CompletionError>;

    fn activity_completion(
        &self,
        course_module_id: i64,
        user_id: i64,
    ) -> Result<Option<ActivityCompletion>, CompletionError>;

    fn course_grade(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<CourseGrade>, CompletionError>;

    fn course_completion(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<CourseCompletion>, CompletionError>;

    /// Inserts a course completion unless one exists; `false` when it did.
    fn insert_course_completion(
        &mut self,
        completion: &CourseCompletion,
    ) -> Result<bool, CompletionError>;

    /// Persists start and reaggregation markers of an existing row.
    fn update_course_progress(&mut self, completion: &CourseCompletion)
        -> Result<(), CompletionError>;

    /// Sets the completion time if it is still unset and clears the
    /// reaggregation marker. Returns `false` when the row was already final.
    fn finalize_course_completion(
        &mut self,
        course_id: i64,
        user_id: i64,
        time_completed: OffsetDateTime,
    ) -> Result<bool, CompletionError>;

    /// Configured method for the course (`None` type) or for one criterion
    /// type. `Ok(None)` means nothing is configured.
    fn aggregation_method(
        &self,
        course_id: i64,
        criterion_type: Option<CriterionType>,
    ) -> Result<Option<AggregationMethod>, CompletionError>;

    /// Every criterion of the course joined with the user's completion of it,
    /// restricted to an unfinished course completion whose reaggregation
    /// marker is set and earlier than `cutoff`.
    fn reaggregation_rows(
        &self,
        course_id: i64,
        user_id: i64,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<AggregationRow>, CompletionError>;

    /// Completion tracking is on for the course (site switch is checked by
    /// the caller).
    fn completion_enabled(&self, course_id: i64) -> Result<bool, CompletionError> {
        Ok(self
            .course(course_id)?
            .is_some_and(|course| course.completion_enabled))
    }

    fn is_course_complete(&self, course_id: i64, user_id: i64) -> Result<bool, CompletionError> {
        Ok(self
            .course_completion(course_id, user_id)?
            .is_some_and(|completion| completion.is_complete()))
    }
}

/// Host timestamps are unix seconds with `0` meaning "unset".
///
/// # Errors
/// Returns [`CompletionError::Validation`] when the value is out of range.
pub fn from_unix(seconds: i64) -> Result<Option<OffsetDateTime>, CompletionError> {
    if seconds == 0 {
        return Ok(None);
    }
    OffsetDateTime::from_unix_timestamp(seconds)
        .map(Some)
        .map_err(|err| CompletionError::Validation(format!("invalid unix timestamp {seconds}: {err}")))
}

#[must_use]
pub fn to_unix(value: Option<OffsetDateTime>) -> i64 {
    value.map_or(0, OffsetDateTime::unix_timestamp)
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CompletionError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CompletionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CompletionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CompletionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CompletionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CompletionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            CompletionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Current time truncated to whole seconds, the host's resolution.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn criterion_type_codes_match_host_numbering() {
        for kind in CriterionType::ALL {
            assert_eq!(CriterionType::from_code(kind.code()), Some(kind));
            assert_eq!(CriterionType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CriterionType::Activity.code(), 4);
        assert_eq!(CriterionType::Grade.code(), 6);
        assert_eq!(CriterionType::from_code(9), None);
    }

    #[test]
    fn criterion_types_land_in_expected_buckets() {
        assert_eq!(CriterionType::Activity.bucket(), StatusBucket::Activity);
        assert_eq!(CriterionType::Course.bucket(), StatusBucket::Prerequisite);
        assert_eq!(CriterionType::Role.bucket(), StatusBucket::Role);
        assert_eq!(CriterionType::Grade.bucket(), StatusBucket::Overall);
        assert_eq!(CriterionType::SelfCompletion.bucket(), StatusBucket::Overall);
    }

    #[test]
    fn failed_activity_completion_still_counts_as_complete() {
        assert!(ActivityCompletionState::CompleteFail.is_complete());
        assert!(ActivityCompletionState::CompletePass.is_complete());
        assert!(!ActivityCompletionState::Incomplete.is_complete());
    }

    #[test]
    fn settings_default_to_disabled_plugin() {
        let settings = Settings::default();
        assert!(!settings.enabled);
        assert!(settings.site_completion_enabled);

        let partial = must_ok(Settings::from_json(&json!({ "enabled": true })));
        assert!(partial.enabled);
        assert!(partial.site_completion_enabled);
    }

    #[test]
    fn settings_reject_unknown_fields() {
        let err = Settings::from_json(&json!({ "enable": true }));
        assert!(matches!(err, Err(CompletionError::Configuration(_))));
    }

    #[test]
    fn host_flags_parse_loosely_but_reject_garbage() {
        assert!(must_ok(Settings::parse_flag("enable", "1")));
        assert!(!must_ok(Settings::parse_flag("enable", "")));
        assert!(Settings::parse_flag("enable", "maybe").is_err());
    }

    #[test]
    fn zero_unix_timestamp_means_unset() {
        assert_eq!(must_ok(from_unix(0)), None);
        let value = must_ok(from_unix(1_700_000_000));
        assert_eq!(to_unix(value), 1_700_000_000);
        assert_eq!(to_unix(None), 0);
    }

    #[test]
    fn rfc3339_requires_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00Z").is_ok());
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
    }
}
