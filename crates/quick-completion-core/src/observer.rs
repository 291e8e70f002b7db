//! Event handlers that run criteria evaluation and course aggregation inline.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::aggregation::{aggregate_statuses, AggregationMethods};
use crate::evaluator::{evaluate_activity_criteria, evaluate_grade_criteria};
use crate::{
    now_utc, ActivityCompletion, CompletionError, CompletionRepository, CourseCompletion,
    CriterionCompletion, CriterionType, Settings,
};

/// Host context levels an event can be raised in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ContextLevel {
    System,
    User,
    CourseCategory,
    Course,
    Module,
    Block,
}

impl ContextLevel {
    /// Host `contextlevel` column value.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::System => 10,
            Self::User => 30,
            Self::CourseCategory => 40,
            Self::Course => 50,
            Self::Module => 70,
            Self::Block => 80,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventContext {
    pub level: ContextLevel,
    pub instance_id: i64,
}

impl EventContext {
    #[must_use]
    pub fn course(course_id: i64) -> Self {
        Self {
            level: ContextLevel::Course,
            instance_id: course_id,
        }
    }
}

/// A grade was recorded for a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserGradedEvent {
    pub user_id: i64,
    pub context: EventContext,
    pub item_id: i64,
}

/// A user's completion state of a course module changed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ModuleCompletionUpdatedEvent {
    pub user_id: i64,
    pub course_module_id: i64,
    pub snapshot: ActivityCompletion,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    PluginDisabled,
    NotCourseContext,
    NotCourseGradeItem,
    CourseNotFound,
    ModuleNotFound,
    CompletionDisabled,
    AlreadyComplete,
    ActivityIncomplete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregationReport {
    pub course_id: i64,
    pub user_id: i64,
    pub criteria_marked: Vec<CriterionCompletion>,
    /// Set only when this call finalized the course completion.
    #[serde(with = "time::serde::timestamp::option")]
    pub course_completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandlerOutcome {
    Skipped { reason: SkipReason },
    Processed(AggregationReport),
}

impl HandlerOutcome {
    #[must_use]
    pub fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    #[must_use]
    pub fn report(&self) -> Option<&AggregationReport> {
        match self {
            Self::Processed(report) => Some(report),
            Self::Skipped { .. } => None,
        }
    }
}

/// Evaluates criteria and aggregates course completion for one user against
/// an injected repository.
pub struct Aggregator<R> {
    repository: R,
    settings: Settings,
    clock: fn() -> OffsetDateTime,
}

impl<R: CompletionRepository> Aggregator<R> {
    #[must_use]
    pub fn new(repository: R, settings: Settings) -> Self {
        Self {
            repository,
            settings,
            clock: now_utc,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn repository_mut(&mut self) -> &mut R {
        &mut self.repository
    }

    pub fn into_repository(self) -> R {
        self.repository
    }

    /// Handles "user graded": evaluates grade criteria and re-aggregates when
    /// the grade is the course total of a completion-enabled course.
    ///
    /// # Errors
    /// Propagates repository and configuration failures.
    pub fn user_graded(
        &mut self,
        event: &UserGradedEvent,
    ) -> Result<HandlerOutcome, CompletionError> {
        if !self.settings.enabled {
            return Ok(HandlerOutcome::skipped(SkipReason::PluginDisabled));
        }
        if event.context.level != ContextLevel::Course {
            debug!(user_id = event.user_id, "grade event outside course context");
            return Ok(HandlerOutcome::skipped(SkipReason::NotCourseContext));
        }
        if !self.repository.is_course_grade_item(event.item_id)? {
            debug!(item_id = event.item_id, "grade item is not the course total");
            return Ok(HandlerOutcome::skipped(SkipReason::NotCourseGradeItem));
        }

        let course_id = event.context.instance_id;
        let user_id = event.user_id;
        if let Some(reason) = self.completion_precondition(course_id, user_id)? {
            return Ok(HandlerOutcome::skipped(reason));
        }

        let now = (self.clock)();
        let criteria_marked = evaluate_grade_criteria(&mut self.repository, course_id, user_id, now)?;
        let course_completed_at = self.reaggregate(course_id, user_id)?;

        Ok(HandlerOutcome::Processed(AggregationReport {
            course_id,
            user_id,
            criteria_marked,
            course_completed_at,
        }))
    }

    /// Handles "course module completion updated": when the snapshot is in a
    /// completed state, evaluates activity then grade criteria and
    /// re-aggregates.
    ///
    /// # Errors
    /// Propagates repository and configuration failures.
    pub fn course_module_completion_updated(
        &mut self,
        event: &ModuleCompletionUpdatedEvent,
    ) -> Result<HandlerOutcome, CompletionError> {
        if !self.settings.enabled {
            return Ok(HandlerOutcome::skipped(SkipReason::PluginDisabled));
        }

        let Some(course_id) = self.repository.course_for_module(event.course_module_id)? else {
            debug!(
                course_module_id = event.course_module_id,
                "course module not found"
            );
            return Ok(HandlerOutcome::skipped(SkipReason::ModuleNotFound));
        };
        let user_id = event.user_id;
        if let Some(reason) = self.completion_precondition(course_id, user_id)? {
            return Ok(HandlerOutcome::skipped(reason));
        }
        if !event.snapshot.state.is_complete() {
            return Ok(HandlerOutcome::skipped(SkipReason::ActivityIncomplete));
        }

        let now = (self.clock)();
        let mut criteria_marked =
            evaluate_activity_criteria(&mut self.repository, course_id, user_id, now)?;
        criteria_marked.extend(evaluate_grade_criteria(
            &mut self.repository,
            course_id,
            user_id,
            now,
        )?);
        let course_completed_at = self.reaggregate(course_id, user_id)?;

        Ok(HandlerOutcome::Processed(AggregationReport {
            course_id,
            user_id,
            criteria_marked,
            course_completed_at,
        }))
    }

    /// Re-aggregates course completion for one user outside of an event,
    /// under the same plugin and course preconditions as the handlers.
    ///
    /// # Errors
    /// Propagates repository failures and aggregation-method lookup failures.
    pub fn aggregate_course(
        &mut self,
        course_id: i64,
        user_id: i64,
    ) -> Result<HandlerOutcome, CompletionError> {
        if !self.settings.enabled {
            return Ok(HandlerOutcome::skipped(SkipReason::PluginDisabled));
        }
        if let Some(reason) = self.completion_precondition(course_id, user_id)? {
            return Ok(HandlerOutcome::skipped(reason));
        }

        let course_completed_at = self.reaggregate(course_id, user_id)?;
        Ok(HandlerOutcome::Processed(AggregationReport {
            course_id,
            user_id,
            criteria_marked: Vec::new(),
            course_completed_at,
        }))
    }

    /// Returns the completion time only when this call finalized the course.
    /// Callers have already checked `completion_precondition`.
    fn reaggregate(
        &mut self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<OffsetDateTime>, CompletionError> {
        let now = (self.clock)();
        if self
            .repository
            .course_completion(course_id, user_id)?
            .is_none()
        {
            let enrolled = CourseCompletion {
                course_id,
                user_id,
                time_enrolled: Some(now),
                time_started: None,
                time_completed: None,
                reaggregate: Some(now),
            };
            if !self.repository.insert_course_completion(&enrolled)? {
                debug!(course_id, user_id, "course completion created concurrently");
            }
        }

        let cutoff = now + Duration::SECOND;
        let rows = self
            .repository
            .reaggregation_rows(course_id, user_id, cutoff)?;
        if rows.is_empty() {
            debug!(course_id, user_id, "nothing eligible for reaggregation");
            return Ok(None);
        }

        let repository = &self.repository;
        let verdicts = aggregate_statuses(&rows, |course| aggregation_methods(repository, course))?;

        let mut finalized = None;
        for verdict in verdicts {
            if !verdict.is_complete() {
                debug!(
                    course_id = verdict.course_id,
                    user_id = verdict.user_id,
                    status = ?verdict.status,
                    "course not complete yet"
                );
                continue;
            }
            let time_completed = verdict.time_completed.unwrap_or(now);
            if self.repository.finalize_course_completion(
                verdict.course_id,
                verdict.user_id,
                time_completed,
            )? {
                info!(
                    course_id = verdict.course_id,
                    user_id = verdict.user_id,
                    time_completed = time_completed.unix_timestamp(),
                    "course marked complete"
                );
                if verdict.course_id == course_id && verdict.user_id == user_id {
                    finalized = Some(time_completed);
                }
            }
        }

        Ok(finalized)
    }

    fn completion_precondition(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<SkipReason>, CompletionError> {
        let Some(course) = self.repository.course(course_id)? else {
            debug!(course_id, "course not found");
            return Ok(Some(SkipReason::CourseNotFound));
        };
        if !self.settings.site_completion_enabled || !course.completion_enabled {
            debug!(course_id, "completion tracking disabled");
            return Ok(Some(SkipReason::CompletionDisabled));
        }
        if self.repository.is_course_complete(course_id, user_id)? {
            debug!(course_id, user_id, "course already complete for user");
            return Ok(Some(SkipReason::AlreadyComplete));
        }
        Ok(None)
    }
}

/// Looks up the course-level method and the per-bucket methods; anything
/// not configured falls back to `All`.
fn aggregation_methods<R>(
    repository: &R,
    course_id: i64,
) -> Result<AggregationMethods, CompletionError>
where
    R: CompletionRepository + ?Sized,
{
    let lookup = |criterion_type| {
        repository
            .aggregation_method(course_id, criterion_type)
            .map(Option::unwrap_or_default)
    };
    Ok(AggregationMethods {
        overall: lookup(None)?,
        activity: lookup(Some(CriterionType::Activity))?,
        prerequisite: lookup(Some(CriterionType::Course))?,
        role: lookup(Some(CriterionType::Role))?,
    })
}
