//! Marks activity and grade criteria the user has satisfied.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{
    ActivityCompletion, CompletionCriterion, CompletionError, CompletionRepository,
    CourseCompletion, CourseGrade, CriterionCompletion, CriterionType,
};

/// Evidence that a criterion is met, taken from the underlying host record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Satisfaction {
    #[serde(with = "time::serde::timestamp")]
    pub time_completed: OffsetDateTime,
    pub grade_final: Option<f64>,
}

/// An activity criterion is met once the module is in any completed state.
#[must_use]
pub fn activity_satisfaction(
    criterion: &CompletionCriterion,
    completion: Option<&ActivityCompletion>,
) -> Option<Satisfaction> {
    let completion = completion?;
    if criterion.module_instance != Some(completion.course_module_id)
        || !completion.state.is_complete()
    {
        return None;
    }
    Some(Satisfaction {
        time_completed: completion.time_modified,
        grade_final: None,
    })
}

/// A grade criterion is met when the final course grade reaches the pass
/// grade. A missing grade or pass grade never satisfies it.
#[must_use]
pub fn grade_satisfaction(
    criterion: &CompletionCriterion,
    grade: Option<&CourseGrade>,
) -> Option<Satisfaction> {
    let grade = grade?;
    let final_grade = grade.final_grade?;
    let grade_pass = criterion.grade_pass?;
    if final_grade < grade_pass {
        return None;
    }
    Some(Satisfaction {
        time_completed: grade.time_modified,
        grade_final: Some(final_grade),
    })
}

/// Marks every activity criterion of the course the user has completed.
///
/// # Errors
/// Propagates repository failures.
pub fn evaluate_activity_criteria<R>(
    repository: &mut R,
    course_id: i64,
    user_id: i64,
    now: OffsetDateTime,
) -> Result<Vec<CriterionCompletion>, CompletionError>
where
    R: CompletionRepository + ?Sized,
{
    evaluate(repository, course_id, user_id, CriterionType::Activity, now)
}

/// Marks every grade criterion of the course whose pass grade the user's
/// final course grade reaches.
///
/// # Errors
/// Propagates repository failures.
pub fn evaluate_grade_criteria<R>(
    repository: &mut R,
    course_id: i64,
    user_id: i64,
    now: OffsetDateTime,
) -> Result<Vec<CriterionCompletion>, CompletionError>
where
    R: CompletionRepository + ?Sized,
{
    evaluate(repository, course_id, user_id, CriterionType::Grade, now)
}

fn evaluate<R>(
    repository: &mut R,
    course_id: i64,
    user_id: i64,
    criterion_type: CriterionType,
    now: OffsetDateTime,
) -> Result<Vec<CriterionCompletion>, CompletionError>
where
    R: CompletionRepository + ?Sized,
{
    let mut marked = Vec::new();

    if !repository.completion_enabled(course_id)? {
        debug!(course_id, "completion disabled for course, skipping {criterion_type} criteria");
        return Ok(marked);
    }
    if !repository.has_course_role(course_id, user_id)? {
        debug!(course_id, user_id, "user has no role in course, skipping {criterion_type} criteria");
        return Ok(marked);
    }

    // Fetched once: every grade criterion tests the same course total.
    let course_grade = if criterion_type == CriterionType::Grade {
        repository.course_grade(course_id, user_id)?
    } else {
        None
    };

    for criterion in repository.criteria(course_id, criterion_type)? {
        if repository
            .criterion_completion(criterion.id, user_id)?
            .is_some()
        {
            continue;
        }

        let satisfaction = match criterion_type {
            CriterionType::Activity => {
                let Some(module_id) = criterion.module_instance else {
                    continue;
                };
                let completion = repository.activity_completion(module_id, user_id)?;
                activity_satisfaction(&criterion, completion.as_ref())
            }
            CriterionType::Grade => grade_satisfaction(&criterion, course_grade.as_ref()),
            _ => None,
        };
        let Some(satisfaction) = satisfaction else {
            continue;
        };

        let completion = CriterionCompletion {
            criterion_id: criterion.id,
            course_id,
            user_id,
            grade_final: satisfaction.grade_final,
            time_completed: satisfaction.time_completed,
        };
        if !repository.insert_criterion_completion(&completion)? {
            continue;
        }

        mark_in_progress(repository, course_id, user_id, completion.time_completed, now)?;
        info!(
            course_id,
            user_id,
            criterion_id = criterion.id,
            "{criterion_type} criterion marked complete"
        );
        marked.push(completion);
    }

    Ok(marked)
}

/// Records that the user has started the course and flags the course
/// completion for reaggregation. Enrolment time is owned by enrolment and is
/// never written here.
fn mark_in_progress<R>(
    repository: &mut R,
    course_id: i64,
    user_id: i64,
    started_at: OffsetDateTime,
    now: OffsetDateTime,
) -> Result<(), CompletionError>
where
    R: CompletionRepository + ?Sized,
{
    match repository.course_completion(course_id, user_id)? {
        Some(mut completion) => {
            if completion.is_complete() {
                return Ok(());
            }
            if completion.time_started.is_none() {
                completion.time_started = Some(started_at);
            }
            completion.reaggregate = Some(now);
            repository.update_course_progress(&completion)
        }
        None => {
            let completion = CourseCompletion {
                course_id,
                user_id,
                time_enrolled: None,
                time_started: Some(started_at),
                time_completed: None,
                reaggregate: Some(now),
            };
            repository.insert_course_completion(&completion).map(|_| ())
        }
    }
}
