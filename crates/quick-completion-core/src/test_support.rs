use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;

use crate::{
    ActivityCompletion, ActivityCompletionState, AggregationMethod, AggregationRow,
    CompletionCriterion, CompletionError, CompletionRepository, Course, CourseCompletion,
    CourseGrade, CriterionCompletion, CriterionType,
};

pub(crate) fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

pub(crate) fn at(seconds: i64) -> OffsetDateTime {
    must_ok(OffsetDateTime::from_unix_timestamp(seconds))
}

/// In-memory stand-in for the host tables.
#[derive(Debug, Default)]
pub(crate) struct MemoryRepository {
    pub courses: BTreeMap<i64, Course>,
    pub modules: BTreeMap<i64, i64>,
    pub course_grade_items: BTreeSet<i64>,
    pub roles: BTreeSet<(i64, i64)>,
    pub criteria: Vec<CompletionCriterion>,
    pub criterion_completions: BTreeMap<(i64, i64), CriterionCompletion>,
    pub activities: BTreeMap<(i64, i64), ActivityCompletion>,
    pub grades: BTreeMap<(i64, i64), CourseGrade>,
    pub course_completions: BTreeMap<(i64, i64), CourseCompletion>,
    /// Raw method codes keyed by course and criterion type.
    pub methods: BTreeMap<(i64, Option<CriterionType>), i64>,
    pub criterion_inserts: usize,
    pub finalize_writes: usize,
    /// Makes `course_completion` miss stored rows, as if another writer
    /// inserted them after the lookup.
    pub stale_completion_reads: bool,
}

impl MemoryRepository {
    pub(crate) fn course_with_user(course_id: i64, user_id: i64) -> Self {
        let mut repo = Self::default();
        repo.courses.insert(
            course_id,
            Course {
                id: course_id,
                completion_enabled: true,
            },
        );
        repo.course_grade_items.insert(course_id * 100);
        repo.roles.insert((course_id, user_id));
        repo
    }

    pub(crate) fn disable_course(&mut self, course_id: i64) {
        if let Some(course) = self.courses.get_mut(&course_id) {
            course.completion_enabled = false;
        }
    }

    pub(crate) fn add_criterion(&mut self, criterion: CompletionCriterion) {
        if let Some(module_id) = criterion.module_instance {
            self.modules.insert(module_id, criterion.course_id);
        }
        self.criteria.push(criterion);
    }

    pub(crate) fn set_activity(
        &mut self,
        course_module_id: i64,
        user_id: i64,
        state: ActivityCompletionState,
        time_modified: OffsetDateTime,
    ) {
        self.activities.insert(
            (course_module_id, user_id),
            ActivityCompletion {
                course_module_id,
                user_id,
                state,
                time_modified,
            },
        );
    }

    pub(crate) fn set_grade(
        &mut self,
        course_id: i64,
        user_id: i64,
        final_grade: Option<f64>,
        time_modified: OffsetDateTime,
    ) {
        self.grades.insert(
            (course_id, user_id),
            CourseGrade {
                course_id,
                user_id,
                final_grade,
                time_modified,
            },
        );
    }

    pub(crate) fn set_method(
        &mut self,
        course_id: i64,
        criterion_type: Option<CriterionType>,
        method: AggregationMethod,
    ) {
        self.methods
            .insert((course_id, criterion_type), method.code());
    }
}

impl CompletionRepository for MemoryRepository {
    fn course(&self, course_id: i64) -> Result<Option<Course>, CompletionError> {
        Ok(self.courses.get(&course_id).copied())
    }

    fn course_for_module(&self, course_module_id: i64) -> Result<Option<i64>, CompletionError> {
        Ok(self.modules.get(&course_module_id).copied())
    }

    fn is_course_grade_item(&self, item_id: i64) -> Result<bool, CompletionError> {
        Ok(self.course_grade_items.contains(&item_id))
    }

    fn has_course_role(&self, course_id: i64, user_id: i64) -> Result<bool, CompletionError> {
        Ok(self.roles.contains(&(course_id, user_id)))
    }

    fn criteria(
        &self,
        course_id: i64,
        criterion_type: CriterionType,
    ) -> Result<Vec<CompletionCriterion>, CompletionError> {
        Ok(self
            .criteria
            .iter()
            .filter(|item| item.course_id == course_id && item.criterion_type == criterion_type)
            .cloned()
            .collect())
    }

    fn criterion_completion(
        &self,
        criterion_id: i64,
        user_id: i64,
    ) -> Result<Option<CriterionCompletion>, CompletionError> {
        Ok(self
            .criterion_completions
            .get(&(criterion_id, user_id))
            .cloned())
    }

    fn insert_criterion_completion(
        &mut self,
        completion: &CriterionCompletion,
    ) -> Result<bool, CompletionError> {
        let key = (completion.criterion_id, completion.user_id);
        if self.criterion_completions.contains_key(&key) {
            return Ok(false);
        }
        self.criterion_inserts += 1;
        self.criterion_completions.insert(key, completion.clone());
        Ok(true)
    }

    fn activity_completion(
        &self,
        course_module_id: i64,
        user_id: i64,
    ) -> Result<Option<ActivityCompletion>, CompletionError> {
        Ok(self.activities.get(&(course_module_id, user_id)).copied())
    }

    fn course_grade(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<CourseGrade>, CompletionError> {
        Ok(self.grades.get(&(course_id, user_id)).copied())
    }

    fn course_completion(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<CourseCompletion>, CompletionError> {
        if self.stale_completion_reads {
            return Ok(None);
        }
        Ok(self.course_completions.get(&(course_id, user_id)).copied())
    }

    fn insert_course_completion(
        &mut self,
        completion: &CourseCompletion,
    ) -> Result<bool, CompletionError> {
        let key = (completion.course_id, completion.user_id);
        if self.course_completions.contains_key(&key) {
            return Ok(false);
        }
        self.course_completions.insert(key, *completion);
        Ok(true)
    }

    fn update_course_progress(
        &mut self,
        completion: &CourseCompletion,
    ) -> Result<(), CompletionError> {
        let key = (completion.course_id, completion.user_id);
        let Some(stored) = self.course_completions.get_mut(&key) else {
            return Err(CompletionError::NotFound(format!(
                "course completion {}:{}",
                completion.course_id, completion.user_id
            )));
        };
        stored.time_enrolled = completion.time_enrolled;
        stored.time_started = completion.time_started;
        stored.reaggregate = completion.reaggregate;
        Ok(())
    }

    fn finalize_course_completion(
        &mut self,
        course_id: i64,
        user_id: i64,
        time_completed: OffsetDateTime,
    ) -> Result<bool, CompletionError> {
        let Some(stored) = self.course_completions.get_mut(&(course_id, user_id)) else {
            return Ok(false);
        };
        if stored.time_completed.is_some() {
            return Ok(false);
        }
        stored.time_completed = Some(time_completed);
        stored.reaggregate = None;
        self.finalize_writes += 1;
        Ok(true)
    }

    fn aggregation_method(
        &self,
        course_id: i64,
        criterion_type: Option<CriterionType>,
    ) -> Result<Option<AggregationMethod>, CompletionError> {
        match self.methods.get(&(course_id, criterion_type)) {
            None => Ok(None),
            Some(code) => AggregationMethod::from_code(*code).map(Some).ok_or_else(|| {
                CompletionError::Configuration(format!(
                    "unknown aggregation method {code} for course {course_id}"
                ))
            }),
        }
    }

    fn reaggregation_rows(
        &self,
        course_id: i64,
        user_id: i64,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<AggregationRow>, CompletionError> {
        if !self.completion_enabled(course_id)? {
            return Ok(Vec::new());
        }
        let Some(completion) = self.course_completions.get(&(course_id, user_id)) else {
            return Ok(Vec::new());
        };
        let eligible = completion.time_completed.is_none()
            && completion.reaggregate.is_some_and(|marker| marker < cutoff);
        if !eligible {
            return Ok(Vec::new());
        }

        Ok(self
            .criteria
            .iter()
            .filter(|item| item.course_id == course_id)
            .map(|item| AggregationRow {
                course_id,
                user_id,
                criterion_id: item.id,
                criterion_type: item.criterion_type,
                time_completed: self
                    .criterion_completions
                    .get(&(item.id, user_id))
                    .map(|done| done.time_completed),
            })
            .collect())
    }
}
