//! Tri-state folding of criterion statuses into a course verdict.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{AggregationMethod, AggregationRow, CompletionError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatusBucket {
    /// Grade, self, date, duration and unenrol criteria.
    Overall,
    Activity,
    Prerequisite,
    Role,
}

/// Methods configured for one course: the course-level method plus one per
/// special-cased criterion bucket.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AggregationMethods {
    pub overall: AggregationMethod,
    pub activity: AggregationMethod,
    pub prerequisite: AggregationMethod,
    pub role: AggregationMethod,
}

impl AggregationMethods {
    #[must_use]
    pub fn uniform(method: AggregationMethod) -> Self {
        Self {
            overall: method,
            activity: method,
            prerequisite: method,
            role: method,
        }
    }

    #[must_use]
    pub fn for_bucket(&self, bucket: StatusBucket) -> AggregationMethod {
        match bucket {
            StatusBucket::Overall => self.overall,
            StatusBucket::Activity => self.activity,
            StatusBucket::Prerequisite => self.prerequisite,
            StatusBucket::Role => self.role,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CourseVerdict {
    pub course_id: i64,
    pub user_id: i64,
    pub criteria_count: usize,
    /// Final tri-state; `None` when nothing could be decided.
    pub status: Option<bool>,
    /// Latest completion time among the group's criteria.
    #[serde(with = "time::serde::timestamp::option")]
    pub time_completed: Option<OffsetDateTime>,
}

impl CourseVerdict {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == Some(true)
    }
}

/// Folds one boolean into a tri-state accumulator.
///
/// `All` latches to `false` on the first incomplete input. `Any` latches to
/// `true` on the first complete input; an incomplete input only turns an
/// undecided state into `false`.
pub fn fold_status(method: AggregationMethod, data: bool, state: &mut Option<bool>) {
    match method {
        AggregationMethod::All => {
            *state = Some(data && *state != Some(false));
        }
        AggregationMethod::Any => {
            if data {
                *state = Some(true);
            } else if state.is_none() {
                *state = Some(false);
            }
        }
    }
}

/// Groups rows by `(course, user)`; within a group a criterion appears once,
/// the last row for it wins.
#[must_use]
pub fn group_rows(
    rows: &[AggregationRow],
) -> BTreeMap<(i64, i64), BTreeMap<i64, &AggregationRow>> {
    let mut groups: BTreeMap<(i64, i64), BTreeMap<i64, &AggregationRow>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.course_id, row.user_id))
            .or_default()
            .insert(row.criterion_id, row);
    }
    groups
}

/// Computes a verdict per `(course, user)` group.
///
/// `methods_for` is consulted once per distinct course.
///
/// # Errors
/// Propagates any error returned by `methods_for`.
pub fn aggregate_statuses<F>(
    rows: &[AggregationRow],
    mut methods_for: F,
) -> Result<Vec<CourseVerdict>, CompletionError>
where
    F: FnMut(i64) -> Result<AggregationMethods, CompletionError>,
{
    let mut methods_cache: BTreeMap<i64, AggregationMethods> = BTreeMap::new();
    let mut verdicts = Vec::new();

    for ((course_id, user_id), criteria) in group_rows(rows) {
        let methods = match methods_cache.get(&course_id) {
            Some(methods) => *methods,
            None => {
                let methods = methods_for(course_id)?;
                methods_cache.insert(course_id, methods);
                methods
            }
        };

        let (status, time_completed) = evaluate_group(criteria.values().copied(), &methods);
        verdicts.push(CourseVerdict {
            course_id,
            user_id,
            criteria_count: criteria.len(),
            status,
            time_completed,
        });
    }

    Ok(verdicts)
}

fn evaluate_group<'a>(
    rows: impl Iterator<Item = &'a AggregationRow>,
    methods: &AggregationMethods,
) -> (Option<bool>, Option<OffsetDateTime>) {
    let mut overall = None;
    let mut activity = None;
    let mut prerequisite = None;
    let mut role = None;
    let mut time_completed: Option<OffsetDateTime> = None;

    for row in rows {
        time_completed = time_completed.max(row.time_completed);
        let bucket = row.criterion_type.bucket();
        let state = match bucket {
            StatusBucket::Overall => &mut overall,
            StatusBucket::Activity => &mut activity,
            StatusBucket::Prerequisite => &mut prerequisite,
            StatusBucket::Role => &mut role,
        };
        fold_status(methods.for_bucket(bucket), row.is_complete(), state);
    }

    // Order is fixed: role, activity, prerequisite.
    for bucket_status in [role, activity, prerequisite].into_iter().flatten() {
        fold_status(methods.overall, bucket_status, &mut overall);
    }

    (overall, time_completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CriterionType;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn at(seconds: i64) -> OffsetDateTime {
        must_ok(OffsetDateTime::from_unix_timestamp(seconds))
    }

    fn row(criterion_id: i64, criterion_type: CriterionType, done: Option<i64>) -> AggregationRow {
        AggregationRow {
            course_id: 10,
            user_id: 7,
            criterion_id,
            criterion_type,
            time_completed: done.map(at),
        }
    }

    fn single_verdict(rows: &[AggregationRow], methods: AggregationMethods) -> CourseVerdict {
        let mut verdicts = must_ok(aggregate_statuses(rows, |_| Ok(methods)));
        assert_eq!(verdicts.len(), 1);
        match verdicts.pop() {
            Some(verdict) => verdict,
            None => panic!("expected one verdict"),
        }
    }

    #[test]
    fn all_latches_false_after_an_incomplete_input() {
        let mut state = None;
        fold_status(AggregationMethod::All, true, &mut state);
        assert_eq!(state, Some(true));
        fold_status(AggregationMethod::All, false, &mut state);
        assert_eq!(state, Some(false));
        fold_status(AggregationMethod::All, true, &mut state);
        assert_eq!(state, Some(false));
    }

    #[test]
    fn any_latches_true_and_never_downgrades() {
        let mut state = None;
        fold_status(AggregationMethod::Any, false, &mut state);
        assert_eq!(state, Some(false));
        fold_status(AggregationMethod::Any, true, &mut state);
        assert_eq!(state, Some(true));
        fold_status(AggregationMethod::Any, false, &mut state);
        assert_eq!(state, Some(true));
    }

    #[test]
    fn single_completed_activity_completes_course_at_its_time() {
        let verdict = single_verdict(
            &[row(1, CriterionType::Activity, Some(1_000))],
            AggregationMethods::default(),
        );
        assert!(verdict.is_complete());
        assert_eq!(verdict.time_completed, Some(at(1_000)));
    }

    #[test]
    fn two_activities_under_all_need_both() {
        let half = single_verdict(
            &[
                row(1, CriterionType::Activity, Some(1_000)),
                row(2, CriterionType::Activity, None),
            ],
            AggregationMethods::default(),
        );
        assert!(!half.is_complete());

        let both = single_verdict(
            &[
                row(1, CriterionType::Activity, Some(1_000)),
                row(2, CriterionType::Activity, Some(2_500)),
            ],
            AggregationMethods::default(),
        );
        assert!(both.is_complete());
        assert_eq!(both.time_completed, Some(at(2_500)));
    }

    #[test]
    fn any_over_overall_bucket_needs_one() {
        let verdict = single_verdict(
            &[
                row(1, CriterionType::Grade, None),
                row(2, CriterionType::SelfCompletion, Some(900)),
            ],
            AggregationMethods::uniform(AggregationMethod::Any),
        );
        assert!(verdict.is_complete());
        assert_eq!(verdict.time_completed, Some(at(900)));
    }

    #[test]
    fn bucket_method_is_independent_of_course_method() {
        let methods = AggregationMethods {
            overall: AggregationMethod::All,
            activity: AggregationMethod::Any,
            ..AggregationMethods::default()
        };
        let verdict = single_verdict(
            &[
                row(1, CriterionType::Activity, None),
                row(2, CriterionType::Activity, Some(300)),
                row(3, CriterionType::Grade, Some(200)),
            ],
            methods,
        );
        assert!(verdict.is_complete());
        assert_eq!(verdict.time_completed, Some(at(300)));
    }

    #[test]
    fn incomplete_role_bucket_blocks_all_course_method() {
        let verdict = single_verdict(
            &[
                row(1, CriterionType::Role, None),
                row(2, CriterionType::Activity, Some(300)),
            ],
            AggregationMethods::default(),
        );
        assert_eq!(verdict.status, Some(false));
    }

    #[test]
    fn nothing_completed_never_finalizes() {
        let verdict = single_verdict(
            &[
                row(1, CriterionType::Activity, None),
                row(2, CriterionType::Grade, None),
            ],
            AggregationMethods::uniform(AggregationMethod::Any),
        );
        assert!(!verdict.is_complete());
        assert_eq!(verdict.time_completed, None);
    }

    #[test]
    fn empty_input_yields_no_verdicts() {
        let verdicts = must_ok(aggregate_statuses(&[], |_| {
            Err(CompletionError::Configuration("must not be consulted".to_string()))
        }));
        assert!(verdicts.is_empty());
    }

    #[test]
    fn interleaved_rows_are_grouped_by_key() {
        let mut other_user = row(1, CriterionType::Activity, None);
        other_user.user_id = 8;
        let rows = [
            row(1, CriterionType::Activity, Some(10)),
            other_user,
            row(2, CriterionType::Activity, Some(20)),
        ];

        let verdicts = must_ok(aggregate_statuses(&rows, |_| Ok(AggregationMethods::default())));
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].user_id, 7);
        assert_eq!(verdicts[0].criteria_count, 2);
        assert!(verdicts[0].is_complete());
        assert_eq!(verdicts[1].user_id, 8);
        assert!(!verdicts[1].is_complete());
    }

    #[test]
    fn method_lookup_failure_propagates() {
        let result = aggregate_statuses(&[row(1, CriterionType::Grade, Some(1))], |course| {
            Err(CompletionError::Configuration(format!(
                "no method for course {course}"
            )))
        });
        assert!(matches!(result, Err(CompletionError::Configuration(_))));
    }

    fn criterion_type_strategy() -> impl Strategy<Value = CriterionType> {
        prop::sample::select(CriterionType::ALL.to_vec())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_fold_matches_boolean_semantics(inputs in prop::collection::vec(any::<bool>(), 1..24)) {
            let mut all_state = None;
            let mut any_state = None;
            for value in &inputs {
                fold_status(AggregationMethod::All, *value, &mut all_state);
                fold_status(AggregationMethod::Any, *value, &mut any_state);
            }
            prop_assert_eq!(all_state, Some(inputs.iter().all(|value| *value)));
            prop_assert_eq!(any_state, Some(inputs.iter().any(|value| *value)));
        }

        #[test]
        fn prop_verdict_ignores_row_order(
            entries in prop::collection::vec((criterion_type_strategy(), prop::option::of(1i64..10_000)), 1..16),
            any_overall in any::<bool>(),
        ) {
            let rows: Vec<AggregationRow> = entries
                .iter()
                .enumerate()
                .map(|(index, (kind, done))| row(i64::try_from(index).unwrap_or(i64::MAX), *kind, *done))
                .collect();
            let mut reversed = rows.clone();
            reversed.reverse();

            let methods = AggregationMethods {
                overall: if any_overall { AggregationMethod::Any } else { AggregationMethod::All },
                ..AggregationMethods::default()
            };
            let forward = single_verdict(&rows, methods);
            let backward = single_verdict(&reversed, methods);
            prop_assert_eq!(forward.status, backward.status);
            prop_assert_eq!(forward.time_completed, backward.time_completed);
        }

        #[test]
        fn prop_no_completions_never_complete(
            kinds in prop::collection::vec(criterion_type_strategy(), 1..16),
            any_method in any::<bool>(),
        ) {
            let rows: Vec<AggregationRow> = kinds
                .iter()
                .enumerate()
                .map(|(index, kind)| row(i64::try_from(index).unwrap_or(i64::MAX), *kind, None))
                .collect();
            let method = if any_method { AggregationMethod::Any } else { AggregationMethod::All };
            let verdict = single_verdict(&rows, AggregationMethods::uniform(method));
            prop_assert!(!verdict.is_complete());
        }
    }
}
