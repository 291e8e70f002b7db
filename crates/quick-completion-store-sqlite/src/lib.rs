#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use quick_completion_core::{
    format_rfc3339, from_unix, now_utc, to_unix, ActivityCompletion, ActivityCompletionState,
    AggregationMethod, AggregationRow, CompletionCriterion, CompletionError, CompletionRepository,
    ContextLevel, Course, CourseCompletion, CourseGrade, CriterionCompletion, CriterionType,
    Settings, ENABLE_SETTING, PLUGIN_COMPONENT,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;

const COMPLETION_MIGRATION_VERSION: i64 = 1;
const COURSE_ITEM_TYPE: &str = "course";
const SITE_COMPLETION_SETTING: &str = "enablecompletion";

const SCHEMA_COMPLETION_V1: &str = r"
CREATE TABLE IF NOT EXISTS config (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS config_plugins (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  plugin TEXT NOT NULL,
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  UNIQUE(plugin, name)
);

CREATE TABLE IF NOT EXISTS course (
  id INTEGER PRIMARY KEY,
  fullname TEXT NOT NULL DEFAULT '',
  enablecompletion INTEGER NOT NULL DEFAULT 0 CHECK (enablecompletion IN (0, 1))
);

CREATE TABLE IF NOT EXISTS course_modules (
  id INTEGER PRIMARY KEY,
  course INTEGER NOT NULL,
  FOREIGN KEY (course) REFERENCES course(id)
);

CREATE TABLE IF NOT EXISTS context (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  contextlevel INTEGER NOT NULL,
  instanceid INTEGER NOT NULL,
  UNIQUE(contextlevel, instanceid)
);

CREATE TABLE IF NOT EXISTS role_assignments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  roleid INTEGER NOT NULL,
  contextid INTEGER NOT NULL,
  userid INTEGER NOT NULL,
  UNIQUE(roleid, contextid, userid),
  FOREIGN KEY (contextid) REFERENCES context(id)
);

CREATE TABLE IF NOT EXISTS course_completion_criteria (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  course INTEGER NOT NULL,
  criteriatype INTEGER NOT NULL CHECK (criteriatype BETWEEN 1 AND 8),
  moduleinstance INTEGER,
  courseinstance INTEGER,
  role INTEGER,
  gradepass REAL,
  FOREIGN KEY (course) REFERENCES course(id)
);

CREATE INDEX IF NOT EXISTS idx_completion_criteria_course_type
  ON course_completion_criteria(course, criteriatype);

CREATE TABLE IF NOT EXISTS course_completion_aggr_methd (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  course INTEGER NOT NULL,
  criteriatype INTEGER,
  method INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_aggr_methd_course_type
  ON course_completion_aggr_methd(course, criteriatype);

CREATE TABLE IF NOT EXISTS course_modules_completion (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  coursemoduleid INTEGER NOT NULL,
  userid INTEGER NOT NULL,
  completionstate INTEGER NOT NULL CHECK (completionstate BETWEEN 0 AND 3),
  timemodified INTEGER NOT NULL,
  UNIQUE(coursemoduleid, userid),
  FOREIGN KEY (coursemoduleid) REFERENCES course_modules(id)
);

CREATE TABLE IF NOT EXISTS grade_items (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  courseid INTEGER NOT NULL,
  itemtype TEXT NOT NULL,
  FOREIGN KEY (courseid) REFERENCES course(id)
);

CREATE TABLE IF NOT EXISTS grade_grades (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  itemid INTEGER NOT NULL,
  userid INTEGER NOT NULL,
  finalgrade REAL,
  timemodified INTEGER NOT NULL,
  UNIQUE(itemid, userid),
  FOREIGN KEY (itemid) REFERENCES grade_items(id)
);

CREATE TABLE IF NOT EXISTS course_completion_crit_compl (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  userid INTEGER NOT NULL,
  course INTEGER NOT NULL,
  criteriaid INTEGER NOT NULL,
  gradefinal REAL,
  timecompleted INTEGER NOT NULL,
  UNIQUE(userid, criteriaid),
  FOREIGN KEY (criteriaid) REFERENCES course_completion_criteria(id)
);

CREATE TABLE IF NOT EXISTS course_completions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  userid INTEGER NOT NULL,
  course INTEGER NOT NULL,
  timeenrolled INTEGER NOT NULL DEFAULT 0,
  timestarted INTEGER NOT NULL DEFAULT 0,
  timecompleted INTEGER,
  reaggregate INTEGER NOT NULL DEFAULT 0,
  UNIQUE(userid, course),
  FOREIGN KEY (course) REFERENCES course(id)
);

CREATE INDEX IF NOT EXISTS idx_course_completions_reaggregate
  ON course_completions(reaggregate, timecompleted);
";

/// Columns the repository queries rely on, checked after migration so a
/// pre-existing host database with an older layout fails loudly.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("course", &["id", "enablecompletion"]),
    ("course_modules", &["id", "course"]),
    ("context", &["id", "contextlevel", "instanceid"]),
    ("role_assignments", &["contextid", "userid"]),
    (
        "course_completion_criteria",
        &[
            "id",
            "course",
            "criteriatype",
            "moduleinstance",
            "courseinstance",
            "role",
            "gradepass",
        ],
    ),
    ("course_completion_aggr_methd", &["course", "criteriatype", "method"]),
    (
        "course_modules_completion",
        &["coursemoduleid", "userid", "completionstate", "timemodified"],
    ),
    ("grade_items", &["id", "courseid", "itemtype"]),
    ("grade_grades", &["itemid", "userid", "finalgrade", "timemodified"]),
    (
        "course_completion_crit_compl",
        &["userid", "course", "criteriaid", "gradefinal", "timecompleted"],
    ),
    (
        "course_completions",
        &[
            "userid",
            "course",
            "timeenrolled",
            "timestarted",
            "timecompleted",
            "reaggregate",
        ],
    ),
];

pub struct SqliteCompletionStore {
    conn: Connection,
}

/// Completion state of one user in one course, for reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CompletionStatus {
    pub course_id: i64,
    pub user_id: i64,
    pub course_completion: Option<CourseCompletion>,
    pub criteria: Vec<CriterionStatus>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct CriterionStatus {
    pub criterion: CompletionCriterion,
    pub completion: Option<CriterionCompletion>,
}

impl SqliteCompletionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_COMPLETION_V1)
            .context("failed to apply completion schema")?;

        for (table, columns) in REQUIRED_COLUMNS {
            ensure_table_has_columns(&self.conn, table, columns)?;
        }

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![COMPLETION_MIGRATION_VERSION, now],
            )
            .context("failed to register completion schema migration")?;

        Ok(())
    }

    /// Reads plugin and site switches, falling back to [`Settings::default`]
    /// for anything not stored.
    pub fn load_settings(&self) -> Result<Settings> {
        let mut settings = Settings::default();

        if let Some(raw) = self.plugin_config(PLUGIN_COMPONENT, ENABLE_SETTING)? {
            settings.enabled = Settings::parse_flag(ENABLE_SETTING, &raw)?;
        }
        if let Some(raw) = self.site_config(SITE_COMPLETION_SETTING)? {
            settings.site_completion_enabled = Settings::parse_flag(SITE_COMPLETION_SETTING, &raw)?;
        }

        Ok(settings)
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.set_plugin_config(PLUGIN_COMPONENT, ENABLE_SETTING, bool_to_flag(settings.enabled))?;
        self.set_site_config(
            SITE_COMPLETION_SETTING,
            bool_to_flag(settings.site_completion_enabled),
        )
    }

    pub fn plugin_config(&self, plugin: &str, name: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM config_plugins WHERE plugin = ?1 AND name = ?2",
                params![plugin, name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read plugin config {plugin}/{name}"))
    }

    pub fn set_plugin_config(&self, plugin: &str, name: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO config_plugins(plugin, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(plugin, name) DO UPDATE SET value = excluded.value",
                params![plugin, name, value],
            )
            .with_context(|| format!("failed to write plugin config {plugin}/{name}"))?;
        Ok(())
    }

    pub fn site_config(&self, name: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM config WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read site config {name}"))
    }

    pub fn set_site_config(&self, name: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO config(name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                params![name, value],
            )
            .with_context(|| format!("failed to write site config {name}"))?;
        Ok(())
    }

    pub fn insert_course(&self, course_id: i64, fullname: &str, completion_enabled: bool) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO course(id, fullname, enablecompletion) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                   fullname = excluded.fullname,
                   enablecompletion = excluded.enablecompletion",
                params![course_id, fullname, bool_to_sql(completion_enabled)],
            )
            .with_context(|| format!("failed to upsert course {course_id}"))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO context(contextlevel, instanceid) VALUES (?1, ?2)",
                params![ContextLevel::Course.code(), course_id],
            )
            .with_context(|| format!("failed to create context for course {course_id}"))?;
        Ok(())
    }

    pub fn insert_course_module(&self, course_module_id: i64, course_id: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO course_modules(id, course) VALUES (?1, ?2)",
                params![course_module_id, course_id],
            )
            .with_context(|| format!("failed to insert course module {course_module_id}"))?;
        Ok(())
    }

    /// Assigns a role in the course context; the course must exist.
    pub fn enrol_user(&self, course_id: i64, user_id: i64, role_id: i64) -> Result<()> {
        let context_id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM context WHERE contextlevel = ?1 AND instanceid = ?2",
                params![ContextLevel::Course.code(), course_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to resolve course context")?
            .ok_or_else(|| anyhow!("course {course_id} has no context; insert the course first"))?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO role_assignments(roleid, contextid, userid) VALUES (?1, ?2, ?3)",
                params![role_id, context_id, user_id],
            )
            .with_context(|| format!("failed to assign role to user {user_id}"))?;
        Ok(())
    }

    pub fn insert_criterion(&self, criterion: &CompletionCriterion) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO course_completion_criteria(
                    course, criteriatype, moduleinstance, courseinstance, role, gradepass
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    criterion.course_id,
                    criterion.criterion_type.code(),
                    criterion.module_instance,
                    criterion.course_instance,
                    criterion.role,
                    criterion.grade_pass,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert {} criterion for course {}",
                    criterion.criterion_type, criterion.course_id
                )
            })?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Replaces the method for a course (`None`) or one criterion type.
    pub fn set_aggregation_method(
        &mut self,
        course_id: i64,
        criterion_type: Option<CriterionType>,
        method: AggregationMethod,
    ) -> Result<()> {
        self.set_aggregation_method_code(course_id, criterion_type, method.code())
    }

    pub fn set_aggregation_method_code(
        &mut self,
        course_id: i64,
        criterion_type: Option<CriterionType>,
        method_code: i64,
    ) -> Result<()> {
        let type_code = criterion_type.map(CriterionType::code);
        let tx = self
            .conn
            .transaction()
            .context("failed to start aggregation method transaction")?;
        tx.execute(
            "DELETE FROM course_completion_aggr_methd WHERE course = ?1 AND criteriatype IS ?2",
            params![course_id, type_code],
        )
        .context("failed to clear aggregation method")?;
        tx.execute(
            "INSERT INTO course_completion_aggr_methd(course, criteriatype, method) VALUES (?1, ?2, ?3)",
            params![course_id, type_code, method_code],
        )
        .context("failed to store aggregation method")?;
        tx.commit()
            .context("failed to commit aggregation method transaction")?;
        Ok(())
    }

    pub fn upsert_activity_completion(&self, completion: &ActivityCompletion) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO course_modules_completion(coursemoduleid, userid, completionstate, timemodified)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(coursemoduleid, userid) DO UPDATE SET
                   completionstate = excluded.completionstate,
                   timemodified = excluded.timemodified",
                params![
                    completion.course_module_id,
                    completion.user_id,
                    completion.state.code(),
                    completion.time_modified.unix_timestamp(),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to store completion of module {} for user {}",
                    completion.course_module_id, completion.user_id
                )
            })?;
        Ok(())
    }

    /// Returns the id of the course total grade item, creating it if needed.
    pub fn ensure_course_grade_item(&self, course_id: i64) -> Result<i64> {
        if let Some(item_id) = self.course_grade_item(course_id)? {
            return Ok(item_id);
        }
        self.conn
            .execute(
                "INSERT INTO grade_items(courseid, itemtype) VALUES (?1, ?2)",
                params![course_id, COURSE_ITEM_TYPE],
            )
            .with_context(|| format!("failed to create course grade item for {course_id}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn course_grade_item(&self, course_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM grade_items WHERE courseid = ?1 AND itemtype = ?2 ORDER BY id LIMIT 1",
                params![course_id, COURSE_ITEM_TYPE],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up course grade item")
    }

    /// Records the user's course total and returns the grade item id.
    pub fn upsert_course_grade(&self, grade: &CourseGrade) -> Result<i64> {
        let item_id = self.ensure_course_grade_item(grade.course_id)?;
        self.conn
            .execute(
                "INSERT INTO grade_grades(itemid, userid, finalgrade, timemodified) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(itemid, userid) DO UPDATE SET
                   finalgrade = excluded.finalgrade,
                   timemodified = excluded.timemodified",
                params![
                    item_id,
                    grade.user_id,
                    grade.final_grade,
                    grade.time_modified.unix_timestamp(),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to store course grade for user {} in course {}",
                    grade.user_id, grade.course_id
                )
            })?;
        Ok(item_id)
    }

    pub fn completion_status(&self, course_id: i64, user_id: i64) -> Result<CompletionStatus> {
        let course_completion = self.load_course_completion(course_id, user_id)?;

        let mut criteria = Vec::new();
        for criterion_type in CriterionType::ALL {
            for criterion in self.load_criteria(course_id, criterion_type)? {
                let completion = self.load_criterion_completion(criterion.id, user_id)?;
                criteria.push(CriterionStatus {
                    criterion,
                    completion,
                });
            }
        }
        criteria.sort_by_key(|item| item.criterion.id);

        Ok(CompletionStatus {
            course_id,
            user_id,
            course_completion,
            criteria,
        })
    }

    pub fn list_course_completions(&self, course_id: i64) -> Result<Vec<CourseCompletion>> {
        let mut stmt = self.conn.prepare(
            "SELECT course, userid, timeenrolled, timestarted, timecompleted, reaggregate
             FROM course_completions
             WHERE course = ?1
             ORDER BY userid ASC",
        )?;
        let rows = stmt.query_map(params![course_id], raw_course_completion)?;
        collect_rows(rows)?
            .into_iter()
            .map(parse_course_completion)
            .collect()
    }

    fn load_course(&self, course_id: i64) -> Result<Option<Course>> {
        self.conn
            .query_row(
                "SELECT id, enablecompletion FROM course WHERE id = ?1",
                params![course_id],
                |row| {
                    Ok(Course {
                        id: row.get(0)?,
                        completion_enabled: row.get::<_, i64>(1)? == 1,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load course {course_id}"))
    }

    fn load_criteria(
        &self,
        course_id: i64,
        criterion_type: CriterionType,
    ) -> Result<Vec<CompletionCriterion>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, course, moduleinstance, courseinstance, role, gradepass
             FROM course_completion_criteria
             WHERE course = ?1 AND criteriatype = ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![course_id, criterion_type.code()], |row| {
            Ok(CompletionCriterion {
                id: row.get(0)?,
                course_id: row.get(1)?,
                criterion_type,
                module_instance: row.get(2)?,
                course_instance: row.get(3)?,
                role: row.get(4)?,
                grade_pass: row.get(5)?,
            })
        })?;
        collect_rows(rows)
    }

    fn load_criterion_completion(
        &self,
        criterion_id: i64,
        user_id: i64,
    ) -> Result<Option<CriterionCompletion>> {
        let raw = self
            .conn
            .query_row(
                "SELECT criteriaid, course, userid, gradefinal, timecompleted
                 FROM course_completion_crit_compl
                 WHERE criteriaid = ?1 AND userid = ?2",
                params![criterion_id, user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .context("failed to load criterion completion")?;

        let Some((criterion_id, course_id, user_id, grade_final, time_completed)) = raw else {
            return Ok(None);
        };
        Ok(Some(CriterionCompletion {
            criterion_id,
            course_id,
            user_id,
            grade_final,
            time_completed: required_time(time_completed, "timecompleted")?,
        }))
    }

    fn store_criterion_completion(&self, completion: &CriterionCompletion) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO course_completion_crit_compl(
                    userid, course, criteriaid, gradefinal, timecompleted
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    completion.user_id,
                    completion.course_id,
                    completion.criterion_id,
                    completion.grade_final,
                    completion.time_completed.unix_timestamp(),
                ],
            )
            .with_context(|| {
                format!(
                    "failed to mark criterion {} complete for user {}",
                    completion.criterion_id, completion.user_id
                )
            })?;
        Ok(inserted == 1)
    }

    fn load_activity_completion(
        &self,
        course_module_id: i64,
        user_id: i64,
    ) -> Result<Option<ActivityCompletion>> {
        let raw = self
            .conn
            .query_row(
                "SELECT completionstate, timemodified
                 FROM course_modules_completion
                 WHERE coursemoduleid = ?1 AND userid = ?2",
                params![course_module_id, user_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .context("failed to load activity completion")?;

        let Some((state_code, time_modified)) = raw else {
            return Ok(None);
        };
        let state = ActivityCompletionState::from_code(state_code)
            .ok_or_else(|| anyhow!("invalid completionstate {state_code}"))?;
        Ok(Some(ActivityCompletion {
            course_module_id,
            user_id,
            state,
            time_modified: required_time(time_modified, "timemodified")?,
        }))
    }

    fn load_course_grade(&self, course_id: i64, user_id: i64) -> Result<Option<CourseGrade>> {
        let raw = self
            .conn
            .query_row(
                "SELECT gg.finalgrade, gg.timemodified
                 FROM grade_grades gg
                 INNER JOIN grade_items gi ON gg.itemid = gi.id
                 WHERE gi.courseid = ?1 AND gi.itemtype = ?2 AND gg.userid = ?3
                 ORDER BY gi.id ASC
                 LIMIT 1",
                params![course_id, COURSE_ITEM_TYPE, user_id],
                |row| Ok((row.get::<_, Option<f64>>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
            .context("failed to load course grade")?;

        let Some((final_grade, time_modified)) = raw else {
            return Ok(None);
        };
        Ok(Some(CourseGrade {
            course_id,
            user_id,
            final_grade,
            time_modified: required_time(time_modified, "timemodified")?,
        }))
    }

    fn load_course_completion(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<CourseCompletion>> {
        let raw = self
            .conn
            .query_row(
                "SELECT course, userid, timeenrolled, timestarted, timecompleted, reaggregate
                 FROM course_completions
                 WHERE course = ?1 AND userid = ?2",
                params![course_id, user_id],
                raw_course_completion,
            )
            .optional()
            .context("failed to load course completion")?;

        raw.map(parse_course_completion).transpose()
    }

    fn store_course_completion(&self, completion: &CourseCompletion) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO course_completions(
                    userid, course, timeenrolled, timestarted, timecompleted, reaggregate
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    completion.user_id,
                    completion.course_id,
                    to_unix(completion.time_enrolled),
                    to_unix(completion.time_started),
                    completion.time_completed.map(OffsetDateTime::unix_timestamp),
                    to_unix(completion.reaggregate),
                ],
            )
            .context("failed to insert course completion")?;
        Ok(inserted == 1)
    }

    fn store_course_progress(&self, completion: &CourseCompletion) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE course_completions
                 SET timeenrolled = ?3, timestarted = ?4, reaggregate = ?5
                 WHERE course = ?1 AND userid = ?2",
                params![
                    completion.course_id,
                    completion.user_id,
                    to_unix(completion.time_enrolled),
                    to_unix(completion.time_started),
                    to_unix(completion.reaggregate),
                ],
            )
            .context("failed to update course completion progress")?;
        Ok(updated == 1)
    }

    fn store_course_final(
        &self,
        course_id: i64,
        user_id: i64,
        time_completed: OffsetDateTime,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE course_completions
                 SET timecompleted = ?3, reaggregate = 0
                 WHERE course = ?1 AND userid = ?2 AND timecompleted IS NULL",
                params![course_id, user_id, time_completed.unix_timestamp()],
            )
            .context("failed to finalize course completion")?;
        Ok(updated == 1)
    }

    fn load_aggregation_method_code(
        &self,
        course_id: i64,
        criterion_type: Option<CriterionType>,
    ) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT method FROM course_completion_aggr_methd
                 WHERE course = ?1 AND criteriatype IS ?2
                 ORDER BY id DESC
                 LIMIT 1",
                params![course_id, criterion_type.map(CriterionType::code)],
                |row| row.get(0),
            )
            .optional()
            .context("failed to load aggregation method")
    }

    fn load_reaggregation_rows(
        &self,
        course_id: i64,
        user_id: i64,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<AggregationRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, crc.userid, cr.id, cr.criteriatype, cc.timecompleted
             FROM course_completion_criteria cr
             INNER JOIN course c ON cr.course = c.id
             INNER JOIN course_completions crc ON crc.course = c.id
             LEFT JOIN course_completion_crit_compl cc
               ON cc.criteriaid = cr.id AND cc.userid = crc.userid
             WHERE c.enablecompletion = 1
               AND crc.timecompleted IS NULL
               AND crc.reaggregate > 0
               AND crc.reaggregate < ?3
               AND c.id = ?1
               AND crc.userid = ?2
             ORDER BY c.id, crc.userid, cr.id",
        )?;
        let rows = stmt.query_map(
            params![course_id, user_id, cutoff.unix_timestamp()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            },
        )?;

        let mut parsed = Vec::new();
        for (course_id, user_id, criterion_id, type_code, time_completed) in collect_rows(rows)? {
            let criterion_type = CriterionType::from_code(type_code)
                .ok_or_else(|| anyhow!("invalid criteriatype {type_code} on criterion {criterion_id}"))?;
            parsed.push(AggregationRow {
                course_id,
                user_id,
                criterion_id,
                criterion_type,
                time_completed: match time_completed {
                    Some(seconds) => from_unix(seconds)?,
                    None => None,
                },
            });
        }
        debug!(course_id, user_id, rows = parsed.len(), "loaded reaggregation rows");
        Ok(parsed)
    }

    fn load_has_course_role(&self, course_id: i64, user_id: i64) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM role_assignments ra
                    INNER JOIN context con ON ra.contextid = con.id
                    WHERE con.contextlevel = ?1 AND con.instanceid = ?2 AND ra.userid = ?3
                 )",
                params![ContextLevel::Course.code(), course_id, user_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|found| found == 1)
            .context("failed to check role assignment")
    }

    fn load_is_course_grade_item(&self, item_id: i64) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM grade_items WHERE id = ?1 AND itemtype = ?2)",
                params![item_id, COURSE_ITEM_TYPE],
                |row| row.get::<_, i64>(0),
            )
            .map(|found| found == 1)
            .context("failed to check grade item")
    }

    fn load_course_for_module(&self, course_module_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT course FROM course_modules WHERE id = ?1",
                params![course_module_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to resolve course module")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl CompletionRepository for SqliteCompletionStore {
    fn course(&self, course_id: i64) -> Result<Option<Course>, CompletionError> {
        storage(self.load_course(course_id))
    }

    fn course_for_module(&self, course_module_id: i64) -> Result<Option<i64>, CompletionError> {
        storage(self.load_course_for_module(course_module_id))
    }

    fn is_course_grade_item(&self, item_id: i64) -> Result<bool, CompletionError> {
        storage(self.load_is_course_grade_item(item_id))
    }

    fn has_course_role(&self, course_id: i64, user_id: i64) -> Result<bool, CompletionError> {
        storage(self.load_has_course_role(course_id, user_id))
    }

    fn criteria(
        &self,
        course_id: i64,
        criterion_type: CriterionType,
    ) -> Result<Vec<CompletionCriterion>, CompletionError> {
        storage(self.load_criteria(course_id, criterion_type))
    }

    fn criterion_completion(
        &self,
        criterion_id: i64,
        user_id: i64,
    ) -> Result<Option<CriterionCompletion>, CompletionError> {
        storage(self.load_criterion_completion(criterion_id, user_id))
    }

    fn insert_criterion_completion(
        &mut self,
        completion: &CriterionCompletion,
    ) -> Result<bool, CompletionError> {
        storage(self.store_criterion_completion(completion))
    }

    fn activity_completion(
        &self,
        course_module_id: i64,
        user_id: i64,
    ) -> Result<Option<ActivityCompletion>, CompletionError> {
        storage(self.load_activity_completion(course_module_id, user_id))
    }

    fn course_grade(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<CourseGrade>, CompletionError> {
        storage(self.load_course_grade(course_id, user_id))
    }

    fn course_completion(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<CourseCompletion>, CompletionError> {
        storage(self.load_course_completion(course_id, user_id))
    }

    fn insert_course_completion(
        &mut self,
        completion: &CourseCompletion,
    ) -> Result<bool, CompletionError> {
        storage(self.store_course_completion(completion))
    }

    fn update_course_progress(
        &mut self,
        completion: &CourseCompletion,
    ) -> Result<(), CompletionError> {
        if storage(self.store_course_progress(completion))? {
            return Ok(());
        }
        Err(CompletionError::NotFound(format!(
            "course completion {}:{}",
            completion.course_id, completion.user_id
        )))
    }

    fn finalize_course_completion(
        &mut self,
        course_id: i64,
        user_id: i64,
        time_completed: OffsetDateTime,
    ) -> Result<bool, CompletionError> {
        storage(self.store_course_final(course_id, user_id, time_completed))
    }

    fn aggregation_method(
        &self,
        course_id: i64,
        criterion_type: Option<CriterionType>,
    ) -> Result<Option<AggregationMethod>, CompletionError> {
        let Some(code) = storage(self.load_aggregation_method_code(course_id, criterion_type))?
        else {
            return Ok(None);
        };
        AggregationMethod::from_code(code).map(Some).ok_or_else(|| {
            CompletionError::Configuration(format!(
                "unknown aggregation method {code} for course {course_id} ({})",
                criterion_type.map_or("overall", CriterionType::as_str)
            ))
        })
    }

    fn reaggregation_rows(
        &self,
        course_id: i64,
        user_id: i64,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<AggregationRow>, CompletionError> {
        storage(self.load_reaggregation_rows(course_id, user_id, cutoff))
    }
}

type RawCourseCompletion = (i64, i64, i64, i64, Option<i64>, i64);

fn raw_course_completion(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCourseCompletion> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parse_course_completion(raw: RawCourseCompletion) -> Result<CourseCompletion> {
    let (course_id, user_id, enrolled, started, completed, reaggregate) = raw;
    Ok(CourseCompletion {
        course_id,
        user_id,
        time_enrolled: from_unix(enrolled)?,
        time_started: from_unix(started)?,
        time_completed: match completed {
            Some(seconds) => from_unix(seconds)?,
            None => None,
        },
        reaggregate: from_unix(reaggregate)?,
    })
}

fn required_time(seconds: i64, column: &str) -> Result<OffsetDateTime> {
    from_unix(seconds)?.ok_or_else(|| anyhow!("{column} MUST be set"))
}

fn storage<T>(result: Result<T>) -> Result<T, CompletionError> {
    result.map_err(|err| CompletionError::Storage(format!("{err:#}")))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn bool_to_flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for {table_name}"))?;
    Ok(exists == 1)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    if !table_exists(conn, table_name)? {
        return Err(anyhow!("required table {table_name} is missing"));
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let present = collect_rows(rows)?;

    for column in columns {
        if !present.iter().any(|name| name == column) {
            return Err(anyhow!(
                "table {table_name} is missing required column {column}"
            ));
        }
    }

    Ok(())
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
