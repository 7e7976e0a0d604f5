//! SQLite roster and results store
//!
//! The pipeline hands finished records to this collaborator and never
//! computes correctness or scores itself: each observed answer is graded
//! here against the stored answer key, and aggregate per-course results are
//! recomputed only when [`SheetStore::recalculate_results`] is called
//! explicitly after a sheet is recorded.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::vision::marks::{AnswerGrid, CHOICE_ALPHABET};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not serialize results: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Roster and results store backed by a single SQLite database.
pub struct SheetStore {
    conn: Connection,
}

impl SheetStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        info!(path = %path.display(), "sheet store opened");
        Ok(store)
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS students (
                id             INTEGER PRIMARY KEY,
                student_number TEXT NOT NULL UNIQUE,
                results        TEXT NOT NULL DEFAULT '{}'
            );
            CREATE TABLE IF NOT EXISTS courses (
                id              INTEGER PRIMARY KEY,
                name            TEXT NOT NULL UNIQUE,
                code            TEXT NOT NULL UNIQUE,
                total_questions INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS test_groups (
                id              INTEGER PRIMARY KEY,
                name            TEXT NOT NULL UNIQUE,
                total_questions INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS column_mappings (
                id            INTEGER PRIMARY KEY,
                test_group_id INTEGER NOT NULL REFERENCES test_groups(id) ON DELETE CASCADE,
                column_number INTEGER NOT NULL,
                course_id     INTEGER NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
                UNIQUE(test_group_id, column_number)
            );
            CREATE TABLE IF NOT EXISTS answer_keys (
                id              INTEGER PRIMARY KEY,
                test_group_id   INTEGER NOT NULL REFERENCES test_groups(id) ON DELETE CASCADE,
                course_id       INTEGER NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
                question_number INTEGER NOT NULL,
                correct_answer  TEXT NOT NULL,
                UNIQUE(test_group_id, course_id, question_number)
            );
            CREATE TABLE IF NOT EXISTS student_answers (
                id              INTEGER PRIMARY KEY,
                student_id      INTEGER NOT NULL REFERENCES students(id) ON DELETE CASCADE,
                test_group_id   INTEGER NOT NULL REFERENCES test_groups(id) ON DELETE CASCADE,
                course_id       INTEGER NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
                question_number INTEGER NOT NULL,
                selected_answer TEXT NOT NULL,
                is_correct      INTEGER,
                UNIQUE(student_id, test_group_id, course_id, question_number)
            );",
        )?;
        Ok(())
    }

    // -- Roster ---------------------------------------------------------------

    pub fn get_or_create_student(&self, student_number: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO students (student_number) VALUES (?1)",
            params![student_number],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM students WHERE student_number = ?1",
            params![student_number],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_or_create_group(&self, name: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO test_groups (name) VALUES (?1)",
            params![name],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM test_groups WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn add_course(
        &self,
        name: &str,
        code: &str,
        total_questions: u32,
    ) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO courses (name, code, total_questions) VALUES (?1, ?2, ?3)",
            params![name, code, total_questions],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM courses WHERE code = ?1",
            params![code],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Map an answer-sheet column of a test group to a course.
    pub fn map_column(
        &self,
        group_id: i64,
        column_number: u32,
        course_id: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO column_mappings (test_group_id, column_number, course_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(test_group_id, column_number) DO UPDATE SET course_id = excluded.course_id",
            params![group_id, column_number, course_id],
        )?;
        Ok(())
    }

    /// The course an answer-sheet column belongs to, if mapped.
    pub fn course_for_column(
        &self,
        group_id: i64,
        column_number: u32,
    ) -> Result<Option<i64>, StoreError> {
        let id = self
            .conn
            .query_row(
                "SELECT course_id FROM column_mappings
                 WHERE test_group_id = ?1 AND column_number = ?2",
                params![group_id, column_number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // -- Answer keys ----------------------------------------------------------

    pub fn has_answer_key(
        &self,
        group_id: i64,
        course_id: i64,
        question_number: u32,
    ) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM answer_keys
                 WHERE test_group_id = ?1 AND course_id = ?2 AND question_number = ?3",
                params![group_id, course_id, question_number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn upsert_answer_key(
        &self,
        group_id: i64,
        course_id: i64,
        question_number: u32,
        correct_answer: char,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO answer_keys (test_group_id, course_id, question_number, correct_answer)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(test_group_id, course_id, question_number)
             DO UPDATE SET correct_answer = excluded.correct_answer",
            params![group_id, course_id, question_number, correct_answer.to_string()],
        )?;
        Ok(())
    }

    // -- Observed answers -----------------------------------------------------

    /// Record one observed answer. Correctness is computed here against the
    /// stored key; when no key row exists the answer is stored ungraded.
    pub fn upsert_student_answer(
        &self,
        student_id: i64,
        group_id: i64,
        course_id: i64,
        question_number: u32,
        selected_answer: char,
    ) -> Result<(), StoreError> {
        let correct: Option<String> = self
            .conn
            .query_row(
                "SELECT correct_answer FROM answer_keys
                 WHERE test_group_id = ?1 AND course_id = ?2 AND question_number = ?3",
                params![group_id, course_id, question_number],
                |row| row.get(0),
            )
            .optional()?;

        let is_correct = correct
            .as_deref()
            .map(|key| key == selected_answer.to_string());

        self.conn.execute(
            "INSERT INTO student_answers
                 (student_id, test_group_id, course_id, question_number, selected_answer, is_correct)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(student_id, test_group_id, course_id, question_number)
             DO UPDATE SET selected_answer = excluded.selected_answer,
                           is_correct = excluded.is_correct",
            params![
                student_id,
                group_id,
                course_id,
                question_number,
                selected_answer.to_string(),
                is_correct
            ],
        )?;
        Ok(())
    }

    // -- Record-level operations ---------------------------------------------

    /// Persist a decoded student sheet. Columns without a course mapping and
    /// questions without an answer key are skipped with a warning, matching
    /// the rule that a partially configured roster degrades instead of
    /// failing the scan. Returns the student row id for rescoring.
    pub fn record_sheet(
        &self,
        student_number: &str,
        test_group: &str,
        answers: &AnswerGrid,
    ) -> Result<i64, StoreError> {
        let student_id = self.get_or_create_student(student_number)?;
        let group_id = self.get_or_create_group(test_group)?;

        for (&column, questions) in answers {
            let Some(course_id) = self.course_for_column(group_id, column)? else {
                warn!(column, group = test_group, "no course mapped to column; skipping");
                continue;
            };

            for (&question, mark) in questions {
                let Some(answer) = *mark else { continue };
                if !CHOICE_ALPHABET.contains(&answer) {
                    warn!(%answer, question, "answer outside the choice alphabet; skipping");
                    continue;
                }
                if !self.has_answer_key(group_id, course_id, question)? {
                    warn!(question, column, "no answer key entry; skipping observed answer");
                    continue;
                }
                self.upsert_student_answer(student_id, group_id, course_id, question, answer)?;
            }
        }

        debug!(student = student_number, group = test_group, "sheet recorded");
        Ok(student_id)
    }

    /// Persist a decoded answer-key sheet. Question numbers beyond a course's
    /// configured total and unmarked questions are skipped.
    pub fn record_answer_key(
        &self,
        test_group: &str,
        answers: &AnswerGrid,
    ) -> Result<(), StoreError> {
        let group_id = self.get_or_create_group(test_group)?;

        for (&column, questions) in answers {
            let Some(course_id) = self.course_for_column(group_id, column)? else {
                warn!(column, group = test_group, "no course mapped to column; skipping");
                continue;
            };
            let total_questions: u32 = self.conn.query_row(
                "SELECT total_questions FROM courses WHERE id = ?1",
                params![course_id],
                |row| row.get(0),
            )?;

            for (&question, mark) in questions {
                let Some(answer) = *mark else {
                    warn!(question, column, "answer key has an unmarked question; skipping");
                    continue;
                };
                if question > total_questions {
                    warn!(
                        question,
                        total_questions, "question beyond the course total; skipping"
                    );
                    continue;
                }
                self.upsert_answer_key(group_id, course_id, question, answer)?;
            }
        }

        info!(group = test_group, "answer key recorded");
        Ok(())
    }

    // -- Scoring --------------------------------------------------------------

    /// Recompute a student's per-course results and store them as JSON on the
    /// student row. Percentage is correct answers over the summed question
    /// totals of every group mapped to the course.
    pub fn recalculate_results(&self, student_id: i64) -> Result<(), StoreError> {
        let mut courses = self.conn.prepare(
            "SELECT DISTINCT c.id, c.code FROM courses c
             JOIN column_mappings m ON m.course_id = c.id",
        )?;
        let course_rows: Vec<(i64, String)> = courses
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut results = serde_json::Map::new();
        for (course_id, code) in course_rows {
            let total_questions: i64 = self.conn.query_row(
                "SELECT COALESCE(SUM(g.total_questions), 0) FROM test_groups g
                 WHERE g.id IN (SELECT test_group_id FROM column_mappings WHERE course_id = ?1)",
                params![course_id],
                |row| row.get(0),
            )?;
            if total_questions == 0 {
                continue;
            }

            let (correct, incorrect): (i64, i64) = self.conn.query_row(
                "SELECT
                     COALESCE(SUM(CASE WHEN is_correct = 1 THEN 1 ELSE 0 END), 0),
                     COALESCE(SUM(CASE WHEN is_correct = 0 THEN 1 ELSE 0 END), 0)
                 FROM student_answers
                 WHERE student_id = ?1 AND course_id = ?2",
                params![student_id, course_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            if correct == 0 && incorrect == 0 {
                continue;
            }

            let score = (correct as f64 / total_questions as f64 * 100.0 * 100.0).round() / 100.0;
            results.insert(
                code,
                serde_json::json!({
                    "overall": {
                        "score": score,
                        "correct": correct,
                        "incorrect": incorrect,
                    }
                }),
            );
        }

        let serialized = serde_json::to_string(&serde_json::Value::Object(results))?;
        self.conn.execute(
            "UPDATE students SET results = ?1 WHERE id = ?2",
            params![serialized, student_id],
        )?;
        debug!(student_id, "results recalculated");
        Ok(())
    }

    /// The stored results JSON for a student, if any.
    pub fn student_results(&self, student_id: i64) -> Result<serde_json::Value, StoreError> {
        let raw: String = self.conn.query_row(
            "SELECT results FROM students WHERE id = ?1",
            params![student_id],
            |row| row.get(0),
        )?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn store_with_roster() -> (SheetStore, i64, i64) {
        let store = SheetStore::open_in_memory().unwrap();
        let group_id = store.get_or_create_group("A").unwrap();
        let course_id = store.add_course("Mathematics", "MATH", 10).unwrap();
        store.map_column(group_id, 1, course_id).unwrap();
        (store, group_id, course_id)
    }

    fn grid(column: u32, marks: &[(u32, Option<char>)]) -> AnswerGrid {
        let mut answers = AnswerGrid::new();
        answers.insert(column, marks.iter().cloned().collect::<BTreeMap<_, _>>());
        answers
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = SheetStore::open_in_memory().unwrap();
        let a = store.get_or_create_student("1234567").unwrap();
        let b = store.get_or_create_student("1234567").unwrap();
        assert_eq!(a, b);

        let g1 = store.get_or_create_group("A").unwrap();
        let g2 = store.get_or_create_group("A").unwrap();
        assert_eq!(g1, g2);
    }

    #[test]
    fn test_answer_grading_against_key() {
        let (store, group_id, course_id) = store_with_roster();
        store.upsert_answer_key(group_id, course_id, 1, 'B').unwrap();

        let student_id = store.get_or_create_student("42").unwrap();
        store
            .upsert_student_answer(student_id, group_id, course_id, 1, 'B')
            .unwrap();

        let is_correct: bool = store
            .conn
            .query_row(
                "SELECT is_correct FROM student_answers WHERE student_id = ?1",
                params![student_id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(is_correct);

        // Overwriting with a wrong answer regrades.
        store
            .upsert_student_answer(student_id, group_id, course_id, 1, 'C')
            .unwrap();
        let is_correct: bool = store
            .conn
            .query_row(
                "SELECT is_correct FROM student_answers WHERE student_id = ?1",
                params![student_id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!is_correct);
    }

    #[test]
    fn test_record_sheet_skips_unkeyed_questions() {
        let (store, group_id, course_id) = store_with_roster();
        store.upsert_answer_key(group_id, course_id, 1, 'A').unwrap();
        // No key for question 2.

        let answers = grid(1, &[(1, Some('A')), (2, Some('B')), (3, None)]);
        let student_id = store.record_sheet("77", "A", &answers).unwrap();

        let count: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM student_answers WHERE student_id = ?1",
                params![student_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_record_sheet_skips_unmapped_columns() {
        let (store, group_id, course_id) = store_with_roster();
        store.upsert_answer_key(group_id, course_id, 1, 'A').unwrap();

        // Column 9 has no mapping.
        let answers = grid(9, &[(1, Some('A'))]);
        let student_id = store.record_sheet("88", "A", &answers).unwrap();

        let count: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM student_answers WHERE student_id = ?1",
                params![student_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_record_answer_key_respects_course_total() {
        let store = SheetStore::open_in_memory().unwrap();
        let group_id = store.get_or_create_group("B").unwrap();
        let course_id = store.add_course("Physics", "PHYS", 2).unwrap();
        store.map_column(group_id, 1, course_id).unwrap();

        let answers = grid(1, &[(1, Some('A')), (2, Some('C')), (3, Some('D'))]);
        store.record_answer_key("B", &answers).unwrap();

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM answer_keys", [], |row| row.get(0))
            .unwrap();
        // Question 3 exceeds the course's 2-question total.
        assert_eq!(count, 2);
    }

    #[test]
    fn test_recalculate_results_scores_percentage() {
        let store = SheetStore::open_in_memory().unwrap();
        let group_id = store.get_or_create_group("A").unwrap();
        store
            .conn
            .execute(
                "UPDATE test_groups SET total_questions = 4 WHERE id = ?1",
                params![group_id],
            )
            .unwrap();
        let course_id = store.add_course("Chemistry", "CHEM", 4).unwrap();
        store.map_column(group_id, 1, course_id).unwrap();
        for (q, key) in [(1, 'A'), (2, 'B'), (3, 'C'), (4, 'D')] {
            store.upsert_answer_key(group_id, course_id, q, key).unwrap();
        }

        let answers = grid(1, &[(1, Some('A')), (2, Some('B')), (3, Some('E')), (4, None)]);
        let student_id = store.record_sheet("314", "A", &answers).unwrap();
        store.recalculate_results(student_id).unwrap();

        let results = store.student_results(student_id).unwrap();
        let overall = &results["CHEM"]["overall"];
        assert_eq!(overall["correct"], 2);
        assert_eq!(overall["incorrect"], 1);
        assert_eq!(overall["score"], 50.0);
    }

    #[test]
    fn test_results_untouched_without_recalculation() {
        // Writing answers alone must not change stored results; scoring is an
        // explicit operation.
        let (store, group_id, course_id) = store_with_roster();
        store.upsert_answer_key(group_id, course_id, 1, 'A').unwrap();
        let answers = grid(1, &[(1, Some('A'))]);
        let student_id = store.record_sheet("99", "A", &answers).unwrap();

        let results = store.student_results(student_id).unwrap();
        assert_eq!(results, serde_json::json!({}));
    }
}
