//! SQLite-backed [`Storage`] implementation.
//!
//! Four tables: `sessions`, `qa_records`, `evaluations`, and the opaque
//! `vector_store`. Retrieved chunks and traces are serialized JSON
//! columns on the QA record; evaluation rows carry the fixed dimensional
//! columns (all nullable) plus a metadata JSON map for secondary scores.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};

use super::Storage;
use crate::core::{
    Chunk, EmbeddedChunk, EvaluationScore, QaRecord, ScoreType, Session, TechniqueResult,
    TraceEvent, unix_now,
};
use crate::core::RetrievedChunk;
use crate::error::{ErrorKind, StorageError};

/// The fixed dimensional columns on `evaluations`.
const DIMENSION_COLUMNS: [&str; 5] = [
    "relevance",
    "faithfulness",
    "coherence",
    "fluency",
    "conciseness",
];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    title       TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS qa_records (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id            INTEGER NOT NULL REFERENCES sessions(id),
    technique_name        TEXT NOT NULL,
    query                 TEXT NOT NULL,
    answer                TEXT NOT NULL,
    retrieved_chunks_json TEXT NOT NULL,
    trace_json            TEXT NOT NULL,
    retrieval_time_ms     INTEGER NOT NULL,
    generation_time_ms    INTEGER NOT NULL,
    total_time_ms         INTEGER NOT NULL,
    error_kind            TEXT,
    created_at            INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_qa_records_session ON qa_records(session_id);

CREATE TABLE IF NOT EXISTS evaluations (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    qa_record_id  INTEGER NOT NULL REFERENCES qa_records(id),
    score_type    TEXT NOT NULL,
    evaluator     TEXT NOT NULL,
    relevance     REAL,
    faithfulness  REAL,
    coherence     REAL,
    fluency       REAL,
    conciseness   REAL,
    overall       REAL,
    metadata      TEXT NOT NULL DEFAULT '{}',
    created_at    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_evaluations_record ON evaluations(qa_record_id);

CREATE TABLE IF NOT EXISTS vector_store (
    chunk_id      TEXT PRIMARY KEY,
    document_id   TEXT NOT NULL,
    ordinal       INTEGER NOT NULL,
    text          TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    embedding     BLOB NOT NULL,
    UNIQUE(document_id, ordinal)
);
CREATE INDEX IF NOT EXISTS idx_vector_store_document ON vector_store(document_id);
";

/// SQLite storage backend.
///
/// The connection is thread-bound (`!Send`); open one handle per worker.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] when the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| StorageError::Open {
            message: e.to_string(),
        })?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    /// Opens an in-memory database with the schema created.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on schema creation failure.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Open {
            message: e.to_string(),
        })?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get(0)?,
            title: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
        })
    }

    fn row_to_qa_record(row: &rusqlite::Row<'_>) -> Result<QaRecord, StorageError> {
        let retrieved_json: String = row.get(5)?;
        let trace_json: String = row.get(6)?;
        let retrieved_chunks: Vec<RetrievedChunk> = serde_json::from_str(&retrieved_json)?;
        let trace: Vec<TraceEvent> = serde_json::from_str(&trace_json)?;
        let error_kind: Option<String> = row.get(10)?;

        let retrieval_ms: i64 = row.get(7)?;
        let generation_ms: i64 = row.get(8)?;
        let total_ms: i64 = row.get(9)?;

        Ok(QaRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            query: row.get(3)?,
            result: TechniqueResult {
                technique: row.get(2)?,
                answer: row.get(4)?,
                retrieved_chunks,
                trace,
                retrieval_time: ms_duration(retrieval_ms),
                generation_time: ms_duration(generation_ms),
                total_time: ms_duration(total_ms),
                error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
            },
            created_at: row.get(11)?,
        })
    }

    fn row_to_evaluation(row: &rusqlite::Row<'_>) -> Result<EvaluationScore, StorageError> {
        let score_type_raw: String = row.get(2)?;
        let metadata_raw: String = row.get(10)?;
        let metadata = serde_json::from_str(&metadata_raw)?;

        let mut dimensions = BTreeMap::new();
        for (offset, name) in DIMENSION_COLUMNS.iter().enumerate() {
            let value: Option<f64> = row.get(4 + offset)?;
            if let Some(value) = value {
                dimensions.insert((*name).to_string(), value);
            }
        }

        Ok(EvaluationScore {
            id: row.get(0)?,
            qa_record_id: row.get(1)?,
            score_type: ScoreType::parse(&score_type_raw).unwrap_or(ScoreType::Human),
            evaluator: row.get(3)?,
            dimensions,
            overall: row.get(9)?,
            metadata,
            created_at: row.get(11)?,
        })
    }
}

const QA_COLUMNS: &str = "id, session_id, technique_name, query, answer, \
     retrieved_chunks_json, trace_json, retrieval_time_ms, generation_time_ms, \
     total_time_ms, error_kind, created_at";

const EVAL_COLUMNS: &str = "id, qa_record_id, score_type, evaluator, \
     relevance, faithfulness, coherence, fluency, conciseness, overall, \
     metadata, created_at";

impl Storage for SqliteStorage {
    fn init(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn is_initialized(&self) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sessions'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn create_session(&self, title: &str) -> Result<Session, StorageError> {
        let now = unix_now();
        self.conn.execute(
            "INSERT INTO sessions (title, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![title, now],
        )?;
        Ok(Session {
            id: self.conn.last_insert_rowid(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    fn get_session(&self, id: i64) -> Result<Option<Session>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, title, created_at, updated_at FROM sessions WHERE id = ?1",
                params![id],
                Self::row_to_session,
            )
            .optional()?)
    }

    fn list_sessions(&self) -> Result<Vec<Session>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, created_at, updated_at FROM sessions ORDER BY updated_at DESC",
        )?;
        let sessions = stmt
            .query_map([], Self::row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    fn insert_qa_batch(
        &self,
        session_id: i64,
        query: &str,
        results: &[TechniqueResult],
    ) -> Result<Vec<i64>, StorageError> {
        let now = unix_now();
        let tx = self.conn.unchecked_transaction()?;
        let mut ids = Vec::with_capacity(results.len());

        {
            let mut stmt = tx.prepare(
                "INSERT INTO qa_records (session_id, technique_name, query, answer, \
                 retrieved_chunks_json, trace_json, retrieval_time_ms, generation_time_ms, \
                 total_time_ms, error_kind, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;

            for result in results {
                let retrieved_json = serde_json::to_string(&result.retrieved_chunks)?;
                let trace_json = serde_json::to_string(&result.trace)?;
                stmt.execute(params![
                    session_id,
                    result.technique,
                    query,
                    result.answer,
                    retrieved_json,
                    trace_json,
                    duration_ms(result.retrieval_time),
                    duration_ms(result.generation_time),
                    duration_ms(result.total_time),
                    result.error_kind.map(ErrorKind::as_str),
                    now,
                ])?;
                ids.push(tx.last_insert_rowid());
            }

            stmt.finalize()?;
        }

        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![now, session_id],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    fn get_qa_record(&self, id: i64) -> Result<Option<QaRecord>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {QA_COLUMNS} FROM qa_records WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_qa_record(row)?)),
            None => Ok(None),
        }
    }

    fn list_qa_records(&self, session_id: i64) -> Result<Vec<QaRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {QA_COLUMNS} FROM qa_records WHERE session_id = ?1 ORDER BY id ASC"
        ))?;
        let mut rows = stmt.query(params![session_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::row_to_qa_record(row)?);
        }
        Ok(records)
    }

    fn insert_evaluation(&self, score: &EvaluationScore) -> Result<i64, StorageError> {
        // The record must exist; FK enforcement catches stale ids.
        let metadata_json = serde_json::to_string(&score.metadata)?;
        self.conn.execute(
            "INSERT INTO evaluations (qa_record_id, score_type, evaluator, \
             relevance, faithfulness, coherence, fluency, conciseness, overall, \
             metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                score.qa_record_id,
                score.score_type.as_str(),
                score.evaluator,
                score.dimensions.get("relevance"),
                score.dimensions.get("faithfulness"),
                score.dimensions.get("coherence"),
                score.dimensions.get("fluency"),
                score.dimensions.get("conciseness"),
                score.overall,
                metadata_json,
                if score.created_at == 0 {
                    unix_now()
                } else {
                    score.created_at
                },
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_evaluations(&self, qa_record_id: i64) -> Result<Vec<EvaluationScore>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVAL_COLUMNS} FROM evaluations WHERE qa_record_id = ?1 \
             ORDER BY created_at DESC, id DESC"
        ))?;
        let mut rows = stmt.query(params![qa_record_id])?;
        let mut scores = Vec::new();
        while let Some(row) = rows.next()? {
            scores.push(Self::row_to_evaluation(row)?);
        }
        Ok(scores)
    }

    fn latest_evaluation(
        &self,
        qa_record_id: i64,
        score_type: ScoreType,
        evaluator: &str,
    ) -> Result<Option<EvaluationScore>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVAL_COLUMNS} FROM evaluations \
             WHERE qa_record_id = ?1 AND score_type = ?2 AND evaluator = ?3 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![qa_record_id, score_type.as_str(), evaluator])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_evaluation(row)?)),
            None => Ok(None),
        }
    }

    fn upsert_chunks(&self, chunks: &[EmbeddedChunk]) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO vector_store \
                 (chunk_id, document_id, ordinal, text, metadata_json, embedding) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chunk in chunks {
                let metadata_json = serde_json::to_string(&chunk.chunk.metadata)?;
                stmt.execute(params![
                    chunk.chunk.chunk_id,
                    chunk.chunk.document_id,
                    chunk.chunk.ordinal as i64,
                    chunk.chunk.text,
                    metadata_json,
                    encode_embedding(&chunk.vector),
                ])?;
            }
            stmt.finalize()?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_chunks(&self) -> Result<Vec<EmbeddedChunk>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT chunk_id, document_id, ordinal, text, metadata_json, embedding \
             FROM vector_store ORDER BY document_id, ordinal",
        )?;
        let mut rows = stmt.query([])?;
        let mut chunks = Vec::new();
        while let Some(row) = rows.next()? {
            let metadata_raw: String = row.get(4)?;
            let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_raw)?;
            let ordinal: i64 = row.get(2)?;
            let blob: Vec<u8> = row.get(5)?;
            chunks.push(EmbeddedChunk {
                chunk: Chunk {
                    chunk_id: row.get(0)?,
                    document_id: row.get(1)?,
                    ordinal: usize::try_from(ordinal).unwrap_or(0),
                    text: row.get(3)?,
                    metadata,
                },
                vector: decode_embedding(&blob),
            });
        }
        Ok(chunks)
    }

    fn delete_document(&self, document_id: &str) -> Result<usize, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM vector_store WHERE document_id = ?1",
            params![document_id],
        )?;
        Ok(removed)
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn ms_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

/// Embeddings are stored as little-endian f32 bytes.
fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}
