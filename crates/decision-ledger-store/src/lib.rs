//! Persistence for the decision ledger: the append-only JSONL log that is the
//! single source of truth, and the derived SQLite index that serves queries.
//! The index is disposable; deleting it and replaying the log reproduces the
//! same query results.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use decision_ledger_core::{
    apply_patch, decision_terms, glob_match, reduce, tokenize, Decision, DecisionId,
    DecisionPatch, DecisionRecord, DecisionStatus, DecisionType, LedgerError, SummaryInput,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const LEDGER_DIR: &str = ".decisions";
pub const LEDGER_FILE: &str = "ledger.jsonl";
pub const INDEX_FILE: &str = "index.sqlite";

const FINGERPRINT_KEY: &str = "ledger_fingerprint";

const CREATE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS decisions (
  id TEXT PRIMARY KEY,
  seq INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('product','process','constraint','learning')),
  status TEXT NOT NULL CHECK (status IN ('active','superseded')),
  problem TEXT NOT NULL,
  choice TEXT NOT NULL,
  rationale TEXT,
  curated_into TEXT,
  raw_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decision_files (
  decision_id TEXT NOT NULL,
  file TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decision_symbols (
  decision_id TEXT NOT NULL,
  symbol TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decision_refs (
  decision_id TEXT NOT NULL,
  reference TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decision_terms (
  decision_id TEXT NOT NULL,
  term TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decisions_status ON decisions(status);
CREATE INDEX IF NOT EXISTS idx_decisions_kind ON decisions(kind);
CREATE INDEX IF NOT EXISTS idx_decision_files_id ON decision_files(decision_id);
CREATE INDEX IF NOT EXISTS idx_decision_symbols_symbol ON decision_symbols(symbol);
CREATE INDEX IF NOT EXISTS idx_decision_refs_reference ON decision_refs(reference);
CREATE INDEX IF NOT EXISTS idx_decision_terms_term ON decision_terms(term);
";

#[must_use]
pub fn ledger_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(LEDGER_DIR)
}

#[must_use]
pub fn ledger_path(repo_root: &Path) -> PathBuf {
    ledger_dir(repo_root).join(LEDGER_FILE)
}

#[must_use]
pub fn index_path(repo_root: &Path) -> PathBuf {
    ledger_dir(repo_root).join(INDEX_FILE)
}

fn store_io(err: &dyn std::fmt::Display, path: &Path) -> LedgerError {
    LedgerError::StoreIo(format!("{}: {err}", path.display()))
}

fn index_err(err: &dyn std::fmt::Display) -> LedgerError {
    LedgerError::Index(err.to_string())
}

/// Append one record as a single JSONL line, creating the ledger directory
/// and file on first use. Never touches the index.
///
/// The record and its trailing newline go out in one write on an append-mode
/// handle, so concurrent writers interleave whole lines and never split a
/// record.
///
/// # Errors
/// Returns [`LedgerError::StoreIo`] when the directory or file cannot be
/// written.
pub fn append_record(repo_root: &Path, record: &DecisionRecord) -> Result<(), LedgerError> {
    let dir = ledger_dir(repo_root);
    fs::create_dir_all(&dir).map_err(|err| store_io(&err, &dir))?;

    let path = ledger_path(repo_root);
    let mut line = serde_json::to_string(record).map_err(|err| store_io(&err, &path))?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| store_io(&err, &path))?;
    file.write_all(line.as_bytes()).map_err(|err| store_io(&err, &path))?;
    file.flush().map_err(|err| store_io(&err, &path))?;
    Ok(())
}

/// Read the full ordered record sequence, oldest first. A missing ledger is
/// an empty ledger. Any unparsable line fails the whole read closed.
///
/// # Errors
/// Returns [`LedgerError::StoreIo`] on read failure or
/// [`LedgerError::StoreCorrupt`] naming the 1-based offending line.
pub fn read_all_records(repo_root: &Path) -> Result<Vec<DecisionRecord>, LedgerError> {
    let path = ledger_path(repo_root);
    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(store_io(&err, &path)),
    };

    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| store_io(&err, &path))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str(trimmed).map_err(|err| LedgerError::StoreCorrupt {
            line: index + 1,
            detail: err.to_string(),
        })?;
        records.push(record);
    }

    Ok(records)
}

/// Fold the whole ledger into current state, one decision per id, in log
/// order. Works without any index.
///
/// # Errors
/// Propagates ledger read failures.
pub fn current_decisions(repo_root: &Path) -> Result<Vec<Decision>, LedgerError> {
    Ok(reduce(&read_all_records(repo_root)?))
}

/// Current state of one decision straight from the ledger.
///
/// # Errors
/// Propagates ledger read failures.
pub fn decision_by_id(
    repo_root: &Path,
    id: &DecisionId,
) -> Result<Option<Decision>, LedgerError> {
    Ok(current_decisions(repo_root)?.into_iter().find(|decision| decision.id == *id))
}

/// All active decisions straight from the ledger, in log order.
///
/// # Errors
/// Propagates ledger read failures.
pub fn active_decisions(repo_root: &Path) -> Result<Vec<Decision>, LedgerError> {
    Ok(current_decisions(repo_root)?
        .into_iter()
        .filter(|decision| decision.status == DecisionStatus::Active)
        .collect())
}

fn ledger_fingerprint(repo_root: &Path) -> Result<String, LedgerError> {
    let path = ledger_path(repo_root);
    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok("absent".to_string());
        }
        Err(err) => return Err(store_io(&err, &path)),
    };

    let modified = meta.modified().map_err(|err| store_io(&err, &path))?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|err| store_io(&err, &path))?
        .as_nanos();
    Ok(format!("{nanos}:{}", meta.len()))
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub status: Option<DecisionStatus>,
    pub kind: Option<DecisionType>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    fn matches(&self, decision: &Decision) -> bool {
        self.status.is_none_or(|status| decision.status == status)
            && self.kind.is_none_or(|kind| decision.kind == kind)
    }
}

/// Query result for a set of code targets: the decisions touching them plus
/// the active constraints not already among those decisions.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContextBundle {
    pub decisions: Vec<Decision>,
    pub constraints: Vec<Decision>,
}

/// The derived SQLite query index over the ledger's folded state.
///
/// Opening compares the stored ledger fingerprint against the file and
/// replays the log when they differ, so a handle always reflects the ledger
/// as of `open`. The database file is safely deletable at any time.
pub struct DecisionIndex {
    conn: Connection,
    repo_root: PathBuf,
}

impl DecisionIndex {
    /// Open or create the index, rebuilding from the ledger when the stored
    /// fingerprint is missing or stale.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] when the database cannot be opened or
    /// prepared, and propagates ledger read failures during a rebuild.
    pub fn open(repo_root: &Path) -> Result<Self, LedgerError> {
        let dir = ledger_dir(repo_root);
        fs::create_dir_all(&dir).map_err(|err| store_io(&err, &dir))?;

        let path = index_path(repo_root);
        let conn = Connection::open(&path)
            .map_err(|err| LedgerError::Index(format!("{}: {err}", path.display())))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| index_err(&err))?;
        conn.execute_batch(CREATE_SCHEMA_SQL).map_err(|err| index_err(&err))?;

        let mut index = Self { conn, repo_root: repo_root.to_path_buf() };

        let stored = index.stored_fingerprint()?;
        let actual = ledger_fingerprint(repo_root)?;
        if stored.as_deref() != Some(actual.as_str()) {
            index.rebuild()?;
        }

        Ok(index)
    }

    /// Release the connection. Dropping the handle releases it too; this form
    /// surfaces close-time errors.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] when SQLite reports a close failure.
    pub fn close(self) -> Result<(), LedgerError> {
        self.conn.close().map_err(|(_, err)| index_err(&err))
    }

    /// Discard all index rows and replay the whole ledger through the fold.
    /// Also the recovery path for any index error: delete and rebuild.
    ///
    /// # Errors
    /// Propagates ledger read failures and [`LedgerError::Index`] on write
    /// failure.
    pub fn rebuild(&mut self) -> Result<(), LedgerError> {
        let decisions = current_decisions(&self.repo_root)?;
        let fingerprint = ledger_fingerprint(&self.repo_root)?;

        let tx = self.conn.transaction().map_err(|err| index_err(&err))?;
        tx.execute_batch(
            "DELETE FROM decisions;
             DELETE FROM decision_files;
             DELETE FROM decision_symbols;
             DELETE FROM decision_refs;
             DELETE FROM decision_terms;",
        )
        .map_err(|err| index_err(&err))?;

        for (position, decision) in decisions.iter().enumerate() {
            let seq = i64::try_from(position).map_err(|err| index_err(&err))? + 1;
            insert_decision_rows(&tx, decision, seq)?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO metadata(key, value) VALUES (?1, ?2)",
            params![FINGERPRINT_KEY, fingerprint],
        )
        .map_err(|err| index_err(&err))?;
        tx.commit().map_err(|err| index_err(&err))?;
        Ok(())
    }

    /// Append one record to the ledger, then fold it into the index. This is
    /// the write path every mutation goes through; the incremental result is
    /// observationally identical to a full rebuild.
    ///
    /// # Errors
    /// Propagates ledger append and index write failures.
    pub fn commit_record(&mut self, record: &DecisionRecord) -> Result<(), LedgerError> {
        append_record(&self.repo_root, record)?;
        self.apply_record(record)?;
        self.refresh_fingerprint()
    }

    /// Record a validated decision, and when it supersedes another, append
    /// the status/backlink update for the old decision through the same path.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] for schema violations and
    /// propagates write failures.
    pub fn record_decision(&mut self, decision: &Decision) -> Result<(), LedgerError> {
        decision.validate()?;
        self.commit_record(&DecisionRecord::Creation(decision.clone()))?;

        if let Some(old_id) = &decision.supersedes {
            let mut patch = DecisionPatch::for_id(old_id.clone());
            patch.status = Some(DecisionStatus::Superseded);
            patch.superseded_by = Some(decision.id.clone());
            self.commit_record(&DecisionRecord::Update(patch))?;
        }

        Ok(())
    }

    /// Record a summary decision for curated input. Idempotent: when the
    /// content-derived id already exists, the existing decision is returned
    /// and nothing is written.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the input has no target ids
    /// or an empty summary, and propagates write failures.
    pub fn create_summary(&mut self, input: &SummaryInput) -> Result<Decision, LedgerError> {
        if input.summarizes.is_empty() {
            return Err(LedgerError::Validation(
                "summary MUST reference at least one decision".to_string(),
            ));
        }
        if input.summary.trim().is_empty() {
            return Err(LedgerError::Validation("summary MUST be non-empty".to_string()));
        }

        let id = input.summary_id();
        if let Some(existing) = self.query_by_id(&id)? {
            return Ok(existing);
        }

        let summary = Decision::from_summary(input, OffsetDateTime::now_utc());
        summary.validate()?;
        self.commit_record(&DecisionRecord::Creation(summary.clone()))?;
        Ok(summary)
    }

    /// Append a `curated_into` backlink update for each id. `summary_id`
    /// existence is the caller's responsibility. Stops at the first failure;
    /// the error names the ids already written (append-only, no rollback).
    ///
    /// # Errors
    /// Propagates write failures, annotated with the partial progress.
    pub fn mark_curated(
        &mut self,
        ids: &[DecisionId],
        summary_id: &DecisionId,
    ) -> Result<usize, LedgerError> {
        let mut written: Vec<&str> = Vec::new();

        for id in ids {
            let mut patch = DecisionPatch::for_id(id.clone());
            patch.curated_into = Some(summary_id.clone());
            if let Err(err) = self.commit_record(&DecisionRecord::Update(patch)) {
                return Err(LedgerError::StoreIo(format!(
                    "mark_curated stopped at {id}: {err}; already written: [{}]",
                    written.join(", ")
                )));
            }
            written.push(id.as_str());
        }

        Ok(written.len())
    }

    /// Current state of one decision; `None` is a normal not-found outcome.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] on read failure.
    pub fn query_by_id(&self, id: &DecisionId) -> Result<Option<Decision>, LedgerError> {
        let raw = self
            .conn
            .prepare("SELECT raw_json FROM decisions WHERE id = ?1")
            .map_err(|err| index_err(&err))?
            .query_row(params![id.as_str()], |row| row.get::<_, String>(0))
            .optional()
            .map_err(|err| index_err(&err))?;

        raw.map(|json| decode_decision(&json)).transpose()
    }

    /// Active decisions whose files match the glob, newest first. Uses the
    /// same pattern language as curation filtering.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] on read failure.
    pub fn query_by_file(&self, pattern: &str) -> Result<Vec<Decision>, LedgerError> {
        let decisions = self.load_decisions(
            "SELECT raw_json FROM decisions
             WHERE status = 'active'
             ORDER BY created_at DESC, seq DESC",
        )?;
        Ok(decisions
            .into_iter()
            .filter(|decision| decision.files.iter().any(|file| glob_match(pattern, file)))
            .collect())
    }

    /// Active decisions referencing the symbol exactly, newest first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] on read failure.
    pub fn query_by_symbol(&self, symbol: &str) -> Result<Vec<Decision>, LedgerError> {
        self.load_decisions_with_param(
            "SELECT d.raw_json FROM decisions d
             JOIN decision_symbols s ON s.decision_id = d.id
             WHERE s.symbol = ?1 AND d.status = 'active'
             ORDER BY d.created_at DESC, d.seq DESC",
            symbol,
        )
    }

    /// Active decisions carrying the external reference exactly, newest
    /// first.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] on read failure.
    pub fn query_by_ref(&self, reference: &str) -> Result<Vec<Decision>, LedgerError> {
        self.load_decisions_with_param(
            "SELECT d.raw_json FROM decisions d
             JOIN decision_refs r ON r.decision_id = d.id
             WHERE r.reference = ?1 AND d.status = 'active'
             ORDER BY d.created_at DESC, d.seq DESC",
            reference,
        )
    }

    /// Filtered listing in log order; the base operation curation builds on.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] on read failure.
    pub fn query_all(&self, filter: &QueryFilter) -> Result<Vec<Decision>, LedgerError> {
        let decisions =
            self.load_decisions("SELECT raw_json FROM decisions ORDER BY seq ASC")?;
        let mut matched: Vec<Decision> =
            decisions.into_iter().filter(|decision| filter.matches(decision)).collect();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    /// Tokenized full-text search over problem/choice/rationale, ranked by
    /// matched-term count with a log-order tie-break. Deterministic for a
    /// fixed index state and query string. An empty query degenerates to
    /// `query_all`.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] on read failure.
    pub fn search_full_text(
        &self,
        query: &str,
        filter: &QueryFilter,
    ) -> Result<Vec<Decision>, LedgerError> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return self.query_all(filter);
        }

        let mut match_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT decision_id FROM decision_terms WHERE term = ?1")
            .map_err(|err| index_err(&err))?;
        for term in &terms {
            let rows = stmt
                .query_map(params![term], |row| row.get::<_, String>(0))
                .map_err(|err| index_err(&err))?;
            for row in rows {
                let id = row.map_err(|err| index_err(&err))?;
                *match_counts.entry(id).or_insert(0) += 1;
            }
        }

        let in_log_order =
            self.load_decisions("SELECT raw_json FROM decisions ORDER BY seq ASC")?;
        let mut ranked: Vec<(usize, Decision)> = in_log_order
            .into_iter()
            .filter(|decision| filter.matches(decision))
            .filter_map(|decision| {
                match_counts.get(decision.id.as_str()).map(|count| (*count, decision))
            })
            .collect();
        // Stable sort keeps seq order within equal match counts.
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let mut results: Vec<Decision> =
            ranked.into_iter().map(|(_, decision)| decision).collect();
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// All active constraint decisions, in log order.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] on read failure.
    pub fn active_constraints(&self) -> Result<Vec<Decision>, LedgerError> {
        self.query_all(&QueryFilter {
            status: Some(DecisionStatus::Active),
            kind: Some(DecisionType::Constraint),
            limit: None,
        })
    }

    /// Everything relevant before touching the given files or symbols: per
    /// target, file-glob and symbol matches, deduplicated by id across the
    /// union; plus the active constraints not already among them.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] on read failure.
    pub fn decisions_for_context(
        &self,
        targets: &[String],
    ) -> Result<ContextBundle, LedgerError> {
        let mut seen: BTreeSet<DecisionId> = BTreeSet::new();
        let mut decisions = Vec::new();

        for target in targets {
            let mut matches = self.query_by_file(target)?;
            matches.extend(self.query_by_symbol(target)?);
            for decision in matches {
                if seen.insert(decision.id.clone()) {
                    decisions.push(decision);
                }
            }
        }

        let constraints = self
            .active_constraints()?
            .into_iter()
            .filter(|constraint| !seen.contains(&constraint.id))
            .collect();

        Ok(ContextBundle { decisions, constraints })
    }

    fn stored_fingerprint(&self) -> Result<Option<String>, LedgerError> {
        self.conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")
            .map_err(|err| index_err(&err))?
            .query_row(params![FINGERPRINT_KEY], |row| row.get::<_, String>(0))
            .optional()
            .map_err(|err| index_err(&err))
    }

    fn refresh_fingerprint(&self) -> Result<(), LedgerError> {
        let fingerprint = ledger_fingerprint(&self.repo_root)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO metadata(key, value) VALUES (?1, ?2)",
                params![FINGERPRINT_KEY, fingerprint],
            )
            .map_err(|err| index_err(&err))?;
        Ok(())
    }

    /// Upsert one decision's folded current state: the decision row and its
    /// file/symbol/ref/term entries are replaced by id in one transaction.
    /// Idempotent; a known id keeps its first-seen `seq`, a new id takes the
    /// next one.
    ///
    /// # Errors
    /// Returns [`LedgerError::Index`] on write failure.
    pub fn index_decision(&mut self, decision: &Decision) -> Result<(), LedgerError> {
        let existing_seq = self
            .conn
            .query_row(
                "SELECT seq FROM decisions WHERE id = ?1",
                params![decision.id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|err| index_err(&err))?;

        let tx = self.conn.transaction().map_err(|err| index_err(&err))?;
        let seq = match existing_seq {
            Some(seq) => seq,
            None => {
                tx.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM decisions", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(|err| index_err(&err))?
            }
        };

        delete_decision_rows(&tx, decision.id.as_str())?;
        insert_decision_rows(&tx, decision, seq)?;
        tx.commit().map_err(|err| index_err(&err))?;
        Ok(())
    }

    /// Fold one record into the index using the same override semantics as
    /// the full rebuild. An update for an unknown id is skipped, matching the
    /// fold; a repeat creation keeps the original `created_at`/`kind`.
    fn apply_record(&mut self, record: &DecisionRecord) -> Result<(), LedgerError> {
        let folded = match (record, self.query_by_id(record.id())?) {
            (DecisionRecord::Creation(decision), None) => decision.clone(),
            (DecisionRecord::Creation(decision), Some(prior)) => {
                let mut folded = decision.clone();
                folded.created_at = prior.created_at;
                folded.kind = prior.kind;
                folded
            }
            (DecisionRecord::Update(patch), Some(mut prior)) => {
                apply_patch(&mut prior, patch);
                prior
            }
            (DecisionRecord::Update(_), None) => return Ok(()),
        };

        self.index_decision(&folded)
    }

    fn load_decisions(&self, sql: &str) -> Result<Vec<Decision>, LedgerError> {
        let mut stmt = self.conn.prepare(sql).map_err(|err| index_err(&err))?;
        let rows =
            stmt.query_map([], |row| row.get::<_, String>(0)).map_err(|err| index_err(&err))?;

        let mut decisions = Vec::new();
        for row in rows {
            let raw = row.map_err(|err| index_err(&err))?;
            decisions.push(decode_decision(&raw)?);
        }
        Ok(decisions)
    }

    fn load_decisions_with_param(
        &self,
        sql: &str,
        param: &str,
    ) -> Result<Vec<Decision>, LedgerError> {
        let mut stmt = self.conn.prepare(sql).map_err(|err| index_err(&err))?;
        let rows = stmt
            .query_map(params![param], |row| row.get::<_, String>(0))
            .map_err(|err| index_err(&err))?;

        let mut decisions = Vec::new();
        for row in rows {
            let raw = row.map_err(|err| index_err(&err))?;
            decisions.push(decode_decision(&raw)?);
        }
        Ok(decisions)
    }
}

fn decode_decision(raw: &str) -> Result<Decision, LedgerError> {
    serde_json::from_str(raw)
        .map_err(|err| LedgerError::Index(format!("stored decision row is invalid: {err}")))
}

fn delete_decision_rows(tx: &rusqlite::Transaction<'_>, id: &str) -> Result<(), LedgerError> {
    for sql in [
        "DELETE FROM decisions WHERE id = ?1",
        "DELETE FROM decision_files WHERE decision_id = ?1",
        "DELETE FROM decision_symbols WHERE decision_id = ?1",
        "DELETE FROM decision_refs WHERE decision_id = ?1",
        "DELETE FROM decision_terms WHERE decision_id = ?1",
    ] {
        tx.execute(sql, params![id]).map_err(|err| index_err(&err))?;
    }
    Ok(())
}

fn insert_decision_rows(
    tx: &rusqlite::Transaction<'_>,
    decision: &Decision,
    seq: i64,
) -> Result<(), LedgerError> {
    let created_at = decision
        .created_at
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| index_err(&err))?;
    let raw_json = serde_json::to_string(decision).map_err(|err| index_err(&err))?;

    tx.execute(
        "INSERT INTO decisions(
            id, seq, created_at, kind, status, problem, choice, rationale, curated_into, raw_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            decision.id.as_str(),
            seq,
            created_at,
            decision.kind.as_str(),
            decision.status.as_str(),
            decision.problem,
            decision.choice,
            decision.rationale,
            decision.curated_into.as_ref().map(DecisionId::as_str),
            raw_json,
        ],
    )
    .map_err(|err| index_err(&err))?;

    for file in &decision.files {
        tx.execute(
            "INSERT INTO decision_files(decision_id, file) VALUES (?1, ?2)",
            params![decision.id.as_str(), file],
        )
        .map_err(|err| index_err(&err))?;
    }
    for symbol in &decision.symbols {
        tx.execute(
            "INSERT INTO decision_symbols(decision_id, symbol) VALUES (?1, ?2)",
            params![decision.id.as_str(), symbol],
        )
        .map_err(|err| index_err(&err))?;
    }
    for reference in &decision.refs {
        tx.execute(
            "INSERT INTO decision_refs(decision_id, reference) VALUES (?1, ?2)",
            params![decision.id.as_str(), reference],
        )
        .map_err(|err| index_err(&err))?;
    }
    for term in decision_terms(decision) {
        tx.execute(
            "INSERT INTO decision_terms(decision_id, term) VALUES (?1, ?2)",
            params![decision.id.as_str(), term],
        )
        .map_err(|err| index_err(&err))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use decision_ledger_core::{DecidedBy, DecisionDraft};
    use tempfile::TempDir;
    use time::Duration;

    use super::*;

    fn temp_repo() -> TempDir {
        match TempDir::new() {
            Ok(dir) => dir,
            Err(err) => panic!("failed to create temp repo: {err}"),
        }
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mk_decision(problem: &str, choice: &str, kind: DecisionType) -> Decision {
        Decision::from_draft(
            DecisionId::generate(problem, choice),
            DecisionDraft {
                kind,
                problem: problem.to_string(),
                choice: choice.to_string(),
                rationale: None,
                decided_by: Some(DecidedBy::human()),
                files: Vec::new(),
                symbols: Vec::new(),
                refs: Vec::new(),
                supersedes: None,
            },
            fixture_time(),
        )
    }

    fn open_index(repo_root: &Path) -> DecisionIndex {
        match DecisionIndex::open(repo_root) {
            Ok(index) => index,
            Err(err) => panic!("failed to open index: {err}"),
        }
    }

    fn must<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected ledger error: {err}"),
        }
    }

    #[test]
    fn append_then_read_round_trips_in_order() {
        let repo = temp_repo();
        let a = mk_decision("alpha", "one", DecisionType::Product);
        let b = mk_decision("beta", "two", DecisionType::Process);

        must(append_record(repo.path(), &DecisionRecord::Creation(a.clone())));
        must(append_record(repo.path(), &DecisionRecord::Creation(b.clone())));

        let records = must(read_all_records(repo.path()));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id(), &a.id);
        assert_eq!(records[1].id(), &b.id);
    }

    #[test]
    fn concurrent_appends_interleave_as_whole_records() {
        let repo = temp_repo();
        let root = repo.path().to_path_buf();
        let writers = 16_usize;
        let per_writer = 4000_usize;

        let handles: Vec<_> = (0..writers)
            .map(|writer| {
                let root = root.clone();
                std::thread::spawn(move || {
                    for item in 0..per_writer {
                        let decision = mk_decision(
                            &format!("writer {writer} item {item}"),
                            "concurrent append",
                            DecisionType::Product,
                        );
                        if let Err(err) =
                            append_record(&root, &DecisionRecord::Creation(decision))
                        {
                            panic!("append failed: {err}");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                panic!("writer thread panicked");
            }
        }

        let records = must(read_all_records(&root));
        assert_eq!(records.len(), writers * per_writer);
    }

    #[test]
    fn missing_ledger_reads_as_empty() {
        let repo = temp_repo();
        assert!(must(read_all_records(repo.path())).is_empty());
        assert!(must(current_decisions(repo.path())).is_empty());
    }

    #[test]
    fn corrupt_line_fails_closed_with_position() {
        let repo = temp_repo();
        let a = mk_decision("alpha", "one", DecisionType::Product);
        must(append_record(repo.path(), &DecisionRecord::Creation(a)));

        let path = ledger_path(repo.path());
        let mut existing = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => panic!("failed to read ledger: {err}"),
        };
        existing.push_str("{not json\n");
        if let Err(err) = fs::write(&path, existing) {
            panic!("failed to rewrite ledger: {err}");
        }

        match read_all_records(repo.path()) {
            Err(LedgerError::StoreCorrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected StoreCorrupt, got {other:?}"),
        }
    }

    #[test]
    fn incremental_writes_equal_full_rebuild() {
        let repo = temp_repo();
        let a = mk_decision("alpha", "one", DecisionType::Product);
        let mut b = mk_decision("beta", "two", DecisionType::Constraint);
        b.files = vec!["src/auth/login.rs".to_string()];

        let mut index = open_index(repo.path());
        must(index.record_decision(&a));
        must(index.record_decision(&b));
        let mut patch = DecisionPatch::for_id(a.id.clone());
        patch.rationale = Some("measured first".to_string());
        must(index.commit_record(&DecisionRecord::Update(patch)));

        let incremental = must(index.query_all(&QueryFilter::default()));
        must(index.rebuild());
        let rebuilt = must(index.query_all(&QueryFilter::default()));

        assert_eq!(incremental, rebuilt);
        assert_eq!(incremental.len(), 2);
        assert_eq!(incremental[0].rationale.as_deref(), Some("measured first"));
        must(index.close());
    }

    #[test]
    fn deleting_the_index_loses_nothing() {
        let repo = temp_repo();
        let a = mk_decision("alpha", "one", DecisionType::Product);

        let mut index = open_index(repo.path());
        must(index.record_decision(&a));
        must(index.close());

        if let Err(err) = fs::remove_file(index_path(repo.path())) {
            panic!("failed to delete index: {err}");
        }

        let reopened = open_index(repo.path());
        let found = must(reopened.query_by_id(&a.id));
        assert_eq!(found.map(|decision| decision.id), Some(a.id));
    }

    #[test]
    fn open_detects_external_ledger_writes() {
        let repo = temp_repo();
        let a = mk_decision("alpha", "one", DecisionType::Product);
        let b = mk_decision("beta", "two", DecisionType::Process);

        let mut index = open_index(repo.path());
        must(index.record_decision(&a));
        must(index.close());

        // Another writer appends directly to the ledger.
        must(append_record(repo.path(), &DecisionRecord::Creation(b.clone())));

        let reopened = open_index(repo.path());
        let found = must(reopened.query_by_id(&b.id));
        assert!(found.is_some(), "stale index must rebuild on open");
    }

    #[test]
    fn query_by_file_uses_glob_and_skips_superseded() {
        let repo = temp_repo();
        let mut auth = mk_decision("auth decision", "one", DecisionType::Product);
        auth.files = vec!["src/auth/login.rs".to_string()];
        let mut billing = mk_decision("billing decision", "two", DecisionType::Product);
        billing.files = vec!["src/billing/invoice.rs".to_string()];
        billing.status = DecisionStatus::Superseded;

        let mut index = open_index(repo.path());
        must(index.record_decision(&auth));
        must(index.commit_record(&DecisionRecord::Creation(billing)));

        let matched = must(index.query_by_file("src/auth/*"));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, auth.id);
        assert!(must(index.query_by_file("src/billing/*")).is_empty());
        assert_eq!(must(index.query_by_file("src/*")).len(), 1);
    }

    #[test]
    fn symbol_and_ref_lookups_are_exact() {
        let repo = temp_repo();
        let mut decision = mk_decision("alpha", "one", DecisionType::Product);
        decision.symbols = vec!["AuthService.login".to_string()];
        decision.refs = vec!["JIRA-123".to_string()];

        let mut index = open_index(repo.path());
        must(index.record_decision(&decision));

        assert_eq!(must(index.query_by_symbol("AuthService.login")).len(), 1);
        assert!(must(index.query_by_symbol("AuthService")).is_empty());
        assert_eq!(must(index.query_by_ref("JIRA-123")).len(), 1);
        assert!(must(index.query_by_ref("JIRA-12")).is_empty());
    }

    #[test]
    fn query_all_filters_compose_and_keep_log_order() {
        let repo = temp_repo();
        let a = mk_decision("alpha", "one", DecisionType::Product);
        let b = mk_decision("beta", "two", DecisionType::Constraint);
        let c = mk_decision("gamma", "three", DecisionType::Constraint);

        let mut index = open_index(repo.path());
        for decision in [&a, &b, &c] {
            must(index.record_decision(decision));
        }
        let mut patch = DecisionPatch::for_id(c.id.clone());
        patch.status = Some(DecisionStatus::Superseded);
        must(index.commit_record(&DecisionRecord::Update(patch)));

        let all = must(index.query_all(&QueryFilter::default()));
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, a.id);

        let constraints = must(index.query_all(&QueryFilter {
            status: Some(DecisionStatus::Active),
            kind: Some(DecisionType::Constraint),
            limit: None,
        }));
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].id, b.id);

        let limited = must(index.query_all(&QueryFilter {
            limit: Some(2),
            ..QueryFilter::default()
        }));
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn full_text_ranks_by_matched_terms_then_log_order() {
        let repo = temp_repo();
        let mut one = mk_decision("postgres migration plan", "use sqlite", DecisionType::Product);
        one.rationale = Some("sqlite is simpler".to_string());
        let two = mk_decision("cache eviction", "use sqlite", DecisionType::Product);
        let three = mk_decision("logging format", "json lines", DecisionType::Process);

        let mut index = open_index(repo.path());
        for decision in [&one, &two, &three] {
            must(index.record_decision(decision));
        }

        let results = must(index.search_full_text("sqlite simpler", &QueryFilter::default()));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, one.id);
        assert_eq!(results[1].id, two.id);

        let none = must(index.search_full_text("kubernetes", &QueryFilter::default()));
        assert!(none.is_empty());
    }

    #[test]
    fn context_bundle_dedups_and_separates_constraints() {
        let repo = temp_repo();
        let mut auth = mk_decision("auth decision", "one", DecisionType::Product);
        auth.files = vec!["src/auth/login.rs".to_string()];
        auth.symbols = vec!["login".to_string()];
        let mut rule = mk_decision("no plaintext passwords", "argon2", DecisionType::Constraint);
        rule.files = vec!["src/auth/hash.rs".to_string()];
        let free = mk_decision("rate limits", "100 rps", DecisionType::Constraint);

        let mut index = open_index(repo.path());
        for decision in [&auth, &rule, &free] {
            must(index.record_decision(decision));
        }

        let bundle = must(index.decisions_for_context(&[
            "src/auth/*".to_string(),
            "login".to_string(),
        ]));

        // auth matches both targets but appears once; rule matched the glob
        // so it is a decision, not repeated as a constraint.
        let ids: Vec<&str> =
            bundle.decisions.iter().map(|decision| decision.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&auth.id.as_str()));
        assert!(ids.contains(&rule.id.as_str()));
        assert_eq!(bundle.constraints.len(), 1);
        assert_eq!(bundle.constraints[0].id, free.id);
    }

    #[test]
    fn supersede_records_backlinks_both_ways() {
        let repo = temp_repo();
        let old = mk_decision("old approach", "use rest", DecisionType::Product);
        let mut new = mk_decision("new approach", "use grpc", DecisionType::Product);
        new.supersedes = Some(old.id.clone());

        let mut index = open_index(repo.path());
        must(index.record_decision(&old));
        must(index.record_decision(&new));

        let Some(old_now) = must(index.query_by_id(&old.id)) else {
            panic!("old decision missing");
        };
        assert_eq!(old_now.status, DecisionStatus::Superseded);
        assert_eq!(old_now.superseded_by, Some(new.id.clone()));

        let Some(new_now) = must(index.query_by_id(&new.id)) else {
            panic!("new decision missing");
        };
        assert_eq!(new_now.supersedes, Some(old.id.clone()));
    }

    #[test]
    fn create_summary_is_idempotent() {
        let repo = temp_repo();
        let a = mk_decision("alpha", "one", DecisionType::Product);
        let b = mk_decision("beta", "two", DecisionType::Product);

        let mut index = open_index(repo.path());
        must(index.record_decision(&a));
        must(index.record_decision(&b));

        let input = SummaryInput {
            summarizes: vec![a.id.clone(), b.id.clone()],
            summary: "always measure before caching".to_string(),
            title: None,
        };
        let first = must(index.create_summary(&input));
        let second = must(index.create_summary(&input));

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.kind, DecisionType::Learning);
        assert_eq!(must(read_all_records(repo.path())).len(), 3);
    }

    #[test]
    fn create_summary_rejects_empty_input() {
        let repo = temp_repo();
        let mut index = open_index(repo.path());

        let no_targets = SummaryInput {
            summarizes: Vec::new(),
            summary: "text".to_string(),
            title: None,
        };
        assert!(matches!(
            index.create_summary(&no_targets),
            Err(LedgerError::Validation(_))
        ));

        let blank = SummaryInput {
            summarizes: vec![DecisionId::generate("a", "b")],
            summary: "   ".to_string(),
            title: None,
        };
        assert!(matches!(index.create_summary(&blank), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn mark_curated_writes_backlinks_for_each_id() {
        let repo = temp_repo();
        let a = mk_decision("alpha", "one", DecisionType::Product);
        let b = mk_decision("beta", "two", DecisionType::Product);

        let mut index = open_index(repo.path());
        must(index.record_decision(&a));
        must(index.record_decision(&b));

        let summary = must(index.create_summary(&SummaryInput {
            summarizes: vec![a.id.clone(), b.id.clone()],
            summary: "summary".to_string(),
            title: None,
        }));

        let written =
            must(index.mark_curated(&[a.id.clone(), b.id.clone()], &summary.id));
        assert_eq!(written, 2);

        for id in [&a.id, &b.id] {
            let Some(decision) = must(index.query_by_id(id)) else {
                panic!("decision missing after curation");
            };
            assert_eq!(decision.curated_into, Some(summary.id.clone()));
            assert_eq!(decision.status, DecisionStatus::Active);
        }
    }
}
