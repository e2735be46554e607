use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use autofix_core::{
    model_family, render_historical_context, success_rate, truncate_chars, AttemptOutcome,
    FixAttempt, FixDescriptor, HistoricalContext, HistoryEntry, InsightsSnapshot, Issue,
    IssueSignature, KnowledgeBase, MemoryStats, ModelCharacteristics, ModelInsights,
    SimilarIssues, HISTORY_ANALYSIS_CHARS, RECENT_HISTORY_LIMIT,
};
use rusqlite::{params, Connection, OptionalExtension, Params, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

mod files;
mod schema;

pub use schema::{SchemaStatus, LATEST_SCHEMA_VERSION};

pub const DATABASE_FILE_NAME: &str = "fix_history.sqlite3";
pub const KNOWLEDGE_BASE_FILE_NAME: &str = "knowledge_base.json";
/// Matches requested per similarity bucket when building the historical digest.
pub const CONTEXT_QUERY_LIMIT: usize = 3;

const ATTEMPT_COLUMNS: &str = "id, timestamp, model_name, issue_type, issue_signature, \
     description, backend, analysis, commands_json, fix_applied, verified, duration_seconds, \
     environment_json, notes";

/// Per-signature outcome counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuePattern {
    pub signature: IssueSignature,
    pub pattern_name: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub confidence_score: f64,
    pub best_fix: Option<FixDescriptor>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Durable attempt log plus the aggregates and knowledge base derived from it.
///
/// All files live under one memory directory: the `SQLite` database and the
/// knowledge base JSON document next to it.
pub struct MemoryStore {
    conn: Connection,
    memory_dir: PathBuf,
    knowledge_path: PathBuf,
    knowledge: KnowledgeBase,
}

struct CharacteristicsRow {
    total_tests: i64,
    successful_tests: i64,
    success_rate: f64,
    common_issues_json: String,
    effective_fixes_json: String,
    last_updated: Option<String>,
    performance_notes: Option<String>,
}

impl MemoryStore {
    /// Open (creating if needed) the memory directory, configure `SQLite`, migrate and
    /// load the knowledge base.
    ///
    /// # Errors
    /// Returns an error when the directory, database or knowledge base cannot be
    /// created, opened, migrated or parsed.
    pub fn open(memory_dir: &Path) -> Result<Self> {
        fs::create_dir_all(memory_dir).with_context(|| {
            format!("failed to create memory directory {}", memory_dir.display())
        })?;

        let db_path = memory_dir.join(DATABASE_FILE_NAME);
        let mut conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open sqlite database at {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        schema::migrate(&mut conn)?;

        let knowledge_path = memory_dir.join(KNOWLEDGE_BASE_FILE_NAME);
        let now = now_utc()?;
        if files::create_knowledge(&knowledge_path, &KnowledgeBase::empty(now))? {
            debug!(path = %knowledge_path.display(), "knowledge base created");
        }
        let knowledge = files::read_knowledge(&knowledge_path, now)?;

        debug!(memory_dir = %memory_dir.display(), "memory store opened");
        Ok(Self {
            conn,
            memory_dir: memory_dir.to_path_buf(),
            knowledge_path,
            knowledge,
        })
    }

    #[must_use]
    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    #[must_use]
    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    /// Re-read the knowledge base file, picking up updates from other store instances.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn refresh_knowledge_base(&mut self) -> Result<()> {
        self.knowledge = files::read_knowledge(&self.knowledge_path, now_utc()?)?;
        Ok(())
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        schema::schema_status(&self.conn)
    }

    /// Append one attempt and fold it into the model aggregate, the issue pattern
    /// counters and the knowledge base.
    ///
    /// The row insert and aggregate updates share one immediate transaction. The
    /// knowledge base file is re-read, updated and atomically replaced while that
    /// transaction holds the database write lock, so concurrent stores never lose
    /// each other's updates. If the commit fails the previous file is restored.
    ///
    /// # Errors
    /// Returns an error when validation fails or any write fails; nothing is
    /// persisted in that case.
    pub fn record_fix_attempt(
        &mut self,
        issue: &Issue,
        fix: &FixDescriptor,
        outcome: AttemptOutcome,
        duration_seconds: f64,
        notes: Option<&str>,
        backend: &str,
    ) -> Result<i64> {
        issue.validate().map_err(|err| anyhow!("issue validation failed: {err}"))?;
        outcome.validate().map_err(|err| anyhow!("attempt outcome validation failed: {err}"))?;
        if backend.trim().is_empty() {
            return Err(anyhow!("backend name MUST be provided"));
        }
        if !duration_seconds.is_finite() || duration_seconds < 0.0 {
            return Err(anyhow!("duration MUST be a non-negative number of seconds"));
        }

        let now = now_utc()?;
        let signature = issue.signature();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start record transaction")?;

        tx.execute(
            "INSERT INTO fix_history(
                timestamp, model_name, issue_type, issue_signature, description, backend,
                analysis, commands_json, fix_applied, verified, duration_seconds,
                environment_json, notes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                rfc3339(now)?,
                issue.model,
                issue.issue_type,
                signature.as_str(),
                issue.description,
                backend,
                fix.analysis,
                serde_json::to_string(fix.commands())
                    .context("failed to serialize fix commands")?,
                outcome.fix_applied,
                outcome.verified,
                duration_seconds,
                serde_json::to_string(&issue.environment)
                    .context("failed to serialize environment")?,
                notes,
            ],
        )
        .context("failed to insert fix attempt")?;
        let attempt_id = tx.last_insert_rowid();

        let mut characteristics = load_characteristics(&tx, &issue.model)?
            .unwrap_or_else(|| ModelCharacteristics::empty(issue.model.as_str()));
        characteristics.absorb(&issue.issue_type, fix, outcome, now);
        upsert_characteristics(&tx, &characteristics)?;
        upsert_issue_pattern(&tx, issue, &signature, fix, outcome, now)?;

        let previous = files::read_knowledge(&self.knowledge_path, now)?;
        let mut knowledge = previous.clone();
        knowledge.absorb_attempt(&issue.model, &issue.issue_type, &fix.analysis, outcome, now);
        files::write_knowledge(&self.knowledge_path, &knowledge)?;

        if let Err(err) = tx.commit() {
            if let Err(restore_err) = files::write_knowledge(&self.knowledge_path, &previous) {
                warn!(error = %restore_err, "failed to restore knowledge base after rollback");
            }
            return Err(anyhow::Error::new(err).context("failed to commit fix attempt"));
        }

        self.knowledge = knowledge;
        info!(
            attempt_id,
            model = %issue.model,
            issue_type = %issue.issue_type,
            signature = %signature,
            backend,
            fix_applied = outcome.fix_applied,
            verified = outcome.verified,
            "fix attempt recorded"
        );
        Ok(attempt_id)
    }

    /// Find earlier attempts resembling `issue`.
    ///
    /// Exact matches share the signature and come newest first. Model and type
    /// matches list successful attempts first, newest first within each group.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn query_similar_issues(&self, issue: &Issue, limit: usize) -> Result<SimilarIssues> {
        let limit = sql_limit(limit);
        let signature = issue.signature();

        let exact_matches = self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM fix_history
                 WHERE issue_signature = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2"
            ),
            params![signature.as_str(), limit],
        )?;
        let model_matches = self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM fix_history
                 WHERE model_name = ?1 AND issue_type = ?2
                 ORDER BY fix_applied DESC, timestamp DESC, id DESC
                 LIMIT ?3"
            ),
            params![issue.model, issue.issue_type, limit],
        )?;
        let type_matches = self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM fix_history
                 WHERE issue_type = ?1
                 ORDER BY fix_applied DESC, timestamp DESC, id DESC
                 LIMIT ?2"
            ),
            params![issue.issue_type, limit],
        )?;

        Ok(SimilarIssues {
            exact_matches,
            model_matches,
            type_matches,
        })
    }

    /// Load every recorded attempt, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_attempts(&self) -> Result<Vec<FixAttempt>> {
        self.query_attempts(
            &format!("SELECT {ATTEMPT_COLUMNS} FROM fix_history ORDER BY id ASC"),
            [],
        )
    }

    /// Aggregate for `model` plus its most recent history. Unknown models get
    /// zero-valued defaults.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_model_insights(&self, model: &str) -> Result<ModelInsights> {
        let characteristics = load_characteristics(&self.conn, model)?
            .unwrap_or_else(|| ModelCharacteristics::empty(model));

        let mut stmt = self.conn.prepare(
            "SELECT issue_type, fix_applied, analysis, timestamp
             FROM fix_history
             WHERE model_name = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![model, sql_limit(RECENT_HISTORY_LIMIT)])?;
        let mut recent_history = Vec::new();

        while let Some(row) = rows.next()? {
            let analysis: String = row.get(2)?;
            let timestamp_raw: String = row.get(3)?;
            recent_history.push(HistoryEntry {
                issue_type: row.get(0)?,
                success: row.get(1)?,
                analysis: truncate_chars(&analysis, HISTORY_ANALYSIS_CHARS).to_string(),
                timestamp: parse_rfc3339(&timestamp_raw)?,
            });
        }

        Ok(ModelInsights {
            characteristics,
            recent_history,
        })
    }

    /// Counters over the whole attempt log.
    ///
    /// # Errors
    /// Returns an error when the counting queries fail.
    pub fn get_memory_stats(&self) -> Result<MemoryStats> {
        let (total, successful): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(fix_applied), 0) FROM fix_history",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to count fix attempts")?;
        let models: i64 = self
            .conn
            .query_row("SELECT COUNT(DISTINCT model_name) FROM fix_history", [], |row| row.get(0))
            .context("failed to count models")?;
        let issue_types: i64 = self
            .conn
            .query_row("SELECT COUNT(DISTINCT issue_type) FROM fix_history", [], |row| row.get(0))
            .context("failed to count issue types")?;

        let week_ago = rfc3339(now_utc()? - Duration::days(7))?;
        let recent: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM fix_history WHERE timestamp >= ?1",
                params![week_ago],
                |row| row.get(0),
            )
            .context("failed to count recent fix attempts")?;

        let total = to_count(total)?;
        let successful = to_count(successful)?;
        let knowledge_base_size = u64::try_from(files::encode_knowledge(&self.knowledge)?.len())
            .context("knowledge base size overflow")?;

        Ok(MemoryStats {
            total_fixes_attempted: total,
            successful_fixes: successful,
            success_rate: success_rate(successful, total),
            models_encountered: to_count(models)?,
            issue_types_seen: to_count(issue_types)?,
            recent_activity_7_days: to_count(recent)?,
            knowledge_base_size,
            memory_directory: self.memory_dir.display().to_string(),
        })
    }

    /// Store free-text notes for `model`, creating its aggregate row if needed.
    ///
    /// # Errors
    /// Returns an error when the model name is blank or the write fails.
    pub fn set_performance_notes(&mut self, model: &str, notes: &str) -> Result<()> {
        if model.trim().is_empty() {
            return Err(anyhow!("model MUST be provided"));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start notes transaction")?;
        let mut characteristics =
            load_characteristics(&tx, model)?.unwrap_or_else(|| ModelCharacteristics::empty(model));
        characteristics.performance_notes = Some(notes.to_string());
        characteristics.last_updated = Some(now_utc()?);
        upsert_characteristics(&tx, &characteristics)?;
        tx.commit().context("failed to commit performance notes")?;
        Ok(())
    }

    /// Outcome counters for one signature, if it has ever been recorded.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn issue_pattern(&self, signature: &IssueSignature) -> Result<Option<IssuePattern>> {
        let row = self
            .conn
            .query_row(
                "SELECT pattern_name, success_count, failure_count, confidence_score,
                        best_fix_json, last_seen
                 FROM issue_patterns
                 WHERE issue_signature = ?1",
                params![signature.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("failed to load issue pattern")?;

        let Some((pattern_name, successes, failures, confidence_score, best_fix_json, last_seen)) =
            row
        else {
            return Ok(None);
        };

        let best_fix = best_fix_json
            .map(|raw| serde_json::from_str::<FixDescriptor>(&raw))
            .transpose()
            .context("failed to decode best fix")?;

        Ok(Some(IssuePattern {
            signature: signature.clone(),
            pattern_name,
            success_count: to_count(successes)?,
            failure_count: to_count(failures)?,
            confidence_score,
            best_fix,
            last_seen: parse_rfc3339(&last_seen)?,
        }))
    }

    /// Render the bounded historical digest for `issue`.
    ///
    /// Never fails: any section whose data cannot be loaded is left out.
    #[must_use]
    pub fn build_context(&self, issue: &Issue) -> String {
        let insights = self
            .get_model_insights(&issue.model)
            .inspect_err(|err| {
                warn!(error = %err, model = %issue.model, "model insights unavailable");
            })
            .ok();
        let similar = self
            .query_similar_issues(issue, CONTEXT_QUERY_LIMIT)
            .inspect_err(|err| {
                warn!(error = %err, model = %issue.model, "similar issues unavailable");
            })
            .ok();

        render_historical_context(&HistoricalContext {
            issue,
            insights: insights.as_ref(),
            similar: similar.as_ref(),
            knowledge: Some(&self.knowledge),
        })
    }

    /// Write a snapshot of stats, the knowledge base and per-model insights to
    /// `destination`, replacing any existing file.
    ///
    /// # Errors
    /// Returns an error when the snapshot cannot be assembled or written.
    pub fn export_insights(&self, destination: &Path) -> Result<InsightsSnapshot> {
        let statistics = self.get_memory_stats()?;

        let mut model_insights = BTreeMap::new();
        for model in self.recorded_models()? {
            let insights = self.get_model_insights(&model)?;
            model_insights.insert(model, insights);
        }

        let snapshot = InsightsSnapshot {
            generated_at: now_utc()?,
            statistics,
            knowledge_base: self.knowledge.clone(),
            model_insights,
        };
        let encoded =
            serde_json::to_vec_pretty(&snapshot).context("failed to serialize insights snapshot")?;
        files::write_atomic(destination, &encoded)?;

        info!(
            destination = %destination.display(),
            models = snapshot.model_insights.len(),
            "insights exported"
        );
        Ok(snapshot)
    }

    fn recorded_models(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT model_name FROM fix_history ORDER BY model_name ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut models = Vec::new();
        for row in rows {
            models.push(row?);
        }
        Ok(models)
    }

    fn query_attempts<P: Params>(&self, sql: &str, params: P) -> Result<Vec<FixAttempt>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut attempts = Vec::new();

        while let Some(row) = rows.next()? {
            attempts.push(attempt_from_row(row)?);
        }

        Ok(attempts)
    }
}

fn attempt_from_row(row: &Row<'_>) -> Result<FixAttempt> {
    let timestamp_raw: String = row.get(1)?;
    let signature_raw: String = row.get(4)?;
    let commands_raw: String = row.get(8)?;
    let environment_raw: String = row.get(12)?;

    Ok(FixAttempt {
        id: row.get(0)?,
        timestamp: parse_rfc3339(&timestamp_raw)?,
        model: row.get(2)?,
        issue_type: row.get(3)?,
        signature: IssueSignature::parse(&signature_raw)?,
        description: row.get(5)?,
        backend: row.get(6)?,
        analysis: row.get(7)?,
        commands: serde_json::from_str(&commands_raw)
            .with_context(|| format!("invalid commands_json: {commands_raw}"))?,
        fix_applied: row.get(9)?,
        verified: row.get(10)?,
        duration_seconds: row.get(11)?,
        environment: serde_json::from_str(&environment_raw)
            .with_context(|| format!("invalid environment_json: {environment_raw}"))?,
        notes: row.get(13)?,
    })
}

fn load_characteristics(conn: &Connection, model: &str) -> Result<Option<ModelCharacteristics>> {
    let row = conn
        .query_row(
            "SELECT total_tests, successful_tests, success_rate, common_issues_json,
                    effective_fixes_json, last_updated, performance_notes
             FROM model_characteristics
             WHERE model_name = ?1",
            params![model],
            |row| {
                Ok(CharacteristicsRow {
                    total_tests: row.get(0)?,
                    successful_tests: row.get(1)?,
                    success_rate: row.get(2)?,
                    common_issues_json: row.get(3)?,
                    effective_fixes_json: row.get(4)?,
                    last_updated: row.get(5)?,
                    performance_notes: row.get(6)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("failed to load characteristics for {model}"))?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(ModelCharacteristics {
        model: model.to_string(),
        total_tests: to_count(row.total_tests)?,
        successful_tests: to_count(row.successful_tests)?,
        success_rate: row.success_rate,
        common_issues: serde_json::from_str(&row.common_issues_json)
            .context("invalid common_issues_json")?,
        effective_fixes: serde_json::from_str(&row.effective_fixes_json)
            .context("invalid effective_fixes_json")?,
        last_updated: row.last_updated.as_deref().map(parse_rfc3339).transpose()?,
        performance_notes: row.performance_notes,
    }))
}

fn upsert_characteristics(conn: &Connection, characteristics: &ModelCharacteristics) -> Result<()> {
    conn.execute(
        "INSERT INTO model_characteristics(
            model_name, total_tests, successful_tests, success_rate, common_issues_json,
            effective_fixes_json, last_updated, performance_notes
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(model_name) DO UPDATE SET
            total_tests = excluded.total_tests,
            successful_tests = excluded.successful_tests,
            success_rate = excluded.success_rate,
            common_issues_json = excluded.common_issues_json,
            effective_fixes_json = excluded.effective_fixes_json,
            last_updated = excluded.last_updated,
            performance_notes = excluded.performance_notes",
        params![
            characteristics.model,
            from_count(characteristics.total_tests)?,
            from_count(characteristics.successful_tests)?,
            characteristics.success_rate,
            serde_json::to_string(&characteristics.common_issues)
                .context("failed to serialize common issues")?,
            serde_json::to_string(&characteristics.effective_fixes)
                .context("failed to serialize effective fixes")?,
            characteristics.last_updated.map(rfc3339).transpose()?,
            characteristics.performance_notes,
        ],
    )
    .with_context(|| format!("failed to upsert characteristics for {}", characteristics.model))?;
    Ok(())
}

fn upsert_issue_pattern(
    conn: &Connection,
    issue: &Issue,
    signature: &IssueSignature,
    fix: &FixDescriptor,
    outcome: AttemptOutcome,
    now: OffsetDateTime,
) -> Result<()> {
    let success = outcome.is_success();
    let best_fix_json = if success {
        Some(serde_json::to_string(fix).context("failed to serialize best fix")?)
    } else {
        None
    };

    conn.execute(
        "INSERT INTO issue_patterns(
            issue_signature, pattern_name, success_count, failure_count, confidence_score,
            best_fix_json, last_seen
        ) VALUES (?1, ?2, ?3, ?4, ?3, ?5, ?6)
        ON CONFLICT(issue_signature) DO UPDATE SET
            success_count = success_count + excluded.success_count,
            failure_count = failure_count + excluded.failure_count,
            confidence_score = CAST(success_count + excluded.success_count AS REAL)
                / (success_count + excluded.success_count + failure_count + excluded.failure_count),
            best_fix_json = COALESCE(excluded.best_fix_json, best_fix_json),
            last_seen = excluded.last_seen",
        params![
            signature.as_str(),
            format!("{}:{}", issue.issue_type, model_family(&issue.model)),
            i64::from(success),
            i64::from(!success),
            best_fix_json,
            rfc3339(now)?,
        ],
    )
    .with_context(|| format!("failed to upsert issue pattern {signature}"))?;
    Ok(())
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn to_count(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative counter in database: {value}"))
}

fn from_count(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("counter too large for database: {value}"))
}

/// Current UTC time truncated to whole seconds so stored timestamps sort lexically.
fn now_utc() -> Result<OffsetDateTime> {
    OffsetDateTime::now_utc().replace_nanosecond(0).context("failed to truncate timestamp")
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(now_utc()?)
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
