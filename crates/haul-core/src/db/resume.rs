//! Resume records in the application database

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Row};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::resume::{ResumeRecord, ResumeStore};
use crate::types::{FileSelection, JobStatus, Progress, SourceType};

/// Keeps resume records in the `resume_entries` table. Each save rewrites
/// the table inside one transaction.
#[derive(Debug, Clone)]
pub struct SqliteResumeStore {
    db: Database,
}

impl SqliteResumeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn conversion_error(column: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn row_to_record(row: &Row) -> rusqlite::Result<ResumeRecord> {
    let source_type: String = row.get(1)?;
    let status: String = row.get(3)?;
    let selection: Option<String> = row.get(7)?;
    let saved_at: String = row.get(8)?;

    let file_selection = selection
        .map(|s| serde_json::from_str::<FileSelection>(&s))
        .transpose()
        .map_err(|e| conversion_error(7, e))?;
    let saved_at = DateTime::parse_from_rfc3339(&saved_at)
        .map_err(|e| conversion_error(8, e))?
        .with_timezone(&Utc);

    Ok(ResumeRecord {
        id: row.get(0)?,
        source_type: SourceType::from(source_type.as_str()),
        source_urn: row.get(2)?,
        status: JobStatus::from(status.as_str()),
        progress: Progress {
            percent: row.get(4)?,
            bytes_downloaded: row.get::<_, i64>(5)?.max(0) as u64,
            total_bytes: row.get::<_, i64>(6)?.max(0) as u64,
            speed: None,
        },
        file_selection,
        saved_at,
    })
}

#[async_trait]
impl ResumeStore for SqliteResumeStore {
    async fn load_all(&self) -> Result<Vec<ResumeRecord>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, source_type, source_urn, status, percent, bytes_downloaded,
                            total_bytes, file_selection, saved_at
                     FROM resume_entries ORDER BY saved_at",
                )?;
                let records = stmt
                    .query_map([], row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))?
    }

    async fn replace_all(&self, records: &[ResumeRecord]) -> Result<()> {
        let rows = records
            .iter()
            .map(|r| -> Result<(ResumeRecord, Option<String>)> {
                let selection = r.file_selection.as_ref().map(serde_json::to_string).transpose()?;
                Ok((r.clone(), selection))
            })
            .collect::<Result<Vec<_>>>()?;

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            db.with_conn_mut(|conn| {
                let tx = conn.transaction()?;

                tx.execute("DELETE FROM resume_entries", [])?;

                for (record, selection) in &rows {
                    tx.execute(
                        "INSERT INTO resume_entries
                            (id, source_type, source_urn, status, percent, bytes_downloaded,
                             total_bytes, file_selection, saved_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            record.id,
                            record.source_type.to_string(),
                            record.source_urn,
                            record.status.to_string(),
                            record.progress.percent,
                            record.progress.bytes_downloaded as i64,
                            record.progress.total_bytes as i64,
                            selection,
                            record.saved_at.to_rfc3339(),
                        ],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::resume::ResumePersistence;
    use crate::types::DownloadJob;

    fn job(id: &str, status: JobStatus) -> DownloadJob {
        let mut job = DownloadJob::with_id(id, SourceType::Torrent, format!("magnet:?xt=urn:btih:{}", id))
            .with_selection(FileSelection::indices([1, 3]));
        job.status = status;
        job.progress = Progress::from_counts(300, 1200, Some(50));
        job
    }

    #[tokio::test]
    async fn test_round_trip_through_table() {
        let persistence = ResumePersistence::new(SqliteResumeStore::new(open_in_memory().unwrap()));
        persistence.save_download_state(&job("a", JobStatus::Active)).await.unwrap();
        persistence.save_download_state(&job("b", JobStatus::Completed)).await.unwrap();

        let records = persistence.load_incomplete_downloads().await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, "a");
        assert_eq!(record.status, JobStatus::Active);
        assert_eq!(record.progress.percent, 25);
        assert_eq!(record.progress.total_bytes, 1200);
        assert_eq!(record.file_selection, Some(FileSelection::indices([1, 3])));
    }

    #[tokio::test]
    async fn test_status_constraint_rejects_terminal_rows() {
        let store = SqliteResumeStore::new(open_in_memory().unwrap());
        let mut record = ResumeRecord::from_job(&job("a", JobStatus::Active));
        record.status = JobStatus::Failed;
        assert!(store.replace_all(&[record]).await.is_err());
        // The failed transaction left the table untouched
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
