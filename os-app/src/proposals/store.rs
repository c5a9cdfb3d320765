use crate::proposals::model::{EventProposal, ProposalId, ProposalStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use os_calendar::CreatedEvent;
use os_channels::{ConversationId, MessageHandle, MessageId};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("proposal {0} not found")]
    NotFound(ProposalId),
    #[error("proposal {id} is {current}, expected {expected}")]
    Conflict {
        id: ProposalId,
        expected: ProposalStatus,
        current: ProposalStatus,
    },
    #[error("proposal {0} already exists")]
    AlreadyExists(ProposalId),
    #[error("illegal proposal transition {from} -> {to}")]
    IllegalTransition {
        from: ProposalStatus,
        to: ProposalStatus,
    },
    #[error("proposal store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

/// Durable proposal records. `transition` is the only way a status changes.
#[async_trait]
pub trait ProposalStore: Send + Sync {
    async fn create(&self, proposal: &EventProposal) -> Result<(), StoreError>;

    async fn get(&self, id: ProposalId) -> Result<EventProposal, StoreError>;

    /// Atomic compare-and-set on `status`. Succeeds only while the stored
    /// status equals `expected`; returns the updated record.
    async fn transition(
        &self,
        id: ProposalId,
        expected: ProposalStatus,
        next: ProposalStatus,
        resolved_at: DateTime<Utc>,
        external: Option<&CreatedEvent>,
    ) -> Result<EventProposal, StoreError>;

    /// Records where the approval message was delivered. Never touches `status`.
    async fn attach_message(&self, id: ProposalId, handle: &MessageHandle)
    -> Result<(), StoreError>;

    /// Pending records created at or before `cutoff`.
    async fn list_overdue_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EventProposal>, StoreError>;

    /// All records, newest first, optionally filtered by status.
    async fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<EventProposal>, StoreError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS event_proposals (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    start_at_ms INTEGER NOT NULL,
    end_at_ms INTEGER NOT NULL,
    attendees_json TEXT NOT NULL,
    description TEXT,
    location TEXT,
    origin_conversation_id TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    status TEXT NOT NULL,
    message_conversation_id TEXT,
    message_id TEXT,
    resolved_at_ms INTEGER,
    external_event_id TEXT,
    external_link TEXT
);
CREATE INDEX IF NOT EXISTS idx_event_proposals_status_created
ON event_proposals (status, created_at_ms);
"#;

const SELECT_COLUMNS: &str = "SELECT id, title, start_at_ms, end_at_ms, attendees_json, \
     description, location, origin_conversation_id, created_at_ms, status, \
     message_conversation_id, message_id, resolved_at_ms, external_event_id, external_link \
     FROM event_proposals";

#[derive(Clone)]
pub struct SqliteProposalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteProposalStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("create store dir {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl ProposalStore for SqliteProposalStore {
    async fn create(&self, proposal: &EventProposal) -> Result<(), StoreError> {
        let proposal = proposal.clone();
        self.with_conn(move |conn| {
            let attendees_json = serde_json::to_string(&proposal.attendees)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let result = conn.execute(
                r#"
INSERT INTO event_proposals (
    id, title, start_at_ms, end_at_ms, attendees_json, description, location,
    origin_conversation_id, created_at_ms, status, message_conversation_id, message_id,
    resolved_at_ms, external_event_id, external_link
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, NULL, NULL)
"#,
                params![
                    proposal.id.to_string(),
                    proposal.title,
                    proposal.start.timestamp_millis(),
                    proposal.end.timestamp_millis(),
                    attendees_json,
                    proposal.description,
                    proposal.location,
                    proposal.origin_conversation_id,
                    proposal.created_at.timestamp_millis(),
                    ProposalStatus::Pending.as_str(),
                    proposal.message.as_ref().map(|m| m.conversation_id.to_string()),
                    proposal.message.as_ref().map(|m| m.message_id.to_string()),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::AlreadyExists(proposal.id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, id: ProposalId) -> Result<EventProposal, StoreError> {
        self.with_conn(move |conn| load_proposal(conn, id)?.ok_or(StoreError::NotFound(id)))
            .await
    }

    async fn transition(
        &self,
        id: ProposalId,
        expected: ProposalStatus,
        next: ProposalStatus,
        resolved_at: DateTime<Utc>,
        external: Option<&CreatedEvent>,
    ) -> Result<EventProposal, StoreError> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                from: expected,
                to: next,
            });
        }
        let external = external.cloned();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                r#"
UPDATE event_proposals
SET status = ?1,
    resolved_at_ms = ?2,
    external_event_id = COALESCE(?3, external_event_id),
    external_link = COALESCE(?4, external_link)
WHERE id = ?5 AND status = ?6
"#,
                params![
                    next.as_str(),
                    resolved_at.timestamp_millis(),
                    external.as_ref().map(|e| e.id.clone()),
                    external.as_ref().map(|e| e.html_link.clone()),
                    id.to_string(),
                    expected.as_str(),
                ],
            )?;
            let Some(record) = load_proposal(&tx, id)? else {
                return Err(StoreError::NotFound(id));
            };
            tx.commit()?;
            if changed == 0 {
                return Err(StoreError::Conflict {
                    id,
                    expected,
                    current: record.status,
                });
            }
            Ok(record)
        })
        .await
    }

    async fn attach_message(
        &self,
        id: ProposalId,
        handle: &MessageHandle,
    ) -> Result<(), StoreError> {
        let handle = handle.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE event_proposals
                 SET message_conversation_id = ?1, message_id = ?2
                 WHERE id = ?3",
                params![
                    handle.conversation_id.to_string(),
                    handle.message_id.to_string(),
                    id.to_string()
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn list_overdue_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EventProposal>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE status = ?1 AND created_at_ms <= ?2
                 ORDER BY created_at_ms ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![ProposalStatus::Pending.as_str(), cutoff.timestamp_millis()],
                    read_row,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(ProposalRow::into_proposal).collect()
        })
        .await
    }

    async fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<EventProposal>, StoreError> {
        self.with_conn(move |conn| {
            let rows = match status {
                Some(status) => {
                    let sql = format!(
                        "{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at_ms DESC"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params![status.as_str()], read_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let sql = format!("{SELECT_COLUMNS} ORDER BY created_at_ms DESC");
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt
                        .query_map([], read_row)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            rows.into_iter().map(ProposalRow::into_proposal).collect()
        })
        .await
    }
}

fn load_proposal(conn: &Connection, id: ProposalId) -> Result<Option<EventProposal>, StoreError> {
    let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id.to_string()], read_row)
        .optional()?;
    row.map(ProposalRow::into_proposal).transpose()
}

/// Column values as stored, before domain parsing.
struct ProposalRow {
    id: String,
    title: String,
    start_at_ms: i64,
    end_at_ms: i64,
    attendees_json: String,
    description: Option<String>,
    location: Option<String>,
    origin_conversation_id: String,
    created_at_ms: i64,
    status: String,
    message_conversation_id: Option<String>,
    message_id: Option<String>,
    resolved_at_ms: Option<i64>,
    external_event_id: Option<String>,
    external_link: Option<String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProposalRow> {
    Ok(ProposalRow {
        id: row.get(0)?,
        title: row.get(1)?,
        start_at_ms: row.get(2)?,
        end_at_ms: row.get(3)?,
        attendees_json: row.get(4)?,
        description: row.get(5)?,
        location: row.get(6)?,
        origin_conversation_id: row.get(7)?,
        created_at_ms: row.get(8)?,
        status: row.get(9)?,
        message_conversation_id: row.get(10)?,
        message_id: row.get(11)?,
        resolved_at_ms: row.get(12)?,
        external_event_id: row.get(13)?,
        external_link: row.get(14)?,
    })
}

impl ProposalRow {
    fn into_proposal(self) -> Result<EventProposal, StoreError> {
        let id = ProposalId::parse(&self.id)
            .ok_or_else(|| StoreError::Backend(format!("malformed proposal id {:?}", self.id)))?;
        let status = self
            .status
            .parse::<ProposalStatus>()
            .map_err(StoreError::Backend)?;
        let attendees: Vec<String> = serde_json::from_str(&self.attendees_json)
            .map_err(|e| StoreError::Backend(format!("attendees of {id}: {e}")))?;
        let message = match (self.message_conversation_id, self.message_id) {
            (Some(conversation_id), Some(message_id)) => Some(MessageHandle {
                conversation_id: ConversationId::new(conversation_id),
                message_id: MessageId::new(message_id),
            }),
            _ => None,
        };
        Ok(EventProposal {
            id,
            title: self.title,
            start: millis_to_datetime(self.start_at_ms)?,
            end: millis_to_datetime(self.end_at_ms)?,
            attendees,
            description: self.description,
            location: self.location,
            origin_conversation_id: self.origin_conversation_id,
            created_at: millis_to_datetime(self.created_at_ms)?,
            status,
            message,
            resolved_at: self.resolved_at_ms.map(millis_to_datetime).transpose()?,
            external_event_id: self.external_event_id,
            external_link: self.external_link,
        })
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Backend(format!("timestamp {ms} out of range")))
}
