#![forbid(unsafe_code)]

use quadchat_domain::time::unix_ms_now;
use quadchat_domain::{ChatError, SessionId, UserId};
use sqlx::SqlitePool;

use crate::{corrupt_row, placeholders, storage};

/// One live connection as persisted for fan-out lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
	pub session_id: SessionId,
	pub user_id: UserId,
	pub joined_at_ms: i64,
}

type SessionRow = (String, String, i64);

fn session_from_row((session_id, user_id, joined_at_ms): SessionRow) -> Result<SessionRecord, ChatError> {
	Ok(SessionRecord {
		session_id: SessionId::new(session_id).map_err(|err| corrupt_row("connected_sessions.session_id", err))?,
		user_id: UserId::parse(&user_id).map_err(|err| corrupt_row("connected_sessions.user_id", err))?,
		joined_at_ms,
	})
}

/// Durable side of the connection registry. The in-process channel map lives
/// in the server; this table answers "which sessions belong to these users".
#[derive(Clone)]
pub struct SessionStore {
	pool: SqlitePool,
}

impl SessionStore {
	pub(crate) fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Record a connection. Re-registering the same session id overwrites it.
	pub async fn register(&self, session_id: &SessionId, user_id: UserId) -> Result<SessionRecord, ChatError> {
		let joined_at_ms = unix_ms_now();
		sqlx::query(
			"INSERT INTO connected_sessions (session_id, user_id, joined_at_ms) VALUES (?, ?, ?) \
			ON CONFLICT (session_id) DO UPDATE SET user_id = excluded.user_id, joined_at_ms = excluded.joined_at_ms",
		)
		.bind(session_id.as_str())
		.bind(user_id.to_string())
		.bind(joined_at_ms)
		.execute(&self.pool)
		.await
		.map_err(storage)?;

		Ok(SessionRecord {
			session_id: session_id.clone(),
			user_id,
			joined_at_ms,
		})
	}

	/// Drop a connection; returns the record if it was present.
	pub async fn unregister(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, ChatError> {
		let row: Option<SessionRow> = sqlx::query_as(
			"DELETE FROM connected_sessions WHERE session_id = ? RETURNING session_id, user_id, joined_at_ms",
		)
		.bind(session_id.as_str())
		.fetch_optional(&self.pool)
		.await
		.map_err(storage)?;

		row.map(session_from_row).transpose()
	}

	/// Wipe every session; run at startup so stale rows from a previous
	/// process never receive fan-out.
	pub async fn clear_all(&self) -> Result<u64, ChatError> {
		let result = sqlx::query("DELETE FROM connected_sessions")
			.execute(&self.pool)
			.await
			.map_err(storage)?;
		Ok(result.rows_affected())
	}

	/// Every live session belonging to any of the given users.
	pub async fn find_by_user_ids(&self, user_ids: &[UserId]) -> Result<Vec<SessionRecord>, ChatError> {
		if user_ids.is_empty() {
			return Ok(Vec::new());
		}

		let sql = format!(
			"SELECT session_id, user_id, joined_at_ms FROM connected_sessions WHERE user_id IN ({}) ORDER BY joined_at_ms, session_id",
			placeholders(user_ids.len())
		);
		let mut query = sqlx::query_as::<_, SessionRow>(&sql);
		for id in user_ids {
			query = query.bind(id.to_string());
		}

		let rows = query.fetch_all(&self.pool).await.map_err(storage)?;
		rows.into_iter().map(session_from_row).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ChatStore;

	fn sid(s: &str) -> SessionId {
		SessionId::new(s).unwrap()
	}

	#[tokio::test]
	async fn register_and_unregister_roundtrip() {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let sessions = store.sessions();
		let user = UserId::new_v4();

		sessions.register(&sid("conn-1"), user).await.unwrap();
		let removed = sessions.unregister(&sid("conn-1")).await.unwrap().unwrap();
		assert_eq!(removed.user_id, user);

		assert!(sessions.unregister(&sid("conn-1")).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn reregistering_overwrites_the_session() {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let sessions = store.sessions();
		let first = UserId::new_v4();
		let second = UserId::new_v4();

		sessions.register(&sid("conn-1"), first).await.unwrap();
		sessions.register(&sid("conn-1"), second).await.unwrap();

		let found = sessions.find_by_user_ids(&[first, second]).await.unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].user_id, second);
	}

	#[tokio::test]
	async fn find_by_user_ids_scopes_to_the_given_users() {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let sessions = store.sessions();
		let alice = UserId::new_v4();
		let bob = UserId::new_v4();
		let carol = UserId::new_v4();

		sessions.register(&sid("a1"), alice).await.unwrap();
		sessions.register(&sid("a2"), alice).await.unwrap();
		sessions.register(&sid("b1"), bob).await.unwrap();
		sessions.register(&sid("c1"), carol).await.unwrap();

		let found = sessions.find_by_user_ids(&[alice, bob]).await.unwrap();
		assert_eq!(found.len(), 3);
		assert!(found.iter().all(|s| s.user_id != carol));

		assert!(sessions.find_by_user_ids(&[]).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn clear_all_reports_the_count() {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let sessions = store.sessions();

		sessions.register(&sid("x"), UserId::new_v4()).await.unwrap();
		sessions.register(&sid("y"), UserId::new_v4()).await.unwrap();

		assert_eq!(sessions.clear_all().await.unwrap(), 2);
		assert_eq!(sessions.clear_all().await.unwrap(), 0);
	}
}
