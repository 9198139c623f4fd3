#![forbid(unsafe_code)]

pub mod messages;
pub mod rooms;
pub mod sessions;
pub mod users;

pub use messages::{MessageRecord, MessageStore};
pub use rooms::{RoomRecord, RoomStore, RoomWithMembers};
pub use sessions::{SessionRecord, SessionStore};
pub use users::{UserDirectory, UserRecord};

use quadchat_domain::ChatError;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

/// Handle to the chat database. Cheap to clone; all sub-stores share the pool.
#[derive(Clone, Debug)]
pub struct ChatStore {
	pool: SqlitePool,
}

impl ChatStore {
	pub async fn connect(database_url: &str) -> Result<Self, ChatError> {
		if !database_url.starts_with("sqlite:") {
			return Err(ChatError::Storage(format!("unsupported database_url: {database_url}")));
		}

		let pool = SqlitePool::connect(database_url).await.map_err(storage)?;
		Self::migrate(pool).await
	}

	/// In-memory database on a single connection, so every handle sees the
	/// same data. Used by tests and ephemeral runs.
	pub async fn connect_in_memory() -> Result<Self, ChatError> {
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.connect("sqlite::memory:")
			.await
			.map_err(storage)?;
		Self::migrate(pool).await
	}

	async fn migrate(pool: SqlitePool) -> Result<Self, ChatError> {
		sqlx::migrate!("./migrations")
			.run(&pool)
			.await
			.map_err(|err| ChatError::Storage(format!("run migrations: {err}")))?;
		Ok(Self { pool })
	}

	pub fn rooms(&self) -> RoomStore {
		RoomStore::new(self.pool.clone())
	}

	pub fn messages(&self) -> MessageStore {
		MessageStore::new(self.pool.clone())
	}

	pub fn sessions(&self) -> SessionStore {
		SessionStore::new(self.pool.clone())
	}

	pub fn users(&self) -> UserDirectory {
		UserDirectory::new(self.pool.clone())
	}
}

pub(crate) fn storage(err: sqlx::Error) -> ChatError {
	ChatError::Storage(err.to_string())
}

/// A stored id that no longer parses is a corrupt row, not a client fault.
pub(crate) fn corrupt_row(column: &str, err: impl std::fmt::Display) -> ChatError {
	ChatError::Storage(format!("corrupt {column} in database: {err}"))
}

/// `?, ?, ?` for an `IN (...)` clause with `n` binds.
pub(crate) fn placeholders(n: usize) -> String {
	let mut s = String::with_capacity(n.saturating_mul(3));
	for i in 0..n {
		if i > 0 {
			s.push_str(", ");
		}
		s.push('?');
	}
	s
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn placeholders_shapes() {
		assert_eq!(placeholders(0), "");
		assert_eq!(placeholders(1), "?");
		assert_eq!(placeholders(3), "?, ?, ?");
	}

	#[tokio::test]
	async fn connect_rejects_non_sqlite_urls() {
		let err = ChatStore::connect("postgres://localhost/chat").await.unwrap_err();
		assert_eq!(err.code(), "storage");
	}

	#[tokio::test]
	async fn in_memory_store_migrates() {
		let store = ChatStore::connect_in_memory().await.expect("connect");
		let cleared = store.sessions().clear_all().await.expect("clear");
		assert_eq!(cleared, 0);
	}
}
