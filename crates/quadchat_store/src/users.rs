#![forbid(unsafe_code)]

use quadchat_domain::{ChatError, UserId};
use sqlx::SqlitePool;

use crate::{corrupt_row, placeholders, storage};

/// A user as mirrored from the user-management collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
	pub id: UserId,
	pub email: String,
}

/// Read/write access to the mirrored user directory.
#[derive(Clone)]
pub struct UserDirectory {
	pool: SqlitePool,
}

impl UserDirectory {
	pub(crate) fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Sync a user into the directory; the email follows the latest write.
	pub async fn upsert(&self, id: UserId, email: &str) -> Result<UserRecord, ChatError> {
		let email = email.trim();
		if email.is_empty() {
			return Err(ChatError::Validation("user email must not be empty".to_string()));
		}

		sqlx::query("INSERT INTO users (id, email) VALUES (?, ?) ON CONFLICT (id) DO UPDATE SET email = excluded.email")
			.bind(id.to_string())
			.bind(email)
			.execute(&self.pool)
			.await
			.map_err(storage)?;

		Ok(UserRecord {
			id,
			email: email.to_string(),
		})
	}

	pub async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>, ChatError> {
		let row: Option<(String, String)> = sqlx::query_as("SELECT id, email FROM users WHERE id = ?")
			.bind(id.to_string())
			.fetch_optional(&self.pool)
			.await
			.map_err(storage)?;

		row.map(|(id, email)| {
			Ok(UserRecord {
				id: UserId::parse(&id).map_err(|err| corrupt_row("users.id", err))?,
				email,
			})
		})
		.transpose()
	}

	/// Fetch a batch of users; ids that do not exist are silently absent.
	pub async fn find_by_ids(&self, ids: &[UserId]) -> Result<Vec<UserRecord>, ChatError> {
		if ids.is_empty() {
			return Ok(Vec::new());
		}

		let sql = format!("SELECT id, email FROM users WHERE id IN ({}) ORDER BY email", placeholders(ids.len()));
		let mut query = sqlx::query_as::<_, (String, String)>(&sql);
		for id in ids {
			query = query.bind(id.to_string());
		}

		let rows = query.fetch_all(&self.pool).await.map_err(storage)?;
		rows.into_iter()
			.map(|(id, email)| {
				Ok(UserRecord {
					id: UserId::parse(&id).map_err(|err| corrupt_row("users.id", err))?,
					email,
				})
			})
			.collect()
	}

	/// Error with `NotFound` unless every id names an existing user.
	pub async fn require_all(&self, ids: &[UserId]) -> Result<(), ChatError> {
		if ids.is_empty() {
			return Ok(());
		}

		let sql = format!("SELECT COUNT(*) FROM users WHERE id IN ({})", placeholders(ids.len()));
		let mut query = sqlx::query_as::<_, (i64,)>(&sql);
		for id in ids {
			query = query.bind(id.to_string());
		}

		let (count,) = query.fetch_one(&self.pool).await.map_err(storage)?;
		if count as usize != ids.len() {
			return Err(ChatError::NotFound("one or more referenced users do not exist".to_string()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ChatStore;

	#[tokio::test]
	async fn upsert_overwrites_email() {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let users = store.users();
		let id = UserId::new_v4();

		users.upsert(id, "old@campus.edu").await.unwrap();
		users.upsert(id, "new@campus.edu").await.unwrap();

		let found = users.find_by_id(id).await.unwrap().unwrap();
		assert_eq!(found.email, "new@campus.edu");
	}

	#[tokio::test]
	async fn upsert_rejects_empty_email() {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let err = store.users().upsert(UserId::new_v4(), "  ").await.unwrap_err();
		assert_eq!(err.code(), "validation");
	}

	#[tokio::test]
	async fn require_all_flags_missing_users() {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let users = store.users();
		let known = UserId::new_v4();
		users.upsert(known, "known@campus.edu").await.unwrap();

		assert!(users.require_all(&[known]).await.is_ok());
		assert!(users.require_all(&[]).await.is_ok());

		let err = users.require_all(&[known, UserId::new_v4()]).await.unwrap_err();
		assert_eq!(err.code(), "not_found");
	}

	#[tokio::test]
	async fn find_by_ids_skips_unknown() {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let users = store.users();
		let a = UserId::new_v4();
		users.upsert(a, "a@campus.edu").await.unwrap();

		let found = users.find_by_ids(&[a, UserId::new_v4()]).await.unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].id, a);
	}
}
