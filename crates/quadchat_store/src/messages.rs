#![forbid(unsafe_code)]

use quadchat_domain::time::unix_ms_now;
use quadchat_domain::{ChatError, MessageId, RoomId, UserId};
use sqlx::SqlitePool;

use crate::{corrupt_row, placeholders, storage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub sender_email: String,
	pub content: String,
	pub created_at_ms: i64,
	pub updated_at_ms: i64,
}

type MessageRow = (String, String, String, String, String, i64, i64);

fn message_from_row(
	(id, room_id, sender_id, sender_email, content, created_at_ms, updated_at_ms): MessageRow,
) -> Result<MessageRecord, ChatError> {
	Ok(MessageRecord {
		id: MessageId::parse(&id).map_err(|err| corrupt_row("messages.id", err))?,
		room_id: RoomId::parse(&room_id).map_err(|err| corrupt_row("messages.room_id", err))?,
		sender_id: UserId::parse(&sender_id).map_err(|err| corrupt_row("messages.sender_id", err))?,
		sender_email,
		content,
		created_at_ms,
		updated_at_ms,
	})
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.room_id, m.sender_id, u.email, m.content, m.created_at_ms, m.updated_at_ms \
	FROM messages m JOIN users u ON u.id = m.sender_id";

/// Message log per room, append plus owner-scoped edit and soft delete.
#[derive(Clone)]
pub struct MessageStore {
	pool: SqlitePool,
}

impl MessageStore {
	pub(crate) fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Append a message. The sender must be a member of a live room.
	pub async fn create(&self, sender_id: UserId, room_id: RoomId, content: &str) -> Result<MessageRecord, ChatError> {
		if content.trim().is_empty() {
			return Err(ChatError::Validation("message content must not be empty".to_string()));
		}
		self.require_live_room(room_id).await?;
		self.require_member(room_id, sender_id).await?;

		let id = MessageId::new_v4();
		let now = unix_ms_now();
		sqlx::query(
			"INSERT INTO messages (id, room_id, sender_id, content, created_at_ms, updated_at_ms) VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(id.to_string())
		.bind(room_id.to_string())
		.bind(sender_id.to_string())
		.bind(content)
		.bind(now)
		.bind(now)
		.execute(&self.pool)
		.await
		.map_err(storage)?;

		self.load(id).await
	}

	/// The live conversation of a room in send order. The caller must be a member.
	pub async fn find_by_room_id(&self, caller: UserId, room_id: RoomId) -> Result<Vec<MessageRecord>, ChatError> {
		self.require_live_room(room_id).await?;
		self.require_member(room_id, caller).await?;

		let sql =
			format!("{MESSAGE_SELECT} WHERE m.room_id = ? AND m.deleted_at_ms IS NULL ORDER BY m.created_at_ms, m.rowid");
		let rows: Vec<MessageRow> = sqlx::query_as(&sql)
			.bind(room_id.to_string())
			.fetch_all(&self.pool)
			.await
			.map_err(storage)?;

		rows.into_iter().map(message_from_row).collect()
	}

	/// Edit message content. Only the original sender may edit, and they must
	/// still be a member of the room; both checks run before anything is
	/// written.
	pub async fn update(&self, acting: UserId, message_id: MessageId, content: &str) -> Result<MessageRecord, ChatError> {
		if content.trim().is_empty() {
			return Err(ChatError::Validation("message content must not be empty".to_string()));
		}

		let existing = self.load(message_id).await?;
		if existing.sender_id != acting {
			return Err(ChatError::Conflict("only the sender may edit a message".to_string()));
		}
		self.require_member(existing.room_id, acting).await?;

		sqlx::query("UPDATE messages SET content = ?, updated_at_ms = ? WHERE id = ?")
			.bind(content)
			.bind(unix_ms_now())
			.bind(message_id.to_string())
			.execute(&self.pool)
			.await
			.map_err(storage)?;

		self.load(message_id).await
	}

	/// Soft-delete a batch of messages, all-or-nothing. Every id must name a
	/// live message in `room_id` sent by `acting`; otherwise nothing changes.
	pub async fn delete_many(
		&self,
		acting: UserId,
		room_id: RoomId,
		message_ids: &[MessageId],
	) -> Result<Vec<MessageId>, ChatError> {
		if message_ids.is_empty() {
			return Err(ChatError::Validation("no message ids were provided".to_string()));
		}
		self.require_live_room(room_id).await?;

		let mut tx = self.pool.begin().await.map_err(storage)?;
		for id in message_ids {
			let row: Option<(String, String)> =
				sqlx::query_as("SELECT room_id, sender_id FROM messages WHERE id = ? AND deleted_at_ms IS NULL")
					.bind(id.to_string())
					.fetch_optional(&mut *tx)
					.await
					.map_err(storage)?;

			let Some((msg_room, sender)) = row else {
				return Err(ChatError::NotFound(format!("message {id} does not exist")));
			};
			if msg_room != room_id.to_string() {
				return Err(ChatError::NotFound(format!("message {id} does not belong to room {room_id}")));
			}
			if sender != acting.to_string() {
				return Err(ChatError::Conflict("only the sender may delete a message".to_string()));
			}
		}

		let now = unix_ms_now();
		let sql = format!(
			"UPDATE messages SET deleted_at_ms = ?, updated_at_ms = ? WHERE id IN ({})",
			placeholders(message_ids.len())
		);
		let mut query = sqlx::query(&sql).bind(now).bind(now);
		for id in message_ids {
			query = query.bind(id.to_string());
		}
		query.execute(&mut *tx).await.map_err(storage)?;
		tx.commit().await.map_err(storage)?;

		Ok(message_ids.to_vec())
	}

	async fn load(&self, message_id: MessageId) -> Result<MessageRecord, ChatError> {
		let sql = format!("{MESSAGE_SELECT} WHERE m.id = ? AND m.deleted_at_ms IS NULL");
		let row: Option<MessageRow> = sqlx::query_as(&sql)
			.bind(message_id.to_string())
			.fetch_optional(&self.pool)
			.await
			.map_err(storage)?;

		match row {
			Some(row) => message_from_row(row),
			None => Err(ChatError::NotFound(format!("message {message_id} does not exist"))),
		}
	}

	async fn require_live_room(&self, room_id: RoomId) -> Result<(), ChatError> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM rooms WHERE id = ? AND deleted_at_ms IS NULL")
			.bind(room_id.to_string())
			.fetch_optional(&self.pool)
			.await
			.map_err(storage)?;

		if row.is_none() {
			return Err(ChatError::NotFound(format!("room {room_id} does not exist")));
		}
		Ok(())
	}

	async fn require_member(&self, room_id: RoomId, user_id: UserId) -> Result<(), ChatError> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM room_members WHERE room_id = ? AND user_id = ?")
			.bind(room_id.to_string())
			.bind(user_id.to_string())
			.fetch_optional(&self.pool)
			.await
			.map_err(storage)?;

		if row.is_none() {
			return Err(ChatError::Forbidden("you are not a member of this room".to_string()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use quadchat_domain::RoomType;

	use super::*;
	use crate::ChatStore;

	async fn seeded_room() -> (ChatStore, UserId, UserId, UserId, RoomId) {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let host = UserId::new_v4();
		let alice = UserId::new_v4();
		let mallory = UserId::new_v4();
		store.users().upsert(host, "host@campus.edu").await.unwrap();
		store.users().upsert(alice, "alice@campus.edu").await.unwrap();
		store.users().upsert(mallory, "mallory@campus.edu").await.unwrap();
		let room = store.rooms().create(host, "club", RoomType::Group, &[alice]).await.unwrap();
		(store, host, alice, mallory, room.room.id)
	}

	#[tokio::test]
	async fn send_requires_membership() {
		let (store, _, _, mallory, room_id) = seeded_room().await;
		let err = store.messages().create(mallory, room_id, "hi").await.unwrap_err();
		assert_eq!(err.code(), "forbidden");
	}

	#[tokio::test]
	async fn conversation_is_in_send_order() {
		let (store, host, alice, _, room_id) = seeded_room().await;
		let messages = store.messages();

		messages.create(host, room_id, "first").await.unwrap();
		messages.create(alice, room_id, "second").await.unwrap();
		messages.create(host, room_id, "third").await.unwrap();

		let all = messages.find_by_room_id(alice, room_id).await.unwrap();
		let contents: Vec<_> = all.iter().map(|m| m.content.as_str()).collect();
		assert_eq!(contents, ["first", "second", "third"]);
		assert_eq!(all[1].sender_email, "alice@campus.edu");
	}

	#[tokio::test]
	async fn listing_requires_membership() {
		let (store, _, _, mallory, room_id) = seeded_room().await;
		let err = store.messages().find_by_room_id(mallory, room_id).await.unwrap_err();
		assert_eq!(err.code(), "forbidden");
	}

	#[tokio::test]
	async fn only_the_sender_may_edit() {
		let (store, host, alice, _, room_id) = seeded_room().await;
		let messages = store.messages();
		let sent = messages.create(host, room_id, "typo").await.unwrap();

		let err = messages.update(alice, sent.id, "fixed").await.unwrap_err();
		assert_eq!(err.code(), "conflict");

		let edited = messages.update(host, sent.id, "fixed").await.unwrap();
		assert_eq!(edited.content, "fixed");
	}

	#[tokio::test]
	async fn editing_after_leaving_the_room_changes_nothing() {
		let (store, host, alice, _, room_id) = seeded_room().await;
		let messages = store.messages();
		let sent = messages.create(alice, room_id, "before").await.unwrap();
		store.rooms().leave(room_id, alice).await.unwrap();

		let err = messages.update(alice, sent.id, "edited").await.unwrap_err();
		assert_eq!(err.code(), "forbidden");

		let all = messages.find_by_room_id(host, room_id).await.unwrap();
		assert_eq!(all[0].content, "before");
	}

	#[tokio::test]
	async fn editing_a_missing_message_is_not_found() {
		let (store, host, _, _, _) = seeded_room().await;
		let err = store.messages().update(host, MessageId::new_v4(), "x").await.unwrap_err();
		assert_eq!(err.code(), "not_found");
	}

	#[tokio::test]
	async fn delete_many_is_all_or_nothing() {
		let (store, host, alice, _, room_id) = seeded_room().await;
		let messages = store.messages();
		let mine = messages.create(host, room_id, "mine").await.unwrap();
		let theirs = messages.create(alice, room_id, "theirs").await.unwrap();

		let err = messages.delete_many(host, room_id, &[mine.id, theirs.id]).await.unwrap_err();
		assert_eq!(err.code(), "conflict");

		// nothing was deleted
		let all = messages.find_by_room_id(host, room_id).await.unwrap();
		assert_eq!(all.len(), 2);

		let deleted = messages.delete_many(host, room_id, &[mine.id]).await.unwrap();
		assert_eq!(deleted, vec![mine.id]);
		let all = messages.find_by_room_id(host, room_id).await.unwrap();
		assert_eq!(all.len(), 1);
		assert_eq!(all[0].id, theirs.id);
	}

	#[tokio::test]
	async fn delete_many_rejects_foreign_room_ids() {
		let (store, host, alice, _, room_id) = seeded_room().await;
		let other = store.rooms().create(host, "other", RoomType::Group, &[alice]).await.unwrap();
		let sent = store.messages().create(host, other.room.id, "elsewhere").await.unwrap();

		let err = store.messages().delete_many(host, room_id, &[sent.id]).await.unwrap_err();
		assert_eq!(err.code(), "not_found");
	}

	#[tokio::test]
	async fn a_deleted_room_rejects_sends() {
		let (store, host, _, _, room_id) = seeded_room().await;
		store.rooms().soft_delete(host, room_id).await.unwrap();

		let err = store.messages().create(host, room_id, "hello?").await.unwrap_err();
		assert_eq!(err.code(), "not_found");
	}

	#[tokio::test]
	async fn restore_revives_cascaded_messages_only() {
		let (store, host, _, _, room_id) = seeded_room().await;
		let messages = store.messages();
		let kept = messages.create(host, room_id, "kept").await.unwrap();
		let gone = messages.create(host, room_id, "gone").await.unwrap();
		messages.delete_many(host, room_id, &[gone.id]).await.unwrap();

		// the cascade timestamp must differ from the manual delete above
		tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		store.rooms().soft_delete(host, room_id).await.unwrap();
		store.rooms().restore(room_id).await.unwrap();

		let all = messages.find_by_room_id(host, room_id).await.unwrap();
		assert_eq!(all.len(), 1);
		assert_eq!(all[0].id, kept.id);
	}
}
