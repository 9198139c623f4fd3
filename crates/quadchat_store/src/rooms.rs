#![forbid(unsafe_code)]

use quadchat_domain::time::unix_ms_now;
use quadchat_domain::{ChatError, RoomId, RoomType, UserId, validate_participants};
use sqlx::SqlitePool;

use crate::users::{UserDirectory, UserRecord};
use crate::{corrupt_row, storage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
	pub id: RoomId,
	pub name: String,
	pub room_type: RoomType,
	pub host_id: UserId,
	pub created_at_ms: i64,
	pub updated_at_ms: i64,
}

/// A room together with its full member list (host included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomWithMembers {
	pub room: RoomRecord,
	pub members: Vec<UserRecord>,
}

impl RoomWithMembers {
	/// Member ids, host included.
	pub fn member_ids(&self) -> Vec<UserId> {
		self.members.iter().map(|m| m.id).collect()
	}

	pub fn is_member(&self, user_id: UserId) -> bool {
		self.members.iter().any(|m| m.id == user_id)
	}
}

type RoomRow = (String, String, String, String, i64, i64);

fn room_from_row((id, name, room_type, host_id, created_at_ms, updated_at_ms): RoomRow) -> Result<RoomRecord, ChatError> {
	Ok(RoomRecord {
		id: RoomId::parse(&id).map_err(|err| corrupt_row("rooms.id", err))?,
		name,
		room_type: room_type.parse().map_err(|err| corrupt_row("rooms.room_type", err))?,
		host_id: UserId::parse(&host_id).map_err(|err| corrupt_row("rooms.host_id", err))?,
		created_at_ms,
		updated_at_ms,
	})
}

const ROOM_COLUMNS: &str = "id, name, room_type, host_id, created_at_ms, updated_at_ms";

/// Room directory: room records plus the membership relation.
#[derive(Clone)]
pub struct RoomStore {
	pool: SqlitePool,
}

impl RoomStore {
	pub(crate) fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	fn users(&self) -> UserDirectory {
		UserDirectory::new(self.pool.clone())
	}

	/// Create a room hosted by `host_id`; the host is implicit and becomes a
	/// member alongside every listed participant.
	pub async fn create(
		&self,
		host_id: UserId,
		name: &str,
		room_type: RoomType,
		participant_ids: &[UserId],
	) -> Result<RoomWithMembers, ChatError> {
		let name = name.trim();
		if name.is_empty() {
			return Err(ChatError::Validation("room name must not be empty".to_string()));
		}
		validate_participants(room_type, host_id, participant_ids)?;

		let mut everyone = vec![host_id];
		everyone.extend_from_slice(participant_ids);
		self.users().require_all(&everyone).await?;

		let room_id = RoomId::new_v4();
		let now = unix_ms_now();

		let mut tx = self.pool.begin().await.map_err(storage)?;
		sqlx::query(
			"INSERT INTO rooms (id, name, room_type, host_id, created_at_ms, updated_at_ms) VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(room_id.to_string())
		.bind(name)
		.bind(room_type.as_str())
		.bind(host_id.to_string())
		.bind(now)
		.bind(now)
		.execute(&mut *tx)
		.await
		.map_err(storage)?;

		for member in &everyone {
			sqlx::query("INSERT INTO room_members (room_id, user_id) VALUES (?, ?)")
				.bind(room_id.to_string())
				.bind(member.to_string())
				.execute(&mut *tx)
				.await
				.map_err(storage)?;
		}
		tx.commit().await.map_err(storage)?;

		self.find_by_id(room_id).await
	}

	/// Fetch a live room with its members; deleted or unknown rooms are `NotFound`.
	pub async fn find_by_id(&self, room_id: RoomId) -> Result<RoomWithMembers, ChatError> {
		let room = self.load_live(room_id).await?;
		let members = self.members_of(room_id).await?;
		Ok(RoomWithMembers { room, members })
	}

	/// All live rooms the user belongs to, most recently updated first.
	pub async fn find_by_user_id(&self, user_id: UserId) -> Result<Vec<RoomWithMembers>, ChatError> {
		let rows: Vec<RoomRow> = sqlx::query_as(
			"SELECT r.id, r.name, r.room_type, r.host_id, r.created_at_ms, r.updated_at_ms FROM rooms r \
			JOIN room_members m ON m.room_id = r.id \
			WHERE m.user_id = ? AND r.deleted_at_ms IS NULL \
			ORDER BY r.updated_at_ms DESC, r.id",
		)
			.bind(user_id.to_string())
			.fetch_all(&self.pool)
			.await
			.map_err(storage)?;

		let mut out = Vec::with_capacity(rows.len());
		for row in rows {
			let room = room_from_row(row)?;
			let members = self.members_of(room.id).await?;
			out.push(RoomWithMembers { room, members });
		}
		Ok(out)
	}

	/// Rename a room. Host-only, group rooms only; a `None` name leaves the
	/// room untouched.
	pub async fn update(&self, acting: UserId, room_id: RoomId, name: Option<&str>) -> Result<RoomWithMembers, ChatError> {
		let room = self.load_live(room_id).await?;
		require_host(&room, acting)?;
		require_group(&room)?;

		if let Some(name) = name {
			let name = name.trim();
			if name.is_empty() {
				return Err(ChatError::Validation("room name must not be empty".to_string()));
			}

			sqlx::query("UPDATE rooms SET name = ?, updated_at_ms = ? WHERE id = ?")
				.bind(name)
				.bind(unix_ms_now())
				.bind(room_id.to_string())
				.execute(&self.pool)
				.await
				.map_err(storage)?;
		}

		self.find_by_id(room_id).await
	}

	/// Add the user to a group room. Re-joining is a no-op.
	pub async fn join(&self, room_id: RoomId, user_id: UserId) -> Result<RoomWithMembers, ChatError> {
		let room = self.load_live(room_id).await?;
		require_group(&room)?;
		self.users().require_all(&[user_id]).await?;

		sqlx::query("INSERT OR IGNORE INTO room_members (room_id, user_id) VALUES (?, ?)")
			.bind(room_id.to_string())
			.bind(user_id.to_string())
			.execute(&self.pool)
			.await
			.map_err(storage)?;
		self.touch(room_id).await?;

		self.find_by_id(room_id).await
	}

	/// Remove the user from a group room. The host cannot leave their own room.
	pub async fn leave(&self, room_id: RoomId, user_id: UserId) -> Result<RoomWithMembers, ChatError> {
		let room = self.load_live(room_id).await?;
		require_group(&room)?;
		if room.host_id == user_id {
			return Err(ChatError::Validation("the host cannot leave their own room".to_string()));
		}

		sqlx::query("DELETE FROM room_members WHERE room_id = ? AND user_id = ?")
			.bind(room_id.to_string())
			.bind(user_id.to_string())
			.execute(&self.pool)
			.await
			.map_err(storage)?;
		self.touch(room_id).await?;

		self.find_by_id(room_id).await
	}

	/// Add a batch of users to a group room. Host-only.
	pub async fn assign_users(
		&self,
		acting: UserId,
		room_id: RoomId,
		participant_ids: &[UserId],
	) -> Result<RoomWithMembers, ChatError> {
		let room = self.load_live(room_id).await?;
		require_host(&room, acting)?;
		require_group(&room)?;
		validate_participants(RoomType::Group, room.host_id, participant_ids)?;
		self.users().require_all(participant_ids).await?;

		let mut tx = self.pool.begin().await.map_err(storage)?;
		for user in participant_ids {
			sqlx::query("INSERT OR IGNORE INTO room_members (room_id, user_id) VALUES (?, ?)")
				.bind(room_id.to_string())
				.bind(user.to_string())
				.execute(&mut *tx)
				.await
				.map_err(storage)?;
		}
		sqlx::query("UPDATE rooms SET updated_at_ms = ? WHERE id = ?")
			.bind(unix_ms_now())
			.bind(room_id.to_string())
			.execute(&mut *tx)
			.await
			.map_err(storage)?;
		tx.commit().await.map_err(storage)?;

		self.find_by_id(room_id).await
	}

	/// Remove a batch of users from a group room. Host-only; the host cannot
	/// be removed.
	pub async fn delete_users(
		&self,
		acting: UserId,
		room_id: RoomId,
		participant_ids: &[UserId],
	) -> Result<RoomWithMembers, ChatError> {
		let room = self.load_live(room_id).await?;
		require_host(&room, acting)?;
		require_group(&room)?;
		validate_participants(RoomType::Group, room.host_id, participant_ids)?;

		let mut tx = self.pool.begin().await.map_err(storage)?;
		for user in participant_ids {
			sqlx::query("DELETE FROM room_members WHERE room_id = ? AND user_id = ?")
				.bind(room_id.to_string())
				.bind(user.to_string())
				.execute(&mut *tx)
				.await
				.map_err(storage)?;
		}
		sqlx::query("UPDATE rooms SET updated_at_ms = ? WHERE id = ?")
			.bind(unix_ms_now())
			.bind(room_id.to_string())
			.execute(&mut *tx)
			.await
			.map_err(storage)?;
		tx.commit().await.map_err(storage)?;

		self.find_by_id(room_id).await
	}

	/// Soft-delete a room and cascade to its live messages. Host-only.
	///
	/// Returns the room as it stood just before deletion, members included,
	/// so callers can still address the former member set.
	pub async fn soft_delete(&self, acting: UserId, room_id: RoomId) -> Result<RoomWithMembers, ChatError> {
		let snapshot = self.find_by_id(room_id).await?;
		require_host(&snapshot.room, acting)?;

		let now = unix_ms_now();
		let mut tx = self.pool.begin().await.map_err(storage)?;
		let updated = sqlx::query("UPDATE rooms SET deleted_at_ms = ?, updated_at_ms = ? WHERE id = ? AND deleted_at_ms IS NULL")
			.bind(now)
			.bind(now)
			.bind(room_id.to_string())
			.execute(&mut *tx)
			.await
			.map_err(storage)?;
		if updated.rows_affected() == 0 {
			return Err(ChatError::NotFound(format!("room {room_id} does not exist")));
		}

		sqlx::query("UPDATE messages SET deleted_at_ms = ? WHERE room_id = ? AND deleted_at_ms IS NULL")
			.bind(now)
			.bind(room_id.to_string())
			.execute(&mut *tx)
			.await
			.map_err(storage)?;
		tx.commit().await.map_err(storage)?;

		Ok(snapshot)
	}

	/// Undo a soft delete, restoring only the messages removed by its cascade.
	pub async fn restore(&self, room_id: RoomId) -> Result<RoomWithMembers, ChatError> {
		let row: Option<(i64,)> = sqlx::query_as("SELECT deleted_at_ms FROM rooms WHERE id = ? AND deleted_at_ms IS NOT NULL")
			.bind(room_id.to_string())
			.fetch_optional(&self.pool)
			.await
			.map_err(storage)?;
		let Some((deleted_at_ms,)) = row else {
			return Err(ChatError::NotFound(format!("room {room_id} is not deleted")));
		};

		let mut tx = self.pool.begin().await.map_err(storage)?;
		sqlx::query("UPDATE rooms SET deleted_at_ms = NULL, updated_at_ms = ? WHERE id = ?")
			.bind(unix_ms_now())
			.bind(room_id.to_string())
			.execute(&mut *tx)
			.await
			.map_err(storage)?;
		sqlx::query("UPDATE messages SET deleted_at_ms = NULL WHERE room_id = ? AND deleted_at_ms = ?")
			.bind(room_id.to_string())
			.bind(deleted_at_ms)
			.execute(&mut *tx)
			.await
			.map_err(storage)?;
		tx.commit().await.map_err(storage)?;

		self.find_by_id(room_id).await
	}

	async fn load_live(&self, room_id: RoomId) -> Result<RoomRecord, ChatError> {
		let sql = format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ? AND deleted_at_ms IS NULL");
		let row: Option<RoomRow> = sqlx::query_as(&sql)
			.bind(room_id.to_string())
			.fetch_optional(&self.pool)
			.await
			.map_err(storage)?;

		match row {
			Some(row) => room_from_row(row),
			None => Err(ChatError::NotFound(format!("room {room_id} does not exist"))),
		}
	}

	async fn members_of(&self, room_id: RoomId) -> Result<Vec<UserRecord>, ChatError> {
		let rows: Vec<(String, String)> = sqlx::query_as(
			"SELECT u.id, u.email FROM users u \
			JOIN room_members m ON m.user_id = u.id \
			WHERE m.room_id = ? ORDER BY u.email",
		)
		.bind(room_id.to_string())
		.fetch_all(&self.pool)
		.await
		.map_err(storage)?;

		rows.into_iter()
			.map(|(id, email)| {
				Ok(UserRecord {
					id: UserId::parse(&id).map_err(|err| corrupt_row("room_members.user_id", err))?,
					email,
				})
			})
			.collect()
	}

	async fn touch(&self, room_id: RoomId) -> Result<(), ChatError> {
		sqlx::query("UPDATE rooms SET updated_at_ms = ? WHERE id = ?")
			.bind(unix_ms_now())
			.bind(room_id.to_string())
			.execute(&self.pool)
			.await
			.map_err(storage)?;
		Ok(())
	}
}

fn require_host(room: &RoomRecord, acting: UserId) -> Result<(), ChatError> {
	if room.host_id != acting {
		return Err(ChatError::Forbidden("only the room host may perform this action".to_string()));
	}
	Ok(())
}

fn require_group(room: &RoomRecord) -> Result<(), ChatError> {
	if room.room_type != RoomType::Group {
		return Err(ChatError::Validation(
			"a private room cannot be modified after creation".to_string(),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ChatStore;

	async fn seeded() -> (ChatStore, UserId, UserId, UserId) {
		let store = ChatStore::connect_in_memory().await.unwrap();
		let host = UserId::new_v4();
		let alice = UserId::new_v4();
		let bob = UserId::new_v4();
		store.users().upsert(host, "host@campus.edu").await.unwrap();
		store.users().upsert(alice, "alice@campus.edu").await.unwrap();
		store.users().upsert(bob, "bob@campus.edu").await.unwrap();
		(store, host, alice, bob)
	}

	#[tokio::test]
	async fn create_includes_host_in_members() {
		let (store, host, alice, _) = seeded().await;
		let room = store
			.rooms()
			.create(host, "late night study", RoomType::Private, &[alice])
			.await
			.unwrap();

		assert_eq!(room.room.host_id, host);
		assert!(room.is_member(host));
		assert!(room.is_member(alice));
		assert_eq!(room.members.len(), 2);
	}

	#[tokio::test]
	async fn create_rejects_unknown_participant() {
		let (store, host, _, _) = seeded().await;
		let err = store
			.rooms()
			.create(host, "ghosts", RoomType::Group, &[UserId::new_v4()])
			.await
			.unwrap_err();
		assert_eq!(err.code(), "not_found");
	}

	#[tokio::test]
	async fn private_membership_is_immutable() {
		let (store, host, alice, bob) = seeded().await;
		let room = store.rooms().create(host, "dm", RoomType::Private, &[alice]).await.unwrap();

		let err = store.rooms().join(room.room.id, bob).await.unwrap_err();
		assert_eq!(err.code(), "validation");

		let err = store.rooms().leave(room.room.id, alice).await.unwrap_err();
		assert_eq!(err.code(), "validation");
	}

	#[tokio::test]
	async fn group_join_is_idempotent_and_host_cannot_leave() {
		let (store, host, alice, bob) = seeded().await;
		let room = store.rooms().create(host, "club", RoomType::Group, &[alice]).await.unwrap();

		let after = store.rooms().join(room.room.id, bob).await.unwrap();
		assert_eq!(after.members.len(), 3);
		let again = store.rooms().join(room.room.id, bob).await.unwrap();
		assert_eq!(again.members.len(), 3);

		let err = store.rooms().leave(room.room.id, host).await.unwrap_err();
		assert_eq!(err.code(), "validation");

		let after = store.rooms().leave(room.room.id, bob).await.unwrap();
		assert!(!after.is_member(bob));
	}

	#[tokio::test]
	async fn membership_changes_are_host_only() {
		let (store, host, alice, bob) = seeded().await;
		let room = store.rooms().create(host, "club", RoomType::Group, &[alice]).await.unwrap();

		let err = store.rooms().assign_users(alice, room.room.id, &[bob]).await.unwrap_err();
		assert_eq!(err.code(), "forbidden");

		let err = store.rooms().delete_users(alice, room.room.id, &[bob]).await.unwrap_err();
		assert_eq!(err.code(), "forbidden");

		let err = store.rooms().update(alice, room.room.id, Some("hijacked")).await.unwrap_err();
		assert_eq!(err.code(), "forbidden");

		let after = store.rooms().assign_users(host, room.room.id, &[bob]).await.unwrap();
		assert!(after.is_member(bob));
		let after = store.rooms().delete_users(host, room.room.id, &[bob]).await.unwrap();
		assert!(!after.is_member(bob));
	}

	#[tokio::test]
	async fn assign_rejects_host_and_duplicates() {
		let (store, host, alice, bob) = seeded().await;
		let room = store.rooms().create(host, "club", RoomType::Group, &[alice]).await.unwrap();

		let err = store.rooms().assign_users(host, room.room.id, &[host]).await.unwrap_err();
		assert_eq!(err.code(), "validation");

		let err = store.rooms().assign_users(host, room.room.id, &[bob, bob]).await.unwrap_err();
		assert_eq!(err.code(), "validation");

		let err = store.rooms().assign_users(host, room.room.id, &[]).await.unwrap_err();
		assert_eq!(err.code(), "validation");
	}

	#[tokio::test]
	async fn soft_delete_hides_room_and_restore_brings_it_back() {
		let (store, host, alice, _) = seeded().await;
		let room = store.rooms().create(host, "club", RoomType::Group, &[alice]).await.unwrap();
		let room_id = room.room.id;

		let err = store.rooms().soft_delete(alice, room_id).await.unwrap_err();
		assert_eq!(err.code(), "forbidden");

		let snapshot = store.rooms().soft_delete(host, room_id).await.unwrap();
		assert_eq!(snapshot.members.len(), 2);

		let err = store.rooms().find_by_id(room_id).await.unwrap_err();
		assert_eq!(err.code(), "not_found");
		assert!(store.rooms().find_by_user_id(alice).await.unwrap().is_empty());

		let restored = store.rooms().restore(room_id).await.unwrap();
		assert_eq!(restored.room.id, room_id);
		assert_eq!(store.rooms().find_by_user_id(alice).await.unwrap().len(), 1);

		let err = store.rooms().restore(room_id).await.unwrap_err();
		assert_eq!(err.code(), "not_found");
	}

	#[tokio::test]
	async fn update_renames_and_validates() {
		let (store, host, alice, _) = seeded().await;
		let room = store.rooms().create(host, "old name", RoomType::Group, &[alice]).await.unwrap();

		let err = store.rooms().update(host, room.room.id, Some("   ")).await.unwrap_err();
		assert_eq!(err.code(), "validation");

		let renamed = store.rooms().update(host, room.room.id, Some("new name")).await.unwrap();
		assert_eq!(renamed.room.name, "new name");

		let untouched = store.rooms().update(host, room.room.id, None).await.unwrap();
		assert_eq!(untouched.room.name, "new name");
	}

	#[tokio::test]
	async fn private_rooms_cannot_be_renamed() {
		let (store, host, alice, _) = seeded().await;
		let room = store.rooms().create(host, "dm", RoomType::Private, &[alice]).await.unwrap();

		let err = store.rooms().update(host, room.room.id, Some("renamed")).await.unwrap_err();
		assert_eq!(err.code(), "validation");
	}
}
