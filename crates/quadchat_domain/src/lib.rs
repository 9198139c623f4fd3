#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid uuid: {0}")]
	InvalidUuid(String),
	#[error("unknown room type: {0}")]
	UnknownRoomType(String),
}

macro_rules! uuid_id {
	($(#[$doc:meta])* $name:ident) => {
		$(#[$doc])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub uuid::Uuid);

		impl $name {
			/// Create a new random identifier.
			pub fn new_v4() -> Self {
				Self(uuid::Uuid::new_v4())
			}

			/// Parse from a canonical uuid string.
			pub fn parse(s: &str) -> Result<Self, ParseIdError> {
				let s = s.trim();
				if s.is_empty() {
					return Err(ParseIdError::Empty);
				}
				uuid::Uuid::parse_str(s)
					.map(Self)
					.map_err(|_| ParseIdError::InvalidUuid(s.to_string()))
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::parse(s)
			}
		}
	};
}

uuid_id!(
	/// Stable identifier of a user; issued by the user-management collaborator.
	UserId
);
uuid_id!(
	/// Identifier of a chat room.
	RoomId
);
uuid_id!(
	/// Identifier of a chat message.
	MessageId
);

/// Identifier of one live connection; unique per registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
	/// Create a non-empty `SessionId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Room membership flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomType {
	/// Exactly host + one participant; membership immutable after creation.
	Private,
	/// Host + one or more participants; membership mutable.
	Group,
}

impl RoomType {
	/// Stable string identifier, as persisted and as carried on the wire.
	pub const fn as_str(self) -> &'static str {
		match self {
			RoomType::Private => "PRIVATE",
			RoomType::Group => "GROUP",
		}
	}
}

impl fmt::Display for RoomType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RoomType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"" => Err(ParseIdError::Empty),
			"PRIVATE" => Ok(RoomType::Private),
			"GROUP" => Ok(RoomType::Group),
			other => Err(ParseIdError::UnknownRoomType(other.to_string())),
		}
	}
}

/// Identity established once at handshake and threaded through every event call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
	pub user_id: UserId,
	pub email: String,
}

/// Failure taxonomy for the chat core. Every handler error is one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	/// Bad token at handshake; the connection is rejected.
	#[error("authentication failed: {0}")]
	Unauthenticated(String),

	/// Expired token; the client should run its refresh flow.
	#[error("token expired; please refresh your token")]
	TokenExpired,

	/// The caller lacks the right to perform the action.
	#[error("not authorized: {0}")]
	Forbidden(String),

	/// Malformed request (participant lists, duplicates, host-in-participants).
	#[error("invalid request: {0}")]
	Validation(String),

	/// Room/message/user absent or soft-deleted.
	#[error("not found: {0}")]
	NotFound(String),

	/// Ownership mismatch on message update/delete.
	#[error("conflict: {0}")]
	Conflict(String),

	/// Store unavailable or misbehaving.
	#[error("storage error: {0}")]
	Storage(String),
}

impl ChatError {
	/// Short stable code used in logs and metrics labels.
	pub const fn code(&self) -> &'static str {
		match self {
			ChatError::Unauthenticated(_) => "unauthenticated",
			ChatError::TokenExpired => "token_expired",
			ChatError::Forbidden(_) => "forbidden",
			ChatError::Validation(_) => "validation",
			ChatError::NotFound(_) => "not_found",
			ChatError::Conflict(_) => "conflict",
			ChatError::Storage(_) => "storage",
		}
	}

	/// Expected client misuse (logged at lower severity) vs a system fault.
	pub const fn is_client_fault(&self) -> bool {
		!matches!(self, ChatError::Storage(_))
	}
}

/// Validate a participant list against the room-type invariants.
///
/// The host is implicit and must never appear in the list; duplicates are
/// rejected; PRIVATE requires exactly one participant, GROUP at least one.
/// Reported before any state mutation.
pub fn validate_participants(room_type: RoomType, host_id: UserId, participants: &[UserId]) -> Result<(), ChatError> {
	if participants.contains(&host_id) {
		return Err(ChatError::Validation(
			"the room host must not be included in the participants list".to_string(),
		));
	}

	let mut seen = participants.to_vec();
	seen.sort_unstable();
	seen.dedup();
	if seen.len() != participants.len() {
		return Err(ChatError::Validation("the participants list contains duplicates".to_string()));
	}

	match room_type {
		RoomType::Private if participants.len() != 1 => Err(ChatError::Validation(
			"a private room must include exactly one participant aside from the host".to_string(),
		)),
		RoomType::Group if participants.is_empty() => Err(ChatError::Validation(
			"a group room must include at least one participant aside from the host".to_string(),
		)),
		_ => Ok(()),
	}
}

/// Time helpers shared by the store and the server.
pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}

	/// Current Unix time in seconds.
	#[inline]
	pub fn unix_secs_now() -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_secs()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn room_type_parse_and_display() {
		assert_eq!("PRIVATE".parse::<RoomType>().unwrap(), RoomType::Private);
		assert_eq!("GROUP".parse::<RoomType>().unwrap(), RoomType::Group);
		assert_eq!(RoomType::Group.to_string(), "GROUP");
		assert!("private".parse::<RoomType>().is_err());
	}

	#[test]
	fn ids_parse_roundtrip() {
		let id = RoomId::new_v4();
		assert_eq!(RoomId::parse(&id.to_string()).unwrap(), id);
		assert!(UserId::parse("").is_err());
		assert!(MessageId::parse("not-a-uuid").is_err());
	}

	#[test]
	fn session_id_rejects_empty() {
		assert!(SessionId::new("   ").is_err());
		assert_eq!(SessionId::new("conn-1").unwrap().as_str(), "conn-1");
	}

	#[test]
	fn participants_reject_host_and_duplicates() {
		let host = UserId::new_v4();
		let other = UserId::new_v4();

		let err = validate_participants(RoomType::Group, host, &[other, host]).unwrap_err();
		assert_eq!(err.code(), "validation");

		let err = validate_participants(RoomType::Group, host, &[other, other]).unwrap_err();
		assert_eq!(err.code(), "validation");
	}

	#[test]
	fn private_rooms_need_exactly_one_participant() {
		let host = UserId::new_v4();
		let a = UserId::new_v4();
		let b = UserId::new_v4();

		assert!(validate_participants(RoomType::Private, host, &[a]).is_ok());
		assert!(validate_participants(RoomType::Private, host, &[]).is_err());
		assert!(validate_participants(RoomType::Private, host, &[a, b]).is_err());
	}

	#[test]
	fn group_rooms_need_at_least_one_participant() {
		let host = UserId::new_v4();
		let a = UserId::new_v4();

		assert!(validate_participants(RoomType::Group, host, &[a]).is_ok());
		assert!(validate_participants(RoomType::Group, host, &[]).is_err());
	}

	#[test]
	fn error_severity_split() {
		assert!(ChatError::Forbidden("x".into()).is_client_fault());
		assert!(ChatError::Validation("x".into()).is_client_fault());
		assert!(!ChatError::Storage("down".into()).is_client_fault());
	}
}
