#![forbid(unsafe_code)]

use quadchat_domain::{MessageId, RoomId, RoomType, UserId};
use serde::{Deserialize, Serialize};

/// Handshake frame; the credential rides out-of-band from the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
	pub token: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
	pub name: String,
	pub room_type: RoomType,
	pub participant_ids: Vec<UserId>,
}

/// Payload naming a single room; used by several read/membership events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
	pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoomRequest {
	pub room_id: RoomId,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipChangeRequest {
	pub room_id: RoomId,
	pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
	pub room_id: RoomId,
	pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessageRequest {
	pub message_id: MessageId,
	pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessageRequest {
	pub room_id: RoomId,
	pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
	pub refresh_token: String,
}

/// Closed set of inbound real-time events, one handler per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
	CreateRoom(CreateRoomRequest),
	GetRoomDetails(RoomRef),
	UpdateRoom(UpdateRoomRequest),
	JoinRoom(RoomRef),
	LeaveRoom(RoomRef),
	AssignUsers(MembershipChangeRequest),
	DeleteUsers(MembershipChangeRequest),
	DeleteRoom(RoomRef),
	SendMessage(SendMessageRequest),
	FindAllMessages(RoomRef),
	UpdateMessage(UpdateMessageRequest),
	DeleteMessage(DeleteMessageRequest),
	RefreshToken(RefreshTokenRequest),
}

impl ClientEvent {
	/// Wire name of the event, for logs and metrics.
	pub const fn name(&self) -> &'static str {
		match self {
			ClientEvent::CreateRoom(_) => "createRoom",
			ClientEvent::GetRoomDetails(_) => "getRoomDetails",
			ClientEvent::UpdateRoom(_) => "updateRoom",
			ClientEvent::JoinRoom(_) => "joinRoom",
			ClientEvent::LeaveRoom(_) => "leaveRoom",
			ClientEvent::AssignUsers(_) => "assignUsers",
			ClientEvent::DeleteUsers(_) => "deleteUsers",
			ClientEvent::DeleteRoom(_) => "deleteRoom",
			ClientEvent::SendMessage(_) => "sendMessage",
			ClientEvent::FindAllMessages(_) => "findAllMessages",
			ClientEvent::UpdateMessage(_) => "updateMessage",
			ClientEvent::DeleteMessage(_) => "deleteMessage",
			ClientEvent::RefreshToken(_) => "refreshToken",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPayload {
	pub id: UserId,
	pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
	pub id: RoomId,
	pub name: String,
	pub room_type: RoomType,
	pub host_id: UserId,
	pub members: Vec<MemberPayload>,
	pub created_at_ms: i64,
	pub updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_id: UserId,
	pub sender_email: String,
	pub content: String,
	pub created_at_ms: i64,
	pub updated_at_ms: i64,
}

/// A single user joining or leaving a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoomChange {
	pub user_id: UserId,
	pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedMessagesPayload {
	pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefreshedPayload {
	pub access_token: String,
}

/// Structured error event; always the only reply a failed event produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionPayload {
	pub status: String,
	pub message: String,
}

impl ExceptionPayload {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			status: "error".to_string(),
			message: message.into(),
		}
	}
}

/// Closed set of outbound real-time events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
	UserAllRooms(Vec<RoomPayload>),
	RoomCreated(RoomPayload),
	RoomDetailsFetched(RoomPayload),
	RoomUpdated(RoomPayload),
	UserJoined(UserRoomChange),
	UserLeft(UserRoomChange),
	UsersAssigned(RoomPayload),
	UsersDeleted(RoomPayload),
	RoomDeleted(RoomRef),
	MessageSent(MessagePayload),
	AllMessages(Vec<MessagePayload>),
	MessageUpdated(Vec<MessagePayload>),
	MessageDeleted(DeletedMessagesPayload),
	TokenRefreshed(TokenRefreshedPayload),
	Exception(ExceptionPayload),
}

impl ServerEvent {
	/// Wire name of the event, for logs and metrics.
	pub const fn name(&self) -> &'static str {
		match self {
			ServerEvent::UserAllRooms(_) => "userAllRooms",
			ServerEvent::RoomCreated(_) => "roomCreated",
			ServerEvent::RoomDetailsFetched(_) => "roomDetailsFetched",
			ServerEvent::RoomUpdated(_) => "roomUpdated",
			ServerEvent::UserJoined(_) => "userJoined",
			ServerEvent::UserLeft(_) => "userLeft",
			ServerEvent::UsersAssigned(_) => "usersAssigned",
			ServerEvent::UsersDeleted(_) => "usersDeleted",
			ServerEvent::RoomDeleted(_) => "roomDeleted",
			ServerEvent::MessageSent(_) => "messageSent",
			ServerEvent::AllMessages(_) => "allMessages",
			ServerEvent::MessageUpdated(_) => "messageUpdated",
			ServerEvent::MessageDeleted(_) => "messageDeleted",
			ServerEvent::TokenRefreshed(_) => "tokenRefreshed",
			ServerEvent::Exception(_) => "exception",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_event_uses_wire_names() {
		let room_id = RoomId::new_v4();
		let ev = ClientEvent::JoinRoom(RoomRef { room_id });

		let json = serde_json::to_value(&ev).unwrap();
		assert_eq!(json["event"], "joinRoom");
		assert_eq!(json["data"]["roomId"], room_id.to_string());

		let back: ClientEvent = serde_json::from_value(json).unwrap();
		assert_eq!(back, ev);
	}

	#[test]
	fn create_room_carries_room_type_enum() {
		let json = serde_json::json!({
			"event": "createRoom",
			"data": {
				"name": "study hall",
				"roomType": "GROUP",
				"participantIds": [UserId::new_v4().to_string()],
			}
		});

		let ev: ClientEvent = serde_json::from_value(json).unwrap();
		match ev {
			ClientEvent::CreateRoom(req) => assert_eq!(req.room_type, RoomType::Group),
			other => panic!("unexpected event: {other:?}"),
		}
	}

	#[test]
	fn exception_has_error_status() {
		let ev = ServerEvent::Exception(ExceptionPayload::new("not authorized"));
		let json = serde_json::to_value(&ev).unwrap();

		assert_eq!(json["event"], "exception");
		assert_eq!(json["data"]["status"], "error");
		assert_eq!(json["data"]["message"], "not authorized");
	}

	#[test]
	fn server_event_names_match_wire_tags() {
		let ev = ServerEvent::RoomDeleted(RoomRef { room_id: RoomId::new_v4() });
		let json = serde_json::to_value(&ev).unwrap();
		assert_eq!(json["event"], ev.name());
	}

	#[test]
	fn update_room_name_is_optional() {
		let json = serde_json::json!({
			"event": "updateRoom",
			"data": { "roomId": RoomId::new_v4().to_string() }
		});

		let ev: ClientEvent = serde_json::from_value(json).unwrap();
		match ev {
			ClientEvent::UpdateRoom(req) => assert!(req.name.is_none()),
			other => panic!("unexpected event: {other:?}"),
		}
	}
}
