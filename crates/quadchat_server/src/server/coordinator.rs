#![forbid(unsafe_code)]

//! The chat coordinator: authenticates, authorizes against current room
//! state, mutates through the store, and fans results out to every live
//! session of every affected member.

use futures::future::join_all;
use quadchat_domain::{AuthenticatedIdentity, ChatError, SessionId, UserId};
use quadchat_protocol::events::{
	DeletedMessagesPayload, MemberPayload, MessagePayload, RoomPayload, TokenRefreshedPayload, UserRoomChange,
};
use quadchat_protocol::{
	ClientEvent, CreateRoomRequest, DeleteMessageRequest, MembershipChangeRequest, RefreshTokenRequest, RoomRef,
	SendMessageRequest, ServerEvent, UpdateMessageRequest, UpdateRoomRequest,
};
use quadchat_store::{ChatStore, MessageRecord, RoomWithMembers};
use tracing::{debug, error, info, warn};

use crate::server::auth::TokenVerifier;
use crate::server::registry::{ConnectionRegistry, OutboundSender};

pub struct ChatCoordinator {
	store: ChatStore,
	registry: ConnectionRegistry,
	verifier: TokenVerifier,
}

impl ChatCoordinator {
	pub fn new(store: ChatStore, registry: ConnectionRegistry, verifier: TokenVerifier) -> Self {
		Self {
			store,
			registry,
			verifier,
		}
	}

	pub fn verifier(&self) -> &TokenVerifier {
		&self.verifier
	}

	pub fn registry(&self) -> &ConnectionRegistry {
		&self.registry
	}

	/// Bind a freshly authenticated connection and produce the initial room
	/// snapshot, saving the client a "list my rooms" round trip.
	pub async fn on_connect(
		&self,
		session_id: &SessionId,
		identity: &AuthenticatedIdentity,
		outbound: OutboundSender,
	) -> Result<ServerEvent, ChatError> {
		self.store.users().upsert(identity.user_id, &identity.email).await?;
		self.registry.register(session_id, identity.user_id, outbound).await?;

		let rooms = self.store.rooms().find_by_user_id(identity.user_id).await?;
		info!(session = %session_id, user = %identity.user_id, rooms = rooms.len(), "session active");
		Ok(ServerEvent::UserAllRooms(rooms.iter().map(room_payload).collect()))
	}

	pub async fn on_disconnect(&self, session_id: &SessionId) {
		match self.registry.unregister(session_id).await {
			Ok(Some(record)) => info!(session = %session_id, user = %record.user_id, "session closed"),
			Ok(None) => debug!(session = %session_id, "session already gone"),
			Err(err) => error!(session = %session_id, error = %err, "failed to unregister session"),
		}
	}

	/// Handle one inbound event and return the caller's terminal reply.
	///
	/// Broadcasts to other members happen inside the handler, after the
	/// mutation succeeded; an error here means nothing was broadcast.
	pub async fn dispatch(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		event: ClientEvent,
	) -> Result<ServerEvent, ChatError> {
		let name = event.name();
		metrics::counter!("quadchat_server_events_total", "event" => name).increment(1);

		let result = self.handle(session_id, caller, event).await;
		if let Err(err) = &result {
			metrics::counter!("quadchat_server_event_errors_total", "event" => name, "code" => err.code()).increment(1);
			if err.is_client_fault() {
				debug!(event = name, user = %caller.user_id, error = %err, "event rejected");
			} else {
				error!(event = name, user = %caller.user_id, error = %err, "event failed");
			}
		}
		result
	}

	async fn handle(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		event: ClientEvent,
	) -> Result<ServerEvent, ChatError> {
		match event {
			ClientEvent::CreateRoom(req) => self.create_room(session_id, caller, req).await,
			ClientEvent::GetRoomDetails(req) => self.get_room_details(caller, req).await,
			ClientEvent::UpdateRoom(req) => self.update_room(session_id, caller, req).await,
			ClientEvent::JoinRoom(req) => self.join_room(session_id, caller, req).await,
			ClientEvent::LeaveRoom(req) => self.leave_room(session_id, caller, req).await,
			ClientEvent::AssignUsers(req) => self.assign_users(session_id, caller, req).await,
			ClientEvent::DeleteUsers(req) => self.delete_users(session_id, caller, req).await,
			ClientEvent::DeleteRoom(req) => self.delete_room(caller, req).await,
			ClientEvent::SendMessage(req) => self.send_message(session_id, caller, req).await,
			ClientEvent::FindAllMessages(req) => self.find_all_messages(caller, req).await,
			ClientEvent::UpdateMessage(req) => self.update_message(session_id, caller, req).await,
			ClientEvent::DeleteMessage(req) => self.delete_message(session_id, caller, req).await,
			ClientEvent::RefreshToken(req) => self.refresh_token(caller, req).await,
		}
	}

	async fn create_room(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		req: CreateRoomRequest,
	) -> Result<ServerEvent, ChatError> {
		let room = self
			.store
			.rooms()
			.create(caller.user_id, &req.name, req.room_type, &req.participant_ids)
			.await?;

		let event = ServerEvent::RoomCreated(room_payload(&room));
		self.fan_out(Some(session_id), &room.member_ids(), &event).await;
		Ok(event)
	}

	async fn get_room_details(&self, caller: &AuthenticatedIdentity, req: RoomRef) -> Result<ServerEvent, ChatError> {
		let room = self.store.rooms().find_by_id(req.room_id).await?;
		require_member(&room, caller.user_id)?;
		Ok(ServerEvent::RoomDetailsFetched(room_payload(&room)))
	}

	async fn update_room(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		req: UpdateRoomRequest,
	) -> Result<ServerEvent, ChatError> {
		let room = self
			.store
			.rooms()
			.update(caller.user_id, req.room_id, req.name.as_deref())
			.await?;

		let event = ServerEvent::RoomUpdated(room_payload(&room));
		self.fan_out(Some(session_id), &room.member_ids(), &event).await;
		Ok(event)
	}

	async fn join_room(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		req: RoomRef,
	) -> Result<ServerEvent, ChatError> {
		let room = self.store.rooms().join(req.room_id, caller.user_id).await?;

		let event = ServerEvent::UserJoined(UserRoomChange {
			user_id: caller.user_id,
			room_id: room.room.id,
		});
		self.fan_out(Some(session_id), &room.member_ids(), &event).await;
		Ok(event)
	}

	async fn leave_room(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		req: RoomRef,
	) -> Result<ServerEvent, ChatError> {
		let room = self.store.rooms().leave(req.room_id, caller.user_id).await?;

		// the caller is no longer in the member set; their reply is the same
		// event the remaining members receive
		let event = ServerEvent::UserLeft(UserRoomChange {
			user_id: caller.user_id,
			room_id: room.room.id,
		});
		self.fan_out(Some(session_id), &room.member_ids(), &event).await;
		Ok(event)
	}

	async fn assign_users(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		req: MembershipChangeRequest,
	) -> Result<ServerEvent, ChatError> {
		let room = self
			.store
			.rooms()
			.assign_users(caller.user_id, req.room_id, &req.participant_ids)
			.await?;

		let event = ServerEvent::UsersAssigned(room_payload(&room));
		self.fan_out(Some(session_id), &room.member_ids(), &event).await;
		Ok(event)
	}

	async fn delete_users(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		req: MembershipChangeRequest,
	) -> Result<ServerEvent, ChatError> {
		let room = self
			.store
			.rooms()
			.delete_users(caller.user_id, req.room_id, &req.participant_ids)
			.await?;

		let event = ServerEvent::UsersDeleted(room_payload(&room));
		self.fan_out(Some(session_id), &room.member_ids(), &event).await;
		Ok(event)
	}

	async fn delete_room(&self, caller: &AuthenticatedIdentity, req: RoomRef) -> Result<ServerEvent, ChatError> {
		let snapshot = self.store.rooms().soft_delete(caller.user_id, req.room_id).await?;

		// every former member except the caller, across all their devices
		let recipients: Vec<UserId> = snapshot
			.member_ids()
			.into_iter()
			.filter(|id| *id != caller.user_id)
			.collect();
		let event = ServerEvent::RoomDeleted(RoomRef { room_id: req.room_id });
		self.fan_out(None, &recipients, &event).await;
		Ok(event)
	}

	async fn send_message(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		req: SendMessageRequest,
	) -> Result<ServerEvent, ChatError> {
		let room = self.store.rooms().find_by_id(req.room_id).await?;
		let message = self.store.messages().create(caller.user_id, req.room_id, &req.content).await?;

		let event = ServerEvent::MessageSent(message_payload(&message));
		self.fan_out(Some(session_id), &room.member_ids(), &event).await;
		Ok(event)
	}

	async fn find_all_messages(&self, caller: &AuthenticatedIdentity, req: RoomRef) -> Result<ServerEvent, ChatError> {
		let messages = self.store.messages().find_by_room_id(caller.user_id, req.room_id).await?;
		Ok(ServerEvent::AllMessages(messages.iter().map(message_payload).collect()))
	}

	async fn update_message(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		req: UpdateMessageRequest,
	) -> Result<ServerEvent, ChatError> {
		let updated = self.store.messages().update(caller.user_id, req.message_id, &req.content).await?;
		let room = self.store.rooms().find_by_id(updated.room_id).await?;

		// clients replace their conversation state wholesale, so ship the
		// full conversation rather than the single edited message
		let conversation = self.store.messages().find_by_room_id(caller.user_id, updated.room_id).await?;
		let event = ServerEvent::MessageUpdated(conversation.iter().map(message_payload).collect());
		self.fan_out(Some(session_id), &room.member_ids(), &event).await;
		Ok(event)
	}

	async fn delete_message(
		&self,
		session_id: &SessionId,
		caller: &AuthenticatedIdentity,
		req: DeleteMessageRequest,
	) -> Result<ServerEvent, ChatError> {
		let room = self.store.rooms().find_by_id(req.room_id).await?;
		require_member(&room, caller.user_id)?;

		let deleted = self
			.store
			.messages()
			.delete_many(caller.user_id, req.room_id, &req.message_ids)
			.await?;

		let event = ServerEvent::MessageDeleted(DeletedMessagesPayload { message_ids: deleted });
		self.fan_out(Some(session_id), &room.member_ids(), &event).await;
		Ok(event)
	}

	async fn refresh_token(
		&self,
		caller: &AuthenticatedIdentity,
		req: RefreshTokenRequest,
	) -> Result<ServerEvent, ChatError> {
		let claims = self.verifier.verify_refresh(&req.refresh_token)?;
		let subject = UserId::parse(&claims.sub)
			.map_err(|err| ChatError::Unauthenticated(format!("bad refresh token subject: {err}")))?;
		if subject != caller.user_id {
			return Err(ChatError::Forbidden("refresh token belongs to a different user".to_string()));
		}

		let access_token = self.verifier.issue_access(caller.user_id, &caller.email)?;
		Ok(ServerEvent::TokenRefreshed(TokenRefreshedPayload { access_token }))
	}

	/// Deliver `event` to every live session of every recipient, each send
	/// awaited independently. One stale session never aborts the rest, and a
	/// delivery failure never fails the action that triggered it.
	async fn fan_out(&self, exclude: Option<&SessionId>, recipients: &[UserId], event: &ServerEvent) {
		let targets = match self.registry.senders_for_users(recipients).await {
			Ok(targets) => targets,
			Err(err) => {
				error!(event = event.name(), error = %err, "fan-out session lookup failed");
				return;
			}
		};

		let sends = targets
			.into_iter()
			.filter(|(session_id, _)| exclude != Some(session_id))
			.map(|(session_id, sender)| {
				let event = event.clone();
				async move { (session_id, sender.send(event).await) }
			});

		let mut delivered = 0usize;
		let mut failed = 0usize;
		for (session_id, result) in join_all(sends).await {
			match result {
				Ok(()) => delivered += 1,
				Err(_) => {
					failed += 1;
					debug!(session = %session_id, event = event.name(), "fan-out recipient unreachable");
				}
			}
		}

		metrics::counter!("quadchat_server_fanout_deliveries_total").increment(delivered as u64);
		if failed > 0 {
			metrics::counter!("quadchat_server_fanout_failures_total").increment(failed as u64);
			warn!(event = event.name(), delivered, failed, "fan-out completed with failures");
		}
	}
}

fn require_member(room: &RoomWithMembers, user_id: UserId) -> Result<(), ChatError> {
	if !room.is_member(user_id) {
		return Err(ChatError::Forbidden("you are not a member of this room".to_string()));
	}
	Ok(())
}

fn room_payload(room: &RoomWithMembers) -> RoomPayload {
	RoomPayload {
		id: room.room.id,
		name: room.room.name.clone(),
		room_type: room.room.room_type,
		host_id: room.room.host_id,
		members: room
			.members
			.iter()
			.map(|m| MemberPayload {
				id: m.id,
				email: m.email.clone(),
			})
			.collect(),
		created_at_ms: room.room.created_at_ms,
		updated_at_ms: room.room.updated_at_ms,
	}
}

fn message_payload(message: &MessageRecord) -> MessagePayload {
	MessagePayload {
		id: message.id,
		room_id: message.room_id,
		sender_id: message.sender_id,
		sender_email: message.sender_email.clone(),
		content: message.content.clone(),
		created_at_ms: message.created_at_ms,
		updated_at_ms: message.updated_at_ms,
	}
}
