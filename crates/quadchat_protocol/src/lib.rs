#![forbid(unsafe_code)]

pub mod events;
pub mod framing;

pub use events::{
	ClientEvent, CreateRoomRequest, DeleteMessageRequest, ExceptionPayload, Hello, MemberPayload, MembershipChangeRequest,
	MessagePayload, RefreshTokenRequest, RoomPayload, RoomRef, SendMessageRequest, ServerEvent, TokenRefreshedPayload,
	UpdateMessageRequest, UpdateRoomRequest, UserRoomChange,
};
pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, try_decode_frame_from_buffer};
