#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use bytes::BytesMut;
use quadchat_domain::{AuthenticatedIdentity, SessionId};
use quadchat_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use quadchat_protocol::{ClientEvent, ExceptionPayload, Hello, ServerEvent};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::coordinator::ChatCoordinator;
use crate::server::registry::{OUTBOUND_CHANNEL_CAPACITY, OutboundSender};

#[derive(Clone)]
pub struct ConnectionSettings {
	/// How long a client may take to present its Hello frame.
	pub handshake_timeout: Duration,
	pub max_frame_size: usize,
	pub outbound_channel_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			handshake_timeout: Duration::from_secs(10),
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
			outbound_channel_capacity: OUTBOUND_CHANNEL_CAPACITY,
		}
	}
}

/// Drive one client connection from handshake to disconnect.
///
/// Lifecycle: accept the single bidirectional stream, read the Hello frame
/// within the handshake window, verify the token, register the session and
/// push the room snapshot, then process events strictly in arrival order.
/// Other connections run their own tasks; ordering only holds per connection.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	coordinator: Arc<ChatCoordinator>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("quadchat_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("quadchat_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut send, mut recv) = connection.accept_bi().await.context("accept bidirectional stream")?;
	let mut buf = BytesMut::with_capacity(16 * 1024);

	let hello = match tokio::time::timeout(
		settings.handshake_timeout,
		read_frame::<Hello>(&mut recv, &mut buf, settings.max_frame_size),
	)
	.await
	{
		Ok(Ok(hello)) => hello,
		Ok(Err(err)) => {
			debug!(conn_id, error = %err, "handshake frame never arrived");
			return Ok(());
		}
		Err(_) => {
			debug!(conn_id, "handshake timed out");
			send_event(
				&mut send,
				&ServerEvent::Exception(ExceptionPayload::new("handshake timed out")),
				settings.max_frame_size,
			)
			.await
			.ok();
			return Ok(());
		}
	};
	metrics::counter!("quadchat_server_hello_total").increment(1);

	// Connecting -> Authenticated; a bad or expired token ends the connection
	// after one exception event, with the expired case worded so the client
	// knows to run its refresh flow.
	let identity = match coordinator.verifier().verify_access(hello.token.trim()) {
		Ok(identity) => identity,
		Err(err) => {
			warn!(conn_id, error = %err, "handshake rejected");
			metrics::counter!("quadchat_server_handshake_rejected_total", "code" => err.code()).increment(1);
			send_event(
				&mut send,
				&ServerEvent::Exception(ExceptionPayload::new(err.to_string())),
				settings.max_frame_size,
			)
			.await
			.ok();
			return Ok(());
		}
	};

	let session_id = SessionId::new(format!("conn-{conn_id}")).map_err(|err| anyhow!("session id: {err}"))?;
	info!(
		conn_id,
		user = %identity.user_id,
		client = hello.client_name.as_deref().unwrap_or("unknown"),
		"connection authenticated"
	);

	let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(settings.outbound_channel_capacity);

	// Authenticated -> Active: register and queue the initial room snapshot.
	let snapshot = match coordinator.on_connect(&session_id, &identity, outbound_tx.clone()).await {
		Ok(snapshot) => snapshot,
		Err(err) => {
			send_event(
				&mut send,
				&ServerEvent::Exception(ExceptionPayload::new(err.to_string())),
				settings.max_frame_size,
			)
			.await
			.ok();
			return Err(anyhow!("session setup failed: {err}"));
		}
	};

	let max_frame_size = settings.max_frame_size;
	let writer_task = tokio::spawn(async move {
		while let Some(event) = outbound_rx.recv().await {
			let frame = match encode_frame(&event, max_frame_size) {
				Ok(frame) => frame,
				Err(err) => {
					warn!(event = event.name(), error = %err, "failed to encode outbound event");
					continue;
				}
			};

			metrics::counter!("quadchat_server_events_out_total").increment(1);
			metrics::counter!("quadchat_server_bytes_out_total").increment(frame.len() as u64);
			if let Err(err) = send.write_all(&frame).await {
				debug!(error = %err, "outbound stream write failed");
				break;
			}
		}
	});

	if outbound_tx.send(snapshot).await.is_err() {
		coordinator.on_disconnect(&session_id).await;
		return Ok(());
	}

	let result = event_loop(
		conn_id,
		&mut recv,
		&mut buf,
		&outbound_tx,
		&coordinator,
		&session_id,
		&identity,
		max_frame_size,
	)
	.await;

	// Active -> Disconnected, whatever the reason the loop ended.
	coordinator.on_disconnect(&session_id).await;
	drop(outbound_tx);
	let _ = writer_task.await;
	result
}

/// Process inbound events one at a time, in arrival order.
#[allow(clippy::too_many_arguments)]
async fn event_loop(
	conn_id: u64,
	recv: &mut quinn::RecvStream,
	buf: &mut BytesMut,
	outbound: &OutboundSender,
	coordinator: &ChatCoordinator,
	session_id: &SessionId,
	identity: &AuthenticatedIdentity,
	max_frame_size: usize,
) -> anyhow::Result<()> {
	let mut tmp = [0u8; 8192];

	loop {
		loop {
			match try_decode_frame_from_buffer::<ClientEvent>(buf, max_frame_size) {
				Ok(Some(event)) => {
					let reply = match coordinator.dispatch(session_id, identity, event).await {
						Ok(reply) => reply,
						Err(err) => ServerEvent::Exception(ExceptionPayload::new(err.to_string())),
					};
					if outbound.send(reply).await.is_err() {
						return Ok(());
					}
				}
				Ok(None) => break,
				Err(err) => {
					metrics::counter!("quadchat_server_decode_errors_total").increment(1);
					return Err(anyhow!(err).context("failed to decode inbound frame"));
				}
			}
		}

		match recv.read(&mut tmp).await {
			Ok(Some(n)) => {
				metrics::counter!("quadchat_server_bytes_in_total").increment(n as u64);
				buf.extend_from_slice(&tmp[..n]);
			}
			Ok(None) => {
				debug!(conn_id, "client closed stream");
				return Ok(());
			}
			Err(err) => {
				debug!(conn_id, error = %err, "connection read ended");
				return Ok(());
			}
		}
	}
}

async fn read_frame<T: DeserializeOwned>(
	recv: &mut quinn::RecvStream,
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> anyhow::Result<T> {
	let mut tmp = [0u8; 8192];
	loop {
		if let Some(msg) = try_decode_frame_from_buffer::<T>(buf, max_frame_size)? {
			return Ok(msg);
		}

		match recv.read(&mut tmp).await {
			Ok(Some(n)) => buf.extend_from_slice(&tmp[..n]),
			Ok(None) => return Err(anyhow!("stream closed before a full frame arrived")),
			Err(err) => return Err(anyhow!(err).context("stream read failed")),
		}
	}
}

async fn send_event(send: &mut quinn::SendStream, event: &ServerEvent, max_frame_size: usize) -> anyhow::Result<()> {
	let frame = encode_frame(event, max_frame_size).map_err(|err| anyhow!(err))?;
	metrics::counter!("quadchat_server_events_out_total").increment(1);
	metrics::counter!("quadchat_server_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}
