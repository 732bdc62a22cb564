//! # relay-protocol
//!
//! Wire protocol definitions for the Relay chat gateway.
//!
//! This crate defines the JSON frames exchanged between the gateway and its
//! clients, and the domain-event envelope carried on the pub/sub bus.
//!
//! ## Frame Types
//!
//! - `auth` - Connection admitted
//! - `message` / `message_edit` / `message_delete` / `message_reaction` - Chat traffic
//! - `typing_start` / `typing_stop` - Typing indicators
//! - `user_join` / `user_leave` / `user_status_change` - Membership and presence
//! - `ping` / `pong` / `notification` / `error` - Control
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, FramePayload, OutboundFrame};
//!
//! let frame = OutboundFrame::new(FramePayload::Pong);
//! let encoded = codec::encode(&frame).unwrap();
//! assert!(encoded.starts_with(b"{\"type\":\"pong\""));
//! ```

pub mod codec;
pub mod events;
pub mod frames;
pub mod inbound;

pub use codec::{decode_client, encode, encode_batch, ProtocolError, MAX_FRAME_SIZE};
pub use events::{DomainEvent, EventEnvelope, EventKind, EventType};
pub use frames::{
    AuthAck, FramePayload, FrameType, MembershipPayload, NotificationPayload, OutboundFrame,
    ReactionAction, ReactionPayload, StatusPayload, TypingPayload, UserStatus,
};
pub use inbound::ClientFrame;
