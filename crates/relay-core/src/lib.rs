//! # relay-core
//!
//! Connection hub, membership index and event bridge for the Relay gateway.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Connection** - Connection identity and the bounded outbound queue
//! - **Membership** - Which connections and users are in which rooms
//! - **Hub** - Single control task owning membership and fan-out
//! - **Bus** - Event bus port with an in-process implementation
//! - **Bridge** - Domain events to hub broadcasts
//! - **Router** - Client control frames to domain actions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│   Bridge    │◀──── Bus
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//!        │            ┌─────────────────────────────┐
//!        └────────────│   Hub (membership index)    │
//!                     └─────────────────────────────┘
//! ```

pub mod bridge;
pub mod bus;
pub mod connection;
pub mod hub;
pub mod membership;
pub mod router;

#[cfg(test)]
mod testutil;

pub use bridge::{BridgeError, BridgeStats, Dispatch, EventBridge, DEFAULT_DEDUP_WINDOW};
pub use bus::{BusError, BusMessage, BusSubscription, EventPublisher, EventSource, MemoryBus};
pub use connection::{
    ConnectionHandle, ConnectionId, Identity, OutboundQueue, QueueError, RoomId, UserId,
    DEFAULT_QUEUE_CAPACITY,
};
pub use hub::{Hub, HubConfig, HubError, HubStats, Target};
pub use membership::{IndexStats, MembershipIndex};
pub use router::{InboundRouter, Route};
