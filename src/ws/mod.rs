pub mod connection;
pub mod messages;
pub mod transport;

pub use connection::{ChannelManager, ChannelState, EventSink, ReconnectPolicy};
pub use messages::{ChannelEvent, EngineEndpoint, RoomScope, Topic, TransportMode};

/// Realtime subscription owned by one view. [`ChannelManager`] is the
/// Socket.IO implementation; views only see this trait.
pub trait RealtimeChannel: Send {
    /// Opens the subscription and joins `scope`. Returns `false` without doing
    /// anything while a connection is already active.
    fn connect(&mut self, scope: RoomScope) -> bool;

    /// Tears the subscription down. Returns `false` if there was nothing to
    /// tear down.
    fn disconnect(&mut self) -> bool;

    /// Registers the sink for `topic`, replacing any previous one.
    fn subscribe(&mut self, topic: Topic, sink: EventSink);

    fn state(&self) -> ChannelState;
}
