//! Packets exchanged between the front-end and its workers

pub mod bus;
pub mod codec;
pub mod dedup;
#[allow(clippy::module_inception)]
mod packet;
pub mod transport;

pub use bus::{handler_fn, BusSettings, Delivery, PacketBus, PacketHandler, RoutingTable};
pub use dedup::MessageCache;
pub use packet::{
    Packet, PacketBuilder, PacketIdentification, PacketOrigin, ParameterValue, PACKET_VERSION,
};
pub use transport::{MemoryTransport, RedisTransport, Transport};

/// Built-in identifications, all in the `RC` namespace
pub mod ids {
    use super::PacketIdentification;

    /// Worker heartbeat; the first one from an unseen address registers it
    pub const PING: PacketIdentification = PacketIdentification::builtin("MLH");
    pub const PING_RESPONSE_FAIL: PacketIdentification = PacketIdentification::builtin("MLHF");
    pub const PING_RESPONSE_SUCCESS: PacketIdentification = PacketIdentification::builtin("MLHS");
    pub const DISCONNECT: PacketIdentification = PacketIdentification::builtin("MLHK");
    /// Worker asks the front-end to move a player into a family
    pub const SEND_PLAYER: PacketIdentification = PacketIdentification::builtin("SP");
    pub const LOCK_SERVER: PacketIdentification = PacketIdentification::builtin("LS");
    pub const UNLOCK_SERVER: PacketIdentification = PacketIdentification::builtin("US");
    pub const RANKED_GAME_READY: PacketIdentification = PacketIdentification::builtin("SRG");
    pub const RANKED_GAME_END: PacketIdentification = PacketIdentification::builtin("ERG");
}

/// Parameter keys used by the built-in packets
pub mod keys {
    pub const DISPLAY_NAME: &str = "display_name";
    pub const MAGIC_CONFIG: &str = "magic_config";
    pub const PLAYER_COUNT: &str = "player_count";
    pub const SECRET: &str = "secret";

    pub const UUID: &str = "uuid";
    pub const FAMILY: &str = "family";
    pub const SOFT_CAP: &str = "soft_cap";
    pub const HARD_CAP: &str = "hard_cap";
    pub const WEIGHT: &str = "weight";
    pub const PING_INTERVAL: &str = "ping_interval";
    pub const REASON: &str = "reason";

    pub const PLAYER: &str = "player";
    pub const SESSION: &str = "session";
    /// Comma-separated player ids
    pub const PLAYERS: &str = "players";
    pub const WINNERS: &str = "winners";
    pub const LOSERS: &str = "losers";
}

/// Split a comma-separated id list, skipping blanks
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
