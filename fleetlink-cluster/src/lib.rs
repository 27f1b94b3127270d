pub mod connector;
pub mod context;
pub mod error;
pub mod events;
pub mod family;
pub mod magic_link;
pub mod matchmaking;
pub mod packet;
pub mod runtime;

pub use connector::{ClientConnector, ClientProfile};
pub use context::ProxyContext;
pub use error::{Error, Result};
pub use events::{EventSender, FleetEvent};
pub use family::{Family, FamilyRegistry, LoadBalancer, Worker};
pub use magic_link::{LinkState, MagicLinkClient, MagicLinkService, WorkerEvent};
pub use matchmaking::{Matchmaker, MemoryRankStore, RankStore};
pub use packet::{MemoryTransport, Packet, PacketBus, RedisTransport, Transport};
pub use runtime::{Proxy, WorkerNode};
