//! Magic link: heartbeat and registration between workers and the front-end

mod client;
mod service;
mod state;

pub use client::{Assignment, MagicLinkClient, WorkerEvent, WorkerIdentity};
pub use service::{MagicLinkService, RegistrationRequest};
pub use state::{LinkSignal, LinkState};
