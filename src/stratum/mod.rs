//! Stratum server side of the bridge

pub mod address;
pub mod context;
pub mod dispatcher;
pub mod event;
pub mod extranonce;
pub mod handlers;
pub mod jobs;
pub mod listener;

pub use address::{normalize, Network};
pub use context::{ConnectionContext, ConnectionId, HandshakeState, MinerWriter};
pub use dispatcher::{EventHandler, HandlerMap, MethodDispatcher};
pub use event::{JsonRpcEvent, JsonRpcResponse, StratumMethod};
pub use extranonce::ExtranonceAllocator;
pub use handlers::{default_handlers, require_authorized, send_extranonce};
pub use jobs::{send_job, TemplateSource};
pub use listener::{ListenerConfig, StratumListener};
