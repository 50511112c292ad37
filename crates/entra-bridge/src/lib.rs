//! entra-bridge: native-messaging bridge between a browser extension and the Entra
//! SSO broker.

mod version;

pub mod bridge;
pub mod broker;
pub mod dispatcher;
pub mod session;

#[cfg(test)]
mod testing;

pub use bridge::codec::{FrameError, JsonCodec};
pub use bridge::protocol::{
    Account, AccountList, BrokerState, CookieResult, Envelope, ErrorMessage, SSO_URL_DEFAULT,
};
pub use broker::{
    Broker, BrokerClient, BrokerConfig, BrokerError, BrokerSpawner, CommandSpawner,
    StateNotifier,
};
pub use dispatcher::{DispatchError, Dispatcher, Outbound, UnknownCommandPolicy};
pub use session::{Session, SessionConfig, SessionError};
pub use version::{BRIDGE_VERSION, UNTRACKED_BROKER_VERSION, VersionInfo};
