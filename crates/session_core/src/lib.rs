pub mod cipher;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod health;
pub mod lock;
pub mod manager;
pub mod routing;
pub mod schedule;
pub mod settings;
pub mod socket;

pub use cipher::{AesGcmCipher, Cipher, CipherError, PassthroughCipher};
pub use connection::{reconnect_delay, ConnectionContext, SessionConnection};
pub use credentials::{AuthState, CredentialStore, Credentials, KeyCategory, KeyStore};
pub use error::SendError;
pub use health::HealthMonitor;
pub use lock::DistributedLock;
pub use manager::{ClaimOutcome, SessionManager, SessionRegistry};
pub use settings::SessionSettings;
pub use socket::{
    CloseInfo, LoopbackConnector, MissingSocketConnector, ProtocolSocket, SocketConnector,
    SocketError, SocketEvent, SocketSession,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
