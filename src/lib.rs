pub mod config;
pub mod connection;
pub mod distributor;
pub mod downloader;
pub mod error;
pub mod registry;
pub mod relay;
pub mod search;
pub mod server;

pub use config::{Args, BackpressurePolicy, IdlePolicy, RelayConfig};
pub use connection::{Connection, ConnectionId, Delivery};
pub use distributor::{Distributor, SessionEnd};
pub use downloader::{Downloader, DownloaderConfig, UpstreamEvent};
pub use error::{RelayError, Result};
pub use registry::ConnectionRegistry;
pub use relay::{Listener, Relay, RelayStatus};
