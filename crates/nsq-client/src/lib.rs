mod config;
mod connection;
mod consumer;
mod delegate;
mod discovery;
mod error;
mod lookup;
mod message;
mod rdy;
mod stats;

pub use config::{Compression, Config, ConsumerSettings, TlsConfig, TlsMinVersion};
pub use connection::ConnectionState;
pub use consumer::{Consumer, HandlerFuture, MessageHandler};
pub use error::ConsumerError;
pub use message::Message;
pub use stats::{Stats, StatsSnapshot};
