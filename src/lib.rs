pub mod bus;
pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod ledger;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod updates;

pub use session::{ExitStatus, Phase, ProtocolSession};
