pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod request_log;
pub mod rewriter;
pub mod server;
pub mod settings;
pub mod tunnel;
pub mod validator;

pub use config::Config;
pub use error::RelayError;
pub use server::RelayServer;
