pub mod app;
pub mod blank;
pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod fps;
pub mod frame;
pub mod http;
pub mod orchestrator;
pub mod ring;
pub mod sink;
pub mod worker_pool;

pub use app::Application;
pub use config::ServerConfig;
pub use error::{Result, UstreamerError};
pub use frame::{CodecFormat, Frame};
pub use ring::Ring;
