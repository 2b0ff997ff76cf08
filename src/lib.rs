pub mod authorization;
pub mod config;
pub mod crypto;
pub mod environment;
pub mod server;
pub mod session;
pub mod shared;
pub mod template;
pub mod user;
pub mod utils;
mod wire;

pub use config::Configuration;
pub use server::{Server, Services};
