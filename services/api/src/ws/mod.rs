pub mod protocol;
pub mod provider;
pub mod session;

pub use session::ws_handler;
