//! The lobby protocol: packet framing, the user directory, client
//! sessions, and the hub that owns roster, chat and liveness.

pub mod client;
pub mod codec;
pub mod directory;
pub mod packet;
pub mod server;

pub use server::Server;
