pub mod server;
pub mod websocket;

pub use server::{start_overlay_server, OverlayError};
pub use websocket::{OverlayClientMessage, OverlayMessage, OverlayState};
