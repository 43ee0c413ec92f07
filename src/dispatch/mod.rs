//! Client side of the render round trip: wire payloads and transports.

pub mod relay;
pub mod transport;
pub mod wire;

pub use relay::{MessengerTransport, serve_relay};
pub use transport::{HttpTransport, LocalTransport, RenderTransport};
pub use wire::{RenderRequest, RenderResponse, RenderedItem};
