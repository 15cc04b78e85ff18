//! PDF to image rasterization: rendezvous channels, renderers and the bridge
//! that runs them concurrently.

pub mod bridge;
pub mod channel;
pub mod error;
pub mod renderer;

pub use bridge::{BridgeOutcome, StreamBridge};
#[cfg(unix)]
pub use channel::FifoBroker;
pub use channel::{ChannelBroker, MemoryBroker, OutputTarget, RendezvousChannel};
pub use error::{RenderError, ResourceError, StreamError};
pub use renderer::{GhostscriptRenderer, InputStream, Renderer};
