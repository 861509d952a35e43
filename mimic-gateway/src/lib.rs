pub mod bypass;
pub mod config;
pub mod error;
pub mod http;
pub mod kernel_event;
pub mod kernel_event_source;
pub mod log;
pub mod mock;
pub mod protocol;
pub mod resolver;
pub mod session;
pub mod target;
pub mod tracker;

pub use config::Conf;
pub use kernel_event_source::{KernelEventSource, KernelEventStream, KernelEventStreams};
pub use session::{ModeContext, SessionController};
