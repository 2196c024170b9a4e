pub mod client;
pub mod config;
pub mod lifecycle;
pub mod scheduler;
pub mod sender;
pub mod stats;
pub mod tracer;
pub mod transport;
pub mod waves;

pub use client::*;
pub use config::*;
pub use lifecycle::*;
pub use scheduler::*;
pub use sender::*;
pub use stats::*;
pub use tracer::*;
pub use transport::*;
pub use waves::*;
