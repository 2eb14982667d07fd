//! ember — a single-host HTTP/1.1 server built directly on epoll.
//!
//! One event-loop thread multiplexes readiness, a worker pool runs
//! per-connection read/write tasks (serialized per descriptor by ONESHOT
//! arming), a keyed timer revokes idle connections, and responses are
//! gathered from segmented buffers so mmap'ed file bodies are sent without
//! copying.

pub mod banner;
pub mod config;
pub mod connection;
pub mod fileserve;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod signal;
pub mod writer;

pub use config::Config;
pub use handler::HandlerTable;
pub use protocol_http::{Method, Request};
pub use server::{Server, ShutdownHandle};
pub use writer::ResponseWriter;
