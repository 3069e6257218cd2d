//! Root of the `relay-core` library.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the caller's event channel.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod index;
pub mod pty;
pub mod queue;
pub mod resolve;
pub mod sessions;
pub mod store;
pub mod turn;

pub use config::RelayConfig;
pub use error::ErrorKind;
pub use error::TurnError;
pub use events::EventSink;
pub use events::ExecutionResult;
pub use events::ProgressEvent;
pub use pty::CommandRunner;
pub use pty::PtySupervisor;
pub use pty::TurnCancellation;
pub use queue::TurnQueue;
pub use sessions::SessionLog;
pub use sessions::SessionRecord;
pub use store::ConversationKey;
pub use store::ConversationStore;
pub use store::ThreadKey;
pub use turn::TurnOrchestrator;
pub use turn::TurnRequest;
