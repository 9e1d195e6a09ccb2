//! # Asynchronous File I/O
//!
//! Slot-based asynchronous reads and writes for data and log files.
//!
//! ```text
//!   ┌──────────────┐  submit   ┌──────────────────────────────────────────────┐
//!   │   callers    │ ────────► │ IoSubsystem                                  │
//!   └──────────────┘           │                                              │
//!                              │  ArrayRegistry                               │
//!                              │  ┌──────┐ ┌─────┐ ┌────────┐ ┌───────┐ ┌────┐│
//!                              │  │ ibuf │ │ log │ │  read  │ │ write │ │sync││
//!                              │  └──┬───┘ └──┬──┘ └───┬────┘ └───┬───┘ └────┘│
//!                              │     │ one handler per segment    │           │
//!                              │     ▼        ▼        ▼          ▼           │
//!                              │  dyn AsyncIoBackend                          │
//!                              │    SimulatedBackend  (merge + sync syscalls) │
//!                              │    NativeBackend     (io_uring, Linux)       │
//!                              └─────────────────────┬────────────────────────┘
//!                                                    │ Completion
//!                                                    ▼
//!                              IoHandlerPool ──► CompletionHandler
//! ```
//!
//! | Module       | Responsibility                                         |
//! |--------------|--------------------------------------------------------|
//! | `config`     | `AioConfig`, TOML loading and validation               |
//! | `file`       | `IoFile` trait and `FileHandle`                        |
//! | `buffer`     | `IoBuf`, the non-owning view of caller memory          |
//! | `slot`       | request slots and their state machine                  |
//! | `array`      | fixed-capacity slot pools split into segments          |
//! | `registry`   | the five arrays and global segment numbering           |
//! | `retry`      | error classification and retry policy                  |
//! | `stats`      | counters, segment states, status report                |
//! | `backend`    | `AsyncIoBackend` trait and shared `IoCore`             |
//! | `simulated`  | merge engine over synchronous positioned I/O           |
//! | `native`     | io_uring backend                                       |
//! | `subsystem`  | `IoSubsystem`, the public entry point                  |
//! | `handler`    | handler threads                                        |
//! | `completion` | routing completions to async or channel consumers      |

pub mod array;
pub mod backend;
pub mod buffer;
pub mod completion;
pub mod config;
pub mod file;
pub mod handler;
#[cfg(target_os = "linux")]
pub mod native;
pub mod registry;
pub mod retry;
pub mod simulated;
pub mod slot;
pub mod stats;
pub mod subsystem;

pub use buffer::IoBuf;
pub use completion::{ChannelCompletionHandler, CompletionTracker};
pub use config::AioConfig;
pub use file::{FileHandle, IoFile};
pub use handler::{CompletionHandler, IoHandlerPool};
pub use registry::ArrayKind;
pub use slot::{Completion, IoOp, IoRequest};
pub use subsystem::{AioMode, IoSubsystem};
