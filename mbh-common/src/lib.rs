//! Shared library for the Micro Biome harness.
//!
//! Owns everything the `mbh` binary drives:
//! - server process lifecycle (zombie cleanup, launch, two-phase readiness, shutdown)
//! - the remote command channel and its retry policy
//! - chunk planning, result-log parsing, determinism hashing
//! - the test orchestrator and report writer

pub mod artifact;
pub mod channel;
pub mod chunks;
pub mod config;
pub mod console;
pub mod determinism;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod mock;
pub mod orchestrator;
pub mod parsing;
pub mod poll;
pub mod process;
pub mod profiling;
pub mod reporting;

pub use channel::{CommandChannel, CommandOutcome, CommandTransport, McrconTransport, RetryPolicy};
pub use config::HarnessConfig;
pub use console::Console;
pub use errors::{HarnessError, HarnessResult, TransportError};
pub use lifecycle::{InterruptHandle, LifecycleState, ProcessLifecycleController};
pub use logging::{LogConfig, LogContext, init_logging};
pub use orchestrator::{PhaseKind, RunOutcome, RunSettings, TestOrchestrator};
pub use reporting::{TestPhaseResult, TestStatus};
