//! Stepwise Engine
//!
//! Turns plain-language test steps into browser interactions and runs them:
//! - Parses step text into structured actions, strict forms first
//! - Resolves targets through ordered locator fallbacks
//! - Installs and launches Playwright browser engines on demand
//! - Orchestrates one run at a time with cancellation and live events
//! - Stores per-step screenshots and thumbnails under an artifacts root
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     RunOrchestrator                          │
//! │    ├── start(test_case, browser) -> Run                     │
//! │    ├── cancel(run_id) -> bool                               │
//! │    └── subscribe() -> RunEvent stream                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  interpreter      step text -> Action                       │
//! │  executor         Action -> locator plan -> Page calls      │
//! │  classify         errors -> user-facing failure messages    │
//! │  runtime          engine install state, launch              │
//! │  artifacts        screenshots, thumbnails, path checks      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  driver (Browser / Page traits)                             │
//! │    └── playwright: Node.js bridge over JSON lines           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod artifacts;
pub mod classify;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod interpreter;
pub mod orchestrator;
pub mod playwright;
pub mod runtime;
pub mod url_pattern;

pub use artifacts::ArtifactStore;
pub use classify::{classify_failure, Failure, FailureKind};
pub use config::{EngineConfig, RunSettings};
pub use driver::{Browser, DriverError, LaunchOptions, Locator, Page};
pub use error::{EngineError, EngineResult};
pub use events::EventHub;
pub use executor::ActionExecutor;
pub use interpreter::{parse, StepParseError};
pub use orchestrator::RunOrchestrator;
pub use playwright::{NodeSettings, PlaywrightInstaller, PlaywrightLauncher};
pub use runtime::{BrowserLauncher, BrowserRuntimeManager, EngineInstaller};
