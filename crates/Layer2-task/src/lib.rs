//! # yard-task
//!
//! Task run and credential-rotation engine for Yard.
//! Runs an external coding agent against per-task git worktrees, one run at
//! a time per task, and resumes on another stored credential when a run
//! fails on a usage limit.
//!
//! ## Components
//!
//! - **Mount Composer** - isolation surface handed to the containerized agent
//! - **Sidecar Controller** - per-task nested container engine
//! - **Process Supervisor** - spawn, tee, continuation-token scan, stop escalation
//! - **Run Finalizer** - outcome classification and persistence
//! - **Rotation Controller** - usage-limit driven credential rotation
//! - **Task State Machine** - persisted task/run records
//!
//! [`TaskEngine`] wires them together over injected collaborators.

pub mod agent;
pub mod command;
pub mod credentials;
pub mod engine;
pub mod finalizer;
pub mod git;
pub mod log;
pub mod mount;
pub mod notify;
pub mod probe;
pub mod registry;
pub mod request;
pub mod rotation;
pub mod sidecar;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod task;

// Engine
pub use engine::{TaskEngine, TaskEngineBuilder};
pub use request::{CreateTaskRequest, ResumeTaskRequest};

// Task state machine
pub use state::TaskStatus;
pub use store::TaskStore;
pub use task::{Artifact, Attachment, ContextRepo, Run, RunKind, Task, TaskId};

// Components
pub use finalizer::{classify, Classification, FinalizedRun, RunFinalizer};
pub use mount::{HostMountComposer, MountComposer, MountInputs, MountPlan, PathMap, RunConfig};
pub use rotation::{CappedRoundRobin, RotationContext, RotationDecision, RotationPolicy, SkipReason};
pub use sidecar::{DockerSidecar, SidecarController, SidecarState};
pub use supervisor::{Launcher, ProcessOutcome, ProcessSupervisor};

// Collaborators
pub use credentials::{Account, CredentialStore, FileCredentialStore};
pub use git::{GitEnvironments, GitMirror};
pub use log::LogStream;
pub use notify::{BusNotifier, NoopNotifier, Notifier};
pub use probe::RateLimitProbe;
pub use registry::{RunHandle, RunRegistry};

// Command execution
pub use command::{CommandError, CommandOutput, HostCommand};
