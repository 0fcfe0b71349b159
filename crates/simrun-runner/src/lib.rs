//! simrun Task Runner Library
//!
//! Accepts batches of simulation configurations from execution controllers,
//! queues them in submission order and runs each one in two phases
//! (initialize, then run), either in this process or on hosts booked
//! through a master server.

pub mod callback;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod handler;
pub mod storage;
pub mod task_runner;

pub use callback::create_callback_router;
pub use client::HttpCoordinatorClient;
pub use config::RunnerConfig;
pub use controller::{CollectingController, ExecutionController};
pub use error::{RunnerError, StorageError};
pub use executor::{ConfigurationExecutor, HandlerExecutor};
pub use handler::InitializedComputationTask;
pub use storage::{DataStorage, DataStorageFactory, InMemoryStorage, InMemoryStorageFactory};
pub use task_runner::{ErrorHook, TaskRunner, TaskRunnerBuilder};
