pub mod cancellation;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod history;
pub mod llm;
pub mod orchestrator;
pub mod repair;
pub mod sessions;

pub use cancellation::*;
pub use config::*;
pub use emitter::*;
pub use engine::*;
pub use error::*;
pub use history::*;
pub use llm::*;
pub use orchestrator::*;
pub use repair::*;
pub use sessions::*;
