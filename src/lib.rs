//! Visual question answering over a vision-language model.
//!
//! An [`Analyzer`] turns an image and a question into a prompt, runs deterministic
//! generation and cuts the decoded text into an answer. The same analyzer backs the batch
//! command line tool ([`batch`]), the HTTP service ([`server`], through an [`Engine`]) and
//! the interactive console ([`chat`]).

pub mod analyzer;
pub mod artifact;
pub mod batch;
pub mod chat;
pub mod engine;
pub mod error;
pub mod generation;
pub mod image_io;
pub mod model;
pub mod paligemma;
pub mod preprocess;
pub mod prompt;
pub mod server;
pub mod stopping;

pub use analyzer::{Analyzer, AnalyzerConfig, TruncationPolicy};
pub use engine::{AnalyzeRequest, AnalyzeResponse, Engine, EngineState};
pub use error::VqaError;
pub use generation::GenerationConfig;
pub use model::VisionLanguageModel;
pub use prompt::PromptTemplate;
