pub mod ollama;
pub mod parser;
pub mod prompts;
pub mod provider;
pub mod screen_parser;
pub mod types;

pub use ollama::OllamaClient;
pub use provider::VisionModel;
pub use types::VlmResult;
