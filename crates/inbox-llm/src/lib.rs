pub mod gemini;
pub mod heuristics;
pub mod mock;
pub mod parse;
pub mod prompt;

pub use gemini::{GeminiClassifier, GeminiConfig};
pub use mock::{MockClassifier, MockResponse};
pub use prompt::OwnerContext;
