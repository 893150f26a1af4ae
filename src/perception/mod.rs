pub mod annotator;
pub mod ccoeff;
pub mod keyword;
pub mod screen_analyzer;
pub mod template;
pub mod traits;
pub mod types;

pub use screen_analyzer::ScreenAnalyzer;
pub use template::{TemplateLibrary, TemplateMatcher};
pub use traits::ScreenParser;
