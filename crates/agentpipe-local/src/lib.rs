pub mod extract;
pub mod format;
pub mod logging;
pub mod openai_compat;
pub mod pipeline;
pub mod render;
pub mod retry;
pub mod search;
pub mod tools;

#[cfg(feature = "chrome")]
pub mod chrome;

#[cfg(feature = "chrome")]
pub use chrome::ChromeDriver;
pub use logging::TracingLogger;
pub use openai_compat::OpenAiCompatRuntime;
pub use pipeline::Pipeline;
pub use render::{launch_guidance, FetchError, HttpDriver, PageFetcher};
pub use search::TavilyClient;
pub use tools::{Tool, ToolSet};

/// Trimmed, non-empty environment value.
pub(crate) fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
