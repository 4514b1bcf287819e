//! Model provider clients: the Gemini `generateContent` HTTP client used in
//! production and a scripted replay client for tests and offline runs.
//!
//! Clients only transport and classify; they never retry and never interpret
//! the model text. Parsing untrusted output is the planner's job.

mod gemini;
mod scripted;

pub use gemini::GeminiClient;
pub use scripted::ScriptedProvider;
