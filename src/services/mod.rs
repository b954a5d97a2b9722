pub mod alias;
pub mod attribution;
pub mod cache;
pub mod chunker;
pub mod llm;
pub mod merger;
pub mod pipeline;
pub mod synthesizer;
pub mod tts;
pub mod workflow;
