pub mod batch;
pub mod configs;
pub mod languages;
pub mod prompts;
pub mod responses;
pub mod sessions;
pub mod tones;
pub mod translators;
pub mod transport;
