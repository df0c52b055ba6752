pub mod events;
pub mod lifecycle;
pub mod models;
pub mod settings;
pub mod waveform;
