//! Chart histories and the recording session.
pub mod history;
pub mod recording;
