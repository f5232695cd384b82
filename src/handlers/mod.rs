pub mod transcriptions;

pub use transcriptions::create_transcription;
