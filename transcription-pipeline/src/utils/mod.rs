pub mod audio_transcription;
pub mod summarization;
