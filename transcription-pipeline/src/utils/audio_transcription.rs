use async_openai::types::{AudioInput, AudioResponseFormat, CreateTranscriptionRequestArgs};
use bytes::Bytes;
use common::error::AppError;
use serde::{Deserialize, Serialize};

/// A single timed span of the transcript, kept alongside the plain text so
/// clients can align the transcript with playback positions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptSegment {
    pub start: f32,
    pub end: f32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
}

/// Transcribes audio bytes using the configured speech-to-text model. The
/// verbose response format is requested so segment timings come back with the
/// text.
pub async fn transcribe_audio(
    openai_client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    model: &str,
    file_name: &str,
    audio: Bytes,
) -> Result<Transcription, AppError> {
    let request = CreateTranscriptionRequestArgs::default()
        .file(AudioInput::from_bytes(file_name.to_string(), audio))
        .model(model)
        .response_format(AudioResponseFormat::VerboseJson)
        .build()?;

    let response = openai_client
        .audio()
        .transcribe_verbose_json(request)
        .await
        .map_err(|e| AppError::Processing(format!("Audio transcription failed: {}", e)))?;

    let segments = response
        .segments
        .unwrap_or_default()
        .into_iter()
        .map(|s| TranscriptSegment {
            start: s.start,
            end: s.end,
            text: s.text,
        })
        .collect();

    Ok(Transcription {
        text: response.text,
        segments,
    })
}
