use async_openai::{
    error::OpenAIError,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
};
use common::error::AppError;

pub static SUMMARY_SYSTEM_MESSAGE: &str = "You summarize transcripts of audio recordings. \
Produce a concise markdown summary with a short opening paragraph followed by bullet points \
covering the key topics, decisions, and action items. Do not invent content that is not \
present in the transcript.";

pub fn create_user_message(file_name: &str, transcript: &str) -> String {
    format!(
        r"
        Recording: {file_name}

        Transcript:
        ==================
        {transcript}
        ==================

        Summarize the transcript above.
        "
    )
}

pub fn create_summary_request(
    model: &str,
    file_name: &str,
    transcript: &str,
) -> Result<CreateChatCompletionRequest, OpenAIError> {
    CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages([
            ChatCompletionRequestSystemMessage::from(SUMMARY_SYSTEM_MESSAGE).into(),
            ChatCompletionRequestUserMessage::from(create_user_message(file_name, transcript))
                .into(),
        ])
        .build()
}

pub async fn summarize_transcript(
    openai_client: &async_openai::Client<async_openai::config::OpenAIConfig>,
    model: &str,
    file_name: &str,
    transcript: &str,
) -> Result<String, AppError> {
    let request = create_summary_request(model, file_name, transcript)?;

    let response = openai_client
        .chat()
        .create(request)
        .await
        .map_err(|e| AppError::Processing(format!("Summary generation failed: {}", e)))?;

    response
        .choices
        .first()
        .and_then(|choice| choice.message.content.clone())
        .ok_or_else(|| AppError::Processing("No content found in summary response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_embeds_transcript_and_file_name() {
        let message = create_user_message("standup.wav", "we shipped the release");
        assert!(message.contains("standup.wav"));
        assert!(message.contains("we shipped the release"));
    }

    #[test]
    fn summary_request_builds_with_two_messages() {
        let request = create_summary_request("gpt-4o-mini", "standup.wav", "hello")
            .expect("request builds");
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.len(), 2);
    }
}
