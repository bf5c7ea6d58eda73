//! AWS Bedrock Runtime adapter via the Converse API.
//!
//! Only available behind the `bedrock` cargo feature, which pulls the AWS
//! SDK. Credentials come from the standard AWS chain (env vars, profiles,
//! IAM roles); no API key is involved. The Converse API is model-agnostic,
//! so the same translation serves every Bedrock-hosted model family.
//!
//! The SDK owns the wire protocol here: this adapter only maps between the
//! canonical types and the SDK's request/response builders, and drains the
//! `ConverseStream` event receiver into canonical chunks.

use async_trait::async_trait;
use aws_sdk_bedrockruntime::primitives::event_stream::EventReceiver;
use aws_sdk_bedrockruntime::types::error::ConverseStreamOutputError;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ContentBlockDelta, ConversationRole, ConverseStreamOutput,
    InferenceConfiguration, Message as BedrockMessage, StopReason, SystemContentBlock,
};
use aws_sdk_bedrockruntime::Client;
use tracing::debug;

use crate::error::{LlmError, Result};
use crate::provider::{BoxChatStream, ChatCompletionStream, Provider};
use crate::types::{
    epoch_now, ChatCompletionChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChunkChoice, Message, ProviderMetadata, Role, Usage,
};

/// Default AWS region for Bedrock.
const DEFAULT_REGION: &str = "us-east-1";

/// AWS Bedrock backend adapter.
#[derive(Debug, Clone)]
pub struct BedrockProvider {
    client: Client,
    region: String,
}

impl BedrockProvider {
    /// Load ambient AWS credentials and build a Bedrock Runtime client.
    pub async fn new(region: Option<String>) -> Result<Self> {
        let region = region.unwrap_or_else(|| DEFAULT_REGION.to_string());
        let sdk_config = aws_config::from_env()
            .region(aws_config::Region::new(region.clone()))
            .load()
            .await;
        Ok(Self {
            client: Client::new(&sdk_config),
            region,
        })
    }

    /// Build from an existing SDK config (shared credential caches, test
    /// overrides).
    pub fn from_sdk_config(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
            region: sdk_config
                .region()
                .map(|r| r.to_string())
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        }
    }

    /// Configured region.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Split canonical messages into Converse messages and system blocks.
    fn convert_messages(
        messages: &[Message],
    ) -> Result<(Vec<BedrockMessage>, Vec<SystemContentBlock>)> {
        let mut converted = Vec::new();
        let mut system = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system.push(SystemContentBlock::Text(msg.content.clone())),
                Role::User | Role::Tool => converted.push(
                    BedrockMessage::builder()
                        .role(ConversationRole::User)
                        .content(ContentBlock::Text(msg.content.clone()))
                        .build()
                        .map_err(|err| LlmError::Provider(format!("bedrock message: {err}")))?,
                ),
                Role::Assistant => converted.push(
                    BedrockMessage::builder()
                        .role(ConversationRole::Assistant)
                        .content(ContentBlock::Text(msg.content.clone()))
                        .build()
                        .map_err(|err| LlmError::Provider(format!("bedrock message: {err}")))?,
                ),
            }
        }

        Ok((converted, system))
    }

    fn inference_config(req: &ChatCompletionRequest) -> Option<InferenceConfiguration> {
        if req.max_tokens.is_none()
            && req.temperature.is_none()
            && req.top_p.is_none()
            && req.stop.is_none()
        {
            return None;
        }
        let mut builder = InferenceConfiguration::builder();
        if let Some(max) = req.max_tokens {
            builder = builder.max_tokens(max as i32);
        }
        if let Some(temperature) = req.temperature {
            builder = builder.temperature(temperature as f32);
        }
        if let Some(top_p) = req.top_p {
            builder = builder.top_p(top_p as f32);
        }
        if let Some(stop) = &req.stop {
            builder = builder.set_stop_sequences(Some(stop.clone()));
        }
        Some(builder.build())
    }

    fn map_stop_reason(reason: &StopReason) -> String {
        match reason {
            StopReason::EndTurn | StopReason::StopSequence => "stop".to_string(),
            StopReason::MaxTokens => "length".to_string(),
            StopReason::ToolUse => "tool_calls".to_string(),
            StopReason::ContentFiltered | StopReason::GuardrailIntervened => {
                "content_filter".to_string()
            }
            other => other.as_str().to_string(),
        }
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        "bedrock"
    }

    async fn create_chat_completion(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        req.validate()?;

        let (messages, system) = Self::convert_messages(&req.messages)?;

        debug!(model = %req.model, region = %self.region, "bedrock converse request");

        let mut request = self.client.converse().model_id(&req.model);
        for msg in messages {
            request = request.messages(msg);
        }
        for block in system {
            request = request.system(block);
        }
        if let Some(config) = Self::inference_config(req) {
            request = request.inference_config(config);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Provider(format!("bedrock converse: {err}")))?;

        let content = response
            .output()
            .and_then(|output| output.as_message().ok())
            .map(|message| {
                message
                    .content()
                    .iter()
                    .filter_map(|block| block.as_text().ok().cloned())
                    .collect::<String>()
            })
            .unwrap_or_default();

        let usage = response
            .usage()
            .map(|u| Usage::new(u.input_tokens() as u32, u.output_tokens() as u32))
            .unwrap_or_default();

        let finish_reason = Self::map_stop_reason(response.stop_reason());

        Ok(ChatCompletionResponse {
            id: format!("bedrock-{}", epoch_now()),
            object: "chat.completion".to_string(),
            created: epoch_now(),
            model: req.model.clone(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: Some(finish_reason),
                logprobs: None,
            }],
            usage,
            provider_metadata: ProviderMetadata::new(),
        })
    }

    async fn create_chat_completion_stream(
        &self,
        req: &ChatCompletionRequest,
    ) -> Result<BoxChatStream> {
        req.validate()?;

        let (messages, system) = Self::convert_messages(&req.messages)?;

        debug!(model = %req.model, region = %self.region, "bedrock converse stream request");

        let mut request = self.client.converse_stream().model_id(&req.model);
        for msg in messages {
            request = request.messages(msg);
        }
        for block in system {
            request = request.system(block);
        }
        if let Some(config) = Self::inference_config(req) {
            request = request.inference_config(config);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Provider(format!("bedrock converse stream: {err}")))?;

        Ok(Box::new(BedrockStream {
            receiver: Some(response.stream),
            stream_id: format!("bedrock-stream-{}", epoch_now()),
            model: req.model.clone(),
        }))
    }
}

/// Stream over the Converse event receiver.
struct BedrockStream {
    receiver: Option<EventReceiver<ConverseStreamOutput, ConverseStreamOutputError>>,
    stream_id: String,
    model: String,
}

impl BedrockStream {
    fn chunk(&self, choices: Vec<ChunkChoice>, usage: Option<Usage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.stream_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: epoch_now(),
            model: self.model.clone(),
            choices,
            usage,
            provider_metadata: ProviderMetadata::new(),
        }
    }
}

#[async_trait]
impl ChatCompletionStream for BedrockStream {
    async fn recv(&mut self) -> Result<Option<ChatCompletionChunk>> {
        if self.receiver.is_none() {
            return Err(LlmError::StreamClosed);
        }

        loop {
            let event = match self.receiver.as_mut() {
                Some(receiver) => receiver
                    .recv()
                    .await
                    .map_err(|err| LlmError::Provider(format!("bedrock stream: {err}")))?,
                None => return Err(LlmError::StreamClosed),
            };

            match event {
                None => return Ok(None),
                Some(ConverseStreamOutput::ContentBlockDelta(delta_event)) => {
                    if let Some(ContentBlockDelta::Text(text)) = delta_event.delta() {
                        let choice = ChunkChoice {
                            index: 0,
                            delta: Some(Message::assistant(text.clone())),
                            finish_reason: None,
                        };
                        return Ok(Some(self.chunk(vec![choice], None)));
                    }
                }
                Some(ConverseStreamOutput::MessageStop(stop_event)) => {
                    let choice = ChunkChoice {
                        index: 0,
                        delta: None,
                        finish_reason: Some(BedrockProvider::map_stop_reason(
                            stop_event.stop_reason(),
                        )),
                    };
                    return Ok(Some(self.chunk(vec![choice], None)));
                }
                Some(ConverseStreamOutput::Metadata(metadata_event)) => {
                    if let Some(usage) = metadata_event.usage() {
                        let usage =
                            Usage::new(usage.input_tokens() as u32, usage.output_tokens() as u32);
                        return Ok(Some(self.chunk(Vec::new(), Some(usage))));
                    }
                }
                // MessageStart, ContentBlockStart, ContentBlockStop.
                Some(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.receiver = None;
        Ok(())
    }
}
