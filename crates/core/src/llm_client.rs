use crate::message::{ContentBlock, Message};
use anyhow::Result;
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionStreamResponseDelta, ChatCompletionTool, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, FunctionCall,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use std::pin::Pin;

/// Represents the events that can be yielded from a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum LLMStreamEvent {
    TextChunk(String),
    /// A fragment of a tool call. Fragments sharing an `index` belong to the same call;
    /// `id` and `name` arrive once, `arguments` is split across fragments.
    ToolCallChunk {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
}

/// A stream of events from the LLM.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<LLMStreamEvent, OpenAIError>> + Send>>;

/// A generic client for interacting with an LLM.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Starts a streaming completion over the full request history.
    async fn stream_chat(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LLMStream>;
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn stream_chat(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        tools: Vec<ChatCompletionTool>,
    ) -> Result<LLMStream> {
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(messages).stream(true);
        if !tools.is_empty() {
            args.tools(tools).tool_choice("auto");
        }
        let request = args.build()?;

        let stream = self.client.chat().create_stream(request).await?;

        Ok(Box::pin(stream.flat_map(|result| {
            let events = match result {
                Ok(response) => response
                    .choices
                    .into_iter()
                    .next()
                    .map(|choice| events_from_delta(choice.delta))
                    .unwrap_or_default()
                    .into_iter()
                    .map(Ok)
                    .collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(events)
        })))
    }
}

fn events_from_delta(delta: ChatCompletionStreamResponseDelta) -> Vec<LLMStreamEvent> {
    let mut events = Vec::new();
    if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
        events.push(LLMStreamEvent::TextChunk(content));
    }
    for chunk in delta.tool_calls.unwrap_or_default() {
        let (name, arguments) = chunk
            .function
            .map(|f| (f.name, f.arguments.unwrap_or_default()))
            .unwrap_or_default();
        events.push(LLMStreamEvent::ToolCallChunk {
            index: chunk.index,
            id: chunk.id,
            name,
            arguments,
        });
    }
    events
}

/// Builds the request history: the system prompt followed by the conversation.
///
/// Assistant messages with neither text nor tool calls (errors, empty aborts) are left out
/// since the API rejects them.
pub fn to_request_messages(
    system_prompt: &str,
    messages: &[Message],
) -> Result<Vec<ChatCompletionRequestMessage>> {
    let mut request = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        request.push(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt)
                .build()?
                .into(),
        );
    }

    for message in messages {
        match message {
            Message::User { .. } => request.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(message.text())
                    .build()?
                    .into(),
            ),
            Message::Assistant { content, .. } => {
                let text = message.text();
                let tool_calls: Vec<ChatCompletionMessageToolCall> = content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                        } => Some(ChatCompletionMessageToolCall {
                            id: id.clone(),
                            r#type: ChatCompletionToolType::Function,
                            function: FunctionCall {
                                name: name.clone(),
                                arguments: arguments.to_string(),
                            },
                        }),
                        ContentBlock::Text { .. } => None,
                    })
                    .collect();
                if text.is_empty() && tool_calls.is_empty() {
                    continue;
                }

                let mut args = ChatCompletionRequestAssistantMessageArgs::default();
                if !text.is_empty() {
                    args.content(text);
                }
                if !tool_calls.is_empty() {
                    args.tool_calls(tool_calls);
                }
                request.push(args.build()?.into());
            }
            Message::ToolResult { tool_call_id, .. } => request.push(
                ChatCompletionRequestToolMessageArgs::default()
                    .content(message.text())
                    .tool_call_id(tool_call_id.clone())
                    .build()?
                    .into(),
            ),
        }
    }
    Ok(request)
}
