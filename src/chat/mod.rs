//! Streaming completion client for chat and one-shot generation.
//!
//! Events are forwarded through a channel-backed stream so consumers
//! receive tokens as the model produces them. One request runs at a
//! time: a second call while one is in flight is rejected immediately,
//! and [`CompletionClient::cancel_chat`] aborts the active one.

use crate::config::ChatConfig;
use crate::context::{AiContext, build_contextual_system_prompt};
use crate::error::{Result, RuntimeError};
use crate::ndjson::StreamDecoder;
use crate::retry::classify_reqwest_error;
use crate::server::ServerSupervisor;
use base64::Engine as _;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Stream of chat events, ending after the final record or an error.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatEvent>> + Send>>;

/// Stream of response text fragments from one-shot generation.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Base64-encoded images for vision models.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            images: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            images: None,
        }
    }

    /// Attach base64-encoded images to this message.
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = Some(images);
        self
    }

    fn has_images(&self) -> bool {
        self.images.as_ref().is_some_and(|imgs| !imgs.is_empty())
    }
}

/// A chat request before wire encoding.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tool definitions passed through to the server verbatim.
    pub tools: Option<serde_json::Value>,
    /// Browsing context woven into the first user message.
    pub context: Option<AiContext>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            context: None,
        }
    }

    pub fn with_tools(mut self, tools: serde_json::Value) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_context(mut self, context: AiContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// A one-shot generation request before wire encoding.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    /// Base64-encoded images for vision models.
    pub images: Option<Vec<String>>,
    /// System prompt; combined with `context` when both are set.
    pub system: Option<String>,
    pub context: Option<AiContext>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            images: None,
            system: None,
            context: None,
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_context(mut self, context: AiContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// One event from a chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A fragment of assistant text.
    Token(String),
    /// A batch of tool invocations requested by the model.
    ToolCalls(Vec<ToolCall>),
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: ToolFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    /// Arguments as the model produced them, left undecoded.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Wire body for `POST /api/chat`.
#[derive(Debug, Serialize)]
struct ChatWireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a serde_json::Value>,
}

/// Wire body for `POST /api/generate`.
#[derive(Debug, Serialize)]
struct GenerateWireRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
}

/// One NDJSON record from `POST /api/chat`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatRecord {
    message: Option<ChatRecordMessage>,
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatRecordMessage {
    content: String,
    tool_calls: Option<Vec<ToolCall>>,
}

/// One NDJSON record from `POST /api/generate`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateRecord {
    response: String,
    done: bool,
    error: Option<String>,
}

/// Encode raw image bytes for the `images` message field.
pub fn encode_image(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// The single in-flight request slot, generation-stamped.
///
/// Generations keep a finished task's cleanup from clearing a successor
/// installed after `cancel_chat` freed the slot. `try_begin` reserves
/// the slot and `install` fills in the task handle, both under the one
/// lock, so two callers can never both hold a reservation: the slot is
/// occupied from the moment the first reservation succeeds.
#[derive(Debug, Default, Clone)]
struct ActiveRequest {
    slot: Arc<Mutex<Slot>>,
}

/// A reserved slot holds `None` until the spawned task is installed;
/// a reservation counts as in-flight either way.
#[derive(Debug, Default)]
struct Slot {
    next_generation: u64,
    current: Option<(u64, Option<JoinHandle<()>>)>,
}

impl ActiveRequest {
    /// Reserve the slot, failing when a request is reserved or running.
    fn try_begin(&self) -> Result<u64> {
        let mut slot = self.lock();
        let finished =
            matches!(&slot.current, Some((_, Some(handle))) if handle.is_finished());
        if finished {
            slot.current = None;
        } else if slot.current.is_some() {
            return Err(RuntimeError::RequestInFlight);
        }
        slot.next_generation += 1;
        let generation = slot.next_generation;
        slot.current = Some((generation, None));
        Ok(generation)
    }

    /// Fill the reservation made under `generation` with its task.
    ///
    /// When the reservation is gone (cancelled before the task was
    /// installed), the task is aborted instead: the cancel already
    /// covered it.
    fn install(&self, generation: u64, handle: JoinHandle<()>) {
        let mut slot = self.lock();
        if let Some((held, task)) = slot.current.as_mut()
            && *held == generation
        {
            *task = Some(handle);
        } else {
            handle.abort();
        }
    }

    /// Clear the slot if it still holds `generation`.
    fn clear(&self, generation: u64) {
        let mut slot = self.lock();
        if slot.current.as_ref().is_some_and(|(g, _)| *g == generation) {
            slot.current = None;
        }
    }

    /// Abort the active request; returns whether one was reserved.
    fn cancel(&self) -> bool {
        let taken = self.lock().current.take();
        match taken {
            Some((_, Some(handle))) => {
                handle.abort();
                true
            }
            Some((_, None)) => true,
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Client for streaming chat and one-shot generation.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    config: ChatConfig,
    supervisor: Arc<ServerSupervisor>,
    client: reqwest::Client,
    active: ActiveRequest,
}

impl CompletionClient {
    /// Create a completion client sharing `supervisor` for readiness checks.
    pub fn new(config: ChatConfig, supervisor: Arc<ServerSupervisor>) -> Self {
        Self {
            config,
            supervisor,
            client: reqwest::Client::new(),
            active: ActiveRequest::default(),
        }
    }

    fn base_url(&self) -> String {
        self.supervisor.config().base_url()
    }

    /// The request deadline, stretched for vision requests.
    fn request_timeout(&self, with_images: bool) -> Duration {
        if with_images {
            Duration::from_secs(self.config.vision_request_timeout_secs)
        } else {
            Duration::from_secs(self.config.request_timeout_secs)
        }
    }

    /// Start a streaming chat request.
    ///
    /// When the request carries context, the composed context block is
    /// prepended to the first user message before sending.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidRequest`] for an empty model or
    /// message list and [`RuntimeError::RequestInFlight`] when another
    /// request is active, both before any network traffic.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatStream> {
        if request.model.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest("model name is empty".into()));
        }
        if request.messages.is_empty() {
            return Err(RuntimeError::InvalidRequest("no messages provided".into()));
        }

        let mut messages = request.messages;
        if let Some(context) = &request.context {
            weave_context(&mut messages, context);
        }
        let timeout = self.request_timeout(messages.iter().any(ChatMessage::has_images));
        let generation = self.active.try_begin()?;

        let (tx, rx) = mpsc::channel::<Result<ChatEvent>>(64);
        let client = self.client.clone();
        let supervisor = Arc::clone(&self.supervisor);
        let url = format!("{}/api/chat", self.base_url());
        let model = request.model;
        let tools = request.tools;
        let families = self.config.aggressive_model_families.clone();
        let active = self.active.clone();

        let task = tokio::spawn(async move {
            let request_id = uuid::Uuid::new_v4().to_string();
            debug!(request_id = %request_id, model = %model, "starting chat request");
            forward_chat(client, supervisor, url, model, messages, tools, families, timeout, tx)
                .await;
            active.clear(generation);
        });
        self.active.install(generation, task);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Start a one-shot generation request, streaming response text.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidRequest`] for an empty model or
    /// prompt and [`RuntimeError::RequestInFlight`] when another request
    /// is active.
    pub async fn generate(&self, request: GenerateRequest) -> Result<TokenStream> {
        if request.model.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest("model name is empty".into()));
        }
        if request.prompt.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest("prompt is empty".into()));
        }

        let system = match &request.context {
            Some(context) => {
                let composed = build_contextual_system_prompt(request.system.as_deref(), context);
                (!composed.is_empty()).then_some(composed)
            }
            None => request.system.clone(),
        };
        let with_images = request.images.as_ref().is_some_and(|imgs| !imgs.is_empty());
        let timeout = self.request_timeout(with_images);
        let generation = self.active.try_begin()?;

        let (tx, rx) = mpsc::channel::<Result<String>>(64);
        let client = self.client.clone();
        let supervisor = Arc::clone(&self.supervisor);
        let url = format!("{}/api/generate", self.base_url());
        let active = self.active.clone();

        let task = tokio::spawn(async move {
            let request_id = uuid::Uuid::new_v4().to_string();
            debug!(request_id = %request_id, model = %request.model, "starting generate request");
            forward_generate(client, supervisor, url, request, system, timeout, tx).await;
            active.clear(generation);
        });
        self.active.install(generation, task);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Abort the in-flight request, if any.
    ///
    /// The consumer's stream ends without a further item. Calling this
    /// while idle is a no-op.
    pub fn cancel_chat(&self) -> bool {
        let cancelled = self.active.cancel();
        if cancelled {
            debug!("cancelled in-flight completion request");
        }
        cancelled
    }
}

/// Prepend the composed context block to the first user message.
///
/// Conversations without a user message are left unchanged; dropping
/// the context beats inventing a message the caller never wrote.
fn weave_context(messages: &mut [ChatMessage], context: &AiContext) {
    let block = build_contextual_system_prompt(None, context);
    if block.is_empty() {
        return;
    }
    match messages.iter_mut().find(|m| m.role == Role::User) {
        Some(first_user) => {
            first_user.content = format!("{block}\n\n{}", first_user.content);
        }
        None => debug!("no user message to carry context, dropping it"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward_chat(
    client: reqwest::Client,
    supervisor: Arc<ServerSupervisor>,
    url: String,
    model: String,
    messages: Vec<ChatMessage>,
    tools: Option<serde_json::Value>,
    aggressive_families: Vec<String>,
    timeout: Duration,
    tx: mpsc::Sender<Result<ChatEvent>>,
) {
    if let Err(e) = supervisor.ensure_running().await {
        let _ = tx.send(Err(e)).await;
        return;
    }

    let body = ChatWireRequest {
        model: &model,
        messages: &messages,
        stream: true,
        tools: tools.as_ref(),
    };
    let response = match client.post(&url).json(&body).timeout(timeout).send().await {
        Ok(resp) => resp,
        Err(e) => {
            let _ = tx.send(Err(classify_reqwest_error(&e))).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        let _ = tx
            .send(Err(RuntimeError::HttpStatus {
                status: status.as_u16(),
                detail,
            }))
            .await;
        return;
    }

    let mut decoder = StreamDecoder::for_model(&model, &aggressive_families);
    let mut bytes = response.bytes_stream();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(classify_reqwest_error(&e))).await;
                return;
            }
        };
        for text in decoder.push(&chunk) {
            match emit_chat_record(&text, &tx).await {
                RecordOutcome::Continue => {}
                RecordOutcome::Finished => return,
            }
        }
    }

    // Aggressive decoding can leave a final record in the buffer when
    // the stream closes without a trailing newline.
    if let Some(text) = decoder.flush() {
        let _ = emit_chat_record(&text, &tx).await;
    }
}

enum RecordOutcome {
    Continue,
    Finished,
}

async fn emit_chat_record(text: &str, tx: &mpsc::Sender<Result<ChatEvent>>) -> RecordOutcome {
    let Ok(record) = serde_json::from_str::<ChatRecord>(text) else {
        debug!("skipping undecodable chat record");
        return RecordOutcome::Continue;
    };
    if let Some(error) = record.error
        && !error.is_empty()
    {
        warn!(error = %error, "chat stream reported an error");
        let _ = tx.send(Err(RuntimeError::Protocol(error))).await;
        return RecordOutcome::Finished;
    }
    if let Some(message) = record.message {
        if let Some(calls) = message.tool_calls
            && !calls.is_empty()
            && tx.send(Ok(ChatEvent::ToolCalls(calls))).await.is_err()
        {
            return RecordOutcome::Finished;
        }
        if !message.content.is_empty()
            && tx
                .send(Ok(ChatEvent::Token(message.content)))
                .await
                .is_err()
        {
            return RecordOutcome::Finished;
        }
    }
    if record.done {
        RecordOutcome::Finished
    } else {
        RecordOutcome::Continue
    }
}

async fn forward_generate(
    client: reqwest::Client,
    supervisor: Arc<ServerSupervisor>,
    url: String,
    request: GenerateRequest,
    system: Option<String>,
    timeout: Duration,
    tx: mpsc::Sender<Result<String>>,
) {
    if let Err(e) = supervisor.ensure_running().await {
        let _ = tx.send(Err(e)).await;
        return;
    }

    let body = GenerateWireRequest {
        model: &request.model,
        prompt: &request.prompt,
        stream: true,
        images: request.images.as_deref(),
        system: system.as_deref(),
    };
    let response = match client.post(&url).json(&body).timeout(timeout).send().await {
        Ok(resp) => resp,
        Err(e) => {
            let _ = tx.send(Err(classify_reqwest_error(&e))).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        let _ = tx
            .send(Err(RuntimeError::HttpStatus {
                status: status.as_u16(),
                detail,
            }))
            .await;
        return;
    }

    let mut decoder = StreamDecoder::for_model(&request.model, &[]);
    let mut bytes = response.bytes_stream();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(classify_reqwest_error(&e))).await;
                return;
            }
        };
        for text in decoder.push(&chunk) {
            match emit_generate_record(&text, &tx).await {
                RecordOutcome::Continue => {}
                RecordOutcome::Finished => return,
            }
        }
    }

    if let Some(text) = decoder.flush() {
        let _ = emit_generate_record(&text, &tx).await;
    }
}

async fn emit_generate_record(text: &str, tx: &mpsc::Sender<Result<String>>) -> RecordOutcome {
    let Ok(record) = serde_json::from_str::<GenerateRecord>(text) else {
        debug!("skipping undecodable generate record");
        return RecordOutcome::Continue;
    };
    if let Some(error) = record.error
        && !error.is_empty()
    {
        warn!(error = %error, "generate stream reported an error");
        let _ = tx.send(Err(RuntimeError::Protocol(error))).await;
        return RecordOutcome::Finished;
    }
    if !record.response.is_empty() && tx.send(Ok(record.response)).await.is_err() {
        return RecordOutcome::Finished;
    }
    if record.done {
        RecordOutcome::Finished
    } else {
        RecordOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::ServerConfig;
    use crate::context::PageContext;

    fn test_client() -> CompletionClient {
        let supervisor = Arc::new(ServerSupervisor::new(ServerConfig::default()));
        CompletionClient::new(ChatConfig::default(), supervisor)
    }

    fn context_with_page() -> AiContext {
        AiContext {
            page: Some(PageContext {
                url: Some("https://example.com".into()),
                title: Some("Example".into()),
                content: None,
                selected_text: None,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn chat_rejects_empty_model() {
        let client = test_client();
        let result = client
            .chat(ChatRequest::new("  ", vec![ChatMessage::user("hi")]))
            .await;
        assert!(matches!(result, Err(RuntimeError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn chat_rejects_empty_messages() {
        let client = test_client();
        let result = client.chat(ChatRequest::new("llama3.2", Vec::new())).await;
        assert!(matches!(result, Err(RuntimeError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn generate_rejects_empty_prompt() {
        let client = test_client();
        let result = client.generate(GenerateRequest::new("llama3.2", " ")).await;
        assert!(matches!(result, Err(RuntimeError::InvalidRequest(_))));
    }

    #[test]
    fn cancel_while_idle_is_noop() {
        let client = test_client();
        assert!(!client.cancel_chat());
    }

    #[test]
    fn weave_context_prepends_to_first_user_message() {
        let mut messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("what is this page?"),
            ChatMessage::assistant("let me look"),
            ChatMessage::user("thanks"),
        ];
        weave_context(&mut messages, &context_with_page());

        assert_eq!(messages[0].content, "be brief");
        assert!(messages[1].content.starts_with("## Current Page"));
        assert!(messages[1].content.ends_with("what is this page?"));
        assert_eq!(messages[3].content, "thanks");
    }

    #[test]
    fn weave_context_ignores_empty_context() {
        let mut messages = vec![ChatMessage::user("hello")];
        weave_context(&mut messages, &AiContext::default());
        assert_eq!(messages[0].content, "hello");
    }

    #[test]
    fn weave_context_without_user_message_changes_nothing() {
        let mut messages = vec![ChatMessage::system("be brief")];
        weave_context(&mut messages, &context_with_page());
        assert_eq!(messages[0].content, "be brief");
    }

    #[test]
    fn timeout_stretches_for_vision_requests() {
        let client = test_client();
        assert_eq!(client.request_timeout(false), Duration::from_secs(60));
        assert_eq!(client.request_timeout(true), Duration::from_secs(300));
    }

    #[test]
    fn chat_wire_request_omits_absent_tools() {
        let messages = vec![ChatMessage::user("hi")];
        let body = ChatWireRequest {
            model: "llama3.2",
            messages: &messages,
            stream: true,
            tools: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["messages"][0]["role"], "user");
        assert!(json.get("tools").is_none());
        assert!(json["messages"][0].get("images").is_none());
    }

    #[test]
    fn chat_record_parses_tool_calls() {
        let json = r#"{
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "get_weather", "arguments": {"city": "Oslo"}}}
                ]
            },
            "done": false
        }"#;
        let record: ChatRecord = serde_json::from_str(json).unwrap();
        let message = record.message.unwrap();
        let calls = message.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments["city"], "Oslo");
    }

    #[test]
    fn generate_record_defaults_tolerate_sparse_json() {
        let record: GenerateRecord = serde_json::from_str(r#"{"done":true}"#).unwrap();
        assert!(record.done);
        assert!(record.response.is_empty());
        assert!(record.error.is_none());
    }

    #[test]
    fn encode_image_is_standard_base64() {
        assert_eq!(encode_image(b"hello"), "aGVsbG8=");
        assert_eq!(encode_image(b""), "");
    }

    #[tokio::test]
    async fn reservation_counts_as_in_flight_before_install() {
        let active = ActiveRequest::default();
        // A reservation with no task installed yet must already occupy
        // the slot; otherwise two callers could both pass admission and
        // the second install would strand the first task.
        let _generation = active.try_begin().unwrap();
        assert!(matches!(
            active.try_begin(),
            Err(RuntimeError::RequestInFlight)
        ));
        assert!(active.cancel());
        assert!(active.try_begin().is_ok());
    }

    #[tokio::test]
    async fn install_after_cancel_aborts_the_late_task() {
        let active = ActiveRequest::default();
        let generation = active.try_begin().unwrap();
        assert!(active.cancel());

        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        active.install(generation, handle);

        // The cancelled reservation must not resurrect; the slot stays
        // free for the next request.
        assert!(active.try_begin().is_ok());
    }

    #[tokio::test]
    async fn active_slot_rejects_second_reservation() {
        let active = ActiveRequest::default();
        let generation = active.try_begin().unwrap();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        active.install(generation, handle);

        assert!(matches!(
            active.try_begin(),
            Err(RuntimeError::RequestInFlight)
        ));
        assert!(active.cancel());
        // The slot is free again once cancelled.
        assert!(active.try_begin().is_ok());
    }

    #[tokio::test]
    async fn stale_clear_leaves_successor_installed() {
        let active = ActiveRequest::default();
        let first = active.try_begin().unwrap();
        active.install(first, tokio::spawn(async {}));
        active.cancel();

        let second = active.try_begin().unwrap();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        active.install(second, handle);

        // A late clear from the first request must not free the slot.
        active.clear(first);
        assert!(matches!(
            active.try_begin(),
            Err(RuntimeError::RequestInFlight)
        ));
        active.cancel();
    }
}
