//! Conversation driver: turns final transcripts into ordered speech segments.
//!
//! The driver owns the conversation context and the per-conversation segment
//! index counter. One completion runs at a time; the re-entrant
//! function-call path is an explicit phase machine (AwaitingModel →
//! AwaitingTool → AwaitingModel → Done) rather than call-stack recursion, so
//! bookkeeping stays inspectable.

use crate::error::BridgeResult;
use crate::llm::{ChatTurn, CompletionEvent, FunctionCall, LlmBackend, ToolSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Marker the model is prompted to insert at natural pauses; every occurrence
/// cuts a segment so synthesis can start before the reply is complete.
pub const SEGMENT_BOUNDARY: char = '\u{2022}';

/// A cut piece of reply text on its way to the TTS collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    /// Position in the generation order, or `None` to play immediately.
    pub index: Option<u64>,
    pub text: String,
    pub utterance: u32,
}

/// A side-effecting function the model may invoke mid-completion.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn invoke(&self, args: serde_json::Value) -> BridgeResult<String>;
}

/// Name → implementation lookup, supplied at construction.
pub type ToolRegistry = HashMap<String, Arc<dyn Tool>>;

/// Best-effort repair of streamed function-call arguments.
///
/// The model occasionally returns two concatenated argument objects; the
/// first well-formed object wins. Whether that is legitimate model output or
/// an upstream parsing bug is unresolved, so the heuristic is preserved
/// as-is rather than silently tightened.
pub fn repair_function_args(raw: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str(raw) {
        return Some(value);
    }
    if raw.matches('{').count() > 1 {
        warn!("doubled function arguments, taking the first object: {raw}");
        let end = raw.find('}')?;
        return serde_json::from_str(raw.get(..=end)?).ok();
    }
    None
}

enum Phase {
    AwaitingModel,
    AwaitingTool(FunctionCall),
    Done,
}

/// Drives the LLM collaborator and cuts its streamed reply into indexed
/// segments for synthesis.
pub struct ConversationDriver {
    llm: Arc<dyn LlmBackend>,
    tools: Vec<ToolSpec>,
    registry: ToolRegistry,
    context: Vec<ChatTurn>,
    /// Per-conversation monotonic segment counter; distinct from the
    /// utterance counter.
    next_index: u64,
    synth_tx: mpsc::UnboundedSender<TextSegment>,
}

impl ConversationDriver {
    pub fn new(
        llm: Arc<dyn LlmBackend>,
        tools: Vec<ToolSpec>,
        registry: ToolRegistry,
        system_prompt: impl Into<String>,
        synth_tx: mpsc::UnboundedSender<TextSegment>,
    ) -> Self {
        Self {
            llm,
            tools,
            registry,
            context: vec![ChatTurn::system(system_prompt)],
            next_index: 0,
            synth_tx,
        }
    }

    /// Advance the conversation by one user turn: request a completion, cut
    /// segments at every boundary marker, run requested functions, and keep
    /// completing until the model finishes without one.
    pub async fn respond(&mut self, text: String, utterance: u32) {
        self.context.push(ChatTurn::user(text));
        let mut spoken = String::new();
        let mut phase = Phase::AwaitingModel;

        loop {
            phase = match phase {
                Phase::AwaitingModel => match self.run_completion(utterance, &mut spoken).await {
                    Some(call) => Phase::AwaitingTool(call),
                    None => Phase::Done,
                },
                Phase::AwaitingTool(call) => {
                    // Spoken acknowledgement first, at the unordered
                    // sentinel, so the caller is not left in silence while
                    // the function runs.
                    self.acknowledge(&call.name, utterance);
                    match self.run_tool(&call).await {
                        Some(result) => {
                            self.context.push(ChatTurn::function(call.name, result));
                            Phase::AwaitingModel
                        }
                        // The call was abandoned; the conversation continues
                        // without that side effect.
                        None => Phase::Done,
                    }
                }
                Phase::Done => break,
            };
        }

        if !spoken.is_empty() {
            self.context.push(ChatTurn::assistant(spoken));
        }
        debug!(turns = self.context.len(), "conversation context grew");
    }

    /// Stream one completion. Returns the terminal function call, if any.
    async fn run_completion(&mut self, utterance: u32, spoken: &mut String) -> Option<FunctionCall> {
        let mut events = match self.llm.stream_chat(&self.context, &self.tools).await {
            Ok(events) => events,
            Err(e) => {
                // Transient collaborator failure: the turn is dropped and the
                // conversation proceeds on the next transcript.
                warn!(utterance, "completion request failed: {e}");
                return None;
            }
        };

        let mut partial = String::new();
        let mut pending_call = None;
        while let Some(event) = events.recv().await {
            match event {
                CompletionEvent::Delta(content) => {
                    spoken.push_str(&content);
                    partial.push_str(&content);
                    while let Some(pos) = partial.find(SEGMENT_BOUNDARY) {
                        let rest = partial.split_off(pos + SEGMENT_BOUNDARY.len_utf8());
                        let cut = std::mem::replace(&mut partial, rest);
                        self.cut_segment(cut, utterance);
                    }
                }
                CompletionEvent::FunctionCall(call) => pending_call = Some(call),
                CompletionEvent::Done => break,
            }
        }
        if !partial.trim().is_empty() {
            self.cut_segment(partial, utterance);
        }
        pending_call
    }

    fn cut_segment(&mut self, text: String, utterance: u32) {
        let index = self.next_index;
        self.next_index += 1;
        info!(index, utterance, "reply segment: {text}");
        let _ = self.synth_tx.send(TextSegment {
            index: Some(index),
            text,
            utterance,
        });
    }

    fn acknowledge(&self, name: &str, utterance: u32) {
        let Some(spec) = self.tools.iter().find(|t| t.name == name) else {
            return;
        };
        let _ = self.synth_tx.send(TextSegment {
            index: None,
            text: spec.say.clone(),
            utterance,
        });
    }

    async fn run_tool(&self, call: &FunctionCall) -> Option<String> {
        let Some(handler) = self.registry.get(&call.name) else {
            warn!("model requested unknown function: {}", call.name);
            return None;
        };
        let args = match repair_function_args(&call.arguments) {
            Some(args) => args,
            None => {
                warn!(
                    "unusable arguments for {}, skipping call: {}",
                    call.name, call.arguments
                );
                return None;
            }
        };
        match handler.invoke(args).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("function {} failed: {e}", call.name);
                None
            }
        }
    }

    /// Context snapshot (for tests/diagnostics).
    pub fn context(&self) -> &[ChatTurn] {
        &self.context
    }
}

/// Spawn the driver's mailbox task. Transcripts are processed strictly one
/// at a time, so a completion in progress is never raced by the next one.
pub fn spawn_driver(mut driver: ConversationDriver) -> mpsc::UnboundedSender<(String, u32)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, u32)>();
    tokio::spawn(async move {
        while let Some((text, utterance)) = rx.recv().await {
            driver.respond(text, utterance).await;
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays pre-scripted completion streams, one per call.
    struct ScriptedLlm {
        scripts: Mutex<VecDeque<Vec<CompletionEvent>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(scripts: Vec<Vec<CompletionEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedLlm {
        async fn stream_chat(
            &self,
            _turns: &[ChatTurn],
            _tools: &[ToolSpec],
        ) -> BridgeResult<mpsc::UnboundedReceiver<CompletionEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![CompletionEvent::Done]);
            let (tx, rx) = mpsc::unbounded_channel();
            for event in script {
                let _ = tx.send(event);
            }
            Ok(rx)
        }
    }

    struct RecordingTool {
        invocations: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        async fn invoke(&self, args: serde_json::Value) -> BridgeResult<String> {
            self.invocations.lock().unwrap().push(args);
            Ok("booked for tuesday".to_string())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        async fn invoke(&self, _args: serde_json::Value) -> BridgeResult<String> {
            Err(BridgeError::Function("upstream is down".to_string()))
        }
    }

    fn demo_spec() -> ToolSpec {
        ToolSpec {
            name: "schedule_demo".to_string(),
            description: "Book a follow-up demo".to_string(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
            say: "One moment while I get that on the calendar.".to_string(),
        }
    }

    fn driver_with(
        llm: Arc<dyn LlmBackend>,
        tools: Vec<ToolSpec>,
        registry: ToolRegistry,
    ) -> (ConversationDriver, mpsc::UnboundedReceiver<TextSegment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConversationDriver::new(llm, tools, registry, "be helpful", tx),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TextSegment>) -> Vec<TextSegment> {
        let mut out = Vec::new();
        while let Ok(seg) = rx.try_recv() {
            out.push(seg);
        }
        out
    }

    #[tokio::test]
    async fn boundary_markers_cut_segments_with_increasing_indices() {
        let llm = ScriptedLlm::new(vec![vec![
            CompletionEvent::Delta("Hello there\u{2022} How".to_string()),
            CompletionEvent::Delta(" are you\u{2022}".to_string()),
            CompletionEvent::Done,
        ]]);
        let (mut driver, mut rx) = driver_with(llm, vec![], ToolRegistry::new());
        driver.respond("hi".to_string(), 0).await;

        let segments = drain(&mut rx);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].index, Some(0));
        assert_eq!(segments[0].text, "Hello there\u{2022}");
        assert_eq!(segments[1].index, Some(1));
        assert_eq!(segments[1].text, " How are you\u{2022}");

        // The whole reply lands in the context as one assistant turn.
        let last = driver.context().last().unwrap();
        assert_eq!(last.role, "assistant");
        assert_eq!(last.content, "Hello there\u{2022} How are you\u{2022}");
    }

    #[tokio::test]
    async fn stream_end_flushes_the_unterminated_remainder() {
        let llm = ScriptedLlm::new(vec![vec![
            CompletionEvent::Delta("No boundary in sight".to_string()),
            CompletionEvent::Done,
        ]]);
        let (mut driver, mut rx) = driver_with(llm, vec![], ToolRegistry::new());
        driver.respond("hi".to_string(), 3).await;

        let segments = drain(&mut rx);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].index, Some(0));
        assert_eq!(segments[0].utterance, 3);
    }

    #[tokio::test]
    async fn indices_keep_growing_across_turns() {
        let llm = ScriptedLlm::new(vec![
            vec![
                CompletionEvent::Delta("First\u{2022}".to_string()),
                CompletionEvent::Done,
            ],
            vec![
                CompletionEvent::Delta("Second\u{2022}".to_string()),
                CompletionEvent::Done,
            ],
        ]);
        let (mut driver, mut rx) = driver_with(llm, vec![], ToolRegistry::new());
        driver.respond("one".to_string(), 0).await;
        driver.respond("two".to_string(), 1).await;

        let indices: Vec<_> = drain(&mut rx).into_iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![Some(0), Some(1)]);
    }

    #[tokio::test]
    async fn function_call_speaks_ack_then_resumes_with_the_result() {
        let llm = ScriptedLlm::new(vec![
            vec![
                CompletionEvent::FunctionCall(FunctionCall {
                    name: "schedule_demo".to_string(),
                    arguments: r#"{"email":"pat@example.com"}"#.to_string(),
                }),
                CompletionEvent::Done,
            ],
            vec![
                CompletionEvent::Delta("All booked\u{2022}".to_string()),
                CompletionEvent::Done,
            ],
        ]);
        let invocations = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::new();
        registry.insert(
            "schedule_demo".to_string(),
            Arc::new(RecordingTool {
                invocations: invocations.clone(),
            }),
        );
        let (mut driver, mut rx) = driver_with(llm.clone(), vec![demo_spec()], registry);
        driver.respond("book it".to_string(), 2).await;

        let segments = drain(&mut rx);
        assert_eq!(segments.len(), 2);
        // Acknowledgement plays immediately, outside the generation order.
        assert_eq!(segments[0].index, None);
        assert_eq!(segments[0].text, "One moment while I get that on the calendar.");
        assert_eq!(segments[1].index, Some(0));
        assert_eq!(segments[1].text, "All booked\u{2022}");

        assert_eq!(llm.calls(), 2);
        assert_eq!(invocations.lock().unwrap().len(), 1);
        assert_eq!(
            invocations.lock().unwrap()[0]["email"],
            "pat@example.com"
        );

        // The function result was appended as its own turn.
        assert!(driver
            .context()
            .iter()
            .any(|t| t.role == "function" && t.content == "booked for tuesday"));
    }

    #[tokio::test]
    async fn unrepairable_arguments_abandon_the_call() {
        let llm = ScriptedLlm::new(vec![vec![
            CompletionEvent::FunctionCall(FunctionCall {
                name: "schedule_demo".to_string(),
                arguments: "not json at all".to_string(),
            }),
            CompletionEvent::Done,
        ]]);
        let mut registry = ToolRegistry::new();
        registry.insert(
            "schedule_demo".to_string(),
            Arc::new(RecordingTool {
                invocations: Arc::new(Mutex::new(Vec::new())),
            }),
        );
        let (mut driver, mut rx) = driver_with(llm.clone(), vec![demo_spec()], registry);
        driver.respond("book it".to_string(), 0).await;

        // The acknowledgement still played, but no follow-up completion ran.
        assert_eq!(llm.calls(), 1);
        let segments = drain(&mut rx);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].index, None);
        assert!(!driver.context().iter().any(|t| t.role == "function"));
    }

    #[tokio::test]
    async fn failing_tool_does_not_end_the_conversation() {
        let llm = ScriptedLlm::new(vec![
            vec![
                CompletionEvent::FunctionCall(FunctionCall {
                    name: "schedule_demo".to_string(),
                    arguments: "{}".to_string(),
                }),
                CompletionEvent::Done,
            ],
            vec![
                CompletionEvent::Delta("Recovered\u{2022}".to_string()),
                CompletionEvent::Done,
            ],
        ]);
        let mut registry = ToolRegistry::new();
        registry.insert("schedule_demo".to_string(), Arc::new(FailingTool));
        let (mut driver, _rx) = driver_with(llm.clone(), vec![demo_spec()], registry);
        driver.respond("book it".to_string(), 0).await;

        // The failed call was skipped and the driver kept running; the next
        // transcript still gets a completion.
        assert_eq!(llm.calls(), 1);
        driver.respond("anything else".to_string(), 1).await;
        assert_eq!(llm.calls(), 2);
    }

    #[test]
    fn repairs_doubled_argument_objects() {
        let repaired = repair_function_args(r#"{"email":"a@b.co"}{"email":"a@b.co"}"#).unwrap();
        assert_eq!(repaired["email"], "a@b.co");
    }

    #[test]
    fn well_formed_arguments_pass_through() {
        let value = repair_function_args(r#"{"date":"tuesday","time":"10am"}"#).unwrap();
        assert_eq!(value["time"], "10am");
    }

    #[test]
    fn hopeless_arguments_are_rejected() {
        assert!(repair_function_args("").is_none());
        assert!(repair_function_args("twice { nope }").is_none());
    }
}
