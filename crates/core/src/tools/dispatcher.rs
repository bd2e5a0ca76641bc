use super::{ToolCall, ToolDeclaration, ToolError, ToolName, ToolRequest, ToolResult};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Completed executions remembered for duplicate ids.
pub const DEFAULT_MEMO_CAPACITY: usize = 1024;

/// A cloneable handle on a single tool execution.
pub type ToolFuture = Shared<BoxFuture<'static, ToolResult>>;

/// Executes one or more tools.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// The tools this handler answers for.
    fn tools(&self) -> &'static [ToolName];

    async fn handle(&self, request: ToolRequest) -> Result<Value, ToolError>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<ToolName, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every tool it declares. A later registration
    /// for the same tool replaces the earlier one.
    pub fn register(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        for tool in handler.tools() {
            if self.handlers.insert(*tool, handler.clone()).is_some() {
                warn!(tool = %tool, "Replacing existing tool handler");
            }
        }
        self
    }

    pub fn handler_for(&self, tool: ToolName) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(&tool).cloned()
    }

    /// Declarations of the registered tools, in a stable order.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        ToolName::ALL
            .into_iter()
            .filter(|tool| self.handlers.contains_key(tool))
            .map(|tool| tool.declaration())
            .collect()
    }
}

/// Turns tool calls into tool results.
///
/// Each call id executes at most once: a repeated id gets a clone of the
/// original future, so callers await the same (possibly still running)
/// execution. The returned future is lazy; the caller decides where it runs.
///
/// Past `memo_capacity` ids the oldest completed executions are forgotten.
/// Running executions are always kept.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    calls: HashMap<String, ToolFuture>,
    order: VecDeque<String>,
    memo_capacity: usize,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            calls: HashMap::new(),
            order: VecDeque::new(),
            memo_capacity: DEFAULT_MEMO_CAPACITY,
        }
    }

    pub fn with_memo_capacity(mut self, memo_capacity: usize) -> Self {
        self.memo_capacity = memo_capacity;
        self
    }

    pub fn dispatch(&mut self, call: ToolCall) -> ToolFuture {
        if let Some(existing) = self.calls.get(&call.id) {
            debug!(call_id = %call.id, tool = %call.name, "Duplicate tool call id, reusing result");
            return existing.clone();
        }
        info!(call_id = %call.id, tool = %call.name, "Dispatching tool call");
        let future = execute(self.registry.clone(), self.timeout, call.clone())
            .boxed()
            .shared();
        self.order.push_back(call.id.clone());
        self.calls.insert(call.id, future.clone());
        self.evict_completed();
        future
    }

    /// Whether `id` has been dispatched before.
    pub fn is_known(&self, id: &str) -> bool {
        self.calls.contains_key(id)
    }

    /// The result for `id` if its execution has completed.
    pub fn completed(&self, id: &str) -> Option<ToolResult> {
        self.calls.get(id).and_then(|future| future.peek().cloned())
    }

    fn evict_completed(&mut self) {
        while self.calls.len() > self.memo_capacity {
            let calls = &self.calls;
            let Some(index) = self
                .order
                .iter()
                .position(|id| calls.get(id).is_some_and(|f| f.peek().is_some()))
            else {
                return;
            };
            if let Some(id) = self.order.remove(index) {
                debug!(call_id = %id, "Forgetting completed tool call");
                self.calls.remove(&id);
            }
        }
    }
}

async fn execute(registry: Arc<ToolRegistry>, timeout: Duration, call: ToolCall) -> ToolResult {
    let request = match ToolRequest::parse(&call.name, &call.args) {
        Ok(request) => request,
        Err(e) => {
            warn!(call_id = %call.id, error = %e, "Rejecting tool call");
            return ToolResult::failure(&call, e);
        }
    };
    let Some(handler) = registry.handler_for(request.name()) else {
        warn!(call_id = %call.id, tool = %call.name, "No handler registered");
        return ToolResult::failure(
            &call,
            ToolError::UnsupportedTool {
                name: call.name.clone(),
            },
        );
    };

    match tokio::time::timeout(timeout, handler.handle(request)).await {
        Ok(Ok(value)) => ToolResult::success(&call, value),
        Ok(Err(e)) => {
            warn!(call_id = %call.id, error = %e, "Tool handler failed");
            ToolResult::failure(&call, e)
        }
        Err(_) => {
            warn!(call_id = %call.id, timeout_ms = timeout.as_millis() as u64, "Tool handler timed out");
            ToolResult::failure(
                &call,
                ToolError::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolOutcome;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl ToolHandler for CountingHandler {
        fn tools(&self) -> &'static [ToolName] {
            &[ToolName::FlyTo, ToolName::ClearMap]
        }

        async fn handle(&self, request: ToolRequest) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match request {
                ToolRequest::ClearMap => Err(ToolError::Failed {
                    message: "map offline".to_string(),
                }),
                _ => Ok(json!({ "status": "ok" })),
            }
        }
    }

    fn dispatcher(delay: Duration) -> (ToolDispatcher, Arc<CountingHandler>) {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            delay,
        });
        let registry = ToolRegistry::new().register(handler.clone());
        (
            ToolDispatcher::new(Arc::new(registry), Duration::from_secs(10)),
            handler,
        )
    }

    fn fly_to(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "fly_to".to_string(),
            args: json!({ "latitude": 25.2, "longitude": 55.27 }),
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_runs_handler_once() {
        let (mut dispatcher, handler) = dispatcher(Duration::ZERO);
        let first = dispatcher.dispatch(fly_to("call-1")).await;
        let second = dispatcher.dispatch(fly_to("call-1")).await;
        assert_eq!(first, second);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.completed("call-1"), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_while_in_flight_shares_execution() {
        let (mut dispatcher, handler) = dispatcher(Duration::from_secs(1));
        let a = dispatcher.dispatch(fly_to("call-1"));
        let b = dispatcher.dispatch(fly_to("call-1"));
        assert!(dispatcher.completed("call-1").is_none());
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a, b);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let (dispatcher_fast, _) = dispatcher(Duration::from_secs(30));
        let mut dispatcher = ToolDispatcher::new(dispatcher_fast.registry.clone(), Duration::from_secs(10));
        let result = dispatcher.dispatch(fly_to("call-9")).await;
        assert_eq!(result.id, "call-9");
        assert_eq!(
            result.outcome,
            ToolOutcome::Error(ToolError::TimedOut { timeout_ms: 10_000 })
        );
    }

    #[tokio::test]
    async fn test_unknown_and_unregistered_tools_fail_in_band() {
        let (mut dispatcher, handler) = dispatcher(Duration::ZERO);
        let unknown = dispatcher
            .dispatch(ToolCall {
                id: "x".to_string(),
                name: "summon_taxi".to_string(),
                args: json!({}),
            })
            .await;
        assert!(matches!(
            unknown.outcome,
            ToolOutcome::Error(ToolError::UnsupportedTool { .. })
        ));

        let unregistered = dispatcher
            .dispatch(ToolCall {
                id: "y".to_string(),
                name: "lookup_lead".to_string(),
                args: json!({ "query": "Amira" }),
            })
            .await;
        assert!(matches!(
            unregistered.outcome,
            ToolOutcome::Error(ToolError::UnsupportedTool { .. })
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_result() {
        let (mut dispatcher, _) = dispatcher(Duration::ZERO);
        let result = dispatcher
            .dispatch(ToolCall {
                id: "c".to_string(),
                name: "clear_map".to_string(),
                args: Value::Null,
            })
            .await;
        assert_eq!(
            result.outcome,
            ToolOutcome::Error(ToolError::Failed {
                message: "map offline".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_oldest_completed_calls_are_forgotten_past_capacity() {
        let (dispatcher, handler) = dispatcher(Duration::ZERO);
        let mut dispatcher = dispatcher.with_memo_capacity(2);
        for id in ["call-1", "call-2", "call-3"] {
            dispatcher.dispatch(fly_to(id)).await;
        }
        assert!(!dispatcher.is_known("call-1"));
        assert!(dispatcher.is_known("call-2"));
        assert!(dispatcher.is_known("call-3"));

        // Remembered ids still reuse their result.
        dispatcher.dispatch(fly_to("call-3")).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_calls_are_never_forgotten() {
        let (dispatcher, handler) = dispatcher(Duration::from_secs(1));
        let mut dispatcher = dispatcher.with_memo_capacity(1);
        let a = dispatcher.dispatch(fly_to("call-1"));
        let b = dispatcher.dispatch(fly_to("call-2"));
        assert!(dispatcher.is_known("call-1"));
        assert!(dispatcher.is_known("call-2"));
        tokio::join!(a, b);

        dispatcher.dispatch(fly_to("call-2")).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_registry_declares_only_registered_tools() {
        let (dispatcher, _) = dispatcher(Duration::ZERO);
        let names: Vec<String> = dispatcher
            .registry
            .declarations()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["fly_to", "clear_map"]);
    }
}
