//! `MockToolExecutor` — a scripted test double for `ToolExecutor`.
//!
//! Useful in unit and integration tests where a real CDN operation is
//! either unavailable or irrelevant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::{ToolExecutionError, ToolExecutor};

/// Behaviour scripted for one tool name.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail on every call.
    Fail(String),
    /// Fail on the first `failures` calls, then return `value`.
    FailTimes { failures: u32, value: Value },
}

/// One call seen by the mock.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub tool: String,
    pub args: Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Script {
    behaviour: MockBehaviour,
    delay: Option<Duration>,
}

/// A mock executor that records every call it receives and returns a
/// programmer-specified result per tool name.
///
/// Tools without a script succeed with `{ "tool": <name> }`.
#[derive(Debug, Clone, Default)]
pub struct MockToolExecutor {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `tool` to always succeed with `value`.
    pub fn returning(self, tool: &str, value: Value) -> Self {
        self.script(tool, MockBehaviour::ReturnValue(value))
    }

    /// Script `tool` to always fail with `message`.
    pub fn failing(self, tool: &str, message: &str) -> Self {
        self.script(tool, MockBehaviour::Fail(message.to_owned()))
    }

    /// Script `tool` to fail `failures` times before returning `value`.
    pub fn flaky(self, tool: &str, failures: u32, value: Value) -> Self {
        self.script(tool, MockBehaviour::FailTimes { failures, value })
    }

    /// Make every call to `tool` sleep for `delay` before answering.
    pub fn delayed(self, tool: &str, delay: Duration) -> Self {
        lock(&self.scripts)
            .entry(tool.to_owned())
            .or_insert_with(|| Script {
                behaviour: MockBehaviour::ReturnValue(json!({ "tool": tool })),
                delay: None,
            })
            .delay = Some(delay);
        self
    }

    fn script(self, tool: &str, behaviour: MockBehaviour) -> Self {
        {
            let mut scripts = lock(&self.scripts);
            let delay = scripts.get(tool).and_then(|s| s.delay);
            scripts.insert(tool.to_owned(), Script { behaviour, delay });
        }
        self
    }

    /// All calls seen so far, in call order.
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// Calls made to `tool`, in call order.
    pub fn calls_to(&self, tool: &str) -> Vec<MockCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.tool == tool)
            .cloned()
            .collect()
    }

    /// Number of times `tool` has been executed.
    pub fn call_count(&self, tool: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.tool == tool).count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(&self, tool: &str, args: Value) -> Result<Value, ToolExecutionError> {
        let previous_calls = {
            let mut calls = lock(&self.calls);
            let previous = calls.iter().filter(|c| c.tool == tool).count() as u32;
            calls.push(MockCall {
                tool: tool.to_owned(),
                args,
                at: Utc::now(),
            });
            previous
        };

        let script = lock(&self.scripts).get(tool).cloned();
        let Some(script) = script else {
            return Ok(json!({ "tool": tool }));
        };

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        match script.behaviour {
            MockBehaviour::ReturnValue(value) => Ok(value),
            MockBehaviour::Fail(message) => Err(ToolExecutionError::failed(tool, message)),
            MockBehaviour::FailTimes { failures, value } => {
                if previous_calls < failures {
                    Err(ToolExecutionError::failed(
                        tool,
                        format!("transient failure {}/{}", previous_calls + 1, failures),
                    ))
                } else {
                    Ok(value)
                }
            }
        }
    }
}
