//! Thread-safe telemetry engine. Folds domain events into traces and
//! usage totals, and serves the reports.

use crate::TelemetryError;
use crate::model::*;
use chrono::{DateTime, Utc};
use colloquy_core::event::{DomainEvent, EventBus};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_TRACES: usize = 5_000;

/// Collects pipeline events.
///
/// Events for a conversation go to its open trace, or start a new one.
/// `RequestCompleted` and `RequestFailed` close the trace. Verdicts and
/// fallbacks from the retry wrapper arrive after the pipeline has reported,
/// so they attach to the conversation's latest trace instead.
#[derive(Default)]
pub struct TelemetryEngine {
    /// All recorded traces (most recent last).
    traces: RwLock<Vec<Trace>>,
    totals: RwLock<Totals>,
}

#[derive(Debug, Default)]
struct Totals {
    all: ConversationUsage,
    by_conversation: HashMap<String, ConversationUsage>,
    by_model: HashMap<String, ModelUsage>,
    events_lost: u64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl TelemetryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `bus` on a background task until every publisher is gone.
    pub fn spawn(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => engine.record(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Telemetry subscriber lagged, events dropped");
                        write(&engine.totals).events_lost += missed;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Telemetry subscriber stopped");
        })
    }

    /// Fold one event into the traces and totals.
    pub fn record(&self, event: &DomainEvent) {
        self.update_totals(event);

        let conversation_id = event.conversation_id();
        match event {
            DomainEvent::UsageRecorded {
                model,
                prompt_tokens,
                completion_tokens,
                timestamp,
                ..
            } => {
                let span = Span::new(SpanKind::ModelRound, model, *timestamp)
                    .with_tokens(*prompt_tokens, *completion_tokens);
                self.with_open_trace(conversation_id, *timestamp, |t| t.add_span(span));
            }
            DomainEvent::ToolInvoked {
                tool_name,
                success,
                duration_ms,
                timestamp,
                ..
            } => {
                let span = Span::new(SpanKind::ToolExecution, tool_name, *timestamp)
                    .with_outcome(*success)
                    .with_duration(*duration_ms);
                self.with_open_trace(conversation_id, *timestamp, |t| t.add_span(span));
            }
            DomainEvent::ContextRetrieved {
                documents,
                degraded,
                timestamp,
                ..
            } => {
                let span = Span::new(SpanKind::Retrieval, "vector_index", *timestamp)
                    .with_outcome(!degraded)
                    .with_metadata("documents", *documents);
                self.with_open_trace(conversation_id, *timestamp, |t| t.add_span(span));
            }
            DomainEvent::MemoryPersisted {
                history_len,
                timestamp,
                ..
            } => {
                let span = Span::new(SpanKind::MemoryWrite, "conversation_memory", *timestamp)
                    .with_outcome(true)
                    .with_metadata("history_len", *history_len);
                self.with_open_trace(conversation_id, *timestamp, |t| t.add_span(span));
            }
            DomainEvent::RequestCompleted {
                duration_ms,
                timestamp,
                ..
            } => {
                self.with_open_trace(conversation_id, *timestamp, |t| {
                    t.duration_ms = Some(*duration_ms);
                    t.end(TraceOutcome::Completed, *timestamp);
                });
            }
            DomainEvent::RequestFailed {
                error_message,
                timestamp,
                ..
            } => {
                self.with_open_trace(conversation_id, *timestamp, |t| {
                    t.end(TraceOutcome::Failed(error_message.clone()), *timestamp);
                });
            }
            DomainEvent::AnswerEvaluated {
                attempt,
                passed,
                timestamp,
                ..
            } => {
                let span = Span::new(SpanKind::Evaluation, format!("attempt {attempt}"), *timestamp)
                    .with_outcome(*passed);
                self.with_latest_trace(conversation_id, *timestamp, |t| t.add_span(span));
            }
            DomainEvent::FallbackServed {
                attempts,
                timestamp,
                ..
            } => {
                let span = Span::new(SpanKind::Fallback, "fallback", *timestamp)
                    .with_metadata("attempts", *attempts);
                self.with_latest_trace(conversation_id, *timestamp, |t| t.add_span(span));
            }
        }
    }

    fn update_totals(&self, event: &DomainEvent) {
        let mut totals = write(&self.totals);
        let Totals {
            all,
            by_conversation,
            by_model,
            ..
        } = &mut *totals;
        let conversation = by_conversation
            .entry(event.conversation_id().to_string())
            .or_default();

        for usage in [all, conversation] {
            match event {
                DomainEvent::UsageRecorded {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                    ..
                } => {
                    usage.prompt_tokens += u64::from(*prompt_tokens);
                    usage.completion_tokens += u64::from(*completion_tokens);
                    usage.total_tokens += u64::from(*total_tokens);
                    usage.model_rounds += 1;
                }
                DomainEvent::ToolInvoked { success, .. } => {
                    usage.tool_invocations += 1;
                    if !success {
                        usage.tool_failures += 1;
                    }
                }
                DomainEvent::RequestCompleted { .. } => usage.requests_completed += 1,
                DomainEvent::RequestFailed { .. } => usage.requests_failed += 1,
                DomainEvent::AnswerEvaluated { passed: false, .. } => usage.rejected_answers += 1,
                DomainEvent::FallbackServed { .. } => usage.fallbacks += 1,
                _ => {}
            }
        }

        if let DomainEvent::UsageRecorded {
            model,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            ..
        } = event
        {
            let entry = by_model.entry(model.clone()).or_insert_with(|| ModelUsage {
                model: model.clone(),
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                rounds: 0,
            });
            entry.prompt_tokens += u64::from(*prompt_tokens);
            entry.completion_tokens += u64::from(*completion_tokens);
            entry.total_tokens += u64::from(*total_tokens);
            entry.rounds += 1;
        }
    }

    fn with_open_trace(&self, conversation_id: &str, at: DateTime<Utc>, f: impl FnOnce(&mut Trace)) {
        let mut traces = write(&self.traces);
        let index = traces
            .iter()
            .rposition(|t| t.conversation_id == conversation_id && t.is_open());
        match index {
            Some(i) => f(&mut traces[i]),
            None => f(start_trace(&mut traces, conversation_id, at)),
        }
    }

    fn with_latest_trace(&self, conversation_id: &str, at: DateTime<Utc>, f: impl FnOnce(&mut Trace)) {
        let mut traces = write(&self.traces);
        let index = traces.iter().rposition(|t| t.conversation_id == conversation_id);
        match index {
            Some(i) => f(&mut traces[i]),
            None => f(start_trace(&mut traces, conversation_id, at)),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        read(&self.traces).iter().find(|t| t.id == trace_id).cloned()
    }

    /// A trace as pretty-printed JSON.
    pub fn export_trace(&self, trace_id: &str) -> Result<String, TelemetryError> {
        let trace = self
            .get_trace(trace_id)
            .ok_or_else(|| TelemetryError::UnknownTrace(trace_id.to_string()))?;
        Ok(serde_json::to_string_pretty(&trace)?)
    }

    /// Most recent first.
    pub fn recent_traces(&self, limit: usize) -> Vec<Trace> {
        read(&self.traces).iter().rev().take(limit).cloned().collect()
    }

    pub fn traces_for_conversation(&self, conversation_id: &str) -> Vec<Trace> {
        read(&self.traces)
            .iter()
            .filter(|t| t.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn trace_count(&self) -> usize {
        read(&self.traces).len()
    }

    pub fn conversation_usage(&self, conversation_id: &str) -> ConversationUsage {
        read(&self.totals)
            .by_conversation
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        let totals = read(&self.totals);
        let mut by_model: Vec<ModelUsage> = totals.by_model.values().cloned().collect();
        by_model.sort_by(|a, b| b.total_tokens.cmp(&a.total_tokens).then_with(|| a.model.cmp(&b.model)));

        UsageSnapshot {
            totals: totals.all.clone(),
            conversations: totals.by_conversation.len(),
            trace_count: self.trace_count(),
            by_model,
            events_lost: totals.events_lost,
        }
    }

    /// Drop traces that started before `cutoff`. Totals are kept.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut traces = write(&self.traces);
        let before = traces.len();
        traces.retain(|t| t.started_at >= cutoff);
        before - traces.len()
    }
}

fn start_trace<'a>(traces: &'a mut Vec<Trace>, conversation_id: &str, at: DateTime<Utc>) -> &'a mut Trace {
    if traces.len() >= MAX_TRACES {
        // Oldest closed traces go first
        let mut drain = MAX_TRACES / 10;
        traces.retain(|t| {
            if drain > 0 && !t.is_open() {
                drain -= 1;
                return false;
            }
            true
        });
    }
    traces.push(Trace::new(conversation_id, at));
    let last = traces.len() - 1;
    &mut traces[last]
}

impl std::fmt::Debug for TelemetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryEngine")
            .field("traces", &self.trace_count())
            .finish()
    }
}
