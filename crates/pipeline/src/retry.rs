//! Validation and retry around a whole pipeline execution.
//!
//! ```text
//! Attempt(n) ──▶ Evaluate(n) ──pass──▶ Done
//!     ▲               │
//!     └──fail, n<max──┘
//!                     └──fail, n=max──▶ Exhausted ──▶ Done(fallback)
//! ```
//!
//! Only rejected answers are retried. Errors from the pipeline itself,
//! timeouts included, go straight back to the caller. An evaluator that
//! errors or runs out of time is handled by the evaluator-error policy.
//! Side effects of rejected attempts (memory turns, created tickets) are
//! kept.

use crate::advisor::guarded;
use crate::evaluation::{EvaluationInput, Evaluator, FactCheckingEvaluator, RelevancyEvaluator};
use crate::executor::ChatPipeline;
use chrono::Utc;
use colloquy_config::{
    DEFAULT_FALLBACK_MESSAGE, EvaluatorErrorPolicy, EvaluatorKind, ValidationConfig,
};
use colloquy_core::error::{EvaluationError, Result, ValidationFailure};
use colloquy_core::event::{DomainEvent, EventBus};
use colloquy_core::model::ChatModel;
use colloquy_core::pipeline::{PipelineRequest, PipelineResponse, TokenUsage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

enum State {
    Attempt(u32),
    Evaluate(u32, PipelineResponse),
    Exhausted(u32),
    Done(PipelineResponse),
}

pub struct ValidatingPipeline {
    pipeline: ChatPipeline,
    evaluator: Arc<dyn Evaluator>,
    max_attempts: u32,
    on_evaluator_error: EvaluatorErrorPolicy,
    evaluator_timeout: Duration,
    fallback_message: String,
    events: EventBus,
}

impl ValidatingPipeline {
    /// Three attempts, 30s per evaluation, evaluator errors count as a pass.
    pub fn new(pipeline: ChatPipeline, evaluator: Arc<dyn Evaluator>) -> Self {
        let events = pipeline.events().clone();
        Self {
            pipeline,
            evaluator,
            max_attempts: 3,
            on_evaluator_error: EvaluatorErrorPolicy::Pass,
            evaluator_timeout: Duration::from_secs(30),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            events,
        }
    }

    /// Build the configured evaluator over `judge`.
    pub fn from_config(
        pipeline: ChatPipeline,
        judge: Arc<dyn ChatModel>,
        config: &ValidationConfig,
    ) -> Self {
        let evaluator: Arc<dyn Evaluator> = match config.evaluator {
            EvaluatorKind::FactChecking => Arc::new(FactCheckingEvaluator::new(judge)),
            EvaluatorKind::Relevancy => Arc::new(RelevancyEvaluator::new(judge)),
        };
        Self::new(pipeline, evaluator)
            .with_max_attempts(config.max_attempts)
            .with_evaluator_error_policy(config.on_evaluator_error)
            .with_evaluator_timeout(Duration::from_secs(config.timeout_secs))
            .with_fallback_message(config.fallback_message.clone())
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_evaluator_error_policy(mut self, policy: EvaluatorErrorPolicy) -> Self {
        self.on_evaluator_error = policy;
        self
    }

    pub fn with_evaluator_timeout(mut self, timeout: Duration) -> Self {
        self.evaluator_timeout = timeout;
        self
    }

    pub fn with_fallback_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_message = message.into();
        self
    }

    pub fn pipeline(&self) -> &ChatPipeline {
        &self.pipeline
    }

    /// Run until an answer passes or attempts run out.
    ///
    /// Usage in the returned reply covers every attempt.
    pub async fn call(&self, request: PipelineRequest) -> Result<PipelineResponse> {
        let mut usage = TokenUsage::default();
        let mut state = State::Attempt(1);

        loop {
            state = match state {
                State::Attempt(attempt) => {
                    debug!(
                        conversation_id = %request.conversation_id,
                        attempt,
                        "Pipeline attempt"
                    );
                    let response = self.pipeline.call(request.clone()).await?;
                    usage.merge(&response.usage);
                    State::Evaluate(attempt, response)
                }
                State::Evaluate(attempt, response) => {
                    match self.judge(&request, &response, attempt).await? {
                        Ok(()) => State::Done(response),
                        Err(failure) if attempt < self.max_attempts => {
                            info!(
                                conversation_id = %request.conversation_id,
                                "{failure}, retrying"
                            );
                            State::Attempt(attempt + 1)
                        }
                        Err(failure) => {
                            info!(conversation_id = %request.conversation_id, "{failure}");
                            State::Exhausted(attempt)
                        }
                    }
                }
                State::Exhausted(attempts) => {
                    warn!(
                        conversation_id = %request.conversation_id,
                        attempts,
                        "Every answer rejected, serving fallback"
                    );
                    self.events.publish(DomainEvent::FallbackServed {
                        conversation_id: request.conversation_id.to_string(),
                        attempts,
                        timestamp: Utc::now(),
                    });
                    State::Done(PipelineResponse::new(self.fallback_message.clone()))
                }
                State::Done(mut response) => {
                    response.usage = usage;
                    return Ok(response);
                }
            };
        }
    }

    /// Evaluate one answer. The outer error is cancellation only.
    async fn judge(
        &self,
        request: &PipelineRequest,
        response: &PipelineResponse,
        attempt: u32,
    ) -> Result<std::result::Result<(), ValidationFailure>> {
        let input = EvaluationInput {
            question: &request.user_message,
            answer: &response.content,
            documents: &response.documents,
        };
        let limit = self.evaluator_timeout;
        let evaluation = guarded(&request.cancel, limit, self.evaluator.evaluate(input), || {
            EvaluationError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }
        });
        let verdict = match evaluation.await? {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(
                    conversation_id = %request.conversation_id,
                    evaluator = %self.evaluator.name(),
                    error = %e,
                    "Evaluator failed"
                );
                match self.on_evaluator_error {
                    EvaluatorErrorPolicy::Pass => return Ok(Ok(())),
                    EvaluatorErrorPolicy::Fail => {
                        return Ok(Err(ValidationFailure {
                            attempt,
                            rationale: Some(e.to_string()),
                        }));
                    }
                }
            }
        };

        self.events.publish(DomainEvent::AnswerEvaluated {
            conversation_id: request.conversation_id.to_string(),
            attempt,
            passed: verdict.pass,
            timestamp: Utc::now(),
        });

        Ok(if verdict.pass {
            Ok(())
        } else {
            Err(ValidationFailure {
                attempt,
                rationale: verdict.rationale,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisors::UsageAuditAdvisor;
    use crate::test_helpers::{SequentialMockModel, StalledModel, make_text_response};
    use async_trait::async_trait;
    use colloquy_core::error::{EvaluationError, ModelError, PipelineError};
    use colloquy_core::pipeline::EvaluationVerdict;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Hands out scripted verdicts in order.
    struct ScriptedEvaluator {
        verdicts: Mutex<Vec<std::result::Result<bool, ()>>>,
    }

    impl ScriptedEvaluator {
        fn new(verdicts: Vec<std::result::Result<bool, ()>>) -> Arc<Self> {
            Arc::new(Self {
                verdicts: Mutex::new(verdicts.into_iter().rev().collect()),
            })
        }
    }

    #[async_trait]
    impl Evaluator for ScriptedEvaluator {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn evaluate(
            &self,
            _input: EvaluationInput<'_>,
        ) -> std::result::Result<EvaluationVerdict, EvaluationError> {
            match self.verdicts.lock().unwrap().pop() {
                Some(Ok(true)) => Ok(EvaluationVerdict::pass()),
                Some(Ok(false)) | None => Ok(EvaluationVerdict::fail("not supported")),
                Some(Err(())) => Err(EvaluationError::Unparseable("???".into())),
            }
        }
    }

    fn pipeline(model: Arc<dyn ChatModel>) -> ChatPipeline {
        let events = EventBus::new(64);
        ChatPipeline::builder(model)
            .advisor(Arc::new(UsageAuditAdvisor::new(events.clone())))
            .events(events)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn always_failing_runs_max_attempts_then_fallback() {
        let model = Arc::new(SequentialMockModel::repeated_text("wrong", 3));
        let wrapper =
            ValidatingPipeline::new(pipeline(model.clone()), ScriptedEvaluator::new(vec![]));
        let mut rx = wrapper.pipeline().events().subscribe();

        let response = wrapper.call(PipelineRequest::new("c1", "q")).await.unwrap();
        assert_eq!(response.content, DEFAULT_FALLBACK_MESSAGE);
        assert_eq!(response.usage.total_tokens, 45);
        assert_eq!(model.call_count(), 3);

        let mut fallbacks = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.as_ref(), DomainEvent::FallbackServed { attempts: 3, .. }) {
                fallbacks += 1;
            }
        }
        assert_eq!(fallbacks, 1);
    }

    #[tokio::test]
    async fn pass_on_second_attempt() {
        let model = Arc::new(SequentialMockModel::new(vec![
            make_text_response("first"),
            make_text_response("second"),
        ]));
        let wrapper = ValidatingPipeline::new(
            pipeline(model.clone()),
            ScriptedEvaluator::new(vec![Ok(false), Ok(true)]),
        );
        let response = wrapper.call(PipelineRequest::new("c1", "q")).await.unwrap();
        assert_eq!(response.content, "second");
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn evaluator_error_policy() {
        let model = Arc::new(SequentialMockModel::single_text("answer"));
        let wrapper =
            ValidatingPipeline::new(pipeline(model), ScriptedEvaluator::new(vec![Err(())]));
        let response = wrapper.call(PipelineRequest::new("c1", "q")).await.unwrap();
        assert_eq!(response.content, "answer");

        let model = Arc::new(SequentialMockModel::repeated_text("answer", 2));
        let evaluator = ScriptedEvaluator::new(vec![Err(()), Err(())]);
        let wrapper = ValidatingPipeline::new(pipeline(model.clone()), evaluator)
            .with_max_attempts(2)
            .with_evaluator_error_policy(EvaluatorErrorPolicy::Fail)
            .with_fallback_message("Sorry.");
        let response = wrapper.call(PipelineRequest::new("c1", "q")).await.unwrap();
        assert_eq!(response.content, "Sorry.");
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_not_retried() {
        let pipeline = ChatPipeline::builder(Arc::new(StalledModel))
            .model_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let wrapper = ValidatingPipeline::new(pipeline, ScriptedEvaluator::new(vec![]));
        let err = wrapper.call(PipelineRequest::new("c1", "q")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Model(ModelError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_evaluator_goes_through_error_policy() {
        let judge: Arc<dyn ChatModel> = Arc::new(StalledModel);
        let hour = Duration::from_secs(3600);

        let model = Arc::new(SequentialMockModel::single_text("answer"));
        let evaluator = Arc::new(FactCheckingEvaluator::new(judge.clone()));
        let wrapper = ValidatingPipeline::new(pipeline(model), evaluator)
            .with_evaluator_timeout(Duration::from_secs(5));
        let response = tokio::time::timeout(hour, wrapper.call(PipelineRequest::new("c1", "q")))
            .await
            .expect("evaluation must not hang")
            .unwrap();
        assert_eq!(response.content, "answer");

        let model = Arc::new(SequentialMockModel::repeated_text("answer", 2));
        let evaluator = Arc::new(FactCheckingEvaluator::new(judge));
        let wrapper = ValidatingPipeline::new(pipeline(model.clone()), evaluator)
            .with_max_attempts(2)
            .with_evaluator_timeout(Duration::from_secs(5))
            .with_evaluator_error_policy(EvaluatorErrorPolicy::Fail);
        let response = tokio::time::timeout(hour, wrapper.call(PipelineRequest::new("c1", "q")))
            .await
            .expect("evaluation must not hang")
            .unwrap();
        assert_eq!(response.content, DEFAULT_FALLBACK_MESSAGE);
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test]
    async fn infrastructure_errors_fail_fast() {
        let model = Arc::new(crate::test_helpers::FailingModel(ModelError::AuthenticationFailed(
            "bad key".into(),
        )));
        let wrapper = ValidatingPipeline::new(pipeline(model), ScriptedEvaluator::new(vec![]));
        let err = wrapper.call(PipelineRequest::new("c1", "q")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Model(ModelError::AuthenticationFailed(_))));
    }
}
