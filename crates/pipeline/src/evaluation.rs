//! Answer evaluators, each a yes/no question put to a model.

use async_trait::async_trait;
use colloquy_core::error::EvaluationError;
use colloquy_core::message::Message;
use colloquy_core::model::{ChatModel, ModelOptions, ModelRequest};
use colloquy_core::pipeline::EvaluationVerdict;
use colloquy_core::retrieval::RetrievedDocument;
use std::sync::Arc;
use tracing::debug;

/// What an evaluator judges.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    pub question: &'a str,
    pub answer: &'a str,
    pub documents: &'a [RetrievedDocument],
}

impl EvaluationInput<'_> {
    fn context(&self) -> String {
        self.documents
            .iter()
            .map(|d| d.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        input: EvaluationInput<'_>,
    ) -> Result<EvaluationVerdict, EvaluationError>;
}

const FACT_CHECK_PROMPT: &str = "\
Evaluate whether or not the following claim is supported by the provided document.
Respond with \"yes\" if the claim is supported, or \"no\" if it is not.
Document:
{document}
Claim:
{claim}";

const RELEVANCY_PROMPT: &str = "\
Your task is to evaluate if the response for the query
is in line with the context information provided.

You have two options to answer. Either YES or NO.

Answer YES, if the response for the query
is in line with context information otherwise NO.

Query:
{query}

Response:
{response}

Context:
{context}

Answer:";

/// Ask `model` one question and read a yes/no out of the reply.
async fn ask_yes_no(
    model: &dyn ChatModel,
    options: &ModelOptions,
    prompt: String,
) -> Result<EvaluationVerdict, EvaluationError> {
    let mut request = ModelRequest::new(vec![Message::user(prompt)]);
    request.options = options.clone();
    let response = model.invoke(request).await?;
    let reply = response.message.content().trim();

    let verdict = reply
        .split(|c: char| !c.is_alphanumeric())
        .find(|w| !w.is_empty())
        .map(str::to_ascii_lowercase);
    match verdict.as_deref() {
        Some("yes") => Ok(EvaluationVerdict::pass()),
        Some("no") => Ok(EvaluationVerdict::fail(reply)),
        _ => Err(EvaluationError::Unparseable(reply.to_string())),
    }
}

/// Is the answer supported by the retrieved documents?
pub struct FactCheckingEvaluator {
    model: Arc<dyn ChatModel>,
    options: ModelOptions,
}

impl FactCheckingEvaluator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            options: ModelOptions {
                temperature: Some(0.0),
                ..ModelOptions::default()
            },
        }
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Evaluator for FactCheckingEvaluator {
    fn name(&self) -> &str {
        "fact_checking"
    }

    async fn evaluate(
        &self,
        input: EvaluationInput<'_>,
    ) -> Result<EvaluationVerdict, EvaluationError> {
        let prompt = FACT_CHECK_PROMPT
            .replace("{document}", &input.context())
            .replace("{claim}", input.answer);
        let verdict = ask_yes_no(self.model.as_ref(), &self.options, prompt).await?;
        debug!(pass = verdict.pass, "Fact check");
        Ok(verdict)
    }
}

/// Is the answer in line with the question and the retrieved context?
pub struct RelevancyEvaluator {
    model: Arc<dyn ChatModel>,
    options: ModelOptions,
}

impl RelevancyEvaluator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            options: ModelOptions {
                temperature: Some(0.0),
                ..ModelOptions::default()
            },
        }
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Evaluator for RelevancyEvaluator {
    fn name(&self) -> &str {
        "relevancy"
    }

    async fn evaluate(
        &self,
        input: EvaluationInput<'_>,
    ) -> Result<EvaluationVerdict, EvaluationError> {
        let prompt = RELEVANCY_PROMPT
            .replace("{query}", input.question)
            .replace("{response}", input.answer)
            .replace("{context}", &input.context());
        let verdict = ask_yes_no(self.model.as_ref(), &self.options, prompt).await?;
        debug!(pass = verdict.pass, "Relevancy check");
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FailingModel, SequentialMockModel};
    use colloquy_core::error::ModelError;

    fn input<'a>(documents: &'a [RetrievedDocument]) -> EvaluationInput<'a> {
        EvaluationInput {
            question: "How many paid leaves do employees get annually?",
            answer: "24 paid leaves.",
            documents,
        }
    }

    fn docs() -> Vec<RetrievedDocument> {
        vec![RetrievedDocument {
            text: "Employees are entitled to 24 paid leaves per year.".into(),
            score: 0.9,
            source_id: "hr-policy".into(),
        }]
    }

    #[tokio::test]
    async fn fact_check_yes_and_no() {
        let model = Arc::new(SequentialMockModel::single_text("yes"));
        let docs = docs();
        let verdict = FactCheckingEvaluator::new(model.clone())
            .evaluate(input(&docs))
            .await
            .unwrap();
        assert!(verdict.pass);

        let prompt = model.requests()[0].messages[0].content().to_string();
        assert!(prompt.contains("Employees are entitled to 24 paid leaves per year."));
        assert!(prompt.contains("Claim:\n24 paid leaves."));

        let model = Arc::new(SequentialMockModel::single_text("No."));
        let verdict = FactCheckingEvaluator::new(model).evaluate(input(&docs)).await.unwrap();
        assert!(!verdict.pass);
        assert_eq!(verdict.rationale.as_deref(), Some("No."));
    }

    #[tokio::test]
    async fn relevancy_reads_uppercase() {
        let model = Arc::new(SequentialMockModel::single_text("YES"));
        let verdict = RelevancyEvaluator::new(model.clone()).evaluate(input(&[])).await.unwrap();
        assert!(verdict.pass);
        assert_eq!(verdict.score, Some(1.0));
        assert!(model.requests()[0].messages[0]
            .content()
            .contains("Query:\nHow many paid leaves"));
    }

    #[tokio::test]
    async fn unparseable_and_model_errors() {
        let model = Arc::new(SequentialMockModel::single_text("Maybe, it depends."));
        let err = RelevancyEvaluator::new(model).evaluate(input(&[])).await.unwrap_err();
        assert!(matches!(err, EvaluationError::Unparseable(_)));

        let model = Arc::new(FailingModel(ModelError::RateLimited { retry_after_secs: 5 }));
        let err = FactCheckingEvaluator::new(model).evaluate(input(&[])).await.unwrap_err();
        assert!(matches!(err, EvaluationError::Model(_)));
    }
}
