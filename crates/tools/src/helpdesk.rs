//! Helpdesk tools: open support tickets and look up their status.
//!
//! Both tools act on behalf of the caller named by the `username` entry of
//! the call context, never on a user the model names in its arguments.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use colloquy_core::context::CallContext;
use colloquy_core::error::ToolError;
use colloquy_core::tool::Tool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::info;

/// Call-context key holding the acting user.
pub const USERNAME_KEY: &str = "username";

/// Tickets are promised within this many days.
const ETA_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    InProgress,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpDeskTicket {
    pub id: u64,
    pub username: String,
    pub issue: String,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
    pub eta: DateTime<Utc>,
}

/// In-process ticket store shared by the helpdesk tools.
#[derive(Default)]
pub struct TicketRepository {
    next_id: AtomicU64,
    tickets: RwLock<Vec<HelpDeskTicket>>,
}

impl TicketRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, username: &str, issue: &str) -> HelpDeskTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let ticket = HelpDeskTicket {
            id,
            username: username.to_string(),
            issue: issue.to_string(),
            status: TicketStatus::Open,
            created_at: now,
            eta: now + Duration::days(ETA_DAYS),
        };
        self.tickets.write().await.push(ticket.clone());
        ticket
    }

    pub async fn by_username(&self, username: &str) -> Vec<HelpDeskTicket> {
        self.tickets
            .read()
            .await
            .iter()
            .filter(|t| t.username == username)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.tickets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tickets.read().await.is_empty()
    }
}

fn username<'a>(tool: &str, context: &'a CallContext) -> Result<&'a str, ToolError> {
    context
        .get_str(USERNAME_KEY)
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ToolError::MissingContext {
            tool_name: tool.to_string(),
            key: USERNAME_KEY.to_string(),
        })
}

/// `createTicket`: its confirmation is the final answer.
pub struct CreateTicketTool {
    tickets: Arc<TicketRepository>,
}

impl CreateTicketTool {
    pub fn new(tickets: Arc<TicketRepository>) -> Self {
        Self { tickets }
    }
}

#[async_trait]
impl Tool for CreateTicketTool {
    fn name(&self) -> &str {
        "createTicket"
    }

    fn description(&self) -> &str {
        "Create a new support ticket for the current user"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "issue": {
                    "type": "string",
                    "description": "Details of the problem to open a support ticket for"
                }
            },
            "required": ["issue"]
        })
    }

    fn returns_direct(&self) -> bool {
        true
    }

    fn required_context(&self) -> &[&str] {
        &[USERNAME_KEY]
    }

    async fn invoke(
        &self,
        arguments: serde_json::Value,
        context: &CallContext,
    ) -> Result<String, ToolError> {
        let username = username(self.name(), context)?;
        let issue = arguments["issue"]
            .as_str()
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments {
                tool_name: self.name().to_string(),
                reason: "Missing 'issue' argument".into(),
            })?;

        let ticket = self.tickets.create(username, issue).await;
        info!(ticket_id = ticket.id, username = %username, "Ticket created");
        Ok(format!(
            "Ticket #{} created successfully for user: {}",
            ticket.id, username
        ))
    }
}

/// `getTicketStatus`: lists the caller's tickets as JSON.
pub struct TicketStatusTool {
    tickets: Arc<TicketRepository>,
}

impl TicketStatusTool {
    pub fn new(tickets: Arc<TicketRepository>) -> Self {
        Self { tickets }
    }
}

#[async_trait]
impl Tool for TicketStatusTool {
    fn name(&self) -> &str {
        "getTicketStatus"
    }

    fn description(&self) -> &str {
        "Fetch the status of the current user's support tickets"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    fn required_context(&self) -> &[&str] {
        &[USERNAME_KEY]
    }

    async fn invoke(
        &self,
        _arguments: serde_json::Value,
        context: &CallContext,
    ) -> Result<String, ToolError> {
        let username = username(self.name(), context)?;
        let tickets = self.tickets.by_username(username).await;
        info!(username = %username, count = tickets.len(), "Fetched ticket status");

        serde_json::to_string(&tickets).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}
