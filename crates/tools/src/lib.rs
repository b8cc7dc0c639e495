//! Built-in tool implementations for Colloquy.
//!
//! Tools let the model act on the caller's behalf: open helpdesk tickets,
//! look up their status, and tell the time.

pub mod helpdesk;
pub mod time;

use colloquy_core::error::ConfigurationError;
use colloquy_core::tool::{Tool, ToolRegistry};
use std::sync::Arc;

pub use helpdesk::{
    CreateTicketTool, HelpDeskTicket, TicketRepository, TicketStatus, TicketStatusTool,
};
pub use time::{CurrentLocalTimeTool, CurrentTimeTool};

/// Names of every built-in tool, in registration order.
pub const BUILTIN_TOOLS: &[&str] = &[
    "createTicket",
    "getTicketStatus",
    "getCurrentLocalTime",
    "getCurrentTime",
];

fn builtin(name: &str, tickets: &Arc<TicketRepository>) -> Option<Arc<dyn Tool>> {
    let tool: Arc<dyn Tool> = match name {
        "createTicket" => Arc::new(CreateTicketTool::new(tickets.clone())),
        "getTicketStatus" => Arc::new(TicketStatusTool::new(tickets.clone())),
        "getCurrentLocalTime" => Arc::new(CurrentLocalTimeTool),
        "getCurrentTime" => Arc::new(CurrentTimeTool),
        _ => return None,
    };
    Some(tool)
}

/// Build a registry holding the named built-in tools, in the given order.
///
/// Unknown names and duplicates are configuration errors.
pub fn default_registry<S: AsRef<str>>(
    enabled: &[S],
    tickets: Arc<TicketRepository>,
) -> Result<ToolRegistry, ConfigurationError> {
    let mut registry = ToolRegistry::new();
    for name in enabled {
        let name = name.as_ref();
        let tool = builtin(name, &tickets).ok_or_else(|| {
            ConfigurationError::Invalid(format!(
                "Unknown tool '{name}' (available: {})",
                BUILTIN_TOOLS.join(", ")
            ))
        })?;
        registry.register(tool)?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_builtins() {
        let registry = default_registry(BUILTIN_TOOLS, Arc::new(TicketRepository::new())).unwrap();
        assert_eq!(registry.names(), BUILTIN_TOOLS.to_vec());
        assert!(registry.get("createTicket").unwrap().returns_direct());
        assert!(!registry.get("getCurrentTime").unwrap().returns_direct());
    }

    #[test]
    fn subset_and_empty() {
        let registry =
            default_registry(&["getCurrentTime"], Arc::new(TicketRepository::new())).unwrap();
        assert_eq!(registry.len(), 1);

        let empty: [&str; 0] = [];
        assert!(default_registry(&empty, Arc::new(TicketRepository::new()))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unknown_and_duplicate_names_rejected() {
        let tickets = Arc::new(TicketRepository::new());
        let err = default_registry(&["launchRockets"], tickets.clone()).unwrap_err();
        assert!(matches!(err, ConfigurationError::Invalid(_)));

        let err = default_registry(&["getCurrentTime", "getCurrentTime"], tickets).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateTool(_)));
    }
}
