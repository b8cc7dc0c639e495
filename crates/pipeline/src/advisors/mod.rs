//! Built-in advisors.
//!
//! | name            | request path                    | response path                 |
//! |-----------------|---------------------------------|-------------------------------|
//! | `logger`        | logs the outgoing request       | logs the reply                |
//! | `memory`        | loads history + system prompt   | (persisting is the executor's)|
//! | `retrieval`     | injects retrieved context       | attaches the documents        |
//! | `tool_dispatch` | offers the tools                | runs intents, loops the model |
//! | `usage`         |                                 | accumulates token usage       |

pub mod logger;
pub mod memory;
pub mod retrieval;
pub mod tool_dispatch;
pub mod usage;

pub use logger::LoggerAdvisor;
pub use memory::MemoryAdvisor;
pub use retrieval::RetrievalAdvisor;
pub use tool_dispatch::ToolDispatchAdvisor;
pub use usage::UsageAuditAdvisor;
