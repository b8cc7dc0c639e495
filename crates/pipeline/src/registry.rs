//! Name → advisor table, used to lay out the chain from configuration.

use crate::advisor::Advisor;
use crate::advisors::{
    LoggerAdvisor, MemoryAdvisor, RetrievalAdvisor, ToolDispatchAdvisor, UsageAuditAdvisor,
};
use colloquy_config::AppConfig;
use colloquy_core::error::ConfigurationError;
use colloquy_core::event::EventBus;
use colloquy_core::retrieval::VectorIndex;
use colloquy_core::tool::ToolRegistry;
use colloquy_memory::ConversationMemory;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct AdvisorRegistry {
    advisors: HashMap<String, Arc<dyn Advisor>>,
}

impl AdvisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in advisors wired from configuration.
    ///
    /// `memory` and `retrieval` are only registered when their collaborator
    /// is given; `tool_dispatch` only when there is at least one tool.
    pub fn standard(
        config: &AppConfig,
        memory: Option<Arc<ConversationMemory>>,
        index: Option<Arc<dyn VectorIndex>>,
        tools: Arc<ToolRegistry>,
        events: &EventBus,
    ) -> Self {
        let mut advisors: Vec<Arc<dyn Advisor>> = vec![
            Arc::new(LoggerAdvisor),
            Arc::new(UsageAuditAdvisor::new(events.clone())),
        ];
        if let Some(memory) = memory {
            advisors.push(Arc::new(
                MemoryAdvisor::new(memory).with_policy(config.memory.on_failure),
            ));
        }
        if let Some(index) = index {
            advisors.push(Arc::new(RetrievalAdvisor::from_config(
                index,
                &config.retrieval,
                events.clone(),
            )));
        }
        if !tools.is_empty() {
            advisors.push(Arc::new(ToolDispatchAdvisor::from_config(
                tools,
                &config.tools,
                events.clone(),
            )));
        }

        let advisors = advisors
            .into_iter()
            .map(|a| (a.name().to_string(), a))
            .collect();
        Self { advisors }
    }

    pub fn register(&mut self, advisor: Arc<dyn Advisor>) -> Result<(), ConfigurationError> {
        let name = advisor.name().to_string();
        if self.advisors.contains_key(&name) {
            return Err(ConfigurationError::DuplicateAdvisor(name));
        }
        self.advisors.insert(name, advisor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Advisor>> {
        self.advisors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.advisors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.advisors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The advisors named, in the order named.
    ///
    /// An unregistered name or a name listed twice is a configuration error.
    pub fn resolve<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<Arc<dyn Advisor>>, ConfigurationError> {
        let mut chain: Vec<Arc<dyn Advisor>> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if chain.iter().any(|a| a.name() == name) {
                return Err(ConfigurationError::DuplicateAdvisor(name.to_string()));
            }
            let advisor = self
                .advisors
                .get(name)
                .ok_or_else(|| ConfigurationError::UnknownAdvisor(name.to_string()))?;
            chain.push(advisor.clone());
        }
        Ok(chain)
    }
}

impl std::fmt::Debug for AdvisorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisorRegistry")
            .field("advisors", &self.names())
            .finish()
    }
}
