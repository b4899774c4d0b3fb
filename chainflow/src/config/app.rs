//! App composition: several pipelines ("agents") run in order groups.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Order assigned to agents that do not declare one.
pub const DEFAULT_RUN_ORDER: i64 = 999;

/// One agent entry of an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// The pipeline to run.
    pub agent_name: String,
    /// Ascending execution order; equal values run together.
    #[serde(default)]
    pub run_order: Option<i64>,
    /// Binding name under which later agents see this agent's output.
    #[serde(default)]
    pub result_name: Option<String>,
}

impl AgentInfo {
    /// Creates an agent entry with no order and no result name.
    #[must_use]
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            run_order: None,
            result_name: None,
        }
    }

    /// Sets the run order.
    #[must_use]
    pub fn with_run_order(mut self, order: i64) -> Self {
        self.run_order = Some(order);
        self
    }

    /// Sets the result name.
    #[must_use]
    pub fn with_result_name(mut self, name: impl Into<String>) -> Self {
        self.result_name = Some(name.into());
        self
    }

    /// The effective run order.
    #[must_use]
    pub fn order(&self) -> i64 {
        self.run_order.unwrap_or(DEFAULT_RUN_ORDER)
    }
}

/// An app: an ordered set of agents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppSpec {
    /// The agents, in declaration order.
    pub agents: Vec<AgentInfo>,
}

impl AppSpec {
    /// Creates an app from its agents.
    #[must_use]
    pub fn new(agents: Vec<AgentInfo>) -> Self {
        Self { agents }
    }

    /// Groups agents by run order, smallest order first. Declaration order is
    /// kept inside a group.
    #[must_use]
    pub fn order_groups(&self) -> Vec<(i64, Vec<&AgentInfo>)> {
        let mut groups: BTreeMap<i64, Vec<&AgentInfo>> = BTreeMap::new();
        for agent in &self.agents {
            groups.entry(agent.order()).or_default().push(agent);
        }
        groups.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_groups() {
        let app = AppSpec::new(vec![
            AgentInfo::new("answer"),
            AgentInfo::new("retrieve").with_run_order(1).with_result_name("context"),
            AgentInfo::new("rewrite").with_run_order(1),
            AgentInfo::new("rank").with_run_order(2),
        ]);

        let groups = app.order_groups();
        let orders: Vec<i64> = groups.iter().map(|(o, _)| *o).collect();
        assert_eq!(orders, vec![1, 2, DEFAULT_RUN_ORDER]);

        let first: Vec<&str> = groups[0].1.iter().map(|a| a.agent_name.as_str()).collect();
        assert_eq!(first, vec!["retrieve", "rewrite"]);
    }

    #[test]
    fn test_deserialize_list() {
        let yaml = r"
- agent_name: retrieve
  run_order: 1
  result_name: context
- agent_name: answer
";
        let app: AppSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(app.agents.len(), 2);
        assert_eq!(app.agents[1].order(), DEFAULT_RUN_ORDER);
    }
}
