//! The pipeline mutation primitive and an in-memory device.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;

use crate::error::{DatapathError, Result};
use crate::flow::{FlowCommand, FlowMod, Instructions, RuleId};
use crate::table::PipelineTable;

/// A forwarding device that accepts flow mutations.
///
/// Installing a rule whose identity already exists replaces it. Deleting a
/// rule that does not exist succeeds.
#[async_trait]
pub trait Datapath: Send + Sync {
    async fn mutate(&self, flow: FlowMod) -> Result<()>;
}

/// An installed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEntry {
    pub instructions: Instructions,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
}

#[derive(Debug, Default)]
struct PipelineState {
    rules: BTreeMap<RuleId, FlowEntry>,
    fail_next: u32,
    mutations: u64,
}

/// In-memory pipeline. Holds the rule table a real device would hold, so it
/// serves both as a software datapath and as the device under test.
#[derive(Debug, Default)]
pub struct FlowPipeline {
    state: Mutex<PipelineState>,
}

impl FlowPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` mutations fail with an I/O error.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    pub fn get(&self, rule: &RuleId) -> Option<FlowEntry> {
        self.state.lock().rules.get(rule).cloned()
    }

    pub fn contains(&self, rule: &RuleId) -> bool {
        self.state.lock().rules.contains_key(rule)
    }

    pub fn len(&self) -> usize {
        self.state.lock().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rules of one table, highest priority first.
    pub fn rules_in(&self, table: PipelineTable) -> Vec<(RuleId, FlowEntry)> {
        let state = self.state.lock();
        let mut rules: Vec<_> = state
            .rules
            .iter()
            .filter(|(id, _)| id.table == table)
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        rules.sort_by(|a, b| b.0.priority.cmp(&a.0.priority));
        rules
    }

    /// Mutations applied so far, failed attempts excluded.
    pub fn mutation_count(&self) -> u64 {
        self.state.lock().mutations
    }
}

#[async_trait]
impl Datapath for FlowPipeline {
    async fn mutate(&self, flow: FlowMod) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(DatapathError::Io("injected failure".to_string()));
        }

        let rule = flow.rule_id();
        match flow.command {
            FlowCommand::Install => {
                let entry = FlowEntry {
                    instructions: flow.instructions,
                    idle_timeout: flow.idle_timeout,
                    hard_timeout: flow.hard_timeout,
                };
                if state.rules.insert(rule.clone(), entry).is_some() {
                    debug!("Replaced flow {}", rule);
                } else {
                    debug!("Installed flow {}", rule);
                }
            }
            FlowCommand::Delete => {
                if state.rules.remove(&rule).is_some() {
                    debug!("Deleted flow {}", rule);
                }
            }
        }
        state.mutations += 1;
        Ok(())
    }
}
