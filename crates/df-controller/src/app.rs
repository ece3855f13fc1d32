//! Application trait and pipeline mutation retry.

use std::sync::Arc;

use async_trait::async_trait;
use df_model::{EntityKind, EventKind};
use df_pipeline::{Datapath, FlowMod};
use log::{debug, warn};

use crate::config::RetryPolicy;
use crate::dispatcher::{EventDispatcher, EventHandler};
use crate::error::{HandlerError, Result};

/// A flow compiler application.
///
/// Applications receive lifecycle events through [`EventHandler::handle`] and
/// translate them into pipeline mutations.
///
/// # Lifecycle
///
/// 1. Construction: the app is built with its store, device and config
/// 2. Registration: [`EventDispatcher::register_app`] subscribes it to
///    every pair returned by `subscriptions()`
/// 3. Attach: `on_datapath_attached()` installs baseline rules
/// 4. Events: `handle()` is called once per dispatched event
#[async_trait]
pub trait DfApp: EventHandler {
    /// The (entity kind, event kind) pairs this app handles.
    fn subscriptions(&self) -> Vec<(EntityKind, EventKind)>;

    /// Called once the forwarding device is reachable.
    async fn on_datapath_attached(&self) -> Result<()> {
        Ok(())
    }
}

impl EventDispatcher {
    /// Subscribes `app` to each of its pairs, in the order it lists them.
    pub fn register_app<A: DfApp + 'static>(&mut self, app: Arc<A>) {
        for (kind, event) in app.subscriptions() {
            let handler: Arc<dyn EventHandler> = app.clone();
            self.register(kind, event, handler);
        }
    }
}

/// Issues pipeline mutations, retrying failures with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationRetry {
    policy: RetryPolicy,
}

impl Default for MutationRetry {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl MutationRetry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Applies `flow`. Earlier successful mutations are not rolled back when
    /// this one finally fails.
    pub async fn apply(&self, datapath: &dyn Datapath, flow: FlowMod) -> Result<()> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1;

        loop {
            debug!(
                "{:?} {} attempt {}",
                flow.command,
                flow.rule_id(),
                attempt
            );
            match datapath.mutate(flow.clone()).await {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= max_attempts => {
                    return Err(HandlerError::Datapath {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(
                        "Pipeline mutation {} failed (attempt {}/{}): {}, retrying in {:?}",
                        flow.rule_id(),
                        attempt,
                        max_attempts,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(self.policy.multiplier);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use df_pipeline::{
        Action, DatapathError, FlowPipeline, Instructions, Match, PipelineTable, Priority,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2,
        }
    }

    fn output_flow() -> FlowMod {
        FlowMod::install(
            PipelineTable::IngressClassification,
            Priority::MEDIUM,
            Match::new().in_port(1),
            Instructions::apply(vec![Action::Output(2)]),
        )
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let pipeline = FlowPipeline::new();
        pipeline.fail_next(2);
        let flow = output_flow();

        MutationRetry::new(policy(3))
            .apply(&pipeline, flow.clone())
            .await
            .unwrap();
        assert!(pipeline.contains(&flow.rule_id()));
        assert_eq!(pipeline.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let pipeline = FlowPipeline::new();
        pipeline.fail_next(5);

        let err = MutationRetry::new(policy(3))
            .apply(&pipeline, output_flow())
            .await
            .unwrap_err();
        match err {
            HandlerError::Datapath { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(source, DatapathError::Io(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(pipeline.is_empty());
    }
}
