//! Label switched routing.
//!
//! Compiles labeled routes into pipeline rules:
//!
//! - traffic arriving on the uplink with a local route's label has the label
//!   popped and is handed to the bound port's ingress dispatch
//! - traffic for a remote route's prefix in the helper port's network gets
//!   the route's label pushed and leaves through the uplink
//!
//! Routes whose port or switch has not been seen yet are parked until the
//! store delivers it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use df_model::{
    Entity, EntityKind, EventKind, LocalLabeledRoute, LogicalPort, LogicalSwitch,
    RemoteLabeledRoute,
};
use df_nb::NbApi;
use df_pipeline::{
    Action, Datapath, Field, FlowMod, Instructions, Match, PipelineTable, Priority, RuleId,
    ARP_REPLY, ARP_REQUEST, ETH_TYPE_ARP, ETH_TYPE_IPV4, ETH_TYPE_IPV6, ETH_TYPE_MPLS,
};
use log::{debug, error, info};
use parking_lot::Mutex;

use crate::app::{DfApp, MutationRetry};
use crate::config::MplsSettings;
use crate::dispatcher::{EventHandler, NbEvent};
use crate::error::{HandlerError, Result};
use crate::port_resolver::PortResolver;
use crate::retry::{Constraint, RetryCache};

/// Key of a labeled route in the app's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteRef {
    Local(String),
    Remote(String),
}

impl std::fmt::Display for RouteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteRef::Local(id) => write!(f, "llroutes:{id}"),
            RouteRef::Remote(id) => write!(f, "rlroutes:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LabeledRoute {
    Local(LocalLabeledRoute),
    Remote(RemoteLabeledRoute),
}

impl LabeledRoute {
    fn key(&self) -> RouteRef {
        match self {
            LabeledRoute::Local(route) => RouteRef::Local(route.id.clone()),
            LabeledRoute::Remote(route) => RouteRef::Remote(route.id.clone()),
        }
    }

    /// Port whose switch owns the route.
    fn port(&self) -> &str {
        match self {
            LabeledRoute::Local(route) => &route.port,
            LabeledRoute::Remote(route) => &route.helper_port,
        }
    }
}

#[derive(Debug)]
struct Installed {
    rule: RuleId,
    route: LabeledRoute,
    lport: String,
    lswitch: String,
}

#[derive(Debug, Default)]
struct MplsState {
    installed: HashMap<RouteRef, Installed>,
    parked: RetryCache<RouteRef, LabeledRoute>,
}

enum Compiled {
    Ready {
        flow: FlowMod,
        lport: String,
        lswitch: String,
    },
    Missing(Constraint),
}

pub struct MplsApp {
    nb: Arc<dyn NbApi>,
    datapath: Arc<dyn Datapath>,
    ports: Arc<dyn PortResolver>,
    settings: MplsSettings,
    retry: MutationRetry,
    state: Mutex<MplsState>,
}

impl MplsApp {
    pub fn new(
        nb: Arc<dyn NbApi>,
        datapath: Arc<dyn Datapath>,
        ports: Arc<dyn PortResolver>,
        settings: MplsSettings,
        retry: MutationRetry,
    ) -> Self {
        Self {
            nb,
            datapath,
            ports,
            settings,
            retry,
            state: Mutex::new(MplsState::default()),
        }
    }

    pub fn settings(&self) -> &MplsSettings {
        &self.settings
    }

    /// Rule currently installed for a route.
    pub fn installed_rule(&self, route: &RouteRef) -> Option<RuleId> {
        self.state.lock().installed.get(route).map(|i| i.rule.clone())
    }

    pub fn installed_count(&self) -> usize {
        self.state.lock().installed.len()
    }

    pub fn is_parked(&self, route: &RouteRef) -> bool {
        self.state.lock().parked.contains(route)
    }

    pub fn parked_count(&self) -> usize {
        self.state.lock().parked.len()
    }

    fn uplink(&self) -> Result<u32> {
        self.ports
            .port_number(&self.settings.uplink_port)
            .ok_or_else(|| {
                HandlerError::Unresolved(format!(
                    "port number of uplink {}",
                    self.settings.uplink_port
                ))
            })
    }

    fn flow(&self, table: PipelineTable, matches: Match, instructions: Instructions) -> FlowMod {
        FlowMod::install(table, Priority::HIGH, matches, instructions)
            .with_timeouts(self.settings.idle_timeout, self.settings.hard_timeout)
    }

    /// Answers ARP requests for the interface address out of the uplink.
    fn arp_responder(&self, uplink: u32) -> FlowMod {
        let matches = Match::new()
            .in_port(uplink)
            .eth_type(ETH_TYPE_ARP)
            .arp_tpa(self.settings.interface_ip)
            .arp_op(ARP_REQUEST);
        let actions = vec![
            Action::SetArpOp(ARP_REPLY),
            Action::MoveField {
                src: Field::ArpSha,
                dst: Field::ArpTha,
            },
            Action::MoveField {
                src: Field::ArpSha,
                dst: Field::EthDst,
            },
            Action::MoveField {
                src: Field::ArpSpa,
                dst: Field::ArpTpa,
            },
            Action::SetEthSrc(self.settings.mac),
            Action::SetArpSha(self.settings.mac),
            Action::SetArpSpa(self.settings.interface_ip),
            Action::ClearInPort,
            Action::Output(uplink),
        ];
        FlowMod::install(
            PipelineTable::IngressClassification,
            Priority::MEDIUM,
            matches,
            Instructions::apply(actions),
        )
    }

    /// Sends labeled uplink traffic to label processing.
    fn mpls_continue(&self, uplink: u32) -> FlowMod {
        FlowMod::install(
            PipelineTable::IngressClassification,
            Priority::MEDIUM,
            Match::new().in_port(uplink).eth_type(ETH_TYPE_MPLS),
            Instructions::goto(PipelineTable::IngressMpls),
        )
    }

    /// Follows the route's port to its switch through the store.
    async fn resolve(
        &self,
        route: &LabeledRoute,
    ) -> Result<std::result::Result<(LogicalPort, LogicalSwitch), Constraint>> {
        let port_id = route.port();
        let Some(lport) = self.nb.get_logical_port(port_id).await? else {
            return Ok(Err(Constraint::new(EntityKind::LogicalPort, port_id)));
        };
        let Some(lswitch) = self.nb.get_logical_switch(&lport.lswitch).await? else {
            return Ok(Err(Constraint::new(EntityKind::LogicalSwitch, &lport.lswitch)));
        };
        Ok(Ok((lport, lswitch)))
    }

    async fn compile(&self, route: &LabeledRoute) -> Result<Compiled> {
        let (lport, lswitch) = match self.resolve(route).await? {
            Ok(resolved) => resolved,
            Err(missing) => return Ok(Compiled::Missing(missing)),
        };
        let uplink = self.uplink()?;

        let flow = match route {
            LabeledRoute::Local(route) => {
                let port_mac = lport.mac().ok_or_else(|| {
                    HandlerError::Unresolved(format!("MAC of logical port {}", lport.id))
                })?;
                let payload_type = match route.destination {
                    ipnet::IpNet::V4(_) => ETH_TYPE_IPV4,
                    ipnet::IpNet::V6(_) => ETH_TYPE_IPV6,
                };
                let matches = Match::new()
                    .in_port(uplink)
                    .eth_type(ETH_TYPE_MPLS)
                    .mpls_label(route.label);
                let actions = vec![
                    Action::PopMpls {
                        eth_type: payload_type,
                    },
                    Action::SetEthDst(port_mac),
                    Action::SetReg7(lport.tunnel_key),
                    Action::SetMetadata(lswitch.unique_key),
                ];
                self.flow(
                    PipelineTable::IngressMpls,
                    matches,
                    Instructions::apply(actions).then_goto(PipelineTable::IngressDispatch),
                )
            }
            LabeledRoute::Remote(route) => {
                let nexthop_mac = self.nexthop_mac(route.nexthop)?;
                let matches = Match::new()
                    .metadata(lswitch.unique_key)
                    .ip_dst(route.destination);
                let actions = vec![
                    Action::PushMpls {
                        eth_type: ETH_TYPE_MPLS,
                    },
                    Action::SetMplsLabel(route.label),
                    Action::SetEthSrc(self.settings.mac),
                    Action::SetEthDst(nexthop_mac),
                    Action::Output(uplink),
                ];
                self.flow(PipelineTable::L3Lookup, matches, Instructions::apply(actions))
            }
        };

        Ok(Compiled::Ready {
            flow,
            lport: lport.id,
            lswitch: lswitch.id,
        })
    }

    // Static table for now; the rule shape stays the same once next hops
    // are resolved dynamically.
    fn nexthop_mac(&self, nexthop: IpAddr) -> Result<df_model::MacAddress> {
        self.settings
            .nexthop_macs
            .get(&nexthop)
            .copied()
            .ok_or_else(|| HandlerError::Unresolved(format!("MAC of next hop {nexthop}")))
    }

    /// Installs (or replaces) the rule for a route, parking it when its port
    /// or switch is unknown.
    async fn install(&self, route: LabeledRoute) -> Result<()> {
        let key = route.key();
        let previous = self
            .state
            .lock()
            .installed
            .get(&key)
            .map(|i| i.rule.clone());

        let compiled = match self.compile(&route).await {
            Ok(compiled) => compiled,
            Err(e) => {
                // The stored route no longer matches what is installed.
                if let Err(withdraw) = self.withdraw(&key, previous).await {
                    error!("Failed to withdraw route {}: {}", key, withdraw);
                }
                return Err(e);
            }
        };

        match compiled {
            Compiled::Missing(constraint) => {
                if let Some(rule) = previous {
                    self.retry
                        .apply(self.datapath.as_ref(), FlowMod::delete(rule))
                        .await?;
                }
                info!("Route {} waits for {}", key, constraint);
                let mut state = self.state.lock();
                state.installed.remove(&key);
                state.parked.park(key, route, [constraint]);
            }
            Compiled::Ready {
                flow,
                lport,
                lswitch,
            } => {
                let rule = flow.rule_id();
                if let Some(stale) = previous.filter(|p| *p != rule) {
                    self.retry
                        .apply(self.datapath.as_ref(), FlowMod::delete(stale))
                        .await?;
                    self.state.lock().installed.remove(&key);
                }
                self.retry.apply(self.datapath.as_ref(), flow).await?;
                info!("Route {} installed as {}", key, rule);

                let mut state = self.state.lock();
                state.parked.remove(&key);
                state.installed.insert(
                    key,
                    Installed {
                        rule,
                        route,
                        lport,
                        lswitch,
                    },
                );
            }
        }
        Ok(())
    }

    /// Drops every trace of a route whose current version cannot be compiled.
    async fn withdraw(&self, key: &RouteRef, previous: Option<RuleId>) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.parked.remove(key);
            state.installed.remove(key);
        }
        if let Some(rule) = previous {
            self.retry
                .apply(self.datapath.as_ref(), FlowMod::delete(rule.clone()))
                .await?;
            info!("Route {} withdrawn ({})", key, rule);
        }
        Ok(())
    }

    async fn remove(&self, key: RouteRef) -> Result<()> {
        let installed = {
            let mut state = self.state.lock();
            if state.parked.remove(&key).is_some() {
                debug!("Dropped parked route {}", key);
            }
            state.installed.remove(&key)
        };

        match installed {
            Some(installed) => {
                self.retry
                    .apply(self.datapath.as_ref(), FlowMod::delete(installed.rule.clone()))
                    .await?;
                info!("Route {} removed ({})", key, installed.rule);
            }
            None => debug!("Route {} has no installed rule", key),
        }
        Ok(())
    }

    /// Recompiles routes waiting on, or built from, an updated port or switch.
    async fn refresh(&self, changed: Constraint) -> Result<()> {
        let routes: Vec<LabeledRoute> = {
            let mut state = self.state.lock();
            let mut routes: Vec<LabeledRoute> = state
                .parked
                .satisfy(&changed)
                .into_iter()
                .map(|(_, route)| route)
                .collect();
            routes.extend(
                state
                    .installed
                    .values()
                    .filter(|i| match changed.kind {
                        EntityKind::LogicalPort => i.lport == changed.id,
                        EntityKind::LogicalSwitch => i.lswitch == changed.id,
                        _ => false,
                    })
                    .map(|i| i.route.clone()),
            );
            routes
        };

        let mut first_error = None;
        for route in routes {
            let key = route.key();
            if let Err(e) = self.install(route).await {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    error!("Failed to recompile route {} after {}: {}", key, changed, e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn payload<T: TryFrom<Entity>>(event: &NbEvent) -> Result<T> {
    event
        .entity()
        .cloned()
        .and_then(|entity| T::try_from(entity).ok())
        .ok_or(HandlerError::UnexpectedPayload {
            kind: event.kind,
            event: event.event,
        })
}

#[async_trait]
impl EventHandler for MplsApp {
    fn name(&self) -> &str {
        "mpls"
    }

    async fn handle(&self, event: &NbEvent) -> Result<()> {
        match (event.kind, event.event) {
            (EntityKind::LocalLabeledRoute, EventKind::Created) => {
                self.install(LabeledRoute::Local(payload(event)?)).await
            }
            (EntityKind::LocalLabeledRoute, EventKind::Deleted) => {
                self.remove(RouteRef::Local(event.id().to_string())).await
            }
            (EntityKind::RemoteLabeledRoute, EventKind::Created) => {
                self.install(LabeledRoute::Remote(payload(event)?)).await
            }
            (EntityKind::RemoteLabeledRoute, EventKind::Deleted) => {
                self.remove(RouteRef::Remote(event.id().to_string())).await
            }
            (EntityKind::LogicalPort | EntityKind::LogicalSwitch, EventKind::Updated) => {
                self.refresh(Constraint::new(event.kind, event.id())).await
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DfApp for MplsApp {
    fn subscriptions(&self) -> Vec<(EntityKind, EventKind)> {
        vec![
            (EntityKind::LocalLabeledRoute, EventKind::Created),
            (EntityKind::LocalLabeledRoute, EventKind::Deleted),
            (EntityKind::RemoteLabeledRoute, EventKind::Created),
            (EntityKind::RemoteLabeledRoute, EventKind::Deleted),
            (EntityKind::LogicalPort, EventKind::Updated),
            (EntityKind::LogicalSwitch, EventKind::Updated),
        ]
    }

    async fn on_datapath_attached(&self) -> Result<()> {
        let uplink = self.uplink()?;
        info!(
            "Installing label switching baseline on {} ({} port {})",
            self.settings.bridge, self.settings.uplink_port, uplink
        );
        self.retry
            .apply(self.datapath.as_ref(), self.arp_responder(uplink))
            .await?;
        self.retry
            .apply(self.datapath.as_ref(), self.mpls_continue(uplink))
            .await
    }
}
