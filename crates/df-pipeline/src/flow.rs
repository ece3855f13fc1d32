//! Flow rules: matches, actions and instructions.

use std::fmt;
use std::net::Ipv4Addr;

use df_model::MacAddress;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::table::{PipelineTable, Priority};

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_IPV6: u16 = 0x86dd;
pub const ETH_TYPE_MPLS: u16 = 0x8847;

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

/// Exact-match field set of a rule. Unset fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Match {
    pub in_port: Option<u32>,
    pub eth_type: Option<u16>,
    pub arp_op: Option<u16>,
    pub arp_tpa: Option<Ipv4Addr>,
    pub mpls_label: Option<u32>,
    /// Network key of the owning logical switch.
    pub metadata: Option<u64>,
    pub ipv4_dst: Option<Ipv4Net>,
    pub ipv6_dst: Option<Ipv6Net>,
}

impl Match {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_port(mut self, port: u32) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn eth_type(mut self, eth_type: u16) -> Self {
        self.eth_type = Some(eth_type);
        self
    }

    pub fn arp_op(mut self, op: u16) -> Self {
        self.arp_op = Some(op);
        self
    }

    pub fn arp_tpa(mut self, ip: Ipv4Addr) -> Self {
        self.arp_tpa = Some(ip);
        self
    }

    pub fn mpls_label(mut self, label: u32) -> Self {
        self.mpls_label = Some(label);
        self
    }

    pub fn metadata(mut self, metadata: u64) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Matches a destination prefix, setting the ethertype to match.
    pub fn ip_dst(mut self, prefix: IpNet) -> Self {
        match prefix {
            IpNet::V4(net) => {
                self.eth_type = Some(ETH_TYPE_IPV4);
                self.ipv4_dst = Some(net.trunc());
            }
            IpNet::V6(net) => {
                self.eth_type = Some(ETH_TYPE_IPV6);
                self.ipv6_dst = Some(net.trunc());
            }
        }
        self
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(v) = self.in_port {
            parts.push(format!("in_port={v}"));
        }
        if let Some(v) = self.eth_type {
            parts.push(format!("eth_type=0x{v:04x}"));
        }
        if let Some(v) = self.arp_op {
            parts.push(format!("arp_op={v}"));
        }
        if let Some(v) = self.arp_tpa {
            parts.push(format!("arp_tpa={v}"));
        }
        if let Some(v) = self.mpls_label {
            parts.push(format!("mpls_label={v}"));
        }
        if let Some(v) = self.metadata {
            parts.push(format!("metadata={v}"));
        }
        if let Some(v) = self.ipv4_dst {
            parts.push(format!("ipv4_dst={v}"));
        }
        if let Some(v) = self.ipv6_dst {
            parts.push(format!("ipv6_dst={v}"));
        }
        if parts.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&parts.join(","))
        }
    }
}

/// Header fields addressable by register moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    EthSrc,
    EthDst,
    ArpSha,
    ArpTha,
    ArpSpa,
    ArpTpa,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    SetArpOp(u16),
    /// Copies one header field into another.
    MoveField { src: Field, dst: Field },
    SetEthSrc(MacAddress),
    SetEthDst(MacAddress),
    SetArpSha(MacAddress),
    SetArpSpa(Ipv4Addr),
    /// Clears the input port so the packet may leave through it.
    ClearInPort,
    Output(u32),
    PopMpls { eth_type: u16 },
    PushMpls { eth_type: u16 },
    SetMplsLabel(u32),
    /// Logical port key of the destination.
    SetReg7(u32),
    SetMetadata(u64),
}

/// What a rule does with a matching packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Instructions {
    pub actions: Vec<Action>,
    pub goto: Option<PipelineTable>,
}

impl Instructions {
    /// Applies `actions` and stops.
    pub fn apply(actions: Vec<Action>) -> Self {
        Self {
            actions,
            goto: None,
        }
    }

    /// Continues to `table` without modifying the packet.
    pub fn goto(table: PipelineTable) -> Self {
        Self {
            actions: Vec::new(),
            goto: Some(table),
        }
    }

    pub fn then_goto(mut self, table: PipelineTable) -> Self {
        self.goto = Some(table);
        self
    }
}

/// Identity of an installed rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId {
    pub table: PipelineTable,
    pub priority: Priority,
    pub matches: Match,
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table={} priority={} match={}", self.table, self.priority, self.matches)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCommand {
    /// Add the rule, replacing any rule with the same identity.
    Install,
    /// Remove the rule with this identity, if any.
    Delete,
}

/// One pipeline mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowCommand,
    pub table: PipelineTable,
    pub priority: Priority,
    pub matches: Match,
    pub instructions: Instructions,
    /// Seconds; 0 disables.
    pub idle_timeout: u16,
    pub hard_timeout: u16,
}

impl FlowMod {
    pub fn install(
        table: PipelineTable,
        priority: Priority,
        matches: Match,
        instructions: Instructions,
    ) -> Self {
        Self {
            command: FlowCommand::Install,
            table,
            priority,
            matches,
            instructions,
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    pub fn delete(rule: RuleId) -> Self {
        Self {
            command: FlowCommand::Delete,
            table: rule.table,
            priority: rule.priority,
            matches: rule.matches,
            instructions: Instructions::default(),
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    pub fn with_timeouts(mut self, idle_timeout: u16, hard_timeout: u16) -> Self {
        self.idle_timeout = idle_timeout;
        self.hard_timeout = hard_timeout;
        self
    }

    pub fn rule_id(&self) -> RuleId {
        RuleId {
            table: self.table,
            priority: self.priority,
            matches: self.matches.clone(),
        }
    }
}
