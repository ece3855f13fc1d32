//! Typed forwarding pipeline.
//!
//! Tables, priorities, matches and actions for flow rules, plus the
//! [`Datapath`] mutation primitive that applications program devices with.

pub mod datapath;
pub mod error;
pub mod flow;
pub mod table;

pub use datapath::{Datapath, FlowEntry, FlowPipeline};
pub use error::{DatapathError, Result};
pub use flow::{
    Action, Field, FlowCommand, FlowMod, Instructions, Match, RuleId, ARP_REPLY, ARP_REQUEST,
    ETH_TYPE_ARP, ETH_TYPE_IPV4, ETH_TYPE_IPV6, ETH_TYPE_MPLS,
};
pub use table::{PipelineTable, Priority};
