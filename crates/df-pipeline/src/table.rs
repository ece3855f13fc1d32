//! Pipeline tables and priority tiers.

use std::fmt;

/// A stage of the forwarding pipeline.
///
/// Packets enter at [`PipelineTable::IngressClassification`] and move to
/// later tables only through explicit goto instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineTable {
    IngressClassification,
    /// Label processing for traffic arriving on the uplink.
    IngressMpls,
    L3Lookup,
    IngressDispatch,
}

impl PipelineTable {
    pub const ALL: [PipelineTable; 4] = [
        PipelineTable::IngressClassification,
        PipelineTable::IngressMpls,
        PipelineTable::L3Lookup,
        PipelineTable::IngressDispatch,
    ];

    /// Device table id.
    pub const fn id(&self) -> u8 {
        match self {
            PipelineTable::IngressClassification => 0,
            PipelineTable::IngressMpls => 8,
            PipelineTable::L3Lookup => 20,
            PipelineTable::IngressDispatch => 115,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }
}

impl fmt::Display for PipelineTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineTable::IngressClassification => "ingress_classification",
            PipelineTable::IngressMpls => "ingress_mpls",
            PipelineTable::L3Lookup => "l3_lookup",
            PipelineTable::IngressDispatch => "ingress_dispatch",
        };
        write!(f, "{}({})", name, self.id())
    }
}

/// Rule priority. Higher values match first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(pub u16);

impl Priority {
    pub const DEFAULT: Priority = Priority(1);
    pub const LOW: Priority = Priority(50);
    pub const MEDIUM: Priority = Priority(100);
    /// Tier for label and route specific rules.
    pub const HIGH: Priority = Priority(200);
    pub const VERY_HIGH: Priority = Priority(300);
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
