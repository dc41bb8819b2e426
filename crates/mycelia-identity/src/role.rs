//! Node roles in the network hierarchy.

use serde::{Deserialize, Serialize};

/// Role of a node within the network.
///
/// Roles gate participation: backbone nodes run Primary-tier agreement and
/// vote in consensus, semi-nodes vote and may be promoted, clients only
/// consume. A role transition happens exclusively through a resolved
/// consensus operation, never by local decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Always-on, dedicated backbone node.
    DedicatedBackbone,
    /// Node acting as backbone while its load allows it.
    DynamicBackbone {
        /// Current load factor in [0.0, 1.0].
        load_factor: f64,
    },
    /// Adaptive intermediate node.
    SemiNode {
        /// Whether a promotion to backbone may be proposed for this node.
        promotion_eligible: bool,
    },
    /// Pure client: consumes services, does not discover or vote.
    Client,
}

impl NodeRole {
    /// Whether this role has standing in Primary-tier agreement.
    pub fn is_backbone(&self) -> bool {
        matches!(
            self,
            NodeRole::DedicatedBackbone | NodeRole::DynamicBackbone { .. }
        )
    }

    /// Whether this role may participate in commit-reveal rounds.
    pub fn participates_in_consensus(&self) -> bool {
        !matches!(self, NodeRole::Client)
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::DedicatedBackbone => write!(f, "dedicated-backbone"),
            NodeRole::DynamicBackbone { load_factor } => {
                write!(f, "dynamic-backbone(load={load_factor:.2})")
            }
            NodeRole::SemiNode { promotion_eligible } => {
                write!(f, "semi-node(promotable={promotion_eligible})")
            }
            NodeRole::Client => write!(f, "client"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backbone_roles() {
        assert!(NodeRole::DedicatedBackbone.is_backbone());
        assert!(NodeRole::DynamicBackbone { load_factor: 0.3 }.is_backbone());
        assert!(!NodeRole::SemiNode {
            promotion_eligible: true
        }
        .is_backbone());
        assert!(!NodeRole::Client.is_backbone());
    }

    #[test]
    fn clients_never_vote() {
        assert!(!NodeRole::Client.participates_in_consensus());
        assert!(NodeRole::SemiNode {
            promotion_eligible: false
        }
        .participates_in_consensus());
    }
}
