//! Custom Resource Definitions for netfence

mod security_policy;
mod types;

pub use security_policy::{
    PolicyPeer, PolicyTarget, PortProtocol, RuleAction, RuleDirection, SecurityPolicy,
    SecurityPolicyPhase, SecurityPolicyPort, SecurityPolicyRule, SecurityPolicySpec,
    SecurityPolicyStatus,
};
pub use types::{Condition, ConditionStatus, CONDITION_READY};
