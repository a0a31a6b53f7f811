//! Pure device classification.
//!
//! Maps (registration status, desired-state snapshot entry) to a bandwidth
//! lane and DNS posture. No I/O and no side effects, so policy decisions can
//! be tested without a kernel or a control plane.

use serde::{Deserialize, Serialize};

use crate::policy::DeviceControl;

/// Age-group value that receives filtered DNS.
const CHILD_AGE_GROUP: &str = "child";

/// One of the three bandwidth tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    /// Default route of the topology; steered by packet mark.
    Fast,
    /// Steered by explicit classifier filters.
    Slow,
    /// Lane for leased devices absent from the reservation registry.
    Guest,
}

impl Lane {
    /// Kernel class id this lane's traffic is steered to.
    pub fn class_id(self) -> &'static str {
        match self {
            Lane::Fast => crate::config::FAST_CLASS,
            Lane::Slow => crate::config::SLOW_CLASS,
            Lane::Guest => crate::config::GUEST_CLASS,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Fast => write!(f, "fast"),
            Lane::Slow => write!(f, "slow"),
            Lane::Guest => write!(f, "guest"),
        }
    }
}

/// DNS-filtering posture of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsPosture {
    /// Port-53 traffic redirected to the filtering resolver.
    Filtered,
    /// No DNS redirection.
    Open,
}

/// Result of classifying one device: exactly one lane and one posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub lane: Lane,
    pub dns: DnsPosture,
}

/// Classify a leased device.
///
/// Guest classification bypasses the snapshot entirely: an unregistered MAC
/// is a guest no matter what the desired state says about its IP. Registered
/// devices get the fast lane only with an explicit entitlement, and filtered
/// DNS only for the child age group. A registered device missing from the
/// snapshot defaults to the slow lane with open DNS.
pub fn classify(registered: bool, control: Option<&DeviceControl>) -> Classification {
    if !registered {
        return Classification {
            lane: Lane::Guest,
            dns: DnsPosture::Open,
        };
    }
    match control {
        Some(control) => Classification {
            lane: if control.has_fast_entitlement {
                Lane::Fast
            } else {
                Lane::Slow
            },
            dns: if control.age_group == CHILD_AGE_GROUP {
                DnsPosture::Filtered
            } else {
                DnsPosture::Open
            },
        },
        None => Classification {
            lane: Lane::Slow,
            dns: DnsPosture::Open,
        },
    }
}
