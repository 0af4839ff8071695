//! Rolling-update budgets derived from an [`UpgradeStrategy`].

pub use offergrid_state::{UpgradeOrder, UpgradeStrategy};

/// Effective per-step limits of a rolling update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Maximum live taskgroups (old plus new) at any time.
    pub max_live: u32,
    /// Maximum slots without a running taskgroup.
    pub max_unavailable: u32,
    pub order: UpgradeOrder,
}

impl Budget {
    /// A strategy with neither surge nor unavailability could never make
    /// progress; it is treated as a surge of one.
    pub fn new(strategy: &UpgradeStrategy, instances: u32) -> Self {
        let (surge, unavailable) = match (strategy.max_surge, strategy.max_unavailable) {
            (0, 0) => (1, 0),
            pair => pair,
        };
        Self {
            max_live: instances.saturating_add(surge),
            max_unavailable: unavailable,
            order: strategy.order,
        }
    }
}
