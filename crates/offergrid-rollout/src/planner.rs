//! Rolling replacement planner.
//!
//! Given the current taskgroups of an application and the version being
//! rolled to, [`plan_step`] computes the next batch of actions that keeps
//! the application inside its surge and unavailability budget. It is pure:
//! the engine executes the actions and calls it again on the next
//! transaction check until the plan reports `done`.

use std::collections::BTreeMap;

use tracing::debug;

use offergrid_state::{TaskGroup, TaskGroupId, TaskGroupStatus};

use crate::strategy::{Budget, UpgradeOrder, UpgradeStrategy};

/// One step the engine must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollAction {
    /// Launch a taskgroup of the target version in slot `index`.
    Launch { index: u32 },
    /// Ask the cluster to kill a live taskgroup.
    Kill { id: TaskGroupId },
    /// Drop the record of a taskgroup that already ended.
    Remove { id: TaskGroupId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollPlan {
    pub actions: Vec<RollAction>,
    /// Every slot runs the target version and nothing else is left.
    pub done: bool,
}

#[derive(Default)]
struct Slot<'a> {
    new: Vec<&'a TaskGroup>,
    old: Vec<&'a TaskGroup>,
}

impl Slot<'_> {
    fn new_running(&self) -> bool {
        self.new.iter().any(|tg| tg.status == TaskGroupStatus::Running)
    }

    fn any_running(&self) -> bool {
        self.new_running() || self.old.iter().any(|tg| tg.status == TaskGroupStatus::Running)
    }
}

fn is_live(tg: &TaskGroup) -> bool {
    !tg.is_terminal()
}

fn killable(tg: &TaskGroup) -> bool {
    is_live(tg) && tg.status != TaskGroupStatus::Killing && !tg.kill_requested
}

/// Compute the next rolling step towards `instances` taskgroups of
/// `target_version`.
pub fn plan_step(
    strategy: &UpgradeStrategy,
    target_version: &str,
    instances: u32,
    groups: &[TaskGroup],
) -> RollPlan {
    let budget = Budget::new(strategy, instances);
    let mut plan = RollPlan::default();

    let mut slots: BTreeMap<u32, Slot<'_>> = (0..instances).map(|i| (i, Slot::default())).collect();
    for tg in groups {
        if tg.is_terminal() {
            plan.actions.push(RollAction::Remove { id: tg.id.clone() });
            continue;
        }
        match slots.get_mut(&tg.index()) {
            Some(slot) if tg.version == target_version => slot.new.push(tg),
            Some(slot) => slot.old.push(tg),
            // Surplus slot beyond the new instance count.
            None => {
                if killable(tg) {
                    plan.actions.push(RollAction::Kill { id: tg.id.clone() });
                }
            }
        }
    }

    let mut live = groups.iter().filter(|tg| is_live(tg)).count() as u32;
    let mut unavailable = slots.values().filter(|s| !s.any_running()).count() as u32;

    for (&index, slot) in &slots {
        if slot.new_running() {
            // Replacement is up; retire whatever else shares the slot.
            for tg in slot.old.iter().chain(slot.new.iter().skip(1)) {
                if killable(tg) {
                    plan.actions.push(RollAction::Kill { id: tg.id.clone() });
                }
            }
            continue;
        }
        if !slot.new.is_empty() {
            // Replacement still starting.
            continue;
        }

        let old_live: Vec<&TaskGroup> = slot.old.iter().copied().filter(|tg| is_live(tg)).collect();
        let old_running = old_live.iter().any(|tg| tg.status == TaskGroupStatus::Running);
        let can_launch = live < budget.max_live;

        let launch_first = match budget.order {
            UpgradeOrder::CreateFirst => true,
            UpgradeOrder::DeleteFirst => old_live.is_empty(),
        };

        if launch_first && can_launch {
            plan.actions.push(RollAction::Launch { index });
            live += 1;
            continue;
        }
        if old_live.is_empty() {
            // Waiting for surge room.
            continue;
        }
        if old_running && unavailable < budget.max_unavailable {
            for tg in old_live.iter().filter(|tg| killable(tg)) {
                plan.actions.push(RollAction::Kill { id: tg.id.clone() });
            }
            unavailable += 1;
        } else if !old_running {
            // Old taskgroup is not serving; replacing it costs nothing.
            for tg in old_live.iter().filter(|tg| killable(tg)) {
                plan.actions.push(RollAction::Kill { id: tg.id.clone() });
            }
        }
    }

    plan.done = plan.actions.is_empty()
        && groups.len() as u32 == instances
        && slots.values().all(|s| s.new_running() && s.old.is_empty() && s.new.len() == 1);

    debug!(
        target = target_version,
        instances,
        live,
        unavailable,
        actions = plan.actions.len(),
        done = plan.done,
        "rolling step planned"
    );
    plan
}
