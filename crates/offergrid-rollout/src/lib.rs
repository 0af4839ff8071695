//! offergrid rolling updates — surge/unavailability budgets and step planning.
//!
//! UPDATE and ROLLBACK transactions replace an application's taskgroups
//! slot by slot. This crate holds the pure decision logic; the scheduler
//! executes the resulting actions and re-plans on every check.
//!
//! # Components
//!
//! - **`strategy`** — Effective budgets derived from an `UpgradeStrategy`
//! - **`planner`** — Next-step planner (launch, kill, remove)

pub mod planner;
pub mod strategy;

pub use planner::{RollAction, RollPlan, plan_step};
pub use strategy::{Budget, UpgradeOrder, UpgradeStrategy};
