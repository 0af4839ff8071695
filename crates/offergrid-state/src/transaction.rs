//! Persisted scheduling transactions.
//!
//! Every mutation of an application runs as a [`Transaction`]. It starts
//! `Init` and ends in exactly one of `Finish`, `Fail` or `Timeout`; once
//! terminal it never changes again.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::TaskGroupId;
use crate::types::{UpgradeStrategy, now_secs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpType {
    Launch,
    Delete,
    Scale,
    InnerScale,
    Update,
    Rollback,
    Reschedule,
}

/// The operation a transaction carries, with its arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Launch {
        version: String,
        #[serde(default)]
        reason: String,
    },
    Delete {
        /// Remove even if the application is not in a deletable state.
        enforce: bool,
    },
    Scale {
        version: String,
        instances: u32,
    },
    /// Scale driven by the scheduler itself; `remove_indices` names the
    /// slots to drop when shrinking.
    InnerScale {
        version: String,
        instances: u32,
        #[serde(default)]
        remove_indices: Vec<u32>,
    },
    Update {
        version: String,
        strategy: UpgradeStrategy,
    },
    Rollback {
        version: String,
        strategy: UpgradeStrategy,
    },
    Reschedule {
        taskgroup_id: TaskGroupId,
        #[serde(default)]
        reason: String,
        /// Id of the replacement once it has been launched.
        #[serde(default)]
        replacement: Option<TaskGroupId>,
    },
}

impl Operation {
    pub fn op_type(&self) -> OpType {
        match self {
            Operation::Launch { .. } => OpType::Launch,
            Operation::Delete { .. } => OpType::Delete,
            Operation::Scale { .. } => OpType::Scale,
            Operation::InnerScale { .. } => OpType::InnerScale,
            Operation::Update { .. } => OpType::Update,
            Operation::Rollback { .. } => OpType::Rollback,
            Operation::Reschedule { .. } => OpType::Reschedule,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectKind {
    Application,
    Deployment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Init,
    Finish,
    Fail,
    Timeout,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Init)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub transaction_id: String,
    pub object_kind: ObjectKind,
    /// Application (or deployment) name the transaction mutates.
    pub object_name: String,
    pub namespace: String,
    pub create_time: u64,
    /// Seconds between re-evaluations of a pending step.
    pub check_interval: u64,
    /// Seconds after `create_time` at which an unfinished transaction times out.
    pub life_period: u64,
    pub cur_op: Operation,
    pub status: TransactionStatus,
    #[serde(default)]
    pub message: String,
    /// Number of times the step handler has run.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub finish_time: Option<u64>,
}

impl Transaction {
    pub fn new(
        namespace: &str,
        object_name: &str,
        object_kind: ObjectKind,
        cur_op: Operation,
        check_interval: u64,
        life_period: u64,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4().to_string(),
            object_kind,
            object_name: object_name.to_string(),
            namespace: namespace.to_string(),
            create_time: now_secs(),
            check_interval,
            life_period,
            cur_op,
            status: TransactionStatus::Init,
            message: String::new(),
            attempts: 0,
            finish_time: None,
        }
    }

    pub fn op_type(&self) -> OpType {
        self.cur_op.op_type()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True once `now` is past the transaction's lifetime.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.create_time.saturating_add(self.life_period)
    }

    pub fn finish(&mut self, message: impl Into<String>) -> bool {
        self.terminate(TransactionStatus::Finish, message.into())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        self.terminate(TransactionStatus::Fail, message.into())
    }

    pub fn timeout(&mut self) -> bool {
        let msg = format!("not finished within {}s", self.life_period);
        self.terminate(TransactionStatus::Timeout, msg)
    }

    /// Move to a terminal status. Returns false (and changes nothing) if
    /// the transaction already ended.
    fn terminate(&mut self, status: TransactionStatus, message: String) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.message = message;
        self.finish_time = Some(now_secs());
        true
    }

    /// Storage key: `{namespace}/{transaction_id}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.transaction_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn() -> Transaction {
        Transaction::new(
            "ns",
            "web",
            ObjectKind::Application,
            Operation::Delete { enforce: false },
            3,
            60,
        )
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut t = txn();
        assert!(t.finish("done"));
        assert!(!t.fail("late failure"));
        assert!(!t.timeout());
        assert_eq!(t.status, TransactionStatus::Finish);
        assert_eq!(t.message, "done");
    }

    #[test]
    fn expiry_uses_life_period() {
        let t = txn();
        assert!(!t.is_expired(t.create_time + 59));
        assert!(t.is_expired(t.create_time + 60));
    }

    #[test]
    fn operation_serializes_with_tag() {
        let op = Operation::Scale { version: "v1".into(), instances: 4 };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "SCALE");
        assert_eq!(op.op_type(), OpType::Scale);
        let t = txn();
        assert_eq!(t.table_key(), format!("ns/{}", t.transaction_id));
    }
}
