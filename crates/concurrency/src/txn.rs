//! A single transaction: identity, begin timestamp, and the WAL commands
//! it will commit.

use keel_core::{TxnId, TxnTimeStamp};
use keel_durability::WalCmd;

/// An in-flight transaction handed out by the transaction manager.
///
/// Commands accumulate locally; nothing is visible or durable until
/// `TxnManager::commit_txn` writes the WAL record and applies the commands
/// to the catalog.
#[derive(Debug)]
pub struct Txn {
    id: TxnId,
    begin_ts: TxnTimeStamp,
    text: String,
    cmds: Vec<WalCmd>,
}

impl Txn {
    pub(crate) fn new(id: TxnId, begin_ts: TxnTimeStamp, text: String) -> Self {
        Txn {
            id,
            begin_ts,
            text,
            cmds: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn begin_ts(&self) -> TxnTimeStamp {
        self.begin_ts
    }

    /// Human-readable description of what this transaction is for.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Queue a command for commit.
    pub fn add_cmd(&mut self, cmd: WalCmd) {
        self.cmds.push(cmd);
    }

    pub fn cmds(&self) -> &[WalCmd] {
        &self.cmds
    }

    pub(crate) fn take_cmds(&mut self) -> Vec<WalCmd> {
        std::mem::take(&mut self.cmds)
    }
}
