use std::collections::HashSet;

use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, EnumIter};

use crate::command::normalize;

/// Commands that must not run over a connection shared through the pool: they block, hold
/// server-side session state, expose the whole keyspace, or administer the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum UnsafeCommand {
    // keys
    Keys,
    Migrate,
    Move,
    Object,
    Dump,
    // lists
    Blpop,
    Brpop,
    Brpoplpush,
    Rpoplpush,
    // pub/sub
    Psubscribe,
    Publish,
    Pubsub,
    Punsubscribe,
    Subscribe,
    Unsubscribe,
    // transactions
    Discard,
    Exec,
    Multi,
    Unwatch,
    Watch,
    // scripting
    Script,
    Eval,
    Evalsha,
    // connection
    Auth,
    Select,
    // server
    Bgrewriteaof,
    Bgsave,
    Client,
    Config,
    Dbsize,
    Debug,
    Flushall,
    Flushdb,
    Lastsave,
    Latency,
    Monitor,
    Psync,
    Replconf,
    Replicaof,
    Restore,
    Save,
    Shutdown,
    Slaveof,
    Sync,
    Time,
    // slots
    Slotscheck,
    Slotsdel,
    Slotsinfo,
    Slotsmgrtone,
    Slotsmgrtslot,
    Slotsmgrttagone,
    Slotsmgrttagslot,
    // cluster
    Cluster,
    Readonly,
    Readwrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Rejected,
}

/// The set of command names the proxy refuses to forward.
#[derive(Clone, Debug)]
pub struct Filter {
    denied: HashSet<String>,
}

impl Filter {
    /// A filter that lets everything through.
    pub fn empty() -> Filter {
        Filter {
            denied: HashSet::new(),
        }
    }

    pub fn deny(mut self, name: impl AsRef<[u8]>) -> Filter {
        self.denied.insert(normalize(name.as_ref()));
        self
    }

    pub fn check(&self, name: &[u8]) -> Verdict {
        if self.denied.contains(&normalize(name)) {
            Verdict::Rejected
        } else {
            Verdict::Allowed
        }
    }

    pub fn len(&self) -> usize {
        self.denied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.denied.is_empty()
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter {
            denied: UnsafeCommand::iter()
                .map(|cmd| cmd.as_ref().to_string())
                .collect(),
        }
    }
}
