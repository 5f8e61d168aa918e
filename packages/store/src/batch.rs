//! Atomic multi-operation batches.

use std::time::Duration;

/// One write inside a [`Batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    RPush {
        key: String,
        value: String,
    },
    LRem {
        key: String,
        value: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
}

/// Ordered list of writes applied as a single indivisible store operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Option<Duration>,
    ) -> &mut Self {
        self.ops.push(Op::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(Op::Delete { key: key.into() });
        self
    }

    pub fn rpush(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(Op::RPush {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn lrem(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(Op::LRem {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(Op::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(Op::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}
