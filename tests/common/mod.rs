//! Shared helpers for the integration tests: AST construction shorthands
//! and a table-driven method oracle for driving the analyzer directly.
#![allow(dead_code)]

use std::collections::HashMap;
use std::rc::Rc;

use ignition::host::{ArgsInfo, HostModel, Id, MethodId, Node, NodeRef, Value};
use ignition::typing::{CalleeSummary, Candidate, MethodOracle};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ----------------------------------------------------------------------
// AST shorthands
// ----------------------------------------------------------------------

pub fn n(node: Node) -> NodeRef {
    Rc::new(node)
}

pub fn scope(locals: &[&str], required: usize, body: Node) -> Node {
    Node::Scope {
        locals: locals.iter().map(|l| Id::intern(l)).collect(),
        args: ArgsInfo::required(required),
        body: n(body),
    }
}

pub fn fixnum(v: i64) -> Node {
    Node::Literal(Value::Fixnum(v))
}

pub fn lvar(name: &str) -> Node {
    Node::LocalVar(Id::intern(name))
}

pub fn call(recv: Node, name: &str, args: Vec<Node>) -> Node {
    Node::Call {
        recv: n(recv),
        name: Id::intern(name),
        args: args.into_iter().map(n).collect(),
    }
}

pub fn funcall(name: &str, args: Vec<Node>) -> Node {
    Node::FuncCall {
        name: Id::intern(name),
        args: args.into_iter().map(n).collect(),
    }
}

// ----------------------------------------------------------------------
// Table-driven oracle
// ----------------------------------------------------------------------

/// A [`MethodOracle`] answering callee queries from a fixed table. Lets
/// tests run the type analyzer in isolation, with full control over what
/// every candidate "returns".
pub struct TableOracle {
    pub host: HostModel,
    pub summaries: HashMap<MethodId, CalleeSummary>,
}

impl TableOracle {
    pub fn new(host: HostModel) -> TableOracle {
        TableOracle {
            host,
            summaries: HashMap::new(),
        }
    }

    pub fn with_summary(mut self, mid: MethodId, summary: CalleeSummary) -> TableOracle {
        self.summaries.insert(mid, summary);
        self
    }
}

impl MethodOracle for TableOracle {
    fn host(&self) -> &HostModel {
        &self.host
    }

    fn callee_summary(&self, candidate: Candidate) -> CalleeSummary {
        self.summaries
            .get(&candidate.method)
            .cloned()
            .unwrap_or(CalleeSummary::Unknown { mutator: false })
    }
}
