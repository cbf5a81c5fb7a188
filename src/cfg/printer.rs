//! Human-readable CFG dump, built on the opcode visitor.

use std::fmt::Write as _;

use itertools::Itertools;

use super::opcode::{Opcode, OpcodeKind, OpcodeVisitor};
use super::{BlockId, ControlFlowGraph};
use crate::typing::context::TypeContext;

/// Renders blocks one opcode per line, in the style
/// `v3 = call v0, v1 [lookup v2] -> env v4`.
pub struct CfgPrinter<'a> {
    cfg: &'a ControlFlowGraph,
    out: String,
}

impl<'a> CfgPrinter<'a> {
    pub fn new(cfg: &'a ControlFlowGraph) -> CfgPrinter<'a> {
        CfgPrinter {
            cfg,
            out: String::new(),
        }
    }

    /// Print the whole graph.
    pub fn print(mut self) -> String {
        let _ = writeln!(
            self.out,
            "[cfg] entry={} exit={} output={:?} undefined={} entry_env={} exit_env={}",
            self.cfg.entry(),
            self.cfg.exit(),
            self.cfg.output(),
            self.cfg.undefined(),
            self.cfg.entry_env(),
            self.cfg.exit_env(),
        );
        for b in self.cfg.block_ids() {
            self.print_block(b);
        }
        self.out
    }

    /// Print a single block.
    pub fn print_block(&mut self, b: BlockId) {
        let cfg = self.cfg;
        let block = cfg.block(b);
        let name = block.name().unwrap_or("");
        let preds = block.backedges().iter().map(|p| p.to_string()).join(", ");
        let _ = writeln!(self.out, "{} {} <- [{}]", b, name, preds);
        for &op in block.opcodes() {
            self.out.push_str("  ");
            super::opcode::dispatch_opcode(self, cfg.opcode(op));
            self.out.push('\n');
        }
    }

    fn lhs_prefix(&mut self, op: &Opcode) {
        if let Some(lhs) = op.lhs() {
            let _ = write!(self.out, "{} = ", lhs);
        }
    }

    fn env_suffix(&mut self, op: &Opcode) {
        if let Some(env) = op.out_env() {
            let _ = write!(self.out, " -> env {}", env);
        }
    }

    /// Print the per-variable type constraints of a context.
    pub fn print_types(cfg: &ControlFlowGraph, ctx: &TypeContext) -> String {
        let mut out = String::new();
        for v in cfg.var_ids() {
            match ctx.type_of(v) {
                Some(t) => {
                    let _ = writeln!(out, "{}: {:?}", v, t);
                }
                None => {
                    let _ = writeln!(out, "{}: (unset)", v);
                }
            }
        }
        out
    }
}

impl OpcodeVisitor for CfgPrinter<'_> {
    fn visit_copy(&mut self, op: &Opcode) -> bool {
        if let OpcodeKind::Copy { lhs, rhs } = &op.kind {
            let _ = write!(self.out, "{} = copy {}", lhs, rhs);
        }
        true
    }

    fn visit_jump(&mut self, op: &Opcode) -> bool {
        if let OpcodeKind::Jump { target } = &op.kind {
            let _ = write!(self.out, "jump {}", target);
        }
        true
    }

    fn visit_jump_if(&mut self, op: &Opcode) -> bool {
        if let OpcodeKind::JumpIf {
            cond,
            if_true,
            if_false,
        } = &op.kind
        {
            let _ = write!(self.out, "jumpif {} then {} else {}", cond, if_true, if_false);
        }
        true
    }

    fn visit_immediate(&mut self, op: &Opcode) -> bool {
        if let OpcodeKind::Immediate { lhs, value } = &op.kind {
            let _ = write!(self.out, "{} = imm {:?}", lhs, value);
        }
        true
    }

    fn visit_env(&mut self, op: &Opcode) -> bool {
        self.lhs_prefix(op);
        self.out.push_str("env");
        true
    }

    fn visit_lookup(&mut self, op: &Opcode) -> bool {
        if let OpcodeKind::Lookup {
            lhs,
            receiver,
            name,
            env,
            entry,
        } = &op.kind
        {
            let _ = write!(self.out, "{} = lookup {}.{} [env {}]", lhs, receiver, name, env);
            if entry.is_some() {
                self.out.push_str(" (resolved)");
            }
        }
        true
    }

    fn visit_call(&mut self, op: &Opcode) -> bool {
        self.lhs_prefix(op);
        if let OpcodeKind::Call { operands, .. } = &op.kind {
            let args = op
                .kind
                .call_receiver_and_args()
                .iter()
                .map(|v| v.to_string())
                .join(", ");
            let _ = write!(
                self.out,
                "call {} [lookup {}]",
                args,
                operands[operands.len() - 1]
            );
        }
        self.env_suffix(op);
        true
    }

    fn visit_code_block(&mut self, op: &Opcode) -> bool {
        self.lhs_prefix(op);
        self.out.push_str("codeblock");
        true
    }

    fn visit_constant(&mut self, op: &Opcode) -> bool {
        self.lhs_prefix(op);
        if let OpcodeKind::Constant {
            name,
            base,
            toplevel,
            in_env,
            ..
        } = &op.kind
        {
            let prefix = if *toplevel { "::" } else { "" };
            let _ = write!(self.out, "const {}{} base {} [env {}]", prefix, name, base, in_env);
        }
        self.env_suffix(op);
        true
    }

    fn visit_primitive(&mut self, op: &Opcode) -> bool {
        self.lhs_prefix(op);
        if let OpcodeKind::Primitive { name, args, .. } = &op.kind {
            let args = args.iter().map(|v| v.to_string()).join(", ");
            let _ = write!(self.out, "prim {}({})", name, args);
        }
        true
    }

    fn visit_phi(&mut self, op: &Opcode) -> bool {
        self.lhs_prefix(op);
        if let OpcodeKind::Phi { operands, .. } = &op.kind {
            let args = operands.iter().map(|v| v.to_string()).join(", ");
            let _ = write!(self.out, "phi [{}]", args);
        }
        true
    }

    fn visit_exit(&mut self, _op: &Opcode) -> bool {
        self.out.push_str("exit");
        true
    }

    fn visit_array(&mut self, op: &Opcode) -> bool {
        self.lhs_prefix(op);
        if let OpcodeKind::Array { elems, .. } = &op.kind {
            let elems = elems.iter().map(|v| v.to_string()).join(", ");
            let _ = write!(self.out, "array [{}]", elems);
        }
        true
    }

    fn visit_range(&mut self, op: &Opcode) -> bool {
        self.lhs_prefix(op);
        if let OpcodeKind::Range {
            low,
            high,
            exclusive,
            ..
        } = &op.kind
        {
            let dots = if *exclusive { "..." } else { ".." };
            let _ = write!(self.out, "range {}{}{}", low, dots, high);
        }
        true
    }

    fn visit_string(&mut self, op: &Opcode) -> bool {
        if let OpcodeKind::String { lhs, value } = &op.kind {
            let _ = write!(self.out, "{} = string {:?}", lhs, value);
        }
        true
    }

    fn visit_hash(&mut self, op: &Opcode) -> bool {
        self.lhs_prefix(op);
        if let OpcodeKind::Hash { elems, .. } = &op.kind {
            let elems = elems.iter().map(|v| v.to_string()).join(", ");
            let _ = write!(self.out, "hash [{}]", elems);
        }
        true
    }

    fn visit_enter(&mut self, _op: &Opcode) -> bool {
        self.out.push_str("enter");
        true
    }

    fn visit_leave(&mut self, _op: &Opcode) -> bool {
        self.out.push_str("leave");
        true
    }

    fn visit_check_arg(&mut self, _op: &Opcode) -> bool {
        self.out.push_str("checkarg");
        true
    }
}
