//! AST to CFG lowering.
//!
//! Walks a method body recursively, threading a *cursor* (current block +
//! "execution continues" flag) and emitting opcodes into the graph arena.
//! Fresh unnamed temporaries carry intermediate values; each lexical name
//! maps to a single variable created on first reference.
//!
//! Control constructs fork child cursors over the shared arena (each fork
//! opens a fresh block), mirror-merging back when both arms continue. A
//! construct that can never fall through halts its cursor; halted cursors
//! make every later emission a no-op by early return.

use std::collections::HashMap;

use tracing::debug;

use crate::cfg::{
    BlockId, ControlFlowGraph, DefInfoMap, Opcode, OpcodeId, OpcodeKind, Scope, VarId,
};
use crate::error::{CompileError, CompileResult};
use crate::host::ast::{ArgsInfo, Node, StrPart};
use crate::host::ids::{self, Id};
use crate::host::primitives;
use crate::host::value::Value;

/// Output of [`build_method`]: the non-SSA graph plus the definition-site
/// map the SSA translator consumes and the method's lexical scope.
#[derive(Debug)]
pub struct BuildResult {
    pub cfg: ControlFlowGraph,
    pub def_info: DefInfoMap,
    pub scope: Scope,
}

/// Lower one method AST (rooted at a scope node) into a CFG.
pub fn build_method(root: &Node, name: Id) -> CompileResult<BuildResult> {
    let Node::Scope { locals, args, body } = root else {
        return Err(CompileError::UnsupportedSyntax {
            method: name.name().to_string(),
            detail: format!("method root is a {} node, not a scope", root.tag_name()),
        });
    };

    let mut builder = CfgBuilder {
        cfg: ControlFlowGraph::new(),
        def_info: DefInfoMap::new(),
        scope: Scope::new(locals, None),
        named: HashMap::new(),
        method_name: name,
        exit_points: Vec::new(),
    };

    let mut cur = builder.create_entry_exit_blocks();
    builder.build_arguments(&cur, locals, args)?;
    let value = builder.build_node(&mut cur, body, true)?;
    if cur.continues() {
        builder.add_jump_to_return_block(&mut cur, value);
    }

    debug!(method = %name, blocks = builder.cfg.block_count(), "cfg built");
    if cfg!(debug_assertions) {
        let errors = builder.cfg.check_sanity();
        assert!(errors.is_empty(), "cfg sanity after build: {:?}", errors);
    }

    Ok(BuildResult {
        cfg: builder.cfg,
        def_info: builder.def_info,
        scope: builder.scope,
    })
}

/// Emission position: a block plus the halted flag.
#[derive(Debug, Clone)]
struct Cursor {
    block: BlockId,
    halted: bool,
}

impl Cursor {
    fn continues(&self) -> bool {
        !self.halted
    }

    fn halt(&mut self) {
        self.halted = true;
    }
}

/// Cursors of the enclosing loop, kept for break/next lowering.
#[allow(dead_code)]
struct ExitPoint {
    cond: BlockId,
    body: BlockId,
    exit: BlockId,
    result: Option<VarId>,
}

struct CfgBuilder {
    cfg: ControlFlowGraph,
    def_info: DefInfoMap,
    scope: Scope,
    /// One variable per lexical name, created on first reference.
    named: HashMap<Id, VarId>,
    method_name: Id,
    exit_points: Vec<ExitPoint>,
}

impl CfgBuilder {
    fn unsupported(&self, detail: String) -> CompileError {
        CompileError::UnsupportedSyntax {
            method: self.method_name.name().to_string(),
            detail,
        }
    }

    // ------------------------------------------------------------------
    // Emission helpers
    // ------------------------------------------------------------------

    /// Open a fresh block and return a live cursor for it.
    fn fork(&mut self) -> Cursor {
        Cursor {
            block: self.cfg.add_block(None),
            halted: false,
        }
    }

    fn update_def_site(&mut self, v: VarId, block: BlockId, op: Option<OpcodeId>) {
        self.def_info
            .update_def_site(self.cfg.variable_mut(v), block, op);
    }

    fn create_temp(&mut self, cur: &Cursor, use_result: bool) -> Option<VarId> {
        if !use_result {
            return None;
        }
        Some(self.cfg.create_variable(None, None, cur.block, None))
    }

    /// The variable bound to a lexical name, created on first reference.
    /// A reference from a block other than the defining one clears the
    /// locality flag so SSA knows phis may be needed.
    fn named_variable(&mut self, cur: &Cursor, name: Id) -> VarId {
        if let Some(&v) = self.named.get(&name) {
            if self.cfg.variable(v).def_block() != cur.block {
                self.def_info.set_local(v, false);
            }
            return v;
        }
        let name_ref = self.scope.find(name);
        let v = self
            .cfg
            .create_variable(Some(name), name_ref, cur.block, None);
        self.named.insert(name, v);
        v
    }

    fn append(&mut self, cur: &Cursor, kind: OpcodeKind) -> OpcodeId {
        self.cfg.append_opcode(cur.block, Opcode::new(kind))
    }

    fn add_copy(&mut self, cur: &Cursor, lhs: VarId, rhs: VarId, use_result: bool) -> Option<VarId> {
        let op = self.append(cur, OpcodeKind::Copy { lhs, rhs });
        self.update_def_site(lhs, cur.block, Some(op));
        use_result.then_some(lhs)
    }

    fn add_jump(&mut self, cur: &Cursor, dest: BlockId) {
        self.append(cur, OpcodeKind::Jump { target: dest });
        self.cfg.block_mut(dest).add_backedge(cur.block);
    }

    fn add_jump_if(&mut self, cur: &Cursor, cond: VarId, if_true: BlockId, if_false: BlockId) {
        self.append(
            cur,
            OpcodeKind::JumpIf {
                cond,
                if_true,
                if_false,
            },
        );
        self.cfg.block_mut(if_true).add_backedge(cur.block);
        self.cfg.block_mut(if_false).add_backedge(cur.block);
    }

    fn add_immediate(&mut self, cur: &Cursor, value: Value, use_result: bool) -> Option<VarId> {
        if !use_result {
            return None;
        }
        let lhs = self.cfg.create_variable(None, None, cur.block, None);
        let op = self.append(cur, OpcodeKind::Immediate { lhs, value });
        self.update_def_site(lhs, cur.block, Some(op));
        Some(lhs)
    }

    fn add_lookup(&mut self, cur: &Cursor, receiver: VarId, name: Id) -> VarId {
        let env = self.cfg.entry_env();
        let lhs = self.cfg.create_variable(None, None, cur.block, None);
        let op = self.append(
            cur,
            OpcodeKind::Lookup {
                lhs,
                receiver,
                name,
                env,
                entry: None,
            },
        );
        self.update_def_site(lhs, cur.block, Some(op));
        lhs
    }

    /// `args` is the receiver followed by the user arguments.
    fn add_call(
        &mut self,
        cur: &Cursor,
        args: &[VarId],
        lookup: VarId,
        use_result: bool,
    ) -> Option<VarId> {
        let env = self.cfg.entry_env();
        let mut operands = crate::cfg::opcode::Operands::from_slice(args);
        operands.push(lookup);
        let lhs = self.create_temp(cur, use_result);
        let op = self.append(
            cur,
            OpcodeKind::Call {
                lhs,
                operands,
                code_block: None,
                out_env: env,
            },
        );
        if let Some(lhs) = lhs {
            self.update_def_site(lhs, cur.block, Some(op));
        }
        // The call writes a fresh environment.
        self.update_def_site(env, cur.block, Some(op));
        lhs
    }

    /// Emitted even when the result is unused: constants can autoload.
    fn add_constant(
        &mut self,
        cur: &Cursor,
        name: Id,
        base: Option<VarId>,
        toplevel: bool,
        use_result: bool,
    ) -> Option<VarId> {
        // A free constant reference is equivalent to one based on nil.
        let base = base.unwrap_or_else(|| self.cfg.undefined());
        let env = self.cfg.entry_env();
        let lhs = self.create_temp(cur, use_result);
        let op = self.append(
            cur,
            OpcodeKind::Constant {
                lhs,
                name,
                base,
                toplevel,
                in_env: env,
                out_env: env,
            },
        );
        if let Some(lhs) = lhs {
            self.update_def_site(lhs, cur.block, Some(op));
        }
        self.update_def_site(env, cur.block, Some(op));
        lhs
    }

    fn add_primitive(
        &mut self,
        cur: &Cursor,
        name: Id,
        args: &[VarId],
        use_result: bool,
    ) -> Option<VarId> {
        let lhs = self.create_temp(cur, use_result);
        let op = self.append(
            cur,
            OpcodeKind::Primitive {
                lhs,
                name,
                args: crate::cfg::opcode::Operands::from_slice(args),
            },
        );
        if let Some(lhs) = lhs {
            self.update_def_site(lhs, cur.block, Some(op));
        }
        lhs
    }

    fn add_array(&mut self, cur: &Cursor, elems: &[VarId], use_result: bool) -> Option<VarId> {
        if !use_result {
            return None;
        }
        let lhs = self.cfg.create_variable(None, None, cur.block, None);
        let op = self.append(
            cur,
            OpcodeKind::Array {
                lhs: Some(lhs),
                elems: crate::cfg::opcode::Operands::from_slice(elems),
            },
        );
        self.update_def_site(lhs, cur.block, Some(op));
        Some(lhs)
    }

    fn add_range(
        &mut self,
        cur: &Cursor,
        low: VarId,
        high: VarId,
        exclusive: bool,
        use_result: bool,
    ) -> Option<VarId> {
        if !use_result {
            return None;
        }
        let lhs = self.cfg.create_variable(None, None, cur.block, None);
        let op = self.append(
            cur,
            OpcodeKind::Range {
                lhs: Some(lhs),
                low,
                high,
                exclusive,
            },
        );
        self.update_def_site(lhs, cur.block, Some(op));
        Some(lhs)
    }

    fn add_string(
        &mut self,
        cur: &Cursor,
        value: std::rc::Rc<str>,
        use_result: bool,
    ) -> Option<VarId> {
        if !use_result {
            return None;
        }
        let lhs = self.cfg.create_variable(None, None, cur.block, None);
        let op = self.append(cur, OpcodeKind::String { lhs, value });
        self.update_def_site(lhs, cur.block, Some(op));
        Some(lhs)
    }

    fn add_hash(&mut self, cur: &Cursor, elems: &[VarId], use_result: bool) -> Option<VarId> {
        if !use_result {
            return None;
        }
        debug_assert!(elems.len() % 2 == 0);
        let lhs = self.cfg.create_variable(None, None, cur.block, None);
        let op = self.append(
            cur,
            OpcodeKind::Hash {
                lhs: Some(lhs),
                elems: crate::cfg::opcode::Operands::from_slice(elems),
            },
        );
        self.update_def_site(lhs, cur.block, Some(op));
        Some(lhs)
    }

    /// Copy the value into the method output and jump to the exit block;
    /// execution on this cursor ends here.
    fn add_jump_to_return_block(&mut self, cur: &mut Cursor, value: Option<VarId>) {
        if let Some(value) = value {
            if self.cfg.output().is_none() {
                let out = self.cfg.create_variable(None, None, cur.block, None);
                self.cfg.set_output(out);
            }
            let out = self.cfg.output().expect("output just ensured");
            let op = self.append(cur, OpcodeKind::Copy { lhs: out, rhs: value });
            self.update_def_site(out, cur.block, Some(op));
        }
        let exit = self.cfg.exit();
        self.add_jump(cur, exit);
        cur.halt();
    }

    // ------------------------------------------------------------------
    // Entry / exit / arguments
    // ------------------------------------------------------------------

    fn create_entry_exit_blocks(&mut self) -> Cursor {
        let entry = self.cfg.add_block(Some("entry"));
        self.cfg.set_entry(entry);
        let cur = Cursor {
            block: entry,
            halted: false,
        };

        // The undefined sentinel is an ordinary nil immediate.
        let undefined = self
            .add_immediate(&cur, Value::Nil, true)
            .expect("sentinel always materializes");
        self.cfg.set_undefined(undefined);

        // The environment token; also the exit env until SSA renames it.
        let env = self
            .cfg
            .create_variable(Some(ids::env_name()), None, entry, None);
        let op = self.append(&cur, OpcodeKind::Env { lhs: env });
        self.update_def_site(env, entry, Some(op));
        self.cfg.set_entry_env(env);
        self.cfg.set_exit_env(env);

        self.append(&cur, OpcodeKind::Enter);

        // Exit block: an env def site (so SSA materializes the exit env at
        // every join feeding it) followed by the exit terminator.
        let exit = self.cfg.add_block(Some("exit"));
        self.cfg.set_exit(exit);
        let copy = self
            .cfg
            .append_opcode(exit, Opcode::new(OpcodeKind::Copy { lhs: env, rhs: env }));
        self.update_def_site(env, exit, Some(copy));
        self.cfg.append_opcode(exit, Opcode::new(OpcodeKind::Exit));

        cur
    }

    fn build_arguments(
        &mut self,
        cur: &Cursor,
        locals: &[Id],
        args: &ArgsInfo,
    ) -> CompileResult<()> {
        let entry = self.cfg.entry();

        let self_var = self.named_variable(cur, ids::self_name());
        self.update_def_site(self_var, entry, None);
        self.cfg.add_input(self_var);

        self.cfg.set_required_argc(args.required);
        self.cfg.set_has_optional_arg(args.has_optional);
        self.cfg.set_has_rest_arg(args.has_rest);

        if args.has_optional || args.has_rest {
            return Err(self.unsupported(format!(
                "method {} uses variadic arguments, which are not implemented yet",
                self.method_name
            )));
        }

        for i in 0..args.required {
            let name = *locals.get(i).ok_or_else(|| {
                self.unsupported("argument info names more parameters than locals".to_string())
            })?;
            let v = self.named_variable(cur, name);
            self.update_def_site(v, entry, None);
            self.cfg.add_input(v);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Node dispatch
    // ------------------------------------------------------------------

    fn build_node(
        &mut self,
        cur: &mut Cursor,
        node: &Node,
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        if !cur.continues() {
            return Ok(None);
        }

        match node {
            Node::Seq(stmts) => self.build_seq(cur, stmts, use_result),
            Node::LocalAssign(name, value) => self.build_assignment(cur, *name, value, use_result),
            Node::LocalVar(name) => Ok(Some(self.named_variable(cur, *name))),
            Node::Literal(value) => Ok(self.add_immediate(cur, value.clone(), use_result)),
            Node::SelfRef => Ok(if use_result {
                Some(self.named_variable(cur, ids::self_name()))
            } else {
                None
            }),
            Node::True => Ok(self.add_immediate(cur, Value::Bool(true), use_result)),
            Node::False => Ok(self.add_immediate(cur, Value::Bool(false), use_result)),
            Node::Nil => Ok(self.add_immediate(cur, Value::Nil, use_result)),
            Node::Array(elems) => self.build_array(cur, elems, use_result),
            Node::ArrayPush(array, value) => {
                let a = self.build_node(cur, array, use_result)?;
                let v = self.build_node(cur, value, use_result)?;
                if !cur.continues() || !use_result {
                    return Ok(None);
                }
                Ok(self.add_primitive(
                    cur,
                    primitives::push_to_array_name(),
                    &[a.expect("array value"), v.expect("pushed value")],
                    true,
                ))
            }
            Node::ArrayConcat(first, second) => {
                let a = self.build_node(cur, first, use_result)?;
                let b = self.build_node(cur, second, use_result)?;
                if !cur.continues() || !use_result {
                    return Ok(None);
                }
                Ok(self.add_primitive(
                    cur,
                    primitives::concat_arrays_name(),
                    &[a.expect("array value"), b.expect("array value")],
                    true,
                ))
            }
            Node::Splat(value) => {
                let v = self.build_node(cur, value, use_result)?;
                if !cur.continues() || !use_result {
                    return Ok(None);
                }
                Ok(self.add_primitive(
                    cur,
                    primitives::convert_to_array_name(),
                    &[v.expect("splatted value")],
                    true,
                ))
            }
            Node::Range {
                low,
                high,
                exclusive,
            } => {
                let l = self.build_node(cur, low, use_result)?;
                let h = self.build_node(cur, high, use_result)?;
                if !cur.continues() || !use_result {
                    return Ok(None);
                }
                Ok(self.add_range(
                    cur,
                    l.expect("range bound"),
                    h.expect("range bound"),
                    *exclusive,
                    true,
                ))
            }
            Node::Str(s) => Ok(self.add_string(cur, s.clone(), use_result)),
            Node::DynStr { head, parts } => self.build_string_interpolation(cur, head, parts, use_result),
            Node::Hash(pairs) => self.build_hash(cur, pairs, use_result),
            Node::And(first, second) => self.build_and_or(cur, first, second, true, use_result),
            Node::Or(first, second) => self.build_and_or(cur, first, second, false, use_result),
            Node::If { cond, then, els } => {
                self.build_if(cur, cond, then.as_deref(), els.as_deref(), use_result)
            }
            Node::While {
                cond,
                body,
                pretest,
            } => self.build_while(cur, cond, body.as_deref(), *pretest, use_result),
            Node::Return(value) => self.build_return(cur, value.as_deref()),
            Node::Call { recv, name, args } => self.build_call(cur, recv, *name, args, use_result),
            Node::FuncCall { name, args } => self.build_funcall(cur, *name, args, use_result),
            Node::VarCall(name) => self.build_funcall(cur, *name, &[], use_result),
            Node::Const(name) => Ok(self.add_constant(cur, *name, None, false, use_result)),
            Node::RelativeConst { base, name } => {
                let b = self.build_node(cur, base, true)?;
                if !cur.continues() {
                    return Ok(None);
                }
                Ok(self.add_constant(cur, *name, Some(b.expect("constant base")), false, use_result))
            }
            Node::ToplevelConst(name) => Ok(self.add_constant(cur, *name, None, true, use_result)),
            other => Err(self.unsupported(format!(
                "node type {} is not implemented yet",
                other.tag_name()
            ))),
        }
    }

    fn build_seq(
        &mut self,
        cur: &mut Cursor,
        stmts: &[crate::host::ast::NodeRef],
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        let Some((last, init)) = stmts.split_last() else {
            return Ok(self.add_immediate(cur, Value::Nil, use_result));
        };
        for stmt in init {
            self.build_node(cur, stmt, false)?;
            if !cur.continues() {
                return Ok(None);
            }
        }
        self.build_node(cur, last, use_result)
    }

    fn build_assignment(
        &mut self,
        cur: &mut Cursor,
        name: Id,
        value: &Node,
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        let rhs = self.build_node(cur, value, true)?;
        if !cur.continues() {
            return Ok(None);
        }
        let rhs = rhs.expect("assignment rhs evaluates to a value");
        let lhs = self.named_variable(cur, name);
        let result = self.add_copy(cur, lhs, rhs, use_result);

        // Copy folding during SSA translation may delete the copy; giving
        // the temporary the human name keeps it readable afterwards.
        if self.cfg.variable(rhs).name().is_none() {
            self.cfg.variable_mut(rhs).set_name(Some(name));
        }

        Ok(result)
    }

    fn build_array(
        &mut self,
        cur: &mut Cursor,
        elems: &[crate::host::ast::NodeRef],
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        let mut values = Vec::with_capacity(elems.len());
        for elem in elems {
            let v = self.build_node(cur, elem, use_result)?;
            if !cur.continues() {
                return Ok(None);
            }
            values.push(v);
        }
        if !use_result {
            return Ok(None);
        }
        let values: Vec<VarId> = values
            .into_iter()
            .map(|v| v.expect("array element value"))
            .collect();
        Ok(self.add_array(cur, &values, true))
    }

    fn build_string_interpolation(
        &mut self,
        cur: &mut Cursor,
        head: &std::rc::Rc<str>,
        parts: &[StrPart],
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        let mut elems: Vec<VarId> = Vec::with_capacity(parts.len() + 2);

        if use_result && !head.is_empty() {
            elems.push(
                self.add_string(cur, head.clone(), true)
                    .expect("string literal value"),
            );
        }

        for part in parts {
            match part {
                StrPart::Lit(s) => {
                    if use_result {
                        elems.push(
                            self.add_string(cur, s.clone(), true)
                                .expect("string literal value"),
                        );
                    }
                }
                StrPart::Interp(node) => {
                    let v = self.build_node(cur, node, true)?;
                    if !cur.continues() {
                        return Ok(None);
                    }
                    let s = self.add_primitive(
                        cur,
                        primitives::convert_to_string_name(),
                        &[v.expect("interpolated value")],
                        use_result,
                    );
                    if use_result {
                        elems.push(s.expect("converted string value"));
                    }
                }
            }
        }

        if !use_result {
            return Ok(None);
        }
        let count = self
            .add_immediate(cur, Value::Fixnum(elems.len() as i64), true)
            .expect("count value");
        let mut args = vec![count];
        args.extend(elems);
        Ok(self.add_primitive(cur, primitives::concat_strings_name(), &args, true))
    }

    fn build_hash(
        &mut self,
        cur: &mut Cursor,
        pairs: &[crate::host::ast::NodeRef],
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        let mut values = Vec::with_capacity(pairs.len());
        for node in pairs {
            let v = self.build_node(cur, node, use_result)?;
            if !cur.continues() {
                return Ok(None);
            }
            values.push(v);
        }
        if !use_result {
            return Ok(None);
        }
        let values: Vec<VarId> = values
            .into_iter()
            .map(|v| v.expect("hash element value"))
            .collect();
        Ok(self.add_hash(cur, &values, true))
    }

    /// Short-circuit logical. The non-evaluating edge goes through a
    /// single-predecessor cushion block so that no edge is critical.
    fn build_and_or(
        &mut self,
        cur: &mut Cursor,
        first: &Node,
        second: &Node,
        is_and: bool,
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        let first_v = self.build_node(cur, first, true)?;
        if !cur.continues() {
            return Ok(None);
        }
        let first_v = first_v.expect("logical operand value");

        let jcur = self.fork();
        let join = jcur.block;

        let ccur = self.fork();
        let cushion = ccur.block;
        self.add_jump(&ccur, join);

        let mut scur = self.fork();
        let second_block = scur.block;
        let second_v = self.build_node(&mut scur, second, use_result)?;
        if scur.continues() {
            if use_result {
                self.add_copy(
                    &scur,
                    first_v,
                    second_v.expect("logical operand value"),
                    true,
                );
            }
            self.add_jump(&scur, join);
        }

        if is_and {
            self.add_jump_if(cur, first_v, second_block, cushion);
        } else {
            self.add_jump_if(cur, first_v, cushion, second_block);
        }

        *cur = jcur;
        Ok(Some(first_v))
    }

    fn build_if(
        &mut self,
        cur: &mut Cursor,
        cond: &Node,
        then: Option<&Node>,
        els: Option<&Node>,
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        let cond_v = self.build_node(cur, cond, true)?;
        if !cur.continues() {
            return Ok(None);
        }
        let cond_v = cond_v.expect("condition value");

        let mut tcur = self.fork();
        let true_block = tcur.block;
        let true_v = match then {
            Some(node) => self.build_node(&mut tcur, node, use_result)?,
            None => self.add_immediate(&tcur, Value::Nil, use_result),
        };

        let mut fcur = self.fork();
        let false_block = fcur.block;
        let false_v = match els {
            Some(node) => self.build_node(&mut fcur, node, use_result)?,
            None => self.add_immediate(&fcur, Value::Nil, use_result),
        };

        self.add_jump_if(cur, cond_v, true_block, false_block);

        if tcur.continues() {
            if fcur.continues() {
                let jcur = self.fork();
                let join = jcur.block;
                let value = self.create_temp(cur, use_result);
                if let Some(value) = value {
                    self.add_copy(&tcur, value, true_v.expect("arm value"), true);
                    self.add_copy(&fcur, value, false_v.expect("arm value"), true);
                }
                self.add_jump(&tcur, join);
                self.add_jump(&fcur, join);
                *cur = jcur;
                return Ok(value);
            }
            *cur = tcur;
            return Ok(true_v);
        }
        if fcur.continues() {
            *cur = fcur;
            return Ok(false_v);
        }

        // Both arms stopped.
        cur.halt();
        Ok(None)
    }

    //     <while>         <begin-while>
    //  preheader ---> cond         preheader ---> body
    //                /    \                        |
    //            body      preexit --> exit       cond ...
    //             \__> cond  (result = nil)
    fn build_while(
        &mut self,
        cur: &mut Cursor,
        cond: &Node,
        body: Option<&Node>,
        pretest: bool,
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        let value = self.create_temp(cur, use_result);

        let phcur = self.fork();
        self.cfg.block_mut(phcur.block).set_name("while_preheader");
        let mut ccur = self.fork();
        self.cfg.block_mut(ccur.block).set_name("while_cond");
        let mut bcur = self.fork();
        self.cfg.block_mut(bcur.block).set_name("while_body");
        let pecur = self.fork();
        self.cfg.block_mut(pecur.block).set_name("while_preexit");
        let ecur = self.fork();
        self.cfg.block_mut(ecur.block).set_name("while_exit");

        self.add_jump(cur, phcur.block);
        if pretest {
            self.add_jump(&phcur, ccur.block);
        } else {
            // A post-test loop runs the body before the first check.
            self.add_jump(&phcur, bcur.block);
        }

        let cond_block = ccur.block;
        let body_block = bcur.block;
        let cond_v = self.build_node(&mut ccur, cond, true)?;
        if ccur.continues() {
            self.add_jump_if(
                &ccur,
                cond_v.expect("condition value"),
                body_block,
                pecur.block,
            );
        }

        // The loop's value is always nil.
        let nil = self.add_immediate(&pecur, Value::Nil, use_result);
        if let Some(value) = value {
            self.add_copy(&pecur, value, nil.expect("nil value"), true);
        }
        self.add_jump(&pecur, ecur.block);

        self.exit_points.push(ExitPoint {
            cond: cond_block,
            body: body_block,
            exit: ecur.block,
            result: value,
        });
        if let Some(body) = body {
            self.build_node(&mut bcur, body, false)?;
        }
        if bcur.continues() {
            self.add_jump(&bcur, cond_block);
        }
        self.exit_points.pop();

        *cur = ecur;
        Ok(value)
    }

    fn build_return(
        &mut self,
        cur: &mut Cursor,
        value: Option<&Node>,
    ) -> CompileResult<Option<VarId>> {
        let ret = match value {
            Some(node) => {
                let v = self.build_node(cur, node, true)?;
                if !cur.continues() {
                    return Ok(None);
                }
                v
            }
            None => self.add_immediate(cur, Value::Nil, true),
        };
        self.add_jump_to_return_block(cur, ret);
        Ok(ret)
    }

    fn build_call(
        &mut self,
        cur: &mut Cursor,
        recv: &Node,
        name: Id,
        args: &[crate::host::ast::NodeRef],
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        let receiver = self.build_node(cur, recv, true)?;
        if !cur.continues() {
            return Ok(None);
        }
        let receiver = receiver.expect("receiver value");

        let mut argv = vec![receiver];
        for arg in args {
            let v = self.build_node(cur, arg, true)?;
            if !cur.continues() {
                return Ok(None);
            }
            argv.push(v.expect("argument value"));
        }

        let lookup = self.add_lookup(cur, receiver, name);
        Ok(self.add_call(cur, &argv, lookup, use_result))
    }

    fn build_funcall(
        &mut self,
        cur: &mut Cursor,
        name: Id,
        args: &[crate::host::ast::NodeRef],
        use_result: bool,
    ) -> CompileResult<Option<VarId>> {
        if primitives::is_primitive(name) {
            let mut argv = Vec::with_capacity(args.len());
            for arg in args {
                let v = self.build_node(cur, arg, true)?;
                if !cur.continues() {
                    return Ok(None);
                }
                argv.push(v.expect("argument value"));
            }
            return Ok(self.add_primitive(cur, name, &argv, use_result));
        }

        let receiver = self.named_variable(cur, ids::self_name());
        let mut argv = vec![receiver];
        for arg in args {
            let v = self.build_node(cur, arg, true)?;
            if !cur.continues() {
                return Ok(None);
            }
            argv.push(v.expect("argument value"));
        }

        let lookup = self.add_lookup(cur, receiver, name);
        Ok(self.add_call(cur, &argv, lookup, use_result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ast::NodeRef;
    use std::rc::Rc;

    fn scope(locals: &[&str], required: usize, body: Node) -> Node {
        Node::Scope {
            locals: locals.iter().map(|n| Id::intern(n)).collect(),
            args: ArgsInfo::required(required),
            body: Rc::new(body),
        }
    }

    fn n(node: Node) -> NodeRef {
        Rc::new(node)
    }

    fn count_kind(cfg: &ControlFlowGraph, pred: impl Fn(&OpcodeKind) -> bool) -> usize {
        let mut count = 0;
        for b in cfg.block_ids() {
            for &op in cfg.block(b).opcodes() {
                if pred(&cfg.opcode(op).kind) {
                    count += 1;
                }
            }
        }
        count
    }

    #[test]
    fn test_minimal_method_shape() {
        let root = scope(&[], 0, Node::Nil);
        let built = build_method(&root, Id::intern("empty")).unwrap();
        let cfg = &built.cfg;

        // entry carries sentinel + env + enter, exit carries the env copy
        // and the exit terminator.
        assert!(cfg.output().is_some());
        assert_eq!(cfg.inputs().len(), 1); // self
        let exit_ops = cfg.block(cfg.exit()).opcodes();
        assert!(matches!(
            cfg.opcode(*exit_ops.last().unwrap()).kind,
            OpcodeKind::Exit
        ));
        assert!(cfg.check_sanity().is_empty());
    }

    #[test]
    fn test_arguments_become_inputs() {
        let root = scope(&["x", "y"], 2, Node::LocalVar(Id::intern("x")));
        let built = build_method(&root, Id::intern("two_args")).unwrap();
        assert_eq!(built.cfg.inputs().len(), 3);
        assert_eq!(built.cfg.required_argc(), 2);
    }

    #[test]
    fn test_variadic_arguments_are_rejected() {
        let root = Node::Scope {
            locals: vec![Id::intern("rest")],
            args: ArgsInfo {
                required: 0,
                has_optional: false,
                has_rest: true,
            },
            body: n(Node::Nil),
        };
        let err = build_method(&root, Id::intern("variadic")).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedSyntax { .. }));
    }

    #[test]
    fn test_rescue_is_rejected_without_partial_state() {
        let root = scope(
            &[],
            0,
            Node::Rescue {
                body: n(Node::Nil),
                handler: n(Node::Nil),
            },
        );
        let err = build_method(&root, Id::intern("guarded")).unwrap_err();
        match err {
            CompileError::UnsupportedSyntax { detail, .. } => {
                assert!(detail.contains("rescue"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_if_builds_join_with_copies() {
        let root = scope(
            &["c"],
            1,
            Node::If {
                cond: n(Node::LocalVar(Id::intern("c"))),
                then: Some(n(Node::Literal(Value::Fixnum(1)))),
                els: Some(n(Node::Literal(Value::Fixnum(2)))),
            },
        );
        let built = build_method(&root, Id::intern("branchy")).unwrap();
        let cfg = &built.cfg;

        assert_eq!(
            count_kind(cfg, |k| matches!(k, OpcodeKind::JumpIf { .. })),
            1
        );
        // Join temp receives one copy per arm, plus the output copy.
        assert!(count_kind(cfg, |k| matches!(k, OpcodeKind::Copy { .. })) >= 3);
        assert!(cfg.check_sanity().is_empty());
    }

    #[test]
    fn test_while_builds_five_block_shape() {
        let root = scope(
            &[],
            0,
            Node::Seq(vec![
                n(Node::While {
                    cond: n(Node::True),
                    body: Some(n(Node::Nil)),
                    pretest: true,
                }),
                n(Node::Nil),
            ]),
        );
        let built = build_method(&root, Id::intern("spin")).unwrap();
        let cfg = &built.cfg;
        // entry + exit + preheader/cond/body/preexit/loop-exit
        assert_eq!(cfg.block_count(), 7);
        assert!(cfg.check_sanity().is_empty());

        // The condition block loops back from the body.
        let names: Vec<Option<&str>> = cfg.block_ids().map(|b| cfg.block(b).name()).collect();
        assert!(names.contains(&Some("while_cond")));
        assert!(names.contains(&Some("while_preexit")));
    }

    #[test]
    fn test_call_operand_shape() {
        // o.m(1): receiver, one argument, lookup.
        let root = scope(
            &["o"],
            1,
            Node::Call {
                recv: n(Node::LocalVar(Id::intern("o"))),
                name: Id::intern("m"),
                args: vec![n(Node::Literal(Value::Fixnum(1)))],
            },
        );
        let built = build_method(&root, Id::intern("caller")).unwrap();
        let cfg = &built.cfg;

        let mut seen = false;
        for b in cfg.block_ids() {
            for &op in cfg.block(b).opcodes() {
                if let OpcodeKind::Call { operands, .. } = &cfg.opcode(op).kind {
                    seen = true;
                    assert_eq!(operands.len(), 3);
                    let lookup = cfg.opcode(op).kind.call_lookup();
                    let def = cfg.variable(lookup).def_opcode().unwrap();
                    assert!(matches!(cfg.opcode(def).kind, OpcodeKind::Lookup { .. }));
                }
            }
        }
        assert!(seen);
    }

    #[test]
    fn test_primitive_funcall_lowers_directly() {
        let root = scope(
            &["x"],
            1,
            Node::FuncCall {
                name: primitives::is_fixnum_name(),
                args: vec![n(Node::LocalVar(Id::intern("x")))],
            },
        );
        let built = build_method(&root, Id::intern("probe")).unwrap();
        assert_eq!(
            count_kind(&built.cfg, |k| matches!(k, OpcodeKind::Primitive { .. })),
            1
        );
        assert_eq!(
            count_kind(&built.cfg, |k| matches!(k, OpcodeKind::Call { .. })),
            0
        );
    }

    #[test]
    fn test_and_inserts_cushion_block() {
        let root = scope(
            &["a", "b"],
            2,
            Node::And(
                n(Node::LocalVar(Id::intern("a"))),
                n(Node::LocalVar(Id::intern("b"))),
            ),
        );
        let built = build_method(&root, Id::intern("both")).unwrap();
        let cfg = &built.cfg;
        // The join block must have two predecessors: cushion and second.
        // No predecessor of the join is the branching block itself.
        let mut join_found = false;
        for b in cfg.block_ids() {
            let block = cfg.block(b);
            if block.backedge_count() == 2 {
                for &pred in block.backedges() {
                    assert!(cfg.successors_of(pred).len() == 1, "critical edge into join");
                }
                join_found = true;
            }
        }
        assert!(join_found);
        assert!(cfg.check_sanity().is_empty());
    }
}
