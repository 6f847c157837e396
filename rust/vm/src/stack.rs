//! Stack backend: compiles nodes to stack bytecode.
//!
//! Each unit is the code for one program root followed by [`Op::Return`].
//! A lambda compiles in place: [`Op::Closure`], a jump over the body, the
//! body, and its own `Return`. Units are compiled on first use from the
//! fact arena, so code addresses stay meaningful after a continuation is
//! moved to another machine.
//!
//! Operands live on a value stack; call frames remember where to return
//! and the stack height to unwind to, linked through their parents like the
//! walking backends' frames. The bottom frame has no return address:
//! returning into it halts.

use std::collections::HashMap;

use cesk_types::{EntityId, FactSet, NodeView, StreamCapacity};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::VMConfig;
use crate::continuation::{Cont, FrameKind};
use crate::env::Env;
use crate::error::VmError;
use crate::loader::ProgramImage;
use crate::machine::{BackendKind, CodeAddr, ControlView, Machine, MachineCore, StepResult};
use crate::park::ParkedState;
use crate::trace::MachineEvent;
use crate::value::{Closure, ParkedId, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Push `constants[idx]`.
    Const(usize),
    /// Push the binding of `names[idx]`.
    Load(usize),
    /// Push a closure over the current environment. Its body is compiled
    /// inline starting at `entry`.
    Closure { params: usize, body: EntityId, entry: usize },
    Jump(usize),
    /// Pop; jump when false.
    JumpIfFalse(usize),
    /// Stack holds callee then `argc` arguments.
    Call(usize),
    Return,
    StreamMake(Option<StreamCapacity>),
    /// Stack holds target then value.
    StreamPut,
    StreamCursor,
    StreamNext,
    Park,
    /// Stack holds parked handle then value.
    Resume,
}

/// Compiled code for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub unit: EntityId,
    pub code: Vec<Op>,
    pub constants: Vec<Value>,
    pub names: Vec<String>,
    pub params: Vec<Vec<String>>,
}

/// Compilation work, popped from the back.
enum Task {
    Node(EntityId),
    Op(Op),
    Closure { params: usize, body: EntityId },
    /// Emit a jump with an unknown target and remember it as `label`.
    Hole { op: Op, label: usize },
    /// Aim the jump under `label` at the next instruction.
    Patch(usize),
}

impl Segment {
    fn constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn name(&mut self, name: String) -> usize {
        if let Some(idx) = self.names.iter().position(|n| *n == name) {
            return idx;
        }
        self.names.push(name);
        self.names.len() - 1
    }

    fn patch(&mut self, at: usize) {
        let target = self.code.len();
        match self.code.get_mut(at) {
            Some(Op::Jump(t) | Op::JumpIfFalse(t)) => *t = target,
            _ => {}
        }
    }

    /// Lambda bodies compiled into this unit and where each starts.
    pub fn bodies(&self) -> impl Iterator<Item = (EntityId, usize)> + '_ {
        self.code.iter().filter_map(|op| match op {
            Op::Closure { body, entry, .. } => Some((*body, *entry)),
            _ => None,
        })
    }

    fn expand(&mut self, facts: &FactSet, entity: EntityId, labels: &mut Vec<usize>) -> Result<Vec<Task>, VmError> {
        let mut label = || {
            labels.push(0);
            labels.len() - 1
        };
        Ok(match facts.view(entity)? {
            NodeView::Literal(lit) => vec![Task::Op(Op::Const(self.constant(Value::from(&lit))))],
            NodeView::Variable { name } => vec![Task::Op(Op::Load(self.name(name)))],
            NodeView::Lambda { params, body } => {
                self.params.push(params);
                let skip = label();
                vec![
                    Task::Closure {
                        params: self.params.len() - 1,
                        body,
                    },
                    Task::Hole {
                        op: Op::Jump(0),
                        label: skip,
                    },
                    Task::Node(body),
                    Task::Op(Op::Return),
                    Task::Patch(skip),
                ]
            }
            NodeView::Application { operator, operands } => {
                let argc = operands.len();
                let mut plan = Vec::with_capacity(argc + 2);
                plan.push(Task::Node(operator));
                plan.extend(operands.into_iter().map(Task::Node));
                plan.push(Task::Op(Op::Call(argc)));
                plan
            }
            NodeView::If {
                test,
                consequent,
                alternate,
            } => {
                let (branch, skip) = (label(), label());
                vec![
                    Task::Node(test),
                    Task::Hole {
                        op: Op::JumpIfFalse(0),
                        label: branch,
                    },
                    Task::Node(consequent),
                    Task::Hole {
                        op: Op::Jump(0),
                        label: skip,
                    },
                    Task::Patch(branch),
                    Task::Node(alternate),
                    Task::Patch(skip),
                ]
            }
            NodeView::StreamMake { capacity } => vec![Task::Op(Op::StreamMake(capacity))],
            NodeView::StreamPut { target, value } => {
                vec![Task::Node(target), Task::Node(value), Task::Op(Op::StreamPut)]
            }
            NodeView::StreamCursor { source } => vec![Task::Node(source), Task::Op(Op::StreamCursor)],
            NodeView::StreamNext { source } => vec![Task::Node(source), Task::Op(Op::StreamNext)],
            NodeView::Park => vec![Task::Op(Op::Park)],
            NodeView::Resume { parked, value } => {
                vec![Task::Node(parked), Task::Node(value), Task::Op(Op::Resume)]
            }
        })
    }

    fn emit(&mut self, facts: &FactSet, root: EntityId) -> Result<(), VmError> {
        let mut labels: Vec<usize> = Vec::new();
        let mut tasks = vec![Task::Node(root)];
        while let Some(task) = tasks.pop() {
            match task {
                Task::Node(entity) => {
                    let plan = self.expand(facts, entity, &mut labels)?;
                    tasks.extend(plan.into_iter().rev());
                }
                Task::Op(op) => self.code.push(op),
                Task::Closure { params, body } => {
                    // Skip this instruction and the jump that follows it.
                    let entry = self.code.len() + 2;
                    self.code.push(Op::Closure { params, body, entry });
                }
                Task::Hole { op, label } => {
                    let slot = labels
                        .get_mut(label)
                        .ok_or_else(|| VmError::internal("unknown jump label"))?;
                    *slot = self.code.len();
                    self.code.push(op);
                }
                Task::Patch(label) => {
                    let at = *labels
                        .get(label)
                        .ok_or_else(|| VmError::internal("unknown jump label"))?;
                    self.patch(at);
                }
            }
        }
        Ok(())
    }
}

/// Compile the unit for `unit`.
pub fn compile(facts: &FactSet, unit: EntityId) -> Result<Segment, VmError> {
    let mut segment = Segment {
        unit,
        code: Vec::new(),
        constants: Vec::new(),
        names: Vec::new(),
        params: Vec::new(),
    };
    segment.emit(facts, unit)?;
    segment.code.push(Op::Return);
    Ok(segment)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    /// `None` for the bottom frame.
    pub ret: Option<CodeAddr>,
    /// Stack height to unwind to on return.
    pub base: usize,
    pub env: Env,
}

/// Parked stack state. Resumption pushes the resume value and continues
/// at `pc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSnapshot {
    pub pc: CodeAddr,
    pub stack: Vec<Value>,
    /// Innermost first.
    pub frames: Cont<CallFrame>,
}

#[derive(Debug, Clone)]
struct Run {
    pc: CodeAddr,
    stack: Vec<Value>,
    frames: Cont<CallFrame>,
}

impl Run {
    fn frame(&self) -> Result<&CallFrame, VmError> {
        self.frames
            .top()
            .ok_or_else(|| VmError::internal("no call frame"))
    }

    fn env(&self) -> Result<&Env, VmError> {
        self.frame().map(|f| &f.env)
    }

    /// The value `depth` below the top.
    fn peek(&self, depth: usize) -> Result<&Value, VmError> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .and_then(|i| self.stack.get(i))
            .ok_or_else(|| VmError::internal("stack underflow"))
    }
}

enum Effect {
    /// Pop `pop` values, push one, fall through.
    Replace { pop: usize, push: Value },
    Goto(usize),
    /// Pop the test and continue at `target`.
    Test { target: usize },
    Enter { func_at: usize, env: Env, entry: CodeAddr },
    Return { value: Value, ret: Option<CodeAddr>, base: usize },
    Park,
    Resume { id: ParkedId, value: Value },
}

pub struct StackMachine {
    core: MachineCore,
    units: HashMap<EntityId, Segment>,
    /// Where each known lambda body starts.
    entries: HashMap<EntityId, CodeAddr>,
    run: Option<Run>,
}

impl StackMachine {
    #[must_use]
    pub fn new(config: VMConfig, env: Env) -> Self {
        Self {
            core: MachineCore::new(config, env),
            units: HashMap::new(),
            entries: HashMap::new(),
            run: None,
        }
    }

    #[must_use]
    pub fn segment(&self, unit: EntityId) -> Option<&Segment> {
        self.units.get(&unit)
    }

    fn ensure_unit(&mut self, unit: EntityId) -> Result<(), VmError> {
        if self.units.contains_key(&unit) {
            return Ok(());
        }
        let segment = compile(&self.core.facts, unit)?;
        trace!(unit, ops = segment.code.len(), "stack unit compiled");
        for (body, offset) in segment.bodies() {
            self.entries.entry(body).or_insert(CodeAddr { unit, offset });
        }
        self.units.insert(unit, segment);
        Ok(())
    }

    /// Code address of a closure body. A body no compiled unit contains,
    /// such as one that arrived with a continuation, becomes its own unit.
    fn entry(&mut self, body: EntityId) -> Result<CodeAddr, VmError> {
        if let Some(entry) = self.entries.get(&body) {
            return Ok(*entry);
        }
        self.ensure_unit(body)?;
        Ok(CodeAddr { unit: body, offset: 0 })
    }

    fn segment_at(&self, unit: EntityId) -> Result<&Segment, VmError> {
        self.units
            .get(&unit)
            .ok_or_else(|| VmError::internal(format!("unit {unit} not compiled")))
    }

    fn execute(&mut self, op: &Op) -> Result<Effect, VmError> {
        let run = self.run.as_ref().ok_or(VmError::NoProgram)?;
        let pc = run.pc;
        Ok(match op {
            Op::Const(idx) => Effect::Replace {
                pop: 0,
                push: self
                    .segment_at(pc.unit)?
                    .constants
                    .get(*idx)
                    .cloned()
                    .ok_or_else(|| VmError::internal("constant out of range"))?,
            },
            Op::Load(idx) => {
                let name = self
                    .segment_at(pc.unit)?
                    .names
                    .get(*idx)
                    .ok_or_else(|| VmError::internal("name out of range"))?;
                let value = run
                    .env()?
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| VmError::UnboundVariable { name: name.clone() })?;
                Effect::Replace { pop: 0, push: value }
            }
            Op::Closure { params, body, .. } => {
                let params = self
                    .segment_at(pc.unit)?
                    .params
                    .get(*params)
                    .cloned()
                    .ok_or_else(|| VmError::internal("parameter list out of range"))?;
                Effect::Replace {
                    pop: 0,
                    push: Value::Closure(Closure {
                        params,
                        body: *body,
                        env: run.env()?.clone(),
                    }),
                }
            }
            Op::Jump(target) => Effect::Goto(*target),
            Op::JumpIfFalse(target) => Effect::Test {
                target: if run.peek(0)?.is_truthy() {
                    pc.offset + 1
                } else {
                    *target
                },
            },
            Op::Call(argc) => {
                let func_at = run
                    .stack
                    .len()
                    .checked_sub(argc + 1)
                    .ok_or_else(|| VmError::internal("stack underflow at call"))?;
                let args = &run.stack[func_at + 1..];
                match &run.stack[func_at] {
                    Value::Primitive(p) => Effect::Replace {
                        pop: argc + 1,
                        push: p.apply(args)?,
                    },
                    Value::Closure(closure) => {
                        closure.check_arity(args.len())?;
                        let env = closure.env.bind_all(&closure.params, args.iter().cloned());
                        let body = closure.body;
                        let entry = self.entry(body)?;
                        Effect::Enter { func_at, env, entry }
                    }
                    other => {
                        return Err(VmError::NotCallable {
                            found: other.type_name(),
                        })
                    }
                }
            }
            Op::Return => {
                let frame = run.frame()?;
                Effect::Return {
                    value: run.peek(0)?.clone(),
                    ret: frame.ret,
                    base: frame.base,
                }
            }
            Op::StreamMake(capacity) => {
                let capacity =
                    capacity.unwrap_or(StreamCapacity::Bounded(self.core.config.default_stream_capacity));
                Effect::Replace {
                    pop: 0,
                    push: self.core.store.make(capacity),
                }
            }
            Op::StreamPut => {
                let target = run.peek(1)?;
                let value = run.peek(0)?.clone();
                let policy = self.core.config.stream_overflow;
                Effect::Replace {
                    pop: 2,
                    push: self.core.store.put(target, value, policy)?,
                }
            }
            Op::StreamCursor => Effect::Replace {
                pop: 1,
                push: self.core.store.cursor(run.peek(0)?)?,
            },
            Op::StreamNext => Effect::Replace {
                pop: 1,
                push: self.core.store.next(run.peek(0)?)?,
            },
            Op::Park => Effect::Park,
            Op::Resume => match run.peek(1)? {
                Value::Parked(id) => Effect::Resume {
                    id: *id,
                    value: run.peek(0)?.clone(),
                },
                other => return Err(VmError::type_mismatch("resume", "parked", other)),
            },
        })
    }

    fn commit(&mut self, effect: Effect) -> Result<StepResult, VmError> {
        let Some(run) = self.run.as_mut() else {
            return Err(VmError::NoProgram);
        };
        match effect {
            Effect::Replace { pop, push } => {
                let keep = run.stack.len().saturating_sub(pop);
                run.stack.truncate(keep);
                run.stack.push(push);
                run.pc.offset += 1;
            }
            Effect::Goto(target) => run.pc.offset = target,
            Effect::Test { target } => {
                run.stack.pop();
                run.pc.offset = target;
            }
            Effect::Enter { func_at, env, entry } => {
                run.stack.truncate(func_at);
                run.frames = run.frames.push(CallFrame {
                    ret: Some(CodeAddr {
                        unit: run.pc.unit,
                        offset: run.pc.offset + 1,
                    }),
                    base: func_at,
                    env,
                });
                run.pc = entry;
            }
            Effect::Return { value, ret, base } => {
                let Some(ret) = ret else {
                    self.run = None;
                    self.core.halt(value);
                    return Ok(StepResult::Halted);
                };
                run.frames = run.frames.pop().map(|(_, rest)| rest).unwrap_or_default();
                run.stack.truncate(base);
                run.stack.push(value);
                run.pc = ret;
            }
            Effect::Park => {
                let snapshot = StackSnapshot {
                    pc: CodeAddr {
                        unit: run.pc.unit,
                        offset: run.pc.offset + 1,
                    },
                    stack: run.stack.clone(),
                    frames: run.frames.clone(),
                };
                self.run = None;
                self.core.park(BackendKind::Stack, ParkedState::Stack(snapshot));
                return Ok(StepResult::Halted);
            }
            Effect::Resume { id, value } => self.resume_into(id, value)?,
        }
        Ok(StepResult::Continue)
    }

    fn resume_into(&mut self, id: ParkedId, value: Value) -> Result<(), VmError> {
        let snapshot = match &self.core.parked_for(id, BackendKind::Stack)?.state {
            ParkedState::Stack(snapshot) => snapshot.clone(),
            _ => return Err(VmError::internal("stack backend holds a foreign snapshot")),
        };
        self.ensure_unit(snapshot.pc.unit)?;
        for ret in snapshot.frames.iter().filter_map(|f| f.ret) {
            self.ensure_unit(ret.unit)?;
        }
        self.core.take_parked(id)?;
        let mut stack = snapshot.stack;
        stack.push(value);
        self.run = Some(Run {
            pc: snapshot.pc,
            stack,
            frames: snapshot.frames,
        });
        self.core.resumed(id);
        Ok(())
    }
}

impl Machine for StackMachine {
    fn kind(&self) -> BackendKind {
        BackendKind::Stack
    }

    fn core(&self) -> &MachineCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MachineCore {
        &mut self.core
    }

    fn load(&mut self, image: &ProgramImage) -> Result<(), VmError> {
        let root = self.core.admit(image)?;
        self.ensure_unit(root)?;
        self.run = Some(Run {
            pc: CodeAddr { unit: root, offset: 0 },
            stack: Vec::new(),
            frames: Cont::empty().push(CallFrame {
                ret: None,
                base: 0,
                env: self.core.base_env.clone(),
            }),
        });
        self.core.begin(root);
        Ok(())
    }

    fn step(&mut self) -> Result<StepResult, VmError> {
        let Some(run) = self.run.as_ref() else {
            return self.core.stopped();
        };
        let pc = run.pc;
        let op = self
            .segment_at(pc.unit)?
            .code
            .get(pc.offset)
            .cloned()
            .ok_or_else(|| VmError::internal(format!("no instruction at {}:{}", pc.unit, pc.offset)))?;
        let effect = self.execute(&op)?;
        let blocked = matches!(op, Op::StreamPut | Op::StreamNext)
            && matches!(&effect, Effect::Replace { push: Value::Blocked, .. });
        self.core.steps += 1;
        if blocked {
            self.core.record(MachineEvent::Blocked {
                step: self.core.steps,
            });
        }
        trace!(unit = pc.unit, offset = pc.offset, ?op, "stack step");
        let committed = self.commit(effect);
        if committed.is_err() {
            // Only a resume can fail here, and it commits nothing.
            self.core.steps -= 1;
        }
        committed
    }

    fn control(&self) -> ControlView {
        match &self.run {
            Some(run) => ControlView::Code(run.pc),
            None if self.core.value.is_some() => ControlView::Halted,
            None => ControlView::Idle,
        }
    }

    fn environment(&self) -> Env {
        self.run
            .as_ref()
            .and_then(|r| r.env().ok().cloned())
            .unwrap_or_else(|| self.core.base_env.clone())
    }

    fn continuation(&self) -> Vec<FrameKind> {
        self.run
            .as_ref()
            .map(|r| {
                r.frames
                    .iter()
                    .map(|f| if f.ret.is_some() { FrameKind::Call } else { FrameKind::Halt })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn reset(&mut self) {
        self.run = None;
        self.core.reset();
    }

    fn resume(&mut self, id: ParkedId, value: Value) -> Result<(), VmError> {
        self.resume_into(id, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::prelude;
    use cesk_types::Node;

    fn machine() -> StackMachine {
        StackMachine::new(VMConfig::default(), prelude())
    }

    #[test]
    fn test_if_layout() {
        let mut m = machine();
        let root = m
            .load_ast(&Node::if_(Node::bool(false), Node::int(1), Node::int(2)))
            .unwrap();
        let code = &m.segment(root).unwrap().code;
        assert_eq!(
            code,
            &vec![
                Op::Const(0),
                Op::JumpIfFalse(4),
                Op::Const(1),
                Op::Jump(5),
                Op::Const(2),
                Op::Return,
            ]
        );
        assert_eq!(m.run().unwrap(), Value::Int(2));
    }

    #[test]
    fn test_lambda_body_compiles_inline() {
        let mut m = machine();
        let program = Node::apply(Node::lambda(["x"], Node::var("x")), [Node::int(10)]);
        let root = m.load_ast(&program).unwrap();
        let NodeView::Application { operator, .. } = m.facts().view(root).unwrap() else {
            panic!("root is not an application");
        };
        let NodeView::Lambda { body, .. } = m.facts().view(operator).unwrap() else {
            panic!("operator is not a lambda");
        };
        assert_eq!(
            m.segment(root).unwrap().code,
            vec![
                Op::Closure {
                    params: 0,
                    body,
                    entry: 2
                },
                Op::Jump(4),
                Op::Load(0),
                Op::Return,
                Op::Const(0),
                Op::Call(1),
                Op::Return,
            ]
        );
        assert_eq!(m.run().unwrap(), Value::Int(10));
        assert_eq!(m.units.len(), 1);
    }

    #[test]
    fn test_nested_branches_patch_their_own_jumps() {
        let mut m = machine();
        let program = Node::if_(
            Node::if_(Node::bool(false), Node::bool(false), Node::bool(true)),
            Node::if_(Node::nil(), Node::int(1), Node::int(2)),
            Node::int(3),
        );
        let root = m.load_ast(&program).unwrap();
        let code = &m.segment(root).unwrap().code;
        for op in code {
            if let Op::Jump(t) | Op::JumpIfFalse(t) = op {
                assert!(*t > 0 && *t < code.len(), "unpatched jump in {code:?}");
            }
        }
        assert_eq!(m.run().unwrap(), Value::Int(2));
    }

    #[test]
    fn test_frames_share_parked_chain() {
        let mut m = machine();
        let program = Node::apply(
            Node::lambda(["x"], Node::call("+", [Node::var("x"), Node::Park])),
            [Node::int(1)],
        );
        let Value::Parked(id) = m.eval(&program).unwrap() else {
            panic!("program did not park");
        };
        let ParkedState::Stack(snapshot) = &m.parked().get(id).unwrap().state else {
            panic!("foreign snapshot");
        };
        assert_eq!(snapshot.frames.depth(), 2);
        assert!(snapshot.frames.top().unwrap().ret.is_some());
        m.resume(id, Value::Int(2)).unwrap();
        assert_eq!(m.continuation(), vec![FrameKind::Call, FrameKind::Halt]);
        assert_eq!(m.run().unwrap(), Value::Int(3));
    }

    #[test]
    fn test_call_frames_unwind() {
        let mut m = machine();
        let program = Node::call(
            "+",
            [
                Node::apply(Node::lambda(["y"], Node::var("y")), [Node::int(4)]),
                Node::int(5),
            ],
        );
        assert_eq!(m.eval(&program).unwrap(), Value::Int(9));
        assert!(m.continuation().is_empty());
    }
}
