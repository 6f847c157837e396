//! Register backend: compiles nodes to three-address code.
//!
//! Registers are allocated stack-like per function. `r0` receives the
//! function's result; temporaries are released as soon as the expression
//! that needed them is emitted, so a register file is as deep as its
//! deepest expression. A lambda compiles in place behind a jump, with its
//! own numbering from `r0`, and its [`Instr::Closure`] carries the size of
//! that file. Each call gets a fresh register file.

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

pub type Reg = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    LoadConst { dst: Reg, idx: usize },
    LoadVar { dst: Reg, name: usize },
    Move { dst: Reg, src: Reg },
    /// The body starts at `entry` and runs in `nregs` registers.
    Closure {
        dst: Reg,
        params: usize,
        body: EntityId,
        entry: usize,
        nregs: usize,
    },
    Call { dst: Reg, func: Reg, args: Vec<Reg> },
    /// Jump to `target` when `cond` is false.
    Branch { cond: Reg, target: usize },
    Jump { target: usize },
    Return { src: Reg },
    StreamMake { dst: Reg, capacity: Option<StreamCapacity> },
    StreamPut { dst: Reg, target: Reg, value: Reg },
    StreamCursor { dst: Reg, source: Reg },
    StreamNext { dst: Reg, source: Reg },
    /// The resume value lands in `dst`.
    Park { dst: Reg },
    Resume { parked: Reg, value: Reg },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegUnit {
    pub unit: EntityId,
    pub code: Vec<Instr>,
    pub constants: Vec<Value>,
    pub names: Vec<String>,
    pub params: Vec<Vec<String>>,
    /// Register file size of the top-level function.
    pub nregs: usize,
}

impl RegUnit {
    /// Lambda bodies compiled into this unit: entry offset and file size.
    pub fn bodies(&self) -> impl Iterator<Item = (EntityId, usize, usize)> + '_ {
        self.code.iter().filter_map(|instr| match instr {
            Instr::Closure {
                body, entry, nregs, ..
            } => Some((*body, *entry, *nregs)),
            _ => None,
        })
    }
}

/// Compilation work, popped from the back.
enum Task {
    Node { entity: EntityId, dst: Reg },
    Instr(Instr),
    /// Free every register allocated since the mark.
    Release(usize),
    /// Emit the closure and switch to a fresh register file for its body.
    OpenBody { dst: Reg, params: usize, body: EntityId },
    /// Record the body's file size and return to the enclosing function.
    CloseBody,
    /// Emit a jump with an unknown target and remember it as `label`.
    Hole { instr: Instr, label: usize },
    /// Aim the jump under `label` at the next instruction.
    Patch(usize),
}

/// Register state of a function suspended while a nested body is emitted.
struct Outer {
    closure_at: usize,
    next: usize,
    high: usize,
}

struct Emitter<'a> {
    facts: &'a FactSet,
    out: RegUnit,
    /// Next free register in the current function.
    next: usize,
    /// Register file size of the current function so far.
    high: usize,
    labels: Vec<usize>,
    outers: Vec<Outer>,
}

impl Emitter<'_> {
    fn alloc(&mut self) -> Result<Reg, VmError> {
        let reg = Reg::try_from(self.next).map_err(|_| VmError::internal("register file exhausted"))?;
        self.next += 1;
        self.high = self.high.max(self.next);
        Ok(reg)
    }

    fn label(&mut self) -> usize {
        self.labels.push(0);
        self.labels.len() - 1
    }

    fn patch(&mut self, label: usize) -> Result<(), VmError> {
        let at = *self
            .labels
            .get(label)
            .ok_or_else(|| VmError::internal("unknown jump label"))?;
        let here = self.out.code.len();
        match self.out.code.get_mut(at) {
            Some(Instr::Branch { target, .. } | Instr::Jump { target }) => *target = here,
            _ => {}
        }
        Ok(())
    }

    fn name(&mut self, name: String) -> usize {
        if let Some(idx) = self.out.names.iter().position(|n| *n == name) {
            return idx;
        }
        self.out.names.push(name);
        self.out.names.len() - 1
    }

    /// Tasks that leave the value of `entity` in `dst`.
    fn expand(&mut self, entity: EntityId, dst: Reg) -> Result<Vec<Task>, VmError> {
        let mark = self.next;
        let mut plan = match self.facts.view(entity)? {
            NodeView::Literal(lit) => {
                self.out.constants.push(Value::from(&lit));
                let idx = self.out.constants.len() - 1;
                vec![Task::Instr(Instr::LoadConst { dst, idx })]
            }
            NodeView::Variable { name } => {
                let name = self.name(name);
                vec![Task::Instr(Instr::LoadVar { dst, name })]
            }
            NodeView::Lambda { params, body } => {
                self.out.params.push(params);
                let params = self.out.params.len() - 1;
                let skip = self.label();
                vec![
                    Task::OpenBody { dst, params, body },
                    Task::Hole {
                        instr: Instr::Jump { target: 0 },
                        label: skip,
                    },
                    Task::Node { entity: body, dst: 0 },
                    Task::Instr(Instr::Return { src: 0 }),
                    Task::CloseBody,
                    Task::Patch(skip),
                ]
            }
            NodeView::Application { operator, operands } => {
                let func = self.alloc()?;
                let args = operands
                    .iter()
                    .map(|_| self.alloc())
                    .collect::<Result<Vec<_>, _>>()?;
                let mut plan = Vec::with_capacity(operands.len() + 3);
                plan.push(Task::Node { entity: operator, dst: func });
                plan.extend(
                    operands
                        .into_iter()
                        .zip(args.iter().copied())
                        .map(|(entity, dst)| Task::Node { entity, dst }),
                );
                plan.push(Task::Instr(Instr::Call { dst, func, args }));
                plan
            }
            NodeView::If {
                test,
                consequent,
                alternate,
            } => {
                let cond = self.alloc()?;
                let arm = self.alloc()?;
                let (branch, skip) = (self.label(), self.label());
                vec![
                    Task::Node { entity: test, dst: cond },
                    Task::Hole {
                        instr: Instr::Branch { cond, target: 0 },
                        label: branch,
                    },
                    Task::Node {
                        entity: consequent,
                        dst: arm,
                    },
                    Task::Hole {
                        instr: Instr::Jump { target: 0 },
                        label: skip,
                    },
                    Task::Patch(branch),
                    Task::Node {
                        entity: alternate,
                        dst: arm,
                    },
                    Task::Patch(skip),
                    // Both arms join here.
                    Task::Instr(Instr::Move { dst, src: arm }),
                ]
            }
            NodeView::StreamMake { capacity } => vec![Task::Instr(Instr::StreamMake { dst, capacity })],
            NodeView::StreamPut { target, value } => {
                let (t, v) = (self.alloc()?, self.alloc()?);
                vec![
                    Task::Node { entity: target, dst: t },
                    Task::Node { entity: value, dst: v },
                    Task::Instr(Instr::StreamPut { dst, target: t, value: v }),
                ]
            }
            NodeView::StreamCursor { source } => {
                let s = self.alloc()?;
                vec![
                    Task::Node { entity: source, dst: s },
                    Task::Instr(Instr::StreamCursor { dst, source: s }),
                ]
            }
            NodeView::StreamNext { source } => {
                let s = self.alloc()?;
                vec![
                    Task::Node { entity: source, dst: s },
                    Task::Instr(Instr::StreamNext { dst, source: s }),
                ]
            }
            NodeView::Park => vec![Task::Instr(Instr::Park { dst })],
            NodeView::Resume { parked, value } => {
                let (p, v) = (self.alloc()?, self.alloc()?);
                vec![
                    Task::Node { entity: parked, dst: p },
                    Task::Node { entity: value, dst: v },
                    Task::Instr(Instr::Resume { parked: p, value: v }),
                ]
            }
        };
        if self.next > mark {
            plan.push(Task::Release(mark));
        }
        Ok(plan)
    }

    fn run(&mut self, root: EntityId) -> Result<(), VmError> {
        let mut tasks = vec![Task::Node { entity: root, dst: 0 }];
        while let Some(task) = tasks.pop() {
            match task {
                Task::Node { entity, dst } => {
                    let plan = self.expand(entity, dst)?;
                    tasks.extend(plan.into_iter().rev());
                }
                Task::Instr(instr) => self.out.code.push(instr),
                Task::Release(mark) => self.next = mark,
                Task::OpenBody { dst, params, body } => {
                    let at = self.out.code.len();
                    self.outers.push(Outer {
                        closure_at: at,
                        next: self.next,
                        high: self.high,
                    });
                    self.out.code.push(Instr::Closure {
                        dst,
                        params,
                        body,
                        // Skip this instruction and the jump that follows it.
                        entry: at + 2,
                        nregs: 0,
                    });
                    self.next = 1;
                    self.high = 1;
                }
                Task::CloseBody => {
                    let outer = self
                        .outers
                        .pop()
                        .ok_or_else(|| VmError::internal("lambda body closed twice"))?;
                    if let Some(Instr::Closure { nregs, .. }) = self.out.code.get_mut(outer.closure_at) {
                        *nregs = self.high;
                    }
                    self.next = outer.next;
                    self.high = outer.high;
                }
                Task::Hole { instr, label } => {
                    let at = self.out.code.len();
                    let slot = self
                        .labels
                        .get_mut(label)
                        .ok_or_else(|| VmError::internal("unknown jump label"))?;
                    *slot = at;
                    self.out.code.push(instr);
                }
                Task::Patch(label) => self.patch(label)?,
            }
        }
        Ok(())
    }
}

/// Compile the unit for `unit`; its result is returned from `r0`.
pub fn compile(facts: &FactSet, unit: EntityId) -> Result<RegUnit, VmError> {
    let mut emitter = Emitter {
        facts,
        out: RegUnit {
            unit,
            code: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            params: Vec::new(),
            nregs: 1,
        },
        next: 1,
        high: 1,
        labels: Vec::new(),
        outers: Vec::new(),
    };
    emitter.run(unit)?;
    emitter.out.code.push(Instr::Return { src: 0 });
    emitter.out.nregs = emitter.high;
    Ok(emitter.out)
}

/// Where a callee's result goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnTo {
    pub addr: CodeAddr,
    pub dst: Reg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegFrame {
    /// `None` for the bottom frame.
    pub ret: Option<ReturnTo>,
    pub regs: Vec<Value>,
    pub env: Env,
}

impl RegFrame {
    fn get(&self, reg: Reg) -> Result<&Value, VmError> {
        usize::try_from(reg)
            .ok()
            .and_then(|i| self.regs.get(i))
            .ok_or_else(|| VmError::internal(format!("register r{reg} out of range")))
    }

    fn slot(&mut self, reg: Reg) -> Option<&mut Value> {
        usize::try_from(reg).ok().and_then(|i| self.regs.get_mut(i))
    }
}

/// Parked register state. Resumption writes the value to `dst` in the
/// innermost frame and continues at `pc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    pub pc: CodeAddr,
    pub dst: Reg,
    /// Innermost first.
    pub frames: Cont<RegFrame>,
}

#[derive(Debug, Clone)]
struct Run {
    pc: CodeAddr,
    frame: RegFrame,
    callers: Cont<RegFrame>,
}

impl Run {
    fn get(&self, reg: Reg) -> Result<&Value, VmError> {
        self.frame.get(reg)
    }

    fn check(&self, reg: Reg) -> Result<Reg, VmError> {
        self.get(reg).map(|_| reg)
    }
}

enum Effect {
    Write { dst: Reg, value: Value },
    Goto(usize),
    Enter { frame: RegFrame, entry: CodeAddr },
    Return { value: Value, ret: Option<ReturnTo> },
    Park { dst: Reg },
    Resume { id: ParkedId, value: Value },
}

pub struct RegisterMachine {
    core: MachineCore,
    units: HashMap<EntityId, RegUnit>,
    /// Where each known lambda body starts and its file size.
    entries: HashMap<EntityId, (CodeAddr, usize)>,
    run: Option<Run>,
}

impl RegisterMachine {
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
    pub fn unit(&self, unit: EntityId) -> Option<&RegUnit> {
        self.units.get(&unit)
    }

    fn ensure_unit(&mut self, unit: EntityId) -> Result<usize, VmError> {
        if let Some(compiled) = self.units.get(&unit) {
            return Ok(compiled.nregs);
        }
        let compiled = compile(&self.core.facts, unit)?;
        let nregs = compiled.nregs;
        trace!(unit, instrs = compiled.code.len(), nregs, "register unit compiled");
        for (body, offset, size) in compiled.bodies() {
            self.entries
                .entry(body)
                .or_insert((CodeAddr { unit, offset }, size));
        }
        self.units.insert(unit, compiled);
        Ok(nregs)
    }

    /// Entry and file size of a closure body. A body no compiled unit
    /// contains, such as one that arrived with a continuation, becomes its
    /// own unit.
    fn entry(&mut self, body: EntityId) -> Result<(CodeAddr, usize), VmError> {
        if let Some(entry) = self.entries.get(&body) {
            return Ok(*entry);
        }
        let nregs = self.ensure_unit(body)?;
        Ok((CodeAddr { unit: body, offset: 0 }, nregs))
    }

    fn unit_at(&self, unit: EntityId) -> Result<&RegUnit, VmError> {
        self.units
            .get(&unit)
            .ok_or_else(|| VmError::internal(format!("unit {unit} not compiled")))
    }

    fn execute(&mut self, instr: &Instr) -> Result<Effect, VmError> {
        let run = self.run.as_ref().ok_or(VmError::NoProgram)?;
        let pc = run.pc;
        let write = |dst: Reg, value: Value| -> Result<Effect, VmError> {
            Ok(Effect::Write {
                dst: run.check(dst)?,
                value,
            })
        };
        match instr {
            Instr::LoadConst { dst, idx } => {
                let value = self
                    .unit_at(pc.unit)?
                    .constants
                    .get(*idx)
                    .cloned()
                    .ok_or_else(|| VmError::internal("constant out of range"))?;
                write(*dst, value)
            }
            Instr::LoadVar { dst, name } => {
                let name = self
                    .unit_at(pc.unit)?
                    .names
                    .get(*name)
                    .ok_or_else(|| VmError::internal("name out of range"))?;
                let value = run
                    .frame
                    .env
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| VmError::UnboundVariable { name: name.clone() })?;
                write(*dst, value)
            }
            Instr::Move { dst, src } => write(*dst, run.get(*src)?.clone()),
            Instr::Closure { dst, params, body, .. } => {
                let params = self
                    .unit_at(pc.unit)?
                    .params
                    .get(*params)
                    .cloned()
                    .ok_or_else(|| VmError::internal("parameter list out of range"))?;
                let closure = Closure {
                    params,
                    body: *body,
                    env: run.frame.env.clone(),
                };
                write(*dst, Value::Closure(closure))
            }
            Instr::Call { dst, func, args } => {
                let dst = run.check(*dst)?;
                let values = args
                    .iter()
                    .map(|r| run.get(*r).cloned())
                    .collect::<Result<Vec<_>, _>>()?;
                match run.get(*func)? {
                    Value::Primitive(p) => Ok(Effect::Write {
                        dst,
                        value: p.apply(&values)?,
                    }),
                    Value::Closure(closure) => {
                        closure.check_arity(values.len())?;
                        let env = closure.env.bind_all(&closure.params, values);
                        let body = closure.body;
                        let (entry, nregs) = self.entry(body)?;
                        Ok(Effect::Enter {
                            frame: RegFrame {
                                ret: Some(ReturnTo {
                                    addr: CodeAddr {
                                        unit: pc.unit,
                                        offset: pc.offset + 1,
                                    },
                                    dst,
                                }),
                                regs: vec![Value::Nil; nregs],
                                env,
                            },
                            entry,
                        })
                    }
                    other => Err(VmError::NotCallable {
                        found: other.type_name(),
                    }),
                }
            }
            Instr::Branch { cond, target } => Ok(Effect::Goto(if run.get(*cond)?.is_truthy() {
                pc.offset + 1
            } else {
                *target
            })),
            Instr::Jump { target } => Ok(Effect::Goto(*target)),
            Instr::Return { src } => {
                let value = run.get(*src)?.clone();
                let ret = run.frame.ret;
                if let Some(to) = ret {
                    let caller = run
                        .callers
                        .top()
                        .ok_or_else(|| VmError::internal("return without a caller frame"))?;
                    caller.get(to.dst)?;
                }
                Ok(Effect::Return { value, ret })
            }
            Instr::StreamMake { dst, capacity } => {
                let dst = run.check(*dst)?;
                let capacity =
                    capacity.unwrap_or(StreamCapacity::Bounded(self.core.config.default_stream_capacity));
                Ok(Effect::Write {
                    dst,
                    value: self.core.store.make(capacity),
                })
            }
            Instr::StreamPut { dst, target, value } => {
                let dst = run.check(*dst)?;
                let target = run.get(*target)?;
                let value = run.get(*value)?.clone();
                let policy = self.core.config.stream_overflow;
                Ok(Effect::Write {
                    dst,
                    value: self.core.store.put(target, value, policy)?,
                })
            }
            Instr::StreamCursor { dst, source } => {
                let dst = run.check(*dst)?;
                Ok(Effect::Write {
                    dst,
                    value: self.core.store.cursor(run.get(*source)?)?,
                })
            }
            Instr::StreamNext { dst, source } => {
                let dst = run.check(*dst)?;
                Ok(Effect::Write {
                    dst,
                    value: self.core.store.next(run.get(*source)?)?,
                })
            }
            Instr::Park { dst } => Ok(Effect::Park { dst: run.check(*dst)? }),
            Instr::Resume { parked, value } => match run.get(*parked)? {
                Value::Parked(id) => Ok(Effect::Resume {
                    id: *id,
                    value: run.get(*value)?.clone(),
                }),
                other => Err(VmError::type_mismatch("resume", "parked", other)),
            },
        }
    }

    fn commit(&mut self, effect: Effect) -> Result<StepResult, VmError> {
        let Some(run) = self.run.as_mut() else {
            return Err(VmError::NoProgram);
        };
        match effect {
            Effect::Write { dst, value } => {
                if let Some(slot) = run.frame.slot(dst) {
                    *slot = value;
                }
                run.pc.offset += 1;
            }
            Effect::Goto(target) => run.pc.offset = target,
            Effect::Enter { frame, entry } => {
                let caller = std::mem::replace(&mut run.frame, frame);
                run.callers = run.callers.push(caller);
                run.pc = entry;
            }
            Effect::Return { value, ret } => {
                let Some(to) = ret else {
                    self.run = None;
                    self.core.halt(value);
                    return Ok(StepResult::Halted);
                };
                if let Some((mut caller, rest)) = std::mem::take(&mut run.callers).into_pop() {
                    if let Some(slot) = caller.slot(to.dst) {
                        *slot = value;
                    }
                    run.frame = caller;
                    run.callers = rest;
                }
                run.pc = to.addr;
            }
            Effect::Park { dst } => {
                let snapshot = RegisterSnapshot {
                    pc: CodeAddr {
                        unit: run.pc.unit,
                        offset: run.pc.offset + 1,
                    },
                    dst,
                    frames: run.callers.push(run.frame.clone()),
                };
                self.run = None;
                self.core.park(BackendKind::Register, ParkedState::Register(snapshot));
                return Ok(StepResult::Halted);
            }
            Effect::Resume { id, value } => self.resume_into(id, value)?,
        }
        Ok(StepResult::Continue)
    }

    fn resume_into(&mut self, id: ParkedId, value: Value) -> Result<(), VmError> {
        let snapshot = match &self.core.parked_for(id, BackendKind::Register)?.state {
            ParkedState::Register(snapshot) => snapshot.clone(),
            _ => return Err(VmError::internal("register backend holds a foreign snapshot")),
        };
        self.ensure_unit(snapshot.pc.unit)?;
        for to in snapshot.frames.iter().filter_map(|f| f.ret) {
            self.ensure_unit(to.addr.unit)?;
        }
        let (mut frame, callers) = snapshot
            .frames
            .into_pop()
            .ok_or_else(|| VmError::internal("parked register state has no frame"))?;
        let slot = frame
            .slot(snapshot.dst)
            .ok_or_else(|| VmError::internal(format!("parked register r{} out of range", snapshot.dst)))?;
        *slot = value;
        self.core.take_parked(id)?;
        self.run = Some(Run {
            pc: snapshot.pc,
            frame,
            callers,
        });
        self.core.resumed(id);
        Ok(())
    }
}

impl Machine for RegisterMachine {
    fn kind(&self) -> BackendKind {
        BackendKind::Register
    }

    fn core(&self) -> &MachineCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MachineCore {
        &mut self.core
    }

    fn load(&mut self, image: &ProgramImage) -> Result<(), VmError> {
        let root = self.core.admit(image)?;
        let nregs = self.ensure_unit(root)?;
        self.run = Some(Run {
            pc: CodeAddr { unit: root, offset: 0 },
            frame: RegFrame {
                ret: None,
                regs: vec![Value::Nil; nregs],
                env: self.core.base_env.clone(),
            },
            callers: Cont::empty(),
        });
        self.core.begin(root);
        Ok(())
    }

    fn step(&mut self) -> Result<StepResult, VmError> {
        let Some(run) = self.run.as_ref() else {
            return self.core.stopped();
        };
        let pc = run.pc;
        let instr = self
            .unit_at(pc.unit)?
            .code
            .get(pc.offset)
            .cloned()
            .ok_or_else(|| VmError::internal(format!("no instruction at {}:{}", pc.unit, pc.offset)))?;
        let effect = self.execute(&instr)?;
        let blocked = matches!(instr, Instr::StreamPut { .. } | Instr::StreamNext { .. })
            && matches!(&effect, Effect::Write { value: Value::Blocked, .. });
        self.core.steps += 1;
        if blocked {
            self.core.record(MachineEvent::Blocked {
                step: self.core.steps,
            });
        }
        trace!(unit = pc.unit, offset = pc.offset, ?instr, "register step");
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
            .map(|r| r.frame.env.clone())
            .unwrap_or_else(|| self.core.base_env.clone())
    }

    fn continuation(&self) -> Vec<FrameKind> {
        self.run
            .as_ref()
            .map(|r| {
                std::iter::once(&r.frame)
                    .chain(r.callers.iter())
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

    fn machine() -> RegisterMachine {
        RegisterMachine::new(VMConfig::default(), prelude())
    }

    #[test]
    fn test_application_allocates_temporaries() {
        let mut m = machine();
        let root = m.load_ast(&Node::call("+", [Node::int(10), Node::int(20)])).unwrap();
        let unit = m.unit(root).unwrap();
        assert_eq!(
            unit.code,
            vec![
                Instr::LoadVar { dst: 1, name: 0 },
                Instr::LoadConst { dst: 2, idx: 0 },
                Instr::LoadConst { dst: 3, idx: 1 },
                Instr::Call {
                    dst: 0,
                    func: 1,
                    args: vec![2, 3]
                },
                Instr::Return { src: 0 },
            ]
        );
        assert_eq!(unit.nregs, 4);
        assert_eq!(m.run().unwrap(), Value::Int(30));
    }

    #[test]
    fn test_registers_reused_across_siblings() {
        let program = Node::call(
            "+",
            [
                Node::call("*", [Node::int(2), Node::int(3)]),
                Node::call("*", [Node::int(4), Node::int(5)]),
            ],
        );
        let mut m = machine();
        let root = m.load_ast(&program).unwrap();
        // The second operand's call sits above r3 and needs r4..r6.
        assert_eq!(m.unit(root).unwrap().nregs, 7);
        assert_eq!(m.run().unwrap(), Value::Int(26));
    }

    #[test]
    fn test_branch_arms_join_through_move() {
        let mut m = machine();
        let program = Node::if_(Node::bool(true), Node::keyword("yes"), Node::keyword("no"));
        let root = m.load_ast(&program).unwrap();
        assert_eq!(
            m.unit(root).unwrap().code,
            vec![
                Instr::LoadConst { dst: 1, idx: 0 },
                Instr::Branch { cond: 1, target: 4 },
                Instr::LoadConst { dst: 2, idx: 1 },
                Instr::Jump { target: 5 },
                Instr::LoadConst { dst: 2, idx: 2 },
                Instr::Move { dst: 0, src: 2 },
                Instr::Return { src: 0 },
            ]
        );
        assert_eq!(m.run().unwrap(), Value::keyword("yes"));
    }

    #[test]
    fn test_lambda_body_compiles_inline_with_own_file() {
        let mut m = machine();
        let program = Node::apply(
            Node::lambda(["x"], Node::call("+", [Node::var("x"), Node::int(1)])),
            [Node::int(10)],
        );
        let root = m.load_ast(&program).unwrap();
        let unit = m.unit(root).unwrap();
        let Instr::Closure {
            dst, entry, nregs, ..
        } = &unit.code[0]
        else {
            panic!("expected a closure first, got {:?}", unit.code[0]);
        };
        // The body `(+ x 1)` needs r0 for its result and r1..r2 for the call.
        assert_eq!((*dst, *entry, *nregs), (1, 2, 3));
        assert_eq!(unit.code[1], Instr::Jump { target: 6 });
        assert_eq!(unit.code[5], Instr::Return { src: 0 });
        assert_eq!(unit.nregs, 3);
        assert_eq!(m.run().unwrap(), Value::Int(11));
        assert_eq!(m.units.len(), 1);
    }

    #[test]
    fn test_park_keeps_caller_chain() {
        let mut m = machine();
        let program = Node::apply(
            Node::lambda(["x"], Node::call("+", [Node::var("x"), Node::Park])),
            [Node::int(1)],
        );
        let Value::Parked(id) = m.eval(&program).unwrap() else {
            panic!("program did not park");
        };
        let ParkedState::Register(snapshot) = &m.parked().get(id).unwrap().state else {
            panic!("foreign snapshot");
        };
        assert_eq!(snapshot.frames.depth(), 2);
        m.resume(id, Value::Int(2)).unwrap();
        assert_eq!(m.continuation(), vec![FrameKind::Call, FrameKind::Halt]);
        assert_eq!(m.run().unwrap(), Value::Int(3));
    }
}
