//! Small-step CESK evaluator shared by the tree and semantic backends.
//!
//! Control is either a node to evaluate in an environment or a value to
//! return into the innermost frame. Every reduction is one call to
//! [`reduce`]; nothing recurses on the host stack, so evaluation can stop
//! at any frame boundary and be captured.
//!
//! The two backends differ only in how they read syntax: see [`Syntax`].

use std::fmt;

use cesk_types::{EntityId, FactSet, NodeView, StreamCapacity};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::VMConfig;
use crate::continuation::{Cont, FrameKind};
use crate::env::Env;
use crate::error::VmError;
use crate::loader::ProgramImage;
use crate::machine::{BackendKind, ControlView, Machine, MachineCore, StepResult};
use crate::park::ParkedState;
use crate::stream::Store;
use crate::trace::MachineEvent;
use crate::value::{ParkedId, Value};

/// How a walking backend reads program structure.
pub trait Syntax {
    /// Handle to one node.
    type Ref: Clone + fmt::Debug;

    fn entity(node: &Self::Ref) -> EntityId;

    fn view(&self, facts: &FactSet, node: &Self::Ref) -> Result<NodeView<Self::Ref>, VmError>;

    fn resolve(&self, facts: &FactSet, entity: EntityId) -> Result<Self::Ref, VmError>;

    /// Index the entities reachable from `roots`.
    fn refresh(&mut self, _facts: &FactSet, _roots: &[EntityId]) -> Result<(), VmError> {
        Ok(())
    }
}

/// A pending reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame<R> {
    Halt,
    Operator {
        operands: Vec<R>,
        env: Env,
    },
    Operands {
        func: Value,
        done: Vec<Value>,
        pending: Vec<R>,
        env: Env,
    },
    Branch {
        consequent: R,
        alternate: R,
        env: Env,
    },
    PutTarget {
        value: R,
        env: Env,
    },
    PutValue {
        target: Value,
    },
    Cursor,
    Next,
    ResumeTarget {
        value: R,
        env: Env,
    },
    ResumeValue {
        parked: Value,
    },
}

impl<R> Frame<R> {
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Halt => FrameKind::Halt,
            Frame::Operator { .. } => FrameKind::Operator,
            Frame::Operands { .. } => FrameKind::Operands,
            Frame::Branch { .. } => FrameKind::Branch,
            Frame::PutTarget { .. } => FrameKind::PutTarget,
            Frame::PutValue { .. } => FrameKind::PutValue,
            Frame::Cursor => FrameKind::Cursor,
            Frame::Next => FrameKind::Next,
            Frame::ResumeTarget { .. } => FrameKind::ResumeTarget,
            Frame::ResumeValue { .. } => FrameKind::ResumeValue,
        }
    }

    /// Node handles held by this frame.
    pub fn refs(&self) -> Vec<&R> {
        match self {
            Frame::Operator { operands, .. } => operands.iter().collect(),
            Frame::Operands { pending, .. } => pending.iter().collect(),
            Frame::Branch {
                consequent,
                alternate,
                ..
            } => vec![consequent, alternate],
            Frame::PutTarget { value, .. } | Frame::ResumeTarget { value, .. } => vec![value],
            _ => Vec::new(),
        }
    }

    pub fn env(&self) -> Option<&Env> {
        match self {
            Frame::Operator { env, .. }
            | Frame::Operands { env, .. }
            | Frame::Branch { env, .. }
            | Frame::PutTarget { env, .. }
            | Frame::ResumeTarget { env, .. } => Some(env),
            _ => None,
        }
    }

    /// Values held by this frame, environments excluded.
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Frame::Operands { func, done, .. } => std::iter::once(func).chain(done.iter()).collect(),
            Frame::PutValue { target } => vec![target],
            Frame::ResumeValue { parked } => vec![parked],
            _ => Vec::new(),
        }
    }

    /// Same frame with node handles translated.
    pub fn map_ref<T>(&self, f: &mut impl FnMut(&R) -> Result<T, VmError>) -> Result<Frame<T>, VmError> {
        Ok(match self {
            Frame::Halt => Frame::Halt,
            Frame::Operator { operands, env } => Frame::Operator {
                operands: operands.iter().map(&mut *f).collect::<Result<_, _>>()?,
                env: env.clone(),
            },
            Frame::Operands {
                func,
                done,
                pending,
                env,
            } => Frame::Operands {
                func: func.clone(),
                done: done.clone(),
                pending: pending.iter().map(&mut *f).collect::<Result<_, _>>()?,
                env: env.clone(),
            },
            Frame::Branch {
                consequent,
                alternate,
                env,
            } => Frame::Branch {
                consequent: f(consequent)?,
                alternate: f(alternate)?,
                env: env.clone(),
            },
            Frame::PutTarget { value, env } => Frame::PutTarget {
                value: f(value)?,
                env: env.clone(),
            },
            Frame::PutValue { target } => Frame::PutValue {
                target: target.clone(),
            },
            Frame::Cursor => Frame::Cursor,
            Frame::Next => Frame::Next,
            Frame::ResumeTarget { value, env } => Frame::ResumeTarget {
                value: f(value)?,
                env: env.clone(),
            },
            Frame::ResumeValue { parked } => Frame::ResumeValue {
                parked: parked.clone(),
            },
        })
    }

    /// Rewrite every value and environment in place.
    pub(crate) fn try_map_values(
        &mut self,
        f: &mut impl FnMut(&Value) -> Result<Value, VmError>,
    ) -> Result<(), VmError> {
        match self {
            Frame::Operands { func, done, env, .. } => {
                *func = f(func)?;
                for v in done.iter_mut() {
                    *v = f(v)?;
                }
                *env = env.try_map_values(&mut *f)?;
            }
            Frame::Operator { env, .. }
            | Frame::Branch { env, .. }
            | Frame::PutTarget { env, .. }
            | Frame::ResumeTarget { env, .. } => *env = env.try_map_values(&mut *f)?,
            Frame::PutValue { target } => *target = f(target)?,
            Frame::ResumeValue { parked } => *parked = f(parked)?,
            Frame::Halt | Frame::Cursor | Frame::Next => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Control<R> {
    Eval { node: R, env: Env },
    Return(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalkState<R> {
    pub control: Control<R>,
    pub cont: Cont<Frame<R>>,
}

/// Parked walking state: the frame chain `park` returns into, with node
/// handles lowered to entity ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkSnapshot {
    pub env: Env,
    pub frames: Cont<Frame<EntityId>>,
}

pub(crate) enum Transition<R> {
    Next(WalkState<R>),
    Halt(Value),
    Park { env: Env, cont: Cont<Frame<R>> },
    Resume { id: ParkedId, value: Value },
}

pub(crate) struct Stepped<R> {
    pub transition: Transition<R>,
    pub blocked: bool,
}

fn goto<R>(control: Control<R>, cont: Cont<Frame<R>>) -> Transition<R> {
    Transition::Next(WalkState { control, cont })
}

fn eval<R>(node: &R, env: &Env) -> Control<R>
where
    R: Clone,
{
    Control::Eval {
        node: node.clone(),
        env: env.clone(),
    }
}

fn apply<S: Syntax>(
    syntax: &S,
    facts: &FactSet,
    func: &Value,
    args: Vec<Value>,
    rest: Cont<Frame<S::Ref>>,
) -> Result<Transition<S::Ref>, VmError> {
    match func {
        Value::Primitive(p) => Ok(goto(Control::Return(p.apply(&args)?), rest)),
        Value::Closure(closure) => {
            closure.check_arity(args.len())?;
            let body = syntax.resolve(facts, closure.body)?;
            let env = closure.env.bind_all(&closure.params, args);
            Ok(goto(Control::Eval { node: body, env }, rest))
        }
        other => Err(VmError::NotCallable {
            found: other.type_name(),
        }),
    }
}

/// One reduction. Store effects happen only once nothing else can fail.
pub(crate) fn reduce<S: Syntax>(
    syntax: &S,
    facts: &FactSet,
    store: &mut Store,
    config: &VMConfig,
    state: &WalkState<S::Ref>,
) -> Result<Stepped<S::Ref>, VmError> {
    let cont = &state.cont;
    let mut blocked = false;
    let transition = match &state.control {
        Control::Eval { node, env } => match syntax.view(facts, node)? {
            NodeView::Literal(lit) => goto(Control::Return(Value::from(&lit)), cont.clone()),
            NodeView::Variable { name } => {
                let value = env
                    .lookup(&name)
                    .cloned()
                    .ok_or(VmError::UnboundVariable { name })?;
                goto(Control::Return(value), cont.clone())
            }
            NodeView::Lambda { params, body } => {
                let closure = crate::value::Closure {
                    params,
                    body: S::entity(&body),
                    env: env.clone(),
                };
                goto(Control::Return(Value::Closure(closure)), cont.clone())
            }
            NodeView::Application { operator, operands } => goto(
                Control::Eval {
                    node: operator,
                    env: env.clone(),
                },
                cont.push(Frame::Operator {
                    operands,
                    env: env.clone(),
                }),
            ),
            NodeView::If {
                test,
                consequent,
                alternate,
            } => goto(
                Control::Eval {
                    node: test,
                    env: env.clone(),
                },
                cont.push(Frame::Branch {
                    consequent,
                    alternate,
                    env: env.clone(),
                }),
            ),
            NodeView::StreamMake { capacity } => {
                let capacity =
                    capacity.unwrap_or(StreamCapacity::Bounded(config.default_stream_capacity));
                goto(Control::Return(store.make(capacity)), cont.clone())
            }
            NodeView::StreamPut { target, value } => goto(
                Control::Eval {
                    node: target,
                    env: env.clone(),
                },
                cont.push(Frame::PutTarget {
                    value,
                    env: env.clone(),
                }),
            ),
            NodeView::StreamCursor { source } => goto(
                Control::Eval {
                    node: source,
                    env: env.clone(),
                },
                cont.push(Frame::Cursor),
            ),
            NodeView::StreamNext { source } => goto(
                Control::Eval {
                    node: source,
                    env: env.clone(),
                },
                cont.push(Frame::Next),
            ),
            NodeView::Park => Transition::Park {
                env: env.clone(),
                cont: cont.clone(),
            },
            NodeView::Resume { parked, value } => goto(
                Control::Eval {
                    node: parked,
                    env: env.clone(),
                },
                cont.push(Frame::ResumeTarget {
                    value,
                    env: env.clone(),
                }),
            ),
        },

        Control::Return(value) => {
            let (frame, rest) = cont
                .pop()
                .ok_or_else(|| VmError::internal("return into an empty continuation"))?;
            match frame {
                Frame::Halt => Transition::Halt(value.clone()),
                Frame::Operator { operands, env } => match operands.split_first() {
                    None => apply(syntax, facts, value, Vec::new(), rest)?,
                    Some((first, pending)) => goto(
                        eval(first, env),
                        rest.push(Frame::Operands {
                            func: value.clone(),
                            done: Vec::new(),
                            pending: pending.to_vec(),
                            env: env.clone(),
                        }),
                    ),
                },
                Frame::Operands {
                    func,
                    done,
                    pending,
                    env,
                } => {
                    let mut done = done.clone();
                    done.push(value.clone());
                    match pending.split_first() {
                        None => apply(syntax, facts, func, done, rest)?,
                        Some((first, more)) => goto(
                            eval(first, env),
                            rest.push(Frame::Operands {
                                func: func.clone(),
                                done,
                                pending: more.to_vec(),
                                env: env.clone(),
                            }),
                        ),
                    }
                }
                Frame::Branch {
                    consequent,
                    alternate,
                    env,
                } => {
                    let chosen = if value.is_truthy() { consequent } else { alternate };
                    goto(eval(chosen, env), rest)
                }
                Frame::PutTarget { value: payload, env } => goto(
                    eval(payload, env),
                    rest.push(Frame::PutValue {
                        target: value.clone(),
                    }),
                ),
                Frame::PutValue { target } => {
                    let out = store.put(target, value.clone(), config.stream_overflow)?;
                    blocked = out.is_blocked();
                    goto(Control::Return(out), rest)
                }
                Frame::Cursor => goto(Control::Return(store.cursor(value)?), rest),
                Frame::Next => {
                    let out = store.next(value)?;
                    blocked = out.is_blocked();
                    goto(Control::Return(out), rest)
                }
                Frame::ResumeTarget { value: payload, env } => goto(
                    eval(payload, env),
                    rest.push(Frame::ResumeValue {
                        parked: value.clone(),
                    }),
                ),
                Frame::ResumeValue { parked } => match parked {
                    Value::Parked(id) => Transition::Resume {
                        id: *id,
                        value: value.clone(),
                    },
                    other => return Err(VmError::type_mismatch("resume", "parked", other)),
                },
            }
        }
    };
    Ok(Stepped {
        transition,
        blocked,
    })
}

/// A walking backend: the shared evaluator over one [`Syntax`].
pub struct WalkMachine<S: Syntax> {
    kind: BackendKind,
    pub(crate) core: MachineCore,
    pub(crate) syntax: S,
    state: Option<WalkState<S::Ref>>,
}

impl<S: Syntax> WalkMachine<S> {
    pub(crate) fn with_syntax(kind: BackendKind, config: VMConfig, env: Env, syntax: S) -> Self {
        Self {
            kind,
            core: MachineCore::new(config, env),
            syntax,
            state: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> Option<&WalkState<S::Ref>> {
        self.state.as_ref()
    }

    fn snapshot(&self, id: ParkedId) -> Result<WalkSnapshot, VmError> {
        match &self.core.parked_for(id, self.kind)?.state {
            ParkedState::Walk(snapshot) => Ok(snapshot.clone()),
            _ => Err(VmError::internal("walking backend holds a compiled snapshot")),
        }
    }

    fn restore(&self, snapshot: &WalkSnapshot, value: Value) -> Result<WalkState<S::Ref>, VmError> {
        let facts = &self.core.facts;
        let frames = snapshot
            .frames
            .iter()
            .map(|frame| frame.map_ref(&mut |e: &EntityId| self.syntax.resolve(facts, *e)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WalkState {
            control: Control::Return(value),
            cont: Cont::from_frames(frames),
        })
    }

    fn resume_into(&mut self, id: ParkedId, value: Value) -> Result<(), VmError> {
        let snapshot = self.snapshot(id)?;
        let next = self.restore(&snapshot, value)?;
        self.core.take_parked(id)?;
        self.state = Some(next);
        self.core.resumed(id);
        Ok(())
    }
}

impl<S: Syntax> Machine for WalkMachine<S> {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn core(&self) -> &MachineCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut MachineCore {
        &mut self.core
    }

    fn load(&mut self, image: &ProgramImage) -> Result<(), VmError> {
        let root = self.core.admit(image)?;
        self.syntax.refresh(&self.core.facts, &[root])?;
        let node = self.syntax.resolve(&self.core.facts, root)?;
        self.state = Some(WalkState {
            control: Control::Eval {
                node,
                env: self.core.base_env.clone(),
            },
            cont: Cont::empty().push(Frame::Halt),
        });
        self.core.begin(root);
        Ok(())
    }

    fn step(&mut self) -> Result<StepResult, VmError> {
        let Some(state) = &self.state else {
            return self.core.stopped();
        };
        let stepped = reduce(
            &self.syntax,
            &self.core.facts,
            &mut self.core.store,
            &self.core.config,
            state,
        )?;
        self.core.steps += 1;
        if stepped.blocked {
            self.core.record(MachineEvent::Blocked {
                step: self.core.steps,
            });
        }
        match stepped.transition {
            Transition::Next(next) => {
                trace!(depth = next.cont.depth(), "walk step");
                self.state = Some(next);
                Ok(StepResult::Continue)
            }
            Transition::Halt(value) => {
                self.state = None;
                self.core.halt(value);
                Ok(StepResult::Halted)
            }
            Transition::Park { env, cont } => {
                let frames = cont
                    .iter()
                    .map(|frame| frame.map_ref(&mut |r: &S::Ref| Ok(S::entity(r))))
                    .collect::<Result<Vec<_>, _>>()?;
                self.state = None;
                let id = self.core.park(
                    self.kind,
                    ParkedState::Walk(WalkSnapshot {
                        env,
                        frames: Cont::from_frames(frames),
                    }),
                );
                debug!(id, backend = %self.kind, "parked");
                Ok(StepResult::Halted)
            }
            Transition::Resume { id, value } => {
                if let Err(err) = self.resume_into(id, value) {
                    self.core.steps -= 1;
                    return Err(err);
                }
                Ok(StepResult::Continue)
            }
        }
    }

    fn control(&self) -> ControlView {
        match &self.state {
            None if self.core.value.is_some() => ControlView::Halted,
            None => ControlView::Idle,
            Some(WalkState {
                control: Control::Eval { node, .. },
                ..
            }) => ControlView::Node(S::entity(node)),
            Some(WalkState {
                control: Control::Return(value),
                ..
            }) => ControlView::Value(value.clone()),
        }
    }

    fn environment(&self) -> Env {
        match &self.state {
            Some(WalkState {
                control: Control::Eval { env, .. },
                ..
            }) => env.clone(),
            Some(state) => state
                .cont
                .iter()
                .find_map(Frame::env)
                .cloned()
                .unwrap_or_else(|| self.core.base_env.clone()),
            None => self.core.base_env.clone(),
        }
    }

    fn continuation(&self) -> Vec<FrameKind> {
        self.state
            .as_ref()
            .map(|s| s.cont.iter().map(Frame::kind).collect())
            .unwrap_or_default()
    }

    fn reset(&mut self) {
        self.state = None;
        self.core.reset();
    }

    fn resume(&mut self, id: ParkedId, value: Value) -> Result<(), VmError> {
        self.resume_into(id, value)
    }

    fn facts_extended(&mut self, roots: &[EntityId]) -> Result<(), VmError> {
        self.syntax.refresh(&self.core.facts, roots)
    }
}
