//! The machine contract shared by every backend.
//!
//! A machine is a CESK tuple: control, environment, store and
//! continuation. Backends differ in how they represent control and
//! continuation; the contract below is the same for all of them, and a
//! program halts with the same value (or the same fault class) on each.
//!
//! Steps are atomic. A backend computes the successor state first and
//! commits it only once nothing can fail, so an `Err` from [`Machine::step`]
//! leaves the machine as it was.

use std::fmt;
use std::str::FromStr;

use cesk_types::{bundle, AstBundle, Decomposer, EntityId, FactSet, HashIdMap, Node};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::VMConfig;
use crate::continuation::FrameKind;
use crate::env::Env;
use crate::error::VmError;
use crate::loader::ProgramImage;
use crate::migrate::{self, ContinuationBundle};
use crate::park::{ParkRegistry, ParkedContinuation, ParkedState};
use crate::primitives::prelude;
use crate::register::RegisterMachine;
use crate::semantic::SemanticMachine;
use crate::stack::StackMachine;
use crate::stream::Store;
use crate::trace::MachineEvent;
use crate::tree::TreeMachine;
use crate::value::{ParkedId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Walks linked syntax terms.
    Tree,
    /// Compiles to stack bytecode.
    Stack,
    /// Compiles to register bytecode.
    Register,
    /// Reads syntax straight from facts on every step.
    Semantic,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Tree,
        BackendKind::Stack,
        BackendKind::Register,
        BackendKind::Semantic,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Tree => "tree",
            BackendKind::Stack => "stack",
            BackendKind::Register => "register",
            BackendKind::Semantic => "semantic",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown backend `{s}` (expected tree, stack, register or semantic)"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Halted,
}

/// Position in compiled code: a unit, keyed by the entity it was compiled
/// from, and an instruction offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeAddr {
    pub unit: EntityId,
    pub offset: usize,
}

/// What the machine is looking at.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlView {
    /// Nothing loaded.
    Idle,
    /// About to evaluate this node.
    Node(EntityId),
    /// Returning this value to the continuation.
    Value(Value),
    /// About to execute this instruction.
    Code(CodeAddr),
    Halted,
}

/// State every backend carries.
#[derive(Debug)]
pub struct MachineCore {
    pub(crate) config: VMConfig,
    pub(crate) base_env: Env,
    pub(crate) facts: FactSet,
    pub(crate) store: Store,
    pub(crate) parked: ParkRegistry,
    pub(crate) alloc: Decomposer,
    pub(crate) value: Option<Value>,
    pub(crate) root: Option<EntityId>,
    pub(crate) steps: u64,
    pub(crate) events: Vec<MachineEvent>,
}

impl MachineCore {
    pub(crate) fn new(config: VMConfig, base_env: Env) -> Self {
        let alloc = Decomposer::new(config.id_start);
        Self {
            config,
            base_env,
            facts: FactSet::new(),
            store: Store::new(),
            parked: ParkRegistry::new(),
            alloc,
            value: None,
            root: None,
            steps: 0,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &VMConfig {
        &self.config
    }

    #[must_use]
    pub fn base_env(&self) -> &Env {
        &self.base_env
    }

    #[must_use]
    pub fn root(&self) -> Option<EntityId> {
        self.root
    }

    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Merge an image into the fact arena and check its root there.
    /// Nothing changes on failure.
    pub(crate) fn admit(&mut self, image: &ProgramImage) -> Result<EntityId, VmError> {
        let mut facts = self.facts.clone();
        facts.merge(image.facts.clone())?;
        facts.validate(image.root)?;
        self.facts = facts;
        Ok(image.root)
    }

    pub(crate) fn begin(&mut self, root: EntityId) {
        self.value = None;
        self.root = Some(root);
        debug!(root, entities = self.facts.len(), "program loaded");
        self.record(MachineEvent::Loaded {
            step: self.steps,
            root,
        });
    }

    /// Step result of a machine with no live control.
    pub(crate) fn stopped(&self) -> Result<StepResult, VmError> {
        if self.value.is_some() {
            Ok(StepResult::Halted)
        } else {
            Err(VmError::NoProgram)
        }
    }

    pub(crate) fn record(&mut self, event: MachineEvent) {
        if self.config.record_events {
            trace!(?event, "machine event");
            self.events.push(event);
        }
    }

    pub(crate) fn halt(&mut self, value: Value) {
        debug!(%value, steps = self.steps, "halted");
        self.record(MachineEvent::Halted {
            step: self.steps,
            value: value.clone(),
        });
        self.value = Some(value);
    }

    /// Register a captured continuation and halt with its handle.
    pub(crate) fn park(&mut self, backend: BackendKind, state: ParkedState) -> ParkedId {
        let id = self.parked.park(ParkedContinuation { backend, state });
        self.record(MachineEvent::Parked { step: self.steps, id });
        self.halt(Value::Parked(id));
        id
    }

    /// The entry for `id`, checked against the resuming backend.
    pub(crate) fn parked_for(&self, id: ParkedId, backend: BackendKind) -> Result<&ParkedContinuation, VmError> {
        let entry = self.parked.get(id)?;
        if entry.backend != backend {
            return Err(VmError::BackendMismatch {
                expected: backend,
                found: entry.backend,
            });
        }
        Ok(entry)
    }

    pub(crate) fn take_parked(&mut self, id: ParkedId) -> Result<ParkedContinuation, VmError> {
        self.parked.take(id)
    }

    pub(crate) fn resumed(&mut self, id: ParkedId) {
        self.value = None;
        debug!(id, "resumed");
        self.record(MachineEvent::Resumed { step: self.steps, id });
    }

    /// Drop execution state, keeping facts and compiled code.
    pub(crate) fn reset(&mut self) {
        self.store = Store::new();
        self.parked.clear();
        self.value = None;
        self.root = None;
        self.steps = 0;
        self.events.clear();
    }
}

/// The machine contract.
///
/// Required methods are backend specific; the rest are defined once over
/// [`MachineCore`].
pub trait Machine {
    fn kind(&self) -> BackendKind;

    fn core(&self) -> &MachineCore;

    fn core_mut(&mut self) -> &mut MachineCore;

    /// Admit `image` into the fact arena and seat its root as control.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Malformed`] if the image does not validate
    /// against the machine's facts.
    fn load(&mut self, image: &ProgramImage) -> Result<(), VmError>;

    /// Advance by one transition.
    ///
    /// # Errors
    ///
    /// Returns the fault raised by the transition; the machine is
    /// unchanged. A machine with nothing loaded returns
    /// [`VmError::NoProgram`].
    fn step(&mut self) -> Result<StepResult, VmError>;

    fn control(&self) -> ControlView;

    fn environment(&self) -> Env;

    /// Pending frames, innermost first.
    fn continuation(&self) -> Vec<FrameKind>;

    /// Clear control, store, parked registry and trace. Facts stay.
    fn reset(&mut self);

    /// Continue the parked computation `id` with `value` as the result of
    /// its `park`. The id is consumed.
    ///
    /// # Errors
    ///
    /// [`VmError::UnknownContinuation`] if `id` was never issued or was
    /// already resumed.
    fn resume(&mut self, id: ParkedId, value: Value) -> Result<(), VmError>;

    /// Hook run after foreign facts rooted at `roots` are merged in.
    fn facts_extended(&mut self, _roots: &[EntityId]) -> Result<(), VmError> {
        Ok(())
    }

    /// Decompose `node` with the machine's allocator and load it.
    fn load_ast(&mut self, node: &Node) -> Result<EntityId, VmError> {
        let decomposition = self.core_mut().alloc.decompose(node)?;
        let image = ProgramImage::from_decomposition(&decomposition)?;
        self.load(&image)?;
        Ok(image.root)
    }

    /// Load a program already in the fact arena, such as an imported root.
    fn load_entity(&mut self, root: EntityId) -> Result<(), VmError> {
        let image = ProgramImage::new(root, self.core().facts.clone())?;
        self.load(&image)
    }

    /// Step until halted.
    ///
    /// # Errors
    ///
    /// The first fault, or [`VmError::StepBudgetExhausted`] once
    /// `max_steps` steps pass without halting.
    fn run(&mut self) -> Result<Value, VmError> {
        let limit = self.core().config.max_steps;
        let mut taken = 0u64;
        while self.step()? == StepResult::Continue {
            taken += 1;
            if let Some(limit) = limit {
                if taken >= limit {
                    return Err(VmError::StepBudgetExhausted { limit });
                }
            }
        }
        self.value().cloned().ok_or(VmError::NoProgram)
    }

    fn eval(&mut self, node: &Node) -> Result<Value, VmError> {
        self.load_ast(node)?;
        self.run()
    }

    fn is_halted(&self) -> bool {
        self.core().value.is_some()
    }

    fn value(&self) -> Option<&Value> {
        self.core().value.as_ref()
    }

    fn store(&self) -> &Store {
        &self.core().store
    }

    fn facts(&self) -> &FactSet {
        &self.core().facts
    }

    fn parked(&self) -> &ParkRegistry {
        &self.core().parked
    }

    fn trace(&self) -> &[MachineEvent] {
        &self.core().events
    }

    /// Content-addressed bundle of the program rooted at `root`.
    fn export_ast(&self, root: EntityId) -> Result<AstBundle, VmError> {
        Ok(bundle::export_ast(&self.core().facts, root)?)
    }

    /// Import an AST bundle into the fact arena, reusing entities whose
    /// hashes are in `known`. Returns the root entity; load it with
    /// [`Machine::load`] or call it from another program.
    fn import_ast(&mut self, ast: &AstBundle, known: &mut HashIdMap) -> Result<EntityId, VmError> {
        let core = self.core_mut();
        let plan = bundle::plan_import(
            &ast.entities,
            std::slice::from_ref(&ast.root_hash),
            &mut core.alloc,
            known,
        )?;
        let root = plan
            .resolved
            .get(&ast.root_hash)
            .copied()
            .ok_or_else(|| VmError::internal("bundle root missing from import plan"))?;
        migrate::check_reused(&core.facts, &plan)?;
        core.facts.merge(FactSet::from_datoms(&plan.datoms)?)?;
        let outcome = plan.commit(known);
        debug!(root, created = outcome.created, reused = outcome.reused, "ast imported");
        self.facts_extended(&[root])?;
        Ok(root)
    }

    /// Bundle the parked continuation `id`. The entry stays parked.
    fn export_continuation(&self, id: ParkedId) -> Result<ContinuationBundle, VmError> {
        migrate::export(self.core(), id)
    }

    /// Register a continuation bundle under a fresh local id.
    ///
    /// # Errors
    ///
    /// [`VmError::BackendMismatch`] when captured on another backend kind,
    /// or the import fault; nothing is registered on failure.
    fn import_continuation(
        &mut self,
        bundle: &ContinuationBundle,
        known: &mut HashIdMap,
    ) -> Result<ParkedId, VmError> {
        let kind = self.kind();
        let (id, roots) = migrate::import(self.core_mut(), kind, bundle, known)?;
        self.facts_extended(&roots)?;
        Ok(id)
    }
}

/// A machine of the given kind.
#[must_use]
pub fn create(kind: BackendKind, config: VMConfig, env: Env) -> Box<dyn Machine> {
    match kind {
        BackendKind::Tree => Box::new(TreeMachine::new(config, env)),
        BackendKind::Stack => Box::new(StackMachine::new(config, env)),
        BackendKind::Register => Box::new(RegisterMachine::new(config, env)),
        BackendKind::Semantic => Box::new(SemanticMachine::new(config, env)),
    }
}

/// A machine of the given kind with default config over the prelude.
#[must_use]
pub fn create_default(kind: BackendKind) -> Box<dyn Machine> {
    create(kind, VMConfig::default(), prelude())
}
