//! Continuation transport between machines.
//!
//! A parked continuation refers to program entities (closure bodies,
//! pending nodes, code units) and to store cells (streams and cursors).
//! Neither kind of id means anything on another machine, so export
//! rewrites the state in terms of portable names:
//!
//! - entities become slots, indices into the bundle's `nodes` table of
//!   content hashes; the hashed subtrees travel in `entities`
//! - streams reachable from the state travel with it, keyed by their
//!   exporting ids
//!
//! Import validates and plans the AST part first, relocates a copy of the
//! state onto the receiver's ids, and only then commits facts, streams and
//! the registry entry. A failed import changes nothing.

use std::collections::{BTreeMap, BTreeSet};

use cesk_types::bundle::{self, ImportPlan};
use cesk_types::{AstError, BundleError, EntityId, EntityTable, FactSet, HashIdMap, NodeHash};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::continuation::Cont;
use crate::env::Env;
use crate::error::VmError;
use crate::machine::{BackendKind, CodeAddr, MachineCore};
use crate::park::{ParkedContinuation, ParkedState};
use crate::register::{RegFrame, RegisterSnapshot};
use crate::stack::{CallFrame, StackSnapshot};
use crate::stream::Stream;
use crate::trace::MachineEvent;
use crate::value::{CursorId, ParkedId, StreamId, Value};
use crate::walk::{Frame, WalkSnapshot};

/// A parked continuation in portable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationBundle {
    pub backend: BackendKind,
    /// Content hash per slot. The state names entities by slot index.
    pub nodes: Vec<NodeHash>,
    pub entities: EntityTable,
    pub state: ParkedState,
    /// Streams reachable from the state, under their exporting ids.
    pub streams: Vec<(StreamId, Stream)>,
}

impl ContinuationBundle {
    pub fn to_json_string(&self) -> Result<String, VmError> {
        serde_json::to_string(self).map_err(|e| VmError::Import(BundleError::Encoding(e.to_string())))
    }

    pub fn from_json_str(text: &str) -> Result<Self, VmError> {
        serde_json::from_str(text).map_err(|e| VmError::Import(BundleError::Encoding(e.to_string())))
    }
}

#[derive(Debug, Default)]
pub(crate) struct References {
    pub entities: BTreeSet<EntityId>,
    pub streams: BTreeSet<StreamId>,
}

/// Id translation. `None` maps leave those ids unchanged.
#[derive(Debug, Default)]
pub(crate) struct Relocation {
    entities: BTreeMap<EntityId, EntityId>,
    streams: Option<BTreeMap<StreamId, StreamId>>,
    cursors: Option<BTreeMap<CursorId, CursorId>>,
}

impl Relocation {
    fn entity(&self, entity: EntityId) -> Result<EntityId, VmError> {
        self.entities
            .get(&entity)
            .copied()
            .ok_or(VmError::BadSlot { slot: entity })
    }

    fn stream(&self, stream: StreamId) -> Result<StreamId, VmError> {
        match &self.streams {
            None => Ok(stream),
            Some(map) => map.get(&stream).copied().ok_or(VmError::UnknownStream { stream }),
        }
    }

    fn cursor(&self, stream: StreamId, cursor: CursorId) -> Result<CursorId, VmError> {
        match &self.cursors {
            None => Ok(cursor),
            Some(map) => map
                .get(&cursor)
                .copied()
                .ok_or(VmError::UnknownCursor { stream, cursor }),
        }
    }
}

/// State that names entities or store cells.
pub(crate) trait Relocate {
    fn references(&self, refs: &mut References);

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError>;
}

fn relocated<T: Relocate + Clone>(value: &T, map: &Relocation) -> Result<T, VmError> {
    let mut value = value.clone();
    value.relocate(map)?;
    Ok(value)
}

impl Relocate for Value {
    fn references(&self, refs: &mut References) {
        match self {
            Value::Closure(closure) => {
                refs.entities.insert(closure.body);
                closure.env.references(refs);
            }
            Value::Stream(stream) | Value::Cursor { stream, .. } => {
                refs.streams.insert(*stream);
            }
            _ => {}
        }
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        match self {
            Value::Closure(closure) => {
                closure.body = map.entity(closure.body)?;
                closure.env.relocate(map)?;
            }
            Value::Stream(stream) => *stream = map.stream(*stream)?,
            Value::Cursor { stream, cursor } => {
                *cursor = map.cursor(*stream, *cursor)?;
                *stream = map.stream(*stream)?;
            }
            _ => {}
        }
        Ok(())
    }
}

impl Relocate for Env {
    fn references(&self, refs: &mut References) {
        for (_, value) in self.iter() {
            value.references(refs);
        }
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        *self = self.try_map_values(|v| relocated(v, map))?;
        Ok(())
    }
}

impl Relocate for CodeAddr {
    fn references(&self, refs: &mut References) {
        refs.entities.insert(self.unit);
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        self.unit = map.entity(self.unit)?;
        Ok(())
    }
}

impl Relocate for Frame<EntityId> {
    fn references(&self, refs: &mut References) {
        refs.entities.extend(self.refs().into_iter().copied());
        for value in self.values() {
            value.references(refs);
        }
        if let Some(env) = self.env() {
            env.references(refs);
        }
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        let mut frame = self.map_ref(&mut |e: &EntityId| map.entity(*e))?;
        frame.try_map_values(&mut |v| relocated(v, map))?;
        *self = frame;
        Ok(())
    }
}

impl<F: Relocate + Clone> Relocate for Cont<F> {
    fn references(&self, refs: &mut References) {
        for frame in self.iter() {
            frame.references(refs);
        }
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        let mut frames = self.to_frames();
        for frame in &mut frames {
            frame.relocate(map)?;
        }
        *self = Cont::from_frames(frames);
        Ok(())
    }
}

impl Relocate for WalkSnapshot {
    fn references(&self, refs: &mut References) {
        self.env.references(refs);
        self.frames.references(refs);
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        self.env.relocate(map)?;
        self.frames.relocate(map)
    }
}

impl Relocate for CallFrame {
    fn references(&self, refs: &mut References) {
        if let Some(ret) = &self.ret {
            ret.references(refs);
        }
        self.env.references(refs);
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        if let Some(ret) = &mut self.ret {
            ret.relocate(map)?;
        }
        self.env.relocate(map)
    }
}

impl Relocate for StackSnapshot {
    fn references(&self, refs: &mut References) {
        self.pc.references(refs);
        for value in &self.stack {
            value.references(refs);
        }
        self.frames.references(refs);
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        self.pc.relocate(map)?;
        for value in &mut self.stack {
            value.relocate(map)?;
        }
        self.frames.relocate(map)
    }
}

impl Relocate for RegFrame {
    fn references(&self, refs: &mut References) {
        if let Some(ret) = &self.ret {
            ret.addr.references(refs);
        }
        for value in &self.regs {
            value.references(refs);
        }
        self.env.references(refs);
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        if let Some(ret) = &mut self.ret {
            ret.addr.relocate(map)?;
        }
        for value in &mut self.regs {
            value.relocate(map)?;
        }
        self.env.relocate(map)
    }
}

impl Relocate for RegisterSnapshot {
    fn references(&self, refs: &mut References) {
        self.pc.references(refs);
        self.frames.references(refs);
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        self.pc.relocate(map)?;
        self.frames.relocate(map)
    }
}

impl Relocate for ParkedState {
    fn references(&self, refs: &mut References) {
        match self {
            ParkedState::Walk(s) => s.references(refs),
            ParkedState::Stack(s) => s.references(refs),
            ParkedState::Register(s) => s.references(refs),
        }
    }

    fn relocate(&mut self, map: &Relocation) -> Result<(), VmError> {
        match self {
            ParkedState::Walk(s) => s.relocate(map),
            ParkedState::Stack(s) => s.relocate(map),
            ParkedState::Register(s) => s.relocate(map),
        }
    }
}

fn relocate_stream(id: StreamId, stream: &mut Stream, map: &Relocation) -> Result<(), VmError> {
    for value in stream.values_mut() {
        value.relocate(map)?;
    }
    stream.rekey_cursors(|cursor| map.cursor(id, cursor))
}

fn slot(index: usize) -> Result<EntityId, VmError> {
    EntityId::try_from(index).map_err(|_| VmError::internal("slot table exceeds id space"))
}

fn state_fits(kind: BackendKind, state: &ParkedState) -> bool {
    matches!(
        (kind, state),
        (BackendKind::Tree | BackendKind::Semantic, ParkedState::Walk(_))
            | (BackendKind::Stack, ParkedState::Stack(_))
            | (BackendKind::Register, ParkedState::Register(_))
    )
}

/// Fail if the plan reuses an entity the receiver does not hold.
pub(crate) fn check_reused(facts: &FactSet, plan: &ImportPlan) -> Result<(), VmError> {
    let created: BTreeSet<EntityId> = plan.datoms.iter().map(|d| d.e).collect();
    for (hash, id) in &plan.resolved {
        if !created.contains(id) && !facts.contains(*id) {
            return Err(VmError::Import(BundleError::UnresolvedHash { hash: hash.clone() }));
        }
    }
    Ok(())
}

pub(crate) fn export(core: &MachineCore, id: ParkedId) -> Result<ContinuationBundle, VmError> {
    let entry = core.parked.get(id)?;
    let mut refs = References::default();
    entry.state.references(&mut refs);

    let mut streams: BTreeMap<StreamId, Stream> = BTreeMap::new();
    let mut pending: Vec<StreamId> = refs.streams.iter().copied().collect();
    while let Some(sid) = pending.pop() {
        if streams.contains_key(&sid) {
            continue;
        }
        let stream = core.store.stream(sid).ok_or(VmError::UnknownStream { stream: sid })?;
        let mut inner = References::default();
        for value in stream.values() {
            value.references(&mut inner);
        }
        pending.extend(inner.streams);
        refs.entities.extend(inner.entities);
        streams.insert(sid, stream.clone());
    }

    let roots: Vec<EntityId> = refs.entities.iter().copied().collect();
    let (entities, hashes) = bundle::export_entities(&core.facts, &roots)?;
    let nodes = roots
        .iter()
        .map(|e| {
            hashes
                .get(e)
                .cloned()
                .ok_or(VmError::Malformed(AstError::UnknownEntity { entity: *e }))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let map = Relocation {
        entities: roots
            .iter()
            .enumerate()
            .map(|(i, e)| -> Result<(EntityId, EntityId), VmError> { Ok((*e, slot(i)?)) })
            .collect::<Result<_, _>>()?,
        streams: None,
        cursors: None,
    };

    let state = relocated(&entry.state, &map)?;
    let streams = streams
        .into_iter()
        .map(|(sid, mut stream)| -> Result<(StreamId, Stream), VmError> {
            relocate_stream(sid, &mut stream, &map)?;
            Ok((sid, stream))
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!(id, slots = nodes.len(), entities = entities.len(), streams = streams.len(), "continuation exported");
    Ok(ContinuationBundle {
        backend: entry.backend,
        nodes,
        entities,
        state,
        streams,
    })
}

/// Returns the new parked id and every entity the slots resolved to.
pub(crate) fn import(
    core: &mut MachineCore,
    kind: BackendKind,
    bundle: &ContinuationBundle,
    known: &mut HashIdMap,
) -> Result<(ParkedId, Vec<EntityId>), VmError> {
    if bundle.backend != kind {
        return Err(VmError::BackendMismatch {
            expected: kind,
            found: bundle.backend,
        });
    }
    if !state_fits(kind, &bundle.state) {
        return Err(VmError::Import(BundleError::Encoding(format!(
            "state does not belong to the {kind} backend"
        ))));
    }

    let plan = bundle::plan_import(&bundle.entities, &bundle.nodes, &mut core.alloc, known)?;
    check_reused(&core.facts, &plan)?;
    let entities = bundle
        .nodes
        .iter()
        .enumerate()
        .map(|(i, hash)| -> Result<(EntityId, EntityId), VmError> {
            let entity = plan
                .resolved
                .get(hash)
                .copied()
                .ok_or_else(|| BundleError::UnresolvedHash { hash: hash.clone() })?;
            Ok((slot(i)?, entity))
        })
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let (next_stream, next_cursor) = core.store.next_ids();
    let mut streams = BTreeMap::new();
    let mut cursors = BTreeMap::new();
    for (sid, stream) in &bundle.streams {
        let fresh = next_stream + u64::try_from(streams.len()).unwrap_or(u64::MAX);
        streams.entry(*sid).or_insert(fresh);
        for cursor in stream.cursor_ids() {
            let fresh = next_cursor + u64::try_from(cursors.len()).unwrap_or(u64::MAX);
            cursors.entry(cursor).or_insert(fresh);
        }
    }
    let map = Relocation {
        entities,
        streams: Some(streams),
        cursors: Some(cursors),
    };

    let state = relocated(&bundle.state, &map)?;
    let mut adopted = Vec::with_capacity(bundle.streams.len());
    for (sid, stream) in &bundle.streams {
        let mut stream = stream.clone();
        relocate_stream(*sid, &mut stream, &map)?;
        adopted.push((map.stream(*sid)?, stream));
    }
    let facts = FactSet::from_datoms(&plan.datoms)?;

    core.facts.merge(facts)?;
    for (sid, stream) in adopted {
        core.store.insert(sid, stream);
    }
    let roots: Vec<EntityId> = map.entities.values().copied().collect();
    let outcome = plan.commit(known);
    let id = core.parked.park(ParkedContinuation { backend: kind, state });
    core.record(MachineEvent::Imported {
        step: core.steps,
        id,
        created: outcome.created,
    });
    debug!(id, created = outcome.created, reused = outcome.reused, "continuation imported");
    Ok((id, roots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{create_default, Machine};
    use assert_matches::assert_matches;
    use cesk_types::Node;

    fn parked_program() -> Node {
        Node::apply(
            Node::lambda(["x"], Node::call("+", [Node::var("x"), Node::Park])),
            [Node::int(10)],
        )
    }

    fn park_on(kind: BackendKind) -> (Box<dyn Machine>, ParkedId) {
        let mut machine = create_default(kind);
        let Value::Parked(id) = machine.eval(&parked_program()).unwrap() else {
            panic!("program did not park");
        };
        (machine, id)
    }

    #[test]
    fn test_slots_are_dense_and_hashed() {
        let (source, id) = park_on(BackendKind::Semantic);
        let bundle = source.export_continuation(id).unwrap();
        assert!(!bundle.nodes.is_empty());
        for hash in &bundle.nodes {
            assert!(bundle.entities.contains_key(hash));
        }
        assert!(source.parked().contains(id));
    }

    #[test]
    fn test_backend_kind_must_match() {
        let (source, id) = park_on(BackendKind::Tree);
        let bundle = source.export_continuation(id).unwrap();
        let mut target = create_default(BackendKind::Stack);
        let mut known = HashIdMap::new();
        assert_matches!(
            target.import_continuation(&bundle, &mut known),
            Err(VmError::BackendMismatch {
                expected: BackendKind::Stack,
                found: BackendKind::Tree
            })
        );
        assert!(known.is_empty());
        assert!(target.parked().is_empty());
    }

    #[test]
    fn test_tampered_bundle_changes_nothing() {
        let (source, id) = park_on(BackendKind::Register);
        let mut bundle = source.export_continuation(id).unwrap();
        let victim = bundle.entities.keys().next().cloned().unwrap();
        if let Some(entity) = bundle.entities.get_mut(&victim) {
            entity
                .attributes
                .insert(cesk_types::schema::NAME.to_string(), cesk_types::Atom::Str("forged".into()));
        }
        let mut target = create_default(BackendKind::Register);
        let mut known = HashIdMap::new();
        assert_matches!(
            target.import_continuation(&bundle, &mut known),
            Err(VmError::Import(BundleError::HashMismatch { .. }))
        );
        assert!(target.facts().is_empty());
        assert!(target.parked().is_empty());
        assert!(known.is_empty());
    }

    #[test]
    fn test_bundle_survives_json() {
        let (source, id) = park_on(BackendKind::Stack);
        let bundle = source.export_continuation(id).unwrap();
        let text = bundle.to_json_string().unwrap();
        assert_eq!(ContinuationBundle::from_json_str(&text).unwrap(), bundle);
    }
}
