//! Persistent continuation chains.
//!
//! A [`Cont`] is a stack of frames linked through their parents. Pushing
//! and popping build new chains and never touch the old one, so a step can
//! compute its successor before committing it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::rc::Rc;

struct Link<F> {
    frame: F,
    parent: Option<Rc<Link<F>>>,
}

pub struct Cont<F> {
    head: Option<Rc<Link<F>>>,
    depth: usize,
}

impl<F> Clone for Cont<F> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            depth: self.depth,
        }
    }
}

impl<F> Default for Cont<F> {
    fn default() -> Self {
        Self {
            head: None,
            depth: 0,
        }
    }
}

impl<F> Cont<F> {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn push(&self, frame: F) -> Self {
        Self {
            head: Some(Rc::new(Link {
                frame,
                parent: self.head.clone(),
            })),
            depth: self.depth + 1,
        }
    }

    /// The innermost frame and the chain beneath it.
    #[must_use]
    pub fn pop(&self) -> Option<(&F, Cont<F>)> {
        let link = self.head.as_deref()?;
        Some((
            &link.frame,
            Cont {
                head: link.parent.clone(),
                depth: self.depth.saturating_sub(1),
            },
        ))
    }

    #[must_use]
    pub fn top(&self) -> Option<&F> {
        self.head.as_deref().map(|l| &l.frame)
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Frames innermost first.
    pub fn iter(&self) -> impl Iterator<Item = &F> {
        let mut cursor = self.head.as_deref();
        std::iter::from_fn(move || {
            let link = cursor?;
            cursor = link.parent.as_deref();
            Some(&link.frame)
        })
    }

    /// Rebuild from frames given innermost first.
    pub fn from_frames(frames: Vec<F>) -> Self {
        frames
            .into_iter()
            .rev()
            .fold(Cont::empty(), |cont, frame| cont.push(frame))
    }
}

impl<F: Clone> Cont<F> {
    /// Frames innermost first.
    #[must_use]
    pub fn to_frames(&self) -> Vec<F> {
        self.iter().cloned().collect()
    }

    /// Like [`Cont::pop`], but moves the frame out when no other chain
    /// shares it.
    #[must_use]
    pub fn into_pop(mut self) -> Option<(F, Cont<F>)> {
        let link = self.head.take()?;
        let depth = self.depth.saturating_sub(1);
        Some(match Rc::try_unwrap(link) {
            Ok(mut owned) => {
                let head = owned.parent.take();
                (owned.frame, Cont { head, depth })
            }
            Err(shared) => (
                shared.frame.clone(),
                Cont {
                    head: shared.parent.clone(),
                    depth,
                },
            ),
        })
    }
}

impl<F> Drop for Cont<F> {
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(link) = next {
            match Rc::try_unwrap(link) {
                Ok(mut owned) => next = owned.parent.take(),
                Err(_) => break,
            }
        }
    }
}

impl<F: fmt::Debug> fmt::Debug for Cont<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<F: PartialEq> PartialEq for Cont<F> {
    fn eq(&self, other: &Self) -> bool {
        self.depth == other.depth && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl<F: Serialize> Serialize for Cont<F> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de, F: Deserialize<'de>> Deserialize<'de> for Cont<F> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<F>::deserialize(deserializer).map(Cont::from_frames)
    }
}

/// Frame classes reported by [`crate::machine::Machine::continuation`].
///
/// The walking backends report every pending reduction; the bytecode
/// backends keep operands on a stack or in registers and report call
/// frames only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Bottom of every chain; returning into it halts the machine.
    Halt,
    /// Operator evaluated next, then operands.
    Operator,
    /// Operands remaining, then apply.
    Operands,
    /// Branch on the test result.
    Branch,
    PutTarget,
    PutValue,
    Cursor,
    Next,
    ResumeTarget,
    ResumeValue,
    /// Return into a compiled caller.
    Call,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_persistent() {
        let base = Cont::empty().push(1).push(2);
        let (top, rest) = base.pop().unwrap();
        assert_eq!(*top, 2);
        assert_eq!(rest.to_frames(), vec![1]);
        assert_eq!(base.to_frames(), vec![2, 1]);
        assert_eq!(base.depth(), 2);
    }

    #[test]
    fn test_into_pop_leaves_shared_chain_intact() {
        let base = Cont::empty().push(vec![1]).push(vec![2]);
        let kept = base.clone();
        let (top, rest) = base.into_pop().unwrap();
        assert_eq!(top, vec![2]);
        assert_eq!(rest.depth(), 1);
        assert_eq!(kept.to_frames(), vec![vec![2], vec![1]]);

        let (only, empty) = rest.into_pop().unwrap();
        assert_eq!(only, vec![1]);
        assert!(empty.is_empty());
        assert!(empty.into_pop().is_none());
    }

    #[test]
    fn test_serde_keeps_order() {
        let cont = Cont::from_frames(vec!["inner", "outer"]);
        let json = serde_json::to_string(&cont).unwrap();
        assert_eq!(json, r#"["inner","outer"]"#);
        let back: Cont<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.top().map(String::as_str), Some("inner"));
    }
}
