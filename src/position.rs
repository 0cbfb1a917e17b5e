//! Dense fractional position algebra (spec §3, §4.1).
//!
//! A [`Position`] is a non-empty sequence of `{digit, actor}` components.
//! Two positions compare lexicographically; a position that runs out of
//! components while its prefix matches sorts before the longer one.

use crate::clock::ActorId;
use crate::error::{Error, Result};
use std::cmp::Ordering;

const DEFAULT_BASE: u32 = 1024;
const DEFAULT_DEPTH: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PositionComponent {
    pub digit: u32,
    pub actor: ActorId,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Position(Vec<PositionComponent>);

impl Position {
    pub fn new(components: Vec<PositionComponent>) -> Self {
        let mut pos = Self(components);
        pos.normalize_in_place();
        pos
    }

    pub fn components(&self) -> &[PositionComponent] {
        &self.0
    }

    /// Trailing zero-actor components are allowed; interior `(0, "")`
    /// components are dropped (spec §3).
    fn normalize_in_place(&mut self) {
        let is_empty_actor = |c: &PositionComponent| c.digit == 0 && c.actor.as_str().is_empty();
        let last = self.0.len().saturating_sub(1);
        self.0 = self
            .0
            .iter()
            .enumerate()
            .filter(|(i, c)| *i == last || !is_empty_actor(c))
            .map(|(_, c)| c.clone())
            .collect();
        if self.0.is_empty() {
            self.0.push(PositionComponent {
                digit: 0,
                actor: ActorId::new(" "),
            });
        }
    }

    /// Stable string key suitable for equality/map keys.
    pub fn key(&self) -> String {
        self.0
            .iter()
            .map(|c| format!("{:010}:{}", c.digit, c.actor.as_str()))
            .collect::<Vec<_>>()
            .join("/")
    }
}

pub fn normalize(p: &Position) -> Position {
    Position::new(p.0.clone())
}

pub fn clone_position(p: &Position) -> Position {
    p.clone()
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.digit.cmp(&b.digit) {
                Ordering::Equal => {}
                ord => return ord,
            }
            match a.actor.cmp(&b.actor) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

pub fn compare(a: &Position, b: &Position) -> Ordering {
    a.cmp(b)
}

pub struct Between {
    pub actor: ActorId,
    pub base: u32,
    pub depth: u32,
}

impl Between {
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            base: DEFAULT_BASE,
            depth: DEFAULT_DEPTH,
        }
    }
}

fn component_at(p: Option<&Position>, i: usize) -> Option<&PositionComponent> {
    p.and_then(|p| p.0.get(i))
}

/// Produces a position strictly between `left` and `right` (either may be
/// `None`, meaning ±∞). See spec §3 for the level-by-level algorithm.
pub fn between(left: Option<&Position>, right: Option<&Position>, opts: Between) -> Result<Position> {
    if let (Some(l), Some(r)) = (left, right) {
        if l >= r {
            return Err(Error::InvalidPosition(format!(
                "left ({}) must be strictly less than right ({})",
                l.key(),
                r.key()
            )));
        }
    }

    let mut out = Vec::new();
    for i in 0..opts.depth {
        let i = i as usize;
        let l_digit = component_at(left, i).map_or(0, |c| c.digit);
        let r_digit = component_at(right, i).map_or(opts.base, |c| c.digit);

        if r_digit.saturating_sub(l_digit) > 1 {
            out.push(PositionComponent {
                digit: l_digit + (r_digit - l_digit) / 2,
                actor: opts.actor.clone(),
            });
            return Ok(Position::new(out));
        }

        if r_digit == l_digit {
            let l_actor = component_at(left, i).map(|c| &c.actor);
            let r_actor = component_at(right, i).map(|c| &c.actor);
            let fits_between = match (l_actor, r_actor) {
                (Some(la), Some(ra)) => la < &opts.actor && &opts.actor < ra,
                (Some(la), None) => la < &opts.actor,
                (None, Some(ra)) => &opts.actor < ra,
                (None, None) => true,
            };
            if fits_between {
                out.push(PositionComponent {
                    digit: l_digit,
                    actor: opts.actor.clone(),
                });
                return Ok(Position::new(out));
            }
        }

        // Inherit the left component (or synthesize one) and descend.
        match component_at(left, i) {
            Some(c) => out.push(c.clone()),
            None => out.push(PositionComponent {
                digit: l_digit,
                actor: opts.actor.clone(),
            }),
        }
    }

    out.push(PositionComponent {
        digit: opts.base / 2,
        actor: opts.actor.clone(),
    });
    Ok(Position::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(s: &str) -> ActorId {
        ActorId::new(s)
    }

    #[test]
    fn between_respects_bounds() {
        let a = actor("actor-a");
        let left = Position::new(vec![PositionComponent { digit: 100, actor: a.clone() }]);
        let right = Position::new(vec![PositionComponent { digit: 200, actor: a.clone() }]);
        let mid = between(Some(&left), Some(&right), Between::new(a)).unwrap();
        assert_eq!(compare(&mid, &left), Ordering::Greater);
        assert_eq!(compare(&mid, &right), Ordering::Less);
    }

    #[test]
    fn between_handles_infinite_bounds() {
        let a = actor("actor-a");
        let p1 = between(None, None, Between::new(a.clone())).unwrap();
        let p2 = between(Some(&p1), None, Between::new(a.clone())).unwrap();
        assert_eq!(compare(&p2, &p1), Ordering::Greater);
        let p0 = between(None, Some(&p1), Between::new(a)).unwrap();
        assert_eq!(compare(&p0, &p1), Ordering::Less);
    }

    #[test]
    fn between_rejects_inverted_bounds() {
        let a = actor("actor-a");
        let left = Position::new(vec![PositionComponent { digit: 200, actor: a.clone() }]);
        let right = Position::new(vec![PositionComponent { digit: 100, actor: a.clone() }]);
        assert!(between(Some(&left), Some(&right), Between::new(a)).is_err());
    }

    #[test]
    fn repeated_between_never_panics_and_stays_ordered() {
        let a = actor("actor-a");
        let mut left: Option<Position> = None;
        let right = Position::new(vec![PositionComponent { digit: DEFAULT_BASE, actor: a.clone() }]);
        let mut prev: Option<Position> = None;
        for _ in 0..5000 {
            let p = between(left.as_ref(), Some(&right), Between::new(a.clone())).unwrap();
            if let Some(prev) = &prev {
                assert_eq!(compare(&p, prev), Ordering::Greater);
            }
            prev = Some(p.clone());
            left = Some(p);
        }
    }

    #[test]
    fn total_order_is_transitive_for_tie_breaking_actors() {
        let low = actor("actor-1");
        let high = actor("actor-2");
        let left = Position::new(vec![PositionComponent { digit: 5, actor: low.clone() }]);
        let right = Position::new(vec![PositionComponent { digit: 5, actor: high.clone() }]);
        assert_eq!(compare(&left, &right), Ordering::Less);
    }
}
