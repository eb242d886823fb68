//! Worker placement.
//!
//! Strategies creating remote workers pass constraints; the placement
//! service picks a hosting node. The default policy round-robins across
//! worker cores, so a node advertising four cores receives four times the
//! workers of a single-core node.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cluster::types::MembersView;
use crate::worker::WorkerRef;

/// Constraints on where a worker may be created.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    /// Must be this node; fails if it is unreachable.
    pub on: Option<String>,
    /// Same node as this worker.
    pub with: Option<WorkerRef>,
    /// Any node except this worker's; falls back to the same node when no
    /// alternative exists.
    pub avoid: Option<WorkerRef>,
}

/// Constraints could not be satisfied. Recoverable: the strategy chooses
/// retry versus fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("node `{node}` is not an available worker node")]
    NodeUnavailable { node: String },
    #[error("no worker cores available")]
    NoCapacity,
}

/// Round-robin placement over the advertised worker cores of the current
/// membership view.
#[derive(Debug, Default)]
pub struct PlacementService {
    cursor: AtomicUsize,
}

impl PlacementService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Picks a node name for a new worker.
    ///
    /// # Errors
    ///
    /// `NodeUnavailable` for `on`/`with` constraints naming unknown nodes;
    /// `NoCapacity` when the view has no worker cores at all.
    pub fn pick(&self, view: &MembersView, placement: &Placement) -> Result<String, PlacementError> {
        if let Some(node) = &placement.on {
            if !view.contains(node) {
                return Err(PlacementError::NodeUnavailable { node: node.clone() });
            }
            return Ok(node.clone());
        }

        if let Some(with) = &placement.with {
            if !view.contains(&with.node) {
                return Err(PlacementError::NodeUnavailable {
                    node: with.node.clone(),
                });
            }
            return Ok(with.node.clone());
        }

        let slots = core_slots(view);
        if slots.is_empty() {
            return Err(PlacementError::NoCapacity);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        if let Some(avoid) = &placement.avoid {
            for offset in 0..slots.len() {
                let candidate = slots[(start + offset) % slots.len()];
                if candidate != avoid.node {
                    return Ok(candidate.to_string());
                }
            }
            // Every core is on the avoided node: fall back to it.
            return Ok(avoid.node.clone());
        }

        Ok(slots[start % slots.len()].to_string())
    }

    /// Total worker cores in the view, floored at one so local mode can
    /// always place.
    #[must_use]
    pub fn capacity(&self, view: &MembersView) -> usize {
        view.total_cores().max(1)
    }
}

/// One slot per advertised core, in member order.
fn core_slots(view: &MembersView) -> Vec<&str> {
    let mut slots = Vec::with_capacity(view.total_cores());
    for member in &view.members {
        for _ in 0..member.cores {
            slots.push(member.name.as_str());
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::{NodeInfo, NodeMode};

    fn view(members: &[(&str, usize)]) -> MembersView {
        MembersView {
            version: 1,
            members: members
                .iter()
                .map(|(name, cores)| NodeInfo {
                    name: (*name).to_string(),
                    addr: "127.0.0.1:0".to_string(),
                    mode: NodeMode::Worker,
                    tags: vec![],
                    cores: *cores,
                })
                .collect(),
        }
    }

    fn worker(node: &str) -> WorkerRef {
        WorkerRef {
            node: node.to_string(),
            id: 1,
        }
    }

    #[test]
    fn default_round_robins_over_cores() {
        let service = PlacementService::new();
        let view = view(&[("w1", 2), ("w2", 1)]);
        let picks: Vec<String> = (0..6)
            .map(|_| service.pick(&view, &Placement::default()).unwrap())
            .collect();
        assert_eq!(picks, ["w1", "w1", "w2", "w1", "w1", "w2"]);
    }

    #[test]
    fn empty_view_has_no_capacity() {
        let service = PlacementService::new();
        let err = service
            .pick(&view(&[]), &Placement::default())
            .unwrap_err();
        assert_eq!(err, PlacementError::NoCapacity);
    }

    #[test]
    fn on_constraint_pins_the_node() {
        let service = PlacementService::new();
        let view = view(&[("w1", 1), ("w2", 1)]);
        let placement = Placement {
            on: Some("w2".to_string()),
            ..Placement::default()
        };
        assert_eq!(service.pick(&view, &placement).unwrap(), "w2");
    }

    #[test]
    fn on_unknown_node_fails() {
        let service = PlacementService::new();
        let placement = Placement {
            on: Some("ghost".to_string()),
            ..Placement::default()
        };
        let err = service.pick(&view(&[("w1", 1)]), &placement).unwrap_err();
        assert_eq!(
            err,
            PlacementError::NodeUnavailable {
                node: "ghost".to_string()
            }
        );
    }

    #[test]
    fn with_follows_the_other_worker() {
        let service = PlacementService::new();
        let view = view(&[("w1", 1), ("w2", 1)]);
        let placement = Placement {
            with: Some(worker("w2")),
            ..Placement::default()
        };
        assert_eq!(service.pick(&view, &placement).unwrap(), "w2");
    }

    #[test]
    fn avoid_picks_another_node() {
        let service = PlacementService::new();
        let view = view(&[("w1", 4), ("w2", 1)]);
        let placement = Placement {
            avoid: Some(worker("w1")),
            ..Placement::default()
        };
        for _ in 0..8 {
            assert_eq!(service.pick(&view, &placement).unwrap(), "w2");
        }
    }

    #[test]
    fn avoid_falls_back_to_same_node_when_alone() {
        let service = PlacementService::new();
        let view = view(&[("w1", 2)]);
        let placement = Placement {
            avoid: Some(worker("w1")),
            ..Placement::default()
        };
        assert_eq!(service.pick(&view, &placement).unwrap(), "w1");
    }

    #[test]
    fn capacity_floors_at_one() {
        let service = PlacementService::new();
        assert_eq!(service.capacity(&view(&[])), 1);
        assert_eq!(service.capacity(&view(&[("w1", 3)])), 3);
    }
}
