//! Message DAG: parent→child index over a parsed log.
//!
//! Builds uuid→node and uuid→children maps, classifies nodes, detects
//! parent-chain cycles, and offers bounded traversal helpers. The DAG is
//! owned by whichever component invoked the build and dropped when that
//! call returns; it never mutates the log it was built from.

use crate::core::record::Record;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;

/// Node classification within one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    /// No parent reference.
    Root,
    /// Resolving parent and at least one child.
    Internal,
    /// Resolving parent, no children.
    Leaf,
    /// Declares a `parent_uuid` that does not resolve in this log.
    Orphan,
}

#[derive(Debug, Clone)]
pub struct DagNode {
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub class: NodeClass,
    /// Insertion order within the log; the tie-break for equal timestamps.
    pub order: usize,
}

/// Parent/child index over one log's records.
#[derive(Debug, Default)]
pub struct MessageDag {
    nodes: FxHashMap<String, DagNode>,
    children: FxHashMap<String, Vec<String>>,
    order: Vec<String>,
    cycles: Vec<Vec<String>>,
}

impl MessageDag {
    /// Build the index from records in log order.
    ///
    /// Cycles in the parent chain indicate upstream corruption. They are
    /// recorded (see [`cycles`](Self::cycles)) rather than panicking the
    /// build; callers refuse to repair a log whose cycle set is non-empty.
    pub fn build<'a>(records: impl Iterator<Item = &'a Record>) -> MessageDag {
        let mut dag = MessageDag::default();
        for rec in records {
            let order = dag.order.len();
            dag.order.push(rec.uuid.clone());
            dag.nodes.insert(
                rec.uuid.clone(),
                DagNode {
                    uuid: rec.uuid.clone(),
                    parent_uuid: rec.parent_uuid.clone(),
                    timestamp: rec.timestamp,
                    session_id: rec.session_id.clone(),
                    class: NodeClass::Root,
                    order,
                },
            );
        }

        // child index (only resolving parents)
        for uuid in &dag.order {
            let parent = dag.nodes[uuid].parent_uuid.clone();
            if let Some(parent) = parent
                && dag.nodes.contains_key(&parent)
            {
                dag.children.entry(parent).or_default().push(uuid.clone());
            }
        }

        // classification
        for uuid in dag.order.clone() {
            let parent = dag.nodes[&uuid].parent_uuid.clone();
            let has_children = dag.children.get(&uuid).is_some_and(|c| !c.is_empty());
            let class = match parent {
                None => NodeClass::Root,
                Some(p) if !dag.nodes.contains_key(&p) => NodeClass::Orphan,
                Some(_) if has_children => NodeClass::Internal,
                Some(_) => NodeClass::Leaf,
            };
            dag.nodes.get_mut(&uuid).expect("indexed uuid").class = class;
        }

        dag.cycles = dag.find_cycles();
        dag
    }

    fn find_cycles(&self) -> Vec<Vec<String>> {
        // 0 = unvisited, 1 = on current path, 2 = finished
        let mut state: FxHashMap<&str, u8> = FxHashMap::default();
        let mut cycles = Vec::new();
        for start in &self.order {
            if state.get(start.as_str()).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            let mut cursor: Option<&str> = Some(start.as_str());
            while let Some(uuid) = cursor {
                match state.get(uuid).copied().unwrap_or(0) {
                    1 => {
                        // back-edge into the current path: everything from
                        // the first occurrence onward is the cycle
                        let from = path.iter().position(|u| *u == uuid).unwrap_or(0);
                        cycles.push(path[from..].iter().map(|s| s.to_string()).collect());
                        break;
                    }
                    2 => break,
                    _ => {
                        state.insert(uuid, 1);
                        path.push(uuid);
                        cursor = self
                            .nodes
                            .get(uuid)
                            .and_then(|n| n.parent_uuid.as_deref())
                            .filter(|p| self.nodes.contains_key(*p));
                    }
                }
            }
            for uuid in path {
                state.insert(uuid, 2);
            }
        }
        cycles
    }

    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    pub fn node(&self, uuid: &str) -> Option<&DagNode> {
        self.nodes.get(uuid)
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.nodes.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn children_of(&self, uuid: &str) -> &[String] {
        self.children.get(uuid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes whose parent reference does not resolve, in log order.
    pub fn orphans(&self) -> Vec<&DagNode> {
        self.order
            .iter()
            .filter_map(|u| self.nodes.get(u))
            .filter(|n| n.class == NodeClass::Orphan)
            .collect()
    }

    /// Pre-order traversal by timestamp with insertion-order tie-break.
    /// Roots and orphans both start subtrees.
    pub fn preorder(&self) -> Vec<&str> {
        let mut starts: Vec<&DagNode> = self
            .order
            .iter()
            .filter_map(|u| self.nodes.get(u))
            .filter(|n| matches!(n.class, NodeClass::Root | NodeClass::Orphan))
            .collect();
        starts.sort_by_key(|n| (n.timestamp, n.order));

        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&str> = starts.iter().rev().map(|n| n.uuid.as_str()).collect();
        while let Some(uuid) = stack.pop() {
            out.push(uuid);
            let mut kids: Vec<&DagNode> = self
                .children_of(uuid)
                .iter()
                .filter_map(|u| self.nodes.get(u))
                .collect();
            kids.sort_by_key(|n| (n.timestamp, n.order));
            for kid in kids.iter().rev() {
                stack.push(kid.uuid.as_str());
            }
        }
        out
    }

    /// Parent chain of `uuid`, nearest first, bounded by an optional depth
    /// cap. Stops at roots, unresolved parents, and (defensively) at any
    /// revisit so cyclic corruption cannot loop the walk.
    pub fn ancestors_of(&self, uuid: &str, depth: Option<usize>) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen: Vec<&str> = vec![uuid];
        let mut cursor = self
            .nodes
            .get(uuid)
            .and_then(|n| n.parent_uuid.as_deref())
            .filter(|p| self.nodes.contains_key(*p));
        while let Some(parent) = cursor {
            if depth.is_some_and(|d| out.len() >= d) || seen.contains(&parent) {
                break;
            }
            out.push(parent.to_string());
            seen.push(parent);
            cursor = self
                .nodes
                .get(parent)
                .and_then(|n| n.parent_uuid.as_deref())
                .filter(|p| self.nodes.contains_key(*p));
        }
        out
    }

    /// Breadth-first descendants of `uuid`, bounded by an optional depth cap.
    pub fn descendants_of(&self, uuid: &str, depth: Option<usize>) -> Vec<String> {
        let mut out = Vec::new();
        let mut frontier: Vec<&str> = vec![uuid];
        let mut level = 0usize;
        while !frontier.is_empty() {
            if depth.is_some_and(|d| level >= d) {
                break;
            }
            let mut next = Vec::new();
            for node in frontier {
                for kid in self.children_of(node) {
                    out.push(kid.clone());
                    next.push(kid.as_str());
                }
            }
            frontier = next;
            level += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logfile::LogFile;
    use std::path::PathBuf;

    fn dag_of(text: &str) -> MessageDag {
        let log = LogFile::parse(PathBuf::from("t.jsonl"), text);
        let records: Vec<_> = log.records().cloned().collect();
        MessageDag::build(records.iter())
    }

    #[test]
    fn test_classification() {
        let dag = dag_of(concat!(
            r#"{"kind":"user","uuid":"r"}"#,
            "\n",
            r#"{"kind":"assistant","uuid":"i","parent_uuid":"r"}"#,
            "\n",
            r#"{"kind":"user","uuid":"l","parent_uuid":"i"}"#,
            "\n",
            r#"{"kind":"user","uuid":"o","parent_uuid":"ghost"}"#,
        ));
        assert_eq!(dag.node("r").unwrap().class, NodeClass::Root);
        assert_eq!(dag.node("i").unwrap().class, NodeClass::Internal);
        assert_eq!(dag.node("l").unwrap().class, NodeClass::Leaf);
        assert_eq!(dag.node("o").unwrap().class, NodeClass::Orphan);
        assert_eq!(dag.orphans().len(), 1);
        assert!(dag.cycles().is_empty());
    }

    #[test]
    fn test_self_parent_is_a_cycle_of_one() {
        let dag = dag_of(r#"{"kind":"user","uuid":"x","parent_uuid":"x"}"#);
        assert_eq!(dag.cycles(), &[vec!["x".to_string()]]);
    }

    #[test]
    fn test_two_cycle() {
        let dag = dag_of(concat!(
            r#"{"kind":"user","uuid":"a","parent_uuid":"b"}"#,
            "\n",
            r#"{"kind":"user","uuid":"b","parent_uuid":"a"}"#,
        ));
        assert_eq!(dag.cycles().len(), 1);
        let mut cycle = dag.cycles()[0].clone();
        cycle.sort();
        assert_eq!(cycle, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_preorder_timestamp_with_insertion_tiebreak() {
        let dag = dag_of(concat!(
            r#"{"kind":"user","uuid":"r","timestamp":"2026-01-01T00:00:00Z"}"#,
            "\n",
            r#"{"kind":"user","uuid":"c2","parent_uuid":"r","timestamp":"2026-01-01T00:00:02Z"}"#,
            "\n",
            r#"{"kind":"user","uuid":"c1","parent_uuid":"r","timestamp":"2026-01-01T00:00:01Z"}"#,
            "\n",
            r#"{"kind":"user","uuid":"c3","parent_uuid":"r","timestamp":"2026-01-01T00:00:01Z"}"#,
        ));
        // c1 before c3 (tie on timestamp, c1 inserted... c2 was inserted
        // before c1 but sorts later by timestamp)
        assert_eq!(dag.preorder(), vec!["r", "c1", "c3", "c2"]);
    }

    #[test]
    fn test_ancestors_and_descendants_with_depth_cap() {
        let dag = dag_of(concat!(
            r#"{"kind":"user","uuid":"a"}"#,
            "\n",
            r#"{"kind":"user","uuid":"b","parent_uuid":"a"}"#,
            "\n",
            r#"{"kind":"user","uuid":"c","parent_uuid":"b"}"#,
            "\n",
            r#"{"kind":"user","uuid":"d","parent_uuid":"c"}"#,
        ));
        assert_eq!(dag.ancestors_of("d", None), vec!["c", "b", "a"]);
        assert_eq!(dag.ancestors_of("d", Some(2)), vec!["c", "b"]);
        assert_eq!(dag.descendants_of("a", None), vec!["b", "c", "d"]);
        assert_eq!(dag.descendants_of("a", Some(1)), vec!["b"]);
    }

    #[test]
    fn test_empty_dag() {
        let dag = dag_of("");
        assert!(dag.is_empty());
        assert!(dag.preorder().is_empty());
        assert!(dag.cycles().is_empty());
    }
}
