use crate::error::{EngineResult, GraphError};
use crate::paths::PathKey;
use crate::registry::TargetRegistry;
use crate::types::{ResolvedRule, RuleId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Topo;
use petgraph::Direction;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A rule with concrete bindings and its position in the graph
#[derive(Debug, Clone)]
pub struct Node {
    pub rule: ResolvedRule,
    pub predecessors: Vec<RuleId>,
    pub successors: Vec<RuleId>,
}

impl Node {
    pub fn id(&self) -> &RuleId {
        &self.rule.id
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// DAG of the rules needed for a set of targets.
///
/// Edges run from producer to consumer. Built once per invocation and never
/// mutated afterwards.
#[derive(Debug)]
pub struct DependencyGraph {
    root: PathBuf,
    graph: DiGraph<Node, ()>,
    indices: HashMap<RuleId, NodeIndex>,
    targets: Vec<RuleId>,
}

impl DependencyGraph {
    /// Build the graph for `targets`, pulling in only their transitive closure.
    ///
    /// A target is either a rule id or a declared output path.
    pub fn build(
        registry: &TargetRegistry,
        resolved: &HashMap<RuleId, ResolvedRule>,
        targets: &[String],
    ) -> EngineResult<Self> {
        let root = registry.root().to_path_buf();

        let mut producers: HashMap<PathKey, RuleId> = HashMap::new();
        for rule in resolved.values() {
            for path in rule.output_paths() {
                producers.insert(PathKey::new(&root, path), rule.id.clone());
            }
        }

        let mut target_ids = Vec::new();
        for target in targets {
            let id = RuleId::new(target.as_str());
            let id = if resolved.contains_key(&id) {
                id
            } else if let Some(owner) = registry.owner_of(Path::new(target)) {
                owner.rule.clone()
            } else {
                return Err(GraphError::UnknownTarget(target.clone()).into());
            };
            if !target_ids.contains(&id) {
                target_ids.push(id);
            }
        }

        let mut builder = Builder {
            root: &root,
            resolved,
            producers: &producers,
            marks: HashMap::new(),
            stack: Vec::new(),
            order: Vec::new(),
            edges: Vec::new(),
        };
        for id in &target_ids {
            builder.visit(id)?;
        }

        let Builder { order, edges, .. } = builder;

        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        // Add nodes in post-order so producers come first
        for id in &order {
            let node = graph.add_node(Node {
                rule: resolved[id].clone(),
                predecessors: Vec::new(),
                successors: Vec::new(),
            });
            indices.insert(id.clone(), node);
        }

        // Edge from producer to consumer (producer -> consumer)
        for (producer, consumer) in &edges {
            let (p, c) = (indices[producer], indices[consumer]);
            if graph.find_edge(p, c).is_none() {
                graph.add_edge(p, c, ());
                graph[p].successors.push(consumer.clone());
                graph[c].predecessors.push(producer.clone());
            }
        }

        tracing::debug!(
            "Built dependency graph: {} nodes, {} edges for targets {:?}",
            graph.node_count(),
            graph.edge_count(),
            target_ids
        );

        Ok(Self {
            root,
            graph,
            indices,
            targets: target_ids,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Requested targets after resolving output paths to their rules
    pub fn targets(&self) -> &[RuleId] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: &RuleId) -> bool {
        self.indices.contains_key(id)
    }

    pub fn node(&self, id: &RuleId) -> Option<&Node> {
        self.indices.get(id).map(|&i| &self.graph[i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_weights()
    }

    /// Nodes in topological order (dependencies first)
    pub fn topological_order(&self) -> Vec<&Node> {
        let mut topo = Topo::new(&self.graph);
        let mut nodes = Vec::with_capacity(self.graph.node_count());

        while let Some(node) = topo.next(&self.graph) {
            nodes.push(&self.graph[node]);
        }

        nodes
    }

    /// Rules producing this node's inputs
    pub fn dependencies(&self, id: &RuleId) -> Vec<&RuleId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Rules consuming this node's outputs
    pub fn dependents(&self, id: &RuleId) -> Vec<&RuleId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Nodes with no predecessors (can start immediately)
    pub fn entry_nodes(&self) -> Vec<&Node> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| &self.graph[n])
            .collect()
    }

    /// Absolute location of a declared path
    pub fn locate(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn neighbors(&self, id: &RuleId, direction: Direction) -> Vec<&RuleId> {
        match self.indices.get(id) {
            Some(&node) => self
                .graph
                .neighbors_directed(node, direction)
                .map(|n| self.graph[n].id())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Depth-first traversal state with white/gray/black marking
struct Builder<'a> {
    root: &'a Path,
    resolved: &'a HashMap<RuleId, ResolvedRule>,
    producers: &'a HashMap<PathKey, RuleId>,
    marks: HashMap<RuleId, Mark>,
    stack: Vec<RuleId>,
    order: Vec<RuleId>,
    edges: Vec<(RuleId, RuleId)>,
}

impl Builder<'_> {
    fn visit(&mut self, id: &RuleId) -> Result<(), GraphError> {
        match self.marks.get(id).copied().unwrap_or(Mark::White) {
            Mark::Black => return Ok(()),
            Mark::Gray => {
                // Back edge: the cycle is the stack suffix starting at `id`
                let start = self.stack.iter().position(|s| s == id).unwrap_or(0);
                let mut cycle: Vec<RuleId> = self.stack[start..].to_vec();
                cycle.push(id.clone());
                return Err(GraphError::CyclicDependency { cycle });
            }
            Mark::White => {}
        }

        self.marks.insert(id.clone(), Mark::Gray);
        self.stack.push(id.clone());

        let (resolved, producers, root) = (self.resolved, self.producers, self.root);
        for (slot, path) in &resolved[id].inputs {
            match producers.get(&PathKey::new(root, path)) {
                Some(producer) => {
                    let producer = producer.clone();
                    self.visit(&producer)?;
                    self.edges.push((producer, id.clone()));
                }
                None => {
                    if !root.join(path).exists() {
                        return Err(GraphError::MissingInput {
                            rule: id.clone(),
                            slot: slot.clone(),
                            path: path.clone(),
                        });
                    }
                }
            }
        }

        self.stack.pop();
        self.marks.insert(id.clone(), Mark::Black);
        self.order.push(id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::error::EngineError;
    use crate::resolver::ReferenceResolver;
    use crate::types::Rule;
    use tempfile::TempDir;

    fn build(temp_dir: &TempDir, rules: Vec<Rule>, targets: &[&str]) -> EngineResult<DependencyGraph> {
        let mut registry = TargetRegistry::new(temp_dir.path());
        for rule in rules {
            registry.register(rule).unwrap();
        }
        let config = WorkflowConfig::default();
        let resolved = ReferenceResolver::new(&registry, &config).resolve_all()?;
        let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        DependencyGraph::build(&registry, &resolved, &targets)
    }

    fn touch(temp_dir: &TempDir, path: &str) {
        let path = temp_dir.path().join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x").unwrap();
    }

    fn position(order: &[&Node], id: &str) -> usize {
        order.iter().position(|n| n.id().as_str() == id).unwrap()
    }

    #[test]
    fn test_linear_graph() {
        let temp_dir = TempDir::new().unwrap();
        touch(&temp_dir, "in.txt");
        let graph = build(
            &temp_dir,
            vec![
                Rule::new("c").input_ref("in", "b", "out").output("out", "c.txt"),
                Rule::new("b").input_ref("in", "a", "out").output("out", "b.txt"),
                Rule::new("a").input("in", "in.txt").output("out", "a.txt"),
            ],
            &["c"],
        )
        .unwrap();

        let order = graph.topological_order();
        assert_eq!(order.len(), 3);
        assert!(position(&order, "a") < position(&order, "b"));
        assert!(position(&order, "b") < position(&order, "c"));
        assert_eq!(graph.dependencies(&RuleId::new("b")), vec![&RuleId::new("a")]);
        assert_eq!(graph.dependents(&RuleId::new("b")), vec![&RuleId::new("c")]);
        assert_eq!(graph.entry_nodes().len(), 1);
    }

    #[test]
    fn test_diamond_graph() {
        let temp_dir = TempDir::new().unwrap();
        touch(&temp_dir, "data/seqs.fasta");
        let graph = build(
            &temp_dir,
            vec![
                Rule::new("parse").input("in", "data/seqs.fasta").output("seqs", "r/seqs.fasta"),
                Rule::new("tree").input_ref("seqs", "parse", "seqs").output("tree", "r/tree.nwk"),
                Rule::new("traits").input_ref("seqs", "parse", "seqs").output("traits", "r/traits.json"),
                Rule::new("export")
                    .input_ref("tree", "tree", "tree")
                    .input_ref("traits", "traits", "traits")
                    .output("main", "auspice/main.json"),
            ],
            &["export"],
        )
        .unwrap();

        let order = graph.topological_order();
        assert_eq!(order.len(), 4);
        assert!(position(&order, "parse") < position(&order, "tree"));
        assert!(position(&order, "parse") < position(&order, "traits"));
        assert!(position(&order, "tree") < position(&order, "export"));
        assert!(position(&order, "traits") < position(&order, "export"));

        let node = graph.node(&RuleId::new("export")).unwrap();
        assert_eq!(node.predecessors.len(), 2);
        assert_eq!(graph.node(&RuleId::new("parse")).unwrap().successors.len(), 2);
    }

    #[test]
    fn test_only_needed_rules_included() {
        let temp_dir = TempDir::new().unwrap();
        touch(&temp_dir, "in.txt");
        let graph = build(
            &temp_dir,
            vec![
                Rule::new("a").input("in", "in.txt").output("out", "a.txt"),
                Rule::new("b").input_ref("in", "a", "out").output("out", "b.txt"),
                Rule::new("unrelated").input("in", "in.txt").output("out", "u.txt"),
            ],
            &["b"],
        )
        .unwrap();

        assert_eq!(graph.len(), 2);
        assert!(!graph.contains(&RuleId::new("unrelated")));
    }

    #[test]
    fn test_target_by_output_path() {
        let temp_dir = TempDir::new().unwrap();
        touch(&temp_dir, "in.txt");
        let graph = build(
            &temp_dir,
            vec![
                Rule::new("a").input("in", "in.txt").output("out", "out/a.txt"),
                Rule::new("b").input_ref("in", "a", "out").output("out", "out/b.txt"),
            ],
            &["out/a.txt"],
        )
        .unwrap();

        assert_eq!(graph.targets(), &[RuleId::new("a")]);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_unknown_target() {
        let temp_dir = TempDir::new().unwrap();
        let err = build(&temp_dir, vec![Rule::new("a")], &["nope"]).unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::UnknownTarget(_))));
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let temp_dir = TempDir::new().unwrap();
        let err = build(
            &temp_dir,
            vec![
                Rule::new("a").input_ref("in", "c", "out").output("out", "a.txt"),
                Rule::new("b").input_ref("in", "a", "out").output("out", "b.txt"),
                Rule::new("c").input_ref("in", "b", "out").output("out", "c.txt"),
            ],
            &["c"],
        )
        .unwrap_err();

        match err {
            EngineError::Graph(GraphError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                assert!(cycle.contains(&RuleId::new("b")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_through_literal_path_is_a_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let err = build(
            &temp_dir,
            vec![Rule::new("loop").input("in", "x.txt").output("out", "x.txt")],
            &["loop"],
        )
        .unwrap_err();
        assert!(err.to_string().contains("loop -> loop"));
    }

    #[test]
    fn test_missing_literal_input() {
        let temp_dir = TempDir::new().unwrap();
        let err = build(
            &temp_dir,
            vec![Rule::new("a").input("in", "data/missing.fasta").output("out", "a.txt")],
            &["a"],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Graph(GraphError::MissingInput { ref slot, .. }) if slot == "in"
        ));
    }

    #[test]
    fn test_literal_input_matching_an_output_creates_edge() {
        let temp_dir = TempDir::new().unwrap();
        touch(&temp_dir, "in.txt");
        let graph = build(
            &temp_dir,
            vec![
                Rule::new("a").input("in", "in.txt").output("out", "out/a.txt"),
                // Literal path instead of a reference; still produced by `a`
                Rule::new("b").input("in", "out/a.txt").output("out", "out/b.txt"),
            ],
            &["b"],
        )
        .unwrap();

        assert_eq!(graph.dependencies(&RuleId::new("b")), vec![&RuleId::new("a")]);
    }
}
