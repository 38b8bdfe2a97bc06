//! Wiki-link resolution.
//!
//! Every pass starts from scratch: a [`FilenameIndex`] is built over all cached nodes and each
//! node's `raw_links` are rewritten into node ids. Targets that name a qualified path, or that
//! match nothing, are kept literally and become dangling edges.

use std::collections::{BTreeMap, BTreeSet};
use unicode_normalization::UnicodeNormalization;

use crate::{
    identity::canonical_id,
    paths::{base_name, strip_extension},
    properties::{Node, NodeId},
};

/// Lower-cased title or file base name -> candidate node ids, alphabetically ordered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilenameIndex(BTreeMap<String, BTreeSet<NodeId>>);

impl FilenameIndex {
    pub fn build<'a, I: IntoIterator<Item = &'a Node>>(nodes: I) -> Self {
        let mut index = FilenameIndex::default();
        for node in nodes {
            let title_key = index_key(&node.title);
            let file_key = index_key(base_name(&node.source.path));
            if !title_key.is_empty() {
                index.insert(title_key.clone(), &node.id);
            }
            if !file_key.is_empty() && file_key != title_key {
                index.insert(file_key, &node.id);
            }
        }
        index
    }

    fn insert(&mut self, key: String, id: &NodeId) {
        self.0.entry(key).or_default().insert(id.clone());
    }

    pub fn candidates(&self, key: &str) -> Option<&BTreeSet<NodeId>> {
        self.0.get(key).filter(|ids| !ids.is_empty())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn index_key(text: &str) -> String {
    text.trim().nfc().collect::<String>().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Exactly one node matched (or the target was already an id).
    Node(NodeId),
    /// Several nodes matched; `chosen` is the alphabetically first of `candidates`.
    Ambiguous {
        chosen: NodeId,
        candidates: Vec<NodeId>,
    },
    /// Qualified path or no match: keep the target as written.
    Literal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambiguity {
    pub source: NodeId,
    pub target: String,
    pub chosen: NodeId,
    pub candidates: Vec<NodeId>,
}

/// Outcome of [`LinkResolver::resolve_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolutionReport {
    /// New `outgoing_links` for every node whose resolved links changed.
    pub updates: Vec<(NodeId, Vec<NodeId>)>,
    pub ambiguities: Vec<Ambiguity>,
    /// Count of link targets kept literally.
    pub dangling: usize,
}

#[derive(Debug, Clone)]
pub struct LinkResolver {
    ids: BTreeSet<NodeId>,
    index: FilenameIndex,
}

impl LinkResolver {
    pub fn new(nodes: &[Node]) -> Self {
        LinkResolver {
            ids: nodes.iter().map(|node| node.id.clone()).collect(),
            index: FilenameIndex::build(nodes),
        }
    }

    pub fn index(&self) -> &FilenameIndex {
        &self.index
    }

    pub fn resolve_target(&self, target: &str) -> Resolution {
        let trimmed = target.trim();
        if self.ids.contains(trimmed) {
            return Resolution::Node(trimmed.to_string());
        }
        if let Some(id) = canonical_id(trimmed).filter(|id| self.ids.contains(id)) {
            return Resolution::Node(id);
        }
        if trimmed.contains('/') || trimmed.contains('\\') {
            return Resolution::Literal;
        }

        let name = trimmed.split('#').next().unwrap_or_default().trim();
        if name.is_empty() {
            return Resolution::Literal;
        }
        let stripped = index_key(strip_extension(name));
        let whole = index_key(name);

        let mut keys = vec![stripped.clone()];
        if whole != stripped {
            keys.push(whole);
        }
        if stripped.contains(' ') {
            keys.push(stripped.replace(' ', "-"));
        }
        if stripped.contains('-') {
            keys.push(stripped.replace('-', " "));
        }

        for key in keys {
            if let Some(ids) = self.index.candidates(&key) {
                let Some(first) = ids.first() else { continue };
                if ids.len() == 1 {
                    return Resolution::Node(first.clone());
                }
                return Resolution::Ambiguous {
                    chosen: first.clone(),
                    candidates: ids.iter().cloned().collect(),
                };
            }
        }
        Resolution::Literal
    }

    /// Resolve one node's raw links, deduplicating resolved ids in first-seen order. Each set of
    /// ambiguous candidates is warned about and reported once per node, however many of its
    /// links hit it.
    pub fn resolve_node(&self, node: &Node, report: &mut ResolutionReport) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut warned = BTreeSet::new();
        let mut resolved = Vec::with_capacity(node.raw_links.len());
        for target in node.raw_links.iter() {
            let link = match self.resolve_target(target) {
                Resolution::Node(id) => id,
                Resolution::Ambiguous { chosen, candidates } => {
                    if warned.insert(candidates.clone()) {
                        tracing::warn!(
                            "[LinkResolver] ambiguous link '{}' in {}: {:?} all match, using {}",
                            target,
                            node.source.path,
                            candidates,
                            chosen
                        );
                        report.ambiguities.push(Ambiguity {
                            source: node.id.clone(),
                            target: target.clone(),
                            chosen: chosen.clone(),
                            candidates,
                        });
                    }
                    chosen
                }
                Resolution::Literal => {
                    report.dangling += 1;
                    target.clone()
                }
            };
            if seen.insert(link.clone()) {
                resolved.push(link);
            }
        }
        resolved
    }

    /// One full resolution pass. Only nodes whose links changed appear in `updates`.
    pub fn resolve_all(&self, nodes: &[Node]) -> ResolutionReport {
        let mut report = ResolutionReport::default();
        for node in nodes {
            let resolved = self.resolve_node(node, &mut report);
            if resolved != node.outgoing_links {
                report.updates.push((node.id.clone(), resolved));
            }
        }
        tracing::debug!(
            "[LinkResolver] {} nodes, {} index keys, {} updated, {} dangling, {} ambiguous",
            nodes.len(),
            self.index.len(),
            report.updates.len(),
            report.dangling,
            report.ambiguities.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::SourceRef;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use test_log::test;
    use tracing_subscriber::{
        layer::{Context, SubscriberExt},
        Layer,
    };

    fn node(id: &str, title: &str, path: &str, links: &[&str]) -> Node {
        Node {
            id: id.to_string(),
            title: title.to_string(),
            raw_links: links.iter().map(|l| l.to_string()).collect(),
            source: SourceRef {
                path: path.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn index_holds_titles_and_distinct_file_names() {
        let nodes = vec![
            node("a", "Alpha", "notes/Alpha.md", &[]),
            node("b", "Beta Note", "notes/beta-note.md", &[]),
        ];
        let index = FilenameIndex::build(&nodes);
        assert_eq!(index.len(), 3);
        assert!(index.candidates("alpha").is_some());
        assert!(index.candidates("beta note").is_some());
        assert!(index.candidates("beta-note").is_some());
    }

    #[test]
    fn resolves_titles_and_keeps_unknown_literal() {
        let nodes = vec![
            node("a", "Alpha", "alpha.md", &[]),
            node("b", "Beta", "beta.md", &[]),
            node("c", "Gamma", "gamma.md", &["Alpha", "Nonexistent", "beta.md"]),
        ];
        let resolver = LinkResolver::new(&nodes);
        let report = resolver.resolve_all(&nodes);
        assert_eq!(
            report.updates,
            vec![(
                "c".to_string(),
                vec!["a".to_string(), "Nonexistent".to_string(), "b".to_string()]
            )]
        );
        assert_eq!(report.dangling, 1);
        assert!(report.ambiguities.is_empty());
    }

    #[test]
    fn ids_paths_and_fragments() {
        let nodes = vec![node("0b4a2f6e-3c1d-4f7a-9e8b-2d5c6a7b8c9d", "Alpha", "a.md", &[])];
        let resolver = LinkResolver::new(&nodes);
        assert_eq!(
            resolver.resolve_target("0B4A2F6E-3C1D-4F7A-9E8B-2D5C6A7B8C9D"),
            Resolution::Node(nodes[0].id.clone())
        );
        assert_eq!(resolver.resolve_target("dir/Alpha"), Resolution::Literal);
        assert_eq!(
            resolver.resolve_target("Alpha#Intro"),
            Resolution::Node(nodes[0].id.clone())
        );
        assert_eq!(resolver.resolve_target("#Intro"), Resolution::Literal);
    }

    #[test]
    fn space_and_hyphen_variants() {
        let nodes = vec![
            node("a", "my-note", "x.md", &[]),
            node("b", "Other Thing", "y.md", &[]),
        ];
        let resolver = LinkResolver::new(&nodes);
        assert_eq!(resolver.resolve_target("My Note"), Resolution::Node("a".into()));
        assert_eq!(
            resolver.resolve_target("other-thing"),
            Resolution::Node("b".into())
        );
    }

    #[test]
    fn ambiguity_picks_first_id_once() {
        let nodes = vec![
            node("zeta", "First", "one/Shared.md", &[]),
            node("beta", "Second", "two/shared.md", &[]),
            node("src", "Source", "src.md", &["Shared", "shared.md"]),
        ];
        let resolver = LinkResolver::new(&nodes);
        let report = resolver.resolve_all(&nodes);
        assert_eq!(
            report.updates,
            vec![("src".to_string(), vec!["beta".to_string()])]
        );
        assert_eq!(report.ambiguities.len(), 1);
        assert_eq!(report.ambiguities[0].target, "Shared");
        assert_eq!(report.ambiguities[0].chosen, "beta");
        assert_eq!(report.ambiguities[0].candidates, vec!["beta", "zeta"]);
    }

    #[derive(Clone, Default)]
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == tracing::Level::WARN && meta.target() == "docgraph_core::resolver" {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn each_linking_node_warns_once_per_ambiguous_name() {
        let nodes = vec![
            node("zeta", "First", "one/Shared.md", &[]),
            node("beta", "Second", "two/shared.md", &[]),
            node("src", "Source", "src.md", &["Shared", "shared#Intro", "Shared"]),
            node("other", "Other", "other.md", &["shared"]),
        ];
        let warnings = WarnCounter::default();
        let subscriber = tracing_subscriber::registry().with(warnings.clone());
        let report = tracing::subscriber::with_default(subscriber, || {
            LinkResolver::new(&nodes).resolve_all(&nodes)
        });

        assert_eq!(warnings.0.load(Ordering::SeqCst), 2);
        let sources = report
            .ambiguities
            .iter()
            .map(|a| a.source.as_str())
            .collect::<Vec<_>>();
        assert_eq!(sources, vec!["src", "other"]);
    }

    #[test]
    fn unchanged_links_are_not_reported() {
        let mut nodes = vec![
            node("a", "Alpha", "alpha.md", &[]),
            node("b", "Beta", "beta.md", &["Alpha"]),
        ];
        nodes[1].outgoing_links = vec!["a".to_string()];
        let report = LinkResolver::new(&nodes).resolve_all(&nodes);
        assert!(report.updates.is_empty());
    }
}
