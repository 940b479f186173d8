use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

use crate::db::{entry::Entry, group::Group, CustomData, Times, Value};
use crate::query::BufferedIterator;

/// A node in the database tree: either a group or an entry
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Node {
    Group(Group),
    Entry(Entry),
}

impl Node {
    pub fn uuid(&self) -> Uuid {
        match self {
            Node::Group(g) => g.uuid,
            Node::Entry(e) => e.uuid,
        }
    }

    pub fn to_ref(&self) -> NodeRef<'_> {
        self.into()
    }

    pub fn to_ref_mut(&mut self) -> NodeRefMut<'_> {
        self.into()
    }

    /// The shared object operations of this node
    pub fn as_object(&self) -> &dyn Object {
        match self {
            Node::Group(g) => g,
            Node::Entry(e) => e,
        }
    }

    pub fn as_object_mut(&mut self) -> &mut dyn Object {
        match self {
            Node::Group(g) => g,
            Node::Entry(e) => e,
        }
    }
}

impl From<Group> for Node {
    fn from(g: Group) -> Self {
        Node::Group(g)
    }
}

impl From<Entry> for Node {
    fn from(e: Entry) -> Self {
        Node::Entry(e)
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum NodeRef<'a> {
    Group(&'a Group),
    Entry(&'a Entry),
}

impl<'a> NodeRef<'a> {
    pub fn uuid(&self) -> Uuid {
        match self {
            NodeRef::Group(g) => g.uuid,
            NodeRef::Entry(e) => e.uuid,
        }
    }
}

impl<'a> From<&'a Node> for NodeRef<'a> {
    fn from(n: &'a Node) -> Self {
        match n {
            Node::Group(g) => NodeRef::Group(g),
            Node::Entry(e) => NodeRef::Entry(e),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum NodeRefMut<'a> {
    Group(&'a mut Group),
    Entry(&'a mut Entry),
}

impl<'a> From<&'a mut Node> for NodeRefMut<'a> {
    fn from(n: &'a mut Node) -> Self {
        match n {
            Node::Group(g) => NodeRefMut::Group(g),
            Node::Entry(e) => NodeRefMut::Entry(e),
        }
    }
}

/// Operations shared by groups and entries.
///
/// Both node kinds dispatch the common attribute surface through this trait,
/// which is what generic code (iteration, UUID rewriting, custom data
/// handling) programs against.
pub trait Object {
    fn uuid(&self) -> Uuid;
    fn set_uuid(&mut self, uuid: Uuid);
    fn times(&self) -> &Times;
    fn times_mut(&mut self) -> &mut Times;
    fn custom_data(&self) -> &CustomData;
    fn custom_data_mut(&mut self) -> &mut CustomData;
    fn tag_list(&self) -> &[String];
    fn icon_id(&self) -> Option<usize>;
    fn custom_icon_uuid(&self) -> Option<Uuid>;
    fn previous_parent_group(&self) -> Option<Uuid>;

    /// Value of a custom data item, if present
    fn custom_data_value(&self, key: &str) -> Option<&Value> {
        self.custom_data().items.get(key)?.value.as_ref()
    }
}

impl Object for Group {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = uuid;
    }

    fn times(&self) -> &Times {
        &self.times
    }

    fn times_mut(&mut self) -> &mut Times {
        &mut self.times
    }

    fn custom_data(&self) -> &CustomData {
        &self.custom_data
    }

    fn custom_data_mut(&mut self) -> &mut CustomData {
        &mut self.custom_data
    }

    fn tag_list(&self) -> &[String] {
        &self.tags
    }

    fn icon_id(&self) -> Option<usize> {
        self.icon_id
    }

    fn custom_icon_uuid(&self) -> Option<Uuid> {
        self.custom_icon_uuid
    }

    fn previous_parent_group(&self) -> Option<Uuid> {
        self.previous_parent_group
    }
}

impl Object for Entry {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = uuid;
    }

    fn times(&self) -> &Times {
        &self.times
    }

    fn times_mut(&mut self) -> &mut Times {
        &mut self.times
    }

    fn custom_data(&self) -> &CustomData {
        &self.custom_data
    }

    fn custom_data_mut(&mut self) -> &mut CustomData {
        &mut self.custom_data
    }

    fn tag_list(&self) -> &[String] {
        &self.tags
    }

    fn icon_id(&self) -> Option<usize> {
        self.icon_id
    }

    fn custom_icon_uuid(&self) -> Option<Uuid> {
        self.custom_icon_uuid
    }

    fn previous_parent_group(&self) -> Option<Uuid> {
        self.previous_parent_group
    }
}

/// Order in which a group tree is walked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    /// Iterative deepening: all nodes at depth 0, then depth 1, and so on
    Ids,
    /// Depth-first, subgroups before their parent (post-order)
    Dfs,
    /// Breadth-first over groups
    Bfs,
}

impl Default for TraversalOrder {
    fn default() -> Self {
        TraversalOrder::Ids
    }
}

/// Options for deep iteration over a group tree
#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    pub order: TraversalOrder,
    /// Also yield historical entry versions, after their current entry
    pub history: bool,
    /// Skip subtrees whose effective enable-searching flag is off
    pub searching: bool,
    /// Skip subtrees whose effective enable-auto-type flag is off
    pub auto_type: bool,
}

impl IterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(mut self, order: TraversalOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_history(mut self) -> Self {
        self.history = true;
        self
    }

    pub fn searching_only(mut self) -> Self {
        self.searching = true;
        self
    }

    pub fn auto_type_only(mut self) -> Self {
        self.auto_type = true;
        self
    }
}

/// Inherited flag state carried down a traversal
#[derive(Clone, Copy)]
struct Inherited {
    searching: bool,
    auto_type: bool,
}

impl Inherited {
    // the root of the tree defaults both flags to true
    fn root() -> Self {
        Inherited {
            searching: true,
            auto_type: true,
        }
    }

    fn descend(self, group: &Group) -> Self {
        Inherited {
            searching: group.enable_searching.unwrap_or(self.searching),
            auto_type: group.enable_autotype.unwrap_or(self.auto_type),
        }
    }

    fn admits(&self, options: &IterOptions) -> bool {
        (!options.searching || self.searching) && (!options.auto_type || self.auto_type)
    }
}

/// Note a group that was reached twice during one traversal.
///
/// The in-memory tree is acyclic by ownership, but externally-produced files
/// can contain duplicated UUIDs; iteration keeps the first occurrence.
fn note_revisit(group: &Group) {
    log::warn!("group {} visited twice during iteration, skipping", group.uuid);
}

fn emit_entry<'a>(entry: &'a Entry, options: &IterOptions, out: &mut Vec<NodeRef<'a>>) {
    out.push(NodeRef::Entry(entry));
    if options.history {
        for historical in entry.history_entries() {
            out.push(NodeRef::Entry(historical));
        }
    }
}

fn walk_bfs<'a>(root: &'a Group, options: &IterOptions, out: &mut Vec<NodeRef<'a>>) {
    let mut visited: HashSet<Uuid> = HashSet::new();
    let mut queue: VecDeque<(&Group, Inherited)> = VecDeque::new();
    queue.push_back((root, Inherited::root()));

    while let Some((group, inherited)) = queue.pop_front() {
        if !visited.insert(group.uuid) {
            note_revisit(group);
            continue;
        }

        let flags = inherited.descend(group);
        if !flags.admits(options) {
            continue;
        }

        out.push(NodeRef::Group(group));
        for entry in group.entries() {
            emit_entry(entry, options, out);
        }

        for subgroup in group.groups() {
            queue.push_back((subgroup, flags));
        }
    }
}

fn walk_dfs<'a>(
    group: &'a Group,
    inherited: Inherited,
    options: &IterOptions,
    visited: &mut HashSet<Uuid>,
    out: &mut Vec<NodeRef<'a>>,
) {
    if !visited.insert(group.uuid) {
        note_revisit(group);
        return;
    }

    let flags = inherited.descend(group);
    if !flags.admits(options) {
        return;
    }

    for subgroup in group.groups() {
        walk_dfs(subgroup, flags, options, visited, out);
    }

    out.push(NodeRef::Group(group));
    for entry in group.entries() {
        emit_entry(entry, options, out);
    }
}

fn walk_ids<'a>(root: &'a Group, options: &IterOptions, out: &mut Vec<NodeRef<'a>>) {
    // each pass emits only the nodes at exactly `target` depth; passes stop
    // once a depth yields nothing
    fn pass<'a>(
        group: &'a Group,
        inherited: Inherited,
        depth: usize,
        target: usize,
        options: &IterOptions,
        visited: &mut HashSet<Uuid>,
        out: &mut Vec<NodeRef<'a>>,
    ) -> bool {
        if !visited.insert(group.uuid) {
            note_revisit(group);
            return false;
        }

        let flags = inherited.descend(group);
        if !flags.admits(options) {
            return false;
        }

        if depth == target {
            out.push(NodeRef::Group(group));
            return true;
        }

        let mut found = false;
        for node in &group.children {
            match node {
                Node::Entry(entry) if depth + 1 == target => {
                    emit_entry(entry, options, out);
                    found = true;
                }
                Node::Group(subgroup) => {
                    found |= pass(subgroup, flags, depth + 1, target, options, visited, out);
                }
                _ => {}
            }
        }

        found
    }

    let mut target = 0;
    loop {
        let mut visited = HashSet::new();
        if !pass(root, Inherited::root(), 0, target, options, &mut visited, out) {
            break;
        }
        target += 1;
    }
}

impl Group {
    /// Iterate over this group and everything below it.
    ///
    /// Groups come before their entries; historical entries follow their
    /// current entry when requested. The resulting iterator supports the
    /// buffering and combinator operations of [BufferedIterator].
    pub fn deep_iter(&self, options: IterOptions) -> BufferedIterator<'_, NodeRef<'_>> {
        let mut nodes = Vec::new();

        match options.order {
            TraversalOrder::Bfs => walk_bfs(self, &options, &mut nodes),
            TraversalOrder::Dfs => {
                let mut visited = HashSet::new();
                walk_dfs(self, Inherited::root(), &options, &mut visited, &mut nodes);
            }
            TraversalOrder::Ids => walk_ids(self, &options, &mut nodes),
        }

        BufferedIterator::from_vec(nodes)
    }

    /// Iterate with default options
    pub fn iter(&self) -> BufferedIterator<'_, NodeRef<'_>> {
        self.deep_iter(IterOptions::default())
    }
}

impl<'a> IntoIterator for &'a Group {
    type Item = NodeRef<'a>;
    type IntoIter = BufferedIterator<'a, NodeRef<'a>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod node_tests {
    use super::*;

    fn named_entry(title: &str) -> Entry {
        let mut e = Entry::new();
        e.set_unprotected("Title", title);
        e
    }

    fn sample_tree() -> Group {
        // Root
        // ├── e-root
        // ├── A
        // │   ├── e-a1
        // │   └── C
        // │       └── e-c1
        // └── B
        //     └── e-b1
        let mut root = Group::new("Root");
        root.add_child(named_entry("e-root"));

        let mut a = Group::new("A");
        a.add_child(named_entry("e-a1"));
        let mut c = Group::new("C");
        c.add_child(named_entry("e-c1"));
        a.add_child(c);

        let mut b = Group::new("B");
        b.add_child(named_entry("e-b1"));

        root.add_child(a);
        root.add_child(b);
        root
    }

    fn names(nodes: Vec<NodeRef<'_>>) -> Vec<String> {
        nodes
            .into_iter()
            .map(|n| match n {
                NodeRef::Group(g) => g.name.clone(),
                NodeRef::Entry(e) => e.get_title().unwrap_or("?").to_string(),
            })
            .collect()
    }

    #[test]
    fn bfs_order() {
        let root = sample_tree();
        let order = names(root.deep_iter(IterOptions::new().with_order(TraversalOrder::Bfs)).to_array());

        assert_eq!(
            order,
            ["Root", "e-root", "A", "e-a1", "B", "e-b1", "C", "e-c1"]
        );
    }

    #[test]
    fn dfs_is_post_order() {
        let root = sample_tree();
        let order = names(root.deep_iter(IterOptions::new().with_order(TraversalOrder::Dfs)).to_array());

        assert_eq!(
            order,
            ["C", "e-c1", "A", "e-a1", "B", "e-b1", "Root", "e-root"]
        );
    }

    #[test]
    fn ids_goes_level_by_level() {
        let root = sample_tree();
        let order = names(root.deep_iter(IterOptions::new().with_order(TraversalOrder::Ids)).to_array());

        assert_eq!(
            order,
            ["Root", "e-root", "A", "B", "e-a1", "C", "e-b1", "e-c1"]
        );
    }

    #[test]
    fn traversal_is_deterministic() {
        let root = sample_tree();

        let first = names(root.iter().to_array());
        let second = names(root.iter().to_array());
        assert_eq!(first, second);
    }

    #[test]
    fn history_entries_follow_their_current_entry() {
        let mut root = Group::new("Root");
        let mut entry = named_entry("current");
        let mut old = named_entry("old-version");
        old.uuid = entry.uuid;
        entry.add_historical_entry(old);
        root.add_child(entry);

        let without = names(root.deep_iter(IterOptions::new()).to_array());
        assert_eq!(without, ["Root", "current"]);

        let with = names(root.deep_iter(IterOptions::new().with_history()).to_array());
        assert_eq!(with, ["Root", "current", "old-version"]);
    }

    #[test]
    fn searching_filter_prunes_subtrees() {
        let mut root = sample_tree();

        // disable searching on A; C inherits the disabled state
        for group in root.groups_mut() {
            if group.name == "A" {
                group.enable_searching = Some(false);
            }
        }

        let order = names(
            root.deep_iter(
                IterOptions::new()
                    .with_order(TraversalOrder::Bfs)
                    .searching_only(),
            )
            .to_array(),
        );

        assert_eq!(order, ["Root", "e-root", "B", "e-b1"]);
    }

    #[test]
    fn duplicated_group_uuid_is_skipped() {
        let mut root = Group::new("Root");
        let a = Group::new("A");
        let mut duplicate = Group::new("A-duplicate");
        duplicate.uuid = a.uuid;

        root.add_child(a);
        root.add_child(duplicate);

        let order = names(root.deep_iter(IterOptions::new().with_order(TraversalOrder::Bfs)).to_array());
        assert_eq!(order, ["Root", "A"]);
    }
}
