use uuid::Uuid;

use crate::db::{
    entry::Entry,
    node::{Node, NodeRef, NodeRefMut},
    CustomData, Meta, Times,
};

/// A database group with child groups and entries
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct Group {
    /// The unique identifier of the group
    pub uuid: Uuid,

    /// The name of the group
    pub name: String,

    /// Notes for the group
    pub notes: Option<String>,

    /// Tags on the group (KDBX4.1)
    pub tags: Vec<String>,

    /// ID of the group's icon
    pub icon_id: Option<usize>,

    /// UUID for a custom group icon
    pub custom_icon_uuid: Option<Uuid>,

    /// The list of child nodes (Groups or Entries)
    pub children: Vec<Node>,

    /// The list of time fields for this group
    pub times: Times,

    pub custom_data: CustomData,

    /// Whether the group is expanded in the user interface
    pub is_expanded: bool,

    /// Default autotype sequence, inherited by entries without their own
    pub default_autotype_sequence: Option<String>,

    /// Whether autotype is enabled; `None` inherits from the parent group
    pub enable_autotype: Option<bool>,

    /// Whether searching is enabled; `None` inherits from the parent group
    pub enable_searching: Option<bool>,

    /// UUID of the entry scrolled to the top when the group was last shown
    pub last_top_visible_entry: Option<Uuid>,

    /// Group this group lived in before it was last relocated
    pub previous_parent_group: Option<Uuid>,
}

impl Group {
    pub fn new(name: &str) -> Group {
        Group {
            name: name.to_string(),
            times: Times::new(),
            uuid: Uuid::new_v4(),
            ..Default::default()
        }
    }

    /// Add a child node (an entry or a group) to this group
    pub fn add_child(&mut self, node: impl Into<Node>) {
        self.children.push(node.into());
    }

    /// Remove the direct child with the given UUID, returning it
    pub fn remove_child(&mut self, uuid: &Uuid) -> Option<Node> {
        let position = self.children.iter().position(|node| node.uuid() == *uuid)?;
        Some(self.children.remove(position))
    }

    /// Recursively get a Group or Entry reference by specifying a path of
    /// names relative to the current Group
    pub fn get<'a>(&'a self, path: &[&str]) -> Option<NodeRef<'a>> {
        if path.is_empty() {
            return Some(NodeRef::Group(self));
        }

        let head = path[0];
        let tail = &path[1..];

        if tail.is_empty() {
            return self.children.iter().find_map(|n| {
                if node_name_matches(n, head) {
                    Some(n.to_ref())
                } else {
                    None
                }
            });
        }

        let head_group = self.children.iter().find_map(|n| match n {
            Node::Group(g) if g.name == head => Some(g),
            _ => None,
        })?;

        head_group.get(tail)
    }

    /// Recursively get a mutable reference to a Group or Entry by specifying
    /// a path of names relative to the current Group
    pub fn get_mut<'a>(&'a mut self, path: &[&str]) -> Option<NodeRefMut<'a>> {
        if path.is_empty() {
            return Some(NodeRefMut::Group(self));
        }

        let head = path[0];
        let tail = &path[1..];

        if tail.is_empty() {
            return self
                .children
                .iter_mut()
                .filter(|n| node_name_matches(n, head))
                .map(|n| n.to_ref_mut())
                .next();
        }

        let head_group = self.children.iter_mut().find_map(|n| match n {
            Node::Group(g) if g.name == head => Some(g),
            _ => None,
        })?;

        head_group.get_mut(tail)
    }

    /// Convenience method for getting the name of the Group
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Get a timestamp field by name
    pub fn get_time(&self, key: &str) -> Option<&chrono::NaiveDateTime> {
        self.times.get(key)
    }

    /// Convenience method for getting the time that the group expires
    pub fn get_expiry_time(&self) -> Option<&chrono::NaiveDateTime> {
        self.times.get_expiry()
    }

    /// The direct child entries of this group
    pub fn entries(&self) -> Vec<&Entry> {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Entry(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    pub fn entries_mut(&mut self) -> Vec<&mut Entry> {
        self.children
            .iter_mut()
            .filter_map(|node| match node {
                Node::Entry(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    /// The direct child groups of this group
    pub fn groups(&self) -> Vec<&Group> {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Group(g) => Some(g),
                _ => None,
            })
            .collect()
    }

    pub fn groups_mut(&mut self) -> Vec<&mut Group> {
        self.children
            .iter_mut()
            .filter_map(|node| match node {
                Node::Group(g) => Some(g),
                _ => None,
            })
            .collect()
    }

    /// The direct children as nodes, groups first, then entries
    pub fn objects(&self) -> Vec<NodeRef<'_>> {
        let mut out: Vec<NodeRef<'_>> = self.groups().into_iter().map(NodeRef::Group).collect();
        out.extend(self.entries().into_iter().map(NodeRef::Entry));
        out
    }

    /// Coarse byte estimate of this group and everything below it
    pub fn size(&self) -> usize {
        let own = self.name.len()
            + self.notes.as_deref().map(str::len).unwrap_or(0)
            + self.tags.iter().map(String::len).sum::<usize>();

        own + self
            .children
            .iter()
            .map(|node| match node {
                Node::Entry(e) => e.size(),
                Node::Group(g) => g.size(),
            })
            .sum::<usize>()
    }

    /// All entries in this group and its subgroups, in default traversal
    /// order
    pub fn all_entries(&self) -> Vec<&Entry> {
        self.iter()
            .filter_map(|node| match node {
                NodeRef::Entry(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    /// Whether this group is the database's recycle bin
    pub fn is_recycle_bin(&self, meta: &Meta) -> bool {
        meta.recyclebin_uuid == Some(self.uuid)
    }

    /// Whether this group holds the database's entry templates
    pub fn is_entry_templates(&self, meta: &Meta) -> bool {
        meta.entry_templates_group == Some(self.uuid)
    }

    /// Whether this group was the last selected group
    pub fn is_last_selected(&self, meta: &Meta) -> bool {
        meta.last_selected_group == Some(self.uuid)
    }

    /// Whether this group was the last top-visible group
    pub fn is_last_top_visible(&self, meta: &Meta) -> bool {
        meta.last_top_visible_group == Some(self.uuid)
    }
}

fn node_name_matches(node: &Node, name: &str) -> bool {
    match node {
        Node::Entry(e) => e.get_title() == Some(name),
        Node::Group(g) => g.name == name,
    }
}
