use kdbx_db::config::DatabaseConfig;
use kdbx_db::db::{fields, Entry, Group, IterOptions, NodeRef, TraversalOrder};
use kdbx_db::query::{parse_simple_expression, BufferedIterator, Query, QueryOp};
use kdbx_db::Database;

fn entry(title: &str, username: &str, url: &str) -> Entry {
    let mut e = Entry::new();
    e.set_unprotected(fields::TITLE, title);
    e.set_unprotected(fields::USERNAME, username);
    e.set_unprotected(fields::URL, url);
    e
}

fn sample_database() -> Database {
    let mut db = Database::new(DatabaseConfig::default());

    let mut banking = Group::new("Banking");
    banking.add_child(entry("First Bank", "alice", "https://bank.example.com"));
    banking.add_child(entry("Second Bank", "bob", "https://other-bank.example.com"));

    let mut email = Group::new("Email");
    email.add_child(entry("Mail Account", "carol", "https://mail.example.com"));

    let mut social = Group::new("Social");
    social.enable_searching = Some(false);
    social.add_child(entry("Hidden Forum", "dave", "https://forum.example.com"));
    email.add_child(social);

    db.root.add_child(banking);
    db.root.add_child(email);

    db
}

fn titles<'a>(nodes: Vec<NodeRef<'a>>) -> Vec<&'a str> {
    nodes
        .into_iter()
        .filter_map(|n| match n {
            NodeRef::Entry(e) => e.get_title(),
            _ => None,
        })
        .collect()
}

#[test]
fn grep_with_simple_expression() {
    let db = sample_database();

    let query = parse_simple_expression("bank", QueryOp::Like, &[fields::TITLE]);
    let predicate = query.into_predicate();

    let found = db
        .root
        .iter()
        .grep(move |node| matches!(node, NodeRef::Entry(e) if predicate(e)))
        .to_array();

    assert_eq!(titles(found), ["First Bank", "Second Bank"]);
}

#[test]
fn searching_filter_hides_disabled_subtrees() {
    let db = sample_database();

    let all = db.root.deep_iter(IterOptions::new()).to_array();
    assert!(titles(all).contains(&"Hidden Forum"));

    let searchable = db.root.deep_iter(IterOptions::new().searching_only()).to_array();
    assert!(!titles(searchable).contains(&"Hidden Forum"));
}

#[test]
fn ordering_and_pagination() {
    let db = sample_database();

    let page: Vec<&str> = titles(
        db.root
            .iter()
            .grep(|node| matches!(node, NodeRef::Entry(_)))
            .order_by_str(
                |node| match node {
                    NodeRef::Entry(e) => e.get_title().unwrap_or("").to_string(),
                    NodeRef::Group(g) => g.name.clone(),
                },
                true,
                true,
            )
            .limit(2)
            .to_array(),
    );

    assert_eq!(page, ["First Bank", "Hidden Forum"]);
}

#[test]
fn count_preserves_the_stream() {
    let db = sample_database();

    let mut entries = db.root.iter().grep(|node| matches!(node, NodeRef::Entry(_)));

    assert_eq!(kdbx_db::query::BufferedIterator::count(&mut entries), 4);

    // counting did not consume the iterator
    assert_eq!(titles(entries.to_array()).len(), 4);
}

#[test]
fn peek_and_unget() {
    let db = sample_database();
    let mut it = db.root.iter();

    let first_uuid = it.peek().map(|n| n.uuid()).unwrap();
    let consumed = it.next().unwrap();
    assert_eq!(consumed.uuid(), first_uuid);

    it.unget(consumed);
    assert_eq!(it.next().unwrap().uuid(), first_uuid);
}

#[test]
fn declarative_queries_over_entries() {
    let db = sample_database();

    let query = Query::And(vec![
        Query::Match {
            field: fields::URL.to_string(),
            op: QueryOp::Like,
            operand: "example.com".to_string(),
        },
        Query::Not(Box::new(Query::Match {
            field: fields::USERNAME.to_string(),
            op: QueryOp::Eq,
            operand: "alice".to_string(),
        })),
    ]);

    let found = db
        .root
        .iter()
        .grep(move |node| matches!(node, NodeRef::Entry(e) if query.matches(e)))
        .to_array();

    assert_eq!(titles(found), ["Second Bank", "Mail Account", "Hidden Forum"]);
}

#[test]
fn traversal_orders_are_deterministic() {
    let db = sample_database();

    for order in [TraversalOrder::Ids, TraversalOrder::Bfs, TraversalOrder::Dfs] {
        let first: Vec<_> = db
            .root
            .deep_iter(IterOptions::new().with_order(order))
            .map(|n| n.uuid())
            .collect();
        let second: Vec<_> = db
            .root
            .deep_iter(IterOptions::new().with_order(order))
            .map(|n| n.uuid())
            .collect();
        assert_eq!(first, second);
    }
}

#[test]
fn map_each_and_plain_iterator_interop() {
    let db = sample_database();

    // map into owned titles
    let mapped: Vec<String> = db
        .root
        .iter()
        .grep(|n| matches!(n, NodeRef::Entry(_)))
        .map(|n| match n {
            NodeRef::Entry(e) => e.get_title().unwrap_or("").to_string(),
            NodeRef::Group(g) => g.name.clone(),
        })
        .to_array();
    assert_eq!(mapped.len(), 4);

    // each() drains
    let mut seen = 0;
    BufferedIterator::from_vec(mapped).each(|_| seen += 1);
    assert_eq!(seen, 4);

    // standard Iterator adapters also work
    let group_count = db
        .root
        .iter()
        .filter(|n| matches!(n, NodeRef::Group(_)))
        .count();
    assert_eq!(group_count, 4); // Root, Banking, Email, Social
}
