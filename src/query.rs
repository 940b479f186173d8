//! Buffered iteration and search predicates over the object tree.
//!
//! [BufferedIterator] wraps a producer with a front buffer, so items can be
//! peeked at and pushed back. Combinators consume the iterator and return a
//! new one; `order_by` variants drain their input and therefore refuse to
//! work on unbounded producers by construction (they only exist for
//! iterators, which this crate only builds over finite trees).
//!
//! Predicates come in three surface forms that all compile down to
//! `Fn(&Entry) -> bool`: plain closures, the declarative [Query] tree, and
//! textual simple expressions.

use std::collections::VecDeque;

use crate::db::entry::Entry;

/// An iterator over a producer function with a front buffer
pub struct BufferedIterator<'a, T> {
    buffer: VecDeque<T>,
    producer: Box<dyn FnMut() -> Option<T> + 'a>,
}

impl<'a, T: 'a> BufferedIterator<'a, T> {
    pub fn new(producer: impl FnMut() -> Option<T> + 'a) -> Self {
        Self {
            buffer: VecDeque::new(),
            producer: Box::new(producer),
        }
    }

    pub fn from_vec(items: Vec<T>) -> Self {
        let mut inner = items.into_iter();
        Self::new(move || inner.next())
    }

    /// Look at the next item without consuming it
    pub fn peek(&mut self) -> Option<&T> {
        if self.buffer.is_empty() {
            let item = (self.producer)()?;
            self.buffer.push_back(item);
        }
        self.buffer.front()
    }

    /// Push a single item back onto the front of the iterator
    pub fn unget(&mut self, item: T) {
        self.buffer.push_front(item);
    }

    /// Push several items back; they will come out in the given order
    pub fn unget_all(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            self.buffer.push_front(item);
        }
    }

    /// Consume items until one matches the predicate, returning it
    pub fn next_matching(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        loop {
            let item = self.next()?;
            if predicate(&item) {
                return Some(item);
            }
        }
    }

    /// Stop after at most `n` items
    pub fn limit(mut self, n: usize) -> BufferedIterator<'a, T> {
        let mut remaining = n;
        BufferedIterator::new(move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            self.next()
        })
    }

    /// Keep only items matching the predicate
    pub fn grep(mut self, mut predicate: impl FnMut(&T) -> bool + 'a) -> BufferedIterator<'a, T> {
        BufferedIterator::new(move || self.next_matching(&mut predicate))
    }

    /// Transform each item
    pub fn map<U: 'a>(mut self, mut f: impl FnMut(T) -> U + 'a) -> BufferedIterator<'a, U> {
        BufferedIterator::new(move || self.next().map(&mut f))
    }

    /// Drain the iterator and re-feed it sorted by the given key
    pub fn order_by<K: Ord>(self, mut key: impl FnMut(&T) -> K, ascending: bool) -> BufferedIterator<'a, T> {
        let mut items = self.to_array();
        items.sort_by_key(|item| key(item));
        if !ascending {
            items.reverse();
        }
        BufferedIterator::from_vec(items)
    }

    /// Drain the iterator and re-feed it sorted by a string key, optionally
    /// case-insensitive
    pub fn order_by_str(
        self,
        mut key: impl FnMut(&T) -> String,
        ascending: bool,
        case_insensitive: bool,
    ) -> BufferedIterator<'a, T> {
        self.order_by(
            move |item| {
                let k = key(item);
                if case_insensitive {
                    k.to_lowercase()
                } else {
                    k
                }
            },
            ascending,
        )
    }

    /// Drain the iterator and re-feed it sorted numerically
    pub fn norder_by(self, mut key: impl FnMut(&T) -> f64, ascending: bool) -> BufferedIterator<'a, T> {
        let mut items = self.to_array();
        items.sort_by(|a, b| {
            key(a)
                .partial_cmp(&key(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if !ascending {
            items.reverse();
        }
        BufferedIterator::from_vec(items)
    }

    /// Count the remaining items. Drains the producer but restores all items
    /// to the buffer, so the iterator can still be consumed afterwards.
    pub fn count(&mut self) -> usize {
        let mut items = Vec::new();
        while let Some(item) = self.next() {
            items.push(item);
        }
        let n = items.len();
        self.buffer = items.into();
        n
    }

    /// Drain into a vector
    pub fn to_array(mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.next() {
            items.push(item);
        }
        items
    }

    /// Drain, applying a function to each item
    pub fn each(mut self, mut f: impl FnMut(T)) {
        while let Some(item) = self.next() {
            f(item);
        }
    }
}

impl<'a, T: 'a> Iterator for BufferedIterator<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if let Some(item) = self.buffer.pop_front() {
            return Some(item);
        }
        (self.producer)()
    }
}

/// Comparison operator in a [Query] leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    /// String equality
    Eq,
    /// String inequality
    Ne,
    /// Lexicographic less-than
    Lt,
    /// Lexicographic greater-than
    Gt,
    /// Lexicographic less-or-equal
    Le,
    /// Lexicographic greater-or-equal
    Ge,
    /// Case-insensitive substring match (`=~`)
    Like,
    /// Negated case-insensitive substring match (`!~`)
    NotLike,
    /// Numeric comparisons; operands that do not parse as numbers never match
    NumEq,
    NumNe,
    NumLt,
    NumGt,
    NumLe,
    NumGe,
}

impl QueryOp {
    fn evaluate(&self, value: &str, operand: &str) -> bool {
        match self {
            QueryOp::Eq => value == operand,
            QueryOp::Ne => value != operand,
            QueryOp::Lt => value < operand,
            QueryOp::Gt => value > operand,
            QueryOp::Le => value <= operand,
            QueryOp::Ge => value >= operand,
            QueryOp::Like => value.to_lowercase().contains(&operand.to_lowercase()),
            QueryOp::NotLike => !value.to_lowercase().contains(&operand.to_lowercase()),
            QueryOp::NumEq
            | QueryOp::NumNe
            | QueryOp::NumLt
            | QueryOp::NumGt
            | QueryOp::NumLe
            | QueryOp::NumGe => {
                let (value, operand) = match (value.parse::<f64>(), operand.parse::<f64>()) {
                    (Ok(v), Ok(o)) => (v, o),
                    _ => return false,
                };
                match self {
                    QueryOp::NumEq => value == operand,
                    QueryOp::NumNe => value != operand,
                    QueryOp::NumLt => value < operand,
                    QueryOp::NumGt => value > operand,
                    QueryOp::NumLe => value <= operand,
                    QueryOp::NumGe => value >= operand,
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// Declarative search predicate over entries.
///
/// `And` over a collection of subqueries corresponds to a query mapping,
/// `Or` to a query sequence; the leaf forms carry one field each.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
    /// Compare a field against an operand
    Match {
        field: String,
        op: QueryOp,
        operand: String,
    },
    /// The field exists on the entry
    Defined { field: String },
    /// The field does not exist on the entry
    Undefined { field: String },
    /// The field exists and has an empty value
    Empty { field: String },
    /// The field exists and has a non-empty value
    NonEmpty { field: String },
    /// The field parses as a true boolean (`true`, non-zero number)
    Truthy { field: String },
    /// Negation of [Query::Truthy]
    Falsy { field: String },
}

fn is_truthy(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    if let Ok(n) = value.parse::<f64>() {
        return n != 0.0;
    }
    !value.eq_ignore_ascii_case("false")
}

impl Query {
    /// Evaluate this query against an entry
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Query::And(queries) => queries.iter().all(|q| q.matches(entry)),
            Query::Or(queries) => queries.iter().any(|q| q.matches(entry)),
            Query::Not(query) => !query.matches(entry),
            Query::Match { field, op, operand } => entry
                .get(field)
                .map(|value| op.evaluate(value, operand))
                .unwrap_or(false),
            Query::Defined { field } => entry.fields.contains_key(field),
            Query::Undefined { field } => !entry.fields.contains_key(field),
            Query::Empty { field } => entry.get(field).map(str::is_empty).unwrap_or(false),
            Query::NonEmpty { field } => entry.get(field).map(|v| !v.is_empty()).unwrap_or(false),
            Query::Truthy { field } => entry.get(field).map(is_truthy).unwrap_or(false),
            Query::Falsy { field } => !entry.get(field).map(is_truthy).unwrap_or(false),
        }
    }

    /// Compile into a boxed predicate
    pub fn into_predicate(self) -> impl Fn(&Entry) -> bool {
        move |entry| self.matches(entry)
    }
}

/// Split a simple expression into terms: whitespace-separated, double quotes
/// preserve spaces, a leading `-` negates the term.
fn tokenize_simple_expression(expr: &str) -> Vec<(bool, String)> {
    let mut terms = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut negated = false;
        if c == '-' {
            negated = true;
            chars.next();
        }

        let mut term = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                term.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                term.push(c);
                chars.next();
            }
        }

        if !term.is_empty() {
            terms.push((negated, term));
        }
    }

    terms
}

/// Compile a simple expression into a [Query].
///
/// A candidate matches when every non-negated term matches at least one of
/// the listed fields, and no negated term matches any of them.
pub fn parse_simple_expression(expr: &str, op: QueryOp, fields: &[&str]) -> Query {
    let mut terms = Vec::new();

    for (negated, term) in tokenize_simple_expression(expr) {
        let field_matches: Vec<Query> = fields
            .iter()
            .map(|field| Query::Match {
                field: (*field).to_string(),
                op,
                operand: term.clone(),
            })
            .collect();

        let term_query = Query::Or(field_matches);
        terms.push(if negated {
            Query::Not(Box::new(term_query))
        } else {
            term_query
        });
    }

    Query::And(terms)
}

#[cfg(test)]
mod query_tests {
    use super::*;
    use crate::db::fields;

    #[test]
    fn buffered_iterator_basics() {
        let mut it = BufferedIterator::from_vec(vec![1, 2, 3]);

        assert_eq!(it.peek(), Some(&1));
        assert_eq!(it.next(), Some(1));

        it.unget(1);
        assert_eq!(it.next(), Some(1));

        it.unget_all(vec![10, 11]);
        assert_eq!(it.next(), Some(10));
        assert_eq!(it.next(), Some(11));
        assert_eq!(it.next(), Some(2));
        assert_eq!(it.next(), Some(3));
        assert_eq!(it.next(), None);
    }

    #[test]
    fn count_restores_items() {
        let mut it = BufferedIterator::from_vec(vec![1, 2, 3, 4]);
        assert_eq!(BufferedIterator::count(&mut it), 4);
        assert_eq!(it.to_array(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn combinators() {
        let it = BufferedIterator::from_vec(vec![5, 1, 4, 2, 3]);
        let result = it.grep(|n| *n != 4).order_by(|n| *n, true).limit(3).to_array();
        assert_eq!(result, vec![1, 2, 3]);

        let it = BufferedIterator::from_vec(vec![1, 2, 3]);
        assert_eq!(it.map(|n| n * 10).to_array(), vec![10, 20, 30]);

        let it = BufferedIterator::from_vec(vec!["b", "A", "c"]);
        let sorted = it.order_by_str(|s| s.to_string(), true, true).to_array();
        assert_eq!(sorted, vec!["A", "b", "c"]);

        let it = BufferedIterator::from_vec(vec!["10", "9", "100"]);
        let sorted = it.norder_by(|s| s.parse().unwrap(), false).to_array();
        assert_eq!(sorted, vec!["100", "10", "9"]);
    }

    #[test]
    fn limit_is_lazy() {
        let mut produced = 0;
        {
            let it = BufferedIterator::new(|| {
                produced += 1;
                Some(produced)
            });
            assert_eq!(it.limit(3).to_array(), vec![1, 2, 3]);
        }
        assert_eq!(produced, 3);
    }

    fn entry(title: &str, user: &str) -> Entry {
        let mut e = Entry::new();
        e.set_unprotected(fields::TITLE, title);
        e.set_unprotected(fields::USERNAME, user);
        e
    }

    #[test]
    fn declarative_queries() {
        let e = entry("My Bank", "alice");

        let q = Query::And(vec![
            Query::Match {
                field: fields::TITLE.to_string(),
                op: QueryOp::Like,
                operand: "bank".to_string(),
            },
            Query::Match {
                field: fields::USERNAME.to_string(),
                op: QueryOp::Eq,
                operand: "alice".to_string(),
            },
        ]);
        assert!(q.matches(&e));

        let q = Query::Not(Box::new(Query::Match {
            field: fields::TITLE.to_string(),
            op: QueryOp::Like,
            operand: "bank".to_string(),
        }));
        assert!(!q.matches(&e));

        assert!(Query::Defined {
            field: fields::TITLE.to_string()
        }
        .matches(&e));
        assert!(Query::Undefined {
            field: "Missing".to_string()
        }
        .matches(&e));
        assert!(Query::NonEmpty {
            field: fields::TITLE.to_string()
        }
        .matches(&e));
    }

    #[test]
    fn numeric_operators() {
        let mut e = Entry::new();
        e.set_unprotected("Port", "8080");

        let matches = |op, operand: &str| {
            Query::Match {
                field: "Port".to_string(),
                op,
                operand: operand.to_string(),
            }
            .matches(&e)
        };

        assert!(matches(QueryOp::NumEq, "8080"));
        assert!(matches(QueryOp::NumGt, "80"));
        assert!(matches(QueryOp::NumLe, "8080"));
        assert!(!matches(QueryOp::NumLt, "80"));
        // non-numeric operands never match numerically
        assert!(!matches(QueryOp::NumEq, "eighty"));
    }

    #[test]
    fn simple_expressions() {
        let bank = entry("My Bank Account", "alice");
        let forum = entry("Forum", "bob");

        let q = parse_simple_expression("bank", QueryOp::Like, &[fields::TITLE, fields::USERNAME]);
        assert!(q.matches(&bank));
        assert!(!q.matches(&forum));

        // quoted terms keep their spaces
        let q = parse_simple_expression(
            "\"Bank Account\"",
            QueryOp::Like,
            &[fields::TITLE],
        );
        assert!(q.matches(&bank));

        // negated terms must not match
        let q = parse_simple_expression("-bank", QueryOp::Like, &[fields::TITLE]);
        assert!(!q.matches(&bank));
        assert!(q.matches(&forum));

        // all terms must be satisfied
        let q = parse_simple_expression("bank alice", QueryOp::Like, &[fields::TITLE, fields::USERNAME]);
        assert!(q.matches(&bank));
        assert!(!q.matches(&forum));
    }

    #[test]
    fn grep_with_compiled_predicate() {
        let entries = vec![entry("My Bank", "alice"), entry("Forum", "bob")];

        let q = parse_simple_expression("bank", QueryOp::Like, &[fields::TITLE]);
        let predicate = q.into_predicate();

        let found: Vec<Entry> = BufferedIterator::from_vec(entries)
            .grep(move |e| predicate(e))
            .to_array();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_title(), Some("My Bank"));
    }
}
