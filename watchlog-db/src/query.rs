use serde_json::Value;
use std::cmp::Ordering;

pub type Row = serde_json::Map<String, Value>;

pub mod tables {
    pub const POSTS: &str = "posts";
    pub const POST_LIKES: &str = "post_likes";
    pub const COMMENTS: &str = "comments";
    pub const PROFILES: &str = "profiles";
    pub const MEDIA_ENTRIES: &str = "media_entries";
    pub const FOLLOWS: &str = "follows";
}

pub mod procedures {
    /// `get_feed(viewer_id, page_limit, page_offset)`, a pre-aggregated feed page.
    pub const GET_FEED: &str = "get_feed";
}

#[derive(Clone, PartialEq, Debug)]
pub enum Filter {
    Eq { column: String, value: Value },
    In { column: String, values: Vec<Value> },
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

/// Inclusive row range `[from, to]`, the same shape the hosted client's `range()` takes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct Range {
    pub from: usize,
    pub to: usize,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Select {
    pub table: String,
    pub filters: Vec<Filter>,
    /// Sort keys, most significant first.
    pub order: Vec<Order>,
    pub range: Option<Range>,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn any_of<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq { column, .. } | Filter::In { column, .. } => column,
        }
    }

    /// Whether `row` passes this filter. A missing column never matches.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        let Some(actual) = row.get(self.column()) else {
            return false;
        };

        match self {
            Filter::Eq { value, .. } => actual == value,
            Filter::In { values, .. } => values.contains(actual),
        }
    }
}

impl Range {
    /// The range covering `limit` rows starting at `offset`, or `None` for an empty page.
    #[must_use]
    pub fn page(offset: usize, limit: usize) -> Option<Self> {
        (limit > 0).then(|| Self {
            from: offset,
            to: offset + limit - 1,
        })
    }

    #[must_use]
    pub fn len(self) -> usize {
        self.to.saturating_sub(self.from) + 1
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.to < self.from
    }
}

impl Select {
    pub fn from_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order: Vec::new(),
            range: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds a sort key after any already given.
    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order.push(Order {
            column: column.into(),
            direction,
        });
        self
    }

    #[must_use]
    pub fn range(mut self, range: Option<Range>) -> Self {
        self.range = range;
        self
    }

    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|filter| filter.matches(row))
    }
}

/// Ordering used for `ORDER BY` emulation: numbers numerically, strings
/// lexicographically, nulls and missing values after everything else. Like
/// PostgreSQL, reversing it for a descending sort puts nulls first.
#[must_use]
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        _ => Ordering::Equal,
    }
}
