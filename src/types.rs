use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::codec::Identifier;
use crate::codec::TypeName;
use crate::error::Error;
use crate::error::Result;

/// Filter keys that name the primary key itself. A lookup consisting of exactly one of these takes the fast path.
pub const PK_LOOKUP_KEYS: [&str; 4] = ["id", "id__exact", "pk", "pk__exact"];

/// Primary key of a record. Opaque to the cache: it is only ever rendered into identifiers and compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    Int(i64),
    Str(String),
}

impl PrimaryKey {
    /// Reverse of the identifier rendering. Only a segment an integer key renders to exactly becomes an integer key:
    /// `"501"` does, `"00501"` and `"+5"` stay strings.
    pub fn from_segment(segment: &str) -> Self {
        match segment.parse::<i64>() {
            Ok(i) if i.to_string() == segment => Self::Int(i),
            _ => Self::Str(segment.to_string()),
        }
    }
}

impl Display for PrimaryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            // Whitespace never makes it into an identifier.
            Self::Str(s) => s.split_whitespace().try_for_each(|part| f.write_str(part)),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PrimaryKey {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for PrimaryKey {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// A single filter argument value.
///
/// Anything a caller may pass as a lookup argument has a variant here with a deterministic canonical form; see
/// [`fingerprint`](crate::codec::fingerprint).
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Ordered sequence; element order is significant.
    Seq(Vec<FilterValue>),
    /// Unordered collection; canonicalized in sorted order.
    Set(Vec<FilterValue>),
    Map(Vec<(FilterValue, FilterValue)>),
    /// A reference to a type or a function. Only its declared name matters, so two distinct callables sharing a name
    /// produce the same fingerprint.
    Named(String),
    /// A reference to another record.
    Ref(Identifier),
}

impl FilterValue {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn set<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FilterValue>,
    {
        Self::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<FilterValue>,
        V: Into<FilterValue>,
    {
        Self::Map(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    fn as_primary_key(&self) -> Option<PrimaryKey> {
        match self {
            Self::Int(i) => Some(PrimaryKey::Int(*i)),
            Self::Str(s) => Some(PrimaryKey::Str(s.clone())),
            Self::Ref(id) => Some(id.primary_key()),
            _ => None,
        }
    }
}

impl Display for FilterValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Named(n) => write!(f, "<{n}>"),
            Self::Ref(id) => write!(f, "@{id}"),
            Self::Seq(items) | Self::Set(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(pairs) => {
                write!(f, "{{")?;
                for (idx, (k, v)) in pairs.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

macro_rules! filter_value_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for FilterValue {
                fn from(value: $ty) -> Self {
                    Self::$variant(value.into())
                }
            }
        )+
    };
}

filter_value_from!(
    bool => Bool,
    i64 => Int,
    i32 => Int,
    u32 => Int,
    f64 => Float,
    String => Str,
    &str => Str,
    Identifier => Ref,
);

impl From<PrimaryKey> for FilterValue {
    fn from(value: PrimaryKey) -> Self {
        match value {
            PrimaryKey::Int(i) => Self::Int(i),
            PrimaryKey::Str(s) => Self::Str(s),
        }
    }
}

impl<T> From<Option<T>> for FilterValue
where
    T: Into<FilterValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<T> From<Vec<T>> for FilterValue
where
    T: Into<FilterValue>,
{
    fn from(value: Vec<T>) -> Self {
        Self::Seq(value.into_iter().map(Into::into).collect())
    }
}

/// Named filter arguments of a lookup. Keeps insertion order; the fingerprint does not depend on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    args: Vec<(String, FilterValue)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Criteria of a plain primary key lookup.
    pub fn pk(pk: impl Into<PrimaryKey>) -> Self {
        Self::new().with("pk", pk.into())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets an argument, replacing an existing one of the same name in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FilterValue>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.args.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        }
        else {
            self.args.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&FilterValue> {
        self.args.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.args.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Combines a relation's implicit constraint with these criteria. Explicit criteria win on a name clash.
    pub fn merged_over(&self, constraint: &Criteria) -> Criteria {
        let mut merged = constraint.clone();
        for (name, value) in &self.args {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    /// The primary key when these criteria are exactly a primary key lookup. Any additional argument disqualifies the
    /// fast path.
    pub fn primary_key(&self) -> Result<Option<PrimaryKey>> {
        let [(name, value)] = self.args.as_slice()
        else {
            return Ok(None);
        };

        if !PK_LOOKUP_KEYS.contains(&name.as_str()) {
            return Ok(None);
        }

        value
            .as_primary_key()
            .map(Some)
            .ok_or_else(|| Error::InvalidArgument(format!("'{name}' cannot be {value}")))
    }
}

impl Display for Criteria {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (idx, (name, value)) in self.args.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, "}}")
    }
}

impl<K, V> FromIterator<(K, V)> for Criteria
where
    K: Into<String>,
    V: Into<FilterValue>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut criteria = Criteria::new();
        for (name, value) in iter {
            criteria.insert(name, value);
        }
        criteria
    }
}

/// Anything a caller may name a record by. Resolved once, at the API boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupSubject {
    Identifier(Identifier),
    Key(TypeName, PrimaryKey),
    Filter(TypeName, Criteria),
}

impl Display for LookupSubject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identifier(id) => write!(f, "{id}"),
            Self::Key(type_name, pk) => write!(f, "{type_name}(pk={pk})"),
            Self::Filter(type_name, criteria) => write!(f, "{type_name}{criteria}"),
        }
    }
}

impl From<Identifier> for LookupSubject {
    fn from(id: Identifier) -> Self {
        Self::Identifier(id)
    }
}

/// What the cache holds under a row key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CachedRow<R> {
    Record(R),
    NotFound,
}

/// What the cache holds under a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupEntry {
    Resolved(PrimaryKey),
    NotFound,
}

/// Outcome of consulting the lookup index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(PrimaryKey),
    /// The lookup is known to match nothing.
    NotFound,
    /// Nothing is cached for the lookup; the record store must be asked.
    Unknown,
}

/// Result of [`RecordStore::save`](crate::traits::RecordStore::save).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Saved {
    Created,
    Updated,
}

/// Change notifications delivered to a [`ChangeListener`](crate::traits::ChangeListener).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    BeforeDelete,
    AfterDelete,
    AfterSave { created: bool },
    RelationChanged,
}

impl Display for ChangeEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeforeDelete => write!(f, "before-delete"),
            Self::AfterDelete => write!(f, "after-delete"),
            Self::AfterSave { created: true } => write!(f, "after-create"),
            Self::AfterSave { created: false } => write!(f, "after-update"),
            Self::RelationChanged => write!(f, "relation-changed"),
        }
    }
}
