//! Identifier codec and lookup fingerprinting.
//!
//! An identifier names one record of one type: `<namespace>.<model>.<pk>`. A fingerprint names a lookup: it is the
//! SHA-256 digest of a canonical rendering of the lookup's filter arguments, so that the same logical lookup always
//! maps to the same cache key no matter how the caller has assembled its arguments.

use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::Error;
use crate::error::Result;
use crate::types::Criteria;
use crate::types::FilterValue;
use crate::types::PrimaryKey;

static TYPE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+\.[A-Za-z0-9_]+$").expect("type name pattern"));
static PK_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("pk pattern"));
static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_]+\.[A-Za-z0-9_]+)\.([A-Za-z0-9_-]+)$").expect("identifier pattern")
});

/// Record type name, `<namespace>.<model>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument("type name is empty".into()));
        }
        if !TYPE_NAME_RE.is_match(&name) {
            return Err(Error::InvalidArgument(format!(
                "type name '{name}' must have the form <namespace>.<model>"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TypeName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TypeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonical name of a single record. Equal `(type, pk)` pairs always produce byte-identical identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Validates a pre-encoded identifier string.
    pub fn parse(s: &str) -> Result<Self> {
        if is_identifier(s) {
            Ok(Self(s.to_string()))
        }
        else {
            Err(Error::MalformedIdentifier(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn type_name(&self) -> TypeName {
        // The grammar was checked on construction; the last dot always separates the key.
        let (type_name, _) = self.0.rsplit_once('.').unwrap_or((self.0.as_str(), ""));
        TypeName(type_name.to_string())
    }

    /// The primary key as rendered into the identifier.
    pub fn key_segment(&self) -> &str {
        self.0.rsplit_once('.').map_or(self.0.as_str(), |(_, pk)| pk)
    }

    /// Best guess at the primary key: see [`PrimaryKey::from_segment`]. A record store with string keys that look
    /// like integers recovers its keys with
    /// [`RecordStore::primary_key_from_segment`](crate::traits::RecordStore::primary_key_from_segment) instead.
    pub fn primary_key(&self) -> PrimaryKey {
        PrimaryKey::from_segment(self.key_segment())
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identifier {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

/// Builds the identifier of the record of type `type_name` with primary key `pk`.
pub fn encode(type_name: &str, pk: &PrimaryKey) -> Result<Identifier> {
    let type_name = TypeName::new(type_name)?;
    encode_typed(&type_name, pk)
}

pub(crate) fn encode_typed(type_name: &TypeName, pk: &PrimaryKey) -> Result<Identifier> {
    let segment = pk.to_string();
    if !PK_SEGMENT_RE.is_match(&segment) {
        return Err(Error::InvalidArgument(format!(
            "primary key '{segment}' of {type_name} cannot be part of an identifier"
        )));
    }
    Ok(Identifier(format!("{type_name}.{segment}")))
}

/// Splits an identifier into its type name and primary key.
pub fn decode(identifier: &str) -> Result<(TypeName, PrimaryKey)> {
    let captures = IDENTIFIER_RE
        .captures(identifier)
        .ok_or_else(|| Error::MalformedIdentifier(identifier.to_string()))?;
    Ok((
        TypeName(captures[1].to_string()),
        PrimaryKey::from_segment(&captures[2]),
    ))
}

/// Cheap format probe telling pre-encoded identifiers apart from anything else.
#[inline]
pub fn is_identifier(s: &str) -> bool {
    IDENTIFIER_RE.is_match(s)
}

/// SHA-256 fingerprint, in hex, of the canonical form of the criteria.
pub fn fingerprint(criteria: &Criteria) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_criteria(criteria).as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable textual form of the criteria: arguments sorted by name, values canonicalized recursively.
pub fn canonical_criteria(criteria: &Criteria) -> String {
    let mut args = criteria
        .iter()
        .map(|(name, value)| format!("({name:?}, {})", canonical(value)))
        .collect::<Vec<_>>();
    args.sort();
    format!("({})", args.join(", "))
}

fn canonical(value: &FilterValue) -> String {
    match value {
        FilterValue::Null => "None".to_string(),
        FilterValue::Bool(b) => String::from(if *b { "True" } else { "False" }),
        // Scalars stringify as they are: 1 and "1" are the same lookup argument.
        FilterValue::Int(i) => format!("{:?}", i.to_string()),
        FilterValue::Float(x) => format!("{:?}", format!("{x:?}")),
        FilterValue::Str(s) => format!("{s:?}"),
        FilterValue::Named(name) => format!("{name:?}"),
        FilterValue::Ref(id) => format!("{:?}", id.as_str()),
        FilterValue::Seq(items) => {
            let mut out = String::from("(");
            for item in items {
                out.push_str(&canonical(item));
                out.push_str(", ");
            }
            out.push(')');
            out
        }
        FilterValue::Set(items) => {
            let mut items = items.iter().map(canonical).collect::<Vec<_>>();
            items.sort();
            items.dedup();
            format!("{{{}}}", items.join(", "))
        }
        FilterValue::Map(pairs) => {
            let mut pairs = pairs
                .iter()
                .map(|(k, v)| (canonical(k), canonical(v)))
                .collect::<Vec<_>>();
            pairs.sort();
            let body = pairs
                .into_iter()
                .map(|(k, v)| format!("({k}, {v})"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("[{body}]")
        }
    }
}

/// Builds every backend key the cache uses. The prefix separates deployments that share a backend.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn row(&self, id: &Identifier) -> String {
        format!("{}:row:{id}", self.prefix)
    }

    pub fn lookup(&self, type_name: &TypeName, fingerprint: &str) -> String {
        format!("{}:lookup:{type_name}.{fingerprint}", self.prefix)
    }

    pub fn fanout(&self, id: &Identifier) -> String {
        format!("{}:fanout:{id}", self.prefix)
    }

    pub fn changed(&self, id: &Identifier) -> String {
        format!("{}:changed:{id}", self.prefix)
    }

    pub fn negatives(&self, type_name: &TypeName) -> String {
        format!("{}:negatives:{type_name}", self.prefix)
    }
}
