//! Relational shape the sync subsystem needs to know about.
//!
//! Only the fields required for synchronisation are described here: the root
//! tables carrying `search_content`, the relations loaded into their documents,
//! and the hops a non-root change walks to reach its owning roots. Table and
//! column names end up interpolated into SQL, so every identifier is checked
//! at registration time (see [`is_identifier`]).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").unwrap());

/// True when `s` is a plain lower-case SQL identifier that is safe to quote.
pub fn is_identifier(s: &str) -> bool {
    IDENTIFIER_RE.is_match(s)
}

/// How one table reaches another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    /// Target rows carry `column` pointing at the source row's id (one-to-many).
    ForeignKey { column: String },
    /// The source row carries `column` pointing at the target row's id (many-to-one).
    Reference { column: String },
    /// Rows are linked through an association table (many-to-many).
    Through {
        table: String,
        source_column: String,
        target_column: String,
    },
}

impl Link {
    /// Whether following this link from one row can yield several rows.
    pub fn is_many(&self) -> bool {
        !matches!(self, Link::Reference { .. })
    }

    pub(crate) fn identifiers(&self) -> Vec<&str> {
        match self {
            Link::ForeignKey { column } | Link::Reference { column } => vec![column.as_str()],
            Link::Through {
                table,
                source_column,
                target_column,
            } => vec![
                table.as_str(),
                source_column.as_str(),
                target_column.as_str(),
            ],
        }
    }
}

/// One step of a dependency path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationHop {
    /// Entity type reached by this hop.
    pub target: String,
    /// Defaults to `target` when omitted.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub link: Link,
}

impl RelationHop {
    pub fn new(target: impl Into<String>, link: Link) -> Self {
        Self {
            target: target.into(),
            table: None,
            link,
        }
    }

    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.target)
    }
}

/// Ordered hops from a non-root entity type to the root type it invalidates,
/// e.g. `country → region → subregion → drink → item`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyPath {
    pub entity_type: String,
    #[serde(default)]
    pub table: Option<String>,
    pub hops: Vec<RelationHop>,
}

impl DependencyPath {
    pub fn new(entity_type: impl Into<String>, hops: Vec<RelationHop>) -> Self {
        Self {
            entity_type: entity_type.into(),
            table: None,
            hops,
        }
    }

    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.entity_type)
    }

    /// Entity type the path terminates at.
    pub fn root_type(&self) -> Option<&str> {
        self.hops.last().map(|hop| hop.target.as_str())
    }

    /// `region→subregion→drink→item` style rendering for logs.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.entity_type.as_str()];
        parts.extend(self.hops.iter().map(|hop| hop.target.as_str()));
        parts.join("→")
    }
}

/// Ranking function a root type is searched with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingStrategy {
    /// pg_trgm word similarity over `search_content`.
    #[default]
    Trigram,
    /// `ts_rank` over the generated `search_vector`.
    FullText,
}

/// A relation loaded into a root document (recursive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Key the related row(s) appear under in the document.
    pub name: String,
    pub table: String,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub link: Link,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

/// A root (indexed) entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootEntity {
    pub entity_type: String,
    #[serde(default)]
    pub table: Option<String>,
    /// External engine index; defaults to `entity_type`.
    #[serde(default)]
    pub index_name: Option<String>,
    #[serde(default)]
    pub strategy: RankingStrategy,
    #[serde(default)]
    pub relations: Vec<Relation>,
    /// JSON Schema every outbox payload of this type must satisfy.
    #[serde(default)]
    pub document_schema: Option<serde_json::Value>,
    /// Document keys excluded from `search_content` (ids of images, audit columns...).
    #[serde(default)]
    pub skip_keys: Vec<String>,
    /// Keys the external engine searches; empty means "all".
    #[serde(default)]
    pub searchable_attributes: Vec<String>,
}

impl RootEntity {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            table: None,
            index_name: None,
            strategy: RankingStrategy::default(),
            relations: Vec::new(),
            document_schema: None,
            skip_keys: Vec::new(),
            searchable_attributes: Vec::new(),
        }
    }

    pub fn with_strategy(mut self, strategy: RankingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn with_document_schema(mut self, schema: serde_json::Value) -> Self {
        self.document_schema = Some(schema);
        self
    }

    pub fn with_skip_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.entity_type)
    }

    pub fn index_name(&self) -> &str {
        self.index_name.as_deref().unwrap_or(&self.entity_type)
    }
}
