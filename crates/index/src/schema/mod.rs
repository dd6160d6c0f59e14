//! Static document schemas.
//!
//! Every document type stored by the engine is described once, at
//! registration, by a [`SchemaDescriptor`]. The descriptor lists the fields of
//! the type and how each one is stored (exact keyword, analyzed text, numeric,
//! nested document, opaque object, dynamic map). The backend mapping is
//! derived from it by [`mapping::type_mapping`] (or [`mapping::index_mapping`]
//! when child types share the index), and stored mappings are
//! compared against the derived one by [`diff::diff`].
//!
//! # Example
//!
//! ```
//! use helios_index::schema::{Analyzer, FieldSpec, Normalizer, SchemaDescriptor};
//!
//! let schema = SchemaDescriptor::builder("description")
//!     .field(FieldSpec::id("id"))
//!     .field(FieldSpec::boolean("active"))
//!     .field(
//!         FieldSpec::text("term", Analyzer::Tokenized)
//!             .with_text_variant("exact", Analyzer::Exact)
//!             .with_keyword_variant("sort", Some(Normalizer::LowercaseAscii)),
//!     )
//!     .script("deactivate", "ctx._source.active = false")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(schema.type_name, "description");
//! assert!(schema.script("deactivate").is_some());
//! ```

pub mod diff;
pub mod mapping;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

/// Index-time and search-time analyzers known to the bundled analysis settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Analyzer {
    /// Word tokens, lower-cased and ASCII-folded.
    Tokenized,
    /// Whole value as a single lower-cased, ASCII-folded token.
    Exact,
    /// Word tokens with English stemming.
    Stemming,
    /// Whitespace-separated tokens, case preserved.
    Whitespace,
    /// Word tokens, case preserved.
    CaseSensitive,
}

impl Analyzer {
    /// Returns the analyzer name used in mappings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Analyzer::Tokenized => "tokenized",
            Analyzer::Exact => "exact",
            Analyzer::Stemming => "stemming",
            Analyzer::Whitespace => "whitespace",
            Analyzer::CaseSensitive => "case_sensitive",
        }
    }
}

/// Keyword normalizers known to the bundled analysis settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalizer {
    /// Lower-cases the value.
    Lowercase,
    /// Lower-cases and ASCII-folds the value.
    LowercaseAscii,
}

impl Normalizer {
    /// Returns the normalizer name used in mappings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Normalizer::Lowercase => "lowercase",
            Normalizer::LowercaseAscii => "lowercase_ascii",
        }
    }
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// One searchable representation of a string field.
///
/// A field marked [`StorageKind::Analyzed`] has exactly one primary
/// representation and any number of named secondary ones, which end up in
/// the field's `fields` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldVariant {
    /// Full-text representation.
    Text {
        /// Analyzer applied at index time.
        analyzer: Analyzer,
        /// Analyzer applied to queries; defaults to `analyzer`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        search_analyzer: Option<Analyzer>,
    },
    /// Exact-match representation.
    Keyword {
        /// Normalizer applied before indexing and matching.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        normalizer: Option<Normalizer>,
        /// Unindexed keywords can still be sorted on.
        #[serde(default = "default_true", skip_serializing_if = "is_true")]
        indexed: bool,
    },
}

/// How a field is stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageKind {
    /// Document identity; handled by the backend's native key and never mapped.
    Id,
    /// Exact keyword (plain strings, enums, decimals).
    Keyword,
    /// 64-bit float.
    Double,
    /// 32-bit float.
    Float,
    /// 32-bit integer.
    Integer,
    /// 16-bit integer.
    Short,
    /// 64-bit integers and timestamps.
    Long,
    /// Boolean flag.
    Boolean,
    /// IPv4/IPv6 address.
    Ip,
    /// String with an explicit text or keyword representation.
    Analyzed {
        /// The representation mapped on the field itself.
        primary: FieldVariant,
    },
    /// Free-form map with dynamic sub-mapping.
    DynamicMap,
    /// Embedded document of another described type.
    Document {
        /// Schema of the embedded value.
        schema: Box<SchemaDescriptor>,
        /// Arrays are indexed as independent nested documents.
        #[serde(default)]
        nested: bool,
    },
    /// Stored in the source but neither indexed nor queryable.
    Opaque,
}

/// A single field of a [`SchemaDescriptor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Property name in the mapping and in stored documents.
    pub name: String,
    /// How the primary value is stored.
    #[serde(flatten)]
    pub kind: StorageKind,
    /// Secondary representations, keyed by sub-field name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variants: BTreeMap<String, FieldVariant>,
    /// For embedded documents, whether their content is indexed at all.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub indexed: bool,
}

impl FieldSpec {
    /// Creates a field with the given storage kind.
    pub fn new(name: impl Into<String>, kind: StorageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            variants: BTreeMap::new(),
            indexed: true,
        }
    }

    /// Document key; not mapped as a property.
    pub fn id(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Id)
    }

    /// Exact-match string.
    pub fn keyword(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Keyword)
    }

    /// 64-bit float.
    pub fn double(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Double)
    }

    /// 32-bit float.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Float)
    }

    /// 32-bit integer.
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Integer)
    }

    /// 16-bit integer.
    pub fn short(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Short)
    }

    /// 64-bit integer, also used for epoch timestamps.
    pub fn long(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Long)
    }

    /// Boolean flag.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Boolean)
    }

    /// IPv4 or IPv6 address.
    pub fn ip(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Ip)
    }

    /// Object whose keys are mapped as they appear.
    pub fn dynamic_map(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::DynamicMap)
    }

    /// Stored but never indexed.
    pub fn opaque(name: impl Into<String>) -> Self {
        Self::new(name, StorageKind::Opaque)
    }

    /// Analyzed text field.
    pub fn text(name: impl Into<String>, analyzer: Analyzer) -> Self {
        Self::new(
            name,
            StorageKind::Analyzed {
                primary: FieldVariant::Text {
                    analyzer,
                    search_analyzer: None,
                },
            },
        )
    }

    /// Keyword field with an optional normalizer.
    pub fn normalized_keyword(name: impl Into<String>, normalizer: Option<Normalizer>) -> Self {
        Self::new(
            name,
            StorageKind::Analyzed {
                primary: FieldVariant::Keyword {
                    normalizer,
                    indexed: true,
                },
            },
        )
    }

    /// Embedded document mapped as a flattened object.
    pub fn document(name: impl Into<String>, schema: SchemaDescriptor) -> Self {
        Self::new(
            name,
            StorageKind::Document {
                schema: Box::new(schema),
                nested: false,
            },
        )
    }

    /// Embedded document mapped with `nested` semantics.
    pub fn nested(name: impl Into<String>, schema: SchemaDescriptor) -> Self {
        Self::new(
            name,
            StorageKind::Document {
                schema: Box::new(schema),
                nested: true,
            },
        )
    }

    /// Sets a distinct search-time analyzer on a text primary.
    pub fn with_search_analyzer(mut self, search: Analyzer) -> Self {
        if let StorageKind::Analyzed {
            primary: FieldVariant::Text {
                search_analyzer, ..
            },
        } = &mut self.kind
        {
            *search_analyzer = Some(search);
        }
        self
    }

    /// Adds a text sub-field.
    pub fn with_text_variant(mut self, alias: impl Into<String>, analyzer: Analyzer) -> Self {
        self.variants.insert(
            alias.into(),
            FieldVariant::Text {
                analyzer,
                search_analyzer: None,
            },
        );
        self
    }

    /// Adds a keyword sub-field.
    pub fn with_keyword_variant(
        mut self,
        alias: impl Into<String>,
        normalizer: Option<Normalizer>,
    ) -> Self {
        self.variants.insert(
            alias.into(),
            FieldVariant::Keyword {
                normalizer,
                indexed: true,
            },
        );
        self
    }

    /// Adds an arbitrary sub-field.
    pub fn with_variant(mut self, alias: impl Into<String>, variant: FieldVariant) -> Self {
        self.variants.insert(alias.into(), variant);
        self
    }

    /// Marks the field as stored but not indexed.
    ///
    /// Applies to embedded documents and to keyword primaries.
    pub fn not_indexed(mut self) -> Self {
        self.indexed = false;
        if let StorageKind::Analyzed {
            primary: FieldVariant::Keyword { indexed, .. },
        } = &mut self.kind
        {
            *indexed = false;
        }
        self
    }
}

/// The static description of one document type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Registered type name.
    pub type_name: String,
    /// Types nested under a parent share the parent's physical index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<String>,
    /// Fields in declaration order.
    pub fields: Vec<FieldSpec>,
    /// Named update scripts usable by filtered bulk updates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
}

impl SchemaDescriptor {
    /// Starts building a descriptor for the given type.
    pub fn builder(type_name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            descriptor: SchemaDescriptor {
                type_name: type_name.into(),
                parent_type: None,
                fields: Vec::new(),
                scripts: BTreeMap::new(),
            },
        }
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Looks up a named update script.
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }

    /// The type whose physical index holds documents of this type.
    pub fn index_type(&self) -> &str {
        self.parent_type.as_deref().unwrap_or(&self.type_name)
    }

    /// Checks the descriptor against the mapping derivation rules.
    pub fn validate(&self) -> IndexResult<()> {
        let invalid = |message: String| IndexError::InvalidSchema {
            doc_type: self.type_name.clone(),
            message,
        };

        if !is_identifier(&self.type_name) {
            return Err(invalid(format!(
                "type name '{}' must be a non-empty identifier",
                self.type_name
            )));
        }

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if !is_identifier(&field.name) {
                return Err(invalid(format!(
                    "field name '{}' must be a non-empty identifier",
                    field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(format!("duplicate field '{}'", field.name)));
            }
            if !field.variants.is_empty()
                && !matches!(field.kind, StorageKind::Analyzed { .. })
            {
                return Err(invalid(format!(
                    "only analyzed string fields can declare sub-fields, found them on '{}'",
                    field.name
                )));
            }
            if let Some(alias) = field.variants.keys().find(|a| !is_identifier(a)) {
                return Err(invalid(format!(
                    "sub-field '{}' of '{}' must be an identifier",
                    alias, field.name
                )));
            }
            if let StorageKind::Document { schema, .. } = &field.kind {
                schema.validate()?;
            }
        }

        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Builder for [`SchemaDescriptor`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    descriptor: SchemaDescriptor,
}

impl SchemaBuilder {
    /// Stores this type in its parent's physical index.
    pub fn parent(mut self, parent_type: impl Into<String>) -> Self {
        self.descriptor.parent_type = Some(parent_type.into());
        self
    }

    /// Appends a field.
    pub fn field(mut self, field: FieldSpec) -> Self {
        self.descriptor.fields.push(field);
        self
    }

    /// Declares a named painless update script.
    pub fn script(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.descriptor.scripts.insert(name.into(), source.into());
        self
    }

    /// Validates and returns the descriptor.
    pub fn build(self) -> IndexResult<SchemaDescriptor> {
        self.descriptor.validate()?;
        Ok(self.descriptor)
    }
}

/// A Rust type that is stored as a document of a described type.
pub trait Document: Serialize {
    /// The registered type name.
    const TYPE: &'static str;

    /// Builds the type's schema descriptor.
    fn schema() -> IndexResult<SchemaDescriptor>;
}

/// The set of registered document types.
#[derive(Debug, Clone, Default)]
pub struct Mappings {
    by_type: BTreeMap<String, Arc<SchemaDescriptor>>,
}

impl Mappings {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from descriptors, validating each one.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = SchemaDescriptor>,
    ) -> IndexResult<Self> {
        let mut mappings = Self::new();
        for descriptor in descriptors {
            mappings.register(descriptor)?;
        }
        Ok(mappings)
    }

    /// Registers a descriptor, replacing any previous one of the same type.
    pub fn register(&mut self, descriptor: SchemaDescriptor) -> IndexResult<()> {
        descriptor.validate()?;
        self.by_type
            .insert(descriptor.type_name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// Registers the descriptor of a [`Document`] type.
    pub fn register_document<D: Document>(&mut self) -> IndexResult<()> {
        self.register(D::schema()?)
    }

    /// Returns the descriptor of a registered type.
    pub fn get(&self, doc_type: &str) -> IndexResult<&Arc<SchemaDescriptor>> {
        self.by_type.get(doc_type).ok_or_else(|| IndexError::UnknownType {
            doc_type: doc_type.to_string(),
        })
    }

    /// Whether `doc_type` is registered.
    pub fn contains(&self, doc_type: &str) -> bool {
        self.by_type.contains_key(doc_type)
    }

    /// Descriptors ordered by type name.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SchemaDescriptor>> {
        self.by_type.values()
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    /// Whether no type is registered.
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
