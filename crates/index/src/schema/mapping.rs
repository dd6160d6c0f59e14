//! Schema-to-mapping derivation.
//!
//! Pure functions turning a [`SchemaDescriptor`] into the mapping tree sent to
//! the backend on index creation and compared against the stored mapping on
//! every start.
//!
//! Defaults the backend does not echo back (`index: true`, `enabled: true`,
//! `type: object` on embedded documents) are never emitted, otherwise every
//! start would see a spurious difference against the stored mapping.

use serde_json::{Map, Value, json};

use super::{FieldSpec, FieldVariant, SchemaDescriptor, StorageKind};

/// Derives the complete type mapping for a descriptor.
///
/// On top of the field properties, the type mapping turns off date and numeric
/// detection and maps any dynamically added string to `keyword`.
pub fn type_mapping(schema: &SchemaDescriptor) -> Value {
    let mut mapping = Map::new();
    mapping.insert("date_detection".to_string(), Value::Bool(false));
    mapping.insert("numeric_detection".to_string(), Value::Bool(false));
    mapping.insert(
        "dynamic_templates".to_string(),
        json!([{
            "strings_as_keywords": {
                "match_mapping_type": "string",
                "mapping": { "type": "keyword" }
            }
        }]),
    );
    mapping.insert("properties".to_string(), properties(schema));
    Value::Object(mapping)
}

/// Derives the mapping of a physical index shared by a root type and the
/// child types stored alongside it.
///
/// Child properties are merged into the root's `properties`. A name the root
/// already maps keeps the root's mapping.
pub fn index_mapping<'a, I>(root: &SchemaDescriptor, children: I) -> Value
where
    I: IntoIterator<Item = &'a SchemaDescriptor>,
{
    let mut mapping = type_mapping(root);
    if let Some(props) = mapping.get_mut("properties").and_then(Value::as_object_mut) {
        for child in children {
            if let Value::Object(child_props) = properties(child) {
                for (name, prop) in child_props {
                    props.entry(name).or_insert(prop);
                }
            }
        }
    }
    mapping
}

/// Derives the `properties` object for a descriptor.
pub fn properties(schema: &SchemaDescriptor) -> Value {
    let mut props = Map::new();
    for field in &schema.fields {
        if let Some(prop) = field_mapping(field) {
            props.insert(field.name.clone(), prop);
        }
    }
    Value::Object(props)
}

fn field_mapping(field: &FieldSpec) -> Option<Value> {
    let prop = match &field.kind {
        StorageKind::Id => return None,
        StorageKind::Keyword => json!({ "type": "keyword" }),
        StorageKind::Double => json!({ "type": "double" }),
        StorageKind::Float => json!({ "type": "float" }),
        StorageKind::Integer => json!({ "type": "integer" }),
        StorageKind::Short => json!({ "type": "short" }),
        StorageKind::Long => json!({ "type": "long" }),
        StorageKind::Boolean => json!({ "type": "boolean" }),
        StorageKind::Ip => json!({ "type": "ip" }),
        StorageKind::DynamicMap => json!({ "type": "object", "dynamic": "true" }),
        StorageKind::Opaque => json!({ "type": "object", "enabled": false }),
        StorageKind::Document { schema, nested } => {
            let mut prop = Map::new();
            if *nested {
                prop.insert("type".to_string(), json!("nested"));
            }
            if !field.indexed {
                prop.insert("enabled".to_string(), Value::Bool(false));
            }
            prop.insert("properties".to_string(), properties(schema));
            Value::Object(prop)
        }
        StorageKind::Analyzed { primary } => {
            let mut prop = variant_mapping(primary, true);
            if !field.variants.is_empty() {
                let fields: Map<String, Value> = field
                    .variants
                    .iter()
                    .map(|(alias, variant)| (alias.clone(), Value::Object(variant_mapping(variant, false))))
                    .collect();
                prop.insert("fields".to_string(), Value::Object(fields));
            }
            Value::Object(prop)
        }
    };
    Some(prop)
}

fn variant_mapping(variant: &FieldVariant, primary: bool) -> Map<String, Value> {
    let mut prop = Map::new();
    match variant {
        FieldVariant::Text {
            analyzer,
            search_analyzer,
        } => {
            prop.insert("type".to_string(), json!("text"));
            prop.insert("analyzer".to_string(), json!(analyzer.as_str()));
            if let Some(search) = search_analyzer.filter(|s| s != analyzer) {
                prop.insert("search_analyzer".to_string(), json!(search.as_str()));
            }
        }
        FieldVariant::Keyword {
            normalizer,
            indexed,
        } => {
            prop.insert("type".to_string(), json!("keyword"));
            if let Some(normalizer) = normalizer {
                prop.insert("normalizer".to_string(), json!(normalizer.as_str()));
            }
            if !indexed {
                prop.insert("index".to_string(), Value::Bool(false));
                // sub-fields keep doc values so they stay sortable
                if primary {
                    prop.insert("doc_values".to_string(), Value::Bool(false));
                }
            }
        }
    }
    prop
}
