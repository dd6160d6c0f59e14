//! Index lifecycle, mapping migration and settings updates.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use helios_index::schema::mapping::type_mapping;
use helios_index::schema::{Analyzer, FieldSpec, SchemaDescriptor};
use helios_index::settings::{
    COMMIT_WATERMARK_HIGH, COMMIT_WATERMARK_LOW, NUMBER_OF_SHARDS, RESULT_WINDOW,
};
use helios_index::{
    BackendError, BulkUpdate, Filter, IndexAdmin, IndexBackend, IndexConfig, IndexError,
    Mappings, MigrationOutcome,
};
use serde_json::{Value, json};

use common::{Call, MockBackend, admin, admin_with, concept_schema};

fn updates(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn single_type_admin(backend: &Arc<MockBackend>, schema: SchemaDescriptor) -> IndexAdmin {
    let dyn_backend: Arc<dyn IndexBackend> = backend.clone();
    IndexAdmin::new(
        dyn_backend,
        IndexConfig::new("snomed"),
        Mappings::from_descriptors([schema]).unwrap(),
    )
}

#[tokio::test]
async fn test_create_new_indices() {
    let backend = MockBackend::new();
    let admin = admin(&backend);

    let report = admin.create().await.unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes["concept"], MigrationOutcome::Created);
    assert_eq!(report.outcomes["description"], MigrationOutcome::Created);
    assert!(!report.outcomes.contains_key("relationship"));

    let created: Vec<(String, Value)> = backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::CreateIndex {
                index, settings, ..
            } => Some((index, settings)),
            _ => None,
        })
        .collect();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].0, "snomed-concept");
    assert_eq!(created[1].0, "snomed-description");
    assert_eq!(created[0].1["number_of_replicas"], "0");
    assert_eq!(created[0].1["refresh_interval"], "-1");
    assert!(created[0].1["analysis"]["analyzer"]["tokenized"].is_object());

    assert!(backend.calls().contains(&Call::ClusterHealth(vec![
        "snomed-concept".to_string(),
        "snomed-description".to_string()
    ])));
    assert!(admin.exists().await.unwrap());
}

#[tokio::test]
async fn test_create_twice_is_unchanged() {
    let backend = MockBackend::new();
    let admin = admin(&backend);
    admin.create().await.unwrap();
    backend.clear_calls();

    let report = admin.create().await.unwrap();

    assert!(
        report
            .outcomes
            .values()
            .all(|o| *o == MigrationOutcome::Unchanged)
    );
    assert_eq!(
        backend.count(|c| matches!(
            c,
            Call::PutMapping { .. } | Call::CreateIndex { .. } | Call::ClusterHealth(_)
        )),
        0
    );
}

#[tokio::test]
async fn test_added_field_is_applied_in_place() {
    let backend = MockBackend::new();
    let old = SchemaDescriptor::builder("concept")
        .field(FieldSpec::id("id"))
        .field(FieldSpec::boolean("active"))
        .build()
        .unwrap();
    backend.with_index("snomed-concept", type_mapping(&old));
    let admin = single_type_admin(&backend, concept_schema());

    let report = admin.create().await.unwrap();

    match &report.outcomes["concept"] {
        MigrationOutcome::Updated { changes, reindexed } => {
            assert!(changes.contains("properties/module_id"));
            assert!(!reindexed);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(backend.count(|c| matches!(c, Call::PutMapping { .. })), 1);
    assert_eq!(backend.count(|c| matches!(c, Call::UpdateByQuery(_))), 0);
    assert_eq!(
        backend.stored_mapping("snomed-concept"),
        Some(type_mapping(&concept_schema()))
    );
}

#[tokio::test]
async fn test_replaced_field_is_reported_and_not_applied() {
    let backend = MockBackend::new();
    let old = SchemaDescriptor::builder("concept")
        .field(FieldSpec::id("id"))
        .field(FieldSpec::boolean("active"))
        .field(FieldSpec::long("module_id"))
        .build()
        .unwrap();
    backend.with_index("snomed-concept", type_mapping(&old));
    let admin = single_type_admin(&backend, concept_schema());

    let report = admin.create().await.unwrap();

    let incompatible: Vec<_> = report.incompatible().collect();
    assert_eq!(incompatible.len(), 1);
    assert_eq!(incompatible[0].0, "concept");
    assert!(
        incompatible[0]
            .1
            .iter()
            .any(|path| path.starts_with("properties/module_id"))
    );
    assert_eq!(backend.count(|c| matches!(c, Call::PutMapping { .. })), 0);
    assert_eq!(
        backend.stored_mapping("snomed-concept"),
        Some(type_mapping(&old))
    );
}

#[tokio::test]
async fn test_new_sub_field_migrates_stored_documents() {
    let backend = MockBackend::new();
    let old = SchemaDescriptor::builder("description")
        .field(FieldSpec::id("id"))
        .field(FieldSpec::text("term", Analyzer::Tokenized))
        .build()
        .unwrap();
    let new = SchemaDescriptor::builder("description")
        .field(FieldSpec::id("id"))
        .field(FieldSpec::text("term", Analyzer::Tokenized).with_keyword_variant("exact", None))
        .build()
        .unwrap();
    backend.with_index("snomed-description", type_mapping(&old));
    let admin = single_type_admin(&backend, new);

    let report = admin.create().await.unwrap();

    assert!(matches!(
        report.outcomes["description"],
        MigrationOutcome::Updated {
            reindexed: true,
            ..
        }
    ));
    let migrations: Vec<_> = backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::UpdateByQuery(request) => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(migrations.len(), 1);
    assert_eq!(migrations[0].index, "snomed-description");
    assert_eq!(migrations[0].query, json!({ "match_all": {} }));
    assert!(migrations[0].script.is_none());
    assert!(report.refreshed.contains("snomed-description"));
    assert_eq!(
        backend.refresh_calls(),
        vec![vec!["snomed-description".to_string()]]
    );
}

#[tokio::test]
async fn test_child_type_fields_are_mapped_in_parent_index() {
    let backend = MockBackend::new();
    let admin = admin(&backend);

    admin.create().await.unwrap();

    let mapping = backend.stored_mapping("snomed-concept").unwrap();
    assert_eq!(
        mapping["properties"]["destination_id"],
        json!({ "type": "keyword" })
    );
    assert_eq!(
        mapping["properties"]["module_id"],
        json!({ "type": "keyword" })
    );
    assert!(
        backend.stored_mapping("snomed-description").unwrap()["properties"]
            .get("destination_id")
            .is_none()
    );
}

#[tokio::test]
async fn test_new_child_type_field_migrates_parent_index() {
    let backend = MockBackend::new();
    backend.with_index("snomed-concept", type_mapping(&concept_schema()));
    let admin = admin(&backend);

    let report = admin.create().await.unwrap();

    match &report.outcomes["concept"] {
        MigrationOutcome::Updated { changes, reindexed } => {
            assert!(changes.contains("properties/destination_id"));
            assert!(!reindexed);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.outcomes["description"], MigrationOutcome::Created);
    assert!(backend.calls().iter().any(|c| matches!(
        c,
        Call::PutMapping { index, mapping }
            if index == "snomed-concept"
                && mapping["properties"]["destination_id"] == json!({ "type": "keyword" })
    )));
}

#[tokio::test]
async fn test_new_search_analyzer_is_applied_in_place() {
    let backend = MockBackend::new();
    let old = SchemaDescriptor::builder("description")
        .field(FieldSpec::id("id"))
        .field(FieldSpec::text("term", Analyzer::Tokenized))
        .build()
        .unwrap();
    let new = SchemaDescriptor::builder("description")
        .field(FieldSpec::id("id"))
        .field(FieldSpec::text("term", Analyzer::Tokenized).with_search_analyzer(Analyzer::Stemming))
        .build()
        .unwrap();
    backend.with_index("snomed-description", type_mapping(&old));
    let admin = single_type_admin(&backend, new.clone());

    let report = admin.create().await.unwrap();

    match &report.outcomes["description"] {
        MigrationOutcome::Updated { changes, reindexed } => {
            assert!(changes.contains("properties/term/search_analyzer"));
            assert!(!reindexed);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(report.incompatible().count(), 0);
    assert_eq!(backend.count(|c| matches!(c, Call::PutMapping { .. })), 1);
    assert_eq!(backend.count(|c| matches!(c, Call::UpdateByQuery(_))), 0);
    assert_eq!(
        backend.stored_mapping("snomed-description"),
        Some(type_mapping(&new))
    );
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_fails_create() {
    let backend = MockBackend::new();
    backend.health_timeouts(usize::MAX);
    let admin = admin(&backend);

    let err = admin.create().await.unwrap_err();

    assert!(matches!(
        err,
        IndexError::BackendUnavailable(BackendError::ReadinessTimeout { .. })
    ));
    // 300s deadline, 30s per poll
    assert_eq!(backend.count(|c| matches!(c, Call::ClusterHealth(_))), 10);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_polls_until_ready() {
    let backend = MockBackend::new();
    backend.health_timeouts(2);
    let admin = admin(&backend);

    admin.create().await.unwrap();

    assert_eq!(backend.count(|c| matches!(c, Call::ClusterHealth(_))), 3);
}

#[tokio::test]
async fn test_unacknowledged_create_fails() {
    let backend = MockBackend::new();
    backend.refuse_acknowledgement();
    let admin = admin(&backend);

    let err = admin.create().await.unwrap_err();

    assert!(matches!(
        err,
        IndexError::Unacknowledged { index, .. } if index == "snomed-concept"
    ));
}

#[tokio::test]
async fn test_delete_only_when_indices_exist() {
    let backend = MockBackend::new();
    let admin = admin(&backend);

    admin.delete().await.unwrap();
    assert_eq!(backend.count(|c| matches!(c, Call::DeleteIndices(_))), 0);

    admin.create().await.unwrap();
    admin.delete().await.unwrap();

    assert!(backend.calls().contains(&Call::DeleteIndices(vec![
        "snomed-concept".to_string(),
        "snomed-description".to_string(),
    ])));
    assert!(!backend.has_index("snomed-concept"));
    assert!(!admin.exists().await.unwrap());
}

#[tokio::test]
async fn test_delete_keeps_indices_of_other_stores() {
    let backend = MockBackend::new();
    backend.with_index("snomedct-concept", json!({ "properties": {} }));
    backend.with_index("snomed.archive-concept", json!({ "properties": {} }));
    let admin = admin(&backend);

    admin.create().await.unwrap();
    admin.delete().await.unwrap();

    assert!(!backend.has_index("snomed-concept"));
    assert!(!backend.has_index("snomed-description"));
    assert!(backend.has_index("snomedct-concept"));
    assert!(backend.has_index("snomed.archive-concept"));
}

#[tokio::test]
async fn test_delete_skips_missing_indices() {
    let backend = MockBackend::new();
    let admin = admin(&backend);
    admin.create().await.unwrap();
    backend.clear_calls();
    admin
        .backend()
        .delete_indices(&["snomed-description".to_string()])
        .await
        .unwrap();

    admin.delete().await.unwrap();

    assert_eq!(backend.count(|c| matches!(c, Call::DeleteIndices(_))), 2);
    assert!(
        backend
            .calls()
            .contains(&Call::DeleteIndices(vec!["snomed-concept".to_string()]))
    );
    assert!(!backend.has_index("snomed-concept"));
}

#[tokio::test]
async fn test_prefix_and_case_in_index_names() {
    let backend = MockBackend::new();
    let admin = admin_with(&backend, IndexConfig::new("SNOMED").with_prefix("Prod"));

    assert_eq!(admin.name(), "snomed");
    assert_eq!(
        admin.indices(),
        vec![
            "prod.snomed-concept".to_string(),
            "prod.snomed-description".to_string()
        ]
    );
    assert_eq!(
        admin.physical_index("relationship").unwrap(),
        "prod.snomed-concept"
    );
}

#[tokio::test]
async fn test_clear_empty_list_makes_no_calls() {
    let backend = MockBackend::new();
    let admin = admin(&backend);

    admin.clear(&[]).await.unwrap();

    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_clear_deletes_all_documents_and_refreshes() {
    let backend = MockBackend::new();
    let admin = admin(&backend);

    admin.clear(&["concept", "relationship"]).await.unwrap();

    let deletes: Vec<_> = backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::DeleteByQuery(request) => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(deletes.len(), 2);
    assert!(deletes.iter().all(|r| r.index == "snomed-concept"));
    assert!(deletes.iter().all(|r| r.query == json!({ "match_all": {} })));
    assert_eq!(
        backend.refresh_calls(),
        vec![vec!["snomed-concept".to_string()]]
    );
}

#[tokio::test]
async fn test_update_settings_without_changes_is_noop() {
    let backend = MockBackend::new();
    let admin = admin(&backend);

    admin.update_settings(BTreeMap::new()).await.unwrap();
    admin
        .update_settings(updates(&[(RESULT_WINDOW, json!(10_000))]))
        .await
        .unwrap();

    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_update_settings_with_numeric_string_of_current_value_is_noop() {
    let backend = MockBackend::new();
    let admin = admin(&backend);
    admin.create().await.unwrap();
    backend.clear_calls();

    admin
        .update_settings(updates(&[(RESULT_WINDOW, json!("10000"))]))
        .await
        .unwrap();

    assert!(backend.calls().is_empty());
    assert_eq!(admin.settings().result_window(), 10_000);
}

#[tokio::test]
async fn test_update_settings_rejects_static_keys() {
    let backend = MockBackend::new();
    let admin = admin(&backend);
    let before = admin.settings();

    let err = admin
        .update_settings(updates(&[
            (NUMBER_OF_SHARDS, json!(5)),
            (RESULT_WINDOW, json!(50_000)),
        ]))
        .await
        .unwrap_err();

    match err {
        IndexError::SettingsRejected { keys } => {
            assert_eq!(keys, vec![NUMBER_OF_SHARDS.to_string()])
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(backend.calls().is_empty());
    assert_eq!(admin.settings(), before);
}

#[tokio::test]
async fn test_update_settings_pushes_dynamic_keys_only() {
    let backend = MockBackend::new();
    let admin = admin(&backend);
    admin.create().await.unwrap();
    backend.clear_calls();

    admin
        .update_settings(updates(&[
            (RESULT_WINDOW, json!(50_000)),
            (COMMIT_WATERMARK_LOW, json!(5)),
        ]))
        .await
        .unwrap();

    let pushed: Vec<(String, Value)> = backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::PutSettings { index, settings } => Some((index, settings)),
            _ => None,
        })
        .collect();
    assert_eq!(
        pushed,
        vec![
            (
                "snomed-concept".to_string(),
                json!({ RESULT_WINDOW: 50_000 })
            ),
            (
                "snomed-description".to_string(),
                json!({ RESULT_WINDOW: 50_000 })
            ),
        ]
    );
    let settings = admin.settings();
    assert_eq!(settings.result_window(), 50_000);
    assert_eq!(settings.commit_watermarks().0, 5);
}

#[tokio::test]
async fn test_local_setting_stays_client_side() {
    let backend = MockBackend::new();
    let admin = admin(&backend);
    admin.create().await.unwrap();
    backend.clear_calls();

    admin
        .update_settings(updates(&[(COMMIT_WATERMARK_HIGH, json!(1))]))
        .await
        .unwrap();

    assert!(backend.calls().is_empty());
    assert_eq!(admin.settings().get_u64(COMMIT_WATERMARK_HIGH), Some(1));
}

#[tokio::test]
async fn test_bulk_update_with_unknown_script_fails() {
    let backend = MockBackend::new();
    let admin = admin(&backend);

    let err = admin
        .bulk_update(&BulkUpdate::new("concept", Filter::match_all(), "missing"))
        .await
        .unwrap_err();

    assert!(matches!(err, IndexError::UnknownScript { script, .. } if script == "missing"));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_type_is_rejected() {
    let backend = MockBackend::new();
    let admin = admin(&backend);

    assert!(matches!(
        admin.physical_index("module"),
        Err(IndexError::UnknownType { .. })
    ));
    assert!(matches!(
        admin.refresh(&["module"]).await,
        Err(IndexError::UnknownType { .. })
    ));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_backend_settings_per_existing_index() {
    let backend = MockBackend::new();
    let admin = admin(&backend);
    backend.with_index("snomed-concept", json!({}));

    let settings = admin.backend_settings().await.unwrap();

    assert_eq!(settings.len(), 1);
    assert_eq!(settings["snomed-concept"]["number_of_shards"], "1");
}
