//! Index lifecycle and schema migration.
//!
//! [`IndexAdmin`] owns the physical indices of one named store. Every root
//! document type (a type without a parent) gets its own index named
//! `{prefix.}{store}-{type}`; child types are stored in their parent's index.
//!
//! On [`create`](IndexAdmin::create) the mapping derived from each descriptor
//! is compared against the stored one. Additive changes are applied in place,
//! breaking changes are reported and left alone, and new sub-field views of
//! existing fields trigger an in-place rewrite of every stored document so the
//! new view gets populated.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use tracing::{debug, info, trace, warn};

use crate::backend::{ByQueryRequest, ClusterHealth, Filter, IndexBackend, InlineScript};
use crate::config::IndexConfig;
use crate::error::{IndexError, IndexResult};
use crate::health::ReadinessWaiter;
use crate::retry::{ByQueryKind, ConflictRetryLoop, FilteredOperation};
use crate::schema::diff::MigrationPlan;
use crate::schema::{Mappings, SchemaDescriptor, mapping};
use crate::settings::{NUMBER_OF_SHARDS, Settings};

/// Analyzers and normalizers referenced by derived mappings.
const ANALYSIS: &str = include_str!("analysis.json");

/// A filtered update-by-script against one document type.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpdate {
    /// Document type whose index is updated.
    pub doc_type: String,
    /// Selects the documents to update.
    pub filter: Filter,
    /// Name of a script declared by the type's descriptor.
    pub script: String,
    /// Parameters bound to the script.
    pub params: Map<String, Value>,
}

impl BulkUpdate {
    /// Updates the documents of `doc_type` matching `filter` with the named script.
    pub fn new(doc_type: impl Into<String>, filter: Filter, script: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.into(),
            filter,
            script: script.into(),
            params: Map::new(),
        }
    }

    /// Adds a script parameter, replacing any earlier value of the same name.
    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

impl fmt::Display for BulkUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "update {} where {} with {}",
            self.doc_type, self.filter, self.script
        )
    }
}

/// A filtered delete against one document type.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDelete {
    /// Document type whose index is cleaned.
    pub doc_type: String,
    /// Selects the documents to delete.
    pub filter: Filter,
}

impl BulkDelete {
    /// Deletes the documents of `doc_type` matching `filter`.
    pub fn new(doc_type: impl Into<String>, filter: Filter) -> Self {
        Self {
            doc_type: doc_type.into(),
            filter,
        }
    }
}

impl fmt::Display for BulkDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delete {} where {}", self.doc_type, self.filter)
    }
}

/// What [`IndexAdmin::create`] did with one document type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The index did not exist and was created.
    Created,
    /// The stored mapping already matches.
    Unchanged,
    /// Additive changes were applied to the stored mapping.
    Updated {
        /// Applied mapping paths.
        changes: BTreeSet<String>,
        /// Stored documents were rewritten to populate new sub-fields.
        reindexed: bool,
    },
    /// Breaking changes were found; nothing was applied.
    Incompatible {
        /// Mapping paths that need a reindex.
        breaking: BTreeSet<String>,
    },
}

impl MigrationOutcome {
    fn changed_index(&self) -> bool {
        matches!(
            self,
            MigrationOutcome::Created | MigrationOutcome::Updated { .. }
        )
    }
}

/// Result of [`IndexAdmin::create`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateReport {
    /// Outcome per root document type.
    pub outcomes: BTreeMap<String, MigrationOutcome>,
    /// Physical indices refreshed after migrating documents.
    pub refreshed: BTreeSet<String>,
}

impl CreateReport {
    /// Types whose stored mapping needs an out-of-band reindex.
    pub fn incompatible(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.outcomes.iter().filter_map(|(ty, outcome)| match outcome {
            MigrationOutcome::Incompatible { breaking } => Some((ty.as_str(), breaking)),
            _ => None,
        })
    }
}

/// Administers the indices of one store.
pub struct IndexAdmin {
    backend: Arc<dyn IndexBackend>,
    config: IndexConfig,
    mappings: RwLock<Mappings>,
    settings: RwLock<Settings>,
}

impl fmt::Debug for IndexAdmin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexAdmin")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("types", &self.mappings.read().len())
            .finish_non_exhaustive()
    }
}

impl IndexAdmin {
    /// Creates an admin with settings seeded from the configuration.
    pub fn new(backend: Arc<dyn IndexBackend>, config: IndexConfig, mappings: Mappings) -> Self {
        let settings = config.settings();
        Self {
            backend,
            config,
            mappings: RwLock::new(mappings),
            settings: RwLock::new(settings),
        }
    }

    /// The lower-cased store name.
    pub fn name(&self) -> String {
        self.config.store_name()
    }

    /// Connection-independent configuration of the store.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// The backend all index requests go through.
    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    /// A snapshot of the registered document types.
    pub fn mappings(&self) -> Mappings {
        self.mappings.read().clone()
    }

    /// Replaces the registered document types.
    pub fn update_mappings(&self, mappings: Mappings) {
        *self.mappings.write() = mappings;
    }

    /// A snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// The physical index holding documents of `doc_type`.
    pub fn physical_index(&self, doc_type: &str) -> IndexResult<String> {
        let mappings = self.mappings.read();
        let descriptor = mappings.get(doc_type)?;
        Ok(self.config.physical_index(descriptor.index_type()))
    }

    /// Every physical index of the store.
    pub fn indices(&self) -> Vec<String> {
        self.root_descriptors()
            .iter()
            .map(|d| self.config.physical_index(&d.type_name))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn root_descriptors(&self) -> Vec<Arc<SchemaDescriptor>> {
        self.mappings
            .read()
            .iter()
            .filter(|d| d.parent_type.is_none())
            .cloned()
            .collect()
    }

    /// The mapping of the index owned by `root`, child types included.
    fn desired_mapping(&self, root: &SchemaDescriptor) -> Value {
        let mappings = self.mappings.read();
        let children = mappings
            .iter()
            .filter(|d| d.parent_type.is_some() && d.index_type() == root.type_name)
            .map(Arc::as_ref);
        mapping::index_mapping(root, children)
    }

    /// Returns true if every physical index of the store exists.
    pub async fn exists(&self) -> IndexResult<bool> {
        let indices = self.indices();
        if indices.is_empty() {
            return Ok(false);
        }
        Ok(self.backend.indices_exist(&indices).await?)
    }

    /// Creates missing indices and migrates the mappings of existing ones.
    ///
    /// Breaking mapping changes are never applied. They are logged and
    /// reported as [`MigrationOutcome::Incompatible`]; the call still succeeds.
    pub async fn create(&self) -> IndexResult<CreateReport> {
        let name = self.name();
        info!(store = %name, "Preparing indexes");

        let settings = self.settings();
        let mut report = CreateReport::default();
        let mut changed_indices = Vec::new();

        for descriptor in self.root_descriptors() {
            let index = self.config.physical_index(&descriptor.type_name);
            let desired = self.desired_mapping(&descriptor);

            let outcome = if self
                .backend
                .indices_exist(std::slice::from_ref(&index))
                .await?
            {
                let current = self.backend.get_mapping(&index).await?;
                self.migrate(&descriptor, &index, &current, &desired, &mut report.refreshed)
                    .await?
            } else {
                let index_settings = index_settings(&settings)?;
                info!(index = %index, "Configuring index with settings {}", index_settings);
                let acknowledged = self
                    .backend
                    .create_index(&index, &index_settings, &desired)
                    .await?;
                if !acknowledged {
                    return Err(IndexError::Unacknowledged {
                        operation: "create index".to_string(),
                        index,
                    });
                }
                MigrationOutcome::Created
            };

            if outcome.changed_index() {
                changed_indices.push(index);
            }
            report
                .outcomes
                .insert(descriptor.type_name.clone(), outcome);
        }

        ReadinessWaiter::from_settings(self.backend.as_ref(), &settings)
            .wait_ready(&changed_indices)
            .await?;
        self.refresh_indices(&report.refreshed).await?;

        info!(store = %name, "Indexes are ready");
        Ok(report)
    }

    async fn migrate(
        &self,
        descriptor: &SchemaDescriptor,
        index: &str,
        current: &Value,
        desired: &Value,
        to_refresh: &mut BTreeSet<String>,
    ) -> IndexResult<MigrationOutcome> {
        let plan = MigrationPlan::between(current, desired);

        if plan.is_breaking() {
            warn!(
                index = %index,
                breaking = ?plan.breaking,
                "Cannot migrate index to new mapping with breaking changes. \
                 Reindex the store or drop the index manually to migrate to the new mapping"
            );
            return Ok(MigrationOutcome::Incompatible {
                breaking: plan.breaking,
            });
        }
        if plan.is_empty() {
            debug!(index = %index, "Mapping is up to date");
            return Ok(MigrationOutcome::Unchanged);
        }

        info!(index = %index, changes = ?plan.additive, "Applying mapping changes");
        if !self.backend.put_mapping(index, desired).await? {
            return Err(IndexError::Unacknowledged {
                operation: "update mapping".to_string(),
                index: index.to_string(),
            });
        }

        let reindexed = plan.has_field_alias_change();
        if reindexed {
            // no script: each document is rewritten as is and picks up the new sub-fields
            let op = self.filtered_operation(
                &descriptor.type_name,
                ByQueryKind::Update,
                index.to_string(),
                Filter::match_all(),
                None,
                "mapping migration".to_string(),
            );
            if self.run_filtered(&op).await? {
                to_refresh.insert(index.to_string());
            }
            info!(index = %index, "Migrated documents to new mapping");
        }

        Ok(MigrationOutcome::Updated {
            changes: plan.additive,
            reindexed,
        })
    }

    /// Deletes every physical index of the store.
    ///
    /// Indices are named one by one so that stores sharing a name prefix are
    /// left alone.
    pub async fn delete(&self) -> IndexResult<()> {
        let mut existing = Vec::new();
        for index in self.indices() {
            if self
                .backend
                .indices_exist(std::slice::from_ref(&index))
                .await?
            {
                existing.push(index);
            }
        }
        if existing.is_empty() {
            return Ok(());
        }
        if !self.backend.delete_indices(&existing).await? {
            return Err(IndexError::Unacknowledged {
                operation: "delete index".to_string(),
                index: existing.join(","),
            });
        }
        info!(store = %self.name(), indices = ?existing, "Deleted indexes");
        Ok(())
    }

    /// Deletes every document of the given types.
    pub async fn clear(&self, types: &[&str]) -> IndexResult<()> {
        if types.is_empty() {
            return Ok(());
        }
        let mut to_refresh = BTreeSet::new();
        for doc_type in types {
            let delete = BulkDelete::new(*doc_type, Filter::match_all());
            if self.bulk_delete(&delete).await? {
                to_refresh.insert(self.physical_index(doc_type)?);
            }
        }
        self.refresh_indices(&to_refresh).await
    }

    /// Validates and applies a settings update.
    ///
    /// Fails with [`IndexError::SettingsRejected`] before anything is changed
    /// if a key is static. Only dynamic keys are sent to the backend; local
    /// keys are kept client side.
    pub async fn update_settings(&self, updates: BTreeMap<String, Value>) -> IndexResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        Settings::validate_update(&updates)?;

        let differs = self.settings.read().differs(&updates);
        if !differs {
            debug!(store = %self.name(), "Settings unchanged");
            return Ok(());
        }

        let dynamic = Settings::dynamic_subset(&updates);
        if !dynamic.is_empty() {
            let body = Value::Object(dynamic.into_iter().collect());
            for index in self.indices() {
                if !self
                    .backend
                    .indices_exist(std::slice::from_ref(&index))
                    .await?
                {
                    continue;
                }
                info!(index = %index, "Applying settings {} changes", body);
                if !self.backend.put_settings(&index, &body).await? {
                    return Err(IndexError::Unacknowledged {
                        operation: "update settings".to_string(),
                        index,
                    });
                }
            }
        }

        self.settings.write().merge(&updates);
        Ok(())
    }

    /// Index-level settings stored by the backend, per existing index.
    pub async fn backend_settings(&self) -> IndexResult<BTreeMap<String, Value>> {
        let mut result = BTreeMap::new();
        for index in self.indices() {
            if self
                .backend
                .indices_exist(std::slice::from_ref(&index))
                .await?
            {
                let settings = self.backend.get_settings(&index).await?;
                result.insert(index, settings);
            }
        }
        Ok(result)
    }

    /// A single health poll over the store's indices.
    pub async fn health(&self) -> IndexResult<ClusterHealth> {
        let timeout = self.settings.read().socket_timeout() / 2;
        Ok(self
            .backend
            .cluster_health(&self.indices(), timeout)
            .await?)
    }

    /// Refreshes the indices of the given types, once per physical index.
    pub async fn refresh(&self, types: &[&str]) -> IndexResult<()> {
        let indices = types
            .iter()
            .map(|ty| self.physical_index(ty))
            .collect::<IndexResult<BTreeSet<_>>>()?;
        self.refresh_indices(&indices).await
    }

    pub(crate) async fn refresh_indices(&self, indices: &BTreeSet<String>) -> IndexResult<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let indices: Vec<String> = indices.iter().cloned().collect();
        trace!(indices = ?indices, "Refreshing indexes");
        self.backend.refresh(&indices).await?;
        Ok(())
    }

    /// Runs a scripted update over every document matching the filter.
    ///
    /// Returns whether any document changed.
    pub async fn bulk_update(&self, update: &BulkUpdate) -> IndexResult<bool> {
        let (index, source) = {
            let mappings = self.mappings.read();
            let descriptor = mappings.get(&update.doc_type)?;
            let source = descriptor
                .script(&update.script)
                .ok_or_else(|| IndexError::UnknownScript {
                    doc_type: update.doc_type.clone(),
                    script: update.script.clone(),
                })?
                .to_string();
            (self.config.physical_index(descriptor.index_type()), source)
        };
        let script = InlineScript {
            source,
            params: update.params.clone(),
        };
        let op = self.filtered_operation(
            &update.doc_type,
            ByQueryKind::Update,
            index,
            update.filter.clone(),
            Some(script),
            update.to_string(),
        );
        self.run_filtered(&op).await
    }

    /// Deletes every document matching the filter.
    ///
    /// Returns whether any document was deleted.
    pub async fn bulk_delete(&self, delete: &BulkDelete) -> IndexResult<bool> {
        let index = self.physical_index(&delete.doc_type)?;
        let op = self.filtered_operation(
            &delete.doc_type,
            ByQueryKind::Delete,
            index,
            delete.filter.clone(),
            None,
            delete.to_string(),
        );
        self.run_filtered(&op).await
    }

    fn filtered_operation(
        &self,
        doc_type: &str,
        kind: ByQueryKind,
        index: String,
        filter: Filter,
        script: Option<InlineScript>,
        description: String,
    ) -> FilteredOperation {
        let settings = self.settings.read();
        FilteredOperation {
            doc_type: doc_type.to_string(),
            kind,
            request: ByQueryRequest {
                index,
                query: filter.as_query().clone(),
                script,
                batch_size: settings.result_window(),
            },
            description,
        }
    }

    async fn run_filtered(&self, op: &FilteredOperation) -> IndexResult<bool> {
        ConflictRetryLoop::new(self.backend.as_ref(), &self.config.retry)
            .run(op)
            .await
    }
}

/// Index-level settings sent when an index is created.
fn index_settings(settings: &Settings) -> IndexResult<Value> {
    let analysis: Value = serde_json::from_str(ANALYSIS)?;
    let shards = settings.get_u64(NUMBER_OF_SHARDS).unwrap_or(1);

    let mut index = Map::new();
    index.insert("analysis".to_string(), analysis);
    index.insert("number_of_shards".to_string(), json!(shards.to_string()));
    index.insert("number_of_replicas".to_string(), json!("0"));
    // refresh is explicit, issued after every commit
    index.insert("refresh_interval".to_string(), json!("-1"));
    index.insert("translog.durability".to_string(), json!("async"));
    index.insert("write.wait_for_active_shards".to_string(), json!("all"));
    for (key, value) in settings.creation_settings() {
        index.insert(key, value);
    }
    Ok(Value::Object(index))
}
