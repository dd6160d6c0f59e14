//! Test infrastructure for the index write engine.
//!
//! [`MockBackend`] is an in-memory [`IndexBackend`] that records every call
//! and can be scripted to answer with conflicts, failures, unacknowledged
//! admin requests or slow readiness polls.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use helios_index::backend::{
    BulkAction, BulkItem, BulkResponse, ByQueryFailure, ByQueryRequest, ByQueryResponse,
    ClusterHealth, HealthStatus,
};
use helios_index::schema::{Analyzer, FieldSpec, SchemaDescriptor};
use helios_index::{BackendError, IndexAdmin, IndexBackend, IndexConfig, Mappings};
use parking_lot::Mutex;
use serde_json::Value;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    IndicesExist(Vec<String>),
    CreateIndex {
        index: String,
        settings: Value,
        mapping: Value,
    },
    DeleteIndices(Vec<String>),
    GetMapping(String),
    PutMapping {
        index: String,
        mapping: Value,
    },
    GetSettings(String),
    PutSettings {
        index: String,
        settings: Value,
    },
    Refresh(Vec<String>),
    ClusterHealth(Vec<String>),
    UpdateByQuery(ByQueryRequest),
    DeleteByQuery(ByQueryRequest),
    Bulk(Vec<BulkAction>),
}

#[derive(Debug)]
struct State {
    calls: Vec<Call>,
    indices: BTreeMap<String, Value>,
    acknowledge: bool,
    health_timeouts: usize,
    update_responses: VecDeque<ByQueryResponse>,
    delete_responses: VecDeque<ByQueryResponse>,
    by_query_delay: Option<Duration>,
    by_query_running: usize,
    by_query_peak: usize,
    failing_ids: BTreeSet<String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            indices: BTreeMap::new(),
            acknowledge: true,
            health_timeouts: 0,
            update_responses: VecDeque::new(),
            delete_responses: VecDeque::new(),
            by_query_delay: None,
            by_query_running: 0,
            by_query_peak: 0,
            failing_ids: BTreeSet::new(),
        }
    }
}

/// Scriptable in-memory backend.
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<State>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an existing index with a stored mapping.
    pub fn with_index(&self, index: &str, mapping: Value) {
        self.state.lock().indices.insert(index.to_string(), mapping);
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.state.lock().indices.contains_key(index)
    }

    pub fn stored_mapping(&self, index: &str) -> Option<Value> {
        self.state.lock().indices.get(index).cloned()
    }

    /// Answers every admin request as unacknowledged.
    pub fn refuse_acknowledgement(&self) {
        self.state.lock().acknowledge = false;
    }

    /// The next `polls` health polls time out; `usize::MAX` never gets ready.
    pub fn health_timeouts(&self, polls: usize) {
        self.state.lock().health_timeouts = polls;
    }

    pub fn queue_update_response(&self, response: ByQueryResponse) {
        self.state.lock().update_responses.push_back(response);
    }

    pub fn queue_delete_response(&self, response: ByQueryResponse) {
        self.state.lock().delete_responses.push_back(response);
    }

    /// Every by-query request sleeps this long before answering.
    pub fn by_query_delay(&self, delay: Duration) {
        self.state.lock().by_query_delay = Some(delay);
    }

    /// The largest number of by-query requests seen running at once.
    pub fn by_query_peak(&self) -> usize {
        self.state.lock().by_query_peak
    }

    /// Bulk items with this id fail with a mapping error.
    pub fn fail_id(&self, id: &str) {
        self.state.lock().failing_ids.insert(id.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn bulk_calls(&self) -> Vec<Vec<BulkAction>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Bulk(actions) => Some(actions),
                _ => None,
            })
            .collect()
    }

    pub fn refresh_calls(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Refresh(indices) => Some(indices),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|&c| matches(c)).count()
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    async fn by_query(
        &self,
        call: Call,
        next: impl FnOnce(&mut State) -> Option<ByQueryResponse>,
        fallback: ByQueryResponse,
    ) -> ByQueryResponse {
        let (delay, response) = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.by_query_running += 1;
            state.by_query_peak = state.by_query_peak.max(state.by_query_running);
            (state.by_query_delay, next(&mut state).unwrap_or(fallback))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().by_query_running -= 1;
        response
    }
}

#[async_trait]
impl IndexBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn indices_exist(&self, indices: &[String]) -> Result<bool, BackendError> {
        self.record(Call::IndicesExist(indices.to_vec()));
        let state = self.state.lock();
        Ok(indices.iter().all(|i| state.indices.contains_key(i)))
    }

    async fn create_index(
        &self,
        index: &str,
        settings: &Value,
        mapping: &Value,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(Call::CreateIndex {
            index: index.to_string(),
            settings: settings.clone(),
            mapping: mapping.clone(),
        });
        if state.acknowledge {
            state.indices.insert(index.to_string(), mapping.clone());
        }
        Ok(state.acknowledge)
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(Call::DeleteIndices(indices.to_vec()));
        if state.acknowledge {
            state.indices.retain(|name, _| !indices.contains(name));
        }
        Ok(state.acknowledge)
    }

    async fn get_mapping(&self, index: &str) -> Result<Value, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(Call::GetMapping(index.to_string()));
        Ok(state.indices.get(index).cloned().unwrap_or(Value::Null))
    }

    async fn put_mapping(&self, index: &str, mapping: &Value) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(Call::PutMapping {
            index: index.to_string(),
            mapping: mapping.clone(),
        });
        if state.acknowledge {
            state.indices.insert(index.to_string(), mapping.clone());
        }
        Ok(state.acknowledge)
    }

    async fn get_settings(&self, index: &str) -> Result<Value, BackendError> {
        self.record(Call::GetSettings(index.to_string()));
        Ok(serde_json::json!({ "number_of_shards": "1" }))
    }

    async fn put_settings(&self, index: &str, settings: &Value) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(Call::PutSettings {
            index: index.to_string(),
            settings: settings.clone(),
        });
        Ok(state.acknowledge)
    }

    async fn refresh(&self, indices: &[String]) -> Result<(), BackendError> {
        self.record(Call::Refresh(indices.to_vec()));
        Ok(())
    }

    async fn cluster_health(
        &self,
        indices: &[String],
        timeout: Duration,
    ) -> Result<ClusterHealth, BackendError> {
        let timed_out = {
            let mut state = self.state.lock();
            state.calls.push(Call::ClusterHealth(indices.to_vec()));
            if state.health_timeouts > 0 {
                if state.health_timeouts != usize::MAX {
                    state.health_timeouts -= 1;
                }
                true
            } else {
                false
            }
        };
        if timed_out {
            tokio::time::sleep(timeout).await;
            return Ok(ClusterHealth {
                status: HealthStatus::Red,
                timed_out: true,
            });
        }
        Ok(ClusterHealth {
            status: HealthStatus::Green,
            timed_out: false,
        })
    }

    async fn update_by_query(
        &self,
        request: &ByQueryRequest,
    ) -> Result<ByQueryResponse, BackendError> {
        Ok(self
            .by_query(
                Call::UpdateByQuery(request.clone()),
                |state| state.update_responses.pop_front(),
                updated(1),
            )
            .await)
    }

    async fn delete_by_query(
        &self,
        request: &ByQueryRequest,
    ) -> Result<ByQueryResponse, BackendError> {
        Ok(self
            .by_query(
                Call::DeleteByQuery(request.clone()),
                |state| state.delete_responses.pop_front(),
                deleted(1),
            )
            .await)
    }

    async fn bulk(&self, actions: Vec<BulkAction>) -> Result<BulkResponse, BackendError> {
        let mut state = self.state.lock();
        let items = actions
            .iter()
            .map(|action| {
                let failing = state.failing_ids.contains(action.id());
                BulkItem {
                    id: action.id().to_string(),
                    status: if failing { 400 } else { 200 },
                    error: failing.then(|| "mapper_parsing_exception: failed to parse".to_string()),
                }
            })
            .collect();
        state.calls.push(Call::Bulk(actions));
        Ok(BulkResponse { took_ms: 1, items })
    }
}

pub fn updated(count: u64) -> ByQueryResponse {
    ByQueryResponse {
        updated: count,
        ..Default::default()
    }
}

pub fn deleted(count: u64) -> ByQueryResponse {
    ByQueryResponse {
        deleted: count,
        ..Default::default()
    }
}

/// A response reporting `count` version conflicts and nothing changed.
pub fn conflicts(count: u64) -> ByQueryResponse {
    ByQueryResponse {
        version_conflicts: count,
        failures: (0..count)
            .map(|i| ByQueryFailure {
                id: Some(i.to_string()),
                status: 409,
                cause: "version_conflict_engine_exception".to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

/// A response with one failure that is not a version conflict.
pub fn rejected(id: &str) -> ByQueryResponse {
    ByQueryResponse {
        failures: vec![ByQueryFailure {
            id: Some(id.to_string()),
            status: 400,
            cause: "mapper_parsing_exception: failed to parse".to_string(),
        }],
        ..Default::default()
    }
}

pub fn concept_schema() -> SchemaDescriptor {
    SchemaDescriptor::builder("concept")
        .field(FieldSpec::id("id"))
        .field(FieldSpec::boolean("active"))
        .field(FieldSpec::keyword("module_id"))
        .script("inactivate", "ctx._source.active = false")
        .build()
        .unwrap()
}

pub fn description_schema() -> SchemaDescriptor {
    SchemaDescriptor::builder("description")
        .field(FieldSpec::id("id"))
        .field(FieldSpec::keyword("concept_id"))
        .field(FieldSpec::text("term", Analyzer::Tokenized))
        .build()
        .unwrap()
}

/// A child type stored in the concept index.
pub fn relationship_schema() -> SchemaDescriptor {
    SchemaDescriptor::builder("relationship")
        .parent("concept")
        .field(FieldSpec::id("id"))
        .field(FieldSpec::keyword("destination_id"))
        .build()
        .unwrap()
}

pub fn mappings() -> Mappings {
    Mappings::from_descriptors([concept_schema(), description_schema(), relationship_schema()])
        .unwrap()
}

pub fn admin(backend: &Arc<MockBackend>) -> Arc<IndexAdmin> {
    admin_with(backend, IndexConfig::new("snomed"))
}

pub fn admin_with(backend: &Arc<MockBackend>, config: IndexConfig) -> Arc<IndexAdmin> {
    let backend: Arc<dyn IndexBackend> = backend.clone();
    Arc::new(IndexAdmin::new(backend, config, mappings()))
}
