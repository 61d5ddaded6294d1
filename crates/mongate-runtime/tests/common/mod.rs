//! Shared fixtures for the runtime integration tests.
//!
//! - an in-memory authorization source that counts fetches
//! - a recording executor with scripted responses
//! - a manually advanced clock
//! - the policy used across scenarios

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use mongate_core::{
    AuthorizationRecord, CollectionAccess, CollectionPolicy, FilterDocument, PolicyConfig,
    Projection, ScopeSource, Stage,
};
use mongate_runtime::{Clock, ContextSource, QueryExecutor};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

// =============================================================================
// IDS
// =============================================================================

pub const TENANT_A: &str = "64f000000000000000000001";
pub const TENANT_B: &str = "64f000000000000000000002";
pub const PROCESS_1: &str = "650000000000000000000001";
pub const PROCESS_2: &str = "650000000000000000000002";

pub const ANALYST: &str = "660000000000000000000001";
pub const MANAGER: &str = "660000000000000000000002";
pub const ADMIN: &str = "660000000000000000000003";
pub const INTERN: &str = "660000000000000000000004";

// =============================================================================
// POLICY
// =============================================================================

pub fn policy() -> PolicyConfig {
    let mut policy = PolicyConfig::default()
        .with_collection("call-interaction", CollectionPolicy::new("companyId"))
        .with_collection(
            "customer",
            CollectionPolicy::new("company._id")
                .with_role_scope("process_manager", "processId", ScopeSource::Processes)
                .with_restricted_fields("user", ["phone", "billing.iban"]),
        )
        .with_collection(
            "ticket",
            CollectionPolicy::new("companyId").with_role_scope(
                "process_manager",
                "user.process._id",
                ScopeSource::Processes,
            ),
        )
        .with_collection(
            "task",
            CollectionPolicy::new("companyId").with_role_scope("user", "assignee", ScopeSource::User),
        );
    policy.global_collections.push("country".to_string());

    policy.role_access.insert(
        "user".to_string(),
        CollectionAccess::List(vec![
            "call-interaction".to_string(),
            "customer".to_string(),
            "country".to_string(),
            "task".to_string(),
            // permitted but declared nowhere else
            "legacy".to_string(),
        ]),
    );
    policy.role_access.insert(
        "process_manager".to_string(),
        CollectionAccess::List(vec!["customer".to_string(), "ticket".to_string()]),
    );
    policy
        .role_access
        .insert("admin".to_string(), CollectionAccess::All("all".to_string()));
    policy
}

// =============================================================================
// AUTHORIZATION SOURCE
// =============================================================================

/// Authorization records keyed by user id.
#[derive(Default)]
pub struct MemorySource {
    records: Mutex<HashMap<String, Value>>,
    failing: Mutex<bool>,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// The analyst, manager and admin users of tenant A.
    pub fn seeded() -> Self {
        let source = Self::new();
        source.insert(ANALYST, "User", TENANT_A, &[]);
        source.insert(MANAGER, "Process_Manager", TENANT_A, &[PROCESS_1, PROCESS_2]);
        source.insert(ADMIN, "admin", TENANT_A, &[]);
        source
    }

    pub fn insert(&self, user_id: &str, role: &str, tenant: &str, processes: &[&str]) {
        let processes: Vec<Value> = processes.iter().map(|p| json!({"_id": p})).collect();
        self.records.lock().unwrap_or_else(PoisonError::into_inner).insert(
            user_id.to_string(),
            json!({
                "_id": user_id,
                "role": {"name": role},
                "company": {"_id": tenant},
                "process": processes
            }),
        );
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ContextSource for MemorySource {
    fn fetch(&self, user_id: &str) -> anyhow::Result<Option<AuthorizationRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            anyhow::bail!("authorization store unreachable");
        }
        let record = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned();
        match record {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// A query as received by the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Executed {
    Find {
        collection: String,
        filter: Value,
        projection: Option<Value>,
    },
    Aggregate {
        collection: String,
        pipeline: Value,
    },
}

/// Records every query and answers from a script; unscripted calls return no
/// documents.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<Executed>>,
    responses: Mutex<VecDeque<anyhow::Result<Vec<Value>>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, documents: Vec<Value>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(documents));
    }

    pub fn fail(&self, message: &str) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(anyhow::anyhow!(message.to_string())));
    }

    pub fn calls(&self) -> Vec<Executed> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn answer(&self, call: Executed) -> anyhow::Result<Vec<Value>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

impl QueryExecutor for RecordingExecutor {
    fn find(
        &self,
        collection: &str,
        filter: &FilterDocument,
        projection: Option<&Projection>,
    ) -> anyhow::Result<Vec<Value>> {
        self.answer(Executed::Find {
            collection: collection.to_string(),
            filter: Value::Object(filter.clone()),
            projection: projection.cloned().map(Value::Object),
        })
    }

    fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> anyhow::Result<Vec<Value>> {
        self.answer(Executed::Aggregate {
            collection: collection.to_string(),
            pipeline: Value::Array(pipeline.iter().cloned().map(Value::Object).collect()),
        })
    }
}

// =============================================================================
// CLOCK
// =============================================================================

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2025, 8, 18, 9, 0, 0).unwrap()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn oid(hex: &str) -> Value {
    json!({"$oid": hex})
}
