//! The flow service: parent/child job trees.
//!
//! A parent is written in `waiting-children` and only released once every
//! child completed. The whole tree lands in one atomic script, so children
//! are visible the moment `add_flow` returns and no partial trees exist.
//! Both directions of the relationship live in Redis (the
//! `flow:{id}:children` set and the child's parent fields); nothing is
//! kept as in-memory pointers.

use crate::error::QueueError;
use crate::job::{JobOptions, JobPayload, JobState, ParentRef};
use crate::keys::QueueKeys;
use crate::scripts::ScriptSet;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// One node of a flow tree. Nodes may target different queues.
#[derive(Debug, Clone)]
pub struct FlowNode {
    pub queue: String,
    pub payload: JobPayload,
    pub opts: JobOptions,
    pub children: Vec<FlowNode>,
}

impl FlowNode {
    pub fn new(queue: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            queue: queue.into(),
            payload,
            opts: JobOptions::default(),
            children: Vec::new(),
        }
    }

    pub fn with_opts(mut self, opts: JobOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_children(mut self, children: Vec<FlowNode>) -> Self {
        self.children = children;
        self
    }
}

/// A child (or parent) as seen by dependency introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowJobStatus {
    pub queue: String,
    pub id: String,
    /// `None` when the record has been removed.
    pub state: Option<JobState>,
}

/// Immediate parent and direct children of one job.
#[derive(Debug, Clone)]
pub struct FlowDependencies {
    pub parent: Option<FlowJobStatus>,
    pub children: Vec<FlowJobStatus>,
}

/// Produces flow trees and reads the dependency graph back.
pub struct FlowProducer {
    redis: ConnectionManager,
    prefix: String,
    scripts: Arc<ScriptSet>,
}

impl FlowProducer {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            scripts: Arc::new(ScriptSet::new()),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }

    fn keys_for(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.prefix, queue)
    }

    /// Enqueue a whole tree atomically and return the root job id.
    ///
    /// Leaves enter `waiting`/`delayed` immediately; internal nodes are
    /// written in `waiting-children` with their pending counters. Ids are
    /// assigned bottom-up; caller-supplied ids are preserved, and nodes
    /// whose id already exists are left untouched (idempotent re-add).
    pub async fn add_flow(&self, root: FlowNode) -> Result<String, QueueError> {
        validate_tree(&root)?;

        let mut flat: Vec<serde_json::Value> = Vec::new();
        let mut seen = HashSet::new();
        let root_id = flatten(&root, None, &mut flat, &mut seen)?;

        let nodes_json = serde_json::to_string(&flat)?;
        let mut conn = self.conn();
        let returned_root: String = self
            .scripts
            .add_flow
            .arg(format!("{}:", self.prefix))
            .arg(Utc::now().timestamp_millis())
            .arg(nodes_json)
            .invoke_async(&mut conn)
            .await?;

        info!(
            root = %returned_root,
            nodes = flat.len(),
            "Enqueued flow"
        );
        Ok(root_id)
    }

    /// Immediate parent (if any) and all direct children with their
    /// current states.
    pub async fn flow_dependencies(
        &self,
        queue: &str,
        job_id: &str,
    ) -> Result<FlowDependencies, QueueError> {
        let keys = self.keys_for(queue);
        let mut conn = self.conn();

        let (parent_queue, parent_id): (Option<String>, Option<String>) = redis::pipe()
            .cmd("HGET")
            .arg(keys.job(job_id))
            .arg("parent_queue")
            .cmd("HGET")
            .arg(keys.job(job_id))
            .arg("parent_id")
            .query_async(&mut conn)
            .await?;

        let parent = match (parent_queue, parent_id) {
            (Some(p_queue), Some(p_id)) if !p_id.is_empty() => {
                Some(self.job_status(&p_queue, &p_id).await?)
            }
            _ => None,
        };

        let refs: Vec<String> = redis::cmd("SMEMBERS")
            .arg(keys.flow_children(job_id))
            .query_async(&mut conn)
            .await?;

        let mut children = Vec::with_capacity(refs.len());
        for child_ref in refs {
            let (c_queue, c_id) = split_ref(&child_ref)?;
            children.push(self.job_status(&c_queue, &c_id).await?);
        }
        // Deterministic order for callers and tests.
        children.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(FlowDependencies { parent, children })
    }

    /// Return values of completed children, keyed by child job id. Partial
    /// when some children are still running.
    pub async fn children_values(
        &self,
        queue: &str,
        job_id: &str,
    ) -> Result<HashMap<String, serde_json::Value>, QueueError> {
        let keys = self.keys_for(queue);
        let mut conn = self.conn();

        let refs: Vec<String> = redis::cmd("SMEMBERS")
            .arg(keys.flow_children(job_id))
            .query_async(&mut conn)
            .await?;

        let mut values = HashMap::new();
        for child_ref in refs {
            let (c_queue, c_id) = split_ref(&child_ref)?;
            let child_keys = self.keys_for(&c_queue);
            let (state, raw): (Option<String>, Option<String>) = redis::pipe()
                .cmd("HGET")
                .arg(child_keys.job(&c_id))
                .arg("state")
                .cmd("HGET")
                .arg(child_keys.job(&c_id))
                .arg("return_value")
                .query_async(&mut conn)
                .await?;

            if state.as_deref() == Some("completed") {
                let value = match raw.as_deref() {
                    None | Some("") => serde_json::Value::Null,
                    Some(raw) => serde_json::from_str(raw)?,
                };
                values.insert(c_id, value);
            }
        }
        Ok(values)
    }

    /// How many children a parent is still waiting on.
    pub async fn pending_children(
        &self,
        queue: &str,
        job_id: &str,
    ) -> Result<u64, QueueError> {
        let keys = self.keys_for(queue);
        let mut conn = self.conn();
        let pending: Option<u64> = redis::cmd("GET")
            .arg(keys.flow_pending(job_id))
            .query_async(&mut conn)
            .await?;
        Ok(pending.unwrap_or(0))
    }

    async fn job_status(&self, queue: &str, job_id: &str) -> Result<FlowJobStatus, QueueError> {
        let keys = self.keys_for(queue);
        let mut conn = self.conn();
        let state: Option<String> = redis::cmd("HGET")
            .arg(keys.job(job_id))
            .arg("state")
            .query_async(&mut conn)
            .await?;

        Ok(FlowJobStatus {
            queue: queue.to_string(),
            id: job_id.to_string(),
            state: state.map(|raw| raw.parse()).transpose()?,
        })
    }
}

fn validate_tree(node: &FlowNode) -> Result<(), QueueError> {
    if node.queue.trim().is_empty() {
        return Err(QueueError::Flow("flow node needs a queue name".to_string()));
    }
    node.payload.validate()?;
    if node.opts.parent.is_some() {
        return Err(QueueError::Flow(
            "flow nodes take their parent from the tree, not from options".to_string(),
        ));
    }
    for child in &node.children {
        validate_tree(child)?;
    }
    Ok(())
}

/// Post-order flatten: children first, root last. Returns the node's id.
fn flatten(
    node: &FlowNode,
    parent: Option<&ParentRef>,
    out: &mut Vec<serde_json::Value>,
    seen: &mut HashSet<String>,
) -> Result<String, QueueError> {
    let id = node
        .opts
        .job_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if !seen.insert(format!("{}/{}", node.queue, id)) {
        return Err(QueueError::Flow(format!(
            "duplicate job id '{}' in flow tree",
            id
        )));
    }

    let self_ref = ParentRef {
        queue: node.queue.clone(),
        id: id.clone(),
    };
    let mut child_refs = Vec::with_capacity(node.children.len());
    for child in &node.children {
        let child_id = flatten(child, Some(&self_ref), out, seen)?;
        child_refs.push(format!("{}/{}", child.queue, child_id));
    }

    let mut entry = json!({
        "id": id,
        "queue": node.queue,
        "name": node.payload.name,
        "payload": node.payload.to_json()?,
        "priority": node.opts.priority,
        "lifo": if node.opts.lifo { 1 } else { 0 },
        "delay_ms": node.opts.delay_ms,
        "max_attempts": node.opts.attempts.max(1),
        "backoff_kind": node.opts.backoff.kind_str(),
        "backoff_delay_ms": node.opts.backoff.base_delay_ms(),
        "remove_on_complete": node.opts.remove_on_complete.as_str(),
        "remove_on_fail": node.opts.remove_on_fail.as_str(),
        "children": child_refs,
    });
    if let Some(timeout_ms) = node.opts.timeout_ms {
        entry["timeout_ms"] = json!(timeout_ms);
    }
    if let Some(parent) = parent {
        entry["parent_queue"] = json!(parent.queue);
        entry["parent_id"] = json!(parent.id);
    }

    out.push(entry);
    Ok(id)
}

fn split_ref(child_ref: &str) -> Result<(String, String), QueueError> {
    match child_ref.split_once('/') {
        Some((queue, id)) if !queue.is_empty() && !id.is_empty() => {
            Ok((queue.to_string(), id.to_string()))
        }
        _ => Err(QueueError::Flow(format!(
            "malformed child reference '{}'",
            child_ref
        ))),
    }
}
