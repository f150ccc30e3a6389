//! Reference resolution.
//!
//! Given a resource (or Bundle) and dotted paths to `Reference` fields, the
//! resolver fetches the targets and either embeds them in place (graph mode)
//! or returns them keyed by reference. Paths are processed in groups of
//! equal depth, shallow first, so a deeper path can walk into a target that
//! an earlier group embedded. Paths within a group resolve concurrently.
//!
//! Every fetch goes through a [`ReferenceCache`] scoped to one top-level
//! request: the first caller stores the in-flight fetch immediately, so each
//! reference is fetched at most once however many paths or pages point at it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all, try_join_all};
use serde_json::Value;
use tracing::{debug, warn};

use crate::SmartResult;
use crate::path::{get_path, set_path};

/// Resolved targets keyed by reference (`"Patient/123"`).
pub type References = BTreeMap<String, Value>;

type PendingFetch = Shared<BoxFuture<'static, SmartResult<Value>>>;

/// Fetches one reference target.
#[async_trait]
pub trait ReferenceFetcher: Send + Sync {
    async fn fetch_reference(&self, reference: &str) -> SmartResult<Value>;
}

/// Shared fetcher handle.
pub type DynReferenceFetcher = Arc<dyn ReferenceFetcher>;

// =============================================================================
// Cache
// =============================================================================

/// In-flight and completed reference fetches of one resolution scope.
#[derive(Clone, Default)]
pub struct ReferenceCache {
    entries: Arc<DashMap<String, PendingFetch>>,
}

impl std::fmt::Debug for ReferenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceCache")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl ReferenceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached references.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the target of `reference`, joining an in-flight fetch if one
    /// exists. A failed fetch is evicted so a later attempt can retry; an
    /// entry that replaced it in the meantime is kept.
    pub async fn get_or_fetch(
        &self,
        reference: &str,
        fetcher: &DynReferenceFetcher,
    ) -> SmartResult<Value> {
        let pending = self
            .entries
            .entry(reference.to_string())
            .or_insert_with(|| {
                let fetcher = Arc::clone(fetcher);
                let reference = reference.to_string();
                async move { fetcher.fetch_reference(&reference).await }
                    .boxed()
                    .shared()
            })
            .clone();

        let result = pending.clone().await;
        if result.is_err() {
            self.entries
                .remove_if(reference, |_, cached| cached.ptr_eq(&pending));
        }
        result
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Trims `paths`, drops empty and duplicate entries, and groups the rest by
/// segment count in ascending order.
#[must_use]
pub fn normalize_paths(paths: &[String]) -> BTreeMap<usize, Vec<String>> {
    let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut seen = std::collections::HashSet::new();

    for path in paths.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        if !seen.insert(path) {
            debug!(path, "Duplicated reference path");
            continue;
        }
        groups
            .entry(path.split('.').count())
            .or_default()
            .push(path.to_string());
    }
    groups
}

/// Where a resolved target goes and how to obtain it.
struct Target {
    write_path: String,
    source: TargetSource,
}

enum TargetSource {
    /// `#id` pointing into `contained`.
    Contained(Option<Value>),
    Remote(String),
}

/// Resolves the references at `paths` in `resource`.
///
/// A Bundle has each `entry[].resource` resolved independently, sharing
/// `cache`. In graph mode targets are written in place and the returned map
/// is empty; otherwise `resource` is left untouched and the targets are
/// returned keyed by reference. A 404 leaves that reference unresolved.
///
/// # Errors
///
/// Any fetch failure other than 404 aborts the resolution.
pub async fn resolve_references(
    resource: &mut Value,
    paths: &[String],
    graph: bool,
    cache: &ReferenceCache,
    fetcher: &DynReferenceFetcher,
) -> SmartResult<References> {
    let groups = normalize_paths(paths);
    if groups.is_empty() {
        return Ok(References::new());
    }

    if resource.get("resourceType").and_then(Value::as_str) == Some("Bundle") {
        let Some(entries) = resource.get_mut("entry").and_then(Value::as_array_mut) else {
            return Ok(References::new());
        };
        let resolved = try_join_all(
            entries
                .iter_mut()
                .filter_map(|entry| entry.get_mut("resource"))
                .map(|entry_resource| resolve_one(entry_resource, &groups, graph, cache, fetcher)),
        )
        .await?;
        return Ok(resolved.into_iter().flatten().collect());
    }

    resolve_one(resource, &groups, graph, cache, fetcher).await
}

async fn resolve_one(
    resource: &mut Value,
    groups: &BTreeMap<usize, Vec<String>>,
    graph: bool,
    cache: &ReferenceCache,
    fetcher: &DynReferenceFetcher,
) -> SmartResult<References> {
    let mut references = References::new();

    for paths in groups.values() {
        let mut targets = Vec::new();
        for path in paths {
            collect_targets(resource, path, &mut targets);
        }

        let fetched = join_all(targets.iter().map(|target| async move {
            match &target.source {
                TargetSource::Contained(found) => Ok(found.clone()),
                TargetSource::Remote(reference) => {
                    cache.get_or_fetch(reference, fetcher).await.map(Some)
                }
            }
        }))
        .await;

        for (target, result) in targets.into_iter().zip(fetched) {
            let reference = match &target.source {
                TargetSource::Contained(_) => None,
                TargetSource::Remote(reference) => Some(reference.as_str()),
            };
            match result {
                Ok(Some(value)) => {
                    if graph {
                        set_path(resource, &target.write_path, value, false);
                    } else if let Some(reference) = reference {
                        references.insert(reference.to_string(), value);
                    }
                }
                Ok(None) => {
                    debug!(path = %target.write_path, "Contained reference not found");
                }
                Err(error) if error.is_not_found() => {
                    warn!(
                        path = %target.write_path,
                        reference,
                        "Missing reference: {error}"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    Ok(references)
}

/// Finds the `Reference` objects at `path`. `a..b` expands to `a.<i>.b` for
/// every element of the array at `a`.
fn collect_targets(resource: &Value, path: &str, targets: &mut Vec<Target>) {
    if let Some((prefix, rest)) = path.split_once("..") {
        let len = get_path(resource, prefix)
            .and_then(|node| node.as_array().map(Vec::len))
            .unwrap_or(0);
        for i in 0..len {
            collect_targets(resource, &format!("{prefix}.{i}.{rest}"), targets);
        }
        return;
    }

    match get_path(resource, path) {
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                if let Some(source) = target_source(resource, item) {
                    targets.push(Target {
                        write_path: format!("{path}.{i}"),
                        source,
                    });
                }
            }
        }
        Some(node) => {
            if let Some(source) = target_source(resource, &node) {
                targets.push(Target {
                    write_path: path.to_string(),
                    source,
                });
            }
        }
        None => {}
    }
}

fn target_source(resource: &Value, node: &Value) -> Option<TargetSource> {
    let reference = node.get("reference").and_then(Value::as_str)?;
    if let Some(id) = reference.strip_prefix('#') {
        let found = resource
            .get("contained")
            .and_then(Value::as_array)
            .and_then(|contained| {
                contained
                    .iter()
                    .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
            })
            .cloned();
        return Some(TargetSource::Contained(found));
    }
    Some(TargetSource::Remote(reference.to_string()))
}
