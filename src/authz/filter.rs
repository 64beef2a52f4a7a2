//! Response filtering for reads, lists and watches.
//!
//! While the upstream request is in flight, prefilter tasks stream
//! LookupResources results into an allowed-set channel. The response filter
//! owns the receiving ends: it intersects upstream items with the allowed
//! set, and for watches it rewrites the event stream, synthesizing DELETED
//! events when access is revoked mid-watch.
//!
//! The per-request authz data is never shared mutably: prefilter tasks only
//! write to channel senders, the filter only reads.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::expr::{evaluate, Bindings, Expr};
use crate::rules::CompiledRule;
use crate::spicedb::{LookupRequest, PermissionClient, RelationshipOp};

use super::input::AuthzInput;
use super::AuthzError;

/// Identity of an object within a collection response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("upstream response is not a collection")]
    NotACollection,

    #[error("failed to decode upstream response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("upstream read error: {0}")]
    Upstream(String),
}

/// A rendered prefilter: the lookup to run and the expressions that turn
/// each streamed resource ID into an allowed identity.
#[derive(Clone)]
struct RenderedPreFilter {
    lookup: LookupRequest,
    name_expr: Expr,
    namespace_expr: Option<Expr>,
}

/// Per-request authorization data for the filter path. Created before the
/// upstream request is issued; the allowed channel closes once every
/// lookup stream has finished (watches keep it open for live updates).
pub struct AuthzData {
    allowed_rx: mpsc::UnboundedReceiver<NamespacedName>,
    removed_rx: mpsc::UnboundedReceiver<NamespacedName>,
    allowed: HashSet<NamespacedName>,
}

impl std::fmt::Debug for AuthzData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthzData")
            .field("allowed", &self.allowed)
            .finish()
    }
}

impl AuthzData {
    /// Start the prefilter machinery for a request.
    ///
    /// Lookup and watch RPCs are initiated here so connection failures
    /// surface as retryable denials before anything reaches the upstream;
    /// stream consumption happens on spawned tasks.
    pub async fn build(
        rules: &[&CompiledRule],
        input: &AuthzInput,
        client: Arc<dyn PermissionClient>,
    ) -> Result<Self, AuthzError> {
        let bindings = input.bindings();
        let is_watch = input.request.verb == "watch";

        let mut prefilters = Vec::new();
        for rule in rules {
            for prefilter in &rule.prefilters {
                prefilters.push(RenderedPreFilter {
                    lookup: prefilter.lookup.render_lookup(&bindings)?,
                    name_expr: prefilter.name_expr.clone(),
                    namespace_expr: prefilter.namespace_expr.clone(),
                });
            }
        }

        let (allowed_tx, allowed_rx) = mpsc::unbounded_channel();
        let (removed_tx, removed_rx) = mpsc::unbounded_channel();

        if prefilters.is_empty() {
            // The checks already authorized this request. A get of a single
            // named object is admitted as-is; collection requests have no
            // identities to admit.
            if input.request.verb == "get" && !input.request.name.is_empty() {
                let _ = allowed_tx.send(NamespacedName {
                    namespace: input.request.namespace.clone(),
                    name: input.request.name.clone(),
                });
            }
            return Ok(Self::new(allowed_rx, removed_rx));
        }

        // Initiate every lookup before spawning consumers.
        let mut streams = Vec::new();
        for prefilter in &prefilters {
            let stream = client
                .lookup_resources(&prefilter.lookup)
                .await
                .map_err(|e| AuthzError::ReBacUnavailable(e.to_string()))?;
            streams.push((prefilter.clone(), stream));
        }

        if is_watch {
            let object_types: Vec<String> = prefilters
                .iter()
                .map(|p| p.lookup.resource_type.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let updates = client
                .watch_relationships(object_types)
                .await
                .map_err(|e| AuthzError::ReBacUnavailable(e.to_string()))?;

            let watch_allowed = allowed_tx.clone();
            let watch_removed = removed_tx.clone();
            let watch_prefilters = prefilters.clone();
            let watch_bindings = bindings.clone();
            tokio::spawn(async move {
                let mut updates = updates;
                while let Some(update) = updates.next().await {
                    let update = match update {
                        Ok(update) => update,
                        Err(e) => {
                            warn!(error = %e, "relationship watch ended");
                            break;
                        }
                    };
                    let Some(prefilter) = watch_prefilters
                        .iter()
                        .find(|p| p.lookup.resource_type == update.relationship.resource_type)
                    else {
                        continue;
                    };
                    let Some(identity) = extract_identity(
                        &watch_bindings,
                        prefilter,
                        &update.relationship.resource_id,
                    ) else {
                        continue;
                    };
                    let result = match update.operation {
                        RelationshipOp::Create | RelationshipOp::Touch => {
                            watch_allowed.send(identity)
                        }
                        RelationshipOp::Delete => watch_removed.send(identity),
                    };
                    if result.is_err() {
                        break;
                    }
                }
            });
        }

        // One coordinator consumes all lookup streams; dropping its sender
        // closes the allowed channel for list and get requests.
        tokio::spawn(async move {
            let consumers = streams.into_iter().map(|(prefilter, mut stream)| {
                let tx = allowed_tx.clone();
                let bindings = bindings.clone();
                async move {
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(resource_id) => {
                                if let Some(identity) =
                                    extract_identity(&bindings, &prefilter, &resource_id)
                                {
                                    if tx.send(identity).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "lookup stream ended early");
                                return;
                            }
                        }
                    }
                }
            });
            futures::future::join_all(consumers).await;
        });

        Ok(Self::new(allowed_rx, removed_rx))
    }

    fn new(
        allowed_rx: mpsc::UnboundedReceiver<NamespacedName>,
        removed_rx: mpsc::UnboundedReceiver<NamespacedName>,
    ) -> Self {
        Self {
            allowed_rx,
            removed_rx,
            allowed: HashSet::new(),
        }
    }

    /// Decide a single-object response: block on the allowed channel until
    /// the identity arrives or every prefilter has finished.
    pub async fn allow_single(&mut self, identity: &NamespacedName) -> bool {
        if self.allowed.contains(identity) {
            return true;
        }
        while let Some(admitted) = self.allowed_rx.recv().await {
            let hit = admitted == *identity;
            self.allowed.insert(admitted);
            if hit {
                return true;
            }
        }
        false
    }

    /// Filter a collection body, keeping upstream item order and the
    /// collection's `resourceVersion` untouched.
    pub async fn filter_list(&mut self, body: &[u8]) -> Result<Vec<u8>, FilterError> {
        while let Some(admitted) = self.allowed_rx.recv().await {
            self.allowed.insert(admitted);
        }

        let mut doc: Value = serde_json::from_slice(body)?;
        let items = doc
            .get_mut("items")
            .and_then(Value::as_array_mut)
            .ok_or(FilterError::NotACollection)?;
        let before = items.len();
        items.retain(|item| {
            item_identity(item)
                .map(|identity| self.allowed.contains(&identity))
                .unwrap_or(false)
        });
        let kept = items.len();
        crate::metrics::record_filtered(kept, before - kept);
        debug!(kept, dropped = before - kept, "filtered collection response");
        Ok(serde_json::to_vec(&doc)?)
    }

    /// Rewrite a newline-delimited watch event stream.
    ///
    /// Events for allowed identities are forwarded byte-for-byte in upstream
    /// order. Events for identities not (yet) allowed are held until the
    /// allowed channel admits them. A removal observed on the removed
    /// channel synthesizes exactly one DELETED event for that identity.
    pub async fn filter_watch<S, E>(self, mut upstream: S, tx: mpsc::Sender<Bytes>)
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let Self {
            mut allowed_rx,
            mut removed_rx,
            mut allowed,
        } = self;
        let mut buffer: Vec<u8> = Vec::new();
        let mut pending: HashMap<NamespacedName, Vec<String>> = HashMap::new();
        let mut allowed_open = true;
        let mut removed_open = true;

        loop {
            tokio::select! {
                admitted = allowed_rx.recv(), if allowed_open => match admitted {
                    Some(identity) => {
                        allowed.insert(identity.clone());
                        if let Some(lines) = pending.remove(&identity) {
                            for line in lines {
                                if !send_line(&tx, line).await {
                                    return;
                                }
                            }
                        }
                    }
                    None => allowed_open = false,
                },
                removed = removed_rx.recv(), if removed_open => match removed {
                    Some(identity) => {
                        pending.remove(&identity);
                        // Synthesize one DELETED per allowed-to-removed
                        // transition.
                        if allowed.remove(&identity) {
                            let event = serde_json::json!({
                                "type": "DELETED",
                                "object": {
                                    "metadata": {
                                        "name": identity.name,
                                        "namespace": identity.namespace,
                                    }
                                }
                            });
                            if !send_line(&tx, event.to_string()).await {
                                return;
                            }
                        }
                    }
                    None => removed_open = false,
                },
                chunk = upstream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        buffer.extend_from_slice(&bytes);
                        for line in drain_lines(&mut buffer) {
                            if !handle_watch_line(&allowed, &mut pending, line, &tx).await {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream watch stream failed");
                        return;
                    }
                    None => return,
                },
            }
        }
    }
}

/// Forward, hold or drop one upstream watch event line.
async fn handle_watch_line(
    allowed: &HashSet<NamespacedName>,
    pending: &mut HashMap<NamespacedName, Vec<String>>,
    line: String,
    tx: &mpsc::Sender<Bytes>,
) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    let event: Value = match serde_json::from_str(&line) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "undecodable watch event; dropping");
            return true;
        }
    };
    let Some(identity) = event.get("object").and_then(item_identity) else {
        return true;
    };
    if allowed.contains(&identity) {
        send_line(tx, line).await
    } else {
        // Not allowed yet; the allowed channel may still admit it.
        pending.entry(identity).or_default().push(line);
        true
    }
}

/// Evaluate the prefilter's extractor expressions against a looked-up
/// resource ID.
fn extract_identity(
    bindings: &Bindings,
    prefilter: &RenderedPreFilter,
    resource_id: &str,
) -> Option<NamespacedName> {
    let mut bindings = bindings.clone();
    bindings.insert("resourceId", Value::String(resource_id.to_string()));

    let name = match evaluate(&prefilter.name_expr, &bindings) {
        Ok(Value::String(name)) => name,
        Ok(other) => other.to_string(),
        Err(e) => {
            warn!(resource_id, error = %e, "name extractor failed; skipping identity");
            return None;
        }
    };
    let namespace = match &prefilter.namespace_expr {
        None => String::new(),
        Some(expr) => match evaluate(expr, &bindings) {
            Ok(Value::String(namespace)) => namespace,
            Ok(other) => other.to_string(),
            Err(e) => {
                warn!(resource_id, error = %e, "namespace extractor failed; skipping identity");
                return None;
            }
        },
    };
    Some(NamespacedName { namespace, name })
}

/// Identity of one collection item from its metadata.
fn item_identity(item: &Value) -> Option<NamespacedName> {
    let name = item.pointer("/metadata/name")?.as_str()?.to_string();
    let namespace = item
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(NamespacedName { namespace, name })
}

/// Split complete newline-terminated lines out of the buffer.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
    }
    lines
}

async fn send_line(tx: &mpsc::Sender<Bytes>, mut line: String) -> bool {
    line.push('\n');
    tx.send(Bytes::from(line)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nn(namespace: &str, name: &str) -> NamespacedName {
        NamespacedName {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn authz_data_with(
        allowed: Vec<NamespacedName>,
    ) -> (AuthzData, mpsc::UnboundedSender<NamespacedName>, mpsc::UnboundedSender<NamespacedName>) {
        let (allowed_tx, allowed_rx) = mpsc::unbounded_channel();
        let (removed_tx, removed_rx) = mpsc::unbounded_channel();
        for identity in allowed {
            allowed_tx.send(identity).unwrap();
        }
        (AuthzData::new(allowed_rx, removed_rx), allowed_tx, removed_tx)
    }

    fn pod_list() -> Vec<u8> {
        serde_json::json!({
            "kind": "PodList",
            "apiVersion": "v1",
            "metadata": {"resourceVersion": "12345"},
            "items": [
                {"metadata": {"name": "a", "namespace": "ns"}},
                {"metadata": {"name": "b", "namespace": "ns"}},
                {"metadata": {"name": "c", "namespace": "ns"}},
            ]
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_list_filtering_keeps_order_and_resource_version() {
        let (mut data, allowed_tx, _removed_tx) =
            authz_data_with(vec![nn("ns", "a"), nn("ns", "b")]);
        drop(allowed_tx);

        let filtered = data.filter_list(&pod_list()).await.unwrap();
        let doc: Value = serde_json::from_slice(&filtered).unwrap();
        let names: Vec<&str> = doc["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i.pointer("/metadata/name").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(doc.pointer("/metadata/resourceVersion").unwrap(), "12345");
    }

    #[tokio::test]
    async fn test_get_blocks_until_allowed() {
        let (mut data, allowed_tx, _removed_tx) = authz_data_with(vec![]);

        let admit = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            allowed_tx.send(nn("ns", "web-0")).unwrap();
            drop(allowed_tx);
        });

        assert!(data.allow_single(&nn("ns", "web-0")).await);
        admit.await.unwrap();
    }

    #[tokio::test]
    async fn test_get_denied_when_channel_closes_without_match() {
        let (mut data, allowed_tx, _removed_tx) = authz_data_with(vec![nn("ns", "other")]);
        drop(allowed_tx);
        assert!(!data.allow_single(&nn("ns", "web-0")).await);
    }

    #[tokio::test]
    async fn test_watch_forwards_allowed_and_synthesizes_deletes() {
        let (data, allowed_tx, removed_tx) = authz_data_with(vec![nn("ns", "a")]);

        let (up_tx, up_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let upstream = tokio_stream::wrappers::ReceiverStream::new(up_rx);

        let (tx, mut rx) = mpsc::channel(16);
        let filter = tokio::spawn(async move { data.filter_watch(upstream, tx).await });

        up_tx
            .send(Ok(Bytes::from(
                r#"{"type":"ADDED","object":{"metadata":{"name":"a","namespace":"ns"}}}"#
                    .to_string()
                    + "\n",
            )))
            .await
            .unwrap();
        up_tx
            .send(Ok(Bytes::from(
                r#"{"type":"ADDED","object":{"metadata":{"name":"hidden","namespace":"ns"}}}"#
                    .to_string()
                    + "\n",
            )))
            .await
            .unwrap();

        // Only the allowed identity's event comes through.
        let first = rx.recv().await.unwrap();
        let event: Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(event["type"], "ADDED");
        assert_eq!(event.pointer("/object/metadata/name").unwrap(), "a");

        // Revoking access synthesizes exactly one DELETED event.
        removed_tx.send(nn("ns", "a")).unwrap();
        let second = rx.recv().await.unwrap();
        let event: Value = serde_json::from_slice(&second).unwrap();
        assert_eq!(event["type"], "DELETED");
        assert_eq!(event.pointer("/object/metadata/name").unwrap(), "a");

        // A second removal of the same identity emits nothing.
        removed_tx.send(nn("ns", "a")).unwrap();
        drop(removed_tx);
        drop(allowed_tx);
        drop(up_tx);
        assert!(rx.recv().await.is_none());
        filter.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_holds_events_until_admitted() {
        let (data, allowed_tx, removed_tx) = authz_data_with(vec![]);

        let events = vec![Ok::<_, std::io::Error>(Bytes::from(
            r#"{"type":"MODIFIED","object":{"metadata":{"name":"late","namespace":"ns"}}}"#
                .to_string()
                + "\n",
        ))];
        let upstream = futures::stream::iter(events)
            .chain(futures::stream::pending());

        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(async move { data.filter_watch(upstream, tx).await });

        // Nothing is emitted until the identity is admitted.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        allowed_tx.send(nn("ns", "late")).unwrap();
        let held = rx.recv().await.unwrap();
        let event: Value = serde_json::from_slice(&held).unwrap();
        assert_eq!(event["type"], "MODIFIED");
        drop(removed_tx);
    }
}
