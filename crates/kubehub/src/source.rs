//! `ObjectSource` over the Kubernetes API via `kube`.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, ListParams, WatchParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tanjun_core::{ListSelector, Object, ObjectList, ObjectSource, SourceError, WatchEvent, WatchStream};
use tracing::debug;

/// Lists and watches a namespaced kind, in the selector's namespace or cluster-wide.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    watch_timeout_secs: u32,
}

/// kube rejects watch timeouts of 295s and above.
const MAX_WATCH_TIMEOUT_SECS: u32 = 294;

fn watch_timeout(secs: u32) -> u32 {
    secs.clamp(1, MAX_WATCH_TIMEOUT_SECS)
}

impl KubeSource {
    /// Watches time out server-side after 294s.
    pub fn new(client: Client) -> Self {
        Self { client, watch_timeout_secs: MAX_WATCH_TIMEOUT_SECS }
    }

    /// Server-side watch timeout, clamped to 1..=294s.
    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = watch_timeout(secs);
        self
    }

    fn api<K>(&self, selector: &ListSelector) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match selector.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

pub(crate) fn from_status(code: u16, message: String) -> SourceError {
    match code {
        410 => SourceError::StaleCursor(message),
        401 | 403 => SourceError::Permission(message),
        _ => SourceError::Transient(format!("{} ({})", message, code)),
    }
}

pub(crate) fn classify(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(resp) => from_status(resp.code, resp.message),
        kube::Error::SerdeError(e) => SourceError::Malformed(e.to_string()),
        other => SourceError::Transient(other.to_string()),
    }
}

fn translate<K>(ev: kube::api::WatchEvent<K>) -> Result<WatchEvent<K>, SourceError> {
    match ev {
        kube::api::WatchEvent::Added(o) => Ok(WatchEvent::Added(o)),
        kube::api::WatchEvent::Modified(o) => Ok(WatchEvent::Modified(o)),
        kube::api::WatchEvent::Deleted(o) => Ok(WatchEvent::Deleted(o)),
        kube::api::WatchEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        kube::api::WatchEvent::Error(e) => Err(from_status(e.code, e.message)),
    }
}

#[async_trait]
impl<K> ObjectSource<K> for KubeSource
where
    K: Object + Resource<Scope = NamespaceResourceScope> + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    async fn list(&self, selector: &ListSelector) -> Result<ObjectList<K>, SourceError> {
        let mut lp = ListParams::default();
        if !selector.labels.is_empty() {
            lp = lp.labels(&selector.labels.to_string());
        }
        let list = self.api::<K>(selector).list(&lp).await.map_err(classify)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(items = list.items.len(), rv = %resource_version, "kube list");
        Ok(ObjectList { items: list.items, resource_version })
    }

    async fn watch(&self, selector: &ListSelector, resource_version: &str) -> Result<WatchStream<K>, SourceError> {
        let mut wp = WatchParams::default().timeout(self.watch_timeout_secs);
        if !selector.labels.is_empty() {
            wp = wp.labels(&selector.labels.to_string());
        }
        let stream = self.api::<K>(selector).watch(&wp, resource_version).await.map_err(classify)?;
        Ok(stream
            .map(|res| match res {
                Ok(ev) => translate(ev),
                Err(e) => Err(classify(e)),
            })
            .boxed())
    }
}
