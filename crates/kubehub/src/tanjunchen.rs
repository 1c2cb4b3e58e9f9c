//! The `Tanjunchen` custom resource (`crd.tanjunchen.io/v1`).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use tanjun_core::{Object, ObjectKey};

use crate::memory::Versioned;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "crd.tanjunchen.io",
    version = "v1",
    kind = "Tanjunchen",
    plural = "tanjunchens",
    namespaced,
    schema = "disabled",
    derive = "PartialEq"
)]
pub struct TanjunchenSpec {
    pub name: String,
    /// Serialized as `value` on the wire.
    #[serde(rename = "value")]
    pub location: String,
    pub age: i32,
    pub occupations: String,
}

impl Tanjunchen {
    /// A `Tanjunchen` in `namespace`, without a resource version.
    pub fn namespaced(namespace: &str, name: &str, spec: TanjunchenSpec) -> Self {
        let mut t = Tanjunchen::new(name, spec);
        t.metadata.namespace = Some(namespace.to_string());
        t
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.to_string());
        self
    }
}

impl Object for Tanjunchen {
    fn key(&self) -> ObjectKey {
        ObjectKey::new(self.metadata.namespace.as_deref(), &self.name_any())
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.labels.as_ref()
    }
}

impl Versioned for Tanjunchen {
    fn set_resource_version(&mut self, rv: String) {
        self.metadata.resource_version = Some(rv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_value_for_location() {
        let raw = serde_json::json!({
            "apiVersion": "crd.tanjunchen.io/v1",
            "kind": "Tanjunchen",
            "metadata": { "name": "tj", "namespace": "test", "resourceVersion": "42" },
            "spec": { "name": "tanjunchen", "value": "shenzhen", "age": 27, "occupations": "engineer" }
        });
        let t: Tanjunchen = serde_json::from_value(raw).unwrap();
        assert_eq!(t.spec.location, "shenzhen");
        assert_eq!(t.key(), ObjectKey::namespaced("test", "tj"));
        assert_eq!(Object::resource_version(&t), Some("42"));

        let back = serde_json::to_value(&t).unwrap();
        assert_eq!(back["spec"]["value"], "shenzhen");
    }
}
