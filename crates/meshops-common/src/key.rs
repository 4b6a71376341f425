//! Resource key helpers
//!
//! Keys follow the `namespace/name` convention. Cluster-scoped objects have
//! no namespace and their key is just the name.

/// Build the queue key for an object
pub fn addon_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Split a queue key into (namespace, name)
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() => (Some(ns), name),
        Some((_, name)) => (None, name),
        None => (None, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_scoped_key_is_bare_name() {
        assert_eq!(addon_key(None, "mm-1"), "mm-1");
        assert_eq!(addon_key(Some(""), "mm-1"), "mm-1");
        assert_eq!(split_key("mm-1"), (None, "mm-1"));
    }

    #[test]
    fn namespaced_key_round_trips() {
        let key = addon_key(Some("tenant-a"), "mm-1");
        assert_eq!(key, "tenant-a/mm-1");
        assert_eq!(split_key(&key), (Some("tenant-a"), "mm-1"));
    }

    #[test]
    fn leading_slash_means_no_namespace() {
        assert_eq!(split_key("/mm-1"), (None, "mm-1"));
    }
}
