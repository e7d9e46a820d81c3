//! Handle-reference resolution
//!
//! Arrows reference node handles as `<node-id>:<handle-label>`, or as a bare
//! node id which addresses the `default` handle. Node ids may themselves
//! contain colons, so a reference is first tried as a whole id and only then
//! split on its last colon.

use std::collections::HashSet;

use crate::diagram::DEFAULT_HANDLE;

/// A resolved handle reference: an existing node id plus a handle label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRef {
    pub node_id: String,
    pub handle: String,
}

/// Resolve a handle reference against the set of known node ids.
pub fn resolve_handle(reference: &str, node_ids: &HashSet<String>) -> Result<HandleRef, String> {
    if node_ids.contains(reference) {
        return Ok(HandleRef {
            node_id: reference.to_string(),
            handle: DEFAULT_HANDLE.to_string(),
        });
    }

    if let Some(pos) = reference.rfind(':') {
        let (node_id, handle) = (&reference[..pos], &reference[pos + 1..]);
        if handle.is_empty() {
            return Err(format!("handle reference '{reference}' has an empty handle label"));
        }
        if node_ids.contains(node_id) {
            return Ok(HandleRef {
                node_id: node_id.to_string(),
                handle: handle.to_string(),
            });
        }
        return Err(format!(
            "handle reference '{reference}' names unknown node '{node_id}'"
        ));
    }

    Err(format!("handle reference '{reference}' names unknown node"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bare_node_id_uses_default_handle() {
        let r = resolve_handle("node-1", &ids(&["node-1"])).unwrap();
        assert_eq!(r.node_id, "node-1");
        assert_eq!(r.handle, DEFAULT_HANDLE);
    }

    #[test]
    fn test_labelled_handle() {
        let r = resolve_handle("cond:condtrue", &ids(&["cond"])).unwrap();
        assert_eq!(r.node_id, "cond");
        assert_eq!(r.handle, "condtrue");
    }

    #[test]
    fn test_node_id_containing_colon_prefers_whole_id() {
        let r = resolve_handle("ns:node", &ids(&["ns:node"])).unwrap();
        assert_eq!(r.node_id, "ns:node");
        assert_eq!(r.handle, DEFAULT_HANDLE);
    }

    #[test]
    fn test_splits_on_last_colon() {
        let r = resolve_handle("ns:node:out", &ids(&["ns:node"])).unwrap();
        assert_eq!(r.node_id, "ns:node");
        assert_eq!(r.handle, "out");
    }

    #[test]
    fn test_unknown_node_errors() {
        assert!(resolve_handle("ghost", &ids(&["node-1"])).is_err());
        assert!(resolve_handle("ghost:out", &ids(&["node-1"])).is_err());
    }
}
