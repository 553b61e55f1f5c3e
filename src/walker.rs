//! Depth-bounded traversal of JSON trees.
//!
//! Object members are reported to a sink together with their dotted path from
//! the root (`data.user.token`, array elements as `items[0]`) whenever the key
//! predicate accepts the member name. `walk` continues below accepted keys;
//! `walk_mut` hands the whole accepted subtree to the sink instead.

use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub struct TreeWalker {
    max_depth: usize,
}

impl TreeWalker {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn walk<P, S>(&self, root: &Value, key_pred: &mut P, sink: &mut S)
    where
        P: FnMut(&str) -> bool,
        S: FnMut(&str, &Value),
    {
        self.visit(root, "", 0, key_pred, sink);
    }

    /// Like `walk`, but the sink may rewrite accepted values in place. The
    /// sink owns an accepted subtree; traversal does not descend into it.
    pub fn walk_mut<P, S>(&self, root: &mut Value, key_pred: &mut P, sink: &mut S)
    where
        P: FnMut(&str) -> bool,
        S: FnMut(&str, &mut Value),
    {
        self.visit_mut(root, "", 0, key_pred, sink);
    }

    fn visit<P, S>(&self, value: &Value, path: &str, depth: usize, key_pred: &mut P, sink: &mut S)
    where
        P: FnMut(&str) -> bool,
        S: FnMut(&str, &Value),
    {
        if depth > self.max_depth {
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path = join_key(path, key);
                    if key_pred(key) {
                        sink(&child_path, child);
                    }
                    self.visit(child, &child_path, depth + 1, key_pred, sink);
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    let child_path = join_index(path, index);
                    self.visit(child, &child_path, depth + 1, key_pred, sink);
                }
            }
            _ => {}
        }
    }

    fn visit_mut<P, S>(
        &self,
        value: &mut Value,
        path: &str,
        depth: usize,
        key_pred: &mut P,
        sink: &mut S,
    ) where
        P: FnMut(&str) -> bool,
        S: FnMut(&str, &mut Value),
    {
        if depth > self.max_depth {
            return;
        }
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    let child_path = join_key(path, key);
                    if key_pred(key) {
                        sink(&child_path, child);
                    } else {
                        self.visit_mut(child, &child_path, depth + 1, key_pred, sink);
                    }
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter_mut().enumerate() {
                    let child_path = join_index(path, index);
                    self.visit_mut(child, &child_path, depth + 1, key_pred, sink);
                }
            }
            _ => {}
        }
    }

    /// Replace every object or array nested past the depth bound with `marker`.
    pub fn prune(&self, root: &mut Value, marker: &Value) {
        prune_at(root, 0, self.max_depth, marker);
    }
}

fn prune_at(value: &mut Value, depth: usize, max_depth: usize, marker: &Value) {
    if depth > max_depth && (value.is_object() || value.is_array()) {
        *value = marker.clone();
        return;
    }
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                prune_at(child, depth + 1, max_depth, marker);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                prune_at(child, depth + 1, max_depth, marker);
            }
        }
        _ => {}
    }
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn join_index(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(value: &Value, depth: usize) -> Vec<String> {
        let mut seen = Vec::new();
        TreeWalker::new(depth).walk(value, &mut |k| k == "token", &mut |path, _| {
            seen.push(path.to_string())
        });
        seen
    }

    #[test]
    fn test_paths_are_dotted_from_root() {
        let value = json!({
            "token": "a",
            "data": {"user": {"token": "b"}},
            "items": [{"token": "c"}, {"other": 1}]
        });
        assert_eq!(collect(&value, 10), vec!["token", "data.user.token", "items[0].token"]);
    }

    #[test]
    fn test_depth_bound_stops_descent() {
        let value = json!({"a": {"b": {"c": {"token": "deep"}}}, "token": "top"});
        assert_eq!(collect(&value, 1), vec!["token"]);
        assert_eq!(collect(&value, 3), vec!["a.b.c.token", "token"]);
    }

    #[test]
    fn test_walk_mut_rewrites_values() {
        let mut value = json!({"token": "secret", "nested": {"token": "x"}});
        TreeWalker::new(10).walk_mut(&mut value, &mut |k| k == "token", &mut |_, v| {
            *v = Value::String("redacted".to_string())
        });
        assert_eq!(value, json!({"token": "redacted", "nested": {"token": "redacted"}}));
    }

    #[test]
    fn test_walk_mut_hands_over_accepted_subtrees() {
        let mut value = json!({"auth": {"token": "a", "list": ["b"]}, "other": {"token": "c"}});
        let mut paths = Vec::new();
        TreeWalker::new(10).walk_mut(
            &mut value,
            &mut |k| k == "auth" || k == "token",
            &mut |path, v| {
                paths.push(path.to_string());
                *v = Value::Null;
            },
        );
        assert_eq!(paths, vec!["auth", "other.token"]);
        assert_eq!(value, json!({"auth": null, "other": {"token": null}}));
    }

    #[test]
    fn test_prune_replaces_containers_past_the_bound() {
        let mut value = json!({"a": {"b": {"c": 1}}, "list": [[1, 2]], "n": 3});
        TreeWalker::new(1).prune(&mut value, &json!("<cut>"));
        assert_eq!(value, json!({"a": {"b": "<cut>"}, "list": ["<cut>"], "n": 3}));
    }

    #[test]
    fn test_scalars_are_ignored() {
        assert!(collect(&json!("token"), 10).is_empty());
        assert!(collect(&Value::Null, 10).is_empty());
    }
}
