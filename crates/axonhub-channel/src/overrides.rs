use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One request rewrite applied before dispatch. Header paths are
/// case-insensitive tokens; body paths are dotted JSON paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OverrideOp {
    Set { path: String, value: Value },
    Delete { path: String },
    Rename { from: String, to: String },
    Copy { from: String, to: String },
}

impl OverrideOp {
    /// Path used for fold-on-merge; `rename`/`copy` never fold.
    fn fold_path(&self) -> Option<&str> {
        match self {
            OverrideOp::Set { path, .. } | OverrideOp::Delete { path } => Some(path),
            OverrideOp::Rename { .. } | OverrideOp::Copy { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOverrideError {
    ReservedPath(&'static str),
}

impl std::fmt::Display for MergeOverrideError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeOverrideError::ReservedPath(path) => {
                write!(f, "override path is reserved: {path}")
            }
        }
    }
}

impl std::error::Error for MergeOverrideError {}

/// The `stream` field is owned by the executor; templates may not touch it.
pub fn validate_body_ops(ops: &[OverrideOp]) -> Result<(), MergeOverrideError> {
    for op in ops {
        let touches_stream = match op {
            OverrideOp::Set { path, .. } | OverrideOp::Delete { path } => path == "stream",
            OverrideOp::Rename { from, to } | OverrideOp::Copy { from, to } => {
                from == "stream" || to == "stream"
            }
        };
        if touches_stream {
            return Err(MergeOverrideError::ReservedPath("stream"));
        }
    }
    Ok(())
}

/// Merge a template's operations over an existing list: `set`/`delete` with
/// a matching path replace in place, everything else appends.
pub fn merge_override_ops(existing: &[OverrideOp], template: &[OverrideOp]) -> Vec<OverrideOp> {
    let mut merged = existing.to_vec();
    for op in template {
        match op.fold_path() {
            Some(path) => {
                let slot = merged
                    .iter()
                    .position(|candidate| candidate.fold_path() == Some(path));
                match slot {
                    Some(position) => merged[position] = op.clone(),
                    None => merged.push(op.clone()),
                }
            }
            None => merged.push(op.clone()),
        }
    }
    merged
}

/// Apply header operations; lookup is case-insensitive, writes keep the
/// operation's casing.
pub fn apply_header_ops(headers: &mut Vec<(String, String)>, ops: &[OverrideOp]) {
    for op in ops {
        match op {
            OverrideOp::Set { path, value } => {
                let value = value_as_header(value);
                headers.retain(|(name, _)| !name.eq_ignore_ascii_case(path));
                headers.push((path.clone(), value));
            }
            OverrideOp::Delete { path } => {
                headers.retain(|(name, _)| !name.eq_ignore_ascii_case(path));
            }
            OverrideOp::Rename { from, to } => {
                let mut moved = Vec::new();
                headers.retain(|(name, value)| {
                    if name.eq_ignore_ascii_case(from) {
                        moved.push(value.clone());
                        false
                    } else {
                        true
                    }
                });
                for value in moved {
                    headers.push((to.clone(), value));
                }
            }
            OverrideOp::Copy { from, to } => {
                let copied: Vec<String> = headers
                    .iter()
                    .filter(|(name, _)| name.eq_ignore_ascii_case(from))
                    .map(|(_, value)| value.clone())
                    .collect();
                for value in copied {
                    headers.push((to.clone(), value));
                }
            }
        }
    }
}

fn value_as_header(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Apply body operations to a JSON object using dotted paths.
pub fn apply_body_ops(body: &mut Value, ops: &[OverrideOp]) {
    for op in ops {
        match op {
            OverrideOp::Set { path, value } => {
                set_path(body, path, value.clone());
            }
            OverrideOp::Delete { path } => {
                delete_path(body, path);
            }
            OverrideOp::Rename { from, to } => {
                if let Some(value) = take_path(body, from) {
                    set_path(body, to, value);
                }
            }
            OverrideOp::Copy { from, to } => {
                if let Some(value) = get_path(body, from).cloned() {
                    set_path(body, to, value);
                }
            }
        }
    }
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let object = current.as_object_mut().expect("object ensured above");
        if segments.peek().is_none() {
            object.insert(segment.to_string(), value);
            return;
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn delete_path(root: &mut Value, path: &str) {
    take_path(root, path);
}

fn take_path(root: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(parent_path) => get_path_mut(root, parent_path)?,
        None => root,
    };
    parent.as_object_mut()?.remove(leaf)
}

fn get_path_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

/// Legacy single-string form: a JSON object whose fields become `set` ops.
pub fn parse_legacy_parameters(raw: &str) -> Vec<OverrideOp> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    map.into_iter()
        .map(|(path, value)| OverrideOp::Set { path, value })
        .collect()
}

/// Legacy `Name: value` header lines.
pub fn parse_legacy_headers(lines: &[String]) -> Vec<OverrideOp> {
    lines
        .iter()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(OverrideOp::Set {
                path: name.to_string(),
                value: Value::String(value.trim().to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(path: &str, value: Value) -> OverrideOp {
        OverrideOp::Set {
            path: path.to_string(),
            value,
        }
    }

    #[test]
    fn merge_folds_set_by_path_and_appends_new() {
        let existing = vec![set("temperature", json!(0.7)), set("top_p", json!(0.9))];
        let template = vec![set("temperature", json!(0.9)), set("max_tokens", json!(2000))];
        let merged = merge_override_ops(&existing, &template);
        assert_eq!(
            merged,
            vec![
                set("temperature", json!(0.9)),
                set("top_p", json!(0.9)),
                set("max_tokens", json!(2000)),
            ]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = vec![
            set("temperature", json!(0.7)),
            OverrideOp::Rename {
                from: "a".to_string(),
                to: "b".to_string(),
            },
        ];
        let template = vec![
            set("temperature", json!(0.9)),
            OverrideOp::Delete {
                path: "top_k".to_string(),
            },
        ];
        let once = merge_override_ops(&existing, &template);
        let twice = merge_override_ops(&once, &template);
        assert_eq!(once, twice);
    }

    #[test]
    fn rename_and_copy_always_append() {
        let rename = OverrideOp::Rename {
            from: "a".to_string(),
            to: "b".to_string(),
        };
        let merged = merge_override_ops(&[rename.clone()], &[rename.clone()]);
        assert_eq!(merged, vec![rename.clone(), rename]);
    }

    #[test]
    fn stream_path_is_reserved() {
        assert!(validate_body_ops(&[set("stream", json!(true))]).is_err());
        assert!(validate_body_ops(&[OverrideOp::Rename {
            from: "x".to_string(),
            to: "stream".to_string(),
        }])
        .is_err());
        assert!(validate_body_ops(&[set("temperature", json!(1))]).is_ok());
    }

    #[test]
    fn body_ops_follow_dotted_paths() {
        let mut body = json!({"generation": {"temperature": 0.2}, "user": "u1"});
        apply_body_ops(
            &mut body,
            &[
                set("generation.top_p", json!(0.5)),
                OverrideOp::Delete {
                    path: "generation.temperature".to_string(),
                },
                OverrideOp::Rename {
                    from: "user".to_string(),
                    to: "metadata.user".to_string(),
                },
            ],
        );
        assert_eq!(
            body,
            json!({"generation": {"top_p": 0.5}, "metadata": {"user": "u1"}})
        );
    }

    #[test]
    fn header_ops_match_case_insensitively() {
        let mut headers = vec![("X-Custom".to_string(), "1".to_string())];
        apply_header_ops(
            &mut headers,
            &[
                set("x-custom", json!("2")),
                OverrideOp::Copy {
                    from: "X-CUSTOM".to_string(),
                    to: "x-copy".to_string(),
                },
            ],
        );
        assert_eq!(
            headers,
            vec![
                ("x-custom".to_string(), "2".to_string()),
                ("x-copy".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn legacy_forms_become_set_ops() {
        let params = parse_legacy_parameters(r#"{"temperature": 0.5}"#);
        assert_eq!(params, vec![set("temperature", json!(0.5))]);
        let headers = parse_legacy_headers(&["X-Env: prod".to_string()]);
        assert_eq!(headers, vec![set("X-Env", json!("prod"))]);
    }
}
