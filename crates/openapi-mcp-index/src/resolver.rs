use serde_json::{Map, Value, json};

/// Resolves `$ref` pointers against the document root and merges composite
/// schemas into self-contained values.
///
/// Reference cycles are not expanded: when a `$ref` is already on the
/// resolution stack the value is replaced by a marker object carrying
/// `x-circular-ref` so consumers can render a placeholder instead of
/// recursing forever.
pub(crate) struct Resolver<'a> {
    root: &'a Value,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(root: &'a Value) -> Self {
        Self { root }
    }

    pub(crate) fn resolve(&self, value: &Value) -> Value {
        self.resolve_inner(value, &mut Vec::new())
    }

    fn resolve_inner(&self, value: &Value, stack: &mut Vec<String>) -> Value {
        match value {
            Value::Object(obj) => {
                if let Some(Value::String(reference)) = obj.get("$ref") {
                    return self.resolve_ref(reference, stack);
                }
                let mut resolved = Map::with_capacity(obj.len());
                for (key, val) in obj {
                    resolved.insert(key.clone(), self.resolve_inner(val, stack));
                }
                let mut resolved = Value::Object(resolved);
                self.merge_all_of(&mut resolved);
                resolved
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_inner(item, stack))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_ref(&self, reference: &str, stack: &mut Vec<String>) -> Value {
        if stack.iter().any(|seen| seen == reference) {
            return json!({ "x-circular-ref": reference });
        }
        let Some(pointer) = reference.strip_prefix('#') else {
            // External references are out of scope; leave a marker behind.
            return json!({ "x-unresolved-ref": reference });
        };
        let Some(target) = self.root.pointer(pointer) else {
            return json!({ "x-unresolved-ref": reference });
        };
        stack.push(reference.to_string());
        let resolved = self.resolve_inner(target, stack);
        stack.pop();
        resolved
    }

    /// Collapse `allOf` into a single object schema: properties are unioned,
    /// `required` lists concatenated, scalar keywords taken first-wins.
    /// `anyOf`/`oneOf` branches stay in place (already resolved) so callers
    /// see the full union.
    fn merge_all_of(&self, value: &mut Value) {
        let Some(obj) = value.as_object_mut() else {
            return;
        };
        let Some(Value::Array(branches)) = obj.remove("allOf") else {
            return;
        };

        let mut merged = Map::new();
        let mut properties = Map::new();
        let mut required: Vec<Value> = Vec::new();

        for branch in branches {
            let Value::Object(branch) = branch else {
                continue;
            };
            for (key, val) in branch {
                match key.as_str() {
                    "properties" => {
                        if let Value::Object(props) = val {
                            for (name, schema) in props {
                                properties.entry(name).or_insert(schema);
                            }
                        }
                    }
                    "required" => {
                        if let Value::Array(names) = val {
                            for name in names {
                                if !required.contains(&name) {
                                    required.push(name);
                                }
                            }
                        }
                    }
                    _ => {
                        merged.entry(key).or_insert(val);
                    }
                }
            }
        }

        // Keywords set directly on the parent win over allOf branches.
        for (key, val) in std::mem::take(obj) {
            match key.as_str() {
                "properties" => {
                    if let Value::Object(props) = val {
                        for (name, schema) in props {
                            properties.insert(name, schema);
                        }
                    }
                }
                "required" => {
                    if let Value::Array(names) = val {
                        for name in names {
                            if !required.contains(&name) {
                                required.push(name);
                            }
                        }
                    }
                }
                _ => {
                    merged.insert(key, val);
                }
            }
        }

        if !properties.is_empty() {
            merged.insert("properties".to_string(), Value::Object(properties));
            merged
                .entry("type".to_string())
                .or_insert_with(|| Value::String("object".to_string()));
        }
        if !required.is_empty() {
            merged.insert("required".to_string(), Value::Array(required));
        }

        *obj = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Value {
        json!({
            "components": {
                "schemas": {
                    "Badge": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "integer" },
                            "owner": { "$ref": "#/components/schemas/User" }
                        }
                    },
                    "User": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "manager": { "$ref": "#/components/schemas/User" }
                        }
                    },
                    "Named": { "type": "object", "properties": { "name": { "type": "string" } }, "required": ["name"] },
                    "Badged": {
                        "allOf": [
                            { "$ref": "#/components/schemas/Named" },
                            { "type": "object", "properties": { "badge": { "type": "string" } }, "required": ["badge"] }
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn resolves_nested_refs() {
        let root = doc();
        let resolver = Resolver::new(&root);
        let resolved = resolver.resolve(&json!({ "$ref": "#/components/schemas/Badge" }));
        assert_eq!(
            resolved.pointer("/properties/owner/properties/name/type"),
            Some(&json!("string"))
        );
    }

    #[test]
    fn marks_cycles_instead_of_recursing() {
        let root = doc();
        let resolver = Resolver::new(&root);
        let resolved = resolver.resolve(&json!({ "$ref": "#/components/schemas/User" }));
        let marker = resolved
            .pointer("/properties/manager/x-circular-ref")
            .and_then(Value::as_str);
        assert_eq!(marker, Some("#/components/schemas/User"));
    }

    #[test]
    fn merges_all_of_branches() {
        let root = doc();
        let resolver = Resolver::new(&root);
        let resolved = resolver.resolve(&json!({ "$ref": "#/components/schemas/Badged" }));
        assert_eq!(resolved.pointer("/type"), Some(&json!("object")));
        assert!(resolved.pointer("/properties/name").is_some());
        assert!(resolved.pointer("/properties/badge").is_some());
        let required = resolved.pointer("/required").and_then(Value::as_array).cloned();
        let required = required.unwrap_or_default();
        assert!(required.contains(&json!("name")) && required.contains(&json!("badge")));
    }

    #[test]
    fn unknown_ref_leaves_marker() {
        let root = doc();
        let resolver = Resolver::new(&root);
        let resolved = resolver.resolve(&json!({ "$ref": "#/components/schemas/Nope" }));
        assert!(resolved.get("x-unresolved-ref").is_some());
    }
}
