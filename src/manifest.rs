//! Kubernetes-style manifests and the loader that reads them from files or stdin.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Source argument meaning "read manifests from standard input".
pub const STDIN: &str = "-";

/// Annotation naming the store path a Secret manifest reads from.
pub const PATH_ANNOTATION: &str = "vaultplate.io/path";
/// Annotation recording which version or key was injected.
pub const VERSION_ANNOTATION: &str = "vaultplate.io/secret-version";

pub const SECRET_KIND: &str = "Secret";

const STRING_DATA: &str = "stringData";
const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// An untyped manifest object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    object: Map<String, Value>,
}

impl Manifest {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(object) => Ok(Self { object }),
            other => Err(Error::manifest(format!(
                "manifest must be a mapping, got {other}"
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.object.get(key)
    }

    pub fn kind(&self) -> Option<&str> {
        self.object.get("kind").and_then(Value::as_str)
    }

    pub fn is_secret(&self) -> bool {
        self.kind() == Some(SECRET_KIND)
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata()?.get("name").and_then(Value::as_str)
    }

    pub fn set_name(&mut self, name: &str) {
        update_object(&mut self.object, "metadata", |metadata| {
            metadata.insert("name".to_string(), Value::String(name.to_string()));
        });
    }

    /// String-valued annotations; anything else is ignored.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.metadata()
            .and_then(|m| m.get("annotations"))
            .and_then(Value::as_object)
            .map(|annotations| {
                annotations
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()?
            .get("annotations")?
            .as_object()?
            .get(key)?
            .as_str()
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        update_object(&mut self.object, "metadata", |metadata| {
            update_object(metadata, "annotations", |annotations| {
                annotations.insert(key.to_string(), Value::String(value.to_string()));
            });
        });
    }

    /// Replace the payload with `data` under `stringData`, dropping any
    /// encoded `data` block.
    pub fn set_string_data(&mut self, data: BTreeMap<String, String>) {
        self.object.remove("data");
        let data = data
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        self.object
            .insert(STRING_DATA.to_string(), Value::Object(data));
    }

    pub fn string_data(&self) -> BTreeMap<String, String> {
        self.object
            .get(STRING_DATA)
            .and_then(Value::as_object)
            .map(|data| {
                data.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.object)?)
    }

    fn metadata(&self) -> Option<&Map<String, Value>> {
        self.object.get("metadata").and_then(Value::as_object)
    }
}

/// Run `f` on the mapping under `key`, replacing a missing or non-mapping
/// value with a new one.
fn update_object(
    parent: &mut Map<String, Value>,
    key: &str,
    f: impl FnOnce(&mut Map<String, Value>),
) {
    match parent.get_mut(key) {
        Some(Value::Object(map)) => f(map),
        _ => {
            let mut map = Map::new();
            f(&mut map);
            parent.insert(key.to_string(), Value::Object(map));
        }
    }
}

/// Template for `secret`: the first Secret manifest named `secret`, else the
/// first Secret manifest.
pub fn find_secret_template<'a>(manifests: &'a [Manifest], secret: &str) -> Option<&'a Manifest> {
    manifests
        .iter()
        .find(|m| m.is_secret() && m.name() == Some(secret))
        .or_else(|| manifests.iter().find(|m| m.is_secret()))
}

/// Parse every non-empty YAML (or JSON) document in `text`.
pub fn parse_documents(text: &str) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let value: Value = serde_yaml::from_value(value)?;
        manifests.push(Manifest::from_value(value)?);
    }
    Ok(manifests)
}

/// Load manifests from `source`: [`STDIN`], a file, or a directory searched
/// recursively for `.yaml`, `.yml` and `.json` files.
pub fn load(source: &str) -> Result<Vec<Manifest>> {
    if source == STDIN {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return parse_documents(&text);
    }

    let files = list_files(Path::new(source))?;
    if files.is_empty() {
        return Err(Error::manifest(format!(
            "no YAML or JSON files were found in {source}"
        )));
    }

    let mut manifests = Vec::new();
    let mut errors = Vec::new();
    for file in files {
        match fs::read_to_string(&file)
            .map_err(Error::from)
            .and_then(|text| parse_documents(&text))
        {
            Ok(parsed) => manifests.extend(parsed),
            Err(e) => errors.push(format!("{}: {e}", file.display())),
        }
    }
    if !errors.is_empty() {
        return Err(Error::manifest(format!(
            "could not read YAML/JSON files:\n{}",
            errors.join("\n")
        )));
    }
    Ok(manifests)
}

fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let Ok(metadata) = fs::metadata(root) else {
        return Ok(Vec::new());
    };
    if metadata.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let mut files = Vec::new();
    let mut entries: Vec<PathBuf> = fs::read_dir(root)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();
    for path in entries {
        if path.is_dir() {
            files.extend(list_files(&path)?);
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| EXTENSIONS.contains(&ext))
        {
            files.push(path);
        }
    }
    Ok(files)
}
