//! Stamps retrieved values into copies of a base manifest.
//!
//! Each entry produces one copy of the base whose payload holds exactly one
//! value and whose version annotation records the entry's key. The base is
//! never modified.

use crate::aggregate::Entry;
use crate::error::Result;
use crate::manifest::{Manifest, VERSION_ANNOTATION};
use std::collections::BTreeMap;
use std::io::Write;

pub const SEPARATOR: &str = "---\n";

/// Which secret name each copy carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// Every copy is this secret; entries are its versions.
    Secret(&'a str),
    /// Each entry key is a secret name.
    PerEntry,
}

pub fn stamp(base: &Manifest, target: Target<'_>, entry: &Entry) -> Manifest {
    let name = match target {
        Target::Secret(name) => name,
        Target::PerEntry => entry.key.as_str(),
    };
    let mut copy = base.clone();
    copy.set_string_data(BTreeMap::from([(name.to_string(), entry.value.clone())]));
    copy.set_annotation(VERSION_ANNOTATION, &entry.key);
    if copy.name() != Some(name) {
        copy.set_name(name);
    }
    copy
}

/// Write one YAML document per entry, each followed by a `---` line.
/// Returns the number of documents written.
pub fn render<W: Write>(
    base: &Manifest,
    target: Target<'_>,
    entries: &[Entry],
    out: &mut W,
) -> Result<usize> {
    for entry in entries {
        let document = stamp(base, target, entry).to_yaml()?;
        write!(out, "{document}{SEPARATOR}")?;
    }
    Ok(entries.len())
}

pub fn render_to_string(base: &Manifest, target: Target<'_>, entries: &[Entry]) -> Result<String> {
    let mut out = Vec::new();
    render(base, target, entries, &mut out)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, value: &str) -> Entry {
        Entry {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn base() -> Manifest {
        Manifest::from_value(json!({
            "kind": "Secret",
            "metadata": {
                "name": "x",
                "annotations": { "vaultplate.io/path": "kv-prod" },
                "labels": { "app": "web" }
            },
            "type": "Opaque"
        }))
        .unwrap()
    }

    #[test]
    fn one_document_per_version() {
        let entries = [entry("v1", "secretA"), entry("v2", "secretB")];
        let text = render_to_string(&base(), Target::Secret("x"), &entries).unwrap();

        let documents: Vec<&str> = text.split(SEPARATOR).filter(|d| !d.is_empty()).collect();
        assert_eq!(documents.len(), 2);
        assert!(text.ends_with("---\n"));

        let expected = [("v1", "secretA"), ("v2", "secretB")];
        for (document, (key, value)) in documents.iter().zip(expected) {
            let parsed: serde_json::Value = serde_yaml::from_str(document).unwrap();
            assert_eq!(parsed["stringData"], json!({ "x": value }));
            assert_eq!(parsed["metadata"]["annotations"][VERSION_ANNOTATION], json!(key));
            assert_eq!(parsed["metadata"]["name"], json!("x"));
            assert_eq!(parsed["metadata"]["labels"]["app"], json!("web"));
            assert_eq!(parsed["metadata"]["annotations"]["vaultplate.io/path"], json!("kv-prod"));
        }
    }

    #[test]
    fn copies_never_touch_the_base() {
        let base = base();
        let before = base.clone();
        let first = stamp(&base, Target::Secret("renamed"), &entry("v1", "a"));
        let second = stamp(&base, Target::Secret("renamed"), &entry("v2", "b"));

        assert_eq!(base, before);
        assert_eq!(first.name(), Some("renamed"));
        assert_eq!(first.string_data()["renamed"], "a");
        assert_eq!(second.string_data()["renamed"], "b");
        assert_eq!(first.annotation(VERSION_ANNOTATION), Some("v1"));
    }

    #[test]
    fn per_entry_target_names_each_copy_after_its_key() {
        let copy = stamp(&base(), Target::PerEntry, &entry("db-pass", "hunter2"));
        assert_eq!(copy.name(), Some("db-pass"));
        assert_eq!(copy.string_data()["db-pass"], "hunter2");
        assert_eq!(copy.annotation(VERSION_ANNOTATION), Some("db-pass"));
    }

    #[test]
    fn no_entries_writes_nothing() {
        let mut out = Vec::new();
        assert_eq!(render(&base(), Target::PerEntry, &[], &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }
}
