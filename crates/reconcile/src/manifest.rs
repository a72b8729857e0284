//! Desired state read from disk, one component per file or sub-directory.

use std::path::{Path, PathBuf};

use converge_core::{parse_multi, K8sObject, ObjectSet};
use tracing::debug;

use crate::InputError;

/// Desired objects of one component, in apply order.
#[derive(Debug, Clone, Default)]
pub struct ComponentManifest {
    pub name: String,
    pub objects: ObjectSet,
}

impl ComponentManifest {
    pub fn new(name: &str, objects: ObjectSet) -> Self { Self { name: name.to_string(), objects } }
}

pub trait ManifestSource {
    fn load(&self) -> Result<Vec<ComponentManifest>, InputError>;
}

/// Reads `*.yaml`, `*.yml` and `*.json` from a directory. A top-level file is a
/// component named after its stem; a sub-directory is a component whose files
/// are read in lexical order. Hidden entries are ignored.
pub struct DirManifestSource {
    root: PathBuf,
}

impl DirManifestSource {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }
}

fn is_manifest(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json"))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with('.')).unwrap_or(false)
}

fn io_err(path: &Path, e: std::io::Error) -> InputError {
    InputError::Manifest { path: path.to_path_buf(), message: e.to_string() }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, InputError> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let path = entry.map_err(|e| io_err(dir, e))?.path();
        if !is_hidden(&path) { out.push(path); }
    }
    out.sort();
    Ok(out)
}

fn read_objects(path: &Path) -> Result<Vec<K8sObject>, InputError> {
    let raw = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    parse_multi(&raw).map_err(|e| InputError::Manifest { path: path.to_path_buf(), message: e.to_string() })
}

fn component(name: &str, files: &[PathBuf]) -> Result<ComponentManifest, InputError> {
    let mut set = ObjectSet::new();
    for f in files {
        for obj in read_objects(f)? {
            set.push(obj).map_err(|d| InputError::DuplicateObject { key: d.0, first: name.to_string(), second: name.to_string() })?;
        }
    }
    debug!(component = name, objects = set.len(), files = files.len(), "component loaded");
    Ok(ComponentManifest::new(name, set.sorted_for_install()))
}

impl ManifestSource for DirManifestSource {
    fn load(&self) -> Result<Vec<ComponentManifest>, InputError> {
        let mut out = Vec::new();
        for path in sorted_entries(&self.root)? {
            if path.is_dir() {
                let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default().to_string();
                let files: Vec<PathBuf> = sorted_entries(&path)?.into_iter().filter(|p| p.is_file() && is_manifest(p)).collect();
                out.push(component(&name, &files)?);
            } else if is_manifest(&path) {
                let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();
                out.push(component(&name, &[path])?);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("converge-manifest-{}-{}", tag, nanos));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    const CM: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: ns\n";
    const NS: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ns\n";

    #[test]
    fn files_and_directories_become_components() {
        let root = temp_dir("layout");
        std::fs::write(root.join("base.yaml"), format!("{}---\n{}", CM, NS)).unwrap();
        std::fs::create_dir(root.join("pilot")).unwrap();
        std::fs::write(root.join("pilot/10-sa.yaml"), "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: pilot\n  namespace: ns\n").unwrap();
        std::fs::write(root.join("pilot/00-cm.yml"), CM.replace("cfg", "pilot")).unwrap();
        std::fs::write(root.join("pilot/README.md"), "not a manifest").unwrap();
        std::fs::write(root.join(".hidden.yaml"), "garbage: [").unwrap();
        let comps = DirManifestSource::new(&root).load().unwrap();
        let names: Vec<&str> = comps.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["base", "pilot"]);
        // install order puts the namespace first
        let base: Vec<&str> = comps[0].objects.iter().map(|o| o.gvk().kind.as_str()).collect();
        assert_eq!(base, vec!["Namespace", "ConfigMap"]);
        let pilot: Vec<&str> = comps[1].objects.iter().map(|o| o.gvk().kind.as_str()).collect();
        assert_eq!(pilot, vec!["ServiceAccount", "ConfigMap"]);
    }

    #[test]
    fn invalid_document_is_an_input_error() {
        let root = temp_dir("invalid");
        std::fs::write(root.join("bad.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n").unwrap();
        match DirManifestSource::new(&root).load() {
            Err(InputError::Manifest { path, message }) => {
                assert!(path.ends_with("bad.yaml"));
                assert!(message.contains("missing metadata.name"), "message={}", message);
            }
            other => panic!("unexpected: {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn duplicate_within_component_is_rejected() {
        let root = temp_dir("dup");
        std::fs::write(root.join("a.yaml"), format!("{}---\n{}", CM, CM)).unwrap();
        assert!(matches!(DirManifestSource::new(&root).load(), Err(InputError::DuplicateObject { .. })));
    }
}
