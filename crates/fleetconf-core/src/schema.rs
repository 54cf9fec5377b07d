// ── Schema acquisition and mounting ──
//
// A device advertises its schema list via RFC 6022 monitoring state.
// The list is washed (some devices interleave metadata elements),
// filtered to YANG modules retrievable over NETCONF, run through the
// injected policy hooks, and translated into a module-set description.
// Missing modules are fetched one at a time with `get-schema` and
// cached on disk; the full set is then mounted at the device's mount
// point. Actual YANG compilation is the datastore engine's concern;
// the mounted set binds data by namespace.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use fleetconf_netconf::XmlNode;

/// One entry of a device's module set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub revision: Option<String>,
    pub namespace: String,
}

/// Vendor-quirk hooks, injected at controller construction. The
/// default keeps every module and caches text unchanged; dropping
/// vendor metadata modules is opt-in via [`SchemaPolicy::skip_prefixes`].
pub struct SchemaPolicy {
    /// Keep/drop decision per advertised module.
    pub filter: Box<dyn Fn(&ModuleInfo) -> bool + Send + Sync>,
    /// Rewrite fetched YANG text before it is cached.
    pub postprocess: Box<dyn Fn(&ModuleInfo, String) -> String + Send + Sync>,
}

impl Default for SchemaPolicy {
    fn default() -> Self {
        Self {
            filter: Box::new(|_| true),
            postprocess: Box::new(|_, text| text),
        }
    }
}

impl SchemaPolicy {
    /// Policy that drops modules whose name starts with any of the
    /// given prefixes (vendor metadata modules, typically).
    pub fn skip_prefixes(prefixes: Vec<String>) -> Self {
        Self {
            filter: Box::new(move |m| !prefixes.iter().any(|p| m.name.starts_with(p.as_str()))),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for SchemaPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SchemaPolicy")
    }
}

/// Translate an RFC 6022 `<schemas>` container into a module set.
///
/// Non-`schema` children are skipped (devices may inject metadata).
/// Entries must carry identifier, version, namespace and format; only
/// `format=yang` entries with a NETCONF location survive, then the
/// policy filter runs.
pub fn module_set_from_schema_list(schemas: &XmlNode, policy: &SchemaPolicy) -> Vec<ModuleInfo> {
    let mut set = Vec::new();
    for entry in schemas.children_named("schema") {
        let (Some(identifier), Some(version), Some(namespace), Some(format)) = (
            entry.child_body("identifier"),
            entry.child_body("version"),
            entry.child_body("namespace"),
            entry.child_body("format"),
        ) else {
            continue;
        };
        if format != "yang" {
            continue;
        }
        if !entry
            .children_named("location")
            .any(|l| l.body() == Some("NETCONF"))
        {
            continue;
        }
        let module = ModuleInfo {
            name: identifier.to_string(),
            revision: (!version.is_empty()).then(|| version.to_string()),
            namespace: namespace.to_string(),
        };
        if !(policy.filter)(&module) {
            debug!(module = %module.name, "schema filter dropped module");
            continue;
        }
        set.push(module);
    }
    set
}

/// The compiled schema set mounted at a device's mount point.
///
/// Binding is by namespace: a data subtree binds iff every element
/// child resolves to a namespace some mounted module declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedSchema {
    modules: Vec<ModuleInfo>,
}

impl MountedSchema {
    pub fn compile(modules: Vec<ModuleInfo>) -> Self {
        Self { modules }
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    pub fn contains(&self, name: &str, revision: Option<&str>) -> bool {
        self.modules
            .iter()
            .any(|m| m.name == name && m.revision.as_deref() == revision)
    }

    /// Check that every element child of `root` binds to a mounted
    /// module. Returns the first offending declaration on failure.
    pub fn binds(&self, root: &XmlNode) -> Result<(), String> {
        for child in &root.children {
            let Some(ns) = child.namespace.as_deref() else {
                return Err(format!("{} has no namespace", child.name));
            };
            if !self.modules.iter().any(|m| m.namespace == ns) {
                return Err(format!("{} in unknown namespace {ns}", child.name));
            }
        }
        Ok(())
    }
}

/// On-disk cache of fetched YANG modules.
///
/// Files are `{name}@{revision}.yang` (`{name}.yang` without a
/// revision). Writes go through a temp file and rename so two devices
/// racing on the same module converge on one intact file.
#[derive(Debug, Clone)]
pub struct SchemaCache {
    dir: PathBuf,
}

impl SchemaCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(name: &str, revision: Option<&str>) -> String {
        match revision {
            Some(rev) => format!("{name}@{rev}.yang"),
            None => format!("{name}.yang"),
        }
    }

    pub fn contains(&self, name: &str, revision: Option<&str>) -> bool {
        self.dir.join(Self::file_name(name, revision)).exists()
    }

    pub fn store(
        &self,
        name: &str,
        revision: Option<&str>,
        text: &str,
    ) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(Self::file_name(name, revision));
        let tmp = self.dir.join(format!(".{}.tmp", Self::file_name(name, revision)));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(text.as_bytes())?;
            f.flush()?;
        }
        fs::rename(&tmp, &target)?;
        debug!(path = %target.display(), "cached yang module");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_entry(id: &str, version: &str, ns: &str, format: &str, location: &str) -> String {
        format!(
            "<schema><identifier>{id}</identifier><version>{version}</version>\
             <format>{format}</format><namespace>{ns}</namespace>\
             <location>{location}</location></schema>"
        )
    }

    #[test]
    fn module_set_skips_junk_and_non_netconf_entries() {
        let xml = format!(
            "<schemas xmlns=\"urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring\">\
             <junk>metadata</junk>\
             {}{}{}</schemas>",
            schema_entry("m1", "2023-01-01", "urn:m1", "yang", "NETCONF"),
            schema_entry("m2", "2023-01-01", "urn:m2", "xsd", "NETCONF"),
            schema_entry("m3", "2023-01-01", "urn:m3", "yang", "https://example.com/m3"),
        );
        let schemas = XmlNode::parse(&xml).unwrap();
        let set = module_set_from_schema_list(&schemas, &SchemaPolicy::default());
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].name, "m1");
        assert_eq!(set[0].revision.as_deref(), Some("2023-01-01"));
        assert_eq!(set[0].namespace, "urn:m1");
    }

    #[test]
    fn policy_filter_drops_by_prefix() {
        let xml = format!(
            "<schemas xmlns=\"urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring\">{}{}</schemas>",
            schema_entry("vendor-metadata-x", "2023-01-01", "urn:v", "yang", "NETCONF"),
            schema_entry("m1", "2023-01-01", "urn:m1", "yang", "NETCONF"),
        );
        let schemas = XmlNode::parse(&xml).unwrap();
        let policy = SchemaPolicy::skip_prefixes(vec!["vendor-metadata".into()]);
        let set = module_set_from_schema_list(&schemas, &policy);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].name, "m1");
    }

    #[test]
    fn binding_checks_namespaces() {
        let schema = MountedSchema::compile(vec![ModuleInfo {
            name: "m1".into(),
            revision: None,
            namespace: "urn:m1".into(),
        }]);
        let good = XmlNode::parse("<root><ifs xmlns=\"urn:m1\"/></root>").unwrap();
        assert!(schema.binds(&good).is_ok());
        let bad = XmlNode::parse("<root><ifs xmlns=\"urn:other\"/></root>").unwrap();
        let err = schema.binds(&bad).unwrap_err();
        assert!(err.contains("urn:other"));
    }

    #[test]
    fn cache_store_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SchemaCache::new(dir.path());
        assert!(!cache.contains("m1", Some("2023-01-01")));
        cache.store("m1", Some("2023-01-01"), "module m1 {}").unwrap();
        assert!(cache.contains("m1", Some("2023-01-01")));
        let path = dir.path().join("m1@2023-01-01.yang");
        assert_eq!(fs::read_to_string(path).unwrap(), "module m1 {}");
        // no leftover temp files
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn cache_file_name_without_revision() {
        assert_eq!(SchemaCache::file_name("m1", None), "m1.yang");
        assert_eq!(
            SchemaCache::file_name("m1", Some("2023-01-01")),
            "m1@2023-01-01.yang"
        );
    }
}
