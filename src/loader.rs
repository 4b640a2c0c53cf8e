//! Module loading: specifier normalization and the memoized URI -> module
//! cache. The cache is written once per URI and read-only afterwards; it is
//! the only shared mutable state in the pipeline.

use crate::canonical::HOST_NAMESPACE;
use crate::error::FuneeError;
use crate::module_index::{index_module, IndexedDeclaration};
use crate::parse::parse_module;
use crate::references::ReferenceMarks;
use relative_path::RelativePath;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use swc_common::{FileLoader, FilePathMapping, SourceMap};
use url::Url;

/// A loaded, parsed, indexed module. Never mutated after creation.
pub struct ModuleRecord {
    pub uri: String,
    pub index: HashMap<String, IndexedDeclaration>,
}

pub struct ModuleCache {
    cm: Rc<SourceMap>,
    marks: ReferenceMarks,
    modules: RefCell<HashMap<String, Rc<ModuleRecord>>>,
}

impl ModuleCache {
    pub fn new(file_loader: Box<dyn FileLoader + Sync + Send>) -> Self {
        Self {
            cm: Rc::new(SourceMap::with_file_loader(
                file_loader,
                FilePathMapping::empty(),
            )),
            marks: ReferenceMarks::new(),
            modules: RefCell::new(HashMap::new()),
        }
    }

    pub fn source_map(&self) -> &Rc<SourceMap> {
        &self.cm
    }

    pub fn marks(&self) -> &ReferenceMarks {
        &self.marks
    }

    /// Load, parse and index the module at `uri`, once per pipeline.
    pub fn module(&self, uri: &str) -> Result<Rc<ModuleRecord>, FuneeError> {
        if let Some(record) = self.modules.borrow().get(uri) {
            return Ok(record.clone());
        }
        let module = parse_module(&self.cm, uri, &self.marks)?;
        let record = Rc::new(ModuleRecord {
            uri: uri.to_string(),
            index: index_module(&module),
        });
        self.modules
            .borrow_mut()
            .insert(uri.to_string(), record.clone());
        Ok(record)
    }
}

/// Normalize a specifier against its referrer into an absolute module URI:
/// an `http(s)://` URL, an absolute filesystem path, or the host namespace.
/// Bare specifiers other than the host namespace do not resolve.
pub fn resolve_specifier(specifier: &str, referrer: &str) -> Result<String, FuneeError> {
    if specifier.starts_with("http://") || specifier.starts_with("https://") {
        return Ok(specifier.to_string());
    }
    if specifier == HOST_NAMESPACE {
        return Ok(HOST_NAMESPACE.to_string());
    }

    let relative = specifier.starts_with("./") || specifier.starts_with("../");

    if referrer.starts_with("http://") || referrer.starts_with("https://") {
        if relative || specifier.starts_with('/') {
            return Url::parse(referrer)
                .and_then(|base| base.join(specifier))
                .map(|resolved| resolved.to_string())
                .map_err(|_| FuneeError::ModuleNotFound {
                    specifier: specifier.to_string(),
                    referrer: referrer.to_string(),
                });
        }
    } else {
        if specifier.starts_with('/') {
            return Ok(specifier.to_string());
        }
        if relative {
            let dir = Path::new(referrer).parent().unwrap_or_else(|| Path::new("/"));
            return Ok(RelativePath::new(specifier)
                .to_logical_path(dir)
                .to_string_lossy()
                .into_owned());
        }
    }

    Err(FuneeError::ModuleNotFound {
        specifier: specifier.to_string(),
        referrer: referrer.to_string(),
    })
}

/// In-memory file loader for tests and embedders that already hold their
/// module sources.
pub struct MemoryLoader {
    pub files: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new(files: impl IntoIterator<Item = (&'static str, &'static str)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl FileLoader for MemoryLoader {
    fn file_exists(&self, path: &Path) -> bool {
        self.files.contains_key(&path.to_string_lossy().into_owned())
    }

    fn abs_path(&self, path: &Path) -> Option<std::path::PathBuf> {
        Some(path.to_path_buf())
    }

    fn read_file(&self, path: &Path) -> std::io::Result<bytes_str::BytesStr> {
        self.files
            .get(&path.to_string_lossy().into_owned())
            .cloned()
            .map(bytes_str::BytesStr::from)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such module"))
    }
}
