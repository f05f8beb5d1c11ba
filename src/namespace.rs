//! Server namespaces and the builders that populate them.

use std::sync::Arc;

use log::info;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::mount::Mount;
use crate::parse::{path_parts, split_parent_name, valid_name};
use crate::resource::{QidPool, Resource};
use crate::rpc::MethodTable;

const OWNER: &str = "sys";

/// A tree of resources clients attach to by name.
pub struct Namespace {
    name: String,
    root: Arc<Resource>,
    ids: Arc<QidPool>,
}

impl Namespace {
    pub(crate) fn new(name: &str, ids: Arc<QidPool>) -> Self {
        let root = Resource::directory(&ids, "/", OWNER, 0o755);
        Self {
            name: name.to_string(),
            root,
            ids,
        }
    }

    /// Attach name of this namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> Arc<Resource> {
        self.root.clone()
    }

    /// Resolve `path` without crossing mount points.
    pub fn lookup(&self, path: &str) -> Result<Arc<Resource>> {
        let mut current = self.root.clone();
        for part in path_parts(path) {
            if current.mount().is_some() {
                return Err(Error::NotSupported("local lookup inside a mount"));
            }
            current = current.child(part)?;
        }
        Ok(current)
    }

    /// Create `path` and any missing parents; existing directories are kept.
    pub fn mkdir(&self, path: &str) -> Result<Arc<Resource>> {
        let mut current = self.root.clone();
        for part in path_parts(path) {
            if !valid_name(part) {
                return Err(Error::InvalidName(part.to_string()));
            }
            current = match current.child(part) {
                Ok(next) if next.is_dir() => next,
                Ok(_) => return Err(Error::NotADirectory),
                Err(Error::NotFound(_)) => {
                    let dir = Resource::directory(&self.ids, part, OWNER, 0o755);
                    match current.attach_child(dir.clone()) {
                        Ok(()) => dir,
                        Err(Error::Exists(_)) => current.child(part)?,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            };
        }
        Ok(current)
    }

    fn parent_of<'a>(&self, path: &'a str) -> Result<(Arc<Resource>, &'a str)> {
        let (parent, name) = split_parent_name(path)?;
        if !valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok((self.mkdir(parent)?, name))
    }

    /// Add a data file holding `data`.
    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) -> Result<Arc<Resource>> {
        let (parent, name) = self.parent_of(path)?;
        let file = Resource::file(&self.ids, name, OWNER, 0o644, data.into());
        parent.attach_child(file.clone())?;
        Ok(file)
    }

    /// Expose a method table as a directory with one callable file per
    /// method.
    pub fn register_service(&self, path: &str, table: &MethodTable) -> Result<Arc<Resource>> {
        let dir = self.mkdir(path)?;
        for method in table.iter() {
            dir.attach_child(Resource::method(&self.ids, OWNER, method.clone()))?;
        }
        info!(
            "namespace {:?}: service {} registered with {} methods",
            self.name,
            path,
            table.len()
        );
        Ok(dir)
    }

    /// Graft the tree `client` is attached to at `path`.
    pub fn mount(&self, path: &str, client: Arc<Client>) -> Result<Arc<Mount>> {
        let (parent, name) = self.parent_of(path)?;
        let mount = Mount::new(client)?;
        let point = Resource::mount_point(&self.ids, name, OWNER, mount.clone());
        parent.attach_child(point)?;
        info!("namespace {:?}: mounted remote tree at {}", self.name, path);
        Ok(mount)
    }

    /// Detach the entry at `path` (a file, an empty directory or a mount
    /// point).
    pub fn remove(&self, path: &str) -> Result<Arc<Resource>> {
        let (parent, name) = split_parent_name(path)?;
        let parent = self.lookup(parent)?;
        let child = parent.child(name)?;
        if child.is_dir() && !child.children().is_empty() {
            return Err(Error::NotEmpty);
        }
        parent.detach_child(name)
    }
}
