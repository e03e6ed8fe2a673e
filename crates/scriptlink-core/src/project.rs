//! Contract for the external project diff engine
//!
//! A [`ProjectPacker`] hands out one [`ProjectWatch`] per project folder. The
//! watch produces the packed bytes that are shipped to a device together with
//! their [`content_hash`](crate::content_hash).

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Packed project payload ready to be sent to a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDiff {
    pub buffer: Vec<u8>,
    pub content_hash: String,
}

impl ProjectDiff {
    /// Build a diff from raw bytes, fingerprinting them
    pub fn from_bytes(buffer: Vec<u8>) -> Self {
        let content_hash = crate::hash::content_hash(&buffer);
        Self {
            buffer,
            content_hash,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// A watch over one project folder
///
/// Implementations may keep state between calls (for example the set of file
/// fingerprints already sent) so that later diffs are smaller.
#[trait_variant::make(ProjectWatch: Send)]
pub trait LocalProjectWatch {
    /// Folder this watch was created for
    fn folder(&self) -> &Path;

    /// Produce the payload for the folder's current contents
    async fn diff(&mut self) -> Result<ProjectDiff>;
}

/// Factory for [`ProjectWatch`] instances
pub trait ProjectPacker: Send + Sync + 'static {
    type Watch: ProjectWatch + Send + 'static;

    fn watch(&self, folder: &Path) -> Self::Watch;
}

/// A watch that is rebuilt whenever it is asked for a different folder
///
/// Sessions keep one of these so the diff state follows the folder the user is
/// currently sending.
#[derive(Debug)]
pub struct BoundWatch<W> {
    watch: Option<W>,
}

impl<W> Default for BoundWatch<W> {
    fn default() -> Self {
        Self { watch: None }
    }
}

impl<W: ProjectWatch> BoundWatch<W> {
    /// Return the watch for `folder`, creating or replacing it as needed
    pub fn bind<P>(&mut self, packer: &P, folder: &Path) -> &mut W
    where
        P: ProjectPacker<Watch = W>,
    {
        let stale = match &self.watch {
            Some(w) => w.folder() != folder,
            None => true,
        };
        if stale {
            self.watch = Some(packer.watch(folder));
        }
        self.watch.get_or_insert_with(|| packer.watch(folder))
    }

    pub fn folder(&self) -> Option<PathBuf> {
        self.watch.as_ref().map(|w| w.folder().to_path_buf())
    }
}
