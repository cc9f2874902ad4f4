use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};

use atelier_contracts::collaborators::ObjectStorage;

/// Object storage rooted at a local directory. Object paths are relative
/// and may not climb out of the root.
#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(path.trim());
        if relative.as_os_str().is_empty() {
            bail!("object path is empty");
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("object path '{path}' must stay inside the storage root"),
            }
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStorage for LocalDirStorage {
    fn upload(&self, bytes: &[u8], path: &str) -> anyhow::Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(&target, bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;
        let absolute = target.canonicalize().unwrap_or(target);
        Ok(format!("file://{}", absolute.display()))
    }
}

#[cfg(test)]
mod tests {
    use atelier_contracts::collaborators::ObjectStorage;

    use super::LocalDirStorage;

    #[test]
    fn upload_writes_under_root() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = LocalDirStorage::new(temp.path());
        let url = storage.upload(b"png", "campaign/flux-pro_ab12.png")?;
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("campaign/flux-pro_ab12.png"));
        assert_eq!(
            std::fs::read(temp.path().join("campaign").join("flux-pro_ab12.png"))?,
            b"png".to_vec()
        );
        Ok(())
    }

    #[test]
    fn upload_rejects_escaping_paths() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = LocalDirStorage::new(temp.path());
        assert!(storage.upload(b"x", "../outside.png").is_err());
        assert!(storage.upload(b"x", "/etc/passwd").is_err());
        assert!(storage.upload(b"x", "  ").is_err());
        Ok(())
    }
}
