// Argument type for `cp`: either a volume-qualified remote path
// (`data:/dataset.txt`) or a plain local one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPath {
    Volume { volume: String, path: String },
    Local(PathBuf),
}

impl TransferPath {
    /// Parses `volume:path` into a volume path, anything else into a
    /// local one.
    pub fn parse(raw: &str) -> TransferPath {
        match raw.split_once(':') {
            Some((volume, path)) => TransferPath::Volume {
                volume: volume.to_string(),
                path: path.to_string(),
            },
            None => TransferPath::Local(PathBuf::from(raw)),
        }
    }

    pub fn is_volume(&self) -> bool {
        matches!(self, TransferPath::Volume { .. })
    }

    /// Base name of the file this path points at, if it has one.
    pub fn file_name(&self) -> Option<String> {
        match self {
            TransferPath::Volume { path, .. } => Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            TransferPath::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        }
    }

    /// Opens a local path for upload. Directories cannot be copied.
    pub fn open(&self) -> Result<fs::File> {
        let path = self.local()?;
        if path.is_dir() {
            return Err(ClientError::Config(format!(
                "cannot copy, {} is a directory",
                path.display()
            )));
        }
        Ok(fs::File::open(path)?)
    }

    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(self.local()?)?.len())
    }

    /// Writes downloaded content to this local path. The data lands in a
    /// `.tmp` sibling first and is renamed into place, so an interrupted
    /// download never leaves a truncated file under the final name.
    pub fn safe_write(&self, mut content: impl io::Read, name: &str) -> Result<()> {
        let target = self.resolve_target(name)?;
        if target.is_dir() {
            return Err(ClientError::Config(format!(
                "cannot copy, {} is a directory",
                target.display()
            )));
        }
        let tmp = target.with_extension("tmp");
        let mut out = fs::File::create(&tmp)?;
        io::copy(&mut content, &mut out)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    // When the local path is an existing directory, the downloaded file
    // keeps its remote name inside it.
    fn resolve_target(&self, name: &str) -> Result<PathBuf> {
        let path = self.local()?;
        if path.is_dir() {
            if name.is_empty() {
                return Err(ClientError::Config(format!(
                    "a file name is required when {} is a directory",
                    path.display()
                )));
            }
            return Ok(path.join(name));
        }
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
                Err(ClientError::Config(format!(
                    "no such file or directory: {}",
                    path.display()
                )))
            }
            _ => Ok(path.to_path_buf()),
        }
    }

    fn local(&self) -> Result<&Path> {
        match self {
            TransferPath::Local(path) => Ok(path),
            TransferPath::Volume { volume, path } => Err(ClientError::Config(format!(
                "{volume}:{path} is not a local path"
            ))),
        }
    }
}

impl std::str::FromStr for TransferPath {
    type Err = std::convert::Infallible;

    fn from_str(raw: &str) -> std::result::Result<TransferPath, Self::Err> {
        Ok(TransferPath::parse(raw))
    }
}
