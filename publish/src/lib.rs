//! Publishing artifact trees over SFTP
//!
//! `publish` pushes a set of changes (new files, replacements, symlinks and deletions) to a remote
//! host over one multiplexed SFTP session, in a way that survives interruption at any point.
//!
//! # Rounds
//!
//! Work is applied in three rounds, each one driven to completion before the next starts:
//!
//! 1. **pool files**: uploaded straight to their final name. They are new content nobody refers to
//!    yet, so a partial upload is harmless.
//! 2. **directory batches**: index files and friends, see [`DirectoryBatch`]. Every file of a
//!    batch is uploaded as `<dest>.new` first; renames, deletions and symlinks of that directory
//!    only start once all of them landed.
//! 3. **deletions**: files no longer referenced by anything published in round 2.
//!
//! A round that recorded failures stops the run, the next run picks up whatever was not reported
//! done.
//!
//! # Directories
//!
//! Missing remote directories are created on demand, each at most once per connection and
//! always parent first (see `sftp::collector::dirlock`).
//!
//! # Completion
//!
//! Every item reports exactly one [`Outcome`] to its callback, with the path relative to the
//! publish root. Batches additionally report each landed temporary upload as [`Outcome::Staged`]
//! (`asdotnew`), which is what a caller keeping a done-log persists to resume later.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use publish::{DirectoryBatch, Plan, Publisher, Settings, WorkItem};
//!
//! let ssh = sftp::SshConfig::new("mirror.example.org");
//! let mut publisher =
//!     Publisher::connect(&ssh, sftp::SessionConfig::default(), Settings::default()).await?;
//! let mut batch = DirectoryBatch::new("dists/stable");
//! batch.add_file("Release", "/srv/repo/dists/stable/Release", |path, outcome| {
//!     println!("{outcome}: {path}");
//! });
//! let plan = Plan {
//!     pool: vec![WorkItem::upload("pool/a.deb", "/srv/repo/pool/a.deb")],
//!     directories: vec![batch],
//!     deletions: vec![WorkItem::delete("pool/old.deb")],
//! };
//! let summary = publisher.publish(plan).await?;
//! println!("{summary}");
//! publisher.close().await?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

pub mod batch;
pub mod publisher;
pub mod summary;
mod tasks;

pub use batch::DirectoryBatch;
pub use publisher::{Error, Publisher, Round};
pub use summary::{OnComplete, Outcome, Summary};

/// Suffix of temporary uploads that are renamed into place by the finalize step.
pub const STAGED_SUFFIX: &str = ".new";

/// Payload size of one WRITE request.
pub const DEFAULT_CHUNK_SIZE: usize = 16376;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Remote directory all destinations are relative to; empty means the login directory.
    pub target_dir: String,
    pub chunk_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_dir: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Settings {
    pub fn remote_path(&self, relative: &str) -> String {
        if self.target_dir.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{relative}", self.target_dir.trim_end_matches('/'))
        }
    }
}

/// One independent item: upload `source` to `destination`, or delete `destination` when there
/// is no source.
pub struct WorkItem {
    pub destination: String,
    pub source: Option<PathBuf>,
    pub on_complete: Option<OnComplete>,
}

impl WorkItem {
    pub fn upload(destination: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            source: Some(source.into()),
            on_complete: None,
        }
    }

    pub fn delete(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            source: None,
            on_complete: None,
        }
    }

    #[must_use]
    pub fn on_complete(mut self, on_complete: impl FnOnce(&str, Outcome) + 'static) -> Self {
        self.on_complete = Some(Box::new(on_complete));
        self
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("destination", &self.destination)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Work of one run, grouped by round.
#[derive(Default)]
pub struct Plan {
    pub pool: Vec<WorkItem>,
    pub directories: Vec<DirectoryBatch>,
    pub deletions: Vec<WorkItem>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty() && self.directories.is_empty() && self.deletions.is_empty()
    }
}
