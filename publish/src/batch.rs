//! Per-directory batches and their finalize barrier.
//!
//! Files of a batch are first uploaded under a temporary name (`<dest>.new`). Only once every
//! one of them has landed are the renames, deletions and symlinks of the directory issued, so a
//! batch that was interrupted half-way never becomes partially visible. Each finalize step is
//! idempotent, so a later run can redo it.
//!
//! # State
//!
//! - `expected`: files of the batch, including ones staged by an earlier run
//! - `landed`: temporary uploads known complete; already staged files count from the start
//! - `failed`: uploads that did not make it
//! - `finalized`: set once, when the finalize tasks are handed out
//!
//! When `landed + failed == expected` and some upload failed, nothing is finalized and every
//! remaining item completes as failed instead.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use sftp::Task;

use crate::summary::{Completion, OnComplete, Outcome, Tally};
use crate::tasks::{Delete, Finalize};
use crate::{STAGED_SUFFIX, Settings};

enum FileSource {
    Upload(PathBuf),
    /// Uploaded as `<dest>.new` by an earlier run, only the rename is left.
    Staged,
}

struct BatchFile {
    name: String,
    source: FileSource,
    on_complete: OnComplete,
}

struct BatchDelete {
    name: String,
    on_complete: OnComplete,
}

struct BatchSymlink {
    name: String,
    target: String,
    on_complete: OnComplete,
}

type OnStaged = Box<dyn FnMut(&str, Outcome)>;

/// Everything that changes in one remote directory, finalized together.
///
/// Names are relative to the directory; callbacks receive the path relative to the publish root
/// (`<dir>/<name>`).
pub struct DirectoryBatch {
    dir: String,
    files: Vec<BatchFile>,
    deletes: Vec<BatchDelete>,
    symlinks: Vec<BatchSymlink>,
    on_staged: Option<OnStaged>,
}

impl DirectoryBatch {
    pub fn new(dir: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            files: vec![],
            deletes: vec![],
            symlinks: vec![],
            on_staged: None,
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Path of `name` relative to the publish root.
    pub fn path_of(&self, name: &str) -> String {
        join(&self.dir, name)
    }

    /// Upload `source` as `name`, made visible by the finalize rename.
    pub fn add_file(
        &mut self,
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        on_complete: impl FnOnce(&str, Outcome) + 'static,
    ) -> &mut Self {
        self.files.push(BatchFile {
            name: name.into(),
            source: FileSource::Upload(source.into()),
            on_complete: Box::new(on_complete),
        });
        self
    }

    /// A file whose temporary upload already landed in an earlier run.
    pub fn add_staged_file(
        &mut self,
        name: impl Into<String>,
        on_complete: impl FnOnce(&str, Outcome) + 'static,
    ) -> &mut Self {
        self.files.push(BatchFile {
            name: name.into(),
            source: FileSource::Staged,
            on_complete: Box::new(on_complete),
        });
        self
    }

    pub fn add_delete(
        &mut self,
        name: impl Into<String>,
        on_complete: impl FnOnce(&str, Outcome) + 'static,
    ) -> &mut Self {
        self.deletes.push(BatchDelete {
            name: name.into(),
            on_complete: Box::new(on_complete),
        });
        self
    }

    /// Replace `name` with a symlink to `target`. The target is stored verbatim.
    pub fn add_symlink(
        &mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        on_complete: impl FnOnce(&str, Outcome) + 'static,
    ) -> &mut Self {
        self.symlinks.push(BatchSymlink {
            name: name.into(),
            target: target.into(),
            on_complete: Box::new(on_complete),
        });
        self
    }

    /// Called with tag [`Outcome::Staged`] whenever a temporary upload of this batch lands, which
    /// is what a resumable run needs to persist.
    pub fn on_staged(&mut self, on_staged: impl FnMut(&str, Outcome) + 'static) -> &mut Self {
        self.on_staged = Some(Box::new(on_staged));
        self
    }

    pub fn len(&self) -> usize {
        self.files.len() + self.deletes.len() + self.symlinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits the batch into the uploads to run now and the shared finalize state they report to.
    pub(crate) fn prepare(
        self,
        settings: &Settings,
        tally: &Tally,
    ) -> (SharedBatch, Vec<StagedUpload>) {
        let DirectoryBatch {
            dir,
            files,
            deletes,
            symlinks,
            on_staged,
        } = self;
        let mut uploads = Vec::new();
        let mut renames = Vec::new();
        let mut landed = 0;
        for file in files {
            let path = join(&dir, &file.name);
            let remote = settings.remote_path(&path);
            match file.source {
                FileSource::Upload(source) => uploads.push(StagedUpload {
                    path: path.clone(),
                    remote: format!("{remote}{STAGED_SUFFIX}"),
                    source,
                }),
                FileSource::Staged => landed += 1,
            }
            renames.push((
                remote,
                Completion::new(path, Some(file.on_complete), tally.clone()),
            ));
        }
        let deletes = deletes
            .into_iter()
            .map(|delete| {
                let path = join(&dir, &delete.name);
                (
                    settings.remote_path(&path),
                    Completion::new(path, Some(delete.on_complete), tally.clone()),
                )
            })
            .collect();
        let symlinks = symlinks
            .into_iter()
            .map(|symlink| {
                let path = join(&dir, &symlink.name);
                (
                    settings.remote_path(&path),
                    symlink.target,
                    Completion::new(path, Some(symlink.on_complete), tally.clone()),
                )
            })
            .collect();
        let pending = PendingBatch {
            dir,
            expected: renames.len(),
            landed,
            failed: 0,
            finalized: false,
            renames,
            deletes,
            symlinks,
            on_staged,
            tally: tally.clone(),
        };
        (Rc::new(RefCell::new(pending)), uploads)
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{name}", dir.trim_end_matches('/'))
    }
}

/// One temporary upload of a batch.
pub(crate) struct StagedUpload {
    pub(crate) path: String,
    pub(crate) remote: String,
    pub(crate) source: PathBuf,
}

pub(crate) type SharedBatch = Rc<RefCell<PendingBatch>>;

/// Runtime state of a submitted batch.
pub(crate) struct PendingBatch {
    dir: String,
    expected: usize,
    landed: usize,
    failed: usize,
    finalized: bool,
    renames: Vec<(String, Completion)>,
    deletes: Vec<(String, Completion)>,
    symlinks: Vec<(String, String, Completion)>,
    on_staged: Option<OnStaged>,
    tally: Tally,
}

impl PendingBatch {
    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// A temporary upload completed; returns the finalize tasks if it was the last one.
    pub(crate) fn land(&mut self, path: &str) -> Vec<Box<dyn Task>> {
        self.landed += 1;
        tracing::debug!(
            "{:?}: {path:?} staged, {}/{} landed",
            self.dir,
            self.landed,
            self.expected
        );
        self.tally.borrow_mut().count(Outcome::Staged);
        if let Some(on_staged) = self.on_staged.as_mut() {
            on_staged(path, Outcome::Staged);
        }
        self.finalize_if_ready()
    }

    /// A temporary upload failed. The batch will not be finalized.
    pub(crate) fn fail(&mut self, path: &str) -> Vec<Box<dyn Task>> {
        self.failed += 1;
        tracing::debug!("{:?}: {path:?} failed to stage", self.dir);
        self.finalize_if_ready()
    }

    /// Hands out the finalize tasks once every expected file is accounted for: renames first,
    /// then deletions, then symlinks.
    pub(crate) fn finalize_if_ready(&mut self) -> Vec<Box<dyn Task>> {
        if self.finalized || self.landed + self.failed < self.expected {
            return vec![];
        }
        self.finalized = true;
        if self.failed > 0 {
            tracing::error!(
                "not finalizing {:?}: {} of {} files failed to upload",
                self.dir,
                self.failed,
                self.expected
            );
            let abandoned = self
                .renames
                .drain(..)
                .map(|(_, completion)| completion)
                .chain(self.deletes.drain(..).map(|(_, completion)| completion))
                .chain(self.symlinks.drain(..).map(|(_, _, completion)| completion));
            for completion in abandoned {
                completion.finish(Outcome::Failed);
            }
            return vec![];
        }
        tracing::debug!("finalizing {:?}", self.dir);
        let mut tasks: Vec<Box<dyn Task>> = Vec::new();
        for (remote, completion) in self.renames.drain(..) {
            tasks.push(Box::new(Finalize::replace(remote, completion)));
        }
        for (remote, completion) in self.deletes.drain(..) {
            tasks.push(Box::new(Delete::new(remote, completion)));
        }
        for (remote, target, completion) in self.symlinks.drain(..) {
            tasks.push(Box::new(Finalize::relink(remote, target, completion)));
        }
        tasks
    }
}
