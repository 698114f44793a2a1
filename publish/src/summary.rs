//! Per-item outcomes and the run summary.

use std::cell::RefCell;
use std::rc::Rc;

/// Short tag reported once an item's durable effect (or failure) is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum Outcome {
    #[strum(serialize = "done")]
    Done,
    #[strum(serialize = "symlink done")]
    SymlinkDone,
    #[strum(serialize = "deleted")]
    Deleted,
    #[strum(serialize = "already deleted")]
    AlreadyDeleted,
    #[strum(serialize = "failed")]
    Failed,
    /// A batch file landed under its temporary name. Only reported to the batch's staged
    /// callback, never as the item's own outcome.
    #[strum(serialize = "asdotnew")]
    Staged,
}

/// Completion callback of one item, called with the item's relative path.
pub type OnComplete = Box<dyn FnOnce(&str, Outcome)>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub bytes_uploaded: u64,
    pub files_published: usize,
    pub files_staged: usize,
    pub symlinks_created: usize,
    pub files_deleted: usize,
    pub already_deleted: usize,
    pub items_failed: usize,
    pub directories_created: u64,
    /// Failed operations recorded on the connection; one failed item may account for several.
    pub failures: u64,
}

impl Summary {
    pub(crate) fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Done => self.files_published += 1,
            Outcome::SymlinkDone => self.symlinks_created += 1,
            Outcome::Deleted => self.files_deleted += 1,
            Outcome::AlreadyDeleted => self.already_deleted += 1,
            Outcome::Failed => self.items_failed += 1,
            Outcome::Staged => self.files_staged += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.items_failed > 0 || self.failures > 0
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_uploaded: self.bytes_uploaded + other.bytes_uploaded,
            files_published: self.files_published + other.files_published,
            files_staged: self.files_staged + other.files_staged,
            symlinks_created: self.symlinks_created + other.symlinks_created,
            files_deleted: self.files_deleted + other.files_deleted,
            already_deleted: self.already_deleted + other.already_deleted,
            items_failed: self.items_failed + other.items_failed,
            directories_created: self.directories_created + other.directories_created,
            failures: self.failures + other.failures,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes uploaded: {}\n\
            files published: {}\n\
            files staged: {}\n\
            symlinks created: {}\n\
            files deleted: {}\n\
            already deleted: {}\n\
            directories created: {}\n\
            items failed: {}\n\
            failures: {}",
            bytesize::ByteSize(self.bytes_uploaded),
            self.files_published,
            self.files_staged,
            self.symlinks_created,
            self.files_deleted,
            self.already_deleted,
            self.directories_created,
            self.items_failed,
            self.failures,
        )
    }
}

/// Outcome counters shared by all tasks of one submission.
pub(crate) type Tally = Rc<RefCell<Summary>>;

/// Reports one item's outcome, exactly once.
///
/// A completion dropped without reporting (its task was reaped, or the session died) reports
/// [`Outcome::Failed`].
pub(crate) struct Completion {
    path: String,
    on_complete: Option<OnComplete>,
    tally: Option<Tally>,
}

impl Completion {
    pub(crate) fn new(
        path: impl Into<String>,
        on_complete: Option<OnComplete>,
        tally: Tally,
    ) -> Self {
        Self {
            path: path.into(),
            on_complete,
            tally: Some(tally),
        }
    }

    pub(crate) fn finish(mut self, outcome: Outcome) {
        self.report(outcome);
    }

    fn report(&mut self, outcome: Outcome) {
        let Some(tally) = self.tally.take() else {
            return;
        };
        tracing::info!("{outcome}: {:?}", self.path);
        tally.borrow_mut().count(outcome);
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(&self.path, outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.tally.is_some() {
            tracing::error!("{:?} was abandoned", self.path);
            self.report(Outcome::Failed);
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Completion({:?})", self.path)
    }
}
