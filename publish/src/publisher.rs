//! Work submission on top of one SFTP connection.

use anyhow::{Context, anyhow};
use sftp::{Connection, SessionConfig, SshConfig, Stats, Task};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{ChildStdin, ChildStdout};

use crate::batch::DirectoryBatch;
use crate::summary::{Completion, Summary, Tally};
use crate::tasks::{Delete, Landing, Upload};
use crate::{Plan, Settings, WorkItem};

/// Error of a publish run that preserves what was achieved before it failed.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Round {
    #[strum(serialize = "pool files")]
    PoolFiles,
    #[strum(serialize = "directory batches")]
    DirectoryBatches,
    #[strum(serialize = "deletions")]
    Deletions,
}

/// Submits work to a connection and drives it to quiescence.
pub struct Publisher<R = ChildStdout, W = ChildStdin> {
    connection: Connection<R, W>,
    settings: Settings,
}

impl Publisher {
    /// Starts ssh and opens the session.
    pub async fn connect(
        ssh: &SshConfig,
        session: SessionConfig,
        settings: Settings,
    ) -> anyhow::Result<Self> {
        let connection = Connection::connect(ssh, session)
            .await
            .with_context(|| format!("failed to open sftp session to {}", ssh.host))?;
        Ok(Self::new(connection, settings))
    }
}

impl<R, W> Publisher<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(connection: Connection<R, W>, settings: Settings) -> Self {
        Self {
            connection,
            settings,
        }
    }

    pub fn connection(&self) -> &Connection<R, W> {
        &self.connection
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs independent items: uploads straight to their destination, deletions of
    /// destinations without a source.
    pub async fn submit(&mut self, items: Vec<WorkItem>) -> anyhow::Result<Summary> {
        let tally = Tally::default();
        let before = *self.connection.stats();
        for item in items {
            let remote = self.settings.remote_path(&item.destination);
            let completion = Completion::new(item.destination, item.on_complete, tally.clone());
            let task: Box<dyn Task> = match item.source {
                Some(source) => Box::new(Upload::new(
                    source,
                    remote,
                    self.settings.chunk_size,
                    Landing::Direct(completion),
                    tally.clone(),
                )),
                None => Box::new(Delete::new(remote, completion)),
            };
            self.connection.start(task)?;
        }
        self.drive(&tally, before).await
    }

    /// Runs directory batches: temporary uploads first, each batch finalized as soon as all of
    /// its files landed.
    pub async fn submit_directories(
        &mut self,
        batches: Vec<DirectoryBatch>,
    ) -> anyhow::Result<Summary> {
        let tally = Tally::default();
        let before = *self.connection.stats();
        let mut uploads = Vec::new();
        let mut pending = Vec::new();
        for batch in batches {
            let dir = batch.dir().to_string();
            let (shared, staged) = batch.prepare(&self.settings, &tally);
            // nothing left to upload, e.g. everything was staged by an earlier run
            let ready = shared.borrow_mut().finalize_if_ready();
            for task in ready {
                self.connection.start(task)?;
            }
            uploads.extend(staged.into_iter().map(|upload| {
                Upload::new(
                    upload.source,
                    upload.remote,
                    self.settings.chunk_size,
                    Landing::Staged {
                        batch: shared.clone(),
                        path: upload.path,
                    },
                    tally.clone(),
                )
            }));
            pending.push((dir, shared));
        }
        for upload in uploads {
            self.connection.start(Box::new(upload))?;
        }
        let summary = self.drive(&tally, before).await?;
        for (dir, batch) in pending {
            if !batch.borrow().is_finalized() {
                tracing::error!("{dir:?} was left unfinalized, some of its uploads never landed");
            }
        }
        Ok(summary)
    }

    /// Runs a whole plan round by round, stopping after the first round that recorded failures.
    pub async fn publish(&mut self, plan: Plan) -> Result<Summary, Error> {
        let Plan {
            pool,
            directories,
            deletions,
        } = plan;
        let mut total = Summary::default();
        tracing::info!("{}: {} items", Round::PoolFiles, pool.len());
        let summary = self
            .submit(pool)
            .await
            .map_err(|error| Error::new(error, total))?;
        total = checkpoint(Round::PoolFiles, total + summary)?;
        tracing::info!("{}: {} batches", Round::DirectoryBatches, directories.len());
        let summary = self
            .submit_directories(directories)
            .await
            .map_err(|error| Error::new(error, total))?;
        total = checkpoint(Round::DirectoryBatches, total + summary)?;
        tracing::info!("{}: {} items", Round::Deletions, deletions.len());
        let summary = self
            .submit(deletions)
            .await
            .map_err(|error| Error::new(error, total))?;
        checkpoint(Round::Deletions, total + summary)
    }

    /// Closes the session (and terminates ssh when we started it).
    pub async fn close(self) -> anyhow::Result<()> {
        self.connection
            .close()
            .await
            .context("failed to close sftp session")
    }

    async fn drive(&mut self, tally: &Tally, before: Stats) -> anyhow::Result<Summary> {
        self.connection
            .dispatch()
            .await
            .context("sftp session failed")?;
        let stalled = self.connection.reap_stalled();
        for task in &stalled {
            tracing::error!("{task} never completed");
        }
        let after = *self.connection.stats();
        let mut summary = *tally.borrow();
        summary.directories_created = after.directories_created - before.directories_created;
        summary.failures = after.failures - before.failures + stalled.len() as u64;
        Ok(summary)
    }
}

fn checkpoint(round: Round, total: Summary) -> Result<Summary, Error> {
    if total.has_failures() {
        return Err(Error::new(
            anyhow!(
                "{round} round finished with {} failed items and {} failures",
                total.items_failed,
                total.failures
            ),
            total,
        ));
    }
    tracing::info!("{round} round done");
    Ok(total)
}
