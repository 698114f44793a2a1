use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::Parser;
use tracing::instrument;

use publish::{DirectoryBatch, Plan, Publisher, Settings, WorkItem};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sftp-push",
    version,
    about = "Publish files to a remote host over SFTP, one directory at a time",
    long_about = "`sftp-push` uploads files to a remote host through the sftp subsystem of ssh.

Work is applied in three rounds: pool files (--put) are uploaded in place, then directory batches \
(--publish, --staged, --symlink, --delete) are uploaded as `<dest>.new` and renamed into place once \
every file of the same directory arrived, then final deletions (--remove) run. A round with \
failures stops the run; running the same command again is safe.

Every finished item is reported on stdout as a `DONE<TAB>tag<TAB>path` line. Tag `asdotnew` means \
the file was uploaded as `<dest>.new` but not renamed yet; pass it with --staged next time.

EXAMPLES:
    # Upload a package, then publish the index that refers to it
    sftp-push --host mirror.example.org --put pool/a.deb=/srv/repo/pool/a.deb \\
        --publish dists/stable/Packages=/srv/repo/dists/stable/Packages --summary

    # Point a suite symlink somewhere else and drop an old package
    sftp-push --host mirror.example.org --target-dir /srv/mirror \\
        --symlink dists/testing=trixie --remove pool/old.deb"
)]
struct Args {
    // Connection
    /// Remote host to connect to
    #[arg(long, help_heading = "Connection")]
    host: String,

    /// Login name on the remote host
    #[arg(short = 'l', long, help_heading = "Connection")]
    user: Option<String>,

    /// ssh client to run
    #[arg(
        long,
        default_value = "ssh",
        value_name = "PROGRAM",
        help_heading = "Connection"
    )]
    ssh_program: String,

    /// Extra option passed to ssh before the built-in ones, e.g. -o -oPort=2222 (repeatable)
    #[arg(
        short = 'o',
        long = "ssh-option",
        value_name = "OPTION",
        allow_hyphen_values = true,
        help_heading = "Connection"
    )]
    ssh_options: Vec<String>,

    /// Remote directory all destinations are relative to
    #[arg(
        long,
        default_value = "",
        value_name = "DIR",
        help_heading = "Connection"
    )]
    target_dir: String,

    // Work
    /// Upload SOURCE to DEST right away (pool round)
    #[arg(long, value_name = "DEST=SOURCE", value_parser = parse_pair, help_heading = "Work")]
    put: Vec<(String, String)>,

    /// Upload SOURCE as DEST.new and rename it once its directory is complete
    #[arg(long, value_name = "DEST=SOURCE", value_parser = parse_pair, help_heading = "Work")]
    publish: Vec<(String, String)>,

    /// DEST.new was uploaded by an earlier run, only rename it
    #[arg(long, value_name = "DEST", help_heading = "Work")]
    staged: Vec<String>,

    /// Replace DEST with a symlink to TARGET when its directory is finalized
    #[arg(long, value_name = "DEST=TARGET", value_parser = parse_pair, help_heading = "Work")]
    symlink: Vec<(String, String)>,

    /// Delete DEST when its directory is finalized
    #[arg(long, value_name = "DEST", help_heading = "Work")]
    delete: Vec<String>,

    /// Delete DEST after everything else was published
    #[arg(long, value_name = "DEST", help_heading = "Work")]
    remove: Vec<String>,

    // Performance
    /// Maximum number of remote files open at the same time
    #[arg(
        long,
        default_value = "10",
        value_name = "N",
        help_heading = "Performance"
    )]
    max_open_files: usize,

    /// Payload size of a single write request
    #[arg(
        long,
        default_value_t = publish::DEFAULT_CHUNK_SIZE,
        value_name = "BYTES",
        help_heading = "Performance"
    )]
    chunk_size: usize,

    // Output
    /// Print summary at the end
    #[arg(long, help_heading = "Output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,
}

fn parse_pair(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((dest, source)) if !dest.is_empty() && !source.is_empty() => {
            Ok((dest.to_string(), source.to_string()))
        }
        _ => Err(format!("expected DEST=SOURCE, got {value:?}")),
    }
}

fn split_destination(dest: &str) -> anyhow::Result<(&str, &str)> {
    match dest.rsplit_once('/') {
        Some((dir, name)) if !dir.is_empty() && !name.is_empty() => Ok((dir, name)),
        _ => Err(anyhow!(
            "{dest:?} cannot be batched: destination needs a directory and a file name"
        )),
    }
}

/// Batch of the directory `dest` lives in, created on first use.
fn batch_for<'a>(
    batches: &'a mut BTreeMap<String, DirectoryBatch>,
    dest: &'a str,
) -> anyhow::Result<(&'a str, &'a mut DirectoryBatch)> {
    let (dir, name) = split_destination(dest)?;
    let batch = batches.entry(dir.to_string()).or_insert_with(|| {
        let mut batch = DirectoryBatch::new(dir);
        batch.on_staged(log_outcome);
        batch
    });
    Ok((name, batch))
}

/// Reports progress on stdout in the done-log format, so a wrapper can persist it and leave
/// finished items out of the next run.
fn log_outcome(path: &str, outcome: publish::Outcome) {
    println!("DONE\t{outcome}\t{path}");
}

fn build_plan(args: &Args) -> anyhow::Result<Plan> {
    let mut plan = Plan {
        pool: args
            .put
            .iter()
            .map(|(dest, source)| WorkItem::upload(dest, source).on_complete(log_outcome))
            .collect(),
        deletions: args
            .remove
            .iter()
            .map(|dest| WorkItem::delete(dest).on_complete(log_outcome))
            .collect(),
        ..Default::default()
    };
    let mut batches = BTreeMap::new();
    for (dest, source) in &args.publish {
        let (name, batch) = batch_for(&mut batches, dest)?;
        batch.add_file(name, PathBuf::from(source), log_outcome);
    }
    for dest in &args.staged {
        let (name, batch) = batch_for(&mut batches, dest)?;
        batch.add_staged_file(name, log_outcome);
    }
    for (dest, target) in &args.symlink {
        let (name, batch) = batch_for(&mut batches, dest)?;
        batch.add_symlink(name, target, log_outcome);
    }
    for dest in &args.delete {
        let (name, batch) = batch_for(&mut batches, dest)?;
        batch.add_delete(name, log_outcome);
    }
    plan.directories = batches.into_values().collect();
    Ok(plan)
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> anyhow::Result<publish::Summary> {
    if args.chunk_size == 0 {
        return Err(anyhow!("--chunk-size must be greater than 0"));
    }
    if args.max_open_files == 0 {
        return Err(anyhow!("--max-open-files must be greater than 0"));
    }
    let plan = build_plan(&args)?;
    if plan.is_empty() {
        tracing::info!("nothing to do");
        return Ok(publish::Summary::default());
    }
    let ssh = sftp::SshConfig {
        program: args.ssh_program.clone(),
        host: args.host.clone(),
        user: args.user.clone(),
        options: args.ssh_options.clone(),
    };
    let session = sftp::SessionConfig {
        max_open_files: args.max_open_files,
        ..Default::default()
    };
    let settings = Settings {
        target_dir: args.target_dir.clone(),
        chunk_size: args.chunk_size,
    };
    tracing::debug!("publish settings: {:?}", &settings);
    let mut publisher = Publisher::connect(&ssh, session, settings).await?;
    let result = publisher.publish(plan).await;
    if let Err(error) = publisher.close().await {
        tracing::warn!("{:#}", error);
    }
    match result {
        Ok(summary) => Ok(summary),
        Err(error) => {
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let res = common::run(output, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
