//! Command implementations.

use std::path::Path;

use anyhow::{Context, bail};
use snapvault_upload::{
    DEFAULT_EXTENSION, SpeedCalculator, UploadError, UploadEvent, UploadSession, destination_name,
    is_chunk_object,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Target};

/// Uploads `image` to the selected targets, one after the other.
pub async fn upload(
    config: &Config,
    image: &Path,
    target: Option<&str>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    config.validate()?;
    let targets = config.select(target)?;

    let meta = tokio::fs::metadata(image)
        .await
        .with_context(|| format!("cannot access {}", image.display()))?;
    if !meta.is_file() {
        bail!("{} is not a regular file", image.display());
    }
    let total = meta.len();

    // One name for every target so copies of the same run line up.
    let destination = destination_name(&chrono::Local::now(), DEFAULT_EXTENSION);
    info!(
        image = %image.display(),
        bytes = total,
        destination = %destination,
        targets = targets.len(),
        "starting upload"
    );

    let mut failed = 0usize;
    for target in &targets {
        if cancel.is_cancelled() {
            warn!(target_name = %target.name(), "skipped after cancellation");
            failed += 1;
            continue;
        }
        if let Err(e) = upload_to(config, target, image, &destination, total, &cancel).await {
            error!(target_name = %target.name(), error = %format!("{e:#}"), "upload failed");
            failed += 1;
        }
    }

    if cancel.is_cancelled() {
        bail!("cancelled");
    }
    if failed > 0 {
        bail!("{failed} of {} upload(s) failed", targets.len());
    }
    Ok(())
}

async fn upload_to(
    config: &Config,
    target: &Target,
    image: &Path,
    destination: &str,
    total: u64,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let store = target.open()?;
    let mut session = UploadSession::new(store, destination, config.upload.clone())
        .with_cancel_token(cancel.clone());
    let renderer = session
        .take_events()
        .map(|rx| tokio::spawn(render_events(target.name().to_string(), rx, total)));

    let result = session.run_file(image).await;
    // Closes the event channel so the renderer drains and exits.
    drop(session);
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }

    match result {
        Ok(report) => {
            println!(
                "{}: {}/{} ({}, crc32c {}, {} chunk(s), {} compose round(s), {:.1}s)",
                target.name(),
                report.location,
                report.destination,
                format_bytes(report.bytes),
                report.digest,
                report.chunks,
                report.compose_rounds,
                report.elapsed.as_secs_f64(),
            );
            if !report.cleanup.is_clean() {
                println!(
                    "{}: {} temporary object(s) could not be deleted; run `snapvault prune`",
                    target.name(),
                    report.cleanup.failed.len()
                );
            }
            Ok(())
        }
        Err(e @ UploadError::Integrity { .. }) => {
            println!(
                "{}: {}/{destination} was left in place for inspection",
                target.name(),
                target.location()
            );
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Logs session events for one target until the channel closes.
async fn render_events(target: String, mut rx: mpsc::Receiver<UploadEvent>, total: u64) {
    let mut speed = SpeedCalculator::default();
    speed.record(0);

    while let Some(event) = rx.recv().await {
        match event {
            UploadEvent::StateChanged(state) => debug!(target_name = %target, %state, "session state"),
            UploadEvent::Hashed { bytes, digest } => {
                info!(target_name = %target, bytes, crc32c = %digest, "image hashed");
                speed.reset();
                speed.record(0);
            }
            UploadEvent::ChunkUploaded { len, .. } => speed.record(len),
            UploadEvent::Progress {
                bytes_written,
                total,
            } => {
                let percent = if total == 0 {
                    100.0
                } else {
                    bytes_written as f64 * 100.0 / total as f64
                };
                let rate = speed.bytes_per_second();
                let eta = speed
                    .eta(total - bytes_written)
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "?".into());
                info!(
                    target_name = %target,
                    progress = format_args!("{percent:.1}%"),
                    sent = %format_bytes(bytes_written),
                    rate = %format!("{}/s", format_bytes(rate as u64)),
                    eta = %eta,
                    "uploading"
                );
            }
            UploadEvent::Retrying {
                attempt,
                max_attempts,
                delay,
                error,
            } => {
                let delay_secs = delay.as_secs_f64();
                warn!(
                    target_name = %target,
                    attempt,
                    max_attempts,
                    delay_secs = format_args!("{delay_secs:.1}"),
                    error = %error,
                    "retrying"
                );
            }
            UploadEvent::Composed {
                round,
                inputs,
                size,
            } => debug!(target_name = %target, round, inputs, size, "composed"),
            UploadEvent::CleanupFailed { object, error } => {
                warn!(target_name = %target, object = %object, error = %error, "temporary object left behind");
            }
        }
    }
    debug!(target_name = %target, total, "event stream closed");
}

/// Deletes temporary chunk objects left behind by interrupted runs.
pub async fn prune(config: &Config, target: Option<&str>, dry_run: bool) -> anyhow::Result<()> {
    config.validate()?;
    let mut failures = 0usize;

    for target in config.select(target)? {
        let store = target.open()?;
        let leftovers: Vec<String> = store
            .list("")
            .await
            .with_context(|| format!("listing {}", target.name()))?
            .into_iter()
            .map(|o| o.name)
            .filter(|name| is_chunk_object(name))
            .collect();

        if leftovers.is_empty() {
            println!("{}: nothing to prune", target.name());
            continue;
        }

        let mut deleted = 0usize;
        for name in &leftovers {
            if dry_run {
                println!("{}: would delete {name}", target.name());
                continue;
            }
            match store.delete(name).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    warn!(target_name = %target.name(), object = %name, error = %e, "delete failed");
                    failures += 1;
                }
            }
        }
        if !dry_run {
            println!(
                "{}: deleted {deleted} of {} temporary object(s)",
                target.name(),
                leftovers.len()
            );
        }
    }

    if failures > 0 {
        bail!("{failures} object(s) could not be deleted");
    }
    Ok(())
}

/// Prints the configured targets and whether each is valid.
pub fn targets(config: &Config) -> anyhow::Result<()> {
    if config.targets.is_empty() {
        println!("no targets configured");
        return Ok(());
    }

    let mut invalid = 0usize;
    for target in &config.targets {
        let kind = match target {
            Target::Gcs { .. } => "gcs",
            Target::Dir { .. } => "dir",
        };
        match target.validate() {
            Ok(()) => println!("{:<16} {kind:<4} {}", target.name(), target.location()),
            Err(e) => {
                invalid += 1;
                println!("{:<16} {kind:<4} {} (invalid: {e})", target.name(), target.location());
            }
        }
    }

    if invalid > 0 {
        bail!("{invalid} invalid target(s)");
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
