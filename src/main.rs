use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use facegallery::config::Config;
use facegallery::db::{FaceId, PersonId, SqliteStore};
use facegallery::export::{export_assignments, ExportFormat, ScanReport};
use facegallery::faces::{
    auto_merge_provisional, merge_persons, merge_suggestions, people, ClusteringEngine, IndexPipeline, RunSummary,
};
use facegallery::logging::{self, LogTarget};
use facegallery::scanner::ScanEvent;
use facegallery::IndexError;

#[derive(Parser, Debug)]
#[command(name = "facegallery", version, about = "Index photo folders and group faces into persons")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log to stderr at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan photo folders, extract faces and cluster them
    Scan {
        /// Folders to scan (default: `scanner.roots` from the config)
        #[arg(value_name = "DIR")]
        roots: Vec<PathBuf>,
        /// Only index files; faces stay queued for a later run
        #[arg(long)]
        no_detect: bool,
        /// Write every event of the run to a CSV file
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Re-scan the configured folders periodically
    Watch {
        /// Seconds between scans
        #[arg(short, long, default_value_t = 300)]
        interval: u64,
    },

    /// Recompute every automatic assignment from scratch
    Recluster,

    /// List persons with their face counts
    Persons,

    /// List pairs of persons that look like the same person
    SuggestMerges,

    /// Merge SOURCE into TARGET
    Merge {
        target: PersonId,
        source: PersonId,
        /// Confirm a merge that involves a named person
        #[arg(long)]
        yes: bool,
    },

    /// Merge close pairs of unnamed persons
    AutoMerge,

    /// Assign a face to a person by hand
    Assign { face: FaceId, person: PersonId },

    /// Name a person (an empty name makes it unnamed again)
    Rename { person: PersonId, name: String },

    /// Delete a person; its faces become unassigned
    DeletePerson { person: PersonId },

    /// Create a named person from the given faces
    CreatePerson {
        name: String,
        #[arg(value_name = "FACE", required = true)]
        faces: Vec<FaceId>,
    },

    /// Delete a face that is not a face at all
    DeleteFace { face: FaceId },

    /// Export face assignments (CSV, or JSON for a `.json` file)
    Export {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let target = if cli.verbose {
        LogTarget::Stderr
    } else {
        LogTarget::Background
    };
    logging::init(target, None)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let mut store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open index {}", config.db_path.display()))?;

    match cli.command {
        Commands::Scan {
            roots,
            no_detect,
            report,
        } => {
            let roots = resolve_roots(roots, &config)?;
            let pipeline = IndexPipeline::from_config(&config, !no_detect)?;
            let cancel = cancel_on_interrupt()?;
            let summary = run_once(&pipeline, &mut store, &roots, &cancel, report.as_deref())?;
            print_summary(&summary);
        }

        Commands::Watch { interval } => {
            let roots = resolve_roots(Vec::new(), &config)?;
            let pipeline = IndexPipeline::from_config(&config, true)?;
            let cancel = cancel_on_interrupt()?;
            tracing::info!(interval, roots = roots.len(), "Watching library");
            while !cancel.load(Ordering::Relaxed) {
                let summary = run_once(&pipeline, &mut store, &roots, &cancel, None)?;
                print_summary(&summary);
                sleep_unless_cancelled(Duration::from_secs(interval.max(1)), &cancel);
            }
            tracing::info!("Stopped watching");
        }

        Commands::Recluster => {
            let (engine, summary) = ClusteringEngine::recluster_all(
                &mut store,
                config.faces.preferred_threshold(),
                Some(config.faces.embedding_dim),
            )?;
            println!(
                "Re-clustered {} faces into {} persons ({} kept manual, {} unassigned)",
                summary.assigned,
                engine.persons().filter(|p| p.member_count > 0).count(),
                summary.manual_kept,
                summary.unassigned
            );
        }

        Commands::Persons => {
            let persons = people::list_persons(&store)?;
            if persons.is_empty() {
                println!("No persons yet.");
            }
            for entry in persons {
                println!(
                    "{:>6}  {:<24} {:>5} faces ({} manual)",
                    entry.person.id,
                    entry.person.display_name(),
                    entry.faces,
                    entry.manual_faces
                );
            }
        }

        Commands::SuggestMerges => {
            let engine = load_engine(&store, &config)?;
            let suggestions = merge_suggestions(&engine, config.faces.merge_threshold);
            if suggestions.is_empty() {
                println!("No merge suggestions.");
            }
            for s in suggestions {
                let name = |id| {
                    engine
                        .person(id)
                        .map(|p| p.display_name())
                        .unwrap_or_else(|| id.to_string())
                };
                println!(
                    "{:.3}  {} ({}) <- {} ({}){}",
                    s.distance,
                    name(s.target),
                    s.target,
                    name(s.source),
                    s.source,
                    if s.auto_mergeable { "  [auto]" } else { "" }
                );
            }
        }

        Commands::Merge { target, source, yes } => {
            let mut engine = load_engine(&store, &config)?;
            match merge_persons(&mut engine, &mut store, target, source, yes) {
                Ok(person) => println!("Merged {} into {}", source, person.display_name()),
                Err(IndexError::MergeRequiresConfirmation(id)) => {
                    bail!("Person {} is named; re-run with --yes to merge", id)
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::AutoMerge => {
            let mut engine = load_engine(&store, &config)?;
            let merges = auto_merge_provisional(&mut engine, &mut store, config.faces.merge_threshold)?;
            for m in &merges {
                println!("Merged {} into {} (distance {:.3})", m.source, m.target, m.distance);
            }
            println!("{} merge(s)", merges.len());
        }

        Commands::Assign { face, person } => {
            let mut engine = load_engine(&store, &config)?;
            people::assign_face(&mut engine, &mut store, face, person)?;
            println!("Face {} assigned to person {}", face, person);
        }

        Commands::Rename { person, name } => {
            let mut engine = load_engine(&store, &config)?;
            let renamed = people::rename_person(&mut engine, &mut store, person, Some(&name))?;
            println!("Person {} is now {}", person, renamed.display_name());
        }

        Commands::DeletePerson { person } => {
            let mut engine = load_engine(&store, &config)?;
            let deleted = people::delete_person(&mut engine, &mut store, person)?;
            println!("Deleted {}", deleted.display_name());
        }

        Commands::CreatePerson { name, faces } => {
            let mut engine = load_engine(&store, &config)?;
            let person = people::create_person(&mut engine, &mut store, Some(&name), &faces)?;
            println!(
                "Created person {} ({}) with {} faces",
                person.id,
                person.display_name(),
                person.member_count
            );
        }

        Commands::DeleteFace { face } => {
            let mut engine = load_engine(&store, &config)?;
            let deleted = people::delete_face(&mut engine, &mut store, face)?;
            match deleted.person_id {
                Some(person) => println!("Deleted face {} (was in person {})", face, person),
                None => println!("Deleted face {}", face),
            }
        }

        Commands::Export { file } => {
            let format = ExportFormat::from_path(&file);
            let count = export_assignments(&store, &file, format)?;
            println!("Exported {} faces to {} ({})", count, file.display(), format.name());
        }
    }

    Ok(())
}

fn resolve_roots(roots: Vec<PathBuf>, config: &Config) -> Result<Vec<PathBuf>> {
    let roots = if roots.is_empty() {
        config.scanner.roots.clone()
    } else {
        roots
    };
    if roots.is_empty() {
        bail!("No folders to scan: pass them on the command line or set scanner.roots in the config");
    }
    Ok(roots)
}

fn load_engine(store: &SqliteStore, config: &Config) -> Result<ClusteringEngine> {
    let engine = ClusteringEngine::load(store, config.faces.preferred_threshold())?;
    Ok(engine.with_dimension(config.faces.embedding_dim))
}

/// Cancellation flag set by the first Ctrl-C or SIGTERM. A second Ctrl-C
/// exits at once.
fn cancel_on_interrupt() -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;

    let flag = Arc::clone(&cancel);
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if let Err(e) = interrupted().await {
                    tracing::warn!(error = %e, "Cannot listen for interrupts");
                    return;
                }
                tracing::warn!("Interrupted, stopping after committed work");
                eprintln!("Interrupted; finishing up (press Ctrl-C again to quit now)");
                flag.store(true, Ordering::Relaxed);

                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        })
        .context("Failed to spawn signal thread")?;
    Ok(cancel)
}

async fn interrupted() -> std::io::Result<()> {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())?.recv().await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        result = terminate => result,
    }
}

fn sleep_unless_cancelled(duration: Duration, cancel: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !cancel.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(200)));
    }
}

fn run_once(
    pipeline: &IndexPipeline,
    store: &mut SqliteStore,
    roots: &[PathBuf],
    cancel: &AtomicBool,
    report: Option<&Path>,
) -> Result<RunSummary> {
    let mut report = report.map(ScanReport::create).transpose()?;
    let mut report_error = None;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} [{pos}] {msg}")?);
    spinner.set_message("Scanning…");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut on_event = |event: &ScanEvent| {
        spinner.inc(1);
        spinner.set_message(format!("{} {}", event.label(), event.path().display()));
        if let Some(report) = report.as_mut() {
            if let Err(e) = report.record(event) {
                report_error.get_or_insert(e);
            }
        }
    };
    let summary = pipeline.run(store, roots, cancel, &mut on_event);
    spinner.finish_and_clear();
    let summary = summary?;

    if let Some(e) = report_error {
        return Err(e.context("Failed to write scan report"));
    }
    if let Some(report) = report {
        let rows = report.finish()?;
        println!("Wrote {} report rows", rows);
    }
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    let scan = &summary.scan;
    println!(
        "Scanned {} files: {} added ({} duplicates), {} modified, {} unchanged, {} removed, {} errors",
        scan.total(),
        scan.added,
        scan.duplicates,
        scan.modified,
        scan.unchanged,
        scan.removed,
        scan.errored
    );
    match &summary.backend {
        Some(backend) => println!(
            "Faces ({}): {} detected in {} photos, {} new persons, {} unassigned, {} detection errors",
            backend,
            summary.faces_detected,
            summary.photos_processed,
            summary.persons_created,
            summary.faces_unassigned,
            summary.detection_errors
        ),
        None => println!("Face detection skipped"),
    }
    if summary.pending > 0 {
        println!("{} photos waiting for face detection", summary.pending);
    }
    if scan.cancelled {
        println!("Scan was interrupted; run it again to continue");
    }

    for failure in scan.failures.iter().chain(&summary.failures) {
        println!("  [{}] {}: {}", failure.kind, failure.path.display(), failure.reason);
    }
}
