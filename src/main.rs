use anyhow::{Context, Result};
use bundle_patcher::archive::{Archive, DirectoryArchive};
use bundle_patcher::backup::{BackupStore, Backups};
use bundle_patcher::cancel::{CancelToken, RunControl};
use bundle_patcher::config::{Params, PatchLoader};
use bundle_patcher::engine::{OutcomeKind, PatchEngine, PatchState};
use bundle_patcher::log::{SharedLog, TracingLog};
use bundle_patcher::orchestrator::{BatchOptions, BatchReport, Orchestrator, SkipReason};
use bundle_patcher::patch::Patch;
use bundle_patcher::text::DecodedText;
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use similar::{ChangeTag, TextDiff};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const BACKUP_DIR_ENV: &str = "BUNDLE_PATCHER_BACKUP_DIR";

#[derive(Parser)]
#[command(name = "bundle-patcher")]
#[command(about = "Reversible text patching of game asset archives", long_about = None)]
#[command(version)]
struct Cli {
    /// Backup store root (defaults to $BUNDLE_PATCHER_BACKUP_DIR, then
    /// ~/.local/share/bundle-patcher/backups)
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    /// Run without a backup store. Patches applied this way cannot be reverted.
    #[arg(long, global = true)]
    no_backup: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply patches to an archive
    Apply {
        /// Archive root directory
        #[arg(short, long)]
        archive: PathBuf,

        /// Directory of patch documents (defaults to ./patches)
        #[arg(short, long)]
        patches: Option<PathBuf>,

        /// Only run the patches with these ids
        #[arg(long, num_args = 1..)]
        only: Vec<String>,

        /// Brightness / SDR scale multiplier
        #[arg(long)]
        multiplier: Option<f64>,

        /// Gamma value
        #[arg(long)]
        gamma: Option<f64>,

        /// Camera zoom level
        #[arg(long)]
        zoom: Option<u32>,

        /// Global illumination environment light weight (0 to 1)
        #[arg(long)]
        env_light: Option<f64>,

        /// Global illumination indirect light weight (0 to 1)
        #[arg(long)]
        indirect_light: Option<f64>,

        /// Dry run - show what would be changed without modifying files
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Show unified diff of changes
        #[arg(short, long)]
        diff: bool,

        /// Apply even when target files carry markers but have no backup
        #[arg(short, long)]
        force: bool,
    },

    /// Revert patches from their backups
    Revert {
        /// Archive root directory
        #[arg(short, long)]
        archive: PathBuf,

        /// Directory of patch documents (defaults to ./patches)
        #[arg(short, long)]
        patches: Option<PathBuf>,

        /// Only revert the patches with these ids
        #[arg(long, num_args = 1..)]
        only: Vec<String>,
    },

    /// Report Applied / Dirty / NotApplied for every patch
    Status {
        /// Archive root directory
        #[arg(short, long)]
        archive: PathBuf,

        /// Directory of patch documents (defaults to ./patches)
        #[arg(short, long)]
        patches: Option<PathBuf>,
    },

    /// Write every backup back into the archive
    RestoreAll {
        /// Archive root directory
        #[arg(short, long)]
        archive: PathBuf,
    },

    /// List backed-up files
    Backups {
        /// Delete every backup
        #[arg(long)]
        clear: bool,
    },

    /// List available patches
    List {
        /// Directory of patch documents (defaults to ./patches)
        #[arg(short, long)]
        patches: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let log = TracingLog::shared();
    let settings = Settings {
        backup_dir: cli.backup_dir,
        no_backup: cli.no_backup,
        verbose: cli.verbose,
        log,
    };

    match cli.command {
        Commands::Apply {
            archive,
            patches,
            only,
            multiplier,
            gamma,
            zoom,
            env_light,
            indirect_light,
            dry_run,
            diff,
            force,
        } => {
            let overrides = Params {
                multiplier,
                gamma,
                zoom_level: zoom,
                env_light,
                indirect_light,
            };
            cmd_apply(
                &settings,
                &archive,
                patches,
                &only,
                overrides,
                BatchOptions { force, dry_run },
                diff,
            )
        }

        Commands::Revert {
            archive,
            patches,
            only,
        } => cmd_revert(&settings, &archive, patches, &only),

        Commands::Status { archive, patches } => cmd_status(&settings, &archive, patches),

        Commands::RestoreAll { archive } => cmd_restore_all(&settings, &archive),

        Commands::Backups { clear } => cmd_backups(&settings, clear),

        Commands::List { patches } => cmd_list(&settings, patches),
    }
}

/// `RUST_LOG` wins; otherwise `-v` picks the level, defaulting to warn.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Global options shared by every subcommand.
struct Settings {
    backup_dir: Option<PathBuf>,
    no_backup: bool,
    verbose: u8,
    log: SharedLog,
}

impl Settings {
    /// Backup root, in priority order:
    /// 1. Explicit --backup-dir flag
    /// 2. BUNDLE_PATCHER_BACKUP_DIR environment variable
    /// 3. ~/.local/share/bundle-patcher/backups
    fn backup_root(&self) -> Result<PathBuf> {
        if let Some(path) = &self.backup_dir {
            return Ok(path.clone());
        }
        if let Some(path) = env::var_os(BACKUP_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        let home = home::home_dir().ok_or_else(|| {
            anyhow::anyhow!(
                "{}\n  {}",
                "Could not determine the home directory.".red(),
                format!("Pass --backup-dir or set {BACKUP_DIR_ENV}").bold()
            )
        })?;
        Ok(home
            .join(".local")
            .join("share")
            .join("bundle-patcher")
            .join("backups"))
    }

    fn store(&self) -> Result<Arc<BackupStore>> {
        let root = self.backup_root()?;
        let store = BackupStore::open(&root, self.log.clone())
            .with_context(|| format!("failed to open backup store at {}", root.display()))?;
        Ok(Arc::new(store))
    }

    fn engine(&self) -> Result<PatchEngine> {
        let backups = if self.no_backup {
            eprintln!(
                "{}",
                "Warning: running without backups, changes cannot be reverted".yellow()
            );
            Backups::Disabled
        } else {
            Backups::Durable(self.store()?)
        };

        let mut control = RunControl::new(CancelToken::new());
        if self.verbose > 0 {
            control = control.with_progress(|message| eprintln!("{}", message.dimmed()));
        }
        Ok(PatchEngine::new(backups, self.log.clone()).with_control(control))
    }

    fn load_patches(
        &self,
        patches: Option<PathBuf>,
        only: &[String],
        overrides: Params,
    ) -> Result<LoadedPatches> {
        let dir = resolve_patches_dir(patches)?;
        let all = PatchLoader::new(self.log.clone())
            .with_overrides(overrides)
            .load_dir(&dir)?;

        for id in only {
            if !all.iter().any(|p| p.id().eq_ignore_ascii_case(id)) {
                anyhow::bail!("No patch with id '{}' in {}", id, dir.display());
            }
        }
        let selected = if only.is_empty() {
            all.clone()
        } else {
            all.iter()
                .filter(|p| only.iter().any(|id| p.id().eq_ignore_ascii_case(id)))
                .cloned()
                .collect()
        };
        Ok(LoadedPatches { all, selected })
    }
}

/// Every patch in the directory, and the ones `--only` picked.
struct LoadedPatches {
    all: Vec<Patch>,
    selected: Vec<Patch>,
}

/// Explicit --patches flag, else `./patches`.
fn resolve_patches_dir(patches: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = patches {
        return Ok(path);
    }
    let cwd_patches = env::current_dir()?.join("patches");
    if cwd_patches.is_dir() {
        return Ok(cwd_patches);
    }
    anyhow::bail!(
        "{}\n{}\n  {}",
        "Could not find a patches directory.".red(),
        "Try:".bold(),
        "bundle-patcher apply --archive <DIR> --patches /path/to/patches"
    )
}

fn open_archive(path: &Path) -> Result<DirectoryArchive> {
    DirectoryArchive::open(path).with_context(|| format!("failed to open archive {}", path.display()))
}

fn decode_lossy(bytes: &[u8], path: &str) -> String {
    DecodedText::decode(bytes, path)
        .map(|decoded| decoded.text)
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned())
}

/// Helper: Show unified diff between original and modified content
fn display_diff(file: &str, original: &str, modified: &str) {
    println!("\n{}", format!("--- {file} (original)").dimmed());
    println!("{}", format!("+++ {file} (patched)").dimmed());

    let diff = TextDiff::from_lines(original, modified);

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", sign);
    }
}

fn print_outcomes(report: &BatchReport, dry_run: bool) -> usize {
    let mut failed = 0;
    for skipped in &report.skipped {
        match &skipped.reason {
            SkipReason::Disabled => {
                println!("{} {}: Skipped (disabled)", "⊘".cyan(), skipped.patch_id)
            }
            SkipReason::Dirty(states) => {
                println!(
                    "{} {}: Skipped, {} target(s) modified outside the patcher",
                    "⊘".yellow(),
                    skipped.patch_id,
                    states.len()
                );
                for state in states {
                    let markers: Vec<&str> = state.markers.iter().map(|m| m.as_str()).collect();
                    println!("  - {} ({})", state.path, markers.join(", ").dimmed());
                }
                println!("  {}", "Re-run with --force to patch anyway".dimmed());
            }
        }
    }

    for outcome in &report.outcomes {
        let id = &outcome.patch_id;
        match outcome.kind {
            OutcomeKind::Completed => {
                let verb = if dry_run { "Would modify" } else { "Modified" };
                println!(
                    "{} {}: {} {} file(s)",
                    "✓".green(),
                    id,
                    verb,
                    outcome.files_modified
                );
            }
            OutcomeKind::AlreadyApplied => {
                println!("{} {}: Already applied", "⊙".yellow(), id);
            }
            OutcomeKind::NoMatchFound => {
                println!(
                    "{} {}: {} file(s) modified, anchor not found in:",
                    "⚠".yellow(),
                    id,
                    outcome.files_modified
                );
                for path in &outcome.unmatched {
                    println!("  - {}", path);
                }
            }
            OutcomeKind::Cancelled => {
                println!(
                    "{} {}: Cancelled after {} file(s)",
                    "⊘".yellow(),
                    id,
                    outcome.files_modified
                );
            }
            OutcomeKind::Failed => {
                eprintln!(
                    "{} {}: Failed - {}",
                    "✗".red(),
                    id,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
                failed += 1;
            }
        }
    }
    failed
}

fn cmd_apply(
    settings: &Settings,
    archive_path: &Path,
    patches: Option<PathBuf>,
    only: &[String],
    overrides: Params,
    options: BatchOptions,
    show_diff: bool,
) -> Result<()> {
    let LoadedPatches {
        all,
        selected: patches,
    } = settings.load_patches(patches, only, overrides)?;
    if patches.is_empty() {
        println!("{}", "No patches to apply".yellow());
        return Ok(());
    }

    let mut archive = open_archive(archive_path)?;
    let orchestrator = Orchestrator::new(settings.engine()?);

    println!("Archive: {}", archive_path.display());
    println!("Patches: {}", patches.len());
    if options.dry_run {
        println!("{}", "[DRY RUN - showing what would be applied]".cyan());
    }
    println!();

    if !options.dry_run {
        // Markers of patches outside --only still protect their backups.
        let cleared = orchestrator.cleanup_stale_backups(&all, &archive)?;
        if cleared > 0 {
            println!(
                "{}",
                format!("Cleared {cleared} stale backup(s), archive was restored externally")
                    .dimmed()
            );
        }
    }

    // Capture target contents up front so a real run can still show diffs.
    let mut before: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    if show_diff && !options.dry_run {
        for patch in &patches {
            for record in patch.work_list(&archive)? {
                if before.contains_key(record.path()) {
                    continue;
                }
                if let Ok(bytes) = archive.read(&record) {
                    before.insert(record.path().to_string(), bytes);
                }
            }
        }
    }

    let report = orchestrator.apply_batch(&patches, &mut archive, &options)?;
    let failed = print_outcomes(&report, options.dry_run);

    if show_diff {
        if options.dry_run {
            for preview in &report.previews {
                display_diff(
                    &preview.path,
                    &decode_lossy(&preview.before, &preview.path),
                    &decode_lossy(&preview.after, &preview.path),
                );
            }
        } else {
            for (path, original) in &before {
                let Some(record) = archive.find(path) else {
                    continue;
                };
                let Ok(after) = archive.read(&record) else {
                    continue;
                };
                if &after != original {
                    display_diff(path, &decode_lossy(original, path), &decode_lossy(&after, path));
                }
            }
        }
    }

    println!();
    println!("{}", "Summary:".bold());
    println!(
        "  {} file modification(s)",
        format!("{}", report.files_modified).green()
    );
    if options.dry_run {
        println!(
            "  {} file(s) would be written",
            format!("{}", report.previews.len()).green()
        );
    } else {
        println!(
            "  {} file(s) written",
            format!("{}", report.files_written).green()
        );
    }
    println!(
        "  {} skipped",
        format!("{}", report.skipped.len()).cyan()
    );
    println!("  {} failed", format!("{}", failed).red());

    if failed > 0 || report.cancelled {
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_revert(
    settings: &Settings,
    archive_path: &Path,
    patches: Option<PathBuf>,
    only: &[String],
) -> Result<()> {
    let patches = settings
        .load_patches(patches, only, Params::default())?
        .selected;
    let mut archive = open_archive(archive_path)?;
    let orchestrator = Orchestrator::new(settings.engine()?);

    let report = orchestrator.revert_batch(&patches, &mut archive)?;
    let mut failed = 0;
    for outcome in &report.outcomes {
        match outcome.kind {
            OutcomeKind::Failed => {
                eprintln!(
                    "{} {}: Failed - {}",
                    "✗".red(),
                    outcome.patch_id,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
                failed += 1;
            }
            _ if outcome.files_modified == 0 => {
                println!("{} {}: Nothing to revert", "⊙".yellow(), outcome.patch_id);
            }
            _ => {
                println!(
                    "{} {}: Restored {} file(s)",
                    "✓".green(),
                    outcome.patch_id,
                    outcome.files_modified
                );
            }
        }
    }

    println!();
    println!("{}", "Summary:".bold());
    println!(
        "  {} file(s) restored",
        format!("{}", report.files_modified).green()
    );
    println!("  {} failed", format!("{}", failed).red());

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_status(settings: &Settings, archive_path: &Path, patches: Option<PathBuf>) -> Result<()> {
    let patches = settings
        .load_patches(patches, &[], Params::default())?
        .selected;
    let archive = open_archive(archive_path)?;
    let orchestrator = Orchestrator::new(settings.engine()?);

    println!("{}", "Patch Status Report".bold());
    println!("Archive: {}", archive_path.display());
    println!();

    let statuses = orchestrator.status(&patches, &archive);
    let mut applied = Vec::new();
    let mut dirty = Vec::new();
    let mut not_applied = Vec::new();
    for status in &statuses {
        match status.state {
            PatchState::Applied => applied.push(status),
            PatchState::Dirty => dirty.push(status),
            PatchState::NotApplied | PatchState::Failed(_) => not_applied.push(status),
        }
    }

    if !applied.is_empty() {
        println!(
            "{} {} ({} patches)",
            "✓".green(),
            "APPLIED".green().bold(),
            applied.len()
        );
        for status in &applied {
            match status.applied_parameter {
                Some(value) => println!("  - {} ({})", status.patch_id, format!("{value}").dimmed()),
                None => println!("  - {}", status.patch_id),
            }
        }
        println!();
    }

    if !dirty.is_empty() {
        println!(
            "{} {} ({} patches)",
            "⚠".yellow(),
            "DIRTY".yellow().bold(),
            dirty.len()
        );
        for status in &dirty {
            println!("  - {}", status.patch_id);
            for state in &status.dirty {
                println!("      {} {}", state.path, "(marked, no backup)".dimmed());
            }
        }
        println!();
    }

    if !not_applied.is_empty() {
        println!(
            "{} {} ({} patches)",
            "⊙".cyan(),
            "NOT APPLIED".cyan().bold(),
            not_applied.len()
        );
        for status in &not_applied {
            println!("  - {}", status.patch_id);
        }
        println!();
    }

    Ok(())
}

fn cmd_restore_all(settings: &Settings, archive_path: &Path) -> Result<()> {
    let mut archive = open_archive(archive_path)?;
    let orchestrator = Orchestrator::new(settings.engine()?);
    let restored = orchestrator.restore_all(&mut archive)?;
    if restored == 0 {
        println!("{}", "No backups to restore".yellow());
    } else {
        println!("{} Restored {} file(s)", "✓".green(), restored);
    }
    Ok(())
}

fn cmd_backups(settings: &Settings, clear: bool) -> Result<()> {
    let store = settings.store()?;
    println!("Backup store: {}", store.root().display());

    if clear {
        let cleared = store.clear_all()?;
        println!("{} Cleared {} backup(s)", "✓".green(), cleared);
        return Ok(());
    }

    let entries = store.list_all()?;
    if entries.is_empty() {
        println!("{}", "  No backups".dimmed());
    }
    for path in entries {
        println!("  - {}", path);
    }
    Ok(())
}

fn cmd_list(settings: &Settings, patches: Option<PathBuf>) -> Result<()> {
    let patches = settings
        .load_patches(patches, &[], Params::default())?
        .selected;
    if patches.is_empty() {
        println!("{}", "No patches found".yellow());
        return Ok(());
    }

    for patch in &patches {
        let desc = patch.descriptor();
        let status = if desc.enabled {
            "enabled".green()
        } else {
            "disabled".dimmed()
        };
        println!("{} [{}] {}", desc.id.bold(), status, desc.name);
        if !desc.description.is_empty() {
            println!("    {}", desc.description);
        }
        println!(
            "    {}",
            format!(
                "category: {}, impact: {}, marker: {}",
                desc.category, desc.impact_level, desc.marker
            )
            .dimmed()
        );
    }
    Ok(())
}
