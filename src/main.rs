use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use pinsift::config::{Config, MergePolicy};
use pinsift::core::cluster::{compute_clusters, ClusterOptions, WebMercator};
use pinsift::core::convert::ConversionChain;
use pinsift::core::duplicate::{
    cleanup_duplicates_with, find_duplicate_groups, find_orphans, relink_entities, DedupOptions,
    DuplicateGroup,
};
use pinsift::core::exif::CoordinateExtractor;
use pinsift::core::hash::{HashCache, HashOptions};
use pinsift::core::import::{ImportItem, ImportOptions, ImportPipeline};
use pinsift::core::merge::{import_notes, merge_entity_sets_with_stats};
use pinsift::core::store::{ContentStore, DirStore};
use pinsift::models::{Coordinate, PointEntity};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

const HISTORY_FILE: &str = ".history.jsonl";

#[derive(Serialize, Deserialize, Debug)]
struct CleanupHistoryRecord {
    timestamp: String,
    kept: String,
    removed: Vec<String>,
    failed: Vec<String>,
    suspicious: bool,
    reason: String,
    bytes_reclaimed: u64,
}

#[derive(Parser, Debug)]
#[command(name = "pinsift", version, about = "Cluster, import and deduplicate map-pinned photos")]
struct Cli {
    /// Config file (default: <config dir>/pinsift/config.json)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Group pins that overlap on screen at a given view
    Cluster {
        /// Notes file (JSON array of pins)
        #[arg(short, long, value_name = "FILE")]
        notes: PathBuf,
        /// Map zoom level
        #[arg(long, default_value_t = 12.0)]
        zoom: f64,
        /// View centre as `lat,lng` (default: centroid of the pins)
        #[arg(long, value_parser = parse_coordinate)]
        center: Option<Coordinate>,
        /// Viewport width in pixels
        #[arg(long, default_value_t = 1024.0)]
        width: f64,
        /// Viewport height in pixels
        #[arg(long, default_value_t = 768.0)]
        height: f64,
        /// Override the configured pixel threshold
        #[arg(long)]
        threshold: Option<f64>,
        /// Print clusters as JSON
        #[arg(long)]
        json: bool,
    },

    /// Import photos into the store and pin them
    Import {
        /// Directory of photos
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Content store directory
        #[arg(short, long, value_name = "DIR")]
        store: PathBuf,
        /// Notes file to add pins to (created if missing)
        #[arg(short, long, value_name = "FILE")]
        notes: PathBuf,
        /// Do not store photos flagged as duplicates
        #[arg(long)]
        skip_duplicates: bool,
        /// Pin photos without a location here (`lat,lng`) instead of failing them
        #[arg(long, value_parser = parse_coordinate)]
        place: Option<Coordinate>,
    },

    /// Content store maintenance
    Storage {
        #[command(subcommand)]
        command: StorageCmd,
    },

    /// Merge a remote notes file into a local one
    Merge {
        #[arg(long, value_name = "FILE")]
        local: PathBuf,
        #[arg(long, value_name = "FILE")]
        remote: PathBuf,
        /// Where to write the result (default: overwrite `--local`)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Resolve conflicts by version instead of keeping local
        #[arg(long)]
        newer_wins: bool,
    },

    /// Notes workflows
    Notes {
        #[command(subcommand)]
        command: NotesCmd,
    },

    /// Work with cleanup history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Subcommand, Debug)]
enum StorageCmd {
    /// Find and list duplicate groups
    Scan {
        #[arg(short, long, value_name = "DIR")]
        store: PathBuf,
    },

    /// Delete redundant copies, keeping the oldest in each group
    Clean {
        #[arg(short, long, value_name = "DIR")]
        store: PathBuf,
        /// Notes file whose references are repointed at kept copies
        #[arg(short, long, value_name = "FILE", required_unless_present = "dry_run")]
        notes: Option<PathBuf>,
        /// Only show what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// List stored content no pin references
    Orphans {
        #[arg(short, long, value_name = "DIR")]
        store: PathBuf,
        #[arg(short, long, value_name = "FILE")]
        notes: PathBuf,
        /// Delete them after confirmation
        #[arg(long)]
        delete: bool,
    },
}

#[derive(Subcommand, Debug)]
enum NotesCmd {
    /// Append notes from another file, skipping duplicates
    Import {
        /// Notes file to add to
        #[arg(long, value_name = "FILE")]
        into: PathBuf,
        /// Notes file to read from
        #[arg(long, value_name = "FILE")]
        from: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all cleanup history records
    List {
        #[arg(short, long, value_name = "DIR")]
        store: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.log_level);

    match cli.command {
        Commands::Cluster {
            notes,
            zoom,
            center,
            width,
            height,
            threshold,
            json,
        } => {
            let points = load_notes(&notes)?;
            let center = center.or_else(|| centroid(&points)).unwrap_or(Coordinate::new(0.0, 0.0));
            let projector = WebMercator::new(center, zoom, width, height);
            let options = ClusterOptions {
                threshold_px: threshold.unwrap_or(config.clustering.threshold_px),
                lat_epsilon: config.clustering.lat_epsilon,
            };

            let clusters = compute_clusters(&points, &projector, options);
            if json {
                println!("{}", serde_json::to_string_pretty(&clusters)?);
                return Ok(());
            }

            println!(
                "▶ {} pins → {} clusters at zoom {} ({}px threshold)",
                points.len(),
                clusters.len(),
                zoom,
                options.threshold_px
            );
            for (i, cluster) in clusters.iter().enumerate() {
                let rep = cluster.representative();
                let anchor = cluster
                    .anchor
                    .map(|p| format!("({:.1}, {:.1})", p.x, p.y))
                    .unwrap_or_else(|| "(off-screen)".to_string());
                println!(" Cluster {} [{}] {} {}", i + 1, cluster.len(), rep.id, anchor);
                for member in &cluster.members[1..] {
                    println!("   ▶ {}", member.id);
                }
            }
        }

        Commands::Import {
            path,
            store,
            notes,
            skip_duplicates,
            place,
        } => {
            let store = DirStore::open(&store)
                .with_context(|| format!("Failed to open store {:?}", store))?;
            let mut entities = if notes.exists() {
                load_notes(&notes)?
            } else {
                Vec::new()
            };

            let options = ImportOptions {
                skip_duplicates: skip_duplicates || config.import.skip_duplicates,
                require_coordinate: true,
                fallback_coordinate: place,
                perceptual_tolerance: config.dedup.perceptual_tolerance,
            };
            let mut pipeline = ImportPipeline::new(
                &store,
                CoordinateExtractor::default(),
                conversion_chain(&config),
                options,
            );
            pipeline.seed_index(&entities);
            pipeline
                .seed_store()
                .context("Failed to index stored content")?;

            let photos = scan_directory(&path, &config)?;
            println!("▶ Importing {} photos…", photos.len());
            let bar = ProgressBar::new(photos.len() as u64);
            bar.set_style(ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} {msg}",
            )?);

            let totals = import_photos(&mut pipeline, &photos, &mut entities, &bar);
            bar.finish_with_message("Import complete");

            save_notes(&notes, &entities)?;
            println!(
                "\n✅ Added {} pins ({} flagged as duplicates, {} failed) to {}",
                totals.added,
                totals.flagged,
                totals.failed,
                notes.display()
            );
        }

        Commands::Storage { command } => match command {
            StorageCmd::Scan { store } => {
                let store = DirStore::open(&store)
                    .with_context(|| format!("Failed to open store {:?}", store))?;
                let mut cache = HashCache::new();
                let report = benchmark("hashing stored content", || {
                    find_duplicate_groups(&store, &mut cache, &dedup_options(&config))
                })?;

                if report.groups.is_empty() {
                    println!("No duplicates found among {} items.", report.scanned);
                } else {
                    println!("Found {} duplicate group(s):", report.groups.len());
                    for (i, group) in report.groups.iter().enumerate() {
                        let label = if group.is_suspicious() { "⚠️  suspicious" } else { "safe" };
                        println!(" Group {} ({}: {}):", i + 1, label, group.classification.reason);
                        for member in &group.members {
                            println!("   ▶ {} ({} bytes)", member.id, member.size);
                        }
                    }
                }
                for id in &report.unreadable {
                    eprintln!("⚠️  Could not read {}", id);
                }
            }

            StorageCmd::Clean {
                store: store_dir,
                notes,
                dry_run,
            } => {
                let store = DirStore::open(&store_dir)
                    .with_context(|| format!("Failed to open store {:?}", store_dir))?;
                // Parse the notes before anything is deleted.
                let mut entities = match &notes {
                    Some(notes) => load_notes(notes)?,
                    None => Vec::new(),
                };

                let mut cache = HashCache::new();
                let report = find_duplicate_groups(&store, &mut cache, &dedup_options(&config))?;
                if report.groups.is_empty() {
                    println!("No duplicates found.");
                    return Ok(());
                }

                if dry_run {
                    for (i, group) in report.groups.iter().enumerate() {
                        println!("\n✨ Group {} ({}):", i + 1, group.classification.reason);
                        println!("   🏆 Keeping → {}", group.keep().id);
                        for member in group.redundant() {
                            println!("   🗑️  [dry-run] DELETE {}", member.id);
                        }
                    }
                    println!("\n⚠️  Dry-run only; nothing was deleted.");
                    return Ok(());
                }

                let notes = notes.context("--notes is required unless --dry-run is given")?;
                let history_file = store_dir.join(HISTORY_FILE);
                let mut history_out = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&history_file)
                    .with_context(|| format!("Failed to open history file {:?}", history_file))?;

                let mut totals = CleanTotals::default();
                let outcome = clean_groups(
                    &store,
                    &report.groups,
                    &mut entities,
                    &mut history_out,
                    confirm_suspicious,
                    &mut totals,
                );
                // Save relinked references even when cleanup stopped early.
                save_notes(&notes, &entities)?;
                outcome?;

                println!("🔗 Repointed {} references in {}", totals.relinked, notes.display());
                println!(
                    "\n✅ Deleted {}/{} copies, reclaimed {} bytes. History in {}",
                    totals.removed,
                    totals.attempted,
                    totals.reclaimed,
                    history_file.display()
                );
            }

            StorageCmd::Orphans {
                store,
                notes,
                delete,
            } => {
                let store = DirStore::open(&store)
                    .with_context(|| format!("Failed to open store {:?}", store))?;
                let entities = load_notes(&notes)?;
                let orphans = find_orphans(&store, &entities)?;
                if orphans.is_empty() {
                    println!("No orphaned content.");
                    return Ok(());
                }

                println!("Found {} orphaned item(s):", orphans.len());
                for id in &orphans {
                    println!("   ▶ {}", id);
                }

                if delete
                    && Confirm::new()
                        .with_prompt(format!("Permanently delete {} items?", orphans.len()))
                        .default(false)
                        .interact()
                        .context("Failed to read confirmation")?
                {
                    for id in &orphans {
                        match store.delete(id) {
                            Ok(()) => println!("   🗑️  Deleted {}", id),
                            Err(e) => eprintln!("   ⚠️  Failed to delete {}: {}", id, e),
                        }
                    }
                }
            }
        },

        Commands::Merge {
            local,
            remote,
            output,
            newer_wins,
        } => {
            let policy = if newer_wins {
                MergePolicy::NewerVersion
            } else {
                config.merge.policy
            };
            let ours = load_notes(&local)?;
            let theirs = load_notes(&remote)?;
            let (merged, stats) = merge_entity_sets_with_stats(&ours, &theirs, policy);

            let output = output.unwrap_or(local);
            save_notes(&output, &merged)?;
            println!(
                "✅ {} pins written to {} ({} local only, {} remote only, {} conflicts, {} taken from remote)",
                merged.len(),
                output.display(),
                stats.local_only,
                stats.remote_only,
                stats.conflicts,
                stats.remote_won
            );
        }

        Commands::Notes { command } => match command {
            NotesCmd::Import { into, from } => {
                let existing = if into.exists() {
                    load_notes(&into)?
                } else {
                    Vec::new()
                };
                let incoming = load_notes(&from)?;
                let result = import_notes(existing, incoming, config.merge.note_coordinate_tolerance);
                save_notes(&into, &result.entities)?;
                println!(
                    "✅ Added {} notes, skipped {} duplicates, renamed {}",
                    result.added, result.skipped, result.renamed
                );
            }
        },

        Commands::History { command } => match command {
            HistoryCmd::List { store } => {
                let history_file = store.join(HISTORY_FILE);
                let f = File::open(&history_file)
                    .with_context(|| format!("Could not open history file {:?}", history_file))?;
                let reader = BufReader::new(f);

                println!("🗂️  Cleanup History:");
                for (i, line) in reader.lines().enumerate() {
                    let line = line?;
                    match serde_json::from_str::<CleanupHistoryRecord>(&line) {
                        Ok(rec) => println!(
                            "[{}] {}{}\n     kept: {}\n     removed: {:?}\n     failed: {:?}\n     reclaimed: {} bytes\n",
                            i,
                            rec.timestamp,
                            if rec.suspicious { " (suspicious, confirmed)" } else { "" },
                            rec.kept,
                            rec.removed,
                            rec.failed,
                            rec.bytes_reclaimed
                        ),
                        Err(err) => eprintln!("⚠️  Skipping malformed entry {}: {}", i, err),
                    }
                }
            }
        },
    }

    Ok(())
}

fn init_logging(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ImportTotals {
    added: usize,
    flagged: usize,
    failed: usize,
}

/// Import `photos` one by one, pinning each stored photo. Never stops early.
fn import_photos(
    pipeline: &mut ImportPipeline<'_>,
    photos: &[PathBuf],
    entities: &mut Vec<PointEntity>,
    bar: &ProgressBar,
) -> ImportTotals {
    let mut totals = ImportTotals::default();
    let now = Utc::now().timestamp_millis();

    for (i, photo) in photos.iter().enumerate() {
        let name = photo.display().to_string();
        bar.set_message(name.clone());

        let result = fs::read(photo)
            .with_context(|| format!("Failed to read {:?}", photo))
            .and_then(|bytes| Ok(pipeline.import_item(ImportItem::new(name.clone(), bytes))?));
        match result {
            Ok(outcome) => {
                if let Some(found) = &outcome.duplicate {
                    totals.flagged += 1;
                    bar.println(format!(
                        "   ⚠️  {} looks like {} ({:?})",
                        name, found.existing_id, found.kind
                    ));
                }
                if let Some(entity) = outcome.to_entity(format!("pin_{}_{}", now, i), now) {
                    entities.push(entity);
                    totals.added += 1;
                }
            }
            Err(e) => {
                totals.failed += 1;
                bar.println(format!("   ❌ {}: {:#}", name, e));
            }
        }
        bar.inc(1);
    }
    totals
}

#[derive(Debug, Default)]
struct CleanTotals {
    attempted: usize,
    removed: usize,
    relinked: usize,
    reclaimed: u64,
}

/// Clean each group in turn, repointing `entities` as soon as a group's copies
/// are gone. `totals` and `entities` stay accurate if this returns early.
fn clean_groups<W, C>(
    store: &dyn ContentStore,
    groups: &[DuplicateGroup],
    entities: &mut [PointEntity],
    history: &mut W,
    mut confirm: C,
    totals: &mut CleanTotals,
) -> Result<()>
where
    W: Write,
    C: FnMut(usize, &DuplicateGroup) -> Result<bool>,
{
    for (i, group) in groups.iter().enumerate() {
        println!("\n✨ Group {} ({}):", i + 1, group.classification.reason);
        println!("   🏆 Keeping → {}", group.keep().id);

        let approved = !group.is_suspicious() || confirm(i, group)?;
        let result = cleanup_duplicates_with(store, std::slice::from_ref(group), |_| approved);
        if result.groups_skipped > 0 {
            println!("   ⏭️  Skipped");
            continue;
        }
        for failure in &result.failures {
            eprintln!("   ⚠️  Failed to delete {}: {}", failure.id, failure.error);
        }
        for id in result.remap.keys() {
            println!("   🗑️  Deleted {}", id);
        }

        totals.relinked += relink_entities(entities, &result.remap);
        totals.attempted += result.attempted;
        totals.removed += result.removed;
        totals.reclaimed += result.bytes_reclaimed;

        let record = CleanupHistoryRecord {
            timestamp: Utc::now().to_rfc3339(),
            kept: group.keep().id.clone(),
            removed: result.remap.keys().cloned().collect(),
            failed: result.failures.iter().map(|f| f.id.clone()).collect(),
            suspicious: group.is_suspicious(),
            reason: group.classification.reason.clone(),
            bytes_reclaimed: result.bytes_reclaimed,
        };
        writeln!(history, "{}", serde_json::to_string(&record)?)?;
    }
    Ok(())
}

fn confirm_suspicious(index: usize, group: &DuplicateGroup) -> Result<bool> {
    Confirm::new()
        .with_prompt(format!(
            "Group {} is suspicious ({}). Delete {} copies anyway?",
            index + 1,
            group.classification.reason,
            group.redundant().len()
        ))
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

fn parse_coordinate(raw: &str) -> Result<Coordinate, String> {
    let (lat, lng) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected `lat,lng`, got {:?}", raw))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("bad latitude: {}", e))?;
    let lng: f64 = lng.trim().parse().map_err(|e| format!("bad longitude: {}", e))?;
    Ok(Coordinate::new(lat, lng))
}

fn centroid(points: &[PointEntity]) -> Option<Coordinate> {
    let valid: Vec<Coordinate> = points
        .iter()
        .filter(|p| p.has_valid_coordinate())
        .map(PointEntity::coordinate)
        .collect();
    if valid.is_empty() {
        return None;
    }
    let n = valid.len() as f64;
    Some(Coordinate::new(
        valid.iter().map(|c| c.lat).sum::<f64>() / n,
        valid.iter().map(|c| c.lng).sum::<f64>() / n,
    ))
}

fn conversion_chain(config: &Config) -> ConversionChain {
    let chain = ConversionChain::standard(&config.import.jpeg_qualities)
        .with_max_dimension(config.import.max_dimension);
    match config.import.max_encoded_bytes {
        Some(limit) => chain.with_max_encoded_bytes(limit),
        None => chain,
    }
}

fn dedup_options(config: &Config) -> DedupOptions {
    DedupOptions {
        hash: HashOptions {
            sample_len: config.dedup.hash_sample_len,
            hex_len: config.dedup.hash_hex_len,
        },
        suspicious_window_ms: config.dedup.suspicious_window_ms,
        suspicious_min_members: config.dedup.suspicious_min_members,
    }
}

fn load_notes(path: &Path) -> Result<Vec<PointEntity>> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("Failed to read notes {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Malformed notes file {:?}", path))
}

fn save_notes(path: &Path, entities: &[PointEntity]) -> Result<()> {
    let json = serde_json::to_string_pretty(entities)?;
    fs::write(path, json).with_context(|| format!("Failed to write notes {:?}", path))
}

/// Photos under `dir` with a configured extension, in file-name order.
fn scan_directory(dir: &Path, config: &Config) -> Result<Vec<PathBuf>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message(format!("Looking for photos in {}…", dir.display()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut photos = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if entry.file_type().is_file() && config.import.accepts(entry.path()) {
            photos.push(entry.into_path());
        }
        spinner.tick();
    }
    spinner.finish_with_message(format!("Found {} photos", photos.len()));
    Ok(photos)
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use pinsift::core::store::MemoryStore;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn photo_bytes(seed: u8) -> Vec<u8> {
        let img = ImageBuffer::from_fn(16, 12, |x, y| {
            Rgb([(x as u8).wrapping_mul(9).wrapping_add(seed), (y as u8) * 11, seed])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_import_photos_continues_past_unreadable_file() {
        let temp_dir = TempDir::new().unwrap();
        let good = temp_dir.path().join("good.png");
        fs::write(&good, photo_bytes(1)).unwrap();
        let missing = temp_dir.path().join("vanished.png");

        let store = MemoryStore::new();
        let options = ImportOptions {
            require_coordinate: true,
            fallback_coordinate: Some(Coordinate::new(45.0, 7.0)),
            ..ImportOptions::default()
        };
        let mut pipeline = ImportPipeline::new(
            &store,
            CoordinateExtractor::default(),
            conversion_chain(&Config::default()),
            options,
        );

        let mut entities = Vec::new();
        let totals = import_photos(
            &mut pipeline,
            &[missing, good],
            &mut entities,
            &ProgressBar::hidden(),
        );

        assert_eq!(
            totals,
            ImportTotals {
                added: 1,
                flagged: 0,
                failed: 1,
            }
        );
        assert_eq!(entities.len(), 1);
        assert!(find_orphans(&store, &entities).unwrap().is_empty());
    }

    #[test]
    fn test_import_photos_without_location_stores_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let photo = temp_dir.path().join("nowhere.png");
        fs::write(&photo, photo_bytes(2)).unwrap();

        let store = MemoryStore::new();
        let options = ImportOptions {
            require_coordinate: true,
            ..ImportOptions::default()
        };
        let mut pipeline = ImportPipeline::new(
            &store,
            CoordinateExtractor::default(),
            conversion_chain(&Config::default()),
            options,
        );

        let mut entities = Vec::new();
        let totals = import_photos(&mut pipeline, &[photo], &mut entities, &ProgressBar::hidden());
        assert_eq!(totals.failed, 1);
        assert!(entities.is_empty());
        assert!(store.is_empty());
    }

    fn seeded_groups(store: &MemoryStore) -> Vec<DuplicateGroup> {
        // Safe pair, then a suspicious burst of three.
        store.put("img_1000_aaaa0001", b"sunset").unwrap();
        store.put("img_900000000_aaaa0002", b"sunset").unwrap();
        store.put("img_5000_bbbb0001", b"harbour").unwrap();
        store.put("img_5100_bbbb0002", b"harbour").unwrap();
        store.put("img_5200_bbbb0003", b"harbour").unwrap();

        let mut cache = HashCache::new();
        find_duplicate_groups(store, &mut cache, &DedupOptions::default())
            .unwrap()
            .groups
    }

    fn pin(id: &str, image: &str) -> PointEntity {
        let mut entity = PointEntity::new(id, Coordinate::new(1.0, 1.0));
        entity.images.push(image.to_string());
        entity
    }

    #[test]
    fn test_clean_groups_relinks_as_it_goes() {
        let store = MemoryStore::new();
        let groups = seeded_groups(&store);
        let mut entities = vec![
            pin("p1", "img_900000000_aaaa0002"),
            pin("p2", "img_5100_bbbb0002"),
        ];
        let mut history = Vec::new();
        let mut totals = CleanTotals::default();

        let result = clean_groups(
            &store,
            &groups,
            &mut entities,
            &mut history,
            |_, _| Err(anyhow::anyhow!("no terminal")),
            &mut totals,
        );

        assert!(result.is_err());
        assert_eq!(totals.removed, 1);
        assert_eq!(totals.relinked, 1);
        assert_eq!(entities[0].images, vec!["img_1000_aaaa0001"]);
        assert_eq!(entities[1].images, vec!["img_5100_bbbb0002"]);
        assert_eq!(store.len(), 4);

        let lines: Vec<CleanupHistoryRecord> = String::from_utf8(history)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].removed, vec!["img_900000000_aaaa0002"]);
    }

    #[test]
    fn test_clean_groups_confirmed_suspicious_group() {
        let store = MemoryStore::new();
        let groups = seeded_groups(&store);
        let mut entities = vec![pin("p2", "img_5200_bbbb0003")];
        let mut totals = CleanTotals::default();
        let mut asked = Vec::new();

        clean_groups(
            &store,
            &groups,
            &mut entities,
            &mut std::io::sink(),
            |i, _| {
                asked.push(i);
                Ok(true)
            },
            &mut totals,
        )
        .unwrap();

        assert_eq!(asked, vec![1]);
        assert_eq!(totals.removed, 3);
        assert_eq!(entities[0].images, vec!["img_5000_bbbb0001"]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_scan_directory_uses_configured_extensions() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("trip")).unwrap();
        for name in ["a.JPG", "trip/b.heic", "notes.txt", "trip/c.png"] {
            fs::write(temp_dir.path().join(name), b"x").unwrap();
        }

        let mut config = Config::default();
        let found = scan_directory(temp_dir.path(), &config).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.JPG", "c.png"]);

        config.import.extensions = vec!["heic".to_string()];
        let found = scan_directory(temp_dir.path(), &config).unwrap();
        assert_eq!(found, vec![temp_dir.path().join("trip/b.heic")]);
    }
}
