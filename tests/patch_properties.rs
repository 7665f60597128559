//! End-to-end behavior of the patch engine and orchestrator
//!
//! Covers:
//! 1. First-touch backups across several patches
//! 2. No-op replay of applied patches
//! 3. Convergence of re-applied parameterized patches
//! 4. Dirty detection
//! 5. Byte-exact revert, including UTF-16 files
//! 6. Target selection
//! 7. Revert across patches sharing a file
//! 8. Cancellation between files

use bundle_patcher::archive::{Archive, MemoryArchive};
use bundle_patcher::backup::{BackupStore, Backups};
use bundle_patcher::cancel::{CancelToken, RunControl};
use bundle_patcher::config::PatchBuilder;
use bundle_patcher::engine::{OutcomeKind, PatchEngine, PatchState};
use bundle_patcher::log::NullLog;
use bundle_patcher::orchestrator::{BatchOptions, Orchestrator};
use bundle_patcher::patch::Patch;
use bundle_patcher::select::{select, TargetSpec};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const POST_FX: &str = "float fog = ComputeFog(depth);\r\nfloat bloom = ComputeBloom(colour);\r\n";

const TONEMAP: &str = "float4 Tonemap(float4 colour)\r\n{\r\n\treturn colour * hdr_scale;\r\n}\r\n";

fn engine_with_store() -> (TempDir, PatchEngine, Arc<BackupStore>) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BackupStore::open(dir.path().join("backups"), NullLog::shared()).unwrap());
    let engine = PatchEngine::new(Backups::Durable(Arc::clone(&store)), NullLog::shared());
    (dir, engine, store)
}

fn shader_patch(id: &str, from: &str, to: &str) -> Patch {
    let marker = format!("{{{{PATCHER_{id}}}}}");
    PatchBuilder::new(id, "PATCHER")
        .targets(TargetSpec {
            extensions: vec![".hlsl".into()],
            ..TargetSpec::default()
        })
        .literal(from, format!("{to} //{marker}"))
        .build()
        .unwrap()
}

fn fog() -> Patch {
    shader_patch(
        "fog",
        "float fog = ComputeFog(depth);",
        "float fog = 0.0f;",
    )
}

fn bloom() -> Patch {
    shader_patch(
        "bloom",
        "float bloom = ComputeBloom(colour);",
        "float bloom = 0.0f;",
    )
}

fn brightness(multiplier: f64) -> Patch {
    PatchBuilder::brightness("PATCHER", multiplier)
        .targets(TargetSpec::files(["shaders/renderer/tonemap.hlsl"]))
        .build()
        .unwrap()
}

#[test]
fn test_first_touch_backup_survives_later_patches() {
    let (_dir, engine, store) = engine_with_store();
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);

    assert!(engine.apply(&fog(), &mut archive, None).success());
    assert!(engine.apply(&bloom(), &mut archive, None).success());

    assert_eq!(store.list_all().unwrap(), vec!["shaders/postfx.hlsl"]);
    assert_eq!(
        store.get("shaders/postfx.hlsl").unwrap().unwrap(),
        POST_FX.as_bytes()
    );
}

#[test]
fn test_first_touch_within_one_batch() {
    let (_dir, engine, store) = engine_with_store();
    let orchestrator = Orchestrator::new(engine);
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);

    let report = orchestrator
        .apply_batch(&[fog(), bloom()], &mut archive, &BatchOptions::default())
        .unwrap();
    assert!(report.success());
    assert_eq!(report.files_modified, 2);
    assert_eq!(report.files_written, 1);
    assert_eq!(archive.save_count(), 1);
    assert_eq!(
        store.get("shaders/postfx.hlsl").unwrap().unwrap(),
        POST_FX.as_bytes()
    );
}

#[test]
fn test_replay_is_a_no_op() {
    let (_dir, engine, _store) = engine_with_store();
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);

    let first = engine.apply(&fog(), &mut archive, None);
    assert_eq!(first.files_modified, 1);
    let after_first = archive.text("shaders/postfx.hlsl").unwrap();

    let second = engine.apply(&fog(), &mut archive, None);
    assert!(second.success());
    assert_eq!(second.kind, OutcomeKind::AlreadyApplied);
    assert_eq!(second.files_modified, 0);
    assert_eq!(archive.text("shaders/postfx.hlsl").unwrap(), after_first);
}

#[test]
fn test_reapplied_parameter_converges() {
    let (_dir, engine, store) = engine_with_store();
    let mut archive = MemoryArchive::from_entries([("shaders/renderer/tonemap.hlsl", TONEMAP)]);

    assert!(engine.apply(&brightness(1.25), &mut archive, None).success());
    let outcome = engine.apply(&brightness(1.75), &mut archive, None);
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.files_modified, 1);

    let text = archive.text("shaders/renderer/tonemap.hlsl").unwrap();
    assert_eq!(text.matches("{{PATCHER_brightness}}").count(), 1);
    assert!(text.contains("colour.rgb *= 1.75f; //{{PATCHER_brightness}}"));
    assert!(!text.contains("1.25f"));
    assert_eq!(
        engine.applied_parameter(&brightness(1.0), &archive, None),
        Some(1.75)
    );

    // The backup still holds the pre-patch bytes.
    assert_eq!(
        store.get("shaders/renderer/tonemap.hlsl").unwrap().unwrap(),
        TONEMAP.as_bytes()
    );
}

const LIGHTING: &str =
    "float3 Shade(Surface surface)\r\n{\r\n\tfloat3 global_illumination = ComputeGlobalIllumination(surface);\r\n\treturn global_illumination;\r\n}\r\n";

fn global_illumination(env_light: f64, indirect_light: f64) -> Patch {
    PatchBuilder::global_illumination("PATCHER", env_light, indirect_light)
        .targets(TargetSpec::files(["shaders/renderer/lighting.hlsl"]))
        .build()
        .unwrap()
}

#[test]
fn test_reapplied_light_weights_converge() {
    let (_dir, engine, store) = engine_with_store();
    let mut archive = MemoryArchive::from_entries([("shaders/renderer/lighting.hlsl", LIGHTING)]);

    assert!(engine
        .apply(&global_illumination(0.15, 0.1), &mut archive, None)
        .success());
    let outcome = engine.apply(&global_illumination(0.6, 0.4), &mut archive, None);
    assert_eq!(outcome.kind, OutcomeKind::Completed);

    let text = archive.text("shaders/renderer/lighting.hlsl").unwrap();
    assert_eq!(text.matches("{{PATCHER_globalillumination}}").count(), 1);
    assert!(text.contains("env_colour * 0.60f + indirect_colour * 0.40f"));
    assert!(!text.contains("ComputeGlobalIllumination"));
    assert_eq!(
        engine.applied_parameter(&global_illumination(0.0, 0.0), &archive, None),
        Some(0.6)
    );

    let reverted = engine.revert(&global_illumination(0.0, 0.0), &mut archive);
    assert_eq!(reverted.files_modified, 1);
    assert_eq!(
        archive.contents("shaders/renderer/lighting.hlsl").unwrap(),
        LIGHTING.as_bytes()
    );
    assert!(!store.has_any());
}

#[test]
fn test_marked_file_without_backup_is_dirty() {
    let (_dir, engine, store) = engine_with_store();
    let marked = "float fog = 0.0f; //{{PATCHER_fog}}\r\n";
    let archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", marked)]);
    let patch = fog();

    let dirty = engine.pre_patch_check(&patch, &archive, None);
    assert_eq!(dirty.len(), 1);
    assert!(dirty[0].is_dirty);
    assert_eq!(dirty[0].markers[0].as_str(), "{{PATCHER_fog}}");
    assert_eq!(engine.check_state(&patch, &archive, None), PatchState::Dirty);

    store.backup("shaders/postfx.hlsl", POST_FX.as_bytes()).unwrap();
    assert!(engine.pre_patch_check(&patch, &archive, None).is_empty());
    assert_eq!(engine.check_state(&patch, &archive, None), PatchState::Applied);
}

#[test]
fn test_dirty_patches_are_skipped_unless_forced() {
    let (_dir, engine, _store) = engine_with_store();
    let orchestrator = Orchestrator::new(engine);
    let marked = "float fog = 0.0f; //{{PATCHER_fog}}\r\nfloat bloom = ComputeBloom(colour);\r\n";
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", marked)]);
    let patches = vec![fog(), bloom()];

    let report = orchestrator
        .apply_batch(&patches, &mut archive, &BatchOptions::default())
        .unwrap();
    assert_eq!(report.skipped.len(), 2);
    assert!(report.outcomes.is_empty());
    assert!(!report.success());
    assert_eq!(archive.save_count(), 0);

    let forced = BatchOptions {
        force: true,
        ..BatchOptions::default()
    };
    let report = orchestrator
        .apply_batch(&patches, &mut archive, &forced)
        .unwrap();
    assert!(report.success());
    assert_eq!(report.outcomes[0].kind, OutcomeKind::AlreadyApplied);
    assert_eq!(report.outcomes[1].kind, OutcomeKind::Completed);
    assert_eq!(report.files_modified, 1);
}

#[test]
fn test_revert_restores_exact_bytes() {
    let (_dir, engine, store) = engine_with_store();
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);
    let patch = fog();

    let _ = engine.apply(&patch, &mut archive, None);
    assert_ne!(archive.contents("shaders/postfx.hlsl").unwrap(), POST_FX.as_bytes());

    let outcome = engine.revert(&patch, &mut archive);
    assert!(outcome.success(), "{outcome}");
    assert_eq!(outcome.files_modified, 1);
    assert_eq!(archive.contents("shaders/postfx.hlsl").unwrap(), POST_FX.as_bytes());
    assert!(!store.has_backup("shaders/postfx.hlsl"));
    assert_eq!(engine.check_state(&patch, &archive, None), PatchState::NotApplied);
}

#[test]
fn test_revert_restores_utf16_file() {
    let (_dir, engine, _store) = engine_with_store();
    let source = "ParticleEffects\r\n{\r\n\tcontinuous_effect = \"fog.pet\"\r\n}\r\n";
    let original: Vec<u8> = source.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let path = "metadata/terrain/swamp/fog_bank.aoc";
    let mut archive = MemoryArchive::from_entries([(path, original.clone())]);
    let patch = PatchBuilder::env_particles("PATCHER").build().unwrap();

    let outcome = engine.apply(&patch, &mut archive, None);
    assert_eq!(outcome.files_modified, 1);
    let patched = archive.contents(path).unwrap().to_vec();
    assert_eq!(patched.len() % 2, 0);
    let units: Vec<u16> = patched
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let text = String::from_utf16(&units).unwrap();
    assert!(text.contains("//{{PATCHER_envparticles}} continuous_effect"));

    let _ = engine.revert(&patch, &mut archive);
    assert_eq!(archive.contents(path).unwrap(), original.as_slice());
}

#[test]
fn test_selector_respects_base_paths_and_exclusions() {
    let archive = MemoryArchive::from_entries([
        ("shaders/legacy/fog.hlsl", "x"),
        ("shaders/postfx/fog.hlsl", "x"),
        ("textures/fog.hlsl", "x"),
    ]);
    let spec = TargetSpec {
        extensions: vec![".hlsl".into()],
        base_paths: vec!["shaders/".into()],
        exclude_paths: vec!["shaders/legacy/".into()],
        ..TargetSpec::default()
    };
    let selected: Vec<String> = select(&archive, &spec)
        .iter()
        .map(|record| record.path().to_string())
        .collect();
    assert_eq!(selected, vec!["shaders/postfx/fog.hlsl"]);
}

#[test]
fn test_revert_of_one_patch_undoes_the_other_on_shared_file() {
    let (_dir, engine, _store) = engine_with_store();
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);
    let (a, b) = (fog(), bloom());

    let _ = engine.apply(&a, &mut archive, None);
    let _ = engine.apply(&b, &mut archive, None);
    assert_eq!(engine.check_state(&b, &archive, None), PatchState::Applied);

    let outcome = engine.revert(&a, &mut archive);
    assert_eq!(outcome.files_modified, 1);
    assert_eq!(archive.contents("shaders/postfx.hlsl").unwrap(), POST_FX.as_bytes());
    assert_eq!(engine.check_state(&b, &archive, None), PatchState::NotApplied);

    // Nothing left for b to revert.
    let outcome = engine.revert(&b, &mut archive);
    assert_eq!(outcome.files_modified, 0);
}

fn many_files(count: usize) -> MemoryArchive {
    MemoryArchive::from_entries(
        (0..count).map(|i| (format!("shaders/pass{i}.hlsl"), POST_FX.to_string())),
    )
}

/// A control that cancels as soon as `after` files have been announced.
fn cancel_after(after: usize) -> RunControl {
    let token = CancelToken::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let trigger = token.clone();
    RunControl::new(token).with_progress(move |message| {
        if message.starts_with("Patching:") && seen.fetch_add(1, Ordering::SeqCst) + 1 == after {
            trigger.cancel();
        }
    })
}

fn marked_files(archive: &MemoryArchive) -> usize {
    archive
        .records()
        .iter()
        .filter(|record| {
            archive
                .text(record.path())
                .is_some_and(|text| text.contains("{{PATCHER_fog}}"))
        })
        .count()
}

#[test]
fn test_cancel_before_file_k_leaves_k_minus_one_files() {
    let (_dir, engine, store) = engine_with_store();
    let k = 3;
    let engine = engine.with_control(cancel_after(k - 1));
    let mut archive = many_files(5);

    let outcome = engine.apply(&fog(), &mut archive, None);
    assert_eq!(outcome.kind, OutcomeKind::Cancelled);
    assert!(!outcome.success());
    assert_eq!(outcome.files_modified, k - 1);
    assert_eq!(marked_files(&archive), k - 1);
    assert_eq!(store.list_all().unwrap().len(), k - 1);

    // Untouched files keep their original bytes.
    let pristine = archive
        .records()
        .iter()
        .filter(|record| archive.contents(record.path()) == Some(POST_FX.as_bytes()))
        .count();
    assert_eq!(pristine, 5 - (k - 1));
}

#[test]
fn test_cancelled_batch_flushes_completed_files() {
    let (_dir, engine, _store) = engine_with_store();
    let orchestrator = Orchestrator::new(engine.with_control(cancel_after(2)));
    let mut archive = many_files(4);

    let report = orchestrator
        .apply_batch(&[fog(), bloom()], &mut archive, &BatchOptions::default())
        .unwrap();
    assert!(report.cancelled);
    assert!(!report.success());
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.files_written, 2);
    assert_eq!(archive.save_count(), 1);
    assert_eq!(marked_files(&archive), 2);
}

#[test]
fn test_dry_run_writes_nothing() {
    let (_dir, engine, store) = engine_with_store();
    let orchestrator = Orchestrator::new(engine);
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);
    let options = BatchOptions {
        dry_run: true,
        ..BatchOptions::default()
    };

    let report = orchestrator
        .apply_batch(&[fog()], &mut archive, &options)
        .unwrap();
    assert_eq!(report.previews.len(), 1);
    assert_eq!(report.previews[0].before, POST_FX.as_bytes());
    assert!(String::from_utf8_lossy(&report.previews[0].after).contains("{{PATCHER_fog}}"));
    assert_eq!(archive.contents("shaders/postfx.hlsl").unwrap(), POST_FX.as_bytes());
    assert_eq!(archive.save_count(), 0);
    assert!(!store.has_any());
}

#[test]
fn test_restore_all_then_stale_cleanup() {
    let (_dir, engine, store) = engine_with_store();
    let orchestrator = Orchestrator::new(engine);
    let mut archive = MemoryArchive::from_entries([
        ("shaders/postfx.hlsl", POST_FX),
        ("shaders/renderer/tonemap.hlsl", TONEMAP),
    ]);
    let patches = vec![fog(), brightness(1.5)];

    let report = orchestrator
        .apply_batch(&patches, &mut archive, &BatchOptions::default())
        .unwrap();
    assert_eq!(report.files_written, 2);
    assert_eq!(orchestrator.cleanup_stale_backups(&patches, &archive).unwrap(), 0);

    assert_eq!(orchestrator.restore_all(&mut archive).unwrap(), 2);
    assert!(!store.has_any());
    assert_eq!(archive.contents("shaders/postfx.hlsl").unwrap(), POST_FX.as_bytes());

    // Backups left behind after an external restore are cleared.
    store.backup("shaders/postfx.hlsl", POST_FX.as_bytes()).unwrap();
    assert_eq!(orchestrator.cleanup_stale_backups(&patches, &archive).unwrap(), 1);
    assert!(!store.has_any());
}

#[test]
fn test_cleanup_keeps_backups_of_patches_outside_the_run() {
    let (dir, engine, _store) = engine_with_store();
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);
    let _ = Orchestrator::new(engine)
        .apply_batch(&[fog()], &mut archive, &BatchOptions::default())
        .unwrap();

    // A later process that only knows about bloom.
    let store = Arc::new(BackupStore::open(dir.path().join("backups"), NullLog::shared()).unwrap());
    let engine = PatchEngine::new(Backups::Durable(Arc::clone(&store)), NullLog::shared());
    let orchestrator = Orchestrator::new(engine.clone());
    assert_eq!(orchestrator.cleanup_stale_backups(&[bloom()], &archive).unwrap(), 0);
    assert_eq!(
        store.get("shaders/postfx.hlsl").unwrap().unwrap(),
        POST_FX.as_bytes()
    );
    assert_eq!(engine.check_state(&fog(), &archive, None), PatchState::Applied);
}

#[test]
fn test_cleanup_keeps_backups_that_differ_from_the_file() {
    let (_dir, engine, store) = engine_with_store();
    let orchestrator = Orchestrator::new(engine);
    let archive = MemoryArchive::from_entries([
        ("shaders/postfx.hlsl", POST_FX),
        ("shaders/renderer/tonemap.hlsl", TONEMAP),
    ]);
    store
        .backup("shaders/postfx.hlsl", b"float fog = 1.0f;\r\n")
        .unwrap();
    store
        .backup("shaders/renderer/tonemap.hlsl", TONEMAP.as_bytes())
        .unwrap();

    let cleared = orchestrator
        .cleanup_stale_backups(&[fog(), brightness(1.5)], &archive)
        .unwrap();
    assert_eq!(cleared, 1);
    assert_eq!(store.list_all().unwrap(), vec!["shaders/postfx.hlsl"]);
}

#[test]
fn test_dry_run_reports_what_the_real_run_does() {
    let patches = vec![fog(), bloom()];
    let dry = BatchOptions {
        dry_run: true,
        ..BatchOptions::default()
    };

    let (_dry_dir, engine, _store) = engine_with_store();
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);
    let preview = Orchestrator::new(engine)
        .apply_batch(&patches, &mut archive, &dry)
        .unwrap();

    let (_real_dir, engine, _store) = engine_with_store();
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);
    let real = Orchestrator::new(engine)
        .apply_batch(&patches, &mut archive, &BatchOptions::default())
        .unwrap();

    assert!(preview.success());
    assert!(real.success());
    assert!(preview.skipped.is_empty());
    assert_eq!(preview.files_modified, real.files_modified);
    let kinds = |report: &bundle_patcher::orchestrator::BatchReport| {
        report
            .outcomes
            .iter()
            .map(|o| (o.patch_id.clone(), o.kind))
            .collect::<Vec<_>>()
    };
    assert_eq!(kinds(&preview), kinds(&real));
    assert_eq!(
        String::from_utf8_lossy(&preview.previews[0].after),
        archive.text("shaders/postfx.hlsl").unwrap()
    );
}

#[test]
fn test_batch_without_backups_runs_every_patch() {
    let engine = PatchEngine::new(Backups::Disabled, NullLog::shared());
    let orchestrator = Orchestrator::new(engine);
    let mut archive = MemoryArchive::from_entries([("shaders/postfx.hlsl", POST_FX)]);

    let report = orchestrator
        .apply_batch(&[fog(), bloom()], &mut archive, &BatchOptions::default())
        .unwrap();
    assert!(report.success());
    assert!(report.skipped.is_empty());
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.files_modified, 2);
    let text = archive.text("shaders/postfx.hlsl").unwrap();
    assert!(text.contains("{{PATCHER_fog}}"));
    assert!(text.contains("{{PATCHER_bloom}}"));
}

#[test]
fn test_parallel_apply_backs_up_each_file_once() {
    let (_dir, engine, store) = engine_with_store();
    let patch = PatchBuilder::new("fog", "PATCHER")
        .targets(TargetSpec {
            extensions: vec![".hlsl".into()],
            ..TargetSpec::default()
        })
        .parallel(true)
        .literal(
            "float fog = ComputeFog(depth);",
            "float fog = 0.0f; //{{PATCHER_fog}}",
        )
        .build()
        .unwrap();
    let mut archive = many_files(64);

    let outcome = engine.apply(&patch, &mut archive, None);
    assert_eq!(outcome.kind, OutcomeKind::Completed);
    assert_eq!(outcome.files_modified, 64);
    assert_eq!(marked_files(&archive), 64);

    let backups = store.list_all().unwrap();
    assert_eq!(backups.len(), 64);
    for path in &backups {
        assert_eq!(store.get(path).unwrap().unwrap(), POST_FX.as_bytes());
    }

    let again = engine.apply(&patch, &mut archive, None);
    assert_eq!(again.kind, OutcomeKind::AlreadyApplied);
    assert_eq!(store.list_all().unwrap().len(), 64);
}
