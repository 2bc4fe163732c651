use std::path::{Path, PathBuf};

use cdnpush_core::{
    JobEvent, JobPhase, JobResult, PipelineConfig, PublishStage, RemoteIdentity,
    ScriptedProcessRunner, ScriptedResponse, StageReport, UploadJob, UploadOrchestrator,
};
use tempfile::TempDir;

fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn identity() -> RemoteIdentity {
    RemoteIdentity {
        owner: "owner".to_string(),
        repo_name: "repo".to_string(),
        branch: "main".to_string(),
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        cdn_base: "cdn.example.net/gh".to_string(),
        ..PipelineConfig::default()
    }
}

struct Fixture {
    _temp: TempDir,
    source: PathBuf,
    repo: PathBuf,
}

fn fixture(files: &[&str]) -> Fixture {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("incoming").join("pics");
    let repo = temp.path().join("repo");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::create_dir_all(&repo).unwrap();
    for name in files {
        write_file(source.join(name), name.as_bytes());
    }
    Fixture {
        _temp: temp,
        source,
        repo,
    }
}

async fn run_job(
    runner: ScriptedProcessRunner,
    fx: &Fixture,
) -> (JobResult, Vec<JobEvent>, UploadOrchestrator<ScriptedProcessRunner>) {
    run_job_from(runner, &fx.source, &fx.repo).await
}

async fn run_job_from(
    runner: ScriptedProcessRunner,
    source: &Path,
    repo: &Path,
) -> (JobResult, Vec<JobEvent>, UploadOrchestrator<ScriptedProcessRunner>) {
    let orchestrator = UploadOrchestrator::new(runner, config());
    let job = UploadJob::new(source, repo, identity());
    let mut handle = orchestrator.spawn(job);
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    (handle.join().await, events, orchestrator)
}

fn logs(events: &[JobEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Log { message, .. } => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

fn manifest_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn publishes_folder_and_writes_manifest() {
    let fx = fixture(&["a.png", "b.png", "c.png", "notes.txt"]);
    let runner = ScriptedProcessRunner::new().respond(
        "push",
        ScriptedResponse::ok().with_lines([
            "Enumerating objects: 6, done.",
            "Writing objects:  50% (3/6), 1.00 MiB | 2.00 MiB/s",
            "Writing objects: 100% (6/6), 2.00 MiB | 2.50 MiB/s, done.",
        ]),
    );

    let (result, events, orchestrator) = run_job(runner, &fx).await;

    let JobResult::Success {
        manifest_path,
        assets,
        copy_failures,
        warning,
        stages,
        throughput,
    } = result
    else {
        panic!("expected success, got {result:?}");
    };
    assert_eq!(assets, 3);
    assert_eq!(throughput.as_deref(), Some("2.50 MiB/s"));
    assert_eq!(
        stages.iter().map(|s| (s.stage, s.exit_code)).collect::<Vec<_>>(),
        vec![
            (PublishStage::Staging, Some(0)),
            (PublishStage::Committing, Some(0)),
            (PublishStage::Syncing, Some(0)),
            (PublishStage::Publishing, Some(0)),
        ]
    );
    assert_eq!(copy_failures, 0);
    assert_eq!(warning, None);
    assert_eq!(manifest_path, fx.repo.join("pics_urls.csv"));

    let lines = manifest_lines(&manifest_path);
    assert_eq!(lines[0], "display name,reserved,asset URL");
    assert_eq!(
        &lines[1..],
        &[
            "a,,https://cdn.example.net/gh/owner/repo/pics/a.png",
            "b,,https://cdn.example.net/gh/owner/repo/pics/b.png",
            "c,,https://cdn.example.net/gh/owner/repo/pics/c.png",
        ]
    );
    assert_eq!(std::fs::read(fx.repo.join("pics/notes.txt")).unwrap(), b"notes.txt");

    let runner = orchestrator.runner();
    assert_eq!(runner.verbs(), vec!["add", "commit", "pull", "push"]);
    let calls = runner.calls();
    assert_eq!(calls[0].args, vec!["add", "--", "pics"]);
    assert_eq!(calls[1].args, vec!["commit", "-m", "Add pics"]);
    assert_eq!(calls[2].args, vec!["pull", "origin", "main", "--rebase"]);
    assert_eq!(calls[3].args, vec!["push", "origin", "main", "--progress"]);
    assert!(calls.iter().all(|c| c.cwd == fx.repo && c.program == "git"));

    let throughput: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Throughput(t) => Some(t.rate.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(throughput, vec!["2.00 MiB/s", "2.50 MiB/s"]);

    let publish_progress: Vec<(u64, u64)> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(p) if p.phase == JobPhase::Publish => Some((p.done, p.total)),
            _ => None,
        })
        .collect();
    assert_eq!(publish_progress, vec![(1, 3), (3, 3)]);

    let finished: Vec<&JobEvent> = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Finished { .. }))
        .collect();
    assert_eq!(finished.len(), 1);
    assert!(matches!(events.last(), Some(JobEvent::Finished { .. })));
}

#[tokio::test]
async fn existing_destination_refuses_job_without_side_effects() {
    let fx = fixture(&["a.png"]);
    std::fs::create_dir_all(fx.repo.join("pics")).unwrap();

    let (result, events, orchestrator) = run_job(ScriptedProcessRunner::new(), &fx).await;

    match &result {
        JobResult::Failure { reason } => assert!(reason.contains("destination exists"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(orchestrator.runner().calls().is_empty());
    assert_eq!(std::fs::read_dir(fx.repo.join("pics")).unwrap().count(), 0);
    assert!(!fx.repo.join("pics_urls.csv").exists());
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, JobEvent::Phase { phase: JobPhase::Copy }))
    );
}

#[tokio::test]
async fn folder_without_assets_is_refused() {
    let fx = fixture(&["readme.txt"]);

    let (result, _events, orchestrator) = run_job(ScriptedProcessRunner::new(), &fx).await;

    match &result {
        JobResult::Failure { reason } => assert!(reason.contains("no assets"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(orchestrator.runner().calls().is_empty());
    assert!(!fx.repo.join("pics").exists());
}

#[tokio::test]
async fn plain_file_source_is_refused() {
    let fx = fixture(&[]);
    let loose = fx.source.parent().unwrap().join("loose.png");
    std::fs::write(&loose, b"png").unwrap();

    let (result, events, orchestrator) =
        run_job_from(ScriptedProcessRunner::new(), &loose, &fx.repo).await;

    match &result {
        JobResult::Failure { reason } => assert!(reason.contains("not a directory"), "{reason}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(orchestrator.runner().calls().is_empty());
    assert_eq!(std::fs::read_dir(&fx.repo).unwrap().count(), 0);
    assert!(matches!(events.last(), Some(JobEvent::Finished { .. })));
}

#[cfg(unix)]
#[tokio::test]
async fn partial_copy_failure_still_publishes() {
    let fx = fixture(&["a.png", "b.png", "c.png", "d.png"]);
    std::os::unix::fs::symlink(fx.source.join("gone.png"), fx.source.join("e.png")).unwrap();

    let (result, events, orchestrator) = run_job(ScriptedProcessRunner::new(), &fx).await;

    let JobResult::Success {
        assets,
        copy_failures,
        ..
    } = result
    else {
        panic!("expected success, got {result:?}");
    };
    assert_eq!(copy_failures, 1);
    assert_eq!(assets, 4);
    assert!(logs(&events).iter().any(|l| l.starts_with("copy finished: 4 copied, 1 failed")));
    assert!(logs(&events).iter().any(|l| l.starts_with("copy failed: ")));
    assert_eq!(orchestrator.runner().verbs(), vec!["add", "commit", "pull", "push"]);
}

#[tokio::test]
async fn publish_failure_aborts_before_manifest() {
    let fx = fixture(&["a.png", "b.png"]);
    let runner = ScriptedProcessRunner::new().respond(
        "push",
        ScriptedResponse::exit(1).with_lines(["! [rejected] main -> main (fetch first)"]),
    );

    let (result, events, _orchestrator) = run_job(runner, &fx).await;

    match &result {
        JobResult::Failure { reason } => {
            assert!(reason.contains("exit code 1"), "{reason}");
            assert!(reason.contains("rejected"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!fx.repo.join("pics_urls.csv").exists());
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, JobEvent::Phase { phase: JobPhase::Manifest }))
    );
}

#[tokio::test]
async fn staging_failure_stops_before_commit() {
    let fx = fixture(&["a.png"]);
    let runner = ScriptedProcessRunner::new().respond(
        "add",
        ScriptedResponse::exit(128).with_stderr("fatal: not a git repository"),
    );

    let (result, _events, orchestrator) = run_job(runner, &fx).await;

    match &result {
        JobResult::Failure { reason } => {
            assert!(reason.contains("staging stage failed (exit code 128)"), "{reason}");
            assert!(reason.contains("not a git repository"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(orchestrator.runner().verbs(), vec!["add"]);
}

#[tokio::test]
async fn commit_and_sync_failures_are_tolerated() {
    let fx = fixture(&["a.png"]);
    let runner = ScriptedProcessRunner::new()
        .respond(
            "commit",
            ScriptedResponse::exit(1).with_stdout("nothing to commit, working tree clean"),
        )
        .respond(
            "pull",
            ScriptedResponse::exit(1).with_stderr("fatal: couldn't find remote ref main"),
        );

    let (result, events, orchestrator) = run_job(runner, &fx).await;

    let JobResult::Success { stages, .. } = &result else {
        panic!("expected success, got {result:?}");
    };
    assert_eq!(
        stages[1],
        StageReport {
            stage: PublishStage::Committing,
            exit_code: Some(1)
        }
    );
    assert_eq!(stages[2].exit_code, Some(1));
    assert_eq!(orchestrator.runner().verbs(), vec!["add", "commit", "pull", "push"]);
    let logs = logs(&events);
    assert!(logs.contains(&"nothing to commit, working tree clean"));
    assert!(logs.iter().any(|l| l.starts_with("committing returned exit code 1")));
    assert!(logs.iter().any(|l| l.starts_with("syncing returned exit code 1")));
}

#[tokio::test]
async fn manifest_write_failure_is_reported_as_success_with_warning() {
    let fx = fixture(&["a.png"]);
    // A directory squatting on the manifest file name.
    std::fs::create_dir_all(fx.repo.join("pics_urls.csv")).unwrap();

    let (result, _events, _orchestrator) = run_job(ScriptedProcessRunner::new(), &fx).await;

    let JobResult::Success { warning, .. } = result else {
        panic!("expected success, got {result:?}");
    };
    let warning = warning.expect("warning set");
    assert!(warning.starts_with("manifest save failed"), "{warning}");
}

#[tokio::test]
async fn run_inline_emits_finished_once() {
    let fx = fixture(&["a.png", "nested/b.jpg"]);
    let orchestrator = UploadOrchestrator::new(ScriptedProcessRunner::new(), config());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let result = orchestrator
        .run(UploadJob::new(&fx.source, &fx.repo, identity()), &tx)
        .await;
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert!(result.is_success());
    assert_eq!(
        events.last(),
        Some(&JobEvent::Finished {
            result: result.clone()
        })
    );

    let manifest = manifest_lines(&fx.repo.join("pics_urls.csv"));
    assert_eq!(manifest.len(), 3);
    assert!(manifest[2].ends_with("/owner/repo/pics/nested/b.jpg"));

    let manifest_progress: Vec<(u64, u64)> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(p) if p.phase == JobPhase::Manifest => Some((p.done, p.total)),
            _ => None,
        })
        .collect();
    assert_eq!(manifest_progress, vec![(1, 2), (2, 2)]);
}
