//! Engine lifecycle 통합 테스트 - create/resume/stop/delete against fake
//! collaborators and shell-script agents
//!
//! `cargo test -p yard-task --test engine_test`

#![cfg(unix)]

mod common;

use common::*;
use std::time::Duration;
use yard_foundation::Error;
use yard_task::engine::{SETUP_FAILED_MESSAGE, SIDECAR_TIMEOUT_MESSAGE};
use yard_task::finalizer::{INTERRUPTED_MESSAGE, NO_THREAD_MESSAGE, STOPPED_MESSAGE};
use yard_task::{
    CreateTaskRequest, LogStream, ResumeTaskRequest, Run, RunKind, SidecarController,
    SidecarState, Task, TaskId, TaskStatus,
};

#[tokio::test]
async fn test_create_complete_resume_round_trip() {
    let h = HarnessBuilder::agent(AGENT_OK).build();

    let created = h
        .engine
        .create(CreateTaskRequest::new("web", "add a health check").with_model("gpt-5-codex"))
        .await
        .unwrap();
    assert_eq!(created.status, TaskStatus::Running);
    assert_eq!(created.branch, format!("yard/{}", created.id));
    assert!(created.worktree_path.join("README.md").exists());

    let done = h.wait_idle(&created.id).await;
    assert_eq!(done.status, TaskStatus::Completed, "error: {:?}", done.error);
    assert_eq!(done.thread_id.as_deref(), Some(THREAD_ID));
    assert!(done.error.is_none());

    h.engine
        .resume(&created.id, ResumeTaskRequest::new("now add tests"))
        .await
        .unwrap();
    let task = h.wait_idle(&created.id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let labels: Vec<&str> = task.runs.iter().map(|r| r.label.as_str()).collect();
    assert_eq!(labels, vec!["run-001", "run-002"]);
    assert_eq!(task.runs[1].kind, RunKind::Resume);
    assert_eq!(task.initial_prompt, "add a health check");
    assert_eq!(task.last_prompt, "now add tests");
    // the resume never reported a thread; the known one survives
    assert_eq!(task.thread_id.as_deref(), Some(THREAD_ID));
    assert!(task.runs.iter().all(|r| r.finished_at.is_some()));

    let args = h.stderr_log(&task.id, "run-002");
    assert!(args.contains("--model gpt-5-codex"), "{}", args);
    assert!(args.contains("resume thr_test now add tests"), "{}", args);
    assert!(args.contains(&format!("rw_paths={}", task.worktree_path.display())));
}

#[tokio::test]
async fn test_exit_zero_without_thread_fails_and_cannot_resume() {
    let h = HarnessBuilder::agent("exit 0\n").build();
    let task = h
        .engine
        .create(CreateTaskRequest::new("web", "p"))
        .await
        .unwrap();
    let task = h.wait_idle(&task.id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some(NO_THREAD_MESSAGE));
    assert!(task.thread_id.is_none());

    let err = h
        .engine
        .resume(&task.id, ResumeTaskRequest::new("again"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert!(!h.engine.is_running(&task.id));
}

#[tokio::test]
async fn test_failed_run_keeps_known_thread() {
    let h = HarnessBuilder::agent(
        r#"
if [ "$resumed" = 0 ]; then
  echo '{"type":"thread.started","thread_id":"thr_test"}'
  exit 0
fi
echo "compile error" >&2
exit 2
"#,
    )
    .build();
    let task = h
        .engine
        .create(CreateTaskRequest::new("web", "p"))
        .await
        .unwrap();
    h.wait_idle(&task.id).await;

    h.engine
        .resume(&task.id, ResumeTaskRequest::new("break it"))
        .await
        .unwrap();
    let task = h.wait_idle(&task.id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("Agent exited with code 2"));
    assert_eq!(task.runs[1].exit_code, Some(2));
    assert_eq!(task.thread_id.as_deref(), Some(THREAD_ID));
    assert!(h.stderr_log(&task.id, "run-002").contains("compile error"));
}

#[tokio::test]
async fn test_single_run_in_flight_and_stop() {
    let h = HarnessBuilder::agent(AGENT_GATED).build();
    let task = h
        .engine
        .create(CreateTaskRequest::new("web", "long job"))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || h.agent_spawned()).await);

    let err = h
        .engine
        .resume(&task.id, ResumeTaskRequest::new("second"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert!(matches!(
        h.engine.delete(&task.id).await,
        Err(Error::Conflict(_))
    ));
    let current = h.engine.get(&task.id).unwrap();
    assert_eq!(current.runs.iter().filter(|r| r.is_in_flight()).count(), 1);

    let stopping = h.engine.stop(&task.id).await.unwrap();
    assert_eq!(stopping.status, TaskStatus::Stopping);
    assert_eq!(stopping.runs[0].status, TaskStatus::Stopping);

    let task = h.wait_idle(&task.id).await;
    assert_eq!(task.status, TaskStatus::Stopped);
    assert_eq!(task.runs[0].status, TaskStatus::Stopped);
    assert_eq!(task.error.as_deref(), Some(STOPPED_MESSAGE));
    assert_eq!(task.thread_id.as_deref(), Some(THREAD_ID));

    // Stop on an idle task is a no-op
    let again = h.engine.stop(&task.id).await.unwrap();
    assert_eq!(again.status, TaskStatus::Stopped);
}

#[tokio::test]
async fn test_stop_during_sidecar_provisioning() {
    let h = HarnessBuilder::agent(AGENT_OK).build();
    h.sidecar.set_ready_delay(Duration::from_secs(30));

    let engine = h.engine.clone();
    let create = tokio::spawn(async move {
        engine
            .create(CreateTaskRequest::new("web", "needs docker").with_sidecar(true))
            .await
    });

    let registry = h.engine.registry().clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            h.sidecar
                .ensure_calls
                .load(std::sync::atomic::Ordering::SeqCst)
                > 0
        })
        .await
    );
    let id = TaskId::parse(&registry.active_ids()[0]).unwrap();

    let stopping = h.engine.stop(&id).await.unwrap();
    assert_eq!(stopping.status, TaskStatus::Stopping);

    let task = tokio::time::timeout(Duration::from_secs(5), create)
        .await
        .expect("create should return once provisioning is cancelled")
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Stopped);
    assert_eq!(task.runs.len(), 1);
    assert_eq!(task.runs[0].status, TaskStatus::Stopped);
    assert!(task.runs[0].used_sidecar);

    assert!(!h.agent_spawned());
    assert_eq!(h.sidecar.removed(), vec![id.to_string()]);
    assert_eq!(h.sidecar.state(id.as_str()), SidecarState::Removed);
    assert!(!h.engine.is_running(&id));
}

#[tokio::test]
async fn test_sidecar_run_exports_docker_host() {
    let h = HarnessBuilder::agent(AGENT_OK).build();
    let task = h
        .engine
        .create(CreateTaskRequest::new("web", "p").with_sidecar(true))
        .await
        .unwrap();
    let task = h.wait_idle(&task.id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    let log = h.stderr_log(&task.id, "run-001");
    assert!(log.contains("docker_host=unix:///var/run/docker.sock"), "{}", log);
    assert!(log.contains("passthrough=DOCKER_HOST"), "{}", log);
    // parked once the run is over, kept for the next resume
    assert_eq!(h.sidecar.state(task.id.as_str()), SidecarState::Stopped);
    assert_eq!(h.sidecar.stopped(), vec![task.id.to_string()]);
    assert!(h.sidecar.removed().is_empty());
}

#[tokio::test]
async fn test_resume_restarts_stopped_sidecar() {
    let h = HarnessBuilder::agent(AGENT_OK).build();
    let task = h
        .engine
        .create(CreateTaskRequest::new("web", "p").with_sidecar(true))
        .await
        .unwrap();
    h.wait_idle(&task.id).await;
    assert_eq!(h.sidecar.state(task.id.as_str()), SidecarState::Stopped);

    h.engine
        .resume(&task.id, ResumeTaskRequest::new("again"))
        .await
        .unwrap();
    let task = h.wait_idle(&task.id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.runs[1].used_sidecar);
    assert_eq!(
        h.sidecar.ensure_calls.load(std::sync::atomic::Ordering::SeqCst),
        2
    );
    assert!(h.stderr_log(&task.id, "run-002").contains("docker_host=unix://"));
    assert_eq!(h.sidecar.stopped().len(), 2);
    assert!(h.sidecar.removed().is_empty());
    assert_eq!(h.sidecar.state(task.id.as_str()), SidecarState::Stopped);
}

#[tokio::test]
async fn test_resume_without_sidecar_leaves_it_stopped() {
    let h = HarnessBuilder::agent(AGENT_OK).build();
    let task = h
        .engine
        .create(CreateTaskRequest::new("web", "p").with_sidecar(true))
        .await
        .unwrap();
    h.wait_idle(&task.id).await;

    let mut request = ResumeTaskRequest::new("no docker this time");
    request.use_sidecar = Some(false);
    h.engine.resume(&task.id, request).await.unwrap();
    let task = h.wait_idle(&task.id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(!task.runs[1].used_sidecar);
    assert!(h.stderr_log(&task.id, "run-002").contains("docker_host=none"));
    assert_eq!(
        h.sidecar.ensure_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(h.sidecar.stopped().len(), 1);
}

#[tokio::test]
async fn test_create_rolls_back_on_sidecar_failure() {
    let h = HarnessBuilder::agent(AGENT_OK).build();
    h.sidecar.set_fail(true);

    let err = h
        .engine
        .create(
            CreateTaskRequest::new("web", "p")
                .with_sidecar(true)
                .with_context_env("api"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    assert!(h.engine.list().unwrap().is_empty());
    assert_eq!(h.sidecar.removed().len(), 1);
    assert_eq!(h.git.removed().len(), 2);
    assert!(!h.agent_spawned());
    assert!(h.engine.registry().active_ids().is_empty());
}

#[tokio::test]
async fn test_resume_sidecar_failure_stops_existing_sidecar() {
    let h = HarnessBuilder::agent(AGENT_OK).build();
    let task = h
        .engine
        .create(CreateTaskRequest::new("web", "p").with_sidecar(true))
        .await
        .unwrap();
    h.wait_idle(&task.id).await;

    h.sidecar.set_fail(true);
    let err = h
        .engine
        .resume(&task.id, ResumeTaskRequest::new("again"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let task = h.engine.get(&task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some(SIDECAR_TIMEOUT_MESSAGE));
    assert_eq!(task.runs[1].status, TaskStatus::Failed);
    assert_eq!(task.last_prompt, "again");
    // once when run-001 ended, once when run-002 setup gave up
    assert_eq!(
        h.sidecar.stopped(),
        vec![task.id.to_string(), task.id.to_string()]
    );
    assert!(h.sidecar.removed().is_empty());
    // details go to the log, not the summary
    assert!(h.stderr_log(&task.id, "run-002").contains("Cannot connect"));
    assert_ne!(task.error.as_deref(), Some(SETUP_FAILED_MESSAGE));
}

#[tokio::test]
async fn test_env_overrides_pass_through() {
    let h = HarnessBuilder::agent(
        r#"
echo "token=${API_TOKEN:-unset}" >&2
echo '{"type":"thread.started","thread_id":"thr_test"}'
"#,
    )
    .configure(|config| {
        config.agent.env.insert(
            "web".to_string(),
            [("API_TOKEN".to_string(), "s3cret".to_string())]
                .into_iter()
                .collect(),
        );
    })
    .build();

    let task = h
        .engine
        .create(CreateTaskRequest::new("web", "p"))
        .await
        .unwrap();
    let task = h.wait_idle(&task.id).await;
    let log = h.stderr_log(&task.id, "run-001");
    assert!(log.contains("token=s3cret"), "{}", log);
    assert!(log.contains("passthrough=API_TOKEN"), "{}", log);
}

#[tokio::test]
async fn test_attachments_context_and_artifacts() {
    let h = HarnessBuilder::agent(
        r#"
echo '{"type":"thread.started","thread_id":"thr_test"}'
for p in $(echo "$YARD_RW_PATHS" | tr ':' ' '); do
  case "$p" in */artifacts/*) mkdir -p "$p/report" && echo ok > "$p/report/summary.txt" ;; esac
done
"#,
    )
    .build();
    let notes = h.root().join("notes.md");
    std::fs::write(&notes, "# notes").unwrap();

    let task = h
        .engine
        .create(
            CreateTaskRequest::new("web", "p")
                .with_context_env("api")
                .with_attachment(&notes),
        )
        .await
        .unwrap();
    assert_eq!(task.context_repos.len(), 1);
    assert_eq!(task.context_repos[0].env_id, "api");
    assert_eq!(task.attachments[0].name, "notes.md");
    assert_eq!(task.attachments[0].size, 7);

    let task = h.wait_idle(&task.id).await;
    let artifacts = &task.runs[0].artifacts;
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].path, "report/summary.txt");
}

#[tokio::test]
async fn test_invalid_requests_have_no_side_effects() {
    let h = HarnessBuilder::agent(AGENT_OK).build();

    let err = h
        .engine
        .create(CreateTaskRequest::new("web", "p").with_reasoning_effort("ludicrous"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = h
        .engine
        .create(CreateTaskRequest::new("nope", "p"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let mut request = CreateTaskRequest::new("web", "p");
    request.base_ref = Some("missing".to_string());
    assert!(h.engine.create(request).await.is_err());

    assert!(h.engine.list().unwrap().is_empty());
    assert!(!h.agent_spawned());
}

#[tokio::test]
async fn test_delete_removes_everything() {
    let h = HarnessBuilder::agent(AGENT_OK).build();
    let task = h
        .engine
        .create(
            CreateTaskRequest::new("web", "p")
                .with_sidecar(true)
                .with_context_env("api"),
        )
        .await
        .unwrap();
    h.wait_idle(&task.id).await;

    h.engine.delete(&task.id).await.unwrap();
    assert!(matches!(h.engine.get(&task.id), Err(Error::NotFound(_))));
    assert!(!h.engine.store().task_dir(&task.id).exists());
    assert_eq!(h.sidecar.removed(), vec![task.id.to_string()]);
    assert_eq!(h.git.removed().len(), 2);
}

#[tokio::test]
async fn test_read_log_tail() {
    let h = HarnessBuilder::agent(AGENT_OK).build();
    let task = h
        .engine
        .create(CreateTaskRequest::new("web", "p"))
        .await
        .unwrap();
    h.wait_idle(&task.id).await;

    let out = h
        .engine
        .read_log(&task.id, None, LogStream::Stdout, Some(1))
        .unwrap();
    assert!(out.contains("agent_message"));
    assert!(!out.contains("thread.started"));

    assert!(matches!(
        h.engine.read_log(&task.id, Some("run-009"), LogStream::Stdout, None),
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_recover_orphaned_runs() {
    let h = HarnessBuilder::agent(AGENT_OK).build();
    let store = h.engine.store();

    let id = TaskId::new();
    let mut task = Task::new(id.clone(), "web", "yard/x", store.worktree_dir(&id), "p");
    task.runs.push(Run::new(Run::label_for(1), RunKind::Fresh, "p", None, None, false));
    store.save(&task).unwrap();

    let recovered = h.engine.recover_orphaned_runs().unwrap();
    assert_eq!(recovered, vec![id.clone()]);

    let task = h.engine.get(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.runs[0].status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert!(h.engine.recover_orphaned_runs().unwrap().is_empty());
}
