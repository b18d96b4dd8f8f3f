#[cfg(unix)]
mod common;

#[cfg(unix)]
mod supervisor_lifecycle {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use taskmux::config::Config;
    use taskmux::pty::TerminalSize;
    use taskmux::store::{JsonTaskStore, MemoryTaskStore};
    use taskmux::{
        EventFilter, Resize, Subscription, Supervisor, SupervisorError, SupervisorEvent,
        SupervisorSettings, TaskDraft, TaskId, TaskState, TaskView,
    };

    use crate::common::{
        create, next_matching, pid_alive, supervisor, test_settings, wait_for, wait_for_exit,
        wait_for_output, wait_for_state,
    };

    fn is_status(state: TaskState) -> impl Fn(&SupervisorEvent) -> bool {
        move |event: &SupervisorEvent| {
            matches!(event, SupervisorEvent::Status { view, .. } if view.status.state() == state)
        }
    }

    /// Latest status among the events already queued.
    fn last_queued_status(events: &mut Subscription) -> Option<TaskView> {
        let mut last = None;
        while let Some(event) = events.try_recv() {
            if let SupervisorEvent::Status { view, .. } = event {
                last = Some(view);
            }
        }
        last
    }

    fn running_pid(event: &SupervisorEvent) -> u32 {
        match event {
            SupervisorEvent::Status { view, .. } => view.status.pid().expect("running task has a pid"),
            other => panic!("expected status event, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_starts_share_one_instance() {
        let supervisor = supervisor();
        let id = create(&supervisor, "sleeper", "sleep 30");

        let (a, b) = tokio::join!(supervisor.start(&id), supervisor.start(&id));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.status.is_running());
        assert_eq!(a.status.pid(), b.status.pid());
        assert!(a.status.start_time().is_some());

        let pid = a.status.pid().unwrap();
        assert!(pid_alive(pid));

        let stopped = supervisor.stop(&id).await.unwrap();
        assert_eq!(stopped.status.state(), TaskState::Stopped);
        assert!(stopped.status.pid().is_none());
        assert!(stopped.status.start_time().is_none());
        assert!(!pid_alive(pid));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_then_start_runs_a_new_process() {
        let supervisor = supervisor();
        let id = create(&supervisor, "sleeper", "sleep 30");

        let first = supervisor.start(&id).await.unwrap().status.pid().unwrap();
        supervisor.stop(&id).await.unwrap();
        let second = supervisor.start(&id).await.unwrap().status.pid().unwrap();
        assert_ne!(first, second);

        let third = supervisor.restart(&id).await.unwrap().status.pid().unwrap();
        assert_ne!(second, third);
        assert!(!pid_alive(second));
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_on_stopped_task_is_a_no_op() {
        let supervisor = supervisor();
        let id = create(&supervisor, "idle", "sleep 30");
        let view = supervisor.stop(&id).await.unwrap();
        assert_eq!(view.status.state(), TaskState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scrollback_survives_restart_until_cleared() {
        let supervisor = supervisor();
        let id = create(&supervisor, "echo", "cat");

        supervisor.start(&id).await.unwrap();
        supervisor.write(&id, b"hello\n").unwrap();
        wait_for_output(&supervisor, &id, "hello").await;

        supervisor.stop(&id).await.unwrap();
        assert!(supervisor.log_history(&id).unwrap().contains("hello"));
        supervisor.start(&id).await.unwrap();
        assert!(supervisor.log_history(&id).unwrap().contains("hello"));

        supervisor.clear_log_history(&id).unwrap();
        supervisor.write(&id, b"again\n").unwrap();
        let history = wait_for_output(&supervisor, &id, "again").await;
        assert!(!history.contains("hello"));
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_kills_the_process_and_forgets_the_task() {
        let supervisor = supervisor();
        let id = create(&supervisor, "sleeper", "sleep 30");
        let pid = supervisor.start(&id).await.unwrap().status.pid().unwrap();

        supervisor.delete(&id).await.unwrap();
        assert!(!pid_alive(pid));
        assert!(matches!(supervisor.get(&id), Err(SupervisorError::NotFound { .. })));
        assert!(matches!(
            supervisor.delete(&id).await,
            Err(SupervisorError::NotFound { .. })
        ));
        assert!(supervisor.list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crash_with_auto_retry_restarts_with_new_pid() {
        let supervisor = supervisor();
        let view = supervisor
            .create(TaskDraft::new("flaky", "sleep 0.3; exit 3").with_auto_retry(true))
            .unwrap();
        let id = view.config.id;
        let mut events = supervisor.subscribe(EventFilter::Task(id.clone()));

        supervisor.start(&id).await.unwrap();
        let first = running_pid(&next_matching(&mut events, is_status(TaskState::Running)).await);
        let crashed = next_matching(&mut events, is_status(TaskState::Error)).await;
        if let SupervisorEvent::Status { view, .. } = crashed {
            assert!(view.status.detail().unwrap().contains("exited with code 3"));
            assert!(view.status.pid().is_none());
        }
        let second = running_pid(&next_matching(&mut events, is_status(TaskState::Running)).await);
        assert_ne!(first, second);

        supervisor.stop(&id).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crash_loop_gives_up_after_restart_limit() {
        let supervisor = supervisor();
        let id = supervisor
            .create(TaskDraft::new("broken", "exit 3").with_auto_retry(true))
            .unwrap()
            .config
            .id;

        supervisor.start(&id).await.unwrap();
        let view = wait_for(&supervisor, &id, |view| {
            view.status
                .detail()
                .is_some_and(|detail| detail.contains("restart limit reached"))
        })
        .await;
        assert_eq!(view.status.state(), TaskState::Error);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(supervisor.get(&id).unwrap().status.state(), TaskState::Error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_cancels_pending_auto_restart() {
        let mut settings = test_settings();
        settings.restart.min_interval = Duration::from_millis(500);
        settings.restart.max_backoff = Duration::from_millis(500);
        let supervisor = Supervisor::open(settings, Arc::new(MemoryTaskStore::default())).unwrap();
        let id = supervisor
            .create(TaskDraft::new("broken", "exit 1").with_auto_retry(true))
            .unwrap()
            .config
            .id;

        supervisor.start(&id).await.unwrap();
        wait_for(&supervisor, &id, |view| {
            view.status.detail().is_some_and(|detail| detail.contains("restarting"))
        })
        .await;
        let view = supervisor.stop(&id).await.unwrap();
        assert_eq!(view.status.state(), TaskState::Stopped);

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(supervisor.get(&id).unwrap().status.state(), TaskState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_exit_emits_output_then_stopped() {
        let supervisor = supervisor();
        let id = create(&supervisor, "oneshot", "printf hi");
        let mut events = supervisor.subscribe(EventFilter::Task(id.clone()));

        supervisor.start(&id).await.unwrap();
        let mut output = Vec::new();
        let stopped = loop {
            match next_matching(&mut events, |_: &SupervisorEvent| true).await {
                SupervisorEvent::Output { data, .. } => output.extend_from_slice(&data),
                SupervisorEvent::Status { view, .. } if view.status.state() == TaskState::Stopped => {
                    break view;
                }
                SupervisorEvent::Status { .. } => {}
            }
        };
        assert!(String::from_utf8_lossy(&output).contains("hi"));
        assert!(stopped.status.pid().is_none());
        assert_eq!(stopped.status.detail(), Some("exited with code 0"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(supervisor.get(&id).unwrap().status.state(), TaskState::Stopped);
        assert!(last_queued_status(&mut events).is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_exit_with_auto_retry_is_not_restarted() {
        let supervisor = supervisor();
        let id = supervisor
            .create(TaskDraft::new("oneshot", "printf hi").with_auto_retry(true))
            .unwrap()
            .config
            .id;

        supervisor.start(&id).await.unwrap();
        let view = wait_for_state(&supervisor, &id, TaskState::Stopped).await;
        assert!(view.status.pid().is_none());
        wait_for_output(&supervisor, &id, "hi").await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(supervisor.get(&id).unwrap().status.state(), TaskState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exit_kills_background_jobs_left_in_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("background.pid");
        let supervisor = supervisor();
        let command = format!("sleep 30 & echo $! > '{}'; exit 0", pid_file.display());
        let id = create(&supervisor, "spawner", &command);

        supervisor.start(&id).await.unwrap();
        wait_for_state(&supervisor, &id, TaskState::Stopped).await;
        let background: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        wait_for_exit(background).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_escalates_to_kill_after_grace() {
        let supervisor = supervisor();
        let id = create(&supervisor, "stubborn", "trap '' TERM; echo armed; sleep 30");
        let pid = supervisor.start(&id).await.unwrap().status.pid().unwrap();
        wait_for_output(&supervisor, &id, "armed").await;

        let grace = test_settings().stop_grace;
        let started = Instant::now();
        let view = supervisor.stop(&id).await.unwrap();
        let took = started.elapsed();

        assert!(took >= grace, "stop returned after {:?}, before the grace period", took);
        assert!(took < grace + Duration::from_secs(3), "stop took {:?}", took);
        assert_eq!(view.status.state(), TaskState::Stopped);
        assert!(!pid_alive(pid));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_exit_without_retry_is_an_error() {
        let supervisor = supervisor();
        let id = create(&supervisor, "fails", "exit 2");
        supervisor.start(&id).await.unwrap();
        let view = wait_for_state(&supervisor, &id, TaskState::Error).await;
        assert_eq!(view.status.detail(), Some("exited with code 2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resize_is_deferred_while_stopped_and_applied_while_running() {
        let supervisor = supervisor();
        let id = create(&supervisor, "size", "stty size; sleep 30");

        let resize = supervisor.resize(&id, TerminalSize::new(33, 99)).unwrap();
        assert_eq!(resize, Resize::Deferred);
        assert_eq!(supervisor.terminal_size(&id).unwrap(), TerminalSize::new(33, 99));

        supervisor.start(&id).await.unwrap();
        wait_for_output(&supervisor, &id, "33 99").await;

        let resize = supervisor.resize(&id, TerminalSize::new(40, 120)).unwrap();
        assert_eq!(resize, Resize::Applied);
        assert_eq!(supervisor.terminal_size(&id).unwrap(), TerminalSize::new(40, 120));

        assert!(matches!(
            supervisor.resize(&id, TerminalSize::new(0, 80)),
            Err(SupervisorError::Validation(_))
        ));
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_to_stopped_task_is_rejected() {
        let supervisor = supervisor();
        let id = create(&supervisor, "idle", "cat");
        assert!(matches!(
            supervisor.write(&id, b"x"),
            Err(SupervisorError::NotRunning { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_id_is_not_found() {
        let supervisor = supervisor();
        let id = TaskId::from("missing");
        assert!(matches!(supervisor.get(&id), Err(SupervisorError::NotFound { .. })));
        assert!(matches!(supervisor.start(&id).await, Err(SupervisorError::NotFound { .. })));
        assert!(matches!(supervisor.stop(&id).await, Err(SupervisorError::NotFound { .. })));
        assert!(matches!(supervisor.write(&id, b"x"), Err(SupervisorError::NotFound { .. })));
        assert!(matches!(supervisor.log_history(&id), Err(SupervisorError::NotFound { .. })));
        assert!(matches!(
            supervisor.update(&id, TaskDraft::new("x", "true")),
            Err(SupervisorError::NotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_drafts_are_rejected() {
        let supervisor = supervisor();
        assert!(matches!(
            supervisor.create(TaskDraft::new("", "true")),
            Err(SupervisorError::Validation(_))
        ));
        assert!(matches!(
            supervisor.create(TaskDraft::new("x", "  ")),
            Err(SupervisorError::Validation(_))
        ));
        assert!(supervisor.list().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_leaves_running_instance_alone() {
        let supervisor = supervisor();
        let id = create(&supervisor, "sleeper", "sleep 30");
        let pid = supervisor.start(&id).await.unwrap().status.pid();

        let updated = supervisor
            .update(&id, TaskDraft::new("renamed", "sleep 31").with_tag("ops"))
            .unwrap();
        assert_eq!(updated.config.command, "sleep 31");
        assert_eq!(updated.config.tag, "ops");
        assert_eq!(updated.config.id, id);
        assert_eq!(updated.status.pid(), pid);
        assert!(updated.status.is_running());
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn env_vars_reach_the_command() {
        let supervisor = supervisor();
        let id = supervisor
            .create(TaskDraft::new("env", "printf \"$GREETING\"").with_env("GREETING", "hello-env"))
            .unwrap()
            .config
            .id;
        supervisor.start(&id).await.unwrap();
        wait_for_output(&supervisor, &id, "hello-env").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attach_splits_history_from_live_output() {
        let supervisor = supervisor();
        let id = create(&supervisor, "echo", "cat");
        supervisor.start(&id).await.unwrap();
        supervisor.write(&id, b"one\n").unwrap();
        // Terminal echo first, then cat's own copy.
        wait_for_output(&supervisor, &id, "one\r\none").await;

        let mut attachment = supervisor.attach(&id).unwrap();
        assert!(String::from_utf8_lossy(&attachment.history).contains("one"));

        supervisor.write(&id, b"two\n").unwrap();
        let mut live = Vec::new();
        while !String::from_utf8_lossy(&live).contains("two") {
            let event = next_matching(&mut attachment.events, |event| event.is_output()).await;
            if let SupervisorEvent::Output { data, .. } = event {
                live.extend_from_slice(&data);
            }
        }
        assert!(!String::from_utf8_lossy(&live).contains("one"));
        supervisor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_is_sorted_by_name() {
        let supervisor = supervisor();
        create(&supervisor, "b", "true");
        create(&supervisor, "a", "true");
        create(&supervisor, "c", "true");
        let names: Vec<_> = supervisor
            .list()
            .into_iter()
            .map(|view| view.config.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tasks_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let id = {
            let store = JsonTaskStore::open(&path).unwrap();
            let supervisor = Supervisor::open(test_settings(), Arc::new(store)).unwrap();
            let id = supervisor
                .create(TaskDraft::new("web", "npm run dev").with_env("PORT", "3000"))
                .unwrap()
                .config
                .id;
            create(&supervisor, "worker", "sleep 1");
            id
        };

        let store = JsonTaskStore::open(&path).unwrap();
        let supervisor = Supervisor::open(test_settings(), Arc::new(store)).unwrap();
        let view = supervisor.get(&id).unwrap();
        assert_eq!(view.config.command, "npm run dev");
        assert_eq!(view.config.env_vars.get("PORT").map(String::as_str), Some("3000"));
        assert_eq!(view.status.state(), TaskState::Stopped);
        assert_eq!(supervisor.list().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn log_history_survives_reopen_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.scrollback.log_dir = Some(dir.path().to_path_buf());
        let settings = SupervisorSettings {
            log_dir: SupervisorSettings::from(&config).log_dir,
            ..test_settings()
        };
        let store = Arc::new(MemoryTaskStore::default());

        let id = {
            let supervisor = Supervisor::open(settings.clone(), store.clone()).unwrap();
            let id = create(&supervisor, "oneshot", "printf persisted");
            supervisor.start(&id).await.unwrap();
            wait_for_state(&supervisor, &id, TaskState::Stopped).await;
            id
        };

        let supervisor = Supervisor::open(settings.clone(), store.clone()).unwrap();
        assert!(supervisor.log_history(&id).unwrap().contains("persisted"));
        supervisor.clear_log_history(&id).unwrap();
        drop(supervisor);

        let supervisor = Supervisor::open(settings, store).unwrap();
        assert!(supervisor.log_history(&id).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_stops_all_tasks_and_rejects_starts() {
        let supervisor = supervisor();
        let a = create(&supervisor, "a", "sleep 30");
        let b = create(&supervisor, "b", "sleep 30");
        let pid_a = supervisor.start(&a).await.unwrap().status.pid().unwrap();
        let pid_b = supervisor.start(&b).await.unwrap().status.pid().unwrap();

        supervisor.shutdown().await;
        assert!(!pid_alive(pid_a));
        assert!(!pid_alive(pid_b));
        for id in [&a, &b] {
            assert_eq!(supervisor.get(id).unwrap().status.state(), TaskState::Stopped);
        }
        assert!(matches!(supervisor.start(&a).await, Err(SupervisorError::ShuttingDown)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_events_follow_transitions() {
        let supervisor = supervisor();
        let id = create(&supervisor, "sleeper", "sleep 30");
        let mut events = supervisor.subscribe(EventFilter::Task(id.clone()));

        supervisor.start(&id).await.unwrap();
        next_matching(&mut events, is_status(TaskState::Running)).await;
        supervisor.stop(&id).await.unwrap();
        let event = next_matching(&mut events, is_status(TaskState::Stopped)).await;
        assert_eq!(event.task_id(), &id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn updates_never_publish_a_stale_status() {
        let supervisor = supervisor();
        let id = create(&supervisor, "sleeper", "sleep 30");
        let mut events = supervisor.subscribe(EventFilter::Task(id.clone()));

        for round in 0..20 {
            let updater = {
                let supervisor = supervisor.clone();
                let id = id.clone();
                let draft = TaskDraft::new(format!("sleeper-{}", round), "sleep 30");
                tokio::task::spawn_blocking(move || supervisor.update(&id, draft))
            };
            supervisor.start(&id).await.unwrap();
            updater.await.unwrap().unwrap();
            let last = last_queued_status(&mut events).expect("status events");
            assert_eq!(last.status.state(), TaskState::Running, "round {}", round);

            supervisor.stop(&id).await.unwrap();
            let last = last_queued_status(&mut events).expect("status events");
            assert_eq!(last.status.state(), TaskState::Stopped, "round {}", round);
        }
    }
}
