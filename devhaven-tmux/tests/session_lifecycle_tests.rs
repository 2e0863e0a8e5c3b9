//! Session lifecycle against an in-process tmux host: open, reuse, detach,
//! close and unexpected loss of the control channel.

mod common;

use common::{CAPTURE_LINES, FakeConnector, manager, settle, wait_until};
use devhaven_tmux::{EventReceiver, SessionEvent, SessionStatus, TmuxError};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

async fn next_event(events: &mut EventReceiver, mut wanted: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(event)) if wanted(&event) => return event,
            Ok(Ok(_)) => continue,
            other => panic!("expected event not received: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_open_session_mirrors_host() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    let session = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    assert_eq!(session.id(), "api");
    assert_eq!(session.status(), SessionStatus::Attached);

    let windows = manager.list_windows("api").unwrap();
    assert_eq!(windows.len(), 1);
    assert!(windows[0].active);
    let panes = manager.list_panes(windows[0].id).unwrap();
    assert_eq!(panes.len(), 1);
    assert!(panes[0].active);
    assert_eq!((panes[0].width, panes[0].height), (80, 24));

    // Output buffers start with the pane's captured history
    let primed = manager.buffers().snapshot(panes[0].id);
    assert_eq!(primed, CAPTURE_LINES.join("\r\n").into_bytes());

    let host = connector.session("api").unwrap();
    assert_eq!(host.options.get("@devhaven_workspace_id").map(String::as_str), Some("api"));
    assert_eq!(
        host.options.get("@devhaven_workspace_path").map(String::as_str),
        Some("/work/api")
    );
    assert_eq!(
        host.options.get("pane-active-border-style").map(String::as_str),
        Some("fg=#268bd2,bg=default")
    );
    assert_eq!(connector.count("refresh-client -f pause-after="), 1);
    assert_eq!(connector.count("refresh-client -B"), 2);
}

#[tokio::test]
async fn test_open_is_idempotent_while_attached() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    let first = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    let second = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(connector.connects(), 1);
    assert_eq!(manager.sessions().len(), 1);
}

#[tokio::test]
async fn test_detach_then_open_reuses_session() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);
    let cwd = Path::new("/work/web");

    let session = manager.open_session("web", cwd).await.unwrap();
    manager.detach_session("web").await.unwrap();
    assert_eq!(session.status(), SessionStatus::Detached);
    assert_eq!(connector.session_count(), 1, "detach keeps the tmux session");

    // Same directory under a different workspace name finds the same entry
    let reopened = manager.open_session("web-renamed", cwd).await.unwrap();
    assert!(Arc::ptr_eq(&session, &reopened));
    assert_eq!(reopened.status(), SessionStatus::Attached);
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.session_count(), 1);
    assert_eq!(manager.sessions().len(), 1);
    assert_eq!(manager.list_windows("web").unwrap().len(), 1);
}

#[tokio::test]
async fn test_detach_clears_state_and_rejects_commands() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    let session = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    let pane_id = session.snapshot().unwrap().panes[0].id;
    assert!(manager.buffers().contains(pane_id));

    session.detach().await.unwrap();
    assert!(!manager.buffers().contains(pane_id));
    assert!(matches!(session.list_windows(), Err(TmuxError::SessionNotAttached(_))));
    assert!(matches!(session.select_pane(pane_id).await, Err(TmuxError::SessionNotAttached(_))));
    assert!(session.refresh_runs().is_none());

    // The dispatcher must not mistake the detach for a lost channel
    settle().await;
    assert_eq!(session.status(), SessionStatus::Detached);
}

#[tokio::test]
async fn test_reattach_primes_buffers_again() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    let session = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    let pane_id = session.snapshot().unwrap().panes[0].id;
    session.detach().await.unwrap();
    session.attach().await.unwrap();

    assert_eq!(
        manager.buffers().snapshot(pane_id),
        CAPTURE_LINES.join("\r\n").into_bytes()
    );
    assert_eq!(connector.count("capture-pane"), 2);
}

#[tokio::test]
async fn test_close_kills_host_session() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    let session = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    let pane_id = session.snapshot().unwrap().panes[0].id;
    let mut events = session.events();

    manager.close_session("api").await.unwrap();
    next_event(&mut events, |e| matches!(e, SessionEvent::StatusChanged(SessionStatus::Closed))).await;

    assert_eq!(session.status(), SessionStatus::Closed);
    assert!(manager.sessions().is_empty());
    assert!(!manager.buffers().contains(pane_id));
    assert!(wait_until(|| connector.session_count() == 0).await);
    assert!(matches!(manager.session("api"), Err(TmuxError::UnknownSession(_))));

    // Closed is terminal
    assert!(matches!(session.attach().await, Err(TmuxError::SessionNotAttached(_))));
}

#[tokio::test]
async fn test_close_detached_session_uses_connector() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    manager.open_session("api", Path::new("/work/api")).await.unwrap();
    manager.detach_session("api").await.unwrap();
    manager.close_session("api").await.unwrap();

    assert_eq!(connector.session_count(), 0);
    assert!(manager.sessions().is_empty());
}

#[tokio::test]
async fn test_lost_channel_reports_disconnect() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    let session = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    let pane_id = session.snapshot().unwrap().panes[0].id;
    let mut events = session.events();

    connector.inject("api", "%exit server exited unexpectedly");
    connector.drop_connection("api");

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected { .. })).await;
    match event {
        SessionEvent::Disconnected { reason } => assert_eq!(reason, "server exited unexpectedly"),
        other => panic!("unexpected event {other:?}"),
    }
    next_event(&mut events, |e| matches!(e, SessionEvent::StatusChanged(SessionStatus::Closed))).await;
    assert!(!manager.buffers().contains(pane_id));

    // The closed entry is replaced on the next open
    let reopened = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    assert!(!Arc::ptr_eq(&session, &reopened));
    assert_eq!(reopened.status(), SessionStatus::Attached);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_close_after_lost_channel_still_kills_host_session() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    let session = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    let mut events = session.events();
    connector.drop_connection("api");
    next_event(&mut events, |e| matches!(e, SessionEvent::StatusChanged(SessionStatus::Closed))).await;
    assert_eq!(connector.session_count(), 1, "the host session outlives the channel");

    manager.close_session("api").await.unwrap();
    assert_eq!(connector.session_count(), 0);
    assert!(manager.sessions().is_empty());
}

#[tokio::test]
async fn test_close_only_touches_its_own_session() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    manager.open_session("web", Path::new("/work/web")).await.unwrap();
    let webapp = manager.open_session("webapp", Path::new("/work/webapp")).await.unwrap();
    manager.close_session("web").await.unwrap();

    assert!(wait_until(|| connector.session("web").is_none()).await);
    assert!(connector.session("webapp").is_some());
    assert_eq!(webapp.status(), SessionStatus::Attached);

    let commands = connector.commands();
    assert!(commands.contains(&"kill-session -t '=web'".to_string()));
    assert!(
        commands
            .iter()
            .filter(|c| c.starts_with("list-windows") || c.starts_with("set-option"))
            .all(|c| c.contains("-t '=")),
        "session targets are exact: {commands:?}"
    );
}

#[tokio::test]
async fn test_open_reports_missing_tmux_up_front() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);
    connector.tmux_missing.store(true, Ordering::SeqCst);

    let status = manager.tmux_status().await;
    assert!(!status.supported);
    assert!(status.reason.is_some());

    let err = manager.open_session("api", Path::new("/work/api")).await.unwrap_err();
    assert!(matches!(err, TmuxError::Unsupported(_)), "{err}");
    assert_eq!(connector.connects(), 0);

    // A failed check is not remembered
    connector.tmux_missing.store(false, Ordering::SeqCst);
    assert_eq!(manager.tmux_status().await.version.as_deref(), Some("tmux 3.4"));
    manager.open_session("api", Path::new("/work/api")).await.unwrap();
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_shutdown_detaches_everything() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    let api = manager.open_session("api", Path::new("/work/api")).await.unwrap();
    let web = manager.open_session("web", Path::new("/work/web")).await.unwrap();
    manager.shutdown().await;

    assert_eq!(api.status(), SessionStatus::Detached);
    assert_eq!(web.status(), SessionStatus::Detached);
    assert_eq!(connector.session_count(), 2);
}

#[tokio::test]
async fn test_discover_sessions_lists_host_sessions() {
    let connector = FakeConnector::new();
    let manager = manager(&connector);

    manager.open_session("api", Path::new("/work/api")).await.unwrap();
    manager.open_session("web", Path::new("/work/web")).await.unwrap();
    manager.detach_session("web").await.unwrap();

    let mut names: Vec<_> = manager
        .discover_sessions()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    names.sort();
    assert_eq!(names, ["api", "web"]);
}
