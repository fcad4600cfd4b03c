//! Integration tests for the add-on host.
//!
//! These tests run the real `addon-echo` binary as an out-of-process
//! add-on and verify:
//! - Request/response round trips and typed command helpers
//! - Restart-and-retry-once on transport failure
//! - The per-minute restart budget
//! - Stderr tail capture
//! - Correlation id, timeout and remote error handling
//! - Stop, dispose and bulk start behaviour

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use addon_host::addon::protocol::{INVALID_PARAMS, METHOD_NOT_FOUND};
use addon_host::addon::{AddonHost, InstancePhase, StatusSnapshot};
use addon_host::{AddonError, DirectoryCatalog, ErrorKind, HostConfig};

use helpers::{AddonFixture, test_config};

async fn snapshot(host: &AddonHost, addon_id: &str) -> StatusSnapshot {
    host.snapshots()
        .await
        .expect("snapshots")
        .into_iter()
        .find(|s| s.addon_id == addon_id)
        .expect("add-on is registered")
}

// ============================================================================
// Round trips
// ============================================================================

mod round_trip_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_ping_round_trip() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.echo", "Echo", &[]);
        let host = AddonHost::new(test_config());

        host.try_start(&manifest).await.expect("start");
        let result = host
            .try_invoke("demo.echo", "ping", json!({}))
            .await
            .expect("ping");
        assert_eq!(result, json!({ "pong": true }));

        let status = snapshot(&host, "demo.echo").await;
        assert!(status.running);
        assert_eq!(status.phase, InstancePhase::Running);
        assert!(status.last_start.is_some());
        assert_eq!(status.last_error, None);
        assert_eq!(status.start_attempts_in_window, 1);

        host.dispose().await;
    }

    #[tokio::test]
    async fn test_params_echoed_back() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.echo", "Echo", &[]);
        let host = AddonHost::new(test_config());
        host.try_start(&manifest).await.expect("start");

        let params = json!({ "text": "hello", "nested": { "n": 3 } });
        let result = host
            .try_invoke("demo.echo", "echo", params.clone())
            .await
            .expect("echo");
        assert_eq!(result, params);

        host.dispose().await;
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_responses() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.echo", "Echo", &[]);
        let host = Arc::new(AddonHost::new(test_config()));
        host.try_start(&manifest).await.expect("start");

        let mut handles = Vec::new();
        for i in 0..8 {
            let host = Arc::clone(&host);
            handles.push(tokio::spawn(async move {
                host.try_invoke("demo.echo", "echo", json!({ "n": i })).await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.expect("join").expect("echo");
            assert_eq!(result, json!({ "n": i }));
        }

        assert_eq!(snapshot(&host, "demo.echo").await.start_attempts_in_window, 1);
        host.dispose().await;
    }

    #[tokio::test]
    async fn test_commands() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.echo", "Echo", &[]);
        let host = AddonHost::new(test_config());
        host.try_start(&manifest).await.expect("start");

        let commands = host.get_commands("demo.echo").await.expect("commands");
        let ids: Vec<&str> = commands.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["echo.hello", "echo.time"]);

        let result = host
            .run_command("demo.echo", "echo.hello")
            .await
            .expect("run");
        assert_eq!(result, json!({ "message": "Hello from addon-echo" }));

        let unknown = host.run_command("demo.echo", "echo.nope").await;
        assert!(
            matches!(unknown, Err(AddonError::Remote { code, .. }) if code == INVALID_PARAMS),
            "{:?}",
            unknown
        );

        host.dispose().await;
    }
}

// ============================================================================
// Failure handling
// ============================================================================

mod failure_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_remote_error_does_not_restart() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.echo", "Echo", &[]);
        let host = AddonHost::new(test_config());
        host.try_start(&manifest).await.expect("start");

        let result = host.try_invoke("demo.echo", "no.such.method", json!({})).await;
        let err = result.expect_err("unknown method");
        assert!(
            matches!(err, AddonError::Remote { code, .. } if code == METHOD_NOT_FOUND),
            "{:?}",
            err
        );
        assert!(!err.is_transport_failure());

        let status = snapshot(&host, "demo.echo").await;
        assert!(status.running);
        assert_eq!(status.start_attempts_in_window, 1);

        // The same process keeps serving.
        host.try_invoke("demo.echo", "ping", json!({}))
            .await
            .expect("ping after remote error");
        host.dispose().await;
    }

    #[tokio::test]
    async fn test_first_start_failure_is_retried_once() {
        let fixture = AddonFixture::new();
        let marker = fixture.marker("fail-once");
        let marker_arg = marker.to_string_lossy().to_string();
        let manifest = fixture.install("demo.flaky", "Flaky", &["--fail-once", &marker_arg]);
        let host = AddonHost::new(test_config());

        // The startup probe hits the dead first process, restarts, and succeeds.
        host.try_start(&manifest).await.expect("start after retry");
        assert!(marker.exists());

        let status = snapshot(&host, "demo.flaky").await;
        assert!(status.running);
        assert_eq!(status.start_attempts_in_window, 2);
        assert!(status.last_error.is_some(), "first failure is remembered");

        host.dispose().await;
    }

    #[tokio::test]
    async fn test_always_failing_addon_is_bounded() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.broken", "Broken", &["--always-fail"]);
        let host = AddonHost::new(test_config());

        let err = host.try_start(&manifest).await.expect_err("cannot start");
        assert!(err.is_transport_failure(), "{:?}", err);

        let status = snapshot(&host, "demo.broken").await;
        assert!(!status.running);
        assert_eq!(status.phase, InstancePhase::Crashed);
        assert_eq!(status.start_attempts_in_window, 2);
        assert!(status.last_error.is_some());

        // Later attempts run into the per-minute budget.
        let mut refused = false;
        for _ in 0..3 {
            if let Err(AddonError::RestartLimitExceeded { limit }) =
                host.try_invoke("demo.broken", "ping", json!({})).await
            {
                assert_eq!(limit, 3);
                refused = true;
                break;
            }
        }
        assert!(refused, "restart budget never refused a start");

        let status = snapshot(&host, "demo.broken").await;
        assert!(!status.running);
        assert!(
            status
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("Restart limit exceeded")),
            "{:?}",
            status.last_error
        );

        host.dispose().await;
    }

    #[tokio::test]
    async fn test_crash_during_call_restarts_on_next_call() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.echo", "Echo", &[]);
        let host = AddonHost::new(test_config());
        host.try_start(&manifest).await.expect("start");

        // "exit" kills the add-on without answering, both times.
        let err = host
            .try_invoke("demo.echo", "exit", json!({}))
            .await
            .expect_err("add-on exits");
        assert!(err.is_transport_failure(), "{:?}", err);
        assert!(!snapshot(&host, "demo.echo").await.running);

        let result = host
            .try_invoke("demo.echo", "ping", json!({}))
            .await
            .expect("ping after restart");
        assert_eq!(result, json!({ "pong": true }));
        assert_eq!(snapshot(&host, "demo.echo").await.start_attempts_in_window, 3);

        host.dispose().await;
    }

    #[tokio::test]
    async fn test_mismatched_response_id_is_a_protocol_error() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.liar", "Liar", &["--mismatch"]);
        let config = HostConfig {
            probe_on_start: false,
            ..test_config()
        };
        let host = AddonHost::new(config);
        host.try_start(&manifest).await.expect("start without probe");

        let err = host
            .try_invoke("demo.liar", "ping", json!({}))
            .await
            .expect_err("mismatched id");
        assert!(matches!(err, AddonError::IdMismatch { .. }), "{:?}", err);
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let status = snapshot(&host, "demo.liar").await;
        assert!(!status.running);
        assert_eq!(status.start_attempts_in_window, 2);

        host.dispose().await;
    }

    #[tokio::test]
    async fn test_slow_addon_times_out() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.slow", "Slow", &["--delay-ms", "2000"]);
        let config = HostConfig {
            invoke_timeout_ms: 200,
            probe_on_start: false,
            ..test_config()
        };
        let host = AddonHost::new(config);
        host.try_start(&manifest).await.expect("start without probe");

        let err = host
            .try_invoke("demo.slow", "ping", json!({}))
            .await
            .expect_err("too slow");
        assert!(
            matches!(&err, AddonError::Timeout { method, timeout_ms: 200 } if method == "ping"),
            "{:?}",
            err
        );
        assert_eq!(err.kind(), ErrorKind::Timeout);

        host.dispose().await;
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

mod diagnostics_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_stderr_tail_keeps_most_recent_lines() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.chatty", "Chatty", &["--stderr-lines", "5"]);
        let config = HostConfig {
            stderr_tail_capacity: 3,
            ..test_config()
        };
        let host = AddonHost::new(config);
        host.try_start(&manifest).await.expect("start");

        let expected = vec![
            "addon-echo stderr 3".to_string(),
            "addon-echo stderr 4".to_string(),
            "addon-echo stderr 5".to_string(),
        ];
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut tail = snapshot(&host, "demo.chatty").await.stderr_tail;
        while tail != expected && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tail = snapshot(&host, "demo.chatty").await.stderr_tail;
        }
        assert_eq!(tail, expected);

        host.dispose().await;
    }

    #[tokio::test]
    async fn test_stderr_written_during_calls_is_captured() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.echo", "Echo", &[]);
        let host = AddonHost::new(test_config());
        host.try_start(&manifest).await.expect("start");

        host.try_invoke("demo.echo", "log", json!({ "text": "warming up" }))
            .await
            .expect("log");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut tail = snapshot(&host, "demo.echo").await.stderr_tail;
        while !tail.contains(&"warming up".to_string()) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tail = snapshot(&host, "demo.echo").await.stderr_tail;
        }
        assert!(tail.contains(&"warming up".to_string()), "{:?}", tail);

        host.dispose().await;
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_stop_is_idempotent_and_keeps_entry() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.echo", "Echo", &[]);
        let host = AddonHost::new(test_config());
        host.try_start(&manifest).await.expect("start");

        assert!(host.try_stop("demo.echo").await.expect("stop"));
        assert!(host.try_stop("demo.echo").await.expect("stop again"));

        let status = snapshot(&host, "demo.echo").await;
        assert!(!status.running);
        assert_eq!(status.phase, InstancePhase::StoppedExplicitly);
        assert_eq!(host.len().await, 1);

        // Calling a stopped add-on starts it again.
        host.try_invoke("demo.echo", "ping", json!({}))
            .await
            .expect("ping restarts");
        assert!(snapshot(&host, "demo.echo").await.running);

        host.dispose().await;
    }

    #[tokio::test]
    async fn test_start_twice_reuses_process() {
        let fixture = AddonFixture::new();
        let manifest = fixture.install("demo.echo", "Echo", &[]);
        let host = AddonHost::new(test_config());

        let (a, b) = tokio::join!(host.try_start(&manifest), host.try_start(&manifest));
        a.expect("first start");
        b.expect("second start");
        host.try_start(&manifest).await.expect("third start");

        assert_eq!(host.len().await, 1);
        assert_eq!(snapshot(&host, "demo.echo").await.start_attempts_in_window, 1);

        host.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_stops_everything() {
        let fixture = AddonFixture::new();
        let one = fixture.install("demo.one", "One", &[]);
        let two = fixture.install("demo.two", "Two", &[]);
        let host = AddonHost::new(test_config());
        host.try_start(&one).await.expect("start one");
        host.try_start(&two).await.expect("start two");
        assert_eq!(host.len().await, 2);

        host.dispose().await;
        host.dispose().await;

        assert!(host.is_disposed());
        assert!(host.is_empty().await);
        assert!(matches!(
            host.try_invoke("demo.one", "ping", json!({})).await,
            Err(AddonError::HostDisposed)
        ));
        assert!(matches!(
            host.try_start(&one).await,
            Err(AddonError::HostDisposed)
        ));
    }

    #[tokio::test]
    async fn test_start_all_enabled_from_directory() {
        let fixture = AddonFixture::new();
        fixture.install("b.good", "Good", &[]);
        fixture.install("a.broken", "Broken", &["--always-fail"]);
        fixture.install("c.disabled", "Disabled", &[]);
        fixture.install_with_mode("d.inproc", "InProc", "InProcess", &[]);

        let mut config = test_config();
        config.disabled_addons.insert("c.disabled".into());
        let host = AddonHost::new(config);
        let catalog = DirectoryCatalog::new(fixture.root());

        let failures = host.start_all_enabled(&catalog).await;
        let failed: Vec<&str> = failures.keys().map(String::as_str).collect();
        assert_eq!(failed, vec!["a.broken"]);

        let ids: Vec<String> = host
            .snapshots()
            .await
            .expect("snapshots")
            .into_iter()
            .map(|s| s.addon_id)
            .collect();
        assert_eq!(ids, vec!["a.broken", "b.good"]);
        assert!(snapshot(&host, "b.good").await.running);

        host.dispose().await;
    }
}
