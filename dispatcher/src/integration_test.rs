//! End-to-end dispatcher scenarios against the mock driver and the
//! scripted in-memory worker transport.

use std::{collections::HashMap, collections::HashSet, time::Duration};

use data_model::{
    test_objects::{test_function, test_invocation, test_worker_config},
    ChannelState, DispatcherState, WorkerConfig,
};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;

use crate::{
    dispatcher::PendingResult,
    error::DispatchError,
    events::WorkerEvent,
    testing::{build_test_host, wait_until, FakeResponse, FakeWorkerScript, TestHost},
};

fn single_worker_config() -> Vec<WorkerConfig> {
    vec![test_worker_config("test")]
}

/// Invoke repeatedly until the dispatcher accepts (functions register
/// shortly after `initialize` begins).
async fn invoke_when_accepted(host: &TestHost, function_name: &str, sequence: u64) -> PendingResult {
    let function = test_function(function_name, "test");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match host
            .dispatcher
            .invoke(test_invocation(&function, sequence))
            .await
        {
            Ok(pending) => return pending,
            Err(DispatchError::FunctionNotRegistered { .. })
            | Err(DispatchError::NotAcceptingInvocations { .. }) => {
                if tokio::time::Instant::now() >= deadline {
                    panic!("dispatcher never accepted the invocation");
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(other) => panic!("unexpected invoke error: {other}"),
        }
    }
}

#[tokio::test]
async fn test_invocation_buffers_until_channel_ready() {
    let script = FakeWorkerScript {
        handshake_delay: Duration::from_millis(400),
        ..Default::default()
    };
    let host = build_test_host(single_worker_config(), script);
    let function = test_function("hello", "test");

    let dispatcher = host.dispatcher.clone();
    let functions = vec![function.clone()];
    let init = tokio::spawn(async move { dispatcher.initialize(functions).await });

    // accepted while no channel is ready; returns a pending future, not an
    // error
    let pending = invoke_when_accepted(&host, "hello", 7).await;
    assert_eq!(host.dispatcher.state(), DispatcherState::Initializing);
    assert!(host.jobhost.get_ready_channels("test").is_empty());

    let result = pending.wait().await.unwrap();
    assert_eq!(result.outputs["payload"], json!(7));
    assert!(result.failure.is_none());

    init.await.unwrap().unwrap();
    assert_eq!(host.dispatcher.state(), DispatcherState::Initialized);

    // sent exactly once
    let worker = host.transports.latest_worker().unwrap();
    assert_eq!(worker.received_count(), 1);
}

#[tokio::test]
async fn test_buffered_invocations_flush_in_fifo_order() {
    let script = FakeWorkerScript {
        handshake_delay: Duration::from_millis(400),
        ..Default::default()
    };
    let host = build_test_host(single_worker_config(), script);
    let function = test_function("ordered", "test");

    let dispatcher = host.dispatcher.clone();
    let functions = vec![function.clone()];
    let init = tokio::spawn(async move { dispatcher.initialize(functions).await });

    let first = invoke_when_accepted(&host, "ordered", 1).await;
    let second = invoke_when_accepted(&host, "ordered", 2).await;
    let first_id = first.invocation_id().clone();
    let second_id = second.invocation_id().clone();

    first.wait().await.unwrap();
    second.wait().await.unwrap();
    init.await.unwrap().unwrap();

    let worker = host.transports.latest_worker().unwrap();
    assert_eq!(worker.received_invocations(), vec![first_id, second_id]);
}

#[tokio::test]
async fn test_invocations_distribute_round_robin_across_channels() {
    let mut config = test_worker_config("test");
    config.count_options.process_count = 2;
    let host = build_test_host(vec![config], FakeWorkerScript::default());
    let function = test_function("spread", "test");

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), "two ready channels", || {
        host.jobhost.get_ready_channels("test").len() == 2
    })
    .await;

    let mut pendings = Vec::new();
    for sequence in 0..10 {
        pendings.push(
            host.dispatcher
                .invoke(test_invocation(&function, sequence))
                .await
                .unwrap(),
        );
    }
    for pending in pendings {
        pending.wait().await.unwrap();
    }

    let workers = host.transports.workers();
    assert_eq!(workers.len(), 2);
    let counts: Vec<usize> = workers.iter().map(|w| w.received_count()).collect();
    assert_eq!(counts, vec![5, 5], "round robin should split evenly");

    // none dropped, none duplicated
    let mut all_ids = HashSet::new();
    for worker in &workers {
        for id in worker.received_invocations() {
            assert!(all_ids.insert(id), "invocation dispatched twice");
        }
    }
    assert_eq!(all_ids.len(), 10);
}

#[tokio::test]
async fn test_worker_crash_fails_in_flight_and_replacement_serves() {
    let script = FakeWorkerScript {
        response: FakeResponse::Manual,
        ..Default::default()
    };
    let host = build_test_host(single_worker_config(), script);
    let function = test_function("crashy", "test");

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();

    let pending = host
        .dispatcher
        .invoke(test_invocation(&function, 1))
        .await
        .unwrap();
    let worker = host.transports.latest_worker().unwrap();
    wait_until(Duration::from_secs(2), "invocation in flight", || {
        worker.received_count() == 1
    })
    .await;

    // replacement workers respond normally
    host.transports.set_script(FakeWorkerScript::default());
    worker.kill_transport();

    match pending.wait().await {
        Err(DispatchError::WorkerChannelError { .. }) => {}
        other => panic!("expected WorkerChannelError, got {other:?}"),
    }

    wait_until(Duration::from_secs(3), "replacement channel ready", || {
        host.driver.start_count() == 2 && host.jobhost.get_ready_channels("test").len() == 1
    })
    .await;

    let result = host
        .dispatcher
        .invoke(test_invocation(&function, 2))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.outputs["payload"], json!(2));
}

#[tokio::test]
async fn test_restart_budget_exhaustion_is_reported_once() {
    let mut config = test_worker_config("test");
    config.restart.error_threshold = Some(2);
    let host = build_test_host(vec![config], FakeWorkerScript::default());
    let function = test_function("doomed", "test");

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();
    let mut events = host.dispatcher.subscribe_events();

    for round in 0..3usize {
        // wait for the current generation's worker to attach and its
        // channel to become ready, then crash it
        wait_until(Duration::from_secs(3), "worker generation attached", || {
            host.transports.workers().len() == round + 1
        })
        .await;
        let worker = host.transports.latest_worker().unwrap();
        wait_until(Duration::from_secs(3), "worker channel ready", || {
            host.jobhost
                .get_ready_channels("test")
                .iter()
                .any(|c| c.worker_id() == &worker.worker_id)
        })
        .await;
        worker.kill_transport();
    }

    // the third error exceeds the budget of two restarts
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match host.dispatcher.invoke(test_invocation(&function, 9)).await {
            Err(DispatchError::WorkerPoolExhausted { .. }) => break,
            Ok(_) | Err(_) => {
                if tokio::time::Instant::now() >= deadline {
                    panic!("pool never reported exhaustion");
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    // one initial start plus exactly two restarts, then nothing more
    assert_eq!(host.driver.start_count(), 3);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(host.driver.start_count(), 3);

    let mut exhausted_events = 0;
    loop {
        match events.try_recv() {
            Ok(WorkerEvent::PoolExhausted { language }) => {
                assert_eq!(language, "test");
                exhausted_events += 1;
            }
            Ok(_) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => {}
        }
    }
    assert_eq!(exhausted_events, 1);
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_concurrent_safe() {
    let host = build_test_host(single_worker_config(), FakeWorkerScript::default());
    let function = test_function("bye", "test");

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();
    host.dispatcher
        .invoke(test_invocation(&function, 1))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    tokio::join!(host.dispatcher.shutdown(), host.dispatcher.shutdown());

    assert_eq!(host.dispatcher.state(), DispatcherState::Disposed);
    assert!(host.jobhost.all_channels().is_empty());

    match host.dispatcher.invoke(test_invocation(&function, 2)).await {
        Err(DispatchError::NotAcceptingInvocations { .. }) => {}
        other => panic!("expected NotAcceptingInvocations, got {other:?}"),
    }

    // a later repeat is also a no-op
    host.dispatcher.shutdown().await;
    assert_eq!(host.dispatcher.state(), DispatcherState::Disposed);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_fails_initialization() {
    let mut config = test_worker_config("test");
    config.restart.error_threshold = Some(0);
    let script = FakeWorkerScript {
        complete_handshake: false,
        ..Default::default()
    };
    let host = build_test_host(vec![config], script);
    let mut events = host.dispatcher.subscribe_events();
    let function = test_function("silent", "test");

    match host.dispatcher.initialize(vec![function]).await {
        Err(DispatchError::InitializationFailed { languages }) => {
            assert_eq!(languages, vec!["test".to_string()]);
        }
        other => panic!("expected InitializationFailed, got {other:?}"),
    }
    assert_eq!(host.dispatcher.state(), DispatcherState::Initializing);

    let mut saw_handshake_timeout = false;
    loop {
        match events.try_recv() {
            Ok(WorkerEvent::WorkerError(error_event)) => {
                if matches!(
                    error_event.error,
                    DispatchError::WorkerHandshakeTimeout { .. }
                ) {
                    saw_handshake_timeout = true;
                }
            }
            Ok(_) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => {}
        }
    }
    assert!(saw_handshake_timeout);
}

#[tokio::test]
async fn test_cancelled_invocation_discards_late_response() {
    let script = FakeWorkerScript {
        response: FakeResponse::Manual,
        ..Default::default()
    };
    let host = build_test_host(single_worker_config(), script);
    let function = test_function("slow", "test");

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();

    let pending = host
        .dispatcher
        .invoke(test_invocation(&function, 1))
        .await
        .unwrap();
    let token = pending.cancellation_token();
    let worker = host.transports.latest_worker().unwrap();
    wait_until(Duration::from_secs(2), "invocation in flight", || {
        worker.received_count() == 1
    })
    .await;

    let waiter = tokio::spawn(pending.wait());
    token.cancel();
    match waiter.await.unwrap() {
        Err(DispatchError::InvocationCancelled { .. }) => {}
        other => panic!("expected InvocationCancelled, got {other:?}"),
    }

    // a late response for the cancelled id is discarded, not a crash
    let late_id = worker.received_invocations()[0].clone();
    worker.respond(late_id);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let statuses = host.dispatcher.worker_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, ChannelState::Ready);
    assert_eq!(statuses[0].pending_invocations, 0);

    // the channel keeps serving
    let pending = host
        .dispatcher
        .invoke(test_invocation(&function, 2))
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), "second invocation in flight", || {
        worker.received_count() == 2
    })
    .await;
    worker.respond(worker.received_invocations()[1].clone());
    pending.wait().await.unwrap();
}

#[tokio::test]
async fn test_function_load_failure_is_replayed_to_invocations() {
    let script = FakeWorkerScript {
        load_failures: HashMap::from([(
            "fn-boom".to_string(),
            "module import failed".to_string(),
        )]),
        ..Default::default()
    };
    let host = build_test_host(single_worker_config(), script);
    let function = test_function("boom", "test");

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();
    // let the load failure ack reach the channel
    tokio::time::sleep(Duration::from_millis(100)).await;

    match host
        .dispatcher
        .invoke(test_invocation(&function, 1))
        .await
        .unwrap()
        .wait()
        .await
    {
        Err(DispatchError::FunctionLoadFailed {
            function_id,
            message,
            ..
        }) => {
            assert_eq!(function_id.get(), "fn-boom");
            assert_eq!(message, "module import failed");
        }
        other => panic!("expected FunctionLoadFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_intentional_restart_does_not_consume_budget() {
    let mut config = test_worker_config("test");
    config.restart.error_threshold = Some(0);
    let host = build_test_host(vec![config], FakeWorkerScript::default());
    let function = test_function("refresh", "test");

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();
    let mut events = host.dispatcher.subscribe_events();

    let worker_id = host.jobhost.get_channels("test")[0].worker_id().clone();
    assert!(host.driver.trigger_exit(&worker_id, Some(200)));

    wait_until(Duration::from_secs(3), "replacement channel ready", || {
        host.driver.start_count() == 2 && !host.jobhost.get_ready_channels("test").is_empty()
    })
    .await;

    // with a zero budget, any counted error would have exhausted the pool
    let result = host
        .dispatcher
        .invoke(test_invocation(&function, 1))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.outputs["payload"], json!(1));

    loop {
        match events.try_recv() {
            Ok(WorkerEvent::PoolExhausted { .. }) => panic!("pool must not be exhausted"),
            Ok(_) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => {}
        }
    }
}

#[tokio::test]
async fn test_ready_placeholder_channel_is_reused() {
    let host = build_test_host(single_worker_config(), FakeWorkerScript::default());
    let function = test_function("warm", "test");

    host.webhost.ensure_channels("test", 1).await.unwrap();
    assert_eq!(host.driver.start_count(), 1);

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();
    // the placeholder satisfied the desired count; no job-host channel
    assert_eq!(host.driver.start_count(), 1);
    assert!(host.jobhost.all_channels().is_empty());

    let result = host
        .dispatcher
        .invoke(test_invocation(&function, 5))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.outputs["payload"], json!(5));

    // dispatcher shutdown leaves the web-host channel alive for the next
    // host generation
    host.dispatcher.shutdown().await;
    let placeholders = host.webhost.all_channels();
    assert_eq!(placeholders.len(), 1);
    assert_eq!(placeholders[0].state(), ChannelState::Ready);
}

#[tokio::test]
async fn test_launch_failure_is_retried_within_budget() {
    let mut config = test_worker_config("test");
    config.restart.error_threshold = Some(1);
    let host = build_test_host(vec![config], FakeWorkerScript::default());
    let function = test_function("sturdy", "test");

    // the first process spawn fails; the restart policy replaces it
    host.driver.fail_next_starts(1);
    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();

    let result = host
        .dispatcher
        .invoke(test_invocation(&function, 3))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.outputs["payload"], json!(3));

    // the failed attempt never registered with the driver; exactly one
    // worker process is running
    assert_eq!(host.driver.start_count(), 1);
    assert_eq!(host.jobhost.get_ready_channels("test").len(), 1);
}

#[tokio::test]
async fn test_invoke_rejected_before_initialization() {
    let host = build_test_host(single_worker_config(), FakeWorkerScript::default());
    let function = test_function("early", "test");

    match host.dispatcher.invoke(test_invocation(&function, 1)).await {
        Err(DispatchError::NotAcceptingInvocations { state }) => {
            assert_eq!(state, "Default");
        }
        other => panic!("expected NotAcceptingInvocations, got {other:?}"),
    }
}

#[tokio::test]
async fn test_business_failure_passes_through_verbatim() {
    let script = FakeWorkerScript {
        response: FakeResponse::Fail("user code exploded".to_string()),
        ..Default::default()
    };
    let host = build_test_host(single_worker_config(), script);
    let function = test_function("faulty", "test");

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();

    let result = host
        .dispatcher
        .invoke(test_invocation(&function, 1))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(result.is_failure());
    assert_eq!(result.failure.unwrap().message, "user code exploded");

    // a failed function is not a failed channel
    assert_eq!(host.jobhost.get_ready_channels("test").len(), 1);
}

#[tokio::test]
async fn test_initialize_twice_is_rejected() {
    let host = build_test_host(single_worker_config(), FakeWorkerScript::default());
    let function = test_function("once", "test");

    host.dispatcher
        .initialize(vec![function.clone()])
        .await
        .unwrap();
    match host.dispatcher.initialize(vec![function]).await {
        Err(DispatchError::AlreadyInitialized { .. }) => {}
        other => panic!("expected AlreadyInitialized, got {other:?}"),
    }
}

#[tokio::test]
async fn test_initialize_with_unconfigured_language_fails_fast() {
    let host = build_test_host(single_worker_config(), FakeWorkerScript::default());
    let function = test_function("alien", "cobol");

    match host.dispatcher.initialize(vec![function]).await {
        Err(DispatchError::InitializationFailed { languages }) => {
            assert_eq!(languages, vec!["cobol".to_string()]);
        }
        other => panic!("expected InitializationFailed, got {other:?}"),
    }
    // nothing was started and the dispatcher never left Default
    assert_eq!(host.driver.start_count(), 0);
    assert_eq!(host.dispatcher.state(), DispatcherState::Default);
}
