use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::store::{Enhancer, Store, create_store};

#[derive(Debug, Clone, PartialEq)]
enum Act {
    Inc,
    IncAsync(u64),
    Ping,
    Pong,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct St {
    count: i64,
    pongs: u32,
}

fn reducer(s: &St, a: &Act) -> St {
    match a {
        Act::Inc => St {
            count: s.count + 1,
            ..s.clone()
        },
        Act::Pong => St {
            pongs: s.pongs + 1,
            ..s.clone()
        },
        Act::IncAsync(_) | Act::Ping => s.clone(),
    }
}

fn mounted() -> (Store<St, Act>, SagaMiddleware<St, Act>) {
    let saga = SagaMiddleware::new();
    let store = create_store(
        reducer,
        St::default(),
        Some(Enhancer::new().with(saga.clone())),
    )
    .unwrap();
    (store, saga)
}

/// Let spawned tasks and (paused) timers make progress.
async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn idle(_ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
    Ok(())
}

async fn wait_forever(ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
    ctx.take(|_| false).await?;
    Ok(())
}

async fn ping_pong(ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
    ctx.take(|a| *a == Act::Ping).await?;
    ctx.put(Act::Pong)
}

async fn inc_later(ctx: SagaContext<St, Act>, action: Act) -> Result<(), SagaError> {
    if let Act::IncAsync(ms) = action {
        ctx.delay(Duration::from_millis(ms)).await?;
        ctx.put(Act::Inc)?;
    }
    Ok(())
}

async fn fail_after(ctx: SagaContext<St, Act>, ms: u64) -> Result<(), SagaError> {
    ctx.delay(Duration::from_millis(ms)).await?;
    Err(SagaError::failed("boom"))
}

// ── Lifecycle contract ───────────────────────────────────────────────────────

#[tokio::test]
async fn run_before_attach_fails() {
    let saga: SagaMiddleware<St, Act> = create_saga_middleware();
    assert!(!saga.is_attached());
    assert_eq!(saga.run(idle).unwrap_err(), SagaError::NotAttached);
    assert!(!saga.is_running());
}

#[tokio::test]
async fn run_is_accepted_exactly_once() {
    let (_store, saga) = mounted();
    let task = saga.run(idle).unwrap();
    assert!(saga.is_running());
    assert_eq!(saga.run(idle).unwrap_err(), SagaError::AlreadyRunning);
    assert_eq!(task.join().await, Ok(SagaExit::Completed));
}

#[test]
fn run_outside_runtime_fails() {
    let (_store, saga) = mounted();
    assert_eq!(saga.run(idle).unwrap_err(), SagaError::NoRuntime);
    assert!(!saga.is_running());
}

#[test]
fn middleware_binds_to_one_live_store() {
    let (store, saga) = mounted();
    let second = create_store(
        reducer,
        St::default(),
        Some(Enhancer::new().with(saga.clone())),
    );
    assert!(matches!(second, Err(crate::store::StoreError::Attach(_))));

    drop(store);
    assert!(!saga.is_attached());
    let third = create_store(
        reducer,
        St::default(),
        Some(Enhancer::new().with(saga.clone())),
    );
    assert!(third.is_ok());
    assert!(saga.is_attached());
}

// ── Effects ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_take_sees_action_dispatched_right_after_run() {
    let (store, saga) = mounted();
    let task = saga.run(ping_pong).unwrap();
    store.dispatch(Act::Ping).unwrap();

    assert_eq!(task.join().await, Ok(SagaExit::Completed));
    assert_eq!(store.get_state().pongs, 1);
}

#[tokio::test]
async fn select_sees_state_after_reducer() {
    async fn observe(ctx: SagaContext<St, Act>, seen: Arc<Mutex<Vec<i64>>>) -> Result<(), SagaError> {
        for _ in 0..2 {
            ctx.take(|a| *a == Act::Inc).await?;
            let count = ctx.select(|s| s.count)?;
            seen.lock().unwrap().push(count);
        }
        Ok(())
    }

    let (store, saga) = mounted();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let slot = Arc::clone(&seen);
    let task = saga.run(move |ctx| observe(ctx, slot)).unwrap();

    store.dispatch(Act::Inc).unwrap();
    settle(5).await;
    store.dispatch(Act::Inc).unwrap();

    assert_eq!(task.join().await, Ok(SagaExit::Completed));
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn take_every_forks_a_worker_per_action() {
    async fn root(ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
        ctx.take_every(|a| matches!(a, Act::IncAsync(_)), inc_later);
        Ok(())
    }

    let (store, saga) = mounted();
    let task = saga.run(root).unwrap();
    for _ in 0..3 {
        store.dispatch(Act::IncAsync(100)).unwrap();
    }

    settle(50).await;
    assert_eq!(store.get_state().count, 0);
    settle(100).await;
    assert_eq!(store.get_state().count, 3);

    // The watcher never finishes on its own.
    assert!(!task.is_finished());
    assert_eq!(task.shutdown().await, Ok(SagaExit::Completed));
}

#[tokio::test(start_paused = true)]
async fn take_latest_cancels_previous_worker() {
    async fn root(ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
        ctx.take_latest(|a| matches!(a, Act::IncAsync(_)), inc_later);
        Ok(())
    }

    let (store, saga) = mounted();
    let task = saga.run(root).unwrap();
    for _ in 0..3 {
        store.dispatch(Act::IncAsync(100)).unwrap();
        settle(10).await;
    }

    settle(200).await;
    assert_eq!(store.get_state().count, 1);
    task.cancel();
    assert!(task.join().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn action_channel_buffers_between_takes() {
    async fn root(ctx: SagaContext<St, Act>, seen: Arc<Mutex<Vec<Act>>>) -> Result<(), SagaError> {
        let mut channel = ctx.action_channel();
        ctx.delay(Duration::from_millis(50)).await?;
        for _ in 0..2 {
            let action = channel.recv().await?;
            seen.lock().unwrap().push(action);
        }
        Ok(())
    }

    let (store, saga) = mounted();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let slot = Arc::clone(&seen);
    let task = saga.run(move |ctx| root(ctx, slot)).unwrap();

    settle(10).await;
    store.dispatch(Act::Ping).unwrap();
    store.dispatch(Act::Inc).unwrap();

    assert_eq!(task.join().await, Ok(SagaExit::Completed));
    assert_eq!(*seen.lock().unwrap(), vec![Act::Ping, Act::Inc]);
}

#[tokio::test]
async fn routines_see_nested_dispatches_in_reducer_order() {
    async fn root(ctx: SagaContext<St, Act>, seen: Arc<Mutex<Vec<Act>>>) -> Result<(), SagaError> {
        let mut channel = ctx.action_channel();
        for _ in 0..2 {
            let action = channel.recv().await?;
            seen.lock().unwrap().push(action);
        }
        Ok(())
    }

    let (store, saga) = mounted();
    let handle = store.clone();
    store.subscribe(move |s: &St| {
        if s.count == 1 && s.pongs == 0 {
            handle.dispatch(Act::Pong).unwrap();
        }
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let slot = Arc::clone(&seen);
    let task = saga.run(move |ctx| root(ctx, slot)).unwrap();
    store.dispatch(Act::Inc).unwrap();

    assert_eq!(task.join().await, Ok(SagaExit::Completed));
    assert_eq!(*seen.lock().unwrap(), vec![Act::Inc, Act::Pong]);
    assert_eq!(store.get_state().pongs, 1);
}

// ── Forks, spawns, cancellation ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn parent_waits_for_attached_forks() {
    async fn root(ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
        ctx.fork(|c| inc_later(c, Act::IncAsync(100)));
        Ok(())
    }

    let (store, saga) = mounted();
    let task = saga.run(root).unwrap();
    assert_eq!(task.join().await, Ok(SagaExit::Completed));
    assert_eq!(store.get_state().count, 1);
}

#[tokio::test(start_paused = true)]
async fn failing_fork_aborts_parent_and_siblings() {
    async fn root(ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
        let sibling = ctx.fork(wait_forever);
        ctx.fork(|c| fail_after(c, 10));
        sibling.join().await?;
        ctx.put(Act::Inc)
    }

    let (store, saga) = mounted();
    let task = saga.run(root).unwrap();
    assert_eq!(task.join().await, Err(SagaError::failed("boom")));
    assert_eq!(store.get_state().count, 0);
}

#[tokio::test(start_paused = true)]
async fn failing_spawn_is_isolated() {
    async fn root(ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
        let detached = ctx.spawn(|c| fail_after(c, 10));
        let outcome = detached.join().await;
        assert_eq!(outcome, Err(SagaError::failed("boom")));
        ctx.put(Act::Inc)
    }

    let (store, saga) = mounted();
    let task = saga.run(root).unwrap();
    assert_eq!(task.join().await, Ok(SagaExit::Completed));
    assert_eq!(store.get_state().count, 1);
}

#[tokio::test]
async fn cancelling_the_task_stops_the_root() {
    let (_store, saga) = mounted();
    let task = saga.run(wait_forever).unwrap();
    settle(1).await;
    assert!(!task.is_finished());
    assert_eq!(task.shutdown().await, Ok(SagaExit::Cancelled));
}

#[tokio::test]
async fn shutdown_token_cascades_to_spawned_routines() {
    async fn root(ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
        ctx.spawn(wait_forever);
        ctx.take(|_| false).await?;
        Ok(())
    }

    let (_store, saga) = mounted();
    let shutdown = CancellationToken::new();
    let task = saga.run_with_shutdown(root, shutdown.clone()).unwrap();
    settle(1).await;

    shutdown.cancel();
    assert!(task.is_cancelled());
    assert_eq!(task.join().await, Ok(SagaExit::Cancelled));
}

#[tokio::test]
async fn panicking_routine_is_reported() {
    async fn root(_ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
        panic!("routine exploded");
    }

    let (_store, saga) = mounted();
    let task = saga.run(root).unwrap();
    assert!(matches!(task.join().await, Err(SagaError::Panicked(_))));
}

#[tokio::test]
async fn put_after_store_dropped_fails() {
    async fn root(ctx: SagaContext<St, Act>) -> Result<(), SagaError> {
        ctx.take(|a| *a == Act::Ping).await?;
        // Gives the test a chance to drop the store.
        ctx.delay(Duration::from_millis(20)).await?;
        ctx.put(Act::Pong)
    }

    let (store, saga) = mounted();
    let task = saga.run(root).unwrap();
    store.dispatch(Act::Ping).unwrap();
    drop(store);

    assert_eq!(
        task.join().await,
        Err(SagaError::Store(crate::store::StoreError::Dropped))
    );
}
