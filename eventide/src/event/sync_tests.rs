//! Cross-component synchronization scenarios.

use crate::channel::Channel;
use crate::errors::EventideError;
use crate::event::{always, choose, never, sync, with_nack, wrap};
use crate::fiber::{spawn, yield_now};
use crate::time::timeout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_timeout_beats_idle_channel() {
    let chan: Channel<i32> = Channel::new();
    let start = Instant::now();
    let result = sync(choose(vec![
        wrap(chan.recv_evt(), |v| ("got", v)),
        wrap(timeout(Duration::from_millis(10)), |()| ("to", 0)),
    ]))
    .await;
    assert_eq!(result, Ok(("to", 0)));
    assert!(start.elapsed() >= Duration::from_millis(10));
}

#[tokio::test]
async fn test_channel_beats_long_timeout() {
    let chan = Channel::new();
    let tx = chan.clone();
    spawn(async move {
        let _ = tx.send(7).await;
    });
    let result = sync(choose(vec![
        wrap(chan.recv_evt(), |v| ("got", v)),
        wrap(timeout(Duration::from_secs(60)), |()| ("to", 0)),
    ]))
    .await;
    assert_eq!(result, Ok(("got", 7)));
}

#[tokio::test]
async fn test_nack_fires_on_loss() {
    let fired = Arc::new(AtomicBool::new(false));
    let chan: Channel<i32> = Channel::new();

    let fired_clone = fired.clone();
    let losing = with_nack(move |nack| {
        let fired = fired_clone;
        spawn(async move {
            let _ = sync(nack).await;
            fired.store(true, Ordering::SeqCst);
        });
        chan.recv_evt()
    });

    let result = sync(choose(vec![wrap(losing, |v| v), always(42)])).await;
    assert_eq!(result, Ok(42));

    for _ in 0..10 {
        yield_now().await;
    }
    assert!(fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_nack_fires_when_losing_branch_is_second() {
    let fired = Arc::new(AtomicBool::new(false));
    let chan: Channel<i32> = Channel::new();

    let fired_clone = fired.clone();
    let losing = with_nack(move |nack| {
        let fired = fired_clone;
        spawn(async move {
            let _ = sync(nack).await;
            fired.store(true, Ordering::SeqCst);
        });
        chan.recv_evt()
    });

    // The winner comes first in source order; the nack branch behind it
    // must still be told it lost.
    let result = sync(choose(vec![always(42), wrap(losing, |v| v)])).await;
    assert_eq!(result, Ok(42));

    for _ in 0..10 {
        yield_now().await;
    }
    assert!(fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_nested_nacks_fire_behind_winner() {
    // Both nacks of a losing subtree positioned after the winning
    // branch still fire.
    let outer_fired = Arc::new(AtomicBool::new(false));
    let inner_fired = Arc::new(AtomicBool::new(false));

    let outer_flag = outer_fired.clone();
    let inner_flag = inner_fired.clone();
    let losing = with_nack(move |outer_nack| {
        let outer_flag = outer_flag.clone();
        spawn(async move {
            let _ = sync(outer_nack).await;
            outer_flag.store(true, Ordering::SeqCst);
        });
        with_nack(move |inner_nack| {
            let inner_flag = inner_flag.clone();
            spawn(async move {
                let _ = sync(inner_nack).await;
                inner_flag.store(true, Ordering::SeqCst);
            });
            never::<i32>()
        })
    });

    let result = sync(choose(vec![always(5), losing])).await;
    assert_eq!(result, Ok(5));

    for _ in 0..10 {
        yield_now().await;
    }
    assert!(outer_fired.load(Ordering::SeqCst));
    assert!(inner_fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_winning_nack_is_never_fired() {
    let fired = Arc::new(AtomicBool::new(false));

    let fired_clone = fired.clone();
    let winning = with_nack(move |nack| {
        let fired = fired_clone;
        spawn(async move {
            let _ = sync(nack).await;
            fired.store(true, Ordering::SeqCst);
        });
        always(1)
    });

    let result = sync(choose(vec![winning, always(2)])).await;
    assert_eq!(result, Ok(1));

    for _ in 0..10 {
        yield_now().await;
    }
    assert!(!fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_nested_nacks_compose() {
    // Both the outer and the inner nack belong to the losing subtree,
    // so both fire when the sibling always wins.
    let outer_fired = Arc::new(AtomicBool::new(false));
    let inner_fired = Arc::new(AtomicBool::new(false));

    let outer_flag = outer_fired.clone();
    let inner_flag = inner_fired.clone();
    let losing = with_nack(move |outer_nack| {
        let outer_flag = outer_flag.clone();
        spawn(async move {
            let _ = sync(outer_nack).await;
            outer_flag.store(true, Ordering::SeqCst);
        });
        with_nack(move |inner_nack| {
            let inner_flag = inner_flag.clone();
            spawn(async move {
                let _ = sync(inner_nack).await;
                inner_flag.store(true, Ordering::SeqCst);
            });
            never::<i32>()
        })
    });

    let result = sync(choose(vec![losing, always(5)])).await;
    assert_eq!(result, Ok(5));

    for _ in 0..10 {
        yield_now().await;
    }
    assert!(outer_fired.load(Ordering::SeqCst));
    assert!(inner_fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_empty_choose_blocks_forever() {
    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        sync(choose::<i32>(Vec::new())),
    )
    .await;
    assert!(blocked.is_err());
}

#[tokio::test]
async fn test_closed_error_intercepted_by_handler() {
    let chan: Channel<i32> = Channel::new();
    chan.close();
    let handled = chan.recv_evt().wrap_handler(|err| match err {
        EventideError::Closed => -1,
        _ => -2,
    });
    assert_eq!(sync(handled).await, Ok(-1));
}

#[tokio::test]
async fn test_three_sends_arrive_fifo() {
    let chan = Channel::new();
    for v in [1, 2, 3] {
        let tx = chan.clone();
        spawn(async move {
            let _ = tx.send(v).await;
        });
        for _ in 0..10 {
            yield_now().await;
        }
    }
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(chan.recv().await);
    }
    assert_eq!(received, vec![Ok(1), Ok(2), Ok(3)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_choose_under_jittered_load() {
    use rand::Rng;

    for round in 0..20 {
        let chan = Channel::new();
        let tx = chan.clone();
        let delay = rand::thread_rng().gen_range(0..5);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = tx.send(round).await;
        });

        let result = sync(choose(vec![
            wrap(chan.recv_evt(), Some),
            wrap(timeout(Duration::from_secs(5)), |()| None),
        ]))
        .await;
        assert_eq!(result, Ok(Some(round)));
    }
}
