//! Concurrent subscribe/unsubscribe tests.
//!
//! Many threads hammer the same channels while the connection layer keeps
//! delivering messages and validating. Checks that:
//! - A channel is subscribed on the server once, however many callers race
//! - Server-side subscribes and unsubscribes stay balanced under churn
//! - Nothing deadlocks when hooks run alongside caller operations

use kvsub::{
    Channel, Command, CommandFlags, DispatchMode, Handler, MemoryEndpoint, MemoryTopology,
    Subscriber, SubscriberConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const THREADS: usize = 8;
const ROUNDS: usize = 500;

fn test_subscriber(topology: &Arc<MemoryTopology>) -> Arc<Subscriber> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Arc::new(
        Subscriber::new(
            topology.clone(),
            SubscriberConfig {
                sync_timeout: Duration::from_secs(5),
                dispatch_mode: DispatchMode::Inline,
                ..Default::default()
            },
        )
        .unwrap(),
    )
}

#[test]
fn test_racing_subscribers_issue_one_subscribe() {
    let m1 = MemoryEndpoint::new("m1:6379");
    let m2 = MemoryEndpoint::new("m2:6379");
    let topology = Arc::new(MemoryTopology::new(vec![m1.clone(), m2.clone()]));
    let subscriber = test_subscriber(&topology);
    let barrier = Arc::new(Barrier::new(THREADS));
    let calls = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let subscriber = Arc::clone(&subscriber);
            let barrier = Arc::clone(&barrier);
            let calls = Arc::clone(&calls);
            thread::spawn(move || {
                barrier.wait();
                subscriber
                    .subscribe(
                        "news",
                        Handler::new(move |_, _| {
                            calls.fetch_add(1, Ordering::SeqCst);
                        }),
                        CommandFlags::NONE,
                    )
                    .unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(topology.total_sent(Command::Subscribe), 1);
    assert_eq!(subscriber.subscriptions()[0].handlers, THREADS);

    let channel = Channel::from("news");
    subscriber.on_message(&channel, &channel, b"x");
    assert_eq!(calls.load(Ordering::SeqCst), THREADS);
}

#[test]
fn test_churn_keeps_server_state_balanced() {
    let m1 = MemoryEndpoint::new("m1:6379");
    let topology = Arc::new(MemoryTopology::new(vec![m1.clone()]));
    let subscriber = test_subscriber(&topology);
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let subscriber = Arc::clone(&subscriber);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // Two threads per channel so adds and removes interleave
                let channel = format!("churn:{}", i % (THREADS / 2));
                barrier.wait();
                for _ in 0..ROUNDS {
                    let handler = Handler::new(|_, _| {});
                    subscriber
                        .subscribe(channel.as_str(), handler.clone(), CommandFlags::NONE)
                        .unwrap();
                    subscriber
                        .unsubscribe(channel.as_str(), Some(&handler), CommandFlags::NONE)
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(subscriber.subscription_count(), 0);
    for i in 0..THREADS / 2 {
        let channel = Channel::from(format!("churn:{}", i));
        assert_eq!(
            m1.sent_for(Command::Subscribe, &channel),
            m1.sent_for(Command::Unsubscribe, &channel),
            "unbalanced commands for {}",
            channel
        );
    }
}

#[test]
fn test_hooks_run_alongside_callers() {
    let m1 = MemoryEndpoint::new("m1:6379");
    let m2 = MemoryEndpoint::new("m2:6379");
    let topology = Arc::new(MemoryTopology::new(vec![m1.clone(), m2.clone()]));
    let subscriber = test_subscriber(&topology);
    let delivered = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&delivered);
    subscriber
        .subscribe(
            "stable",
            Handler::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            CommandFlags::NONE,
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_millis(300);
    let mut workers = Vec::new();

    // Callers churning their own channels
    for i in 0..4 {
        let subscriber = Arc::clone(&subscriber);
        workers.push(thread::spawn(move || {
            let channel = format!("busy:{}:*", i);
            while Instant::now() < deadline {
                let handler = Handler::new(|_, _| {});
                subscriber
                    .subscribe(channel.as_str(), handler.clone(), CommandFlags::FIRE_AND_FORGET)
                    .unwrap();
                subscriber
                    .unsubscribe(channel.as_str(), Some(&handler), CommandFlags::FIRE_AND_FORGET)
                    .unwrap();
            }
        }));
    }

    // Read loop
    {
        let subscriber = Arc::clone(&subscriber);
        workers.push(thread::spawn(move || {
            let channel = Channel::from("stable");
            while Instant::now() < deadline {
                subscriber.on_message(&channel, &channel, b"tick");
            }
        }));
    }

    // Reconnects and health checks, with the first master flapping
    {
        let subscriber = Arc::clone(&subscriber);
        let m1 = m1.clone();
        workers.push(thread::spawn(move || {
            let mut up = true;
            while Instant::now() < deadline {
                up = !up;
                m1.set_selectable(up);
                subscriber.validate_subscriptions();
                subscriber.on_endpoint_connected(&m1.handle());
                thread::sleep(Duration::from_millis(1));
            }
            m1.set_selectable(true);
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(delivered.load(Ordering::SeqCst) > 0);
    assert_eq!(subscriber.subscription_count(), 1);

    // Whatever happened, one validation pass leaves "stable" owned by a live server
    subscriber.validate_subscriptions();
    let owner = subscriber
        .subscribed_endpoint(&Channel::from("stable"))
        .unwrap();
    assert!(owner.is_connected());
}
