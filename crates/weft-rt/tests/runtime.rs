use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::stream::{FuturesUnordered, StreamExt};
use weft_rt::{sleep, yield_now, Builder, Runtime, RuntimeError, TaskError};

fn runtime() -> Runtime {
    Builder::new().install_global(false).build().unwrap()
}

#[test]
fn sleeping_task_completes_after_its_deadline() {
    let rt = runtime();
    let start = Instant::now();

    let handle = rt
        .spawn(async {
            sleep(Duration::from_millis(50)).await;
            "done"
        })
        .unwrap();

    assert_eq!(handle.join(), Ok("done"));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "woke late: {elapsed:?}");
    // The spawn itself is the only command; the timer never touches the queue.
    assert_eq!(rt.stats().commands_sent, 1);
}

#[test]
fn same_thread_spawn_bypasses_the_command_queue() {
    let rt = runtime();

    let handle = rt
        .spawn(async {
            let children: Vec<_> = (0..10)
                .map(|n| weft_rt::spawn(async move { n * 2 }).unwrap())
                .collect();
            let mut sum = 0;
            for child in children {
                sum += child.await.unwrap();
            }
            sum
        })
        .unwrap();

    assert_eq!(handle.join(), Ok(90));
    let stats = rt.stats();
    assert_eq!(stats.commands_sent, 1);
    assert_eq!(stats.spawned, 11);
    assert_eq!(stats.completed, 11);
}

#[test]
fn spawns_from_one_thread_start_in_submission_order() {
    let rt = runtime();
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..50)
        .map(|n| {
            let order = order.clone();
            rt.spawn(async move { order.lock().unwrap().push(n) }).unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[test]
fn timers_fire_in_deadline_order() {
    let rt = runtime();
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = [30u64, 10, 20]
        .into_iter()
        .map(|ms| {
            let order = order.clone();
            rt.spawn(async move {
                sleep(Duration::from_millis(ms)).await;
                order.lock().unwrap().push(ms);
            })
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
}

#[test]
fn shutdown_waits_for_in_flight_work() {
    let rt = runtime();
    let client = rt.client();

    let handle = rt
        .spawn(async {
            sleep(Duration::from_millis(80)).await;
            7
        })
        .unwrap();
    rt.shutdown().unwrap();

    assert!(handle.is_finished());
    assert_eq!(handle.join(), Ok(7));
    assert!(matches!(
        client.spawn(async {}),
        Err(RuntimeError::ShuttingDown)
    ));
}

#[test]
fn draining_agent_refuses_new_spawns() {
    let rt = runtime();

    let handle = rt
        .spawn(async {
            sleep(Duration::from_millis(50)).await;
            weft_rt::spawn(async {}).map(|_| ())
        })
        .unwrap();
    rt.client().shutdown().unwrap();

    let refused = handle.join().unwrap();
    assert!(matches!(refused, Err(RuntimeError::ShuttingDown)));
}

#[test]
fn drain_timeout_cancels_stuck_tasks() {
    let rt = Builder::new()
        .install_global(false)
        .drain_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let stuck = rt.spawn(std::future::pending::<()>()).unwrap();

    let start = Instant::now();
    rt.shutdown().unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(stuck.join(), Err(TaskError::Cancelled));
}

#[test]
fn panic_is_captured_as_fault() {
    let rt = runtime();

    let faulty = rt
        .spawn(async {
            if true {
                panic!("kaboom");
            }
            1u8
        })
        .unwrap();

    match faulty.join() {
        Err(TaskError::Fault(message)) => assert!(message.contains("kaboom")),
        other => panic!("expected a fault, got {other:?}"),
    }
    assert_eq!(rt.spawn(async { 3 }).unwrap().join(), Ok(3));
    assert_eq!(rt.stats().faulted, 1);
}

#[test]
fn abort_from_another_thread_cancels_a_sleeping_task() {
    let rt = runtime();
    let handle = rt
        .spawn(async {
            sleep(Duration::from_secs(60)).await;
        })
        .unwrap();

    handle.abort();

    assert_eq!(handle.join(), Err(TaskError::Cancelled));
    let start = Instant::now();
    rt.shutdown().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5), "timer outlived its task");
}

#[test]
fn abort_on_the_agent_thread_is_immediate() {
    let rt = runtime();

    let handle = rt
        .spawn(async {
            let victim = weft_rt::spawn(async {
                sleep(Duration::from_secs(60)).await;
                1
            })
            .unwrap();
            yield_now().await;
            victim.abort();
            victim.await
        })
        .unwrap();

    assert_eq!(handle.join(), Ok(Err(TaskError::Cancelled)));
    assert_eq!(rt.stats().cancelled, 1);
}

#[test]
fn abort_on_the_agent_thread_reaches_a_still_queued_spawn() {
    let rt = runtime();
    let client = rt.client();
    let ran = Arc::new(Mutex::new(false));
    let body_ran = ran.clone();

    let handle = rt
        .spawn(async move {
            let victim = client
                .spawn(async move {
                    sleep(Duration::from_millis(30)).await;
                    *body_ran.lock().unwrap() = true;
                    1
                })
                .unwrap();
            victim.abort();
            victim.await
        })
        .unwrap();

    assert_eq!(handle.join(), Ok(Err(TaskError::Cancelled)));
    rt.shutdown().unwrap();
    assert!(!*ran.lock().unwrap());
}

#[test]
fn wakes_from_other_threads_reach_the_agent() {
    let rt = runtime();
    let (tx, rx) = oneshot::channel();

    let handle = rt.spawn(async move { rx.await.unwrap() }).unwrap();
    thread::sleep(Duration::from_millis(20));
    tx.send(5).unwrap();

    assert_eq!(handle.join(), Ok(5));
}

#[test]
fn combinator_wakers_are_honoured() {
    let rt = runtime();

    let handle = rt
        .spawn(async {
            let mut sleeps: FuturesUnordered<_> = [30u64, 10, 20]
                .into_iter()
                .map(|ms| async move {
                    sleep(Duration::from_millis(ms)).await;
                    ms
                })
                .collect();
            let mut order = Vec::new();
            while let Some(ms) = sleeps.next().await {
                order.push(ms);
            }
            order
        })
        .unwrap();

    assert_eq!(handle.join(), Ok(vec![10, 20, 30]));
}

#[test]
fn yield_lets_other_tasks_run() {
    let rt = runtime();
    let log = Arc::new(Mutex::new(Vec::new()));

    let handle = {
        let log = log.clone();
        rt.spawn(async move {
            let other = {
                let log = log.clone();
                weft_rt::spawn(async move { log.lock().unwrap().push("other") }).unwrap()
            };
            log.lock().unwrap().push("before");
            yield_now().await;
            log.lock().unwrap().push("after");
            other.await.unwrap();
        })
        .unwrap()
    };

    handle.join().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["before", "other", "after"]);
}

#[test]
fn join_inside_a_task_faults_instead_of_deadlocking() {
    let rt = runtime();

    let handle = rt
        .spawn(async {
            let child = weft_rt::spawn(async { 1 }).unwrap();
            child.join()
        })
        .unwrap();

    match handle.join() {
        Err(TaskError::Fault(message)) => assert!(message.contains("await the handle")),
        other => panic!("expected a fault, got {other:?}"),
    }
}

#[test]
fn spawn_local_accepts_non_send_futures() {
    let rt = runtime();

    let handle = rt
        .spawn(async {
            let local = {
                let shared = Rc::new(41);
                weft_rt::spawn_local(async move { *shared + 1 }).unwrap()
            };
            local.await
        })
        .unwrap();

    assert_eq!(handle.join(), Ok(Ok(42)));
    assert!(matches!(
        weft_rt::spawn_local(async {}),
        Err(RuntimeError::NoRuntime)
    ));
}

#[test]
fn stats_track_task_lifecycle() {
    let rt = runtime();
    rt.spawn(async {}).unwrap().join().unwrap();
    let pending = rt.spawn(std::future::pending::<()>()).unwrap();
    pending.abort();
    pending.join().unwrap_err();

    let stats = rt.stats();
    assert_eq!(stats.spawned, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.live_tasks(), 0);
    assert_eq!(stats.commands_sent, 3);
    assert_eq!(stats.commands_received, 3);
}
