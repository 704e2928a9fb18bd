use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use weft_rt::{Builder, Runtime, RuntimeClient, RuntimeError};

/// Every test here touches the process-wide runtime slot.
static SLOT: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SLOT.lock().unwrap_or_else(PoisonError::into_inner)
}

#[test]
fn spawn_without_a_runtime_fails() {
    let _guard = serial();

    let result = thread::spawn(|| weft_rt::spawn(async { 1 }).map(|_| ()))
        .join()
        .unwrap();

    assert!(matches!(result, Err(RuntimeError::NoRuntime)));
    assert!(RuntimeClient::current().is_none());
}

#[test]
fn installed_runtime_is_reachable_from_any_thread() {
    let _guard = serial();
    let rt = Runtime::new().unwrap();

    let value = thread::spawn(|| weft_rt::spawn(async { 5 }).unwrap().join())
        .join()
        .unwrap();
    assert_eq!(value, Ok(5));

    let current = RuntimeClient::current().unwrap();
    assert_eq!(current.agent_id(), rt.agent_id());
    drop(current);

    rt.shutdown().unwrap();
    assert!(RuntimeClient::current().is_none());
    assert!(matches!(
        weft_rt::spawn(async {}),
        Err(RuntimeError::NoRuntime)
    ));
}

#[test]
fn second_runtime_cannot_claim_the_slot() {
    let _guard = serial();
    let first = Runtime::new().unwrap();

    assert!(matches!(Runtime::new(), Err(RuntimeError::AlreadyInstalled)));

    let private = Builder::new().install_global(false).build().unwrap();
    assert_eq!(
        RuntimeClient::current().map(|client| client.agent_id()),
        Some(first.agent_id())
    );
    assert_ne!(private.agent_id(), first.agent_id());

    private.shutdown().unwrap();
    assert!(RuntimeClient::current().is_some());
    first.shutdown().unwrap();
}

#[test]
fn tasks_find_their_agent_without_the_global_slot() {
    let _guard = serial();
    let rt = Builder::new().install_global(false).build().unwrap();

    let handle = rt
        .spawn(async { weft_rt::spawn(async { "nested" }).unwrap().await })
        .unwrap();

    assert_eq!(handle.join(), Ok(Ok("nested")));
    assert!(matches!(
        weft_rt::spawn(async {}),
        Err(RuntimeError::NoRuntime)
    ));
    assert_eq!(rt.stats().commands_sent, 1);
}

#[test]
fn dropping_the_runtime_frees_the_slot() {
    let _guard = serial();
    {
        let _rt = Runtime::new().unwrap();
        assert!(RuntimeClient::current().is_some());
    }
    assert!(RuntimeClient::current().is_none());

    let again = Runtime::new().unwrap();
    again.shutdown().unwrap();
}
