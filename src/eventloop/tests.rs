#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use std::io::{Read, Write};
use std::ops::ControlFlow;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicUsize;
use std::thread;

type Log = Vec<String>;

fn new_loop() -> EventLoop<Log> {
    EventLoop::new(&EventLoopConfig::default()).unwrap()
}

fn push(label: &'static str) -> impl FnOnce(&mut Log, &LoopHandle<Log>) -> Result<()> + Send + 'static {
    move |log, _| {
        log.push(label.to_string());
        Ok(())
    }
}

fn drain_events(rx: &mut broadcast::Receiver<LoopEvent>) -> Vec<LoopEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[test]
fn timers_fire_in_deadline_order() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();

    handle.add_timeout(Duration::from_millis(30), "late", push("late"));
    handle.add_timeout(Duration::from_millis(10), "first", push("first"));
    handle.add_timeout(Duration::from_millis(10), "second", push("second"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while log.len() < 3 && Instant::now() < deadline {
        event_loop.run_once(&mut log, Some(Duration::from_millis(50))).unwrap();
    }
    assert_eq!(log, ["first", "second", "late"]);
}

#[test]
fn canceled_timer_never_runs() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();
    let mut events = handle.subscribe();

    let call = handle.add_timeout(Duration::from_millis(50), "canceled", push("canceled"));
    handle.add_timeout(Duration::from_millis(20), "cancel it", move |_, _| {
        call.cancel();
        Ok(())
    });

    let deadline = Instant::now() + Duration::from_millis(150);
    while Instant::now() < deadline {
        event_loop.run_once(&mut log, Some(Duration::from_millis(10))).unwrap();
    }
    assert!(log.is_empty());

    // Only the canceling timer produced an event
    let finished = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, LoopEvent::EventFinished { .. }))
        .count();
    assert_eq!(finished, 1);
}

#[test]
fn urgent_calls_preempt_idle_and_timers() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();

    handle.add_timeout(Duration::ZERO, "timer", push("timer"));
    handle.add_idle("idle 1", |log: &mut Log, h: &LoopHandle<Log>| {
        log.push("idle 1".into());
        h.add_urgent_call("urgent from idle", push("urgent from idle"));
        Ok(())
    });
    handle.add_idle("idle 2", push("idle 2"));
    handle.add_urgent_call("urgent", push("urgent"));
    thread::sleep(Duration::from_millis(5));

    event_loop.run_once(&mut log, Some(Duration::ZERO)).unwrap();
    assert_eq!(log, ["urgent", "timer", "idle 1", "urgent from idle", "idle 2"]);
}

#[test]
fn failing_and_panicking_callbacks_do_not_stop_the_loop() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();
    let mut events = handle.subscribe();

    handle.add_idle("fails", |_: &mut Log, _: &LoopHandle<Log>| {
        Err(Error::Other("boom".into()))
    });
    handle.add_idle("panics", |_: &mut Log, _: &LoopHandle<Log>| -> Result<()> {
        panic!("kaboom")
    });
    handle.add_idle("fine", push("fine"));

    event_loop.run_once(&mut log, Some(Duration::ZERO)).unwrap();
    assert_eq!(log, ["fine"]);

    let outcomes: Vec<bool> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            LoopEvent::EventFinished { success } => Some(success),
            _ => None,
        })
        .collect();
    assert_eq!(outcomes, [false, false, true]);
}

#[test]
fn iteration_emits_begin_and_end() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut events = handle.subscribe();
    let mut log = Log::new();

    event_loop.run_once(&mut log, Some(Duration::ZERO)).unwrap();
    assert_eq!(
        drain_events(&mut events),
        [LoopEvent::BeginLoop, LoopEvent::EndLoop]
    );
}

#[test]
fn run_idle_next_loop_waits_one_iteration() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();

    handle.add_idle("schedule", |_: &mut Log, h: &LoopHandle<Log>| {
        h.run_idle_next_loop("deferred", push("deferred"));
        Ok(())
    });
    event_loop.run_once(&mut log, Some(Duration::ZERO)).unwrap();
    assert!(log.is_empty());

    event_loop.run_once(&mut log, Some(Duration::ZERO)).unwrap();
    assert_eq!(log, ["deferred"]);
}

#[test]
fn call_in_thread_posts_result_to_idle_queue() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();

    handle
        .call_in_thread(
            "lookup",
            || Ok(thread::current().name().unwrap_or_default().to_string()),
            |log: &mut Log, _: &LoopHandle<Log>, thread_name: String| {
                log.push(format!("ok from {thread_name}"));
                Ok(())
            },
            |log: &mut Log, _: &LoopHandle<Log>, e: Error| {
                log.push(format!("err {e}"));
                Ok(())
            },
        )
        .unwrap();
    handle
        .call_in_thread(
            "failing lookup",
            || -> Result<()> { Err(Error::Other("no such host".into())) },
            |log: &mut Log, _: &LoopHandle<Log>, _: ()| {
                log.push("unexpected".into());
                Ok(())
            },
            |log: &mut Log, _: &LoopHandle<Log>, e: Error| {
                log.push(format!("err {e}"));
                Ok(())
            },
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while log.len() < 2 && Instant::now() < deadline {
        event_loop.run_once(&mut log, Some(Duration::from_millis(50))).unwrap();
    }
    log.sort();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0], "err no such host");
    assert!(log[1].starts_with("ok from Thread Pool Worker"));
}

#[test]
fn call_in_thread_reports_panics_as_errors() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();

    handle
        .call_in_thread(
            "panicky",
            || -> Result<()> { panic!("resolver crashed") },
            |_: &mut Log, _: &LoopHandle<Log>, _: ()| Ok(()),
            |log: &mut Log, _: &LoopHandle<Log>, e: Error| {
                log.push(e.to_string());
                Ok(())
            },
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while log.is_empty() && Instant::now() < deadline {
        event_loop.run_once(&mut log, Some(Duration::from_millis(50))).unwrap();
    }
    assert_eq!(log, ["callback failed: resolver crashed"]);
}

#[test]
fn call_in_thread_after_shutdown_fails() {
    let mut event_loop = new_loop();
    event_loop.shutdown();
    let err = event_loop
        .handle()
        .call_in_thread(
            "late",
            || Ok(()),
            |_: &mut Log, _: &LoopHandle<Log>, _: ()| Ok(()),
            |_: &mut Log, _: &LoopHandle<Log>, _: Error| Ok(()),
        )
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}

#[test]
fn urgent_call_from_other_thread_wakes_blocked_loop() {
    let event_loop = new_loop();
    let handle = event_loop.handle();
    let loop_thread = event_loop.spawn(Log::new()).unwrap();

    // Let the loop block with no timers and no sockets
    thread::sleep(Duration::from_millis(50));
    let sent = Instant::now();
    handle.add_urgent_call("stop", |log: &mut Log, h: &LoopHandle<Log>| {
        log.push("stop".into());
        h.quit();
        Ok(())
    });

    let log = loop_thread.join().unwrap();
    assert_eq!(log, ["stop"]);
    assert!(sent.elapsed() < Duration::from_secs(2));
}

#[test]
fn spawn_emits_thread_signals() {
    let event_loop = new_loop();
    let handle = event_loop.handle();
    let mut events = handle.subscribe();
    let loop_thread = event_loop.spawn(Log::new()).unwrap();
    handle.quit();
    loop_thread.join().unwrap();

    let signals: Vec<LoopEvent> = drain_events(&mut events)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                LoopEvent::ThreadWillStart | LoopEvent::ThreadStarted | LoopEvent::ThreadDidStart
            )
        })
        .collect();
    assert_eq!(signals.first(), Some(&LoopEvent::ThreadWillStart));
    assert_eq!(signals.len(), 3);
}

#[test]
fn read_callback_runs_when_socket_is_readable() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();
    let (mut peer, socket) = UnixStream::pair().unwrap();
    let fd = socket.as_raw_fd();

    let mut reader = socket;
    handle.add_read_callback(fd, "reader", move |log: &mut Log, _: &LoopHandle<Log>| {
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf)?;
        log.push(String::from_utf8_lossy(&buf[..n]).into_owned());
        Ok(())
    });

    peer.write_all(b"hello").unwrap();
    event_loop.run_once(&mut log, Some(Duration::from_secs(1))).unwrap();
    assert_eq!(log, ["hello"]);

    peer.write_all(b"more").unwrap();
    handle.remove_read_callback(fd).unwrap();
    event_loop.run_once(&mut log, Some(Duration::from_millis(20))).unwrap();
    assert_eq!(log, ["hello"]);
    assert!(handle.remove_read_callback(fd).is_err());
}

#[test]
fn removing_unknown_callback_is_an_error() {
    let event_loop = new_loop();
    let handle = event_loop.handle();
    match handle.remove_write_callback(42) {
        Err(Error::CallbackNotRegistered { fd, direction }) => {
            assert_eq!(fd, 42);
            assert_eq!(direction, "write");
        }
        other => panic!("expected CallbackNotRegistered, got {other:?}"),
    }
    // stop_handling_socket tolerates unknown descriptors
    handle.stop_handling_socket(42);
}

#[test]
fn failing_socket_callback_is_deregistered() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();
    let (mut peer, socket) = UnixStream::pair().unwrap();
    let fd = socket.as_raw_fd();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    handle.add_read_callback(fd, "broken", move |_: &mut Log, _: &LoopHandle<Log>| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(Error::Other("protocol error".into()))
    });
    peer.write_all(b"x").unwrap();

    event_loop.run_once(&mut log, Some(Duration::from_secs(1))).unwrap();
    event_loop.run_once(&mut log, Some(Duration::from_millis(20))).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(handle.remove_read_callback(fd).is_err());
    drop(socket);
}

#[test]
fn idle_iterate_runs_one_step_per_iteration() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();
    let mut remaining = 3;

    idle_iterate(&handle, "countdown", move |log: &mut Log, _: &LoopHandle<Log>| {
        log.push(format!("step {remaining}"));
        remaining -= 1;
        Ok(if remaining == 0 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    });

    for expected in 1..=3 {
        event_loop.run_once(&mut log, Some(Duration::ZERO)).unwrap();
        assert_eq!(log.len(), expected);
    }
    event_loop.run_once(&mut log, Some(Duration::ZERO)).unwrap();
    assert_eq!(log, ["step 3", "step 2", "step 1"]);
}

#[test]
fn delayed_function_caller_coalesces_requests() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();
    let caller = DelayedFunctionCaller::new("save", |log: &mut Log, _: &LoopHandle<Log>| {
        log.push("save".into());
        Ok(())
    });

    caller.call_when_idle(&handle);
    caller.call_when_idle(&handle);
    caller.call_after_timeout(&handle, Duration::ZERO);
    assert!(caller.is_pending());
    event_loop.run_once(&mut log, Some(Duration::ZERO)).unwrap();
    assert_eq!(log, ["save"]);
    assert!(!caller.is_pending());

    caller.call_after_timeout(&handle, Duration::from_secs(60));
    caller.call_now(&mut log, &handle).unwrap();
    assert!(!caller.is_pending());
    assert_eq!(log, ["save", "save"]);

    caller.call_when_idle(&handle);
    caller.cancel_call();
    event_loop.run_once(&mut log, Some(Duration::ZERO)).unwrap();
    assert_eq!(log.len(), 2);
}

#[test]
fn process_idles_drains_without_waiting() {
    let mut event_loop = new_loop();
    let handle = event_loop.handle();
    let mut log = Log::new();
    handle.add_idle("a", push("a"));
    handle.add_urgent_call("u", push("u"));
    handle.add_timeout(Duration::from_secs(60), "far", push("far"));

    let started = Instant::now();
    event_loop.process_idles(&mut log);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(log, ["u", "a"]);
}
