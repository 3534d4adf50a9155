//! Request dispatcher ordering and single-flight behavior

mod common;

use colloquy::dispatch::{DispatchEvent, DispatcherConfig, DropReason, RequestDispatcher};
use colloquy::messages::MessageSource;
use common::{Reply, ScriptedProcessor, WAIT};
use std::time::Duration;

fn completed(events: &[DispatchEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            DispatchEvent::Completed { response, .. } => Some(response.clone()),
            _ => None,
        })
        .collect()
}

/// Inputs are answered one at a time, in enqueue order
#[test]
fn test_many_inputs_answered_in_order() {
    let processor = ScriptedProcessor::new().reply(
        "input 0",
        Reply::Delayed(Duration::from_millis(100), "slow answer".into()),
    );
    let handle = RequestDispatcher::new(DispatcherConfig::default(), processor.clone())
        .start()
        .unwrap();

    for i in 0..20 {
        let origin = if i % 2 == 0 {
            MessageSource::TypedInput
        } else {
            MessageSource::VoiceSurfaceSpeech
        };
        handle.enqueue(&format!("input {}", i), origin).unwrap();
    }

    let mut events = Vec::new();
    while completed(&events).len() < 20 {
        events.push(handle.recv_event_timeout(WAIT).expect("dispatch event"));
    }

    let mut expected = vec!["slow answer".to_string()];
    expected.extend((1..20).map(|i| format!("echo: input {}", i)));
    assert_eq!(completed(&events), expected);
    assert_eq!(processor.max_active(), 1);
    assert_eq!(handle.pending(), 0);

    // Every start is followed by its completion before the next start
    let mut in_flight = None;
    for event in &events {
        match event {
            DispatchEvent::Started(entry) => {
                assert!(in_flight.is_none());
                in_flight = Some(entry.id.clone());
            }
            DispatchEvent::Completed { entry, .. } => {
                assert_eq!(in_flight.take(), Some(entry.id.clone()));
            }
            _ => {}
        }
    }
    handle.shutdown().unwrap();
}

#[test]
fn test_cancel_then_next_entry_runs() {
    let processor = ScriptedProcessor::new().reply("hang", Reply::Hang);
    let handle = RequestDispatcher::new(DispatcherConfig::default(), processor.clone())
        .start()
        .unwrap();

    handle.enqueue("hang", MessageSource::TypedInput).unwrap();
    handle.enqueue("after", MessageSource::TypedInput).unwrap();

    assert!(matches!(
        handle.recv_event_timeout(WAIT),
        Some(DispatchEvent::Started(_))
    ));
    handle.cancel_in_flight().unwrap();

    match handle.recv_event_timeout(WAIT) {
        Some(DispatchEvent::Dropped { entry, reason }) => {
            assert_eq!(entry.text, "hang");
            assert_eq!(reason, DropReason::Cancelled);
        }
        other => panic!("expected drop, got {:?}", other),
    }

    let mut events = Vec::new();
    while completed(&events).is_empty() {
        events.push(handle.recv_event_timeout(WAIT).expect("dispatch event"));
    }
    assert_eq!(completed(&events), vec!["echo: after".to_string()]);
    handle.shutdown().unwrap();
}

#[test]
fn test_timeout_answers_with_fallback() {
    let processor = ScriptedProcessor::new().reply("hang", Reply::Hang);
    let config = DispatcherConfig::default().with_response_timeout(Duration::from_millis(100));
    let handle = RequestDispatcher::new(config, processor).start().unwrap();

    handle.enqueue("hang", MessageSource::TypedInput).unwrap();
    loop {
        match handle.recv_event_timeout(WAIT).expect("dispatch event") {
            DispatchEvent::Completed {
                response, fallback, ..
            } => {
                assert!(fallback);
                assert!(!response.is_empty());
                break;
            }
            DispatchEvent::Started(_) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert!(!handle.is_busy());
    handle.shutdown().unwrap();
}
