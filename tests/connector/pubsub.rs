//! Pub/sub tests: topics, patterns, extra args and failure isolation.

use std::sync::Arc;
use std::time::Duration;

use busline::serde_json::{json, Value};
use busline::transport::InMemoryBus;
use busline::{
    CallbackResult, ConnectorError, DispatchMode, Extra, Message, Subscription, WeakCallback,
};

use crate::support::{connector, connector_with_errors, settle, wait_until, Recorder};

// ============================================================================
// Delivery
// ============================================================================

#[test]
fn publish_invokes_callback_once_with_decoded_value() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let seen: Recorder<Message> = Recorder::new();

    let rec = seen.clone();
    connector
        .register(
            [Subscription::topic("orders")],
            move |msg: &Message, _extra: &Extra| -> CallbackResult {
                rec.push(msg.clone());
                Ok(())
            },
            Extra::new(),
        )
        .unwrap();

    connector.publish("orders", b"42").unwrap();

    assert!(seen.wait_for(1));
    settle();
    let messages = seen.items();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "orders");
    assert_eq!(messages[0].pattern, None);
    assert_eq!(messages[0].value, json!(42));
    assert_eq!(messages[0].decode::<u32>().unwrap(), 42);
}

#[test]
fn pattern_callbacks_run_in_registration_order() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let calls: Recorder<(String, Option<String>)> = Recorder::new();

    for name in ["c1", "c2"] {
        let rec = calls.clone();
        connector
            .register(
                [Subscription::pattern("orders:*")],
                move |msg: &Message, _extra: &Extra| -> CallbackResult {
                    rec.push((name.to_string(), msg.pattern.clone()));
                    Ok(())
                },
                Extra::new(),
            )
            .unwrap();
    }

    connector.publish("orders:eu", br#""placed""#).unwrap();

    assert!(calls.wait_for(2));
    settle();
    let pattern = Some("orders:*".to_string());
    assert_eq!(
        calls.items(),
        vec![
            ("c1".to_string(), pattern.clone()),
            ("c2".to_string(), pattern),
        ]
    );
}

#[test]
fn duplicate_registration_fires_twice() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let seen: Recorder<Value> = Recorder::new();

    let rec = seen.clone();
    let callback = move |msg: &Message, _extra: &Extra| -> CallbackResult {
        rec.push(msg.value.clone());
        Ok(())
    };
    let first = connector
        .register([Subscription::topic("orders")], callback.clone(), Extra::new())
        .unwrap();
    let second = connector
        .register([Subscription::topic("orders")], callback, Extra::new())
        .unwrap();
    assert_ne!(first, second);

    connector.publish("orders", b"1").unwrap();

    assert!(seen.wait_for(2));
    settle();
    assert_eq!(seen.len(), 2);
}

#[test]
fn extra_args_are_passed_back() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let seen: Recorder<Value> = Recorder::new();

    let mut extra = Extra::new();
    extra.insert("device".to_string(), json!("samx"));

    let rec = seen.clone();
    connector
        .register(
            [Subscription::topic("readings")],
            move |_msg: &Message, extra: &Extra| -> CallbackResult {
                rec.push(extra["device"].clone());
                Ok(())
            },
            extra,
        )
        .unwrap();

    connector.send("readings", &json!({"value": 1.5})).unwrap();

    assert!(seen.wait_for(1));
    assert_eq!(seen.items(), vec![json!("samx")]);
}

#[test]
fn literal_and_pattern_subscriptions_both_fire() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let seen: Recorder<Option<String>> = Recorder::new();

    let rec = seen.clone();
    connector
        .register(
            [Subscription::topic("scan:1"), Subscription::pattern("scan:*")],
            move |msg: &Message, _extra: &Extra| -> CallbackResult {
                rec.push(msg.pattern.clone());
                Ok(())
            },
            Extra::new(),
        )
        .unwrap();

    connector.publish("scan:1", b"true").unwrap();

    assert!(seen.wait_for(2));
    settle();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen.count(&None), 1);
    assert_eq!(seen.count(&Some("scan:*".to_string())), 1);
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn empty_subscription_list_is_rejected() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let noop = |_msg: &Message, _extra: &Extra| -> CallbackResult { Ok(()) };

    let err = connector
        .register(Vec::<Subscription>::new(), noop, Extra::new())
        .unwrap_err();
    assert!(matches!(err, ConnectorError::InvalidArgument(_)));

    let err = connector
        .register([Subscription::topic("")], noop, Extra::new())
        .unwrap_err();
    assert!(matches!(err, ConnectorError::InvalidArgument(_)));

    let err = connector.publish("", b"1").unwrap_err();
    assert!(matches!(err, ConnectorError::InvalidArgument(_)));
}

// ============================================================================
// Unregistration
// ============================================================================

#[test]
fn unregister_stops_delivery() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let seen: Recorder<Value> = Recorder::new();

    let rec = seen.clone();
    let id = connector
        .register(
            [Subscription::topic("orders")],
            move |msg: &Message, _extra: &Extra| -> CallbackResult {
                rec.push(msg.value.clone());
                Ok(())
            },
            Extra::new(),
        )
        .unwrap();

    connector.publish("orders", b"1").unwrap();
    assert!(seen.wait_for(1));

    assert!(connector.is_registered(id));
    assert!(connector.unregister(id));
    assert!(!connector.is_registered(id));
    assert!(!connector.unregister(id));
    assert!(matches!(
        connector.try_unregister(id),
        Err(ConnectorError::NotFound(missing)) if missing == id
    ));

    connector.publish("orders", b"2").unwrap();
    settle();
    assert_eq!(seen.items(), vec![json!(1)]);
}

#[test]
fn concurrent_register_and_unregister_keep_the_topic_subscribed() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let seen: Recorder<Value> = Recorder::new();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..50 {
                    let id = connector
                        .register(
                            [Subscription::topic("orders")],
                            |_msg: &Message, _extra: &Extra| -> CallbackResult { Ok(()) },
                            Extra::new(),
                        )
                        .unwrap();
                    assert!(connector.unregister(id));
                }
            });
        }
    });

    let rec = seen.clone();
    connector
        .register(
            [Subscription::topic("orders")],
            move |msg: &Message, _extra: &Extra| -> CallbackResult {
                rec.push(msg.value.clone());
                Ok(())
            },
            Extra::new(),
        )
        .unwrap();

    connector.publish("orders", b"7").unwrap();
    assert!(seen.wait_for(1));
    assert_eq!(seen.items(), vec![json!(7)]);
}

#[test]
fn weak_callback_expires_with_owner() {
    struct Panel {
        seen: Recorder<Value>,
    }

    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let seen: Recorder<Value> = Recorder::new();
    let owner = Arc::new(Panel { seen: seen.clone() });

    let id = connector
        .register(
            [Subscription::topic("status")],
            WeakCallback::new(
                &owner,
                |panel: &Panel, msg: &Message, _extra: &Extra| -> CallbackResult {
                    panel.seen.push(msg.value.clone());
                    Ok(())
                },
            ),
            Extra::new(),
        )
        .unwrap();

    connector.publish("status", br#""idle""#).unwrap();
    assert!(seen.wait_for(1));

    drop(owner);
    connector.publish("status", br#""busy""#).unwrap();

    assert!(wait_until(Duration::from_secs(2), || !connector.is_registered(id)));
    assert_eq!(seen.items(), vec![json!("idle")]);
}

// ============================================================================
// Failure isolation
// ============================================================================

#[test]
fn failing_and_panicking_callbacks_do_not_stop_dispatch() {
    let bus = InMemoryBus::new();
    let (connector, errors) = connector_with_errors(&bus);
    let seen: Recorder<Value> = Recorder::new();

    connector
        .register(
            [Subscription::topic("jobs")],
            |_msg: &Message, _extra: &Extra| -> CallbackResult { Err("rejected".into()) },
            Extra::new(),
        )
        .unwrap();
    connector
        .register(
            [Subscription::topic("jobs")],
            |_msg: &Message, _extra: &Extra| -> CallbackResult { panic!("callback bug") },
            Extra::new(),
        )
        .unwrap();
    let rec = seen.clone();
    connector
        .register(
            [Subscription::topic("jobs")],
            move |msg: &Message, _extra: &Extra| -> CallbackResult {
                rec.push(msg.value.clone());
                Ok(())
            },
            Extra::new(),
        )
        .unwrap();

    connector.publish("jobs", b"1").unwrap();
    connector.publish("jobs", b"2").unwrap();

    assert!(seen.wait_for(2));
    assert_eq!(seen.items(), vec![json!(1), json!(2)]);
    assert!(wait_until(Duration::from_secs(2), || errors.len() >= 4));
    assert_eq!(errors.count(&"callback".to_string()), 2);
    assert_eq!(errors.count(&"panic".to_string()), 2);
}

#[test]
fn undecodable_payload_is_reported_and_dropped() {
    let bus = InMemoryBus::new();
    let (connector, errors) = connector_with_errors(&bus);
    let seen: Recorder<Value> = Recorder::new();

    let rec = seen.clone();
    connector
        .register(
            [Subscription::topic("jobs")],
            move |msg: &Message, _extra: &Extra| -> CallbackResult {
                rec.push(msg.value.clone());
                Ok(())
            },
            Extra::new(),
        )
        .unwrap();

    connector.publish("jobs", b"{not json").unwrap();
    connector.publish("jobs", b"7").unwrap();

    assert!(seen.wait_for(1));
    assert_eq!(seen.items(), vec![json!(7)]);
    assert_eq!(errors.items(), vec!["decode".to_string()]);
}

#[test]
fn listener_recovers_after_outage() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let seen: Recorder<Value> = Recorder::new();

    let rec = seen.clone();
    connector
        .register(
            [Subscription::topic("heartbeat")],
            move |msg: &Message, _extra: &Extra| -> CallbackResult {
                rec.push(msg.value.clone());
                Ok(())
            },
            Extra::new(),
        )
        .unwrap();

    bus.set_available(false);
    assert!(matches!(
        connector.publish("heartbeat", b"0"),
        Err(ConnectorError::TransportUnavailable(_))
    ));
    settle();
    bus.set_available(true);

    connector.publish("heartbeat", b"1").unwrap();
    assert!(seen.wait_for(1));
    assert_eq!(seen.items(), vec![json!(1)]);
}

// ============================================================================
// Manual dispatch
// ============================================================================

#[test]
fn manual_dispatch_is_driven_by_poll_messages() {
    let bus = InMemoryBus::new();
    let connector = connector(&bus);
    let seen: Recorder<Value> = Recorder::new();

    let rec = seen.clone();
    connector
        .register_with(
            [Subscription::topic("orders")],
            move |msg: &Message, _extra: &Extra| -> CallbackResult {
                rec.push(msg.value.clone());
                Ok(())
            },
            Extra::new(),
            DispatchMode::Manual,
        )
        .unwrap();

    // Only the subscribe acknowledgement is queued.
    assert!(matches!(
        connector.poll_messages(Some(Duration::from_millis(100))),
        Err(ConnectorError::Timeout(_))
    ));

    connector.publish("orders", b"5").unwrap();
    settle();
    assert_eq!(seen.len(), 0);

    assert!(connector.poll_messages(Some(Duration::from_secs(2))).unwrap());
    assert_eq!(seen.items(), vec![json!(5)]);

    connector.shutdown();
    assert!(!connector.poll_messages(Some(Duration::from_millis(50))).unwrap());
}
