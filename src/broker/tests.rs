use std::sync::Arc;
use std::time::Duration;

use super::route::Route;
use super::*;
use crate::utils::BrokerError;
use tokio::sync::mpsc;

fn outbox(capacity: usize) -> (mpsc::Sender<Delivery>, mpsc::Receiver<Delivery>) {
    mpsc::channel(capacity)
}

fn drain(rx: &mut mpsc::Receiver<Delivery>) -> Vec<Delivery> {
    let mut out = Vec::new();
    while let Ok(delivery) = rx.try_recv() {
        out.push(delivery);
    }
    out
}

fn bodies(deliveries: &[Delivery]) -> Vec<String> {
    deliveries
        .iter()
        .map(|d| d.envelope.body_text().into_owned())
        .collect()
}

#[test]
fn test_route_new() {
    let route = Route::new();
    assert!(route.is_empty());
    assert!(route.rotation().is_empty());
}

#[test]
fn test_route_subscribe_is_idempotent() {
    let mut route = Route::new();
    route.subscribe(SubscriptionId(1));
    route.subscribe(SubscriptionId(1));
    assert_eq!(route.subscribers, vec![SubscriptionId(1)]);
}

#[test]
fn test_route_unsubscribe() {
    let mut route = Route::new();
    route.subscribe(SubscriptionId(1));
    assert!(route.unsubscribe(SubscriptionId(1)));
    assert!(!route.unsubscribe(SubscriptionId(1)));
    assert!(route.is_empty());
}

#[test]
fn test_route_rotation_advances() {
    let mut route = Route::new();
    for id in 1..=3 {
        route.subscribe(SubscriptionId(id));
    }
    let firsts: Vec<u64> = (0..4).map(|_| route.rotation()[0].0).collect();
    assert_eq!(firsts, vec![1, 2, 3, 1]);
    assert_eq!(route.rotation().len(), 3);
}

#[test]
fn test_headers_keep_order_and_unique_keys() {
    let mut headers = Headers::new()
        .with("x-sc-target", "#box")
        .with("x-sc-swap-style", "append");
    assert_eq!(headers.insert("x-sc-target", "#other"), Some("#box".to_string()));
    let keys: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["x-sc-target", "x-sc-swap-style"]);
    assert_eq!(headers.get("x-sc-target"), Some("#other"));
    assert_eq!(headers.remove("x-sc-swap-style"), Some("append".to_string()));
    assert_eq!(headers.len(), 1);

    let collected: Headers = [("a", "1"), ("a", "2")].into_iter().collect();
    assert_eq!(collected.get("a"), Some("2"));
}

#[test]
fn test_envelope_ids_are_unique() {
    let dest = Destination::topic("demo").unwrap();
    let a = Envelope::new(dest.clone(), Headers::new(), "x");
    let b = Envelope::new(dest, Headers::new(), "x");
    assert_ne!(a.message_id(), b.message_id());
    assert!(a.timestamp() > 0);
}

#[tokio::test]
async fn test_topic_fans_out_to_every_subscriber_only() {
    let router = Router::default();
    let topic = Destination::topic("demo").unwrap();
    let other = Destination::topic("other").unwrap();
    let (tx_a, mut rx_a) = outbox(8);
    let (tx_b, mut rx_b) = outbox(8);
    let (tx_c, mut rx_c) = outbox(8);
    router.subscribe("a", topic.clone(), tx_a.downgrade());
    router.subscribe("b", topic.clone(), tx_b.downgrade());
    router.subscribe("c", other, tx_c.downgrade());

    let receipt = router
        .publish_to("/topic/demo", Headers::new(), "<h2>hi</h2>")
        .await
        .unwrap();

    assert_eq!(receipt.delivered, 2);
    assert_eq!(receipt.destination, topic);
    assert_eq!(bodies(&drain(&mut rx_a)), vec!["<h2>hi</h2>"]);
    assert_eq!(bodies(&drain(&mut rx_b)), vec!["<h2>hi</h2>"]);
    assert!(drain(&mut rx_c).is_empty());
}

#[tokio::test]
async fn test_topic_does_not_buffer_for_late_subscribers() {
    let router = Router::default();
    router
        .publish_to("topic:demo", Headers::new(), "early")
        .await
        .unwrap();

    let (tx, mut rx) = outbox(8);
    router.subscribe("late", Destination::topic("demo").unwrap(), tx.downgrade());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_headers_pass_through_unmodified() {
    let router = Router::default();
    let (tx, mut rx) = outbox(8);
    router.subscribe("a", Destination::topic("demo").unwrap(), tx.downgrade());

    let headers = Headers::new()
        .with("x-target", "#box")
        .with("x-sc-trigger", r#"{"customReset":["a","b"]}"#);
    router
        .publish_to("/topic/demo", headers.clone(), "")
        .await
        .unwrap();

    let delivered = drain(&mut rx);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].envelope.headers(), &headers);
}

#[tokio::test]
async fn test_queue_round_robin_is_fair() {
    let router = Router::default();
    let queue = Destination::queue("rpc-demo").unwrap();
    let mut channels = Vec::new();
    for name in ["a", "b", "c"] {
        let (tx, rx) = outbox(16);
        router.subscribe(name, queue.clone(), tx.downgrade());
        channels.push((tx, rx));
    }

    for i in 0..6 {
        let receipt = router
            .publish_to("/queue/rpc-demo", Headers::new(), format!("m{i}"))
            .await
            .unwrap();
        assert_eq!(receipt.delivered, 1);
    }

    let received: Vec<Vec<String>> = channels
        .iter_mut()
        .map(|(_, rx)| bodies(&drain(rx)))
        .collect();
    assert_eq!(received[0], vec!["m0", "m3"]);
    assert_eq!(received[1], vec!["m1", "m4"]);
    assert_eq!(received[2], vec!["m2", "m5"]);
}

#[tokio::test]
async fn test_queue_without_subscribers_drops() {
    let router = Router::default();
    let receipt = router
        .publish_to("/queue/nobody", Headers::new(), "lost")
        .await
        .unwrap();
    assert_eq!(receipt.delivered, 0);

    let (tx, mut rx) = outbox(8);
    router.subscribe("a", Destination::queue("nobody").unwrap(), tx.downgrade());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_publish_to_unknown_namespace_fails() {
    let router = Router::default();
    let err = router
        .publish_to("/exchange/demo", Headers::new(), "x")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidDestination { .. }));
}

#[tokio::test]
async fn test_unsubscribe_twice_is_noop() {
    let router = Router::default();
    let (tx, mut rx) = outbox(8);
    let id = router.subscribe("a", Destination::topic("demo").unwrap(), tx.downgrade());

    assert!(router.unsubscribe(id));
    assert!(!router.unsubscribe(id));
    assert_eq!(router.subscription_count(), 0);

    let receipt = router
        .publish_to("/topic/demo", Headers::new(), "x")
        .await
        .unwrap();
    assert_eq!(receipt.delivered, 0);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_remove_connection_drops_all_its_subscriptions() {
    let router = Router::default();
    let topic = Destination::topic("demo").unwrap();
    let queue = Destination::queue("work").unwrap();
    let (tx_a, _rx_a) = outbox(8);
    let (tx_b, _rx_b) = outbox(8);
    let a1 = router.subscribe("a", topic.clone(), tx_a.downgrade());
    let a2 = router.subscribe("a", queue.clone(), tx_a.downgrade());
    router.subscribe("b", topic.clone(), tx_b.downgrade());

    let removed = router.remove_connection("a");

    assert_eq!(removed, vec![a1, a2]);
    assert_eq!(router.subscribers(&topic), vec!["b".to_string()]);
    assert!(router.subscribers(&queue).is_empty());
    assert_eq!(router.destination_of(a1), None);
    assert_eq!(router.subscription_count(), 1);
}

#[tokio::test]
async fn test_dropped_connection_is_skipped() {
    let router = Router::default();
    let queue = Destination::queue("work").unwrap();
    let (tx_a, rx_a) = outbox(8);
    let (tx_b, mut rx_b) = outbox(8);
    router.subscribe("a", queue.clone(), tx_a.downgrade());
    router.subscribe("b", queue.clone(), tx_b.downgrade());
    drop(tx_a);
    drop(rx_a);

    for _ in 0..2 {
        let receipt = router
            .publish_to("/queue/work", Headers::new(), "job")
            .await
            .unwrap();
        assert_eq!(receipt.delivered, 1);
    }
    assert_eq!(drain(&mut rx_b).len(), 2);
}

#[tokio::test]
async fn test_fifo_per_subscriber() {
    let router = Router::default();
    let (tx, mut rx) = outbox(64);
    router.subscribe("a", Destination::topic("demo").unwrap(), tx.downgrade());

    for i in 0..20 {
        router
            .publish_to("/topic/demo", Headers::new(), format!("{i}"))
            .await
            .unwrap();
    }

    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(bodies(&drain(&mut rx)), expected);
}

#[tokio::test]
async fn test_backpressure_fail_reaches_nobody() {
    let router = Router::new(BackpressurePolicy::Fail);
    let topic = Destination::topic("demo").unwrap();
    let (tx_a, mut rx_a) = outbox(2);
    let (tx_b, mut rx_b) = outbox(1);
    router.subscribe("a", topic.clone(), tx_a.downgrade());
    router.subscribe("b", topic.clone(), tx_b.downgrade());

    router
        .publish_to("/topic/demo", Headers::new(), "first")
        .await
        .unwrap();
    let err = router
        .publish_to("/topic/demo", Headers::new(), "second")
        .await
        .unwrap_err();

    assert_eq!(
        err,
        BrokerError::Backpressure {
            connection: "b".to_string()
        }
    );
    assert_eq!(bodies(&drain(&mut rx_a)), vec!["first"]);
    assert_eq!(bodies(&drain(&mut rx_b)), vec!["first"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_keep_per_publisher_order() {
    const PRODUCERS: usize = 4;
    const MESSAGES: usize = 50;

    let router = Arc::new(Router::new(BackpressurePolicy::Fail));
    let topic = Destination::topic("demo").unwrap();
    let (tx_a, mut rx_a) = outbox(PRODUCERS * MESSAGES);
    let (tx_b, mut rx_b) = outbox(PRODUCERS * MESSAGES);
    router.subscribe("a", topic.clone(), tx_a.downgrade());
    router.subscribe("b", topic, tx_b.downgrade());

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let router = router.clone();
            tokio::spawn(async move {
                for n in 0..MESSAGES {
                    router
                        .publish_to("/topic/demo", Headers::new(), format!("{producer}:{n}"))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    for rx in [&mut rx_a, &mut rx_b] {
        let received = bodies(&drain(rx));
        assert_eq!(received.len(), PRODUCERS * MESSAGES);
        let mut expected = [0usize; PRODUCERS];
        for body in received {
            let (producer, n) = body.split_once(':').unwrap();
            let producer: usize = producer.parse().unwrap();
            assert_eq!(n.parse::<usize>().unwrap(), expected[producer]);
            expected[producer] += 1;
        }
        assert_eq!(expected, [MESSAGES; PRODUCERS]);
    }
}

#[tokio::test]
async fn test_queue_skips_full_subscriber() {
    let router = Router::new(BackpressurePolicy::Fail);
    let queue = Destination::queue("work").unwrap();
    let (tx_a, mut rx_a) = outbox(1);
    let (tx_b, mut rx_b) = outbox(8);
    router.subscribe("a", queue.clone(), tx_a.downgrade());
    router.subscribe("b", queue.clone(), tx_b.downgrade());

    // a, b, then a again whose buffer is full
    for i in 0..3 {
        router
            .publish_to("/queue/work", Headers::new(), format!("m{i}"))
            .await
            .unwrap();
    }

    assert_eq!(bodies(&drain(&mut rx_a)), vec!["m0"]);
    assert_eq!(bodies(&drain(&mut rx_b)), vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_queue_backpressure_when_every_subscriber_is_full() {
    let router = Router::new(BackpressurePolicy::Fail);
    let (tx, _rx) = outbox(1);
    router.subscribe("a", Destination::queue("work").unwrap(), tx.downgrade());

    router
        .publish_to("/queue/work", Headers::new(), "m0")
        .await
        .unwrap();
    let err = router
        .publish_to("/queue/work", Headers::new(), "m1")
        .await
        .unwrap_err();
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn test_backpressure_block_waits_for_space() {
    let router = Router::new(BackpressurePolicy::Block(Duration::from_secs(2)));
    let (tx, mut rx) = outbox(1);
    router.subscribe("a", Destination::topic("demo").unwrap(), tx.downgrade());

    router
        .publish_to("/topic/demo", Headers::new(), "first")
        .await
        .unwrap();

    let reader = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first = rx.recv().await.map(|d| d.envelope.body_text().into_owned());
        let second = rx.recv().await.map(|d| d.envelope.body_text().into_owned());
        (first, second)
    });

    let receipt = router
        .publish_to("/topic/demo", Headers::new(), "second")
        .await
        .unwrap();
    assert_eq!(receipt.delivered, 1);

    let (first, second) = reader.await.unwrap();
    assert_eq!(first.as_deref(), Some("first"));
    assert_eq!(second.as_deref(), Some("second"));
}

#[tokio::test]
async fn test_backpressure_block_times_out() {
    let router = Router::new(BackpressurePolicy::Block(Duration::from_millis(20)));
    let (tx, _rx) = outbox(1);
    router.subscribe("a", Destination::queue("work").unwrap(), tx.downgrade());

    router
        .publish_to("/queue/work", Headers::new(), "m0")
        .await
        .unwrap();
    let err = router
        .publish_to("/queue/work", Headers::new(), "m1")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Backpressure { .. }));
}

#[tokio::test]
async fn test_reply_publishes_to_reply_to() {
    let router = Arc::new(Router::default());
    let correlator = ReplyCorrelator::new(router.clone());
    let (tx, mut rx) = outbox(8);
    router.subscribe("d", Destination::queue("X").unwrap(), tx.downgrade());

    let request_headers = Headers::new()
        .with(REPLY_TO, "/queue/X")
        .with("x-sc-target", "#rpc-replace")
        .with(reply::CORRELATION_ID, "42");
    let request = Envelope::new(
        Destination::queue("rpc-demo").unwrap(),
        request_headers.clone(),
        "upperText=abc",
    );

    let receipt = correlator
        .reply(&request, "ABC", Headers::new().with("x-sc-target", "#out"))
        .await
        .unwrap();
    assert_eq!(receipt.delivered, 1);

    let delivered = drain(&mut rx);
    assert_eq!(bodies(&delivered), vec!["ABC"]);
    let response = &delivered[0].envelope;
    assert_eq!(response.destination().to_string(), "/queue/X");
    assert_eq!(response.header("x-sc-target"), Some("#out"));
    assert_eq!(response.header(reply::CORRELATION_ID), Some("42"));
    assert_eq!(response.reply_to(), None);

    assert_eq!(request.headers(), &request_headers);
    assert_eq!(request.body_text(), "upperText=abc");
}

#[tokio::test]
async fn test_reply_without_reply_to_fails() {
    let correlator = ReplyCorrelator::new(Arc::new(Router::default()));
    let request = Envelope::new(Destination::queue("rpc-demo").unwrap(), Headers::new(), "");
    let err = correlator
        .reply(&request, "ABC", Headers::new())
        .await
        .unwrap_err();
    assert_eq!(err, BrokerError::NoReplyDestination);
}

#[test]
fn test_reply_to_malformed_destination_fails() {
    let request = Envelope::new(
        Destination::queue("rpc-demo").unwrap(),
        Headers::new().with(REPLY_TO, "/temp/nowhere"),
        "",
    );
    let err = ReplyCorrelator::reply_envelope(&request, "x", Headers::new()).unwrap_err();
    assert!(matches!(err, BrokerError::InvalidDestination { .. }));
}
