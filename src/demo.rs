//! Demo publisher and RPC responder
//!
//! The fragment demo drives a browser page that swaps HTML fragments into
//! the DOM: `x-sc-target` names the element, `x-sc-swap-style` chooses
//! replace, append or prepend, `x-sc-script` carries JavaScript to run and
//! `x-sc-trigger` a JSON map of events to fire. The RPC responder answers
//! form posts on `/queue/rpc-demo` with the `upperText` field upper-cased.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use crate::broker::reply::CORRELATION_ID;
use crate::broker::{DeliveryMode, Envelope, Handler, Headers, REPLY_TO, ReplyCorrelator};
use crate::client::{ClientError, ConnectionHandle, ConnectionManager, Credentials, StompClient};
use crate::utils::Result;

pub const AUTO_TOPIC: &str = "/topic/auto";
pub const DEMO_TOPIC: &str = "/topic/demo";
pub const RPC_QUEUE: &str = "/queue/rpc-demo";

const TARGET: &str = "x-sc-target";
const SWAP_STYLE: &str = "x-sc-swap-style";
const SCRIPT: &str = "x-sc-script";
const TRIGGER: &str = "x-sc-trigger";

/// One message of the fragment demo.
#[derive(Debug, Clone)]
pub struct DemoStep {
    pub announce: &'static str,
    pub destination: &'static str,
    pub headers: Headers,
    pub body: String,
}

impl DemoStep {
    fn new(announce: &'static str, destination: &'static str, headers: Headers, body: &str) -> Self {
        Self {
            announce,
            destination,
            headers,
            body: body.to_string(),
        }
    }
}

pub fn fragment_steps() -> Vec<DemoStep> {
    let reset = json!({
        "customReset": [
            "<h1>This is the prologue...</h1>",
            "<h3>...and this is the epilogue (always disappointing).</h3>",
        ]
    });
    let notify = json!({
        "notifyUser": [
            "Fancy \"desktop\" notifications",
            "...even to specific users.",
        ]
    });

    vec![
        DemoStep::new(
            "check out auto subscriptions...",
            AUTO_TOPIC,
            Headers::new(),
            "<h2>Just auto-replaced some content</h2>",
        ),
        DemoStep::new(
            "about to replace some content...",
            DEMO_TOPIC,
            Headers::new().with(TARGET, "#replace-demo"),
            "<h2>Just replaced some content</h2>",
        ),
        DemoStep::new(
            "about to append some content...",
            DEMO_TOPIC,
            Headers::new()
                .with(TARGET, "#append-demo")
                .with(SWAP_STYLE, "append"),
            "<li>just appended some content</li>",
        ),
        DemoStep::new(
            "about to prepend some content...",
            DEMO_TOPIC,
            Headers::new()
                .with(TARGET, "#prepend-demo")
                .with(SWAP_STYLE, "prepend"),
            "<li>just prepended some content</li>",
        ),
        DemoStep::new(
            "about to send an alert script to be executed...",
            DEMO_TOPIC,
            Headers::new().with(SCRIPT, r#"alert("alert popup")"#),
            "",
        ),
        DemoStep::new(
            "about to send a customReset event with arguments...",
            DEMO_TOPIC,
            Headers::new()
                .with(TARGET, "body")
                .with(TRIGGER, reset.to_string()),
            "",
        ),
        DemoStep::new(
            "about to use the Notifications API to send a notification...",
            DEMO_TOPIC,
            Headers::new()
                .with(TARGET, "body")
                .with(TRIGGER, notify.to_string()),
            "",
        ),
    ]
}

/// Publishes every fragment step, waiting `pause` before each one.
pub async fn run_fragment_demo(client: &mut StompClient, pause: Duration) -> std::result::Result<(), ClientError> {
    for step in fragment_steps() {
        info!("{}", step.announce);
        tokio::time::sleep(pause).await;
        client
            .send(step.destination, &step.headers, step.body)
            .await?;
    }
    Ok(())
}

/// Upper-cases the `upperText` field of a form-urlencoded body.
pub fn upper_text_reply(body: &str) -> String {
    url::form_urlencoded::parse(body.as_bytes())
        .find(|(key, _)| key == "upperText")
        .map(|(_, value)| value.to_uppercase())
        .unwrap_or_default()
}

fn reply_headers() -> Headers {
    Headers::new().with(TARGET, "#rpc-replace")
}

/// Answers requests on `queue` over the wire until the connection closes.
pub async fn run_rpc_responder(client: &mut StompClient, queue: &str) -> std::result::Result<(), ClientError> {
    client.subscribe(queue).await?;
    info!(queue, "waiting for requests");

    loop {
        let request = match client.next_message().await {
            Ok(frame) => frame,
            Err(ClientError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let body = request.body_text();
        info!(body = %body, "request");

        let Some(reply_to) = request.get(REPLY_TO) else {
            warn!("request without reply-to, ignored");
            continue;
        };
        let mut headers = reply_headers();
        if let Some(correlation_id) = request.get(CORRELATION_ID) {
            headers.insert(CORRELATION_ID, correlation_id);
        }
        client
            .send(reply_to, &headers, upper_text_reply(&body))
            .await?;
    }
}

/// In-process RPC responder that replies through the router.
#[derive(Debug, Clone)]
pub struct UpperTextResponder {
    correlator: ReplyCorrelator,
}

impl UpperTextResponder {
    pub fn new(correlator: ReplyCorrelator) -> Self {
        Self { correlator }
    }
}

impl Handler for UpperTextResponder {
    fn handle(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, ()> {
        let correlator = self.correlator.clone();
        Box::pin(async move {
            let body = upper_text_reply(&envelope.body_text());
            if let Err(e) = correlator.reply(&envelope, body, reply_headers()).await {
                warn!(request = envelope.message_id(), error = %e, "rpc reply failed");
            }
        })
    }
}

/// Attaches an `UpperTextResponder` to `queue` on a connection of its own.
/// Must be called inside a tokio runtime.
pub fn start_rpc_demo(manager: &ConnectionManager, queue: &str) -> Result<ConnectionHandle> {
    let token = manager.authenticator().issue_token("rpc-demo")?;
    let connection = manager.connect(&Credentials::Token(token))?;
    let responder = UpperTextResponder::new(manager.correlator());
    manager.subscribe_handler(&connection, queue, DeliveryMode::Queue, Arc::new(responder))?;
    connection.spawn_dispatcher();
    info!(queue, connection = connection.id(), "rpc demo responder attached");
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use tokio::sync::mpsc;

    #[test]
    fn upper_text_is_decoded_and_upper_cased() {
        assert_eq!(upper_text_reply("upperText=abc"), "ABC");
        assert_eq!(
            upper_text_reply("other=1&upperText=hello+world%21"),
            "HELLO WORLD!"
        );
        assert_eq!(upper_text_reply("other=1"), "");
        assert_eq!(upper_text_reply(""), "");
    }

    #[test]
    fn fragment_steps_follow_the_demo_page() {
        let steps = fragment_steps();
        assert_eq!(steps.len(), 7);
        assert_eq!(steps[0].destination, AUTO_TOPIC);
        assert!(steps[1..].iter().all(|s| s.destination == DEMO_TOPIC));
        assert_eq!(steps[2].headers.get(SWAP_STYLE), Some("append"));
        assert_eq!(steps[3].headers.get(SWAP_STYLE), Some("prepend"));
        assert_eq!(steps[4].headers.get(SCRIPT), Some(r#"alert("alert popup")"#));

        let trigger: serde_json::Value =
            serde_json::from_str(steps[5].headers.get(TRIGGER).unwrap()).unwrap();
        assert_eq!(trigger["customReset"].as_array().unwrap().len(), 2);
        let trigger: serde_json::Value =
            serde_json::from_str(steps[6].headers.get(TRIGGER).unwrap()).unwrap();
        assert_eq!(
            trigger["notifyUser"][0],
            "Fancy \"desktop\" notifications"
        );
    }

    #[tokio::test]
    async fn in_process_responder_replies_to_reply_to() {
        let manager = ConnectionManager::from_settings(&Settings::default());
        start_rpc_demo(&manager, RPC_QUEUE).unwrap();

        let browser = manager
            .connect(&Credentials::password("guest", "guest"))
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = move |envelope: Arc<Envelope>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope);
            }
        };
        manager
            .subscribe_handler(&browser, "/queue/replies-1", DeliveryMode::Queue, Arc::new(handler))
            .unwrap();
        browser.spawn_dispatcher().unwrap();

        manager
            .publish(
                &browser,
                RPC_QUEUE,
                Headers::new().with(REPLY_TO, "/queue/replies-1"),
                "upperText=abc",
            )
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.body_text(), "ABC");
        assert_eq!(reply.header(TARGET), Some("#rpc-replace"));
    }
}
