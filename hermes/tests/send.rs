//! The `send` and `check-config` paths against a real inbound listener.

use std::{io::Write, net::SocketAddr, sync::Arc, time::Duration};

use hermes::{Hermes, memory::MemoryStore};
use hermes_common::{
    Domain, Signal, compose::OutboundEmail, delivery::MessageStatus, listener::Listener,
};
use hermes_smtp::{Inbox, Smtp, SmtpArgs};
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;
use tokio::{net::TcpListener, sync::broadcast};

const DKIM_KEY: &str = include_str!("../../hermes-dkim/tests/fixtures/private-pkcs8.pem");

struct Inbound {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    shutdown: broadcast::Sender<Signal>,
}

async fn inbound(catch_all: &str) -> Inbound {
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let store = Arc::new(MemoryStore::default());
    let (shutdown, signal) = broadcast::channel(1);

    let mut listener = Listener::<Smtp>::new(
        addr,
        SmtpArgs::builder()
            .with_banner("inbound.hermes.test")
            .with_catch_all(vec![Domain::new(catch_all)])
            .with_inbox(Inbox::new(store.clone())),
    );
    listener.init().unwrap();

    tokio::spawn(async move { listener.accept_loop(socket, signal).await });

    Inbound {
        addr,
        store,
        shutdown,
    }
}

fn key_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(DKIM_KEY.as_bytes()).unwrap();
    file
}

fn config(handoff: SocketAddr, key: &NamedTempFile) -> Hermes {
    Hermes::from_ron(&format!(
        r#"(
            delivery: (
                helo_domain: "mail.hermes.test",
                local_handoff: Some("{handoff}"),
                timeouts: (connect_secs: 5),
            ),
            dkim: (
                private_key: Some("{}"),
                selector: "s1",
                domain: Some("hermes.test"),
            ),
        )"#,
        key.path().display()
    ))
    .unwrap()
}

#[tokio::test]
async fn send_signs_and_hands_off() {
    let inbound = inbound("inbound.hermes.test").await;
    let key = key_file();

    let email = OutboundEmail {
        from: Some(String::from("Hermes <sender@hermes.test>")),
        to: vec![String::from("box@inbound.hermes.test")],
        bcc: vec![String::from("audit@inbound.hermes.test")],
        subject: String::from("Receipt"),
        text: Some(String::from("Thanks for your order.")),
        ..OutboundEmail::default()
    };

    let report = tokio::time::timeout(
        Duration::from_secs(30),
        config(inbound.addr, &key).send(&email),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.status, MessageStatus::Sent);
    assert_eq!(report.domains.len(), 1);
    assert_eq!(report.domains[0].recipients.len(), 2);
    assert_eq!(report.attempts().count(), 1);

    let stored = inbound.store.messages();
    assert_eq!(stored.len(), 1);

    let message = &stored[0];
    assert_eq!(message.recipients().len(), 2);
    assert_eq!(message.subject(), Some("Receipt"));
    assert!(!message.headers().contains("Bcc"));

    let signature = message.headers().get("DKIM-Signature").unwrap();
    assert!(signature.contains("d=hermes.test"));
    assert!(signature.contains("s=s1"));

    let _ = inbound.shutdown.send(Signal::Shutdown);
}

#[tokio::test]
async fn refused_recipients_fail_the_report() {
    let inbound = inbound("elsewhere.hermes.test").await;
    let key = key_file();

    let email = OutboundEmail {
        to: vec![String::from("box@inbound.hermes.test")],
        subject: String::from("Nobody home"),
        text: Some(String::from("?")),
        ..OutboundEmail::default()
    };

    let report = config(inbound.addr, &key).send(&email).await.unwrap();

    assert_eq!(report.status, MessageStatus::Failed);
    assert!(inbound.store.is_empty());

    let _ = inbound.shutdown.send(Signal::Shutdown);
}

#[test]
fn check_accepts_a_complete_configuration() {
    let key = key_file();
    let config = Hermes::from_ron(&format!(
        r#"(
            smtp: (listeners: [(socket: "127.0.0.1:0", args: (catch_all: ["inbound.hermes.test"]))]),
            delivery: (relay: Some((host: "smtp.provider.test", user: Some("u"), password: Some("p")))),
            dkim: (private_key: Some("{}"), domain: Some("hermes.test")),
            webhooks: (subscribers: [(url: "https://hooks.hermes.test/mail", secret: Some("s"))]),
        )"#,
        key.path().display()
    ))
    .unwrap();

    config.check().unwrap();
}

#[test]
fn check_rejects_an_unreadable_key() {
    let config = Hermes::from_ron(
        r#"(dkim: (private_key: Some("/nonexistent/dkim.pem"), domain: Some("hermes.test")))"#,
    )
    .unwrap();

    assert!(config.check().is_err());
}

#[test]
fn check_rejects_a_listener_without_catch_all() {
    let config =
        Hermes::from_ron(r#"(smtp: (listeners: [(socket: "127.0.0.1:0", args: ())]))"#).unwrap();

    assert!(config.check().is_err());
}
