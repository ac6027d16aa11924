//! The outbound client against the inbound listener, over real sockets.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use hermes_common::{
    Domain, Message, MessageId,
    error::StorageError,
    event::{EventKind, WebhookEvent},
    traits::{collaborator::MessageStore, protocol::Protocol},
};
use hermes_smtp::{Inbox, Smtp, SmtpArgs, client::SmtpClient};
use pretty_assertions::assert_eq;
use tokio::{net::TcpListener, sync::mpsc, time::timeout};

#[derive(Default)]
struct MemoryStore(Mutex<Vec<Message>>);

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store_message(&self, message: Message) -> Result<MessageId, StorageError> {
        let mut messages = self.0.lock().unwrap();
        messages.push(message);
        Ok(MessageId::new(format!("stored-{}", messages.len())))
    }
}

async fn start_server(
    store: Arc<MemoryStore>,
) -> (SocketAddr, mpsc::Receiver<WebhookEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events_tx, events_rx) = mpsc::channel(8);

    let mut args = SmtpArgs::builder()
        .with_banner("mx.hermes.test")
        .with_catch_all(vec![Domain::new("inbound.hermes.test")])
        .with_max_message_size(64 * 1024)
        .with_inbox(Inbox::new(store).with_events(events_tx));
    Smtp.validate(&mut args).unwrap();

    tokio::spawn(async move {
        let (shutdown, _) = tokio::sync::broadcast::channel(1);
        while let Ok((stream, peer)) = listener.accept().await {
            let session = Smtp.handle(stream, peer, &args);
            let signal = shutdown.subscribe();
            tokio::spawn(async move {
                let _ = timeout(Duration::from_secs(30), session.run(signal)).await;
            });
        }
    });

    (addr, events_rx)
}

#[tokio::test]
async fn client_delivers_to_listener() {
    let store = Arc::new(MemoryStore::default());
    let (addr, mut events) = start_server(Arc::clone(&store)).await;

    let mut client = SmtpClient::connect(addr, "localhost").await.unwrap();
    assert_eq!(client.read_greeting().await.unwrap().code, 220);
    assert_eq!(client.ehlo("client.hermes.test").await.unwrap().code, 250);
    assert!(client.supports("PIPELINING"));
    assert!(!client.supports("STARTTLS"));

    let content =
        b"From: a@sender.test\r\nSubject: Dots\r\n\r\n.leading dot\r\n..two\r\nlast line";
    assert_eq!(
        client
            .mail_from("a@sender.test", Some(content.len()))
            .await
            .unwrap()
            .code,
        250
    );
    assert_eq!(
        client
            .rcpt_to("anything@Inbound.Hermes.Test")
            .await
            .unwrap()
            .code,
        250
    );
    assert_eq!(client.data().await.unwrap().code, 354);
    assert_eq!(client.send_data(content).await.unwrap().code, 250);
    assert_eq!(client.quit().await.unwrap().code, 221);

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::Received);
    assert_eq!(event.email.id, MessageId::new("stored-1"));
    assert_eq!(event.email.subject, "Dots");

    let stored = store.0.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].body(), b".leading dot\r\n..two\r\nlast line\r\n");
    assert!(stored[0].headers().get("Received").is_some());
}

#[tokio::test]
async fn recipients_outside_catch_all_are_refused() {
    let store = Arc::new(MemoryStore::default());
    let (addr, _events) = start_server(Arc::clone(&store)).await;

    let mut client = SmtpClient::connect(addr, "localhost").await.unwrap();
    client.read_greeting().await.unwrap();
    client.ehlo("client.hermes.test").await.unwrap();
    client.mail_from("a@sender.test", None).await.unwrap();

    let refused = client.rcpt_to("someone@elsewhere.test").await.unwrap();
    assert_eq!(refused.code, 550);
    assert!(refused.is_permanent_error());

    let accepted = client.rcpt_to("someone@inbound.hermes.test").await.unwrap();
    assert_eq!(accepted.code, 250);

    client.quit().await.unwrap();
    assert!(store.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn several_messages_share_one_connection() {
    let store = Arc::new(MemoryStore::default());
    let (addr, mut events) = start_server(Arc::clone(&store)).await;

    let mut client = SmtpClient::connect(addr, "localhost").await.unwrap();
    client.read_greeting().await.unwrap();
    client.ehlo("client.hermes.test").await.unwrap();

    for n in 1..=2 {
        client.mail_from("a@sender.test", None).await.unwrap();
        client.rcpt_to("box@inbound.hermes.test").await.unwrap();
        client.data().await.unwrap();
        let body = format!("Subject: number {n}\r\n\r\nbody {n}\r\n");
        assert_eq!(client.send_data(body.as_bytes()).await.unwrap().code, 250);
    }
    client.quit().await.unwrap();

    for n in 1..=2 {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.email.subject, format!("number {n}"));
    }
    assert_eq!(store.0.lock().unwrap().len(), 2);
}
