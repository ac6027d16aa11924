//! Minimal HTTP/1.1 endpoint that answers with scripted statuses.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Instant,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

#[derive(Debug, Clone)]
pub struct Request {
    pub path: String,
    /// Names lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub received_at: Instant,
}

pub struct MockHttpServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl MockHttpServer {
    /// Answer the n-th request with `statuses[n]`, repeating the last one.
    pub async fn start(statuses: Vec<u16>, body: impl Into<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let body = Arc::new(body.into());

        {
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let requests = Arc::clone(&requests);
                    let statuses = statuses.clone();
                    let body = Arc::clone(&body);
                    tokio::spawn(async move {
                        let _ = handle(stream, &requests, &statuses, &body).await;
                    });
                }
            });
        }

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}/hooks/mail", self.addr)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle(
    mut stream: TcpStream,
    requests: &Mutex<Vec<Request>>,
    statuses: &[u16],
    body: &str,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 || line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.trim_end().split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length = headers
        .get("content-length")
        .and_then(|l| l.parse().ok())
        .unwrap_or(0);
    let mut content = vec![0; length];
    reader.read_exact(&mut content).await?;

    let status = {
        let mut requests = requests.lock().unwrap();
        requests.push(Request {
            path,
            headers,
            body: content,
            received_at: Instant::now(),
        });
        statuses
            .get(requests.len() - 1)
            .or_else(|| statuses.last())
            .copied()
            .unwrap_or(200)
    };

    let response = format!(
        "HTTP/1.1 {status} Scripted\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await?;
    writer.shutdown().await
}
