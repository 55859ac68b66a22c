//! Reading archives from a local HTTP server that serves byte ranges.

mod common;

use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use common::{ZipBuilder, rows_document};
use xmlzip::{Error, HttpRangeReader, ReadAt, XmlZipParser};

struct Server {
    url: String,
    range_requests: Arc<AtomicUsize>,
}

/// Serve `body`, answering each range with at most `max_chunk` bytes.
async fn serve(body: Vec<u8>, max_chunk: usize, accept_ranges: bool) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = Arc::new(body);
    let range_requests = Arc::new(AtomicUsize::new(0));

    let counter = range_requests.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let body = body.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let _ = answer(socket, &body, max_chunk, accept_ranges, &counter).await;
            });
        }
    });

    Server {
        url: format!("http://{addr}/data.zip"),
        range_requests,
    }
}

async fn answer(
    mut socket: TcpStream,
    body: &[u8],
    max_chunk: usize,
    accept_ranges: bool,
    range_requests: &AtomicUsize,
) -> std::io::Result<()> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&buf[..n]);
    }
    let request = String::from_utf8_lossy(&request);

    let response = if request.starts_with("HEAD ") {
        let ranges = if accept_ranges { "Accept-Ranges: bytes\r\n" } else { "" };
        format!(
            "HTTP/1.1 200 OK\r\n{ranges}Content-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes()
    } else {
        range_requests.fetch_add(1, Ordering::Relaxed);
        let range = request
            .lines()
            .find_map(|line| {
                line.to_ascii_lowercase()
                    .strip_prefix("range: bytes=")
                    .map(str::to_string)
            })
            .unwrap();
        let (start, end) = range.split_once('-').unwrap();
        let start: usize = start.parse().unwrap();
        let end = end
            .trim()
            .parse::<usize>()
            .unwrap()
            .min(body.len() - 1)
            .min(start + max_chunk - 1);
        let part = &body[start..=end];

        let mut response = format!(
            "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {start}-{end}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len(),
            part.len()
        )
        .into_bytes();
        response.extend_from_slice(part);
        response
    };

    socket.write_all(&response).await?;
    socket.shutdown().await
}

fn client() -> Client {
    Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn parses_archive_over_range_requests() {
    let archive = ZipBuilder::new()
        .stored("a.xml", br#"<root><row id="1"/></root>"#)
        .deflated("dir/rows.xml", rows_document(40).as_bytes())
        .stored("skip.bin", b"not xml")
        .finish();
    let server = serve(archive.clone(), 4096, true).await;

    let reader = Arc::new(
        HttpRangeReader::with_client(client(), server.url.clone())
            .await
            .unwrap(),
    );
    assert_eq!(reader.size(), archive.len() as u64);

    let files = XmlZipParser::new()
        .parse_from_reader(reader.clone())
        .await
        .unwrap();

    assert_eq!(files.len(), 2);
    assert_eq!(files[0].name, "a.xml");
    assert_eq!(
        files[0].parsed_data.as_ref().unwrap().to_json(),
        json!({"ROOT": {"ROW": {"$id": "1"}}})
    );
    assert_eq!(files[1].name, "rows.xml");
    assert!(files[1].parsed_data.is_ok());
    assert!(reader.transferred_bytes() > 0);
    assert!(server.range_requests.load(Ordering::Relaxed) > 0);
}

#[tokio::test]
async fn short_responses_are_refetched() {
    let archive = ZipBuilder::new()
        .stored("a.xml", rows_document(5).as_bytes())
        .finish();
    let server = serve(archive.clone(), 7, true).await;
    let reader = HttpRangeReader::with_client(client(), server.url.clone())
        .await
        .unwrap();

    let mut buf = vec![0u8; 50];
    let n = reader.read_at(10, &mut buf).await.unwrap();

    assert_eq!(n, 50);
    assert_eq!(buf, archive[10..60]);
    assert_eq!(server.range_requests.load(Ordering::Relaxed), 8);
    assert_eq!(reader.transferred_bytes(), 50);
}

#[tokio::test]
async fn reads_stop_at_end_of_file() {
    let archive = ZipBuilder::new().stored("a.xml", b"<a/>").finish();
    let size = archive.len() as u64;
    let server = serve(archive.clone(), 4096, true).await;
    let reader = HttpRangeReader::with_client(client(), server.url.clone())
        .await
        .unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(reader.read_at(size - 3, &mut buf).await.unwrap(), 3);
    assert_eq!(buf[..3], archive[archive.len() - 3..]);
    assert_eq!(reader.read_at(size, &mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn server_without_range_support_is_rejected() {
    let archive = ZipBuilder::new().stored("a.xml", b"<a/>").finish();
    let server = serve(archive, 4096, false).await;

    let result = HttpRangeReader::with_client(client(), server.url.clone()).await;

    assert!(matches!(result, Err(Error::Io(_))));
    assert_eq!(server.range_requests.load(Ordering::Relaxed), 0);
}
